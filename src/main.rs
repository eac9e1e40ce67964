//! `address-mapper` turns a spreadsheet of addresses into geocoded map data.
//!
//! ```bash
//! # Which column holds the addresses?
//! address-mapper detect stores.xlsx
//!
//! # Geocode, filter, and export the full dataset as CSV
//! address-mapper resolve stores.csv --search main --export csv --output out.csv
//!
//! # Keep the API key in the OS keyring instead of the environment
//! address-mapper credential set
//! ```
//!
//! Results go to stdout as JSON; progress and logs go to stderr.

use std::io::{self, BufRead};
use std::path::PathBuf;

use address_mapper::commands::{self, ProgressMode, ResolveRequest};
use address_mapper::{
    init_tracing, AppConfig, ColumnOverrides, ExportFormat, FilterCriteria, MapSession,
    SecretVault, VAULT_SERVICE_NAME,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "address-mapper", version, about = "Geocode spreadsheet addresses into map data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which columns would be used for addresses and categories.
    Detect {
        /// `.csv` or `.xlsx` file.
        file: PathBuf,

        /// Use this column for addresses instead of detecting one.
        #[arg(long)]
        field: Option<String>,

        /// Number of address values to preview.
        #[arg(long, default_value_t = 5)]
        samples: usize,
    },

    /// Geocode every row and print the resulting map data.
    Resolve {
        file: PathBuf,

        #[arg(long)]
        field: Option<String>,

        #[arg(long)]
        category_field: Option<String>,

        /// Case-insensitive substring matched against the address and text columns.
        #[arg(long, default_value = "")]
        search: String,

        /// Only keep records that have a value in this column, or `all`.
        #[arg(long, default_value = "all")]
        category: String,

        #[arg(long, value_enum)]
        export: Option<ExportArg>,

        /// Export destination; defaults to `geocoded-addresses.<ext>`.
        #[arg(long, requires = "export")]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = ProgressArg::Human)]
        progress: ProgressArg,
    },

    /// Manage the geocoding API key stored in the OS keyring.
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Read the key from stdin and store it.
    Set,
    /// Remove the stored key.
    Clear,
    /// Report where a key is configured.
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportArg {
    Csv,
    Json,
}

impl From<ExportArg> for ExportFormat {
    fn from(value: ExportArg) -> Self {
        match value {
            ExportArg::Csv => ExportFormat::Csv,
            ExportArg::Json => ExportFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(value: ProgressArg) -> Self {
        match value {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            file,
            field,
            samples,
        } => {
            init_tracing();
            let overrides = ColumnOverrides {
                address: field,
                category: None,
            };
            let summary = commands::detect_file(&file, &overrides, samples)
                .with_context(|| format!("failed to inspect {}", file.display()))?;
            print_json(&summary)?;
        }
        Commands::Resolve {
            file,
            field,
            category_field,
            search,
            category,
            export,
            output,
            progress,
        } => {
            let session = MapSession::initialize();
            let request = ResolveRequest {
                path: file,
                overrides: ColumnOverrides {
                    address: field,
                    category: category_field,
                },
                criteria: FilterCriteria::new(search, &category),
                export: export.map(ExportFormat::from),
                output,
            };
            let summary = commands::resolve_file(
                &session,
                &request,
                ProgressMode::from(progress).observer(),
            )
            .await
            .with_context(|| format!("failed to process {}", request.path.display()))?;

            for warning in &summary.warnings {
                eprintln!("warning: {warning}");
            }
            if summary.skipped + summary.failed > 0 {
                eprintln!(
                    "{} of {} rows could not be mapped ({} skipped, {} failed)",
                    summary.skipped + summary.failed,
                    summary.total_rows,
                    summary.skipped,
                    summary.failed
                );
                eprint!("{}", summary.failures);
            }
            print_json(&summary)?;
        }
        Commands::Credential { action } => {
            init_tracing();
            let config = AppConfig::from_env();
            let vault = SecretVault::new(VAULT_SERVICE_NAME);
            match action {
                CredentialAction::Set => {
                    let key = read_key_from_stdin()?;
                    commands::store_credential(&vault, &key)
                        .context("failed to store API key in keyring")?;
                    eprintln!("stored geocoding API key in the OS keyring");
                }
                CredentialAction::Clear => {
                    commands::clear_credential(&vault)
                        .context("failed to remove API key from keyring")?;
                    eprintln!("removed geocoding API key from the OS keyring");
                }
                CredentialAction::Status => {
                    print_json(&commands::credential_status(&config, &vault)?)?;
                }
            }
        }
    }

    Ok(())
}

fn read_key_from_stdin() -> Result<SecretString> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read API key from stdin")?;
    let key = line.trim();
    if key.is_empty() {
        bail!("no API key given on stdin");
    }
    Ok(SecretString::new(key.into()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
