use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::config::{AppConfig, PublicAppConfig};
use crate::dataset::{map_view, FilterCriteria, MapView};
use crate::detect::{self, ColumnOverrides, ColumnSelection};
use crate::errors::AppResult;
use crate::export::{self, ExportFormat};
use crate::ingestion::{self, SourceFormat};
use crate::resolver::{BatchProgress, FailureSummary, ProgressObserver};
use crate::secrets::{SecretVault, GEOCODE_KEY_ALIAS};
use crate::MapSession;

#[derive(Debug, Serialize)]
pub struct DetectionSummary {
    pub path: String,
    pub format: SourceFormat,
    pub rows: usize,
    pub columns: Vec<String>,
    pub selection: ColumnSelection,
    pub samples: Vec<Option<String>>,
}

pub fn detect_file(
    path: &Path,
    overrides: &ColumnOverrides,
    sample_limit: usize,
) -> AppResult<DetectionSummary> {
    let format = SourceFormat::from_path(path)?;
    let rows = ingestion::load_rows(path)?;
    let selection = detect::select_columns(&rows, overrides)?;
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.keys().map(str::to_string).collect())
        .unwrap_or_default();
    let samples = detect::sample_values(&rows, &selection.address, sample_limit);
    Ok(DetectionSummary {
        path: path.display().to_string(),
        format,
        rows: rows.len(),
        columns,
        selection,
        samples,
    })
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub path: PathBuf,
    pub overrides: ColumnOverrides,
    pub criteria: FilterCriteria,
    pub export: Option<ExportFormat>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct ResolveSummary {
    pub path: String,
    pub columns: ColumnSelection,
    pub total_rows: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: FailureSummary,
    pub warnings: Vec<String>,
    pub filter: FilterCriteria,
    pub filter_keys: Vec<String>,
    pub category_values: Vec<String>,
    pub matched: usize,
    pub map: MapView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}

pub async fn resolve_file(
    session: &MapSession,
    request: &ResolveRequest,
    observer: Option<ProgressObserver>,
) -> AppResult<ResolveSummary> {
    let outcome = session
        .resolve_file(&request.path, &request.overrides, observer)
        .await?;
    let report = &outcome.report;
    let dataset = &report.dataset;
    let matched = dataset.filter(&request.criteria);

    let export_path = match request.export {
        Some(format) => {
            let path = request
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(format.default_file_name()));
            // Exports always cover the full dataset, not the filtered view.
            export::write_export(&path, dataset.records(), format)?;
            Some(path.display().to_string())
        }
        None => None,
    };

    info!(
        resolved = report.resolved(),
        unresolved = report.unresolved(),
        matched = matched.len(),
        "upload processed"
    );

    Ok(ResolveSummary {
        path: request.path.display().to_string(),
        columns: outcome.columns.clone(),
        total_rows: report.total_rows,
        resolved: report.resolved(),
        skipped: report.skipped,
        failed: report.failed(),
        failures: report.failure_summary(session.config().failure_summary_limit),
        warnings: outcome.warnings.clone(),
        filter: request.criteria.clone(),
        filter_keys: dataset.filter_keys(),
        category_values: dataset.category_values(),
        matched: matched.len(),
        map: map_view(matched),
        export_path,
    })
}

#[derive(Debug, Serialize)]
pub struct CredentialStatus {
    pub in_environment: bool,
    pub in_keyring: bool,
    pub config: PublicAppConfig,
}

pub fn credential_status(config: &AppConfig, vault: &SecretVault) -> AppResult<CredentialStatus> {
    Ok(CredentialStatus {
        in_environment: config.google_maps_api_key.is_some(),
        in_keyring: vault.has(GEOCODE_KEY_ALIAS)?,
        config: config.public_profile(),
    })
}

pub fn store_credential(vault: &SecretVault, secret: &SecretString) -> AppResult<()> {
    vault.write_secret(GEOCODE_KEY_ALIAS, secret)
}

pub fn clear_credential(vault: &SecretVault) -> AppResult<()> {
    vault.delete(GEOCODE_KEY_ALIAS)
}

/// Progress output for the CLI. Always stderr so stdout stays parseable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn observer(self) -> Option<ProgressObserver> {
        match self {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(Arc::new(|progress: BatchProgress| {
                write_stderr(&human_line(&progress));
            })),
            ProgressMode::Json => Some(Arc::new(|progress: BatchProgress| {
                write_stderr(&json_line(&progress));
            })),
        }
    }
}

fn human_line(progress: &BatchProgress) -> String {
    format!(
        "geocoding  {:>3}%  {} / {} rows  ({} resolved, {} skipped, {} failed)\n",
        progress.percent,
        progress.processed,
        progress.total,
        progress.resolved,
        progress.skipped,
        progress.failed
    )
}

fn json_line(progress: &BatchProgress) -> String {
    let mut line = json!({ "event": "progress", "progress": progress }).to_string();
    line.push('\n');
    line
}

fn write_stderr(line: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
}
