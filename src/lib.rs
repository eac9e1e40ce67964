pub mod commands;
pub mod config;
pub mod dataset;
pub mod detect;
pub mod errors;
pub mod export;
pub mod geocode;
pub mod ingestion;
pub mod pacing;
pub mod resolver;
pub mod secrets;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::config::{AppConfig, PacingStrategy, PublicAppConfig};
pub use crate::dataset::{
    map_view, AddressDataset, CategorySelection, FilterCriteria, MapView, ResolvedAddress,
};
pub use crate::detect::{ColumnOverrides, ColumnSelection, FieldMatch};
pub use crate::errors::{AppError, AppResult};
pub use crate::export::ExportFormat;
pub use crate::geocode::{GeocodeLookup, GeocodeOutcome, GeocoderHandle, HttpGeocodeClient};
pub use crate::ingestion::RawRow;
pub use crate::pacing::PacingGate;
pub use crate::resolver::{BatchProgress, BatchReport, ProgressObserver};
pub use crate::secrets::SecretVault;

use crate::pacing::gate_from_config;
use crate::resolver::{BatchGeneration, BatchResolver, BatchTicket};

pub const VAULT_SERVICE_NAME: &str = "AddressMapper";

/// Result of one upload. `committed` is false when a newer upload superseded it.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub columns: ColumnSelection,
    pub report: BatchReport,
    pub warnings: Vec<String>,
    pub committed: bool,
}

/// One in-memory mapping session: the shared geocoder plus the current dataset.
pub struct MapSession {
    config: AppConfig,
    geocoder: Arc<GeocoderHandle>,
    gate: Arc<dyn PacingGate>,
    generations: BatchGeneration,
    current: Mutex<Option<BatchReport>>,
}

impl MapSession {
    /// Environment config plus the OS keyring, with tracing installed.
    pub fn initialize() -> Self {
        init_tracing();
        let config = AppConfig::from_env();
        info!(config = ?config.public_profile(), "starting session");
        Self::new(config, Some(SecretVault::new(VAULT_SERVICE_NAME)))
    }

    pub fn new(config: AppConfig, vault: Option<SecretVault>) -> Self {
        let geocoder = Arc::new(GeocoderHandle::new(config.clone(), vault));
        let gate = gate_from_config(&config);
        Self::with_parts(config, geocoder, gate)
    }

    pub fn with_parts(
        config: AppConfig,
        geocoder: Arc<GeocoderHandle>,
        gate: Arc<dyn PacingGate>,
    ) -> Self {
        Self {
            config,
            geocoder,
            gate,
            generations: BatchGeneration::new(),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn geocoder(&self) -> &GeocoderHandle {
        &self.geocoder
    }

    /// Stops the in-flight batch, if any; its late results are discarded.
    pub fn cancel_in_flight(&self) -> u64 {
        self.generations.begin().generation()
    }

    pub async fn resolve_file(
        &self,
        path: &Path,
        overrides: &ColumnOverrides,
        observer: Option<ProgressObserver>,
    ) -> AppResult<UploadOutcome> {
        let ticket = self.generations.begin();
        let rows = ingestion::load_rows(path)?;
        info!(path = %path.display(), rows = rows.len(), "loaded upload");
        self.run_batch(ticket, rows, overrides, observer).await
    }

    pub async fn resolve_rows(
        &self,
        rows: Vec<RawRow>,
        overrides: &ColumnOverrides,
        observer: Option<ProgressObserver>,
    ) -> AppResult<UploadOutcome> {
        let ticket = self.generations.begin();
        self.run_batch(ticket, rows, overrides, observer).await
    }

    async fn run_batch(
        &self,
        ticket: BatchTicket,
        rows: Vec<RawRow>,
        overrides: &ColumnOverrides,
        observer: Option<ProgressObserver>,
    ) -> AppResult<UploadOutcome> {
        let columns = detect::select_columns(&rows, overrides)?;
        let lookup = self.geocoder.ensure_ready()?;

        let mut warnings = Vec::new();
        if let Some(err) = self.geocoder.take_credential_warning() {
            warnings.push(err.to_string());
        }
        if columns.is_low_confidence() {
            warnings.push(format!(
                "no address-like column found; using first column `{}`",
                columns.address
            ));
        }

        let resolver = BatchResolver::new(lookup, Arc::clone(&self.gate));
        let report = resolver.resolve(&rows, &columns, &ticket, observer).await;

        let committed = {
            let mut current = self.current.lock();
            if ticket.is_current() && !report.cancelled {
                *current = Some(report.clone());
                true
            } else {
                false
            }
        };
        if !committed {
            warn!(generation = ticket.generation(), "discarding superseded batch");
        }

        Ok(UploadOutcome {
            columns,
            report,
            warnings,
            committed,
        })
    }

    pub fn last_report(&self) -> Option<BatchReport> {
        self.current.lock().clone()
    }

    pub fn dataset(&self) -> AddressDataset {
        self.current
            .lock()
            .as_ref()
            .map(|report| report.dataset.clone())
            .unwrap_or_default()
    }

    pub fn filter(&self, criteria: &FilterCriteria) -> Vec<ResolvedAddress> {
        let current = self.current.lock();
        let Some(report) = current.as_ref() else {
            return Vec::new();
        };
        report
            .dataset
            .filter(criteria)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn map_view(&self, criteria: &FilterCriteria) -> MapView {
        map_view(&self.filter(criteria))
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_mapper=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::pacing::NoopGate;

    /// Resolves every address after a delay, echoing the query back.
    struct SlowLookup {
        delay: Duration,
    }

    #[async_trait]
    impl GeocodeLookup for SlowLookup {
        async fn geocode(&self, address: &str) -> GeocodeOutcome {
            tokio::time::sleep(self.delay).await;
            GeocodeOutcome::Resolved {
                latitude: 1.0,
                longitude: 2.0,
                formatted_address: format!("{address} (resolved)"),
            }
        }
    }

    fn session(delay: Duration) -> MapSession {
        let config = AppConfig::default();
        let geocoder = Arc::new(GeocoderHandle::from_lookup(
            config.clone(),
            Arc::new(SlowLookup { delay }),
        ));
        MapSession::with_parts(config, geocoder, Arc::new(NoopGate))
    }

    fn rows(values: Vec<Value>) -> Vec<RawRow> {
        values
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(map) => Some(RawRow::from(map)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn commits_dataset_and_filters_it() {
        let session = session(Duration::ZERO);
        let outcome = session
            .resolve_rows(
                rows(vec![
                    json!({ "Addr": "1 Main", "Type": "store", "Owner": "Ada" }),
                    json!({ "Addr": "2 Main", "Owner": "Grace" }),
                ]),
                &ColumnOverrides::default(),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.committed);
        assert_eq!(outcome.columns.address, "Addr");
        assert_eq!(outcome.columns.category.as_deref(), Some("Type"));
        assert_eq!(session.dataset().len(), 2);
        assert_eq!(
            session.dataset().records()[0].category.as_deref(),
            Some("store")
        );

        let by_owner = session.filter(&FilterCriteria::new("grace", "all"));
        assert_eq!(by_owner.len(), 1);
        assert_eq!(by_owner[0].address, "2 Main (resolved)");

        let view = session.map_view(&FilterCriteria::new("", "Type"));
        assert_eq!(view.markers.len(), 1);
    }

    #[tokio::test]
    async fn file_level_errors_abort_before_geocoding() {
        let session = session(Duration::ZERO);
        let err = session
            .resolve_rows(Vec::new(), &ColumnOverrides::default(), None)
            .await
            .unwrap_err();
        assert!(err.is_file_level());

        let overrides = ColumnOverrides {
            address: Some("Missing".into()),
            category: None,
        };
        let err = session
            .resolve_rows(rows(vec![json!({ "Addr": "x" })]), &overrides, None)
            .await
            .unwrap_err();
        assert!(err.is_file_level());
        assert!(session.last_report().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_upload_supersedes_in_flight_batch() {
        let session = session(Duration::from_millis(100));
        // Both uploads borrow the overrides across the join.
        let overrides = ColumnOverrides::default();
        let first = session.resolve_rows(
            rows(vec![json!({ "Address": "old-1" }), json!({ "Address": "old-2" })]),
            &overrides,
            None,
        );
        let second = async {
            // Let the first batch reach its first request before uploading again.
            tokio::time::sleep(Duration::from_millis(10)).await;
            session
                .resolve_rows(
                    rows(vec![json!({ "Address": "new-1" })]),
                    &overrides,
                    None,
                )
                .await
        };

        let (first, second) = tokio::join!(first, second);
        let first = first.unwrap();
        let second = second.unwrap();

        assert!(first.report.cancelled);
        assert!(!first.committed);
        assert!(first.report.dataset.is_empty());
        assert!(second.committed);

        let dataset = session.dataset();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.records()[0].query, "new-1");
    }

    #[tokio::test]
    async fn reports_low_confidence_column_choice() {
        let session = session(Duration::ZERO);
        let outcome = session
            .resolve_rows(
                rows(vec![json!({ "Venue": "Hall", "City": "Oslo" })]),
                &ColumnOverrides::default(),
                None,
            )
            .await
            .unwrap();
        assert!(outcome.columns.is_low_confidence());
        assert!(outcome.warnings.iter().any(|w| w.contains("`Venue`")));
    }

    #[test]
    fn cancelling_without_a_batch_is_harmless() {
        let session = session(Duration::ZERO);
        assert_eq!(session.cancel_in_flight(), 1);
        assert!(session.dataset().is_empty());
        assert!(session.filter(&FilterCriteria::default()).is_empty());
    }
}
