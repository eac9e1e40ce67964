use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dataset::{AddressDataset, ResolvedAddress};
use crate::detect::ColumnSelection;
use crate::geocode::{GeocodeLookup, GeocodeOutcome};
use crate::ingestion::RawRow;
use crate::pacing::PacingGate;

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Live batch counter. Beginning a batch invalidates every earlier ticket.
#[derive(Debug, Clone, Default)]
pub struct BatchGeneration {
    live: Arc<AtomicU64>,
}

impl BatchGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> BatchTicket {
        let generation = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        BatchTicket {
            generation,
            live: Arc::clone(&self.live),
        }
    }

    pub fn current(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchTicket {
    generation: u64,
    live: Arc<AtomicU64>,
}

impl BatchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum RowFailureReason {
    NotFound,
    RateLimited,
    TransientError(String),
}

impl fmt::Display for RowFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowFailureReason::NotFound => f.write_str("address not found"),
            RowFailureReason::RateLimited => f.write_str("rate limited by provider"),
            RowFailureReason::TransientError(message) => write!(f, "request failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub row_index: usize,
    pub query: String,
    #[serde(flatten)]
    pub reason: RowFailureReason,
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} ({:?}): {}",
            self.row_index + 1,
            self.query,
            self.reason
        )
    }
}

/// Terminal state of one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Resolved(ResolvedAddress),
    Skipped,
    Failed(RowFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub generation: u64,
    pub processed: usize,
    pub total: usize,
    pub percent: u8,
    pub resolved: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub messages: Vec<String>,
    pub remaining: usize,
}

impl FailureSummary {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.remaining == 0
    }
}

impl fmt::Display for FailureSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.messages {
            writeln!(f, "{message}")?;
        }
        if self.remaining > 0 {
            writeln!(f, "...and {} more", self.remaining)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub generation: u64,
    pub dataset: AddressDataset,
    pub total_rows: usize,
    pub skipped: usize,
    pub failures: Vec<RowFailure>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn resolved(&self) -> usize {
        self.dataset.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Rows that did not make it into the dataset.
    pub fn unresolved(&self) -> usize {
        self.skipped + self.failed()
    }

    pub fn processed(&self) -> usize {
        self.resolved() + self.unresolved()
    }

    pub fn failure_summary(&self, limit: usize) -> FailureSummary {
        FailureSummary {
            messages: self
                .failures
                .iter()
                .take(limit)
                .map(ToString::to_string)
                .collect(),
            remaining: self.failures.len().saturating_sub(limit),
        }
    }
}

/// Rounded share of processed rows; 100 is reserved for the last row.
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 || processed >= total {
        return 100;
    }
    let rounded = (processed * 100 + total / 2) / total;
    rounded.min(99) as u8
}

/// Drives rows through the pacing gate and the geocoder one at a time.
pub struct BatchResolver {
    lookup: Arc<dyn GeocodeLookup>,
    gate: Arc<dyn PacingGate>,
}

impl BatchResolver {
    pub fn new(lookup: Arc<dyn GeocodeLookup>, gate: Arc<dyn PacingGate>) -> Self {
        Self { lookup, gate }
    }

    pub async fn resolve(
        &self,
        rows: &[RawRow],
        columns: &ColumnSelection,
        ticket: &BatchTicket,
        observer: Option<ProgressObserver>,
    ) -> BatchReport {
        let started_at = Utc::now();
        let ingested_millis = started_at.timestamp_millis();
        let total_rows = rows.len();
        let generation = ticket.generation();
        info!(
            generation,
            rows = total_rows,
            field = %columns.address,
            category = ?columns.category,
            "starting batch geocoding"
        );

        let mut dataset = AddressDataset::new();
        let mut failures = Vec::new();
        let mut skipped = 0;
        let mut processed = 0;
        let mut cancelled = false;

        for (row_index, row) in rows.iter().enumerate() {
            if !ticket.is_current() {
                cancelled = true;
                break;
            }

            let outcome = self.resolve_row(row_index, row, columns, ingested_millis).await;

            // A newer batch may have started while the request was in flight.
            if !ticket.is_current() {
                debug!(generation, row = row_index, "discarding result of superseded batch");
                cancelled = true;
                break;
            }

            match outcome {
                RowOutcome::Resolved(record) => dataset.push(record),
                RowOutcome::Skipped => {
                    debug!(row = row_index, "skipping row without address text");
                    skipped += 1;
                }
                RowOutcome::Failed(failure) => {
                    debug!(row = row_index, reason = %failure.reason, "row failed to geocode");
                    failures.push(failure);
                }
            }
            processed += 1;

            if let Some(callback) = &observer {
                callback(BatchProgress {
                    generation,
                    processed,
                    total: total_rows,
                    percent: progress_percent(processed, total_rows),
                    resolved: dataset.len(),
                    skipped,
                    failed: failures.len(),
                });
            }
        }

        if total_rows == 0 {
            if let Some(callback) = &observer {
                callback(BatchProgress {
                    generation,
                    processed: 0,
                    total: 0,
                    percent: 100,
                    resolved: 0,
                    skipped: 0,
                    failed: 0,
                });
            }
        }

        let report = BatchReport {
            generation,
            dataset,
            total_rows,
            skipped,
            failures,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };

        if report.cancelled {
            warn!(
                generation,
                processed = report.processed(),
                total = total_rows,
                "batch superseded by a newer upload"
            );
        } else {
            info!(
                generation,
                resolved = report.resolved(),
                skipped = report.skipped,
                failed = report.failed(),
                "batch geocoding finished"
            );
        }
        report
    }

    async fn resolve_row(
        &self,
        row_index: usize,
        row: &RawRow,
        columns: &ColumnSelection,
        ingested_millis: i64,
    ) -> RowOutcome {
        let Some(query) = row.text(&columns.address) else {
            return RowOutcome::Skipped;
        };

        self.gate.wait().await;
        let outcome = self.lookup.geocode(&query).await;
        self.gate.observe(&outcome);

        let reason = match outcome {
            GeocodeOutcome::Resolved {
                latitude,
                longitude,
                formatted_address,
            } => {
                let category = columns
                    .category
                    .as_deref()
                    .and_then(|column| row.text(column));
                return RowOutcome::Resolved(ResolvedAddress {
                    id: format!("{row_index}-{ingested_millis}"),
                    address: formatted_address,
                    query,
                    latitude,
                    longitude,
                    category,
                    row_index,
                    source_row: row.clone(),
                });
            }
            GeocodeOutcome::NoAddressField => return RowOutcome::Skipped,
            GeocodeOutcome::NotFound => RowFailureReason::NotFound,
            GeocodeOutcome::RateLimited => RowFailureReason::RateLimited,
            GeocodeOutcome::TransientError { message } => RowFailureReason::TransientError(message),
        };

        RowOutcome::Failed(RowFailure {
            row_index,
            query,
            reason,
        })
    }
}
