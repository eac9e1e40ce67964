//! Column detection over the first row of an upload.
//!
//! The schema is sampled once from the first row; later rows are assumed to
//! share it. Callers that need per-row validation must run a separate pass.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::ingestion::{scalar_text, RawRow};

/// Address keywords in priority order.
pub const ADDRESS_KEYWORDS: &[&str] = &[
    "address",
    "location",
    "street",
    "streetaddress",
    "fulladdress",
    "addressline1",
    "address1",
    "addr",
];

pub const CATEGORY_KEYWORDS: &[&str] = &["category", "type"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "confidence", rename_all = "snake_case")]
pub enum FieldMatch {
    Keyword { column: String, keyword: String },
    FirstColumn { column: String },
}

impl FieldMatch {
    pub fn column(&self) -> &str {
        match self {
            FieldMatch::Keyword { column, .. } | FieldMatch::FirstColumn { column } => column,
        }
    }

    pub fn is_low_confidence(&self) -> bool {
        matches!(self, FieldMatch::FirstColumn { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("no rows to inspect")]
    EmptyInput,
    #[error("first row has no columns; cannot pick an address field")]
    NoAddressField,
}

pub fn detect_address_field(rows: &[RawRow]) -> Result<FieldMatch, DetectError> {
    let first = rows.first().ok_or(DetectError::EmptyInput)?;
    if first.is_empty() {
        return Err(DetectError::NoAddressField);
    }

    if let Some((column, keyword)) = match_keywords(first, ADDRESS_KEYWORDS) {
        debug!(column, keyword, "detected address field");
        return Ok(FieldMatch::Keyword {
            column: column.to_string(),
            keyword: keyword.to_string(),
        });
    }

    let column = first.keys().next().ok_or(DetectError::NoAddressField)?;
    warn!(column, "no address-like column found; defaulting to first column");
    Ok(FieldMatch::FirstColumn {
        column: column.to_string(),
    })
}

/// Absence is not an error; it disables category filtering.
pub fn detect_category_field(rows: &[RawRow]) -> Option<String> {
    let first = rows.first()?;
    let detected = match_keywords(first, CATEGORY_KEYWORDS).map(|(column, _)| column.to_string());
    if let Some(column) = &detected {
        debug!(column, "detected category field");
    }
    detected
}

/// Columns the caller wants instead of the detected ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnOverrides {
    pub address: Option<String>,
    pub category: Option<String>,
}

/// Columns a batch will read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSelection {
    pub address: String,
    pub category: Option<String>,
    /// `None` when the address column was chosen by the caller.
    pub detected: Option<FieldMatch>,
}

impl ColumnSelection {
    pub fn is_low_confidence(&self) -> bool {
        self.detected
            .as_ref()
            .is_some_and(FieldMatch::is_low_confidence)
    }
}

/// Detects columns, or validates overrides against the first row's keys.
pub fn select_columns(rows: &[RawRow], overrides: &ColumnOverrides) -> AppResult<ColumnSelection> {
    let first = rows
        .first()
        .ok_or_else(|| AppError::Parse(DetectError::EmptyInput.to_string()))?;

    let (address, detected) = match &overrides.address {
        Some(column) => (require_column(first, column)?, None),
        None => {
            let found = detect_address_field(rows).map_err(|err| AppError::Parse(err.to_string()))?;
            (found.column().to_string(), Some(found))
        }
    };
    let category = match &overrides.category {
        Some(column) => Some(require_column(first, column)?),
        None => detect_category_field(rows),
    };

    Ok(ColumnSelection {
        address,
        category,
        detected,
    })
}

fn require_column(row: &RawRow, column: &str) -> AppResult<String> {
    if row.keys().any(|key| key == column) {
        return Ok(column.to_string());
    }
    let available = row.keys().collect::<Vec<_>>().join(", ");
    Err(AppError::Parse(format!(
        "column `{column}` not found; available columns: {available}"
    )))
}

/// First `limit` values of `column`, rendered as text, for previewing a choice.
pub fn sample_values(rows: &[RawRow], column: &str, limit: usize) -> Vec<Option<String>> {
    rows.iter()
        .take(limit)
        .map(|row| row.get(column).and_then(scalar_text))
        .collect()
}

fn match_keywords<'a>(row: &'a RawRow, keywords: &[&'static str]) -> Option<(&'a str, &'static str)> {
    keywords.iter().find_map(|keyword| {
        row.keys()
            .find(|key| key.to_lowercase().contains(keyword))
            .map(|key| (key, *keyword))
    })
}
