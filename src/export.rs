use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use tracing::info;

use crate::dataset::ResolvedAddress;
use crate::errors::{AppError, AppResult};

const CORE_COLUMNS: [&str; 3] = ["address", "latitude", "longitude"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn default_file_name(self) -> String {
        format!("geocoded-addresses.{}", self.extension())
    }
}

pub fn render<'a, I>(records: I, format: ExportFormat) -> AppResult<String>
where
    I: IntoIterator<Item = &'a ResolvedAddress>,
{
    let records: Vec<&ResolvedAddress> = records.into_iter().collect();
    match format {
        ExportFormat::Csv => to_csv(&records),
        ExportFormat::Json => to_json(&records),
    }
}

pub fn write_export<'a, I>(path: &Path, records: I, format: ExportFormat) -> AppResult<()>
where
    I: IntoIterator<Item = &'a ResolvedAddress>,
{
    let body = render(records, format)?;
    fs::write(path, body)?;
    info!(path = %path.display(), format = format.extension(), "wrote export");
    Ok(())
}

/// Header is left bare; every string cell is quoted, numbers and booleans are raw.
pub fn to_csv(records: &[&ResolvedAddress]) -> AppResult<String> {
    let extra = source_columns(records);

    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let header: Vec<String> = CORE_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain(extra.iter().cloned())
        .map(|column| header_cell(&column))
        .collect();
    writer.write_record(&header)?;

    for record in records {
        let mut cells = vec![
            quote(&record.address),
            coordinate_cell(record.latitude),
            coordinate_cell(record.longitude),
        ];
        cells.extend(extra.iter().map(|key| csv_cell(record.source_row.get(key))));
        writer.write_record(&cells)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| AppError::Io(err.into_error()))?;
    String::from_utf8(bytes).map_err(|err| AppError::Parse(err.to_string()))
}

/// Pretty-printed array of flat objects; source keys never shadow the core columns.
pub fn to_json(records: &[&ResolvedAddress]) -> AppResult<String> {
    let flattened: Vec<Value> = records.iter().map(|record| flatten(record)).collect();
    Ok(serde_json::to_string_pretty(&flattened)?)
}

fn flatten(record: &ResolvedAddress) -> Value {
    let mut object = Map::new();
    object.insert("address".into(), Value::String(record.address.clone()));
    object.insert("latitude".into(), coordinate(record.latitude));
    object.insert("longitude".into(), coordinate(record.longitude));
    for (key, value) in record.source_row.iter() {
        if !CORE_COLUMNS.contains(&key) {
            object.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(object)
}

/// Largest magnitude where every whole `f64` is an exact integer.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Whole coordinates are written as integers (`-20`, not `-20.0`).
fn coordinate(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() <= MAX_EXACT_INTEGER {
        return Value::Number(Number::from(value as i64));
    }
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn coordinate_cell(value: f64) -> String {
    match coordinate(value) {
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

/// Distinct source keys across all records, first-seen order.
fn source_columns(records: &[&ResolvedAddress]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.source_row.keys() {
            if CORE_COLUMNS.contains(&key) || columns.iter().any(|seen| seen == key) {
                continue;
            }
            columns.push(key.to_string());
        }
    }
    columns
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => quote(""),
        Some(Value::String(text)) => quote(text),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(other) => quote(&other.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn header_cell(column: &str) -> String {
    if column.contains([',', '"', '\n', '\r']) {
        quote(column)
    } else {
        column.to_string()
    }
}
