use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Upper bound on decompressed bytes read from one workbook part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const WORKSHEET_PREFIX: &str = "xl/worksheets/sheet";
const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
/// Excel's last column is `XFD`.
const MAX_SHEET_COLUMNS: usize = 16_384;
const MAX_COLUMN_LETTERS: usize = 3;

/// One spreadsheet row: column name to scalar cell, in sheet column order.
/// Empty cells are `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(Map<String, Value>);

impl RawRow {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A column counts as present when the key exists and the cell is not empty.
    pub fn is_present(&self, column: &str) -> bool {
        matches!(self.0.get(column), Some(value) if !value.is_null())
    }

    /// Cell rendered as trimmed text; `None` for missing, null or blank cells.
    pub fn text(&self, column: &str) -> Option<String> {
        self.0
            .get(column)
            .and_then(scalar_text)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl FromIterator<(String, Value)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Map<String, Value>> for RawRow {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Xlsx,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "xlsx" => Ok(SourceFormat::Xlsx),
            "xls" => Err(AppError::Parse(
                "legacy .xls workbooks are not supported; save the sheet as .xlsx or .csv".into(),
            )),
            "" => Err(AppError::Parse(format!(
                "cannot determine file type of {}; expected .csv or .xlsx",
                path.display()
            ))),
            other => Err(AppError::Parse(format!(
                "unsupported file type .{other}; expected .csv or .xlsx"
            ))),
        }
    }
}

pub fn load_rows(path: &Path) -> AppResult<Vec<RawRow>> {
    let format = SourceFormat::from_path(path)?;
    let bytes = std::fs::read(path)?;
    parse_rows(&bytes, format)
}

/// Parses file bytes into rows. A file without data rows is a parse error.
pub fn parse_rows(bytes: &[u8], format: SourceFormat) -> AppResult<Vec<RawRow>> {
    let rows = match format {
        SourceFormat::Csv => parse_csv(bytes)?,
        SourceFormat::Xlsx => parse_xlsx(bytes)?,
    };
    if rows.is_empty() {
        return Err(AppError::Parse("file contains no data rows".into()));
    }
    debug!(format = ?format, rows = rows.len(), "parsed input rows");
    Ok(rows)
}

pub fn parse_csv(bytes: &[u8]) -> AppResult<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = unique_headers(reader.headers()?.iter().map(str::to_string));
    if headers.is_empty() {
        return Err(AppError::Parse("CSV file has no header row".into()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let row: RawRow = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                let value = match record.get(idx) {
                    Some(field) if !field.trim().is_empty() => csv_value(field),
                    _ => Value::Null,
                };
                (header.clone(), value)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub fn parse_xlsx(bytes: &[u8]) -> AppResult<Vec<RawRow>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| AppError::Parse(format!("invalid xlsx workbook: {err}")))?;
    let shared_strings = if has_part(&archive, SHARED_STRINGS_PART) {
        read_shared_strings(&read_zip_entry(&mut archive, SHARED_STRINGS_PART)?)?
    } else {
        Vec::new()
    };
    let sheet_name = first_worksheet_name(&mut archive)?
        .ok_or_else(|| AppError::Parse("xlsx workbook has no worksheets".into()))?;
    let sheet_xml = read_zip_entry(&mut archive, &sheet_name)?;
    let grid = read_sheet_grid(&sheet_xml, &shared_strings)?;
    Ok(grid_to_rows(grid))
}

/// Plain decimal numbers become JSON numbers; anything that would lose its
/// spelling (leading zeros, exponents, `+`) stays text.
fn csv_value(field: &str) -> Value {
    let trimmed = field.trim();
    if is_plain_number(trimmed) {
        numeric_value(trimmed)
    } else {
        Value::String(field.to_string())
    }
}

fn is_plain_number(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };
    let whole_ok = !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && (whole == "0" || !whole.starts_with('0'));
    let fraction_ok = fraction
        .map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()));
    whole_ok && fraction_ok && whole.len() <= 15
}

fn unique_headers(raw: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.enumerate()
        .map(|(idx, header)| {
            let base = match header.trim() {
                "" => format!("column_{}", idx + 1),
                trimmed => trimmed.to_string(),
            };
            let mut candidate = base.clone();
            let mut suffix = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{base}_{suffix}");
                suffix += 1;
            }
            candidate
        })
        .collect()
}

fn has_part(archive: &zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> bool {
    archive.file_names().any(|candidate| candidate == name)
}

/// First sheet in workbook order. Falls back to the lowest-numbered sheet part
/// when the workbook or its relationships cannot be followed.
fn first_worksheet_name(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> AppResult<Option<String>> {
    if let Some(name) = first_listed_sheet(archive)? {
        return Ok(Some(name));
    }
    Ok(lowest_numbered_sheet(archive))
}

fn first_listed_sheet(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> AppResult<Option<String>> {
    if !has_part(archive, WORKBOOK_PART) || !has_part(archive, WORKBOOK_RELS_PART) {
        return Ok(None);
    }
    let workbook = read_zip_entry(archive, WORKBOOK_PART)?;
    let Some(relationship_id) = first_sheet_relationship(&workbook)? else {
        return Ok(None);
    };
    let relationships = read_zip_entry(archive, WORKBOOK_RELS_PART)?;
    let Some(target) = relationship_target(&relationships, &relationship_id)? else {
        return Ok(None);
    };
    let part = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    };
    Ok(has_part(archive, &part).then_some(part))
}

fn first_sheet_relationship(xml: &[u8]) -> AppResult<Option<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                // `r:id`; the namespace prefix varies between writers.
                return Ok(e
                    .attributes()
                    .flatten()
                    .find(|attr| attr.key.local_name().as_ref() == b"id")
                    .map(|attr| String::from_utf8_lossy(&attr.value).into_owned()));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

fn relationship_target(xml: &[u8], id: &str) -> AppResult<Option<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e)
                if e.local_name().as_ref() == b"Relationship"
                    && attribute(&e, b"Id").as_deref() == Some(id) =>
            {
                return Ok(attribute(&e, b"Target"));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

fn lowest_numbered_sheet(archive: &zip::ZipArchive<Cursor<&[u8]>>) -> Option<String> {
    archive
        .file_names()
        .filter(|name| name.starts_with(WORKSHEET_PREFIX) && name.ends_with(".xml"))
        .min_by_key(|name| {
            name.trim_start_matches(WORKSHEET_PREFIX)
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        })
        .map(str::to_string)
}

fn read_zip_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> AppResult<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|err| AppError::Parse(format!("xlsx part {name} unreadable: {err}")))?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(AppError::Parse(format!(
            "xlsx part {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

fn xml_error(err: quick_xml::Error) -> AppError {
    AppError::Parse(format!("malformed xlsx XML: {err}"))
}

fn read_shared_strings(xml: &[u8]) -> AppResult<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                // Phonetic readings (`rPh`) are not part of the cell text.
                b"rPh" => in_phonetic = true,
                b"t" if in_si && !in_phonetic => in_t = true,
                _ => {}
            },
            Event::Text(text) if in_t => {
                current.push_str(&text.unescape().map_err(xml_error)?);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"rPh" => in_phonetic = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Number,
    Shared,
    Inline,
    Text,
    Bool,
    Error,
}

/// Sparse sheet contents keyed by zero-based row then column.
type SheetGrid = BTreeMap<usize, BTreeMap<usize, Value>>;

fn read_sheet_grid(xml: &[u8], shared_strings: &[String]) -> AppResult<SheetGrid> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut grid = SheetGrid::new();
    let mut row_idx = 0usize;
    let mut next_row = 0usize;
    let mut col_idx = 0usize;
    let mut next_col = 0usize;
    let mut kind = CellKind::Number;
    let mut in_value = false;
    let mut in_phonetic = false;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    row_idx = attribute(&e, b"r")
                        .and_then(|r| r.parse::<usize>().ok())
                        .map(|r| r.saturating_sub(1))
                        .unwrap_or(next_row);
                    next_row = row_idx + 1;
                    next_col = 0;
                }
                b"c" => {
                    col_idx = cell_column(&e, next_col)?;
                    next_col = col_idx + 1;
                    kind = match attribute(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        Some("str") => CellKind::Text,
                        Some("b") => CellKind::Bool,
                        Some("e") => CellKind::Error,
                        _ => CellKind::Number,
                    };
                    text.clear();
                }
                b"rPh" => in_phonetic = true,
                b"v" | b"t" if !in_phonetic => in_value = true,
                _ => {}
            },
            Event::Text(t) if in_value => {
                text.push_str(&t.unescape().map_err(xml_error)?);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"rPh" => in_phonetic = false,
                b"c" => {
                    let value = cell_value(kind, &text, shared_strings);
                    if !value.is_null() {
                        grid.entry(row_idx).or_default().insert(col_idx, value);
                    }
                    text.clear();
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"c" => {
                    next_col = cell_column(&e, next_col)? + 1;
                }
                b"row" => next_row += 1,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(grid)
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

/// Column of a `<c>` element; cells without a reference follow the previous one.
fn cell_column(element: &BytesStart<'_>, next_col: usize) -> AppResult<usize> {
    let column = match attribute(element, b"r") {
        Some(reference) => column_index(&reference)?.unwrap_or(next_col),
        None => next_col,
    };
    if column >= MAX_SHEET_COLUMNS {
        return Err(AppError::Parse(format!(
            "malformed xlsx cell reference: column {} is beyond the sheet limit",
            column + 1
        )));
    }
    Ok(column)
}

/// Zero-based column index from an A1-style cell reference (`"AB12"` -> 27).
/// `None` when the reference carries no column letters.
fn column_index(reference: &str) -> AppResult<Option<usize>> {
    let malformed = || AppError::Parse(format!("malformed xlsx cell reference `{reference}`"));
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() {
        return Ok(None);
    }
    if letters.len() > MAX_COLUMN_LETTERS {
        return Err(malformed());
    }
    let index = letters.iter().try_fold(0usize, |acc, b| {
        acc.checked_mul(26)?.checked_add(usize::from(b - b'A' + 1))
    });
    match index {
        Some(index) if index <= MAX_SHEET_COLUMNS => Ok(Some(index - 1)),
        _ => Err(malformed()),
    }
}

fn cell_value(kind: CellKind, text: &str, shared_strings: &[String]) -> Value {
    let raw = text.trim();
    if raw.is_empty() {
        return Value::Null;
    }
    match kind {
        CellKind::Shared => raw
            .parse::<usize>()
            .ok()
            .and_then(|idx| shared_strings.get(idx))
            .filter(|s| !s.trim().is_empty())
            .map(|s| Value::String(s.clone()))
            .unwrap_or(Value::Null),
        CellKind::Inline | CellKind::Text => Value::String(text.to_string()),
        CellKind::Bool => Value::Bool(raw == "1"),
        CellKind::Error => Value::Null,
        CellKind::Number => numeric_value(raw),
    }
}

fn numeric_value(raw: &str) -> Value {
    match raw.parse::<f64>() {
        Ok(number) if number.fract() == 0.0 && number.abs() < i64::MAX as f64 => {
            Value::Number(Number::from(number as i64))
        }
        Ok(number) => Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn grid_to_rows(mut grid: SheetGrid) -> Vec<RawRow> {
    let Some((_, header_cells)) = grid.pop_first() else {
        return Vec::new();
    };
    let width = header_cells.keys().next_back().map(|last| last + 1).unwrap_or(0);
    let headers = unique_headers((0..width).map(|col| {
        header_cells
            .get(&col)
            .and_then(scalar_text)
            .unwrap_or_default()
    }));

    grid.into_values()
        .filter(|cells| !cells.is_empty())
        .map(|mut cells| {
            headers
                .iter()
                .enumerate()
                .map(|(col, header)| (header.clone(), cells.remove(&col).unwrap_or(Value::Null)))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;
    use zip::write::SimpleFileOptions;

    use super::*;

    const SAMPLE_CSV: &str = "Name,Street Address,Type\n\
        Apple HQ,\"1 Infinite Loop, Cupertino\",office\n\
        Blank,,\n\
        ,,\n\
        \"Quote \"\"Co\"\"\",500 Main St,store\n";

    const SHARED_STRINGS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="5" uniqueCount="5">
  <si><t>Name</t></si>
  <si><t>Address</t></si>
  <si><t>Zip</t></si>
  <si><t>Ferry Building</t></si>
  <si><r><t>1 Ferry Bldg, </t></r><r><t>San Francisco</t></r></si>
</sst>"#;

    const SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c><c r="C1" t="s"><v>2</v></c></row>
    <row r="2"><c r="A2" t="s"><v>3</v></c><c r="B2" t="s"><v>4</v></c><c r="C2"><v>94111</v></c></row>
    <row r="4"><c r="B4" t="inlineStr"><is><t>Pier 39 &amp; Beach St</t></is></c><c r="C4"><v>12.5</v></c></row>
  </sheetData>
</worksheet>"#;

    fn build_workbook() -> Vec<u8> {
        zip_parts(&[
            (SHARED_STRINGS_PART, SHARED_STRINGS),
            ("xl/worksheets/sheet1.xml", SHEET),
        ])
    }

    fn zip_parts(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, body) in parts {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn sheet_with_cells(cells: &str) -> String {
        format!(
            r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{cells}</sheetData></worksheet>"#
        )
    }

    #[test]
    fn parses_csv_rows_in_column_order() {
        let rows = parse_rows(SAMPLE_CSV.as_bytes(), SourceFormat::Csv).unwrap();
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            vec!["Name", "Street Address", "Type"]
        );
        assert_eq!(
            first.text("Street Address").as_deref(),
            Some("1 Infinite Loop, Cupertino")
        );

        let blank = &rows[1];
        assert!(blank.get("Street Address").unwrap().is_null());
        assert!(!blank.is_present("Type"));
        assert_eq!(rows[2].text("Name").as_deref(), Some("Quote \"Co\""));
    }

    #[test]
    fn keeps_plain_csv_numbers_numeric() {
        let rows = parse_csv(b"Zip,Lat,Code,Phone,Label\n94111,-37.5,00123,+1 555,12 Main\n").unwrap();
        let row = &rows[0];
        assert_eq!(row.get("Zip"), Some(&json!(94111)));
        assert_eq!(row.get("Lat"), Some(&json!(-37.5)));
        assert_eq!(row.get("Code"), Some(&json!("00123")));
        assert_eq!(row.get("Phone"), Some(&json!("+1 555")));
        assert_eq!(row.get("Label"), Some(&json!("12 Main")));
    }

    #[test]
    fn names_blank_and_duplicate_headers() {
        let rows = parse_csv(b"City,,City\nParis,x,Lyon\n").unwrap();
        assert_eq!(
            rows[0].keys().collect::<Vec<_>>(),
            vec!["City", "column_2", "City_1"]
        );
    }

    #[test]
    fn parses_first_worksheet_of_xlsx() {
        let rows = parse_rows(&build_workbook(), SourceFormat::Xlsx).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name"), Some(&json!("Ferry Building")));
        assert_eq!(
            rows[0].text("Address").as_deref(),
            Some("1 Ferry Bldg, San Francisco")
        );
        assert_eq!(rows[0].get("Zip"), Some(&json!(94111)));
        assert_eq!(rows[1].get("Name"), Some(&Value::Null));
        assert_eq!(rows[1].text("Address").as_deref(), Some("Pier 39 & Beach St"));
        assert_eq!(rows[1].get("Zip"), Some(&json!(12.5)));
    }

    #[test]
    fn rejects_unsupported_and_empty_inputs() {
        assert!(matches!(
            SourceFormat::from_path(Path::new("book.xls")),
            Err(AppError::Parse(_))
        ));
        assert!(matches!(
            SourceFormat::from_path(Path::new("notes.txt")),
            Err(AppError::Parse(_))
        ));
        assert_eq!(
            SourceFormat::from_path(Path::new("DATA.CSV")).unwrap(),
            SourceFormat::Csv
        );

        let err = parse_rows(b"Address\n", SourceFormat::Csv).unwrap_err();
        assert!(err.is_file_level());
        let err = parse_rows(b"not a zip", SourceFormat::Xlsx).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn loads_rows_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.csv");
        std::fs::write(&path, SAMPLE_CSV).unwrap();
        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn decodes_column_references() {
        assert_eq!(column_index("A1").unwrap(), Some(0));
        assert_eq!(column_index("Z9").unwrap(), Some(25));
        assert_eq!(column_index("AB12").unwrap(), Some(27));
        assert_eq!(column_index("XFD1").unwrap(), Some(16_383));
        assert_eq!(column_index("12").unwrap(), None);
        assert!(column_index("XFE1").is_err());
        assert!(column_index("ZZZZ1").is_err());
    }

    #[test]
    fn overlong_cell_reference_is_a_parse_error() {
        let sheet = sheet_with_cells(
            r#"<row r="1"><c r="ZZZZZZZZZZZZZZZ1" t="inlineStr"><is><t>Address</t></is></c></row>"#,
        );
        let workbook = zip_parts(&[("xl/worksheets/sheet1.xml", &sheet)]);
        let err = parse_rows(&workbook, SourceFormat::Xlsx).unwrap_err();
        assert!(matches!(&err, AppError::Parse(message) if message.contains("malformed xlsx cell reference")));
    }

    #[test]
    fn column_past_sheet_limit_is_rejected_before_widening_rows() {
        let sheet = sheet_with_cells(
            r#"<row r="1"><c r="ZZZZ1" t="inlineStr"><is><t>Address</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>1 Main St</t></is></c></row>"#,
        );
        let workbook = zip_parts(&[("xl/worksheets/sheet1.xml", &sheet)]);
        assert!(matches!(
            parse_rows(&workbook, SourceFormat::Xlsx),
            Err(AppError::Parse(_))
        ));

        let unreferenced = sheet_with_cells(
            r#"<row r="1"><c t="inlineStr"><is><t>Address</t></is></c><c t="inlineStr"><is><t>City</t></is></c></row><row r="2"><c t="inlineStr"><is><t>1 Main St</t></is></c></row>"#,
        );
        let workbook = zip_parts(&[("xl/worksheets/sheet1.xml", &unreferenced)]);
        let rows = parse_rows(&workbook, SourceFormat::Xlsx).unwrap();
        assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["Address", "City"]);
    }

    #[test]
    fn reads_first_sheet_in_workbook_order() {
        let workbook_xml = r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Stores" sheetId="2" r:id="rId7"/><sheet name="Scratch" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
        let rels_xml = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId7" Type="worksheet" Target="/xl/worksheets/sheet2.xml"/></Relationships>"#;
        let scratch = sheet_with_cells(
            r#"<row r="1"><c r="A1" t="inlineStr"><is><t>Notes</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>ignore me</t></is></c></row>"#,
        );
        let stores = sheet_with_cells(
            r#"<row r="1"><c r="A1" t="inlineStr"><is><t>Address</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>1 Main St</t></is></c></row>"#,
        );
        let workbook = zip_parts(&[
            (WORKBOOK_PART, workbook_xml),
            (WORKBOOK_RELS_PART, rels_xml),
            ("xl/worksheets/sheet1.xml", &scratch),
            ("xl/worksheets/sheet2.xml", &stores),
        ]);

        let rows = parse_rows(&workbook, SourceFormat::Xlsx).unwrap();
        assert_eq!(rows[0].text("Address").as_deref(), Some("1 Main St"));
        assert!(rows[0].get("Notes").is_none());
    }

    #[test]
    fn skips_phonetic_readings_in_shared_strings() {
        let shared = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><si><t>住所</t><rPh sb="0" eb="2"><t>ジュウショ</t></rPh></si><si><t>東京都千代田区</t><rPh sb="0" eb="3"><t>トウキョウト</t></rPh></si></sst>"#;
        let sheet = sheet_with_cells(
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row><row r="2"><c r="A2" t="s"><v>1</v></c></row>"#,
        );
        let workbook = zip_parts(&[
            (SHARED_STRINGS_PART, shared),
            ("xl/worksheets/sheet1.xml", &sheet),
        ]);

        let rows = parse_rows(&workbook, SourceFormat::Xlsx).unwrap();
        assert_eq!(rows[0].text("住所").as_deref(), Some("東京都千代田区"));
    }
}
