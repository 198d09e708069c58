//! Source readers: raw files into string-typed tabular datasets.
//!
//! No coercion happens here. Column names and cell values are trimmed,
//! fully empty rows are skipped, and every row remembers the 1-based line it
//! came from so drops and quality samples can point back at the file.

use crate::error::{PipelineError, Result};
use calamine::{open_workbook_auto, Data, ExcelDateTime, Range, Reader};
use chrono::{Duration, NaiveDateTime, Timelike};
use std::path::Path;
use tokio::fs;

/// One raw row. `line` is the 1-based line (or sheet row) in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub line: usize,
    pub values: Vec<String>,
}

impl Row {
    /// Cell at `idx`, or `""` when a short row does not reach it.
    pub fn get(&self, idx: usize) -> &str {
        self.values.get(idx).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name.trim())
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column(name).ok_or_else(|| PipelineError::MissingColumn {
            dataset: self.name.clone(),
            column: name.to_string(),
            found: self.headers.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Detect spreadsheet sources by extension.
fn is_workbook(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("xls" | "xlsx" | "xlsm" | "xlsb" | "ods")
    )
}

fn dataset_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset")
        .to_string()
}

fn source_error(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::SourceRead {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Read a raw source. Delimited text unless the extension says workbook.
pub async fn read_source(path: &Path, delimiter: u8) -> Result<Dataset> {
    if is_workbook(path) {
        return read_workbook(path);
    }
    let bytes = fs::read(path)
        .await
        .map_err(|e| source_error(path, e.to_string()))?;
    parse_delimited(path, &bytes, delimiter)
}

/// Decode raw bytes. UTF-8 (BOM stripped) when valid, Windows-1252 otherwise.
fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// Parse delimited text into a dataset.
pub fn parse_delimited(path: &Path, bytes: &[u8], delimiter: u8) -> Result<Dataset> {
    let content = decode(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| source_error(path, format!("unreadable header: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| source_error(path, e.to_string()))?;
        if record.iter().all(|v| v.is_empty()) {
            continue;
        }
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 2);
        rows.push(Row {
            line,
            values: record.iter().map(str::to_string).collect(),
        });
    }

    finish(path, headers, rows)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::DateTime(dt) => excel_datetime_text(dt).unwrap_or_else(|| dt.as_f64().to_string()),
        Data::DateTimeIso(s) => s.trim().replacen('T', " ", 1),
        Data::DurationIso(s) => iso_duration_text(s.trim()).unwrap_or_else(|| s.trim().to_string()),
        other => other.to_string().trim().to_string(),
    }
}

fn clock_text(total_seconds: i64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3600,
        total_seconds % 3600 / 60,
        total_seconds % 60
    )
}

/// Nearest whole second; serial day fractions rarely land exactly on one.
fn round_to_second(stamp: NaiveDateTime) -> Option<NaiveDateTime> {
    let base = stamp.with_nanosecond(0)?;
    if stamp.nanosecond() >= 500_000_000 {
        Some(base + Duration::seconds(1))
    } else {
        Some(base)
    }
}

/// Render an Excel serial the way the text sources write it: a time of day
/// below 1.0, a bare date at midnight, a full timestamp otherwise.
fn excel_datetime_text(dt: &ExcelDateTime) -> Option<String> {
    if dt.is_duration() {
        return Some(clock_text((dt.as_f64() * 86_400.0).round() as i64));
    }
    let stamp = round_to_second(dt.as_datetime()?)?;
    let text = if dt.as_f64() < 1.0 {
        stamp.format("%H:%M:%S").to_string()
    } else if stamp.num_seconds_from_midnight() == 0 {
        stamp.format("%Y-%m-%d").to_string()
    } else {
        stamp.format("%Y-%m-%d %H:%M:%S").to_string()
    };
    Some(text)
}

/// `PT8H30M15S` style durations (ODS time cells) as `08:30:15`.
fn iso_duration_text(raw: &str) -> Option<String> {
    let body = raw.strip_prefix("PT")?;
    let mut seconds = 0f64;
    let mut number = String::new();
    for c in body.chars() {
        match c {
            'H' | 'M' | 'S' => {
                let value: f64 = number.parse().ok()?;
                number.clear();
                seconds += value
                    * match c {
                        'H' => 3600.0,
                        'M' => 60.0,
                        _ => 1.0,
                    };
            }
            _ => number.push(c),
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(clock_text(seconds.round() as i64))
}

/// Read the first sheet of a workbook; its first row is the header.
pub fn read_workbook(path: &Path) -> Result<Dataset> {
    if !path.exists() {
        return Err(source_error(path, "file not found"));
    }
    let mut workbook = open_workbook_auto(path).map_err(|e| source_error(path, e.to_string()))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| source_error(path, "workbook has no sheets"))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| source_error(path, e.to_string()))?;

    sheet_dataset(path, &range)
}

fn sheet_dataset(path: &Path, range: &Range<Data>) -> Result<Dataset> {
    let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);
    let mut sheet_rows = range.rows();
    let headers: Vec<String> = match sheet_rows.next() {
        Some(cells) => cells.iter().map(cell_text).collect(),
        None => return Err(source_error(path, "sheet is empty")),
    };

    let rows = sheet_rows
        .enumerate()
        .map(|(idx, cells)| Row {
            line: first_row + idx + 2,
            values: cells.iter().map(cell_text).collect(),
        })
        .filter(|row| row.values.iter().any(|v| !v.is_empty()))
        .collect();

    finish(path, headers, rows)
}

fn finish(path: &Path, headers: Vec<String>, rows: Vec<Row>) -> Result<Dataset> {
    if rows.is_empty() {
        return Err(source_error(path, "no data rows"));
    }
    let dataset = Dataset {
        name: dataset_name(path),
        headers,
        rows,
    };
    log::info!(
        "read {}: {} rows x {} columns",
        path.display(),
        dataset.len(),
        dataset.headers.len()
    );
    Ok(dataset)
}

#[cfg(test)]
pub(crate) fn dataset(name: &str, text: &str) -> Dataset {
    parse_delimited(Path::new(name), text.as_bytes(), b'|').unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::clean_productivity;
    use crate::config::PipelineConfig;
    use calamine::ExcelDateTimeType;
    use rust_decimal::Decimal;

    // -------------------------------------------------------------------------
    // DELIMITED PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_headers_are_trimmed() {
        let ds = dataset("products.csv", " Product |Min batch time \nP1|100\n");
        assert_eq!(ds.headers, vec!["Product", "Min batch time"]);
        assert_eq!(ds.name, "products");
        assert_eq!(ds.column("Min batch time"), Some(1));
    }

    #[test]
    fn test_values_stay_strings() {
        let ds = dataset("x.csv", "Batch|Factor 1\n0101| 20.50 \n");
        assert_eq!(ds.rows[0].get(0), "0101");
        assert_eq!(ds.rows[0].get(1), "20.50");
    }

    #[test]
    fn test_line_numbers_skip_blank_rows() {
        let ds = dataset("x.csv", "A|B\n1|2\n|\n3|4\n");
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows[0].line, 2);
        assert_eq!(ds.rows[1].line, 4);
    }

    #[test]
    fn test_short_rows_read_as_empty() {
        let ds = dataset("x.csv", "A|B|C\n1|2\n");
        assert_eq!(ds.rows[0].get(2), "");
        assert_eq!(ds.rows[0].get(99), "");
    }

    #[test]
    fn test_bom_is_stripped() {
        let ds = parse_delimited(Path::new("x.csv"), "\u{feff}Batch|Factor 1\n1|2\n".as_bytes(), b'|')
            .unwrap();
        assert_eq!(ds.headers[0], "Batch");
    }

    #[test]
    fn test_windows_1252_fallback() {
        // "Operador Núñez" in Windows-1252
        let bytes = b"Operator\nOperador N\xfa\xf1ez\n";
        let ds = parse_delimited(Path::new("x.csv"), bytes, b'|').unwrap();
        assert_eq!(ds.rows[0].get(0), "Operador Núñez");
    }

    #[test]
    fn test_custom_delimiter() {
        let ds = parse_delimited(Path::new("x.csv"), b"A;B\n1;2\n", b';').unwrap();
        assert_eq!(ds.headers, vec!["A", "B"]);
        assert_eq!(ds.rows[0].get(1), "2");
    }

    // -------------------------------------------------------------------------
    // SOURCE READ ERRORS
    // -------------------------------------------------------------------------

    #[test]
    fn test_header_only_is_source_error() {
        let result = parse_delimited(Path::new("empty.csv"), b"Batch|Factor 1\n", b'|');
        assert!(matches!(result, Err(PipelineError::SourceRead { .. })));
    }

    #[test]
    fn test_missing_column_reports_found_headers() {
        let ds = dataset("x.csv", "A|B\n1|2\n");
        match ds.require_column("Batch") {
            Err(PipelineError::MissingColumn { column, found, .. }) => {
                assert_eq!(column, "Batch");
                assert_eq!(found, vec!["A", "B"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_source_error() {
        let result = read_source(Path::new("/nonexistent/line-downtime.csv"), b'|').await;
        assert!(matches!(result, Err(PipelineError::SourceRead { .. })));
    }

    #[tokio::test]
    async fn test_missing_workbook_is_source_error() {
        let result = read_source(Path::new("/nonexistent/products.xlsx"), b'|').await;
        assert!(matches!(result, Err(PipelineError::SourceRead { .. })));
    }

    #[tokio::test]
    async fn test_read_source_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.csv");
        std::fs::write(&path, "Product|Min batch time\nP1|100\nP2|60\n").unwrap();

        let ds = read_source(&path, b'|').await.unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows[1].get(0), "P2");
    }

    // -------------------------------------------------------------------------
    // WORKBOOK CELLS
    // -------------------------------------------------------------------------

    fn serial(value: f64) -> Data {
        Data::DateTime(ExcelDateTime::new(value, ExcelDateTimeType::DateTime, false))
    }

    #[test]
    fn test_excel_serials_render_like_text_sources() {
        assert_eq!(cell_text(&serial(45292.0)), "2024-01-01");
        assert_eq!(cell_text(&serial(8.0 / 24.0)), "08:00:00");
        assert_eq!(cell_text(&serial(45292.0 + 23.5 / 24.0)), "2024-01-01 23:30:00");
        assert_eq!(
            cell_text(&Data::DateTime(ExcelDateTime::new(
                1.25,
                ExcelDateTimeType::TimeDelta,
                false
            ))),
            "30:00:00"
        );
    }

    #[test]
    fn test_iso_cells() {
        assert_eq!(cell_text(&Data::DateTimeIso("2024-01-01T08:15:00".into())), "2024-01-01 08:15:00");
        assert_eq!(cell_text(&Data::DurationIso("PT8H30M15S".into())), "08:30:15");
        assert_eq!(cell_text(&Data::DurationIso("P1D".into())), "P1D");
    }

    #[test]
    fn test_workbook_sheet_feeds_productivity_cleaner() {
        let headers = ["Date", "Product", "Batch", "Operator", "Start Time", "End Time"];
        let mut range = Range::new((0, 0), (2, 5));
        for (col, h) in headers.iter().enumerate() {
            range.set_value((0, col as u32), Data::String(h.to_string()));
        }
        let cells = [
            (serial(45292.0), 101.0, 8.0, 10.0),
            (serial(45292.0), 102.0, 23.5, 0.25),
        ];
        for (i, (date, batch, start, end)) in cells.into_iter().enumerate() {
            let r = i as u32 + 1;
            range.set_value((r, 0), date);
            range.set_value((r, 1), Data::String("P1".into()));
            range.set_value((r, 2), Data::Float(batch));
            range.set_value((r, 3), Data::String("Alice".into()));
            range.set_value((r, 4), serial(start / 24.0));
            range.set_value((r, 5), serial(end / 24.0));
        }

        let ds = sheet_dataset(Path::new("line-productivity.xlsx"), &range).unwrap();
        assert_eq!(ds.rows[0].values, vec!["2024-01-01", "P1", "101", "Alice", "08:00:00", "10:00:00"]);

        let table = clean_productivity(&ds, &PipelineConfig::default()).unwrap();
        assert!(table.drops.is_empty());
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].duration_minutes, Decimal::from(120));
        assert_eq!(table.rows[1].duration_minutes, Decimal::from(45));
    }

    #[test]
    fn test_is_workbook() {
        assert!(is_workbook(Path::new("a/products.xlsx")));
        assert!(is_workbook(Path::new("a/products.XLS")));
        assert!(!is_workbook(Path::new("a/products.csv")));
    }
}
