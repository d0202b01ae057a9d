//! Snapshot files.
//!
//! One CSV file per object: a header row of field names, then one row per
//! record. Quoting follows the usual rules (fields containing the delimiter,
//! a quote or a newline are quoted, embedded quotes doubled).

use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::debug;

use crate::core::record::{flatten, Record};
use crate::error::{MigrateError, Result};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// A snapshot file loaded into memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Index of a column, case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
    }

    /// Non-empty values of a column.
    pub fn column(&self, name: &str) -> Vec<String> {
        let Some(idx) = self.column_index(name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(idx))
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }
}

/// Write records to `path`.
///
/// Columns are `fields` in the given order, followed by any additional
/// flattened columns in first-seen order. Returns the number of rows written.
pub fn write_records(path: &Path, records: &[Record], fields: &[String]) -> Result<usize> {
    let flattened: Vec<Vec<(String, String)>> = records.iter().map(flatten).collect();

    let mut headers: Vec<String> = Vec::new();
    for name in fields
        .iter()
        .cloned()
        .chain(flattened.iter().flatten().map(|(k, _)| k.clone()))
    {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(&name)) {
            headers.push(name);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record(&headers)?;
    for row in &flattened {
        let values = headers.iter().map(|h| {
            row.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(h))
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        });
        writer.write_record(values)?;
    }
    writer.flush()?;

    debug!("Wrote {} rows to {}", flattened.len(), path.display());
    Ok(flattened.len())
}

/// Read a snapshot file.
pub fn read_table(path: &Path) -> Result<Table> {
    let bytes = std::fs::read(path)?;
    let (table, _) = parse_lenient(&bytes)?;
    Ok(table)
}

/// What [`repair_copy`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub rows: usize,
    pub bom_stripped: bool,
    pub padded_rows: usize,
    pub truncated_rows: usize,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        self.bom_stripped || self.padded_rows > 0 || self.truncated_rows > 0
    }
}

/// Copy a snapshot file to `dest`, stripping a byte-order mark and padding or
/// truncating rows whose field count differs from the header.
pub fn repair_copy(src: &Path, dest: &Path) -> Result<RepairReport> {
    let bytes = std::fs::read(src)?;
    let (table, mut report) = parse_lenient(&bytes)?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().from_path(dest)?;
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;

    report.rows = table.rows.len();
    Ok(report)
}

fn parse_lenient(bytes: &[u8]) -> Result<(Table, RepairReport)> {
    let mut report = RepairReport::default();
    let body = match bytes.strip_prefix(UTF8_BOM) {
        Some(rest) => {
            report.bom_stripped = true;
            rest
        }
        None => bytes,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(String::is_empty) {
        return Err(MigrateError::Config(
            "Snapshot file has no header row".to_string(),
        ));
    }

    let width = headers.len();
    let mut rows = Vec::new();
    let mut record = StringRecord::new();
    while reader.read_record(&mut record)? {
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        if row.len() == 1 && row[0].is_empty() && width > 1 {
            continue;
        }
        if row.len() < width {
            report.padded_rows += 1;
            row.resize(width, String::new());
        } else if row.len() > width {
            report.truncated_rows += 1;
            row.truncate(width);
        }
        rows.push(row);
    }

    Ok((Table { headers, rows }, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_write_and_read_with_quoting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Rule.csv");
        let records = vec![
            record(json!({
                "attributes": {"type": "Rule"},
                "Id": "t1",
                "Name": "Rule, \"quoted\"",
                "Notes": "line1\nline2"
            })),
            record(json!({"Id": "t2", "Name": "Plain", "Notes": null})),
        ];
        let written =
            write_records(&path, &records, &["Id".to_string(), "Name".to_string()]).unwrap();
        assert_eq!(written, 2);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("Id,Name,Notes\n"));
        assert!(raw.contains("\"Rule, \"\"quoted\"\"\""));

        let table = read_table(&path).unwrap();
        assert_eq!(table.headers, vec!["Id", "Name", "Notes"]);
        assert_eq!(table.rows[0][1], "Rule, \"quoted\"");
        assert_eq!(table.rows[0][2], "line1\nline2");
        assert_eq!(table.rows[1][2], "");
        assert_eq!(table.column("id"), vec!["t1", "t2"]);
    }

    #[test]
    fn test_nested_relationship_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("RuleLine.csv");
        let records = vec![record(json!({
            "Id": "l1",
            "Rule": {"attributes": {"type": "Rule"}, "Name": "R1"},
            "LineIndex": 1
        }))];
        write_records(&path, &records, &[]).unwrap();
        let table = read_table(&path).unwrap();
        assert_eq!(table.headers, vec!["Id", "Rule.Name", "LineIndex"]);
        assert_eq!(table.rows[0], vec!["l1", "R1", "1"]);
    }

    #[test]
    fn test_repair_strips_bom_and_fixes_ragged_rows() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.csv");
        let dest = dir.path().join("out").join("Rule.csv");
        let mut content = UTF8_BOM.to_vec();
        content.extend_from_slice(b"Id,Name,Active\nt1,R1\nt2,R2,true,extra\nt3,R3,false\n");
        std::fs::write(&src, content).unwrap();

        let report = repair_copy(&src, &dest).unwrap();
        assert!(report.bom_stripped);
        assert_eq!(report.padded_rows, 1);
        assert_eq!(report.truncated_rows, 1);
        assert_eq!(report.rows, 3);
        assert!(report.changed());

        let repaired = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(repaired, "Id,Name,Active\nt1,R1,\nt2,R2,true\nt3,R3,false\n");
    }

    #[test]
    fn test_clean_file_unchanged() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.csv");
        std::fs::write(&src, "Id\nt1\n").unwrap();
        let report = repair_copy(&src, &dir.path().join("out.csv")).unwrap();
        assert!(!report.changed());
        assert_eq!(report.rows, 1);
    }
}
