//! Workbook artifact layer: report region read/write + watermark store.

use std::path::{Path, PathBuf};

use calamine::{open_workbook, Data, Reader, Xlsx};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use ors_core::{CellValue, ReportRow, ReportSchema};
use rust_xlsxwriter::{
    Format, FormatAlign, Table, TableColumn, TableStyle, Workbook,
};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ors-report";

pub const REPORT_SHEET: &str = "report";
pub const META_SHEET: &str = "meta";
const WATERMARK_HEADER: &str = "last_sync";

const MIN_COLUMN_WIDTH: usize = 10;
const MAX_COLUMN_WIDTH: usize = 60;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reading workbook: {0}")]
    Read(#[from] calamine::XlsxError),
    #[error("writing workbook: {0}")]
    Write(#[from] rust_xlsxwriter::XlsxError),
    #[error("report header does not match the expected schema (expected [{expected}], found [{found}])")]
    SchemaMismatch { expected: String, found: String },
}

/// One per-account `.xlsx` artifact on local disk.
///
/// The workbook holds exactly two regions: the `report` sheet (header row +
/// one data row per order, unique by key) and the hidden `meta` sheet with a
/// single watermark timestamp. Every write is a full replacement of both.
#[derive(Debug, Clone)]
pub struct ReportWorkbook {
    path: PathBuf,
}

impl ReportWorkbook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Whether a report region exists at all. A missing or unreadable file
    /// counts as "no report" and forces a full rebuild upstream.
    pub fn has_report_sheet(&self) -> bool {
        let Ok(workbook) = open_workbook::<Xlsx<_>, _>(&self.path) else {
            return false;
        };
        workbook.sheet_names().iter().any(|s| s == REPORT_SHEET)
    }

    /// Read the current report rows in sheet order.
    ///
    /// Cells are read positionally in the schema's column order, so the
    /// persisted header row is verified against the schema first; a mismatch
    /// is an error rather than silently shifted data.
    pub fn read_rows(&self, schema: &ReportSchema) -> Result<Vec<ReportRow>, ReportError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut workbook: Xlsx<_> = open_workbook(&self.path)?;
        if !workbook.sheet_names().iter().any(|s| s == REPORT_SHEET) {
            return Ok(Vec::new());
        }
        let range = workbook.worksheet_range(REPORT_SHEET)?;
        let mut sheet_rows = range.rows();
        let Some(header) = sheet_rows.next() else {
            return Ok(Vec::new());
        };
        verify_header(header, schema)?;

        let mut rows = Vec::new();
        for cells in sheet_rows {
            let mut row = ReportRow::new();
            for (idx, column) in schema.columns().iter().enumerate() {
                let value = cells
                    .get(idx)
                    .map(cell_from_data)
                    .unwrap_or(CellValue::Empty);
                row.set(column.clone(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Read the watermark, tolerating any absence or parse failure as `None`.
    pub fn read_last_sync(&self) -> Option<DateTime<Utc>> {
        if !self.path.exists() {
            return None;
        }
        let mut workbook: Xlsx<_> = open_workbook(&self.path).ok()?;
        if !workbook.sheet_names().iter().any(|s| s == META_SHEET) {
            return None;
        }
        let range = workbook.worksheet_range(META_SHEET).ok()?;
        // header in A1, value in A2
        match range.get_value((1, 0))? {
            Data::String(raw) => {
                let parsed = parse_watermark(raw);
                if parsed.is_none() {
                    warn!(value = %raw, "unparseable watermark value, treating as absent");
                }
                parsed
            }
            Data::DateTime(dt) => dt.as_datetime().map(|ndt| ndt.and_utc()),
            _ => None,
        }
    }

    /// Replace the full artifact: report region, presentation, watermark.
    ///
    /// Rows land in the given order, one cell per schema column. The header
    /// row is frozen, the data range becomes a styled table, column widths
    /// fit the widest rendered value (clamped), date columns are left-aligned
    /// and technical columns are hidden without losing their data. The meta
    /// sheet is rewritten with the watermark, hidden, and protected.
    pub fn write(
        &self,
        schema: &ReportSchema,
        rows: &[ReportRow],
        last_sync: DateTime<Utc>,
    ) -> Result<(), ReportError> {
        let mut workbook = Workbook::new();

        let sheet = workbook.add_worksheet();
        sheet.set_name(REPORT_SHEET)?;
        for (col, name) in schema.columns().iter().enumerate() {
            sheet.write_string(0, col as u16, name.as_str())?;
        }

        let left_aligned = Format::new().set_align(FormatAlign::Left);
        for (r, row) in rows.iter().enumerate() {
            let row_idx = (r + 1) as u32;
            for (c, name) in schema.columns().iter().enumerate() {
                let col_idx = c as u16;
                match row.get(name) {
                    Some(CellValue::Text(text)) if schema.is_date_column(name) => {
                        sheet.write_string_with_format(
                            row_idx,
                            col_idx,
                            text.as_str(),
                            &left_aligned,
                        )?;
                    }
                    Some(CellValue::Text(text)) => {
                        sheet.write_string(row_idx, col_idx, text.as_str())?;
                    }
                    Some(CellValue::Number(number)) => {
                        sheet.write_number(row_idx, col_idx, *number)?;
                    }
                    Some(CellValue::Empty) | None => {}
                }
            }
        }

        sheet.set_freeze_panes(1, 0)?;
        if !rows.is_empty() {
            let table_columns: Vec<TableColumn> = schema
                .columns()
                .iter()
                .map(|name| TableColumn::new().set_header(name.as_str()))
                .collect();
            let table = Table::new()
                .set_name("ReportTable")
                .set_style(TableStyle::Medium9)
                .set_columns(&table_columns);
            sheet.add_table(
                0,
                0,
                rows.len() as u32,
                (schema.columns().len() - 1) as u16,
                &table,
            )?;
        }

        for (c, name) in schema.columns().iter().enumerate() {
            let col_idx = c as u16;
            let cells = rows
                .iter()
                .map(|row| row.get(name).map(CellValue::rendered).unwrap_or_default());
            sheet.set_column_width(col_idx, fitted_width(name, cells))?;
            if schema.is_hidden_column(name) {
                sheet.set_column_hidden(col_idx)?;
            }
        }

        let meta = workbook.add_worksheet();
        meta.set_name(META_SHEET)?;
        meta.write_string(0, 0, WATERMARK_HEADER)?;
        let stamp = last_sync.to_rfc3339_opts(SecondsFormat::Secs, true);
        meta.write_string(1, 0, stamp.as_str())?;
        meta.set_hidden(true);
        meta.protect();

        workbook.save(&self.path)?;
        debug!(path = %self.path.display(), rows = rows.len(), "wrote report workbook");
        Ok(())
    }
}

fn verify_header(header: &[Data], schema: &ReportSchema) -> Result<(), ReportError> {
    let found: Vec<String> = header
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    if found != schema.columns() {
        return Err(ReportError::SchemaMismatch {
            expected: schema.columns().join(", "),
            found: found.join(", "),
        });
    }
    Ok(())
}

fn cell_from_data(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Text(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|ndt| CellValue::Text(ndt.to_string()))
            .unwrap_or(CellValue::Empty),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(_) => CellValue::Empty,
    }
}

fn parse_watermark(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ndt| ndt.and_utc())
}

fn fitted_width(header: &str, cells: impl Iterator<Item = String>) -> f64 {
    let mut max_len = header.chars().count();
    for rendered in cells {
        max_len = max_len.max(rendered.chars().count());
    }
    (max_len + 2).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ors_core::{CREATED_COLUMN, KEY_COLUMN};
    use tempfile::tempdir;

    fn mk_row(key: &str, created: &str, reference: &str) -> ReportRow {
        let mut row = ReportRow::new();
        row.set(KEY_COLUMN, key);
        row.set(CREATED_COLUMN, created);
        row.set("REF", reference);
        row.set("Confirmed ETD", "NO");
        row.set("ETD (fecha)", created);
        row
    }

    #[test]
    fn round_trips_rows_through_the_report_sheet() {
        let dir = tempdir().expect("tempdir");
        let book = ReportWorkbook::new(dir.path().join("acme.xlsx"));
        let schema = ReportSchema::current();
        let rows = vec![
            mk_row("65f0aa11bb22cc33dd44ee55", "2024-01-02", "MGP-1"),
            mk_row("65f0aa11bb22cc33dd44ee56", "2024-01-03", "MGP-2"),
        ];
        let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap();

        book.write(&schema, &rows, stamp).expect("write");
        assert!(book.has_report_sheet());
        let read = book.read_rows(&schema).expect("read");
        assert_eq!(read, rows);
    }

    #[test]
    fn numbers_survive_the_round_trip() {
        let dir = tempdir().expect("tempdir");
        let book = ReportWorkbook::new(dir.path().join("acme.xlsx"));
        let schema = ReportSchema::current();
        let mut row = mk_row("65f0aa11bb22cc33dd44ee55", "2024-01-02", "MGP-1");
        row.set("Booking", 1042.5);
        let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap();

        book.write(&schema, &[row.clone()], stamp).expect("write");
        let read = book.read_rows(&schema).expect("read");
        assert_eq!(read, vec![row]);
    }

    #[test]
    fn watermark_round_trips_and_is_absent_before_any_write() {
        let dir = tempdir().expect("tempdir");
        let book = ReportWorkbook::new(dir.path().join("acme.xlsx"));
        assert_eq!(book.read_last_sync(), None);

        let schema = ReportSchema::current();
        let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).single().unwrap();
        book.write(&schema, &[], stamp).expect("write");
        assert_eq!(book.read_last_sync(), Some(stamp));
    }

    #[test]
    fn missing_artifact_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let book = ReportWorkbook::new(dir.path().join("nope.xlsx"));
        assert!(!book.exists());
        assert!(!book.has_report_sheet());
        let rows = book.read_rows(&ReportSchema::current()).expect("read");
        assert!(rows.is_empty());
    }

    #[test]
    fn workbook_without_report_sheet_is_detected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("meta-only.xlsx");
        let mut workbook = Workbook::new();
        let meta = workbook.add_worksheet();
        meta.set_name(META_SHEET).expect("name");
        meta.write_string(0, 0, WATERMARK_HEADER).expect("header");
        meta.write_string(1, 0, "2024-06-01T12:00:00Z").expect("value");
        workbook.save(&path).expect("save");

        let book = ReportWorkbook::new(&path);
        assert!(!book.has_report_sheet());
        // meta alone still yields a readable watermark; the caller decides
        // that a missing report region forces a full rebuild regardless.
        assert!(book.read_last_sync().is_some());
    }

    #[test]
    fn mismatched_header_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("drifted.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(REPORT_SHEET).expect("name");
        sheet.write_string(0, 0, "REF").expect("header");
        sheet.write_string(0, 1, "Totally different").expect("header");
        sheet.write_string(1, 0, "MGP-1").expect("cell");
        workbook.save(&path).expect("save");

        let book = ReportWorkbook::new(&path);
        let err = book
            .read_rows(&ReportSchema::current())
            .expect_err("should reject drifted header");
        assert!(matches!(err, ReportError::SchemaMismatch { .. }));
    }

    #[test]
    fn corrupt_watermark_reads_as_absent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad-meta.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(REPORT_SHEET).expect("name");
        sheet.write_string(0, 0, "REF").expect("header");
        let meta = workbook.add_worksheet();
        meta.set_name(META_SHEET).expect("name");
        meta.write_string(0, 0, WATERMARK_HEADER).expect("header");
        meta.write_string(1, 0, "not a timestamp").expect("value");
        workbook.save(&path).expect("save");

        assert_eq!(ReportWorkbook::new(&path).read_last_sync(), None);
    }
}
