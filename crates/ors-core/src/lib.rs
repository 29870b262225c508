//! Core domain model and report-row projection for ORS.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ors-core";

/// Scalar value carried by a source record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Null,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Timestamp value, or a textual value parsed as RFC 3339 / ISO date.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Text(s) => parse_datetime_like(s),
            _ => None,
        }
    }
}

fn parse_datetime_like(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    None
}

/// One leg of a shipment route. Only the stop name survives projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stopover {
    pub name: Option<String>,
}

/// Source-of-truth order record, projected to the fields the report consumes.
///
/// Business fields keep their store-side names inside `fields`; the three
/// lifecycle values the sync pipeline itself depends on are typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stopovers: Vec<Stopover>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl OrderRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Scalar cell of a report row. `Empty` never materializes in the row map;
/// setting it clears the column, so an absent entry and a blank cell are the
/// same thing on both the write and the read side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Empty,
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The value as it renders in a cell, used for column width fitting.
    pub fn rendered(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => format!("{n}"),
            Self::Empty => String::new(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Option<String>> for CellValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(s) => Self::Text(s),
            None => Self::Empty,
        }
    }
}

/// Flat report row: column name → cell value, keyed by [`KEY_COLUMN`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    values: BTreeMap<String, CellValue>,
}

impl ReportRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<CellValue>) {
        let column = column.into();
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&column);
        } else {
            self.values.insert(column, value);
        }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }

    /// Stable row key (the record id), if the row carries one.
    pub fn key(&self) -> Option<&str> {
        self.get(KEY_COLUMN).and_then(CellValue::as_text)
    }

    /// Creation marker used for report ordering (ISO date as text).
    pub fn created_at(&self) -> Option<&str> {
        self.get(CREATED_COLUMN).and_then(CellValue::as_text)
    }
}

pub const KEY_COLUMN: &str = "orderId";
pub const CREATED_COLUMN: &str = "__createdAt";
pub const UPDATED_COLUMN: &str = "__lastUpdateAt";

pub const REPORT_COLUMNS_VISIBLE: [&str; 13] = [
    "REF",
    "ETD (fecha)",
    "Confirmed ETD",
    "ETA (fecha)",
    "Confirmed ETA",
    "Booking",
    "MBL",
    "POL",
    "T/S",
    "POD",
    "Final destination",
    "ISF",
    "Fecha de ISF",
];

pub const TECH_COLUMNS: [&str; 3] = [KEY_COLUMN, CREATED_COLUMN, UPDATED_COLUMN];

pub const DATE_COLUMNS: [&str; 3] = ["ETD (fecha)", "ETA (fecha)", "Fecha de ISF"];

/// Canonical column order of the report region. Reader and writer must agree
/// on one schema for the life of an account's report; the reader verifies the
/// persisted header row against this list before trusting cell positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSchema {
    columns: Vec<String>,
}

impl ReportSchema {
    pub fn current() -> Self {
        let columns = REPORT_COLUMNS_VISIBLE
            .iter()
            .chain(TECH_COLUMNS.iter())
            .map(|c| c.to_string())
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_date_column(&self, name: &str) -> bool {
        DATE_COLUMNS.contains(&name)
    }

    /// Technical columns carry data but stay hidden from view.
    pub fn is_hidden_column(&self, name: &str) -> bool {
        TECH_COLUMNS.contains(&name)
    }
}

impl Default for ReportSchema {
    fn default() -> Self {
        Self::current()
    }
}

/// `"YES"`/`"NO"` rendering of a boolean flag; absent flags read as `"NO"`.
pub fn yes_no(value: Option<&FieldValue>) -> &'static str {
    if value.and_then(FieldValue::as_bool).unwrap_or(false) {
        "YES"
    } else {
        "NO"
    }
}

/// Calendar date (time of day discarded) of a datetime-like field value.
pub fn format_date_ymd(value: Option<&FieldValue>) -> Option<String> {
    value
        .and_then(FieldValue::as_datetime)
        .map(|dt| dt.date_naive().to_string())
}

/// Name of the first stopover, if the record has any.
pub fn first_stopover_name(record: &OrderRecord) -> Option<&str> {
    record
        .stopovers
        .first()
        .and_then(|stop| stop.name.as_deref())
}

fn text_field(record: &OrderRecord, name: &str) -> CellValue {
    record
        .field(name)
        .and_then(FieldValue::as_text)
        .map(|s| CellValue::Text(s.to_string()))
        .unwrap_or(CellValue::Empty)
}

/// Project one order record onto one report row.
///
/// Pure and total: a record with no id yields a row with an empty key cell,
/// which the reconciliation path drops rather than merges.
pub fn map_order_to_row(record: &OrderRecord) -> ReportRow {
    let mut row = ReportRow::new();
    row.set("REF", text_field(record, "number"));
    row.set("ETD (fecha)", format_date_ymd(record.field("dateETD")));
    row.set("Confirmed ETD", yes_no(record.field("isBookingConfirmed")));
    row.set("ETA (fecha)", format_date_ymd(record.field("dateETA")));
    row.set("Confirmed ETA", yes_no(record.field("isConfirmBLReceived")));
    row.set("Booking", text_field(record, "bookingNumber"));
    // MBL ships under the booking number until a dedicated field exists.
    row.set("MBL", text_field(record, "bookingNumber"));
    row.set("POL", text_field(record, "origin"));
    row.set("T/S", first_stopover_name(record).map(str::to_string));
    row.set("POD", text_field(record, "destination"));
    row.set("Final destination", text_field(record, "destination"));
    row.set("ISF", yes_no(record.field("isISF")));
    row.set("Fecha de ISF", format_date_ymd(record.field("dateISF")));
    row.set(KEY_COLUMN, record.id.clone());
    row.set(
        CREATED_COLUMN,
        record.created_at.map(|dt| dt.date_naive().to_string()),
    );
    row.set(
        UPDATED_COLUMN,
        record.updated_at.map(|dt| dt.date_naive().to_string()),
    );
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record_with(fields: Vec<(&str, FieldValue)>) -> OrderRecord {
        OrderRecord {
            id: Some("65f0aa11bb22cc33dd44ee55".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 3, 12, 16, 45, 9).single(),
            updated_at: Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).single(),
            stopovers: Vec::new(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn schema_has_visible_then_technical_columns() {
        let schema = ReportSchema::current();
        assert_eq!(schema.columns().len(), 16);
        assert_eq!(schema.columns()[0], "REF");
        assert_eq!(schema.columns()[13], KEY_COLUMN);
        assert!(schema.is_hidden_column(CREATED_COLUMN));
        assert!(!schema.is_hidden_column("REF"));
        assert!(schema.is_date_column("ETD (fecha)"));
        assert!(!schema.is_date_column("Booking"));
    }

    #[test]
    fn mapping_renders_flags_and_dates() {
        let record = record_with(vec![
            ("number", FieldValue::Text("MGP-1001".into())),
            (
                "dateETD",
                FieldValue::Timestamp(
                    Utc.with_ymd_and_hms(2024, 5, 20, 23, 59, 58).single().unwrap(),
                ),
            ),
            ("isBookingConfirmed", FieldValue::Bool(true)),
            ("isISF", FieldValue::Bool(false)),
            ("bookingNumber", FieldValue::Text("BKG-77".into())),
            ("origin", FieldValue::Text("Shanghai".into())),
            ("destination", FieldValue::Text("Veracruz".into())),
        ]);

        let row = map_order_to_row(&record);
        assert_eq!(row.get("REF"), Some(&CellValue::Text("MGP-1001".into())));
        // time of day is discarded
        assert_eq!(
            row.get("ETD (fecha)"),
            Some(&CellValue::Text("2024-05-20".into()))
        );
        assert_eq!(
            row.get("Confirmed ETD"),
            Some(&CellValue::Text("YES".into()))
        );
        // absent flag reads as NO
        assert_eq!(
            row.get("Confirmed ETA"),
            Some(&CellValue::Text("NO".into()))
        );
        assert_eq!(row.get("ISF"), Some(&CellValue::Text("NO".into())));
        assert_eq!(row.get("MBL"), row.get("Booking"));
        assert_eq!(row.key(), Some("65f0aa11bb22cc33dd44ee55"));
        assert_eq!(row.created_at(), Some("2024-03-12"));
    }

    #[test]
    fn mapping_without_id_yields_empty_key() {
        let mut record = record_with(vec![]);
        record.id = None;
        let row = map_order_to_row(&record);
        assert_eq!(row.key(), None);
    }

    #[test]
    fn first_stopover_handles_absent_and_empty_lists() {
        let mut record = record_with(vec![]);
        assert_eq!(first_stopover_name(&record), None);

        record.stopovers = vec![Stopover { name: None }];
        assert_eq!(first_stopover_name(&record), None);

        record.stopovers = vec![
            Stopover {
                name: Some("Busan".into()),
            },
            Stopover {
                name: Some("Manzanillo".into()),
            },
        ];
        assert_eq!(first_stopover_name(&record), Some("Busan"));
        let row = map_order_to_row(&record);
        assert_eq!(row.get("T/S"), Some(&CellValue::Text("Busan".into())));
    }

    #[test]
    fn textual_timestamps_still_render_as_dates() {
        let record = record_with(vec![(
            "dateISF",
            FieldValue::Text("2024-07-01T10:30:00Z".into()),
        )]);
        let row = map_order_to_row(&record);
        assert_eq!(
            row.get("Fecha de ISF"),
            Some(&CellValue::Text("2024-07-01".into()))
        );
    }

    #[test]
    fn setting_an_empty_cell_clears_the_column() {
        let mut row = ReportRow::new();
        row.set("REF", "MGP-1");
        row.set("REF", CellValue::Empty);
        assert_eq!(row.get("REF"), None);
    }
}
