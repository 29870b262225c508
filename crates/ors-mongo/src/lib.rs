//! Document-store query layer: order fetches and change-log queries.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::{Client, Collection};
use ors_core::{FieldValue, OrderRecord, Stopover};
use thiserror::Error;

pub const CRATE_NAME: &str = "ors-mongo";

pub const ORDERS_DB: &str = "MGP-ORDER";
pub const ORDERS_COLLECTION: &str = "Order";
pub const ORDER_LOG_COLLECTION: &str = "OrderLog";
pub const ACCOUNTS_DB: &str = "MGP-ACCOUNT";
pub const ACCOUNTS_COLLECTION: &str = "Accounts";

const LOG_BATCH_SIZE: u32 = 500;
const CHANGES_PER_LOG_ENTRY: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object id {value:?}")]
    InvalidObjectId { value: String },
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),
}

/// One field-level change inside a log entry, pre-rendered for audit output.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: Option<String>,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub action: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub changes: Vec<FieldChange>,
}

/// Query seam between the orchestrator and the document store.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Display name of the account, used to name the remote artifact.
    async fn fetch_account_name(&self, account_id: &str) -> Result<Option<String>, StoreError>;

    /// All orders of an account, stable projection, oldest first.
    async fn fetch_all(&self, account_id: &str) -> Result<Vec<OrderRecord>, StoreError>;

    /// Ids of orders with any log activity after `since`.
    async fn fetch_changed_ids_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<OrderRecord>, StoreError>;

    /// Recent field-level changes per order, capped at `entries_per_id` most
    /// recent entries each. Audit logging only.
    async fn fetch_change_log(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
        ids: &[String],
        entries_per_id: usize,
    ) -> Result<Vec<(String, Vec<ChangeLogEntry>)>, StoreError>;
}

/// MongoDB-backed [`OrderStore`] against the fixed order/account topology.
#[derive(Debug, Clone)]
pub struct MongoOrderStore {
    client: Client,
}

impl MongoOrderStore {
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self { client })
    }

    fn orders(&self) -> Collection<Document> {
        self.client.database(ORDERS_DB).collection(ORDERS_COLLECTION)
    }

    fn order_logs(&self) -> Collection<Document> {
        self.client
            .database(ORDERS_DB)
            .collection(ORDER_LOG_COLLECTION)
    }

    fn accounts(&self) -> Collection<Document> {
        self.client
            .database(ACCOUNTS_DB)
            .collection(ACCOUNTS_COLLECTION)
    }
}

#[async_trait]
impl OrderStore for MongoOrderStore {
    async fn fetch_account_name(&self, account_id: &str) -> Result<Option<String>, StoreError> {
        let account = parse_object_id(account_id)?;
        let document = self
            .accounts()
            .find_one(doc! { "_id": account })
            .projection(doc! { "accountName": 1 })
            .await?;
        Ok(document
            .and_then(|d| d.get_str("accountName").ok().map(String::from))
            .filter(|name| !name.is_empty()))
    }

    async fn fetch_all(&self, account_id: &str) -> Result<Vec<OrderRecord>, StoreError> {
        let account = parse_object_id(account_id)?;
        let mut cursor = self
            .orders()
            .find(doc! { "accountId": account })
            .projection(order_projection())
            .sort(doc! { "createdAt": 1 })
            .await?;
        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            records.push(order_from_document(&document));
        }
        Ok(records)
    }

    async fn fetch_changed_ids_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let account = parse_object_id(account_id)?;
        let min_id = object_id_lower_bound(since);
        let mut cursor = self
            .order_logs()
            .find(doc! { "accountId": account, "_id": { "$gt": min_id } })
            .projection(doc! { "orderId": 1 })
            .batch_size(LOG_BATCH_SIZE)
            .await?;
        let mut ids = BTreeSet::new();
        while let Some(document) = cursor.try_next().await? {
            if let Ok(order_id) = document.get_object_id("orderId") {
                ids.insert(order_id.to_hex());
            }
        }
        Ok(ids.into_iter().collect())
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<OrderRecord>, StoreError> {
        let object_ids = ids
            .iter()
            .map(|id| parse_object_id(id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut cursor = self
            .orders()
            .find(doc! { "_id": { "$in": object_ids } })
            .projection(order_projection())
            .await?;
        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            records.push(order_from_document(&document));
        }
        Ok(records)
    }

    async fn fetch_change_log(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
        ids: &[String],
        entries_per_id: usize,
    ) -> Result<Vec<(String, Vec<ChangeLogEntry>)>, StoreError> {
        let account = parse_object_id(account_id)?;
        let min_id = object_id_lower_bound(since);
        let order_ids: Vec<ObjectId> = ids
            .iter()
            .filter_map(|id| ObjectId::parse_str(id).ok())
            .collect();
        let mut cursor = self
            .order_logs()
            .find(doc! {
                "accountId": account,
                "orderId": { "$in": order_ids },
                "_id": { "$gt": min_id },
            })
            .projection(doc! { "orderId": 1, "action": 1, "date": 1, "fieldChanges": 1 })
            .sort(doc! { "_id": 1 })
            .await?;

        let mut by_order: Vec<(String, Vec<ChangeLogEntry>)> = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            let Ok(order_id) = document.get_object_id("orderId") else {
                continue;
            };
            let key = order_id.to_hex();
            let entry = change_entry_from_document(&document);
            match by_order.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, entries)) => entries.push(entry),
                None => by_order.push((key, vec![entry])),
            }
        }
        for (_, entries) in &mut by_order {
            if entries.len() > entries_per_id {
                // keep the most recent entries
                entries.drain(..entries.len() - entries_per_id);
            }
        }
        Ok(by_order)
    }
}

fn parse_object_id(value: &str) -> Result<ObjectId, StoreError> {
    ObjectId::parse_str(value).map_err(|_| StoreError::InvalidObjectId {
        value: value.to_string(),
    })
}

fn order_projection() -> Document {
    doc! {
        "number": 1,
        "bookingNumber": 1,
        "dateETD": 1,
        "isBookingConfirmed": 1,
        "dateETA": 1,
        "isConfirmBLReceived": 1,
        "origin": 1,
        "stopovers": 1,
        "destination": 1,
        "internalClientNumber": 1,
        "isISF": 1,
        "dateISF": 1,
        "createdAt": 1,
        "dateLastUpdate": 1,
    }
}

/// ObjectId whose timestamp prefix is `since`, used to window log scans.
fn object_id_lower_bound(since: DateTime<Utc>) -> ObjectId {
    let seconds = since.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&seconds.to_be_bytes());
    ObjectId::from_bytes(bytes)
}

/// Decode a projected order document into the domain record.
pub fn order_from_document(document: &Document) -> OrderRecord {
    let mut record = OrderRecord {
        id: document.get_object_id("_id").ok().map(|oid| oid.to_hex()),
        created_at: datetime_from(document, "createdAt"),
        updated_at: datetime_from(document, "dateLastUpdate"),
        ..OrderRecord::default()
    };
    if let Ok(stops) = document.get_array("stopovers") {
        record.stopovers = stops
            .iter()
            .filter_map(Bson::as_document)
            .map(|stop| Stopover {
                name: string_from(stop, "stopoverName").or_else(|| string_from(stop, "name")),
            })
            .collect();
    }
    for (key, value) in document {
        if matches!(
            key.as_str(),
            "_id" | "createdAt" | "dateLastUpdate" | "stopovers" | "accountId"
        ) {
            continue;
        }
        record
            .fields
            .insert(key.clone(), field_value_from_bson(value));
    }
    record
}

fn change_entry_from_document(document: &Document) -> ChangeLogEntry {
    let changes = document
        .get_array("fieldChanges")
        .map(|items| {
            items
                .iter()
                .take(CHANGES_PER_LOG_ENTRY)
                .filter_map(Bson::as_document)
                .map(|change| FieldChange {
                    field: string_from(change, "fieldName")
                        .or_else(|| string_from(change, "fieldLabel")),
                    old: rendered_value(change.get("oldValue")),
                    new: rendered_value(change.get("newValue")),
                })
                .collect()
        })
        .unwrap_or_default();
    ChangeLogEntry {
        action: string_from(document, "action"),
        date: document.get_datetime("date").ok().map(|dt| dt.to_chrono()),
        changes,
    }
}

fn string_from(document: &Document, key: &str) -> Option<String> {
    document.get_str(key).ok().map(String::from)
}

fn datetime_from(document: &Document, key: &str) -> Option<DateTime<Utc>> {
    match document.get(key) {
        Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
        Some(Bson::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn field_value_from_bson(value: &Bson) -> FieldValue {
    match value {
        Bson::String(s) => FieldValue::Text(s.clone()),
        Bson::Boolean(b) => FieldValue::Bool(*b),
        Bson::Double(n) => FieldValue::Number(*n),
        Bson::Int32(n) => FieldValue::Number(f64::from(*n)),
        Bson::Int64(n) => FieldValue::Number(*n as f64),
        Bson::DateTime(dt) => FieldValue::Timestamp(dt.to_chrono()),
        Bson::ObjectId(oid) => FieldValue::Text(oid.to_hex()),
        _ => FieldValue::Null,
    }
}

fn rendered_value(value: Option<&Bson>) -> Option<String> {
    match value? {
        Bson::Null => None,
        Bson::String(s) => Some(s.clone()),
        Bson::Boolean(b) => Some(b.to_string()),
        Bson::Double(n) => Some(format!("{n}")),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::DateTime(dt) => Some(dt.to_chrono().to_rfc3339()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mongodb::bson::DateTime as BsonDateTime;
    use ors_core::map_order_to_row;

    fn oid(suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 12];
        bytes[0] = 0x65;
        bytes[11] = suffix;
        ObjectId::from_bytes(bytes)
    }

    #[test]
    fn decodes_projected_order_documents() {
        let created = Utc.with_ymd_and_hms(2024, 3, 12, 10, 0, 0).single().unwrap();
        let document = doc! {
            "_id": oid(1),
            "accountId": oid(9),
            "number": "MGP-1001",
            "bookingNumber": "BKG-77",
            "isBookingConfirmed": true,
            "dateETD": BsonDateTime::from_chrono(created),
            "origin": "Shanghai",
            "destination": "Veracruz",
            "stopovers": [ { "stopoverName": "Busan" }, { "name": "Manzanillo" } ],
            "createdAt": BsonDateTime::from_chrono(created),
        };

        let record = order_from_document(&document);
        assert_eq!(record.id.as_deref(), Some(oid(1).to_hex().as_str()));
        assert_eq!(record.created_at, Some(created));
        assert_eq!(record.updated_at, None);
        assert_eq!(record.stopovers.len(), 2);
        assert_eq!(record.stopovers[0].name.as_deref(), Some("Busan"));
        assert_eq!(
            record.field("number").and_then(FieldValue::as_text),
            Some("MGP-1001")
        );
        // accountId never leaks into the business fields
        assert!(record.field("accountId").is_none());

        let row = map_order_to_row(&record);
        assert_eq!(row.key().map(String::from), record.id);
        assert_eq!(row.created_at(), Some("2024-03-12"));
    }

    #[test]
    fn object_id_lower_bound_orders_by_time() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let bound = object_id_lower_bound(since);
        assert_eq!(bound.timestamp().to_chrono(), since);

        let later = object_id_lower_bound(since + chrono::Duration::hours(1));
        assert!(later > bound);
        // any real id minted before the bound compares below it
        let earlier = object_id_lower_bound(since - chrono::Duration::seconds(1));
        assert!(earlier < bound);
    }

    #[test]
    fn change_entries_cap_field_changes_and_render_scalars() {
        let changes: Vec<Document> = (0..8)
            .map(|i| {
                doc! {
                    "fieldName": format!("field{i}"),
                    "oldValue": Bson::Null,
                    "newValue": i as i32,
                }
            })
            .collect();
        let document = doc! {
            "orderId": oid(3),
            "action": "update",
            "date": BsonDateTime::from_chrono(
                Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).single().unwrap()
            ),
            "fieldChanges": changes,
        };

        let entry = change_entry_from_document(&document);
        assert_eq!(entry.action.as_deref(), Some("update"));
        assert_eq!(entry.changes.len(), CHANGES_PER_LOG_ENTRY);
        assert_eq!(entry.changes[0].field.as_deref(), Some("field0"));
        assert_eq!(entry.changes[0].old, None);
        assert_eq!(entry.changes[0].new.as_deref(), Some("0"));
    }

    #[test]
    fn falls_back_to_field_label_when_name_is_missing() {
        let document = doc! {
            "orderId": oid(4),
            "fieldChanges": [ { "fieldLabel": "ETD", "oldValue": "a", "newValue": "b" } ],
        };
        let entry = change_entry_from_document(&document);
        assert_eq!(entry.changes[0].field.as_deref(), Some("ETD"));
    }
}
