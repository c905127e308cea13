//! Business-object record store
//!
//! Contacts, products, form submissions and the like are opaque JSON
//! documents grouped by org and collection. The engine itself never reads
//! them; behaviors do. Cross-run consistency (one contact per email) is
//! achieved with `upsert_by_key`, not by engine-level locking.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::resolve_path;

/// A stored business object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub org_id: String,
    pub collection: String,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record store errors
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record not found: {0}")]
    NotFound(Uuid),

    #[error("record data must be a JSON object")]
    NotAnObject,

    #[error("record data has no value for key field `{0}`")]
    MissingKey(String),

    #[error("record backend error: {0}")]
    Backend(String),
}

/// Outcome of an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub record: Record,
    pub created: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn create(&self, org_id: &str, collection: &str, data: Value) -> Result<Record, RecordError>;

    /// Shallow-merge `data` into the record's fields
    async fn update(&self, id: Uuid, data: Value) -> Result<Record, RecordError>;

    async fn get(&self, id: Uuid) -> Result<Record, RecordError>;

    /// Records whose value at each filter path equals the filter value
    async fn query(
        &self,
        org_id: &str,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Record>, RecordError>;

    /// Atomically update the record whose `key_field` equals the one in
    /// `data`, or create it
    async fn upsert_by_key(
        &self,
        org_id: &str,
        collection: &str,
        key_field: &str,
        data: Value,
    ) -> Result<Upserted, RecordError>;
}

/// In-memory record store for tests and dev mode
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, Record>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn into_object(data: Value) -> Result<Map<String, Value>, RecordError> {
    match data {
        Value::Object(map) => Ok(map),
        _ => Err(RecordError::NotAnObject),
    }
}

fn matches(record: &Record, org_id: &str, collection: &str, filter: &Map<String, Value>) -> bool {
    record.org_id == org_id
        && record.collection == collection
        && filter
            .iter()
            .all(|(path, expected)| resolve_path(&record.data, path) == Some(expected))
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, org_id: &str, collection: &str, data: Value) -> Result<Record, RecordError> {
        let now = Utc::now();
        let record = Record {
            id: Uuid::now_v7(),
            org_id: org_id.to_string(),
            collection: collection.to_string(),
            data: into_object(data)?,
            created_at: now,
            updated_at: now,
        };
        self.records.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, id: Uuid, data: Value) -> Result<Record, RecordError> {
        let fields = into_object(data)?;
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(RecordError::NotFound(id))?;
        record.data.extend(fields);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Record, RecordError> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(RecordError::NotFound(id))
    }

    async fn query(
        &self,
        org_id: &str,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Record>, RecordError> {
        let mut found: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| matches(r, org_id, collection, filter))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        Ok(found)
    }

    async fn upsert_by_key(
        &self,
        org_id: &str,
        collection: &str,
        key_field: &str,
        data: Value,
    ) -> Result<Upserted, RecordError> {
        let fields = into_object(data)?;
        let key = resolve_path(&fields, key_field)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| RecordError::MissingKey(key_field.to_string()))?;

        let mut filter = Map::new();
        filter.insert(key_field.to_string(), key);

        let now = Utc::now();
        let mut records = self.records.write();
        if let Some(existing) = records
            .values_mut()
            .find(|r| matches(r, org_id, collection, &filter))
        {
            existing.data.extend(fields);
            existing.updated_at = now;
            return Ok(Upserted {
                record: existing.clone(),
                created: false,
            });
        }

        let record = Record {
            id: Uuid::now_v7(),
            org_id: org_id.to_string(),
            collection: collection.to_string(),
            data: fields,
            created_at: now,
            updated_at: now,
        };
        records.insert(record.id, record.clone());
        Ok(Upserted {
            record,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_update_get() {
        let store = InMemoryRecordStore::new();
        let record = store
            .create("org", "contacts", json!({"email": "a@b.c"}))
            .await
            .unwrap();

        let updated = store
            .update(record.id, json!({"phone": "555"}))
            .await
            .unwrap();
        assert_eq!(updated.data["email"], json!("a@b.c"));
        assert_eq!(updated.data["phone"], json!("555"));

        assert_eq!(store.get(record.id).await.unwrap(), updated);
        assert!(matches!(
            store.get(Uuid::now_v7()).await,
            Err(RecordError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_object() {
        let store = InMemoryRecordStore::new();
        assert!(matches!(
            store.create("org", "contacts", json!([1])).await,
            Err(RecordError::NotAnObject)
        ));
    }

    #[tokio::test]
    async fn test_query_scoped_by_org_and_collection() {
        let store = InMemoryRecordStore::new();
        store.create("org", "contacts", json!({"tier": "vip"})).await.unwrap();
        store.create("org", "contacts", json!({"tier": "free"})).await.unwrap();
        store.create("other", "contacts", json!({"tier": "vip"})).await.unwrap();
        store.create("org", "products", json!({"tier": "vip"})).await.unwrap();

        let mut filter = Map::new();
        filter.insert("tier".into(), json!("vip"));
        let found = store.query("org", "contacts", &filter).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_by_key_dedupes() {
        let store = InMemoryRecordStore::new();

        let first = store
            .upsert_by_key("org", "contacts", "email", json!({"email": "a@b.c", "name": "A"}))
            .await
            .unwrap();
        assert!(first.created);

        let second = store
            .upsert_by_key("org", "contacts", "email", json!({"email": "a@b.c", "name": "Ada"}))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.data["name"], json!("Ada"));
        assert_eq!(store.len(), 1);

        assert!(matches!(
            store.upsert_by_key("org", "contacts", "email", json!({"name": "x"})).await,
            Err(RecordError::MissingKey(_))
        ));
    }
}
