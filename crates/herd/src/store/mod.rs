//! Canonical in-memory record store.
//!
//! Owned by exactly one task: the primary event loop in multi-process mode,
//! or the local backend in single-process mode. Nothing here is shared.

mod controller;
mod payload;

use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

pub use controller::Controller;
pub use payload::PayloadSchema;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid UUID format")]
    InvalidId,
    #[error("Invalid record data: required fields are missing or have wrong format")]
    InvalidPayload,
    #[error("Record not found")]
    NotFound,
}

impl StoreError {
    /// HTTP status carried by the failure reply.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidId | Self::InvalidPayload => 400,
            Self::NotFound => 404,
        }
    }
}

/// Store-assigned record identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Accepts the lowercase hyphenated 8-4-4-4-12 form of any UUID. Ids are
    /// always generated as v4, so other versions parse but are never found.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let uuid = Uuid::parse_str(s).map_err(|_| StoreError::InvalidId)?;
        if uuid.hyphenated().to_string() != s {
            return Err(StoreError::InvalidId);
        }
        Ok(Self(uuid))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A stored record: its id followed by the payload fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    fn new(id: RecordId, mut fields: Fields) -> Self {
        // The id key is owned by the store.
        fields.remove("id");
        Self { id, fields }
    }
}

impl From<Record> for serde_json::Value {
    fn from(record: Record) -> Self {
        let mut object = Fields::with_capacity(record.fields.len() + 1);
        object.insert("id".to_string(), Self::String(record.id.to_string()));
        object.extend(record.fields);
        Self::Object(object)
    }
}

/// Records in creation order, keyed by id.
#[derive(Debug, Default)]
pub struct Store {
    records: IndexMap<RecordId, Record>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    pub fn get(&self, id: &RecordId) -> Result<&Record, StoreError> {
        self.records.get(id).ok_or(StoreError::NotFound)
    }

    pub fn insert(&mut self, fields: Fields) -> Record {
        let mut id = RecordId::new();
        while self.records.contains_key(&id) {
            id = RecordId::new();
        }
        let record = Record::new(id, fields);
        self.records.insert(id, record.clone());
        record
    }

    /// Merge `fields` over the stored record. The id never changes.
    pub fn merge(&mut self, id: &RecordId, fields: Fields) -> Result<Record, StoreError> {
        let record = self.records.get_mut(id).ok_or(StoreError::NotFound)?;
        for (key, value) in fields {
            if key != "id" {
                record.fields.insert(key, value);
            }
        }
        Ok(record.clone())
    }

    pub fn remove(&mut self, id: &RecordId) -> Result<(), StoreError> {
        self.records
            .shift_remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn record_id_roundtrips_through_display() {
        let id = RecordId::new();
        assert_eq!(RecordId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn record_id_accepts_any_lowercase_uuid() {
        for id in [
            "c232ab00-9414-11ec-b3c8-9f6bdeced846",
            "00000000-0000-0000-0000-000000000000",
        ] {
            assert_eq!(RecordId::parse(id).unwrap().to_string(), id);
        }
    }

    #[test]
    fn record_id_rejects_non_canonical_forms() {
        assert_eq!(RecordId::parse("not-a-uuid"), Err(StoreError::InvalidId));
        // uppercase and simple forms
        let id = RecordId::new().to_string();
        assert_eq!(
            RecordId::parse(&id.to_uppercase()),
            Err(StoreError::InvalidId)
        );
        assert_eq!(
            RecordId::parse(&id.replace('-', "")),
            Err(StoreError::InvalidId)
        );
    }

    #[test]
    fn insert_overwrites_client_supplied_id() {
        let mut store = Store::new();
        let record = store.insert(fields(json!({"id": "mine", "name": "a"})));

        assert!(!record.fields.contains_key("id"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], json!(record.id.to_string()));
        assert_ne!(json["id"], json!("mine"));
        assert_eq!(json["name"], "a");
    }

    #[test]
    fn record_value_matches_serialized_form() {
        let mut store = Store::new();
        let record = store.insert(fields(json!({"name": "a", "tags": ["x"]})));

        let value = serde_json::Value::from(record.clone());
        assert_eq!(value, serde_json::to_value(&record).unwrap());
        assert_eq!(value["id"], json!(record.id.to_string()));
    }

    #[test]
    fn all_preserves_creation_order_after_removal() {
        let mut store = Store::new();
        let a = store.insert(fields(json!({"name": "a"})));
        let b = store.insert(fields(json!({"name": "b"})));
        let c = store.insert(fields(json!({"name": "c"})));

        store.remove(&b.id).unwrap();

        let ids: Vec<_> = store.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn merge_keeps_id_and_existing_fields() {
        let mut store = Store::new();
        let rec = store.insert(fields(json!({"name": "a", "age": 1})));

        let updated = store
            .merge(&rec.id, fields(json!({"id": "other", "age": 2})))
            .unwrap();

        assert_eq!(updated.id, rec.id);
        assert_eq!(updated.fields["name"], "a");
        assert_eq!(updated.fields["age"], 2);
    }

    #[test]
    fn missing_records_are_not_found() {
        let mut store = Store::new();
        let id = RecordId::new();
        assert_eq!(store.get(&id), Err(StoreError::NotFound));
        assert_eq!(store.remove(&id), Err(StoreError::NotFound));
        assert_eq!(
            store.merge(&id, Fields::new()),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn error_statuses_are_stable() {
        assert_eq!(StoreError::InvalidId.status(), 400);
        assert_eq!(StoreError::InvalidPayload.status(), 400);
        assert_eq!(StoreError::NotFound.status(), 404);
    }
}
