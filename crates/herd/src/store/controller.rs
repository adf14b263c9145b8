//! Controller: CRUD operations over the store, and intent dispatch.

use serde_json::Value;

use super::{PayloadSchema, Record, RecordId, Store, StoreError};
use crate::bridge::protocol::{Intent, Operation, Reply};

#[derive(Debug, Default)]
pub struct Controller {
    store: Store,
    schema: PayloadSchema,
}

impl Controller {
    pub fn new(schema: PayloadSchema) -> Self {
        Self {
            store: Store::new(),
            schema,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn read_all(&self) -> Vec<Record> {
        self.store.all()
    }

    pub fn read_one(&self, id: &str) -> Result<Record, StoreError> {
        let id = RecordId::parse(id)?;
        self.store.get(&id).cloned()
    }

    pub fn create(&mut self, payload: &str) -> Result<Record, StoreError> {
        let fields = self.schema.fields(payload)?;
        Ok(self.store.insert(fields))
    }

    pub fn update(&mut self, id: &str, payload: &str) -> Result<Record, StoreError> {
        let id = RecordId::parse(id)?;
        let fields = self.schema.fields(payload)?;
        self.store.merge(&id, fields)
    }

    pub fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        let id = RecordId::parse(id)?;
        self.store.remove(&id)
    }

    /// Run one intent to completion and build its reply.
    ///
    /// The intent must already be validated; a missing id or body is treated
    /// as empty and fails as a domain error.
    pub fn handle(&mut self, intent: Intent) -> Reply {
        let id = intent.id.as_deref().unwrap_or_default();
        let body = intent.body.as_deref().unwrap_or_default();

        let result = match intent.op {
            Operation::ReadAll => Ok((200, records(self.read_all()))),
            Operation::ReadOne => self.read_one(id).map(|r| (200, Value::from(r))),
            Operation::Create => self.create(body).map(|r| (201, Value::from(r))),
            Operation::Update => self.update(id, body).map(|r| (200, Value::from(r))),
            Operation::Delete => self.delete(id).map(|()| (204, Value::Null)),
        };

        match result {
            Ok((status, data)) => Reply::success(status, data),
            Err(e) => {
                tracing::debug!(op = %intent.op, error = %e, "Intent failed");
                Reply::failure(e.status(), e.to_string())
            }
        }
    }
}

fn records(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::from).collect())
}
