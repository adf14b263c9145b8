//! Payload validation for create/update bodies.

use serde_json::Value;

use super::{Fields, StoreError};

/// Shape a record payload must have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadSchema {
    /// Any JSON object.
    #[default]
    Object,
    /// `username: string`, `age: number`, `hobbies: string[]`.
    User,
}

impl PayloadSchema {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "object" => Some(Self::Object),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    /// Parse a raw body and check it against the schema.
    pub fn fields(&self, body: &str) -> Result<Fields, StoreError> {
        let value: Value = serde_json::from_str(body).map_err(|_| StoreError::InvalidPayload)?;
        let Value::Object(fields) = value else {
            return Err(StoreError::InvalidPayload);
        };

        match self {
            Self::Object => Ok(fields),
            Self::User if is_user(&fields) => Ok(fields),
            Self::User => Err(StoreError::InvalidPayload),
        }
    }
}

fn is_user(fields: &Fields) -> bool {
    let username = fields.get("username").is_some_and(Value::is_string);
    let age = fields.get("age").is_some_and(Value::is_number);
    let hobbies = match fields.get("hobbies") {
        Some(Value::Array(items)) => items.iter().all(Value::is_string),
        _ => false,
    };
    username && age && hobbies
}
