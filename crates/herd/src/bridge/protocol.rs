//! Wire protocol types for worker-primary communication.
//!
//! One channel per worker (the worker's stdin/stdout pipes):
//! - **worker → primary**: `Ready` handshake, then one `Intent` per client request
//! - **primary → worker**: exactly one `Reply` per `Intent`
//!
//! There is no request id. Correlation relies on each worker keeping at most
//! one `Intent` in flight, see [`crate::worker::PrimaryLink`].

use serde::{Deserialize, Serialize};

/// Statuses a `Reply` may carry.
pub const ALLOWED_STATUSES: &[u16] = &[200, 201, 204, 400, 404, 500];

/// Structural validation applied to every decoded frame.
pub trait Validate {
    fn validate(&self) -> Result<(), ProtocolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{op} intent is missing required field `{field}`")]
    MissingField { op: Operation, field: &'static str },
    #[error("status {0} is not a protocol status")]
    InvalidStatus(u16),
}

/// CRUD operation requested by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ReadAll,
    ReadOne,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadAll => "read_all",
            Self::ReadOne => "read_one",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn needs_id(&self) -> bool {
        matches!(self, Self::ReadOne | Self::Update | Self::Delete)
    }

    fn needs_body(&self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single CRUD request delegated from a worker to the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub op: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Raw request body, parsed by the controller on the primary side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Intent {
    pub fn read_all() -> Self {
        Self {
            op: Operation::ReadAll,
            id: None,
            body: None,
        }
    }

    pub fn read_one(id: impl Into<String>) -> Self {
        Self {
            op: Operation::ReadOne,
            id: Some(id.into()),
            body: None,
        }
    }

    pub fn create(body: impl Into<String>) -> Self {
        Self {
            op: Operation::Create,
            id: None,
            body: Some(body.into()),
        }
    }

    pub fn update(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            op: Operation::Update,
            id: Some(id.into()),
            body: Some(body.into()),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            op: Operation::Delete,
            id: Some(id.into()),
            body: None,
        }
    }
}

impl Validate for Intent {
    fn validate(&self) -> Result<(), ProtocolError> {
        if self.op.needs_id() && self.id.is_none() {
            return Err(ProtocolError::MissingField {
                op: self.op,
                field: "id",
            });
        }
        if self.op.needs_body() && self.body.is_none() {
            return Err(ProtocolError::MissingField {
                op: self.op,
                field: "body",
            });
        }
        Ok(())
    }
}

/// Messages from worker to primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once the worker's HTTP listener is bound.
    Ready { port: u16 },

    Intent(Intent),
}

impl Validate for WorkerMessage {
    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Ready { .. } => Ok(()),
            Self::Intent(intent) => intent.validate(),
        }
    }
}

/// Messages from primary to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Success {
        status: u16,
        #[serde(default)]
        data: serde_json::Value,
    },

    Failure {
        status: u16,
        message: String,
    },
}

impl Reply {
    pub fn success(status: u16, data: serde_json::Value) -> Self {
        Self::Success { status, data }
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self::Failure {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Success { status, .. } | Self::Failure { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl Validate for Reply {
    fn validate(&self) -> Result<(), ProtocolError> {
        let status = self.status();
        if !ALLOWED_STATUSES.contains(&status) {
            return Err(ProtocolError::InvalidStatus(status));
        }
        Ok(())
    }
}
