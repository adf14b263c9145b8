//! Where a worker's intents go.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::bridge::protocol::{Intent, Reply};
use crate::store::{Controller, PayloadSchema};

/// Executes intents on behalf of the HTTP layer.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn dispatch(&self, intent: Intent) -> Reply;
}

/// Controller in the same process, for single-process mode.
#[derive(Debug, Default)]
pub struct LocalBackend {
    controller: Mutex<Controller>,
}

impl LocalBackend {
    pub fn new(schema: PayloadSchema) -> Self {
        Self {
            controller: Mutex::new(Controller::new(schema)),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn dispatch(&self, intent: Intent) -> Reply {
        let mut controller = match self.controller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Controller lock poisoned, continuing");
                poisoned.into_inner()
            }
        };
        controller.handle(intent)
    }
}
