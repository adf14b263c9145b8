//! Worker process spawning.

use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{HOST_ENV, PORT_ENV, ROLE_ENV};

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// Spawned children must have piped stdin (replies) and stdout (intents).
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Re-executes the current binary in the worker role.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .env(ROLE_ENV, "worker")
            .env(HOST_ENV, &config.hostname)
            .env(PORT_ENV, config.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}
