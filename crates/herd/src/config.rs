//! Process configuration from environment variables.

use std::sync::Arc;
use std::time::Duration;

use crate::primary::{PrimaryConfig, ProcessSpawner, default_worker_count};
use crate::store::PayloadSchema;
use crate::transport::http::ServerConfig;
use crate::worker::WorkerConfig;

/// Marks a process as a spawned worker.
pub const ROLE_ENV: &str = "HERD_ROLE";
pub const HOST_ENV: &str = "HERD_HOST";
pub const PORT_ENV: &str = "HERD_PORT";
pub const MODE_ENV: &str = "HERD_MODE";
pub const WORKERS_ENV: &str = "HERD_WORKERS";
pub const PAYLOAD_ENV: &str = "HERD_PAYLOAD";
pub const REPLY_TIMEOUT_ENV: &str = "HERD_REPLY_TIMEOUT_SECS";
pub const SETUP_TIMEOUT_ENV: &str = "HERD_SETUP_TIMEOUT_SECS";

/// Command-line switch selecting multi-process mode.
pub const MULTI_FLAG: &str = "--multi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Multi,
}

/// What this process should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Single-process server with its own store.
    Standalone,
    Primary,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub hostname: String,
    pub port: u16,
    pub mode: Mode,
    pub is_worker: bool,
    pub workers: usize,
    pub payload: PayloadSchema,
    pub reply_timeout: Option<Duration>,
    pub setup_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 4000,
            mode: Mode::Single,
            is_worker: false,
            workers: default_worker_count(),
            payload: PayloadSchema::default(),
            reply_timeout: None,
            setup_timeout: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    /// Read the process environment and arguments.
    pub fn from_env() -> Result<Self, ConfigError> {
        let multi_flag = std::env::args().skip(1).any(|arg| arg == MULTI_FLAG);
        Self::from_lookup(|key| std::env::var(key).ok(), multi_flag)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        multi_flag: bool,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.is_empty()) {
            config.hostname = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            config.port = parse(PORT_ENV, &port, "expected a port number")?;
        }

        let multi_env = match lookup(MODE_ENV).as_deref() {
            None | Some("") | Some("single") => false,
            Some("multi") => true,
            Some(other) => return Err(invalid(MODE_ENV, other, "expected single or multi")),
        };
        if multi_flag || multi_env {
            config.mode = Mode::Multi;
        }

        config.is_worker = match lookup(ROLE_ENV).as_deref() {
            None | Some("") => false,
            Some("worker") => true,
            Some(other) => return Err(invalid(ROLE_ENV, other, "expected worker")),
        };

        if let Some(workers) = lookup(WORKERS_ENV) {
            let n: usize = parse(WORKERS_ENV, &workers, "expected a positive count")?;
            if n == 0 {
                return Err(invalid(WORKERS_ENV, &workers, "expected a positive count"));
            }
            config.workers = n;
        }

        if let Some(payload) = lookup(PAYLOAD_ENV) {
            config.payload = PayloadSchema::parse(&payload)
                .ok_or_else(|| invalid(PAYLOAD_ENV, &payload, "expected object or user"))?;
        }

        if let Some(secs) = lookup(REPLY_TIMEOUT_ENV).filter(|s| !s.is_empty()) {
            config.reply_timeout = Some(seconds(REPLY_TIMEOUT_ENV, &secs)?);
        }
        if let Some(secs) = lookup(SETUP_TIMEOUT_ENV) {
            config.setup_timeout = seconds(SETUP_TIMEOUT_ENV, &secs)?;
        }

        Ok(config)
    }

    pub fn role(&self) -> Role {
        match (self.is_worker, self.mode) {
            (true, _) => Role::Worker,
            (false, Mode::Multi) => Role::Primary,
            (false, Mode::Single) => Role::Standalone,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(&self.hostname, self.port)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            hostname: self.hostname.clone(),
            port: self.port,
            reply_timeout: self.reply_timeout,
        }
    }

    pub fn primary_config(&self) -> PrimaryConfig {
        PrimaryConfig::new(&self.hostname, self.port)
            .with_num_workers(self.workers)
            .with_payload(self.payload)
            .with_setup_timeout(self.setup_timeout)
            .with_spawner(Arc::new(ProcessSpawner))
    }
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason,
    }
}

fn parse<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value, reason))
}

fn seconds(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, value, "expected seconds")?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, value, "expected seconds"))
}
