//! herd: a horizontally scaled in-memory record service.
//!
//! One primary process owns the store and spawns worker processes that
//! serve HTTP. Workers forward every operation to the primary as an intent
//! over a framed stdin/stdout channel; a round-robin balancer on the public
//! port spreads requests across them.

pub mod bridge;
pub mod config;
pub mod primary;
pub mod store;
pub mod transport;
pub mod worker;

pub use config::{ClusterConfig, ConfigError, Mode, Role};
pub use primary::{PrimaryConfig, PrimaryError, run_primary};
pub use store::{Controller, PayloadSchema, Record, RecordId, StoreError};
pub use transport::http::ServerConfig;
pub use worker::{Backend, LocalBackend, PrimaryLink, WorkerConfig, run_standalone, run_worker};

/// Crate version, logged at startup.
pub const HERD_VERSION: &str = env!("CARGO_PKG_VERSION");
