//! Worker process: serves the record API and delegates every operation.
//!
//! A spawned worker talks to the primary over its own stdin (replies) and
//! stdout (intents). Logs go to stderr so they never corrupt the channel.

mod backend;
mod link;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::store::PayloadSchema;
use crate::transport::http::{ServerConfig, bind, routes, serve_listener, serve_router};

pub use backend::{Backend, LocalBackend};
pub use link::PrimaryLink;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub hostname: String,
    pub port: u16,
    /// Give up on a pending intent after this long; `None` waits forever.
    pub reply_timeout: Option<Duration>,
}

/// Run a spawned worker until the primary goes away or `shutdown` fires.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let link = Arc::new(PrimaryLink::connect(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.reply_timeout,
        shutdown.clone(),
    ));

    let server = ServerConfig::new(&config.hostname, config.port);
    let listener = bind(&server)
        .await
        .with_context(|| format!("worker failed to bind {}:{}", server.host, server.port))?;

    link.announce_ready(config.port)
        .await
        .context("failed to announce readiness to primary")?;
    tracing::info!(port = config.port, pid = std::process::id(), "Worker ready");

    serve_listener(listener, routes(link), shutdown).await
}

/// Serve the record API from a single process holding its own store.
pub async fn run_standalone(
    server: ServerConfig,
    schema: PayloadSchema,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let backend = Arc::new(LocalBackend::new(schema));
    serve_router(server, routes(backend), shutdown).await
}
