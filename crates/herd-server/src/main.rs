//! herd binary: one executable for the standalone server, the primary, and
//! the workers the primary spawns.

use std::time::Duration;

use herd::{ClusterConfig, HERD_VERSION, Role};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Stdin reads can't be cancelled, so runtime shutdown must not wait on them.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("HERD_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("herd={level},herd_server={level}"))
    };

    // stdout belongs to the IPC channel in workers.
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn run(config: ClusterConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let signals = herd::transport::http::cancel_on_signal(shutdown.clone());

    let result = match config.role() {
        Role::Worker => herd::run_worker(config.worker_config(), shutdown.clone()).await,
        Role::Primary => {
            tracing::info!(
                pid = std::process::id(),
                workers = config.workers,
                "Primary starting"
            );
            herd::run_primary(config.primary_config(), shutdown.clone())
                .await
                .map_err(anyhow::Error::from)
        }
        Role::Standalone => {
            herd::run_standalone(config.server_config(), config.payload, shutdown.clone()).await
        }
    };

    shutdown.cancel();
    let _ = signals.await;
    result
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClusterConfig::from_env()?;
    tracing::info!(version = HERD_VERSION, role = ?config.role(), "herd starting");

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(config));
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    if let Err(e) = &result {
        tracing::error!(error = %e, "herd exiting with error");
    }
    result
}
