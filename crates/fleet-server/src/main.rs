//! Fleet dispatch server.
//!
//! Run with: cargo run -p fleet-server
//!
//! Configuration comes from the environment (`SSH_USERNAME`, `SSH_PASSWORD`,
//! `MAX_PARALLEL`, ...). Logging honours `RUST_LOG`.

use std::sync::Arc;

use anyhow::Context as _;
use fleet_core::FleetConfig;
use fleet_jobs::{DispatchSettings, Dispatcher, MemoryJobStore};
use fleet_ssh::{HostKeyVerifier, SessionOptions, SshSession};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = FleetConfig::from_env().context("Invalid configuration")?;
    let defaults = config.host_defaults().context("Invalid SSH credentials")?;
    let options = SessionOptions::from_config(&config).context("Invalid login shell")?;
    let verifier = Arc::new(HostKeyVerifier::new(
        config.host_key_policy,
        config.known_hosts.clone(),
    ));

    tracing::info!(
        user = %defaults.username,
        port = defaults.port,
        max_parallel = config.max_parallel,
        host_key_policy = ?config.host_key_policy,
        "Fleet dispatcher configured"
    );

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(SshSession::new(options, verifier)),
        defaults,
        DispatchSettings::from_config(&config),
    ));
    let app = fleet_transport::router(dispatcher, config.max_content_length);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    tracing::info!("Server listening on http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
