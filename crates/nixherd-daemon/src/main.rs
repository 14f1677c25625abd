//! nixherd-daemon — the nixherd control plane.
//!
//! Owns the global supervisor, the repository registry, and the broadcast
//! bus, and serves the framed control-plane protocol on the configured
//! `HOST:PORT` for the SSH front end to proxy sessions into. SIGINT/SIGTERM
//! trigger a graceful shutdown: stop accepting connections, stop every
//! running child, exit within 30 seconds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nixherd_core::builder::{Builder, NixClient};
use nixherd_core::bus::LogBus;
use nixherd_core::config::{self, Config};
use nixherd_core::materializer::Materializer;
use nixherd_core::registry::RepoRegistry;
use nixherd_core::supervisor::Supervisor;
use nixherd_daemon::{commands, server};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Everything must be down this long after the first shutdown signal.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    // The host key belongs to the SSH front end; the daemon owns creating it
    // with sane permissions so a fresh install works out of the box.
    config::ensure_host_key(&config.host_key_path).context("failed to prepare host key")?;

    let registry =
        Arc::new(RepoRegistry::open(&config).context("failed to open repository registry")?);
    let bus = Arc::new(LogBus::new());
    let supervisor = Supervisor::new(Arc::clone(&bus));
    let materializer = Materializer::new(
        Box::new(NixClient::new()) as Box<dyn Builder>,
        supervisor.clone(),
    );

    let ctx = Arc::new(commands::CommandContext {
        registry,
        supervisor: supervisor.clone(),
        materializer,
        bus,
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "control plane listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::run(listener, Arc::clone(&ctx), shutdown_rx));

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        supervisor.stop_all().await;
        let _ = server.await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        warn!("shutdown budget exceeded, exiting anyway");
    }

    info!("bye");
    Ok(())
}
