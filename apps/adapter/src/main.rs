//! # Kassa Adapter
//!
//! Offline-first fiscal receipt adapter for POS/ERP callers.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Adapter Service                                 │
//! │                                                                         │
//! │  POS/ERP ──► HTTP (axum) ──► Orchestrator ──► SQLite buffer            │
//! │                                                   │                     │
//! │                                                   ▼                     │
//! │                               SyncDaemon ──► OFD (mock | http)         │
//! │                                   │                                     │
//! │                                   └── lease lock (Redis, optional)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod error;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kassa_buffer::{Buffer, BufferConfig};
use kassa_core::HybridClock;
use kassa_sync::{
    AdapterConfig, CircuitBreaker, HttpOfdClient, LeaseLock, LocalLeaseLock, MockOfdClient,
    OfdClient, OfdTransport, Orchestrator, RedisLeaseLock, StubPrintDriver, SyncDaemon,
};

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting kassa adapter...");

    // Load configuration
    let config = AdapterConfig::load()?;
    info!(
        pos_id = %config.pos_id,
        http_port = config.http_port,
        transport = %config.ofd_transport,
        buffer_path = %config.buffer_db_path,
        "Configuration loaded"
    );

    // Open the durable buffer
    let buffer = Buffer::open(
        BufferConfig::new(&config.buffer_db_path).capacity(config.buffer_capacity),
    )
    .await?;
    info!("Receipt buffer opened");

    // Startup recovery: receipts stranded in `syncing` by a crash go back
    // to pending without a retry penalty
    let recovered = buffer.receipts().recover_stranded().await?;
    if recovered > 0 {
        warn!(count = recovered, "Recovered receipts stranded by previous shutdown");
    }

    // Shared components
    let clock = Arc::new(HybridClock::new());
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_failure_threshold,
        config.breaker_success_threshold,
        Duration::from_secs(config.breaker_recovery_timeout_secs),
    ));

    let client: Arc<dyn OfdClient> = match config.ofd_transport {
        OfdTransport::Mock => {
            warn!("Using MOCK OFD transport; receipts will not reach a real operator");
            Arc::new(MockOfdClient::new())
        }
        OfdTransport::Http => {
            let base_url = config
                .ofd_base_url
                .clone()
                .ok_or("OFD_BASE_URL required for http transport")?;
            info!(base_url = %base_url, "Using HTTP OFD transport");
            Arc::new(HttpOfdClient::new(base_url, config.ofd_request_timeout())?)
        }
    };

    // Lease lock: Redis when configured, in-process otherwise. The TTL is
    // strictly shorter than the cycle interval so a crashed holder cannot
    // block peer instances past one tick.
    let lock: Arc<dyn LeaseLock> = match config.redis_url.as_deref() {
        Some(url) => {
            info!("Using Redis lease lock");
            Arc::new(RedisLeaseLock::new(url, config.lease_ttl())?)
        }
        None => {
            info!("No REDIS_URL set, using in-process lease lock");
            Arc::new(LocalLeaseLock::new())
        }
    };

    // Spawn the sync daemon
    let (daemon, daemon_handle) = SyncDaemon::new(
        &config,
        buffer.clone(),
        clock.clone(),
        client,
        breaker.clone(),
        lock,
    );
    tokio::spawn(daemon.run());

    // Orchestrator + HTTP surface
    let orchestrator = Orchestrator::new(
        buffer.clone(),
        clock,
        Arc::new(StubPrintDriver::new()),
        breaker,
        config.pos_id.clone(),
    )
    .with_daemon(daemon_handle.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        buffer: buffer.clone(),
        orchestrator,
        daemon: daemon_handle.clone(),
    });

    let app = routes::router(state);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Adapter listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: stop the daemon, flush the buffer pool
    daemon_handle.shutdown().await;
    buffer.close().await;

    info!("Adapter shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
