// =============================================================================
// Meridian Futures Hub — Main Entry Point
// =============================================================================
//
// The hub fans in live feeds from the platform's upstream services, keeps one
// sequenced in-memory view of the trading world, and multiplexes it to
// WebSocket clients at per-client refresh rates.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod adapters;
mod api;
mod config;
mod differ;
mod error;
mod event;
mod history;
mod hub;
mod metrics;
mod projection;
mod session;
mod state_store;
mod supervisor;
mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::SourceAdapter;
use crate::config::HubConfig;
use crate::history::HistoryClient;
use crate::hub::Hub;
use crate::session::{run_eviction_sweeper, ClientRegistry};
use crate::state_store::StateStore;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Futures Hub — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "hub_config.json".into());
    let mut config = HubConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        HubConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;

    info!(
        bind = %config.bind_addr,
        ws_path = %config.ws.path,
        shared_key = config.ws.shared_key.is_some(),
        "hub configured"
    );

    // ── 2. Metrics recorder ──────────────────────────────────────────────
    let metrics_handle = metrics::install().context("failed to install metrics recorder")?;

    // ── 3. State store & single writer ───────────────────────────────────
    let store = Arc::new(StateStore::new(config.quote_staleness_ms));
    let (event_tx, event_rx) = mpsc::channel(config.event_channel_size);
    let writer = tokio::spawn(state_store::run_writer(store.clone(), event_rx));

    // ── 4. Source adapters under the supervisor ──────────────────────────
    let adapters = SourceAdapter::all_from_config(&config.upstream);
    let adapter_count = adapters.len();
    let supervisor = Supervisor::start(adapters, event_tx, config.reconnect.clone());
    info!(count = adapter_count, "source adapters launched");

    // ── 5. Shared hub state ──────────────────────────────────────────────
    let registry = Arc::new(ClientRegistry::new());
    let history = HistoryClient::new(config.history.url.clone(), config.history.max_range_s);
    let hub = Arc::new(Hub {
        config: config.clone(),
        store: store.clone(),
        registry: registry.clone(),
        supervisor,
        history,
        metrics: metrics_handle,
        start_time: Instant::now(),
    });

    // Terminal orders leave the active view only after every subscribed
    // client's tick has covered the terminal sequence.
    let sweeper = tokio::spawn(run_eviction_sweeper(
        store.clone(),
        registry,
        config.refresh.min_interval(),
    ));

    // ── 6. HTTP/WS server ────────────────────────────────────────────────
    let app = api::rest::router(hub.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "hub listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Aborting the adapters drops every event sender; the writer drains what
    // is buffered and exits, bounded by the grace period.
    hub.supervisor.shutdown();
    sweeper.abort();
    server.abort();

    let grace = Duration::from_millis(config.shutdown_grace_ms);
    match tokio::time::timeout(grace, writer).await {
        Ok(_) => info!("state writer drained"),
        Err(_) => warn!(
            grace_ms = config.shutdown_grace_ms,
            "writer drain grace expired — exiting"
        ),
    }

    info!("Meridian hub shut down complete.");
    Ok(())
}
