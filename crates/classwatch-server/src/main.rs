//! Classwatch - live classroom session hub
//!
//! Serves the session REST API and `/ws` live stream, probes socket
//! liveness, flushes session counters in the background and, when an
//! analysis engine is configured, polls it for live metrics.

use std::io;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use classwatch_core::Storage;
use classwatch_server::auth::StaticTokens;
use classwatch_server::dashboard::{self, state::AppState};
use classwatch_server::engine::{self, AnalysisEngine, HttpEngine};
use classwatch_server::hub::{BroadcastHub, LivenessMonitor, close_code};
use classwatch_server::{Config, IngestPipeline};

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(false).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first (before logging init, so --help/--version work cleanly)
    let config = Config::parse();
    init_tracing(config.log_json);

    info!("Classwatch v{} starting...", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(Storage::new(config.db_path.clone()).context("Failed to initialize storage")?);
    info!("Storage initialized successfully");

    let tokens = StaticTokens::parse(&config.tokens).context("Invalid CLASSWATCH_TOKENS")?;
    if tokens.is_empty() {
        warn!("No tokens configured; every connection will be rejected");
    }

    let engine: Option<Arc<dyn AnalysisEngine>> = match &config.engine_url {
        Some(url) => {
            let engine = HttpEngine::new(url.as_str(), config.engine_timeout())
                .context("Failed to build analysis engine client")?;
            info!(engine_url = %url, "Analysis engine configured");
            Some(Arc::new(engine))
        }
        None => None,
    };

    let hub = BroadcastHub::new();
    let (pipeline, flusher_handle) =
        IngestPipeline::new(Arc::clone(&storage), Arc::clone(&hub), engine.clone(), config.ingest());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let liveness = LivenessMonitor::new(Arc::clone(&hub), config.heartbeat_interval())
        .spawn(shutdown_rx.clone());
    let poller = engine.map(|engine| {
        engine::spawn_poller(
            Arc::clone(&pipeline),
            engine,
            config.engine_poll_interval(),
            shutdown_rx.clone(),
        )
    });

    let state = AppState::new(Arc::clone(&pipeline), Arc::new(tokens));
    let router = dashboard::build_router(state, config.port);
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Could not bind {}", config.bind_addr()))?;

    let shutdown_hub = Arc::clone(&hub);
    dashboard::serve(listener, router, async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
        shutdown_hub.close_all(close_code::GOING_AWAY, "server shutting down").await;
    })
    .await
    .context("Dashboard server error")?;

    let _ = liveness.await;
    if let Some(poller) = poller {
        let _ = poller.await;
    }

    let written = pipeline.flush().await;
    info!(sessions = written, "Session progress flushed");
    flusher_handle.abort();

    info!("Classwatch stopped");
    Ok(())
}
