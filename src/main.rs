//! Swap engine - atomic swap coordination for non-custodial cross-chain trading
//!
//! Runs swap orchestrators against the configured coins, resumes unfinished
//! swaps from the swap store and serves the HTTP API and metrics.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use swap_engine::api::{self, AppState};
use swap_engine::chain::{simulated::SimulatedNetwork, ChainManager};
use swap_engine::config::Settings;
use swap_engine::metrics::{self, MetricsServer};
use swap_engine::negotiation::LocalTransport;
use swap_engine::{store, SwapEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting swap engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} coins",
        settings.enabled_coins().len()
    );

    // Open the swap store
    let store = store::open(&settings.store).await?;
    info!("Swap store ready");

    // Initialize coin backends and their watchers
    let simulated = SimulatedNetwork::new();
    let chains = Arc::new(ChainManager::from_settings(&settings, &simulated).await?);
    let miners = simulated.spawn_miners();
    info!("Coins initialized: {:?}", chains.connected_coins());

    // Swaps negotiate over the in-process transport until a network transport is configured
    let transport = Arc::new(LocalTransport::new());

    let engine = Arc::new(SwapEngine::new(
        chains.clone(),
        store.clone(),
        transport,
        settings.engine.clone(),
    ));

    chains.start_watchers().await;
    let resumed = engine.resume_unfinished().await?;
    info!("Swap engine initialized, {} swaps resumed", resumed);

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            engine: engine.clone(),
            chains: chains.clone(),
            store: store.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = settings.metrics.enabled.then(|| {
        let server = MetricsServer::new(settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let store = store.clone();
        let interval = settings.engine.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (coin, ok) in chains.health_check().await {
                    if !ok {
                        warn!("Coin {} health check failed", coin);
                        healthy = false;
                    }
                }
                if let Err(e) = store.health_check().await {
                    warn!("Swap store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Swap engine is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Swaps resume from the store on next start
    engine.shutdown().await;
    chains.stop().await;

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }
    for miner in miners {
        miner.abort();
    }

    info!("Swap engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,swap_engine=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
