//! Position Engine
//!
//! Tracks open token positions, reprices them on a fixed interval and runs
//! stop-loss, take-profit, stale-trade and DCA automation for every agent.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use position_engine::config::{load_agents, AgentRegistry, EngineConfig};
use position_engine::coord::MemoryKv;
use position_engine::engine::{
    Collaborators, HistoryWriter, LogNotifier, PositionEngine, QueueDispatcher,
};
use position_engine::state::MemoryStore;
use position_engine::venue::{DexScreenerClient, JupiterClient, RpcTokenMetadata};

/// How often expired KV entries are swept
const KV_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("🚀 Starting Position Engine...");

    // Load configuration
    let config = EngineConfig::from_env()?;
    let agents = load_agents(&config.agents_path)?;
    info!("✅ Configuration loaded successfully");
    info!("⏱️ Poll interval: {:?}", config.poll_interval);
    info!("🤖 Agents: {}", agents.len());
    for agent in agents.values() {
        info!(
            "   {} (wallet {}, {}): SL {} / TP {} / DCA {} / stale {}",
            agent.agent_id,
            agent.wallet_address,
            if agent.simulation { "simulated" } else { "live" },
            agent.stop_loss.enabled,
            agent.take_profit.enabled,
            agent.dca.enabled,
            agent.stale_trade.enabled
        );
    }
    let agents = Arc::new(AgentRegistry::new(agents));

    // Storage and coordination
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKv::new());
    let sweeper = {
        let kv = kv.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KV_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let purged = kv.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired KV entries", purged);
                }
            }
        })
    };

    // Venues
    let jupiter = Arc::new(JupiterClient::new(&config.jupiter_api_url, config.execute_timeout)?);
    let dexscreener = Arc::new(DexScreenerClient::new(
        &config.dexscreener_api_url,
        config.metadata_timeout,
    )?);
    let metadata = Arc::new(RpcTokenMetadata::new(&config.solana_rpc_url, config.metadata_timeout)?);
    info!("✅ Venue clients initialized");

    // History writes go through the background dispatcher
    let (dispatcher, dispatcher_worker) = QueueDispatcher::spawn(
        Arc::new(HistoryWriter::new(store.clone())),
        Duration::from_secs(60),
    );

    let engine = PositionEngine::new(
        config,
        agents,
        Collaborators {
            store,
            kv,
            prices: jupiter.clone(),
            liquidity: dexscreener,
            swap: jupiter,
            metadata,
            notifier: Arc::new(LogNotifier),
            dispatcher: Arc::new(dispatcher),
        },
    );
    engine.start().await?;

    // Wait for shutdown signal
    info!("🎯 Engine is running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    info!("🛑 Shutdown signal received, stopping engine...");

    // Cleanup
    engine.stop().await;
    drop(engine);
    sweeper.abort();
    // The worker drains queued history once the last dispatcher handle is gone
    let _ = tokio::time::timeout(Duration::from_secs(5), dispatcher_worker).await;

    info!("👋 Engine stopped gracefully");
    Ok(())
}

/// Initialize the logging system
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,position_engine=debug"));

    let json_logging = std::env::var("LOG_JSON")
        .map(|v| v == "true")
        .unwrap_or(false);

    if json_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true))
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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
