//! Position engine wiring and lifecycle

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AgentRegistry, EngineConfig};
use crate::coord::{DistributedLock, IdempotencyGuard, KvStore};
use crate::engine::dispatch::WorkDispatcher;
use crate::engine::events::PositionEventBus;
use crate::engine::executor::TradeExecutor;
use crate::engine::tracker::{PriceNotifier, PriceTracker};
use crate::error::EngineResult;
use crate::state::{BalanceLedger, DurableStore, PositionStore};
use crate::venue::{LiquidityCheck, PriceVenue, SwapVenue, TokenMetadata};

/// External services the engine is built on
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub kv: Arc<dyn KvStore>,
    pub prices: Arc<dyn PriceVenue>,
    pub liquidity: Arc<dyn LiquidityCheck>,
    pub swap: Arc<dyn SwapVenue>,
    pub metadata: Arc<dyn TokenMetadata>,
    pub notifier: Arc<dyn PriceNotifier>,
    pub dispatcher: Arc<dyn WorkDispatcher>,
}

/// Owns every engine component; constructed once by process wiring
pub struct PositionEngine {
    events: PositionEventBus,
    positions: Arc<PositionStore>,
    ledger: Arc<BalanceLedger>,
    executor: Arc<TradeExecutor>,
    tracker: Arc<PriceTracker>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PositionEngine {
    pub fn new(config: EngineConfig, agents: Arc<AgentRegistry>, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            kv,
            prices,
            liquidity,
            swap,
            metadata,
            notifier,
            dispatcher,
        } = collaborators;

        let events = PositionEventBus::default();
        let positions = Arc::new(PositionStore::new(store.clone(), kv.clone(), config.cache_ttl));
        let ledger = Arc::new(BalanceLedger::new(store.clone(), kv.clone(), config.cache_ttl));
        let lock = DistributedLock::new(kv.clone(), config.lock_ttl);
        let guard = IdempotencyGuard::new(kv.clone(), config.idempotency_ttl);

        let executor = Arc::new(TradeExecutor::new(
            config.clone(),
            agents.clone(),
            store,
            positions.clone(),
            ledger.clone(),
            lock,
            guard.clone(),
            swap,
            metadata,
            events.clone(),
            dispatcher,
        ));

        let tracker = Arc::new(PriceTracker::new(
            config,
            agents,
            positions.clone(),
            ledger.clone(),
            guard,
            kv,
            executor.clone(),
            prices,
            liquidity,
            notifier,
        ));

        let (shutdown, _) = watch::channel(false);

        Self {
            events,
            positions,
            ledger,
            executor,
            tracker,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn executor(&self) -> Arc<TradeExecutor> {
        self.executor.clone()
    }

    pub fn tracker(&self) -> Arc<PriceTracker> {
        self.tracker.clone()
    }

    pub fn positions(&self) -> Arc<PositionStore> {
        self.positions.clone()
    }

    pub fn ledger(&self) -> Arc<BalanceLedger> {
        self.ledger.clone()
    }

    pub fn events(&self) -> &PositionEventBus {
        &self.events
    }

    /// Load the tracking set, then start the event listener and the poll loop
    pub async fn start(&self) -> EngineResult<()> {
        if !self.tasks.lock().is_empty() {
            warn!("Position engine already started");
            return Ok(());
        }

        // Subscribe before reconciling so nothing published in between is lost
        let events = self.events.subscribe();
        let tracked = self.tracker.reconcile().await?;
        self.shutdown.send_replace(false);

        let listener = tokio::spawn(
            self.tracker
                .clone()
                .follow_events(events, self.shutdown.subscribe()),
        );
        let poller = tokio::spawn(self.tracker.clone().run(self.shutdown.subscribe()));

        self.tasks.lock().extend([listener, poller]);

        info!("🚀 Position engine started, tracking {} tokens", tracked);
        Ok(())
    }

    /// Signal shutdown and wait for the background tasks to exit
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        info!("🛑 Position engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{Harness, MINT};
    use crate::types::normalize_address;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_started_engine_tracks_new_positions() {
        let h = Harness::new().await;
        h.engine.start().await.unwrap();

        h.buy(dec!(1)).await;

        let key = normalize_address(MINT);
        let mut tracked = false;
        for _ in 0..50 {
            if h.tracker.is_tracking(&key) {
                tracked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tracked);

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_start_reconciles_existing_positions() {
        let h = Harness::new().await;
        h.buy(dec!(1)).await;

        h.engine.start().await.unwrap();
        assert!(h.tracker.is_tracking(&normalize_address(MINT)));

        // A second start is a no-op
        h.engine.start().await.unwrap();
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_cycle_in_flight() {
        let h = Harness::new().await;
        h.buy(dec!(1)).await;
        h.market.set_price_delay(Duration::from_millis(100));

        // The first tick fires immediately and parks in the price fetch
        h.engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.stop().await;

        assert!(h.tracker.last_update(&normalize_address(MINT)).is_some());
    }
}
