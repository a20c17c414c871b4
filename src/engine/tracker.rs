//! Price tracker and poll loop
//!
//! Keeps the set of tokens with at least one open position, polls their prices
//! on a fixed interval and runs the trigger chain for every open position on a
//! repriced token. Trades are delegated to the [`TradeExecutor`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AgentConfig, AgentRegistry, EngineConfig};
use crate::coord::{keys, IdempotencyGuard, KvStore};
use crate::engine::events::PositionEvent;
use crate::engine::executor::TradeExecutor;
use crate::error::{with_timeout, EngineError, EngineResult, ErrorCode};
use crate::state::{BalanceLedger, CloseReason, Position, PositionStore};
use crate::triggers::{evaluate_dca, evaluate_stale_trade, evaluate_stop_loss, evaluate_take_profit};
use crate::types::{normalize_address, SOL_MINT};
use crate::venue::{LiquidityCheck, PriceVenue, TokenPrice};

/// One repriced token, as pushed to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub token_address: String,
    pub token_symbol: String,
    pub price_sol: Decimal,
    pub price_usd: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Outbound price notifications, one batch per agent per poll cycle
#[async_trait]
pub trait PriceNotifier: Send + Sync {
    async fn notify(&self, agent_id: &str, updates: Vec<PriceUpdate>);
}

/// Notifier that only logs
pub struct LogNotifier;

#[async_trait]
impl PriceNotifier for LogNotifier {
    async fn notify(&self, agent_id: &str, updates: Vec<PriceUpdate>) {
        debug!("💹 {} price updates for agent {}", updates.len(), agent_id);
    }
}

#[derive(Debug, Clone)]
struct TrackedToken {
    /// Original casing for venue calls
    address: String,
    symbol: String,
    agents: HashSet<String>,
    last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    fetched_at: Instant,
}

/// What one poll cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Another cycle was still running
    pub skipped: bool,
    pub tokens_polled: usize,
    pub prices_received: usize,
    pub positions_evaluated: usize,
    pub trades_executed: usize,
    pub write_offs: usize,
}

/// Resets the single-flight flag when a cycle ends, however it ends
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PriceTracker {
    config: EngineConfig,
    agents: Arc<AgentRegistry>,
    positions: Arc<PositionStore>,
    ledger: Arc<BalanceLedger>,
    guard: IdempotencyGuard,
    kv: Arc<dyn KvStore>,
    executor: Arc<TradeExecutor>,
    prices: Arc<dyn PriceVenue>,
    liquidity: Arc<dyn LiquidityCheck>,
    notifier: Arc<dyn PriceNotifier>,
    /// Normalized token address -> tracking entry
    tracked: DashMap<String, TrackedToken>,
    price_cache: DashMap<String, CachedPrice>,
    polling: AtomicBool,
    error_count: AtomicU64,
}

impl PriceTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        agents: Arc<AgentRegistry>,
        positions: Arc<PositionStore>,
        ledger: Arc<BalanceLedger>,
        guard: IdempotencyGuard,
        kv: Arc<dyn KvStore>,
        executor: Arc<TradeExecutor>,
        prices: Arc<dyn PriceVenue>,
        liquidity: Arc<dyn LiquidityCheck>,
        notifier: Arc<dyn PriceNotifier>,
    ) -> Self {
        Self {
            config,
            agents,
            positions,
            ledger,
            guard,
            kv,
            executor,
            prices,
            liquidity,
            notifier,
            tracked: DashMap::new(),
            price_cache: DashMap::new(),
            polling: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
        }
    }

    // ---------------------------------------------------------------------
    // Tracking set
    // ---------------------------------------------------------------------

    pub fn track(&self, position: &Position) {
        let mut entry = self
            .tracked
            .entry(position.token_key.clone())
            .or_insert_with(|| TrackedToken {
                address: position.token_address.clone(),
                symbol: position.token_symbol.clone(),
                agents: HashSet::new(),
                last_update: None,
            });
        if entry.agents.insert(position.agent_id.clone()) {
            debug!("👀 Tracking {} for agent {}", position.token_symbol, position.agent_id);
        }
    }

    /// Drop the agent from the token; the token goes once no agent is left
    pub fn untrack(&self, position: &Position) {
        let emptied = match self.tracked.get_mut(&position.token_key) {
            Some(mut entry) => {
                entry.agents.remove(&position.agent_id);
                entry.agents.is_empty()
            }
            None => false,
        };
        if emptied {
            self.tracked.remove(&position.token_key);
            self.price_cache.remove(&position.token_key);
            debug!("Stopped tracking {}", position.token_symbol);
        }
    }

    pub fn handle_event(&self, event: &PositionEvent) {
        match event {
            PositionEvent::Created(position) | PositionEvent::Updated(position) => self.track(position),
            PositionEvent::Closed { position, .. } => self.untrack(position),
        }
    }

    pub fn is_tracking(&self, token_key: &str) -> bool {
        self.tracked.contains_key(token_key)
    }

    /// When the token was last repriced
    pub fn last_update(&self, token_key: &str) -> Option<DateTime<Utc>> {
        self.tracked.get(token_key).and_then(|token| token.last_update)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Cycle-level failures since start
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Rebuild the tracking set from the durable store
    pub async fn reconcile(&self) -> EngineResult<usize> {
        let open = self.positions.all_open().await?;

        let mut desired: HashMap<String, TrackedToken> = HashMap::new();
        for position in &open {
            desired
                .entry(position.token_key.clone())
                .or_insert_with(|| TrackedToken {
                    address: position.token_address.clone(),
                    symbol: position.token_symbol.clone(),
                    agents: HashSet::new(),
                    last_update: None,
                })
                .agents
                .insert(position.agent_id.clone());
        }

        self.tracked.retain(|key, _| desired.contains_key(key));
        self.price_cache.retain(|key, _| desired.contains_key(key));
        for (key, token) in desired {
            match self.tracked.get_mut(&key) {
                Some(mut existing) => existing.agents = token.agents,
                None => {
                    self.tracked.insert(key, token);
                }
            }
        }

        debug!("🔄 Reconciled tracking set: {} tokens, {} positions", self.tracked.len(), open.len());
        Ok(self.tracked.len())
    }

    // ---------------------------------------------------------------------
    // Loops
    // ---------------------------------------------------------------------

    /// Poll on a fixed interval until shutdown. Each tick runs in its own
    /// task so a slow cycle makes later ticks skip instead of queueing; the
    /// cycle in flight at shutdown is awaited before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("⏱️ Price polling every {:?}", self.config.poll_interval);

        let mut in_flight: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if in_flight.as_ref().is_some_and(|cycle| !cycle.is_finished()) {
                        debug!("Previous poll still running, skipping tick");
                        continue;
                    }
                    let tracker = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move {
                        if let Err(e) = tracker.poll_once().await {
                            error!("Poll cycle failed: {}", e);
                        }
                    }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(cycle) = in_flight {
            if let Err(e) = cycle.await {
                warn!("Final poll cycle ended abnormally: {}", e);
            }
        }
        info!("Price polling stopped");
    }

    /// Keep the tracking set in step with position events
    pub async fn follow_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PositionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event listener lagged by {} events, reconciling", missed);
                        if let Err(e) = self.reconcile().await {
                            error!("Reconciliation after lag failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Event listener stopped");
    }

    // ---------------------------------------------------------------------
    // Poll cycle
    // ---------------------------------------------------------------------

    /// Run one poll cycle; returns `skipped` when a cycle is already running
    pub async fn poll_once(&self) -> EngineResult<PollStats> {
        if self.polling.swap(true, Ordering::AcqRel) {
            debug!("Previous poll still running, skipping tick");
            return Ok(PollStats {
                skipped: true,
                ..PollStats::default()
            });
        }
        let _guard = PollGuard(&self.polling);

        let result = self.poll_cycle().await;
        if result.is_err() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn poll_cycle(&self) -> EngineResult<PollStats> {
        if rand::random::<f64>() < self.config.reconcile_probability {
            self.reconcile().await?;
        }

        let addresses: Vec<String> = self.tracked.iter().map(|entry| entry.address.clone()).collect();
        let mut stats = PollStats {
            tokens_polled: addresses.len(),
            ..PollStats::default()
        };
        if addresses.is_empty() {
            return Ok(stats);
        }

        let prices = with_timeout(
            "price fetch",
            self.config.quote_timeout,
            self.prices.get_multiple_token_prices(&addresses),
        )
        .await?;
        stats.prices_received = prices.len();

        let mut priced: HashSet<String> = HashSet::new();
        let mut notifications: HashMap<String, Vec<PriceUpdate>> = HashMap::new();
        let now = Utc::now();

        for price in prices {
            let key = normalize_address(&price.token_address);
            if price.price_sol <= Decimal::ZERO {
                continue;
            }
            priced.insert(key.clone());

            if self.is_unchanged(&key, price.price_sol) {
                continue;
            }
            self.cache_price(&key, &price).await;

            let Some((symbol, agents)) = self.tracked.get_mut(&key).map(|mut token| {
                token.last_update = Some(now);
                (token.symbol.clone(), token.agents.clone())
            }) else {
                continue;
            };

            for agent_id in agents {
                notifications.entry(agent_id).or_default().push(PriceUpdate {
                    token_address: price.token_address.clone(),
                    token_symbol: symbol.clone(),
                    price_sol: price.price_sol,
                    price_usd: price.price_usd,
                    timestamp: now,
                });
            }

            // Membership comes from the store, not the tracking map
            let open = match self.positions.open_for_token(&key).await {
                Ok(open) => open,
                Err(e) => {
                    error!("Failed to load positions for {}: {}", symbol, e);
                    continue;
                }
            };
            for position in open {
                stats.positions_evaluated += 1;
                let position_id = position.id;
                match self.evaluate_position(position, price.price_sol).await {
                    Ok(trades) => stats.trades_executed += trades,
                    Err(e) => log_failure(position_id, &e),
                }
            }
        }

        let missing: Vec<String> = addresses
            .into_iter()
            .filter(|address| !priced.contains(&normalize_address(address)))
            .collect();
        if !missing.is_empty() {
            stats.write_offs = self.check_liquidity(&missing).await;
        }

        for (agent_id, updates) in notifications {
            self.notifier.notify(&agent_id, updates).await;
        }

        Ok(stats)
    }

    fn is_unchanged(&self, key: &str, price: Decimal) -> bool {
        self.price_cache
            .get(key)
            .map(|cached| cached.price == price && cached.fetched_at.elapsed() < self.config.price_cache_ttl)
            .unwrap_or(false)
    }

    async fn cache_price(&self, key: &str, price: &TokenPrice) {
        self.price_cache.insert(
            key.to_string(),
            CachedPrice {
                price: price.price_sol,
                fetched_at: Instant::now(),
            },
        );
        match serde_json::to_string(price) {
            Ok(raw) => {
                if let Err(e) = self
                    .kv
                    .set(&format!("price:{}", key), &raw, Some(self.config.price_cache_ttl))
                    .await
                {
                    warn!("Failed to share price for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode price for {}: {}", key, e),
        }
    }

    /// Run the trigger chain for one position; returns the number of trades
    async fn evaluate_position(&self, position: Position, price: Decimal) -> EngineResult<usize> {
        let Some(agent) = self.agents.get(&position.agent_id) else {
            debug!("No settings for agent {}, skipping {}", position.agent_id, position.id);
            return Ok(0);
        };
        let mut trades = 0;

        // Stop-loss, with the lifetime low persisted alongside
        let decision = evaluate_stop_loss(&position, price, &agent.stop_loss);
        let mut update = decision
            .as_ref()
            .and_then(|d| d.risk_update())
            .unwrap_or_default();
        if position.lowest_price.map_or(true, |low| price < low) {
            update.lowest_price = Some(price);
        }
        if !update.is_empty() {
            self.positions.update_risk_state(position.id, &update).await?;
        }
        if let Some(decision) = decision.filter(|d| d.should_trigger) {
            info!(
                "🛑 Stop-loss hit for {}: {} <= {} (peak {}, {}%)",
                position.token_symbol,
                price,
                decision.stop_loss_price,
                decision.peak_price,
                decision.current_stop_loss_percentage
            );
            self.executor.execute_sale(position.id, CloseReason::StopLoss).await?;
            return Ok(1);
        }

        // Take-profit; the position may continue with what is left
        let mut position = position;
        if let Some(decision) = evaluate_take_profit(&position, price, &agent.take_profit)
            .filter(|d| d.should_execute)
        {
            info!(
                "🎯 Take-profit levels {:?} hit for {} at {}",
                decision.levels_to_execute, position.token_symbol, price
            );
            let outcome = self
                .executor
                .execute_take_profit_sale(position.id, &decision)
                .await?;
            trades += 1;
            match outcome.position {
                Some(remaining) if !outcome.closed => position = remaining,
                _ => return Ok(trades),
            }
        }

        if evaluate_stale_trade(&position, price, &agent.stale_trade, Utc::now()) {
            info!(
                "💤 Stale trade {} after {} minutes at {}",
                position.token_symbol,
                position.age_minutes(Utc::now()),
                price
            );
            self.executor.execute_sale(position.id, CloseReason::StaleTrade).await?;
            return Ok(trades + 1);
        }

        if self.try_dca(&agent, &position, price).await? {
            trades += 1;
        }
        Ok(trades)
    }

    /// DCA with the call-site pre-checks; true when a buy executed
    async fn try_dca(&self, agent: &AgentConfig, position: &Position, price: Decimal) -> EngineResult<bool> {
        let Some(decision) = evaluate_dca(position, price, &agent.dca, Utc::now()).filter(|d| d.should_trigger)
        else {
            return Ok(false);
        };

        let suspend = keys::dca_suspend(position.id);
        if self.guard.is_in_progress(&suspend).await? {
            debug!("DCA for {} suspended after a funding failure", position.id);
            return Ok(false);
        }
        let level_key = keys::dca(position.id, decision.dca_count, decision.drop_percent);
        if self.guard.is_in_progress(&level_key).await? {
            debug!("DCA level {} for {} already running", decision.trigger_level, position.id);
            return Ok(false);
        }
        let available = self
            .ledger
            .get_balance(&position.wallet_address, &normalize_address(SOL_MINT))
            .await?;
        if available < decision.buy_amount_sol {
            warn!(
                "💸 DCA for {} needs {} SOL, wallet has {}; suspending for {:?}",
                position.token_symbol, decision.buy_amount_sol, available, self.config.dca_suspend_window
            );
            self.guard
                .check_and_set(&suspend, Some(self.config.dca_suspend_window))
                .await?;
            return Ok(false);
        }

        info!(
            "📉 DCA level {} ({}%) for {} at {}, buying {} SOL",
            decision.trigger_level, decision.drop_percent, position.token_symbol, price, decision.buy_amount_sol
        );
        self.executor.execute_dca_buy(position.id, &decision).await?;
        Ok(true)
    }

    /// Write off every position on tokens whose market has collapsed
    async fn check_liquidity(&self, addresses: &[String]) -> usize {
        let reports = match with_timeout(
            "liquidity check",
            self.config.metadata_timeout,
            self.liquidity.check_liquidity_batch(addresses),
        )
        .await
        {
            Ok(reports) => reports,
            Err(e) => {
                warn!("Liquidity check for {} unpriced tokens failed: {}", addresses.len(), e);
                return 0;
            }
        };

        let mut written_off = 0;
        for report in reports {
            if !report.is_collapsed(self.config.liquidity_collapse_sol) {
                continue;
            }
            warn!(
                "🚨 Liquidity collapse on {} ({} SOL, pairs: {}, rugged: {})",
                report.token_address, report.liquidity_sol, report.has_pairs, report.is_rug_pulled
            );
            let key = normalize_address(&report.token_address);
            let open = match self.positions.open_for_token(&key).await {
                Ok(open) => open,
                Err(e) => {
                    error!("Failed to load positions for {}: {}", report.token_address, e);
                    continue;
                }
            };
            for position in open {
                match self
                    .executor
                    .execute_write_off(position.id, CloseReason::LiquidityCollapse)
                    .await
                {
                    Ok(_) => written_off += 1,
                    Err(e) => log_failure(position.id, &e),
                }
            }
        }
        written_off
    }
}

/// Log a per-position failure at the level its kind deserves
fn log_failure(position_id: Uuid, err: &EngineError) {
    match err.code() {
        _ if err.is_expected() => debug!("Position {} skipped this tick: {}", position_id, err),
        ErrorCode::InsufficientBalance => warn!("Position {}: {}", position_id, err),
        code => {
            let mut chain = err.to_string();
            let mut source = err.source();
            while let Some(cause) = source {
                chain.push_str(": ");
                chain.push_str(&cause.to_string());
                source = cause.source();
            }
            error!("❌ Position {} failed [{}]: {}", position_id, code, chain);
        }
    }
}
