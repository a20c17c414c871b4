//! Shared fixtures: a scripted market and a fully wired in-memory engine

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AgentConfig, AgentRegistry, EngineConfig};
use crate::coord::{IdempotencyGuard, KvStore, MemoryKv};
use crate::engine::{
    Collaborators, HistoryWriter, PositionEngine, PriceNotifier, PriceTracker, PriceUpdate,
    PurchaseRequest, QueueDispatcher, TradeExecutor, TradeOutcome,
};
use crate::state::{BalanceLedger, MemoryStore, Position, PositionStore};
use crate::triggers::{
    evaluate_dca, evaluate_take_profit, DcaConfig, DcaDecision, DcaLevel, StaleTradeConfig,
    StopLossConfig, TakeProfitConfig, TakeProfitDecision, TakeProfitLevel,
};
use crate::types::{
    from_smallest_units, normalize_address, to_smallest_units, TokenAddress, SOL_DECIMALS, SOL_MINT,
};
use crate::venue::{
    LiquidityCheck, LiquidityReport, PriceVenue, Quote, QuoteRequest, SwapExecution, SwapVenue,
    TokenMetadata, TokenPrice,
};

pub const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const OTHER_MINT: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";
pub const TOKEN_DECIMALS: u32 = 6;
pub const AGENT_ID: &str = "agent-1";

/// Deterministic valid wallet address
pub fn wallet(n: u8) -> String {
    bs58::encode([n; 32]).into_string()
}

/// Agent with stop-loss, a three-level take-profit ladder and two DCA levels
pub fn agent_config(agent_id: &str) -> AgentConfig {
    AgentConfig {
        agent_id: agent_id.to_string(),
        wallet_address: wallet(1),
        simulation: true,
        stop_loss: StopLossConfig {
            enabled: true,
            initial_percentage: dec!(-30),
            ..StopLossConfig::default()
        },
        take_profit: TakeProfitConfig {
            enabled: true,
            levels: vec![
                TakeProfitLevel {
                    target_gain_percent: dec!(50),
                    sell_percent: dec!(25),
                },
                TakeProfitLevel {
                    target_gain_percent: dec!(100),
                    sell_percent: dec!(50),
                },
                TakeProfitLevel {
                    target_gain_percent: dec!(200),
                    sell_percent: dec!(25),
                },
            ],
            moon_bag_percent: None,
        },
        dca: DcaConfig {
            enabled: true,
            levels: vec![
                DcaLevel {
                    drop_percent: dec!(-15),
                    buy_percent: dec!(50),
                },
                DcaLevel {
                    drop_percent: dec!(-30),
                    buy_percent: dec!(100),
                },
            ],
            ..DcaConfig::default()
        },
        stale_trade: StaleTradeConfig::default(),
    }
}

#[derive(Default)]
struct MarketState {
    price: Decimal,
    unpriced: HashSet<String>,
    collapsed: HashSet<String>,
    /// (minimum input amount, impact %), first match wins
    impact_curve: Vec<(Decimal, Decimal)>,
    quote_delay: Duration,
    price_delay: Duration,
    fail_prices: bool,
}

/// Scripted price feed, liquidity check, swap venue and token metadata
pub struct FakeMarket {
    state: Mutex<MarketState>,
}

impl FakeMarket {
    pub fn new(price: Decimal) -> Self {
        Self {
            state: Mutex::new(MarketState {
                price,
                ..MarketState::default()
            }),
        }
    }

    /// Price every token at `price` SOL
    pub fn set_price(&self, price: Decimal) {
        self.state.lock().price = price;
    }

    /// Omit the token from price responses
    pub fn remove_price(&self, mint: &str) {
        self.state.lock().unpriced.insert(normalize_address(mint));
    }

    pub fn collapse(&self, mint: &str) {
        self.state.lock().collapsed.insert(normalize_address(mint));
    }

    pub fn set_impact_curve(&self, curve: Vec<(Decimal, Decimal)>) {
        self.state.lock().impact_curve = curve;
    }

    pub fn set_quote_delay(&self, delay: Duration) {
        self.state.lock().quote_delay = delay;
    }

    pub fn set_price_delay(&self, delay: Duration) {
        self.state.lock().price_delay = delay;
    }

    pub fn fail_prices(&self, fail: bool) {
        self.state.lock().fail_prices = fail;
    }

    fn price(&self) -> Decimal {
        self.state.lock().price
    }
}

#[async_trait]
impl PriceVenue for FakeMarket {
    async fn get_multiple_token_prices(&self, addresses: &[String]) -> Result<Vec<TokenPrice>> {
        let (delay, fail) = {
            let state = self.state.lock();
            (state.price_delay, state.fail_prices)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            anyhow::bail!("price feed unavailable");
        }

        let unpriced = self.state.lock().unpriced.clone();
        let price = self.price();
        Ok(addresses
            .iter()
            .filter(|address| !unpriced.contains(&normalize_address(address)))
            .map(|address| TokenPrice {
                token_address: address.clone(),
                price_sol: price,
                price_usd: Some(price * dec!(150)),
            })
            .collect())
    }
}

#[async_trait]
impl LiquidityCheck for FakeMarket {
    async fn check_liquidity_batch(&self, addresses: &[String]) -> Result<Vec<LiquidityReport>> {
        let collapsed = self.state.lock().collapsed.clone();
        Ok(addresses
            .iter()
            .map(|address| {
                let gone = collapsed.contains(&normalize_address(address));
                LiquidityReport {
                    token_address: address.clone(),
                    has_liquidity: !gone,
                    liquidity_sol: if gone { Decimal::ZERO } else { dec!(500) },
                    has_pairs: !gone,
                    is_rug_pulled: false,
                    error: None,
                }
            })
            .collect())
    }
}

#[async_trait]
impl SwapVenue for FakeMarket {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let delay = self.state.lock().quote_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let buying = request.input_mint == SOL_MINT;
        let price = self.price();

        let (input, out_amount) = if buying {
            let sol = from_smallest_units(request.amount, SOL_DECIMALS);
            (sol, to_smallest_units(sol / price, TOKEN_DECIMALS))
        } else {
            let tokens = from_smallest_units(request.amount, TOKEN_DECIMALS);
            (tokens, to_smallest_units(tokens * price, SOL_DECIMALS))
        };
        let out_amount = out_amount.ok_or_else(|| anyhow::anyhow!("quote out of range"))?;

        let impact = self
            .state
            .lock()
            .impact_curve
            .iter()
            .find(|(min_input, _)| input >= *min_input)
            .map(|(_, impact)| *impact)
            .unwrap_or(Decimal::ZERO);

        Ok(Quote {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            in_amount: request.amount,
            out_amount,
            price_impact_pct: impact,
            payload: serde_json::json!({
                "inAmount": request.amount.to_string(),
                "outAmount": out_amount.to_string(),
            }),
        })
    }

    async fn execute_swap(&self, _quote: &Quote, _wallet_address: &str) -> Result<SwapExecution> {
        anyhow::bail!("live execution is not scripted")
    }
}

#[async_trait]
impl TokenMetadata for FakeMarket {
    async fn get_token_decimals(&self, address: &str) -> Result<u32> {
        if address == SOL_MINT {
            Ok(SOL_DECIMALS)
        } else {
            Ok(TOKEN_DECIMALS)
        }
    }
}

/// Keeps every notification batch
#[derive(Default)]
pub struct RecordingNotifier {
    batches: Mutex<Vec<(String, Vec<PriceUpdate>)>>,
}

impl RecordingNotifier {
    pub fn batches(&self) -> Vec<(String, Vec<PriceUpdate>)> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl PriceNotifier for RecordingNotifier {
    async fn notify(&self, agent_id: &str, updates: Vec<PriceUpdate>) {
        self.batches.lock().push((agent_id.to_string(), updates));
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        reconcile_probability: 0.0,
        quote_timeout: Duration::from_millis(200),
        execute_timeout: Duration::from_secs(1),
        metadata_timeout: Duration::from_secs(1),
        store_tx_timeout: Duration::from_secs(1),
        ..EngineConfig::default()
    }
}

/// An engine over in-memory collaborators, one agent funded with 10 SOL,
/// every token priced at 0.001 SOL
pub struct Harness {
    pub engine: PositionEngine,
    pub executor: Arc<TradeExecutor>,
    pub tracker: Arc<PriceTracker>,
    pub positions: Arc<PositionStore>,
    pub ledger: Arc<BalanceLedger>,
    pub guard: IdempotencyGuard,
    pub store: Arc<MemoryStore>,
    pub kv: Arc<MemoryKv>,
    pub market: Arc<FakeMarket>,
    pub notifier: Arc<RecordingNotifier>,
    pub agent: Arc<AgentConfig>,
}

impl Harness {
    pub async fn new() -> Self {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let market = Arc::new(FakeMarket::new(dec!(0.001)));
        let notifier = Arc::new(RecordingNotifier::default());

        store.set_balance(&wallet(1), &normalize_address(SOL_MINT), "SOL", dec!(10));

        let agent = agent_config(AGENT_ID);
        let agents = Arc::new(AgentRegistry::new(HashMap::from([(
            agent.agent_id.clone(),
            agent,
        )])));

        let (dispatcher, _worker) = QueueDispatcher::spawn(
            Arc::new(HistoryWriter::new(store.clone())),
            Duration::from_secs(5),
        );

        let engine = PositionEngine::new(
            config.clone(),
            agents.clone(),
            Collaborators {
                store: store.clone(),
                kv: kv.clone(),
                prices: market.clone(),
                liquidity: market.clone(),
                swap: market.clone(),
                metadata: market.clone(),
                notifier: notifier.clone(),
                dispatcher: Arc::new(dispatcher),
            },
        );

        Self {
            executor: engine.executor(),
            tracker: engine.tracker(),
            positions: engine.positions(),
            ledger: engine.ledger(),
            guard: IdempotencyGuard::new(kv.clone(), config.idempotency_ttl),
            agent: agents.get(AGENT_ID).expect("agent registered"),
            engine,
            store,
            kv,
            market,
            notifier,
        }
    }

    pub fn purchase(&self, amount_sol: Decimal) -> PurchaseRequest {
        self.purchase_of(MINT, amount_sol)
    }

    pub fn purchase_of(&self, mint: &str, amount_sol: Decimal) -> PurchaseRequest {
        PurchaseRequest {
            agent_id: AGENT_ID.to_string(),
            token: TokenAddress::new(mint),
            token_symbol: if mint == MINT { "TKN" } else { "OTR" }.to_string(),
            amount_sol,
        }
    }

    pub async fn buy(&self, amount_sol: Decimal) -> TradeOutcome {
        self.buy_token(MINT, amount_sol).await
    }

    pub async fn buy_token(&self, mint: &str, amount_sol: Decimal) -> TradeOutcome {
        self.executor
            .execute_purchase(self.purchase_of(mint, amount_sol))
            .await
            .expect("purchase succeeds")
    }

    pub async fn sol_balance(&self) -> Decimal {
        self.ledger
            .get_balance(&wallet(1), &normalize_address(SOL_MINT))
            .await
            .unwrap()
    }

    pub async fn token_balance(&self) -> Decimal {
        self.ledger
            .get_balance(&wallet(1), &normalize_address(MINT))
            .await
            .unwrap()
    }

    pub fn take_profit_decision(&self, position: &Position, price: Decimal) -> TakeProfitDecision {
        evaluate_take_profit(position, price, &self.agent.take_profit).expect("take-profit level crossed")
    }

    pub fn dca_decision(&self, position: &Position, price: Decimal) -> DcaDecision {
        evaluate_dca(position, price, &self.agent.dca, Utc::now()).expect("dca level crossed")
    }

    /// Drop a cached balance so the next read comes from the store
    pub async fn invalidate_balance_cache(&self, token_key: &str) {
        self.kv
            .delete(&format!("balance:{}:{}", wallet(1), token_key))
            .await
            .unwrap();
    }

    pub async fn invalidate_sol_cache(&self) {
        self.invalidate_balance_cache(&normalize_address(SOL_MINT)).await;
    }

    /// Wait for the dispatcher to write queued history records
    pub async fn drain_history(&self) {
        for _ in 0..200 {
            if !self.store.historical_swaps().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
