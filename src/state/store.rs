//! Durable store contract and the in-memory transactional implementation
//!
//! Writes go through [`DurableStore::commit`] as one batch: every operation is
//! staged and validated first, and nothing becomes visible unless the whole
//! batch succeeds.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::ledger::apply_delta;
use super::position::{Position, RiskUpdate};
use super::records::{Balance, HistoricalSwap, TradeRecord};

/// Durable store failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Open position already exists for agent {agent_id} / wallet {wallet} / token {token}")]
    DuplicatePosition {
        agent_id: String,
        wallet: String,
        token: String,
    },
    #[error("Position {0} not found")]
    PositionNotFound(Uuid),
    #[error("Position {0} was modified concurrently")]
    StaleWrite(Uuid),
    #[error("Insufficient {token} balance in {wallet}: have {current}, need {required}")]
    InsufficientBalance {
        wallet: String,
        token: String,
        current: Decimal,
        required: Decimal,
    },
    #[error("Balance overflow for {wallet}/{token}")]
    BalanceOverflow { wallet: String, token: String },
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// One write inside a transaction batch
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertTrade(TradeRecord),
    ApplyBalanceDelta {
        wallet_address: String,
        token_key: String,
        symbol: String,
        delta: Decimal,
    },
    InsertPosition(Position),
    /// Replace a position row; `expected_updated_at` guards against lost
    /// updates of trade state, risk columns are merged with the stored row
    UpdatePosition {
        position: Position,
        expected_updated_at: chrono::DateTime<Utc>,
    },
    DeletePosition(Uuid),
}

/// Rows touched by a committed batch, used to refresh caches afterwards
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub balances: Vec<Balance>,
    pub upserted_positions: Vec<Position>,
    pub deleted_positions: Vec<Uuid>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Apply a batch atomically
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<CommitReceipt, StoreError>;

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;

    async fn find_open_position(
        &self,
        agent_id: &str,
        wallet_address: &str,
        token_key: &str,
    ) -> Result<Option<Position>, StoreError>;

    async fn open_positions_for_token(&self, token_key: &str) -> Result<Vec<Position>, StoreError>;

    async fn all_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Single-row update of the poll-loop risk fields only; leaves
    /// `updated_at` alone
    async fn update_risk_state(
        &self,
        id: Uuid,
        update: &RiskUpdate,
    ) -> Result<Option<Position>, StoreError>;

    async fn get_balance(
        &self,
        wallet_address: &str,
        token_key: &str,
    ) -> Result<Option<Balance>, StoreError>;

    async fn insert_historical_swap(&self, record: HistoricalSwap) -> Result<(), StoreError>;

    async fn trades_for_position(&self, position_id: Uuid) -> Result<Vec<TradeRecord>, StoreError>;
}

type BalanceKey = (String, String);
type PositionTuple = (String, String, String);

#[derive(Default)]
struct Tables {
    positions: HashMap<Uuid, Position>,
    open_index: HashMap<PositionTuple, Uuid>,
    balances: HashMap<BalanceKey, Balance>,
    trades: Vec<TradeRecord>,
    history: HashMap<Uuid, HistoricalSwap>,
}

fn tuple_of(position: &Position) -> PositionTuple {
    (
        position.agent_id.clone(),
        position.wallet_address.clone(),
        position.token_key.clone(),
    )
}

/// In-memory store used by the binary and tests
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance directly (funding a wallet outside of trades)
    pub fn set_balance(&self, wallet_address: &str, token_key: &str, symbol: &str, amount: Decimal) {
        let mut tables = self.tables.lock();
        tables.balances.insert(
            (wallet_address.to_string(), token_key.to_string()),
            Balance {
                wallet_address: wallet_address.to_string(),
                token_key: token_key.to_string(),
                symbol: symbol.to_string(),
                amount,
                last_updated: Utc::now(),
            },
        );
    }

    pub fn historical_swaps(&self) -> Vec<HistoricalSwap> {
        self.tables.lock().history.values().cloned().collect()
    }

    pub fn trade_count(&self) -> usize {
        self.tables.lock().trades.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<CommitReceipt, StoreError> {
        let mut tables = self.tables.lock();

        // Stage every write against overlays; the tables stay untouched until
        // the whole batch validates.
        let mut staged_positions: HashMap<Uuid, Option<Position>> = HashMap::new();
        let mut staged_index: HashMap<PositionTuple, Option<Uuid>> = HashMap::new();
        let mut staged_balances: HashMap<BalanceKey, Balance> = HashMap::new();
        let mut staged_trades = Vec::new();
        let now = Utc::now();

        for op in ops {
            match op {
                WriteOp::InsertTrade(trade) => staged_trades.push(trade),
                WriteOp::ApplyBalanceDelta {
                    wallet_address,
                    token_key,
                    symbol,
                    delta,
                } => {
                    let key = (wallet_address.clone(), token_key.clone());
                    let current = staged_balances
                        .get(&key)
                        .or_else(|| tables.balances.get(&key))
                        .map(|b| b.amount)
                        .unwrap_or(Decimal::ZERO);
                    let amount = apply_delta(current, delta).map_err(|e| e.into_store_error(&wallet_address, &symbol))?;
                    staged_balances.insert(
                        key,
                        Balance {
                            wallet_address,
                            token_key,
                            symbol,
                            amount,
                            last_updated: now,
                        },
                    );
                }
                WriteOp::InsertPosition(position) => {
                    position.check_invariants().map_err(StoreError::Invariant)?;
                    let tuple = tuple_of(&position);
                    let occupied = match staged_index.get(&tuple) {
                        Some(slot) => slot.is_some(),
                        None => tables.open_index.contains_key(&tuple),
                    };
                    if occupied {
                        return Err(StoreError::DuplicatePosition {
                            agent_id: tuple.0,
                            wallet: tuple.1,
                            token: tuple.2,
                        });
                    }
                    staged_index.insert(tuple, Some(position.id));
                    staged_positions.insert(position.id, Some(position));
                }
                WriteOp::UpdatePosition {
                    position,
                    expected_updated_at,
                } => {
                    position.check_invariants().map_err(StoreError::Invariant)?;
                    let existing = match staged_positions.get(&position.id) {
                        Some(slot) => slot.clone(),
                        None => tables.positions.get(&position.id).cloned(),
                    }
                    .ok_or(StoreError::PositionNotFound(position.id))?;
                    if existing.updated_at != expected_updated_at {
                        return Err(StoreError::StaleWrite(position.id));
                    }
                    // Risk columns move independently of trades
                    let mut position = position;
                    position.merge_risk_state(&existing);
                    staged_positions.insert(position.id, Some(position));
                }
                WriteOp::DeletePosition(id) => {
                    let existing = match staged_positions.get(&id) {
                        Some(slot) => slot.clone(),
                        None => tables.positions.get(&id).cloned(),
                    }
                    .ok_or(StoreError::PositionNotFound(id))?;
                    staged_index.insert(tuple_of(&existing), None);
                    staged_positions.insert(id, None);
                }
            }
        }

        // Apply
        let mut receipt = CommitReceipt::default();
        for (key, balance) in staged_balances {
            receipt.balances.push(balance.clone());
            tables.balances.insert(key, balance);
        }
        for (tuple, slot) in staged_index {
            match slot {
                Some(id) => tables.open_index.insert(tuple, id),
                None => tables.open_index.remove(&tuple),
            };
        }
        for (id, slot) in staged_positions {
            match slot {
                Some(position) => {
                    receipt.upserted_positions.push(position.clone());
                    tables.positions.insert(id, position);
                }
                None => {
                    receipt.deleted_positions.push(id);
                    tables.positions.remove(&id);
                }
            }
        }
        tables.trades.extend(staged_trades);

        Ok(receipt)
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.tables.lock().positions.get(&id).cloned())
    }

    async fn find_open_position(
        &self,
        agent_id: &str,
        wallet_address: &str,
        token_key: &str,
    ) -> Result<Option<Position>, StoreError> {
        let tables = self.tables.lock();
        let tuple = (
            agent_id.to_string(),
            wallet_address.to_string(),
            token_key.to_string(),
        );
        Ok(tables
            .open_index
            .get(&tuple)
            .and_then(|id| tables.positions.get(id))
            .cloned())
    }

    async fn open_positions_for_token(&self, token_key: &str) -> Result<Vec<Position>, StoreError> {
        Ok(self
            .tables
            .lock()
            .positions
            .values()
            .filter(|p| p.token_key == token_key)
            .cloned()
            .collect())
    }

    async fn all_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.tables.lock().positions.values().cloned().collect())
    }

    async fn update_risk_state(
        &self,
        id: Uuid,
        update: &RiskUpdate,
    ) -> Result<Option<Position>, StoreError> {
        let mut tables = self.tables.lock();
        Ok(tables.positions.get_mut(&id).map(|position| {
            position.apply_risk_update(update, Utc::now());
            position.clone()
        }))
    }

    async fn get_balance(
        &self,
        wallet_address: &str,
        token_key: &str,
    ) -> Result<Option<Balance>, StoreError> {
        Ok(self
            .tables
            .lock()
            .balances
            .get(&(wallet_address.to_string(), token_key.to_string()))
            .cloned())
    }

    async fn insert_historical_swap(&self, record: HistoricalSwap) -> Result<(), StoreError> {
        // Keyed by position so at-least-once redelivery stays a single row
        self.tables.lock().history.insert(record.position_id, record);
        Ok(())
    }

    async fn trades_for_position(&self, position_id: Uuid) -> Result<Vec<TradeRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .trades
            .iter()
            .filter(|t| t.position_id == Some(position_id))
            .cloned()
            .collect())
    }
}
