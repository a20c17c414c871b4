//! Per-wallet, per-token balances with a write-through cache
//!
//! The durable store is the source of truth. The cache is only written after a
//! commit has succeeded, or on a read miss.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::records::Balance;
use super::store::{DurableStore, StoreError, WriteOp};
use crate::coord::KvStore;
use crate::error::{EngineError, EngineResult};

/// Why a signed delta could not be applied
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceError {
    Underflow { current: Decimal, delta: Decimal },
    Overflow,
}

impl BalanceError {
    pub fn into_store_error(self, wallet: &str, token: &str) -> StoreError {
        match self {
            BalanceError::Underflow { current, delta } => StoreError::InsufficientBalance {
                wallet: wallet.to_string(),
                token: token.to_string(),
                current,
                required: -delta,
            },
            BalanceError::Overflow => StoreError::BalanceOverflow {
                wallet: wallet.to_string(),
                token: token.to_string(),
            },
        }
    }
}

/// Apply a signed delta, rejecting negative results and overflow
pub fn apply_delta(current: Decimal, delta: Decimal) -> Result<Decimal, BalanceError> {
    let next = current
        .checked_add(delta)
        .ok_or(BalanceError::Overflow)?;
    if next.is_sign_negative() && !next.is_zero() {
        return Err(BalanceError::Underflow { current, delta });
    }
    Ok(next)
}

pub struct BalanceLedger {
    store: Arc<dyn DurableStore>,
    kv: Arc<dyn KvStore>,
    cache_ttl: Duration,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn DurableStore>, kv: Arc<dyn KvStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            kv,
            cache_ttl,
        }
    }

    fn cache_key(wallet_address: &str, token_key: &str) -> String {
        format!("balance:{}:{}", wallet_address, token_key)
    }

    /// Current balance, zero when the wallet never held the token
    pub async fn get_balance(&self, wallet_address: &str, token_key: &str) -> EngineResult<Decimal> {
        let key = Self::cache_key(wallet_address, token_key);

        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Balance>(&raw) {
                Ok(balance) => return Ok(balance.amount),
                Err(e) => warn!("Dropping undecodable cached balance {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Balance cache read failed for {}: {}", key, e),
        }

        let balance = self.store.get_balance(wallet_address, token_key).await?;
        match balance {
            Some(balance) => {
                self.cache(&balance).await;
                Ok(balance.amount)
            }
            None => Ok(Decimal::ZERO),
        }
    }

    /// Fail with a typed error when the wallet holds less than `required`
    pub async fn ensure_sufficient(
        &self,
        wallet_address: &str,
        token_key: &str,
        symbol: &str,
        required: Decimal,
    ) -> EngineResult<Decimal> {
        let current = self.get_balance(wallet_address, token_key).await?;
        if current < required {
            return Err(EngineError::InsufficientBalance {
                wallet: wallet_address.to_string(),
                token: symbol.to_string(),
                current,
                required,
            });
        }
        Ok(current)
    }

    /// Build the batch operation for a signed balance change
    pub fn delta(wallet_address: &str, token_key: &str, symbol: &str, delta: Decimal) -> WriteOp {
        WriteOp::ApplyBalanceDelta {
            wallet_address: wallet_address.to_string(),
            token_key: token_key.to_string(),
            symbol: symbol.to_string(),
            delta,
        }
    }

    /// Refresh the cache with rows returned by a committed batch
    pub async fn refresh(&self, balances: &[Balance]) {
        for balance in balances {
            self.cache(balance).await;
        }
    }

    async fn cache(&self, balance: &Balance) {
        let key = Self::cache_key(&balance.wallet_address, &balance.token_key);
        let raw = match serde_json::to_string(balance) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode balance {}: {}", key, e);
                return;
            }
        };
        // A failed cache write only costs a store read later
        if let Err(e) = self.kv.set(&key, &raw, Some(self.cache_ttl)).await {
            warn!("Balance cache write failed for {}: {}", key, e);
            if let Err(e) = self.kv.delete(&key).await {
                warn!("Failed to evict stale cached balance {}: {}", key, e);
            }
        } else {
            debug!("💾 Cached balance {} = {}", key, balance.amount);
        }
    }
}
