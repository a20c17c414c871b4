//! Idempotency claims for trigger executions
//!
//! A claim is an atomic set-if-absent with a TTL equal to the expected maximum
//! operation duration. Claims are independent of the position lock.

use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::kv::{run_detached, KvError, KvStore};
use crate::error::{EngineError, EngineResult};

#[derive(Clone)]
pub struct IdempotencyGuard {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Claim `key`; false when it is already claimed
    pub async fn check_and_set(&self, key: &str, ttl: Option<Duration>) -> Result<bool, KvError> {
        self.kv
            .set_if_absent(key, "1", ttl.unwrap_or(self.ttl))
            .await
    }

    pub async fn is_in_progress(&self, key: &str) -> Result<bool, KvError> {
        self.kv.exists(key).await
    }

    pub async fn clear(&self, key: &str) -> Result<(), KvError> {
        self.kv.delete(key).await
    }

    /// Run `f` under a claim on `key`, clearing the claim afterwards whatever
    /// the outcome, cancellation included
    pub async fn with_claim<T, F, Fut>(&self, key: &str, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if !self.check_and_set(key, None).await? {
            return Err(EngineError::AlreadyInProgress(key.to_string()));
        }
        let mut held = HeldClaim {
            kv: self.kv.clone(),
            key: Some(key.to_string()),
        };

        let result = f().await;

        if let Err(e) = self.clear(key).await {
            warn!("Failed to clear idempotency claim {}: {} (expires with TTL)", key, e);
        }
        held.key = None;
        result
    }
}

/// Clears a claim whose holder was dropped before finishing
struct HeldClaim {
    kv: Arc<dyn KvStore>,
    key: Option<String>,
}

impl Drop for HeldClaim {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let kv = self.kv.clone();
        run_detached(format!("clear idempotency claim {}", key), async move {
            kv.delete(&key).await
        });
    }
}

/// Claim keys, one per trigger instance
pub mod keys {
    use super::*;

    pub fn purchase(agent_id: &str, wallet: &str, token_key: &str) -> String {
        format!("idem:purchase:{}:{}:{}", agent_id, wallet, token_key)
    }

    pub fn sale(position_id: Uuid) -> String {
        format!("idem:sale:{}", position_id)
    }

    pub fn take_profit(position_id: Uuid, levels_hit: u32, level_count: usize) -> String {
        format!("idem:tp:{}:{}:{}", position_id, levels_hit, level_count)
    }

    pub fn dca(position_id: Uuid, dca_count: u32, drop_percent: Decimal) -> String {
        format!("idem:dca:{}:{}:{}", position_id, dca_count, drop_percent.normalize())
    }

    /// Set after an insufficient-funds DCA failure so the venue is not hit every tick
    pub fn dca_suspend(position_id: Uuid) -> String {
        format!("idem:dca_suspend:{}", position_id)
    }

    pub fn write_off(position_id: Uuid) -> String {
        format!("idem:write_off:{}", position_id)
    }
}
