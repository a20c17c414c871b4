//! Position records with a write-through cache over the durable store

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::position::{Position, RiskUpdate};
use super::store::DurableStore;
use crate::coord::KvStore;
use crate::error::EngineResult;

pub struct PositionStore {
    store: Arc<dyn DurableStore>,
    kv: Arc<dyn KvStore>,
    cache_ttl: Duration,
}

impl PositionStore {
    pub fn new(store: Arc<dyn DurableStore>, kv: Arc<dyn KvStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            kv,
            cache_ttl,
        }
    }

    fn cache_key(id: Uuid) -> String {
        format!("position:{}", id)
    }

    /// Cache-first lookup for readers that tolerate slight staleness
    pub async fn get(&self, id: Uuid) -> EngineResult<Option<Position>> {
        let key = Self::cache_key(id);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Position>(&raw) {
                Ok(position) => return Ok(Some(position)),
                Err(e) => warn!("Dropping undecodable cached position {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Position cache read failed for {}: {}", key, e),
        }
        self.load_fresh(id).await
    }

    /// Read straight from the durable store; used under the position lock
    pub async fn load_fresh(&self, id: Uuid) -> EngineResult<Option<Position>> {
        let position = self.store.get_position(id).await?;
        match &position {
            Some(position) => self.cache(position).await,
            None => self.evict(&[id]).await,
        }
        Ok(position)
    }

    pub async fn find_open(
        &self,
        agent_id: &str,
        wallet_address: &str,
        token_key: &str,
    ) -> EngineResult<Option<Position>> {
        Ok(self
            .store
            .find_open_position(agent_id, wallet_address, token_key)
            .await?)
    }

    /// Open positions on a token, always from the durable store
    pub async fn open_for_token(&self, token_key: &str) -> EngineResult<Vec<Position>> {
        Ok(self.store.open_positions_for_token(token_key).await?)
    }

    pub async fn all_open(&self) -> EngineResult<Vec<Position>> {
        Ok(self.store.all_open_positions().await?)
    }

    /// Persist poll-loop risk fields and refresh the cached row
    pub async fn update_risk_state(
        &self,
        id: Uuid,
        update: &RiskUpdate,
    ) -> EngineResult<Option<Position>> {
        if update.is_empty() {
            return Ok(None);
        }
        let updated = self.store.update_risk_state(id, update).await?;
        if let Some(position) = &updated {
            self.cache(position).await;
        }
        Ok(updated)
    }

    /// Refresh cached rows after a committed batch
    pub async fn refresh(&self, positions: &[Position]) {
        for position in positions {
            self.cache(position).await;
        }
    }

    pub async fn evict(&self, ids: &[Uuid]) {
        for id in ids {
            if let Err(e) = self.kv.delete(&Self::cache_key(*id)).await {
                warn!("Failed to evict cached position {}: {}", id, e);
            }
        }
    }

    async fn cache(&self, position: &Position) {
        let key = Self::cache_key(position.id);
        match serde_json::to_string(position) {
            Ok(raw) => {
                if let Err(e) = self.kv.set(&key, &raw, Some(self.cache_ttl)).await {
                    warn!("Position cache write failed for {}: {}", key, e);
                    if let Err(e) = self.kv.delete(&key).await {
                        warn!("Failed to evict stale cached position {}: {}", key, e);
                    }
                } else {
                    debug!("💾 Cached position {}", position.id);
                }
            }
            Err(e) => warn!("Failed to encode position {}: {}", key, e),
        }
    }
}
