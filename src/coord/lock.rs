//! Per-position distributed lock
//!
//! Acquisition never blocks: a held lock is reported as
//! [`EngineError::PositionLocked`] and the caller tries again next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::kv::{run_detached, KvError, KvStore};
use crate::error::{EngineError, EngineResult};

/// Proof of lock ownership; only the holder's token can release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn position_key(position_id: Uuid) -> String {
        format!("lock:position:{}", position_id)
    }

    /// Try once to take the lock; `None` when someone else holds it
    pub async fn acquire(&self, key: &str) -> Result<Option<LockToken>, KvError> {
        let token = Uuid::new_v4().to_string();
        if self.kv.set_if_absent(key, &token, self.ttl).await? {
            debug!("🔒 Acquired {}", key);
            Ok(Some(LockToken {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release the lock if this token still owns it
    pub async fn release(&self, lock: &LockToken) -> Result<bool, KvError> {
        let released = self.kv.delete_if_equals(&lock.key, &lock.token).await?;
        if released {
            debug!("🔓 Released {}", lock.key);
        } else {
            warn!("Lock {} expired or was taken over before release", lock.key);
        }
        Ok(released)
    }

    /// Run `f` while holding the position's lock; the lock is released on
    /// every exit path of `f`, including cancellation
    pub async fn with_position_lock<T, F, Fut>(&self, position_id: Uuid, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let key = Self::position_key(position_id);
        let lock = self
            .acquire(&key)
            .await?
            .ok_or(EngineError::PositionLocked(position_id))?;
        let mut held = HeldLock {
            kv: self.kv.clone(),
            lock: Some(lock),
        };

        let result = f().await;

        if let Some(lock) = &held.lock {
            if let Err(e) = self.release(lock).await {
                warn!("Failed to release {}: {} (expires with TTL)", key, e);
            }
        }
        held.lock = None;
        result
    }
}

/// Releases a lock whose holder was dropped before finishing
struct HeldLock {
    kv: Arc<dyn KvStore>,
    lock: Option<LockToken>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        debug!("🔓 Releasing {} after cancellation", lock.key);
        let kv = self.kv.clone();
        run_detached(format!("release {}", lock.key), async move {
            kv.delete_if_equals(&lock.key, &lock.token).await.map(|_| ())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryKv;
    use crate::error::ErrorCode;

    fn lock() -> DistributedLock {
        DistributedLock::new(Arc::new(MemoryKv::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_second_acquire_fails() {
        let lock = lock();
        let first = lock.acquire("lock:x").await.unwrap();
        assert!(first.is_some());
        assert!(lock.acquire("lock:x").await.unwrap().is_none());

        assert!(lock.release(&first.unwrap()).await.unwrap());
        assert!(lock.acquire("lock:x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let lock = lock();
        let id = Uuid::new_v4();

        let result: EngineResult<()> = lock
            .with_position_lock(id, || async { Err(EngineError::Validation("boom".into())) })
            .await;
        assert!(result.is_err());

        // Not stuck
        let again = lock.with_position_lock(id, || async { Ok(7) }).await.unwrap();
        assert_eq!(again, 7);
    }

    #[tokio::test]
    async fn test_nested_attempt_reports_locked() {
        let lock = lock();
        let id = Uuid::new_v4();
        let inner = lock.clone();

        let result = lock
            .with_position_lock(id, || async move {
                inner.with_position_lock(id, || async { Ok(()) }).await
            })
            .await;

        assert_eq!(result.unwrap_err().code(), ErrorCode::PositionLocked);
    }

    #[tokio::test]
    async fn test_cancelled_holder_releases_lock() {
        let lock = lock();
        let id = Uuid::new_v4();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            lock.with_position_lock(id, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let again = lock.with_position_lock(id, || async { Ok(1) }).await.unwrap();
        assert_eq!(again, 1);
    }

    #[tokio::test]
    async fn test_foreign_token_cannot_release() {
        let lock = lock();
        let _held = lock.acquire("lock:y").await.unwrap().unwrap();
        let forged = LockToken {
            key: "lock:y".to_string(),
            token: "forged".to_string(),
        };
        assert!(!lock.release(&forged).await.unwrap());
        assert!(lock.acquire("lock:y").await.unwrap().is_none());
    }
}
