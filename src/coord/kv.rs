//! Distributed key-value contract and an in-process TTL implementation

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

/// KV backend failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KvError {
    #[error("KV backend unavailable: {0}")]
    Unavailable(String),
    #[error("KV value could not be decoded: {0}")]
    Decode(String),
}

/// Shared cache and lock provider.
///
/// `set_if_absent` and `delete_if_equals` must be atomic; everything built on
/// top (locks, idempotency claims) relies on that.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Set only when absent (or expired); true when this call wrote the key
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete only when the current value equals `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// DashMap-backed KV with lazy expiry
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));

        match live {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let fresh = StoredValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };

        // The entry API holds the shard lock, making check-and-set atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.is_live(now) && entry.value == expected)
            .is_some())
    }
}

/// Run a KV cleanup write from `Drop`: inline when the backend answers
/// without suspending, otherwise on the current runtime. The TTL still
/// bounds the key when neither is possible.
pub(crate) fn run_detached<F>(what: String, cleanup: F)
where
    F: Future<Output = Result<(), KvError>> + Send + 'static,
{
    let mut cleanup = Box::pin(cleanup);
    match (&mut cleanup).now_or_never() {
        Some(Ok(())) => {}
        Some(Err(e)) => warn!("Failed to {}: {} (expires with TTL)", what, e),
        None => match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cleanup.await {
                        warn!("Failed to {}: {} (expires with TTL)", what, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to {} (expires with TTL)", what),
        },
    }
}
