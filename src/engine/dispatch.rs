//! Fire-and-forget work dispatch for non-critical side effects
//!
//! Delivery is at-least-once: a job is retried with exponential backoff until
//! it succeeds or the retry budget runs out. Handlers must be idempotent.

use anyhow::Result;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state::{DurableStore, HistoricalSwap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", content = "payload", rename_all = "snake_case")]
pub enum Job {
    RecordHistoricalSwap(HistoricalSwap),
}

impl Job {
    pub fn job_type(&self) -> &'static str {
        match self {
            Job::RecordHistoricalSwap(_) => "record_historical_swap",
        }
    }
}

#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// Queue a job; never waits for it to run
    async fn enqueue(&self, job: Job) -> Result<()>;
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Writes closed-trade records to the durable store
pub struct HistoryWriter {
    store: Arc<dyn DurableStore>,
}

impl HistoryWriter {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for HistoryWriter {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job {
            Job::RecordHistoricalSwap(record) => {
                self.store.insert_historical_swap(record.clone()).await?;
                info!(
                    "📚 Recorded closed trade {} ({} {}, P&L {} SOL)",
                    record.position_id, record.token_symbol, record.close_reason, record.realized_pnl_sol
                );
                Ok(())
            }
        }
    }
}

/// In-process queue drained by one background worker
pub struct QueueDispatcher {
    sender: mpsc::UnboundedSender<Job>,
}

impl QueueDispatcher {
    /// Start the worker; it exits once every dispatcher handle is dropped
    pub fn spawn(handler: Arc<dyn JobHandler>, max_retry_time: Duration) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                run_with_retries(handler.as_ref(), &job, max_retry_time).await;
            }
            debug!("Work dispatcher drained, worker exiting");
        });

        (Self { sender }, worker)
    }
}

async fn run_with_retries(handler: &dyn JobHandler, job: &Job, max_retry_time: Duration) {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(max_retry_time))
        .build();

    let result = backoff::future::retry_notify(
        policy,
        || async { handler.handle(job).await.map_err(backoff::Error::transient) },
        |e: anyhow::Error, wait: Duration| {
            warn!("Job {} failed, retrying in {:?}: {:#}", job.job_type(), wait, e);
        },
    )
    .await;

    if let Err(e) = result {
        error!("Job {} dropped after retries: {:#}", job.job_type(), e);
    }
}

#[async_trait]
impl WorkDispatcher for QueueDispatcher {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let job_type = job.job_type();
        self.sender
            .send(job)
            .map_err(|_| anyhow::anyhow!("work dispatcher worker has stopped"))?;
        debug!("Queued {}", job_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CloseReason, MemoryStore, Position};
    use crate::types::TokenAddress;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record() -> HistoricalSwap {
        let position = Position::new(
            "agent",
            "wallet",
            &TokenAddress::new("Mint"),
            "MNT",
            dec!(100),
            dec!(1),
            "buy".to_string(),
        );
        HistoricalSwap::from_close(&position, dec!(100), dec!(1.5), CloseReason::TakeProfit, Utc::now())
    }

    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("transient");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_history_written_through_queue() {
        let store = Arc::new(MemoryStore::new());
        let (dispatcher, worker) =
            QueueDispatcher::spawn(Arc::new(HistoryWriter::new(store.clone())), Duration::from_secs(5));

        let record = record();
        dispatcher.enqueue(Job::RecordHistoricalSwap(record.clone())).await.unwrap();
        // Redelivery of the same record stays a single row
        dispatcher.enqueue(Job::RecordHistoricalSwap(record.clone())).await.unwrap();
        drop(dispatcher);
        worker.await.unwrap();

        let history = store.historical_swaps();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].realized_pnl_sol, dec!(0.5));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let handler = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let (dispatcher, worker) = QueueDispatcher::spawn(handler.clone(), Duration::from_secs(10));

        dispatcher.enqueue(Job::RecordHistoricalSwap(record())).await.unwrap();
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_job_wire_shape() {
        let json = serde_json::to_value(Job::RecordHistoricalSwap(record())).unwrap();
        assert_eq!(json["job"], "record_historical_swap");
        assert!(json["payload"]["position_id"].is_string());
    }
}
