//! Long-running supervisor tying the pipeline together.
//!
//! Wires the subscription channel into the ingestion fan-out, starts the
//! subscriptions, then ticks: reconnect dead sessions, flush pending
//! samples, and give the sink a recovery chance so a healed store drains
//! the spool even without new traffic. Shutdown is ordered so nothing is
//! lost: subscriptions stop first, the fan-out drains the channel, and one
//! final flush runs under a deadline that cannot be cancelled.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::ingest::{IngestionPipeline, FANOUT_WORKERS};
use crate::model::Sample;
use crate::sink::BatchSink;
use crate::subscription::{SubscriptionError, SubscriptionManager};

/// Deadline for the final flush at shutdown.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),
}

pub struct Worker {
    manager: Arc<SubscriptionManager>,
    pipeline: Arc<IngestionPipeline>,
    sink: Arc<BatchSink>,
    flush_interval: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        pipeline: Arc<IngestionPipeline>,
        sink: Arc<BatchSink>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            manager,
            pipeline,
            sink,
            flush_interval: flush_interval.max(Duration::from_secs(1)),
        }
    }

    /// Run until the shutdown token fires.
    ///
    /// `rx` is the subscription channel; its fan-out is wired before the
    /// first session opens so no notification is dropped.
    pub async fn run(
        &self,
        rx: Receiver<Sample>,
        shutdown: CancellationToken,
    ) -> Result<(), WorkerError> {
        let fanout_cancel = CancellationToken::new();
        let fanout_handles = self
            .pipeline
            .spawn_fanout(rx, FANOUT_WORKERS, fanout_cancel.clone());

        self.manager.start().await?;
        tracing::info!(tick = ?self.flush_interval, "Worker loop running");

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        tracing::info!("Shutdown requested");
        self.manager.stop().await;

        // Let the fan-out drain whatever the sessions already queued.
        fanout_cancel.cancel();
        for handle in fanout_handles {
            let _ = handle.await;
        }

        self.final_flush().await;
        tracing::info!("Worker loop stopped");
        Ok(())
    }

    /// One supervision tick.
    async fn tick(&self) {
        if !self.manager.is_connected().await {
            tracing::warn!("Subscriptions disconnected, reconnecting");
            if let Err(e) = self.manager.reconnect().await {
                tracing::error!(error = %e, "Reconnect failed");
            }
        }

        if self.sink.pending_count() > 0 {
            match self.sink.flush(&CancellationToken::new()).await {
                Ok(persisted) => {
                    tracing::debug!(persisted, "Tick flush complete");
                }
                Err(e) => {
                    // Data is already spooled; the process keeps running.
                    tracing::error!(error = %e, "Fatal flush error");
                }
            }
        }

        self.sink.try_recover().await;
    }

    async fn final_flush(&self) {
        let pending = self.sink.pending_count();
        if pending == 0 {
            return;
        }
        tracing::info!(pending, "Final flush");

        let cancel_token = CancellationToken::new();
        let flush = self.sink.flush(&cancel_token);
        match tokio::time::timeout(FINAL_FLUSH_TIMEOUT, flush).await {
            Ok(Ok(persisted)) => tracing::info!(persisted, "Final flush complete"),
            Ok(Err(e)) => tracing::error!(error = %e, "Final flush failed"),
            Err(_) => tracing::error!(
                timeout = ?FINAL_FLUSH_TIMEOUT,
                "Final flush deadline exceeded"
            ),
        }
    }
}
