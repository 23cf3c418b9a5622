//! Buffered batch writer to the relational store.
//!
//! Process-wide: one buffer, one health state, created at startup and
//! flushed a final time at shutdown. Producers enqueue without blocking;
//! flushes are serialized by one async mutex, persist in bounded chunks,
//! and degrade to the on-disk spool when the store is unavailable. A
//! healed store is detected by [`BatchSink::try_recover`], which drains
//! the spool under exponential backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::fanout::EventBusProducer;
use crate::model::Sample;
use crate::spool::{Spool, SpoolError};
use crate::storage::{StoreError, ValueStore};

/// Buffer size at which an asynchronous flush is scheduled.
pub const DEFAULT_AUTO_FLUSH_THRESHOLD: usize = 5000;

/// Maximum rows per persistence round trip.
pub const DEFAULT_MAX_CHUNK: usize = 1000;

/// Upper bound on the recovery backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before the first recovery attempt after an unhealthy transition.
const FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors escaping the sink. `StoreError::Unavailable` never appears here:
/// it is absorbed by spooling. A fatal store error is re-raised after the
/// flushed data has been spooled, so nothing is lost.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("fatal storage error: {0}")]
    Fatal(#[from] StoreError),
}

/// Health state machine: `{Healthy, Unhealthy}` plus the backoff bookkeeping.
struct HealthState {
    healthy: bool,
    failures: u32,
    next_attempt: Option<Instant>,
}

/// Backoff after the k-th consecutive failed recovery attempt.
pub(crate) fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.min(6);
    Duration::from_secs(1 << exp).min(MAX_BACKOFF)
}

pub struct BatchSink {
    store: Arc<dyn ValueStore>,
    spool: Arc<Spool>,
    fanout: Option<Arc<dyn EventBusProducer>>,

    tx: UnboundedSender<Sample>,
    rx: Mutex<UnboundedReceiver<Sample>>,
    pending: AtomicUsize,

    flush_lock: Mutex<()>,
    health: StdMutex<HealthState>,

    auto_flush_threshold: usize,
    max_chunk: usize,
}

impl std::fmt::Debug for BatchSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSink")
            .field("pending", &self.pending_count())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl BatchSink {
    pub fn new(store: Arc<dyn ValueStore>, spool: Arc<Spool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            spool,
            fanout: None,
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
            health: StdMutex::new(HealthState {
                healthy: true,
                failures: 0,
                next_attempt: None,
            }),
            auto_flush_threshold: DEFAULT_AUTO_FLUSH_THRESHOLD,
            max_chunk: DEFAULT_MAX_CHUNK,
        }
    }

    pub fn with_auto_flush_threshold(mut self, threshold: usize) -> Self {
        self.auto_flush_threshold = threshold.max(1);
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    pub fn with_fanout(mut self, producer: Arc<dyn EventBusProducer>) -> Self {
        self.fanout = Some(producer);
        self
    }

    /// Append samples to the in-memory FIFO buffer and return the number
    /// appended. Never blocks for I/O; when the buffer reaches the
    /// auto-flush threshold an asynchronous flush is scheduled.
    pub fn enqueue(self: &Arc<Self>, samples: Vec<Sample>) -> usize {
        let appended = samples.len();
        if appended == 0 {
            return 0;
        }

        for sample in samples {
            // The receiver lives as long as the sink itself.
            let _ = self.tx.send(sample);
        }
        let pending = self.pending.fetch_add(appended, Ordering::SeqCst) + appended;

        if pending >= self.auto_flush_threshold {
            let sink = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = sink.flush(&CancellationToken::new()).await {
                    tracing::error!(error = %e, "Scheduled flush failed");
                }
            });
        }

        appended
    }

    /// Current buffer size.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether the sink is currently marked unhealthy.
    pub fn is_degraded(&self) -> bool {
        !self.health.lock().unwrap_or_else(|e| e.into_inner()).healthy
    }

    /// Consecutive failed recovery attempts since the unhealthy transition.
    pub fn failure_count(&self) -> u32 {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).failures
    }

    /// Liveness probe against the store. Does not mutate sink state.
    pub async fn is_healthy(&self) -> bool {
        self.store.probe().await.is_ok()
    }

    /// Move everything pending into a local slice and persist it in chunks.
    ///
    /// Returns the number of rows persisted. An unavailable store spools
    /// the entire flushed set and returns Ok; duplicates from partially
    /// persisted flushes are tolerated by the idempotent downstream. Any
    /// other store error spools the set and is re-raised. Cancellation
    /// between chunks spools the undispatched remainder.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<usize, SinkError> {
        let _flush = self.flush_lock.lock().await;

        let drained = self.drain_buffer().await;
        if drained.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = drained.len(), "Flushing buffered samples");

        let mut persisted = 0;
        let mut start = 0;
        while start < drained.len() {
            if cancel.is_cancelled() {
                let remainder = drained[start..].to_vec();
                tracing::warn!(
                    spooled = remainder.len(),
                    persisted,
                    "Flush cancelled, spooling undispatched remainder"
                );
                self.spool.append(remainder).await?;
                return Ok(persisted);
            }

            let end = (start + self.max_chunk).min(drained.len());
            let outcome = self.store.insert_chunk(&drained[start..end]).await;
            match outcome {
                Ok(()) => persisted += end - start,
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(
                        error = %e,
                        count = drained.len(),
                        "Store unavailable, spooling flushed set"
                    );
                    self.mark_unhealthy();
                    self.spool.append(drained).await?;
                    return Ok(0);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Unexpected storage failure during flush");
                    self.mark_unhealthy();
                    self.spool.append(drained).await?;
                    return Err(SinkError::Fatal(e));
                }
            }
            start = end;
        }

        if self.transition_healthy() {
            tracing::info!("Store reachable again, draining spool");
            if let Err(e) = self.drain_spool().await {
                tracing::error!(error = %e, "Spool drain after flush failed");
            }
        }

        if let Some(fanout) = &self.fanout {
            if let Err(e) = fanout.publish(&drained).await {
                tracing::warn!(error = %e, "Event bus publish failed");
            }
        }

        tracing::debug!(persisted, "Flush complete");
        Ok(persisted)
    }

    /// Attempt recovery of an unhealthy sink, honoring the backoff.
    ///
    /// Healthy or not-yet-due sinks are a noop. A successful probe marks
    /// the sink healthy, resets the failure count, and drains the spool;
    /// a failed probe extends the backoff.
    pub async fn try_recover(&self) {
        {
            let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
            if health.healthy {
                return;
            }
            if let Some(next) = health.next_attempt {
                if Instant::now() < next {
                    return;
                }
            }
        }

        match self.store.probe().await {
            Ok(()) => {
                self.transition_healthy();
                tracing::info!("Store probe succeeded, draining spool");
                if let Err(e) = self.drain_spool().await {
                    tracing::error!(error = %e, "Spool drain after recovery failed");
                }
            }
            Err(e) => {
                let delay = self.record_probe_failure();
                tracing::warn!(
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Store probe failed, backing off"
                );
            }
        }
    }

    /// Replay every spooled batch in filename order; the spool is cleared
    /// only after all batches persisted. A failure aborts the drain, leaves
    /// the files intact, and re-marks the sink unhealthy.
    pub async fn drain_spool(&self) -> Result<usize, SinkError> {
        let guard = self.spool.begin().await;
        let batches = guard.list_batches()?;
        if batches.is_empty() {
            return Ok(0);
        }

        let mut replayed = 0;
        for batch in &batches {
            for chunk in batch.tag_values.chunks(self.max_chunk) {
                if let Err(e) = self.store.insert_chunk(chunk).await {
                    tracing::warn!(
                        error = %e,
                        batch_id = %batch.batch_id,
                        replayed,
                        "Spool drain aborted, batches left intact"
                    );
                    self.mark_unhealthy();
                    return Err(SinkError::Fatal(e));
                }
                replayed += chunk.len();
            }
        }

        guard.clear_all()?;
        tracing::info!(
            batches = batches.len(),
            records = replayed,
            "Spool drained"
        );
        Ok(replayed)
    }

    // --- Internals ---

    async fn drain_buffer(&self) -> Vec<Sample> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::with_capacity(self.pending_count());
        while let Ok(sample) = rx.try_recv() {
            drained.push(sample);
        }
        self.pending.fetch_sub(drained.len(), Ordering::SeqCst);
        drained
    }

    /// Healthy → Unhealthy; the first recovery attempt is due after one
    /// second. Repeated failures while already unhealthy keep the
    /// established backoff.
    fn mark_unhealthy(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.healthy {
            health.healthy = false;
            health.failures = 0;
            health.next_attempt = Some(Instant::now() + FIRST_RETRY_DELAY);
            tracing::warn!("Batch sink marked unhealthy");
        }
    }

    /// Unhealthy → Healthy. Returns true when a transition happened.
    fn transition_healthy(&self) -> bool {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.healthy {
            return false;
        }
        health.healthy = true;
        health.failures = 0;
        health.next_attempt = None;
        tracing::info!("Batch sink healthy again");
        true
    }

    fn record_probe_failure(&self) -> Duration {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.failures += 1;
        let delay = backoff_delay(health.failures);
        health.next_attempt = Some(Instant::now() + delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::tempdir;

    use crate::model::{OpcQuality, Value};

    /// In-memory store with a switchable outage and an optional fatal mode.
    struct TestStore {
        rows: StdMutex<Vec<Sample>>,
        down: AtomicBool,
        fatal: AtomicBool,
    }

    impl TestStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: StdMutex::new(Vec::new()),
                down: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
            })
        }

        fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ValueStore for TestStore {
        async fn insert_chunk(&self, samples: &[Sample]) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(sqlx::Error::PoolClosed));
            }
            if self.fatal.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidData("broken constraint".to_string()));
            }
            self.rows.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }

        async fn probe(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(sqlx::Error::PoolClosed));
            }
            Ok(())
        }
    }

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                Sample::new(
                    format!("ns=2;s=T{i}"),
                    Value::Int64(i as i64),
                    OpcQuality::GOOD,
                    Utc::now(),
                    Utc::now(),
                )
            })
            .collect()
    }

    fn sink_with(store: Arc<TestStore>, spool_dir: &std::path::Path) -> Arc<BatchSink> {
        let spool = Arc::new(Spool::new(spool_dir, 100_000).unwrap());
        Arc::new(
            BatchSink::new(store, spool)
                .with_auto_flush_threshold(5000)
                .with_max_chunk(1000),
        )
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(12), Duration::from_secs(60));
        for k in 1..12 {
            assert!(backoff_delay(k) <= backoff_delay(k + 1));
        }
    }

    #[tokio::test]
    async fn test_enqueue_reflects_pending_count() {
        let dir = tempdir().unwrap();
        let sink = sink_with(TestStore::new(), dir.path());

        assert_eq!(sink.enqueue(samples(3)), 3);
        assert_eq!(sink.pending_count(), 3);
        assert_eq!(sink.enqueue(Vec::new()), 0);
        assert_eq!(sink.pending_count(), 3);
    }

    #[tokio::test]
    async fn test_flush_persists_fifo_and_empties_buffer() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        sink.enqueue(samples(3));
        let persisted = sink.flush(&CancellationToken::new()).await.unwrap();

        assert_eq!(persisted, 3);
        assert_eq!(sink.pending_count(), 0);
        let rows = store.rows.lock().unwrap();
        let order: Vec<&str> = rows.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(order, vec!["ns=2;s=T0", "ns=2;s=T1", "ns=2;s=T2"]);
    }

    #[tokio::test]
    async fn test_auto_flush_at_threshold() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let spool = Arc::new(Spool::new(dir.path(), 100_000).unwrap());
        let sink = Arc::new(
            BatchSink::new(Arc::clone(&store) as Arc<dyn ValueStore>, spool)
                .with_auto_flush_threshold(10),
        );

        sink.enqueue(samples(10));

        // The scheduled flush runs on the runtime; poll until it lands.
        for _ in 0..50 {
            if store.row_count() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.row_count(), 10);
        assert_eq!(sink.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_is_healthy_probes_without_state_change() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        assert!(sink.is_healthy().await);

        store.down.store(true, Ordering::SeqCst);
        assert!(!sink.is_healthy().await);
        // The probe alone never flips the state machine.
        assert!(!sink.is_degraded());
    }

    #[tokio::test]
    async fn test_outage_spools_entire_flushed_set() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        store.down.store(true, Ordering::SeqCst);
        sink.enqueue(samples(2500));
        let persisted = sink.flush(&CancellationToken::new()).await.unwrap();

        assert_eq!(persisted, 0);
        assert!(sink.is_degraded());
        assert_eq!(sink.pending_count(), 0);

        let batches = sink.spool.list_batches().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].tag_values.len(), 2500);
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_spools_and_reraises() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        store.fatal.store(true, Ordering::SeqCst);
        sink.enqueue(samples(5));
        let err = sink.flush(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, SinkError::Fatal(_)));
        assert!(sink.is_degraded());
        assert_eq!(sink.spool.total_records().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_drains_spool_after_backoff() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        store.down.store(true, Ordering::SeqCst);
        sink.enqueue(samples(2500));
        sink.flush(&CancellationToken::new()).await.unwrap();
        assert!(sink.is_degraded());

        // Before the first retry is due, recovery is a noop.
        sink.try_recover().await;
        assert!(sink.is_degraded());
        assert_eq!(sink.failure_count(), 0);

        // Due but still down: the failure count grows and backoff extends.
        tokio::time::advance(Duration::from_secs(2)).await;
        sink.try_recover().await;
        assert_eq!(sink.failure_count(), 1);

        // Not yet due again.
        sink.try_recover().await;
        assert_eq!(sink.failure_count(), 1);

        // Healed and due: recovery drains the spool.
        store.down.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(3)).await;
        sink.try_recover().await;

        assert!(!sink.is_degraded());
        assert_eq!(sink.failure_count(), 0);
        assert_eq!(store.row_count(), 2500);
        assert_eq!(sink.spool.total_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_success_while_degraded_drains_spool() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        store.down.store(true, Ordering::SeqCst);
        sink.enqueue(samples(10));
        sink.flush(&CancellationToken::new()).await.unwrap();
        assert!(sink.is_degraded());

        // New traffic arrives after the store heals; the successful flush
        // itself restores health and replays the spooled batch.
        store.down.store(false, Ordering::SeqCst);
        sink.enqueue(samples(5));
        sink.flush(&CancellationToken::new()).await.unwrap();

        assert!(!sink.is_degraded());
        assert_eq!(store.row_count(), 15);
        assert_eq!(sink.spool.total_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_failure_leaves_files_intact() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let sink = sink_with(Arc::clone(&store), dir.path());

        sink.spool.append(samples(7)).await.unwrap();
        store.fatal.store(true, Ordering::SeqCst);

        let err = sink.drain_spool().await.unwrap_err();
        assert!(matches!(err, SinkError::Fatal(_)));
        assert!(sink.is_degraded());
        assert_eq!(sink.spool.total_records().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_flush_spools_remainder() {
        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let spool = Arc::new(Spool::new(dir.path(), 100_000).unwrap());
        let sink = Arc::new(
            BatchSink::new(Arc::clone(&store) as Arc<dyn ValueStore>, spool).with_max_chunk(10),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        sink.enqueue(samples(25));
        let persisted = sink.flush(&cancel).await.unwrap();

        // Nothing dispatched, everything spooled; no sample lost.
        assert_eq!(persisted, 0);
        assert_eq!(store.row_count(), 0);
        assert_eq!(sink.spool.total_records().await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_fanout_receives_persisted_samples() {
        use crate::fanout::ChannelProducer;

        let dir = tempdir().unwrap();
        let store = TestStore::new();
        let spool = Arc::new(Spool::new(dir.path(), 100_000).unwrap());
        let producer = Arc::new(ChannelProducer::new(8));
        let mut rx = producer.subscribe();

        let sink = Arc::new(
            BatchSink::new(Arc::clone(&store) as Arc<dyn ValueStore>, spool)
                .with_fanout(producer),
        );

        sink.enqueue(samples(4));
        sink.flush(&CancellationToken::new()).await.unwrap();

        let published = rx.recv().await.unwrap();
        assert_eq!(published.len(), 4);
    }
}
