//! Ingestion pipeline between the subscription callbacks and the sink.
//!
//! Each incoming sample is resolved against the tag cache, enriched with
//! the tag's metadata, validated, and enqueued. Unknown node ids and
//! invalid samples are dropped with a log line; nothing on this path ever
//! tears down a subscription.

use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::TagCache;
use crate::model::Sample;
use crate::sink::BatchSink;
use crate::validation::validate;

/// Worker tasks draining the subscription channel.
pub const FANOUT_WORKERS: usize = 2;

pub struct IngestionPipeline {
    cache: Arc<TagCache>,
    sink: Arc<BatchSink>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline").finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    pub fn new(cache: Arc<TagCache>, sink: Arc<BatchSink>) -> Arc<Self> {
        Arc::new(Self { cache, sink })
    }

    /// Process one sample end to end. Returns true when the sample was
    /// accepted and enqueued.
    pub async fn process(&self, sample: Sample) -> bool {
        match self.prepare(sample).await {
            Some(sample) => {
                self.sink.enqueue(vec![sample]);
                true
            }
            None => false,
        }
    }

    /// Batch variant: validate each element, enqueue the accepted subset
    /// in one call. Returns the number accepted.
    pub async fn process_batch(&self, samples: Vec<Sample>) -> usize {
        let mut accepted = Vec::with_capacity(samples.len());
        for sample in samples {
            if let Some(sample) = self.prepare(sample).await {
                accepted.push(sample);
            }
        }
        self.sink.enqueue(accepted)
    }

    /// Resolve, enrich, and validate; `None` means the sample was dropped.
    async fn prepare(&self, mut sample: Sample) -> Option<Sample> {
        let tag = match self.cache.resolve(&sample.node_id).await {
            Ok(Some(tag)) => tag,
            Ok(None) => {
                tracing::warn!(node_id = %sample.node_id, "Unknown tag, sample dropped");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    node_id = %sample.node_id,
                    error = %e,
                    "Tag resolution failed, sample dropped"
                );
                return None;
            }
        };

        sample.enrich(&tag);

        if let Err(reason) = validate(&tag, &sample.value, sample.quality) {
            tracing::warn!(
                node_id = %sample.node_id,
                tag = %sample.tag_name,
                value = %sample.value,
                %reason,
                "Sample rejected"
            );
            return None;
        }

        Some(sample)
    }

    /// Spawn the small fan-out of workers draining a subscription channel
    /// into this pipeline. Workers share the receiver and exit when the
    /// channel closes or the token fires; whatever is already queued is
    /// drained before exit so shutdown loses nothing.
    pub fn spawn_fanout(
        self: &Arc<Self>,
        rx: Receiver<Sample>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..workers.max(1))
            .map(|worker| {
                let pipeline = Arc::clone(self);
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                maybe = rx.recv() => maybe,
                                _ = cancel.cancelled() => rx.try_recv().ok(),
                            }
                        };
                        match next {
                            Some(sample) => {
                                pipeline.process(sample).await;
                            }
                            None => break,
                        }
                    }
                    tracing::debug!(worker, "Ingestion fan-out worker stopped");
                })
            })
            .collect()
    }
}
