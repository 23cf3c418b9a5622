//! Optional event-bus fan-out of persisted samples.
//!
//! The sink publishes each successfully persisted flush through an
//! [`EventBusProducer`], if one is configured. Publish failures are logged
//! by the caller and never affect persistence; this is an observability
//! path, not a durability path.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::Sample;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("event bus publish failed: {0}")]
    Publish(String),
}

/// Fan-out surface for an external event bus.
#[async_trait]
pub trait EventBusProducer: Send + Sync + 'static {
    async fn publish(&self, samples: &[Sample]) -> Result<(), FanoutError>;
}

/// In-process producer bridging to a broadcast channel.
///
/// Embedding processes subscribe via [`ChannelProducer::subscribe`];
/// lagging subscribers lose messages, and publishing with no subscribers
/// is a no-op.
pub struct ChannelProducer {
    tx: broadcast::Sender<Arc<[Sample]>>,
}

impl std::fmt::Debug for ChannelProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelProducer")
            .field("subscribers", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ChannelProducer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[Sample]>> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventBusProducer for ChannelProducer {
    async fn publish(&self, samples: &[Sample]) -> Result<(), FanoutError> {
        if samples.is_empty() {
            return Ok(());
        }
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(Arc::from(samples.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::{OpcQuality, Value};

    fn sample() -> Sample {
        Sample::new(
            "ns=2;s=T",
            Value::Int64(1),
            OpcQuality::GOOD,
            Utc::now(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_batch() {
        let producer = ChannelProducer::new(8);
        let mut rx = producer.subscribe();

        producer.publish(&[sample(), sample()]).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].node_id, "ns=2;s=T");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let producer = ChannelProducer::new(8);
        producer.publish(&[sample()]).await.unwrap();
    }
}
