//! Subscription transport contract and monitoring parameters.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::model::{Machine, Sample};
use crate::storage::StoreError;

/// Errors raised by a subscription session. Logged per session; the next
/// worker tick reconnects the affected endpoint.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Session could not be established or died mid-flight.
    #[error("session error on {endpoint}: {reason}")]
    Session { endpoint: String, reason: String },

    /// Transport-level failure not tied to one session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Metadata could not be read while starting subscriptions.
    #[error("metadata error: {0}")]
    Metadata(#[from] StoreError),
}

/// Subscription and monitored-item parameters applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct MonitoringSettings {
    /// Server publish cycle.
    pub publishing_interval: Duration,
    /// Publish cycles without notifications before a keep-alive.
    pub keep_alive_count: u32,
    /// Publish cycles without client acknowledgement before the server
    /// drops the subscription.
    pub lifetime_count: u32,
    /// Per-item sampling cycle.
    pub sampling_interval: Duration,
    /// Server-side queue depth per monitored item.
    pub queue_size: u32,
    /// Drop the oldest queued notification on overflow.
    pub discard_oldest: bool,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            publishing_interval: Duration::from_millis(1000),
            keep_alive_count: 10,
            lifetime_count: 100,
            sampling_interval: Duration::from_millis(500),
            queue_size: 10,
            discard_oldest: true,
        }
    }
}

/// One OPC UA session against a machine endpoint.
///
/// Implementations open the session, create one monitored item per active
/// tag, and push every value-change notification into `tx` (translating
/// the transport status word into an [`crate::model::OpcQuality`]) until
/// `cancel` fires. A clean cancellation returns `Ok(())`; any other return
/// marks the endpoint disconnected.
#[async_trait]
pub trait OpcTransport: Send + Sync + 'static {
    async fn run_session(
        &self,
        machine: Machine,
        settings: MonitoringSettings,
        tx: Sender<Sample>,
        cancel: CancellationToken,
    ) -> Result<(), SubscriptionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_monitoring_settings() {
        let settings = MonitoringSettings::default();
        assert_eq!(settings.publishing_interval, Duration::from_millis(1000));
        assert_eq!(settings.keep_alive_count, 10);
        assert_eq!(settings.lifetime_count, 100);
        assert_eq!(settings.sampling_interval, Duration::from_millis(500));
        assert_eq!(settings.queue_size, 10);
        assert!(settings.discard_oldest);
    }
}
