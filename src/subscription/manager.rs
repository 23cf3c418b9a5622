//! Session lifecycle management for all active machines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::Sample;
use crate::storage::MetadataRepository;
use crate::subscription::{MonitoringSettings, OpcTransport, SubscriptionError};

/// Delay between stop and start during a reconnect.
const RECONNECT_GRACE: Duration = Duration::from_millis(500);

/// Per-endpoint connectivity snapshot reported by [`SubscriptionManager::health`].
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub machine: String,
    pub endpoint: String,
    pub connected: bool,
}

struct Session {
    machine: String,
    endpoint: String,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Opens one session per active machine and routes value-change
/// notifications into the ingestion channel.
pub struct SubscriptionManager {
    repository: Arc<MetadataRepository>,
    transport: Arc<dyn OpcTransport>,
    settings: MonitoringSettings,
    tx: Sender<Sample>,
    sessions: Mutex<Vec<Session>>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager").finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    pub fn new(
        repository: Arc<MetadataRepository>,
        transport: Arc<dyn OpcTransport>,
        settings: MonitoringSettings,
        tx: Sender<Sample>,
    ) -> Self {
        Self {
            repository,
            transport,
            settings,
            tx,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Open one session per active machine. Inactive machines are never
    /// subscribed; machines without active tags are skipped.
    pub async fn start(&self) -> Result<(), SubscriptionError> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.is_empty() {
            tracing::debug!("Subscriptions already running");
            return Ok(());
        }

        let machines = self.repository.list_active_machines().await?;
        tracing::info!(machines = machines.len(), "Starting subscriptions");

        for machine in machines {
            if machine.active_tags().next().is_none() {
                tracing::debug!(machine = %machine.name, "No active tags, skipping");
                continue;
            }

            let connected = Arc::new(AtomicBool::new(true));
            let cancel = CancellationToken::new();
            let name = machine.name.clone();
            let endpoint = machine.opc_endpoint.clone();

            let handle = {
                let transport = Arc::clone(&self.transport);
                let settings = self.settings;
                let tx = self.tx.clone();
                let cancel = cancel.clone();
                let connected = Arc::clone(&connected);
                let name = name.clone();
                tokio::spawn(async move {
                    match transport.run_session(machine, settings, tx, cancel).await {
                        Ok(()) => {
                            tracing::info!(machine = %name, "Session closed");
                        }
                        Err(e) => {
                            tracing::error!(machine = %name, error = %e, "Session failed");
                        }
                    }
                    connected.store(false, Ordering::SeqCst);
                })
            };

            tracing::info!(machine = %name, endpoint = %endpoint, "Session opened");
            sessions.push(Session {
                machine: name,
                endpoint,
                connected,
                cancel,
                handle,
            });
        }

        Ok(())
    }

    /// Cancel all sessions and wait for them to exit.
    pub async fn stop(&self) {
        let sessions: Vec<Session> = std::mem::take(&mut *self.sessions.lock().await);
        if sessions.is_empty() {
            return;
        }

        tracing::info!(sessions = sessions.len(), "Stopping subscriptions");
        for session in &sessions {
            session.cancel.cancel();
        }
        for session in sessions {
            if session.handle.await.is_err() {
                tracing::warn!(machine = %session.machine, "Session task panicked");
            }
        }
    }

    /// Stop, wait a short grace period, then start again.
    pub async fn reconnect(&self) -> Result<(), SubscriptionError> {
        tracing::info!("Reconnecting subscriptions");
        self.stop().await;
        tokio::time::sleep(RECONNECT_GRACE).await;
        self.start().await
    }

    /// Per-endpoint connectivity report.
    pub async fn health(&self) -> Vec<EndpointHealth> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|s| EndpointHealth {
                machine: s.machine.clone(),
                endpoint: s.endpoint.clone(),
                connected: s.connected.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// True when every opened session is still up.
    pub async fn is_connected(&self) -> bool {
        let sessions = self.sessions.lock().await;
        !sessions.is_empty() && sessions.iter().all(|s| s.connected.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    use crate::model::Machine;
    use crate::storage::schema::init_schema;
    use crate::storage::connect;
    use crate::subscription::SimulatorTransport;

    async fn repository(active_machines: usize) -> Arc<MetadataRepository> {
        let pool = connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

        for i in 0..active_machines {
            sqlx::query(
                "INSERT INTO Machines (Name, OpcEndpoint, AutomateType, IsActive)
                 VALUES (?, ?, 'SIM', 1)",
            )
            .bind(format!("press-{i}"))
            .bind(format!("opc.tcp://10.0.0.{i}:4840"))
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO Tags (MachineId, Name, NodeId, DataType, MinValue, MaxValue, IsActive)
                 VALUES (?, 'temperature', ?, 'Float', 0.0, 100.0, 1)",
            )
            .bind(i as i64 + 1)
            .bind(format!("ns=2;s=Press{i}.Temperature"))
            .execute(&pool)
            .await
            .unwrap();
        }

        // An inactive machine that must never be subscribed.
        sqlx::query(
            "INSERT INTO Machines (Name, OpcEndpoint, AutomateType, IsActive)
             VALUES ('mothballed', 'opc.tcp://10.0.9.9:4840', 'SIM', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        Arc::new(MetadataRepository::new(pool))
    }

    #[tokio::test]
    async fn test_start_subscribes_active_machines_only() {
        let repo = repository(2).await;
        let (tx, mut rx) = mpsc::channel(256);
        let manager = SubscriptionManager::new(
            repo,
            Arc::new(SimulatorTransport::new()),
            MonitoringSettings {
                sampling_interval: Duration::from_millis(10),
                ..Default::default()
            },
            tx,
        );

        manager.start().await.unwrap();
        let health = manager.health().await;
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(|h| h.connected));
        assert!(manager.is_connected().await);
        assert!(health.iter().all(|h| h.machine != "mothballed"));

        // Samples flow from both endpoints.
        let sample = rx.recv().await.unwrap();
        assert!(sample.node_id.starts_with("ns=2;s=Press"));

        manager.stop().await;
        assert!(!manager.is_connected().await);
        assert!(manager.health().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_session_reports_disconnected() {
        struct FailingTransport;

        #[async_trait]
        impl OpcTransport for FailingTransport {
            async fn run_session(
                &self,
                machine: Machine,
                _settings: MonitoringSettings,
                _tx: Sender<Sample>,
                _cancel: CancellationToken,
            ) -> Result<(), SubscriptionError> {
                Err(SubscriptionError::Session {
                    endpoint: machine.opc_endpoint,
                    reason: "connection refused".to_string(),
                })
            }
        }

        let repo = repository(1).await;
        let (tx, _rx) = mpsc::channel(16);
        let manager = SubscriptionManager::new(
            repo,
            Arc::new(FailingTransport),
            MonitoringSettings::default(),
            tx,
        );

        manager.start().await.unwrap();
        // Give the failing session task a moment to finish.
        for _ in 0..50 {
            if !manager.is_connected().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.is_connected().await);

        let health = manager.health().await;
        assert_eq!(health.len(), 1);
        assert!(!health[0].connected);
    }

    #[tokio::test]
    async fn test_reconnect_restarts_sessions() {
        struct CountingTransport {
            runs: AtomicUsize,
        }

        #[async_trait]
        impl OpcTransport for CountingTransport {
            async fn run_session(
                &self,
                _machine: Machine,
                _settings: MonitoringSettings,
                _tx: Sender<Sample>,
                cancel: CancellationToken,
            ) -> Result<(), SubscriptionError> {
                self.runs.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                Ok(())
            }
        }

        let transport = Arc::new(CountingTransport {
            runs: AtomicUsize::new(0),
        });
        let repo = repository(1).await;
        let (tx, _rx) = mpsc::channel(16);
        let manager = SubscriptionManager::new(
            repo,
            Arc::clone(&transport) as Arc<dyn OpcTransport>,
            MonitoringSettings::default(),
            tx,
        );

        manager.start().await.unwrap();
        manager.reconnect().await.unwrap();
        assert!(manager.is_connected().await);
        assert_eq!(transport.runs.load(Ordering::SeqCst), 2);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let repo = repository(1).await;
        let (tx, _rx) = mpsc::channel(16);
        let manager = SubscriptionManager::new(
            repo,
            Arc::new(SimulatorTransport::new()),
            MonitoringSettings::default(),
            tx,
        );

        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.health().await.len(), 1);

        manager.stop().await;
    }
}
