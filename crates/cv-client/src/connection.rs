//! Connection Manager - owns the logical broker connection
//!
//! Handles:
//! - Initial connect with fatal/transient classification
//! - Reconnect with full-jitter exponential backoff
//! - Broadcasting Lost/Reconnected/Failed events so publishers and
//!   consumers can replay unconfirmed/unacked state

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{error, info, warn};

use cv_broker::{BrokerChannel, BrokerConnection, BrokerTransport};
use cv_common::{BrokerConfig, ConveyorError, ReconnectPolicy, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Connection lifecycle notifications for dependent components.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection dropped; channels on it are dead.
    Lost,
    /// A fresh connection is open. Replay outstanding state now.
    Reconnected { attempt: u32 },
    /// Reconnect budget exhausted; the connection will not come back.
    Failed { reason: String },
}

pub struct ConnectionManager {
    transport: Box<dyn BrokerTransport>,
    config: BrokerConfig,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Establish the connection and start the reconnect supervisor.
    ///
    /// Bad credentials fail immediately; transient failures are retried per
    /// the policy and surface as `ConnectFailure` once the attempt budget
    /// (if any) is spent.
    pub async fn connect(
        transport: Box<dyn BrokerTransport>,
        config: BrokerConfig,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            transport,
            config,
            policy,
            state_tx,
            events_tx,
            current: RwLock::new(None),
            shutdown_tx,
        });

        let (connection, _attempt) = manager.establish().await.map_err(|e| {
            manager.state_tx.send_replace(ConnectionState::Disconnected);
            e
        })?;
        *manager.current.write().await = Some(connection);
        manager.state_tx.send_replace(ConnectionState::Open);
        info!(host = %manager.config.host, port = manager.config.port, "connected to broker");

        manager.clone().spawn_supervisor();
        Ok(manager)
    }

    /// Dial until open, fatal, or out of attempts. Returns the connection and
    /// the attempt count that succeeded.
    async fn establish(&self) -> Result<(Arc<dyn BrokerConnection>, u32)> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.connect(&self.config).await {
                Ok(connection) => return Ok((Arc::from(connection), attempt + 1)),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal connect error");
                    return Err(e.into());
                }
                Err(e) => {
                    attempt += 1;
                    if let Some(max) = self.policy.max_connect_attempts {
                        if attempt >= max {
                            error!(attempts = attempt, error = %e, "connect attempts exhausted");
                            return Err(ConveyorError::ConnectFailure(format!(
                                "broker unreachable after {attempt} attempts: {e}"
                            )));
                        }
                    }
                    let delay = backoff_delay(attempt - 1, &self.policy);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "connect failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn spawn_supervisor(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            loop {
                let connection = match self.current.read().await.clone() {
                    Some(c) => c,
                    None => return,
                };

                tokio::select! {
                    _ = connection.closed() => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    return;
                }

                warn!("broker connection lost");
                self.state_tx.send_replace(ConnectionState::Connecting);
                let _ = self.events_tx.send(ConnectionEvent::Lost);
                *self.current.write().await = None;

                match self.establish().await {
                    Ok((connection, attempt)) => {
                        *self.current.write().await = Some(connection);
                        self.state_tx.send_replace(ConnectionState::Open);
                        info!(attempt, "reconnected to broker");
                        let _ = self.events_tx.send(ConnectionEvent::Reconnected { attempt });
                    }
                    Err(e) => {
                        error!(error = %e, "reconnect failed permanently");
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        let _ = self.events_tx.send(ConnectionEvent::Failed {
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
        });
    }

    /// Open a channel on the current connection.
    pub async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let connection = self
            .current
            .read()
            .await
            .clone()
            .ok_or(ConveyorError::ConnectionLost)?;
        connection.open_channel().await.map_err(Into::into)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Close the connection and stop the supervisor. Idempotent.
    pub async fn close(&self) {
        self.state_tx.send_replace(ConnectionState::Closing);
        let _ = self.shutdown_tx.send(true);
        if let Some(connection) = self.current.write().await.take() {
            connection.close().await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("broker connection closed");
    }
}

/// Full-jitter exponential backoff: uniform in [0, min(cap, base * 2^attempt)].
fn backoff_delay(attempt: u32, policy: &ReconnectPolicy) -> Duration {
    let exp = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let ceiling = exp.min(policy.max_delay);
    let jitter_ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}
