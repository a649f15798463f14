//! Publisher - confirm-tracked sends with replay after reconnect
//!
//! `send` is a synchronous façade over the broker's asynchronous confirm.
//! All wire traffic goes through one publish-loop task per publisher, which
//! keeps the channel single-writer and makes sequence order identical to
//! issue order. Outstanding publishes live in the delivery registry until a
//! confirm settles them, a retry budget rejects them, or a reconnect replays
//! them in FIFO order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use cv_broker::Confirm;
use cv_common::{
    ConveyorError, Event, OutstandingPublish, PublishReceipt, PublisherConfig, QueueOptions,
    Result, CONTENT_TYPE_JSON,
};

use crate::channel::{ChannelPool, ChannelRole, PooledChannel};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::registry::DeliveryRegistry;

const REPLAY_DEBOUNCE: Duration = Duration::from_millis(50);

struct PublishRequest {
    event: Event,
    payload: Vec<u8>,
    result_tx: oneshot::Sender<Result<PublishReceipt>>,
}

enum LoopCmd {
    Confirmed {
        sequence: u64,
        result: cv_broker::Result<Confirm>,
    },
    Retry {
        sequence: u64,
    },
    Replay,
}

pub struct Publisher {
    cmd_tx: mpsc::Sender<PublishRequest>,
    registry: Arc<DeliveryRegistry<OutstandingPublish>>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        connection: &Arc<ConnectionManager>,
        pool: Arc<ChannelPool>,
        queue: QueueOptions,
        config: PublisherConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (loop_tx, loop_rx) = mpsc::channel(256);
        let registry = Arc::new(DeliveryRegistry::new());
        let events_rx = connection.subscribe();

        let publish_loop = PublishLoop {
            queue,
            config: config.clone(),
            pool,
            registry: registry.clone(),
            loop_tx,
            channel: None,
            next_sequence: 0,
            replay_scheduled: false,
        };
        tokio::spawn(publish_loop.run(cmd_rx, loop_rx, events_rx));

        Self {
            cmd_tx,
            registry,
            config,
        }
    }

    /// Publish one event and wait for the broker confirm, up to the
    /// configured confirm timeout.
    pub async fn send(&self, event: Event) -> Result<PublishReceipt> {
        self.send_with_timeout(event, self.config.confirm_timeout)
            .await
    }

    /// Publish with an explicit deadline. On expiry the publish stays
    /// tracked and settles with whichever event arrives later; only the
    /// caller stops waiting.
    pub async fn send_with_timeout(
        &self,
        event: Event,
        timeout: Duration,
    ) -> Result<PublishReceipt> {
        // Structurally invalid payloads surface immediately, never retried.
        let payload = event.encode()?;

        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(PublishRequest {
                event,
                payload,
                result_tx,
            })
            .await
            .map_err(|_| ConveyorError::ShutdownInProgress)?;

        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConveyorError::ShutdownInProgress),
            Err(_) => Err(ConveyorError::PublishTimeout(timeout)),
        }
    }

    /// Publishes awaiting a confirm or a replay.
    pub fn outstanding(&self) -> usize {
        self.registry.len()
    }
}

struct PublishLoop {
    queue: QueueOptions,
    config: PublisherConfig,
    pool: Arc<ChannelPool>,
    registry: Arc<DeliveryRegistry<OutstandingPublish>>,
    loop_tx: mpsc::Sender<LoopCmd>,
    channel: Option<PooledChannel>,
    next_sequence: u64,
    replay_scheduled: bool,
}

impl PublishLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<PublishRequest>,
        mut loop_rx: mpsc::Receiver<LoopCmd>,
        mut events_rx: broadcast::Receiver<ConnectionEvent>,
    ) {
        let mut requests_open = true;
        let mut events_open = true;

        loop {
            if !requests_open && self.registry.is_empty() {
                break;
            }

            tokio::select! {
                req = cmd_rx.recv(), if requests_open => match req {
                    Some(req) => self.handle_request(req).await,
                    None => requests_open = false,
                },
                Some(cmd) = loop_rx.recv() => self.handle_cmd(cmd).await,
                event = events_rx.recv(), if events_open => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed events; the channel may be stale.
                        self.mark_channel_dead();
                        self.replay("event stream lagged").await;
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
            }
        }

        if let Some(channel) = self.channel.take() {
            self.pool.release(channel);
        }
        debug!(queue = %self.queue.name, "publish loop exited");
    }

    async fn handle_request(&mut self, req: PublishRequest) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;

        self.registry.track(
            sequence,
            OutstandingPublish {
                sequence,
                event: req.event,
                payload: req.payload,
                enqueued_at: Instant::now(),
                attempts: 0,
                in_flight: false,
                result_tx: Some(req.result_tx),
            },
        );
        self.issue(sequence).await;
    }

    async fn handle_cmd(&mut self, cmd: LoopCmd) {
        match cmd {
            LoopCmd::Confirmed { sequence, result } => match result {
                Ok(Confirm::Ack) => {
                    if let Some(mut entry) = self.registry.resolve(sequence) {
                        debug!(
                            sequence,
                            elapsed_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                            "publish confirmed"
                        );
                        if let Some(tx) = entry.result_tx.take() {
                            let _ = tx.send(Ok(PublishReceipt { sequence }));
                        }
                    }
                }
                Ok(Confirm::Nack) => {
                    self.registry.with_entry(sequence, |e| e.in_flight = false);
                    self.handle_rejection(sequence);
                }
                Err(_) => {
                    // Channel died before the confirm arrived. The publish
                    // stays tracked; replay it on a fresh channel.
                    self.mark_channel_dead();
                    self.schedule_replay();
                }
            },
            LoopCmd::Retry { sequence } => self.issue(sequence).await,
            LoopCmd::Replay => {
                self.replay_scheduled = false;
                self.replay("channel failure").await;
            }
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Lost => {
                self.mark_channel_dead();
            }
            ConnectionEvent::Reconnected { .. } => {
                self.mark_channel_dead();
                self.replay("reconnected").await;
            }
            ConnectionEvent::Failed { reason } => {
                error!(reason = %reason, "connection gone for good, failing outstanding publishes");
                self.fail_all(|_| ConveyorError::ConnectionLost);
            }
        }
    }

    /// Publish one tracked entry on the current channel. With no channel
    /// available the entry simply stays tracked for the next replay.
    async fn issue(&mut self, sequence: u64) {
        let Some((payload, in_flight)) = self
            .registry
            .with_entry(sequence, |e| (e.payload.clone(), e.in_flight))
        else {
            return;
        };
        if in_flight {
            // A confirm for this entry is already pending on a live channel.
            return;
        }

        if let Err(e) = self.ensure_channel().await {
            if matches!(e, ConveyorError::Config(_)) {
                let reason = e.to_string();
                error!(queue = %self.queue.name, error = %reason, "queue declaration conflict");
                self.fail_all(move |_| ConveyorError::Config(reason.clone()));
            } else {
                debug!(sequence, error = %e, "no channel, publish deferred");
                self.schedule_replay();
            }
            return;
        }
        let Some(channel) = self.channel.as_ref() else {
            return;
        };

        match channel
            .channel()
            .publish(&self.queue.name, &payload, CONTENT_TYPE_JSON)
            .await
        {
            Ok(confirm) => {
                self.registry.with_entry(sequence, |e| e.in_flight = true);
                let loop_tx = self.loop_tx.clone();
                tokio::spawn(async move {
                    let result = confirm.wait().await;
                    let _ = loop_tx.send(LoopCmd::Confirmed { sequence, result }).await;
                });
            }
            Err(e) => {
                warn!(sequence, error = %e, "publish failed, discarding channel");
                self.mark_channel_dead();
            }
        }
    }

    fn handle_rejection(&mut self, sequence: u64) {
        let attempts = self.registry.with_entry(sequence, |e| {
            e.attempts += 1;
            e.attempts
        });
        let Some(attempts) = attempts else { return };

        if attempts > self.config.max_publish_retries {
            if let Some(mut entry) = self.registry.resolve(sequence) {
                warn!(
                    sequence,
                    attempts,
                    event = %entry.event.name,
                    "broker rejected publish, retry budget spent"
                );
                if let Some(tx) = entry.result_tx.take() {
                    let _ = tx.send(Err(ConveyorError::BrokerRejected(sequence)));
                }
            }
            return;
        }

        let delay = self
            .config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempts - 1));
        debug!(sequence, attempts, delay_ms = delay.as_millis() as u64, "publish nacked, retrying");
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = loop_tx.send(LoopCmd::Retry { sequence }).await;
        });
    }

    /// Re-issue every outstanding publish in sequence order.
    async fn replay(&mut self, reason: &str) {
        let outstanding = self.registry.outstanding();
        if outstanding.is_empty() {
            return;
        }
        info!(
            count = outstanding.len(),
            reason, "replaying outstanding publishes"
        );
        for sequence in outstanding {
            self.issue(sequence).await;
        }
    }

    /// Coalesce bursts of channel failures into one replay pass.
    fn schedule_replay(&mut self) {
        if self.replay_scheduled {
            return;
        }
        self.replay_scheduled = true;
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REPLAY_DEBOUNCE).await;
            let _ = loop_tx.send(LoopCmd::Replay).await;
        });
    }

    /// Drop the channel and clear in-flight markers so replay re-issues
    /// everything that was riding on it.
    fn mark_channel_dead(&mut self) {
        self.channel = None;
        for sequence in self.registry.outstanding() {
            self.registry.with_entry(sequence, |e| e.in_flight = false);
        }
    }

    fn fail_all(&mut self, make_error: impl Fn(u64) -> ConveyorError) {
        for (sequence, mut entry) in self.registry.drain() {
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err(make_error(sequence)));
            }
        }
    }

    /// Lazily (re)acquire the publish channel and make sure the queue
    /// exists on it.
    async fn ensure_channel(&mut self) -> Result<()> {
        if let Some(channel) = &self.channel {
            if channel.channel().is_open() {
                return Ok(());
            }
            self.channel = None;
        }

        let pooled = self.pool.acquire(ChannelRole::Publisher).await?;
        pooled.channel().declare_queue(&self.queue).await?;
        self.channel = Some(pooled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_broker::MemoryBroker;
    use cv_common::{BrokerConfig, EventAction, ReconnectPolicy};

    async fn publisher_over(broker: &MemoryBroker, config: PublisherConfig) -> Publisher {
        let manager = ConnectionManager::connect(
            Box::new(broker.clone()),
            BrokerConfig::default(),
            ReconnectPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_connect_attempts: None,
            },
        )
        .await
        .unwrap();
        let pool = ChannelPool::new(manager.clone());
        Publisher::new(&manager, pool, QueueOptions::durable("products_queue"), config)
    }

    #[tokio::test]
    async fn send_is_confirmed_and_settles() {
        let broker = MemoryBroker::new();
        let publisher = publisher_over(&broker, PublisherConfig::default()).await;

        let receipt = publisher
            .send(Event::new("widget", EventAction::Created))
            .await
            .unwrap();
        assert_eq!(receipt.sequence, 1);
        assert_eq!(publisher.outstanding(), 0);
        assert_eq!(broker.queue_depth("products_queue"), 1);
    }

    #[tokio::test]
    async fn sequential_sends_confirm_in_sequence_order() {
        let broker = MemoryBroker::new();
        let publisher = publisher_over(&broker, PublisherConfig::default()).await;

        for expected in 1..=5u64 {
            let receipt = publisher
                .send(Event::new(format!("item-{expected}"), EventAction::Updated))
                .await
                .unwrap();
            assert_eq!(receipt.sequence, expected);
        }
    }

    #[tokio::test]
    async fn rejection_surfaces_after_retry_budget() {
        let broker = MemoryBroker::new();
        let config = PublisherConfig {
            max_publish_retries: 1,
            retry_base_delay: Duration::from_millis(5),
            ..PublisherConfig::default()
        };
        let publisher = publisher_over(&broker, config).await;

        // First publish and its single retry are both nacked.
        broker.reject_next_publishes(2);
        let err = publisher
            .send(Event::new("widget", EventAction::Deleted))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::BrokerRejected(1)));
        assert_eq!(publisher.outstanding(), 0);
    }

    #[tokio::test]
    async fn rejected_once_then_accepted() {
        let broker = MemoryBroker::new();
        let config = PublisherConfig {
            retry_base_delay: Duration::from_millis(5),
            ..PublisherConfig::default()
        };
        let publisher = publisher_over(&broker, config).await;

        broker.reject_next_publishes(1);
        let receipt = publisher
            .send(Event::new("widget", EventAction::Created))
            .await
            .unwrap();
        assert_eq!(receipt.sequence, 1);
        assert_eq!(broker.queue_depth("products_queue"), 1);
    }
}
