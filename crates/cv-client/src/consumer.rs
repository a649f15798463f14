//! Consumer - worker-pool delivery processing with per-tag settlement
//!
//! State machine: Idle -> Subscribed -> Draining -> Stopped. Deliveries are
//! pulled by a single control loop and handed to a semaphore-bounded worker
//! pool, so a slow handler never blocks intake. Handler verdicts flow back
//! to the control loop, which is the only writer on the consume channel:
//! acks and nacks are issued per delivery tag, independent of handler
//! completion order.
//!
//! On connection loss the broker requeues everything unacked; the loop bumps
//! its subscription epoch so verdicts for dead tags are dropped instead of
//! re-acked, then resubscribes for redelivery under fresh tags.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

use cv_broker::{Confirm, RawDelivery};
use cv_common::{
    ConsumerOptions, ConveyorError, Event, HandlerOutcome, PendingDelivery, QueueOptions, Result,
    CONTENT_TYPE_JSON,
};

use crate::channel::{ChannelPool, ChannelRole, PooledChannel};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::registry::DeliveryRegistry;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribed,
    Draining,
    Stopped,
}

/// Delivery metadata handed to the handler alongside the decoded event.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryContext {
    pub delivery_tag: u64,
    pub redelivery_count: u32,
}

/// Application callback for consumed events. Runs on a worker task; the
/// outcome decides ack, requeue, or dead-letter.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event, delivery: &DeliveryContext) -> HandlerOutcome;
}

enum ControlCmd {
    Stop { done_tx: oneshot::Sender<()> },
}

struct Verdict {
    delivery_tag: u64,
    epoch: u64,
    outcome: HandlerOutcome,
}

pub struct Consumer {
    connection: Arc<ConnectionManager>,
    pool: Arc<ChannelPool>,
    options: ConsumerOptions,
    state_tx: Arc<watch::Sender<ConsumerState>>,
    state_rx: watch::Receiver<ConsumerState>,
    control_tx: Mutex<Option<mpsc::Sender<ControlCmd>>>,
}

impl Consumer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        pool: Arc<ChannelPool>,
        options: ConsumerOptions,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        Self {
            connection,
            pool,
            options,
            state_tx: Arc::new(state_tx),
            state_rx,
            control_tx: Mutex::new(None),
        }
    }

    /// Declare the queue (and its dead-letter companion) and begin flow.
    pub async fn start(&self, queue: QueueOptions, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.start_with_deadline(queue, handler, DEFAULT_START_TIMEOUT)
            .await
    }

    /// `start` with an explicit setup deadline.
    pub async fn start_with_deadline(
        &self,
        queue: QueueOptions,
        handler: Arc<dyn EventHandler>,
        deadline: Duration,
    ) -> Result<()> {
        let state = *self.state_rx.borrow();
        if state != ConsumerState::Idle {
            return Err(ConveyorError::Config(format!(
                "consumer cannot start from {state:?}"
            )));
        }

        let dead_letter = match &self.options.dead_letter_queue {
            Some(name) => QueueOptions {
                name: name.clone(),
                durable: queue.durable,
            },
            None => queue.dead_letter(),
        };
        let consumer_tag = format!("conveyor-{}", uuid::Uuid::new_v4());

        let (channel, deliveries) = tokio::time::timeout(
            deadline,
            subscribe(&self.pool, &queue, &dead_letter, &self.options, &consumer_tag),
        )
        .await
        .map_err(|_| ConveyorError::Timeout(deadline))??;

        let (control_tx, control_rx) = mpsc::channel(4);
        let (verdict_tx, verdict_rx) = mpsc::channel(256);
        let events_rx = self.connection.subscribe();

        let consumer_loop = ConsumerLoop {
            queue,
            dead_letter,
            options: self.options.clone(),
            handler,
            pool: self.pool.clone(),
            registry: Arc::new(DeliveryRegistry::new()),
            channel: Some(channel),
            epoch: 0,
            verdict_tx,
            semaphore: Arc::new(Semaphore::new(self.options.concurrency as usize)),
            state_tx: self.state_tx.clone(),
            consumer_tag,
        };

        *self.control_tx.lock() = Some(control_tx);
        self.state_tx.send_replace(ConsumerState::Subscribed);
        info!("consumer subscribed");
        tokio::spawn(consumer_loop.run(control_rx, verdict_rx, events_rx, Some(deliveries)));
        Ok(())
    }

    /// Stop intake, wait for in-flight handlers up to the drain timeout,
    /// then requeue whatever did not settle.
    pub async fn stop(&self) -> Result<()> {
        let control_tx = self.control_tx.lock().take();
        let Some(control_tx) = control_tx else {
            return Err(ConveyorError::Config("consumer is not running".into()));
        };

        let (done_tx, done_rx) = oneshot::channel();
        control_tx
            .send(ControlCmd::Stop { done_tx })
            .await
            .map_err(|_| ConveyorError::ShutdownInProgress)?;
        let _ = done_rx.await;
        Ok(())
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }
}

async fn subscribe(
    pool: &ChannelPool,
    queue: &QueueOptions,
    dead_letter: &QueueOptions,
    options: &ConsumerOptions,
    consumer_tag: &str,
) -> Result<(PooledChannel, mpsc::Receiver<RawDelivery>)> {
    let pooled = pool.acquire(ChannelRole::Consumer).await?;
    pooled.channel().declare_queue(queue).await?;
    pooled.channel().declare_queue(dead_letter).await?;
    let deliveries = pooled
        .channel()
        .consume(&queue.name, consumer_tag, options.prefetch)
        .await?;
    Ok((pooled, deliveries))
}

async fn next_delivery(rx: &mut Option<mpsc::Receiver<RawDelivery>>) -> Option<RawDelivery> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct ConsumerLoop {
    queue: QueueOptions,
    dead_letter: QueueOptions,
    options: ConsumerOptions,
    handler: Arc<dyn EventHandler>,
    pool: Arc<ChannelPool>,
    registry: Arc<DeliveryRegistry<PendingDelivery>>,
    channel: Option<PooledChannel>,
    epoch: u64,
    verdict_tx: mpsc::Sender<Verdict>,
    semaphore: Arc<Semaphore>,
    state_tx: Arc<watch::Sender<ConsumerState>>,
    consumer_tag: String,
}

impl ConsumerLoop {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<ControlCmd>,
        mut verdict_rx: mpsc::Receiver<Verdict>,
        mut events_rx: broadcast::Receiver<ConnectionEvent>,
        mut deliveries: Option<mpsc::Receiver<RawDelivery>>,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                maybe = next_delivery(&mut deliveries) => match maybe {
                    Some(raw) => self.dispatch(raw).await,
                    None => {
                        // Delivery stream ended with the channel; everything
                        // unsettled is back with the broker.
                        deliveries = None;
                        self.abandon_epoch();
                        match self.resubscribe().await {
                            Ok(rx) => deliveries = Some(rx),
                            Err(e) => debug!(error = %e, "resubscribe failed, waiting for reconnect"),
                        }
                    }
                },
                Some(verdict) = verdict_rx.recv() => self.settle(verdict).await,
                event = events_rx.recv(), if events_open => match event {
                    Ok(ConnectionEvent::Lost) => {
                        self.abandon_epoch();
                        deliveries = None;
                    }
                    Ok(ConnectionEvent::Reconnected { .. }) => {
                        self.abandon_epoch();
                        match self.resubscribe().await {
                            Ok(rx) => deliveries = Some(rx),
                            Err(e) => {
                                warn!(error = %e, "resubscribe after reconnect failed");
                                deliveries = None;
                            }
                        }
                    }
                    Ok(ConnectionEvent::Failed { reason }) => {
                        error!(reason = %reason, "connection gone for good, consumer stalled");
                        self.abandon_epoch();
                        deliveries = None;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.abandon_epoch();
                        deliveries = self.resubscribe().await.ok();
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                cmd = control_rx.recv() => match cmd {
                    Some(ControlCmd::Stop { done_tx }) => {
                        deliveries = None;
                        self.drain(&mut verdict_rx).await;
                        self.state_tx.send_replace(ConsumerState::Stopped);
                        let _ = done_tx.send(());
                        break;
                    }
                    None => {
                        // Consumer handle dropped without stop(); drain anyway.
                        deliveries = None;
                        self.drain(&mut verdict_rx).await;
                        self.state_tx.send_replace(ConsumerState::Stopped);
                        break;
                    }
                },
            }
        }

        debug!(queue = %self.queue.name, "consumer loop exited");
    }

    /// Track the delivery and hand it to a worker. Only waits for worker
    /// pool capacity, never for the handler itself.
    async fn dispatch(&mut self, raw: RawDelivery) {
        self.registry.track(
            raw.delivery_tag,
            PendingDelivery {
                delivery_tag: raw.delivery_tag,
                payload: raw.payload.clone(),
                delivered_at: Instant::now(),
                redelivery_count: raw.redelivery_count,
                epoch: self.epoch,
            },
        );

        let event = match Event::decode(&raw.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(tag = raw.delivery_tag, error = %e, "undecodable payload");
                let verdict = Verdict {
                    delivery_tag: raw.delivery_tag,
                    epoch: self.epoch,
                    outcome: HandlerOutcome::dead_letter(e.to_string()),
                };
                self.settle(verdict).await;
                return;
            }
        };

        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        let handler = self.handler.clone();
        let verdict_tx = self.verdict_tx.clone();
        let epoch = self.epoch;
        let context = DeliveryContext {
            delivery_tag: raw.delivery_tag,
            redelivery_count: raw.redelivery_count,
        };

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = handler.handle(event, &context).await;
            let _ = verdict_tx
                .send(Verdict {
                    delivery_tag: context.delivery_tag,
                    epoch,
                    outcome,
                })
                .await;
        });
    }

    async fn settle(&mut self, verdict: Verdict) {
        if verdict.epoch != self.epoch {
            // The tag died with its channel; the broker already requeued the
            // message. Acking here would hit a foreign tag.
            debug!(tag = verdict.delivery_tag, "stale verdict after resubscribe, dropped");
            return;
        }
        let Some(entry) = self.registry.resolve(verdict.delivery_tag) else {
            return;
        };

        match verdict.outcome {
            HandlerOutcome::Success => {
                debug!(
                    tag = verdict.delivery_tag,
                    elapsed_ms = entry.delivered_at.elapsed().as_millis() as u64,
                    "delivery processed"
                );
                self.ack(verdict.delivery_tag).await;
            }
            HandlerOutcome::Retry { reason } => {
                if entry.redelivery_count >= self.options.redelivery_ceiling {
                    warn!(
                        tag = verdict.delivery_tag,
                        redeliveries = entry.redelivery_count,
                        ceiling = self.options.redelivery_ceiling,
                        reason = %reason,
                        "redelivery ceiling reached, dead-lettering"
                    );
                    self.send_to_dead_letter(verdict.delivery_tag, &entry.payload)
                        .await;
                } else {
                    debug!(
                        tag = verdict.delivery_tag,
                        redeliveries = entry.redelivery_count,
                        reason = %reason,
                        "handler failed, requeueing"
                    );
                    self.nack(verdict.delivery_tag, true).await;
                }
            }
            HandlerOutcome::DeadLetter { reason } => {
                warn!(tag = verdict.delivery_tag, reason = %reason, "dead-lettering poison delivery");
                self.send_to_dead_letter(verdict.delivery_tag, &entry.payload)
                    .await;
            }
        }
    }

    async fn ack(&mut self, delivery_tag: u64) {
        let Some(channel) = &self.channel else { return };
        if let Err(e) = channel.channel().ack(delivery_tag).await {
            warn!(tag = delivery_tag, error = %e, "ack failed");
        }
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) {
        let Some(channel) = &self.channel else { return };
        if let Err(e) = channel.channel().nack(delivery_tag, requeue).await {
            warn!(tag = delivery_tag, error = %e, "nack failed");
        }
    }

    /// Park the payload on the dead-letter queue, then ack the original.
    /// If the dead-letter publish fails the delivery is requeued instead;
    /// nothing is ever silently dropped.
    async fn send_to_dead_letter(&mut self, delivery_tag: u64, payload: &[u8]) {
        let parked = match self.pool.acquire(ChannelRole::Publisher).await {
            Ok(pooled) => {
                let confirmed = match pooled
                    .channel()
                    .publish(&self.dead_letter.name, payload, CONTENT_TYPE_JSON)
                    .await
                {
                    Ok(confirm) => matches!(confirm.wait().await, Ok(Confirm::Ack)),
                    Err(_) => false,
                };
                if confirmed {
                    self.pool.release(pooled);
                }
                confirmed
            }
            Err(e) => {
                warn!(error = %e, "no channel for dead-letter publish");
                false
            }
        };

        if parked {
            self.ack(delivery_tag).await;
        } else {
            self.nack(delivery_tag, true).await;
        }
    }

    /// Drop state tied to the dead channel. The broker requeues everything
    /// unacked on its side; redeliveries arrive under fresh tags.
    fn abandon_epoch(&mut self) {
        let abandoned = self.registry.len();
        if abandoned > 0 {
            info!(abandoned, "unsettled deliveries returned to broker");
        }
        self.registry.clear();
        self.epoch += 1;
        self.channel = None;
    }

    async fn resubscribe(&mut self) -> Result<mpsc::Receiver<RawDelivery>> {
        let (channel, deliveries) = subscribe(
            &self.pool,
            &self.queue,
            &self.dead_letter,
            &self.options,
            &self.consumer_tag,
        )
        .await?;
        self.channel = Some(channel);
        info!(queue = %self.queue.name, epoch = self.epoch, "consumer resubscribed");
        Ok(deliveries)
    }

    async fn drain(&mut self, verdict_rx: &mut mpsc::Receiver<Verdict>) {
        self.state_tx.send_replace(ConsumerState::Draining);
        info!(
            queue = %self.queue.name,
            in_flight = self.registry.len(),
            "draining consumer"
        );

        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, verdict_rx.recv()).await {
                Ok(Some(verdict)) => self.settle(verdict).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.registry.len(),
                        "drain timeout, abandoning in-flight handlers"
                    );
                    break;
                }
            }
        }

        // Abandoned handlers lose their deliveries back to the broker.
        for (delivery_tag, _) in self.registry.drain() {
            self.nack(delivery_tag, true).await;
        }

        // Closing the channel requeues deliveries that were prefetched but
        // never dispatched.
        if let Some(channel) = self.channel.take() {
            channel.channel().close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_broker::{BrokerTransport, MemoryBroker};
    use cv_common::{BrokerConfig, EventAction, ReconnectPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: Event, _delivery: &DeliveryContext) -> HandlerOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                HandlerOutcome::retry("simulated failure")
            } else {
                HandlerOutcome::Success
            }
        }
    }

    async fn harness(broker: &MemoryBroker) -> (Arc<ConnectionManager>, Arc<ChannelPool>) {
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
        (manager, pool)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached within deadline");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn seed_queue(broker: &MemoryBroker, queue: &QueueOptions, events: &[Event]) {
        let conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        let chan = conn.open_channel().await.unwrap();
        chan.declare_queue(queue).await.unwrap();
        for event in events {
            chan.publish(&queue.name, &event.encode().unwrap(), CONTENT_TYPE_JSON)
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
        }
        conn.close().await;
    }

    #[tokio::test]
    async fn consumes_and_acks_a_delivery() {
        let broker = MemoryBroker::new();
        let queue = QueueOptions::durable("q");
        seed_queue(&broker, &queue, &[Event::new("widget", EventAction::Created)]).await;

        let (manager, pool) = harness(&broker).await;
        let consumer = Consumer::new(manager, pool, ConsumerOptions::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        consumer.start(queue.clone(), handler.clone()).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Subscribed);

        eventually(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        eventually(|| broker.queue_depth("q") == 0).await;

        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn start_is_rejected_when_not_idle() {
        let broker = MemoryBroker::new();
        let queue = QueueOptions::durable("q");
        seed_queue(&broker, &queue, &[]).await;

        let (manager, pool) = harness(&broker).await;
        let consumer = Consumer::new(manager, pool, ConsumerOptions::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        consumer.start(queue.clone(), handler.clone()).await.unwrap();

        let err = consumer.start(queue, handler).await.unwrap_err();
        assert!(matches!(err, ConveyorError::Config(_)));
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let broker = MemoryBroker::new();
        let queue = QueueOptions::durable("q");
        {
            let conn = broker.connect(&BrokerConfig::default()).await.unwrap();
            let chan = conn.open_channel().await.unwrap();
            chan.declare_queue(&queue).await.unwrap();
            chan.publish("q", b"not json", CONTENT_TYPE_JSON)
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
            conn.close().await;
        }

        let (manager, pool) = harness(&broker).await;
        let consumer = Consumer::new(manager, pool, ConsumerOptions::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        consumer.start(queue, handler.clone()).await.unwrap();

        eventually(|| broker.queue_depth("q.dead-letter") == 1).await;
        assert_eq!(broker.queue_depth("q"), 0);
        // The handler never saw the malformed payload.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        consumer.stop().await.unwrap();
    }
}
