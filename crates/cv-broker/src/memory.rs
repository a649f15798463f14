//! Embedded in-process broker
//!
//! Backend for local development and recovery tests, playing the role an
//! embedded queue plays for a real deployment. Implements the full wire
//! contract: idempotent declaration, per-channel delivery tags, confirms
//! resolved in publish order, requeue-on-nack with redelivery counting, and
//! requeue of unacked deliveries when a channel or connection closes.
//!
//! Fault-injection hooks (`kill_connections`, `fail_next_connects`,
//! `reject_next_publishes`) let tests drive reconnect and rejection paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use cv_common::{BrokerConfig, QueueOptions};

use crate::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerTransport, Confirm, ConfirmHandle,
    RawDelivery, Result,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    content_type: String,
    redelivery_count: u32,
}

struct ConsumerSeat {
    channel: Weak<ChanShared>,
    tx: mpsc::Sender<RawDelivery>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    seats: Vec<ConsumerSeat>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    connections: Vec<Arc<ConnShared>>,
}

struct ConnShared {
    closed_tx: watch::Sender<bool>,
    channels: Mutex<Vec<Arc<ChanShared>>>,
}

struct ChanShared {
    open: AtomicBool,
    next_tag: AtomicU64,
    next_publish_seq: AtomicU64,
    /// Delivered but not yet settled, keyed by delivery tag.
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
}

impl ChanShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            next_tag: AtomicU64::new(0),
            next_publish_seq: AtomicU64::new(0),
            unacked: Mutex::new(HashMap::new()),
        })
    }
}

struct Core {
    state: Mutex<BrokerState>,
    fail_connects: AtomicU32,
    reject_publishes: AtomicU32,
    username: String,
    password: String,
}

impl Core {
    /// Move ready messages to consumer seats with capacity. Caller holds the
    /// state lock; per-channel locks nest inside it, never the other way
    /// around.
    fn pump_queue(state: &mut BrokerState, queue_name: &str) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        queue.seats.retain(|seat| {
            seat.channel
                .upgrade()
                .map(|c| c.open.load(Ordering::SeqCst))
                .unwrap_or(false)
                && !seat.tx.is_closed()
        });

        while let Some(msg) = queue.ready.pop_front() {
            let mut delivered = false;

            for seat in &queue.seats {
                let Some(chan) = seat.channel.upgrade() else {
                    continue;
                };
                let tag = chan.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                let delivery = RawDelivery {
                    delivery_tag: tag,
                    payload: msg.payload.clone(),
                    content_type: msg.content_type.clone(),
                    redelivery_count: msg.redelivery_count,
                };
                if seat.tx.try_send(delivery).is_ok() {
                    chan.unacked
                        .lock()
                        .insert(tag, (queue_name.to_string(), msg.clone()));
                    delivered = true;
                    break;
                }
            }

            if !delivered {
                queue.ready.push_front(msg);
                break;
            }
        }
    }

    /// Requeue a channel's unsettled deliveries and mark it closed.
    fn close_channel(&self, chan: &Arc<ChanShared>) {
        if !chan.open.swap(false, Ordering::SeqCst) {
            return;
        }

        // Drain under the channel lock, requeue under the state lock.
        let requeue: Vec<(String, StoredMessage)> = {
            let mut unacked = chan.unacked.lock();
            unacked
                .drain()
                .map(|(_, (queue, mut msg))| {
                    msg.redelivery_count += 1;
                    (queue, msg)
                })
                .collect()
        };

        let mut state = self.state.lock();
        let mut touched = Vec::new();
        for (queue_name, msg) in requeue {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(msg);
                if !touched.contains(&queue_name) {
                    touched.push(queue_name);
                }
            }
        }
        for queue_name in touched {
            Self::pump_queue(&mut state, &queue_name);
        }
    }

    fn close_connection(&self, conn: &Arc<ConnShared>) {
        let channels: Vec<Arc<ChanShared>> = conn.channels.lock().drain(..).collect();
        for chan in &channels {
            self.close_channel(chan);
        }

        self.state
            .lock()
            .connections
            .retain(|c| !Arc::ptr_eq(c, conn));
        let _ = conn.closed_tx.send(true);
    }
}

/// Embedded broker handle. Cheap to clone; all clones share one broker.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<Core>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_credentials("guest", "guest")
    }

    /// Broker that only accepts the given credentials.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(BrokerState::default()),
                fail_connects: AtomicU32::new(0),
                reject_publishes: AtomicU32::new(0),
                username: username.into(),
                password: password.into(),
            }),
        }
    }

    /// Drop every open connection, requeueing unacked deliveries.
    pub fn kill_connections(&self) {
        let connections: Vec<Arc<ConnShared>> =
            self.core.state.lock().connections.iter().cloned().collect();
        debug!(connections = connections.len(), "killing broker connections");
        for conn in connections {
            self.core.close_connection(&conn);
        }
    }

    /// Fail the next `n` connect attempts with a transient error.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Negatively confirm the next `n` publishes.
    pub fn reject_next_publishes(&self, n: u32) {
        self.core.reject_publishes.store(n, Ordering::SeqCst);
    }

    /// Messages sitting ready (not in flight) on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.core.state.lock().queues.contains_key(queue)
    }

    /// Payloads currently ready on a queue, front first.
    pub fn queue_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.core
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.core.state.lock().connections.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<Box<dyn BrokerConnection>> {
        let remaining = self.core.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.core.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Unreachable("injected connect failure".into()));
        }

        if config.username != self.core.username || config.password != self.core.password {
            return Err(BrokerError::AccessRefused(config.username.clone()));
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(ConnShared {
            closed_tx,
            channels: Mutex::new(Vec::new()),
        });
        self.core.state.lock().connections.push(shared.clone());

        Ok(Box::new(MemoryConnection {
            core: self.core.clone(),
            shared,
            closed_rx,
        }))
    }
}

struct MemoryConnection {
    core: Arc<Core>,
    shared: Arc<ConnShared>,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if *self.closed_rx.borrow() {
            return Err(BrokerError::ConnectionClosed);
        }

        let chan = ChanShared::new();
        self.shared.channels.lock().push(chan.clone());

        Ok(Box::new(MemoryChannel {
            core: self.core.clone(),
            chan,
        }))
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    async fn close(&self) {
        self.core.close_connection(&self.shared);
    }
}

struct MemoryChannel {
    core: Arc<Core>,
    chan: Arc<ChanShared>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.chan.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.core.state.lock();
        match state.queues.get(&options.name) {
            Some(existing) if existing.durable == options.durable => Ok(()),
            Some(existing) => Err(BrokerError::DeclareConflict {
                queue: options.name.clone(),
                existing: existing.durable,
            }),
            None => {
                state.queues.insert(
                    options.name.clone(),
                    QueueState {
                        durable: options.durable,
                        ..QueueState::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<ConfirmHandle> {
        self.ensure_open()?;

        let sequence = self.chan.next_publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();

        // Confirms settle before `publish` returns, so the per-channel FIFO
        // confirm order falls out of publish order.
        let verdict = {
            let mut state = self.core.state.lock();
            let rejected = {
                let remaining = self.core.reject_publishes.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.core
                        .reject_publishes
                        .store(remaining - 1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            };

            if rejected || !state.queues.contains_key(queue) {
                Confirm::Nack
            } else {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_back(StoredMessage {
                        payload: payload.to_vec(),
                        content_type: content_type.to_string(),
                        redelivery_count: 0,
                    });
                }
                Core::pump_queue(&mut state, queue);
                Confirm::Ack
            }
        };

        let _ = tx.send(verdict);
        Ok(ConfirmHandle::new(sequence, rx))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<RawDelivery>> {
        self.ensure_open()?;

        let capacity = prefetch.max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);

        let mut state = self.core.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Protocol(format!(
                "queue '{queue}' does not exist"
            )));
        }

        debug!(queue, consumer_tag, prefetch, "consumer registered");
        if let Some(q) = state.queues.get_mut(queue) {
            q.seats.push(ConsumerSeat {
                channel: Arc::downgrade(&self.chan),
                tx,
            });
        }
        Core::pump_queue(&mut state, queue);

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;

        self.chan
            .unacked
            .lock()
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;

        let entry = self.chan.unacked.lock().remove(&delivery_tag);
        let Some((queue_name, mut msg)) = entry else {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        };

        if requeue {
            msg.redelivery_count += 1;
            let mut state = self.core.state.lock();
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_front(msg);
            }
            Core::pump_queue(&mut state, &queue_name);
        }

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.chan.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.core.close_channel(&self.chan);
    }
}
