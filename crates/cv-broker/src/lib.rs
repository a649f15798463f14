//! Broker wire contract
//!
//! The broker itself is an external collaborator; this crate pins down the
//! contract the client core relies on:
//! - reliable ordered delivery over one logical connection
//! - channel-scoped publisher confirms
//! - per-delivery-tag ack/nack
//! - idempotent queue declaration (conflicting flags are an error)
//!
//! Backends:
//! - `MemoryBroker`: embedded in-process broker for tests and local dev,
//!   with fault-injection hooks for recovery scenarios
//! - `AmqpTransport` (feature `amqp`): lapin-backed AMQP 0.9.1 adapter

pub mod error;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use cv_common::{BrokerConfig, QueueOptions};
use tokio::sync::{mpsc, oneshot};

pub use error::BrokerError;
pub use memory::MemoryBroker;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A message as it arrives off the wire, before decoding.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Channel-scoped tag used to ack or nack this delivery.
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub content_type: String,
    /// Times the broker has redelivered this message.
    pub redelivery_count: u32,
}

/// Broker verdict for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack,
}

/// Pending publisher confirm for a single publish.
///
/// The broker resolves confirms for one channel in publish order.
#[derive(Debug)]
pub struct ConfirmHandle {
    sequence: u64,
    rx: oneshot::Receiver<Confirm>,
}

impl ConfirmHandle {
    pub fn new(sequence: u64, rx: oneshot::Receiver<Confirm>) -> Self {
        Self { sequence, rx }
    }

    /// Channel-scoped publish sequence number assigned by the broker.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for the broker verdict. Fails if the channel died first.
    pub async fn wait(self) -> Result<Confirm> {
        self.rx.await.map_err(|_| BrokerError::ChannelClosed)
    }
}

/// Dials broker connections.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<Box<dyn BrokerConnection>>;
}

/// One logical connection. Multiplexes channels; state transitions are
/// observed through `closed`.
#[async_trait]
pub trait BrokerConnection: Send + Sync + std::fmt::Debug {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Resolves once the connection is no longer usable.
    async fn closed(&self);

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// A lightweight multiplexing unit. Single-writer: exactly one logical
/// operation drives a channel at a time. A channel that reports an error is
/// discarded, never reused.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotent for identical options; `DeclareConflict` when the queue
    /// exists with different flags.
    async fn declare_queue(&self, options: &QueueOptions) -> Result<()>;

    /// Publish one payload; the returned handle resolves with the broker
    /// confirm.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<ConfirmHandle>;

    /// Begin consuming; deliveries arrive on the returned channel, at most
    /// `prefetch` unacked at a time.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<RawDelivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negative-acknowledge; `requeue` returns the message to the queue with
    /// its redelivery count incremented, otherwise it is discarded.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}
