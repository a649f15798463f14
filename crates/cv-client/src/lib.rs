//! Conveyor client core
//!
//! Reliable at-least-once publish/consume over a message broker:
//! - ConnectionManager: one managed connection with backoff reconnect
//! - ChannelPool: single-writer channels multiplexed over the connection
//! - Publisher: confirm-tracked sends with FIFO replay after reconnect
//! - Consumer: worker-pool deliveries with per-tag ack/nack and
//!   dead-letter routing
//! - DeliveryRegistry: outstanding publish / pending delivery tracking
//! - Client: connection lifecycle handle

pub mod channel;
pub mod client;
pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod registry;

pub use channel::{ChannelPool, ChannelRole, PooledChannel};
pub use client::Client;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use consumer::{Consumer, ConsumerState, DeliveryContext, EventHandler};
pub use publisher::Publisher;
pub use registry::DeliveryRegistry;

pub use cv_common::{ConveyorError, Result};
