use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ============================================================================
// Domain Event
// ============================================================================

/// Content type attached to every published payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The domain event carried through the broker.
///
/// Wire form: `{"productName": "...", "action": "CREATED"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "productName")]
    pub name: String,
    pub action: EventAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

impl Event {
    pub fn new(name: impl Into<String>, action: EventAction) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    /// Serialize to the wire payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConveyorError::Serialization(e.to_string()))
    }

    /// Decode a wire payload. Malformed bytes never yield a partial event.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| ConveyorError::Serialization(e.to_string()))
    }
}

// ============================================================================
// Delivery Bookkeeping
// ============================================================================

/// A publish awaiting its broker confirm. Owned by the publisher's registry
/// from send until confirm-ack, rejection after the retry budget, or replay.
#[derive(Debug)]
pub struct OutstandingPublish {
    pub sequence: u64,
    pub event: Event,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
    pub attempts: u32,
    /// True while a publish for this entry awaits its confirm on a live
    /// channel. Cleared when that channel dies so replay re-issues it.
    pub in_flight: bool,
    /// Resolves the caller blocked in `send`. Taken on settlement; a caller
    /// that already timed out just drops the receiving side.
    pub result_tx: Option<tokio::sync::oneshot::Sender<Result<PublishReceipt>>>,
}

/// A delivery handed to a worker but not yet settled with the broker.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub delivered_at: Instant,
    pub redelivery_count: u32,
    /// Subscription epoch the tag belongs to. Tags from an earlier epoch are
    /// dead after reconnect and must never be acked.
    pub epoch: u64,
}

/// Returned to the caller once a publish is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub sequence: u64,
}

/// Handler verdict for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; ack the delivery.
    Success,
    /// Transient failure; requeue unless the redelivery ceiling is hit.
    Retry { reason: String },
    /// Poison pill; route straight to the dead-letter queue.
    DeadLetter { reason: String },
}

impl HandlerOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
        }
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Broker endpoint and credentials. No hidden globals: every connection is
/// built from an explicit config value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Reported to the broker for operator visibility.
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            connection_name: "conveyor".to_string(),
        }
    }
}

/// Reconnect behavior for the connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First retry delay; doubles per attempt.
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
    /// `None` retries transient failures indefinitely.
    pub max_connect_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_connect_attempts: None,
        }
    }
}

/// Queue identity and durability. Declaration is idempotent for equal flags
/// and an error when flags conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
}

impl QueueOptions {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }

    /// Dead-letter companion queue, same durability.
    pub fn dead_letter(&self) -> Self {
        Self {
            name: format!("{}.dead-letter", self.name),
            durable: self.durable,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable("products_queue")
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Retry budget for broker nacks and lost confirms.
    pub max_publish_retries: u32,
    /// How long `send` waits for the confirm before reporting a timeout.
    pub confirm_timeout: Duration,
    /// First retry delay after a broker nack; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_publish_retries: 3,
            confirm_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Worker pool size for handler invocations.
    pub concurrency: u32,
    /// Deliveries the broker may keep in flight on the channel.
    pub prefetch: u16,
    /// Requeues allowed before a delivery is dead-lettered.
    pub redelivery_ceiling: u32,
    /// Bound on waiting for in-flight handlers during `stop`.
    pub drain_timeout: Duration,
    /// Overrides the `<queue>.dead-letter` default.
    pub dead_letter_queue: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            prefetch: 64,
            redelivery_ceiling: 3,
            drain_timeout: Duration::from_secs(30),
            dead_letter_queue: None,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Typed failure taxonomy so callers can branch on recoverability.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// Fatal: bad credentials or host unreachable after the retry budget.
    #[error("connect failure: {0}")]
    ConnectFailure(String),

    /// Recovered locally by discarding the channel; surfaced only when that
    /// recovery is impossible.
    #[error("channel error: {0}")]
    Channel(String),

    /// Structurally invalid payload; never retried.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Confirm did not arrive inside the deadline; the publish stays tracked.
    #[error("publish confirm timed out after {0:?}")]
    PublishTimeout(Duration),

    /// A deadline-carrying operation ran out of time. Registry state is left
    /// intact; the pending work settles with whichever event arrives later.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Broker negatively confirmed the publish and retries are exhausted.
    #[error("broker rejected publish seq={0}")]
    BrokerRejected(u64),

    /// Connection dropped and retries are exhausted.
    #[error("connection lost")]
    ConnectionLost,

    #[error("handler failure: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, ConveyorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_for_all_actions() {
        for action in [
            EventAction::Created,
            EventAction::Updated,
            EventAction::Deleted,
        ] {
            let event = Event::new("widget", action);
            let bytes = event.encode().unwrap();
            assert_eq!(Event::decode(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn event_wire_form_matches_contract() {
        let event = Event::new("widget", EventAction::Created);
        let json: serde_json::Value =
            serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json["productName"], "widget");
        assert_eq!(json["action"], "CREATED");
    }

    #[test]
    fn decode_of_malformed_bytes_is_a_serialization_error() {
        let err = Event::decode(b"{\"productName\": 12").unwrap_err();
        assert!(matches!(err, ConveyorError::Serialization(_)));

        // Wrong shape, valid JSON: still a serialization error.
        let err = Event::decode(b"{\"action\": \"EXPLODED\"}").unwrap_err();
        assert!(matches!(err, ConveyorError::Serialization(_)));
    }

    #[test]
    fn dead_letter_queue_inherits_durability() {
        let queue = QueueOptions::durable("orders");
        let dlq = queue.dead_letter();
        assert_eq!(dlq.name, "orders.dead-letter");
        assert!(dlq.durable);
    }

    #[test]
    fn defaults_are_explicit() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 5672);

        let reconnect = ReconnectPolicy::default();
        assert_eq!(reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(reconnect.max_delay, Duration::from_secs(30));
        assert!(reconnect.max_connect_attempts.is_none());

        let consumer = ConsumerOptions::default();
        assert_eq!(consumer.redelivery_ceiling, 3);
        assert_eq!(consumer.drain_timeout, Duration::from_secs(30));
    }
}
