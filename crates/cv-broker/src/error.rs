use cv_common::ConveyorError;

/// Failures reported by a broker backend.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Credentials refused by the broker. Never retried.
    #[error("access refused for user '{0}'")]
    AccessRefused(String),

    /// Broker not reachable. Retryable.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    /// Same queue name declared with different durability flags.
    #[error("queue '{queue}' already declared with durable={existing}")]
    DeclareConflict { queue: String, existing: bool },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Fatal errors are surfaced to the caller instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::AccessRefused(_) | BrokerError::DeclareConflict { .. }
        )
    }
}

impl From<BrokerError> for ConveyorError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::AccessRefused(_) | BrokerError::Unreachable(_) => {
                ConveyorError::ConnectFailure(err.to_string())
            }
            BrokerError::ConnectionClosed => ConveyorError::ConnectionLost,
            BrokerError::DeclareConflict { .. } => ConveyorError::Config(err.to_string()),
            BrokerError::ChannelClosed
            | BrokerError::UnknownDeliveryTag(_)
            | BrokerError::Protocol(_) => ConveyorError::Channel(err.to_string()),
        }
    }
}
