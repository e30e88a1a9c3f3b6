use common::ErrorKind;
use thiserror::Error;

/// Errors raised by brokers and streams.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the operation.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDeliveryTag { queue: String, tag: u64 },

    /// The declared topology is inconsistent.
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// The broker did not confirm a published message.
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),
}

impl BrokerError {
    /// Classifies the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Unavailable(_)
            | BrokerError::Publish(_)
            | BrokerError::Subscribe(_)
            | BrokerError::Ack(_) => ErrorKind::Transient,
            BrokerError::UnknownExchange(_)
            | BrokerError::UnknownQueue(_)
            | BrokerError::UnknownDeliveryTag { .. }
            | BrokerError::Topology(_) => ErrorKind::Validation,
        }
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
