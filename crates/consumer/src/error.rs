use broker::BrokerError;
use common::ErrorKind;
use outbox::OutboxError;
use thiserror::Error;

/// Failure reported by an [`EventHandler`](crate::EventHandler).
///
/// The kind decides between retry and dead-letter. Handlers that cannot
/// tell use [`ErrorKind::Unclassified`] and leave the call to the
/// [`ErrorClassifier`](crate::ErrorClassifier).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }
}

/// Errors raised by the consumer wrapper itself. Handler failures never
/// surface here; they become retry or dead-letter decisions.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] OutboxError),

    #[error("Invalid classifier pattern: {0}")]
    Classifier(#[from] regex::Error),
}

impl ConsumerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::Broker(err) => err.kind(),
            ConsumerError::Ledger(err) => err.kind(),
            ConsumerError::Classifier(_) => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
