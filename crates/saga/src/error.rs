//! Saga error types.

use common::{AggregateId, ErrorKind};
use consumer::HandlerError;
use outbox::OutboxError;
use thiserror::Error;

/// Errors that can occur while placing orders or driving the saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request or event is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The event refers to an order that does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// The order kept changing under the guarded update.
    #[error("Order {0} changed concurrently on every attempt")]
    GuardContention(AggregateId),

    /// The payment provider could not be reached.
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// Outbox or store error.
    #[error("Store error: {0}")]
    Store(#[from] OutboxError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for SagaError {
    fn from(err: sqlx::Error) -> Self {
        SagaError::Store(OutboxError::from(err))
    }
}

impl SagaError {
    /// Classifies the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Validation(_)
            | SagaError::OrderNotFound(_)
            | SagaError::Serialization(_) => ErrorKind::Validation,
            SagaError::GuardContention(_) => ErrorKind::Conflict,
            SagaError::Gateway(_) => ErrorKind::Transient,
            SagaError::Store(err) => err.kind(),
        }
    }
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        HandlerError::new(err.kind(), err.to_string())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
