//! Startup and runtime errors of the fulfillment process.

use broker::BrokerError;
use outbox::OutboxError;
use relay::RoutingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// An environment variable held a value that could not be used.
    #[error("invalid {name}={value:?}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("metrics exporter failed: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
