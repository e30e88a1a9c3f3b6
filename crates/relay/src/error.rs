use std::path::PathBuf;

use broker::BrokerError;
use common::ErrorKind;
use outbox::OutboxError;
use thiserror::Error;

/// Errors raised while loading or validating routing configuration.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Failed to read routing config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse routing config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config parsed but describes an unusable routing table.
    #[error("Invalid routing config: {0}")]
    Invalid(String),
}

/// Errors raised by the relay publisher.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Sink error: {0}")]
    Sink(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Classifies the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Outbox(err) => err.kind(),
            RelayError::Sink(err) => err.kind(),
            RelayError::Routing(_) | RelayError::Serialization(_) => ErrorKind::Validation,
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
