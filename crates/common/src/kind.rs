//! Error taxonomy shared by every layer of the pipeline.
//!
//! Errors are classified where they are raised, so the consumer wrapper can
//! decide between retry and dead-letter with a plain match.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input. Rejected synchronously and never retried.
    Validation,
    /// Optimistic concurrency conflict. Retried locally with bounded backoff.
    Conflict,
    /// Broker or store unavailable. Retried by redelivery or the next poll cycle.
    Transient,
    /// Terminal business failure (insufficient stock, payment declined).
    Business,
    /// Raised without a classification; resolved by configured rules.
    Unclassified,
}

impl ErrorKind {
    /// Returns true if redelivering the message may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::Transient | ErrorKind::Unclassified
        )
    }

    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Business => "business",
            ErrorKind::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
