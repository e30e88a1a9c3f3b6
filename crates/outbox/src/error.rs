use common::ErrorKind;
use thiserror::Error;

/// Errors that can occur when interacting with an outbox store.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A concurrent transaction modified the same data first.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row carried a status outside PENDING/PROCESSED/FAILED.
    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    /// The configured adapter name is not recognised.
    #[error("Unknown outbox adapter: {0}")]
    UnknownAdapter(String),
}

impl OutboxError {
    /// Classifies the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OutboxError::WriteConflict(_) => ErrorKind::Conflict,
            OutboxError::Database(sqlx::Error::Database(db)) if is_conflict_code(db.code()) => {
                ErrorKind::Conflict
            }
            OutboxError::Database(_) | OutboxError::Migration(_) => ErrorKind::Transient,
            OutboxError::Serialization(_)
            | OutboxError::InvalidStatus(_)
            | OutboxError::UnknownAdapter(_) => ErrorKind::Validation,
        }
    }
}

/// Serialization failure and deadlock SQLSTATEs.
pub(crate) fn is_conflict_code(code: Option<std::borrow::Cow<'_, str>>) -> bool {
    matches!(code.as_deref(), Some("40001") | Some("40P01"))
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
