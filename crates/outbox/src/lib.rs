//! Transactional outbox.
//!
//! A domain mutation and the event announcing it are written in one local
//! transaction. The relay publisher later drains pending records through the
//! [`OutboxStore`] trait, which both backends implement:
//!
//! - [`PostgresOutboxStore`]: relational backend on `sqlx`
//! - [`DocumentStore`]: in-process transactional document store with
//!   unique indexes and native TTL expiry
//!
//! The processed-message ledger used by idempotent consumers lives here too,
//! because it must share the consumer's store.

pub mod adapter;
pub mod document;
pub mod envelope;
pub mod error;
pub mod postgres;
pub mod record;
pub mod store;

pub use adapter::{AdapterKind, OutboxAdapter};
pub use common::AggregateId;
pub use document::{DocumentStore, Session};
pub use envelope::EventEnvelope;
pub use error::{OutboxError, Result};
pub use postgres::PostgresOutboxStore;
pub use record::{
    OutboxEvent, OutboxPolicy, OutboxRecord, OutboxStats, OutboxStatus, RetryState, WriteOutcome,
};
pub use store::{OutboxStore, ProcessedMessage, ProcessedMessageStore};
