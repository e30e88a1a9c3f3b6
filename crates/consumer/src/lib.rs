//! Idempotent message consumption.
//!
//! [`IdempotentConsumer`] wraps an [`EventHandler`] with the delivery
//! guarantees the rest of the pipeline relies on:
//! - deduplication through a [`outbox::ProcessedMessageStore`] ledger
//! - manual acknowledgement, optionally batched with [`AckBatcher`]
//! - retry-count-aware redelivery and dead-lettering, decided by
//!   [`ErrorClassifier`]

pub mod batch;
pub mod classify;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message_id;

pub use batch::AckBatcher;
pub use classify::{DEFAULT_NON_RETRIABLE, DEFAULT_RETRIABLE, Disposition, ErrorClassifier};
pub use consumer::{ConsumeSummary, ConsumerSettings, IdempotentConsumer, Outcome};
pub use error::{ConsumerError, HandlerError, Result};
pub use handler::EventHandler;
pub use message_id::{derive_message_id, ledger_key, message_id};
