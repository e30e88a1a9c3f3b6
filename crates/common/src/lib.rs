//! Shared types used across the outbox, relay, consumer and saga crates.

pub mod kind;
pub mod types;

pub use kind::ErrorKind;
pub use types::AggregateId;
