//! Order fulfillment process.
//!
//! Runs the outbox relay publisher next to the consumers of the saga,
//! inventory and payment queues. Backends are picked from the environment:
//! PostgreSQL or the in-process document store for the outbox, NATS
//! JetStream or the in-memory broker for messaging.

pub mod app;
pub mod config;
pub mod error;

pub use app::{Fulfillment, describe_metrics};
pub use config::Config;
pub use error::{Result, ServiceError};
