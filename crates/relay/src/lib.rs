//! Outbox relay publisher.
//!
//! Polls an [`outbox::OutboxStore`] and forwards pending records to the sinks
//! their event type routes to:
//! - [`RoutingTable`] maps event types to broker exchanges and append-only streams
//! - [`Sinks`] holds the concrete publishers a [`SinkDescriptor`] resolves to
//! - [`AdaptiveController`] grows the batch and shortens the poll interval
//!   under backlog, and does the reverse when the outbox is quiet
//! - [`RelayPublisher`] runs the `FETCH -> PUBLISH -> MARK` cycle

pub mod adaptive;
pub mod cycle;
pub mod error;
pub mod publisher;
pub mod routing;
pub mod sink;

pub use adaptive::{AdaptiveController, Adjustment};
pub use cycle::{CycleAccumulator, CycleReport};
pub use error::{RelayError, Result, RoutingError};
pub use publisher::{RelayPublisher, RelaySettings};
pub use routing::{RoutingConfig, RoutingRule, RoutingTable, SinkDescriptor};
pub use sink::Sinks;
