//! Order fulfillment saga.
//!
//! Orders are placed in PROCESSING with an `order.initiated` outbox event.
//! The inventory service reserves stock, the saga moves the order to CREATED,
//! the payment service charges it, and the saga places it. Failures move the
//! order to FAILED and carry what must be compensated: stock to restore or a
//! payment to refund.
//!
//! Every step is a local transaction that writes its state change and its
//! outbox event together, and every step is safe to run more than once.

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod order;
pub mod placement;
pub mod repository;
pub mod retry;
pub mod services;

pub use error::{Result, SagaError};
pub use events::{FulfillmentEvent, SagaTrigger};
pub use orchestrator::{Decision, OrderSaga, SagaOutcome, decide};
pub use order::{Money, Order, OrderItem, OrderStatus};
pub use placement::OrderService;
pub use repository::{OrderRepository, Transition, TransitionResult};
pub use retry::ConflictRetry;
pub use services::{
    Charge, InMemoryPaymentGateway, InventoryService, Payment, PaymentGateway, PaymentService,
    PaymentStatus, StockOutcome,
};
