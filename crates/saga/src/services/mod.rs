//! Collaborators driven by order events: inventory reserves and restores
//! stock, payment charges and refunds.

pub mod inventory;
pub mod payment;

pub use inventory::{InventoryService, Shortage, StockOutcome, StockUpdate, StockWrite};
pub use payment::{
    Charge, InMemoryPaymentGateway, Payment, PaymentGateway, PaymentService, PaymentStatus,
};
