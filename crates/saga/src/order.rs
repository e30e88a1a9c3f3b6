//! Order model driven by the saga.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// Money amount represented in cents to avoid floating point issues.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Multiplies by a quantity. `None` on overflow.
    pub fn checked_multiply(&self, quantity: u32) -> Option<Money> {
        self.0.checked_mul(i64::from(quantity)).map(Money)
    }

    pub fn checked_add(&self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{sign}${}.{:02}", (self.0 / 100).abs(), (self.0 % 100).abs())
    }
}


/// A line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    /// Price per unit in cents.
    #[serde(default)]
    pub unit_price: Money,
}

impl OrderItem {
    pub fn new(product_id: impl Into<String>, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns the total price for this item (quantity * unit_price), or
    /// `None` when it does not fit in an `i64` of cents.
    pub fn line_total(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }
}

/// The status of an order.
///
/// ```text
/// PROCESSING ──► CREATED ──► PLACED
///     │              │          │
///     └──────────────┴──────────┴──► FAILED
/// ```
///
/// PROCESSING may also go straight to PLACED when payment lands before the
/// reservation. `PLACED` and `FAILED` are terminal; the only exit from
/// `PLACED` is a reservation failure, which fails the order and flags it
/// for refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Processing,
    Created,
    Placed,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Placed | OrderStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Created => "CREATED",
            OrderStatus::Placed => "PLACED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PROCESSING" => Ok(OrderStatus::Processing),
            "CREATED" => Ok(OrderStatus::Created),
            "PLACED" => Ok(OrderStatus::Placed),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(SagaError::Validation(format!("unknown order status '{other}'"))),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order as stored by the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: AggregateId,
    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub status: OrderStatus,
    pub failure_reason: Option<String>,
    pub refund_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds a new PROCESSING order, validating its items.
    pub fn new(user_id: impl Into<String>, items: Vec<OrderItem>) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(SagaError::Validation("order has no user".to_string()));
        }
        if items.is_empty() {
            return Err(SagaError::Validation("order has no items".to_string()));
        }
        for item in &items {
            if item.product_id.trim().is_empty() {
                return Err(SagaError::Validation("item has no product id".to_string()));
            }
            if item.quantity == 0 {
                return Err(SagaError::Validation(format!(
                    "item {} has zero quantity",
                    item.product_id
                )));
            }
            if item.unit_price.is_negative() {
                return Err(SagaError::Validation(format!(
                    "item {} has a negative price",
                    item.product_id
                )));
            }
        }

        let total_amount = items
            .iter()
            .try_fold(Money::zero(), |total, item| {
                item.line_total().and_then(|line| total.checked_add(line))
            })
            .ok_or_else(|| SagaError::Validation("order total overflows".to_string()))?;

        let now = Utc::now();
        Ok(Self {
            id: AggregateId::new(),
            user_id,
            total_amount,
            items,
            status: OrderStatus::Processing,
            failure_reason: None,
            refund_required: false,
            created_at: now,
            updated_at: now,
        })
    }
}
