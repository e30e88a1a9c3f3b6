//! Events exchanged between the order, inventory and payment services.
//!
//! Every event is keyed by the order it concerns: the outbox aggregate id is
//! the order id, so each event type is written at most once per order.

use common::AggregateId;
use outbox::{EventEnvelope, OutboxEvent};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Result, SagaError};
use crate::order::{Money, OrderItem};

pub const ORDER_INITIATED: &str = "order.initiated";
pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_PLACED: &str = "order.placed";
pub const ORDER_FAILED: &str = "order.failed";
pub const ORDER_COMPENSATION_REQUESTED: &str = "order.compensation_requested";
pub const INVENTORY_RESERVED: &str = "inventory.reserved";
pub const INVENTORY_RESERVATION_FAILED: &str = "inventory.reservation_failed";
pub const INVENTORY_RESTORED: &str = "inventory.restored";
pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_REFUNDED: &str = "payment.refunded";

/// A typed event payload with a fixed event type.
pub trait FulfillmentEvent: Serialize + DeserializeOwned {
    const EVENT_TYPE: &'static str;
    const AGGREGATE_TYPE: &'static str;

    fn order_id(&self) -> &AggregateId;

    /// Builds the outbox descriptor announcing this event.
    fn to_outbox(&self) -> Result<OutboxEvent> {
        Ok(OutboxEvent::new(
            self.order_id().clone(),
            Self::AGGREGATE_TYPE,
            Self::EVENT_TYPE,
            self,
        )?)
    }

    /// Decodes the payload of an envelope carrying this event type.
    fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        envelope.decode().map_err(|e| {
            SagaError::Validation(format!("malformed {} payload: {e}", Self::EVENT_TYPE))
        })
    }
}

macro_rules! fulfillment_event {
    ($name:ident, $event_type:expr, $aggregate_type:literal) => {
        impl FulfillmentEvent for $name {
            const EVENT_TYPE: &'static str = $event_type;
            const AGGREGATE_TYPE: &'static str = $aggregate_type;

            fn order_id(&self) -> &AggregateId {
                &self.order_id
            }
        }
    };
}

/// An order was placed and awaits stock reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInitiated {
    pub order_id: AggregateId,
    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
}

/// Stock was reserved; the order moves to CREATED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: AggregateId,
    pub user_id: String,
    pub total_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub order_id: AggregateId,
    pub total_amount: Money,
}

/// The order failed. Carries the stock to give back and whether captured
/// money must be refunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFailed {
    pub order_id: AggregateId,
    pub reason: String,
    #[serde(default)]
    pub restore_inventory: Vec<OrderItem>,
    #[serde(default)]
    pub refund_required: bool,
}

/// Stock was reserved for an order that had already failed and must be
/// returned. The order itself is not touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRequested {
    pub order_id: AggregateId,
    pub reason: String,
    pub restore_inventory: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserved {
    pub order_id: AggregateId,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservationFailed {
    pub order_id: AggregateId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRestored {
    pub order_id: AggregateId,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSucceeded {
    pub order_id: AggregateId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: AggregateId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub order_id: AggregateId,
    pub amount: Money,
}

fulfillment_event!(OrderInitiated, ORDER_INITIATED, "Order");
fulfillment_event!(OrderCreated, ORDER_CREATED, "Order");
fulfillment_event!(OrderPlaced, ORDER_PLACED, "Order");
fulfillment_event!(OrderFailed, ORDER_FAILED, "Order");
fulfillment_event!(CompensationRequested, ORDER_COMPENSATION_REQUESTED, "Order");
fulfillment_event!(InventoryReserved, INVENTORY_RESERVED, "Inventory");
fulfillment_event!(InventoryReservationFailed, INVENTORY_RESERVATION_FAILED, "Inventory");
fulfillment_event!(InventoryRestored, INVENTORY_RESTORED, "Inventory");
fulfillment_event!(PaymentSucceeded, PAYMENT_SUCCEEDED, "Payment");
fulfillment_event!(PaymentFailed, PAYMENT_FAILED, "Payment");
fulfillment_event!(PaymentRefunded, PAYMENT_REFUNDED, "Payment");

/// An event that drives the order saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaTrigger {
    InventoryReserved(InventoryReserved),
    ReservationFailed(InventoryReservationFailed),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
}

impl SagaTrigger {
    /// Decodes a saga trigger. Returns `None` for event types the saga does
    /// not act on.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Option<Self>> {
        let trigger = match envelope.event_type.as_str() {
            INVENTORY_RESERVED => {
                SagaTrigger::InventoryReserved(InventoryReserved::from_envelope(envelope)?)
            }
            INVENTORY_RESERVATION_FAILED => {
                SagaTrigger::ReservationFailed(InventoryReservationFailed::from_envelope(envelope)?)
            }
            PAYMENT_SUCCEEDED => {
                SagaTrigger::PaymentSucceeded(PaymentSucceeded::from_envelope(envelope)?)
            }
            PAYMENT_FAILED => SagaTrigger::PaymentFailed(PaymentFailed::from_envelope(envelope)?),
            _ => return Ok(None),
        };
        Ok(Some(trigger))
    }

    pub fn order_id(&self) -> &AggregateId {
        match self {
            SagaTrigger::InventoryReserved(e) => &e.order_id,
            SagaTrigger::ReservationFailed(e) => &e.order_id,
            SagaTrigger::PaymentSucceeded(e) => &e.order_id,
            SagaTrigger::PaymentFailed(e) => &e.order_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SagaTrigger::InventoryReserved(_) => INVENTORY_RESERVED,
            SagaTrigger::ReservationFailed(_) => INVENTORY_RESERVATION_FAILED,
            SagaTrigger::PaymentSucceeded(_) => PAYMENT_SUCCEEDED,
            SagaTrigger::PaymentFailed(_) => PAYMENT_FAILED,
        }
    }
}
