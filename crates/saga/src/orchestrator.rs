//! Order saga orchestrator.
//!
//! Reacts to inventory and payment outcomes by moving the order through its
//! status machine. Each step reads the order, decides from the guard table,
//! and applies the decision as a guarded transition plus outbox event. When
//! the guard fails the order changed underneath us, so the step re-reads and
//! decides again.
//!
//! | trigger                      | PROCESSING | CREATED          | PLACED          | FAILED     |
//! |------------------------------|------------|------------------|-----------------|------------|
//! | inventory.reserved           | CREATED    | handled          | handled         | compensate |
//! | inventory.reservation_failed | FAILED     | FAILED           | FAILED + refund | handled    |
//! | payment.succeeded            | PLACED     | PLACED           | handled         | handled    |
//! | payment.failed               | FAILED     | FAILED + restore | handled         | handled    |

use async_trait::async_trait;
use common::AggregateId;
use consumer::{EventHandler, HandlerError};
use outbox::{EventEnvelope, OutboxEvent};

use crate::error::{Result, SagaError};
use crate::events::{
    CompensationRequested, FulfillmentEvent, OrderCreated, OrderFailed, OrderPlaced, SagaTrigger,
};
use crate::order::{Order, OrderStatus};
use crate::repository::{OrderRepository, Transition, TransitionResult};
use crate::retry::ConflictRetry;

/// Re-reads allowed after a failed guard before giving up.
const GUARD_ROUNDS: usize = 4;

/// What the guard table says to do with a trigger.
#[derive(Debug, Clone)]
pub enum Decision {
    Transition(Transition),
    /// Emit an event without touching the order.
    Emit(OutboxEvent),
    AlreadyHandled,
}

/// The result of applying one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaOutcome {
    Transitioned { from: OrderStatus, to: OrderStatus },
    Compensated,
    AlreadyHandled,
}

impl SagaOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaOutcome::Transitioned { .. } => "transitioned",
            SagaOutcome::Compensated => "compensated",
            SagaOutcome::AlreadyHandled => "already_handled",
        }
    }
}

/// Fails the order from its current status with an `order.failed` event.
fn order_failed(order: &Order, reason: &str, restore: bool, refund: bool) -> Result<Decision> {
    let event = OrderFailed {
        order_id: order.id.clone(),
        reason: reason.to_string(),
        restore_inventory: if restore { order.items.clone() } else { Vec::new() },
        refund_required: refund,
    }
    .to_outbox()?;

    let mut transition =
        Transition::new(order.id.clone(), order.status, OrderStatus::Failed, event)
            .failure_reason(reason);
    if refund {
        transition = transition.refund_required();
    }
    Ok(Decision::Transition(transition))
}

/// Decides what `trigger` does to `order`.
pub fn decide(order: &Order, trigger: &SagaTrigger) -> Result<Decision> {
    use OrderStatus::*;

    let decision = match (trigger, order.status) {
        (SagaTrigger::InventoryReserved(_), Processing) => {
            let event = OrderCreated {
                order_id: order.id.clone(),
                user_id: order.user_id.clone(),
                total_amount: order.total_amount,
            }
            .to_outbox()?;
            Decision::Transition(Transition::new(order.id.clone(), Processing, Created, event))
        }
        (SagaTrigger::InventoryReserved(reserved), Failed) => {
            let event = CompensationRequested {
                order_id: order.id.clone(),
                reason: order
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "order failed".to_string()),
                restore_inventory: reserved.items.clone(),
            }
            .to_outbox()?;
            Decision::Emit(event)
        }
        (SagaTrigger::InventoryReserved(_), Created | Placed) => Decision::AlreadyHandled,

        (SagaTrigger::ReservationFailed(failed), Processing | Created) => {
            order_failed(order, &failed.reason, false, false)?
        }
        (SagaTrigger::ReservationFailed(failed), Placed) => {
            order_failed(order, &failed.reason, false, true)?
        }
        (SagaTrigger::ReservationFailed(_), Failed) => Decision::AlreadyHandled,

        (SagaTrigger::PaymentSucceeded(_), Processing | Created) => {
            if order.status == Processing {
                tracing::warn!(
                    order_id = %order.id,
                    "payment succeeded before inventory reservation, placing order from PROCESSING"
                );
            }
            let event = OrderPlaced {
                order_id: order.id.clone(),
                total_amount: order.total_amount,
            }
            .to_outbox()?;
            Decision::Transition(Transition::new(order.id.clone(), order.status, Placed, event))
        }
        (SagaTrigger::PaymentSucceeded(_), Failed) => {
            tracing::warn!(order_id = %order.id, "payment succeeded for a failed order");
            Decision::AlreadyHandled
        }
        (SagaTrigger::PaymentSucceeded(_), Placed) => Decision::AlreadyHandled,

        (SagaTrigger::PaymentFailed(failed), Processing) => {
            order_failed(order, &failed.reason, false, false)?
        }
        (SagaTrigger::PaymentFailed(failed), Created) => {
            order_failed(order, &failed.reason, true, false)?
        }
        (SagaTrigger::PaymentFailed(_), Placed | Failed) => Decision::AlreadyHandled,
    };
    Ok(decision)
}

/// Drives orders through the saga in response to inventory and payment
/// events.
#[derive(Clone)]
pub struct OrderSaga<R> {
    repo: R,
    retry: ConflictRetry,
}

impl<R: OrderRepository> OrderSaga<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            retry: ConflictRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ConflictRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Applies one trigger, retrying write conflicts locally. Errors left
    /// after the retry budget are returned so the message is redelivered.
    #[tracing::instrument(skip(self, trigger), fields(order_id = %trigger.order_id(), event_type = trigger.event_type()))]
    pub async fn handle_trigger(&self, trigger: &SagaTrigger) -> Result<SagaOutcome> {
        let result = self
            .retry
            .run(trigger.event_type(), || self.apply(trigger))
            .await;

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        metrics::counter!(
            "saga_transitions_total",
            "event" => trigger.event_type(),
            "outcome" => outcome
        )
        .increment(1);

        if let Ok(SagaOutcome::Transitioned { from, to }) = &result {
            tracing::info!(%from, %to, "order transitioned");
        }
        result
    }

    async fn apply(&self, trigger: &SagaTrigger) -> Result<SagaOutcome> {
        let order_id = trigger.order_id();
        for _ in 0..GUARD_ROUNDS {
            let order = self.load(order_id).await?;
            match decide(&order, trigger)? {
                Decision::AlreadyHandled => {
                    tracing::debug!(status = %order.status, "already handled");
                    return Ok(SagaOutcome::AlreadyHandled);
                }
                Decision::Emit(event) => {
                    let outcome = self.repo.emit(event).await?;
                    return Ok(if outcome.is_skipped() {
                        SagaOutcome::AlreadyHandled
                    } else {
                        tracing::info!(status = %order.status, "compensation requested");
                        SagaOutcome::Compensated
                    });
                }
                Decision::Transition(transition) => {
                    let (from, to) = (transition.from, transition.to);
                    match self.repo.transition(transition).await? {
                        TransitionResult::Applied => {
                            return Ok(SagaOutcome::Transitioned { from, to });
                        }
                        TransitionResult::Skipped => return Ok(SagaOutcome::AlreadyHandled),
                        TransitionResult::GuardFailed => {
                            tracing::debug!(%from, "guard failed, re-reading order");
                        }
                    }
                }
            }
        }
        Err(SagaError::GuardContention(order_id.clone()))
    }

    async fn load(&self, order_id: &AggregateId) -> Result<Order> {
        self.repo
            .find(order_id)
            .await?
            .ok_or_else(|| SagaError::OrderNotFound(order_id.clone()))
    }
}

#[async_trait]
impl<R: OrderRepository> EventHandler for OrderSaga<R> {
    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        match SagaTrigger::from_envelope(envelope)? {
            Some(trigger) => {
                self.handle_trigger(&trigger).await?;
            }
            None => {
                tracing::debug!(event_type = %envelope.event_type, "not a saga trigger, ignored");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        InventoryReservationFailed, InventoryReserved, ORDER_COMPENSATION_REQUESTED,
        ORDER_CREATED, ORDER_FAILED, ORDER_PLACED, OrderInitiated, PaymentFailed,
        PaymentSucceeded,
    };
    use crate::order::{Money, OrderItem};
    use outbox::{DocumentStore, OutboxStore};

    fn items() -> Vec<OrderItem> {
        vec![OrderItem::new("P1", 2, Money::from_cents(1000))]
    }

    async fn setup() -> (OrderSaga<DocumentStore>, Order) {
        let store = DocumentStore::new();
        let order = Order::new("user-1", items()).unwrap();
        let event = OrderInitiated {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            items: order.items.clone(),
            total_amount: order.total_amount,
        }
        .to_outbox()
        .unwrap();
        store.create(&order, event).await.unwrap();
        (
            OrderSaga::new(store).with_retry(ConflictRetry::immediate(5)),
            order,
        )
    }

    fn reserved(order: &Order) -> SagaTrigger {
        SagaTrigger::InventoryReserved(InventoryReserved {
            order_id: order.id.clone(),
            items: order.items.clone(),
        })
    }

    fn reservation_failed(order: &Order) -> SagaTrigger {
        SagaTrigger::ReservationFailed(InventoryReservationFailed {
            order_id: order.id.clone(),
            reason: "insufficient stock for P1".to_string(),
        })
    }

    fn paid(order: &Order) -> SagaTrigger {
        SagaTrigger::PaymentSucceeded(PaymentSucceeded {
            order_id: order.id.clone(),
            amount: order.total_amount,
        })
    }

    fn payment_failed(order: &Order) -> SagaTrigger {
        SagaTrigger::PaymentFailed(PaymentFailed {
            order_id: order.id.clone(),
            reason: "declined".to_string(),
        })
    }

    async fn status(saga: &OrderSaga<DocumentStore>, order: &Order) -> Order {
        saga.repository().find(&order.id).await.unwrap().unwrap()
    }

    async fn event_types(saga: &OrderSaga<DocumentStore>, order: &Order) -> Vec<String> {
        saga.repository()
            .events_for_aggregate(&order.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.event_type)
            .collect()
    }

    #[tokio::test]
    async fn happy_path_places_order() {
        let (saga, order) = setup().await;

        let outcome = saga.handle_trigger(&reserved(&order)).await.unwrap();
        assert_eq!(
            outcome,
            SagaOutcome::Transitioned {
                from: OrderStatus::Processing,
                to: OrderStatus::Created
            }
        );
        saga.handle_trigger(&paid(&order)).await.unwrap();

        assert_eq!(status(&saga, &order).await.status, OrderStatus::Placed);
        let types = event_types(&saga, &order).await;
        assert!(types.contains(&ORDER_CREATED.to_string()));
        assert!(types.contains(&ORDER_PLACED.to_string()));
    }

    #[tokio::test]
    async fn duplicate_reservation_is_a_no_op() {
        let (saga, order) = setup().await;
        saga.handle_trigger(&reserved(&order)).await.unwrap();

        for _ in 0..2 {
            let outcome = saga.handle_trigger(&reserved(&order)).await.unwrap();
            assert_eq!(outcome, SagaOutcome::AlreadyHandled);
        }

        assert_eq!(status(&saga, &order).await.status, OrderStatus::Created);
        let created = event_types(&saga, &order)
            .await
            .into_iter()
            .filter(|t| t == ORDER_CREATED)
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn payment_failure_restores_reserved_items() {
        let (saga, order) = setup().await;
        saga.handle_trigger(&reserved(&order)).await.unwrap();
        saga.handle_trigger(&payment_failed(&order)).await.unwrap();

        let stored = status(&saga, &order).await;
        assert_eq!(stored.status, OrderStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("declined"));

        let records = saga.repository().events_for_aggregate(&order.id).await.unwrap();
        let failed = records.iter().find(|r| r.event_type == ORDER_FAILED).unwrap();
        let payload: OrderFailed = serde_json::from_str(&failed.payload).unwrap();
        assert_eq!(payload.restore_inventory, order.items);
        assert!(!payload.refund_required);
    }

    #[tokio::test]
    async fn payment_before_reservation_places_from_processing() {
        let (saga, order) = setup().await;
        saga.handle_trigger(&paid(&order)).await.unwrap();
        assert_eq!(status(&saga, &order).await.status, OrderStatus::Placed);

        // The late reservation is already accounted for.
        let outcome = saga.handle_trigger(&reserved(&order)).await.unwrap();
        assert_eq!(outcome, SagaOutcome::AlreadyHandled);
    }

    #[tokio::test]
    async fn reservation_failure_after_placement_flags_refund() {
        let (saga, order) = setup().await;
        saga.handle_trigger(&paid(&order)).await.unwrap();
        saga.handle_trigger(&reservation_failed(&order)).await.unwrap();

        let stored = status(&saga, &order).await;
        assert_eq!(stored.status, OrderStatus::Failed);
        assert!(stored.refund_required);
    }

    #[tokio::test]
    async fn late_reservation_for_failed_order_requests_compensation() {
        let (saga, order) = setup().await;
        saga.handle_trigger(&payment_failed(&order)).await.unwrap();

        let outcome = saga.handle_trigger(&reserved(&order)).await.unwrap();
        assert_eq!(outcome, SagaOutcome::Compensated);
        assert_eq!(
            saga.handle_trigger(&reserved(&order)).await.unwrap(),
            SagaOutcome::AlreadyHandled
        );

        assert_eq!(status(&saga, &order).await.status, OrderStatus::Failed);
        let types = event_types(&saga, &order).await;
        assert_eq!(
            types
                .iter()
                .filter(|t| t.as_str() == ORDER_COMPENSATION_REQUESTED)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failure_events_for_failed_order_are_handled() {
        let (saga, order) = setup().await;
        saga.handle_trigger(&reservation_failed(&order)).await.unwrap();

        assert_eq!(
            saga.handle_trigger(&payment_failed(&order)).await.unwrap(),
            SagaOutcome::AlreadyHandled
        );
        assert_eq!(
            saga.handle_trigger(&paid(&order)).await.unwrap(),
            SagaOutcome::AlreadyHandled
        );
        assert_eq!(status(&saga, &order).await.status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn write_conflicts_are_retried() {
        let (saga, order) = setup().await;
        saga.repository().inject_write_conflicts(2).await;

        saga.handle_trigger(&reserved(&order)).await.unwrap();
        assert_eq!(status(&saga, &order).await.status, OrderStatus::Created);
    }

    #[tokio::test]
    async fn exhausted_conflicts_surface_as_conflict() {
        let (saga, order) = setup().await;
        let saga = saga.with_retry(ConflictRetry::immediate(2));
        saga.repository().inject_write_conflicts(5).await;

        let err = saga.handle_trigger(&reserved(&order)).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn unknown_order_is_rejected() {
        let (saga, _) = setup().await;
        let other = Order::new("user-2", items()).unwrap();
        let err = saga.handle_trigger(&reserved(&other)).await.unwrap_err();
        assert!(matches!(err, SagaError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn every_interleaving_converges() {
        let orders: [&[usize]; 6] = [
            &[0, 2, 0, 2],
            &[2, 0, 2],
            &[0, 3, 0],
            &[3, 0, 3, 0],
            &[1, 2, 1],
            &[2, 1, 3, 0],
        ];
        for sequence in orders {
            let (saga, order) = setup().await;
            let triggers = [
                reserved(&order),
                reservation_failed(&order),
                paid(&order),
                payment_failed(&order),
            ];
            let mut terminal = None;
            for &i in sequence {
                saga.handle_trigger(&triggers[i]).await.unwrap();
                let current = status(&saga, &order).await.status;
                if let Some(prev) = terminal {
                    // Only PLACED -> FAILED is allowed after a terminal state.
                    assert!(
                        prev == current
                            || (prev == OrderStatus::Placed && current == OrderStatus::Failed),
                        "{sequence:?}: {prev} -> {current}"
                    );
                }
                if current.is_terminal() {
                    terminal = Some(current);
                }
            }
            assert!(terminal.is_some(), "{sequence:?} did not terminate");
        }
    }

    #[tokio::test]
    async fn handler_ignores_non_trigger_events() {
        let (saga, order) = setup().await;
        let envelope = EventEnvelope::builder()
            .aggregate_id(order.id.clone())
            .event_type("inventory.restored")
            .payload_raw(serde_json::json!({"orderId": order.id.as_str(), "items": []}))
            .build();

        saga.handle(&envelope).await.unwrap();
        assert_eq!(status(&saga, &order).await.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn handler_maps_malformed_payload_to_validation() {
        let (saga, order) = setup().await;
        let envelope = EventEnvelope::builder()
            .aggregate_id(order.id.clone())
            .event_type("payment.succeeded")
            .payload_raw(serde_json::json!({"nope": true}))
            .build();

        let err = saga.handle(&envelope).await.unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Validation);
    }
}
