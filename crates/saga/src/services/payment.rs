//! Payment service: charges orders once they are created, refunds them when
//! they fail afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use consumer::{EventHandler, HandlerError};
use outbox::{DocumentStore, EventEnvelope, OutboxAdapter, OutboxEvent, PostgresOutboxStore};
use serde::{Deserialize, Serialize};
use sqlx::{Row, postgres::PgRow};
use tokio::sync::Mutex;

use crate::error::{Result, SagaError};
use crate::events::{
    FulfillmentEvent, ORDER_CREATED, ORDER_FAILED, OrderCreated, OrderFailed, PaymentFailed,
    PaymentRefunded, PaymentSucceeded,
};
use crate::order::Money;

/// Document collection holding payments, keyed by order id.
pub const PAYMENTS: &str = "payments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Refunded,
    /// The order failed before it was charged. Blocks any later charge.
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            other => Err(SagaError::Validation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

/// The payment for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub order_id: AggregateId,
    pub amount: Money,
    pub status: PaymentStatus,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    fn new(order_id: AggregateId, amount: Money, status: PaymentStatus) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            amount,
            status,
            decline_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a charge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Charge {
    Captured,
    Declined { reason: String },
}

/// The external payment provider.
///
/// Implementations must be idempotent per order: charging or refunding the
/// same order twice has the effect of doing it once.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        order_id: &AggregateId,
        user_id: &str,
        amount: Money,
    ) -> Result<Charge>;

    async fn refund(&self, order_id: &AggregateId, amount: Money) -> Result<()>;
}

#[derive(Debug, Default)]
struct GatewayState {
    charges: HashMap<AggregateId, Charge>,
    refunds: HashMap<AggregateId, Money>,
    decline_reason: Option<String>,
    unavailable: bool,
    charge_calls: usize,
}

/// In-memory payment gateway for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every new charge with `reason`. `None` accepts again.
    pub async fn decline_with(&self, reason: Option<&str>) {
        self.state.lock().await.decline_reason = reason.map(str::to_string);
    }

    /// Makes every call fail as if the provider were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Number of orders captured, not counting repeat calls.
    pub async fn captured_count(&self) -> usize {
        self.state
            .lock()
            .await
            .charges
            .values()
            .filter(|c| **c == Charge::Captured)
            .count()
    }

    /// Number of charge calls that reached the provider.
    pub async fn charge_calls(&self) -> usize {
        self.state.lock().await.charge_calls
    }

    pub async fn refunded(&self, order_id: &AggregateId) -> Option<Money> {
        self.state.lock().await.refunds.get(order_id).copied()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn charge(
        &self,
        order_id: &AggregateId,
        _user_id: &str,
        _amount: Money,
    ) -> Result<Charge> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(SagaError::Gateway("payment provider unavailable".to_string()));
        }
        state.charge_calls += 1;
        if let Some(previous) = state.charges.get(order_id) {
            return Ok(previous.clone());
        }
        let charge = match &state.decline_reason {
            Some(reason) => Charge::Declined {
                reason: reason.clone(),
            },
            None => Charge::Captured,
        };
        state.charges.insert(order_id.clone(), charge.clone());
        Ok(charge)
    }

    async fn refund(&self, order_id: &AggregateId, amount: Money) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(SagaError::Gateway("payment provider unavailable".to_string()));
        }
        state.refunds.entry(order_id.clone()).or_insert(amount);
        Ok(())
    }
}

/// Owns payments and talks to the gateway.
#[derive(Clone)]
pub struct PaymentService {
    adapter: OutboxAdapter,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentService {
    pub fn new(adapter: impl Into<OutboxAdapter>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            adapter: adapter.into(),
            gateway,
        }
    }

    pub async fn find_payment(&self, order_id: &AggregateId) -> Result<Option<Payment>> {
        match &self.adapter {
            OutboxAdapter::Document(store) => Ok(store.get(PAYMENTS, order_id.as_str()).await?),
            OutboxAdapter::Relational(store) => {
                let row = sqlx::query(
                    r#"
                    SELECT order_id, amount, status, decline_reason, created_at, updated_at
                    FROM payments
                    WHERE order_id = $1
                    "#,
                )
                .bind(order_id.as_str())
                .fetch_optional(store.pool())
                .await?;
                row.map(row_to_payment).transpose()
            }
        }
    }

    /// Charges an order and records the payment with its outcome event.
    ///
    /// An order is charged at most once. Later calls return the payment
    /// already on record, including a cancellation marker.
    #[tracing::instrument(skip(self))]
    pub async fn process_payment_for_order(
        &self,
        order_id: &AggregateId,
        amount: Money,
        user_id: &str,
    ) -> Result<Payment> {
        if let Some(existing) = self.find_payment(order_id).await? {
            tracing::debug!(status = existing.status.as_str(), "payment already recorded");
            return Ok(existing);
        }

        let charge = self.gateway.charge(order_id, user_id, amount).await?;
        let (payment, event) = match &charge {
            Charge::Captured => (
                Payment::new(order_id.clone(), amount, PaymentStatus::Succeeded),
                PaymentSucceeded {
                    order_id: order_id.clone(),
                    amount,
                }
                .to_outbox()?,
            ),
            Charge::Declined { reason } => {
                let mut payment = Payment::new(order_id.clone(), amount, PaymentStatus::Failed);
                payment.decline_reason = Some(reason.clone());
                let event = PaymentFailed {
                    order_id: order_id.clone(),
                    reason: reason.clone(),
                }
                .to_outbox()?;
                (payment, event)
            }
        };

        if self.insert_payment(&payment, Some(event)).await? {
            metrics::counter!("payments_total", "status" => payment.status.as_str()).increment(1);
            tracing::info!(status = payment.status.as_str(), "payment recorded");
            return Ok(payment);
        }

        // Someone recorded a payment first, possibly a cancellation.
        let existing = self
            .find_payment(order_id)
            .await?
            .ok_or_else(|| SagaError::Validation(format!("payment for {order_id} vanished")))?;
        if charge == Charge::Captured && existing.status != PaymentStatus::Succeeded {
            tracing::warn!(
                status = existing.status.as_str(),
                "charge captured after payment was settled, refunding"
            );
            self.gateway.refund(order_id, amount).await?;
        }
        Ok(existing)
    }

    /// Reacts to a failed order: refunds a captured payment, or blocks a
    /// future charge when none was made yet.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_or_refund(&self, order_id: &AggregateId) -> Result<Option<Payment>> {
        for _ in 0..2 {
            match self.find_payment(order_id).await? {
                Some(payment) if payment.status == PaymentStatus::Succeeded => {
                    self.gateway.refund(order_id, payment.amount).await?;
                    let event = PaymentRefunded {
                        order_id: order_id.clone(),
                        amount: payment.amount,
                    }
                    .to_outbox()?;
                    if self.mark_refunded(order_id, event).await? {
                        metrics::counter!("payments_total", "status" => "REFUNDED").increment(1);
                        tracing::info!(amount = %payment.amount, "payment refunded");
                    }
                    return self.find_payment(order_id).await;
                }
                Some(payment) => return Ok(Some(payment)),
                None => {
                    let marker =
                        Payment::new(order_id.clone(), Money::zero(), PaymentStatus::Cancelled);
                    if self.insert_payment(&marker, None).await? {
                        tracing::info!("order failed before payment, charge blocked");
                        return Ok(Some(marker));
                    }
                }
            }
        }
        self.find_payment(order_id).await
    }

    /// Inserts a payment, with its event when given. Returns false, writing
    /// nothing, when the order already has a payment or the event exists.
    async fn insert_payment(&self, payment: &Payment, event: Option<OutboxEvent>) -> Result<bool> {
        match &self.adapter {
            OutboxAdapter::Document(store) => insert_document(store, payment, event).await,
            OutboxAdapter::Relational(store) => insert_relational(store, payment, event).await,
        }
    }

    /// Moves a SUCCEEDED payment to REFUNDED together with `event`.
    async fn mark_refunded(&self, order_id: &AggregateId, event: OutboxEvent) -> Result<bool> {
        match &self.adapter {
            OutboxAdapter::Document(store) => {
                store
                    .transaction(|session| {
                        let Some(mut payment) =
                            session.get::<Payment>(PAYMENTS, order_id.as_str())?
                        else {
                            return Ok(false);
                        };
                        if payment.status != PaymentStatus::Succeeded {
                            return Ok(false);
                        }
                        payment.status = PaymentStatus::Refunded;
                        payment.updated_at = Utc::now();
                        session.put(PAYMENTS, order_id.as_str(), &payment)?;
                        if !session.insert_outbox(event) {
                            session.discard();
                            return Ok(false);
                        }
                        Ok::<_, SagaError>(true)
                    })
                    .await
            }
            OutboxAdapter::Relational(store) => {
                let mut tx = store.pool().begin().await?;
                let updated = sqlx::query(
                    r#"
                    UPDATE payments SET status = 'REFUNDED', updated_at = NOW()
                    WHERE order_id = $1 AND status = 'SUCCEEDED'
                    "#,
                )
                .bind(order_id.as_str())
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0
                    || !PostgresOutboxStore::insert_in_tx(&mut *tx, &event, store.policy()).await?
                {
                    tx.rollback().await?;
                    return Ok(false);
                }
                tx.commit().await?;
                Ok(true)
            }
        }
    }
}

fn row_to_payment(row: PgRow) -> Result<Payment> {
    let status: String = row.try_get("status")?;
    Ok(Payment {
        order_id: AggregateId::from_string(row.try_get::<String, _>("order_id")?),
        amount: Money::from_cents(row.try_get("amount")?),
        status: PaymentStatus::parse(&status)?,
        decline_reason: row.try_get("decline_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_document(
    store: &DocumentStore,
    payment: &Payment,
    event: Option<OutboxEvent>,
) -> Result<bool> {
    store
        .transaction(|session| {
            let id = payment.order_id.as_str();
            if session.get::<Payment>(PAYMENTS, id)?.is_some() {
                return Ok(false);
            }
            session.put(PAYMENTS, id, payment)?;
            if let Some(event) = event {
                if !session.insert_outbox(event) {
                    session.discard();
                    return Ok(false);
                }
            }
            Ok::<_, SagaError>(true)
        })
        .await
}

async fn insert_relational(
    store: &PostgresOutboxStore,
    payment: &Payment,
    event: Option<OutboxEvent>,
) -> Result<bool> {
    let mut tx = store.pool().begin().await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO payments (order_id, amount, status, decline_reason, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (order_id) DO NOTHING
        "#,
    )
    .bind(payment.order_id.as_str())
    .bind(payment.amount.cents())
    .bind(payment.status.as_str())
    .bind(&payment.decline_reason)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    if let Some(event) = event {
        if !PostgresOutboxStore::insert_in_tx(&mut *tx, &event, store.policy()).await? {
            tx.rollback().await?;
            return Ok(false);
        }
    }
    tx.commit().await?;
    Ok(true)
}

#[async_trait]
impl EventHandler for PaymentService {
    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        match envelope.event_type.as_str() {
            ORDER_CREATED => {
                let event = OrderCreated::from_envelope(envelope)?;
                self.process_payment_for_order(&event.order_id, event.total_amount, &event.user_id)
                    .await?;
            }
            ORDER_FAILED => {
                let event = OrderFailed::from_envelope(envelope)?;
                self.cancel_or_refund(&event.order_id).await?;
            }
            other => tracing::debug!(event_type = other, "ignored by payment"),
        }
        Ok(())
    }
}
