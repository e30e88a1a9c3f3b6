//! Order persistence with guarded, outbox-coupled transitions.
//!
//! Every status change is a conditional update ("set `to` only if the status
//! is still `from`") committed together with the outbox event announcing it.

use async_trait::async_trait;
use chrono::Utc;
use common::AggregateId;
use futures_util::FutureExt;
use outbox::{DocumentStore, OutboxAdapter, OutboxEvent, PostgresOutboxStore, WriteOutcome};
use sqlx::{Row, postgres::PgRow, types::Json};

use crate::error::{Result, SagaError};
use crate::order::{Money, Order, OrderItem, OrderStatus};

/// Document collection holding orders.
pub const ORDERS: &str = "orders";

/// A guarded status change and the event announcing it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub order_id: AggregateId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub failure_reason: Option<String>,
    /// Sets the refund flag. Never clears it.
    pub refund_required: bool,
    pub event: OutboxEvent,
}

impl Transition {
    pub fn new(
        order_id: AggregateId,
        from: OrderStatus,
        to: OrderStatus,
        event: OutboxEvent,
    ) -> Self {
        Self {
            order_id,
            from,
            to,
            failure_reason: None,
            refund_required: false,
            event,
        }
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn refund_required(mut self) -> Self {
        self.refund_required = true;
        self
    }
}

/// What a guarded transition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Status and event committed.
    Applied,
    /// The order was no longer in the expected status. Nothing written.
    GuardFailed,
    /// The event already exists for this order. Nothing written.
    Skipped,
}

/// Storage for orders.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts a new order together with its placement event.
    async fn create(&self, order: &Order, event: OutboxEvent) -> Result<WriteOutcome<()>>;

    async fn find(&self, order_id: &AggregateId) -> Result<Option<Order>>;

    /// Applies a guarded transition.
    ///
    /// Returns [`SagaError::OrderNotFound`] when the order does not exist.
    async fn transition(&self, transition: Transition) -> Result<TransitionResult>;

    /// Writes an outbox event without touching the order.
    async fn emit(&self, event: OutboxEvent) -> Result<WriteOutcome<()>>;
}

#[async_trait]
impl OrderRepository for DocumentStore {
    async fn create(&self, order: &Order, event: OutboxEvent) -> Result<WriteOutcome<()>> {
        self.write_with_outbox(event, |session| {
            session.put(ORDERS, order.id.as_str(), order)?;
            Ok::<_, SagaError>(())
        })
        .await
    }

    async fn find(&self, order_id: &AggregateId) -> Result<Option<Order>> {
        Ok(self.get(ORDERS, order_id.as_str()).await?)
    }

    async fn transition(&self, transition: Transition) -> Result<TransitionResult> {
        self.transaction(|session| {
            let mut order: Order = session
                .get(ORDERS, transition.order_id.as_str())?
                .ok_or_else(|| SagaError::OrderNotFound(transition.order_id.clone()))?;
            if order.status != transition.from {
                return Ok(TransitionResult::GuardFailed);
            }

            order.status = transition.to;
            if let Some(reason) = transition.failure_reason {
                order.failure_reason = Some(reason);
            }
            order.refund_required |= transition.refund_required;
            order.updated_at = Utc::now();
            session.put(ORDERS, transition.order_id.as_str(), &order)?;

            if session.insert_outbox(transition.event) {
                Ok(TransitionResult::Applied)
            } else {
                session.discard();
                Ok(TransitionResult::Skipped)
            }
        })
        .await
    }

    async fn emit(&self, event: OutboxEvent) -> Result<WriteOutcome<()>> {
        self.write_with_outbox(event, |_| Ok::<_, SagaError>(())).await
    }
}

fn row_to_order(row: PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    let items: Json<Vec<OrderItem>> = row.try_get("items")?;
    Ok(Order {
        id: AggregateId::from_string(row.try_get::<String, _>("id")?),
        user_id: row.try_get("user_id")?,
        items: items.0,
        total_amount: Money::from_cents(row.try_get("total_amount")?),
        status: OrderStatus::parse(&status)?,
        failure_reason: row.try_get("failure_reason")?,
        refund_required: row.try_get("refund_required")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OrderRepository for PostgresOutboxStore {
    async fn create(&self, order: &Order, event: OutboxEvent) -> Result<WriteOutcome<()>> {
        let order = order.clone();
        self.write_with_outbox(event, move |conn| {
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO orders
                        (id, user_id, items, total_amount, status, failure_reason,
                         refund_required, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(order.id.as_str())
                .bind(&order.user_id)
                .bind(Json(&order.items))
                .bind(order.total_amount.cents())
                .bind(order.status.as_str())
                .bind(&order.failure_reason)
                .bind(order.refund_required)
                .bind(order.created_at)
                .bind(order.updated_at)
                .execute(conn)
                .await?;
                Ok::<_, SagaError>(())
            }
            .boxed()
        })
        .await
    }

    async fn find(&self, order_id: &AggregateId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, items, total_amount, status, failure_reason,
                   refund_required, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn transition(&self, transition: Transition) -> Result<TransitionResult> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2,
                failure_reason = COALESCE($3, failure_reason),
                refund_required = refund_required OR $4,
                updated_at = NOW()
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(transition.order_id.as_str())
        .bind(transition.to.as_str())
        .bind(&transition.failure_reason)
        .bind(transition.refund_required)
        .bind(transition.from.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.find(&transition.order_id).await? {
                Some(_) => Ok(TransitionResult::GuardFailed),
                None => Err(SagaError::OrderNotFound(transition.order_id)),
            };
        }

        if !PostgresOutboxStore::insert_in_tx(&mut *tx, &transition.event, self.policy()).await? {
            tx.rollback().await?;
            return Ok(TransitionResult::Skipped);
        }

        tx.commit().await?;
        Ok(TransitionResult::Applied)
    }

    async fn emit(&self, event: OutboxEvent) -> Result<WriteOutcome<()>> {
        self.write_with_outbox(event, |_| async { Ok::<_, SagaError>(()) }.boxed())
            .await
    }
}

#[async_trait]
impl OrderRepository for OutboxAdapter {
    async fn create(&self, order: &Order, event: OutboxEvent) -> Result<WriteOutcome<()>> {
        match self {
            OutboxAdapter::Relational(store) => store.create(order, event).await,
            OutboxAdapter::Document(store) => store.create(order, event).await,
        }
    }

    async fn find(&self, order_id: &AggregateId) -> Result<Option<Order>> {
        match self {
            OutboxAdapter::Relational(store) => store.find(order_id).await,
            OutboxAdapter::Document(store) => store.find(order_id).await,
        }
    }

    async fn transition(&self, transition: Transition) -> Result<TransitionResult> {
        match self {
            OutboxAdapter::Relational(store) => store.transition(transition).await,
            OutboxAdapter::Document(store) => store.transition(transition).await,
        }
    }

    async fn emit(&self, event: OutboxEvent) -> Result<WriteOutcome<()>> {
        match self {
            OutboxAdapter::Relational(store) => store.emit(event).await,
            OutboxAdapter::Document(store) => store.emit(event).await,
        }
    }
}
