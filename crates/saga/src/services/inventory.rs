//! Inventory service: reserves and restores stock for orders.
//!
//! Stock changes and the event announcing them are written together through
//! the configured outbox adapter. Every operation first checks whether its
//! outcome event already exists for the order and does nothing if so.

use async_trait::async_trait;
use common::AggregateId;
use consumer::{EventHandler, HandlerError};
use outbox::{
    DocumentStore, EventEnvelope, OutboxAdapter, OutboxEvent, OutboxStore, PostgresOutboxStore,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{
    CompensationRequested, FulfillmentEvent, INVENTORY_RESERVATION_FAILED, INVENTORY_RESERVED,
    INVENTORY_RESTORED, InventoryReservationFailed, InventoryReserved, InventoryRestored,
    ORDER_COMPENSATION_REQUESTED, ORDER_FAILED, ORDER_INITIATED, OrderFailed, OrderInitiated,
};
use crate::order::OrderItem;

/// Document collection holding product stock.
pub const PRODUCTS: &str = "products";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Product {
    stock: i64,
}

/// A signed change to one product's stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockUpdate {
    pub product_id: String,
    pub delta: i64,
}

impl StockUpdate {
    pub fn remove(product_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            delta: -i64::from(quantity),
        }
    }

    pub fn add(product_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            delta: i64::from(quantity),
        }
    }
}

/// A product without enough stock for an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortage {
    pub product_id: String,
    pub available: i64,
    pub requested: i64,
}

impl std::fmt::Display for Shortage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insufficient stock for {}: available {}, requested {}",
            self.product_id, self.available, self.requested
        )
    }
}

/// Result of a bulk stock write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockWrite {
    Applied,
    /// The event already exists. Nothing written.
    Skipped,
    /// Some product would go negative. Nothing written.
    Insufficient(Shortage),
}

/// What the service did for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockOutcome {
    Reserved,
    Rejected(Shortage),
    Restored,
    AlreadyHandled,
}

fn reserve_updates(items: &[OrderItem]) -> Vec<StockUpdate> {
    items
        .iter()
        .map(|item| StockUpdate::remove(&item.product_id, item.quantity))
        .collect()
}

fn restore_updates(items: &[OrderItem]) -> Vec<StockUpdate> {
    items
        .iter()
        .map(|item| StockUpdate::add(&item.product_id, item.quantity))
        .collect()
}

/// Owns product stock.
#[derive(Clone)]
pub struct InventoryService {
    adapter: OutboxAdapter,
}

impl InventoryService {
    pub fn new(adapter: impl Into<OutboxAdapter>) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    /// Sets a product's stock, outside of any order.
    pub async fn seed_stock(&self, product_id: &str, stock: i64) -> Result<()> {
        match &self.adapter {
            OutboxAdapter::Document(store) => {
                store
                    .transaction(|session| session.put(PRODUCTS, product_id, &Product { stock }))
                    .await?
            }
            OutboxAdapter::Relational(store) => {
                sqlx::query(
                    r#"
                    INSERT INTO products (id, stock) VALUES ($1, $2)
                    ON CONFLICT (id) DO UPDATE SET stock = EXCLUDED.stock, updated_at = NOW()
                    "#,
                )
                .bind(product_id)
                .bind(stock)
                .execute(store.pool())
                .await?;
            }
        }
        Ok(())
    }

    /// Current stock of a product, if it is known.
    pub async fn stock(&self, product_id: &str) -> Result<Option<i64>> {
        match &self.adapter {
            OutboxAdapter::Document(store) => Ok(store
                .get::<Product>(PRODUCTS, product_id)
                .await?
                .map(|p| p.stock)),
            OutboxAdapter::Relational(store) => {
                Ok(sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
                    .bind(product_id)
                    .fetch_optional(store.pool())
                    .await?)
            }
        }
    }

    /// Applies every update and writes `event` in one transaction.
    ///
    /// Nothing is written when any product would go below zero, or when
    /// `event` already exists. An empty update list writes just the event.
    #[tracing::instrument(skip(self, updates, event), fields(order_id = %event.aggregate_id, event_type = %event.event_type))]
    pub async fn bulk_update_stock_with_outbox(
        &self,
        updates: &[StockUpdate],
        event: OutboxEvent,
    ) -> Result<StockWrite> {
        match &self.adapter {
            OutboxAdapter::Document(store) => bulk_update_document(store, updates, event).await,
            OutboxAdapter::Relational(store) => bulk_update_relational(store, updates, event).await,
        }
    }

    /// Reserves stock for an order, or records why it could not.
    #[tracing::instrument(skip(self, items))]
    pub async fn reserve_stock(
        &self,
        order_id: &AggregateId,
        items: &[OrderItem],
    ) -> Result<StockOutcome> {
        if self.adapter.has_event(order_id, INVENTORY_RESERVED).await?
            || self.adapter.has_event(order_id, INVENTORY_RESERVATION_FAILED).await?
        {
            tracing::debug!("reservation already decided");
            return Ok(StockOutcome::AlreadyHandled);
        }

        let reserved = InventoryReserved {
            order_id: order_id.clone(),
            items: items.to_vec(),
        }
        .to_outbox()?;

        match self
            .bulk_update_stock_with_outbox(&reserve_updates(items), reserved)
            .await?
        {
            StockWrite::Applied => {
                metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                    .increment(1);
                tracing::info!("stock reserved");
                Ok(StockOutcome::Reserved)
            }
            StockWrite::Skipped => Ok(StockOutcome::AlreadyHandled),
            StockWrite::Insufficient(shortage) => {
                let failed = InventoryReservationFailed {
                    order_id: order_id.clone(),
                    reason: shortage.to_string(),
                }
                .to_outbox()?;
                if self.bulk_update_stock_with_outbox(&[], failed).await? == StockWrite::Skipped {
                    return Ok(StockOutcome::AlreadyHandled);
                }
                metrics::counter!("inventory_reservations_total", "outcome" => "rejected")
                    .increment(1);
                tracing::info!(%shortage, "reservation rejected");
                Ok(StockOutcome::Rejected(shortage))
            }
        }
    }

    /// Returns reserved stock for an order. Runs at most once per order.
    #[tracing::instrument(skip(self, items))]
    pub async fn restore_stock(
        &self,
        order_id: &AggregateId,
        items: &[OrderItem],
    ) -> Result<StockOutcome> {
        if items.is_empty() || self.adapter.has_event(order_id, INVENTORY_RESTORED).await? {
            return Ok(StockOutcome::AlreadyHandled);
        }

        let restored = InventoryRestored {
            order_id: order_id.clone(),
            items: items.to_vec(),
        }
        .to_outbox()?;

        match self
            .bulk_update_stock_with_outbox(&restore_updates(items), restored)
            .await?
        {
            StockWrite::Applied => {
                tracing::info!("stock restored");
                Ok(StockOutcome::Restored)
            }
            StockWrite::Skipped | StockWrite::Insufficient(_) => Ok(StockOutcome::AlreadyHandled),
        }
    }
}

async fn bulk_update_document(
    store: &DocumentStore,
    updates: &[StockUpdate],
    event: OutboxEvent,
) -> Result<StockWrite> {
    store
        .transaction(|session| {
            if session.has_outbox_event(&event.aggregate_id, &event.event_type) {
                return Ok(StockWrite::Skipped);
            }
            for update in updates {
                let available = session
                    .get::<Product>(PRODUCTS, &update.product_id)?
                    .map_or(0, |p| p.stock);
                let stock = available + update.delta;
                if stock < 0 {
                    session.discard();
                    return Ok(StockWrite::Insufficient(Shortage {
                        product_id: update.product_id.clone(),
                        available,
                        requested: -update.delta,
                    }));
                }
                session.put(PRODUCTS, &update.product_id, &Product { stock })?;
            }
            session.insert_outbox(event);
            Ok(StockWrite::Applied)
        })
        .await
}

async fn bulk_update_relational(
    store: &PostgresOutboxStore,
    updates: &[StockUpdate],
    event: OutboxEvent,
) -> Result<StockWrite> {
    let mut tx = store.pool().begin().await?;

    for update in updates {
        let available: i64 =
            sqlx::query_scalar("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
                .bind(&update.product_id)
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or(0);
        if available + update.delta < 0 {
            tx.rollback().await?;
            return Ok(StockWrite::Insufficient(Shortage {
                product_id: update.product_id.clone(),
                available,
                requested: -update.delta,
            }));
        }
        sqlx::query(
            r#"
            INSERT INTO products (id, stock) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET stock = products.stock + EXCLUDED.stock, updated_at = NOW()
            "#,
        )
        .bind(&update.product_id)
        .bind(update.delta)
        .execute(&mut *tx)
        .await?;
    }

    if !PostgresOutboxStore::insert_in_tx(&mut *tx, &event, store.policy()).await? {
        tx.rollback().await?;
        return Ok(StockWrite::Skipped);
    }
    tx.commit().await?;
    Ok(StockWrite::Applied)
}

#[async_trait]
impl EventHandler for InventoryService {
    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        match envelope.event_type.as_str() {
            ORDER_INITIATED => {
                let event = OrderInitiated::from_envelope(envelope)?;
                self.reserve_stock(&event.order_id, &event.items).await?;
            }
            ORDER_FAILED => {
                let event = OrderFailed::from_envelope(envelope)?;
                self.restore_stock(&event.order_id, &event.restore_inventory)
                    .await?;
            }
            ORDER_COMPENSATION_REQUESTED => {
                let event = CompensationRequested::from_envelope(envelope)?;
                self.restore_stock(&event.order_id, &event.restore_inventory)
                    .await?;
            }
            other => tracing::debug!(event_type = other, "ignored by inventory"),
        }
        Ok(())
    }
}
