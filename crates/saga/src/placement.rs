//! Order placement.

use common::AggregateId;

use crate::error::{Result, SagaError};
use crate::events::{FulfillmentEvent, OrderInitiated};
use crate::order::{Order, OrderItem};
use crate::repository::OrderRepository;

/// Entry point for placing and reading orders.
#[derive(Clone)]
pub struct OrderService<R> {
    repo: R,
}

impl<R: OrderRepository> OrderService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Creates a PROCESSING order and its `order.initiated` event in one
    /// transaction. The saga takes it from there.
    #[tracing::instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn place_order(&self, user_id: &str, items: Vec<OrderItem>) -> Result<Order> {
        let order = Order::new(user_id, items)?;
        let event = OrderInitiated {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            items: order.items.clone(),
            total_amount: order.total_amount,
        }
        .to_outbox()?;

        if self.repo.create(&order, event).await?.is_skipped() {
            return Err(SagaError::Validation(format!(
                "order {} already exists",
                order.id
            )));
        }

        metrics::counter!("orders_placed_total").increment(1);
        tracing::info!(order_id = %order.id, total = %order.total_amount, "order placed");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: &AggregateId) -> Result<Option<Order>> {
        self.repo.find(order_id).await
    }
}
