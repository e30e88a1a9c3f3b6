//! Saga steps against PostgreSQL.
//!
//! These tests share one PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_saga -- --test-threads=1
//! ```

use std::sync::Arc;

use outbox::{OutboxStore, PostgresOutboxStore};
use saga::events::{
    InventoryReservationFailed, InventoryReserved, ORDER_CREATED, ORDER_FAILED, ORDER_PLACED,
    PaymentFailed, PaymentSucceeded,
};
use saga::{
    InMemoryPaymentGateway, InventoryService, Money, Order, OrderItem, OrderRepository, OrderSaga,
    OrderService, OrderStatus, PaymentService, PaymentStatus, SagaOutcome, SagaTrigger,
    StockOutcome, Transition, TransitionResult,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            for migration in [
                include_str!("../../../migrations/001_create_outbox_tables.sql"),
                include_str!("../../../migrations/002_create_fulfillment_tables.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&pool).await.unwrap();
            }
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresOutboxStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE outbox_events, processed_messages, orders, products, payments",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresOutboxStore::new(pool)
}

fn two_of_p1() -> Vec<OrderItem> {
    vec![OrderItem::new("P1", 2, Money::from_cents(1000))]
}

fn reserved(order: &Order) -> SagaTrigger {
    SagaTrigger::InventoryReserved(InventoryReserved {
        order_id: order.id.clone(),
        items: order.items.clone(),
    })
}

async fn event_types(store: &PostgresOutboxStore, order: &Order) -> Vec<String> {
    store
        .events_for_aggregate(&order.id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.event_type)
        .collect()
}

#[tokio::test]
async fn test_order_is_placed_step_by_step() {
    let store = get_test_store().await;
    let orders = OrderService::new(store.clone());
    let saga = OrderSaga::new(store.clone());
    let inventory = InventoryService::new(store.clone());
    let gateway = InMemoryPaymentGateway::new();
    let payments = PaymentService::new(store.clone(), Arc::new(gateway.clone()));
    inventory.seed_stock("P1", 10).await.unwrap();

    let order = orders.place_order("user-1", two_of_p1()).await.unwrap();
    assert_eq!(
        orders.get_order(&order.id).await.unwrap().unwrap().status,
        OrderStatus::Processing
    );

    assert_eq!(
        inventory.reserve_stock(&order.id, &order.items).await.unwrap(),
        StockOutcome::Reserved
    );
    assert_eq!(
        inventory.reserve_stock(&order.id, &order.items).await.unwrap(),
        StockOutcome::AlreadyHandled
    );
    assert_eq!(inventory.stock("P1").await.unwrap(), Some(8));

    saga.handle_trigger(&reserved(&order)).await.unwrap();
    let payment = payments
        .process_payment_for_order(&order.id, order.total_amount, &order.user_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    saga.handle_trigger(&SagaTrigger::PaymentSucceeded(PaymentSucceeded {
        order_id: order.id.clone(),
        amount: order.total_amount,
    }))
    .await
    .unwrap();

    let stored = orders.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Placed);
    assert_eq!(stored.items, order.items);
    let types = event_types(&store, &order).await;
    assert!(types.contains(&ORDER_CREATED.to_string()));
    assert!(types.contains(&ORDER_PLACED.to_string()));
}

#[tokio::test]
async fn test_guarded_transition_rejects_stale_status() {
    let store = get_test_store().await;
    let orders = OrderService::new(store.clone());
    let saga = OrderSaga::new(store.clone());
    let order = orders.place_order("user-1", two_of_p1()).await.unwrap();

    saga.handle_trigger(&reserved(&order)).await.unwrap();

    // A transition computed from the old PROCESSING read loses the guard and
    // leaves no event behind.
    let stale = Transition::new(
        order.id.clone(),
        OrderStatus::Processing,
        OrderStatus::Failed,
        saga::FulfillmentEvent::to_outbox(&PaymentFailed {
            order_id: order.id.clone(),
            reason: "stale".to_string(),
        })
        .unwrap(),
    );
    assert_eq!(
        store.transition(stale).await.unwrap(),
        TransitionResult::GuardFailed
    );
    assert_eq!(
        orders.get_order(&order.id).await.unwrap().unwrap().status,
        OrderStatus::Created
    );

    let outcome = saga.handle_trigger(&reserved(&order)).await.unwrap();
    assert_eq!(outcome, SagaOutcome::AlreadyHandled);
    let created = event_types(&store, &order)
        .await
        .into_iter()
        .filter(|t| t == ORDER_CREATED)
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_declined_payment_fails_and_restores() {
    let store = get_test_store().await;
    let orders = OrderService::new(store.clone());
    let saga = OrderSaga::new(store.clone());
    let inventory = InventoryService::new(store.clone());
    let gateway = InMemoryPaymentGateway::new();
    gateway.decline_with(Some("declined")).await;
    let payments = PaymentService::new(store.clone(), Arc::new(gateway.clone()));
    inventory.seed_stock("P1", 10).await.unwrap();

    let order = orders.place_order("user-1", two_of_p1()).await.unwrap();
    inventory.reserve_stock(&order.id, &order.items).await.unwrap();
    saga.handle_trigger(&reserved(&order)).await.unwrap();

    let payment = payments
        .process_payment_for_order(&order.id, order.total_amount, &order.user_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.decline_reason.as_deref(), Some("declined"));

    saga.handle_trigger(&SagaTrigger::PaymentFailed(PaymentFailed {
        order_id: order.id.clone(),
        reason: "declined".to_string(),
    }))
    .await
    .unwrap();

    let stored = orders.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("declined"));
    assert!(event_types(&store, &order).await.contains(&ORDER_FAILED.to_string()));

    assert_eq!(
        inventory.restore_stock(&order.id, &order.items).await.unwrap(),
        StockOutcome::Restored
    );
    assert_eq!(
        inventory.restore_stock(&order.id, &order.items).await.unwrap(),
        StockOutcome::AlreadyHandled
    );
    assert_eq!(inventory.stock("P1").await.unwrap(), Some(10));
}

#[tokio::test]
async fn test_shortage_is_recorded_without_touching_stock() {
    let store = get_test_store().await;
    let orders = OrderService::new(store.clone());
    let saga = OrderSaga::new(store.clone());
    let inventory = InventoryService::new(store.clone());
    inventory.seed_stock("P1", 1).await.unwrap();

    let order = orders.place_order("user-1", two_of_p1()).await.unwrap();
    let outcome = inventory.reserve_stock(&order.id, &order.items).await.unwrap();
    let StockOutcome::Rejected(shortage) = outcome else {
        panic!("expected a shortage, got {outcome:?}");
    };
    assert_eq!((shortage.available, shortage.requested), (1, 2));
    assert_eq!(inventory.stock("P1").await.unwrap(), Some(1));

    saga.handle_trigger(&SagaTrigger::ReservationFailed(InventoryReservationFailed {
        order_id: order.id.clone(),
        reason: shortage.to_string(),
    }))
    .await
    .unwrap();
    assert_eq!(
        orders.get_order(&order.id).await.unwrap().unwrap().status,
        OrderStatus::Failed
    );
}

#[tokio::test]
async fn test_failed_order_blocks_later_charge() {
    let store = get_test_store().await;
    let orders = OrderService::new(store.clone());
    let gateway = InMemoryPaymentGateway::new();
    let payments = PaymentService::new(store.clone(), Arc::new(gateway.clone()));
    let order = orders.place_order("user-1", two_of_p1()).await.unwrap();

    let marker = payments.cancel_or_refund(&order.id).await.unwrap().unwrap();
    assert_eq!(marker.status, PaymentStatus::Cancelled);

    let payment = payments
        .process_payment_for_order(&order.id, order.total_amount, &order.user_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Cancelled);
    assert_eq!(gateway.charge_calls().await, 0);
}
