//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p outbox --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Duration;
use futures_util::FutureExt;
use outbox::{
    AggregateId, OutboxError, OutboxEvent, OutboxStatus, OutboxStore, PostgresOutboxStore,
    ProcessedMessage, ProcessedMessageStore, WriteOutcome,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
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

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            for migration in [
                include_str!("../../../migrations/001_create_outbox_tables.sql"),
                include_str!("../../../migrations/002_create_fulfillment_tables.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresOutboxStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE outbox_events, processed_messages, orders")
        .execute(&pool)
        .await
        .unwrap();

    PostgresOutboxStore::new(pool)
}

fn order_event(order_id: &str, event_type: &str) -> OutboxEvent {
    OutboxEvent::new(
        AggregateId::from_string(order_id),
        "Order",
        event_type,
        &serde_json::json!({"orderId": order_id}),
    )
    .unwrap()
}

async fn insert_order(store: &PostgresOutboxStore, order_id: &str) -> WriteOutcome<()> {
    let id = order_id.to_string();
    store
        .write_with_outbox(order_event(order_id, "order.initiated"), move |conn| {
            async move {
                sqlx::query(
                    "INSERT INTO orders (id, user_id, items, total_amount, status) \
                     VALUES ($1, 'u-1', '[]'::jsonb, 0, 'PROCESSING') \
                     ON CONFLICT (id) DO UPDATE SET updated_at = NOW()",
                )
                .bind(id)
                .execute(conn)
                .await?;
                Ok::<_, OutboxError>(())
            }
            .boxed()
        })
        .await
        .unwrap()
}

async fn order_count(store: &PostgresOutboxStore) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_write_commits_mutation_and_event() {
    let store = get_test_store().await;

    let outcome = insert_order(&store, "order-1").await;
    assert!(!outcome.is_skipped());

    assert_eq!(order_count(&store).await, 1);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_failed_mutation_rolls_back_event() {
    let store = get_test_store().await;

    let result: Result<WriteOutcome<()>, OutboxError> = store
        .write_with_outbox(order_event("order-1", "order.initiated"), |conn| {
            async move {
                sqlx::query("INSERT INTO orders (id) VALUES ('missing-columns')")
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(result.is_err());
    assert_eq!(store.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_duplicate_key_skips_whole_write() {
    let store = get_test_store().await;

    insert_order(&store, "order-1").await;
    sqlx::query("DELETE FROM orders")
        .execute(store.pool())
        .await
        .unwrap();

    let outcome = insert_order(&store, "order-1").await;
    assert!(outcome.is_skipped());

    // The mutation was rolled back with the duplicate event.
    assert_eq!(order_count(&store).await, 0);
    assert_eq!(store.stats().await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_find_pending_oldest_first_excludes_exhausted() {
    let store = get_test_store().await;

    for id in ["order-1", "order-2", "order-3"] {
        insert_order(&store, id).await;
    }

    let all = store.find_pending(10).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.aggregate_id.as_str()).collect();
    assert_eq!(ids, vec!["order-1", "order-2", "order-3"]);

    let first = all[0].id;
    let mut last = None;
    for _ in 0..all[0].max_retries {
        last = store.increment_retry(&[first]).await.unwrap().pop();
    }
    assert!(last.unwrap().exhausted());

    let pending = store.find_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|r| r.id != first));

    let limited = store.find_pending(1).await.unwrap();
    assert_eq!(limited[0].aggregate_id.as_str(), "order-2");
}

#[tokio::test]
async fn test_terminal_status_never_reverts() {
    let store = get_test_store().await;
    insert_order(&store, "order-1").await;
    let id = store.find_pending(1).await.unwrap()[0].id;

    assert_eq!(store.mark_failed(&[id]).await.unwrap(), 1);
    assert_eq!(store.mark_processed(&[id]).await.unwrap(), 0);
    assert!(store.increment_retry(&[id]).await.unwrap().is_empty());

    let records = store
        .events_for_aggregate(&AggregateId::from_string("order-1"))
        .await
        .unwrap();
    assert_eq!(records[0].status, OutboxStatus::Failed);
    assert!(records[0].processed_at.is_some());
}

#[tokio::test]
async fn test_cleanup_purges_old_processed_rows() {
    let store = get_test_store().await;
    insert_order(&store, "order-1").await;
    insert_order(&store, "order-2").await;

    let pending = store.find_pending(10).await.unwrap();
    store.mark_processed(&[pending[0].id]).await.unwrap();

    // Nothing is older than a day yet.
    assert_eq!(store.cleanup(Duration::hours(24)).await.unwrap(), 0);

    // A negative window makes every PROCESSED row eligible.
    assert_eq!(store.cleanup(Duration::seconds(-1)).await.unwrap(), 1);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_has_event() {
    let store = get_test_store().await;
    insert_order(&store, "order-1").await;

    let id = AggregateId::from_string("order-1");
    assert!(store.has_event(&id, "order.initiated").await.unwrap());
    assert!(!store.has_event(&id, "order.created").await.unwrap());
}

#[tokio::test]
async fn test_processed_message_ledger() {
    let store = get_test_store().await;
    let message = ProcessedMessage::new(
        "msg-1",
        "order.created",
        AggregateId::from_string("order-1"),
        Duration::days(7),
    );

    assert!(!store.is_processed("msg-1").await.unwrap());
    assert!(store.record_processed(message.clone()).await.unwrap());
    assert!(!store.record_processed(message).await.unwrap());
    assert!(store.is_processed("msg-1").await.unwrap());
}

#[tokio::test]
async fn test_expired_ledger_entry_is_replaced() {
    let store = get_test_store().await;
    let mut stale = ProcessedMessage::new(
        "msg-2",
        "order.created",
        AggregateId::from_string("order-2"),
        Duration::days(7),
    );
    stale.expire_at = chrono::Utc::now() - Duration::seconds(1);
    assert!(store.record_processed(stale).await.unwrap());
    assert!(!store.is_processed("msg-2").await.unwrap());

    let fresh = ProcessedMessage::new(
        "msg-2",
        "order.created",
        AggregateId::from_string("order-2"),
        Duration::days(7),
    );
    assert!(store.record_processed(fresh.clone()).await.unwrap());
    assert!(!store.record_processed(fresh).await.unwrap());
    assert!(store.is_processed("msg-2").await.unwrap());
}
