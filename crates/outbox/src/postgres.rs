use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, OutboxError, OutboxEvent, OutboxPolicy, OutboxRecord, OutboxStats, OutboxStatus,
    ProcessedMessage, ProcessedMessageStore, Result, RetryState, WriteOutcome,
    error::is_conflict_code, store::OutboxStore,
};

const RECORD_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, status, \
     retry_count, max_retries, created_at, processed_at, expire_at";

/// PostgreSQL-backed outbox store and processed-message ledger.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    policy: OutboxPolicy,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox store with the default policy.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            policy: OutboxPolicy::default(),
        }
    }

    /// Sets the policy applied to records written through this store.
    pub fn with_policy(mut self, policy: OutboxPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the policy applied to new outbox records.
    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts an outbox record inside a caller-owned transaction.
    ///
    /// Returns false when the `(aggregate_id, event_type)` key already
    /// exists. The caller is expected to roll back in that case.
    pub async fn insert_in_tx(
        conn: &mut PgConnection,
        event: &OutboxEvent,
        policy: &OutboxPolicy,
    ) -> Result<bool> {
        let record = OutboxRecord::pending(event.clone(), policy);

        let result = sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_id, aggregate_type, event_type, payload, status,
                 retry_count, max_retries, created_at, expire_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7, $8)
            ON CONFLICT (aggregate_id, event_type) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.aggregate_id.as_str())
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.max_retries)
        .bind(record.created_at)
        .bind(record.expire_at)
        .execute(conn)
        .await
        .map_err(map_conflict)?;

        Ok(result.rows_affected() == 1)
    }

    /// Applies `mutation` and inserts `event` in one transaction.
    ///
    /// When the event's idempotency key already exists the transaction is
    /// rolled back, so the mutation is discarded too, and
    /// [`WriteOutcome::Skipped`] is returned.
    #[tracing::instrument(skip(self, event, mutation), fields(aggregate_id = %event.aggregate_id, event_type = %event.event_type))]
    pub async fn write_with_outbox<T, E, F>(
        &self,
        event: OutboxEvent,
        mutation: F,
    ) -> std::result::Result<WriteOutcome<T>, E>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, std::result::Result<T, E>>,
        E: From<OutboxError>,
    {
        let mut tx = self.pool.begin().await.map_err(OutboxError::from)?;

        let value = mutation(&mut *tx).await?;

        if !Self::insert_in_tx(&mut *tx, &event, &self.policy).await? {
            tx.rollback().await.map_err(OutboxError::from)?;
            tracing::debug!("outbox idempotency key exists, write skipped");
            metrics::counter!("outbox_writes_skipped_total").increment(1);
            return Ok(WriteOutcome::Skipped);
        }

        tx.commit().await.map_err(map_conflict)?;
        metrics::counter!("outbox_writes_total").increment(1);
        Ok(WriteOutcome::Committed(value))
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;

        Ok(OutboxRecord {
            id: row.try_get("id")?,
            aggregate_id: AggregateId::from_string(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::parse(&status)?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            expire_at: row.try_get("expire_at")?,
        })
    }

    async fn transition(&self, ids: &[Uuid], to: OutboxStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $1, processed_at = NOW()
            WHERE id = ANY($2) AND status = 'PENDING'
            "#,
        )
        .bind(to.as_str())
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Maps serialization failures and deadlocks to [`OutboxError::WriteConflict`].
fn map_conflict(err: sqlx::Error) -> OutboxError {
    if let sqlx::Error::Database(ref db) = err
        && is_conflict_code(db.code())
    {
        return OutboxError::WriteConflict(db.message().to_string());
    }
    OutboxError::Database(err)
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_events
            WHERE status = 'PENDING' AND retry_count < max_retries
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64> {
        self.transition(ids, OutboxStatus::Processed).await
    }

    async fn mark_failed(&self, ids: &[Uuid]) -> Result<u64> {
        self.transition(ids, OutboxStatus::Failed).await
    }

    async fn increment_retry(&self, ids: &[Uuid]) -> Result<Vec<RetryState>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1
            WHERE id = ANY($1) AND status = 'PENDING'
            RETURNING id, retry_count, max_retries
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<RetryState> {
                Ok(RetryState {
                    id: row.try_get("id")?,
                    retry_count: row.try_get("retry_count")?,
                    max_retries: row.try_get("max_retries")?,
                })
            })
            .collect()
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;

        let outbox = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE (status = 'PROCESSED' AND processed_at < $1)
               OR (status <> 'PENDING' AND expire_at < NOW())
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let ledger = sqlx::query("DELETE FROM processed_messages WHERE expire_at < NOW()")
            .execute(&self.pool)
            .await?;

        Ok(outbox.rows_affected() + ledger.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM outbox_events GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count = row.try_get::<i64, _>("count")? as u64;
            match OutboxStatus::parse(&status)? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Processed => stats.processed = count,
                OutboxStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    async fn has_event(&self, aggregate_id: &AggregateId, event_type: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM outbox_events WHERE aggregate_id = $1 AND event_type = $2)",
        )
        .bind(aggregate_id.as_str())
        .bind(event_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn events_for_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_events
            WHERE aggregate_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(aggregate_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl ProcessedMessageStore for PostgresOutboxStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id = $1 AND expire_at > NOW())",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages (message_id, event_type, aggregate_id, processed_at, expire_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (message_id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                aggregate_id = EXCLUDED.aggregate_id,
                processed_at = EXCLUDED.processed_at,
                expire_at = EXCLUDED.expire_at
            WHERE processed_messages.expire_at <= NOW()
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.event_type)
        .bind(message.aggregate_id.as_str())
        .bind(message.processed_at)
        .bind(message.expire_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
