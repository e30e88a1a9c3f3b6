//! In-process transactional document store.
//!
//! Stands in for a document database with multi-document transactions: named
//! collections of JSON documents, an outbox collection with a unique index on
//! `(aggregate_id, event_type)`, a processed-message ledger, and TTL expiry
//! applied on every access the way a TTL monitor would.
//!
//! Writes made through a [`Session`] are staged and applied together on
//! commit, or not at all.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    AggregateId, OutboxError, OutboxEvent, OutboxPolicy, OutboxRecord, OutboxStats, OutboxStatus,
    ProcessedMessage, ProcessedMessageStore, Result, RetryState, WriteOutcome,
    store::OutboxStore,
};

type DocKey = (String, String);
type OutboxKey = (AggregateId, String);

#[derive(Debug, Default)]
struct Database {
    collections: HashMap<String, BTreeMap<String, serde_json::Value>>,
    outbox: Vec<OutboxRecord>,
    outbox_keys: HashSet<OutboxKey>,
    processed: HashMap<String, ProcessedMessage>,
    injected_conflicts: u32,
}

impl Database {
    /// Removes expired terminal outbox records and expired ledger entries.
    fn expire(&mut self, now: DateTime<Utc>) -> u64 {
        let mut removed = 0u64;
        let keys = &mut self.outbox_keys;
        self.outbox.retain(|record| {
            let expired = record.status.is_terminal() && record.is_expired(now);
            if expired {
                keys.remove(&(record.aggregate_id.clone(), record.event_type.clone()));
                removed += 1;
            }
            !expired
        });

        let before = self.processed.len();
        self.processed.retain(|_, message| message.expire_at > now);
        removed + (before - self.processed.len()) as u64
    }

    fn commit(&mut self, staged: Staged) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }

        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(OutboxError::WriteConflict(
                "concurrent transaction committed first".to_string(),
            ));
        }

        for ((collection, id), doc) in staged.docs {
            self.collections
                .entry(collection)
                .or_default()
                .insert(id, doc);
        }
        for record in staged.outbox {
            self.outbox_keys
                .insert((record.aggregate_id.clone(), record.event_type.clone()));
            self.outbox.push(record);
        }
        Ok(())
    }

    fn has_outbox_key(&self, aggregate_id: &AggregateId, event_type: &str) -> bool {
        self.outbox_keys
            .contains(&(aggregate_id.clone(), event_type.to_string()))
    }
}

#[derive(Debug, Default)]
struct Staged {
    docs: BTreeMap<DocKey, serde_json::Value>,
    outbox: Vec<OutboxRecord>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.outbox.is_empty()
    }
}

/// A unit of work against a [`DocumentStore`].
///
/// Reads see committed data overlaid with this session's own staged writes.
pub struct Session<'a> {
    db: &'a Database,
    staged: Staged,
    policy: OutboxPolicy,
}

impl<'a> Session<'a> {
    fn new(db: &'a Database, policy: OutboxPolicy) -> Self {
        Self {
            db,
            staged: Staged::default(),
            policy,
        }
    }

    /// Loads a document by id.
    pub fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        let key = (collection.to_string(), id.to_string());
        let doc = match self.staged.docs.get(&key) {
            Some(doc) => Some(doc),
            None => self.db.collections.get(collection).and_then(|c| c.get(id)),
        };
        doc.map(|value| serde_json::from_value(value.clone()).map_err(OutboxError::from))
            .transpose()
    }

    /// Stages an insert-or-replace of a document.
    pub fn put<T: Serialize>(&mut self, collection: &str, id: &str, doc: &T) -> Result<()> {
        let value = serde_json::to_value(doc)?;
        self.staged
            .docs
            .insert((collection.to_string(), id.to_string()), value);
        Ok(())
    }

    /// Stages an outbox record.
    ///
    /// Returns false if the idempotency key is already taken, in which case
    /// nothing is staged.
    pub fn insert_outbox(&mut self, event: OutboxEvent) -> bool {
        if self.has_outbox_event(&event.aggregate_id, &event.event_type) {
            return false;
        }
        self.staged
            .outbox
            .push(OutboxRecord::pending(event, &self.policy));
        true
    }

    /// Returns true if an outbox record with this key exists or is staged.
    pub fn has_outbox_event(&self, aggregate_id: &AggregateId, event_type: &str) -> bool {
        self.db.has_outbox_key(aggregate_id, event_type)
            || self
                .staged
                .outbox
                .iter()
                .any(|r| &r.aggregate_id == aggregate_id && r.event_type == event_type)
    }

    /// Drops every staged write.
    pub fn discard(&mut self) {
        self.staged = Staged::default();
    }

    fn into_staged(self) -> Staged {
        self.staged
    }
}

/// In-process document database used as the document outbox backend.
#[derive(Clone, Default)]
pub struct DocumentStore {
    db: Arc<Mutex<Database>>,
    policy: OutboxPolicy,
}

impl DocumentStore {
    /// Creates an empty store with the default outbox policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store writing records with the given policy.
    pub fn with_policy(policy: OutboxPolicy) -> Self {
        Self {
            db: Arc::default(),
            policy,
        }
    }

    /// Returns the policy applied to new outbox records.
    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    /// Runs `f` in a transaction. Staged writes are applied only if `f`
    /// returns `Ok` and the commit succeeds.
    pub async fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session<'_>) -> std::result::Result<T, E>,
        E: From<OutboxError>,
    {
        let mut db = self.db.lock().await;
        db.expire(Utc::now());

        let mut session = Session::new(&db, self.policy);
        let value = f(&mut session)?;
        let staged = session.into_staged();

        db.commit(staged)?;
        Ok(value)
    }

    /// Applies `mutation` and stages `event` in one transaction.
    ///
    /// When the event's idempotency key already exists the mutation is
    /// discarded too and [`WriteOutcome::Skipped`] is returned.
    #[tracing::instrument(skip(self, event, mutation), fields(aggregate_id = %event.aggregate_id, event_type = %event.event_type))]
    pub async fn write_with_outbox<T, E, F>(
        &self,
        event: OutboxEvent,
        mutation: F,
    ) -> std::result::Result<WriteOutcome<T>, E>
    where
        F: FnOnce(&mut Session<'_>) -> std::result::Result<T, E>,
        E: From<OutboxError>,
    {
        let outcome = self
            .transaction::<_, E, _>(|session| {
                let value = mutation(session)?;
                if session.insert_outbox(event) {
                    Ok(WriteOutcome::Committed(value))
                } else {
                    session.discard();
                    Ok(WriteOutcome::Skipped)
                }
            })
            .await?;

        if outcome.is_skipped() {
            tracing::debug!("outbox idempotency key exists, write skipped");
            metrics::counter!("outbox_writes_skipped_total").increment(1);
        } else {
            metrics::counter!("outbox_writes_total").increment(1);
        }
        Ok(outcome)
    }

    /// Loads a committed document outside of any transaction.
    pub async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        self.transaction(|session| session.get(collection, id)).await
    }

    /// Makes the next `count` non-empty commits fail with a write conflict.
    pub async fn inject_write_conflicts(&self, count: u32) {
        self.db.lock().await.injected_conflicts = count;
    }

    /// Runs one TTL monitor pass as of `now`. Returns the number of
    /// documents removed.
    pub async fn expire_documents(&self, now: DateTime<Utc>) -> u64 {
        self.db.lock().await.expire(now)
    }

    /// Returns a copy of every outbox record in creation order.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.db.lock().await.outbox.clone()
    }

    /// Returns the number of committed documents in `collection`.
    pub async fn document_count(&self, collection: &str) -> usize {
        self.db
            .lock()
            .await
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns the number of ledger entries.
    pub async fn processed_count(&self) -> usize {
        self.db.lock().await.processed.len()
    }
}

#[async_trait]
impl OutboxStore for DocumentStore {
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let mut db = self.db.lock().await;
        db.expire(Utc::now());

        let mut pending: Vec<OutboxRecord> = db
            .outbox
            .iter()
            .filter(|r| r.is_publishable())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64> {
        Ok(self
            .db
            .lock()
            .await
            .transition(ids, OutboxStatus::Processed))
    }

    async fn mark_failed(&self, ids: &[Uuid]) -> Result<u64> {
        Ok(self.db.lock().await.transition(ids, OutboxStatus::Failed))
    }

    async fn increment_retry(&self, ids: &[Uuid]) -> Result<Vec<RetryState>> {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let mut db = self.db.lock().await;

        let states = db
            .outbox
            .iter_mut()
            .filter(|r| r.status == OutboxStatus::Pending && wanted.contains(&r.id))
            .map(|r| {
                r.retry_count += 1;
                RetryState {
                    id: r.id,
                    retry_count: r.retry_count,
                    max_retries: r.max_retries,
                }
            })
            .collect();
        Ok(states)
    }

    async fn cleanup(&self, _retention: Duration) -> Result<u64> {
        // Expiry is handled by the TTL pass on every access.
        Ok(0)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let db = self.db.lock().await;
        let mut stats = OutboxStats::default();
        for record in &db.outbox {
            match record.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processed => stats.processed += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn has_event(&self, aggregate_id: &AggregateId, event_type: &str) -> Result<bool> {
        Ok(self.db.lock().await.has_outbox_key(aggregate_id, event_type))
    }

    async fn events_for_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<OutboxRecord>> {
        let db = self.db.lock().await;
        Ok(db
            .outbox
            .iter()
            .filter(|r| &r.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }
}

impl Database {
    fn is_live_entry(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        self.processed
            .get(message_id)
            .is_some_and(|message| message.expire_at > now)
    }

    fn transition(&mut self, ids: &[Uuid], to: OutboxStatus) -> u64 {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let now = Utc::now();
        let mut changed = 0;
        for record in self
            .outbox
            .iter_mut()
            .filter(|r| r.status == OutboxStatus::Pending && wanted.contains(&r.id))
        {
            record.status = to;
            record.processed_at = Some(now);
            changed += 1;
        }
        changed
    }
}

#[async_trait]
impl ProcessedMessageStore for DocumentStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut db = self.db.lock().await;
        db.expire(now);
        Ok(db.is_live_entry(message_id, now))
    }

    /// An entry past its `expire_at` is replaced, whether or not the TTL
    /// pass has removed it yet.
    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool> {
        let mut db = self.db.lock().await;
        if db.is_live_entry(&message.message_id, Utc::now()) {
            return Ok(false);
        }
        db.processed.insert(message.message_id.clone(), message);
        Ok(true)
    }
}
