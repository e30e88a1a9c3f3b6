use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{BrokerError, Headers, Result};

/// An append-only log sink keyed by stream name.
#[async_trait]
pub trait AppendOnlyStream: Send + Sync {
    /// Appends an entry and returns its id. When `maxlen` is set the stream
    /// is trimmed so that roughly the newest `maxlen` entries remain.
    async fn append(
        &self,
        stream_key: &str,
        payload: Vec<u8>,
        headers: Headers,
        maxlen: Option<u64>,
    ) -> Result<String>;
}

/// An entry in an [`InMemoryStreams`] log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[derive(Default)]
struct Log {
    next_seq: u64,
    entries: VecDeque<StreamEntry>,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, Log>,
    unavailable: bool,
}

/// In-process [`AppendOnlyStream`] for development and tests.
#[derive(Clone, Default)]
pub struct InMemoryStreams {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Entries currently held in a stream, oldest first.
    pub async fn entries(&self, stream_key: &str) -> Vec<StreamEntry> {
        self.inner
            .lock()
            .await
            .logs
            .get(stream_key)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, stream_key: &str) -> usize {
        self.inner
            .lock()
            .await
            .logs
            .get(stream_key)
            .map_or(0, |log| log.entries.len())
    }
}

#[async_trait]
impl AppendOnlyStream for InMemoryStreams {
    async fn append(
        &self,
        stream_key: &str,
        payload: Vec<u8>,
        headers: Headers,
        maxlen: Option<u64>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(BrokerError::Unavailable(format!(
                "stream '{stream_key}' is not accepting appends"
            )));
        }

        let log = inner.logs.entry(stream_key.to_string()).or_default();
        log.next_seq += 1;
        let id = format!("{}-0", log.next_seq);
        log.entries.push_back(StreamEntry {
            id: id.clone(),
            payload,
            headers,
        });

        if let Some(maxlen) = maxlen {
            let maxlen = usize::try_from(maxlen).unwrap_or(usize::MAX);
            while log.entries.len() > maxlen {
                log.entries.pop_front();
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let streams = InMemoryStreams::new();
        let first = streams
            .append("orders", b"a".to_vec(), Headers::new(), None)
            .await
            .unwrap();
        let second = streams
            .append("orders", b"b".to_vec(), Headers::new(), None)
            .await
            .unwrap();

        assert_eq!(first, "1-0");
        assert_eq!(second, "2-0");
        assert_eq!(streams.len("orders").await, 2);
        assert_eq!(streams.len("payments").await, 0);
    }

    #[tokio::test]
    async fn maxlen_trims_oldest_entries() {
        let streams = InMemoryStreams::new();
        for i in 0..5u8 {
            streams
                .append("orders", vec![i], Headers::new(), Some(3))
                .await
                .unwrap();
        }

        let entries = streams.entries("orders").await;
        let payloads: Vec<u8> = entries.iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn unavailable_stream_rejects_append() {
        let streams = InMemoryStreams::new();
        streams.set_unavailable(true).await;
        let result = streams
            .append("orders", Vec::new(), Headers::new(), None)
            .await;
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
    }
}
