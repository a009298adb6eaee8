//! Append-only log store behind the mailbox substrate.
//!
//! Mailboxes are ordered streams of flat `string -> string` field maps. The
//! [`LogStore`] trait captures the three operations the messaging layer
//! needs: append (`xadd`), oldest-first range read (`xrange`), and idempotent
//! single-entry delete (`xdel`). Two implementations ship with the crate:
//!
//! - [`MemoryLogStore`]: in-process streams for tests and single-process
//!   embeddings.
//! - [`HttpLogStore`]: a thin client for the deployment's stream-store
//!   endpoint, which exposes the same three operations over HTTP.
//!
//! Entry ids are assigned by the store and are monotonically non-decreasing
//! per stream (`<ms>-<seq>`, see [`EntryId`]).

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use tokio::sync::Mutex;

use super::envelope::EntryId;

/// Flat field map of one stream entry.
pub type EntryFields = HashMap<String, String>;

/// Errors surfaced by a log store.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The store did not accept the call (transport failure, bad response).
    /// Transient by contract: callers retry with backoff.
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "log store unavailable: {}", msg),
        }
    }
}

impl Error for StoreError {}

/// Contract of the shared ordered log.
///
/// Implementations must be safe for concurrent `append`/`range`/`delete`
/// calls; the runtime's poll task, heartbeat task, and in-flight graph work
/// all share one store handle.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append fields to the stream, returning the server-assigned id.
    async fn append(&self, key: &str, fields: EntryFields) -> Result<EntryId, StoreError>;

    /// Read the oldest up-to-`count` live entries, strictly increasing by id.
    async fn range(&self, key: &str, count: usize)
        -> Result<Vec<(EntryId, EntryFields)>, StoreError>;

    /// Delete a single entry. Deleting a non-existent id is a no-op.
    async fn delete(&self, key: &str, id: EntryId) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Stream {
    entries: Vec<(EntryId, EntryFields)>,
    last_id: Option<EntryId>,
}

/// In-process log store backed by a mutex-guarded map of streams.
///
/// Ids are derived from the wall clock; when the clock stalls or regresses
/// within a stream the previous millisecond is reused with a bumped sequence
/// number, preserving per-stream monotonicity.
pub struct MemoryLogStore {
    streams: Mutex<HashMap<String, Stream>>,
}

impl MemoryLogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries in a stream (test and introspection surface).
    pub async fn len(&self, key: &str) -> usize {
        let streams = self.streams.lock().await;
        streams.get(key).map(|s| s.entries.len()).unwrap_or(0)
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, key: &str, fields: EntryFields) -> Result<EntryId, StoreError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(key.to_string()).or_default();
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let id = match stream.last_id {
            Some(last) if now_ms <= last.ms => EntryId::new(last.ms, last.seq + 1),
            _ => EntryId::new(now_ms, 0),
        };
        stream.last_id = Some(id);
        stream.entries.push((id, fields));
        Ok(id)
    }

    async fn range(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(EntryId, EntryFields)>, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(key)
            .map(|s| s.entries.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str, id: EntryId) -> Result<(), StoreError> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(key) {
            stream.entries.retain(|(entry_id, _)| *entry_id != id);
        }
        Ok(())
    }
}

/// Client for a stream-store service exposing `xadd`/`xrange`/`xdel` over
/// HTTP.
///
/// Request/response shapes:
///
/// ```text
/// POST {base}/xadd   {"key": "...", "fields": {...}}          -> {"entry_id": "<ms>-<seq>"}
/// POST {base}/xrange {"key": "...", "count": 5}               -> {"entries": [["<id>", {...}], ...]}
/// POST {base}/xdel   {"key": "...", "entry_id": "<ms>-<seq>"} -> {}
/// ```
///
/// Any transport or decode failure maps to [`StoreError::Unavailable`] so the
/// messaging layer's retry policy applies uniformly. Range items that do not
/// match the `[id, fields]` pair shape are skipped rather than failing the
/// whole read.
pub struct HttpLogStore {
    base_url: String,
    http: reqwest::Client,
}

impl HttpLogStore {
    /// Create a client for the given endpoint base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn call(&self, op: &str, body: Value) -> Result<Value, StoreError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), op);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", op, e)))?
            .error_for_status()
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", op, e)))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: bad response: {}", op, e)))
    }
}

#[async_trait]
impl LogStore for HttpLogStore {
    async fn append(&self, key: &str, fields: EntryFields) -> Result<EntryId, StoreError> {
        let body = json!({"key": key, "fields": fields});
        let response = self.call("xadd", body).await?;
        response
            .get("entry_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<EntryId>().ok())
            .ok_or_else(|| {
                StoreError::Unavailable(format!("xadd: missing entry_id in {}", response))
            })
    }

    async fn range(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(EntryId, EntryFields)>, StoreError> {
        let body = json!({"key": key, "count": count});
        let response = self.call("xrange", body).await?;
        let items = match response.get("entries").and_then(Value::as_array) {
            Some(items) => items,
            None => return Ok(Vec::new()),
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let pair = match item.as_array() {
                Some(pair) if pair.len() == 2 => pair,
                _ => continue,
            };
            let id = match pair[0].as_str().and_then(|raw| raw.parse::<EntryId>().ok()) {
                Some(id) => id,
                None => continue,
            };
            let fields = match pair[1].as_object() {
                Some(map) => map
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect(),
                None => continue,
            };
            entries.push((id, fields));
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str, id: EntryId) -> Result<(), StoreError> {
        let body = json!({"key": key, "entry_id": id.to_string()});
        self.call("xdel", body).await.map(|_| ())
    }
}
