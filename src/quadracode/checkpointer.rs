//! Per-thread persistence of conversation state.
//!
//! The checkpointer is the only mutable shared resource the reasoning graph
//! touches. It maps a thread id to the thread's full message list; the list
//! is strictly additive and persisted in full after each graph invocation.
//! The trait is pluggable so distributed deployments can swap in a
//! store-backed implementation without the graph noticing.
//!
//! Two implementations ship with the crate: [`MemoryCheckpointer`] for
//! single-process deployments and [`FileCheckpointer`], which writes one JSON
//! document per thread under a directory, naming files by a SHA-256
//! fingerprint of the thread id for collision resistance.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::chat::ChatMessage;

/// Errors surfaced by a checkpointer.
#[derive(Debug)]
pub enum CheckpointError {
    /// Filesystem failure in a persistent implementation.
    Io(io::Error),
    /// A persisted document that no longer decodes.
    Serde(serde_json::Error),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io(err) => write!(f, "checkpoint io error: {}", err),
            CheckpointError::Serde(err) => write!(f, "checkpoint decode error: {}", err),
        }
    }
}

impl Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(err: io::Error) -> Self {
        CheckpointError::Io(err)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serde(err)
    }
}

/// Keyed persistence of thread message lists.
///
/// Implementations must be safe for concurrent calls across threads;
/// serialisation of invocations on the *same* thread id is handled above the
/// checkpointer by the graph's per-thread locks.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// The persisted message list for a thread, or `None` if unseen.
    async fn get(&self, thread_id: &str) -> Result<Option<Vec<ChatMessage>>, CheckpointError>;

    /// Persist the full message list for a thread.
    async fn put(&self, thread_id: &str, messages: &[ChatMessage]) -> Result<(), CheckpointError>;

    /// Drop a thread's state. The core never calls this; it exists for
    /// collaborators that manage retention.
    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpointer for single-process deployments.
pub struct MemoryCheckpointer {
    threads: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryCheckpointer {
    /// Create an empty checkpointer.
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn get(&self, thread_id: &str) -> Result<Option<Vec<ChatMessage>>, CheckpointError> {
        let threads = self.threads.lock().await;
        Ok(threads.get(thread_id).cloned())
    }

    async fn put(&self, thread_id: &str, messages: &[ChatMessage]) -> Result<(), CheckpointError> {
        let mut threads = self.threads.lock().await;
        threads.insert(thread_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let mut threads = self.threads.lock().await;
        threads.remove(thread_id);
        Ok(())
    }
}

/// Checkpointer that persists each thread as a JSON file.
///
/// Thread ids are arbitrary strings supplied by remote producers, so the
/// filename is their SHA-256 fingerprint rather than the id itself.
pub struct FileCheckpointer {
    dir: PathBuf,
}

impl FileCheckpointer {
    /// Create a checkpointer rooted at `dir`. The directory is created on
    /// first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        let digest = Sha256::digest(thread_id.as_bytes());
        let mut name = String::with_capacity(64 + 5);
        for byte in digest {
            name.push_str(&format!("{:02x}", byte));
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn get(&self, thread_id: &str) -> Result<Option<Vec<ChatMessage>>, CheckpointError> {
        let path = self.path_for(thread_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let messages = serde_json::from_str::<Vec<ChatMessage>>(&raw)?;
        Ok(Some(messages))
    }

    async fn put(&self, thread_id: &str, messages: &[ChatMessage]) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let raw = serde_json::to_string(messages)?;
        fs::write(self.path_for(thread_id), raw)?;
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        match fs::remove_file(self.path_for(thread_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
