//! Typed messaging client over the log store.
//!
//! [`MessagingClient`] is the only component that touches mailbox streams.
//! It derives stream keys through
//! [`mailbox_key`](crate::quadracode::envelope::mailbox_key), encodes and
//! decodes [`Envelope`]s, retries transient store failures with exponential
//! backoff, and shields the poll loop from poison entries: a batch read skips
//! (and counts, and best-effort deletes) entries that fail to decode instead
//! of raising, so one malformed entry can never block a mailbox.
//!
//! Delete-after-dispatch gives at-least-once semantics; an operator can
//! replay a mailbox by copying its entries forward.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::envelope::{mailbox_key, Envelope, EntryId};
use super::store::{LogStore, StoreError};

/// First retry delay after a transient store failure.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Number of retries; delays double from [`RETRY_BASE`] up to 3.2 s.
const RETRY_ATTEMPTS: u32 = 6;

/// Errors surfaced by the messaging client after retries are exhausted.
#[derive(Debug)]
pub enum MessagingError {
    /// The store stayed unavailable through the whole backoff schedule.
    Store(StoreError),
}

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagingError::Store(err) => write!(f, "store unavailable after retries: {}", err),
        }
    }
}

impl Error for MessagingError {}

/// Thin typed wrapper over an [`Arc<dyn LogStore>`].
///
/// Safe for concurrent `publish`/`read`/`delete`: all methods take `&self`
/// and synchronisation lives inside the store implementation.
pub struct MessagingClient {
    store: Arc<dyn LogStore>,
    skipped_malformed: AtomicU64,
}

impl MessagingClient {
    /// Wrap a log store.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            skipped_malformed: AtomicU64::new(0),
        }
    }

    /// How many malformed entries have been skipped by `read` so far.
    pub fn skipped_malformed(&self) -> u64 {
        self.skipped_malformed.load(Ordering::Relaxed)
    }

    /// Append an envelope to the recipient's mailbox, returning the entry id.
    pub async fn publish(
        &self,
        recipient: &str,
        envelope: &Envelope,
    ) -> Result<EntryId, MessagingError> {
        let key = mailbox_key(recipient);
        let fields = envelope.to_fields();
        let mut delay = RETRY_BASE;
        let mut attempt = 0;
        loop {
            match self.store.append(&key, fields.clone()).await {
                Ok(id) => return Ok(id),
                Err(err) if attempt < RETRY_ATTEMPTS => {
                    log::warn!("publish to {} failed (attempt {}): {}", key, attempt + 1, err);
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(MessagingError::Store(err)),
            }
        }
    }

    /// Read the oldest up-to-`batch_size` envelopes from a mailbox.
    ///
    /// Entries that fail to decode are skipped, counted, and deleted
    /// (best-effort) so they never come back on the next poll.
    pub async fn read(
        &self,
        recipient: &str,
        batch_size: usize,
    ) -> Result<Vec<(EntryId, Envelope)>, MessagingError> {
        let key = mailbox_key(recipient);
        let mut delay = RETRY_BASE;
        let mut attempt = 0;
        let raw = loop {
            match self.store.range(&key, batch_size).await {
                Ok(entries) => break entries,
                Err(err) if attempt < RETRY_ATTEMPTS => {
                    log::warn!("read from {} failed (attempt {}): {}", key, attempt + 1, err);
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(MessagingError::Store(err)),
            }
        };

        let mut entries = Vec::with_capacity(raw.len());
        for (entry_id, fields) in raw {
            match Envelope::from_fields(&fields) {
                Ok(envelope) => entries.push((entry_id, envelope)),
                Err(err) => {
                    self.skipped_malformed.fetch_add(1, Ordering::Relaxed);
                    log::error!("skipping malformed entry {} in {}: {}", entry_id, key, err);
                    if let Err(del_err) = self.store.delete(&key, entry_id).await {
                        log::warn!(
                            "could not delete malformed entry {} in {}: {}",
                            entry_id,
                            key,
                            del_err
                        );
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Acknowledge an entry by deleting it from the mailbox. Idempotent.
    pub async fn delete(&self, recipient: &str, entry_id: EntryId) -> Result<(), MessagingError> {
        let key = mailbox_key(recipient);
        let mut delay = RETRY_BASE;
        let mut attempt = 0;
        loop {
            match self.store.delete(&key, entry_id).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < RETRY_ATTEMPTS => {
                    log::warn!(
                        "delete of {} from {} failed (attempt {}): {}",
                        entry_id,
                        key,
                        attempt + 1,
                        err
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(MessagingError::Store(err)),
            }
        }
    }
}
