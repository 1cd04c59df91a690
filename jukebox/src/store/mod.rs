//! Shared store seam.
//!
//! Every piece of state shared between worker processes and producers lives
//! behind the [`Store`] trait: plain string records, ordered lists, sets and a
//! broadcast topic. Lists have a head and a tail; new work is pushed at the
//! head and consumers pop from the tail.
//!
//! Two backends are provided:
//! - [`MemoryStore`] keeps everything in-process (tests, single-process runs)
//! - [`SqliteStore`] shares state between processes through one SQLite file

mod keys;
mod memory;
mod retry;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use keys::{DEFAULT_NAMESPACE, StoreKeys};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreOptions};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error type for store operations.
///
/// An empty list or a missing key is never an error.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            // Constraint and schema errors fail the same way every time.
            StoreError::Sqlite(err) => {
                matches!(
                    err,
                    sqlx::Error::Io(_)
                        | sqlx::Error::PoolTimedOut
                        | sqlx::Error::PoolClosed
                        | sqlx::Error::WorkerCrashed
                ) || retry::is_busy(err)
            }
            StoreError::Unavailable(_) => true,
            StoreError::InvalidUrl(_) => false,
        }
    }
}

/// List end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// Where new work is pushed.
    Head,
    /// Where consumers pop.
    Tail,
}

/// A job record plus its reference, written in one atomic step.
#[derive(Debug, Clone)]
pub struct EnqueueEntry {
    pub queue_key: String,
    pub record_key: String,
    pub ref_id: String,
    pub payload: String,
    pub end: End,
}

/// A queue reference popped together with its job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedEntry {
    pub ref_id: String,
    /// `None` when the reference had no record.
    pub payload: Option<String>,
}

/// Offer a channel to the free list.
///
/// Applied atomically: when `unclaim` is set the channel is first removed
/// from the claimed set; it is then pushed at the head of the free list only
/// if it is not claimed, not already free, and (when `backlog_key` is set)
/// that backlog list is non-empty.
#[derive(Debug, Clone)]
pub struct ChannelOffer {
    pub free_key: String,
    pub claimed_key: String,
    pub channel_id: String,
    pub unclaim: bool,
    pub backlog_key: Option<String>,
}

/// Primitive operations of the shared store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write `value` only if `key` is unset. Returns whether it was written.
    async fn put_if_absent(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically read and delete a record.
    async fn take(&self, key: &str) -> StoreResult<Option<String>>;

    /// Push onto a list, returning the new list length.
    async fn push(&self, key: &str, value: &str, end: End) -> StoreResult<usize>;

    async fn pop_tail(&self, key: &str) -> StoreResult<Option<String>>;

    /// Pop from the tail, waiting for an element.
    ///
    /// `None` waits until an element arrives or `cancel` fires,
    /// `Some(Duration::ZERO)` tries once. A popped element is never lost to
    /// cancellation: cancellation is only observed while nothing was popped.
    async fn pop_tail_blocking(
        &self,
        key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<String>>;

    async fn list_len(&self, key: &str) -> StoreResult<usize>;

    /// List contents from head to tail.
    async fn list_items(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn list_contains(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Returns false if the member was already present.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Returns false if the member was absent.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Write a job record and push its reference, returning the new list length.
    async fn enqueue_entry(&self, entry: EnqueueEntry) -> StoreResult<usize>;

    /// Pop the tail reference of `queue_key` and take its record
    /// (`StoreKeys::record`) in one atomic step. On error nothing is removed.
    async fn dequeue_entry(&self, queue_key: &str) -> StoreResult<Option<DequeuedEntry>>;

    /// [`Store::dequeue_entry`], waiting like [`Store::pop_tail_blocking`].
    async fn dequeue_entry_blocking(
        &self,
        queue_key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<DequeuedEntry>>;

    /// Returns whether the channel was pushed onto the free list.
    async fn offer_channel(&self, offer: ChannelOffer) -> StoreResult<bool>;

    /// Fire-and-forget broadcast.
    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()>;

    /// Messages published on `topic` after this call returns.
    async fn subscribe(&self, topic: &str) -> StoreResult<BoxStream<'static, String>>;
}

/// Open a store from a URL.
///
/// - `memory://` creates a fresh in-process store
/// - `sqlite:<path>` opens (or creates) a shared SQLite file
pub async fn connect(url: &str) -> StoreResult<Arc<dyn Store>> {
    if url.starts_with("memory:") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("sqlite:") {
        let store = SqliteStore::connect(url).await?;
        return Ok(Arc::new(store));
    }
    Err(StoreError::InvalidUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let store = connect("memory://").await.unwrap();
        assert_eq!(store.backend(), "memory");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("redis://localhost").await.err().unwrap();
        assert!(matches!(err, StoreError::InvalidUrl(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unavailable_is_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
    }
}
