//! Durable FIFO work queue on top of the shared store.
//!
//! Each job is written as its own record (`<queueKey>-entry:<refId>`) and the
//! queue list only holds the ordered reference ids. Enqueue writes the record
//! and pushes its reference in one atomic store operation. Dequeue pops a
//! reference from the tail and takes its record in one atomic operation as
//! well, so a store failure during dequeue leaves the job queued.
//!
//! Failures are reported per operation, never thrown past the caller's loop:
//! [`WorkQueue::enqueue`] returns an [`EnqueueResponse`] and
//! [`WorkQueue::dequeue`] returns one [`DequeueItem`] per unit.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::store::{End, EnqueueEntry, Store, StoreError, StoreKeys};

/// Error for a single enqueue or dequeue unit.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to serialize job: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("reference {ref_id} has no record")]
    MissingRecord { ref_id: String },

    #[error("record for reference {ref_id} is malformed: {reason}")]
    MalformedRecord { ref_id: String, reason: String },
}

impl QueueError {
    /// Whether the same operation may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// How many units a dequeue call takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueCount {
    /// At most this many.
    Limit(usize),
    /// The queue length observed when the call starts. Jobs enqueued while the
    /// call is running are left for the next call.
    All,
}

/// Outcome of one enqueue.
#[derive(Debug)]
pub struct EnqueueResponse {
    pub record_key: String,
    pub ref_id: String,
    pub record_written: bool,
    /// Queue length after the push.
    pub ref_position: Option<usize>,
    pub error: Option<QueueError>,
}

impl EnqueueResponse {
    pub fn is_ok(&self) -> bool {
        self.record_written && self.error.is_none()
    }

    /// Store failures are retryable, invalid payloads are not.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(QueueError::is_retryable)
    }
}

/// One dequeued unit.
#[derive(Debug)]
pub struct DequeueItem<T> {
    /// `None` when the failure happened before a reference was popped.
    pub ref_id: Option<String>,
    pub outcome: Result<T, QueueError>,
}

impl<T> DequeueItem<T> {
    pub fn job(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn into_job(self) -> Option<T> {
        self.outcome.ok()
    }
}

/// Typed view over queues of `T` in a shared store.
pub struct WorkQueue<T> {
    store: Arc<dyn Store>,
    _job: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _job: PhantomData,
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            _job: PhantomData,
        }
    }

    /// Append a job, or put it next in line when `front` is set.
    pub async fn enqueue(&self, queue_key: &str, job: &T, front: bool) -> EnqueueResponse {
        let ref_id = Uuid::new_v4().to_string();
        let record_key = StoreKeys::record(queue_key, &ref_id);

        let payload = match serde_json::to_string(job) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(queue = %queue_key, error = %e, "Rejected job that cannot be serialized");
                return EnqueueResponse {
                    record_key,
                    ref_id,
                    record_written: false,
                    ref_position: None,
                    error: Some(QueueError::Serialization(e)),
                };
            }
        };

        let entry = EnqueueEntry {
            queue_key: queue_key.to_string(),
            record_key: record_key.clone(),
            ref_id: ref_id.clone(),
            payload,
            end: if front { End::Tail } else { End::Head },
        };

        match self.store.enqueue_entry(entry).await {
            Ok(len) => {
                debug!(queue = %queue_key, ref_id = %ref_id, front, len, "Job enqueued");
                EnqueueResponse {
                    record_key,
                    ref_id,
                    record_written: true,
                    ref_position: Some(len),
                    error: None,
                }
            }
            Err(e) => {
                error!(queue = %queue_key, ref_id = %ref_id, error = %e, "Failed to enqueue job");
                EnqueueResponse {
                    record_key,
                    ref_id,
                    record_written: false,
                    ref_position: None,
                    error: Some(QueueError::Store(e)),
                }
            }
        }
    }

    /// Append several jobs in order.
    pub async fn enqueue_many(&self, queue_key: &str, jobs: &[T]) -> Vec<EnqueueResponse> {
        let mut responses = Vec::with_capacity(jobs.len());
        for job in jobs {
            responses.push(self.enqueue(queue_key, job, false).await);
        }
        responses
    }

    /// Take jobs from the tail of a queue.
    ///
    /// - `timeout = None` never blocks: only what is immediately available
    /// - `Some(Duration::ZERO)` tries once per unit
    /// - `Some(t)` waits up to `t` for each unit
    ///
    /// The batch stops at the first empty pop or store failure.
    pub async fn dequeue(
        &self,
        queue_key: &str,
        count: DequeueCount,
        timeout: Option<Duration>,
    ) -> Vec<DequeueItem<T>> {
        self.dequeue_until(queue_key, count, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`WorkQueue::dequeue`], but any wait ends early when `cancel` fires.
    pub async fn dequeue_until(
        &self,
        queue_key: &str,
        count: DequeueCount,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Vec<DequeueItem<T>> {
        let count = match count {
            DequeueCount::Limit(n) => n,
            DequeueCount::All => match self.store.list_len(queue_key).await {
                Ok(len) => len,
                Err(e) => {
                    warn!(queue = %queue_key, error = %e, "Failed to read queue length");
                    return vec![DequeueItem {
                        ref_id: None,
                        outcome: Err(QueueError::Store(e)),
                    }];
                }
            },
        };

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let popped = match timeout {
                None => self.store.dequeue_entry(queue_key).await,
                Some(wait) => {
                    self.store
                        .dequeue_entry_blocking(queue_key, Some(wait), cancel)
                        .await
                }
            };

            let entry = match popped {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(queue = %queue_key, error = %e, "Failed to dequeue job");
                    items.push(DequeueItem {
                        ref_id: None,
                        outcome: Err(QueueError::Store(e)),
                    });
                    break;
                }
            };

            let outcome = Self::decode(queue_key, &entry.ref_id, entry.payload);
            items.push(DequeueItem {
                ref_id: Some(entry.ref_id),
                outcome,
            });
        }
        items
    }

    /// Number of queued references.
    pub async fn len(&self, queue_key: &str) -> Result<usize, QueueError> {
        Ok(self.store.list_len(queue_key).await?)
    }

    pub async fn is_empty(&self, queue_key: &str) -> Result<bool, QueueError> {
        Ok(self.len(queue_key).await? == 0)
    }

    fn decode(queue_key: &str, ref_id: &str, payload: Option<String>) -> Result<T, QueueError> {
        let Some(payload) = payload else {
            error!(queue = %queue_key, ref_id = %ref_id, "Queue reference has no record");
            return Err(QueueError::MissingRecord {
                ref_id: ref_id.to_string(),
            });
        };

        serde_json::from_str(&payload).map_err(|e| {
            error!(queue = %queue_key, ref_id = %ref_id, error = %e, "Discarding malformed record");
            QueueError::MalformedRecord {
                ref_id: ref_id.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        name: String,
    }

    fn job(name: &str) -> Job {
        Job { name: name.into() }
    }

    fn queue() -> (Arc<MemoryStore>, WorkQueue<Job>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), WorkQueue::new(store))
    }

    fn names(items: Vec<DequeueItem<Job>>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| item.into_job().unwrap().name)
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_reports_position() {
        let (_, queue) = queue();
        let first = queue.enqueue("q", &job("a"), false).await;
        let second = queue.enqueue("q", &job("b"), false).await;
        assert!(first.is_ok());
        assert_eq!(first.ref_position, Some(1));
        assert_eq!(second.ref_position, Some(2));
        assert_eq!(second.record_key, format!("q-entry:{}", second.ref_id));
    }

    #[tokio::test]
    async fn test_dequeue_limit_and_empty() {
        let (_, queue) = queue();
        queue.enqueue_many("q", &[job("a"), job("b"), job("c")]).await;

        let items = queue.dequeue("q", DequeueCount::Limit(2), None).await;
        assert_eq!(names(items), vec!["a", "b"]);

        let items = queue.dequeue("q", DequeueCount::Limit(5), None).await;
        assert_eq!(names(items), vec!["c"]);

        assert!(queue.dequeue("q", DequeueCount::Limit(1), None).await.is_empty());
        assert!(
            queue
                .dequeue("q", DequeueCount::Limit(1), Some(Duration::ZERO))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_missing_record_is_reported_per_item() {
        let (store, queue) = queue();
        queue.enqueue("q", &job("a"), false).await;
        store.push("q", "orphan", End::Head).await.unwrap();
        queue.enqueue("q", &job("b"), false).await;

        let items = queue.dequeue("q", DequeueCount::All, None).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].job().unwrap().name, "a");
        assert!(matches!(
            &items[1].outcome,
            Err(QueueError::MissingRecord { ref_id }) if ref_id == "orphan"
        ));
        assert_eq!(items[2].job().unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_malformed_record_is_reported_per_item() {
        let (store, queue) = queue();
        store.put("q-entry:bad", "{\"other\":1}").await.unwrap();
        store.push("q", "bad", End::Head).await.unwrap();

        let items = queue.dequeue("q", DequeueCount::Limit(1), None).await;
        assert!(matches!(
            &items[0].outcome,
            Err(QueueError::MalformedRecord { .. })
        ));
        // The malformed record is consumed, not retried forever.
        assert_eq!(store.get("q-entry:bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable_error() {
        let (store, queue) = queue();
        store.set_offline(true);

        let response = queue.enqueue("q", &job("a"), false).await;
        assert!(!response.record_written);
        assert!(response.is_retryable());

        let items = queue.dequeue("q", DequeueCount::Limit(3), None).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].ref_id.is_none());
        assert!(matches!(items[0].outcome, Err(QueueError::Store(_))));
    }

    #[tokio::test]
    async fn test_failed_dequeue_leaves_the_job_queued() {
        let (store, queue) = queue();
        let response = queue.enqueue("q", &job("a"), false).await;

        store.set_offline(true);
        let items = queue.dequeue("q", DequeueCount::Limit(1), None).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].outcome.as_ref().is_err_and(QueueError::is_retryable));
        store.set_offline(false);

        assert_eq!(queue.len("q").await.unwrap(), 1);
        let items = queue.dequeue("q", DequeueCount::All, None).await;
        assert_eq!(names(items), vec!["a"]);
        assert_eq!(store.get(&response.record_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocking_dequeue_is_cancellable() {
        let (_, queue) = queue();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let items = queue
            .dequeue_until(
                "q",
                DequeueCount::Limit(1),
                Some(Duration::from_secs(30)),
                &cancel,
            )
            .await;
        assert!(items.is_empty());
    }
}
