//! In-process store backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    ChannelOffer, DequeuedEntry, End, EnqueueEntry, Store, StoreError, StoreKeys, StoreResult,
};

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 1024;

#[derive(Default)]
struct Data {
    records: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
}

impl Data {
    fn push(&mut self, key: &str, value: String, end: End) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        match end {
            End::Head => list.push_front(value),
            End::Tail => list.push_back(value),
        }
        list.len()
    }

    fn pop_tail(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_back();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn dequeue_entry(&mut self, queue_key: &str) -> Option<DequeuedEntry> {
        let ref_id = self.pop_tail(queue_key)?;
        let payload = self.records.remove(&StoreKeys::record(queue_key, &ref_id));
        Some(DequeuedEntry { ref_id, payload })
    }

    fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }

    fn list_contains(&self, key: &str, value: &str) -> bool {
        self.lists
            .get(key)
            .is_some_and(|list| list.iter().any(|item| item == value))
    }

    fn set_contains(&self, key: &str, member: &str) -> bool {
        self.sets.get(key).is_some_and(|set| set.contains(member))
    }

    fn set_remove(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }
}

/// Store backend living entirely in this process.
///
/// All data sits behind one lock, so every operation (including the
/// compound ones) is atomic. Blocking pops park on a per-list [`Notify`].
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost connection: while offline every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn waiter(&self, key: &str) -> Arc<Notify> {
        self.waiters
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, key: &str) {
        if let Some(notify) = self.waiters.lock().get(key) {
            notify.notify_waiters();
        }
    }

    /// Run `attempt` under the data lock until it yields a value, waking on
    /// pushes to `key`.
    async fn wait_for<R>(
        &self,
        key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut attempt: impl FnMut(&mut Data) -> Option<R>,
    ) -> StoreResult<Option<R>> {
        if timeout == Some(Duration::ZERO) {
            self.ensure_online()?;
            return Ok(attempt(&mut *self.data.lock()));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let notify = self.waiter(key);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_online()?;
            let found = attempt(&mut *self.data.lock());
            if found.is_some() {
                return Ok(found);
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = expired => return Ok(None),
            }
        }
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_online()?;
        self.data
            .lock()
            .records
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        Ok(self.data.lock().records.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.data.lock();
        if data.records.contains_key(key) {
            return Ok(false);
        }
        data.records.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(self.data.lock().records.remove(key).is_some())
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        Ok(self.data.lock().records.remove(key))
    }

    async fn push(&self, key: &str, value: &str, end: End) -> StoreResult<usize> {
        self.ensure_online()?;
        let len = self.data.lock().push(key, value.to_string(), end);
        self.wake(key);
        Ok(len)
    }

    async fn pop_tail(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        Ok(self.data.lock().pop_tail(key))
    }

    async fn pop_tail_blocking(
        &self,
        key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<String>> {
        self.wait_for(key, timeout, cancel, |data| data.pop_tail(key))
            .await
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        self.ensure_online()?;
        Ok(self.data.lock().list_len(key))
    }

    async fn list_items(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        Ok(self
            .data
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_contains(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(self.data.lock().list_contains(key, value))
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(self
            .data
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(self.data.lock().set_remove(key, member))
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        let mut members: Vec<String> = self
            .data
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(self.data.lock().set_contains(key, member))
    }

    async fn enqueue_entry(&self, entry: EnqueueEntry) -> StoreResult<usize> {
        self.ensure_online()?;
        let len = {
            let mut data = self.data.lock();
            data.records.insert(entry.record_key, entry.payload);
            data.push(&entry.queue_key, entry.ref_id, entry.end)
        };
        self.wake(&entry.queue_key);
        Ok(len)
    }

    async fn dequeue_entry(&self, queue_key: &str) -> StoreResult<Option<DequeuedEntry>> {
        self.ensure_online()?;
        Ok(self.data.lock().dequeue_entry(queue_key))
    }

    async fn dequeue_entry_blocking(
        &self,
        queue_key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<DequeuedEntry>> {
        self.wait_for(queue_key, timeout, cancel, |data| {
            data.dequeue_entry(queue_key)
        })
        .await
    }

    async fn offer_channel(&self, offer: ChannelOffer) -> StoreResult<bool> {
        self.ensure_online()?;
        let pushed = {
            let mut data = self.data.lock();
            if offer.unclaim {
                data.set_remove(&offer.claimed_key, &offer.channel_id);
            }

            let claimed = data.set_contains(&offer.claimed_key, &offer.channel_id);
            let already_free = data.list_contains(&offer.free_key, &offer.channel_id);
            let has_backlog = offer
                .backlog_key
                .as_deref()
                .is_none_or(|backlog| data.list_len(backlog) > 0);

            if claimed || already_free || !has_backlog {
                false
            } else {
                data.push(&offer.free_key, offer.channel_id.clone(), End::Head);
                true
            }
        };
        if pushed {
            self.wake(&offer.free_key);
        }
        Ok(pushed)
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        self.ensure_online()?;
        // No subscribers is not an error.
        let _ = self.topic(topic).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<BoxStream<'static, String>> {
        self.ensure_online()?;
        let receiver = self.topic(topic).subscribe();
        let topic = topic.to_string();

        let messages = stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}
