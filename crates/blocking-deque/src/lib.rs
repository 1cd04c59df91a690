//! Async double-ended queue with a blocking pop.
//!
//! `BlockingDeque` is a plain deque (O(1) push/pop at both ends) plus one
//! extra operation, [`BlockingDeque::blocking_pop_back`], which suspends the
//! calling task until an element arrives, a timeout elapses, or the deque is
//! aborted with [`BlockingDeque::abort_blocks`].
//!
//! Blocking pops are serialized through an internal async lock: at most one
//! waiter is parked on the element notification at a time, so concurrent
//! waiters never race for the same element.
//!
//! # Abort semantics
//!
//! `abort_blocks` makes every waiter that is currently parked (or queued
//! behind the internal lock) return `None`. If nobody is waiting, the next
//! call to `blocking_pop_back` returns `None` immediately instead. The abort
//! is consumed by whichever waiter returns because of it, so a fresh wait
//! after that behaves normally again.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// A deque shared between producers and a single logical consumer.
pub struct BlockingDeque<T> {
    items: Mutex<VecDeque<T>>,
    /// Signalled once per push, and for every waiter on abort.
    available: Notify,
    /// Serializes blocking pops.
    wait_turn: tokio::sync::Mutex<()>,
    /// Bumped by every `abort_blocks` call.
    abort_epoch: AtomicU64,
    /// Set by `abort_blocks`, consumed by the first waiter that honours it.
    abort_pending: AtomicBool,
}

impl<T> BlockingDeque<T> {
    /// Create an empty deque.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty deque with room for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
            wait_turn: tokio::sync::Mutex::new(()),
            abort_epoch: AtomicU64::new(0),
            abort_pending: AtomicBool::new(false),
        }
    }

    /// Push an element at the front. Never blocks; wakes one waiter.
    pub fn push_front(&self, value: T) {
        self.items.lock().push_front(value);
        self.available.notify_one();
    }

    /// Push an element at the back. Never blocks; wakes one waiter.
    pub fn push_back(&self, value: T) {
        self.items.lock().push_back(value);
        self.available.notify_one();
    }

    /// Remove the front element, if any.
    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Remove the back element, if any.
    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the deque is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued element, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let removed = items.len();
        items.clear();
        removed
    }

    /// Pop the back element, waiting for one if the deque is empty.
    ///
    /// - `None` timeout waits until an element arrives or the deque is aborted.
    /// - `Some(Duration::ZERO)` never waits.
    /// - `Some(t)` waits at most `t`.
    ///
    /// Returns `None` on timeout or abort.
    pub async fn blocking_pop_back(&self, timeout: Option<Duration>) -> Option<T> {
        let epoch = self.abort_epoch.load(Ordering::Acquire);
        let _turn = self.wait_turn.lock().await;

        if self.aborted_since(epoch) || self.abort_pending.swap(false, Ordering::AcqRel) {
            self.abort_pending.store(false, Ordering::Release);
            trace!("blocking pop aborted before waiting");
            return None;
        }

        if timeout == Some(Duration::ZERO) {
            return self.pop_back();
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before checking, so a push between the check
            // and the await is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.aborted_since(epoch) {
                self.abort_pending.store(false, Ordering::Release);
                trace!("blocking pop aborted while waiting");
                return None;
            }

            if let Some(value) = self.pop_back() {
                return Some(value);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Force current and immediately-subsequent blocking pops to return `None`.
    pub fn abort_blocks(&self) {
        self.abort_epoch.fetch_add(1, Ordering::AcqRel);
        self.abort_pending.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    fn aborted_since(&self, epoch: u64) -> bool {
        self.abort_epoch.load(Ordering::Acquire) != epoch
    }
}

impl<T> Default for BlockingDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BlockingDeque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingDeque")
            .field("len", &self.len())
            .field("abort_epoch", &self.abort_epoch.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    fn load(deque: &BlockingDeque<u32>, count: u32, front: bool) {
        for i in 0..count {
            if front {
                deque.push_front(i);
            } else {
                deque.push_back(i);
            }
        }
    }

    #[test]
    fn test_new_deque_is_empty() {
        let deque: BlockingDeque<u32> = BlockingDeque::new();
        assert!(deque.is_empty());
        assert_eq!(deque.len(), 0);
        assert_eq!(deque.pop_back(), None);
        assert_eq!(deque.pop_front(), None);
    }

    #[test]
    fn test_push_front_pop_front_is_lifo() {
        for count in [1, 3, 6] {
            let deque = BlockingDeque::new();
            load(&deque, count, true);
            assert_eq!(deque.len(), count as usize);
            for i in (0..count).rev() {
                assert_eq!(deque.pop_front(), Some(i));
            }
            assert!(deque.is_empty());
        }
    }

    #[test]
    fn test_push_front_pop_back_is_fifo() {
        for count in [1, 3, 6] {
            let deque = BlockingDeque::new();
            load(&deque, count, true);
            for i in 0..count {
                assert_eq!(deque.pop_back(), Some(i));
            }
            assert!(deque.is_empty());
        }
    }

    #[test]
    fn test_push_back_pop_front_is_fifo() {
        let deque = BlockingDeque::new();
        load(&deque, 6, false);
        for i in 0..6 {
            assert_eq!(deque.pop_front(), Some(i));
        }
        assert_eq!(deque.pop_front(), None);
    }

    #[test]
    fn test_last_pop_resets_both_ends() {
        let deque = BlockingDeque::new();
        deque.push_back(7);
        assert_eq!(deque.pop_front(), Some(7));
        assert_eq!(deque.pop_back(), None);

        // Works again from both ends after being emptied.
        deque.push_front(1);
        deque.push_back(2);
        assert_eq!(deque.pop_back(), Some(2));
        assert_eq!(deque.pop_back(), Some(1));
        assert!(deque.is_empty());
    }

    #[test]
    fn test_clear() {
        let deque = BlockingDeque::new();
        load(&deque, 4, false);
        assert_eq!(deque.clear(), 4);
        assert!(deque.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_pop_returns_available_element() {
        let deque = BlockingDeque::new();
        deque.push_front(42);
        assert_eq!(deque.blocking_pop_back(Some(Duration::from_secs(1))).await, Some(42));
    }

    #[tokio::test]
    async fn test_zero_timeout_does_not_wait() {
        let deque: BlockingDeque<u32> = BlockingDeque::new();
        let start = StdInstant::now();
        assert_eq!(deque.blocking_pop_back(Some(Duration::ZERO)).await, None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocking_pop_times_out() {
        let deque: BlockingDeque<u32> = BlockingDeque::new();
        let start = StdInstant::now();
        let result = deque.blocking_pop_back(Some(Duration::from_millis(300))).await;
        let elapsed = start.elapsed();

        assert_eq!(result, None);
        assert!(elapsed >= Duration::from_millis(290), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "returned late: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let deque = Arc::new(BlockingDeque::new());
        let producer = deque.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer.push_front(5u32);
        });

        let start = StdInstant::now();
        let result = deque.blocking_pop_back(Some(Duration::from_secs(2))).await;
        assert_eq!(result, Some(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_blocking_pop_without_timeout_waits_for_push() {
        let deque = Arc::new(BlockingDeque::new());
        let producer = deque.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push_back(9u32);
        });

        assert_eq!(deque.blocking_pop_back(None).await, Some(9));
    }

    #[tokio::test]
    async fn test_abort_unblocks_current_waiter() {
        let deque: Arc<BlockingDeque<u32>> = Arc::new(BlockingDeque::new());
        let waiter = deque.clone();
        let start = StdInstant::now();
        let task = tokio::spawn(async move { waiter.blocking_pop_back(Some(Duration::from_secs(10))).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        deque.abort_blocks();

        let result = task.await.unwrap();
        assert_eq!(result, None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_abort_unblocks_every_queued_waiter() {
        let deque: Arc<BlockingDeque<u32>> = Arc::new(BlockingDeque::new());
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let waiter = deque.clone();
            tasks.push(tokio::spawn(async move { waiter.blocking_pop_back(None).await }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        deque.abort_blocks();

        for task in tasks {
            let result = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("waiter stayed blocked after abort")
                .unwrap();
            assert_eq!(result, None);
        }
    }

    #[tokio::test]
    async fn test_abort_before_wait_affects_only_next_wait() {
        let deque = BlockingDeque::new();
        deque.abort_blocks();
        deque.push_front(1u32);

        // The pending abort wins even though an element is available.
        assert_eq!(deque.blocking_pop_back(Some(Duration::from_secs(1))).await, None);
        // A fresh wait behaves normally again.
        assert_eq!(deque.blocking_pop_back(Some(Duration::from_secs(1))).await, Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_receive_distinct_elements() {
        let deque: Arc<BlockingDeque<u32>> = Arc::new(BlockingDeque::new());
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let waiter = deque.clone();
            tasks.push(tokio::spawn(async move {
                waiter.blocking_pop_back(Some(Duration::from_secs(2))).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        deque.push_front(1);
        deque.push_front(2);

        let mut received = Vec::new();
        for task in tasks {
            received.push(task.await.unwrap());
        }
        received.sort();
        assert_eq!(received, vec![Some(1), Some(2)]);
        assert!(deque.is_empty());
    }
}
