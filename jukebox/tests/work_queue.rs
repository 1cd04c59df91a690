mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jukebox::queue::{DequeueCount, WorkQueue};
use jukebox::store::{MemoryStore, Store};
use jukebox::track::Track;

fn track_ids(items: Vec<jukebox::queue::DequeueItem<Track>>) -> Vec<String> {
    items
        .into_iter()
        .filter_map(|item| item.into_job())
        .map(|track| track.track_id)
        .collect()
}

async fn check_fifo_with_front(store: Arc<dyn Store>) {
    let queue: WorkQueue<Track> = WorkQueue::new(store);
    for id in ["a", "b", "c"] {
        assert!(queue.enqueue("q", &Track::new(id, id), false).await.is_ok());
    }
    let response = queue.enqueue("q", &Track::new("urgent", "urgent"), true).await;
    assert_eq!(response.ref_position, Some(4));

    let items = queue.dequeue("q", DequeueCount::All, None).await;
    assert_eq!(track_ids(items), vec!["urgent", "a", "b", "c"]);
    assert!(queue.is_empty("q").await.unwrap());
}

#[tokio::test]
async fn test_fifo_with_front_memory() {
    check_fifo_with_front(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_fifo_with_front_sqlite() {
    let (_dir, store) = common::sqlite_store().await;
    check_fifo_with_front(store).await;
}

#[tokio::test]
async fn test_blocking_dequeue_wakes_on_enqueue() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue: WorkQueue<Track> = WorkQueue::new(store);

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .dequeue("q", DequeueCount::Limit(1), Some(Duration::from_secs(5)))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.enqueue("q", &Track::new("late", "Late"), false).await;

    let items = consumer.await.unwrap();
    assert_eq!(track_ids(items), vec!["late"]);
}

#[tokio::test]
async fn test_blocking_dequeue_times_out_sqlite() {
    let (_dir, store) = common::sqlite_store().await;
    let queue: WorkQueue<Track> = WorkQueue::new(store);

    let started = tokio::time::Instant::now();
    let items = queue
        .dequeue("q", DequeueCount::Limit(1), Some(Duration::from_millis(100)))
        .await;
    assert!(items.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_never_share_a_job() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue: WorkQueue<Track> = WorkQueue::new(store);
    for i in 0..100 {
        queue
            .enqueue("q", &Track::new(format!("t{i}"), "T"), false)
            .await;
    }

    let mut consumers = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        consumers.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            loop {
                let items = queue.dequeue("q", DequeueCount::Limit(3), None).await;
                if items.is_empty() {
                    break;
                }
                taken.extend(track_ids(items));
            }
            taken
        }));
    }

    let mut seen = HashSet::new();
    for consumer in consumers {
        for id in consumer.await.unwrap() {
            assert!(seen.insert(id), "job delivered twice");
        }
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn test_dequeue_all_takes_a_snapshot_of_the_length() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue: WorkQueue<Track> = WorkQueue::new(store);
    for id in ["a", "b"] {
        queue.enqueue("q", &Track::new(id, id), false).await;
    }

    let items = queue.dequeue("q", DequeueCount::All, None).await;
    assert_eq!(items.len(), 2);

    queue.enqueue("q", &Track::new("c", "c"), false).await;
    let items = queue.dequeue("q", DequeueCount::All, None).await;
    assert_eq!(track_ids(items), vec!["c"]);
}

async fn check_all_ignores_jobs_enqueued_during_the_call(store: Arc<dyn Store>) {
    let queue: WorkQueue<Track> = WorkQueue::new(store);
    for i in 0..5 {
        queue
            .enqueue("q", &Track::new(format!("t{i}"), "T"), false)
            .await;
    }

    // Enqueue two more once the draining call has started popping.
    let late = {
        let queue = queue.clone();
        tokio::spawn(async move {
            while queue.len("q").await.unwrap() >= 5 {
                tokio::task::yield_now().await;
            }
            for id in ["late-1", "late-2"] {
                queue.enqueue("q", &Track::new(id, id), false).await;
            }
        })
    };

    let items = queue
        .dequeue("q", DequeueCount::All, Some(Duration::from_secs(1)))
        .await;
    late.await.unwrap();

    assert_eq!(track_ids(items), vec!["t0", "t1", "t2", "t3", "t4"]);
    assert_eq!(queue.len("q").await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dequeue_all_with_concurrent_enqueues_memory() {
    check_all_ignores_jobs_enqueued_during_the_call(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dequeue_all_with_concurrent_enqueues_sqlite() {
    let (_dir, store) = common::sqlite_store().await;
    check_all_ignores_jobs_enqueued_during_the_call(store).await;
}
