mod common;

use std::sync::Arc;
use std::time::Duration;

use jukebox::registry::{ChannelRegistry, ClaimAttempt, Requeue, WorkerId};
use jukebox::store::{End, MemoryStore, Store, StoreKeys};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Offer the same channel `copies` times, then let that many workers race.
async fn race_for_one_channel(store: Arc<dyn Store>, copies: usize) {
    let keys = StoreKeys::default();
    for _ in 0..copies {
        store.push(&keys.free_channels(), "c1", End::Head).await.unwrap();
    }

    let mut racers = JoinSet::new();
    for i in 0..copies {
        let registry = ChannelRegistry::new(store.clone(), keys.clone(), WorkerId::new(format!("w{i}")));
        racers.spawn(async move {
            registry
                .try_claim(Some(Duration::from_millis(200)), &CancellationToken::new())
                .await
                .unwrap()
        });
    }

    let mut claimed = 0;
    let mut contended = 0;
    while let Some(attempt) = racers.join_next().await {
        match attempt.unwrap() {
            ClaimAttempt::Claimed(claim) => {
                assert_eq!(claim.channel_id, "c1");
                claimed += 1;
            }
            ClaimAttempt::Contended(channel_id) => {
                assert_eq!(channel_id, "c1");
                contended += 1;
            }
            ClaimAttempt::Empty => {}
        }
    }

    assert_eq!(claimed, 1);
    assert_eq!(contended, copies - 1);
    assert_eq!(store.set_members(&keys.claimed_channels()).await.unwrap(), vec!["c1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_worker_claims_a_channel_memory() {
    race_for_one_channel(Arc::new(MemoryStore::new()), 6).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_worker_claims_a_channel_sqlite() {
    let (_dir, store) = common::sqlite_store().await;
    race_for_one_channel(store, 6).await;
}

#[tokio::test]
async fn test_claim_release_cycle() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let keys = StoreKeys::default();
    let registry = ChannelRegistry::new(store.clone(), keys.clone(), WorkerId::new("w1"));
    let cancel = CancellationToken::new();

    assert!(registry.mark_free("c1").await.unwrap());
    let ClaimAttempt::Claimed(claim) = registry.try_claim(Some(Duration::ZERO), &cancel).await.unwrap() else {
        panic!("expected a claim");
    };
    assert!(registry.is_claimed("c1").await.unwrap());

    // Claimed channels are not offered again.
    assert!(!registry.mark_free("c1").await.unwrap());
    assert!(registry.free_channels().await.unwrap().is_empty());

    // No backlog: released without an offer.
    assert!(!registry.release(&claim.channel_id, Requeue::IfBacklog).await.unwrap());
    assert!(!registry.is_claimed("c1").await.unwrap());
    assert!(registry.owner_of("c1").await.unwrap().is_none());

    assert!(registry.mark_free("c1").await.unwrap());
    assert_eq!(registry.free_channels().await.unwrap(), vec!["c1"]);
}

#[tokio::test]
async fn test_claim_next_returns_none_on_cancel() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = ChannelRegistry::new(store, StoreKeys::default(), WorkerId::new("w1"));
    let cancel = CancellationToken::new();

    let waiter = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { registry.claim_next(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let claim = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(claim.is_none());
}

#[tokio::test]
async fn test_recovery_only_for_the_same_worker_id() {
    let (_dir, store) = common::sqlite_store().await;
    let keys = StoreKeys::default();
    let cancel = CancellationToken::new();

    let before_crash = ChannelRegistry::new(store.clone(), keys.clone(), WorkerId::new("node-a"));
    before_crash.mark_free("c1").await.unwrap();
    let ClaimAttempt::Claimed(original) = before_crash
        .try_claim(Some(Duration::ZERO), &cancel)
        .await
        .unwrap()
    else {
        panic!("expected a claim");
    };

    let stranger = ChannelRegistry::new(store.clone(), keys.clone(), WorkerId::new("node-b"));
    assert!(stranger.owned_channels().await.unwrap().is_empty());

    let restarted = ChannelRegistry::new(store.clone(), keys.clone(), WorkerId::new("node-a"));
    let owned = restarted.owned_channels().await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].channel_id, "c1");
    assert!(owned[0].recovered);
    assert_ne!(owned[0].actor_id, original.actor_id);

    let marker = restarted.owner_of("c1").await.unwrap().unwrap();
    assert_eq!(marker.actor_id, owned[0].actor_id);
}
