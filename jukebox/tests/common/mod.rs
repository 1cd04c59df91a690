#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jukebox::config::ActorConfig;
use jukebox::retry::RetryPolicy;
use jukebox::store::{SqliteStore, Store};
use tempfile::TempDir;

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Actor settings with short timers.
pub fn fast_actor_config(idle_timeout_ms: u64) -> ActorConfig {
    ActorConfig {
        idle_timeout_ms,
        fetch_retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            use_jitter: false,
        },
        store_retry_delay_ms: 20,
    }
}

pub async fn sqlite_store() -> (TempDir, Arc<dyn Store>) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}", dir.path().join("jukebox.db").display());
    let store = SqliteStore::connect(&url).await.unwrap();
    (dir, Arc::new(store))
}
