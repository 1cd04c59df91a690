//! SQLite store backend, shared between processes through one database file.
//!
//! Writes go through a single-connection pool and compound operations use
//! `BEGIN IMMEDIATE`, so the write lock is taken up front instead of being
//! upgraded mid-transaction. Blocking pops and subscriptions poll; local
//! writers wake local waiters early.

use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::retry_on_busy;
use super::{ChannelOffer, DequeuedEntry, End, EnqueueEntry, Store, StoreKeys, StoreResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS list_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        list_key TEXT NOT NULL,
        position INTEGER NOT NULL,
        value TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_list_entry_key_position ON list_entry (list_key, position)",
    "CREATE TABLE IF NOT EXISTS set_member (
        set_key TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (set_key, member)
    )",
    "CREATE TABLE IF NOT EXISTS event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_event_topic_id ON event (topic, id)",
];

/// Maximum events fetched per subscription poll.
const EVENT_BATCH: i64 = 256;

/// Tuning knobs for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    /// How often blocking pops and subscriptions re-check the database.
    pub poll_interval: Duration,
    /// SQLite busy timeout for each connection.
    pub busy_timeout: Duration,
    /// Published events older than this are pruned.
    pub event_retention: Duration,
    /// Connections available for reads.
    pub read_pool_size: u32,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            busy_timeout: Duration::from_secs(5),
            event_retention: Duration::from_secs(600),
            read_pool_size: 4,
        }
    }
}

/// Store backend on a shared SQLite file.
///
/// In-memory SQLite URLs are not supported: the read and write pools would
/// each see their own database.
pub struct SqliteStore {
    write_pool: SqlitePool,
    read_pool: SqlitePool,
    options: SqliteStoreOptions,
    list_activity: Arc<Notify>,
    event_activity: Arc<Notify>,
}

impl SqliteStore {
    /// Open (or create) the database at `url` with default options.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with(url, SqliteStoreOptions::default()).await
    }

    pub async fn connect_with(url: &str, options: SqliteStoreOptions) -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout)
            .create_if_missing(true);

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(60))
            .connect_with(connect_options.clone())
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&write_pool).await?;
        }

        let read_pool = SqlitePoolOptions::new()
            .max_connections(options.read_pool_size.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await?;

        info!(url = %url, "SQLite store ready");

        Ok(Self {
            write_pool,
            read_pool,
            options,
            list_activity: Arc::new(Notify::new()),
            event_activity: Arc::new(Notify::new()),
        })
    }

    async fn begin_immediate(&self) -> Result<ImmediateTransaction, sqlx::Error> {
        let mut conn = self.write_pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(ImmediateTransaction::new(conn))
    }

    async fn push_once(&self, key: &str, value: &str, end: End) -> Result<usize, sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        let len = push_in(&mut tx, key, value, end).await?;
        tx.commit().await?;
        Ok(len)
    }

    async fn enqueue_entry_once(&self, entry: &EnqueueEntry) -> Result<usize, sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(&entry.record_key)
        .bind(&entry.payload)
        .execute(&mut *tx)
        .await?;
        let len = push_in(&mut tx, &entry.queue_key, &entry.ref_id, entry.end).await?;
        tx.commit().await?;
        Ok(len)
    }

    async fn dequeue_entry_once(
        &self,
        queue_key: &str,
    ) -> Result<Option<DequeuedEntry>, sqlx::Error> {
        let mut tx = self.begin_immediate().await?;

        let tail: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, value FROM list_entry WHERE list_key = ? ORDER BY position DESC LIMIT 1",
        )
        .bind(queue_key)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((id, ref_id)) = tail else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("DELETE FROM list_entry WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let payload: Option<String> =
            sqlx::query_scalar("DELETE FROM kv WHERE key = ? RETURNING value")
                .bind(StoreKeys::record(queue_key, &ref_id))
                .fetch_optional(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(Some(DequeuedEntry { ref_id, payload }))
    }

    /// Call `attempt` until it yields a value, polling at the configured
    /// interval and waking early on local list writes.
    async fn poll_for<R, F, Fut>(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> StoreResult<Option<R>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<Option<R>>>,
    {
        if timeout == Some(Duration::ZERO) {
            return attempt().await;
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.list_activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = attempt().await? {
                return Ok(Some(value));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(self.options.poll_interval)
                }
                None => self.options.poll_interval,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn offer_channel_once(&self, offer: &ChannelOffer) -> Result<bool, sqlx::Error> {
        let mut tx = self.begin_immediate().await?;

        if offer.unclaim {
            sqlx::query("DELETE FROM set_member WHERE set_key = ? AND member = ?")
                .bind(&offer.claimed_key)
                .bind(&offer.channel_id)
                .execute(&mut *tx)
                .await?;
        }

        let claimed: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM set_member WHERE set_key = ? AND member = ?)",
        )
        .bind(&offer.claimed_key)
        .bind(&offer.channel_id)
        .fetch_one(&mut *tx)
        .await?;

        let already_free: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM list_entry WHERE list_key = ? AND value = ?)",
        )
        .bind(&offer.free_key)
        .bind(&offer.channel_id)
        .fetch_one(&mut *tx)
        .await?;

        let has_backlog = match &offer.backlog_key {
            Some(backlog) => {
                let len: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM list_entry WHERE list_key = ?")
                        .bind(backlog)
                        .fetch_one(&mut *tx)
                        .await?;
                len > 0
            }
            None => true,
        };

        let pushed = !claimed && !already_free && has_backlog;
        if pushed {
            push_in(&mut tx, &offer.free_key, &offer.channel_id, End::Head).await?;
        }

        tx.commit().await?;
        Ok(pushed)
    }

    async fn publish_once(&self, topic: &str, payload: &str) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query("INSERT INTO event (topic, payload, created_at) VALUES (?, ?, ?)")
            .bind(topic)
            .bind(payload)
            .bind(now)
            .execute(&self.write_pool)
            .await?;

        let cutoff = now - self.options.event_retention.as_millis() as i64;
        let pruned = sqlx::query("DELETE FROM event WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.write_pool)
            .await?
            .rows_affected();
        if pruned > 0 {
            debug!(pruned, "Pruned expired events");
        }
        Ok(())
    }
}

async fn push_in(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
    end: End,
) -> Result<usize, sqlx::Error> {
    let statement = match end {
        End::Head => {
            "INSERT INTO list_entry (list_key, position, value)
             SELECT ?, COALESCE(MIN(position), 1) - 1, ? FROM list_entry WHERE list_key = ?"
        }
        End::Tail => {
            "INSERT INTO list_entry (list_key, position, value)
             SELECT ?, COALESCE(MAX(position), -1) + 1, ? FROM list_entry WHERE list_key = ?"
        }
    };
    sqlx::query(statement)
        .bind(key)
        .bind(value)
        .bind(key)
        .execute(&mut *conn)
        .await?;

    let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_entry WHERE list_key = ?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    Ok(len as usize)
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        retry_on_busy("put", || {
            sqlx::query(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.write_pool)
        })
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(value)
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        let result = retry_on_busy("put_if_absent", || {
            sqlx::query("INSERT OR IGNORE INTO kv (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.write_pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = retry_on_busy("delete", || {
            sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&self.write_pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        let value = retry_on_busy("take", || {
            sqlx::query_scalar("DELETE FROM kv WHERE key = ? RETURNING value")
                .bind(key)
                .fetch_optional(&self.write_pool)
        })
        .await?;
        Ok(value)
    }

    async fn push(&self, key: &str, value: &str, end: End) -> StoreResult<usize> {
        let len = retry_on_busy("push", || self.push_once(key, value, end)).await?;
        self.list_activity.notify_waiters();
        Ok(len)
    }

    async fn pop_tail(&self, key: &str) -> StoreResult<Option<String>> {
        let value = retry_on_busy("pop_tail", || {
            sqlx::query_scalar(
                "DELETE FROM list_entry WHERE id = (
                    SELECT id FROM list_entry WHERE list_key = ? ORDER BY position DESC LIMIT 1
                 ) RETURNING value",
            )
            .bind(key)
            .fetch_optional(&self.write_pool)
        })
        .await?;
        Ok(value)
    }

    async fn pop_tail_blocking(
        &self,
        key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<String>> {
        self.poll_for(timeout, cancel, || self.pop_tail(key)).await
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_entry WHERE list_key = ?")
            .bind(key)
            .fetch_one(&self.read_pool)
            .await?;
        Ok(len as usize)
    }

    async fn list_items(&self, key: &str) -> StoreResult<Vec<String>> {
        let items = sqlx::query_scalar(
            "SELECT value FROM list_entry WHERE list_key = ? ORDER BY position ASC",
        )
        .bind(key)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(items)
    }

    async fn list_contains(&self, key: &str, value: &str) -> StoreResult<bool> {
        let found = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM list_entry WHERE list_key = ? AND value = ?)",
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.read_pool)
        .await?;
        Ok(found)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let result = retry_on_busy("set_add", || {
            sqlx::query("INSERT OR IGNORE INTO set_member (set_key, member) VALUES (?, ?)")
                .bind(key)
                .bind(member)
                .execute(&self.write_pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let result = retry_on_busy("set_remove", || {
            sqlx::query("DELETE FROM set_member WHERE set_key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&self.write_pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let members =
            sqlx::query_scalar("SELECT member FROM set_member WHERE set_key = ? ORDER BY member")
                .bind(key)
                .fetch_all(&self.read_pool)
                .await?;
        Ok(members)
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let found = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM set_member WHERE set_key = ? AND member = ?)",
        )
        .bind(key)
        .bind(member)
        .fetch_one(&self.read_pool)
        .await?;
        Ok(found)
    }

    async fn enqueue_entry(&self, entry: EnqueueEntry) -> StoreResult<usize> {
        let entry = &entry;
        let len = retry_on_busy("enqueue_entry", move || self.enqueue_entry_once(entry)).await?;
        self.list_activity.notify_waiters();
        Ok(len)
    }

    async fn dequeue_entry(&self, queue_key: &str) -> StoreResult<Option<DequeuedEntry>> {
        let entry = retry_on_busy("dequeue_entry", || self.dequeue_entry_once(queue_key)).await?;
        Ok(entry)
    }

    async fn dequeue_entry_blocking(
        &self,
        queue_key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<DequeuedEntry>> {
        self.poll_for(timeout, cancel, || self.dequeue_entry(queue_key))
            .await
    }

    async fn offer_channel(&self, offer: ChannelOffer) -> StoreResult<bool> {
        let offer = &offer;
        let pushed = retry_on_busy("offer_channel", move || self.offer_channel_once(offer)).await?;
        if pushed {
            self.list_activity.notify_waiters();
        }
        Ok(pushed)
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        retry_on_busy("publish", || self.publish_once(topic, payload)).await?;
        self.event_activity.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<BoxStream<'static, String>> {
        let high_water: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM event")
            .fetch_one(&self.read_pool)
            .await?;

        let cursor = EventCursor {
            pool: self.read_pool.clone(),
            topic: topic.to_string(),
            last_id: high_water,
            pending: VecDeque::new(),
            poll_interval: self.options.poll_interval,
            activity: self.event_activity.clone(),
        };

        let messages = stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(message) = cursor.pending.pop_front() {
                    return Some((message, cursor));
                }

                let activity = cursor.activity.clone();
                let notified = activity.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match cursor.fetch().await {
                    Ok(0) => {}
                    Ok(_) => continue,
                    Err(e) => warn!(topic = %cursor.topic, error = %e, "Failed to poll events"),
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(cursor.poll_interval) => {}
                }
            }
        });

        Ok(messages.boxed())
    }
}

/// Read position of one subscription.
struct EventCursor {
    pool: SqlitePool,
    topic: String,
    last_id: i64,
    pending: VecDeque<String>,
    poll_interval: Duration,
    activity: Arc<Notify>,
}

impl EventCursor {
    async fn fetch(&mut self) -> Result<usize, sqlx::Error> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, payload FROM event WHERE topic = ? AND id > ? ORDER BY id LIMIT ?",
        )
        .bind(&self.topic)
        .bind(self.last_id)
        .bind(EVENT_BATCH)
        .fetch_all(&self.pool)
        .await?;

        let fetched = rows.len();
        for (id, payload) in rows {
            self.last_id = id;
            self.pending.push_back(payload);
        }
        Ok(fetched)
    }
}

/// A manual `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Dropping it without commit or rollback closes the connection, which
/// rolls the transaction back.
struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("store.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_records() {
        let (_dir, store) = open().await;
        store.put("k", "v1").await.unwrap();
        store.put("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(!store.put_if_absent("k", "v3").await.unwrap());
        assert_eq!(store.take("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(store.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_orientation() {
        let (_dir, store) = open().await;
        store.push("list", "a", End::Head).await.unwrap();
        store.push("list", "b", End::Head).await.unwrap();
        assert_eq!(store.push("list", "z", End::Tail).await.unwrap(), 3);
        assert_eq!(store.list_items("list").await.unwrap(), vec!["b", "a", "z"]);
        assert_eq!(store.pop_tail("list").await.unwrap().as_deref(), Some("z"));
        assert_eq!(store.pop_tail("list").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop_tail("list").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop_tail("list").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_entry_writes_record_and_ref() {
        let (_dir, store) = open().await;
        let len = store
            .enqueue_entry(EnqueueEntry {
                queue_key: "q".into(),
                record_key: "q-entry:1".into(),
                ref_id: "1".into(),
                payload: "{}".into(),
                end: End::Head,
            })
            .await
            .unwrap();
        assert_eq!(len, 1);
        assert_eq!(store.get("q-entry:1").await.unwrap().as_deref(), Some("{}"));
        assert!(store.list_contains("q", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dequeue_entry_takes_reference_and_record() {
        let (_dir, store) = open().await;
        for ref_id in ["1", "2"] {
            store
                .enqueue_entry(EnqueueEntry {
                    queue_key: "q".into(),
                    record_key: StoreKeys::record("q", ref_id),
                    ref_id: ref_id.into(),
                    payload: format!("job-{ref_id}"),
                    end: End::Head,
                })
                .await
                .unwrap();
        }
        store.push("q", "orphan", End::Tail).await.unwrap();

        let orphan = store.dequeue_entry("q").await.unwrap().unwrap();
        assert_eq!(orphan.ref_id, "orphan");
        assert_eq!(orphan.payload, None);

        let first = store.dequeue_entry("q").await.unwrap().unwrap();
        assert_eq!(first.ref_id, "1");
        assert_eq!(first.payload.as_deref(), Some("job-1"));
        assert_eq!(store.get(&StoreKeys::record("q", "1")).await.unwrap(), None);
        assert_eq!(store.list_items("q").await.unwrap(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_blocking_dequeue_entry_times_out() {
        let (_dir, store) = open().await;
        let cancel = CancellationToken::new();
        let entry = store
            .dequeue_entry_blocking("q", Some(Duration::from_millis(100)), &cancel)
            .await
            .unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_offer_channel_skips_claimed() {
        let (_dir, store) = open().await;
        store.set_add("claimed", "c1").await.unwrap();
        let offer = ChannelOffer {
            free_key: "free".into(),
            claimed_key: "claimed".into(),
            channel_id: "c1".into(),
            unclaim: false,
            backlog_key: None,
        };
        assert!(!store.offer_channel(offer.clone()).await.unwrap());

        let release = ChannelOffer {
            unclaim: true,
            ..offer
        };
        assert!(store.offer_channel(release.clone()).await.unwrap());
        assert!(!store.offer_channel(release).await.unwrap());
        assert_eq!(store.list_items("free").await.unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_constraint_and_schema_errors_are_not_transient() {
        let (_dir, store) = open().await;
        let insert = "INSERT INTO set_member (set_key, member) VALUES ('s', 'a')";
        sqlx::query(insert).execute(&store.write_pool).await.unwrap();

        let duplicate = sqlx::query(insert)
            .execute(&store.write_pool)
            .await
            .unwrap_err();
        assert!(!StoreError::from(duplicate).is_transient());

        let missing = sqlx::query("SELECT * FROM no_such_table")
            .fetch_all(&store.read_pool)
            .await
            .err()
            .unwrap();
        assert!(!StoreError::from(missing).is_transient());
    }

    #[tokio::test]
    async fn test_blocking_pop_sees_push() {
        let (_dir, store) = open().await;
        let store = Arc::new(store);
        let producer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push("list", "a", End::Head).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let value = store
            .pop_tail_blocking("list", Some(Duration::from_secs(5)), &cancel)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_subscribe_only_sees_new_events() {
        let (_dir, store) = open().await;
        store.publish("topic", "old").await.unwrap();

        let mut events = store.subscribe("topic").await.unwrap();
        store.publish("other", "ignored").await.unwrap();
        store.publish("topic", "new").await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap();
        assert_eq!(next.as_deref(), Some("new"));
    }
}
