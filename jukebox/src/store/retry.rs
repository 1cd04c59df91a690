//! Lock contention handling for SQLite writes.

use std::future::Future;

use tracing::debug;

use crate::retry::RetryPolicy;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Backoff while another connection holds the write lock.
const BUSY_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 12,
    initial_delay_ms: 10,
    max_delay_ms: 2_000,
    backoff_multiplier: 2.0,
    use_jitter: true,
};

/// Whether SQLite refused the statement because the database or a table was
/// locked by another connection.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        // Extended result codes keep the primary code in the low byte.
        .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

/// Run `op`, running it again with backoff while the database is locked.
pub(crate) async fn retry_on_busy<T, F, Fut>(
    op_name: &'static str,
    mut op: F,
) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Err(err) if is_busy(&err) && BUSY_RETRY.should_retry(attempts) => {
                let delay = BUSY_RETRY.delay_after_attempt(attempts);
                debug!(op = op_name, attempt = attempts, ?delay, "SQLite busy, backing off");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use sqlx::ConnectOptions;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_other_errors_are_returned_at_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_on_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!is_busy(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_locked_database_is_detected() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("busy.db").display());
        let options = SqliteConnectOptions::from_str(&url)
            .unwrap()
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO);

        let mut holder = options.connect().await.unwrap();
        let mut writer = options.connect().await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&mut holder)
            .await
            .unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut holder)
            .await
            .unwrap();

        let err = sqlx::query("INSERT INTO t (x) VALUES (1)")
            .execute(&mut writer)
            .await
            .unwrap_err();
        assert!(is_busy(&err));
        assert!(StoreError::from(err).is_transient());
    }
}
