//! Nested transactions over a single connection.
//!
//! Only the outermost level is a real transaction. Each nested `begin()`
//! opens a uniquely named savepoint, and the matching `commit()` or
//! `rollback()` releases it or rolls back to it. Callbacks registered with
//! `after_commit` / `after_rollback` fire once, when the outermost level
//! ends, and are then discarded.

use crate::db::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, ResultSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on attempts for [`TransactionManager::run_with_retry`].
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Retry schedule: the delay starts at `initial_delay` and doubles after
/// every failed attempt, never exceeding `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// A single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Attempts actually made, between 1 and [`MAX_RETRY_ATTEMPTS`].
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.clamp(1, MAX_RETRY_ATTEMPTS)
    }

    /// Sleep before attempt `attempt + 1`, for `attempt >= 1`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

type Callback = Box<dyn FnOnce() -> DbResult<()> + Send>;

/// Transaction state machine over an owned [`Connection`].
///
/// Level 0 is idle. While the level is above 0 the savepoint stack holds
/// exactly `level - 1` names.
pub struct TransactionManager {
    conn: Connection,
    level: usize,
    savepoints: Vec<String>,
    isolation: Option<IsolationLevel>,
    after_commit: Vec<Callback>,
    after_rollback: Vec<Callback>,
    sequence: u64,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("level", &self.level)
            .field("savepoints", &self.savepoints)
            .field("isolation", &self.isolation)
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl TransactionManager {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            level: 0,
            savepoints: Vec::new(),
            isolation: None,
            after_commit: Vec::new(),
            after_rollback: Vec::new(),
            sequence: 0,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run a statement on the managed connection.
    pub async fn raw(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        self.conn.raw(sql, params).await
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn in_transaction(&self) -> bool {
        self.level > 0
    }

    /// Open savepoints, outermost first.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    /// Queued (after-commit, after-rollback) callbacks.
    pub fn pending_callbacks(&self) -> (usize, usize) {
        (self.after_commit.len(), self.after_rollback.len())
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Isolation level for the next outermost `begin()`.
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> DbResult<()> {
        if self.level > 0 {
            return Err(DbError::transaction(
                "Cannot change isolation level inside an active transaction",
            ));
        }
        self.isolation = Some(level);
        Ok(())
    }

    fn next_savepoint_name(&mut self) -> String {
        self.sequence += 1;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("sp_{}_{}_{}", self.level, self.sequence, &suffix[..8])
    }

    /// Start a transaction, or a savepoint when one is already active.
    pub async fn begin(&mut self) -> DbResult<()> {
        let dialect = self.conn.dialect();
        if self.level == 0 {
            for sql in dialect.begin_statements(self.isolation) {
                self.conn.raw(&sql, &[]).await?;
            }
            self.level = 1;
            info!(driver = self.conn.driver_name(), "Transaction started");
            return Ok(());
        }

        let name = self.next_savepoint_name();
        self.conn
            .raw(&dialect.savepoint_sql(&name), &[])
            .await
            .map_err(|e| DbError::savepoint(e.to_string(), name.as_str()))?;
        self.savepoints.push(name);
        self.level += 1;
        debug!(level = self.level, "Savepoint created");
        Ok(())
    }

    /// Commit one level.
    pub async fn commit(&mut self) -> DbResult<()> {
        match self.level {
            0 => Err(DbError::transaction_not_active("commit")),
            1 => {
                let result = self.conn.raw("COMMIT", &[]).await;
                match result {
                    Ok(_) => {
                        let callbacks = self.finish();
                        info!("Transaction committed");
                        run_callbacks(callbacks.0, "after_commit");
                        Ok(())
                    }
                    Err(e) => {
                        if let Err(rb) = self.conn.raw("ROLLBACK", &[]).await {
                            debug!(error = %rb, "Rollback after failed commit also failed");
                        }
                        let callbacks = self.finish();
                        warn!(error = %e, "Commit failed, transaction rolled back");
                        run_callbacks(callbacks.1, "after_rollback");
                        Err(DbError::commit_failed(e))
                    }
                }
            }
            _ => {
                let Some(name) = self.savepoints.last().cloned() else {
                    return Err(DbError::internal("Savepoint stack out of sync with level"));
                };
                let sql = self.conn.dialect().release_savepoint_sql(&name);
                self.conn
                    .raw(&sql, &[])
                    .await
                    .map_err(|e| DbError::savepoint(e.to_string(), name.as_str()))?;
                self.savepoints.pop();
                self.level -= 1;
                debug!(level = self.level, "Savepoint released");
                Ok(())
            }
        }
    }

    /// Roll back one level. A no-op when no transaction is active.
    pub async fn rollback(&mut self) -> DbResult<()> {
        match self.level {
            0 => Ok(()),
            1 => {
                let result = self.conn.raw("ROLLBACK", &[]).await;
                let callbacks = self.finish();
                info!("Transaction rolled back");
                run_callbacks(callbacks.1, "after_rollback");
                result.map(|_| ())
            }
            _ => {
                let Some(name) = self.savepoints.pop() else {
                    return Err(DbError::internal("Savepoint stack out of sync with level"));
                };
                self.level -= 1;
                let dialect = self.conn.dialect();
                self.conn
                    .raw(&dialect.rollback_to_savepoint_sql(&name), &[])
                    .await
                    .map_err(|e| DbError::savepoint(e.to_string(), name.as_str()))?;
                // Rolling back to a savepoint keeps it open
                if let Err(e) = self.conn.raw(&dialect.release_savepoint_sql(&name), &[]).await {
                    debug!(savepoint = %name, error = %e, "Release after rollback failed");
                }
                debug!(level = self.level, "Rolled back to savepoint");
                Ok(())
            }
        }
    }

    /// Reset to idle, handing back the queued callbacks.
    fn finish(&mut self) -> (Vec<Callback>, Vec<Callback>) {
        self.level = 0;
        self.savepoints.clear();
        (
            std::mem::take(&mut self.after_commit),
            std::mem::take(&mut self.after_rollback),
        )
    }

    /// Run `callback` after the outermost commit, or now when idle.
    pub fn after_commit<F>(&mut self, callback: F)
    where
        F: FnOnce() -> DbResult<()> + Send + 'static,
    {
        if self.level == 0 {
            run_callbacks(vec![Box::new(callback)], "after_commit");
        } else {
            self.after_commit.push(Box::new(callback));
        }
    }

    /// Run `callback` after the outermost rollback. Ignored when idle.
    pub fn after_rollback<F>(&mut self, callback: F)
    where
        F: FnOnce() -> DbResult<()> + Send + 'static,
    {
        if self.level == 0 {
            debug!("after_rollback registered outside a transaction, ignoring");
        } else {
            self.after_rollback.push(Box::new(callback));
        }
    }

    /// Run `f` inside `begin()` / `commit()`, rolling back and returning the
    /// error when `f` fails.
    pub async fn run<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: AsyncFnMut(&mut TransactionManager) -> DbResult<T>,
    {
        self.run_with_retry(RetryPolicy::once(), f).await
    }

    /// Like [`run`](Self::run), repeating the whole unit of work when it
    /// fails with a retryable error. Only an outermost unit is retried.
    pub async fn run_with_retry<T, F>(&mut self, policy: RetryPolicy, mut f: F) -> DbResult<T>
    where
        F: AsyncFnMut(&mut TransactionManager) -> DbResult<T>,
    {
        let max_attempts = policy.effective_attempts();
        let outermost = self.level == 0;
        let mut attempt = 1;

        loop {
            let result = match self.begin().await {
                Ok(()) => match f(self).await {
                    Ok(value) => self.commit().await.map(|()| value),
                    Err(e) => {
                        if let Err(rb) = self.rollback().await {
                            warn!(error = %rb, "Rollback after failed unit of work failed");
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match result {
                Err(e) if outermost && attempt < max_attempts && e.is_retryable() => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if self.level > 0 {
            warn!(
                level = self.level,
                "Transaction manager dropped with an open transaction; closing its connection"
            );
            self.conn.close_on_drop();
        }
    }
}

/// Run callbacks, logging failures and panics.
fn run_callbacks(callbacks: Vec<Callback>, kind: &'static str) {
    for callback in callbacks {
        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(callback = kind, error = %e, "Transaction callback failed"),
            Err(_) => warn!(callback = kind, "Transaction callback panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn manager() -> TransactionManager {
        let mut conn = Connection::open(ConnectionConfig::memory()).await.unwrap();
        conn.raw("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        TransactionManager::new(conn)
    }

    async fn count(tm: &mut TransactionManager) -> i64 {
        let rs = tm.raw("SELECT COUNT(*) AS n FROM items", &[]).await.unwrap();
        rs.value(0, "n").and_then(|v| v.as_i64()).unwrap()
    }

    #[test]
    fn test_retry_delays_double_and_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).effective_attempts(), 1);
        assert_eq!(
            RetryPolicy::new(99, Duration::ZERO, Duration::ZERO).effective_attempts(),
            MAX_RETRY_ATTEMPTS
        );
    }

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
    }

    #[tokio::test]
    async fn test_commit_at_level_zero_fails() {
        let mut tm = manager().await;
        assert!(matches!(
            tm.commit().await,
            Err(DbError::TransactionNotActive { .. })
        ));
        tm.rollback().await.unwrap();
        assert_eq!(tm.level(), 0);
    }

    #[tokio::test]
    async fn test_nested_levels_track_savepoints() {
        let mut tm = manager().await;
        tm.begin().await.unwrap();
        tm.begin().await.unwrap();
        tm.begin().await.unwrap();
        assert_eq!(tm.level(), 3);
        assert_eq!(tm.savepoints().len(), 2);
        assert!(tm.savepoints()[0].starts_with("sp_1_"));
        assert!(tm.savepoints()[1].starts_with("sp_2_"));

        tm.commit().await.unwrap();
        tm.rollback().await.unwrap();
        assert_eq!(tm.level(), 1);
        assert!(tm.savepoints().is_empty());
        tm.commit().await.unwrap();
        assert_eq!(tm.level(), 0);
    }

    #[tokio::test]
    async fn test_isolation_change_rejected_when_active() {
        let mut tm = manager().await;
        tm.set_isolation_level(IsolationLevel::Serializable).unwrap();
        tm.begin().await.unwrap();
        assert!(matches!(
            tm.set_isolation_level(IsolationLevel::ReadCommitted),
            Err(DbError::Transaction { .. })
        ));
        tm.rollback().await.unwrap();
        assert_eq!(tm.isolation_level(), Some(IsolationLevel::Serializable));
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_on_outermost_commit() {
        let mut tm = manager().await;
        let committed = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));

        tm.begin().await.unwrap();
        tm.begin().await.unwrap();
        let c = committed.clone();
        tm.after_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let r = rolled_back.clone();
        tm.after_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tm.after_commit(|| Err(DbError::internal("callback failure is logged")));
        tm.after_commit(|| panic!("callback panic is contained"));

        tm.commit().await.unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        tm.commit().await.unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
        assert_eq!(tm.pending_callbacks(), (0, 0));
    }

    #[tokio::test]
    async fn test_after_commit_when_idle_runs_immediately() {
        let mut tm = manager().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        tm.after_commit(move || {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_commits_and_rolls_back() {
        let mut tm = manager().await;
        let id = tm
            .run(async |tx| {
                tx.raw("INSERT INTO items (name) VALUES (?)", &["a".into()])
                    .await?;
                Ok(tx.connection().last_insert_id())
            })
            .await
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(count(&mut tm).await, 1);

        let err = tm
            .run(async |tx| {
                tx.raw("INSERT INTO items (name) VALUES (?)", &["b".into()])
                    .await?;
                Err::<(), _>(DbError::invalid_input("abort"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(count(&mut tm).await, 1);
        assert_eq!(tm.level(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let mut tm = manager().await;
        let attempts = AtomicUsize::new(0);
        let err = tm
            .run_with_retry(RetryPolicy::default(), async |_tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DbError::invalid_input("bad"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
