//! Integration tests for transaction functionality.

use saga_db::db::{MAX_RETRY_ATTEMPTS, RetryPolicy, TransactionManager};
use saga_db::models::ConnectionConfig;
use saga_db::{Connection, DbError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn manager() -> TransactionManager {
    let mut conn = Connection::open(ConnectionConfig::memory()).await.unwrap();
    conn.raw("CREATE TABLE events (id INTEGER PRIMARY KEY, label TEXT NOT NULL)", &[])
        .await
        .unwrap();
    TransactionManager::new(conn)
}

async fn labels(tm: &mut TransactionManager) -> Vec<String> {
    tm.raw("SELECT label FROM events ORDER BY id", &[])
        .await
        .unwrap()
        .column("label")
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

async fn insert(tm: &mut TransactionManager, label: &str) {
    tm.raw("INSERT INTO events (label) VALUES (?)", &[label.into()])
        .await
        .unwrap();
}

fn locked() -> DbError {
    DbError::query("database is locked", "UPDATE events SET label = ?", Some("5".into()))
}

#[tokio::test]
async fn test_inner_rollback_keeps_outer_writes() {
    let mut tm = manager().await;

    tm.begin().await.unwrap();
    insert(&mut tm, "before").await;

    tm.begin().await.unwrap();
    assert_eq!(tm.level(), 2);
    insert(&mut tm, "nested").await;
    tm.rollback().await.unwrap();

    assert_eq!(tm.level(), 1);
    tm.commit().await.unwrap();
    assert_eq!(tm.level(), 0);

    assert_eq!(labels(&mut tm).await, vec!["before"]);
}

#[tokio::test]
async fn test_inner_commit_is_undone_by_outer_rollback() {
    let mut tm = manager().await;

    tm.begin().await.unwrap();
    tm.begin().await.unwrap();
    insert(&mut tm, "inner").await;
    tm.commit().await.unwrap();
    tm.rollback().await.unwrap();

    assert!(labels(&mut tm).await.is_empty());
}

#[tokio::test]
async fn test_three_levels_unwind_in_order() {
    let mut tm = manager().await;

    tm.begin().await.unwrap();
    insert(&mut tm, "one").await;
    tm.begin().await.unwrap();
    insert(&mut tm, "two").await;
    tm.begin().await.unwrap();
    insert(&mut tm, "three").await;
    assert_eq!(tm.savepoints().len(), 2);

    tm.rollback().await.unwrap();
    tm.commit().await.unwrap();
    tm.commit().await.unwrap();

    assert_eq!(labels(&mut tm).await, vec!["one", "two"]);
    assert!(tm.savepoints().is_empty());
}

#[tokio::test]
async fn test_rollback_callbacks_fire_only_on_outermost_rollback() {
    let mut tm = manager().await;
    let log = Arc::new(Mutex::new(Vec::new()));

    tm.begin().await.unwrap();
    let l = log.clone();
    tm.after_rollback(move || {
        l.lock().unwrap().push("rolled back");
        Ok(())
    });
    let l = log.clone();
    tm.after_commit(move || {
        l.lock().unwrap().push("committed");
        Ok(())
    });

    tm.begin().await.unwrap();
    tm.rollback().await.unwrap();
    assert!(log.lock().unwrap().is_empty());

    tm.rollback().await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["rolled back"]);
    assert_eq!(tm.pending_callbacks(), (0, 0));
}

#[tokio::test]
async fn test_failing_callback_does_not_stop_the_others() {
    let mut tm = manager().await;
    let fired = Arc::new(AtomicUsize::new(0));

    tm.begin().await.unwrap();
    tm.after_commit(|| Err(DbError::internal("callback failed")));
    tm.after_commit(|| panic!("callback panicked"));
    let f = fired.clone();
    tm.after_commit(move || {
        f.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    tm.commit().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rollback_when_idle_is_noop() {
    let mut tm = manager().await;
    tm.rollback().await.unwrap();
    assert_eq!(tm.level(), 0);

    let err = tm.commit().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionNotActive { .. }));
}

#[tokio::test]
async fn test_retry_backs_off_then_succeeds() {
    let mut tm = manager().await;
    // Pause after setup so pool timeouts are not auto-advanced
    tokio::time::pause();
    let start = tokio::time::Instant::now();
    let attempts = AtomicUsize::new(0);

    let value = tm
        .run_with_retry(RetryPolicy::default(), async |tx| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            tx.raw("INSERT INTO events (label) VALUES (?)", &[format!("attempt {n}").into()])
                .await?;
            if n < 3 { Err(locked()) } else { Ok(n) }
        })
        .await
        .unwrap();

    assert_eq!(value, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // 100ms after the first failure, 200ms after the second
    assert!(start.elapsed() >= Duration::from_millis(300));
    // Failed attempts were rolled back
    assert_eq!(labels(&mut tm).await, vec!["attempt 3"]);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let mut tm = manager().await;
    tokio::time::pause();
    let attempts = AtomicUsize::new(0);

    let policy = RetryPolicy::new(4, Duration::from_millis(10), Duration::from_millis(20));
    let err = tm
        .run_with_retry(policy, async |_tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(locked())
        })
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(tm.level(), 0);
}

#[tokio::test]
async fn test_retry_attempts_are_capped() {
    let mut tm = manager().await;
    tokio::time::pause();
    let attempts = AtomicUsize::new(0);

    let policy = RetryPolicy::new(50, Duration::from_millis(1), Duration::from_millis(1));
    let _ = tm
        .run_with_retry(policy, async |_tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(locked())
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS as usize);
}

#[tokio::test]
async fn test_nested_unit_is_not_retried() {
    let mut tm = manager().await;
    let attempts = AtomicUsize::new(0);

    tm.begin().await.unwrap();
    let err = tm
        .run_with_retry(RetryPolicy::default(), async |_tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(locked())
        })
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    // The nested savepoint was rolled back; the outer transaction is intact
    assert_eq!(tm.level(), 1);
    tm.rollback().await.unwrap();
}

#[tokio::test]
async fn test_run_nested_inside_run() {
    let mut tm = manager().await;

    tm.run(async |tx| {
        insert(tx, "outer").await;
        let inner = tx
            .run(async |tx| {
                insert(tx, "inner").await;
                Err::<(), _>(DbError::invalid_input("reject inner"))
            })
            .await;
        assert!(inner.is_err());
        assert_eq!(tx.level(), 1);
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(labels(&mut tm).await, vec!["outer"]);
}

#[tokio::test]
async fn test_file_backed_commit_is_visible_to_new_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tx.db");
    let config = ConnectionConfig::sqlite(path.to_string_lossy().to_string());

    let mut conn = Connection::open(config.clone()).await.unwrap();
    conn.raw("CREATE TABLE events (id INTEGER PRIMARY KEY, label TEXT NOT NULL)", &[])
        .await
        .unwrap();
    let mut tm = TransactionManager::new(conn);
    tm.run(async |tx| {
        insert(tx, "durable").await;
        Ok(())
    })
    .await
    .unwrap();

    let mut other = Connection::open(config).await.unwrap();
    let rs = other.raw("SELECT label FROM events", &[]).await.unwrap();
    assert_eq!(rs.column("label"), vec!["durable"]);
}
