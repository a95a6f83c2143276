//! Integration tests for query profiling, plan analysis and monitoring.

use saga_db::cache::{MemoryStore, QueryCache};
use saga_db::config::{MonitorConfig, ProfilerConfig};
use saga_db::db::TransactionManager;
use saga_db::models::ConnectionConfig;
use saga_db::profiler::{
    PerformanceMonitor, PlanIssueKind, PlanRating, QueryProfiler, normalize,
};
use saga_db::{Connection, DbError, DbResult};
use std::sync::Arc;
use std::time::Duration;

async fn profiled(profiler: Arc<QueryProfiler>) -> Connection {
    let mut conn = Connection::with_profiler(ConnectionConfig::memory(), profiler).unwrap();
    conn.raw(
        "CREATE TABLE entities (id INTEGER PRIMARY KEY, saga_id INTEGER, name TEXT)",
        &[],
    )
    .await
    .unwrap();
    for i in 1..=12 {
        conn.raw(
            "INSERT INTO entities (saga_id, name) VALUES (?, ?)",
            &[(i % 3).into(), format!("entity {i}").into()],
        )
        .await
        .unwrap();
    }
    conn
}

#[tokio::test]
async fn test_repeated_lookups_are_reported_as_n_plus_one() {
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;
    profiler.reset();

    for id in 1..=12 {
        conn.raw(&format!("SELECT * FROM entities WHERE id = {id}"), &[])
            .await
            .unwrap();
    }
    conn.raw("SELECT COUNT(*) FROM entities", &[]).await.unwrap();

    let patterns = profiler.detect_n_plus_one();
    assert_eq!(patterns.len(), 1);
    let pattern = &patterns[0];
    assert!(pattern.count >= 10);
    assert_eq!(pattern.count, 12);
    assert_eq!(pattern.pattern, normalize("SELECT * FROM entities WHERE id = 1"));
    assert!(pattern.example_sql.starts_with("SELECT * FROM entities WHERE id = "));

    let summary = profiler.summary();
    assert_eq!(summary.total_queries, 13);
    assert_eq!(summary.unique_patterns, 2);
}

#[tokio::test]
async fn test_bound_parameters_share_a_pattern_with_literals() {
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;
    profiler.reset();

    for id in 1..=6 {
        conn.raw("SELECT name FROM entities WHERE id = ?", &[id.into()])
            .await
            .unwrap();
        conn.raw(&format!("SELECT name FROM entities WHERE id = {id}"), &[])
            .await
            .unwrap();
    }

    let patterns = profiler.detect_n_plus_one();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].count, 12);
}

#[tokio::test]
async fn test_short_transactions_are_not_n_plus_one() {
    let profiler = Arc::new(QueryProfiler::default());
    let conn = profiled(profiler.clone()).await;
    profiler.reset();

    let mut tm = TransactionManager::new(conn);
    for id in 1..=12 {
        tm.run(async |tx| {
            tx.run(async |tx| {
                tx.raw("UPDATE entities SET name = ? WHERE id = ?", &["renamed".into(), id.into()])
                    .await
            })
            .await?;
            Ok(())
        })
        .await
        .unwrap();
    }

    // BEGIN, SAVEPOINT, RELEASE and COMMIT each ran 12 times too
    assert_eq!(profiler.summary().total_queries, 60);
    let patterns = profiler.detect_n_plus_one();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].count, 12);
    assert!(patterns[0].pattern.starts_with("UPDATE ENTITIES"));
}

#[tokio::test]
async fn test_lazy_connect_failure_is_profiled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("nested").join("saga.db");
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = Connection::with_profiler(
        ConnectionConfig::sqlite(path.to_string_lossy().to_string()),
        profiler.clone(),
    )
    .unwrap();

    assert!(conn.raw("SELECT 1", &[]).await.is_err());
    assert!(!conn.is_connected());
    assert!(conn.last_error().is_some());

    let profiles = profiler.profiles();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].sql, "SELECT 1");
    assert!(!profiles[0].success);
}

#[tokio::test]
async fn test_failed_statements_are_profiled() {
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;
    profiler.reset();

    let err = conn.raw("SELECT * FROM missing_table", &[]).await.unwrap_err();
    match err {
        DbError::Query { sql, .. } => assert_eq!(sql, "SELECT * FROM missing_table"),
        other => panic!("expected query error, got {other:?}"),
    }
    assert!(conn.last_error().is_some());

    let profiles = profiler.profiles();
    assert_eq!(profiles.len(), 1);
    assert!(!profiles[0].success);
    assert_eq!(profiler.summary().failed_queries, 1);
}

#[tokio::test]
async fn test_slow_threshold_flags_queries() {
    let profiler = Arc::new(QueryProfiler::new(ProfilerConfig {
        slow_threshold_ms: 0,
        ..ProfilerConfig::default()
    }));
    let mut conn = profiled(profiler.clone()).await;
    profiler.reset();

    conn.raw("SELECT * FROM entities", &[]).await.unwrap();
    assert_eq!(profiler.slow_queries().len(), 1);
}

#[tokio::test]
async fn test_profile_wrapper_records_outcome() {
    let profiler = QueryProfiler::default();

    let ok = profiler
        .profile("SELECT 1", async { DbResult::Ok(1) })
        .await
        .unwrap();
    assert_eq!(ok, 1);
    let err = profiler
        .profile("SELECT 2", async {
            Err::<i32, _>(DbError::internal("boom"))
        })
        .await;
    assert!(err.is_err());

    let profiles = profiler.profiles();
    assert_eq!(profiles.len(), 2);
    assert!(profiles[0].success);
    assert!(!profiles[1].success);
}

#[tokio::test]
async fn test_explain_flags_full_scan_and_accepts_index() {
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;

    let report = profiler
        .explain(&mut conn, "SELECT * FROM entities WHERE saga_id = ?", &[1.into()])
        .await
        .unwrap();
    assert!(!report.plan.is_empty());
    assert!(report.issues.iter().any(|i| i.kind == PlanIssueKind::FullScan));
    assert_eq!(report.rating, PlanRating::FullScan);

    conn.raw("CREATE INDEX entities_saga_id_index ON entities (saga_id)", &[])
        .await
        .unwrap();
    let report = profiler
        .explain(&mut conn, "SELECT * FROM entities WHERE saga_id = ?", &[1.into()])
        .await
        .unwrap();
    assert!(report.issues.is_empty(), "{:?}", report.issues);
    assert_eq!(report.rating, PlanRating::Optimal);
}

#[tokio::test]
async fn test_explain_rejects_writes() {
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;

    let err = profiler
        .explain(&mut conn, "DELETE FROM entities", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    let count = conn.raw("SELECT COUNT(*) AS n FROM entities", &[]).await.unwrap();
    assert_eq!(count.value(0, "n").unwrap(), 12);
}

#[tokio::test]
async fn test_monitor_flush_and_aggregate() {
    let store = Arc::new(MemoryStore::new());
    let monitor = PerformanceMonitor::new(store.clone());
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;

    let first = monitor.flush_request(&profiler).await;
    assert_eq!(first.query_count, 13);
    assert!(profiler.profiles().is_empty());

    conn.raw("SELECT * FROM entities", &[]).await.unwrap();
    conn.raw("SELECT * FROM entities WHERE id = 1", &[]).await.unwrap();
    monitor.flush_request(&profiler).await;

    // A second monitor over the same store sees the same buckets
    let other = PerformanceMonitor::new(store);
    let totals = other.aggregate(Duration::from_secs(120)).await;
    assert_eq!(totals.window_minutes, 2);
    assert_eq!(totals.query_count, 15);
    assert_eq!(totals.request_count, 2);
    assert!(totals.queries_per_minute > 0.0);
}

#[tokio::test]
async fn test_health_check_reports_each_threshold() {
    let monitor = PerformanceMonitor::with_config(
        Arc::new(MemoryStore::new()),
        MonitorConfig {
            max_queries_per_request: 5,
            ..MonitorConfig::default()
        },
    );
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;
    let cache = QueryCache::new(Arc::new(MemoryStore::new()));

    let report = monitor.health_check(&mut conn, &profiler, Some(&cache)).await;
    assert!(!report.healthy);
    let failed: Vec<&str> = report.failures().map(|c| c.name).collect();
    assert_eq!(failed, vec!["queries_per_request"]);
    let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
    assert_eq!(
        names,
        vec!["database", "avg_query_time", "queries_per_request", "cache_hit_ratio"]
    );

    profiler.reset();
    let report = monitor.health_check(&mut conn, &profiler, None).await;
    assert!(report.healthy);
}

#[tokio::test]
async fn test_health_check_reconnects_after_disconnect() {
    let monitor = PerformanceMonitor::new(Arc::new(MemoryStore::new()));
    let profiler = Arc::new(QueryProfiler::default());
    let mut conn = profiled(profiler.clone()).await;
    profiler.reset();

    conn.disconnect().await;
    assert!(!conn.is_connected());
    let report = monitor.health_check(&mut conn, &profiler, None).await;
    assert!(report.healthy);
    assert!(conn.is_connected());
}

#[tokio::test]
async fn test_export_metrics_text_format() {
    let monitor = PerformanceMonitor::new(Arc::new(MemoryStore::new()));
    let profiler = Arc::new(QueryProfiler::default());
    let _conn = profiled(profiler.clone()).await;
    let cache = QueryCache::new(Arc::new(MemoryStore::new()));
    cache
        .remember("k", None, &[], async || DbResult::Ok(1))
        .await
        .unwrap();

    let text = monitor.export_metrics(&profiler, Some(&cache)).await.unwrap();
    assert!(text.contains("# TYPE saga_db_queries gauge"));
    assert!(text.contains("saga_db_queries 13"));
    assert!(text.contains("saga_db_n_plus_one_patterns 1"));
    assert!(text.contains("saga_db_cache_misses_total 1"));
    assert!(text.contains("saga_db_cache_hit_ratio 0"));
}
