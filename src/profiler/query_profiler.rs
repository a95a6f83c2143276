//! Query profiling.
//!
//! Every statement run through a [`crate::db::Connection`] is recorded here:
//! SQL, normalized pattern, duration and outcome. Records live in a bounded
//! ring buffer; the oldest are dropped once capacity is reached.

use crate::config::ProfilerConfig;
use crate::db::Connection;
use crate::db::statement::is_transaction_control;
use crate::error::DbResult;
use crate::models::{DatabaseType, QueryParam};
use crate::profiler::explain::{self, ExplainReport};
use crate::profiler::normalize::{normalize, normalize_for};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// One recorded statement.
#[derive(Debug, Clone, Serialize)]
pub struct QueryProfile {
    pub sql: String,
    /// Literal-free form used for grouping
    pub pattern: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub slow: bool,
    pub success: bool,
}

/// A statement shape repeated often enough to suggest an N+1 access pattern.
#[derive(Debug, Clone, Serialize)]
pub struct NPlusOnePattern {
    pub pattern: String,
    pub count: usize,
    #[serde(with = "duration_ms")]
    pub total_time: Duration,
    pub example_sql: String,
}

/// Aggregate view over the recorded profiles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileSummary {
    pub total_queries: usize,
    pub failed_queries: usize,
    pub slow_queries: usize,
    pub unique_patterns: usize,
    #[serde(with = "duration_ms")]
    pub total_time: Duration,
    #[serde(with = "duration_ms")]
    pub avg_time: Duration,
    #[serde(with = "duration_ms")]
    pub max_time: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }
}

#[derive(Debug)]
pub struct QueryProfiler {
    config: ProfilerConfig,
    profiles: Mutex<VecDeque<QueryProfile>>,
}

impl Default for QueryProfiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

impl QueryProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            profiles: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            config,
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueryProfile>> {
        // A panic while holding the lock cannot leave the buffer inconsistent
        self.profiles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one executed statement.
    pub fn record(&self, sql: &str, duration: Duration, success: bool) {
        self.push(sql, None, duration, success);
    }

    /// Record a statement whose pattern is read with `dialect`'s quoting rules.
    pub fn record_for(&self, dialect: DatabaseType, sql: &str, duration: Duration, success: bool) {
        self.push(sql, Some(dialect), duration, success);
    }

    fn push(&self, sql: &str, dialect: Option<DatabaseType>, duration: Duration, success: bool) {
        if !self.config.enabled || self.config.capacity == 0 {
            return;
        }

        let slow = duration > self.config.slow_threshold();
        if slow {
            warn!(
                sql = %sql,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.config.slow_threshold_ms,
                "Slow query"
            );
        }

        let profile = QueryProfile {
            sql: sql.to_string(),
            pattern: match dialect {
                Some(dialect) => normalize_for(sql, dialect),
                None => normalize(sql),
            },
            duration,
            timestamp: Utc::now(),
            slow,
            success,
        };

        let mut profiles = self.lock();
        while profiles.len() >= self.config.capacity {
            profiles.pop_front();
        }
        profiles.push_back(profile);
    }

    /// Time `fut` and record it under `sql`.
    pub async fn profile<T, F>(&self, sql: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.record(sql, start.elapsed(), result.is_ok());
        result
    }

    /// Snapshot of the ring buffer, oldest first.
    pub fn profiles(&self) -> Vec<QueryProfile> {
        self.lock().iter().cloned().collect()
    }

    pub fn slow_queries(&self) -> Vec<QueryProfile> {
        self.lock().iter().filter(|p| p.slow).cloned().collect()
    }

    /// Patterns executed at least `n_plus_one_threshold` times, most frequent
    /// first. Transaction control statements are not counted.
    pub fn detect_n_plus_one(&self) -> Vec<NPlusOnePattern> {
        let mut groups: HashMap<String, NPlusOnePattern> = HashMap::new();
        let profiles = self.lock();
        for profile in profiles.iter().filter(|p| !is_transaction_control(&p.sql)) {
            let entry = groups
                .entry(profile.pattern.clone())
                .or_insert_with(|| NPlusOnePattern {
                    pattern: profile.pattern.clone(),
                    count: 0,
                    total_time: Duration::ZERO,
                    example_sql: profile.sql.clone(),
                });
            entry.count += 1;
            entry.total_time += profile.duration;
        }

        drop(profiles);

        let mut detected: Vec<NPlusOnePattern> = groups
            .into_values()
            .filter(|g| g.count >= self.config.n_plus_one_threshold)
            .collect();
        detected.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));

        for pattern in &detected {
            warn!(
                pattern = %pattern.pattern,
                count = pattern.count,
                total_ms = pattern.total_time.as_millis() as u64,
                "Possible N+1 query pattern"
            );
        }
        detected
    }

    pub fn summary(&self) -> ProfileSummary {
        let profiles = self.lock();
        if profiles.is_empty() {
            return ProfileSummary::default();
        }

        let total_time: Duration = profiles.iter().map(|p| p.duration).sum();
        let mut patterns: Vec<&str> = profiles.iter().map(|p| p.pattern.as_str()).collect();
        patterns.sort_unstable();
        patterns.dedup();

        ProfileSummary {
            total_queries: profiles.len(),
            failed_queries: profiles.iter().filter(|p| !p.success).count(),
            slow_queries: profiles.iter().filter(|p| p.slow).count(),
            unique_patterns: patterns.len(),
            total_time,
            avg_time: total_time / profiles.len() as u32,
            max_time: profiles.iter().map(|p| p.duration).max().unwrap_or_default(),
        }
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Run the backend's EXPLAIN for a SELECT and rate the plan.
    pub async fn explain(
        &self,
        conn: &mut Connection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExplainReport> {
        explain::explain(conn, sql, params, self.config.high_row_estimate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_slow_flag_uses_threshold() {
        let profiler = QueryProfiler::default();
        profiler.record("SELECT 1", ms(5), true);
        profiler.record("SELECT 2", ms(150), true);
        let slow = profiler.slow_queries();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].sql, "SELECT 2");
    }

    #[test]
    fn test_duration_at_threshold_is_not_slow() {
        let profiler = QueryProfiler::default();
        profiler.record("SELECT 1", ms(100), true);
        assert!(profiler.slow_queries().is_empty());

        profiler.record("SELECT 2", ms(101), true);
        let slow = profiler.slow_queries();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].sql, "SELECT 2");
    }

    #[test]
    fn test_transaction_control_is_not_n_plus_one() {
        let profiler = QueryProfiler::default();
        for i in 0..12 {
            profiler.record("BEGIN", ms(1), true);
            profiler.record(&format!("SAVEPOINT sp_{i}"), ms(1), true);
            profiler.record(&format!("RELEASE SAVEPOINT sp_{i}"), ms(1), true);
            profiler.record("COMMIT", ms(1), true);
        }
        assert!(profiler.detect_n_plus_one().is_empty());
        assert_eq!(profiler.summary().total_queries, 48);
    }

    #[test]
    fn test_mysql_double_quoted_strings_share_a_pattern() {
        let profiler = QueryProfiler::default();
        profiler.record_for(DatabaseType::MySQL, r#"SELECT id FROM users WHERE name = "a""#, ms(1), true);
        profiler.record_for(DatabaseType::MySQL, r#"SELECT id FROM users WHERE name = "b""#, ms(1), true);
        let profiles = profiler.profiles();
        assert_eq!(profiles[0].pattern, profiles[1].pattern);
        assert_eq!(profiles[0].pattern, "SELECT ID FROM USERS WHERE NAME = ?");
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let profiler = QueryProfiler::new(ProfilerConfig {
            capacity: 3,
            ..ProfilerConfig::default()
        });
        for i in 0..5 {
            profiler.record(&format!("SELECT {i}"), ms(1), true);
        }
        let sqls: Vec<String> = profiler.profiles().into_iter().map(|p| p.sql).collect();
        assert_eq!(sqls, vec!["SELECT 2", "SELECT 3", "SELECT 4"]);
    }

    #[test]
    fn test_disabled_profiler_records_nothing() {
        let profiler = QueryProfiler::new(ProfilerConfig {
            enabled: false,
            ..ProfilerConfig::default()
        });
        profiler.record("SELECT 1", ms(1), true);
        assert!(profiler.profiles().is_empty());
    }

    #[test]
    fn test_n_plus_one_threshold() {
        let profiler = QueryProfiler::default();
        profiler.record("SELECT * FROM posts", ms(2), true);
        for id in 0..9 {
            profiler.record(&format!("SELECT * FROM comments WHERE post_id = {id}"), ms(1), true);
        }
        assert!(profiler.detect_n_plus_one().is_empty());

        profiler.record("SELECT * FROM comments WHERE post_id = 99", ms(1), true);
        let detected = profiler.detect_n_plus_one();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].count, 10);
        assert_eq!(detected[0].total_time, ms(10));
        assert!(detected[0].example_sql.contains("post_id = 0"));
    }

    #[test]
    fn test_summary() {
        let profiler = QueryProfiler::default();
        profiler.record("SELECT 1", ms(10), true);
        profiler.record("SELECT 2", ms(30), false);
        profiler.record("SELECT 3", ms(200), true);
        let summary = profiler.summary();
        assert_eq!(summary.total_queries, 3);
        assert_eq!(summary.failed_queries, 1);
        assert_eq!(summary.slow_queries, 1);
        assert_eq!(summary.unique_patterns, 1);
        assert_eq!(summary.total_time, ms(240));
        assert_eq!(summary.avg_time, ms(80));
        assert_eq!(summary.max_time, ms(200));

        profiler.reset();
        assert_eq!(profiler.summary().total_queries, 0);
    }

    #[tokio::test]
    async fn test_profile_wrapper_records_failures() {
        let profiler = QueryProfiler::default();
        let result: DbResult<()> = profiler
            .profile("UPDATE t SET a = 1", async {
                Err(crate::error::DbError::internal("boom"))
            })
            .await;
        assert!(result.is_err());
        let profiles = profiler.profiles();
        assert_eq!(profiles.len(), 1);
        assert!(!profiles[0].success);
    }
}
