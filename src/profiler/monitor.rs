//! Cross-request performance monitoring.
//!
//! The profiler only sees the current request. At the end of each request the
//! monitor folds the profiler's numbers into per-minute buckets in the shared
//! store, so that trends survive across requests and processes. Buckets
//! expire after the configured retention.

use crate::cache::{CacheStore, QueryCache};
use crate::config::MonitorConfig;
use crate::db::Connection;
use crate::error::{DbError, DbResult};
use crate::profiler::QueryProfiler;
use chrono::Utc;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const FIELD_QUERIES: &str = "queries";
const FIELD_TIME_US: &str = "time_us";
const FIELD_SLOW: &str = "slow";
const FIELD_REQUESTS: &str = "requests";

/// Numbers for the request currently held by a profiler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestMetrics {
    pub query_count: usize,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub max_time_ms: f64,
    pub slow_count: usize,
}

/// Totals over a window of per-minute buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub window_minutes: u64,
    pub query_count: u64,
    pub total_time_ms: f64,
    pub slow_count: u64,
    pub request_count: u64,
    pub queries_per_minute: f64,
    pub avg_query_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Checks that did not pass.
    pub fn failures(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub struct PerformanceMonitor {
    store: Arc<dyn CacheStore>,
    config: MonitorConfig,
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PerformanceMonitor {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_config(store, MonitorConfig::default())
    }

    pub fn with_config(store: Arc<dyn CacheStore>, config: MonitorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn request_metrics(&self, profiler: &QueryProfiler) -> RequestMetrics {
        let summary = profiler.summary();
        RequestMetrics {
            query_count: summary.total_queries,
            total_time_ms: ms(summary.total_time),
            avg_time_ms: ms(summary.avg_time),
            max_time_ms: ms(summary.max_time),
            slow_count: summary.slow_queries,
        }
    }

    fn bucket_key(&self, minute: i64, field: &str) -> String {
        format!("{}:perf:{}:{}", self.config.metric_prefix, minute, field)
    }

    fn current_minute() -> i64 {
        Utc::now().timestamp().div_euclid(60)
    }

    /// Fold the profiler's request into the current minute bucket and reset
    /// the profiler for the next request.
    pub async fn flush_request(&self, profiler: &QueryProfiler) -> RequestMetrics {
        let metrics = self.request_metrics(profiler);
        let summary = profiler.summary();
        let minute = Self::current_minute();
        let ttl = Some(self.config.retention());

        let updates = [
            (FIELD_QUERIES, summary.total_queries as i64),
            (FIELD_TIME_US, summary.total_time.as_micros() as i64),
            (FIELD_SLOW, summary.slow_queries as i64),
            (FIELD_REQUESTS, 1),
        ];
        for (field, by) in updates {
            let key = self.bucket_key(minute, field);
            if let Err(e) = self.store.increment(&key, by, ttl).await {
                warn!(key = %key, error = %e, "Failed to update performance bucket");
            }
        }

        profiler.reset();
        info!(
            queries = metrics.query_count,
            total_ms = metrics.total_time_ms,
            slow = metrics.slow_count,
            "Request metrics flushed"
        );
        metrics
    }

    async fn bucket_value(&self, minute: i64, field: &str) -> u64 {
        let key = self.bucket_key(minute, field);
        match self.store.get(&key).await {
            Ok(value) => value.and_then(|v| v.as_u64()).unwrap_or(0),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read performance bucket");
                0
            }
        }
    }

    /// Totals over the minute buckets covering `window` (at least one).
    pub async fn aggregate(&self, window: Duration) -> AggregateMetrics {
        let minutes = window.as_secs().div_ceil(60).max(1);
        let now = Self::current_minute();

        let mut totals = AggregateMetrics {
            window_minutes: minutes,
            ..AggregateMetrics::default()
        };
        let mut time_us = 0u64;
        for offset in 0..minutes as i64 {
            let minute = now - offset;
            totals.query_count += self.bucket_value(minute, FIELD_QUERIES).await;
            time_us += self.bucket_value(minute, FIELD_TIME_US).await;
            totals.slow_count += self.bucket_value(minute, FIELD_SLOW).await;
            totals.request_count += self.bucket_value(minute, FIELD_REQUESTS).await;
        }

        totals.total_time_ms = time_us as f64 / 1000.0;
        totals.queries_per_minute = totals.query_count as f64 / minutes as f64;
        if totals.query_count > 0 {
            totals.avg_query_ms = totals.total_time_ms / totals.query_count as f64;
        }
        totals
    }

    /// Check the connection and the current request against the configured
    /// thresholds. The cache ratio is only judged once the cache has seen a
    /// lookup.
    pub async fn health_check(
        &self,
        conn: &mut Connection,
        profiler: &QueryProfiler,
        cache: Option<&QueryCache>,
    ) -> HealthReport {
        let metrics = self.request_metrics(profiler);
        let mut checks = Vec::new();

        checks.push(match conn.ping().await {
            Ok(()) => HealthCheck {
                name: "database",
                passed: true,
                message: format!("{} connection is alive", conn.driver_name()),
            },
            Err(e) => HealthCheck {
                name: "database",
                passed: false,
                message: e.to_string(),
            },
        });

        checks.push(HealthCheck {
            name: "avg_query_time",
            passed: metrics.avg_time_ms <= self.config.max_avg_query_ms,
            message: format!(
                "{:.2}ms average (limit {:.2}ms)",
                metrics.avg_time_ms, self.config.max_avg_query_ms
            ),
        });

        checks.push(HealthCheck {
            name: "queries_per_request",
            passed: metrics.query_count <= self.config.max_queries_per_request,
            message: format!(
                "{} queries (limit {})",
                metrics.query_count, self.config.max_queries_per_request
            ),
        });

        if let Some(cache) = cache {
            checks.push(match cache.hit_ratio().await {
                Some(ratio) => HealthCheck {
                    name: "cache_hit_ratio",
                    passed: ratio >= self.config.min_cache_hit_ratio,
                    message: format!(
                        "{:.1}% hit ratio (minimum {:.1}%)",
                        ratio * 100.0,
                        self.config.min_cache_hit_ratio * 100.0
                    ),
                },
                None => HealthCheck {
                    name: "cache_hit_ratio",
                    passed: true,
                    message: "no cache lookups yet".to_string(),
                },
            });
        }

        let healthy = checks.iter().all(|c| c.passed);
        if !healthy {
            for failed in checks.iter().filter(|c| !c.passed) {
                warn!(check = failed.name, message = %failed.message, "Health check failed");
            }
        }
        HealthReport { healthy, checks }
    }

    /// Prometheus text exposition of the current request and cache counters.
    pub async fn export_metrics(
        &self,
        profiler: &QueryProfiler,
        cache: Option<&QueryCache>,
    ) -> DbResult<String> {
        let summary = profiler.summary();
        let n_plus_one = profiler.detect_n_plus_one().len();
        let registry = Registry::new();
        let p = &self.config.metric_prefix;

        let int_gauges = [
            ("queries", "Queries recorded in the current profile window", summary.total_queries),
            ("slow_queries", "Queries above the slow threshold", summary.slow_queries),
            ("failed_queries", "Queries that returned an error", summary.failed_queries),
            ("query_patterns", "Distinct normalized query patterns", summary.unique_patterns),
            ("n_plus_one_patterns", "Patterns repeated past the N+1 threshold", n_plus_one),
        ];
        for (name, help, value) in int_gauges {
            register_int_gauge(&registry, &format!("{p}_{name}"), help, value as i64)?;
        }

        let gauges = [
            ("query_time_avg_ms", "Average query time in milliseconds", ms(summary.avg_time)),
            ("query_time_max_ms", "Slowest query time in milliseconds", ms(summary.max_time)),
        ];
        for (name, help, value) in gauges {
            register_gauge(&registry, &format!("{p}_{name}"), help, value)?;
        }

        if let Some(cache) = cache {
            let stats = cache.stats().await;
            let hits = format!("{p}_cache_hits_total");
            let misses = format!("{p}_cache_misses_total");
            register_counter(&registry, &hits, "Cache lookups that found an entry", stats.hits())?;
            register_counter(&registry, &misses, "Cache lookups that missed", stats.misses())?;
            if let Some(ratio) = stats.hit_ratio() {
                let name = format!("{p}_cache_hit_ratio");
                register_gauge(&registry, &name, "Cache hits over lookups", ratio)?;
            }
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer)
            .map_err(|e| DbError::internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

fn metrics_error(e: prometheus::Error) -> DbError {
    DbError::internal(format!("Failed to export metrics: {}", e))
}

fn register_int_gauge(registry: &Registry, name: &str, help: &str, value: i64) -> DbResult<()> {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).map_err(metrics_error)?;
    gauge.set(value);
    registry.register(Box::new(gauge)).map_err(metrics_error)
}

fn register_gauge(registry: &Registry, name: &str, help: &str, value: f64) -> DbResult<()> {
    let gauge = Gauge::with_opts(Opts::new(name, help)).map_err(metrics_error)?;
    gauge.set(value);
    registry.register(Box::new(gauge)).map_err(metrics_error)
}

fn register_counter(registry: &Registry, name: &str, help: &str, value: u64) -> DbResult<()> {
    let counter = IntCounter::with_opts(Opts::new(name, help)).map_err(metrics_error)?;
    counter.inc_by(value);
    registry.register(Box::new(counter)).map_err(metrics_error)
}
