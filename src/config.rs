//! Configuration handling for the adapter.
//!
//! Tunables for the profiler, cache and performance monitor live here as
//! serde-friendly structs with defaults, together with the CLI configuration
//! used by the `saga-db` binary.

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

// Profiler defaults
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 100;
pub const DEFAULT_PROFILE_CAPACITY: usize = 1000;
pub const DEFAULT_N_PLUS_ONE_THRESHOLD: usize = 10;
pub const DEFAULT_HIGH_ROW_ESTIMATE: u64 = 1000;

// Cache defaults
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "saga_db";

// Monitor defaults
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_AVG_QUERY_MS: f64 = 100.0;
pub const DEFAULT_MAX_QUERIES_PER_REQUEST: usize = 50;
pub const DEFAULT_MIN_CACHE_HIT_RATIO: f64 = 0.5;

/// Query profiler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Disabled profilers keep no records
    pub enabled: bool,
    /// Queries slower than this are flagged (milliseconds)
    pub slow_threshold_ms: u64,
    /// Ring buffer size; oldest profiles are dropped beyond it
    pub capacity: usize,
    /// Occurrences of one pattern that count as an N+1 storm
    pub n_plus_one_threshold: usize,
    /// EXPLAIN row estimates above this are reported
    pub high_row_estimate: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            capacity: DEFAULT_PROFILE_CAPACITY,
            n_plus_one_threshold: DEFAULT_N_PLUS_ONE_THRESHOLD,
            high_row_estimate: DEFAULT_HIGH_ROW_ESTIMATE,
        }
    }
}

impl ProfilerConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

/// Query cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disabled caches always run the producer
    pub enabled: bool,
    /// TTL used by `get_cached` when none is given
    pub default_ttl_secs: u64,
    /// Namespace for every key written to the shared store
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Performance monitor settings and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long per-minute aggregates are kept in the shared store
    pub retention_secs: u64,
    pub max_avg_query_ms: f64,
    pub max_queries_per_request: usize,
    pub min_cache_hit_ratio: f64,
    /// Prefix for exported metric names
    pub metric_prefix: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION_SECS,
            max_avg_query_ms: DEFAULT_MAX_AVG_QUERY_MS,
            max_queries_per_request: DEFAULT_MAX_QUERIES_PER_REQUEST,
            min_cache_hit_ratio: DEFAULT_MIN_CACHE_HIT_RATIO,
            metric_prefix: "saga_db".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Output format for tabular CLI results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (like MySQL CLI)
    #[default]
    Table,
    /// Markdown table format
    Markdown,
    /// Pretty-printed JSON
    Json,
}

/// CLI subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List tables under the configured prefix
    Tables,
    /// Show columns and indexes of a table (logical name, prefix applied)
    Describe { table: String },
    /// Run a statement and print the result
    Query {
        sql: String,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        /// Print profiler metrics after the statement
        #[arg(long)]
        metrics: bool,
    },
    /// Analyze the execution plan of a SELECT
    Explain { sql: String },
    /// Check connection liveness and query health
    Health,
}

/// Configuration for the `saga-db` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "saga-db",
    about = "Inspect and exercise a saga-db backend from the command line",
    version,
    author
)]
pub struct Config {
    /// Database URL: mysql://, postgres://, sqlite:<path> or memory:
    #[arg(short = 'd', long = "database-url", env = "SAGA_DB_URL")]
    pub database_url: String,

    /// Connection-level table prefix
    #[arg(long, env = "SAGA_DB_PREFIX")]
    pub prefix: Option<String>,

    /// Domain-level table sub-prefix
    #[arg(long, env = "SAGA_DB_NAMESPACE")]
    pub namespace: Option<String>,

    /// Slow query threshold in milliseconds
    #[arg(long, default_value_t = DEFAULT_SLOW_QUERY_THRESHOLD_MS, env = "SAGA_DB_SLOW_MS")]
    pub slow_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "SAGA_DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SAGA_DB_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiler_defaults() {
        let config = ProfilerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.slow_threshold(), Duration::from_millis(100));
        assert_eq!(config.n_plus_one_threshold, 10);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"max_queries_per_request": 20}"#).unwrap();
        assert_eq!(config.max_queries_per_request, 20);
        assert_eq!(config.retention(), Duration::from_secs(86_400));
        assert_eq!(config.metric_prefix, "saga_db");
    }

    #[test]
    fn test_cache_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl(), Duration::from_secs(3600));
        assert_eq!(config.key_prefix, "saga_db");
    }

    #[test]
    fn test_cli_parses_query_subcommand() {
        let config = Config::try_parse_from([
            "saga-db",
            "--database-url",
            "memory:",
            "query",
            "SELECT 1",
            "--format",
            "markdown",
        ])
        .unwrap();
        assert_eq!(config.database_url, "memory:");
        match config.command {
            Command::Query { sql, format, metrics } => {
                assert_eq!(sql, "SELECT 1");
                assert_eq!(format, OutputFormat::Markdown);
                assert!(!metrics);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
