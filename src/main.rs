//! saga-db - Command line entry point.
//!
//! Connects to one backend and runs a single inspection command: list tables,
//! describe a table, run a statement, analyze a plan or check health.

use clap::Parser;
use saga_db::config::{Command, Config, OutputFormat, ProfilerConfig};
use saga_db::format::{format_as_table, render};
use saga_db::models::{ConnectionConfig, ResultSet, Row};
use saga_db::profiler::{PerformanceMonitor, QueryProfiler};
use saga_db::{Connection, DbError, DbResult, MemoryStore};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so command output on stdout stays clean.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting saga-db v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            if let DbError::Connection { suggestion, .. } = &e {
                eprintln!("Error: {e}\n{suggestion}");
            } else {
                eprintln!("Error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> DbResult<ExitCode> {
    let mut conn_config = ConnectionConfig::from_url(&config.database_url)?;
    if let Some(prefix) = &config.prefix {
        conn_config = conn_config.with_prefix(prefix.clone());
    }
    if let Some(namespace) = &config.namespace {
        conn_config = conn_config.with_namespace(namespace.clone());
    }

    let profiler = Arc::new(QueryProfiler::new(ProfilerConfig {
        slow_threshold_ms: config.slow_ms,
        ..ProfilerConfig::default()
    }));
    let mut conn = Connection::with_profiler(conn_config, profiler.clone())?;
    conn.connect().await?;

    let code = match config.command {
        Command::Tables => {
            for table in conn.schema().list_tables().await? {
                println!("{table}");
            }
            ExitCode::SUCCESS
        }
        Command::Describe { table } => {
            let mut schema = conn.schema();
            if !schema.has_table(&table).await? {
                return Err(DbError::invalid_input(format!("table '{table}' does not exist")));
            }
            let columns = schema.list_columns(&table).await?;
            let indexes = schema.list_indexes(&table).await?;
            print!("{}", format_as_table(&records(&columns)?, Duration::ZERO));
            if !indexes.is_empty() {
                print!("{}", format_as_table(&records(&indexes)?, Duration::ZERO));
            }
            ExitCode::SUCCESS
        }
        Command::Query {
            sql,
            format,
            metrics,
        } => {
            let start = Instant::now();
            let rs = conn.raw(&sql, &[]).await?;
            println!("{}", render(&rs, format, start.elapsed())?);
            if metrics {
                let monitor = PerformanceMonitor::new(Arc::new(MemoryStore::new()));
                print!("{}", monitor.export_metrics(&profiler, None).await?);
            }
            ExitCode::SUCCESS
        }
        Command::Explain { sql } => {
            let report = profiler.explain(&mut conn, &sql, &[]).await?;
            println!("{}", render(&report.plan, OutputFormat::Table, Duration::ZERO)?);
            println!("Rating: {}", report.rating.as_str());
            for issue in &report.issues {
                println!("- {}\n  suggestion: {}", issue.issue, issue.suggestion);
            }
            ExitCode::SUCCESS
        }
        Command::Health => {
            let monitor = PerformanceMonitor::new(Arc::new(MemoryStore::new()));
            let report = monitor.health_check(&mut conn, &profiler, None).await;
            for check in &report.checks {
                let mark = if check.passed { "ok" } else { "FAIL" };
                println!("[{mark}] {}: {}", check.name, check.message);
            }
            if report.healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    };

    conn.disconnect().await;
    Ok(code)
}

/// Tabulate serializable records.
fn records<T: Serialize>(items: &[T]) -> DbResult<ResultSet> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::with_capacity(items.len());
    for item in items {
        let value = serde_json::to_value(item)
            .map_err(|e| DbError::internal(format!("Failed to serialize record: {e}")))?;
        let serde_json::Value::Object(row) = value else {
            continue;
        };
        for key in row.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
        rows.push(row);
    }
    Ok(ResultSet::from_rows(columns, rows))
}
