//! saga-db: a database adapter for saga and workflow engines.
//!
//! One [`Connection`] contract over MySQL, PostgreSQL, SQLite and an
//! in-process memory backend, with a fluent [`QueryBuilder`], nested
//! transactions with retry ([`TransactionManager`]), DDL and introspection
//! ([`SchemaManager`]), a tag-invalidated [`QueryCache`] and query profiling
//! with N+1 detection ([`QueryProfiler`], [`PerformanceMonitor`]).

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod models;
pub mod profiler;
pub mod query;

pub use cache::{CacheStore, MemoryStore, QueryCache};
pub use config::Config;
pub use db::{
    Connection, ConnectionFactory, IsolationLevel, RetryPolicy, SchemaManager, TransactionManager,
};
pub use error::{DbError, DbResult};
pub use models::{ConnectionConfig, QueryParam, ResultSet};
pub use profiler::{PerformanceMonitor, QueryProfiler};
pub use query::QueryBuilder;
