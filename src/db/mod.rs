//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connections over managed, direct and in-memory backends
//! - Pool construction and the shared connection factory
//! - Per-dialect SQL fragments and statement classification
//! - Transactions with savepoints, callbacks and retry
//! - DDL issuance and schema introspection
//! - Type mappings from backend rows to JSON

pub mod connection;
pub mod dialect;
pub mod params;
pub mod pool;
pub mod schema;
pub mod statement;
pub mod transaction;
pub mod types;

pub use connection::Connection;
pub use pool::{ConnectionFactory, DbHandle, DbPool};
pub use schema::{Ddl, SchemaManager};
pub use statement::StatementKind;
pub use transaction::{
    DEFAULT_RETRY_ATTEMPTS, IsolationLevel, MAX_RETRY_ATTEMPTS, RetryPolicy, TransactionManager,
};
