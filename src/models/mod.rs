//! Data models for the database adapter.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{ConnectionConfig, DatabaseType, Driver};
pub use query::{ParamKind, QueryParam, ResultSet, Row};
pub use schema::{
    ColumnDefinition, ColumnInfo, ColumnType, ForeignKeyAction, ForeignKeyDefinition,
    ForeignKeyInfo, IndexDefinition, IndexInfo, IndexKind, TableDefinition,
};
