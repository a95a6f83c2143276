//! Error types for the database adapter.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every backend failure is wrapped into one of these variants before it reaches the
//! caller; nothing in the connection, query builder or schema layers swallows errors.

use thiserror::Error;

/// Maximum number of SQL characters carried inside a [`DbError::Query`].
pub const MAX_ERROR_SQL_CHARS: usize = 200;

/// SQLSTATE / driver codes that mark a transient, retryable failure.
const RETRYABLE_CODES: &[&str] = &[
    // serialization_failure (PostgreSQL) / deadlock (MySQL reports 1213 as 40001)
    "40001",
    // deadlock_detected
    "40P01",
    // lock_not_available
    "55P03",
    // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT
    "5",
    "6",
    "517",
];

/// Backend message fragments that mark a retryable failure when no code is exposed.
const RETRYABLE_MESSAGES: &[&str] = &[
    "deadlock",
    "lock wait timeout",
    "restart transaction",
    "database is locked",
    "could not serialize access",
];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query failed: {message} (SQL: {sql})")]
    Query {
        message: String,
        /// Offending statement, truncated to [`MAX_ERROR_SQL_CHARS`]
        sql: String,
        /// e.g., "42P01" for undefined table
        code: Option<String>,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        savepoint: Option<String>,
        /// Backend code of the statement that failed, when there was one
        code: Option<String>,
    },

    #[error("No active transaction for {operation}")]
    TransactionNotActive { operation: String },

    #[error("Schema error during {operation}: {message}")]
    Schema { operation: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a query error. The SQL is truncated to keep logs readable.
    pub fn query(message: impl Into<String>, sql: &str, code: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: truncate_sql(sql),
            code,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            savepoint: None,
            code: None,
        }
    }

    /// Wrap a failed COMMIT, keeping the backend code for retry decisions.
    pub fn commit_failed(source: DbError) -> Self {
        Self::Transaction {
            message: format!("Commit failed: {}", source),
            savepoint: None,
            code: source.code().map(String::from),
        }
    }

    /// Create a transaction error tied to a savepoint.
    pub fn savepoint(message: impl Into<String>, savepoint: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            savepoint: Some(savepoint.into()),
            code: None,
        }
    }

    /// Create a transaction-not-active error.
    pub fn transaction_not_active(operation: impl Into<String>) -> Self {
        Self::TransactionNotActive {
            operation: operation.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap a sqlx error raised while running `sql`.
    ///
    /// Connection-class failures stay [`DbError::Connection`]; everything else
    /// becomes a [`DbError::Query`] carrying the statement and backend code.
    pub fn from_sqlx(err: sqlx::Error, sql: &str) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::query(db_err.message(), sql, code)
            }
            other => match DbError::from(other) {
                DbError::Query { message, code, .. } => DbError::query(message, sql, code),
                DbError::Internal { message } => DbError::query(message, sql, None),
                mapped => mapped,
            },
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Backend error code, when the backend exposes one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } | Self::Transaction { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is a transient backend conflict worth retrying.
    ///
    /// Structured codes are consulted first; message matching is the fallback
    /// for backends that report no code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Query { message, code, .. } => {
                if let Some(code) = code {
                    if RETRYABLE_CODES.contains(&code.as_str()) {
                        return true;
                    }
                }
                let lower = message.to_lowercase();
                RETRYABLE_MESSAGES.iter().any(|m| lower.contains(m))
            }
            // Only the backend code of a wrapped statement counts here
            Self::Transaction { code, .. } => code
                .as_deref()
                .is_some_and(|c| RETRYABLE_CODES.contains(&c)),
            _ => false,
        }
    }
}

/// Convert sqlx errors that carry no statement context.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection settings and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::query(db_err.message(), "", code)
            }
            sqlx::Error::RowNotFound => DbError::query("No rows returned", "", None),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a connection from the pool",
                "Increase acquire_timeout or max_connections",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::internal(format!("Serialization error: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Truncate SQL on a character boundary.
fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(MAX_ERROR_SQL_CHARS) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}
