//! Per-dialect SQL fragments.
//!
//! Everything that differs textually between MySQL, PostgreSQL and SQLite
//! (identifier quoting, placeholders, transaction control and DDL types) is
//! rendered here so the builder, transaction manager and schema manager stay
//! dialect-agnostic.

use crate::db::transaction::IsolationLevel;
use crate::models::{ColumnType, DatabaseType};

impl DatabaseType {
    fn quote_char(&self) -> char {
        match self {
            Self::MySQL => '`',
            Self::PostgreSQL | Self::SQLite => '"',
        }
    }

    /// Quote one identifier, doubling embedded quote characters.
    pub fn quote_identifier(&self, name: &str) -> String {
        let q = self.quote_char();
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Placeholder for the `index`-th bound parameter (1-based).
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${index}"),
            Self::MySQL | Self::SQLite => "?".to_string(),
        }
    }

    /// Statements opening an outermost transaction.
    ///
    /// SQLite has a single serializable isolation level; a requested level
    /// is accepted and ignored there.
    pub fn begin_statements(&self, isolation: Option<IsolationLevel>) -> Vec<String> {
        match (self, isolation) {
            (Self::MySQL, Some(level)) => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
                "START TRANSACTION".to_string(),
            ],
            (Self::MySQL, None) => vec!["START TRANSACTION".to_string()],
            (Self::PostgreSQL, Some(level)) => {
                vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]
            }
            (Self::PostgreSQL, None) | (Self::SQLite, _) => vec!["BEGIN".to_string()],
        }
    }

    pub fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", self.quote_identifier(name))
    }

    pub fn release_savepoint_sql(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {}", self.quote_identifier(name))
    }

    pub fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.quote_identifier(name))
    }

    /// Render a portable column type for DDL.
    pub fn column_type_sql(&self, column_type: ColumnType, unsigned: bool) -> String {
        let sql = match (self, column_type) {
            (Self::MySQL, ColumnType::Id) => "BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY".to_string(),
            (Self::PostgreSQL, ColumnType::Id) => "BIGSERIAL PRIMARY KEY".to_string(),
            (Self::SQLite, ColumnType::Id) => "INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),

            (Self::SQLite, ColumnType::Integer | ColumnType::BigInteger) => "INTEGER".to_string(),
            (_, ColumnType::Integer) => "INT".to_string(),
            (_, ColumnType::BigInteger) => "BIGINT".to_string(),

            (Self::MySQL, ColumnType::Boolean) => "TINYINT(1)".to_string(),
            (_, ColumnType::Boolean) => "BOOLEAN".to_string(),

            (Self::PostgreSQL, ColumnType::Float) => "REAL".to_string(),
            (Self::SQLite, ColumnType::Float | ColumnType::Double) => "REAL".to_string(),
            (_, ColumnType::Float) => "FLOAT".to_string(),
            (Self::PostgreSQL, ColumnType::Double) => "DOUBLE PRECISION".to_string(),
            (_, ColumnType::Double) => "DOUBLE".to_string(),
            (_, ColumnType::Decimal { precision, scale }) => {
                format!("DECIMAL({precision}, {scale})")
            }

            (_, ColumnType::String(len)) => format!("VARCHAR({len})"),
            (Self::MySQL, ColumnType::LongText) => "LONGTEXT".to_string(),
            (_, ColumnType::Text | ColumnType::LongText) => "TEXT".to_string(),

            (Self::PostgreSQL, ColumnType::Json) => "JSONB".to_string(),
            (Self::MySQL, ColumnType::Json) => "JSON".to_string(),
            (Self::SQLite, ColumnType::Json) => "TEXT".to_string(),

            (Self::PostgreSQL, ColumnType::Binary) => "BYTEA".to_string(),
            (_, ColumnType::Binary) => "BLOB".to_string(),

            (_, ColumnType::Date) => "DATE".to_string(),
            (Self::PostgreSQL, ColumnType::DateTime) => "TIMESTAMP".to_string(),
            (_, ColumnType::DateTime) => "DATETIME".to_string(),
            (_, ColumnType::Timestamp) => "TIMESTAMP".to_string(),
        };

        let numeric = matches!(
            column_type,
            ColumnType::Integer
                | ColumnType::BigInteger
                | ColumnType::Float
                | ColumnType::Double
                | ColumnType::Decimal { .. }
        );
        if unsigned && numeric && *self == Self::MySQL {
            format!("{sql} UNSIGNED")
        } else {
            sql
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(DatabaseType::MySQL.quote_identifier("users"), "`users`");
        assert_eq!(DatabaseType::PostgreSQL.quote_identifier("users"), "\"users\"");
        assert_eq!(DatabaseType::SQLite.quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(DatabaseType::PostgreSQL.placeholder(3), "$3");
        assert_eq!(DatabaseType::MySQL.placeholder(3), "?");
        assert_eq!(DatabaseType::SQLite.placeholder(1), "?");
    }

    #[test]
    fn test_begin_statements() {
        assert_eq!(
            DatabaseType::MySQL.begin_statements(Some(IsolationLevel::ReadCommitted)),
            vec![
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
                "START TRANSACTION".to_string()
            ]
        );
        assert_eq!(
            DatabaseType::PostgreSQL.begin_statements(Some(IsolationLevel::Serializable)),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE".to_string()]
        );
        assert_eq!(
            DatabaseType::SQLite.begin_statements(Some(IsolationLevel::ReadCommitted)),
            vec!["BEGIN".to_string()]
        );
    }

    #[test]
    fn test_column_types() {
        assert_eq!(
            DatabaseType::SQLite.column_type_sql(ColumnType::Id, false),
            "INTEGER PRIMARY KEY AUTOINCREMENT"
        );
        assert_eq!(
            DatabaseType::PostgreSQL.column_type_sql(ColumnType::Id, false),
            "BIGSERIAL PRIMARY KEY"
        );
        assert_eq!(
            DatabaseType::MySQL.column_type_sql(ColumnType::Integer, true),
            "INT UNSIGNED"
        );
        assert_eq!(
            DatabaseType::PostgreSQL.column_type_sql(ColumnType::Integer, true),
            "INT"
        );
        assert_eq!(
            DatabaseType::PostgreSQL.column_type_sql(ColumnType::Json, false),
            "JSONB"
        );
    }
}
