//! Statement classification.
//!
//! Decides whether a statement is fetched (returns rows) or executed (returns
//! a row count). Common statements are classified from their leading keyword;
//! `WITH ...` and anything unrecognised are parsed with
//! [sqlparser](https://docs.rs/sqlparser/) using the connection's dialect.

use crate::models::DatabaseType;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

/// How a statement must be sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Produces rows: SELECT, SHOW, EXPLAIN, PRAGMA, DML with RETURNING
    Query,
    /// Produces a row count: INSERT/UPDATE/DELETE, DDL, transaction control
    Execute,
}

impl StatementKind {
    pub fn returns_rows(&self) -> bool {
        matches!(self, Self::Query)
    }
}

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA", "VALUES", "TABLE",
];

const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE"];

const EXECUTE_KEYWORDS: &[&str] = &[
    "CREATE", "DROP", "ALTER", "TRUNCATE", "RENAME", "BEGIN", "START", "COMMIT", "ROLLBACK",
    "SAVEPOINT", "RELEASE", "SET", "USE", "LOCK", "UNLOCK", "GRANT", "REVOKE", "VACUUM",
    "ANALYZE", "ATTACH", "DETACH", "REINDEX", "COMMENT",
];

/// Get the appropriate SQL dialect for the given database type.
pub(crate) fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Leading keyword of a statement, upper-cased, skipping comments and
/// opening parentheses.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let mut rest = sql;
    loop {
        rest = rest.trim_start().trim_start_matches('(').trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("");
        } else {
            break;
        }
    }
    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
        .collect();
    (!word.is_empty()).then(|| word.to_ascii_uppercase())
}

/// True for statements that open, close or mark a transaction, including
/// `SET TRANSACTION`.
pub fn is_transaction_control(sql: &str) -> bool {
    match leading_keyword(sql).as_deref() {
        Some("BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "END") => true,
        Some("SET") => sql.to_ascii_uppercase().contains(" TRANSACTION"),
        _ => false,
    }
}

/// True for plain SELECT statements, including `WITH ... SELECT`.
pub fn is_select(sql: &str, db_type: DatabaseType) -> bool {
    match leading_keyword(sql).as_deref() {
        Some("SELECT") => true,
        Some("WITH") => matches!(parse_kind(sql, db_type), Some(StatementKind::Query))
            && !has_returning(sql, db_type),
        _ => false,
    }
}

/// Classify a statement for execution.
pub fn classify(sql: &str, db_type: DatabaseType) -> StatementKind {
    let Some(keyword) = leading_keyword(sql) else {
        return StatementKind::Execute;
    };
    let keyword = keyword.as_str();

    if READ_KEYWORDS.contains(&keyword) {
        return StatementKind::Query;
    }
    if DML_KEYWORDS.contains(&keyword) {
        return if has_returning(sql, db_type) {
            StatementKind::Query
        } else {
            StatementKind::Execute
        };
    }
    if EXECUTE_KEYWORDS.contains(&keyword) {
        return StatementKind::Execute;
    }

    match parse_kind(sql, db_type) {
        Some(StatementKind::Execute) if has_returning(sql, db_type) => StatementKind::Query,
        Some(kind) => kind,
        None => StatementKind::Execute,
    }
}

/// Parse-based classification for statements the keyword table cannot decide.
fn parse_kind(sql: &str, db_type: DatabaseType) -> Option<StatementKind> {
    let dialect = get_dialect(db_type);
    let statements = Parser::parse_sql(dialect.as_ref(), sql).ok()?;
    let stmt = statements.first()?;
    Some(match stmt {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Insert(_) | SetExpr::Update(_) => StatementKind::Execute,
            _ => StatementKind::Query,
        },
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ExplainTable { .. }
        | Statement::Explain { .. }
        | Statement::Pragma { .. } => StatementKind::Query,
        _ => StatementKind::Execute,
    })
}

/// True when the statement carries a RETURNING clause outside string literals.
fn has_returning(sql: &str, db_type: DatabaseType) -> bool {
    let dialect = get_dialect(db_type);
    match Tokenizer::new(dialect.as_ref(), sql).tokenize() {
        Ok(tokens) => tokens
            .iter()
            .any(|t| matches!(t, Token::Word(w) if w.keyword == Keyword::RETURNING)),
        Err(_) => sql.to_ascii_uppercase().contains(" RETURNING "),
    }
}
