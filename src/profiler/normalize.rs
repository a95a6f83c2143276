//! Query pattern normalization.
//!
//! Two statements that differ only in literal values map to the same pattern:
//! numeric and string literals and placeholders become `?`, `IN (?, ?, ...)`
//! lists become `IN (?+)`, keywords are upper-cased and whitespace and
//! comments collapse to single spaces.

use crate::models::DatabaseType;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect};
use sqlparser::tokenizer::{Token, Tokenizer};

/// Normalize `sql` into its literal-free pattern.
pub fn normalize(sql: &str) -> String {
    normalize_with(&GenericDialect {}, sql)
}

/// Normalize `sql` as `db_type` reads it. MySQL takes `"..."` as a string
/// literal, so those become `?` as well.
pub fn normalize_for(sql: &str, db_type: DatabaseType) -> String {
    match db_type {
        DatabaseType::MySQL => normalize_with(&MySqlDialect {}, sql),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => normalize(sql),
    }
}

fn normalize_with(dialect: &dyn Dialect, sql: &str) -> String {
    match Tokenizer::new(dialect, sql).tokenize() {
        Ok(tokens) => {
            let parts: Vec<String> = tokens.iter().filter_map(normalize_token).collect();
            join_parts(&collapse_in_lists(parts))
        }
        Err(_) => normalize_fallback(sql),
    }
}

fn normalize_token(token: &Token) -> Option<String> {
    match token {
        Token::Whitespace(_) | Token::EOF => None,
        Token::Number(..)
        | Token::SingleQuotedString(_)
        | Token::DoubleQuotedString(_)
        | Token::NationalStringLiteral(_)
        | Token::HexStringLiteral(_)
        | Token::EscapedStringLiteral(_)
        | Token::Placeholder(_) => Some("?".to_string()),
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
        other => Some(other.to_string()),
    }
}

/// Replace `IN ( ? , ? , ... )` runs with `IN (?+)`.
fn collapse_in_lists(parts: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        if parts[i] == "IN" && parts.get(i + 1).is_some_and(|p| p == "(") {
            if let Some(end) = placeholder_list_end(&parts, i + 2) {
                out.push("IN".to_string());
                out.push("(?+)".to_string());
                i = end + 1;
                continue;
            }
        }
        out.push(parts[i].clone());
        i += 1;
    }
    out
}

/// Index of the closing paren when `parts[start..]` is `? (, ?)* )`.
fn placeholder_list_end(parts: &[String], start: usize) -> Option<usize> {
    let mut i = start;
    loop {
        if parts.get(i)? != "?" {
            return None;
        }
        match parts.get(i + 1)?.as_str() {
            ")" => return Some(i + 1),
            "," => i += 2,
            _ => return None,
        }
    }
}

fn join_parts(parts: &[String]) -> String {
    let mut out = String::new();
    let mut prev: Option<&str> = None;
    for part in parts {
        let tight = matches!(part.as_str(), "," | ")" | "." | ";")
            || matches!(prev, Some("(") | Some("."));
        if prev.is_some() && !tight {
            out.push(' ');
        }
        out.push_str(part);
        prev = Some(part.as_str());
    }
    out
}

/// Character scanner used when the tokenizer rejects the input.
fn normalize_fallback(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut prev_ident = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                for n in chars.by_ref() {
                    if n == c {
                        break;
                    }
                }
                out.push('?');
                prev_ident = false;
            }
            c if c.is_ascii_digit() && !prev_ident => {
                while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                    chars.next();
                }
                out.push('?');
                prev_ident = false;
            }
            c if c.is_whitespace() => {
                if !out.ends_with(' ') && !out.is_empty() {
                    out.push(' ');
                }
                prev_ident = false;
            }
            c => {
                prev_ident = c.is_alphanumeric() || c == '_';
                out.push(c);
            }
        }
    }

    collapse_in_text(out.trim_end())
}

fn collapse_in_text(sql: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    while let Some(found) = upper[cursor..].find("IN (") {
        let list_start = cursor + found + 4;
        let Some(close) = sql[list_start..].find(')') else {
            break;
        };
        let list = &sql[list_start..list_start + close];
        out.push_str(&sql[cursor..list_start]);
        if !list.is_empty() && list.chars().all(|c| c == '?' || c == ',' || c == ' ') {
            out.push_str("?+");
        } else {
            out.push_str(list);
        }
        out.push(')');
        cursor = list_start + close + 1;
    }
    out.push_str(&sql[cursor..]);
    out
}
