//! Clause building blocks for [`super::QueryBuilder`].
//!
//! Conditions never hold SQL text for values: every value is bound through a
//! [`SqlWriter`], which hands out dialect placeholders in order.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam};
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt;

/// Operators accepted by `where_`, `or_where`, `having` and joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
}

impl Operator {
    /// Parse an operator, ignoring case and repeated whitespace.
    pub fn parse(op: &str) -> DbResult<Self> {
        let normalized = op
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        Ok(match normalized.as_str() {
            "=" | "==" => Self::Eq,
            "!=" | "<>" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "LIKE" => Self::Like,
            "NOT LIKE" => Self::NotLike,
            "IN" => Self::In,
            "NOT IN" => Self::NotIn,
            "IS NULL" => Self::IsNull,
            "IS NOT NULL" => Self::IsNotNull,
            "BETWEEN" => Self::Between,
            _ => {
                return Err(DbError::invalid_input(format!(
                    "Unsupported operator '{}'",
                    op
                )));
            }
        })
    }

    /// Operators taking exactly one bound value.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Like | Self::NotLike
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
            Self::Between => "BETWEEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjunction {
    And,
    Or,
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(direction: &str) -> DbResult<Self> {
        match direction.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Self::Asc),
            "DESC" => Ok(Self::Desc),
            _ => Err(DbError::invalid_input(format!(
                "Unsupported sort direction '{}'",
                direction
            ))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "ASC"),
            Self::Desc => write!(f, "DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner => write!(f, "INNER JOIN"),
            Self::Left => write!(f, "LEFT JOIN"),
            Self::Right => write!(f, "RIGHT JOIN"),
        }
    }
}

/// A logical table with an optional alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            name: name.into(),
            alias,
        }
    }

    /// Accepts `"posts"`, `"posts p"` and `"posts AS p"`.
    pub fn parse(spec: &str) -> Self {
        let parts: Vec<&str> = spec.split_whitespace().collect();
        match parts.as_slice() {
            [name, alias] => Self::new(*name, Some(alias.to_string())),
            [name, as_kw, alias] if as_kw.eq_ignore_ascii_case("as") => {
                Self::new(*name, Some(alias.to_string()))
            }
            _ => Self::new(spec.trim(), None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: String,
        op: Operator,
        value: QueryParam,
    },
    In {
        column: String,
        negated: bool,
        values: Vec<QueryParam>,
    },
    Null {
        column: String,
        negated: bool,
    },
    Between {
        column: String,
        low: QueryParam,
        high: QueryParam,
    },
    /// SQL fragment with its own placeholders, written as `?`
    Raw {
        sql: String,
        params: Vec<QueryParam>,
    },
}

impl Condition {
    /// Build a condition from an operator string and one value.
    ///
    /// For `IN` / `NOT IN` a JSON array value expands to one parameter per
    /// element; for `BETWEEN` it must be a two-element array.
    pub fn from_operator(column: &str, op: &str, value: QueryParam) -> DbResult<Self> {
        let column = column.to_string();
        let op = Operator::parse(op)?;
        Ok(match op {
            Operator::IsNull | Operator::IsNotNull => Self::Null {
                column,
                negated: op == Operator::IsNotNull,
            },
            Operator::In | Operator::NotIn => Self::In {
                column,
                negated: op == Operator::NotIn,
                values: expand(value),
            },
            Operator::Between => match <[QueryParam; 2]>::try_from(expand(value)) {
                Ok([low, high]) => Self::Between { column, low, high },
                Err(_) => {
                    return Err(DbError::invalid_input(
                        "BETWEEN needs exactly two values",
                    ));
                }
            },
            op => Self::Compare { column, op, value },
        })
    }

    pub(crate) fn render(&self, w: &mut SqlWriter<'_>) -> String {
        match self {
            Self::Compare { column, op, value } => {
                format!("{} {} {}", w.column(column), op, w.bind(value.clone()))
            }
            Self::In {
                column,
                negated,
                values,
            } => {
                if values.is_empty() {
                    // Empty sets: IN matches nothing, NOT IN matches everything
                    return if *negated { "1 = 1" } else { "1 = 0" }.to_string();
                }
                let placeholders: Vec<String> =
                    values.iter().map(|v| w.bind(v.clone())).collect();
                let op = if *negated { Operator::NotIn } else { Operator::In };
                format!("{} {} ({})", w.column(column), op, placeholders.join(", "))
            }
            Self::Null { column, negated } => {
                let op = if *negated {
                    Operator::IsNotNull
                } else {
                    Operator::IsNull
                };
                format!("{} {}", w.column(column), op)
            }
            Self::Between { column, low, high } => {
                let low = w.bind(low.clone());
                let high = w.bind(high.clone());
                format!("{} BETWEEN {} AND {}", w.column(column), low, high)
            }
            Self::Raw { sql, params } => {
                let mut out = String::with_capacity(sql.len());
                let mut cursor = 0;
                for (offset, param) in bind_marker_offsets(sql).into_iter().zip(params) {
                    out.push_str(&sql[cursor..offset]);
                    out.push_str(&w.bind(param.clone()));
                    cursor = offset + 1;
                }
                out.push_str(&sql[cursor..]);
                out
            }
        }
    }
}

/// Byte offsets of the `?` bind markers in a raw fragment. Question marks
/// inside string literals, quoted identifiers and comments are not markers.
fn bind_marker_offsets(sql: &str) -> Vec<usize> {
    let tokens = match Tokenizer::new(&GenericDialect {}, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(_) => return sql.match_indices('?').map(|(i, _)| i).collect(),
    };
    let markers: Vec<(u64, u64)> = tokens
        .iter()
        .filter(|t| matches!(&t.token, Token::Placeholder(p) if p == "?"))
        .map(|t| (t.span.start.line, t.span.start.column))
        .collect();

    // Spans count lines and columns in characters, starting at 1
    let mut offsets = Vec::with_capacity(markers.len());
    let mut pending = markers.iter().peekable();
    let (mut line, mut column) = (1u64, 1u64);
    for (idx, ch) in sql.char_indices() {
        if pending.next_if(|m| **m == (line, column)).is_some() {
            offsets.push(idx);
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    offsets
}

fn expand(value: QueryParam) -> Vec<QueryParam> {
    match value {
        QueryParam::Json(serde_json::Value::Array(items)) => {
            items.into_iter().map(QueryParam::from_json).collect()
        }
        other => vec![other],
    }
}

/// A condition with the conjunction joining it to the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub conjunction: Conjunction,
    pub condition: Condition,
}

/// Render predicates, dropping the first conjunction.
pub(crate) fn render_predicates(predicates: &[Predicate], w: &mut SqlWriter<'_>) -> String {
    let mut out = String::new();
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            out.push(' ');
            out.push_str(&predicate.conjunction.to_string());
            out.push(' ');
        }
        out.push_str(&predicate.condition.render(w));
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub left: String,
    pub op: Operator,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

/// Renders identifiers and collects bound parameters for one statement.
pub(crate) struct SqlWriter<'a> {
    dialect: DatabaseType,
    prefix: &'a str,
    aliases: Vec<&'a str>,
    params: Vec<QueryParam>,
}

impl<'a> SqlWriter<'a> {
    pub(crate) fn new(dialect: DatabaseType, prefix: &'a str) -> Self {
        Self {
            dialect,
            prefix,
            aliases: Vec::new(),
            params: Vec::new(),
        }
    }

    pub(crate) fn add_alias(&mut self, alias: &'a str) {
        self.aliases.push(alias);
    }

    /// Bind a value and return its placeholder.
    pub(crate) fn bind(&mut self, value: QueryParam) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    pub(crate) fn into_params(self) -> Vec<QueryParam> {
        self.params
    }

    /// Physical, quoted table name with its alias.
    pub(crate) fn table(&self, table: &TableRef) -> String {
        let name = self
            .dialect
            .quote_identifier(&format!("{}{}", self.prefix, table.name));
        match &table.alias {
            Some(alias) => format!("{} AS {}", name, self.dialect.quote_identifier(alias)),
            None => name,
        }
    }

    /// Quote a column reference. Qualifiers that are not aliases are table
    /// names and get the prefix. Anything that is not a plain
    /// `[qualifier.]column` reference is emitted unchanged.
    pub(crate) fn column(&self, expr: &str) -> String {
        let expr = expr.trim();
        if !is_column_reference(expr) {
            return expr.to_string();
        }
        match expr.split_once('.') {
            Some((qualifier, column)) => {
                let qualifier = if self.aliases.iter().any(|a| *a == qualifier) {
                    qualifier.to_string()
                } else {
                    format!("{}{}", self.prefix, qualifier)
                };
                let column = if column == "*" {
                    column.to_string()
                } else {
                    self.dialect.quote_identifier(column)
                };
                format!("{}.{}", self.dialect.quote_identifier(&qualifier), column)
            }
            None if expr == "*" => expr.to_string(),
            None => self.dialect.quote_identifier(expr),
        }
    }

    /// A select-list item, allowing `column AS alias`.
    pub(crate) fn select_item(&self, expr: &str) -> String {
        let lower = expr.to_ascii_lowercase();
        if let Some(pos) = lower.rfind(" as ") {
            let (column, alias) = (&expr[..pos], expr[pos + 4..].trim());
            if is_identifier(alias) {
                return format!(
                    "{} AS {}",
                    self.column(column),
                    self.dialect.quote_identifier(alias)
                );
            }
        }
        self.column(expr)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_column_reference(expr: &str) -> bool {
    match expr.split_once('.') {
        Some((qualifier, column)) => is_identifier(qualifier) && (column == "*" || is_identifier(column)),
        None => expr == "*" || is_identifier(expr),
    }
}
