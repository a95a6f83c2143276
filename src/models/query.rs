//! Query-related data models.
//!
//! This module defines bound parameter values and the [`ResultSet`] returned
//! by every statement executed through a connection.

use crate::error::DbResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// One decoded row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured value bound as JSON text
    Json(JsonValue),
}

/// Placeholder type chosen for a bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Binary,
    Json,
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Placeholder type derived from the concrete value.
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Null => ParamKind::Null,
            Self::Bool(_) => ParamKind::Boolean,
            Self::Int(_) => ParamKind::Integer,
            Self::Float(_) => ParamKind::Float,
            Self::String(_) => ParamKind::String,
            Self::Bytes(_) => ParamKind::Binary,
            Self::Json(_) => ParamKind::Json,
        }
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Convert a JSON value into the closest scalar parameter.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for QueryParam {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::from_json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Rows returned by a statement, plus write counters.
///
/// Immutable once built; serializable so query results can be cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Row>,
    rows_affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_insert_id: Option<i64>,
}

impl ResultSet {
    /// Result of a read statement.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
            last_insert_id: None,
        }
    }

    /// Result of a write statement that returned no rows.
    pub fn write_result(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
            last_insert_id,
        }
    }

    pub(crate) fn with_write_counters(mut self, rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        self.rows_affected = rows_affected;
        self.last_insert_id = last_insert_id;
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Value of `column` in row `row`, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&JsonValue> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Every value of one column, in row order. Missing cells are `null`.
    pub fn column(&self, name: &str) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|r| r.get(name).cloned().unwrap_or(JsonValue::Null))
            .collect()
    }

    /// Map `key_col` to `value_col`; later rows win on duplicate keys.
    pub fn key_value(&self, key_col: &str, value_col: &str) -> Row {
        self.rows
            .iter()
            .filter_map(|r| {
                let key = r.get(key_col).map(json_key)?;
                Some((key, r.get(value_col).cloned().unwrap_or(JsonValue::Null)))
            })
            .collect()
    }

    /// Group rows by the value of `column`. Rows without it are skipped.
    pub fn group_by(&self, column: &str) -> BTreeMap<String, Vec<Row>> {
        let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for row in &self.rows {
            if let Some(key) = row.get(column).map(json_key) {
                groups.entry(key).or_default().push(row.clone());
            }
        }
        groups
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Deserialize every row into `T`.
    pub fn deserialize_rows<T: DeserializeOwned>(&self) -> DbResult<Vec<T>> {
        self.rows
            .iter()
            .map(|r| Ok(serde_json::from_value(JsonValue::Object(r.clone()))?))
            .collect()
    }
}

fn json_key(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
