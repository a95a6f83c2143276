//! Schema-related data models.
//!
//! DDL definitions consumed by [`crate::db::SchemaManager`] and the
//! introspection records it returns. Table names inside definitions are
//! logical; the schema manager applies the connection prefix.

use serde::{Deserialize, Serialize};

/// Portable column types, rendered per dialect when DDL is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Auto-incrementing 64-bit primary key
    Id,
    Integer,
    BigInteger,
    Boolean,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    /// Variable-length string with a maximum length
    String(u16),
    Text,
    LongText,
    Json,
    Binary,
    Date,
    DateTime,
    Timestamp,
}

/// A column to create or modify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Raw SQL default expression, e.g. `0`, `'draft'`, `CURRENT_TIMESTAMP`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// MySQL only
    pub unsigned: bool,
    pub unique: bool,
}

impl ColumnDefinition {
    /// Create a NOT NULL column definition.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            unsigned: false,
            unique: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Index flavours supported by `add_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    Index,
    Unique,
    /// MySQL FULLTEXT, PostgreSQL GIN over `to_tsvector`
    Fulltext,
}

impl IndexKind {
    pub(crate) fn suffix(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Unique => "unique",
            Self::Fulltext => "fulltext",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Generated from table, columns and kind when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

impl IndexDefinition {
    pub fn new(columns: &[&str], kind: IndexKind) -> Self {
        Self {
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used when none was given: `{table}_{col1}_{col2}_{kind}`.
    pub fn resolved_name(&self, table: &str) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}_{}_{}", table, self.columns.join("_"), self.kind.suffix()),
        }
    }
}

/// Foreign key referential action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    /// No action (error if referenced)
    #[default]
    NoAction,
    /// Restrict (same as NoAction in most databases)
    Restrict,
    /// Cascade the operation
    Cascade,
    /// Set to NULL
    SetNull,
    /// Set to default value
    SetDefault,
}

impl ForeignKeyAction {
    /// Parse from database-specific string.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            "RESTRICT" => Self::Restrict,
            _ => Self::NoAction,
        }
    }
}

impl std::fmt::Display for ForeignKeyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAction => write!(f, "NO ACTION"),
            Self::Restrict => write!(f, "RESTRICT"),
            Self::Cascade => write!(f, "CASCADE"),
            Self::SetNull => write!(f, "SET NULL"),
            Self::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDefinition {
    /// Generated as `{table}_{column}_foreign` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub column: String,
    /// Logical name of the referenced table
    pub references_table: String,
    pub references_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

impl ForeignKeyDefinition {
    pub fn new(
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }

    pub fn resolved_name(&self, table: &str) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}_{}_foreign", table, self.column),
        }
    }
}

/// Full description of a table to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Logical table name (prefix applied by the schema manager)
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    /// Composite primary key; ignored when an `Id` column exists
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDefinition>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    pub if_not_exists: bool,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            if_not_exists: false,
        }
    }

    /// Add an auto-incrementing `id` primary key.
    pub fn id(self) -> Self {
        self.column(ColumnDefinition::new("id", ColumnType::Id))
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn string(self, name: &str, length: u16) -> Self {
        self.column(ColumnDefinition::new(name, ColumnType::String(length)))
    }

    pub fn text(self, name: &str) -> Self {
        self.column(ColumnDefinition::new(name, ColumnType::Text))
    }

    pub fn integer(self, name: &str) -> Self {
        self.column(ColumnDefinition::new(name, ColumnType::Integer))
    }

    pub fn big_integer(self, name: &str) -> Self {
        self.column(ColumnDefinition::new(name, ColumnType::BigInteger))
    }

    pub fn boolean(self, name: &str) -> Self {
        self.column(ColumnDefinition::new(name, ColumnType::Boolean))
    }

    pub fn json(self, name: &str) -> Self {
        self.column(ColumnDefinition::new(name, ColumnType::Json).nullable())
    }

    /// Nullable `created_at` and `updated_at` columns.
    pub fn timestamps(self) -> Self {
        self.column(ColumnDefinition::new("created_at", ColumnType::DateTime).nullable())
            .column(ColumnDefinition::new("updated_at", ColumnType::DateTime).nullable())
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes.push(IndexDefinition::new(columns, IndexKind::Index));
        self
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.indexes.push(IndexDefinition::new(columns, IndexKind::Unique));
        self
    }

    pub fn fulltext(mut self, columns: &[&str]) -> Self {
        self.indexes.push(IndexDefinition::new(columns, IndexKind::Fulltext));
        self
    }

    pub fn foreign(mut self, foreign_key: ForeignKeyDefinition) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }
}

/// A column as reported by introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Backend type (e.g., `varchar(30)`, `bigint`, `TEXT`)
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
}

impl IndexInfo {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            is_unique: false,
            is_primary: false,
        }
    }

    pub fn with_unique(mut self, is_unique: bool) -> Self {
        self.is_unique = is_unique;
        self
    }

    /// Primary indexes are always unique.
    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        if is_primary {
            self.is_unique = true;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub column: String,
    /// Physical name of the referenced table
    pub references_table: String,
    pub references_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_action_parse() {
        assert_eq!(ForeignKeyAction::parse("cascade"), ForeignKeyAction::Cascade);
        assert_eq!(ForeignKeyAction::parse("SET NULL"), ForeignKeyAction::SetNull);
        assert_eq!(ForeignKeyAction::parse("whatever"), ForeignKeyAction::NoAction);
        assert_eq!(ForeignKeyAction::SetDefault.to_string(), "SET DEFAULT");
    }

    #[test]
    fn test_generated_names() {
        let index = IndexDefinition::new(&["saga_id", "slug"], IndexKind::Unique);
        assert_eq!(index.resolved_name("entities"), "entities_saga_id_slug_unique");
        let named = index.with_name("custom");
        assert_eq!(named.resolved_name("entities"), "custom");

        let fk = ForeignKeyDefinition::new("saga_id", "sagas", "id");
        assert_eq!(fk.resolved_name("entities"), "entities_saga_id_foreign");
    }

    #[test]
    fn test_table_definition_builder() {
        let table = TableDefinition::new("entities")
            .id()
            .string("name", 255)
            .json("meta")
            .timestamps()
            .unique(&["name"]);
        assert_eq!(table.columns.len(), 5);
        assert_eq!(table.columns[0].column_type, ColumnType::Id);
        assert!(table.columns[2].nullable);
        assert_eq!(table.indexes[0].kind, IndexKind::Unique);
    }

    #[test]
    fn test_primary_index_is_unique() {
        let info = IndexInfo::new("PRIMARY", vec!["id".into()]).with_primary(true);
        assert!(info.is_unique);
    }
}
