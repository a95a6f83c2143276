//! Schema management module.
//!
//! Issues DDL (tables, columns, indexes, foreign keys) and introspects the
//! existing schema for MySQL, PostgreSQL and SQLite.
//!
//! # Architecture
//!
//! Introspection SQL lives in the `queries` submodule with constants for each
//! database type. DDL text is rendered by [`Ddl`], a pure renderer that knows
//! the dialect and table prefix, so statements can be checked without a live
//! database. [`SchemaManager`] executes both through [`Connection::raw`].
//!
//! Table names passed to the manager are logical; the connection prefix is
//! applied before anything reaches the backend. Index and constraint names are
//! physical. DDL is never retried.

use crate::db::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefinition, ColumnInfo, ColumnType, DatabaseType, ForeignKeyAction,
    ForeignKeyDefinition, ForeignKeyInfo, IndexDefinition, IndexInfo, IndexKind, QueryParam, Row,
    TableDefinition,
};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

const DEFAULT_MYSQL_CHARSET: &str = "utf8mb4";
const DEFAULT_MYSQL_COLLATION: &str = "utf8mb4_unicode_ci";

/// Text search configuration used for PostgreSQL FULLTEXT indexes.
const PG_TEXT_SEARCH_CONFIG: &str = "english";

// =============================================================================
// SQL Query Templates
// =============================================================================
//
// Introspection queries adapted to each database's system catalogs. Every
// column is aliased to the same lowercase name across backends so the row
// readers below are shared.

mod queries {
    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT table_name::text AS table_name
            FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_type = 'BASE TABLE'
            ORDER BY table_name
        "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable::text AS is_nullable,
                c.column_default::text AS column_default,
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                        AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                      AND tc.table_schema = c.table_schema
                      AND tc.table_name = c.table_name
                      AND kcu.column_name = c.column_name
                ) AS is_primary_key
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema()
              AND c.table_name = $1
            ORDER BY c.ordinal_position
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
            SELECT
                i.relname::text AS index_name,
                string_agg(a.attname::text, ',' ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS column_names,
                ix.indisunique AS is_unique,
                ix.indisprimary AS is_primary
            FROM pg_class t
            JOIN pg_index ix ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            LEFT JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE t.relname = $1
              AND n.nspname = current_schema()
            GROUP BY i.relname, ix.indisunique, ix.indisprimary
            ORDER BY i.relname
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
            SELECT
                tc.constraint_name::text AS constraint_name,
                kcu.column_name::text AS column_name,
                ccu.table_name::text AS foreign_table,
                ccu.column_name::text AS foreign_column,
                rc.update_rule::text AS on_update,
                rc.delete_rule::text AS on_delete
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON ccu.constraint_name = tc.constraint_name
                AND ccu.table_schema = tc.table_schema
            JOIN information_schema.referential_constraints rc
                ON rc.constraint_name = tc.constraint_name
                AND rc.constraint_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = current_schema()
              AND tc.table_name = $1
            ORDER BY tc.constraint_name
        "#;
    }

    pub mod mysql {
        // CONVERT(... USING utf8mb4) keeps information_schema columns out of
        // binary collations, which would otherwise decode as bytes.
        pub const LIST_TABLES: &str = r#"
            SELECT CONVERT(TABLE_NAME USING utf8mb4) AS table_name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
              AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT
                CONVERT(COLUMN_NAME USING utf8mb4) AS column_name,
                CONVERT(COLUMN_TYPE USING utf8mb4) AS data_type,
                CONVERT(IS_NULLABLE USING utf8mb4) AS is_nullable,
                CONVERT(COLUMN_DEFAULT USING utf8mb4) AS column_default,
                COLUMN_KEY = 'PRI' AS is_primary_key
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE()
              AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
            SELECT
                CONVERT(INDEX_NAME USING utf8mb4) AS index_name,
                CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX SEPARATOR ',') USING utf8mb4) AS column_names,
                MIN(NON_UNIQUE) = 0 AS is_unique,
                INDEX_NAME = 'PRIMARY' AS is_primary
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE()
              AND TABLE_NAME = ?
            GROUP BY INDEX_NAME
            ORDER BY INDEX_NAME
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
            SELECT
                CONVERT(k.CONSTRAINT_NAME USING utf8mb4) AS constraint_name,
                CONVERT(k.COLUMN_NAME USING utf8mb4) AS column_name,
                CONVERT(k.REFERENCED_TABLE_NAME USING utf8mb4) AS foreign_table,
                CONVERT(k.REFERENCED_COLUMN_NAME USING utf8mb4) AS foreign_column,
                CONVERT(r.UPDATE_RULE USING utf8mb4) AS on_update,
                CONVERT(r.DELETE_RULE USING utf8mb4) AS on_delete
            FROM information_schema.KEY_COLUMN_USAGE k
            JOIN information_schema.REFERENTIAL_CONSTRAINTS r
                ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
                AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
            WHERE k.TABLE_SCHEMA = DATABASE()
              AND k.TABLE_NAME = ?
              AND k.REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
        "#;
    }

    pub mod sqlite {
        pub const LIST_TABLES: &str = r#"
            SELECT name AS table_name
            FROM sqlite_master
            WHERE type = 'table'
              AND name NOT LIKE 'sqlite_%'
            ORDER BY name
        "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT
                name AS column_name,
                type AS data_type,
                "notnull" AS not_null,
                dflt_value AS column_default,
                pk AS is_primary_key
            FROM pragma_table_info(?)
            ORDER BY cid
        "#;

        pub const LIST_INDEXES: &str = r#"
            SELECT name AS index_name, "unique" AS is_unique, origin
            FROM pragma_index_list(?)
            ORDER BY name
        "#;

        pub const INDEX_COLUMNS: &str = r#"
            SELECT name AS column_name
            FROM pragma_index_info(?)
            ORDER BY seqno
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
            SELECT
                "from" AS column_name,
                "table" AS foreign_table,
                "to" AS foreign_column,
                on_update,
                on_delete
            FROM pragma_foreign_key_list(?)
            ORDER BY id, seq
        "#;
    }
}

// =============================================================================
// DDL rendering
// =============================================================================

/// Renders DDL statements for one dialect and table prefix.
#[derive(Debug, Clone)]
pub struct Ddl {
    dialect: DatabaseType,
    prefix: String,
    charset: Option<String>,
    collation: Option<String>,
}

impl Ddl {
    pub fn new(dialect: DatabaseType, prefix: impl Into<String>) -> Self {
        Self {
            dialect,
            prefix: prefix.into(),
            charset: None,
            collation: None,
        }
    }

    /// MySQL table options; ignored by the other dialects.
    pub fn with_charset(mut self, charset: Option<String>, collation: Option<String>) -> Self {
        self.charset = charset;
        self.collation = collation;
        self
    }

    fn for_connection(conn: &Connection) -> Self {
        let config = conn.config();
        Self::new(conn.dialect(), conn.prefix())
            .with_charset(config.charset.clone(), config.collation.clone())
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn table(&self, logical: &str) -> String {
        self.quote(&format!("{}{}", self.prefix, logical))
    }

    fn physical(&self, logical: &str) -> String {
        format!("{}{}", self.prefix, logical)
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Column clause without the leading `ADD COLUMN` / `MODIFY COLUMN`.
    pub fn column_sql(&self, column: &ColumnDefinition) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote(&column.name),
            self.dialect.column_type_sql(column.column_type, column.unsigned)
        );
        if column.column_type == ColumnType::Id {
            return sql;
        }
        sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if column.unique {
            sql.push_str(" UNIQUE");
        }
        sql
    }

    fn foreign_key_clause(&self, table: &str, fk: &ForeignKeyDefinition) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            self.quote(&fk.resolved_name(&self.physical(table))),
            self.quote(&fk.column),
            self.table(&fk.references_table),
            self.quote(&fk.references_column),
            fk.on_delete,
            fk.on_update,
        )
    }

    /// `CREATE TABLE` followed by one `CREATE INDEX` per declared index.
    pub fn create_table(&self, def: &TableDefinition) -> DbResult<Vec<String>> {
        if def.columns.is_empty() {
            return Err(DbError::schema(
                "create_table",
                format!("table '{}' has no columns", def.name),
            ));
        }

        let mut parts: Vec<String> = def.columns.iter().map(|c| self.column_sql(c)).collect();

        let has_id = def.columns.iter().any(|c| c.column_type == ColumnType::Id);
        if !has_id && !def.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", self.column_list(&def.primary_key)));
        }
        for fk in &def.foreign_keys {
            parts.push(self.foreign_key_clause(&def.name, fk));
        }

        let mut sql = format!(
            "CREATE TABLE {}{} ({})",
            if def.if_not_exists { "IF NOT EXISTS " } else { "" },
            self.table(&def.name),
            parts.join(", ")
        );
        if self.dialect == DatabaseType::MySQL {
            sql.push_str(&format!(
                " ENGINE=InnoDB DEFAULT CHARSET={} COLLATE={}",
                self.charset.as_deref().unwrap_or(DEFAULT_MYSQL_CHARSET),
                self.collation.as_deref().unwrap_or(DEFAULT_MYSQL_COLLATION),
            ));
        }

        let mut statements = vec![sql];
        for index in &def.indexes {
            statements.push(self.add_index(&def.name, index)?);
        }
        Ok(statements)
    }

    pub fn drop_table(&self, table: &str, if_exists: bool) -> String {
        format!(
            "DROP TABLE {}{}",
            if if_exists { "IF EXISTS " } else { "" },
            self.table(table)
        )
    }

    pub fn rename_table(&self, from: &str, to: &str) -> String {
        match self.dialect {
            DatabaseType::MySQL => format!("RENAME TABLE {} TO {}", self.table(from), self.table(to)),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                format!("ALTER TABLE {} RENAME TO {}", self.table(from), self.table(to))
            }
        }
    }

    pub fn add_column(&self, table: &str, column: &ColumnDefinition) -> String {
        format!("ALTER TABLE {} ADD COLUMN {}", self.table(table), self.column_sql(column))
    }

    pub fn modify_column(&self, table: &str, column: &ColumnDefinition) -> DbResult<Vec<String>> {
        match self.dialect {
            DatabaseType::MySQL => Ok(vec![format!(
                "ALTER TABLE {} MODIFY COLUMN {}",
                self.table(table),
                self.column_sql(column)
            )]),
            DatabaseType::PostgreSQL => {
                if column.column_type == ColumnType::Id {
                    return Err(DbError::schema(
                        "modify_column",
                        "cannot change an existing column into an auto-increment key",
                    ));
                }
                let table = self.table(table);
                let name = self.quote(&column.name);
                let ty = self.dialect.column_type_sql(column.column_type, false);
                let mut statements = vec![format!(
                    "ALTER TABLE {table} ALTER COLUMN {name} TYPE {ty} USING {name}::{ty}"
                )];
                statements.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {name} {} NOT NULL",
                    if column.nullable { "DROP" } else { "SET" }
                ));
                statements.push(match &column.default {
                    Some(default) => {
                        format!("ALTER TABLE {table} ALTER COLUMN {name} SET DEFAULT {default}")
                    }
                    None => format!("ALTER TABLE {table} ALTER COLUMN {name} DROP DEFAULT"),
                });
                Ok(statements)
            }
            DatabaseType::SQLite => Err(unsupported("modify_column")),
        }
    }

    pub fn drop_column(&self, table: &str, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", self.table(table), self.quote(column))
    }

    pub fn rename_column(&self, table: &str, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.table(table),
            self.quote(from),
            self.quote(to)
        )
    }

    pub fn add_index(&self, table: &str, index: &IndexDefinition) -> DbResult<String> {
        if index.columns.is_empty() {
            return Err(DbError::schema("add_index", "index has no columns"));
        }
        let name = self.quote(&index.resolved_name(&self.physical(table)));
        let target = self.table(table);
        let columns = self.column_list(&index.columns);

        match (index.kind, self.dialect) {
            (IndexKind::Index, _) => Ok(format!("CREATE INDEX {name} ON {target} ({columns})")),
            (IndexKind::Unique, _) => {
                Ok(format!("CREATE UNIQUE INDEX {name} ON {target} ({columns})"))
            }
            (IndexKind::Fulltext, DatabaseType::MySQL) => {
                Ok(format!("CREATE FULLTEXT INDEX {name} ON {target} ({columns})"))
            }
            (IndexKind::Fulltext, DatabaseType::PostgreSQL) => {
                let document = index
                    .columns
                    .iter()
                    .map(|c| format!("coalesce({}, '')", self.quote(c)))
                    .collect::<Vec<_>>()
                    .join(" || ' ' || ");
                Ok(format!(
                    "CREATE INDEX {name} ON {target} USING GIN (to_tsvector('{PG_TEXT_SEARCH_CONFIG}', {document}))"
                ))
            }
            (IndexKind::Fulltext, DatabaseType::SQLite) => Err(unsupported("add_index (FULLTEXT)")),
        }
    }

    pub fn drop_index(&self, table: &str, name: &str) -> String {
        match self.dialect {
            DatabaseType::MySQL => {
                format!("DROP INDEX {} ON {}", self.quote(name), self.table(table))
            }
            DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                format!("DROP INDEX {}", self.quote(name))
            }
        }
    }

    pub fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDefinition) -> DbResult<String> {
        match self.dialect {
            DatabaseType::SQLite => Err(unsupported("add_foreign_key")),
            DatabaseType::MySQL | DatabaseType::PostgreSQL => Ok(format!(
                "ALTER TABLE {} ADD {}",
                self.table(table),
                self.foreign_key_clause(table, fk)
            )),
        }
    }

    pub fn drop_foreign_key(&self, table: &str, name: &str) -> DbResult<String> {
        match self.dialect {
            DatabaseType::SQLite => Err(unsupported("drop_foreign_key")),
            DatabaseType::MySQL => Ok(format!(
                "ALTER TABLE {} DROP FOREIGN KEY {}",
                self.table(table),
                self.quote(name)
            )),
            DatabaseType::PostgreSQL => Ok(format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                self.table(table),
                self.quote(name)
            )),
        }
    }
}

fn unsupported(operation: &str) -> DbError {
    DbError::schema(operation, "not supported by SQLite; recreate the table instead")
}

/// Wrap any failure into a schema error for `operation`, keeping the backend text.
fn schema_error(operation: &'static str) -> impl FnOnce(DbError) -> DbError {
    move |err| match err {
        DbError::Schema { .. } => err,
        DbError::Query { message, .. } => DbError::schema(operation, message),
        other => DbError::schema(operation, other.to_string()),
    }
}

// =============================================================================
// Schema manager
// =============================================================================

/// Issues DDL and introspects the schema through a borrowed connection.
pub struct SchemaManager<'c> {
    conn: &'c mut Connection,
    ddl: Ddl,
}

impl<'c> SchemaManager<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        let ddl = Ddl::for_connection(conn);
        Self { conn, ddl }
    }

    pub fn ddl(&self) -> &Ddl {
        &self.ddl
    }

    async fn execute(&mut self, operation: &'static str, sql: &str) -> DbResult<()> {
        debug!(operation, sql, "Executing DDL");
        self.conn
            .raw(sql, &[])
            .await
            .map(|_| ())
            .map_err(schema_error(operation))
    }

    async fn execute_all(&mut self, operation: &'static str, statements: &[String]) -> DbResult<()> {
        for sql in statements {
            self.execute(operation, sql).await?;
        }
        Ok(())
    }

    async fn introspect(
        &mut self,
        operation: &'static str,
        sql: &str,
        table: Option<&str>,
    ) -> DbResult<Vec<Row>> {
        let params: Vec<QueryParam> = table.map(QueryParam::from).into_iter().collect();
        self.conn
            .raw(sql, &params)
            .await
            .map(|rs| rs.into_rows())
            .map_err(schema_error(operation))
    }

    // -------------------------------------------------------------------------
    // Tables
    // -------------------------------------------------------------------------

    /// Create a table with its indexes and inline foreign keys.
    ///
    /// With `if_not_exists`, an existing table is left untouched, indexes included.
    pub async fn create_table(&mut self, def: &TableDefinition) -> DbResult<()> {
        if def.if_not_exists && self.has_table(&def.name).await? {
            debug!(table = %def.name, "Table exists, skipping create");
            return Ok(());
        }
        let statements = self.ddl.create_table(def)?;
        self.execute_all("create_table", &statements).await?;
        info!(table = %self.ddl.physical(&def.name), "Created table");
        Ok(())
    }

    pub async fn drop_table(&mut self, table: &str) -> DbResult<()> {
        let sql = self.ddl.drop_table(table, false);
        self.execute("drop_table", &sql).await?;
        info!(table = %self.ddl.physical(table), "Dropped table");
        Ok(())
    }

    pub async fn drop_table_if_exists(&mut self, table: &str) -> DbResult<()> {
        let sql = self.ddl.drop_table(table, true);
        self.execute("drop_table_if_exists", &sql).await
    }

    pub async fn rename_table(&mut self, from: &str, to: &str) -> DbResult<()> {
        let sql = self.ddl.rename_table(from, to);
        self.execute("rename_table", &sql).await
    }

    pub async fn has_table(&mut self, table: &str) -> DbResult<bool> {
        let physical = self.ddl.physical(table);
        let rows = self
            .introspect("has_table", list_tables_sql(self.ddl.dialect), None)
            .await?;
        Ok(rows.iter().any(|row| text(row, "table_name").as_deref() == Some(physical.as_str())))
    }

    /// Logical names of the tables under the managed prefix.
    pub async fn list_tables(&mut self) -> DbResult<Vec<String>> {
        let rows = self
            .introspect("list_tables", list_tables_sql(self.ddl.dialect), None)
            .await?;
        let prefix = &self.ddl.prefix;
        Ok(rows
            .iter()
            .filter_map(|row| text(row, "table_name"))
            .filter_map(|name| name.strip_prefix(prefix.as_str()).map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect())
    }

    // -------------------------------------------------------------------------
    // Columns
    // -------------------------------------------------------------------------

    pub async fn add_column(&mut self, table: &str, column: &ColumnDefinition) -> DbResult<()> {
        let sql = self.ddl.add_column(table, column);
        self.execute("add_column", &sql).await
    }

    pub async fn modify_column(&mut self, table: &str, column: &ColumnDefinition) -> DbResult<()> {
        let statements = self.ddl.modify_column(table, column)?;
        self.execute_all("modify_column", &statements).await
    }

    pub async fn drop_column(&mut self, table: &str, column: &str) -> DbResult<()> {
        let sql = self.ddl.drop_column(table, column);
        self.execute("drop_column", &sql).await
    }

    pub async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> DbResult<()> {
        let sql = self.ddl.rename_column(table, from, to);
        self.execute("rename_column", &sql).await
    }

    pub async fn has_column(&mut self, table: &str, column: &str) -> DbResult<bool> {
        Ok(self.list_columns(table).await?.iter().any(|c| c.name == column))
    }

    /// Columns of a table in declaration order. Empty when the table is missing.
    pub async fn list_columns(&mut self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        let physical = self.ddl.physical(table);
        let dialect = self.ddl.dialect;
        let sql = match dialect {
            DatabaseType::PostgreSQL => queries::postgres::DESCRIBE_COLUMNS,
            DatabaseType::MySQL => queries::mysql::DESCRIBE_COLUMNS,
            DatabaseType::SQLite => queries::sqlite::DESCRIBE_COLUMNS,
        };
        let rows = self.introspect("list_columns", sql, Some(physical.as_str())).await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let nullable = match dialect {
                    DatabaseType::SQLite => !flag(row, "not_null"),
                    DatabaseType::MySQL | DatabaseType::PostgreSQL => flag(row, "is_nullable"),
                };
                Some(ColumnInfo {
                    name: text(row, "column_name")?,
                    data_type: text(row, "data_type").unwrap_or_default(),
                    nullable,
                    default_value: text(row, "column_default"),
                    is_primary_key: flag(row, "is_primary_key"),
                })
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Indexes
    // -------------------------------------------------------------------------

    pub async fn add_index(&mut self, table: &str, index: &IndexDefinition) -> DbResult<()> {
        let sql = self.ddl.add_index(table, index)?;
        self.execute("add_index", &sql).await
    }

    /// Drop an index by its physical name.
    pub async fn drop_index(&mut self, table: &str, name: &str) -> DbResult<()> {
        let sql = self.ddl.drop_index(table, name);
        self.execute("drop_index", &sql).await
    }

    pub async fn has_index(&mut self, table: &str, name: &str) -> DbResult<bool> {
        Ok(self.list_indexes(table).await?.iter().any(|i| i.name == name))
    }

    pub async fn list_indexes(&mut self, table: &str) -> DbResult<Vec<IndexInfo>> {
        let physical = self.ddl.physical(table);
        match self.ddl.dialect {
            DatabaseType::PostgreSQL => {
                let rows = self
                    .introspect("list_indexes", queries::postgres::DESCRIBE_INDEXES, Some(physical.as_str()))
                    .await?;
                Ok(aggregated_indexes(&rows))
            }
            DatabaseType::MySQL => {
                let rows = self
                    .introspect("list_indexes", queries::mysql::DESCRIBE_INDEXES, Some(physical.as_str()))
                    .await?;
                Ok(aggregated_indexes(&rows))
            }
            DatabaseType::SQLite => {
                let rows = self
                    .introspect("list_indexes", queries::sqlite::LIST_INDEXES, Some(physical.as_str()))
                    .await?;
                let mut indexes = Vec::with_capacity(rows.len());
                for row in &rows {
                    let Some(name) = text(row, "index_name") else {
                        continue;
                    };
                    let columns = self
                        .introspect("list_indexes", queries::sqlite::INDEX_COLUMNS, Some(name.as_str()))
                        .await?
                        .iter()
                        .filter_map(|r| text(r, "column_name"))
                        .collect();
                    let is_primary = text(row, "origin").as_deref() == Some("pk");
                    indexes.push(
                        IndexInfo::new(name, columns)
                            .with_unique(flag(row, "is_unique"))
                            .with_primary(is_primary),
                    );
                }
                Ok(indexes)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Foreign keys
    // -------------------------------------------------------------------------

    pub async fn add_foreign_key(&mut self, table: &str, fk: &ForeignKeyDefinition) -> DbResult<()> {
        let sql = self.ddl.add_foreign_key(table, fk)?;
        self.execute("add_foreign_key", &sql).await
    }

    /// Drop a foreign key constraint by its physical name.
    pub async fn drop_foreign_key(&mut self, table: &str, name: &str) -> DbResult<()> {
        let sql = self.ddl.drop_foreign_key(table, name)?;
        self.execute("drop_foreign_key", &sql).await
    }

    /// True when `column` of `table` references another table.
    pub async fn has_foreign_key(&mut self, table: &str, column: &str) -> DbResult<bool> {
        Ok(self
            .list_foreign_keys(table)
            .await?
            .iter()
            .any(|fk| fk.column == column))
    }

    /// SQLite does not expose constraint names, so `name` is `None` there.
    pub async fn list_foreign_keys(&mut self, table: &str) -> DbResult<Vec<ForeignKeyInfo>> {
        let physical = self.ddl.physical(table);
        let sql = match self.ddl.dialect {
            DatabaseType::PostgreSQL => queries::postgres::DESCRIBE_FOREIGN_KEYS,
            DatabaseType::MySQL => queries::mysql::DESCRIBE_FOREIGN_KEYS,
            DatabaseType::SQLite => queries::sqlite::DESCRIBE_FOREIGN_KEYS,
        };
        let rows = self.introspect("list_foreign_keys", sql, Some(physical.as_str())).await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(ForeignKeyInfo {
                    name: text(row, "constraint_name"),
                    column: text(row, "column_name")?,
                    references_table: text(row, "foreign_table")?,
                    references_column: text(row, "foreign_column").unwrap_or_default(),
                    on_delete: action(row, "on_delete"),
                    on_update: action(row, "on_update"),
                })
            })
            .collect())
    }
}

fn list_tables_sql(dialect: DatabaseType) -> &'static str {
    match dialect {
        DatabaseType::PostgreSQL => queries::postgres::LIST_TABLES,
        DatabaseType::MySQL => queries::mysql::LIST_TABLES,
        DatabaseType::SQLite => queries::sqlite::LIST_TABLES,
    }
}

/// Index rows whose columns were aggregated into a comma-separated list.
fn aggregated_indexes(rows: &[Row]) -> Vec<IndexInfo> {
    rows.iter()
        .filter_map(|row| {
            let name = text(row, "index_name")?;
            // Expression indexes (e.g. GIN over to_tsvector) have no plain columns
            let columns = text(row, "column_names")
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(
                IndexInfo::new(name, columns)
                    .with_unique(flag(row, "is_unique"))
                    .with_primary(flag(row, "is_primary")),
            )
        })
        .collect()
}

fn text(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn flag(row: &Row, key: &str) -> bool {
    match row.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(JsonValue::String(s)) => {
            matches!(s.to_ascii_uppercase().as_str(), "YES" | "TRUE" | "T" | "1")
        }
        _ => false,
    }
}

fn action(row: &Row, key: &str) -> ForeignKeyAction {
    text(row, key)
        .map(|s| ForeignKeyAction::parse(&s))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionConfig, ForeignKeyAction};

    fn posts() -> TableDefinition {
        TableDefinition::new("posts")
            .id()
            .string("title", 200)
            .text("body")
            .integer("user_id")
            .index(&["user_id"])
            .fulltext(&["title", "body"])
            .foreign(
                ForeignKeyDefinition::new("user_id", "users", "id")
                    .on_delete(ForeignKeyAction::Cascade),
            )
    }

    #[test]
    fn test_mysql_create_table() {
        let ddl = Ddl::new(DatabaseType::MySQL, "app_");
        let statements = ddl.create_table(&posts()).unwrap();

        assert_eq!(statements.len(), 3);
        let create = &statements[0];
        assert!(create.starts_with("CREATE TABLE `app_posts` ("));
        assert!(create.contains("`id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY"));
        assert!(create.contains("`title` VARCHAR(200) NOT NULL"));
        assert!(create.contains(
            "CONSTRAINT `app_posts_user_id_foreign` FOREIGN KEY (`user_id`) REFERENCES `app_users` (`id`) ON DELETE CASCADE ON UPDATE NO ACTION"
        ));
        assert!(create.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci"));
        assert_eq!(
            statements[1],
            "CREATE INDEX `app_posts_user_id_index` ON `app_posts` (`user_id`)"
        );
        assert_eq!(
            statements[2],
            "CREATE FULLTEXT INDEX `app_posts_title_body_fulltext` ON `app_posts` (`title`, `body`)"
        );
    }

    #[test]
    fn test_mysql_charset_override() {
        let ddl = Ddl::new(DatabaseType::MySQL, "")
            .with_charset(Some("latin1".into()), Some("latin1_swedish_ci".into()));
        let statements = ddl.create_table(&TableDefinition::new("t").id()).unwrap();
        assert!(statements[0].ends_with("DEFAULT CHARSET=latin1 COLLATE=latin1_swedish_ci"));
    }

    #[test]
    fn test_postgres_fulltext_uses_gin() {
        let ddl = Ddl::new(DatabaseType::PostgreSQL, "");
        let sql = ddl
            .add_index("posts", &IndexDefinition::new(&["title", "body"], IndexKind::Fulltext))
            .unwrap();
        assert_eq!(
            sql,
            "CREATE INDEX \"posts_title_body_fulltext\" ON \"posts\" USING GIN (to_tsvector('english', coalesce(\"title\", '') || ' ' || coalesce(\"body\", '')))"
        );
    }

    #[test]
    fn test_postgres_modify_column() {
        let ddl = Ddl::new(DatabaseType::PostgreSQL, "");
        let column = ColumnDefinition::new("status", ColumnType::String(20)).default_value("'draft'");
        let statements = ddl.modify_column("posts", &column).unwrap();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"posts\" ALTER COLUMN \"status\" TYPE VARCHAR(20) USING \"status\"::VARCHAR(20)",
                "ALTER TABLE \"posts\" ALTER COLUMN \"status\" SET NOT NULL",
                "ALTER TABLE \"posts\" ALTER COLUMN \"status\" SET DEFAULT 'draft'",
            ]
        );
    }

    #[test]
    fn test_composite_primary_key() {
        let ddl = Ddl::new(DatabaseType::SQLite, "");
        let def = TableDefinition::new("tags")
            .integer("post_id")
            .string("tag", 50)
            .primary_key(&["post_id", "tag"]);
        let statements = ddl.create_table(&def).unwrap();
        assert!(statements[0].ends_with("PRIMARY KEY (\"post_id\", \"tag\"))"));
    }

    #[test]
    fn test_rename_and_drop_per_dialect() {
        let mysql = Ddl::new(DatabaseType::MySQL, "p_");
        let pg = Ddl::new(DatabaseType::PostgreSQL, "p_");
        assert_eq!(mysql.rename_table("a", "b"), "RENAME TABLE `p_a` TO `p_b`");
        assert_eq!(pg.rename_table("a", "b"), "ALTER TABLE \"p_a\" RENAME TO \"p_b\"");
        assert_eq!(mysql.drop_index("a", "idx"), "DROP INDEX `idx` ON `p_a`");
        assert_eq!(pg.drop_index("a", "idx"), "DROP INDEX \"idx\"");
        assert_eq!(pg.drop_table("a", true), "DROP TABLE IF EXISTS \"p_a\"");
        assert_eq!(
            mysql.drop_foreign_key("a", "fk").unwrap(),
            "ALTER TABLE `p_a` DROP FOREIGN KEY `fk`"
        );
        assert_eq!(
            pg.drop_foreign_key("a", "fk").unwrap(),
            "ALTER TABLE \"p_a\" DROP CONSTRAINT \"fk\""
        );
    }

    #[test]
    fn test_sqlite_unsupported_operations() {
        let ddl = Ddl::new(DatabaseType::SQLite, "");
        let column = ColumnDefinition::new("x", ColumnType::Integer);
        let fk = ForeignKeyDefinition::new("user_id", "users", "id");

        for err in [
            ddl.modify_column("t", &column).unwrap_err(),
            ddl.add_foreign_key("t", &fk).unwrap_err(),
            ddl.drop_foreign_key("t", "fk").unwrap_err(),
            ddl.add_index("t", &IndexDefinition::new(&["x"], IndexKind::Fulltext))
                .unwrap_err(),
        ] {
            assert!(matches!(err, DbError::Schema { .. }), "{err:?}");
        }
    }

    #[test]
    fn test_empty_table_is_rejected() {
        let ddl = Ddl::new(DatabaseType::SQLite, "");
        let err = ddl.create_table(&TableDefinition::new("t")).unwrap_err();
        assert!(matches!(err, DbError::Schema { operation, .. } if operation == "create_table"));
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_through_manager() {
        let mut conn = Connection::open(ConnectionConfig::memory().with_prefix("app_"))
            .await
            .unwrap();
        let mut schema = SchemaManager::new(&mut conn);

        schema
            .create_table(&TableDefinition::new("users").id().string("email", 100).unique(&["email"]))
            .await
            .unwrap();
        schema
            .create_table(
                &TableDefinition::new("posts")
                    .id()
                    .integer("user_id")
                    .foreign(ForeignKeyDefinition::new("user_id", "users", "id")),
            )
            .await
            .unwrap();

        assert_eq!(schema.list_tables().await.unwrap(), vec!["posts", "users"]);
        assert!(schema.has_table("users").await.unwrap());
        assert!(!schema.has_table("comments").await.unwrap());
        assert!(schema.has_column("users", "email").await.unwrap());
        assert!(schema.has_index("users", "app_users_email_unique").await.unwrap());
        assert!(schema.has_foreign_key("posts", "user_id").await.unwrap());

        let fks = schema.list_foreign_keys("posts").await.unwrap();
        assert_eq!(fks[0].references_table, "app_users");
        assert_eq!(fks[0].name, None);
    }

    #[tokio::test]
    async fn test_ddl_failure_is_schema_error() {
        let mut conn = Connection::open(ConnectionConfig::memory()).await.unwrap();
        let mut schema = SchemaManager::new(&mut conn);

        let err = schema.drop_table("missing").await.unwrap_err();
        match err {
            DbError::Schema { operation, message } => {
                assert_eq!(operation, "drop_table");
                assert!(message.contains("no such table"), "{message}");
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }
}
