//! Fluent SELECT/INSERT/UPDATE/DELETE construction.
//!
//! A [`QueryBuilder`] only describes a statement; rendering with
//! [`QueryBuilder::to_sql`] is pure and may be repeated, and execution goes
//! through a `&mut Connection`. Values are always bound, never interpolated.

use crate::cache::QueryCache;
use crate::db::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, ResultSet, Row};
use crate::query::condition::{
    Condition, Conjunction, Join, JoinType, Operator, OrderBy, Predicate, SortDirection, SqlWriter,
    TableRef, render_predicates,
};
use serde_json::Value as JsonValue;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum SelectItem {
    Column(String),
    Raw(String),
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: DatabaseType,
    prefix: String,
    columns: Vec<SelectItem>,
    distinct: bool,
    from: Option<TableRef>,
    joins: Vec<Join>,
    wheres: Vec<Predicate>,
    groups: Vec<String>,
    havings: Vec<Predicate>,
    orders: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    /// First invalid clause argument, reported by `to_sql`
    error: Option<String>,
}

impl QueryBuilder {
    pub fn new(dialect: DatabaseType, prefix: impl Into<String>) -> Self {
        Self {
            dialect,
            prefix: prefix.into(),
            columns: Vec::new(),
            distinct: false,
            from: None,
            joins: Vec::new(),
            wheres: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
            error: None,
        }
    }

    pub fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    fn fail(mut self, err: DbError) -> Self {
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
        self
    }

    // -------------------------------------------------------------------------
    // Clauses
    // -------------------------------------------------------------------------

    /// Replace the select list.
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = columns
            .iter()
            .map(|c| SelectItem::Column(c.to_string()))
            .collect();
        self
    }

    /// Append an expression to the select list verbatim.
    pub fn select_raw(mut self, expr: &str) -> Self {
        self.columns.push(SelectItem::Raw(expr.to_string()));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Set the base table. Accepts `"posts"` or `"posts AS p"`; the last
    /// call wins.
    pub fn from(mut self, table: &str) -> Self {
        self.from = Some(TableRef::parse(table));
        self
    }

    pub fn from_as(mut self, table: &str, alias: &str) -> Self {
        self.from = Some(TableRef::new(table, Some(alias.to_string())));
        self
    }

    fn add_join(mut self, join_type: JoinType, table: &str, left: &str, op: &str, right: &str) -> Self {
        let op = match Operator::parse(op) {
            Ok(op) if op.is_comparison() => op,
            Ok(op) => {
                return self.fail(DbError::invalid_input(format!(
                    "Operator '{}' cannot be used in a join condition",
                    op
                )));
            }
            Err(e) => return self.fail(e),
        };
        self.joins.push(Join {
            join_type,
            table: TableRef::parse(table),
            left: left.to_string(),
            op,
            right: right.to_string(),
        });
        self
    }

    pub fn join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.add_join(JoinType::Inner, table, left, op, right)
    }

    pub fn left_join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.add_join(JoinType::Left, table, left, op, right)
    }

    pub fn right_join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.add_join(JoinType::Right, table, left, op, right)
    }

    fn push_where(mut self, conjunction: Conjunction, condition: DbResult<Condition>) -> Self {
        match condition {
            Ok(condition) => {
                self.wheres.push(Predicate {
                    conjunction,
                    condition,
                });
                self
            }
            Err(e) => self.fail(e),
        }
    }

    /// `column op value`, joined with AND.
    pub fn where_(self, column: &str, op: &str, value: impl Into<QueryParam>) -> Self {
        let condition = Condition::from_operator(column, op, value.into());
        self.push_where(Conjunction::And, condition)
    }

    /// `column op value`, joined with OR.
    pub fn or_where(self, column: &str, op: &str, value: impl Into<QueryParam>) -> Self {
        let condition = Condition::from_operator(column, op, value.into());
        self.push_where(Conjunction::Or, condition)
    }

    pub fn where_in<V: Into<QueryParam>>(self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let condition = Condition::In {
            column: column.to_string(),
            negated: false,
            values: values.into_iter().map(Into::into).collect(),
        };
        self.push_where(Conjunction::And, Ok(condition))
    }

    pub fn where_not_in<V: Into<QueryParam>>(
        self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let condition = Condition::In {
            column: column.to_string(),
            negated: true,
            values: values.into_iter().map(Into::into).collect(),
        };
        self.push_where(Conjunction::And, Ok(condition))
    }

    pub fn where_null(self, column: &str) -> Self {
        let condition = Condition::Null {
            column: column.to_string(),
            negated: false,
        };
        self.push_where(Conjunction::And, Ok(condition))
    }

    pub fn where_not_null(self, column: &str) -> Self {
        let condition = Condition::Null {
            column: column.to_string(),
            negated: true,
        };
        self.push_where(Conjunction::And, Ok(condition))
    }

    pub fn where_between(
        self,
        column: &str,
        low: impl Into<QueryParam>,
        high: impl Into<QueryParam>,
    ) -> Self {
        let condition = Condition::Between {
            column: column.to_string(),
            low: low.into(),
            high: high.into(),
        };
        self.push_where(Conjunction::And, Ok(condition))
    }

    /// SQL fragment with `?` placeholders, joined with AND.
    pub fn where_raw(self, sql: &str, params: Vec<QueryParam>) -> Self {
        let condition = Condition::Raw {
            sql: sql.to_string(),
            params,
        };
        self.push_where(Conjunction::And, Ok(condition))
    }

    pub fn group_by(mut self, columns: &[&str]) -> Self {
        self.groups.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn having(mut self, column: &str, op: &str, value: impl Into<QueryParam>) -> Self {
        match Condition::from_operator(column, op, value.into()) {
            Ok(condition) => {
                self.havings.push(Predicate {
                    conjunction: Conjunction::And,
                    condition,
                });
                self
            }
            Err(e) => self.fail(e),
        }
    }

    /// `direction` is `"asc"` or `"desc"`, case-insensitive.
    pub fn order_by(mut self, column: &str, direction: &str) -> Self {
        match SortDirection::parse(direction) {
            Ok(direction) => {
                self.orders.push(OrderBy {
                    column: column.to_string(),
                    direction,
                });
                self
            }
            Err(e) => self.fail(e),
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// One-based page of `per_page` rows. Page 0 is treated as page 1.
    pub fn paginate(self, page: u64, per_page: u64) -> Self {
        let page = page.max(1);
        self.limit(per_page).offset((page - 1) * per_page)
    }

    /// Clear every clause, keeping dialect and prefix.
    pub fn reset(self) -> Self {
        Self::new(self.dialect, self.prefix)
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    fn check(&self) -> DbResult<&TableRef> {
        if let Some(message) = &self.error {
            return Err(DbError::invalid_input(message.clone()));
        }
        self.from
            .as_ref()
            .ok_or_else(|| DbError::invalid_input("No table given; call from() first"))
    }

    fn writer(&self) -> SqlWriter<'_> {
        let mut w = SqlWriter::new(self.dialect, &self.prefix);
        let aliases = self
            .from
            .iter()
            .chain(self.joins.iter().map(|j| &j.table))
            .filter_map(|t| t.alias.as_deref());
        for alias in aliases {
            w.add_alias(alias);
        }
        w
    }

    fn where_clause(&self, w: &mut SqlWriter<'_>) -> String {
        if self.wheres.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", render_predicates(&self.wheres, w))
        }
    }

    /// Render the SELECT with its bound parameters.
    pub fn to_sql(&self) -> DbResult<(String, Vec<QueryParam>)> {
        let table = self.check()?;
        let mut w = self.writer();

        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|item| match item {
                    SelectItem::Column(c) => w.select_item(c),
                    SelectItem::Raw(expr) => expr.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            columns,
            w.table(table)
        );

        for join in &self.joins {
            sql.push_str(&format!(
                " {} {} ON {} {} {}",
                join.join_type,
                w.table(&join.table),
                w.column(&join.left),
                join.op,
                w.column(&join.right)
            ));
        }

        sql.push_str(&self.where_clause(&mut w));

        if !self.groups.is_empty() {
            let groups: Vec<String> = self.groups.iter().map(|g| w.column(g)).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !self.havings.is_empty() {
            sql.push_str(&format!(" HAVING {}", render_predicates(&self.havings, &mut w)));
        }

        if !self.orders.is_empty() {
            let orders: Vec<String> = self
                .orders
                .iter()
                .map(|o| format!("{} {}", w.column(&o.column), o.direction))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => match self.dialect {
                // MySQL and SQLite only accept OFFSET after a LIMIT
                DatabaseType::MySQL => {
                    sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {}", offset))
                }
                DatabaseType::SQLite => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
                DatabaseType::PostgreSQL => sql.push_str(&format!(" OFFSET {}", offset)),
            },
            (None, None) => {}
        }

        Ok((sql, w.into_params()))
    }

    /// INSERT for the base table. PostgreSQL statements end in
    /// `RETURNING *` so the generated id can be read back.
    pub fn insert_sql(&self, values: &[(&str, QueryParam)]) -> DbResult<(String, Vec<QueryParam>)> {
        let table = self.check()?;
        if values.is_empty() {
            return Err(DbError::invalid_input("INSERT needs at least one column"));
        }
        let mut w = self.writer();
        let table = TableRef::new(table.name.as_str(), None);

        let columns: Vec<String> = values
            .iter()
            .map(|(c, _)| self.dialect.quote_identifier(c))
            .collect();
        let placeholders: Vec<String> = values.iter().map(|(_, v)| w.bind(v.clone())).collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            w.table(&table),
            columns.join(", "),
            placeholders.join(", ")
        );
        if self.dialect == DatabaseType::PostgreSQL {
            sql.push_str(" RETURNING *");
        }
        Ok((sql, w.into_params()))
    }

    pub fn update_sql(&self, values: &[(&str, QueryParam)]) -> DbResult<(String, Vec<QueryParam>)> {
        let table = self.check()?;
        if values.is_empty() {
            return Err(DbError::invalid_input("UPDATE needs at least one column"));
        }
        let mut w = self.writer();

        let assignments: Vec<String> = values
            .iter()
            .map(|(c, v)| format!("{} = {}", self.dialect.quote_identifier(c), w.bind(v.clone())))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", w.table(table), assignments.join(", "));
        sql.push_str(&self.where_clause(&mut w));
        Ok((sql, w.into_params()))
    }

    pub fn delete_sql(&self) -> DbResult<(String, Vec<QueryParam>)> {
        let table = self.check()?;
        let mut w = self.writer();
        let mut sql = format!("DELETE FROM {}", w.table(table));
        sql.push_str(&self.where_clause(&mut w));
        Ok((sql, w.into_params()))
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    pub async fn get(&self, conn: &mut Connection) -> DbResult<ResultSet> {
        let (sql, params) = self.to_sql()?;
        conn.raw(&sql, &params).await
    }

    pub async fn first(&self, conn: &mut Connection) -> DbResult<Option<Row>> {
        let rs = self.clone().limit(1).get(conn).await?;
        Ok(rs.into_rows().into_iter().next())
    }

    /// `COUNT(*)` over the current filters. Select list, limit and offset are
    /// replaced for the count and restored afterwards, also on error.
    ///
    /// Grouped or DISTINCT queries count their result rows: the select is
    /// wrapped as `SELECT COUNT(*) FROM (...) AS agg`.
    pub async fn count(&mut self, conn: &mut Connection) -> DbResult<i64> {
        let limit = self.limit.take();
        let offset = self.offset.take();

        let result = if self.distinct || !self.groups.is_empty() {
            self.count_rows(conn).await
        } else {
            let columns = std::mem::replace(
                &mut self.columns,
                vec![SelectItem::Raw("COUNT(*) AS aggregate".to_string())],
            );
            let result = self.get(conn).await;
            self.columns = columns;
            result
        };

        self.limit = limit;
        self.offset = offset;

        let rs = result?;
        Ok(rs
            .value(0, "aggregate")
            .and_then(aggregate_to_i64)
            .unwrap_or(0))
    }

    async fn count_rows(&self, conn: &mut Connection) -> DbResult<ResultSet> {
        let mut inner = self.clone();
        if inner.columns.is_empty() && !inner.groups.is_empty() {
            inner.columns = inner.groups.iter().cloned().map(SelectItem::Column).collect();
        }
        let (sql, params) = inner.to_sql()?;
        conn.raw(&format!("SELECT COUNT(*) AS aggregate FROM ({}) AS agg", sql), &params)
            .await
    }

    pub async fn exists(&self, conn: &mut Connection) -> DbResult<bool> {
        let mut check = self.clone().limit(1);
        check.columns = vec![SelectItem::Raw("1 AS present".to_string())];
        Ok(!check.get(conn).await?.is_empty())
    }

    /// Values of one column. A qualified column is read back by its
    /// unqualified name.
    pub async fn pluck(&self, conn: &mut Connection, column: &str) -> DbResult<Vec<JsonValue>> {
        let rs = self.clone().select(&[column]).get(conn).await?;
        let name = column.rsplit('.').next().unwrap_or(column);
        Ok(rs.column(name))
    }

    /// Insert one row and return the generated id, if any.
    pub async fn insert(
        &self,
        conn: &mut Connection,
        values: &[(&str, QueryParam)],
    ) -> DbResult<Option<i64>> {
        let (sql, params) = self.insert_sql(values)?;
        let rs = conn.raw(&sql, &params).await?;
        Ok(rs.last_insert_id())
    }

    /// Update matching rows and return how many changed.
    pub async fn update(&self, conn: &mut Connection, values: &[(&str, QueryParam)]) -> DbResult<u64> {
        let (sql, params) = self.update_sql(values)?;
        Ok(conn.raw(&sql, &params).await?.rows_affected())
    }

    pub async fn delete(&self, conn: &mut Connection) -> DbResult<u64> {
        let (sql, params) = self.delete_sql()?;
        Ok(conn.raw(&sql, &params).await?.rows_affected())
    }

    /// `get` through the result cache, keyed by the connection's database and
    /// table prefix, the rendered SQL and its parameters.
    pub async fn get_cached(
        &self,
        conn: &mut Connection,
        cache: &QueryCache,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> DbResult<ResultSet> {
        let (sql, params) = self.to_sql()?;
        let key = format!(
            "query:{}:{}:{}:{}",
            conn.database(),
            conn.prefix(),
            sql,
            serde_json::to_string(&params)?
        );
        cache
            .remember(&key, ttl, tags, async || conn.raw(&sql, &params).await)
            .await
    }
}

/// Counts come back as integers, decimals or numeric strings depending on
/// the backend.
fn aggregate_to_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}
