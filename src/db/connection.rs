//! The connection contract.
//!
//! A [`Connection`] owns one live handle to one backend and is the only path
//! by which the query builder, transaction manager and schema manager reach
//! the database.
//!
//! # Architecture
//!
//! Statement execution uses database-specific implementations organized in
//! submodules (`mysql`, `postgres`, `sqlite`). Each provides the same
//! interface adapted to the backend's type system:
//! - statements with no parameters are sent as raw SQL (simple protocol)
//! - parameterized statements are prepared and bound through `db::params`
//! - row-producing statements are fetched, all others executed

use crate::db::pool::{DbHandle, DbPool, create_pool};
use crate::db::schema::SchemaManager;
use crate::db::statement::{self, StatementKind};
use crate::db::types::rows_to_json;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, Driver, QueryParam, ResultSet};
use crate::profiler::QueryProfiler;
use crate::query::QueryBuilder;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How the connection relates to the pool behind its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolOwnership {
    /// Built by this connection and closed on disconnect
    Owned,
    /// Built by this connection but kept across disconnects (in-memory data)
    Persistent,
    /// Owned by the host or a factory; only the handle is returned
    Borrowed,
}

/// A single logical connection to one backend.
///
/// APIs take `&mut self`: one unit of work per connection.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    dialect: DatabaseType,
    pool: Option<DbPool>,
    ownership: PoolOwnership,
    handle: Option<DbHandle>,
    profiler: Arc<QueryProfiler>,
    last_insert_id: Option<i64>,
    affected_rows: u64,
    last_error: Option<String>,
}

impl Connection {
    /// Create a disconnected connection with its own profiler.
    pub fn new(config: ConnectionConfig) -> DbResult<Self> {
        Self::with_profiler(config, Arc::new(QueryProfiler::default()))
    }

    /// Create a disconnected connection reporting to a shared profiler.
    pub fn with_profiler(config: ConnectionConfig, profiler: Arc<QueryProfiler>) -> DbResult<Self> {
        let dialect = config.database_type().ok_or_else(|| {
            DbError::connection(
                "Managed connection has no host pool",
                "Construct the configuration with ConnectionConfig::managed(pool, ..)",
            )
        })?;
        let (pool, ownership) = match config.driver {
            Driver::Managed => (config.managed_pool.clone(), PoolOwnership::Borrowed),
            Driver::Memory => (None, PoolOwnership::Persistent),
            _ => (None, PoolOwnership::Owned),
        };
        Ok(Self {
            config,
            dialect,
            pool,
            ownership,
            handle: None,
            profiler,
            last_insert_id: None,
            affected_rows: 0,
            last_error: None,
        })
    }

    /// Connection over a pool shared with other connections.
    pub(crate) fn with_shared_pool(
        config: ConnectionConfig,
        pool: DbPool,
        profiler: Arc<QueryProfiler>,
    ) -> Self {
        Self {
            dialect: pool.database_type(),
            config,
            pool: Some(pool),
            ownership: PoolOwnership::Borrowed,
            handle: None,
            profiler,
            last_insert_id: None,
            affected_rows: 0,
            last_error: None,
        }
    }

    /// Create and connect in one step.
    pub async fn open(config: ConnectionConfig) -> DbResult<Self> {
        let mut conn = Self::new(config)?;
        conn.connect().await?;
        Ok(conn)
    }

    /// Acquire a dedicated handle, building the pool first when needed.
    pub async fn connect(&mut self) -> DbResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let pool = match &self.pool {
            Some(pool) if !pool.is_closed() => pool.clone(),
            _ => {
                let pool = create_pool(&self.config, 1).await?;
                self.pool = Some(pool.clone());
                pool
            }
        };

        let handle = pool.acquire().await.map_err(DbError::from)?;
        self.handle = Some(handle);

        info!(
            driver = %self.config.driver,
            database = %self.config.database,
            "Connected"
        );
        Ok(())
    }

    /// Release the handle. Pools this connection built are closed, except the
    /// in-memory pool whose data must survive a reconnect.
    pub async fn disconnect(&mut self) {
        let had_handle = self.handle.take().is_some();
        if self.ownership == PoolOwnership::Owned {
            if let Some(pool) = self.pool.take() {
                pool.close().await;
            }
        }
        if had_handle {
            info!(driver = %self.config.driver, "Disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some() && self.pool.as_ref().is_some_and(|p| !p.is_closed())
    }

    /// Check liveness, attempting exactly one reconnect on failure.
    pub async fn ping(&mut self) -> DbResult<()> {
        if self.is_connected() && self.select_one().await.is_ok() {
            return Ok(());
        }

        warn!(driver = %self.config.driver, "Ping failed, reconnecting");
        self.drop_handle();
        if self.ownership == PoolOwnership::Owned {
            if let Some(pool) = self.pool.take() {
                pool.close().await;
            }
        }

        self.connect().await?;
        self.select_one().await.map_err(|e| {
            DbError::connection(
                format!("Reconnect succeeded but ping failed: {}", e),
                "Check database server status",
            )
        })
    }

    async fn select_one(&mut self) -> DbResult<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| DbError::connection("Not connected", "Call connect() first"))?;
        let kind = StatementKind::Query;
        match handle {
            DbHandle::MySql(conn) => mysql::run(conn, "SELECT 1", &[], kind).await.map(|_| ()),
            DbHandle::Postgres(conn) => postgres::run(conn, "SELECT 1", &[], kind).await.map(|_| ()),
            DbHandle::Sqlite(conn) => sqlite::run(conn, "SELECT 1", &[], kind).await.map(|_| ()),
        }
    }

    /// Discard the current handle without returning it to the pool.
    fn drop_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close_on_drop();
        }
    }

    /// Mark the physical connection to be closed rather than reused.
    ///
    /// Called when the session may hold an unfinished transaction.
    pub(crate) fn close_on_drop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.close_on_drop();
        }
    }

    /// Execute one statement with bound parameters.
    ///
    /// Connects lazily. Elapsed time is reported to the profiler whether the
    /// statement succeeds or not, including when the lazy connect fails.
    pub async fn raw(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        let start = Instant::now();
        let result = self.connect_and_execute(sql, params).await;
        self.profiler
            .record_for(self.dialect, sql, start.elapsed(), result.is_ok());

        match result {
            Ok(rs) => {
                self.affected_rows = rs.rows_affected();
                if let Some(id) = rs.last_insert_id() {
                    self.last_insert_id = Some(id);
                }
                self.last_error = None;
                Ok(rs)
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn connect_and_execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        if self.handle.is_none() {
            self.connect().await?;
        }
        self.execute(sql, params).await
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        let kind = statement::classify(sql, self.dialect);
        debug!(
            sql = %sql,
            params = params.len(),
            returns_rows = kind.returns_rows(),
            "Executing statement"
        );

        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| DbError::connection("Not connected", "Call connect() first"))?;

        let run = async move {
            match handle {
                DbHandle::MySql(conn) => mysql::run(conn, sql, params, kind).await,
                DbHandle::Postgres(conn) => postgres::run(conn, sql, params, kind).await,
                DbHandle::Sqlite(conn) => sqlite::run(conn, sql, params, kind).await,
            }
        };

        let mut timed_out = false;
        let result = match self.config.query_timeout() {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    timed_out = true;
                    Err(DbError::query(
                        format!("Statement timed out after {}s", limit.as_secs()),
                        sql,
                        None,
                    ))
                }
            },
            None => run.await,
        };

        if timed_out {
            // The backend may still be working on the statement
            self.drop_handle();
        }

        let rs = result?;
        if kind.returns_rows() && is_insert(sql) {
            let id = rs.value(0, "id").and_then(|v| v.as_i64());
            let affected = rs.len() as u64;
            return Ok(rs.with_write_counters(affected, id));
        }
        Ok(rs)
    }

    /// Start a query builder bound to this connection's dialect and prefix.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(self.dialect, self.prefix())
    }

    /// Schema manager borrowing this connection.
    pub fn schema(&mut self) -> SchemaManager<'_> {
        SchemaManager::new(self)
    }

    /// Id generated by the most recent successful INSERT.
    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    /// Rows affected by the most recent successful statement.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Message of the most recent failure, cleared by the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn driver(&self) -> Driver {
        self.config.driver
    }

    pub fn driver_name(&self) -> &'static str {
        self.config.driver.name()
    }

    pub fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    /// Full table prefix: connection prefix followed by the namespace.
    pub fn prefix(&self) -> String {
        format!("{}{}", self.config.table_prefix, self.config.namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Physical name of a logical table.
    pub fn table_name(&self, logical: &str) -> String {
        format!("{}{}", self.prefix(), logical)
    }

    /// Logical database name.
    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Arc<QueryProfiler> {
        &self.profiler
    }
}

fn is_insert(sql: &str) -> bool {
    matches!(
        statement::leading_keyword(sql).as_deref(),
        Some("INSERT") | Some("REPLACE")
    )
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use crate::db::params::BindParams;
    use sqlx::pool::PoolConnection;
    use sqlx::{Executor, MySql};

    pub async fn run(
        conn: &mut PoolConnection<MySql>,
        sql: &str,
        params: &[QueryParam],
        kind: StatementKind,
    ) -> DbResult<ResultSet> {
        if kind.returns_rows() {
            let rows = if params.is_empty() {
                (&mut **conn).fetch_all(sql).await
            } else {
                sqlx::query(sql).bind_all(params).fetch_all(&mut **conn).await
            }
            .map_err(|e| DbError::from_sqlx(e, sql))?;
            let (columns, rows) = rows_to_json(&rows);
            return Ok(ResultSet::from_rows(columns, rows));
        }

        let result = if params.is_empty() {
            (&mut **conn).execute(sql).await
        } else {
            sqlx::query(sql).bind_all(params).execute(&mut **conn).await
        }
        .map_err(|e| DbError::from_sqlx(e, sql))?;

        let id = result.last_insert_id();
        let id = (is_insert(sql) && id > 0).then_some(id as i64);
        Ok(ResultSet::write_result(result.rows_affected(), id))
    }
}

mod postgres {
    use super::*;
    use crate::db::params::BindParams;
    use sqlx::pool::PoolConnection;
    use sqlx::{Executor, Postgres};

    /// PostgreSQL reports generated ids only through RETURNING, which the
    /// caller handles; plain writes carry no id.
    pub async fn run(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        params: &[QueryParam],
        kind: StatementKind,
    ) -> DbResult<ResultSet> {
        if kind.returns_rows() {
            let rows = if params.is_empty() {
                (&mut **conn).fetch_all(sql).await
            } else {
                sqlx::query(sql).bind_all(params).fetch_all(&mut **conn).await
            }
            .map_err(|e| DbError::from_sqlx(e, sql))?;
            let (columns, rows) = rows_to_json(&rows);
            return Ok(ResultSet::from_rows(columns, rows));
        }

        let result = if params.is_empty() {
            (&mut **conn).execute(sql).await
        } else {
            sqlx::query(sql).bind_all(params).execute(&mut **conn).await
        }
        .map_err(|e| DbError::from_sqlx(e, sql))?;

        Ok(ResultSet::write_result(result.rows_affected(), None))
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::BindParams;
    use sqlx::pool::PoolConnection;
    use sqlx::{Executor, Sqlite};

    pub async fn run(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        params: &[QueryParam],
        kind: StatementKind,
    ) -> DbResult<ResultSet> {
        if kind.returns_rows() {
            let rows = if params.is_empty() {
                (&mut **conn).fetch_all(sql).await
            } else {
                sqlx::query(sql).bind_all(params).fetch_all(&mut **conn).await
            }
            .map_err(|e| DbError::from_sqlx(e, sql))?;
            let (columns, rows) = rows_to_json(&rows);
            return Ok(ResultSet::from_rows(columns, rows));
        }

        let result = if params.is_empty() {
            (&mut **conn).execute(sql).await
        } else {
            sqlx::query(sql).bind_all(params).execute(&mut **conn).await
        }
        .map_err(|e| DbError::from_sqlx(e, sql))?;

        let id = result.last_insert_rowid();
        let id = (is_insert(sql) && id > 0).then_some(id);
        Ok(ResultSet::write_result(result.rows_affected(), id))
    }
}
