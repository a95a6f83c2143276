//! Execution plan analysis.
//!
//! Runs the backend's native EXPLAIN for a SELECT and scans the plan rows for
//! patterns that usually indicate a missing index or an expensive operation.
//! The analysis is advisory: nothing here rewrites or executes the query.

use crate::db::Connection;
use crate::db::statement;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, ResultSet, Row};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Category of a plan finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanIssueKind {
    FullScan,
    UnusedIndex,
    Filesort,
    TemporaryTable,
    HighRowEstimate,
}

/// One finding in a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanIssue {
    pub kind: PlanIssueKind,
    pub issue: String,
    pub suggestion: String,
}

impl PlanIssue {
    fn new(kind: PlanIssueKind, issue: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            kind,
            issue: issue.into(),
            suggestion: suggestion.into(),
        }
    }
}

/// Overall verdict for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRating {
    Optimal,
    Suboptimal,
    FullScan,
    NeedsOptimization,
}

impl PlanRating {
    /// Three or more findings outrank a single full scan.
    pub fn from_issues(issues: &[PlanIssue]) -> Self {
        if issues.is_empty() {
            Self::Optimal
        } else if issues.len() >= 3 {
            Self::NeedsOptimization
        } else if issues.iter().any(|i| i.kind == PlanIssueKind::FullScan) {
            Self::FullScan
        } else {
            Self::Suboptimal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optimal => "optimal",
            Self::Suboptimal => "suboptimal",
            Self::FullScan => "full_scan",
            Self::NeedsOptimization => "needs_optimization",
        }
    }
}

/// Plan, findings and rating for one statement.
#[derive(Debug, Clone, Serialize)]
pub struct ExplainReport {
    pub sql: String,
    pub plan: ResultSet,
    pub issues: Vec<PlanIssue>,
    pub rating: PlanRating,
}

/// Backend-specific EXPLAIN generation and plan inspection.
pub trait PlanAnalyzer: Send + Sync {
    /// The EXPLAIN statement for `sql`.
    fn explain_sql(&self, sql: &str) -> String {
        format!("EXPLAIN {}", sql)
    }

    /// Findings in the plan rows. `high_rows` is the row estimate above
    /// which a step is reported.
    fn analyze(&self, plan: &ResultSet, high_rows: u64) -> Vec<PlanIssue>;
}

/// Analyzer for the given dialect.
pub fn analyzer_for(db_type: DatabaseType) -> Box<dyn PlanAnalyzer> {
    match db_type {
        DatabaseType::MySQL => Box::new(MySqlPlanAnalyzer),
        DatabaseType::PostgreSQL => Box::new(PostgresPlanAnalyzer),
        DatabaseType::SQLite => Box::new(SqlitePlanAnalyzer),
    }
}

/// EXPLAIN a SELECT on `conn` and rate the resulting plan.
pub async fn explain(
    conn: &mut Connection,
    sql: &str,
    params: &[QueryParam],
    high_rows: u64,
) -> DbResult<ExplainReport> {
    let sql = sql.trim();
    if !statement::is_select(sql, conn.dialect()) {
        return Err(DbError::invalid_input(
            "Plan analysis is only available for SELECT statements",
        ));
    }

    let analyzer = analyzer_for(conn.dialect());
    let plan = conn.raw(&analyzer.explain_sql(sql), params).await?;
    let issues = analyzer.analyze(&plan, high_rows);
    let rating = PlanRating::from_issues(&issues);

    Ok(ExplainReport {
        sql: sql.to_string(),
        plan,
        issues,
        rating,
    })
}

fn text<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(JsonValue::as_str)
}

/// Numeric cell that some drivers report as text.
fn number(row: &Row, column: &str) -> Option<u64> {
    match row.get(column)? {
        JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// MySQL
// =============================================================================

/// Reads the tabular `EXPLAIN` output (`type`, `possible_keys`, `key`,
/// `rows`, `Extra`).
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlPlanAnalyzer;

impl PlanAnalyzer for MySqlPlanAnalyzer {
    fn analyze(&self, plan: &ResultSet, high_rows: u64) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        for row in plan.rows() {
            let table = text(row, "table").unwrap_or("?");

            if text(row, "type").is_some_and(|t| t.eq_ignore_ascii_case("ALL")) {
                issues.push(PlanIssue::new(
                    PlanIssueKind::FullScan,
                    format!("Full table scan on {}", table),
                    format!("Add an index on the columns {} is filtered by", table),
                ));
            }

            let possible = text(row, "possible_keys").filter(|k| !k.is_empty());
            let chosen = text(row, "key").filter(|k| !k.is_empty());
            if let (Some(keys), None) = (possible, chosen) {
                issues.push(PlanIssue::new(
                    PlanIssueKind::UnusedIndex,
                    format!("Candidate indexes ({}) on {} were not used", keys, table),
                    "Check index selectivity or rewrite the predicate to match the index",
                ));
            }

            let extra = text(row, "Extra").unwrap_or("");
            if extra.contains("Using filesort") {
                issues.push(PlanIssue::new(
                    PlanIssueKind::Filesort,
                    format!("Filesort on {}", table),
                    "Add an index matching the ORDER BY columns",
                ));
            }
            if extra.contains("Using temporary") {
                issues.push(PlanIssue::new(
                    PlanIssueKind::TemporaryTable,
                    format!("Temporary table for {}", table),
                    "Index the GROUP BY / DISTINCT columns",
                ));
            }

            if let Some(rows) = number(row, "rows").filter(|r| *r > high_rows) {
                issues.push(PlanIssue::new(
                    PlanIssueKind::HighRowEstimate,
                    format!("Estimated {} rows examined on {}", rows, table),
                    "Narrow the predicate or add a more selective index",
                ));
            }
        }
        issues
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Reads the text plan (`QUERY PLAN` column, one node per row).
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresPlanAnalyzer;

impl PostgresPlanAnalyzer {
    /// `rows=N` from a node's cost estimate.
    fn estimated_rows(line: &str) -> Option<u64> {
        let start = line.find("rows=")? + "rows=".len();
        let digits: String = line[start..].chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }
}

impl PlanAnalyzer for PostgresPlanAnalyzer {
    fn analyze(&self, plan: &ResultSet, high_rows: u64) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        for row in plan.rows() {
            let Some(line) = text(row, "QUERY PLAN") else {
                continue;
            };
            let node = line.trim_start().trim_start_matches("->").trim();

            if node.starts_with("Seq Scan") || node.starts_with("Parallel Seq Scan") {
                issues.push(PlanIssue::new(
                    PlanIssueKind::FullScan,
                    node.split("  ").next().unwrap_or(node).to_string(),
                    "Add an index on the filtered columns",
                ));
            } else if node.starts_with("Sort") {
                issues.push(PlanIssue::new(
                    PlanIssueKind::Filesort,
                    "Explicit sort step",
                    "Add an index matching the ORDER BY columns",
                ));
            } else if node.starts_with("HashAggregate") || node.starts_with("Materialize") {
                issues.push(PlanIssue::new(
                    PlanIssueKind::TemporaryTable,
                    "Intermediate result materialized in memory",
                    "Index the grouping columns or reduce the input set",
                ));
            }

            if let Some(rows) = Self::estimated_rows(node).filter(|r| *r > high_rows) {
                issues.push(PlanIssue::new(
                    PlanIssueKind::HighRowEstimate,
                    format!("Estimated {} rows", rows),
                    "Narrow the predicate or add a more selective index",
                ));
            }
        }
        issues
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// Reads `EXPLAIN QUERY PLAN` output (`detail` column).
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlitePlanAnalyzer;

impl PlanAnalyzer for SqlitePlanAnalyzer {
    fn explain_sql(&self, sql: &str) -> String {
        format!("EXPLAIN QUERY PLAN {}", sql)
    }

    fn analyze(&self, plan: &ResultSet, _high_rows: u64) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        for row in plan.rows() {
            let Some(detail) = text(row, "detail") else {
                continue;
            };

            if detail.starts_with("SCAN")
                && !detail.contains("USING")
                && !detail.contains("CONSTANT ROW")
            {
                issues.push(PlanIssue::new(
                    PlanIssueKind::FullScan,
                    detail.to_string(),
                    "Add an index on the filtered columns",
                ));
            }

            if let Some(purpose) = detail.strip_prefix("USE TEMP B-TREE FOR ") {
                let kind = if purpose.contains("ORDER BY") {
                    PlanIssueKind::Filesort
                } else {
                    PlanIssueKind::TemporaryTable
                };
                issues.push(PlanIssue::new(
                    kind,
                    detail.to_string(),
                    format!("Add an index covering the {} columns", purpose.trim()),
                ));
            }
        }
        issues
    }
}
