//! Query profiling, plan analysis and cross-request performance monitoring.

pub mod explain;
pub mod monitor;
pub mod normalize;
pub mod query_profiler;

pub use explain::{
    ExplainReport, MySqlPlanAnalyzer, PlanAnalyzer, PlanIssue, PlanIssueKind, PlanRating,
    PostgresPlanAnalyzer, SqlitePlanAnalyzer,
};
pub use monitor::{AggregateMetrics, HealthCheck, HealthReport, PerformanceMonitor, RequestMetrics};
pub use normalize::{normalize, normalize_for};
pub use query_profiler::{NPlusOnePattern, ProfileSummary, QueryProfile, QueryProfiler};
