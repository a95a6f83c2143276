//! Fluent query building.

pub mod builder;
pub mod condition;

pub use builder::QueryBuilder;
pub use condition::{Condition, Conjunction, JoinType, Operator, SortDirection, TableRef};
