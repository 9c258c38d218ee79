//! Query building, compilation and execution.
//!
//! - [`lookups`]: `Q` objects and field lookups
//! - [`expressions`]: `F`, aggregates, CASE/WHEN, subqueries, functions
//! - [`resolve`]: field names and relation spans to columns
//! - [`compiler`]: the `Query` AST and SQL compilation
//! - [`queryset`]: lazy `QuerySet` and `Manager`
//! - [`bulk`]: bulk create/update, `get_or_create`, `update_or_create`
//! - [`prefetch`]: `prefetch_related`
//! - [`raw`]: raw SQL mapped to instances or plain rows

pub mod bulk;
pub mod compiler;
pub mod expressions;
pub mod lookups;
pub mod prefetch;
pub mod queryset;
pub mod raw;
pub(crate) mod resolve;

pub use compiler::{DatabaseBackendType, OrderBy, Query, Row, SelectColumn, SqlCompiler, WhereNode};
pub use expressions::{AggregateFunc, Exists, Expression, OuterRef, Subquery, When};
pub use lookups::{Lookup, Q};
pub use prefetch::Prefetch;
pub use queryset::{Manager, QuerySet};
