//! Query expressions: F-objects, values, aggregates, CASE/WHEN,
//! subqueries and database functions.
//!
//! - [`core`]: the [`Expression`] enum, aggregates, `When`
//! - [`subquery`]: `Subquery`, `OuterRef`, `Exists`
//! - [`functions`]: aggregate helpers and SQL functions

pub mod core;
pub mod functions;
pub mod subquery;

pub use self::core::{AggregateFunc, Expression, When};
pub use self::functions::*;
pub use self::subquery::{Exists, OuterRef, Subquery};
