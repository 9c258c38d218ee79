//! Query expressions, aggregates, and F-objects.
//!
//! ```
//! use sqlorm_db::query::expressions::{AggregateFunc, Expression};
//!
//! // F("price") * 1.1
//! let expr = Expression::f("price") * Expression::value(1.1);
//!
//! // Count("id")
//! let count = Expression::aggregate(AggregateFunc::Count, Expression::f("id"));
//! # let _ = (expr, count);
//! ```

use std::ops;

use crate::query::compiler::Query;
use crate::query::lookups::Q;
use crate::query::queryset::QuerySet;
use crate::value::Value;

/// A query expression that produces a value in the context of a SQL query.
///
/// `F`, `OuterRef`, `Subquery` and `Exists` name things relative to a model;
/// resolving a queryset turns them into `Col`, `OuterCol`, `Query` and
/// `ExistsQuery`, which compile directly.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A column of the query's own table.
    Col(String),
    /// A column of the enclosing query's table.
    OuterCol { table: String, column: String },
    Value(Value),
    /// A reference to another field by name.
    F(String),
    Func {
        name: String,
        args: Vec<Expression>,
    },
    Aggregate {
        func: AggregateFunc,
        field: Box<Expression>,
        distinct: bool,
        /// Rows outside this condition are ignored (`FILTER (WHERE ...)`).
        filter: Option<Box<Q>>,
    },
    Case {
        whens: Vec<When>,
        default: Option<Box<Expression>>,
    },
    /// A scalar subquery over another model.
    Subquery(Box<QuerySet>),
    /// A compiled-ready subquery.
    Query(Box<Query>),
    /// A field of the outer query, used inside a subquery.
    OuterRef(String),
    Exists {
        queryset: Box<QuerySet>,
        negated: bool,
    },
    ExistsQuery {
        query: Box<Query>,
        negated: bool,
    },
    Cast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// Raw SQL with parameters.
    RawSQL(String, Vec<Value>),
    Add(Box<Expression>, Box<Expression>),
    Sub(Box<Expression>, Box<Expression>),
    Mul(Box<Expression>, Box<Expression>),
    Div(Box<Expression>, Box<Expression>),
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    /// Returns the SQL function name for this aggregate.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// The lowercase name Django uses for default aggregate aliases
    /// (`price__avg`).
    pub const fn default_alias_suffix(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// A single WHEN/THEN branch in a CASE expression.
#[derive(Debug, Clone)]
pub struct When {
    pub condition: Q,
    pub then: Expression,
}

impl When {
    pub fn new(condition: Q, then: impl Into<Expression>) -> Self {
        Self {
            condition,
            then: then.into(),
        }
    }
}

impl Expression {
    pub fn col(name: impl Into<String>) -> Self {
        Self::Col(name.into())
    }

    /// An F-expression referencing a field.
    pub fn f(name: impl Into<String>) -> Self {
        Self::F(name.into())
    }

    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    pub fn func(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Self::Func {
            name: name.into(),
            args,
        }
    }

    pub fn aggregate(func: AggregateFunc, field: Expression) -> Self {
        Self::Aggregate {
            func,
            field: Box::new(field),
            distinct: false,
            filter: None,
        }
    }

    pub fn aggregate_distinct(func: AggregateFunc, field: Expression) -> Self {
        Self::Aggregate {
            func,
            field: Box::new(field),
            distinct: true,
            filter: None,
        }
    }

    /// Restricts an aggregate to rows matching `q`. Other expressions are
    /// returned unchanged.
    #[must_use]
    pub fn filtered(self, q: Q) -> Self {
        match self {
            Self::Aggregate {
                func,
                field,
                distinct,
                ..
            } => Self::Aggregate {
                func,
                field,
                distinct,
                filter: Some(Box::new(q)),
            },
            other => other,
        }
    }

    pub fn case(whens: Vec<When>, default: Option<Expression>) -> Self {
        Self::Case {
            whens,
            default: default.map(Box::new),
        }
    }

    /// A scalar subquery. The queryset should select a single column.
    pub fn subquery(queryset: QuerySet) -> Self {
        Self::Subquery(Box::new(queryset))
    }

    pub fn outer_ref(name: impl Into<String>) -> Self {
        Self::OuterRef(name.into())
    }

    /// `EXISTS (<queryset>)`.
    pub fn exists(queryset: QuerySet) -> Self {
        Self::Exists {
            queryset: Box::new(queryset),
            negated: false,
        }
    }

    /// Flips `EXISTS` into `NOT EXISTS`; any other expression is wrapped
    /// in `NOT(...)`.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Exists { queryset, negated } => Self::Exists {
                queryset,
                negated: !negated,
            },
            Self::ExistsQuery { query, negated } => Self::ExistsQuery {
                query,
                negated: !negated,
            },
            other => Self::func("NOT", vec![other]),
        }
    }

    pub fn cast(self, data_type: impl Into<String>) -> Self {
        Self::Cast {
            expr: Box::new(self),
            data_type: data_type.into(),
        }
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::RawSQL(sql.into(), params)
    }

    /// Whether an aggregate appears anywhere in this expression. Subqueries
    /// aggregate on their own and do not count.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Func { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Case { whens, default } => {
                whens.iter().any(|w| w.then.contains_aggregate())
                    || default.as_deref().is_some_and(Self::contains_aggregate)
            }
            Self::Cast { expr, .. } => expr.contains_aggregate(),
            Self::Add(l, r) | Self::Sub(l, r) | Self::Mul(l, r) | Self::Div(l, r) => {
                l.contains_aggregate() || r.contains_aggregate()
            }
            _ => false,
        }
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl ops::Add for Expression {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::Add(Box::new(self), Box::new(rhs))
    }
}

impl ops::Sub for Expression {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::Sub(Box::new(self), Box::new(rhs))
    }
}

impl ops::Mul for Expression {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Self::Mul(Box::new(self), Box::new(rhs))
    }
}

impl ops::Div for Expression {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        Self::Div(Box::new(self), Box::new(rhs))
    }
}
