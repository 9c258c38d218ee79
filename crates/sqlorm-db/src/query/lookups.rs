//! Query lookups and Q objects for building complex filters.
//!
//! A [`Lookup`] is one field-level comparison; [`Q`] combines them with
//! AND, OR and NOT. [`Q::kw`] accepts Django keyword syntax, so
//! `Q::kw("title__icontains", "rust")` is `Q(title__icontains="rust")`.
//!
//! ```
//! use sqlorm_db::query::lookups::{Lookup, Q};
//! use sqlorm_db::value::Value;
//!
//! let q = Q::filter("name", Lookup::Exact(Value::from("Alice")))
//!     & Q::kw("age__gt", 25);
//! let either = Q::kw("name", "Alice") | Q::kw("name", "Bob");
//! let negated = !Q::kw("active", false);
//! # let _ = (q, either, negated);
//! ```

use std::ops;

use crate::query::compiler::{Query, WhereNode};
use crate::query::expressions::Expression;
use crate::query::queryset::QuerySet;
use crate::value::Value;

/// The lookup names `Q::kw` recognizes after the last `__`.
pub const LOOKUP_NAMES: &[&str] = &[
    "exact",
    "iexact",
    "contains",
    "icontains",
    "in",
    "gt",
    "gte",
    "lt",
    "lte",
    "startswith",
    "istartswith",
    "endswith",
    "iendswith",
    "range",
    "isnull",
    "regex",
    "iregex",
];

/// Comparison operators usable against an expression (`F`, `OuterRef`,
/// a subquery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A field-level lookup operation.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// `field = value`; a NULL value compiles to `IS NULL`.
    Exact(Value),
    IExact(Value),
    Contains(String),
    IContains(String),
    In(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    StartsWith(String),
    IStartsWith(String),
    EndsWith(String),
    IEndsWith(String),
    /// `field BETWEEN low AND high`.
    Range(Value, Value),
    IsNull(bool),
    Regex(String),
    IRegex(String),
    /// `field <op> <expression>`.
    Compare(CompareOp, Box<Expression>),
    /// `field IN (<queryset>)`, before the queryset is turned into SQL.
    InQuerySet(Box<QuerySet>),
    /// `field IN (<subquery>)`.
    InSubquery(Box<Query>),
}

impl Lookup {
    /// Builds a lookup from its Django name. Returns `Err` with a message
    /// when the value has the wrong shape for the lookup.
    pub fn from_name(name: &str, value: Value) -> Result<Self, String> {
        let text = |v: Value| match v {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(match name {
            "exact" => Self::Exact(value),
            "iexact" => Self::IExact(value),
            "contains" => Self::Contains(text(value)),
            "icontains" => Self::IContains(text(value)),
            "startswith" => Self::StartsWith(text(value)),
            "istartswith" => Self::IStartsWith(text(value)),
            "endswith" => Self::EndsWith(text(value)),
            "iendswith" => Self::IEndsWith(text(value)),
            "regex" => Self::Regex(text(value)),
            "iregex" => Self::IRegex(text(value)),
            "gt" => Self::Gt(value),
            "gte" => Self::Gte(value),
            "lt" => Self::Lt(value),
            "lte" => Self::Lte(value),
            "in" => match value {
                Value::List(items) => Self::In(items),
                other => return Err(format!("'in' lookup expects a list, got {}", other.type_name())),
            },
            "range" => match value {
                Value::List(items) if items.len() == 2 => {
                    let mut items = items.into_iter();
                    let low = items.next().unwrap_or(Value::Null);
                    let high = items.next().unwrap_or(Value::Null);
                    Self::Range(low, high)
                }
                _ => return Err("'range' lookup expects a list of two values".into()),
            },
            "isnull" => match value {
                Value::Bool(b) => Self::IsNull(b),
                Value::Int(i) => Self::IsNull(i != 0),
                other => {
                    return Err(format!(
                        "The QuerySet value for an isnull lookup must be True or False, got {other}"
                    ))
                }
            },
            other => return Err(format!("Unsupported lookup '{other}'")),
        })
    }

    /// Builds a comparison lookup whose right-hand side is an expression.
    pub fn from_name_expr(name: &str, expr: Expression) -> Result<Self, String> {
        let op = match name {
            "exact" => CompareOp::Eq,
            "gt" => CompareOp::Gt,
            "gte" => CompareOp::Gte,
            "lt" => CompareOp::Lt,
            "lte" => CompareOp::Lte,
            "in" => {
                return match expr {
                    Expression::Subquery(qs) => Ok(Self::InQuerySet(qs)),
                    Expression::Query(query) => Ok(Self::InSubquery(query)),
                    _ => Err("'in' lookup expects a list or a queryset".into()),
                }
            }
            other => return Err(format!("Lookup '{other}' does not accept expressions")),
        };
        Ok(Self::Compare(op, Box::new(expr)))
    }
}

/// Splits `"author__name__icontains"` into `("author__name", "icontains")`.
/// A path without a known lookup suffix is an exact match.
pub fn split_lookup(key: &str) -> (&str, &str) {
    match key.rsplit_once("__") {
        Some((path, lookup)) if LOOKUP_NAMES.contains(&lookup) => (path, lookup),
        _ => (key, "exact"),
    }
}

/// A composable query filter, equivalent to Django's `Q` object.
#[derive(Debug, Clone)]
pub enum Q {
    /// A single field lookup. The field may span relations with `__`.
    Filter { field: String, lookup: Lookup },
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
    /// A boolean expression such as `Exists(...)`.
    Expr(Box<Expression>),
    /// A condition already resolved against a model.
    #[doc(hidden)]
    Resolved(Box<WhereNode>),
    /// A keyword filter whose value did not fit its lookup; reported when
    /// the queryset is built.
    #[doc(hidden)]
    Invalid(String),
}

impl Q {
    pub fn filter(field: impl Into<String>, lookup: Lookup) -> Self {
        Self::Filter {
            field: field.into(),
            lookup,
        }
    }

    /// Django keyword syntax: `Q::kw("price__gte", 10)`.
    pub fn kw(key: &str, value: impl Into<Value>) -> Self {
        let (field, lookup) = split_lookup(key);
        match Lookup::from_name(lookup, value.into()) {
            Ok(lookup) => Self::filter(field, lookup),
            Err(msg) => Self::Invalid(msg),
        }
    }

    /// Keyword syntax against an expression: `Q::kw_expr("stock__lt", F("reserved"))`.
    pub fn kw_expr(key: &str, expr: Expression) -> Self {
        let (field, lookup) = split_lookup(key);
        match Lookup::from_name_expr(lookup, expr) {
            Ok(lookup) => Self::filter(field, lookup),
            Err(msg) => Self::Invalid(msg),
        }
    }

    /// `field__in=<queryset>`.
    pub fn kw_in(field: impl Into<String>, queryset: QuerySet) -> Self {
        Self::filter(field, Lookup::InQuerySet(Box::new(queryset)))
    }

    /// Filters on a boolean expression, typically [`Expression::exists`].
    pub fn exists(expr: Expression) -> Self {
        Self::Expr(Box::new(expr))
    }

    /// Returns `true` if this is an empty AND/OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        // Double negation cancels out.
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}
