//! Subquery, OuterRef, and Exists expressions for correlated subqueries.
//!
//! These wrap a [`QuerySet`] so it can be embedded in another query.
//! `OuterRef("pk")` inside the inner queryset names a field of the outer
//! model; resolution turns it into a qualified column of the outer table.
//!
//! ```ignore
//! let newest = Subquery::new(
//!     book.objects()
//!         .filter(Q::kw_expr("author", OuterRef::new("pk").into()))
//!         .order_by(&["-published"])
//!         .values(&["title"])
//!         .limit(1),
//! );
//! let authors = author.objects().annotate("newest_title", newest);
//! ```

use super::core::Expression;
use crate::query::queryset::QuerySet;

/// A scalar subquery, Django's `Subquery()`.
#[derive(Debug, Clone)]
pub struct Subquery {
    queryset: QuerySet,
}

impl Subquery {
    pub fn new(queryset: QuerySet) -> Self {
        Self { queryset }
    }

    pub fn queryset(&self) -> &QuerySet {
        &self.queryset
    }

    pub fn into_expression(self) -> Expression {
        Expression::Subquery(Box::new(self.queryset))
    }
}

/// A field of the enclosing query, Django's `OuterRef()`.
#[derive(Debug, Clone)]
pub struct OuterRef {
    field: String,
}

impl OuterRef {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn into_expression(self) -> Expression {
        Expression::OuterRef(self.field)
    }
}

/// `EXISTS (...)`, Django's `Exists()`. Negate with [`Exists::negate`] or
/// `!` for `NOT EXISTS`.
#[derive(Debug, Clone)]
pub struct Exists {
    queryset: QuerySet,
    negated: bool,
}

impl Exists {
    pub fn new(queryset: QuerySet) -> Self {
        Self {
            queryset,
            negated: false,
        }
    }

    #[must_use]
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn into_expression(self) -> Expression {
        Expression::Exists {
            queryset: Box::new(self.queryset),
            negated: self.negated,
        }
    }
}

impl std::ops::Not for Exists {
    type Output = Self;

    fn not(self) -> Self::Output {
        self.negate()
    }
}

impl From<Subquery> for Expression {
    fn from(value: Subquery) -> Self {
        value.into_expression()
    }
}

impl From<OuterRef> for Expression {
    fn from(value: OuterRef) -> Self {
        value.into_expression()
    }
}

impl From<Exists> for Expression {
    fn from(value: Exists) -> Self {
        value.into_expression()
    }
}
