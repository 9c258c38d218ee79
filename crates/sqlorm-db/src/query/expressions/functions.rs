//! Aggregates and database functions.
//!
//! Builder functions that produce [`Expression`] values, mirroring
//! `django.db.models.functions` and the aggregate classes.
//!
//! ```
//! use sqlorm_db::query::expressions::functions::*;
//! use sqlorm_db::query::expressions::Expression;
//!
//! // COALESCE(nickname, name, 'Anonymous')
//! let expr = coalesce(vec![
//!     Expression::f("nickname"),
//!     Expression::f("name"),
//!     Expression::value("Anonymous"),
//! ]);
//! let total = sum("amount");
//! # let _ = (expr, total);
//! ```

use super::core::{AggregateFunc, Expression};

// ── Aggregates ─────────────────────────────────────────────────────────

/// `Count("field")`. `count("*")` counts rows.
pub fn count(field: &str) -> Expression {
    Expression::aggregate(AggregateFunc::Count, Expression::f(field))
}

/// `Count("field", distinct=True)`.
pub fn count_distinct(field: &str) -> Expression {
    Expression::aggregate_distinct(AggregateFunc::Count, Expression::f(field))
}

pub fn sum(field: &str) -> Expression {
    Expression::aggregate(AggregateFunc::Sum, Expression::f(field))
}

pub fn avg(field: &str) -> Expression {
    Expression::aggregate(AggregateFunc::Avg, Expression::f(field))
}

pub fn min(field: &str) -> Expression {
    Expression::aggregate(AggregateFunc::Min, Expression::f(field))
}

pub fn max(field: &str) -> Expression {
    Expression::aggregate(AggregateFunc::Max, Expression::f(field))
}

// ── Comparison ─────────────────────────────────────────────────────────

/// COALESCE(expr1, expr2, ...) - the first non-NULL argument.
pub fn coalesce(args: Vec<Expression>) -> Expression {
    Expression::func("COALESCE", args)
}

/// NULLIF(expr1, expr2) - NULL if the arguments are equal, else expr1.
pub fn nullif(expr1: Expression, expr2: Expression) -> Expression {
    Expression::func("NULLIF", vec![expr1, expr2])
}

// ── Text ───────────────────────────────────────────────────────────────

pub fn concat(args: Vec<Expression>) -> Expression {
    Expression::func("CONCAT", args)
}

pub fn length(expr: Expression) -> Expression {
    Expression::func("LENGTH", vec![expr])
}

pub fn lower(expr: Expression) -> Expression {
    Expression::func("LOWER", vec![expr])
}

pub fn upper(expr: Expression) -> Expression {
    Expression::func("UPPER", vec![expr])
}

pub fn trim(expr: Expression) -> Expression {
    Expression::func("TRIM", vec![expr])
}

pub fn replace(expr: Expression, from: Expression, to: Expression) -> Expression {
    Expression::func("REPLACE", vec![expr, from, to])
}

/// SUBSTR(str, pos[, len]), 1-based.
pub fn substr(expr: Expression, pos: i64, len: Option<i64>) -> Expression {
    let mut args = vec![expr, Expression::value(pos)];
    if let Some(len) = len {
        args.push(Expression::value(len));
    }
    Expression::func("SUBSTR", args)
}

// ── Math ───────────────────────────────────────────────────────────────

pub fn abs(expr: Expression) -> Expression {
    Expression::func("ABS", vec![expr])
}

/// ROUND(expr) or ROUND(expr, digits).
pub fn round(expr: Expression, digits: Option<i32>) -> Expression {
    let mut args = vec![expr];
    if let Some(d) = digits {
        args.push(Expression::value(d));
    }
    Expression::func("ROUND", args)
}

// ── Date/time and conversion ───────────────────────────────────────────

/// The current timestamp. Compiles to `CURRENT_TIMESTAMP` on SQLite.
pub fn now() -> Expression {
    Expression::func("NOW", vec![])
}

/// CAST(expr AS type).
pub fn cast(expr: Expression, data_type: impl Into<String>) -> Expression {
    expr.cast(data_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compiler::{DatabaseBackendType, SqlCompiler};
    use crate::value::Value;

    fn compile(backend: DatabaseBackendType, expr: &Expression) -> (String, Vec<Value>) {
        SqlCompiler::new(backend).compile_expression_sql(expr)
    }

    #[test]
    fn test_coalesce() {
        let expr = coalesce(vec![
            Expression::col("nickname"),
            Expression::col("name"),
            Expression::value("Anonymous"),
        ]);
        let (sql, params) = compile(DatabaseBackendType::PostgreSQL, &expr);
        assert_eq!(sql, "COALESCE(\"nickname\", \"name\", $1)");
        assert_eq!(params, vec![Value::from("Anonymous")]);
    }

    #[test]
    fn test_round_and_substr() {
        let (sql, params) = compile(
            DatabaseBackendType::SQLite,
            &round(Expression::col("price"), Some(2)),
        );
        assert_eq!(sql, "ROUND(\"price\", ?)");
        assert_eq!(params, vec![Value::Int(2)]);

        let (sql, params) = compile(
            DatabaseBackendType::SQLite,
            &substr(Expression::col("name"), 1, Some(3)),
        );
        assert_eq!(sql, "SUBSTR(\"name\", ?, ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_now_per_backend() {
        assert_eq!(compile(DatabaseBackendType::SQLite, &now()).0, "CURRENT_TIMESTAMP");
        assert_eq!(compile(DatabaseBackendType::PostgreSQL, &now()).0, "NOW()");
    }

    #[test]
    fn test_cast() {
        let (sql, _) = compile(
            DatabaseBackendType::SQLite,
            &cast(Expression::col("price"), "INTEGER"),
        );
        assert_eq!(sql, "CAST(\"price\" AS INTEGER)");
    }

    #[test]
    fn test_aggregate_helpers() {
        let (sql, _) = compile(DatabaseBackendType::SQLite, &count_distinct("category"));
        // Unresolved field references compile as plain columns.
        assert_eq!(sql, "COUNT(DISTINCT \"category\")");
        assert_eq!(compile(DatabaseBackendType::SQLite, &max("price")).0, "MAX(\"price\")");
    }
}
