//! Name resolution: turns field names in filters and expressions into
//! columns of a concrete model.
//!
//! Relations are followed without joins. A forward span such as
//! `author__name="Leo"` becomes `author_id IN (SELECT id FROM author WHERE
//! name = 'Leo')`, a reverse span such as `book__title` becomes
//! `id IN (SELECT author_id FROM book WHERE ...)`, and an aggregate over a
//! reverse relation (`Count("book")`) becomes a correlated subquery per row.

use std::sync::Arc;

use sqlorm_core::error::{SqlormError, SqlormResult};

use super::compiler::{Query, SelectColumn, WhereNode};
use super::expressions::{AggregateFunc, Expression, When};
use super::lookups::{CompareOp, Lookup, Q};
use crate::fields::FieldDef;
use crate::instance::{related_model, reverse_field};
use crate::model::ModelDefinition;
use crate::registry::registry;
use crate::value::Value;

/// A filter after resolution, and whether it needs HAVING.
pub(crate) struct ResolvedFilter {
    pub node: WhereNode,
    pub aggregate: bool,
}

pub(crate) struct Resolver<'a> {
    model: &'a Arc<ModelDefinition>,
    outer: Option<&'a ModelDefinition>,
    annotations: &'a [(String, Expression)],
    fold_reverse: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        model: &'a Arc<ModelDefinition>,
        outer: Option<&'a ModelDefinition>,
        annotations: &'a [(String, Expression)],
    ) -> Self {
        Self {
            model,
            outer,
            annotations,
            fold_reverse: false,
        }
    }

    /// Aggregates over reverse relations fold across rows (for `aggregate()`
    /// and grouped `values()` querysets) instead of producing one value per row.
    #[must_use]
    pub fn fold_reverse(mut self, fold: bool) -> Self {
        self.fold_reverse = fold;
        self
    }

    fn annotation(&self, name: &str) -> Option<&Expression> {
        self.annotations
            .iter()
            .find(|(alias, _)| alias == name)
            .map(|(_, expr)| expr)
    }

    fn unknown(&self, name: &str) -> SqlormError {
        let mut choices: Vec<String> = self.model.get_fields().into_iter().map(String::from).collect();
        choices.extend(reverse_names(self.model));
        choices.extend(self.annotations.iter().map(|(alias, _)| alias.clone()));
        choices.sort();
        SqlormError::QueryError(format!(
            "Cannot resolve keyword '{name}' into field. Choices are: {}",
            choices.join(", ")
        ))
    }

    /// The child model and its foreign-key field for a reverse relation name.
    fn reverse_relation(&self, name: &str) -> Option<(Arc<ModelDefinition>, String)> {
        let child = registry().get_lowercase(name.strip_suffix("_set").unwrap_or(name))?;
        let fk = reverse_field(&child, self.model)?;
        Some((child, fk))
    }

    /// The column of a direct field (`pk` allowed).
    pub fn column_for(&self, name: &str) -> SqlormResult<String> {
        self.model
            .resolve_field(name)
            .map(|f| f.column.clone())
            .ok_or_else(|| self.unknown(name))
    }

    pub fn resolve_q(&self, q: &Q) -> SqlormResult<ResolvedFilter> {
        match q {
            Q::Filter { field, lookup } => self.resolve_filter(field, lookup),
            Q::And(children) | Q::Or(children) => {
                let mut nodes = Vec::with_capacity(children.len());
                let mut aggregate = false;
                for child in children {
                    let resolved = self.resolve_q(child)?;
                    aggregate |= resolved.aggregate;
                    nodes.push(resolved.node);
                }
                let node = if matches!(q, Q::And(_)) {
                    WhereNode::And(nodes)
                } else {
                    WhereNode::Or(nodes)
                };
                Ok(ResolvedFilter { node, aggregate })
            }
            Q::Not(inner) => {
                let resolved = self.resolve_q(inner)?;
                Ok(ResolvedFilter {
                    node: WhereNode::Not(Box::new(resolved.node)),
                    aggregate: resolved.aggregate,
                })
            }
            Q::Expr(expr) => {
                let expr = self.resolve_expr(expr)?;
                Ok(ResolvedFilter {
                    aggregate: expr.contains_aggregate(),
                    node: WhereNode::Expr(expr),
                })
            }
            Q::Resolved(node) => Ok(ResolvedFilter {
                node: (**node).clone(),
                aggregate: false,
            }),
            Q::Invalid(msg) => Err(SqlormError::QueryError(msg.clone())),
        }
    }

    fn resolve_q_node(&self, q: &Q) -> SqlormResult<Q> {
        Ok(Q::Resolved(Box::new(self.resolve_q(q)?.node)))
    }

    fn resolve_filter(&self, path: &str, lookup: &Lookup) -> SqlormResult<ResolvedFilter> {
        if let Some(expr) = self.annotation(path) {
            let lookup = self.resolve_lookup(lookup, None)?;
            return Ok(ResolvedFilter {
                aggregate: expr.contains_aggregate(),
                node: WhereNode::Condition {
                    lhs: expr.clone(),
                    lookup,
                },
            });
        }

        let (head, rest) = match path.split_once("__") {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        if let Some(field) = self.model.resolve_field(head) {
            let Some(rest) = rest else {
                let lookup = self.resolve_lookup(lookup, Some(field))?;
                return Ok(plain(WhereNode::column(field.column.clone(), lookup)));
            };
            if !field.is_relation() {
                return Err(SqlormError::QueryError(format!(
                    "Unsupported lookup '{rest}' for {} or join on the field not permitted.",
                    field.field_type.name()
                )));
            }
            let target = related_model(self.model, field.field_type.related_model().unwrap_or_default())?;
            if target.field(rest).is_some_and(|f| f.primary_key) || rest == "pk" {
                let lookup = self.resolve_lookup(lookup, Some(target.pk_field()))?;
                return Ok(plain(WhereNode::column(field.column.clone(), lookup)));
            }
            let inner = Resolver::new(&target, Some(self.model.as_ref()), &[]).resolve_filter(rest, lookup)?;
            let mut sub = Query::new(target.table_name());
            sub.select = vec![SelectColumn::Column(target.pk_field().column.clone())];
            sub.where_clause = Some(inner.node);
            return Ok(plain(WhereNode::column(
                field.column.clone(),
                Lookup::InSubquery(Box::new(sub)),
            )));
        }

        if let Some((child, fk)) = self.reverse_relation(head) {
            let inner = Resolver::new(&child, Some(self.model.as_ref()), &[])
                .resolve_filter(rest.unwrap_or("pk"), lookup)?;
            let fk_column = column_of(&child, &fk);
            let mut sub = Query::new(child.table_name());
            sub.select = vec![SelectColumn::Column(fk_column)];
            sub.where_clause = Some(inner.node);
            return Ok(plain(WhereNode::column(
                self.model.pk_field().column.clone(),
                Lookup::InSubquery(Box::new(sub)),
            )));
        }

        Err(self.unknown(head))
    }

    fn resolve_lookup(&self, lookup: &Lookup, field: Option<&FieldDef>) -> SqlormResult<Lookup> {
        let convert = |v: &Value| match field {
            Some(f) if !v.is_null() => f.to_db(v.clone()),
            _ => v.clone(),
        };
        Ok(match lookup {
            Lookup::Exact(v) => Lookup::Exact(convert(v)),
            Lookup::IExact(v) => Lookup::IExact(convert(v)),
            Lookup::Gt(v) => Lookup::Gt(convert(v)),
            Lookup::Gte(v) => Lookup::Gte(convert(v)),
            Lookup::Lt(v) => Lookup::Lt(convert(v)),
            Lookup::Lte(v) => Lookup::Lte(convert(v)),
            Lookup::In(values) => Lookup::In(values.iter().map(convert).collect()),
            Lookup::Range(low, high) => Lookup::Range(convert(low), convert(high)),
            Lookup::Compare(op, expr) => Lookup::Compare(*op, Box::new(self.resolve_expr(expr)?)),
            Lookup::InQuerySet(qs) => {
                Lookup::InSubquery(Box::new(qs.build_in_query(Some(self.model.as_ref()))?))
            }
            other => other.clone(),
        })
    }

    pub fn resolve_expr(&self, expr: &Expression) -> SqlormResult<Expression> {
        Ok(match expr {
            Expression::F(name) => self.resolve_f(name)?,
            Expression::OuterRef(name) => {
                let outer = self.outer.ok_or_else(|| {
                    SqlormError::QueryError(format!(
                        "OuterRef('{name}') may only be used inside a subquery"
                    ))
                })?;
                let field = outer.field(name).ok_or_else(|| {
                    SqlormError::QueryError(format!(
                        "Cannot resolve keyword '{name}' into field of {}",
                        outer.name()
                    ))
                })?;
                Expression::OuterCol {
                    table: outer.table_name().to_string(),
                    column: field.column.clone(),
                }
            }
            Expression::Func { name, args } => Expression::Func {
                name: name.clone(),
                args: args.iter().map(|a| self.resolve_expr(a)).collect::<SqlormResult<_>>()?,
            },
            Expression::Aggregate {
                func,
                field,
                distinct,
                filter,
            } => {
                if let Expression::F(path) = field.as_ref() {
                    let head = path.split("__").next().unwrap_or(path);
                    if self.model.field(head).is_none() && self.annotation(path).is_none() {
                        if let Some((child, fk)) = self.reverse_relation(head) {
                            return self.reverse_aggregate(*func, path, *distinct, filter.as_deref(), &child, &fk);
                        }
                    }
                }
                Expression::Aggregate {
                    func: *func,
                    field: Box::new(self.resolve_expr(field)?),
                    distinct: *distinct,
                    filter: filter
                        .as_deref()
                        .map(|q| self.resolve_q_node(q).map(Box::new))
                        .transpose()?,
                }
            }
            Expression::Case { whens, default } => Expression::Case {
                whens: whens
                    .iter()
                    .map(|w| {
                        Ok(When {
                            condition: self.resolve_q_node(&w.condition)?,
                            then: self.resolve_expr(&w.then)?,
                        })
                    })
                    .collect::<SqlormResult<_>>()?,
                default: default
                    .as_deref()
                    .map(|d| self.resolve_expr(d).map(Box::new))
                    .transpose()?,
            },
            Expression::Subquery(qs) => {
                Expression::Query(Box::new(qs.build_query_in(Some(self.model.as_ref()))?))
            }
            Expression::Exists { queryset, negated } => {
                let mut query = queryset.build_query_in(Some(self.model.as_ref()))?;
                query.order_by.clear();
                if query.limit.is_none() && !query.is_grouped() {
                    query.select = vec![SelectColumn::Expression(Expression::raw("1", vec![]), "a".into())];
                    query.annotations.clear();
                    query.limit = Some(1);
                }
                Expression::ExistsQuery {
                    query: Box::new(query),
                    negated: *negated,
                }
            }
            Expression::Cast { expr, data_type } => Expression::Cast {
                expr: Box::new(self.resolve_expr(expr)?),
                data_type: data_type.clone(),
            },
            Expression::Add(l, r) => Expression::Add(Box::new(self.resolve_expr(l)?), Box::new(self.resolve_expr(r)?)),
            Expression::Sub(l, r) => Expression::Sub(Box::new(self.resolve_expr(l)?), Box::new(self.resolve_expr(r)?)),
            Expression::Mul(l, r) => Expression::Mul(Box::new(self.resolve_expr(l)?), Box::new(self.resolve_expr(r)?)),
            Expression::Div(l, r) => Expression::Div(Box::new(self.resolve_expr(l)?), Box::new(self.resolve_expr(r)?)),
            other => other.clone(),
        })
    }

    /// `F("name")`: an annotation, a column, or a scalar subquery following
    /// a forward relation.
    fn resolve_f(&self, path: &str) -> SqlormResult<Expression> {
        if path == "*" {
            return Ok(Expression::Col("*".into()));
        }
        if let Some(expr) = self.annotation(path) {
            return Ok(expr.clone());
        }
        let (head, rest) = match path.split_once("__") {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let field = self.model.field(head).ok_or_else(|| self.unknown(head))?;
        let Some(rest) = rest else {
            return Ok(Expression::Col(field.column.clone()));
        };
        if !field.is_relation() {
            return Err(SqlormError::QueryError(format!(
                "Cannot resolve '{path}': '{head}' is not a relation"
            )));
        }
        let target = related_model(self.model, field.field_type.related_model().unwrap_or_default())?;
        let inner = Resolver::new(&target, Some(self.model.as_ref()), &[]).resolve_f(rest)?;
        let mut sub = Query::new(target.table_name());
        sub.select = vec![SelectColumn::Expression(inner, "value".into())];
        sub.where_clause = Some(WhereNode::Condition {
            lhs: Expression::Col(target.pk_field().column.clone()),
            lookup: Lookup::Compare(
                CompareOp::Eq,
                Box::new(Expression::OuterCol {
                    table: self.model.table_name().to_string(),
                    column: field.column.clone(),
                }),
            ),
        });
        Ok(Expression::Query(Box::new(sub)))
    }

    /// One correlated subquery aggregating the child rows of each parent row.
    fn child_aggregate(
        &self,
        func: AggregateFunc,
        rest: &str,
        distinct: bool,
        filter: Option<&Q>,
        child: &Arc<ModelDefinition>,
        fk: &str,
    ) -> SqlormResult<Expression> {
        let inner = Resolver::new(child, Some(self.model.as_ref()), &[]);
        let aggregate = Expression::Aggregate {
            func,
            field: Box::new(inner.resolve_f(rest)?),
            distinct,
            filter: filter.map(|q| inner.resolve_q_node(q).map(Box::new)).transpose()?,
        };
        let mut sub = Query::new(child.table_name());
        sub.select = vec![SelectColumn::Expression(aggregate, "value".into())];
        sub.where_clause = Some(WhereNode::Condition {
            lhs: Expression::Col(column_of(child, fk)),
            lookup: Lookup::Compare(
                CompareOp::Eq,
                Box::new(Expression::OuterCol {
                    table: self.model.table_name().to_string(),
                    column: self.model.pk_field().column.clone(),
                }),
            ),
        });
        Ok(Expression::Query(Box::new(sub)))
    }

    fn reverse_aggregate(
        &self,
        func: AggregateFunc,
        path: &str,
        distinct: bool,
        filter: Option<&Q>,
        child: &Arc<ModelDefinition>,
        fk: &str,
    ) -> SqlormResult<Expression> {
        let (prefix, rest) = match path.split_once("__") {
            Some((prefix, rest)) => (prefix, rest),
            None => (path, "pk"),
        };
        let filter = filter.map(|q| strip_relation_prefix(q, prefix));
        let per_row = |func| self.child_aggregate(func, rest, distinct, filter.as_ref(), child, fk);
        if !self.fold_reverse {
            return per_row(func);
        }
        let fold = |func, expr| Expression::aggregate(func, expr);
        Ok(match func {
            AggregateFunc::Count => Expression::func(
                "COALESCE",
                vec![fold(AggregateFunc::Sum, per_row(AggregateFunc::Count)?), Expression::value(0)],
            ),
            AggregateFunc::Sum => fold(AggregateFunc::Sum, per_row(AggregateFunc::Sum)?),
            AggregateFunc::Max => fold(AggregateFunc::Max, per_row(AggregateFunc::Max)?),
            AggregateFunc::Min => fold(AggregateFunc::Min, per_row(AggregateFunc::Min)?),
            AggregateFunc::Avg => {
                fold(AggregateFunc::Sum, per_row(AggregateFunc::Sum)?) * Expression::value(1.0)
                    / fold(AggregateFunc::Sum, per_row(AggregateFunc::Count)?)
            }
        })
    }
}

fn column_of(model: &ModelDefinition, field: &str) -> String {
    model
        .field(field)
        .map_or_else(|| field.to_string(), |f| f.column.clone())
}

fn plain(node: WhereNode) -> ResolvedFilter {
    ResolvedFilter {
        node,
        aggregate: false,
    }
}

/// Lowercase names of the registered models holding a foreign key to `model`.
fn reverse_names(model: &ModelDefinition) -> Vec<String> {
    registry()
        .get_all()
        .iter()
        .filter(|child| reverse_field(child, model).is_some())
        .map(|child| child.name().to_lowercase())
        .collect()
}

/// Rewrites `book__rating__gt` as `rating__gt` (and `book` as `pk`) so a
/// filter written from the parent's side can run against the child.
fn strip_relation_prefix(q: &Q, prefix: &str) -> Q {
    match q {
        Q::Filter { field, lookup } => {
            let field = if field == prefix {
                "pk".to_string()
            } else {
                field
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix("__"))
                    .map_or_else(|| field.clone(), str::to_string)
            };
            Q::Filter {
                field,
                lookup: lookup.clone(),
            }
        }
        Q::And(children) => Q::And(children.iter().map(|c| strip_relation_prefix(c, prefix)).collect()),
        Q::Or(children) => Q::Or(children.iter().map(|c| strip_relation_prefix(c, prefix)).collect()),
        Q::Not(inner) => Q::Not(Box::new(strip_relation_prefix(inner, prefix))),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{self, OnDelete};
    use crate::model::ModelBuilder;
    use crate::query::compiler::{DatabaseBackendType, SqlCompiler};

    fn sql_of(node: &WhereNode) -> (String, Vec<Value>) {
        SqlCompiler::new(DatabaseBackendType::SQLite).compile_where(node)
    }

    fn writer() -> Arc<ModelDefinition> {
        ModelBuilder::new("ResolveWriter")
            .field("name", fields::char_field(50))
            .field("active", fields::boolean_field())
            .register()
            .unwrap()
    }

    fn essay() -> Arc<ModelDefinition> {
        ModelBuilder::new("ResolveEssay")
            .field("title", fields::char_field(50))
            .field("writer", fields::foreign_key("ResolveWriter", OnDelete::Cascade))
            .field("score", fields::integer_field())
            .register()
            .unwrap()
    }

    #[test]
    fn test_plain_field_and_pk() {
        let w = writer();
        let r = Resolver::new(&w, None, &[]);
        let (sql, _) = sql_of(&r.resolve_q(&Q::kw("pk", 1)).unwrap().node);
        assert_eq!(sql, "\"id\" = ?");
        let (_, params) = sql_of(&r.resolve_q(&Q::kw("active", true)).unwrap().node);
        assert_eq!(params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_unknown_field_lists_choices() {
        let w = writer();
        let err = Resolver::new(&w, None, &[])
            .resolve_q(&Q::kw("nickname", "x"))
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("Cannot resolve keyword 'nickname' into field. Choices are:"));
        assert!(msg.contains("name"));
    }

    #[test]
    fn test_unsupported_lookup_on_plain_field() {
        let w = writer();
        let err = Resolver::new(&w, None, &[])
            .resolve_q(&Q::kw("name__startswithx", "x"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unsupported lookup 'startswithx'"));
    }

    #[test]
    fn test_forward_span_becomes_in_subquery() {
        writer();
        let e = essay();
        let node = Resolver::new(&e, None, &[])
            .resolve_q(&Q::kw("writer__name", "Leo"))
            .unwrap()
            .node;
        let (sql, params) = sql_of(&node);
        assert_eq!(
            sql,
            "\"writer_id\" IN (SELECT \"id\" FROM \"sqlorm_app_resolvewriter\" WHERE \"name\" = ?)"
        );
        assert_eq!(params, vec![Value::from("Leo")]);

        let node = Resolver::new(&e, None, &[])
            .resolve_q(&Q::kw("writer__id", 3))
            .unwrap()
            .node;
        assert_eq!(sql_of(&node).0, "\"writer_id\" = ?");
    }

    #[test]
    fn test_reverse_span_becomes_pk_in_subquery() {
        let w = writer();
        essay();
        let node = Resolver::new(&w, None, &[])
            .resolve_q(&Q::kw("resolveessay__score__gt", 5))
            .unwrap()
            .node;
        assert_eq!(
            sql_of(&node).0,
            "\"id\" IN (SELECT \"writer_id\" FROM \"sqlorm_app_resolveessay\" WHERE \"score\" > ?)"
        );
    }

    #[test]
    fn test_reverse_count_per_row_and_folded() {
        let w = writer();
        essay();
        let count = Expression::aggregate(AggregateFunc::Count, Expression::f("resolveessay"));
        let per_row = Resolver::new(&w, None, &[]).resolve_expr(&count).unwrap();
        assert!(!per_row.contains_aggregate());
        let (sql, _) = SqlCompiler::new(DatabaseBackendType::SQLite).compile_expression_sql(&per_row);
        assert_eq!(
            sql,
            "(SELECT COUNT(\"id\") AS \"value\" FROM \"sqlorm_app_resolveessay\" WHERE \"writer_id\" = \"sqlorm_app_resolvewriter\".\"id\")"
        );

        let folded = Resolver::new(&w, None, &[])
            .fold_reverse(true)
            .resolve_expr(&count)
            .unwrap();
        assert!(folded.contains_aggregate());
    }

    #[test]
    fn test_annotation_filter_is_having() {
        let w = writer();
        let annotations = vec![(
            "n".to_string(),
            Expression::aggregate(AggregateFunc::Count, Expression::col("id")),
        )];
        let resolved = Resolver::new(&w, None, &annotations)
            .resolve_q(&Q::kw("n__gt", 1))
            .unwrap();
        assert!(resolved.aggregate);
        assert_eq!(sql_of(&resolved.node).0, "COUNT(\"id\") > ?");
    }

    #[test]
    fn test_outer_ref_requires_outer_model() {
        let w = writer();
        let e = essay();
        assert!(Resolver::new(&e, None, &[])
            .resolve_expr(&Expression::outer_ref("pk"))
            .is_err());
        let expr = Resolver::new(&e, Some(&w), &[])
            .resolve_expr(&Expression::outer_ref("pk"))
            .unwrap();
        assert!(matches!(expr, Expression::OuterCol { ref column, .. } if column == "id"));
    }

    #[test]
    fn test_f_span_is_scalar_subquery() {
        writer();
        let e = essay();
        let expr = Resolver::new(&e, None, &[])
            .resolve_expr(&Expression::f("writer__name"))
            .unwrap();
        let (sql, _) = SqlCompiler::new(DatabaseBackendType::SQLite).compile_expression_sql(&expr);
        assert_eq!(
            sql,
            "(SELECT \"name\" AS \"value\" FROM \"sqlorm_app_resolvewriter\" WHERE \"id\" = \"sqlorm_app_resolveessay\".\"writer_id\")"
        );
    }

    #[test]
    fn test_strip_relation_prefix() {
        let q = strip_relation_prefix(&(Q::kw("book__rating__gt", 3) & Q::kw("book", 1)), "book");
        match q {
            Q::And(children) => {
                assert!(matches!(&children[0], Q::Filter { field, .. } if field == "rating"));
                assert!(matches!(&children[1], Q::Filter { field, .. } if field == "pk"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_q_reports_message() {
        let w = writer();
        let err = Resolver::new(&w, None, &[])
            .resolve_q(&Q::kw("id__in", 4))
            .err()
            .unwrap();
        assert!(err.to_string().contains("'in' lookup expects a list"));
    }
}
