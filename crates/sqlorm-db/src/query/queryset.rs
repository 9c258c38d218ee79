//! QuerySet and Manager for building and executing database queries.
//!
//! A [`QuerySet`] is a lazy description of a query against one model. Builder
//! methods return a modified copy; nothing touches the database until one of
//! the `*_exec` methods (or [`QuerySet::fetch`]) runs it against a
//! [`DbExecutor`]. The [`Manager`] is the entry point, `Model.objects`.
//!
//! ```
//! use sqlorm_db::fields;
//! use sqlorm_db::model::ModelBuilder;
//! use sqlorm_db::query::compiler::DatabaseBackendType;
//! use sqlorm_db::query::lookups::Q;
//!
//! let book = ModelBuilder::new("DocBook")
//!     .field("title", fields::char_field(100))
//!     .field("pages", fields::integer_field())
//!     .build()
//!     .unwrap();
//! let qs = book.objects().filter(Q::kw("pages__gte", 300)).order_by(&["-pages"]);
//! let (sql, _) = qs.to_sql(DatabaseBackendType::SQLite).unwrap();
//! assert_eq!(
//!     sql,
//!     "SELECT * FROM \"sqlorm_app_docbook\" WHERE \"pages\" >= ? ORDER BY \"pages\" DESC"
//! );
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use sqlorm_core::error::{SqlormError, SqlormResult};

use super::bulk::{self, BulkCreateOptions, BulkUpdateOptions};
use super::compiler::{DatabaseBackendType, OrderBy, Query, SelectColumn, SqlCompiler, WhereNode};
use super::expressions::{AggregateFunc, Expression};
use super::lookups::Q;
use super::prefetch::{prefetch_related_objects, Prefetch};
use super::raw::RawQuerySet;
use super::resolve::Resolver;
use crate::executor::DbExecutor;
use crate::instance::Instance;
use crate::model::ModelDefinition;
use crate::router;
use crate::value::Value;

/// How many rows `get()` fetches before giving up counting.
const MAX_GET_RESULTS: usize = 21;

/// A lazy, cloneable query over one model.
#[derive(Debug, Clone)]
pub struct QuerySet {
    model: Arc<ModelDefinition>,
    filters: Vec<Q>,
    order_by: Option<Vec<String>>,
    reversed: bool,
    distinct: bool,
    values: Option<Vec<String>>,
    annotations: Vec<(String, Expression)>,
    limit: Option<usize>,
    offset: Option<usize>,
    is_none: bool,
    using: Option<String>,
    prefetch: Vec<Prefetch>,
}

impl QuerySet {
    pub fn new(model: Arc<ModelDefinition>) -> Self {
        Self {
            model,
            filters: Vec::new(),
            order_by: None,
            reversed: false,
            distinct: false,
            values: None,
            annotations: Vec::new(),
            limit: None,
            offset: None,
            is_none: false,
            using: None,
            prefetch: Vec::new(),
        }
    }

    pub fn model(&self) -> &Arc<ModelDefinition> {
        &self.model
    }

    /// The alias set with [`QuerySet::using`], if any.
    pub fn using_db(&self) -> Option<&str> {
        self.using.as_deref()
    }

    /// The alias reads go to: explicit, then the model's, then the routers.
    pub fn read_alias(&self) -> String {
        router::db_for_read(&self.model, self.using.as_deref())
    }

    pub fn write_alias(&self) -> String {
        router::db_for_write(&self.model, self.using.as_deref())
    }

    fn is_sliced(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    // ── Builders ──────────────────────────────────────────────────────

    #[must_use]
    pub fn all(self) -> Self {
        self
    }

    #[must_use]
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = Some(alias.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, q: Q) -> Self {
        self.filters.push(q);
        self
    }

    #[must_use]
    pub fn exclude(mut self, q: Q) -> Self {
        self.filters.push(!q);
        self
    }

    /// Replaces the ordering. `"-name"` sorts descending; an empty slice
    /// clears the model's default ordering too.
    #[must_use]
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        self.order_by = Some(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }

    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.reversed = !self.reversed;
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Restricts the selected columns. Rows come back as maps through
    /// [`QuerySet::values_exec`]. Annotations added afterwards are grouped
    /// by these fields.
    #[must_use]
    pub fn values(mut self, fields: &[&str]) -> Self {
        self.values = Some(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Same selection as [`QuerySet::values`]; read the rows with
    /// [`QuerySet::values_list_exec`] or [`QuerySet::values_flat_exec`].
    #[must_use]
    pub fn values_list(self, fields: &[&str]) -> Self {
        self.values(fields)
    }

    /// Adds a computed column available to filters, ordering and results.
    #[must_use]
    pub fn annotate(mut self, alias: impl Into<String>, expr: impl Into<Expression>) -> Self {
        self.annotations.push((alias.into(), expr.into()));
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// `qs[start..end]`.
    #[must_use]
    pub fn slice(self, range: std::ops::Range<usize>) -> Self {
        let len = range.end.saturating_sub(range.start);
        self.offset(range.start).limit(len)
    }

    /// A queryset that matches nothing and never queries the database.
    #[must_use]
    pub fn none(mut self) -> Self {
        self.is_none = true;
        self
    }

    #[must_use]
    pub fn prefetch_related(mut self, lookups: &[&str]) -> Self {
        self.prefetch.extend(lookups.iter().map(|l| Prefetch::new(*l)));
        self
    }

    #[must_use]
    pub fn prefetch(mut self, prefetch: Prefetch) -> Self {
        self.prefetch.push(prefetch);
        self
    }

    // ── Query building ────────────────────────────────────────────────

    /// Resolves every name against the model and builds the SELECT.
    pub fn build_query(&self) -> SqlormResult<Query> {
        self.build_query_in(None)
    }

    /// Builds the SELECT as a subquery of `outer`, which `OuterRef` points at.
    pub fn build_query_in(&self, outer: Option<&ModelDefinition>) -> SqlormResult<Query> {
        self.build(outer, self.values.is_some())
    }

    fn resolve_annotations(
        &self,
        outer: Option<&ModelDefinition>,
        fold: bool,
    ) -> SqlormResult<Vec<(String, Expression)>> {
        let mut resolved: Vec<(String, Expression)> = Vec::with_capacity(self.annotations.len());
        for (alias, expr) in &self.annotations {
            if self.model.field(alias).is_some() {
                return Err(SqlormError::QueryError(format!(
                    "The annotation '{alias}' conflicts with a field on the model."
                )));
            }
            let expr = Resolver::new(&self.model, outer, &resolved)
                .fold_reverse(fold)
                .resolve_expr(expr)?;
            resolved.push((alias.clone(), expr));
        }
        Ok(resolved)
    }

    fn build(&self, outer: Option<&ModelDefinition>, fold: bool) -> SqlormResult<Query> {
        let annotations = self.resolve_annotations(outer, fold)?;
        let resolver = Resolver::new(&self.model, outer, &annotations);

        let mut query = Query::new(self.model.table_name());
        query.distinct = self.distinct;
        query.limit = self.limit;
        query.offset = self.offset;

        let mut wheres = Vec::new();
        let mut havings = Vec::new();
        for q in &self.filters {
            let resolved = resolver.resolve_q(q)?;
            if resolved.aggregate {
                havings.push(resolved.node);
            } else {
                wheres.push(resolved.node);
            }
        }
        if self.is_none {
            wheres.push(WhereNode::Or(Vec::new()));
        }
        query.where_clause = WhereNode::and_all(wheres);
        query.having = WhereNode::and_all(havings);

        let aggregated = annotations.iter().any(|(_, e)| e.contains_aggregate());
        if let Some(names) = &self.values {
            let mut select = Vec::new();
            for name in names {
                if annotations.iter().any(|(alias, _)| alias == name) {
                    continue;
                }
                let column = match self.model.field(name) {
                    Some(field) if field.column == *name => SelectColumn::Column(name.clone()),
                    Some(field) => {
                        SelectColumn::Expression(Expression::Col(field.column.clone()), name.clone())
                    }
                    None => SelectColumn::Expression(
                        resolver.resolve_expr(&Expression::f(name.as_str()))?,
                        name.clone(),
                    ),
                };
                if aggregated {
                    query.group_by.push(
                        self.model
                            .field(name)
                            .map_or_else(|| name.clone(), |f| f.column.clone()),
                    );
                }
                select.push(column);
            }
            query.select = select;
        } else if aggregated {
            query.group_by = self.model.fields().iter().map(|f| f.column.clone()).collect();
        }

        let mut order_by = match &self.order_by {
            Some(names) => names
                .iter()
                .map(|name| self.order_for(name, &annotations, &resolver))
                .collect::<SqlormResult<_>>()?,
            None if aggregated => Vec::new(),
            None => self.model.default_order_by(),
        };
        if self.reversed {
            order_by = order_by.iter().map(OrderBy::reversed).collect();
        }
        query.order_by = order_by;
        query.annotations = annotations;
        Ok(query)
    }

    fn order_for(
        &self,
        entry: &str,
        annotations: &[(String, Expression)],
        resolver: &Resolver<'_>,
    ) -> SqlormResult<OrderBy> {
        let (descending, name) = entry
            .strip_prefix('-')
            .map_or((false, entry), |rest| (true, rest));
        let column = if annotations.iter().any(|(alias, _)| alias == name)
            || self.values.as_ref().is_some_and(|v| v.iter().any(|n| n == name) && name.contains("__"))
        {
            name.to_string()
        } else {
            resolver.column_for(name)?
        };
        Ok(if descending {
            OrderBy::desc(column)
        } else {
            OrderBy::asc(column)
        })
    }

    /// The single-column SELECT used for `field__in=<queryset>`: the primary
    /// key, or the one field named in `values()`.
    pub fn build_in_query(&self, outer: Option<&ModelDefinition>) -> SqlormResult<Query> {
        let field = match self.values.as_deref() {
            None | Some([]) => "pk".to_string(),
            Some([one]) => one.clone(),
            Some(_) => {
                return Err(SqlormError::QueryError(
                    "Cannot use multi-field values as a filter value.".into(),
                ))
            }
        };
        let mut qs = self.clone();
        qs.values = Some(vec![field.clone()]);
        let mut query = qs.build_query_in(outer)?;
        if !query.is_grouped() {
            query.annotations.retain(|(alias, _)| *alias == field);
        }
        if query.limit.is_none() {
            query.order_by.clear();
        }
        Ok(query)
    }

    /// Compiles the SELECT for `backend`.
    pub fn to_sql(&self, backend: DatabaseBackendType) -> SqlormResult<(String, Vec<Value>)> {
        Ok(SqlCompiler::new(backend).compile_select(&self.build_query()?))
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Runs the query and returns model instances, with prefetches loaded.
    pub async fn fetch(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<Instance>> {
        if self.is_none {
            return Ok(Vec::new());
        }
        let (sql, params) = self.to_sql(db.backend_type())?;
        let rows = db.query(&sql, &params).await?;
        let alias = self.read_alias();
        let mut instances: Vec<Instance> = rows
            .iter()
            .map(|row| {
                let mut instance = self.model.from_row(row);
                instance.set_db(alias.as_str());
                instance
            })
            .collect();
        // Prefetching fetches again, so the recursion goes through a box.
        Box::pin(prefetch_related_objects(&self.prefetch, &mut instances, db)).await?;
        Ok(instances)
    }

    /// Same as [`QuerySet::fetch`].
    pub async fn execute_query(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<Instance>> {
        self.fetch(db).await
    }

    pub async fn count_exec(&self, db: &dyn DbExecutor) -> SqlormResult<i64> {
        if self.is_none {
            return Ok(0);
        }
        let mut query = self.build_query()?;
        query.order_by.clear();
        let count = SelectColumn::Expression(
            Expression::aggregate(AggregateFunc::Count, Expression::col("*")),
            "__count".into(),
        );
        let query = if query.distinct || query.is_grouped() || self.is_sliced() {
            let mut outer = Query::wrapping(query);
            outer.select = vec![count];
            outer
        } else {
            query.select = vec![count];
            query.annotations.clear();
            query
        };
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        match db.query(&sql, &params).await?.into_iter().next() {
            Some(row) => row.get_by_index::<i64>(0),
            None => Ok(0),
        }
    }

    pub async fn exists_exec(&self, db: &dyn DbExecutor) -> SqlormResult<bool> {
        if self.is_none {
            return Ok(false);
        }
        let mut query = self.build_query()?;
        query.order_by.clear();
        if !query.is_grouped() {
            query.select = vec![SelectColumn::Expression(Expression::value(1), "a".into())];
            query.annotations.clear();
            query.distinct = false;
        }
        if query.limit.is_none() {
            query.limit = Some(1);
        }
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        Ok(!db.query(&sql, &params).await?.is_empty())
    }

    fn is_ordered(&self) -> bool {
        self.order_by.as_ref().map_or(!self.model.ordering().is_empty(), |o| !o.is_empty())
    }

    /// The first row, ordered by primary key unless the queryset is ordered.
    pub async fn first_exec(&self, db: &dyn DbExecutor) -> SqlormResult<Option<Instance>> {
        let mut qs = self.clone();
        if !qs.is_ordered() {
            qs.order_by = Some(vec!["pk".into()]);
        }
        qs.limit = Some(qs.limit.map_or(1, |l| l.min(1)));
        Ok(qs.fetch(db).await?.into_iter().next())
    }

    pub async fn last_exec(&self, db: &dyn DbExecutor) -> SqlormResult<Option<Instance>> {
        if self.is_sliced() {
            return Err(SqlormError::QueryError(
                "Cannot reverse a query once a slice has been taken.".into(),
            ));
        }
        let mut qs = self.clone();
        if !qs.is_ordered() {
            qs.order_by = Some(vec!["pk".into()]);
        }
        qs.reversed = !qs.reversed;
        qs.limit = Some(1);
        Ok(qs.fetch(db).await?.into_iter().next())
    }

    /// Exactly one matching row.
    pub async fn get_exec(&self, db: &dyn DbExecutor) -> SqlormResult<Instance> {
        let name = self.model.name();
        let not_found = || SqlormError::DoesNotExist(format!("{name} matching query does not exist."));
        if self.is_none {
            return Err(not_found());
        }
        let mut qs = self.clone();
        if qs.limit.is_none() {
            qs.limit = Some(MAX_GET_RESULTS);
        }
        let mut found = qs.fetch(db).await?;
        match found.len() {
            0 => Err(not_found()),
            1 => Ok(found.remove(0)),
            n => {
                let shown = if n >= MAX_GET_RESULTS {
                    format!("more than {}", MAX_GET_RESULTS - 1)
                } else {
                    n.to_string()
                };
                Err(SqlormError::MultipleObjectsReturned(format!(
                    "get() returned more than one {name} -- it returned {shown}!"
                )))
            }
        }
    }

    /// Aggregates over the whole queryset: `aggregate(&[("total", sum("price"))])`.
    pub async fn aggregate_exec(
        &self,
        db: &dyn DbExecutor,
        aggregates: &[(&str, Expression)],
    ) -> SqlormResult<HashMap<String, Value>> {
        for (alias, expr) in aggregates {
            if !expr.contains_aggregate() {
                return Err(SqlormError::QueryError(format!(
                    "{alias} is not an aggregate expression"
                )));
            }
        }
        if self.is_none {
            return Ok(aggregates
                .iter()
                .map(|(alias, expr)| {
                    let empty = match expr {
                        Expression::Aggregate { func: AggregateFunc::Count, .. } => Value::Int(0),
                        _ => Value::Null,
                    };
                    ((*alias).to_string(), empty)
                })
                .collect());
        }

        let mut base = self.build(None, true)?;
        base.order_by.clear();
        let wrap = base.distinct || base.is_grouped() || self.is_sliced();
        let query = if wrap {
            // Aggregate the rows of the inner query by their output names.
            let mut outer = Query::wrapping(base);
            outer.select = aggregates
                .iter()
                .map(|(alias, expr)| SelectColumn::Expression(columns_as_written(expr), (*alias).to_string()))
                .collect();
            outer
        } else {
            let resolver = Resolver::new(&self.model, None, &base.annotations).fold_reverse(true);
            let select = aggregates
                .iter()
                .map(|(alias, expr)| {
                    Ok(SelectColumn::Expression(resolver.resolve_expr(expr)?, (*alias).to_string()))
                })
                .collect::<SqlormResult<Vec<_>>>()?;
            base.select = select;
            base.annotations.clear();
            base
        };
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        let row = db.query(&sql, &params).await?.into_iter().next();
        Ok(aggregates
            .iter()
            .map(|(alias, _)| {
                let value = row
                    .as_ref()
                    .and_then(|r| r.get_value(alias).cloned())
                    .unwrap_or(Value::Null);
                ((*alias).to_string(), value)
            })
            .collect())
    }

    fn output_names(&self) -> Vec<String> {
        let mut names = self
            .values
            .clone()
            .unwrap_or_else(|| self.model.get_fields().into_iter().map(String::from).collect());
        for (alias, _) in &self.annotations {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }
        names
    }

    fn with_values(&self) -> Self {
        let mut qs = self.clone();
        if qs.values.is_none() {
            qs.values = Some(self.model.get_fields().into_iter().map(String::from).collect());
        }
        qs
    }

    /// Rows as `name -> value` maps.
    pub async fn values_exec(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<HashMap<String, Value>>> {
        if self.is_none {
            return Ok(Vec::new());
        }
        let (sql, params) = self.with_values().to_sql(db.backend_type())?;
        let rows = db.query(&sql, &params).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let columns = row.columns().to_vec();
                columns
                    .into_iter()
                    .zip(row.into_values())
                    .map(|(name, value)| {
                        let value = match self.model.field(&name) {
                            Some(field) => field.from_db(value),
                            None => value,
                        };
                        (name, value)
                    })
                    .collect()
            })
            .collect())
    }

    /// Rows as tuples in the order the fields were named.
    pub async fn values_list_exec(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<Vec<Value>>> {
        let names = self.output_names();
        let rows = self.values_exec(db).await?;
        Ok(rows
            .into_iter()
            .map(|mut row| {
                names
                    .iter()
                    .map(|n| row.remove(n).unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    /// `values_list(field, flat=True)`.
    pub async fn values_flat_exec(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<Value>> {
        if self.output_names().len() != 1 {
            return Err(SqlormError::QueryError(
                "'flat' is not valid when values_list is called with more than one field.".into(),
            ));
        }
        Ok(self
            .values_list_exec(db)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    fn write_filter(&self) -> SqlormResult<WhereNode> {
        let annotations = self.resolve_annotations(None, false)?;
        let resolver = Resolver::new(&self.model, None, &annotations);
        let mut nodes = Vec::new();
        for q in &self.filters {
            let resolved = resolver.resolve_q(q)?;
            if resolved.aggregate {
                return Err(SqlormError::QueryError(
                    "Aggregate filters cannot be used with update() or delete().".into(),
                ));
            }
            nodes.push(resolved.node);
        }
        Ok(WhereNode::and_all(nodes).unwrap_or_else(|| WhereNode::And(Vec::new())))
    }

    /// `UPDATE ... SET` on every matching row. Returns the rows changed.
    pub async fn update_exec(
        &self,
        db: &dyn DbExecutor,
        assignments: &[(&str, Expression)],
    ) -> SqlormResult<u64> {
        if self.is_sliced() {
            return Err(SqlormError::QueryError(
                "Cannot update a query once a slice has been taken.".into(),
            ));
        }
        if self.is_none || assignments.is_empty() {
            return Ok(0);
        }
        let resolver = Resolver::new(&self.model, None, &[]);
        let set = assignments
            .iter()
            .map(|(name, expr)| {
                let field = self.model.field(name).ok_or_else(|| {
                    SqlormError::QueryError(format!(
                        "{} has no field named '{name}'",
                        self.model.name()
                    ))
                })?;
                let expr = match expr {
                    Expression::Value(v) => Expression::Value(field.to_db(v.clone())),
                    other => resolver.resolve_expr(other)?,
                };
                Ok((field.column.clone(), expr))
            })
            .collect::<SqlormResult<Vec<_>>>()?;
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_update(
            self.model.table_name(),
            &set,
            &self.write_filter()?,
        );
        let changed = db.execute_sql(&sql, &params).await?;
        tracing::debug!(model = %self.model.name(), rows = changed, "update");
        Ok(changed)
    }

    /// Deletes every matching row. Returns the rows removed.
    pub async fn delete_exec(&self, db: &dyn DbExecutor) -> SqlormResult<u64> {
        if self.is_sliced() {
            return Err(SqlormError::QueryError(
                "Cannot use 'limit' or 'offset' with delete.".into(),
            ));
        }
        if self.is_none {
            return Ok(0);
        }
        let (sql, params) = SqlCompiler::new(db.backend_type())
            .compile_delete(self.model.table_name(), &self.write_filter()?);
        let removed = db.execute_sql(&sql, &params).await?;
        tracing::debug!(model = %self.model.name(), rows = removed, "delete");
        Ok(removed)
    }
}

/// Rewrites field references as plain output columns, for aggregating over
/// a wrapped subquery.
fn columns_as_written(expr: &Expression) -> Expression {
    match expr {
        Expression::F(name) => Expression::Col(name.clone()),
        Expression::Aggregate {
            func,
            field,
            distinct,
            filter,
        } => Expression::Aggregate {
            func: *func,
            field: Box::new(columns_as_written(field)),
            distinct: *distinct,
            filter: filter.clone(),
        },
        Expression::Func { name, args } => Expression::Func {
            name: name.clone(),
            args: args.iter().map(columns_as_written).collect(),
        },
        other => other.clone(),
    }
}

/// The entry point for model-level queries, `Model.objects`.
///
/// A `Manager` holds no query state beyond an optional database alias; each
/// call starts a fresh [`QuerySet`].
#[derive(Debug, Clone)]
pub struct Manager {
    model: Arc<ModelDefinition>,
    using: Option<String>,
}

impl Manager {
    pub fn new(model: Arc<ModelDefinition>) -> Self {
        Self { model, using: None }
    }

    pub fn model(&self) -> &Arc<ModelDefinition> {
        &self.model
    }

    #[must_use]
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = Some(alias.into());
        self
    }

    pub fn all(&self) -> QuerySet {
        let qs = QuerySet::new(Arc::clone(&self.model));
        match &self.using {
            Some(alias) => qs.using(alias.clone()),
            None => qs,
        }
    }

    pub fn filter(&self, q: Q) -> QuerySet {
        self.all().filter(q)
    }

    pub fn exclude(&self, q: Q) -> QuerySet {
        self.all().exclude(q)
    }

    pub fn none(&self) -> QuerySet {
        self.all().none()
    }

    pub fn order_by(&self, fields: &[&str]) -> QuerySet {
        self.all().order_by(fields)
    }

    pub fn annotate(&self, alias: impl Into<String>, expr: impl Into<Expression>) -> QuerySet {
        self.all().annotate(alias, expr)
    }

    pub fn values(&self, fields: &[&str]) -> QuerySet {
        self.all().values(fields)
    }

    pub fn raw(&self, sql: impl Into<String>, params: Vec<Value>) -> RawQuerySet {
        RawQuerySet::new(Arc::clone(&self.model), sql, params)
    }

    pub async fn count_exec(&self, db: &dyn DbExecutor) -> SqlormResult<i64> {
        self.all().count_exec(db).await
    }

    pub async fn get_exec(&self, db: &dyn DbExecutor, q: Q) -> SqlormResult<Instance> {
        self.filter(q).get_exec(db).await
    }

    /// Creates and saves an instance from `(field, value)` pairs.
    pub async fn create_exec(
        &self,
        db: &dyn DbExecutor,
        values: &[(&str, Value)],
    ) -> SqlormResult<Instance> {
        let mut instance = self.model.new_instance();
        for (name, value) in values {
            instance.set(name, value.clone())?;
        }
        instance.set_db(self.all().write_alias());
        instance.save(db).await?;
        Ok(instance)
    }

    pub async fn get_or_create_exec(
        &self,
        db: &dyn DbExecutor,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> SqlormResult<(Instance, bool)> {
        bulk::get_or_create(&self.all(), lookup, defaults, db).await
    }

    pub async fn update_or_create_exec(
        &self,
        db: &dyn DbExecutor,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> SqlormResult<(Instance, bool)> {
        bulk::update_or_create(&self.all(), lookup, defaults, db).await
    }

    pub async fn bulk_create_exec(
        &self,
        db: &dyn DbExecutor,
        objects: &mut [Instance],
        options: &BulkCreateOptions,
    ) -> SqlormResult<u64> {
        bulk::bulk_create(&self.model, objects, options, db).await
    }

    pub async fn bulk_update_exec(
        &self,
        db: &dyn DbExecutor,
        objects: &[Instance],
        fields: &[&str],
        options: &BulkUpdateOptions,
    ) -> SqlormResult<u64> {
        bulk::bulk_update(&self.model, objects, fields, options, db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{self, OnDelete};
    use crate::model::{ModelBuilder, ModelOptions};
    use crate::query::compiler::Row;
    use crate::query::expressions::{count, sum, Exists, OuterRef, Subquery};
    use crate::query::lookups::Lookup;
    use crate::test_utils::MockDb;

    fn author() -> Arc<ModelDefinition> {
        ModelBuilder::new("QsAuthor")
            .field("name", fields::char_field(50))
            .field("age", fields::integer_field())
            .register()
            .unwrap()
    }

    fn book() -> Arc<ModelDefinition> {
        ModelBuilder::new("QsBook")
            .field("title", fields::char_field(100))
            .field("price", fields::float_field())
            .field("author", fields::foreign_key("QsAuthor", OnDelete::Cascade))
            .meta(ModelOptions {
                ordering: vec!["-price".into()],
                ..Default::default()
            })
            .register()
            .unwrap()
    }

    fn sqlite() -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn sql(qs: &QuerySet) -> String {
        qs.to_sql(sqlite()).unwrap().0
    }

    #[test]
    fn test_filter_exclude_order() {
        let a = author();
        let qs = a
            .objects()
            .filter(Q::kw("age__gte", 18))
            .exclude(Q::kw("name__startswith", "X"))
            .order_by(&["-age", "name"]);
        assert_eq!(
            sql(&qs),
            "SELECT * FROM \"sqlorm_app_qsauthor\" WHERE (\"age\" >= ? AND NOT (\"name\" LIKE ? ESCAPE '\\')) ORDER BY \"age\" DESC, \"name\" ASC"
        );
    }

    #[test]
    fn test_model_ordering_and_reverse() {
        author();
        let b = book();
        assert_eq!(
            sql(&b.objects().all()),
            "SELECT * FROM \"sqlorm_app_qsbook\" ORDER BY \"price\" DESC"
        );
        assert!(sql(&b.objects().all().reverse()).ends_with("ORDER BY \"price\" ASC"));
        assert!(!sql(&b.objects().order_by(&[])).contains("ORDER BY"));
    }

    #[test]
    fn test_fk_name_resolves_to_column() {
        author();
        let b = book();
        let (text, params) = b.objects().filter(Q::kw("author", 3)).to_sql(sqlite()).unwrap();
        assert!(text.contains("WHERE \"author_id\" = ?"));
        assert_eq!(params, vec![Value::Int(3)]);
        assert!(sql(&b.objects().filter(Q::kw("author_id", 3))).contains("WHERE \"author_id\" = ?"));
    }

    #[test]
    fn test_unknown_field_errors() {
        let a = author();
        let err = a.objects().filter(Q::kw("nope", 1)).to_sql(sqlite()).unwrap_err();
        assert!(matches!(err, SqlormError::QueryError(_)));
        assert!(err.to_string().contains("Cannot resolve keyword 'nope' into field."));
    }

    #[test]
    fn test_slice_and_none() {
        let a = author();
        assert!(sql(&a.objects().all().slice(5..15)).ends_with("LIMIT 10 OFFSET 5"));
        assert!(sql(&a.objects().none()).contains("WHERE 1=0"));
    }

    #[test]
    fn test_values_with_aggregate_groups() {
        author();
        let b = book();
        let qs = b.objects().values(&["author"]).annotate("total", sum("price"));
        assert_eq!(
            sql(&qs),
            "SELECT \"author_id\" AS \"author\", SUM(\"price\") AS \"total\" FROM \"sqlorm_app_qsbook\" GROUP BY \"author_id\""
        );
    }

    #[test]
    fn test_annotation_filter_goes_to_having() {
        let a = author();
        let qs = a
            .objects()
            .annotate("n", count("id"))
            .filter(Q::kw("n__gt", 1))
            .order_by(&["-n"]);
        let text = sql(&qs);
        assert!(text.contains("GROUP BY \"id\", \"name\", \"age\""));
        assert!(text.contains("HAVING COUNT(\"id\") > ?"));
        assert!(text.ends_with("ORDER BY \"n\" DESC"));
    }

    #[test]
    fn test_annotation_conflicting_with_field() {
        let a = author();
        let err = a.objects().annotate("name", count("id")).to_sql(sqlite()).unwrap_err();
        assert!(err.to_string().contains("conflicts with a field"));
    }

    #[test]
    fn test_in_queryset_and_multi_field_values() {
        let a = author();
        let b = book();
        let adults = a.objects().filter(Q::kw("age__gte", 18));
        let qs = b.objects().filter(Q::kw_in("author", adults.clone()));
        assert!(sql(&qs).contains(
            "\"author_id\" IN (SELECT \"id\" AS \"pk\" FROM \"sqlorm_app_qsauthor\" WHERE \"age\" >= ?)"
        ));

        let bad = b
            .objects()
            .filter(Q::kw_in("author", adults.values(&["id", "name"])));
        assert!(bad
            .to_sql(sqlite())
            .unwrap_err()
            .to_string()
            .contains("multi-field values"));
    }

    #[test]
    fn test_subquery_and_exists_with_outer_ref() {
        let a = author();
        let b = book();
        let newest = Subquery::new(
            b.objects()
                .filter(Q::kw_expr("author", OuterRef::new("pk").into()))
                .values(&["title"])
                .limit(1),
        );
        let qs = a.objects().annotate("newest", newest);
        let text = sql(&qs);
        assert!(text.contains(
            "(SELECT \"title\" FROM \"sqlorm_app_qsbook\" WHERE \"author_id\" = \"sqlorm_app_qsauthor\".\"id\" ORDER BY \"price\" DESC LIMIT 1) AS \"newest\""
        ));

        let has_books = Exists::new(b.objects().filter(Q::kw_expr("author", OuterRef::new("pk").into())));
        let text = sql(&a.objects().filter(Q::exists(has_books.into())));
        assert!(text.contains(
            "WHERE EXISTS (SELECT 1 AS \"a\" FROM \"sqlorm_app_qsbook\" WHERE \"author_id\" = \"sqlorm_app_qsauthor\".\"id\" LIMIT 1)"
        ));
    }

    #[tokio::test]
    async fn test_count_wraps_sliced_queries() {
        let a = author();
        let db = MockDb::with_responses(
            sqlite(),
            vec![
                vec![Row::new(vec!["__count".into()], vec![Value::Int(4)])],
                vec![Row::new(vec!["__count".into()], vec![Value::Int(2)])],
            ],
        );
        assert_eq!(a.objects().count_exec(&db).await.unwrap(), 4);
        assert_eq!(a.objects().all().limit(2).count_exec(&db).await.unwrap(), 2);
        let stmts = db.statements().await;
        assert_eq!(stmts[0].0, "SELECT COUNT(*) AS \"__count\" FROM \"sqlorm_app_qsauthor\"");
        assert_eq!(
            stmts[1].0,
            "SELECT COUNT(*) AS \"__count\" FROM (SELECT * FROM \"sqlorm_app_qsauthor\" LIMIT 2) \"subquery\""
        );
        assert_eq!(a.objects().none().count_exec(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_errors() {
        let a = author();
        let db = MockDb::new(sqlite());
        let err = a.objects().get_exec(&db, Q::kw("pk", 1)).await.unwrap_err();
        assert_eq!(err.to_string(), "QsAuthor matching query does not exist.");

        let row = || Row::new(vec!["id".into()], vec![Value::Int(1)]);
        let db = MockDb::with_responses(sqlite(), vec![vec![row(), row()]]);
        let err = a.objects().get_exec(&db, Q::kw("age", 3)).await.unwrap_err();
        assert!(matches!(err, SqlormError::MultipleObjectsReturned(_)));
        assert!(err.to_string().contains("get() returned more than one QsAuthor -- it returned 2!"));
        assert!(db.statements().await[0].0.ends_with("LIMIT 21"));
    }

    #[tokio::test]
    async fn test_first_and_last_default_to_pk() {
        let a = author();
        let db = MockDb::new(sqlite());
        assert!(a.objects().all().first_exec(&db).await.unwrap().is_none());
        a.objects().all().last_exec(&db).await.unwrap();
        let stmts = db.statements().await;
        assert!(stmts[0].0.ends_with("ORDER BY \"id\" ASC LIMIT 1"));
        assert!(stmts[1].0.ends_with("ORDER BY \"id\" DESC LIMIT 1"));
        assert!(a.objects().all().limit(3).last_exec(&db).await.is_err());
    }

    #[tokio::test]
    async fn test_aggregate_and_values_list() {
        let a = author();
        let db = MockDb::with_responses(
            sqlite(),
            vec![
                vec![Row::new(vec!["total".into()], vec![Value::Int(30)])],
                vec![Row::new(
                    vec!["name".into(), "age".into()],
                    vec![Value::from("Ann"), Value::Int(30)],
                )],
            ],
        );
        let result = a
            .objects()
            .all()
            .aggregate_exec(&db, &[("total", sum("age"))])
            .await
            .unwrap();
        assert_eq!(result["total"], Value::Int(30));

        let rows = a
            .objects()
            .values(&["age", "name"])
            .values_list_exec(&db)
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(30), Value::from("Ann")]]);

        let stmts = db.statements().await;
        assert_eq!(stmts[0].0, "SELECT SUM(\"age\") AS \"total\" FROM \"sqlorm_app_qsauthor\"");

        let err = a.objects().values(&["age", "name"]).values_flat_exec(&db).await.unwrap_err();
        assert!(err.to_string().contains("'flat' is not valid"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let a = author();
        let db = MockDb::new(sqlite());
        let changed = a
            .objects()
            .filter(Q::kw("age__lt", 18))
            .update_exec(&db, &[("age", Expression::f("age") + Expression::value(1))])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        a.objects().filter(Q::filter("name", Lookup::Exact(Value::Null))).delete_exec(&db).await.unwrap();
        let stmts = db.statements().await;
        assert_eq!(
            stmts[0].0,
            "UPDATE \"sqlorm_app_qsauthor\" SET \"age\" = (\"age\" + ?) WHERE \"age\" < ?"
        );
        assert_eq!(stmts[1].0, "DELETE FROM \"sqlorm_app_qsauthor\" WHERE \"name\" IS NULL");

        let err = a.objects().all().limit(1).delete_exec(&db).await.unwrap_err();
        assert!(err.to_string().contains("Cannot use 'limit' or 'offset' with delete."));
    }

    #[tokio::test]
    async fn test_create_saves_and_sets_pk() {
        let a = author();
        let db = MockDb::new(sqlite());
        let created = a
            .objects()
            .create_exec(&db, &[("name", Value::from("Ann")), ("age", Value::Int(30))])
            .await
            .unwrap();
        assert_eq!(created.pk(), Some(&Value::Int(1)));
        assert_eq!(created.db(), Some("default"));
        let err = a
            .objects()
            .create_exec(&db, &[("nickname", Value::from("x"))])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no field named 'nickname'"));
    }
}
