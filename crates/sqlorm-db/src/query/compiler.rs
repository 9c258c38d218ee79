//! SQL query AST and compiler.
//!
//! [`Query`] is the AST of one SELECT statement; [`SqlCompiler`] turns it
//! (and INSERT/UPDATE/DELETE statements) into parameterized SQL. PostgreSQL
//! uses `$1, $2, ...` placeholders and SQLite uses `?`. Subqueries share the
//! parameter list of the statement that contains them, so numbered
//! placeholders stay consistent across nesting levels.

use sqlorm_core::error::{SqlormError, SqlormResult};

use super::expressions::Expression;
use super::lookups::{CompareOp, Lookup, Q};
use crate::value::Value;

/// The SQL dialect to compile for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackendType {
    /// PostgreSQL (`$1, $2, ...` placeholders).
    PostgreSQL,
    /// SQLite (`?` placeholders).
    SQLite,
}

impl DatabaseBackendType {
    /// The vendor name Django reports for this backend.
    pub const fn vendor(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgresql",
            Self::SQLite => "sqlite",
        }
    }
}

/// A column ordering direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// The column or annotation alias to order by.
    pub column: String,
    pub descending: bool,
    /// `Some(true)` for NULLS FIRST, `Some(false)` for NULLS LAST.
    pub nulls_first: Option<bool>,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
            nulls_first: None,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
            nulls_first: None,
        }
    }

    /// The same column in the opposite direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            column: self.column.clone(),
            descending: !self.descending,
            nulls_first: self.nulls_first.map(|first| !first),
        }
    }
}

/// A column to select in a query.
#[derive(Debug, Clone)]
pub enum SelectColumn {
    Column(String),
    /// A column with a table prefix.
    TableColumn(String, String),
    /// An expression with an alias.
    Expression(Expression, String),
    /// All columns (`*`).
    Star,
}

/// A WHERE/HAVING clause node.
#[derive(Debug, Clone)]
pub enum WhereNode {
    /// `<lhs> <lookup>`, where `lhs` is usually a column.
    Condition { lhs: Expression, lookup: Lookup },
    And(Vec<WhereNode>),
    Or(Vec<WhereNode>),
    Not(Box<WhereNode>),
    /// A boolean expression such as `EXISTS (...)`.
    Expr(Expression),
}

impl WhereNode {
    /// A condition on a plain column.
    pub fn column(name: impl Into<String>, lookup: Lookup) -> Self {
        Self::Condition {
            lhs: Expression::Col(name.into()),
            lookup,
        }
    }

    /// Converts a `Q` object without consulting a model: field names are
    /// taken as column names. Querysets resolve their filters instead.
    pub fn from_q(q: &Q) -> Self {
        match q {
            Q::Filter { field, lookup } => Self::column(field.clone(), lookup.clone()),
            Q::And(children) => Self::And(children.iter().map(Self::from_q).collect()),
            Q::Or(children) => Self::Or(children.iter().map(Self::from_q).collect()),
            Q::Not(inner) => Self::Not(Box::new(Self::from_q(inner))),
            Q::Expr(expr) => Self::Expr((**expr).clone()),
            Q::Resolved(node) => (**node).clone(),
            Q::Invalid(msg) => {
                tracing::warn!(error = %msg, "compiling an invalid filter as FALSE");
                Self::Or(Vec::new())
            }
        }
    }

    /// AND-combines optional nodes, dropping empty ones.
    pub fn and_all(nodes: Vec<Self>) -> Option<Self> {
        let mut nodes: Vec<Self> = nodes
            .into_iter()
            .filter(|n| !matches!(n, Self::And(c) if c.is_empty()))
            .collect();
        match nodes.len() {
            0 => None,
            1 => nodes.pop(),
            _ => Some(Self::And(nodes)),
        }
    }
}

/// The AST of one SELECT statement.
#[derive(Debug, Clone)]
pub struct Query {
    pub table: String,
    pub select: Vec<SelectColumn>,
    pub where_clause: Option<WhereNode>,
    pub order_by: Vec<OrderBy>,
    pub group_by: Vec<String>,
    pub having: Option<WhereNode>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
    /// Computed columns, selected after `select` in insertion order.
    pub annotations: Vec<(String, Expression)>,
    /// Selects from `(<source>) "subquery"` instead of `table`.
    pub source: Option<Box<Query>>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: vec![SelectColumn::Star],
            where_clause: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            having: None,
            limit: None,
            offset: None,
            distinct: false,
            annotations: Vec::new(),
            source: None,
        }
    }

    /// A query over the rows of `inner`, used to count or aggregate sliced,
    /// distinct or grouped querysets.
    pub fn wrapping(inner: Query) -> Self {
        let mut query = Self::new("subquery");
        query.source = Some(Box::new(inner));
        query
    }

    /// Whether the query aggregates rows (GROUP BY or an aggregate annotation).
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || self.annotations.iter().any(|(_, e)| e.contains_aggregate())
    }
}

/// A database row passed from a backend to the ORM.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// `(column, value)` pairs in select order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(&self.values)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> SqlormResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            SqlormError::DatabaseError(format!("Column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Gets a typed value by column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> SqlormResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            SqlormError::DatabaseError(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Conversion from a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> SqlormResult<Self>;
}

fn mismatch(expected: &str, value: &Value) -> SqlormError {
    SqlormError::DatabaseError(format!("Expected {expected}, got {value:?}"))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            _ => Err(mismatch("Int", value)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|e| {
            SqlormError::DatabaseError(format!("Int value out of i32 range: {e}"))
        })
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        let wide = i64::from_value(value)?;
        u64::try_from(wide)
            .map_err(|e| SqlormError::DatabaseError(format!("Negative count: {e}")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        value.as_f64().ok_or_else(|| mismatch("Float", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(mismatch("Bool", value)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::String(s) => uuid::Uuid::parse_str(s)
                .map_err(|e| SqlormError::DatabaseError(format!("Invalid UUID '{s}': {e}"))),
            _ => Err(mismatch("Uuid", value)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> SqlormResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

/// Escapes `%`, `_` and `\` for use inside a LIKE pattern.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn quote(name: &str) -> String {
    if name == "*" {
        "*".to_string()
    } else {
        format!("\"{name}\"")
    }
}

/// Translates the query AST into parameterized SQL.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    backend: DatabaseBackendType,
}

impl SqlCompiler {
    pub const fn new(backend: DatabaseBackendType) -> Self {
        Self { backend }
    }

    pub const fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    /// The placeholder for the given 1-based parameter index.
    pub fn placeholder(&self, index: usize) -> String {
        match self.backend {
            DatabaseBackendType::PostgreSQL => format!("${index}"),
            DatabaseBackendType::SQLite => "?".to_string(),
        }
    }

    fn push_param(&self, value: Value, params: &mut Vec<Value>) -> String {
        params.push(value);
        self.placeholder(params.len())
    }

    /// Compiles a SELECT query into SQL and parameters.
    pub fn compile_select(&self, query: &Query) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.select_sql(query, &mut params);
        (sql, params)
    }

    /// Compiles a standalone expression (useful for tests and raw helpers).
    pub fn compile_expression_sql(&self, expr: &Expression) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.compile_expression(expr, &mut params);
        (sql, params)
    }

    /// Compiles a standalone WHERE node.
    pub fn compile_where(&self, node: &WhereNode) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = String::new();
        self.compile_where_node(node, &mut sql, &mut params);
        (sql, params)
    }

    fn select_sql(&self, query: &Query, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");
        if query.distinct {
            sql.push_str("DISTINCT ");
        }

        let mut parts: Vec<String> = query
            .select
            .iter()
            .map(|col| match col {
                SelectColumn::Column(name) => quote(name),
                SelectColumn::TableColumn(table, name) => format!("\"{table}\".{}", quote(name)),
                SelectColumn::Expression(expr, alias) => {
                    let expr_sql = self.compile_expression(expr, params);
                    format!("{expr_sql} AS \"{alias}\"")
                }
                SelectColumn::Star => "*".to_string(),
            })
            .collect();
        for (alias, expr) in &query.annotations {
            let expr_sql = self.compile_expression(expr, params);
            parts.push(format!("{expr_sql} AS \"{alias}\""));
        }
        if parts.is_empty() {
            parts.push("*".to_string());
        }
        sql.push_str(&parts.join(", "));

        match query.source {
            Some(ref inner) => {
                let inner_sql = self.select_sql(inner, params);
                sql.push_str(&format!(" FROM ({inner_sql}) \"subquery\""));
            }
            None => sql.push_str(&format!(" FROM \"{}\"", query.table)),
        }

        if let Some(ref where_clause) = query.where_clause {
            sql.push_str(" WHERE ");
            self.compile_where_node(where_clause, &mut sql, params);
        }

        if !query.group_by.is_empty() {
            let cols: Vec<String> = query.group_by.iter().map(|c| quote(c)).collect();
            sql.push_str(&format!(" GROUP BY {}", cols.join(", ")));
        }

        if let Some(ref having) = query.having {
            sql.push_str(" HAVING ");
            self.compile_where_node(having, &mut sql, params);
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let dir = if o.descending { " DESC" } else { " ASC" };
                    let nulls = match o.nulls_first {
                        Some(true) => " NULLS FIRST",
                        Some(false) => " NULLS LAST",
                        None => "",
                    };
                    format!("{}{dir}{nulls}", quote(&o.column))
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        match (query.limit, query.offset) {
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {limit}")),
            // SQLite requires a LIMIT before OFFSET.
            (None, Some(_)) if self.backend == DatabaseBackendType::SQLite => {
                sql.push_str(" LIMIT -1");
            }
            _ => {}
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    /// Compiles an INSERT. An empty field list inserts a row of defaults.
    pub fn compile_insert(&self, table: &str, fields: &[(&str, Value)]) -> (String, Vec<Value>) {
        if fields.is_empty() {
            return (format!("INSERT INTO \"{table}\" DEFAULT VALUES"), Vec::new());
        }
        let mut params = Vec::new();
        let columns: Vec<String> = fields.iter().map(|(name, _)| quote(name)).collect();
        let placeholders: Vec<String> = fields
            .iter()
            .map(|(_, val)| self.push_param(val.clone(), &mut params))
            .collect();
        let sql = format!(
            "INSERT INTO \"{table}\" ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        (sql, params)
    }

    /// Compiles an INSERT that reports the generated key. PostgreSQL appends
    /// `RETURNING`; SQLite reads `last_insert_rowid()` afterwards.
    pub fn compile_insert_returning(
        &self,
        table: &str,
        fields: &[(&str, Value)],
        pk_column: &str,
    ) -> (String, Vec<Value>) {
        let (mut sql, params) = self.compile_insert(table, fields);
        if self.backend == DatabaseBackendType::PostgreSQL {
            sql.push_str(&format!(" RETURNING \"{pk_column}\""));
        }
        (sql, params)
    }

    /// Compiles an UPDATE. Assigned values may be expressions (`F("n") + 1`).
    pub fn compile_update<S: AsRef<str>>(
        &self,
        table: &str,
        fields: &[(S, Expression)],
        where_clause: &WhereNode,
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let set_parts: Vec<String> = fields
            .iter()
            .map(|(name, expr)| {
                let rhs = self.compile_expression(expr, &mut params);
                format!("{} = {rhs}", quote(name.as_ref()))
            })
            .collect();
        let mut sql = format!("UPDATE \"{table}\" SET {} WHERE ", set_parts.join(", "));
        self.compile_where_node(where_clause, &mut sql, &mut params);
        (sql, params)
    }

    pub fn compile_delete(&self, table: &str, where_clause: &WhereNode) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM \"{table}\" WHERE ");
        self.compile_where_node(where_clause, &mut sql, &mut params);
        (sql, params)
    }

    fn compile_where_node(&self, node: &WhereNode, sql: &mut String, params: &mut Vec<Value>) {
        match node {
            WhereNode::Condition { lhs, lookup } => {
                let lhs_sql = self.compile_expression(lhs, params);
                self.compile_lookup(&lhs_sql, lookup, sql, params);
            }
            WhereNode::And(children) => {
                if children.is_empty() {
                    sql.push_str("1=1");
                    return;
                }
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" AND ");
                    }
                    self.compile_where_node(child, sql, params);
                }
                sql.push(')');
            }
            WhereNode::Or(children) => {
                if children.is_empty() {
                    sql.push_str("1=0");
                    return;
                }
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" OR ");
                    }
                    self.compile_where_node(child, sql, params);
                }
                sql.push(')');
            }
            WhereNode::Not(inner) => {
                sql.push_str("NOT (");
                self.compile_where_node(inner, sql, params);
                sql.push(')');
            }
            WhereNode::Expr(expr) => {
                let expr_sql = self.compile_expression(expr, params);
                sql.push_str(&expr_sql);
            }
        }
    }

    fn like(&self, column: &str, pattern: String, insensitive: bool, params: &mut Vec<Value>) -> String {
        let ph = self.push_param(Value::String(pattern), params);
        match (insensitive, self.backend) {
            (false, _) => format!("{column} LIKE {ph} ESCAPE '\\'"),
            (true, DatabaseBackendType::PostgreSQL) => format!("{column} ILIKE {ph} ESCAPE '\\'"),
            (true, DatabaseBackendType::SQLite) => {
                format!("LOWER({column}) LIKE LOWER({ph}) ESCAPE '\\'")
            }
        }
    }

    fn compile_lookup(&self, column: &str, lookup: &Lookup, sql: &mut String, params: &mut Vec<Value>) {
        let fragment = match lookup {
            Lookup::Exact(val) if val.is_null() => format!("{column} IS NULL"),
            Lookup::Exact(val) => {
                let ph = self.push_param(val.clone(), params);
                format!("{column} = {ph}")
            }
            Lookup::IExact(val) if val.is_null() => format!("{column} IS NULL"),
            Lookup::IExact(val) => {
                let ph = self.push_param(val.clone(), params);
                format!("LOWER({column}) = LOWER({ph})")
            }
            Lookup::Contains(val) => self.like(column, format!("%{}%", escape_like(val)), false, params),
            Lookup::IContains(val) => self.like(column, format!("%{}%", escape_like(val)), true, params),
            Lookup::StartsWith(val) => self.like(column, format!("{}%", escape_like(val)), false, params),
            Lookup::IStartsWith(val) => self.like(column, format!("{}%", escape_like(val)), true, params),
            Lookup::EndsWith(val) => self.like(column, format!("%{}", escape_like(val)), false, params),
            Lookup::IEndsWith(val) => self.like(column, format!("%{}", escape_like(val)), true, params),
            Lookup::In(vals) if vals.is_empty() => "1=0".to_string(),
            Lookup::In(vals) => {
                let placeholders: Vec<String> = vals
                    .iter()
                    .map(|v| self.push_param(v.clone(), params))
                    .collect();
                format!("{column} IN ({})", placeholders.join(", "))
            }
            Lookup::Gt(val) => format!("{column} > {}", self.push_param(val.clone(), params)),
            Lookup::Gte(val) => format!("{column} >= {}", self.push_param(val.clone(), params)),
            Lookup::Lt(val) => format!("{column} < {}", self.push_param(val.clone(), params)),
            Lookup::Lte(val) => format!("{column} <= {}", self.push_param(val.clone(), params)),
            Lookup::Range(low, high) => {
                let ph_low = self.push_param(low.clone(), params);
                let ph_high = self.push_param(high.clone(), params);
                format!("{column} BETWEEN {ph_low} AND {ph_high}")
            }
            Lookup::IsNull(true) => format!("{column} IS NULL"),
            Lookup::IsNull(false) => format!("{column} IS NOT NULL"),
            Lookup::Regex(pattern) => {
                let ph = self.push_param(Value::String(pattern.clone()), params);
                match self.backend {
                    DatabaseBackendType::PostgreSQL => format!("{column} ~ {ph}"),
                    DatabaseBackendType::SQLite => format!("{column} REGEXP {ph}"),
                }
            }
            Lookup::IRegex(pattern) => match self.backend {
                DatabaseBackendType::PostgreSQL => {
                    let ph = self.push_param(Value::String(pattern.clone()), params);
                    format!("{column} ~* {ph}")
                }
                DatabaseBackendType::SQLite => {
                    let ph = self.push_param(Value::String(format!("(?i){pattern}")), params);
                    format!("{column} REGEXP {ph}")
                }
            },
            Lookup::Compare(CompareOp::Eq, expr) if matches!(**expr, Expression::Value(Value::Null)) => {
                format!("{column} IS NULL")
            }
            Lookup::Compare(op, expr) => {
                let rhs = self.compile_expression(expr, params);
                format!("{column} {} {rhs}", op.sql())
            }
            Lookup::InSubquery(query) => {
                let sub = self.select_sql(query, params);
                format!("{column} IN ({sub})")
            }
            Lookup::InQuerySet(qs) => match qs.build_in_query(None) {
                Ok(query) => {
                    let sub = self.select_sql(&query, params);
                    format!("{column} IN ({sub})")
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not build IN subquery; matching nothing");
                    "1=0".to_string()
                }
            },
        };
        sql.push_str(&fragment);
    }

    fn compile_expression(&self, expr: &Expression, params: &mut Vec<Value>) -> String {
        match expr {
            Expression::Col(name) | Expression::F(name) => quote(name),
            Expression::OuterCol { table, column } => format!("\"{table}\".{}", quote(column)),
            Expression::OuterRef(name) => {
                tracing::warn!(field = %name, "OuterRef used outside a subquery");
                quote(name)
            }
            Expression::Value(val) => self.push_param(val.clone(), params),
            Expression::Func { name, args } if name == "NOW" && args.is_empty() => {
                match self.backend {
                    DatabaseBackendType::PostgreSQL => "NOW()".to_string(),
                    DatabaseBackendType::SQLite => "CURRENT_TIMESTAMP".to_string(),
                }
            }
            Expression::Func { name, args } if name == "NOT" && args.len() == 1 => {
                format!("NOT ({})", self.compile_expression(&args[0], params))
            }
            Expression::Func { name, args } => {
                let arg_parts: Vec<String> = args
                    .iter()
                    .map(|a| self.compile_expression(a, params))
                    .collect();
                format!("{name}({})", arg_parts.join(", "))
            }
            Expression::Aggregate {
                func,
                field,
                distinct,
                filter,
            } => {
                let field_sql = self.compile_expression(field, params);
                let distinct_str = if *distinct { "DISTINCT " } else { "" };
                let mut sql = format!("{}({distinct_str}{field_sql})", func.sql_name());
                if let Some(filter) = filter {
                    sql.push_str(" FILTER (WHERE ");
                    self.compile_where_node(&WhereNode::from_q(filter), &mut sql, params);
                    sql.push(')');
                }
                sql
            }
            Expression::Case { whens, default } => {
                let mut sql = "CASE".to_string();
                for when in whens {
                    sql.push_str(" WHEN ");
                    self.compile_where_node(&WhereNode::from_q(&when.condition), &mut sql, params);
                    sql.push_str(" THEN ");
                    sql.push_str(&self.compile_expression(&when.then, params));
                }
                if let Some(default) = default {
                    sql.push_str(" ELSE ");
                    sql.push_str(&self.compile_expression(default, params));
                }
                sql.push_str(" END");
                sql
            }
            Expression::Query(query) => format!("({})", self.select_sql(query, params)),
            Expression::Subquery(qs) => match qs.build_query() {
                Ok(query) => format!("({})", self.select_sql(&query, params)),
                Err(e) => {
                    tracing::warn!(error = %e, "could not build subquery; using NULL");
                    "NULL".to_string()
                }
            },
            Expression::ExistsQuery { query, negated } => {
                let not = if *negated { "NOT " } else { "" };
                format!("{not}EXISTS ({})", self.select_sql(query, params))
            }
            Expression::Exists { queryset, negated } => match queryset.build_query() {
                Ok(query) => {
                    let not = if *negated { "NOT " } else { "" };
                    format!("{not}EXISTS ({})", self.select_sql(&query, params))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not build EXISTS subquery");
                    let fallback = if *negated { "1=1" } else { "1=0" };
                    fallback.to_string()
                }
            },
            Expression::Cast { expr, data_type } => {
                format!("CAST({} AS {data_type})", self.compile_expression(expr, params))
            }
            Expression::RawSQL(raw, raw_params) => {
                if self.backend == DatabaseBackendType::PostgreSQL {
                    // Renumber `?` markers after the current parameters.
                    let mut out = String::with_capacity(raw.len());
                    let mut rest = raw.as_str();
                    let mut values = raw_params.iter();
                    while let Some(idx) = rest.find('?') {
                        out.push_str(&rest[..idx]);
                        let value = values.next().cloned().unwrap_or(Value::Null);
                        out.push_str(&self.push_param(value, params));
                        rest = &rest[idx + 1..];
                    }
                    out.push_str(rest);
                    params.extend(values.cloned());
                    out
                } else {
                    params.extend(raw_params.iter().cloned());
                    raw.clone()
                }
            }
            Expression::Add(left, right) => self.binary(left, "+", right, params),
            Expression::Sub(left, right) => self.binary(left, "-", right, params),
            Expression::Mul(left, right) => self.binary(left, "*", right, params),
            Expression::Div(left, right) => self.binary(left, "/", right, params),
        }
    }

    fn binary(&self, left: &Expression, op: &str, right: &Expression, params: &mut Vec<Value>) -> String {
        let l = self.compile_expression(left, params);
        let r = self.compile_expression(right, params);
        format!("({l} {op} {r})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expressions::{AggregateFunc, When};

    fn pg() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::PostgreSQL)
    }

    fn sqlite() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::SQLite)
    }

    fn name_is(value: &str) -> WhereNode {
        WhereNode::column("name", Lookup::Exact(Value::from(value)))
    }

    // ── Row ──────────────────────────────────────────────────────────

    #[test]
    fn test_row_typed_access() {
        let row = Row::new(
            vec!["name".into(), "id".into(), "active".into(), "bio".into()],
            vec![Value::from("Alice"), Value::Int(42), Value::Int(1), Value::Null],
        );
        assert_eq!(row.get::<String>("name").unwrap(), "Alice");
        assert_eq!(row.get::<i64>("id").unwrap(), 42);
        assert!(row.get::<bool>("active").unwrap());
        assert_eq!(row.get::<Option<String>>("bio").unwrap(), None);
        assert!(row.get::<String>("missing").is_err());
        assert_eq!(row.get_by_index::<i32>(1).unwrap(), 42);
        assert!(row.get_by_index::<i64>(9).is_err());
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(vec!["a".into(), "b".into()], vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.values(), &[Value::Int(1), Value::Int(2)]);
        assert_eq!(row.get_value("b"), Some(&Value::Int(2)));
        let pairs: Vec<(&str, &Value)> = row.iter().collect();
        assert_eq!(pairs[0], ("a", &Value::Int(1)));
        assert!(Row::new(vec![], vec![]).is_empty());
    }

    // ── SELECT ───────────────────────────────────────────────────────

    #[test]
    fn test_simple_select() {
        let (sql, params) = pg().compile_select(&Query::new("users"));
        assert_eq!(sql, "SELECT * FROM \"users\"");
        assert!(params.is_empty());
    }

    #[test]
    fn test_select_with_where_per_backend() {
        let mut query = Query::new("users");
        query.where_clause = Some(name_is("Alice"));
        assert_eq!(
            pg().compile_select(&query).0,
            "SELECT * FROM \"users\" WHERE \"name\" = $1"
        );
        let (sql, params) = sqlite().compile_select(&query);
        assert_eq!(sql, "SELECT * FROM \"users\" WHERE \"name\" = ?");
        assert_eq!(params, vec![Value::from("Alice")]);
    }

    #[test]
    fn test_select_and_or_not() {
        let mut query = Query::new("users");
        query.where_clause = Some(WhereNode::Or(vec![
            WhereNode::And(vec![name_is("A"), WhereNode::column("age", Lookup::Gt(Value::from(3)))]),
            WhereNode::Not(Box::new(name_is("B"))),
        ]));
        let (sql, params) = pg().compile_select(&query);
        assert_eq!(
            sql,
            "SELECT * FROM \"users\" WHERE ((\"name\" = $1 AND \"age\" > $2) OR NOT (\"name\" = $3))"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_select_order_limit_offset_distinct() {
        let mut query = Query::new("users");
        query.distinct = true;
        query.order_by = vec![OrderBy::desc("age"), OrderBy::asc("name")];
        query.limit = Some(10);
        query.offset = Some(20);
        let (sql, _) = pg().compile_select(&query);
        assert_eq!(
            sql,
            "SELECT DISTINCT * FROM \"users\" ORDER BY \"age\" DESC, \"name\" ASC LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_sqlite_offset_without_limit() {
        let mut query = Query::new("users");
        query.offset = Some(5);
        assert_eq!(
            sqlite().compile_select(&query).0,
            "SELECT * FROM \"users\" LIMIT -1 OFFSET 5"
        );
        assert_eq!(pg().compile_select(&query).0, "SELECT * FROM \"users\" OFFSET 5");
    }

    #[test]
    fn test_group_by_having() {
        let count = Expression::aggregate(AggregateFunc::Count, Expression::col("id"));
        let mut query = Query::new("books");
        query.select = vec![SelectColumn::Column("author_id".into())];
        query.annotations.push(("n".into(), count.clone()));
        query.group_by = vec!["author_id".into()];
        query.having = Some(WhereNode::Condition {
            lhs: count,
            lookup: Lookup::Gt(Value::from(1)),
        });
        let (sql, params) = pg().compile_select(&query);
        assert_eq!(
            sql,
            "SELECT \"author_id\", COUNT(\"id\") AS \"n\" FROM \"books\" GROUP BY \"author_id\" HAVING COUNT(\"id\") > $1"
        );
        assert_eq!(params, vec![Value::Int(1)]);
        assert!(query.is_grouped());
    }

    #[test]
    fn test_annotation_with_star() {
        let mut query = Query::new("products");
        query.annotations.push((
            "total".into(),
            Expression::col("price") * Expression::col("quantity"),
        ));
        let (sql, _) = pg().compile_select(&query);
        assert_eq!(
            sql,
            "SELECT *, (\"price\" * \"quantity\") AS \"total\" FROM \"products\""
        );
    }

    // ── Lookups ──────────────────────────────────────────────────────

    fn where_sql(compiler: SqlCompiler, lookup: Lookup) -> (String, Vec<Value>) {
        compiler.compile_where(&WhereNode::column("c", lookup))
    }

    #[test]
    fn test_null_lookups() {
        assert_eq!(where_sql(pg(), Lookup::Exact(Value::Null)).0, "\"c\" IS NULL");
        assert_eq!(where_sql(pg(), Lookup::IsNull(true)).0, "\"c\" IS NULL");
        assert_eq!(where_sql(pg(), Lookup::IsNull(false)).0, "\"c\" IS NOT NULL");
    }

    #[test]
    fn test_like_lookups_escape_wildcards() {
        let (sql, params) = where_sql(sqlite(), Lookup::Contains("50%_off".into()));
        assert_eq!(sql, "\"c\" LIKE ? ESCAPE '\\'");
        assert_eq!(params, vec![Value::from("%50\\%\\_off%")]);

        let (sql, _) = where_sql(pg(), Lookup::IContains("x".into()));
        assert_eq!(sql, "\"c\" ILIKE $1 ESCAPE '\\'");
        let (sql, _) = where_sql(sqlite(), Lookup::IStartsWith("al".into()));
        assert_eq!(sql, "LOWER(\"c\") LIKE LOWER(?) ESCAPE '\\'");
        let (_, params) = where_sql(sqlite(), Lookup::EndsWith("son".into()));
        assert_eq!(params, vec![Value::from("%son")]);
    }

    #[test]
    fn test_in_and_range() {
        let (sql, params) = where_sql(pg(), Lookup::In(vec![Value::from(1), Value::from(2)]));
        assert_eq!(sql, "\"c\" IN ($1, $2)");
        assert_eq!(params.len(), 2);
        assert_eq!(where_sql(pg(), Lookup::In(vec![])).0, "1=0");
        assert_eq!(
            where_sql(pg(), Lookup::Range(Value::from(1), Value::from(5))).0,
            "\"c\" BETWEEN $1 AND $2"
        );
    }

    #[test]
    fn test_regex_per_backend() {
        assert_eq!(where_sql(pg(), Lookup::Regex("^a".into())).0, "\"c\" ~ $1");
        assert_eq!(where_sql(pg(), Lookup::IRegex("^a".into())).0, "\"c\" ~* $1");
        let (sql, params) = where_sql(sqlite(), Lookup::IRegex("^a".into()));
        assert_eq!(sql, "\"c\" REGEXP ?");
        assert_eq!(params, vec![Value::from("(?i)^a")]);
    }

    #[test]
    fn test_compare_expression() {
        let (sql, params) = where_sql(
            pg(),
            Lookup::Compare(CompareOp::Lt, Box::new(Expression::col("reserved"))),
        );
        assert_eq!(sql, "\"c\" < \"reserved\"");
        assert!(params.is_empty());
    }

    #[test]
    fn test_subquery_params_share_numbering() {
        let mut inner = Query::new("books");
        inner.select = vec![SelectColumn::Column("author_id".into())];
        inner.where_clause = Some(WhereNode::column("title", Lookup::Exact(Value::from("B"))));
        let mut outer = Query::new("authors");
        outer.where_clause = Some(WhereNode::And(vec![
            name_is("A"),
            WhereNode::column("id", Lookup::InSubquery(Box::new(inner))),
        ]));
        let (sql, params) = pg().compile_select(&outer);
        assert_eq!(
            sql,
            "SELECT * FROM \"authors\" WHERE (\"name\" = $1 AND \"id\" IN (SELECT \"author_id\" FROM \"books\" WHERE \"title\" = $2))"
        );
        assert_eq!(params, vec![Value::from("A"), Value::from("B")]);
    }

    #[test]
    fn test_exists_and_outer_column() {
        let mut inner = Query::new("books");
        inner.where_clause = Some(WhereNode::Condition {
            lhs: Expression::col("author_id"),
            lookup: Lookup::Compare(
                CompareOp::Eq,
                Box::new(Expression::OuterCol {
                    table: "authors".into(),
                    column: "id".into(),
                }),
            ),
        });
        let mut outer = Query::new("authors");
        outer.where_clause = Some(WhereNode::Expr(Expression::ExistsQuery {
            query: Box::new(inner),
            negated: true,
        }));
        assert_eq!(
            sqlite().compile_select(&outer).0,
            "SELECT * FROM \"authors\" WHERE NOT EXISTS (SELECT * FROM \"books\" WHERE \"author_id\" = \"authors\".\"id\")"
        );
    }

    // ── INSERT / UPDATE / DELETE ─────────────────────────────────────

    #[test]
    fn test_insert() {
        let fields: Vec<(&str, Value)> = vec![("name", Value::from("Alice")), ("age", Value::from(30))];
        let (sql, params) = pg().compile_insert("users", &fields);
        assert_eq!(sql, "INSERT INTO \"users\" (\"name\", \"age\") VALUES ($1, $2)");
        assert_eq!(params.len(), 2);
        assert_eq!(
            sqlite().compile_insert("users", &[]).0,
            "INSERT INTO \"users\" DEFAULT VALUES"
        );
    }

    #[test]
    fn test_insert_returning() {
        let fields: Vec<(&str, Value)> = vec![("name", Value::from("Alice"))];
        assert_eq!(
            pg().compile_insert_returning("users", &fields, "id").0,
            "INSERT INTO \"users\" (\"name\") VALUES ($1) RETURNING \"id\""
        );
        assert_eq!(
            sqlite().compile_insert_returning("users", &fields, "id").0,
            "INSERT INTO \"users\" (\"name\") VALUES (?)"
        );
    }

    #[test]
    fn test_update_with_expression() {
        let fields = vec![
            ("name", Expression::value("Updated")),
            ("views", Expression::col("views") + Expression::value(1)),
        ];
        let (sql, params) = pg().compile_update(
            "posts",
            &fields,
            &WhereNode::column("id", Lookup::Exact(Value::from(7))),
        );
        assert_eq!(
            sql,
            "UPDATE \"posts\" SET \"name\" = $1, \"views\" = (\"views\" + $2) WHERE \"id\" = $3"
        );
        assert_eq!(params, vec![Value::from("Updated"), Value::Int(1), Value::Int(7)]);
    }

    #[test]
    fn test_delete() {
        let (sql, params) = sqlite().compile_delete(
            "users",
            &WhereNode::column("id", Lookup::Exact(Value::from(1))),
        );
        assert_eq!(sql, "DELETE FROM \"users\" WHERE \"id\" = ?");
        assert_eq!(params, vec![Value::Int(1)]);
        assert_eq!(
            sqlite().compile_delete("users", &WhereNode::And(vec![])).0,
            "DELETE FROM \"users\" WHERE 1=1"
        );
    }

    // ── Expressions ──────────────────────────────────────────────────

    #[test]
    fn test_aggregate_distinct_and_filter() {
        let expr = Expression::aggregate_distinct(AggregateFunc::Count, Expression::col("tag"))
            .filtered(Q::Resolved(Box::new(WhereNode::column(
                "published",
                Lookup::Exact(Value::from(true)),
            ))));
        let (sql, params) = pg().compile_expression_sql(&expr);
        assert_eq!(sql, "COUNT(DISTINCT \"tag\") FILTER (WHERE \"published\" = $1)");
        assert_eq!(params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_case_expression() {
        let expr = Expression::case(
            vec![When::new(
                Q::filter("status", Lookup::Exact(Value::from("active"))),
                Expression::value(1),
            )],
            Some(Expression::value(0)),
        );
        let (sql, params) = pg().compile_expression_sql(&expr);
        assert_eq!(sql, "CASE WHEN \"status\" = $1 THEN $2 ELSE $3 END");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_raw_sql_renumbered_for_postgres() {
        let expr = Expression::value(1) + Expression::raw("LENGTH(?)", vec![Value::from("abc")]);
        let (sql, params) = pg().compile_expression_sql(&expr);
        assert_eq!(sql, "($1 + LENGTH($2))");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_count_star() {
        let expr = Expression::aggregate(AggregateFunc::Count, Expression::f("*"));
        assert_eq!(sqlite().compile_expression_sql(&expr).0, "COUNT(*)");
    }

    #[test]
    fn test_where_node_from_q() {
        let node = WhereNode::from_q(&(Q::kw("a", 1) & !Q::kw("b", 2)));
        let (sql, _) = sqlite().compile_where(&node);
        assert_eq!(sql, "(\"a\" = ? AND NOT (\"b\" = ?))");
        assert_eq!(sqlite().compile_where(&WhereNode::from_q(&Q::kw("x__in", 5))).0, "1=0");
    }

    #[test]
    fn test_and_all() {
        assert!(WhereNode::and_all(vec![]).is_none());
        assert!(matches!(
            WhereNode::and_all(vec![name_is("a"), WhereNode::And(vec![])]),
            Some(WhereNode::Condition { .. })
        ));
        assert!(matches!(
            WhereNode::and_all(vec![name_is("a"), name_is("b")]),
            Some(WhereNode::And(ref c)) if c.len() == 2
        ));
    }

    #[test]
    fn test_order_by_reversed() {
        let o = OrderBy::asc("name").reversed();
        assert!(o.descending);
        assert_eq!(o.column, "name");
    }

    #[test]
    fn test_wrapping_query_shares_params() {
        let mut inner = Query::new("book");
        inner.where_clause = Some(name_is("x"));
        inner.limit = Some(5);
        let mut outer = Query::wrapping(inner);
        outer.select = vec![SelectColumn::Expression(
            Expression::aggregate(AggregateFunc::Count, Expression::col("*")),
            "__count".into(),
        )];
        let (sql, params) = pg().compile_select(&outer);
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS \"__count\" FROM (SELECT * FROM \"book\" WHERE \"name\" = $1 LIMIT 5) \"subquery\""
        );
        assert_eq!(params, vec![Value::from("x")]);
    }
}
