//! Model instances.
//!
//! An [`Instance`] is one row of a model: field values keyed by field name,
//! plus any annotations the query that produced it selected. Persistence
//! (`save`, `delete`, `refresh`) runs against a [`DbExecutor`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sqlorm_core::error::{SqlormError, SqlormResult, ValidationError};

use crate::executor::DbExecutor;
use crate::fields::FieldType;
use crate::model::{ModelDefinition, DISPLAY_METHOD};
use crate::query::compiler::{Query, SqlCompiler, WhereNode};
use crate::query::expressions::Expression;
use crate::query::lookups::{Lookup, Q};
use crate::query::queryset::QuerySet;
use crate::registry::registry;
use crate::value::Value;

/// Related objects loaded by `prefetch_related`.
#[derive(Debug, Clone)]
pub enum Prefetched {
    /// The target of a forward foreign key.
    One(Option<Box<Instance>>),
    /// The rows pointing at this instance through a reverse relation.
    Many(Vec<Instance>),
}

/// One row of a model.
#[derive(Clone)]
pub struct Instance {
    model: Arc<ModelDefinition>,
    values: HashMap<String, Value>,
    annotations: BTreeMap<String, Value>,
    adding: bool,
    db: Option<String>,
    prefetched: HashMap<String, Prefetched>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: BTreeMap<&str, &Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        f.debug_struct("Instance")
            .field("model", &self.model.name())
            .field("values", &values)
            .field("annotations", &self.annotations)
            .field("adding", &self.adding)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// A new, unsaved instance with every field at its default.
    pub fn new(model: Arc<ModelDefinition>) -> Self {
        let values = model
            .fields()
            .iter()
            .map(|f| (f.name.clone(), f.get_default()))
            .collect();
        Self {
            model,
            values,
            annotations: BTreeMap::new(),
            adding: true,
            db: None,
            prefetched: HashMap::new(),
        }
    }

    pub(crate) fn from_db(
        model: Arc<ModelDefinition>,
        mut values: HashMap<String, Value>,
        annotations: BTreeMap<String, Value>,
    ) -> Self {
        for field in model.fields() {
            values.entry(field.name.clone()).or_insert(Value::Null);
        }
        Self {
            model,
            values,
            annotations,
            adding: false,
            db: None,
            prefetched: HashMap::new(),
        }
    }

    pub fn model(&self) -> &Arc<ModelDefinition> {
        &self.model
    }

    /// `true` until the instance has been saved or loaded.
    pub const fn is_adding(&self) -> bool {
        self.adding
    }

    /// The alias this instance was loaded from or saved to.
    pub fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    pub fn set_db(&mut self, alias: impl Into<String>) {
        self.db = Some(alias.into());
    }

    /// Reads a field (by name, `pk` or column) or an annotation.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.model.resolve_field(name) {
            Some(field) => self.values.get(&field.name),
            None => self.annotations.get(name),
        }
    }

    /// Writes a field. Unknown names are a `ModelError`.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> SqlormResult<()> {
        let field = self.model.resolve_field(name).ok_or_else(|| {
            SqlormError::ModelError(format!(
                "{} has no field named '{name}'",
                self.model.name()
            ))
        })?;
        let key = field.name.clone();
        self.prefetched.remove(&key);
        self.values.insert(key, value.into());
        Ok(())
    }

    /// Points a foreign key at `target`.
    pub fn set_related(&mut self, name: &str, target: &Self) -> SqlormResult<()> {
        let pk = target.pk().cloned().ok_or_else(|| {
            SqlormError::ModelError(format!(
                "save() prohibited to prevent data loss due to unsaved related object '{name}'"
            ))
        })?;
        self.set(name, pk)?;
        self.prefetched.insert(
            name.to_string(),
            Prefetched::One(Some(Box::new(target.clone()))),
        );
        Ok(())
    }

    /// The primary key, `None` while it is unset.
    pub fn pk(&self) -> Option<&Value> {
        self.values
            .get(&self.model.pk_field().name)
            .filter(|v| !v.is_null())
    }

    pub fn annotation(&self, name: &str) -> Option<&Value> {
        self.annotations.get(name)
    }

    pub fn annotations(&self) -> &BTreeMap<String, Value> {
        &self.annotations
    }

    /// Converts the instance to a dictionary of plain JSON values. Dates and
    /// times become ISO-8601 strings; foreign keys hold the related key.
    pub fn to_dict(
        &self,
        fields: Option<&[&str]>,
        exclude: &[&str],
    ) -> serde_json::Map<String, serde_json::Value> {
        self.model
            .fields()
            .iter()
            .filter(|f| fields.map_or(true, |only| only.contains(&f.name.as_str())))
            .filter(|f| !exclude.contains(&f.name.as_str()))
            .map(|f| {
                let value = self.values.get(&f.name).map_or(serde_json::Value::Null, Value::to_json);
                (f.name.clone(), value)
            })
            .collect()
    }

    /// Serializes [`to_dict`](Self::to_dict) as JSON, pretty-printed with
    /// `indent` spaces when given.
    pub fn to_json(&self, indent: Option<usize>) -> SqlormResult<String> {
        let dict = serde_json::Value::Object(self.to_dict(None, &[]));
        match indent {
            None => Ok(serde_json::to_string(&dict)?),
            Some(width) => {
                let indent = " ".repeat(width);
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
                let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
                dict.serialize(&mut serializer)?;
                String::from_utf8(buf)
                    .map_err(|e| SqlormError::SerializationError(e.to_string()))
            }
        }
    }

    /// Calls a method copied from the model definition.
    pub fn call(&self, method: &str) -> SqlormResult<Value> {
        let f = self.model.method(method).ok_or_else(|| {
            SqlormError::ModelError(format!(
                "'{}' object has no method '{method}'",
                self.model.name()
            ))
        })?;
        Ok(f(self))
    }

    /// Validates every field value, collecting errors per field.
    pub fn full_clean(&self) -> SqlormResult<()> {
        let mut errors: HashMap<String, Vec<ValidationError>> = HashMap::new();
        for field in self.model.fields() {
            if field.is_auto() {
                continue;
            }
            let value = self.values.get(&field.name).cloned().unwrap_or(Value::Null);
            if let Err(e) = field.validate(&value) {
                errors.entry(field.name.clone()).or_default().push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SqlormError::ValidationError(
                ValidationError::with_field_errors(errors),
            ))
        }
    }

    /// Column/value pairs for every concrete field, converted for storage.
    fn column_values(&self, include_pk: bool) -> Vec<(&str, Value)> {
        self.model
            .fields()
            .iter()
            .filter(|f| include_pk || !f.primary_key)
            .filter(|f| !(f.is_auto() && self.values.get(&f.name).map_or(true, Value::is_null)))
            .map(|f| {
                let value = self.values.get(&f.name).cloned().unwrap_or(Value::Null);
                (f.column.as_str(), f.to_db(value))
            })
            .collect()
    }

    /// Every stored column, the primary key included once it is set.
    pub(crate) fn all_column_values(&self) -> Vec<(&str, Value)> {
        self.column_values(true)
    }

    fn pk_where(&self, pk: Value) -> WhereNode {
        WhereNode::column(&self.model.pk_field().column, Lookup::Exact(pk))
    }

    pub(crate) fn touch_timestamps(&mut self) {
        let now = chrono::Utc::now().naive_utc();
        let adding = self.adding;
        for field in self.model.fields() {
            if !(field.auto_now || (field.auto_now_add && adding)) {
                continue;
            }
            let value = match field.field_type {
                FieldType::DateField => Value::Date(now.date()),
                FieldType::TimeField => Value::Time(now.time()),
                _ => Value::DateTime(now),
            };
            self.values.insert(field.name.clone(), value);
        }
    }

    /// Inserts the row when it is new (or its primary key matches nothing),
    /// updates it otherwise.
    pub async fn save(&mut self, db: &dyn DbExecutor) -> SqlormResult<()> {
        self.touch_timestamps();
        let compiler = SqlCompiler::new(db.backend_type());
        let table = self.model.table_name().to_string();

        if !self.adding {
            if let Some(pk) = self.pk().cloned() {
                let assignments: Vec<(String, Expression)> = self
                    .column_values(false)
                    .into_iter()
                    .map(|(column, value)| (column.to_string(), Expression::Value(value)))
                    .collect();
                if assignments.is_empty() {
                    return Ok(());
                }
                let (sql, params) =
                    compiler.compile_update(&table, &assignments, &self.pk_where(pk));
                if db.execute_sql(&sql, &params).await? > 0 {
                    tracing::debug!(model = %self.model.name(), "updated instance");
                    return Ok(());
                }
            }
        }

        let pk_field = self.model.pk_field().clone();
        let columns = self.column_values(true);
        if pk_field.is_auto() && self.pk().is_none() {
            let (sql, params) = compiler.compile_insert_returning(&table, &columns, &pk_field.column);
            let id = db.insert_returning_id(&sql, &params).await?;
            self.values.insert(pk_field.name.clone(), pk_field.from_db(id));
        } else {
            let (sql, params) = compiler.compile_insert(&table, &columns);
            db.execute_sql(&sql, &params).await?;
        }
        self.adding = false;
        tracing::debug!(model = %self.model.name(), pk = ?self.pk(), "inserted instance");
        Ok(())
    }

    /// Deletes the row and clears the primary key. Returns the rows removed.
    pub async fn delete(&mut self, db: &dyn DbExecutor) -> SqlormResult<u64> {
        let pk_name = self.model.pk_field().name.clone();
        let pk = self.pk().cloned().ok_or_else(|| {
            SqlormError::ModelError(format!(
                "{} object can't be deleted because its {pk_name} attribute is set to None.",
                self.model.name()
            ))
        })?;
        let (sql, params) = SqlCompiler::new(db.backend_type())
            .compile_delete(self.model.table_name(), &self.pk_where(pk));
        let deleted = db.execute_sql(&sql, &params).await?;
        self.values.insert(pk_name, Value::Null);
        self.adding = true;
        Ok(deleted)
    }

    /// Reloads every field from the database.
    pub async fn refresh(&mut self, db: &dyn DbExecutor) -> SqlormResult<()> {
        let pk = self.pk().cloned().ok_or_else(|| {
            SqlormError::ModelError(format!(
                "{} instance has no primary key to refresh from",
                self.model.name()
            ))
        })?;
        let mut query = Query::new(self.model.table_name());
        query.where_clause = Some(self.pk_where(pk));
        query.limit = Some(1);
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        let row = db.query(&sql, &params).await?.into_iter().next().ok_or_else(|| {
            SqlormError::DoesNotExist(format!(
                "{} matching query does not exist.",
                self.model.name()
            ))
        })?;
        let fresh = self.model.from_row(&row);
        self.values = fresh.values;
        self.prefetched.clear();
        Ok(())
    }

    /// Follows a forward foreign key, using prefetched data when present.
    pub async fn related(&self, name: &str, db: &dyn DbExecutor) -> SqlormResult<Option<Self>> {
        if let Some(Prefetched::One(cached)) = self.prefetched.get(name) {
            return Ok(cached.as_deref().cloned());
        }
        let field = self
            .model
            .field(name)
            .filter(|f| f.is_relation())
            .ok_or_else(|| {
                SqlormError::ModelError(format!(
                    "{} has no relation named '{name}'",
                    self.model.name()
                ))
            })?;
        let Some(key) = self.values.get(&field.name).filter(|v| !v.is_null()).cloned() else {
            return Ok(None);
        };
        let target = related_model(&self.model, field.field_type.related_model().unwrap_or_default())?;
        let qs = target.objects().filter(Q::filter("pk", Lookup::Exact(key)));
        qs.first_exec(db).await
    }

    /// The rows of another model pointing at this one, e.g. `book_set`.
    pub fn related_set(&self, name: &str) -> SqlormResult<QuerySet> {
        let model_name = name.strip_suffix("_set").unwrap_or(name);
        let child = registry().get_lowercase(model_name).ok_or_else(|| {
            SqlormError::ModelError(format!(
                "{} has no related set named '{name}'",
                self.model.name()
            ))
        })?;
        let fk = reverse_field(&child, &self.model).ok_or_else(|| {
            SqlormError::ModelError(format!(
                "{} has no foreign key to {}",
                child.name(),
                self.model.name()
            ))
        })?;
        let pk = self.pk().cloned().ok_or_else(|| {
            SqlormError::ModelError(format!(
                "'{}' instance needs a primary key before a relationship can be used.",
                self.model.name()
            ))
        })?;
        Ok(child.objects().filter(Q::filter(fk, Lookup::Exact(pk))))
    }

    pub fn prefetched(&self, name: &str) -> Option<&Prefetched> {
        self.prefetched.get(name)
    }

    /// The instances loaded for a reverse relation by `prefetch_related`.
    pub fn prefetched_set(&self, name: &str) -> Option<&[Self]> {
        match self.prefetched.get(name) {
            Some(Prefetched::Many(items)) => Some(items),
            _ => None,
        }
    }

    pub(crate) fn set_prefetched(&mut self, name: impl Into<String>, data: Prefetched) {
        self.prefetched.insert(name.into(), data);
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(method) = self.model.method(DISPLAY_METHOD) {
            return match method(self) {
                Value::String(s) => f.write_str(&s),
                other => write!(f, "{other}"),
            };
        }
        match self.pk() {
            Some(pk) => write!(f, "{} object ({pk})", self.model.name()),
            None => write!(f, "{} object (None)", self.model.name()),
        }
    }
}

/// Looks up the model a relation points at. `self` refers back to `model`.
pub(crate) fn related_model(
    model: &Arc<ModelDefinition>,
    target: &str,
) -> SqlormResult<Arc<ModelDefinition>> {
    if target == "self" || target == model.name() {
        return Ok(Arc::clone(model));
    }
    registry().get(target).ok_or_else(|| {
        SqlormError::ModelError(format!(
            "Related model '{target}' of {} is not registered",
            model.name()
        ))
    })
}

/// The name of the foreign key on `child` that points at `parent`.
pub(crate) fn reverse_field(child: &ModelDefinition, parent: &ModelDefinition) -> Option<String> {
    child
        .relation_fields()
        .find(|f| {
            f.field_type
                .related_model()
                .is_some_and(|to| to == parent.name() || (to == "self" && child.name() == parent.name()))
        })
        .map(|f| f.name.clone())
}
