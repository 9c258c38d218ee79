//! Runtime model definitions.
//!
//! A model is described by a [`ModelBuilder`] holding named attributes, much
//! like the body of a Django model class. Building it produces an immutable
//! [`ModelDefinition`] that the query layer, the schema editor and the
//! migration autodetector all read from.
//!
//! # Examples
//!
//! ```
//! use sqlorm_db::fields;
//! use sqlorm_db::model::ModelBuilder;
//!
//! let user = ModelBuilder::new("User")
//!     .field("name", fields::char_field(100))
//!     .field("email", fields::email_field().unique())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(user.table_name(), "sqlorm_app_user");
//! assert_eq!(user.get_fields(), vec!["id", "name", "email"]);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlorm_core::apps::SQLORM_APP_LABEL;
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_core::settings::{DEFAULT_DB_ALIAS, GLOBAL_SETTINGS};

use crate::fields::{FieldDef, FieldType};
use crate::instance::Instance;
use crate::query::compiler::{OrderBy, Row};
use crate::query::queryset::Manager;
use crate::registry::registry;
use crate::value::Value;

/// A user-defined method copied onto a model.
pub type ModelMethod = Arc<dyn Fn(&Instance) -> Value + Send + Sync>;

/// Name of the method used by `Display` for instances.
pub const DISPLAY_METHOD: &str = "__str__";

/// One attribute of a model body.
#[derive(Clone)]
pub enum ModelAttribute {
    /// A column.
    Field(FieldDef),
    /// A callable copied through to instances.
    Method(ModelMethod),
    /// Any other value, kept as metadata.
    Meta(serde_json::Value),
}

impl fmt::Debug for ModelAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => f.debug_tuple("Field").field(field).finish(),
            Self::Method(_) => f.write_str("Method(..)"),
            Self::Meta(value) => f.debug_tuple("Meta").field(value).finish(),
        }
    }
}

impl From<FieldDef> for ModelAttribute {
    fn from(field: FieldDef) -> Self {
        Self::Field(field)
    }
}

impl From<serde_json::Value> for ModelAttribute {
    fn from(value: serde_json::Value) -> Self {
        Self::Meta(value)
    }
}

/// A database index declared in `Meta.indexes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Explicit index name. Generated from the table and fields when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            name: None,
            fields: fields.iter().map(ToString::to_string).collect(),
            unique: false,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The index name, `<table>_<fields>_idx` unless set explicitly.
    pub fn name_for(&self, table: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{table}_{}_idx", self.fields.join("_")))
    }
}

/// The options of a model's inner `Meta` class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub db_table: Option<String>,
    /// Default ordering, `-` prefix for descending.
    pub ordering: Vec<String>,
    /// Abstract models are never registered and only serve as bases.
    #[serde(rename = "abstract")]
    pub abstract_model: bool,
    pub verbose_name: Option<String>,
    pub verbose_name_plural: Option<String>,
    pub unique_together: Vec<Vec<String>>,
    pub indexes: Vec<Index>,
}

impl ModelOptions {
    /// Parses a `Meta` dictionary such as `{"ordering": ["-id"], "db_table": "people"}`.
    pub fn from_value(value: &serde_json::Value) -> SqlormResult<Self> {
        if !value.is_object() {
            return Err(SqlormError::ModelError(
                "Meta must be a dictionary".to_string(),
            ));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| SqlormError::ModelError(format!("Invalid Meta options: {e}")))
    }
}

/// The built, immutable description of a model.
pub struct ModelDefinition {
    name: String,
    app_label: String,
    fields: Vec<FieldDef>,
    pk_index: usize,
    options: ModelOptions,
    db_table: String,
    using: Option<String>,
    methods: BTreeMap<String, ModelMethod>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl fmt::Debug for ModelDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDefinition")
            .field("name", &self.name)
            .field("db_table", &self.db_table)
            .field("fields", &self.get_fields())
            .field("using", &self.using)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModelDefinition {
    /// Starts a builder for a model named `name`.
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Always `sqlorm_app`.
    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    /// The lower-cased model name, as used in migration files.
    pub fn model_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn table_name(&self) -> &str {
        &self.db_table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Field names in declaration order, the primary key included.
    pub fn get_fields(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Looks up a field by name; `pk` names the primary key.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        if name == "pk" {
            return Some(self.pk_field());
        }
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// Resolves a field name, `pk` or a column name such as `author_id`.
    pub fn resolve_field(&self, name: &str) -> Option<&FieldDef> {
        self.field(name).or_else(|| self.field_by_column(name))
    }

    pub fn pk_field(&self) -> &FieldDef {
        &self.fields[self.pk_index]
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// The default ordering from `Meta.ordering`.
    pub fn ordering(&self) -> &[String] {
        &self.options.ordering
    }

    /// The alias queries go to when nothing else is specified.
    pub fn database_alias(&self) -> &str {
        self.using.as_deref().unwrap_or(DEFAULT_DB_ALIAS)
    }

    /// The `_using` alias, if one was declared.
    pub fn using(&self) -> Option<&str> {
        self.using.as_deref()
    }

    pub fn is_abstract(&self) -> bool {
        self.options.abstract_model
    }

    pub fn verbose_name(&self) -> String {
        self.options
            .verbose_name
            .clone()
            .unwrap_or_else(|| camel_to_words(&self.name))
    }

    pub fn verbose_name_plural(&self) -> String {
        self.options
            .verbose_name_plural
            .clone()
            .unwrap_or_else(|| format!("{}s", self.verbose_name()))
    }

    pub fn method(&self, name: &str) -> Option<&ModelMethod> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    pub fn metadata(&self, name: &str) -> Option<&serde_json::Value> {
        self.metadata.get(name)
    }

    /// Forward relations declared on this model.
    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_relation())
    }

    /// A new unsaved instance with every field at its default.
    pub fn new_instance(self: &Arc<Self>) -> Instance {
        Instance::new(Arc::clone(self))
    }

    /// Builds a saved instance from a result row. Columns that are not
    /// fields become annotations.
    pub fn from_row(self: &Arc<Self>, row: &Row) -> Instance {
        let mut values = HashMap::new();
        let mut annotations = BTreeMap::new();
        for (column, value) in row.columns().iter().zip(row.values()) {
            match self.field_by_column(column).or_else(|| self.field(column)) {
                Some(field) => {
                    values.insert(field.name.clone(), field.from_db(value.clone()));
                }
                None => {
                    annotations.insert(column.clone(), value.clone());
                }
            }
        }
        Instance::from_db(Arc::clone(self), values, annotations)
    }

    /// The default manager, `Model.objects`.
    pub fn objects(self: &Arc<Self>) -> Manager {
        Manager::new(Arc::clone(self))
    }

    /// The ordering converted to columns, used when a queryset has none.
    pub(crate) fn default_order_by(&self) -> Vec<OrderBy> {
        self.options
            .ordering
            .iter()
            .filter_map(|entry| {
                let (descending, name) = entry
                    .strip_prefix('-')
                    .map_or((false, entry.as_str()), |rest| (true, rest));
                let field = self.resolve_field(name)?;
                Some(if descending {
                    OrderBy::desc(&field.column)
                } else {
                    OrderBy::asc(&field.column)
                })
            })
            .collect()
    }
}

fn camel_to_words(name: &str) -> String {
    let mut out = String::new();
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() && i > 0 {
            out.push(' ');
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// Collects attributes and options, then synthesizes a [`ModelDefinition`].
///
/// Attribute rules:
/// - a non-underscore [`ModelAttribute::Field`] becomes a column;
/// - `_db_table` overrides the table name and `_using` sets the default
///   database alias;
/// - every other underscore attribute, and every non-field value, is kept
///   as metadata and never becomes a column;
/// - methods are copied through under their own name.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    attrs: Vec<(String, ModelAttribute)>,
    options: ModelOptions,
    bases: Vec<Arc<ModelDefinition>>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            options: ModelOptions::default(),
            bases: Vec::new(),
        }
    }

    /// Adds a raw attribute, as it would appear in a class body.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, attr: impl Into<ModelAttribute>) -> Self {
        self.attrs.push((name.into(), attr.into()));
        self
    }

    #[must_use]
    pub fn field(self, name: impl Into<String>, field: FieldDef) -> Self {
        self.attr(name, ModelAttribute::Field(field))
    }

    #[must_use]
    pub fn method<F>(self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&Instance) -> Value + Send + Sync + 'static,
    {
        self.attr(name, ModelAttribute::Method(Arc::new(method)))
    }

    /// Sets the string representation, the equivalent of `__str__`.
    #[must_use]
    pub fn display<F>(self, method: F) -> Self
    where
        F: Fn(&Instance) -> String + Send + Sync + 'static,
    {
        self.method(DISPLAY_METHOD, move |instance| Value::String(method(instance)))
    }

    #[must_use]
    pub fn meta(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn db_table(self, table: impl Into<String>) -> Self {
        self.attr("_db_table", serde_json::Value::String(table.into()))
    }

    #[must_use]
    pub fn using(self, alias: impl Into<String>) -> Self {
        self.attr("_using", serde_json::Value::String(alias.into()))
    }

    /// Inherits the fields and methods of an abstract base model.
    #[must_use]
    pub fn extends(mut self, base: &Arc<ModelDefinition>) -> Self {
        self.bases.push(Arc::clone(base));
        self
    }

    /// Synthesizes the model without registering it.
    pub fn build(self) -> SqlormResult<Arc<ModelDefinition>> {
        if self.name.trim().is_empty() {
            return Err(SqlormError::ModelError(
                "Model definitions require a name".to_string(),
            ));
        }
        let name = self.name;
        let mut fields: Vec<FieldDef> = Vec::new();
        let mut methods = BTreeMap::new();
        let mut metadata = BTreeMap::new();
        let mut db_table = self.options.db_table.clone();
        let mut using = None;

        for base in &self.bases {
            if !base.is_abstract() {
                return Err(SqlormError::ModelError(format!(
                    "{name} can only extend abstract models, '{}' is concrete",
                    base.name()
                )));
            }
            for field in base.fields() {
                if !(field.is_auto() && field.name == "id") {
                    fields.push(field.clone());
                }
            }
            for (method_name, method) in &base.methods {
                methods.insert(method_name.clone(), Arc::clone(method));
            }
            if using.is_none() {
                using = base.using.clone();
            }
        }

        for (attr_name, attr) in self.attrs {
            match attr {
                ModelAttribute::Method(method) => {
                    methods.insert(attr_name, method);
                }
                ModelAttribute::Meta(value) if attr_name == "_db_table" => {
                    db_table = Some(meta_string(&name, &attr_name, &value)?);
                }
                ModelAttribute::Meta(value) if attr_name == "_using" => {
                    using = Some(meta_string(&name, &attr_name, &value)?);
                }
                ModelAttribute::Meta(value) => {
                    metadata.insert(attr_name, value);
                }
                ModelAttribute::Field(field) if attr_name.starts_with('_') => {
                    tracing::debug!(
                        model = %name,
                        attribute = %attr_name,
                        "underscore attribute kept as metadata"
                    );
                    metadata.insert(attr_name, serde_json::to_value(&field)?);
                }
                ModelAttribute::Field(field) => {
                    if let Some(existing) = fields.iter_mut().find(|f| f.name == attr_name) {
                        if existing.primary_key || !is_inherited(&self.bases, &attr_name) {
                            return Err(SqlormError::ModelError(format!(
                                "Duplicate field '{attr_name}' on model {name}"
                            )));
                        }
                        *existing = named_field(field, &attr_name);
                    } else {
                        fields.push(named_field(field, &attr_name));
                    }
                }
            }
        }

        let pk_count = fields.iter().filter(|f| f.primary_key).count();
        if pk_count > 1 {
            return Err(SqlormError::ModelError(format!(
                "Model {name} declares more than one primary key"
            )));
        }
        if pk_count == 0 {
            if fields.iter().any(|f| f.name == "id") {
                return Err(SqlormError::ModelError(format!(
                    "'id' can only be used as a field name if the field also sets \
                     'primary_key' (model {name})"
                )));
            }
            fields.insert(0, implicit_primary_key());
        }
        let pk_index = fields.iter().position(|f| f.primary_key).unwrap_or(0);

        let db_table =
            db_table.unwrap_or_else(|| format!("{SQLORM_APP_LABEL}_{}", name.to_lowercase()));

        for field in &mut fields {
            resolve_relation_target(field, &name, &db_table);
        }

        let model = ModelDefinition {
            name,
            app_label: SQLORM_APP_LABEL.to_string(),
            fields,
            pk_index,
            options: self.options,
            db_table,
            using,
            methods,
            metadata,
        };
        validate_options(&model)?;
        Ok(Arc::new(model))
    }

    /// Builds the model and stores it in the process-wide registry.
    /// Abstract models are returned but not registered.
    pub fn register(self) -> SqlormResult<Arc<ModelDefinition>> {
        let model = self.build()?;
        if model.is_abstract() {
            tracing::debug!(model = %model.name(), "abstract model not registered");
        } else {
            registry().register(Arc::clone(&model));
            tracing::debug!(
                model = %model.name(),
                table = %model.table_name(),
                "registered model"
            );
        }
        Ok(model)
    }
}

fn meta_string(model: &str, attr: &str, value: &serde_json::Value) -> SqlormResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SqlormError::ModelError(format!("{model}.{attr} must be a string")))
}

fn is_inherited(bases: &[Arc<ModelDefinition>], field: &str) -> bool {
    bases.iter().any(|b| b.field(field).is_some())
}

fn named_field(field: FieldDef, name: &str) -> FieldDef {
    if field.name.is_empty() || field.name == name {
        field.named(name)
    } else {
        let mut field = field;
        if field.column == field.name || field.column == format!("{}_id", field.name) {
            field.column = String::new();
        }
        field.named(name)
    }
}

fn implicit_primary_key() -> FieldDef {
    let auto = GLOBAL_SETTINGS
        .with(|s| s.default_auto_field.clone())
        .unwrap_or_else(|_| "BigAutoField".to_string());
    let field_type = match auto.rsplit('.').next().unwrap_or(&auto) {
        "AutoField" => FieldType::AutoField,
        _ => FieldType::BigAutoField,
    };
    FieldDef::new("id", field_type).primary_key()
}

fn resolve_relation_target(field: &mut FieldDef, model_name: &str, model_table: &str) {
    if let FieldType::ForeignKey { to, to_table, .. } | FieldType::OneToOneField { to, to_table, .. } =
        &mut field.field_type
    {
        if to_table.is_some() {
            return;
        }
        let table = if to == "self" || to == model_name {
            model_table.to_string()
        } else {
            registry().get(to).map_or_else(
                || format!("{SQLORM_APP_LABEL}_{}", to.to_lowercase()),
                |target| target.table_name().to_string(),
            )
        };
        *to_table = Some(table);
    }
}

fn validate_options(model: &ModelDefinition) -> SqlormResult<()> {
    let check = |name: &str, context: &str| -> SqlormResult<()> {
        if model.resolve_field(name).is_none() {
            return Err(SqlormError::ModelError(format!(
                "'{context}' refers to the nonexistent field '{name}' on model {}",
                model.name
            )));
        }
        Ok(())
    };
    for entry in &model.options.ordering {
        check(entry.trim_start_matches('-'), "ordering")?;
    }
    for group in &model.options.unique_together {
        for name in group {
            check(name, "unique_together")?;
        }
    }
    for index in &model.options.indexes {
        if index.fields.is_empty() {
            return Err(SqlormError::ModelError(format!(
                "Index on model {} requires at least one field",
                model.name
            )));
        }
        for name in &index.fields {
            check(name.trim_start_matches('-'), "indexes")?;
        }
    }
    Ok(())
}

/// Builds a model from a declarative description:
///
/// ```json
/// {"name": "Book", "fields": {"title": {"type": "CharField", "max_length": 200}},
///  "meta": {"ordering": ["title"]}, "_db_table": "books", "_using": "default"}
/// ```
///
/// `fields` may be an object (declaration order is not preserved by JSON
/// objects, so a list of `{"name": ..., ...}` entries is accepted as well).
pub fn builder_from_value(value: &serde_json::Value) -> SqlormResult<ModelBuilder> {
    let obj = value
        .as_object()
        .ok_or_else(|| SqlormError::ModelError("Model description must be a dictionary".into()))?;
    let name = obj
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| SqlormError::ModelError("Model description requires a 'name'".into()))?;
    let mut builder = ModelBuilder::new(name);

    match obj.get("fields") {
        Some(serde_json::Value::Object(fields)) => {
            for (field_name, spec) in fields {
                builder = builder.field(field_name.clone(), crate::fields::from_spec(spec)?);
            }
        }
        Some(serde_json::Value::Array(fields)) => {
            for spec in fields {
                let mut spec = spec.clone();
                let field_name = spec
                    .as_object_mut()
                    .and_then(|o| o.remove("name"))
                    .and_then(|n| n.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        SqlormError::ModelError(format!("Field of {name} requires a 'name'"))
                    })?;
                builder = builder.field(field_name, crate::fields::from_spec(&spec)?);
            }
        }
        Some(_) => {
            return Err(SqlormError::ModelError(format!(
                "'fields' of {name} must be a dictionary or a list"
            )));
        }
        None => {}
    }

    if let Some(meta) = obj.get("meta").or_else(|| obj.get("Meta")) {
        builder = builder.meta(ModelOptions::from_value(meta)?);
    }
    for (key, value) in obj {
        if key.starts_with('_') {
            builder = builder.attr(key.clone(), ModelAttribute::Meta(value.clone()));
        }
    }
    Ok(builder)
}
