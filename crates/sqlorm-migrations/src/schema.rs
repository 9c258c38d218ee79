//! Quick schema utilities.
//!
//! These helpers work straight from the registered models, without
//! migration files: create missing tables, add missing columns, compare a
//! model with its table. They suit scripts and notebooks; projects that
//! need history and reversibility use the migration engine instead.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_db::model::ModelDefinition;
use sqlorm_db::router;
use sqlorm_db_backends::DatabaseBackend;

use crate::autodetect::{MigrationAutodetector, ModelState, ProjectState};
use crate::operations::Operation;
use crate::schema_editor::{editor_for, quote_name};

/// A column to add with [`add_column`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// The SQL type, e.g. `VARCHAR(50)`.
    pub column_type: String,
    /// A default as an SQL expression, e.g. `'pending'` or `0`.
    pub default: Option<String>,
    pub nullable: bool,
}

impl ColumnSpec {
    /// A nullable column without default.
    pub fn new(column_type: impl Into<String>) -> Self {
        Self {
            column_type: column_type.into(),
            default: None,
            nullable: true,
        }
    }

    #[must_use]
    pub fn default(mut self, sql: impl Into<String>) -> Self {
        self.default = Some(sql.into());
        self
    }

    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn sql(&self) -> String {
        let mut sql = self.column_type.clone();
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// How a model and its table differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    /// Model columns the table lacks.
    pub missing_in_db: Vec<String>,
    /// Table columns the model does not declare.
    pub extra_in_db: Vec<String>,
    pub table_exists: bool,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.table_exists && self.missing_in_db.is_empty() && self.extra_in_db.is_empty()
    }
}

async fn run_all(db: &dyn DatabaseBackend, statements: &[String]) -> SqlormResult<()> {
    for sql in statements {
        tracing::debug!(sql = %sql, "executing DDL");
        db.execute(sql, &[]).await?;
    }
    Ok(())
}

pub async fn table_exists(db: &dyn DatabaseBackend, table: &str) -> SqlormResult<bool> {
    Ok(db.table_names().await?.iter().any(|t| t == table))
}

/// Column names of `table`, in table order. Empty when the table is missing.
pub async fn get_table_columns(db: &dyn DatabaseBackend, table: &str) -> SqlormResult<Vec<String>> {
    Ok(db
        .table_description(table)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect())
}

pub async fn column_exists(db: &dyn DatabaseBackend, table: &str, column: &str) -> SqlormResult<bool> {
    Ok(get_table_columns(db, table).await?.iter().any(|c| c == column))
}

/// Creates the model's table and indexes. Returns the executed statements.
pub async fn create_table(db: &dyn DatabaseBackend, model: &ModelDefinition) -> SqlormResult<Vec<String>> {
    let statements = editor_for(db.backend_type()).create_table(&ModelState::from_definition(model));
    run_all(db, &statements).await?;
    tracing::debug!(table = model.table_name(), "created table");
    Ok(statements)
}

/// Models ordered so foreign key targets come first.
fn creation_order(models: &[Arc<ModelDefinition>]) -> Vec<Arc<ModelDefinition>> {
    let target = ProjectState::from_models(models.iter().map(AsRef::as_ref));
    MigrationAutodetector::new(&ProjectState::new(), &target)
        .changes()
        .iter()
        .filter_map(|op| match op {
            Operation::CreateModel { name, .. } => {
                models.iter().find(|m| m.name() == name).cloned()
            }
            _ => None,
        })
        .collect()
}

/// Creates the tables of `models` that `alias` lacks. Failures are logged
/// and skipped. Returns the names of the created tables.
pub async fn create_all_tables(
    db: &dyn DatabaseBackend,
    alias: &str,
    models: &[Arc<ModelDefinition>],
    verbosity: u8,
) -> SqlormResult<Vec<String>> {
    let existing: BTreeSet<String> = db.table_names().await?.into_iter().collect();
    let mut created = Vec::new();
    for model in creation_order(models) {
        if existing.contains(model.table_name()) || !router::allow_migrate(alias, &model) {
            continue;
        }
        match create_table(db, &model).await {
            Ok(_) => {
                if verbosity >= 1 {
                    tracing::info!(alias, "Created table: {}", model.table_name());
                }
                created.push(model.table_name().to_string());
            }
            Err(e) => {
                tracing::error!(alias, table = model.table_name(), error = %e, "failed to create table");
            }
        }
    }
    Ok(created)
}

/// Brings one model's table up to date: creates it when missing, otherwise
/// adds the columns it lacks. Existing columns are never changed or
/// dropped, so running it twice is harmless. Returns the executed DDL.
pub async fn migrate_model(db: &dyn DatabaseBackend, model: &ModelDefinition) -> SqlormResult<Vec<String>> {
    if !table_exists(db, model.table_name()).await? {
        return create_table(db, model).await;
    }
    let editor = editor_for(db.backend_type());
    let state = ModelState::from_definition(model);
    let existing: BTreeSet<String> = get_table_columns(db, model.table_name()).await?.into_iter().collect();
    let mut executed = Vec::new();
    for field in state.fields.iter().filter(|f| !existing.contains(&f.column)) {
        let statements = editor.add_column(&state, field);
        run_all(db, &statements).await?;
        tracing::info!(table = model.table_name(), column = %field.column, "added column");
        executed.extend(statements);
    }
    Ok(executed)
}

/// [`migrate_model`] for every model `alias` may hold.
pub async fn migrate_all(
    db: &dyn DatabaseBackend,
    alias: &str,
    models: &[Arc<ModelDefinition>],
) -> SqlormResult<Vec<String>> {
    let mut executed = Vec::new();
    for model in creation_order(models) {
        if router::allow_migrate(alias, &model) {
            executed.extend(migrate_model(db, &model).await?);
        }
    }
    Ok(executed)
}

/// Drops the model's table. Refuses unless `confirm` is set.
pub async fn drop_table(db: &dyn DatabaseBackend, model: &ModelDefinition, confirm: bool) -> SqlormResult<()> {
    if !confirm {
        return Err(SqlormError::ModelError(format!(
            "Dropping table '{}' deletes all its data. Pass confirm=True to proceed.",
            model.table_name()
        )));
    }
    let statements = editor_for(db.backend_type()).drop_table(&ModelState::from_definition(model));
    run_all(db, &statements).await?;
    tracing::warn!(table = model.table_name(), "dropped table");
    Ok(())
}

/// Adds a raw column to `table`.
pub async fn add_column(
    db: &dyn DatabaseBackend,
    table: &str,
    column: &str,
    spec: &ColumnSpec,
) -> SqlormResult<()> {
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_name(table),
        quote_name(column),
        spec.sql()
    );
    run_all(db, &[sql]).await
}

/// Like [`add_column`], but does nothing when the column exists. Returns
/// whether the column was added.
pub async fn safe_add_column(
    db: &dyn DatabaseBackend,
    table: &str,
    column: &str,
    spec: &ColumnSpec,
) -> SqlormResult<bool> {
    if column_exists(db, table, column).await? {
        return Ok(false);
    }
    add_column(db, table, column, spec).await?;
    Ok(true)
}

/// Renames a column in place, keeping its data.
pub async fn rename_column(db: &dyn DatabaseBackend, table: &str, old: &str, new: &str) -> SqlormResult<()> {
    if !column_exists(db, table, old).await? {
        return Err(SqlormError::OperationalError(format!(
            "Table '{table}' has no column named '{old}'"
        )));
    }
    let sql = format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote_name(table),
        quote_name(old),
        quote_name(new)
    );
    run_all(db, &[sql]).await
}

pub async fn get_schema_diff(db: &dyn DatabaseBackend, model: &ModelDefinition) -> SqlormResult<SchemaDiff> {
    let model_columns: Vec<&str> = model.fields().iter().map(|f| f.column.as_str()).collect();
    if !table_exists(db, model.table_name()).await? {
        return Ok(SchemaDiff {
            missing_in_db: model_columns.iter().map(ToString::to_string).collect(),
            extra_in_db: Vec::new(),
            table_exists: false,
        });
    }
    let table_columns = get_table_columns(db, model.table_name()).await?;
    Ok(SchemaDiff {
        missing_in_db: model_columns
            .iter()
            .filter(|c| !table_columns.iter().any(|t| t == *c))
            .map(ToString::to_string)
            .collect(),
        extra_in_db: table_columns
            .iter()
            .filter(|t| !model_columns.contains(&t.as_str()))
            .cloned()
            .collect(),
        table_exists: true,
    })
}

/// Adds the model columns the table lacks and returns their names. The
/// table must exist.
pub async fn sync_schema(db: &dyn DatabaseBackend, model: &ModelDefinition) -> SqlormResult<Vec<String>> {
    let diff = get_schema_diff(db, model).await?;
    if !diff.table_exists {
        return Err(SqlormError::OperationalError(format!(
            "Table '{}' does not exist",
            model.table_name()
        )));
    }
    let editor = editor_for(db.backend_type());
    let state = ModelState::from_definition(model);
    for column in &diff.missing_in_db {
        if let Some(field) = state.field_by_column(column) {
            run_all(db, &editor.add_column(&state, field)).await?;
        }
    }
    if !diff.missing_in_db.is_empty() {
        tracing::info!(table = model.table_name(), columns = ?diff.missing_in_db, "synced schema");
    }
    Ok(diff.missing_in_db)
}
