//! Schema helpers that resolve the database from the model or an alias.
//!
//! Each function forwards to [`sqlorm_migrations::schema`] with the
//! connection of the model's alias (`_using`, or `"default"`), or of the
//! alias passed in.

use std::sync::Arc;

use sqlorm_core::error::SqlormResult;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_db::model::ModelDefinition;
use sqlorm_db::registry::registry;
use sqlorm_migrations::schema as engine;
use sqlorm_migrations::{ColumnSpec, SchemaDiff};

use crate::conf;
use crate::connection::get_connection;

fn alias_or_default(alias: Option<&str>) -> &str {
    alias.unwrap_or(DEFAULT_DB_ALIAS)
}

/// Creates the model's table. Returns the executed statements.
pub async fn create_table(model: &ModelDefinition) -> SqlormResult<Vec<String>> {
    let db = get_connection(model.database_alias()).await?;
    engine::create_table(&*db, model).await
}

/// Creates the missing tables of every registered model on every
/// configured alias the model may live on. Returns the created tables.
pub async fn create_all_tables(verbosity: u8) -> SqlormResult<Vec<String>> {
    let models = registry().get_all();
    let mut created = Vec::new();
    for alias in conf::get_database_aliases()? {
        let db = get_connection(&alias).await?;
        created.extend(engine::create_all_tables(&*db, &alias, &models, verbosity).await?);
    }
    Ok(created)
}

/// Creates or extends the tables of every registered model. Returns the
/// executed statements.
pub async fn migrate_all() -> SqlormResult<Vec<String>> {
    let models: Vec<Arc<ModelDefinition>> = registry().get_all();
    let mut executed = Vec::new();
    for alias in conf::get_database_aliases()? {
        let db = get_connection(&alias).await?;
        executed.extend(engine::migrate_all(&*db, &alias, &models).await?);
    }
    Ok(executed)
}

/// Creates the model's table, or adds the columns it lacks. Safe to run
/// repeatedly.
pub async fn migrate(model: &ModelDefinition) -> SqlormResult<Vec<String>> {
    let db = get_connection(model.database_alias()).await?;
    engine::migrate_model(&*db, model).await
}

pub async fn table_exists(model: &ModelDefinition, using: Option<&str>) -> SqlormResult<bool> {
    let db = get_connection(using.unwrap_or_else(|| model.database_alias())).await?;
    engine::table_exists(&*db, model.table_name()).await
}

/// Drops the model's table. `confirm` must be `true`.
pub async fn drop_table(model: &ModelDefinition, confirm: bool) -> SqlormResult<()> {
    let db = get_connection(model.database_alias()).await?;
    engine::drop_table(&*db, model, confirm).await
}

pub async fn get_table_columns(table: &str, alias: Option<&str>) -> SqlormResult<Vec<String>> {
    let db = get_connection(alias_or_default(alias)).await?;
    engine::get_table_columns(&*db, table).await
}

pub async fn column_exists(table: &str, column: &str, alias: Option<&str>) -> SqlormResult<bool> {
    let db = get_connection(alias_or_default(alias)).await?;
    engine::column_exists(&*db, table, column).await
}

pub async fn add_column(
    table: &str,
    column: &str,
    spec: &ColumnSpec,
    alias: Option<&str>,
) -> SqlormResult<()> {
    let db = get_connection(alias_or_default(alias)).await?;
    engine::add_column(&*db, table, column, spec).await
}

/// Adds the column unless it exists. Returns whether it was added.
pub async fn safe_add_column(
    table: &str,
    column: &str,
    spec: &ColumnSpec,
    alias: Option<&str>,
) -> SqlormResult<bool> {
    let db = get_connection(alias_or_default(alias)).await?;
    engine::safe_add_column(&*db, table, column, spec).await
}

pub async fn rename_column(table: &str, old: &str, new: &str, alias: Option<&str>) -> SqlormResult<()> {
    let db = get_connection(alias_or_default(alias)).await?;
    engine::rename_column(&*db, table, old, new).await
}

pub async fn get_schema_diff(model: &ModelDefinition) -> SqlormResult<SchemaDiff> {
    let db = get_connection(model.database_alias()).await?;
    engine::get_schema_diff(&*db, model).await
}

/// Adds the model columns its table lacks and returns their names.
pub async fn sync_schema(model: &ModelDefinition) -> SqlormResult<Vec<String>> {
    let db = get_connection(model.database_alias()).await?;
    engine::sync_schema(&*db, model).await
}
