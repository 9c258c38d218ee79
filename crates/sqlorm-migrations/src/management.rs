//! Management commands as library functions.
//!
//! Each command takes the backend and migrations directory explicitly; the
//! `sqlorm` facade resolves them from the global configuration and the CLI
//! calls the facade.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlorm_core::apps::SQLORM_APP_LABEL;
use sqlorm_core::error::SqlormResult;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_db::model::ModelDefinition;
use sqlorm_db_backends::{ColumnInfo, DatabaseBackend};

use crate::autodetect::{suggest_name, MigrationAutodetector, ProjectState};
use crate::executor::{MigrationExecutor, MigrationRecorder};
use crate::loader::MigrationLoader;
use crate::migration::Migration;
use crate::schema;
use crate::serializer::{generate_migration_name, migration_file_path, next_migration_number};

/// Options of [`migrate`].
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub alias: String,
    /// Migrate forwards or backwards to this migration (name or unique
    /// prefix) instead of applying everything.
    pub target: Option<String>,
    /// Record migrations as applied without running their DDL.
    pub fake: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            alias: DEFAULT_DB_ALIAS.to_string(),
            target: None,
            fake: false,
        }
    }
}

/// Writes a migration with the changes between the migration files in
/// `migrations_dir` and `models`. Returns the new file, or `None` when
/// nothing changed.
pub fn makemigrations(
    migrations_dir: &Path,
    models: &[Arc<ModelDefinition>],
    name: Option<&str>,
) -> SqlormResult<Option<PathBuf>> {
    let loader = MigrationLoader::load(migrations_dir)?;
    let from_state = loader.project_state(None)?;
    let to_state = ProjectState::from_models(models.iter().map(AsRef::as_ref));
    let operations = MigrationAutodetector::new(&from_state, &to_state).changes();
    if operations.is_empty() {
        tracing::info!("No changes detected");
        return Ok(None);
    }

    let initial = loader.is_empty();
    let label = match name {
        Some(custom) => sanitize(custom),
        None => suggest_name(&operations, initial),
    };
    let number = next_migration_number(migrations_dir, SQLORM_APP_LABEL)?;
    let mut migration = Migration::new(SQLORM_APP_LABEL, generate_migration_name(number, &label))
        .operations(operations);
    migration.initial = initial;
    if let Some(leaf) = loader.leaf(SQLORM_APP_LABEL) {
        migration = migration.depends_on(SQLORM_APP_LABEL, leaf.name.clone());
    }

    let path = migration_file_path(migrations_dir, SQLORM_APP_LABEL, &migration.name);
    migration.write_to_file(&path)?;
    tracing::info!(path = %path.display(), "Migrations for '{SQLORM_APP_LABEL}':");
    for op in &migration.operations {
        tracing::info!("  - {}", op.describe());
    }
    Ok(Some(path))
}

/// Migration names keep to letters, digits and underscores.
fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Applies pending migrations and returns the names of those applied (or
/// unapplied, when migrating back to an earlier target).
pub async fn migrate(
    db: &dyn DatabaseBackend,
    migrations_dir: &Path,
    options: &MigrateOptions,
) -> SqlormResult<Vec<String>> {
    let loader = MigrationLoader::load(migrations_dir)?;
    let mut executor = MigrationExecutor::new(db, options.alias.clone()).await?;
    let target = match &options.target {
        Some(name) => Some(loader.find(name)?.key()),
        None => None,
    };
    let plan = executor.make_plan(&loader, target.as_ref())?;
    if plan.is_empty() {
        tracing::info!(alias = %options.alias, "No migrations to apply");
        return Ok(Vec::new());
    }
    executor.execute(&loader, &plan, options.fake).await
}

/// Every migration on disk with whether `db` has it applied.
pub async fn showmigrations(
    db: &dyn DatabaseBackend,
    migrations_dir: &Path,
) -> SqlormResult<Vec<(String, bool)>> {
    let loader = MigrationLoader::load(migrations_dir)?;
    let recorder = MigrationRecorder::load(db).await?;
    Ok(loader
        .ordered()?
        .into_iter()
        .map(|m| (m.name.clone(), recorder.is_applied(&m.key())))
        .collect())
}

/// Creates missing tables for `models` without migration files.
pub async fn syncdb(
    db: &dyn DatabaseBackend,
    alias: &str,
    models: &[Arc<ModelDefinition>],
    verbosity: u8,
) -> SqlormResult<Vec<String>> {
    schema::create_all_tables(db, alias, models, verbosity).await
}

/// Describes the existing tables as a models file:
/// `{"models": [{"name": ..., "_db_table": ..., "fields": [...]}]}`.
pub async fn inspectdb(db: &dyn DatabaseBackend) -> SqlormResult<String> {
    let mut models = Vec::new();
    for table in db.table_names().await? {
        if table == MigrationRecorder::TABLE || table.starts_with("sqlite_") {
            continue;
        }
        let columns = db.table_description(&table).await?;
        let fields: Vec<serde_json::Value> = columns
            .iter()
            .filter(|c| !(c.primary_key && c.name == "id" && c.data_type.to_lowercase().contains("int")))
            .map(inspect_column)
            .collect();
        models.push(serde_json::json!({
            "name": model_name_for(&table),
            "_db_table": table,
            "fields": fields,
        }));
    }
    Ok(serde_json::to_string_pretty(&serde_json::json!({ "models": models }))?)
}

/// `sqlorm_app_blog_post` -> `BlogPost`.
fn model_name_for(table: &str) -> String {
    let prefix = format!("{SQLORM_APP_LABEL}_");
    let base = table.strip_prefix(&prefix).unwrap_or(table);
    base.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

/// The length in `varchar(100)`.
fn type_length(data_type: &str) -> Option<u64> {
    let start = data_type.find('(')?;
    let end = data_type.find(')')?;
    data_type
        .get(start + 1..end)?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn inspect_column(column: &ColumnInfo) -> serde_json::Value {
    let data_type = column.data_type.to_lowercase();
    let mut spec = serde_json::Map::new();
    spec.insert("name".into(), column.name.clone().into());
    let field_type = if data_type.contains("char") {
        spec.insert("max_length".into(), type_length(&data_type).unwrap_or(255).into());
        "CharField"
    } else if data_type.contains("bigint") || data_type == "int8" {
        "BigIntegerField"
    } else if data_type.contains("smallint") || data_type == "int2" {
        "SmallIntegerField"
    } else if data_type.contains("int") || data_type.contains("serial") {
        "IntegerField"
    } else if data_type.contains("bool") {
        "BooleanField"
    } else if data_type.contains("real")
        || data_type.contains("double")
        || data_type.contains("float")
    {
        "FloatField"
    } else if data_type.contains("decimal") || data_type.contains("numeric") {
        spec.insert("max_digits".into(), 10.into());
        spec.insert("decimal_places".into(), 2.into());
        "DecimalField"
    } else if data_type.contains("timestamp") || data_type.contains("datetime") {
        "DateTimeField"
    } else if data_type.contains("date") {
        "DateField"
    } else if data_type.contains("time") {
        "TimeField"
    } else if data_type.contains("uuid") {
        "UUIDField"
    } else if data_type.contains("blob") || data_type.contains("bytea") {
        "BinaryField"
    } else if data_type.contains("json") {
        "JSONField"
    } else {
        "TextField"
    };
    spec.insert("type".into(), field_type.into());
    if column.primary_key {
        spec.insert("primary_key".into(), true.into());
    } else if column.nullable {
        spec.insert("null".into(), true.into());
    }
    serde_json::Value::Object(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_for() {
        assert_eq!(model_name_for("sqlorm_app_blog_post"), "BlogPost");
        assert_eq!(model_name_for("legacy-items"), "LegacyItems");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Add Pages!"), "add_pages_");
    }

    #[test]
    fn test_inspect_column_types() {
        let column = |name: &str, data_type: &str, nullable: bool| ColumnInfo {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            default: None,
            primary_key: false,
        };
        assert_eq!(
            inspect_column(&column("title", "VARCHAR(120)", false)),
            serde_json::json!({"name": "title", "type": "CharField", "max_length": 120})
        );
        assert_eq!(
            inspect_column(&column("born", "date", true)),
            serde_json::json!({"name": "born", "type": "DateField", "null": true})
        );
        assert_eq!(inspect_column(&column("at", "DATETIME", false))["type"], "DateTimeField");
        assert_eq!(inspect_column(&column("n", "bigint", false))["type"], "BigIntegerField");
        assert_eq!(inspect_column(&column("x", "weird", false))["type"], "TextField");
    }
}
