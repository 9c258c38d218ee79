//! Management commands run against the configured databases and the
//! registered models.

use std::path::PathBuf;

use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_db::registry::registry;
use sqlorm_migrations::management as engine;
use sqlorm_migrations::MigrateOptions;

use crate::conf;
use crate::connection::get_connection;

fn migrations_dir() -> SqlormResult<PathBuf> {
    conf::get_migrations_dir().ok_or_else(|| {
        SqlormError::ConfigurationError(
            "No migrations directory configured. Pass migrations_dir to configure().".to_string(),
        )
    })
}

/// Writes a migration for the changes in the registered models. Returns
/// its path, or `None` when nothing changed.
pub fn makemigrations(name: Option<&str>) -> SqlormResult<Option<PathBuf>> {
    engine::makemigrations(&migrations_dir()?, &registry().get_all(), name)
}

/// Applies pending migrations to `options.alias`. Returns the names of
/// the migrations applied.
pub async fn migrate(options: &MigrateOptions) -> SqlormResult<Vec<String>> {
    let db = get_connection(&options.alias).await?;
    engine::migrate(&*db, &migrations_dir()?, options).await
}

/// Every migration with whether the `alias` database has it applied.
pub async fn showmigrations(alias: &str) -> SqlormResult<Vec<(String, bool)>> {
    let db = get_connection(alias).await?;
    engine::showmigrations(&*db, &migrations_dir()?).await
}

/// Creates the missing tables of the registered models on `alias`,
/// without migration files.
pub async fn syncdb(alias: &str, verbosity: u8) -> SqlormResult<Vec<String>> {
    let db = get_connection(alias).await?;
    engine::syncdb(&*db, alias, &registry().get_all(), verbosity).await
}

/// A models file describing the tables of `alias`.
pub async fn inspectdb(alias: &str) -> SqlormResult<String> {
    let db = get_connection(alias).await?;
    engine::inspectdb(&*db).await
}
