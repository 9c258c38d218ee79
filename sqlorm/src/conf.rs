//! Process-wide configuration.
//!
//! Every function here reads or replaces the settings stored in
//! [`GLOBAL_SETTINGS`]. Configuring again is allowed: the new settings
//! replace the old ones and connections whose alias changed are reopened on
//! next use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlorm_core::apps;
use sqlorm_core::config_loader;
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_core::settings::{DatabaseSettings, Settings, DEFAULT_DB_ALIAS, GLOBAL_SETTINGS};

/// The auxiliary options of [`configure`] and [`configure_databases`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureOptions {
    /// Where `makemigrations` writes files. Created when missing.
    pub migrations_dir: Option<PathBuf>,
    pub debug: bool,
    pub time_zone: String,
    pub use_tz: bool,
    /// Any other settings, kept as given.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ConfigureOptions {
    fn default() -> Self {
        Self {
            migrations_dir: None,
            debug: false,
            time_zone: "UTC".to_string(),
            use_tz: true,
            extra: HashMap::new(),
        }
    }
}

impl ConfigureOptions {
    #[must_use]
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    fn apply(self, settings: &mut Settings) {
        settings.migrations_dir = self.migrations_dir;
        settings.debug = self.debug;
        settings.time_zone = self.time_zone;
        settings.use_tz = self.use_tz;
        settings.extra.extend(self.extra);
    }
}

/// Configures a single `"default"` database.
///
/// ```no_run
/// use sqlorm::conf::{configure, ConfigureOptions};
/// use sqlorm::DatabaseSettings;
///
/// configure(
///     DatabaseSettings::sqlite("app.sqlite3"),
///     ConfigureOptions::default().migrations_dir("./migrations"),
/// )?;
/// # Ok::<(), sqlorm::SqlormError>(())
/// ```
pub fn configure(database: DatabaseSettings, options: ConfigureOptions) -> SqlormResult<()> {
    database.validate()?;
    let mut settings = Settings::with_database(database);
    options.apply(&mut settings);
    install(settings)
}

/// Configures several aliases at once. A `"default"` alias is required.
pub fn configure_databases(
    databases: HashMap<String, DatabaseSettings>,
    options: ConfigureOptions,
) -> SqlormResult<()> {
    if !databases.contains_key(DEFAULT_DB_ALIAS) {
        return Err(SqlormError::ConfigurationError(
            "'default' database configuration is required".to_string(),
        ));
    }
    let mut settings = Settings {
        databases,
        ..Settings::default()
    };
    options.apply(&mut settings);
    install(settings)
}

/// Configures from a dictionary holding a `database` (or `databases`)
/// entry plus options:
///
/// ```no_run
/// sqlorm::conf::configure_from_dict(serde_json::json!({
///     "database": {"ENGINE": "django.db.backends.sqlite3", "NAME": "app.sqlite3"},
///     "migrations_dir": "./migrations",
/// }))?;
/// # Ok::<(), sqlorm::SqlormError>(())
/// ```
pub fn configure_from_dict(config: serde_json::Value) -> SqlormResult<()> {
    install(config_loader::settings_from_value(config)?)
}

/// Configures from a JSON file, or a TOML file when the name ends in
/// `.toml`. `SQLORM_*` environment variables override the file.
pub fn configure_from_file(path: impl AsRef<Path>) -> SqlormResult<()> {
    install(config_loader::from_file_with_env(path)?)
}

/// Configures from settings built elsewhere, such as a command-line
/// document with defaults filled in.
pub fn configure_settings(settings: Settings) -> SqlormResult<()> {
    install(settings)
}

/// Nothing touches the filesystem until the settings validate.
fn install(mut settings: Settings) -> SqlormResult<()> {
    settings.validate()?;
    if let Some(dir) = settings.migrations_dir.take() {
        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()?.join(dir)
        };
        std::fs::create_dir_all(&dir)?;
        settings.migrations_dir = Some(dir);
    }
    let aliases = settings.database_aliases();
    GLOBAL_SETTINGS.configure(settings)?;
    apps::setup()?;
    tracing::debug!(?aliases, "sqlorm configured");
    Ok(())
}

/// Adds an alias to the current configuration.
pub fn add_database(alias: &str, database: DatabaseSettings) -> SqlormResult<()> {
    database.validate()?;
    GLOBAL_SETTINGS.update(|settings| {
        if settings.databases.contains_key(alias) {
            return Err(SqlormError::ConfigurationError(format!(
                "Database '{alias}' already exists"
            )));
        }
        settings.databases.insert(alias.to_string(), database);
        Ok(())
    })?;
    tracing::debug!(alias, "database added");
    Ok(())
}

/// Configured aliases, `"default"` first.
pub fn get_database_aliases() -> SqlormResult<Vec<String>> {
    GLOBAL_SETTINGS.with(Settings::database_aliases)
}

pub fn get_database_config(alias: &str) -> SqlormResult<DatabaseSettings> {
    GLOBAL_SETTINGS.with(|settings| settings.database(alias).cloned())?
}

/// The resolved migrations directory, if one was configured.
pub fn get_migrations_dir() -> Option<PathBuf> {
    GLOBAL_SETTINGS
        .with(|settings| settings.migrations_dir.clone())
        .ok()
        .flatten()
}

pub fn get_settings() -> SqlormResult<Settings> {
    GLOBAL_SETTINGS.get()
}

pub fn is_configured() -> bool {
    GLOBAL_SETTINGS.is_configured()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_apply() {
        let mut settings = Settings::default();
        let mut options = ConfigureOptions::default().debug(true).time_zone("Asia/Tokyo");
        options.extra.insert("app_name".into(), serde_json::json!("demo"));
        options.apply(&mut settings);
        assert!(settings.debug);
        assert_eq!(settings.time_zone, "Asia/Tokyo");
        assert!(settings.use_tz);
        assert_eq!(settings.extra["app_name"], "demo");
    }
}
