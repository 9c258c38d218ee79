//! Settings for sqlorm and the process-wide configuration slot.
//!
//! [`Settings`] holds the database aliases plus the handful of auxiliary
//! options a script needs (debug flag, time zone, migrations directory).
//! [`GLOBAL_SETTINGS`] is the single place the rest of the library reads
//! them from. Unlike a write-once cell it can be reconfigured, so a script
//! may call `configure` again to point at another database.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{SqlormError, SqlormResult};

/// Engine string for `SQLite` in Django notation.
pub const SQLITE_ENGINE: &str = "django.db.backends.sqlite3";
/// Engine string for `PostgreSQL` in Django notation.
pub const POSTGRES_ENGINE: &str = "django.db.backends.postgresql";
/// The alias every configuration must define.
pub const DEFAULT_DB_ALIAS: &str = "default";

/// Connection parameters for one database alias.
///
/// Keys may be written in lower case (`engine`) or in the Django style
/// (`ENGINE`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The engine, e.g. `django.db.backends.sqlite3` or `sqlite`.
    #[serde(alias = "ENGINE")]
    pub engine: String,
    /// Database name, or file path for `SQLite`.
    #[serde(alias = "NAME")]
    pub name: String,
    #[serde(alias = "USER")]
    pub user: String,
    #[serde(alias = "PASSWORD")]
    pub password: String,
    #[serde(alias = "HOST")]
    pub host: String,
    #[serde(alias = "PORT", deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Engine-specific options.
    #[serde(alias = "OPTIONS")]
    pub options: HashMap<String, String>,
}

impl DatabaseSettings {
    /// An `SQLite` configuration pointing at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            engine: SQLITE_ENGINE.to_string(),
            name: path.into(),
            ..Self::default()
        }
    }

    /// A `PostgreSQL` configuration.
    pub fn postgres(
        name: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            engine: POSTGRES_ENGINE.to_string(),
            name: name.into(),
            user: user.into(),
            password: password.into(),
            host: host.into(),
            port,
            options: HashMap::new(),
        }
    }

    /// Checks that the two required keys are present.
    pub fn validate(&self) -> SqlormResult<()> {
        if self.engine.trim().is_empty() {
            return Err(SqlormError::ConfigurationError(
                "Database config must include 'ENGINE'".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(SqlormError::ConfigurationError(
                "Database config must include 'NAME'".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a database configuration from a JSON value, rejecting
    /// anything that is not an object.
    pub fn from_value(value: &serde_json::Value) -> SqlormResult<Self> {
        if !value.is_object() {
            return Err(SqlormError::ConfigurationError(
                "Database configuration must be a dictionary".to_string(),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|e| {
            SqlormError::ConfigurationError(format!("Invalid database configuration: {e}"))
        })
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) if s.trim().is_empty() => Ok(0),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// The complete sqlorm configuration.
///
/// # Examples
///
/// ```
/// use sqlorm_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(!settings.debug);
/// assert_eq!(settings.time_zone, "UTC");
/// assert!(settings.databases.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub debug: bool,
    /// Database configurations keyed by alias. Must contain `"default"`.
    pub databases: HashMap<String, DatabaseSettings>,
    /// Field type of the implicit primary key.
    pub default_auto_field: String,
    pub time_zone: String,
    pub use_tz: bool,
    /// Where migration files are written. `None` disables file-based migrations.
    pub migrations_dir: Option<PathBuf>,
    /// The tracing filter (e.g. "info", "sqlorm_db=debug").
    pub log_level: String,
    /// Additional options passed through untouched.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            databases: HashMap::new(),
            default_auto_field: "BigAutoField".to_string(),
            time_zone: "UTC".to_string(),
            use_tz: true,
            migrations_dir: None,
            log_level: "info".to_string(),
            extra: HashMap::new(),
        }
    }
}

impl Settings {
    /// Settings with a single `"default"` database.
    pub fn with_database(database: DatabaseSettings) -> Self {
        let mut settings = Self::default();
        settings
            .databases
            .insert(DEFAULT_DB_ALIAS.to_string(), database);
        settings
    }

    /// Validates every alias and requires a `"default"` one.
    pub fn validate(&self) -> SqlormResult<()> {
        if !self.databases.contains_key(DEFAULT_DB_ALIAS) {
            return Err(SqlormError::ConfigurationError(
                "'default' database configuration is required".to_string(),
            ));
        }
        for db in self.databases.values() {
            db.validate()?;
        }
        Ok(())
    }

    /// Database aliases, `"default"` first and the rest sorted.
    pub fn database_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.databases.keys().cloned().collect();
        aliases.sort_by(|a, b| {
            (a != DEFAULT_DB_ALIAS)
                .cmp(&(b != DEFAULT_DB_ALIAS))
                .then_with(|| a.cmp(b))
        });
        aliases
    }

    /// Looks up the configuration for `alias`.
    pub fn database(&self, alias: &str) -> SqlormResult<&DatabaseSettings> {
        self.databases.get(alias).ok_or_else(|| {
            SqlormError::ConfigurationError(format!("Database '{alias}' not found"))
        })
    }
}

/// The process-wide, reconfigurable settings slot.
pub struct GlobalSettings {
    inner: RwLock<Option<Settings>>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSettings {
    /// Creates an empty, unconfigured slot.
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Validates and installs `settings`, replacing any previous ones.
    pub fn configure(&self, settings: Settings) -> SqlormResult<()> {
        settings.validate()?;
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(settings);
        Ok(())
    }

    /// Applies `f` to the installed settings and re-validates the result.
    /// Nothing changes if `f` or validation fails.
    pub fn update<F>(&self, f: F) -> SqlormResult<()>
    where
        F: FnOnce(&mut Settings) -> SqlormResult<()>,
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let current = guard.as_ref().ok_or_else(not_configured)?;
        let mut next = current.clone();
        f(&mut next)?;
        next.validate()?;
        *guard = Some(next);
        Ok(())
    }

    /// Returns a snapshot of the installed settings.
    pub fn get(&self) -> SqlormResult<Settings> {
        self.with(Clone::clone)
    }

    /// Runs `f` against the installed settings without cloning them.
    pub fn with<R>(&self, f: impl FnOnce(&Settings) -> R) -> SqlormResult<R> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f).ok_or_else(not_configured)
    }

    /// Returns `true` once `configure` has succeeded.
    pub fn is_configured(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Forgets the installed settings.
    pub fn reset(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn not_configured() -> SqlormError {
    SqlormError::ConfigurationError(
        "sqlorm is not configured. Call configure() first.".to_string(),
    )
}

/// The global settings instance read by connections, models and migrations.
pub static GLOBAL_SETTINGS: GlobalSettings = GlobalSettings::new();
