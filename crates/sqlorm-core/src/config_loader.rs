//! Loading sqlorm configuration from dictionaries and files.
//!
//! A configuration document has the same shape whether it comes from a JSON
//! file, a TOML file or an in-memory `serde_json::Value`:
//!
//! ```json
//! {
//!     "database": {"ENGINE": "django.db.backends.sqlite3", "NAME": "app.db"},
//!     "migrations_dir": "./migrations",
//!     "debug": false,
//!     "time_zone": "UTC"
//! }
//! ```
//!
//! Multiple aliases go under `"databases"` instead of `"database"`. Keys that
//! are not recognized options are kept in [`Settings::extra`].
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `SQLORM_DEBUG` | `debug` |
//! | `SQLORM_LOG_LEVEL` | `log_level` |
//! | `SQLORM_TIME_ZONE` | `time_zone` |
//! | `SQLORM_MIGRATIONS_DIR` | `migrations_dir` |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{SqlormError, SqlormResult};
use crate::settings::{DatabaseSettings, Settings, DEFAULT_DB_ALIAS};

/// Builds [`Settings`] from a configuration document.
pub fn settings_from_value(value: serde_json::Value) -> SqlormResult<Settings> {
    let serde_json::Value::Object(mut map) = value else {
        return Err(SqlormError::ConfigurationError(
            "Configuration must be a dictionary".to_string(),
        ));
    };

    let mut settings = Settings::default();
    if let Some(databases) = map.remove("databases") {
        let serde_json::Value::Object(entries) = databases else {
            return Err(SqlormError::ConfigurationError(
                "'databases' must be a dictionary of aliases".to_string(),
            ));
        };
        for (alias, db) in entries {
            settings
                .databases
                .insert(alias, DatabaseSettings::from_value(&db)?);
        }
        map.remove("database");
    } else if let Some(db) = map.remove("database") {
        settings.databases.insert(
            DEFAULT_DB_ALIAS.to_string(),
            DatabaseSettings::from_value(&db)?,
        );
    } else {
        return Err(SqlormError::ConfigurationError(
            "Config must include 'database' key".to_string(),
        ));
    }

    apply_options(&mut settings, map)?;
    settings.validate()?;
    Ok(settings)
}

/// Applies the auxiliary options of a configuration document. Unknown keys
/// land in `extra`.
pub fn apply_options(
    settings: &mut Settings,
    options: serde_json::Map<String, serde_json::Value>,
) -> SqlormResult<()> {
    for (key, value) in options {
        match key.as_str() {
            "debug" => settings.debug = expect_bool(&key, &value)?,
            "use_tz" => settings.use_tz = expect_bool(&key, &value)?,
            "time_zone" => settings.time_zone = expect_string(&key, &value)?,
            "log_level" => settings.log_level = expect_string(&key, &value)?,
            "default_auto_field" => settings.default_auto_field = expect_string(&key, &value)?,
            "migrations_dir" => {
                settings.migrations_dir = match value {
                    serde_json::Value::Null => None,
                    other => Some(PathBuf::from(expect_string(&key, &other)?)),
                };
            }
            _ => {
                settings.extra.insert(key, value);
            }
        }
    }
    Ok(())
}

fn expect_bool(key: &str, value: &serde_json::Value) -> SqlormResult<bool> {
    value.as_bool().ok_or_else(|| {
        SqlormError::ConfigurationError(format!("Option '{key}' must be a boolean"))
    })
}

fn expect_string(key: &str, value: &serde_json::Value) -> SqlormResult<String> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        SqlormError::ConfigurationError(format!("Option '{key}' must be a string"))
    })
}

/// Parses a JSON configuration document.
pub fn from_json_str(json_str: &str) -> SqlormResult<Settings> {
    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| SqlormError::ConfigurationError(format!("Failed to parse JSON: {e}")))?;
    settings_from_value(value)
}

/// Parses a TOML configuration document.
pub fn from_toml_str(toml_str: &str) -> SqlormResult<Settings> {
    settings_from_value(parse_toml(toml_str)?)
}

/// Parses TOML text into a JSON value.
pub fn parse_toml(toml_str: &str) -> SqlormResult<serde_json::Value> {
    let value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| SqlormError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;
    Ok(toml_to_json(value))
}

/// Reads a configuration file as a JSON value. Files ending in `.toml` are
/// parsed as TOML, everything else as JSON.
pub fn read_document(path: impl AsRef<Path>) -> SqlormResult<serde_json::Value> {
    let path = path.as_ref();
    let content = read_text(path)?;
    if is_toml(path) {
        parse_toml(&content)
    } else {
        serde_json::from_str(&content)
            .map_err(|e| SqlormError::ConfigurationError(format!("Failed to parse JSON: {e}")))
    }
}

fn read_text(path: &Path) -> SqlormResult<String> {
    if !path.exists() {
        return Err(SqlormError::ConfigurationError(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

/// Loads settings from a JSON or TOML file.
pub fn from_file(path: impl AsRef<Path>) -> SqlormResult<Settings> {
    settings_from_value(read_document(path)?)
}

/// Loads settings from a JSON file, whatever its extension.
pub fn from_json_file(path: impl AsRef<Path>) -> SqlormResult<Settings> {
    from_json_str(&read_text(path.as_ref())?)
}

/// Loads settings from a TOML file, whatever its extension.
pub fn from_toml_file(path: impl AsRef<Path>) -> SqlormResult<Settings> {
    from_toml_str(&read_text(path.as_ref())?)
}

/// Loads settings from a file and then applies environment overrides.
pub fn from_file_with_env(path: impl AsRef<Path>) -> SqlormResult<Settings> {
    let mut settings = from_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Applies `SQLORM_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SQLORM_DEBUG") {
        settings.debug = matches!(val.to_lowercase().as_str(), "true" | "1" | "yes");
    }
    if let Some(val) = lookup("SQLORM_LOG_LEVEL") {
        settings.log_level = val;
    }
    if let Some(val) = lookup("SQLORM_TIME_ZONE") {
        settings.time_zone = val;
    }
    if let Some(val) = lookup("SQLORM_MIGRATIONS_DIR") {
        settings.migrations_dir = Some(PathBuf::from(val));
    }
}

/// Converts a TOML value to a `serde_json::Value`.
pub fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Parses a `{alias: config}` object into database settings.
pub fn databases_from_value(
    value: &serde_json::Value,
) -> SqlormResult<HashMap<String, DatabaseSettings>> {
    let serde_json::Value::Object(entries) = value else {
        return Err(SqlormError::ConfigurationError(
            "Database configuration must be a dictionary".to_string(),
        ));
    };
    entries
        .iter()
        .map(|(alias, db)| Ok((alias.clone(), DatabaseSettings::from_value(db)?)))
        .collect()
}
