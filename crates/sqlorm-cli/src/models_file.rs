//! The `--models` file.
//!
//! A JSON document, or TOML when the name ends in `.toml`:
//!
//! ```json
//! {
//!   "config": {"database": {"ENGINE": "sqlite3", "NAME": "app.sqlite3"}},
//!   "models": [
//!     {"name": "Author", "fields": {"name": {"type": "CharField", "max_length": 100}}},
//!     {"name": "Book", "fields": [
//!       {"name": "title", "type": "CharField", "max_length": 200},
//!       {"name": "author", "type": "ForeignKey", "to": "Author"}
//!     ]}
//!   ]
//! }
//! ```
//!
//! `config` has the shape [`sqlorm::configure_from_dict`] takes. Without
//! it the commands run against `db.sqlite3`. Models are registered in file
//! order, so a relation should come after its target.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlorm_core::config_loader;
use sqlorm_core::{Settings, SqlormError, SqlormResult};
use sqlorm_db::model::{builder_from_value, ModelDefinition};

/// Database file used when the models file has no `config` section.
pub const DEFAULT_DATABASE_NAME: &str = "db.sqlite3";

/// Migrations directory used when the configuration names none.
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// A parsed models file.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelsFile {
    pub config: Option<serde_json::Value>,
    pub models: Vec<serde_json::Value>,
}

impl ModelsFile {
    pub fn load(path: impl AsRef<Path>) -> SqlormResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SqlormError::ConfigurationError(format!(
                "Models file not found: {}",
                path.display()
            )));
        }
        Self::from_value(config_loader::read_document(path)?)
    }

    pub fn from_value(value: serde_json::Value) -> SqlormResult<Self> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(SqlormError::ConfigurationError(
                "Models file must contain a dictionary".to_string(),
            ));
        };
        let config = match map.remove("config") {
            None | Some(serde_json::Value::Null) => None,
            Some(config @ serde_json::Value::Object(_)) => Some(config),
            Some(_) => {
                return Err(SqlormError::ConfigurationError(
                    "'config' must be a dictionary".to_string(),
                ))
            }
        };
        let models = match map.remove("models") {
            None => Vec::new(),
            Some(serde_json::Value::Array(models)) => models,
            Some(_) => {
                return Err(SqlormError::ConfigurationError(
                    "'models' must be a list".to_string(),
                ))
            }
        };
        Ok(Self { config, models })
    }

    /// The settings the commands run with: the `config` section (or the
    /// default SQLite database), then `SQLORM_*` overrides, then the
    /// default migrations directory when none is set.
    pub fn settings(&self) -> SqlormResult<Settings> {
        let document = self.config.clone().unwrap_or_else(|| {
            serde_json::json!({
                "database": {"ENGINE": "sqlite3", "NAME": DEFAULT_DATABASE_NAME},
            })
        });
        let mut settings = config_loader::settings_from_value(document)?;
        config_loader::apply_env_overrides(&mut settings);
        if settings.migrations_dir.is_none() {
            settings.migrations_dir = Some(PathBuf::from(DEFAULT_MIGRATIONS_DIR));
        }
        Ok(settings)
    }

    /// Builds and registers every model, in file order.
    pub fn register_models(&self) -> SqlormResult<Vec<Arc<ModelDefinition>>> {
        self.models
            .iter()
            .map(|model| builder_from_value(model)?.register())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_sections() {
        let file = ModelsFile::from_value(json!({
            "config": {"database": {"ENGINE": "sqlite3", "NAME": "x.db"}},
            "models": [{"name": "Tag"}],
        }))
        .unwrap();
        assert!(file.config.is_some());
        assert_eq!(file.models.len(), 1);

        let empty = ModelsFile::from_value(json!({})).unwrap();
        assert!(empty.config.is_none());
        assert!(empty.models.is_empty());
    }

    #[test]
    fn test_from_value_rejects_bad_shapes() {
        let err = ModelsFile::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("must contain a dictionary"));
        let err = ModelsFile::from_value(json!({"models": {"name": "Tag"}})).unwrap_err();
        assert!(err.to_string().contains("'models' must be a list"));
        let err = ModelsFile::from_value(json!({"config": "app.db"})).unwrap_err();
        assert!(err.to_string().contains("'config' must be a dictionary"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ModelsFile::from_value(json!({})).unwrap().settings().unwrap();
        let default = settings.database("default").unwrap();
        assert_eq!(default.engine, "sqlite3");
        assert_eq!(default.name, DEFAULT_DATABASE_NAME);
        assert!(settings.migrations_dir.is_some());
    }

    #[test]
    fn test_settings_from_config() {
        let file = ModelsFile::from_value(json!({
            "config": {
                "databases": {
                    "default": {"ENGINE": "sqlite3", "NAME": "main.db"},
                    "archive": {"ENGINE": "sqlite3", "NAME": "archive.db"},
                },
                "time_zone": "Asia/Tokyo",
            }
        }))
        .unwrap();
        let settings = file.settings().unwrap();
        assert_eq!(settings.database_aliases(), vec!["default", "archive"]);
        assert_eq!(settings.time_zone, "Asia/Tokyo");
    }

    #[test]
    fn test_load_toml_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.toml");
        std::fs::write(
            &path,
            "[[models]]\nname = \"Tag\"\n\n[models.fields.label]\ntype = \"CharField\"\nmax_length = 50\n",
        )
        .unwrap();
        let file = ModelsFile::load(&path).unwrap();
        assert_eq!(file.models[0]["fields"]["label"]["max_length"], json!(50));

        let err = ModelsFile::load(dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Models file not found"));
    }
}
