//! Migration files.
//!
//! Migrations are written as pretty-printed JSON, one file per migration:
//!
//! ```text
//! <migrations_dir>/sqlorm_app/0001_initial.json
//! <migrations_dir>/sqlorm_app/0002_book_pages.json
//! ```
//!
//! The leading four digits order the files; the rest of the stem describes
//! the change.

use std::path::{Path, PathBuf};

use sqlorm_core::error::{SqlormError, SqlormResult};

use crate::migration::Migration;

impl Migration {
    pub fn to_json(&self) -> SqlormResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SqlormError::SerializationError(format!("Failed to serialize migration: {e}")))
    }

    pub fn from_json(json: &str) -> SqlormResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            SqlormError::MigrationError(format!("Failed to parse migration: {e}"))
        })
    }

    /// Writes the migration to `path`, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> SqlormResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> SqlormResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| {
            SqlormError::MigrationError(format!("{}: {e}", path.display()))
        })
    }
}

/// `NNNN_<name>`.
pub fn generate_migration_name(number: u32, name: &str) -> String {
    format!("{number:04}_{name}")
}

/// The number of a migration file stem, `0002_book_pages` -> 2.
pub fn migration_number(stem: &str) -> Option<u32> {
    let digits = stem.split('_').next()?;
    if digits.len() == 4 {
        digits.parse().ok()
    } else {
        None
    }
}

/// Migration files of one app, sorted by name.
pub fn migration_files(migrations_dir: &Path, app_label: &str) -> SqlormResult<Vec<PathBuf>> {
    let app_dir = migrations_dir.join(app_label);
    if !app_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&app_dir)? {
        let path = entry?.path();
        let numbered = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(migration_number)
            .is_some();
        if numbered && path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// One past the highest existing migration number for the app.
pub fn next_migration_number(migrations_dir: &Path, app_label: &str) -> SqlormResult<u32> {
    let highest = migration_files(migrations_dir, app_label)?
        .iter()
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).and_then(migration_number))
        .max()
        .unwrap_or(0);
    Ok(highest + 1)
}

pub fn migration_file_path(migrations_dir: &Path, app_label: &str, name: &str) -> PathBuf {
    migrations_dir.join(app_label).join(format!("{name}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodetect::StateOptions;
    use crate::operations::Operation;
    use sqlorm_db::fields::{self, OnDelete};

    #[test]
    fn test_names() {
        assert_eq!(generate_migration_name(1, "initial"), "0001_initial");
        assert_eq!(generate_migration_name(12, "book_pages"), "0012_book_pages");
        assert_eq!(migration_number("0012_book_pages"), Some(12));
        assert_eq!(migration_number("README"), None);
        assert_eq!(migration_number("12_short"), None);
    }

    #[test]
    fn test_file_roundtrip_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let migration = Migration::new("sqlorm_app", "0001_initial")
            .initial()
            .operation(Operation::CreateModel {
                name: "Review".into(),
                db_table: "sqlorm_app_review".into(),
                fields: vec![
                    fields::big_auto_field().named("id"),
                    fields::integer_field().default(3).named("stars"),
                    fields::foreign_key("Book", OnDelete::SetNull)
                        .nullable()
                        .named("book"),
                ],
                options: StateOptions::default(),
            });
        let path = migration_file_path(dir.path(), "sqlorm_app", &migration.name);
        migration.write_to_file(&path).unwrap();
        assert!(path.ends_with("sqlorm_app/0001_initial.json"));

        let loaded = Migration::read_from_file(&path).unwrap();
        assert_eq!(loaded, migration);
    }

    #[test]
    fn test_next_number_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_migration_number(dir.path(), "sqlorm_app").unwrap(), 1);
        let app = dir.path().join("sqlorm_app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("0001_initial.json"), "{}").unwrap();
        std::fs::write(app.join("0004_auto_20240101_1200.json"), "{}").unwrap();
        std::fs::write(app.join("notes.txt"), "").unwrap();
        assert_eq!(next_migration_number(dir.path(), "sqlorm_app").unwrap(), 5);
        assert_eq!(migration_files(dir.path(), "sqlorm_app").unwrap().len(), 2);
    }

    #[test]
    fn test_bad_file_is_migration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001_broken.json");
        std::fs::write(&path, "{\"name\": 3}").unwrap();
        let err = Migration::read_from_file(&path).unwrap_err();
        assert_eq!(err.kind(), "MigrationError");
        assert!(err.to_string().contains("0001_broken.json"));
    }
}
