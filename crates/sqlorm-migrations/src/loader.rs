//! Loading migration files from disk.
//!
//! [`MigrationLoader`] reads every migration file of the default app,
//! builds the dependency graph and can replay operations to reconstruct the
//! historical [`ProjectState`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlorm_core::apps::SQLORM_APP_LABEL;
use sqlorm_core::error::{SqlormError, SqlormResult};

use crate::autodetect::ProjectState;
use crate::migration::{Migration, MigrationGraph, MigrationKey};
use crate::serializer::migration_files;

/// The migrations found in a migrations directory.
#[derive(Debug)]
pub struct MigrationLoader {
    migrations_dir: PathBuf,
    migrations: HashMap<MigrationKey, Migration>,
    graph: MigrationGraph,
}

impl MigrationLoader {
    /// Reads and validates every migration under `migrations_dir`. A
    /// missing directory simply has no migrations.
    pub fn load(migrations_dir: impl AsRef<Path>) -> SqlormResult<Self> {
        let migrations_dir = migrations_dir.as_ref().to_path_buf();
        let mut migrations = HashMap::new();
        for path in migration_files(&migrations_dir, SQLORM_APP_LABEL)? {
            let migration = Migration::read_from_file(&path)?;
            let expected = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if migration.name != expected {
                return Err(SqlormError::MigrationError(format!(
                    "{}: migration is named '{}'",
                    path.display(),
                    migration.name
                )));
            }
            migrations.insert(migration.key(), migration);
        }

        let mut graph = MigrationGraph::new();
        for key in migrations.keys() {
            graph.add_node(key.0.clone(), key.1.clone());
        }
        for migration in migrations.values() {
            for dependency in &migration.dependencies {
                graph.add_dependency(&migration.key(), dependency)?;
            }
        }
        graph.topological_order()?;

        tracing::debug!(dir = %migrations_dir.display(), count = migrations.len(), "loaded migrations");
        Ok(Self {
            migrations_dir,
            migrations,
            graph,
        })
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    pub fn graph(&self) -> &MigrationGraph {
        &self.graph
    }

    pub fn get(&self, key: &MigrationKey) -> Option<&Migration> {
        self.migrations.get(key)
    }

    /// Looks up a migration of the default app by name. A unique prefix
    /// such as `0002` is accepted.
    pub fn find(&self, name: &str) -> SqlormResult<&Migration> {
        let exact = (SQLORM_APP_LABEL.to_string(), name.to_string());
        if let Some(migration) = self.migrations.get(&exact) {
            return Ok(migration);
        }
        let mut matches = self
            .migrations
            .values()
            .filter(|m| m.app_label == SQLORM_APP_LABEL && m.name.starts_with(name));
        match (matches.next(), matches.next()) {
            (Some(migration), None) => Ok(migration),
            (Some(_), Some(_)) => Err(SqlormError::MigrationError(format!(
                "More than one migration matches '{name}'"
            ))),
            _ => Err(SqlormError::MigrationError(format!(
                "Cannot find a migration matching '{name}'"
            ))),
        }
    }

    /// Every migration, dependencies first.
    pub fn ordered(&self) -> SqlormResult<Vec<&Migration>> {
        Ok(self
            .graph
            .topological_order()?
            .iter()
            .filter_map(|key| self.migrations.get(key))
            .collect())
    }

    /// The latest migration of `app_label`, if any.
    pub fn leaf(&self, app_label: &str) -> Option<&Migration> {
        self.graph
            .leaf_nodes(app_label)
            .last()
            .and_then(|key| self.migrations.get(key))
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// The project state after applying every migration, or only those up
    /// to and including `upto`.
    pub fn project_state(&self, upto: Option<&MigrationKey>) -> SqlormResult<ProjectState> {
        let keys = match upto {
            Some(target) => self.graph.ancestors(target)?,
            None => self.graph.topological_order()?,
        };
        let mut state = ProjectState::new();
        for key in keys {
            if let Some(migration) = self.migrations.get(&key) {
                for op in &migration.operations {
                    op.state_forwards(&mut state)?;
                }
            }
        }
        Ok(state)
    }
}
