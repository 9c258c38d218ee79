//! Migrations and their dependency graph.
//!
//! A [`Migration`] is a named, ordered list of [`Operation`]s stored as one
//! JSON file. Migrations are keyed by `(app_label, name)`; the
//! [`MigrationGraph`] orders them so every migration runs after the ones
//! it depends on.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use sqlorm_core::error::{SqlormError, SqlormResult};

use crate::operations::Operation;

/// `(app_label, name)`.
pub type MigrationKey = (String, String);

/// A unit of schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub app_label: String,
    /// The file stem, e.g. `0001_initial`.
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<MigrationKey>,
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Migration {
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
            dependencies: Vec::new(),
            initial: false,
            operations: Vec::new(),
        }
    }

    #[must_use]
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, app_label: impl Into<String>, name: impl Into<String>) -> Self {
        self.dependencies.push((app_label.into(), name.into()));
        self
    }

    #[must_use]
    pub fn operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    #[must_use]
    pub fn operations(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.operations.extend(ops);
        self
    }

    pub fn key(&self) -> MigrationKey {
        (self.app_label.clone(), self.name.clone())
    }
}

/// The dependency DAG of all known migrations.
#[derive(Debug, Default)]
pub struct MigrationGraph {
    /// Dependents of each node.
    children: BTreeMap<MigrationKey, Vec<MigrationKey>>,
    /// Dependencies of each node.
    parents: BTreeMap<MigrationKey, Vec<MigrationKey>>,
}

fn unknown(key: &MigrationKey) -> SqlormError {
    SqlormError::MigrationError(format!("Migration {}.{} not found", key.0, key.1))
}

impl MigrationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, app_label: impl Into<String>, name: impl Into<String>) {
        let key = (app_label.into(), name.into());
        self.children.entry(key.clone()).or_default();
        self.parents.entry(key).or_default();
    }

    /// Records that `child` depends on `parent`. Both must be nodes.
    pub fn add_dependency(&mut self, child: &MigrationKey, parent: &MigrationKey) -> SqlormResult<()> {
        if !self.contains(child) {
            return Err(unknown(child));
        }
        if !self.contains(parent) {
            return Err(SqlormError::MigrationError(format!(
                "Migration {}.{} depends on unknown migration {}.{}",
                child.0, child.1, parent.0, parent.1
            )));
        }
        self.children.entry(parent.clone()).or_default().push(child.clone());
        self.parents.entry(child.clone()).or_default().push(parent.clone());
        Ok(())
    }

    /// Every node, dependencies first. Ties break by key so the order is
    /// stable across runs.
    pub fn topological_order(&self) -> SqlormResult<Vec<MigrationKey>> {
        let mut in_degree: BTreeMap<&MigrationKey, usize> = self
            .parents
            .iter()
            .map(|(key, parents)| (key, parents.len()))
            .collect();
        let mut ready: BTreeSet<&MigrationKey> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(key, _)| *key)
            .collect();

        let mut order = Vec::with_capacity(self.parents.len());
        while let Some(node) = ready.pop_first() {
            order.push(node.clone());
            for child in self.children.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        if order.len() != self.parents.len() {
            return Err(SqlormError::MigrationError(
                "Circular dependency detected in migration graph".to_string(),
            ));
        }
        Ok(order)
    }

    /// `target` and everything it depends on, dependencies first.
    pub fn ancestors(&self, target: &MigrationKey) -> SqlormResult<Vec<MigrationKey>> {
        if !self.contains(target) {
            return Err(unknown(target));
        }
        let mut seen: BTreeSet<MigrationKey> = BTreeSet::new();
        let mut queue = VecDeque::from([target.clone()]);
        while let Some(key) = queue.pop_front() {
            if seen.insert(key.clone()) {
                queue.extend(self.dependencies(&key));
            }
        }
        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|key| seen.contains(key))
            .collect())
    }

    /// Migrations of `app_label` nothing else depends on.
    pub fn leaf_nodes(&self, app_label: &str) -> Vec<MigrationKey> {
        self.children
            .iter()
            .filter(|(key, children)| {
                key.0 == app_label && !children.iter().any(|c| c.0 == app_label)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn contains(&self, key: &MigrationKey) -> bool {
        self.parents.contains_key(key)
    }

    pub fn dependencies(&self, key: &MigrationKey) -> Vec<MigrationKey> {
        self.parents.get(key).cloned().unwrap_or_default()
    }

    pub fn dependents(&self, key: &MigrationKey) -> Vec<MigrationKey> {
        self.children.get(key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(app: &str, name: &str) -> MigrationKey {
        (app.to_string(), name.to_string())
    }

    fn chain() -> MigrationGraph {
        let mut g = MigrationGraph::new();
        g.add_node("sqlorm_app", "0001_initial");
        g.add_node("sqlorm_app", "0002_book_pages");
        g.add_node("sqlorm_app", "0003_auto");
        g.add_dependency(&key("sqlorm_app", "0002_book_pages"), &key("sqlorm_app", "0001_initial"))
            .unwrap();
        g.add_dependency(&key("sqlorm_app", "0003_auto"), &key("sqlorm_app", "0002_book_pages"))
            .unwrap();
        g
    }

    #[test]
    fn test_migration_builder() {
        let m = Migration::new("sqlorm_app", "0002_book_pages")
            .depends_on("sqlorm_app", "0001_initial")
            .operation(Operation::DeleteModel { name: "Old".into() });
        assert!(!m.initial);
        assert_eq!(m.key(), key("sqlorm_app", "0002_book_pages"));
        assert_eq!(m.dependencies.len(), 1);
        assert_eq!(m.operations.len(), 1);
    }

    #[test]
    fn test_topological_order() {
        let order = chain().topological_order().unwrap();
        let names: Vec<_> = order.iter().map(|k| k.1.as_str()).collect();
        assert_eq!(names, vec!["0001_initial", "0002_book_pages", "0003_auto"]);
    }

    #[test]
    fn test_ancestors_stop_at_target() {
        let up_to = chain().ancestors(&key("sqlorm_app", "0002_book_pages")).unwrap();
        assert_eq!(up_to.len(), 2);
        assert!(chain().ancestors(&key("sqlorm_app", "0009_missing")).is_err());
    }

    #[test]
    fn test_leaf_nodes() {
        assert_eq!(chain().leaf_nodes("sqlorm_app"), vec![key("sqlorm_app", "0003_auto")]);
        assert!(chain().leaf_nodes("other").is_empty());
    }

    #[test]
    fn test_unknown_dependency() {
        let mut g = chain();
        let err = g
            .add_dependency(&key("sqlorm_app", "0003_auto"), &key("sqlorm_app", "0000_gone"))
            .unwrap_err();
        assert!(err.to_string().contains("unknown migration sqlorm_app.0000_gone"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = chain();
        g.add_dependency(&key("sqlorm_app", "0001_initial"), &key("sqlorm_app", "0003_auto"))
            .unwrap();
        assert_eq!(g.topological_order().unwrap_err().kind(), "MigrationError");
    }
}
