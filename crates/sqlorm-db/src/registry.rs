//! The model registry.
//!
//! Every non-abstract model registered through
//! [`ModelBuilder::register`](crate::model::ModelBuilder::register) lands in
//! the process-wide [`registry()`], keyed by model name. Schema helpers and
//! the migration autodetector read the models from here. Tests can clear it
//! or build their own [`ModelRegistry`].

use std::sync::{Arc, PoisonError, RwLock};

use crate::model::ModelDefinition;

/// A name-keyed collection of model definitions in registration order.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<Vec<Arc<ModelDefinition>>>,
}

impl ModelRegistry {
    pub const fn new() -> Self {
        Self {
            models: RwLock::new(Vec::new()),
        }
    }

    /// Adds a model, replacing (in place) any model of the same name.
    /// Returns the replaced definition.
    pub fn register(&self, model: Arc<ModelDefinition>) -> Option<Arc<ModelDefinition>> {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = models.iter_mut().find(|m| m.name() == model.name()) {
            return Some(std::mem::replace(slot, model));
        }
        models.push(model);
        None
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDefinition>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Case-insensitive lookup, used for relation names such as `book_set`.
    pub fn get_lowercase(&self, name: &str) -> Option<Arc<ModelDefinition>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// A copy of every registered model.
    pub fn get_all(&self) -> Vec<Arc<ModelDefinition>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<ModelDefinition>> {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let idx = models.iter().position(|m| m.name() == name)?;
        Some(models.remove(idx))
    }

    pub fn clear(&self) {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: ModelRegistry = ModelRegistry::new();

/// The process-wide registry.
pub fn registry() -> &'static ModelRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::model::ModelBuilder;

    fn model(name: &str) -> Arc<ModelDefinition> {
        ModelBuilder::new(name)
            .field("title", fields::char_field(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let reg = ModelRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.register(model("Note")).is_none());
        assert!(reg.contains("Note"));
        assert_eq!(reg.get("Note").unwrap().name(), "Note");
        assert!(reg.get_lowercase("note").is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let reg = ModelRegistry::new();
        reg.register(model("Note"));
        reg.register(model("Tag"));
        let replaced = reg.register(model("Note"));
        assert!(replaced.is_some());
        let names: Vec<String> = reg.get_all().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["Note", "Tag"]);
    }

    #[test]
    fn test_get_all_is_a_copy() {
        let reg = ModelRegistry::new();
        reg.register(model("Note"));
        let snapshot = reg.get_all();
        reg.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_unregister() {
        let reg = ModelRegistry::new();
        reg.register(model("Note"));
        assert!(reg.unregister("Note").is_some());
        assert!(reg.unregister("Note").is_none());
    }
}
