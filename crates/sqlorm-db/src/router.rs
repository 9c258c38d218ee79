//! Multi-database routing.
//!
//! Every read and write picks a database alias in this order:
//!
//! 1. the alias passed explicitly (`qs.using("analytics")`);
//! 2. the model's own alias (`_using` on the definition);
//! 3. the first installed [`DatabaseRouter`] that answers;
//! 4. `"default"`.
//!
//! Routers also decide which models schema operations touch on an alias
//! (`allow_migrate`). Without a router a model only lives on its own alias.
//!
//! ```
//! use sqlorm_db::model::{ModelBuilder, ModelDefinition};
//! use sqlorm_db::router::{DatabaseRouter, RouterChain};
//!
//! struct ReadReplicaRouter;
//!
//! impl DatabaseRouter for ReadReplicaRouter {
//!     fn db_for_read(&self, _model: &ModelDefinition) -> Option<String> {
//!         Some("replica".to_string())
//!     }
//! }
//!
//! let article = ModelBuilder::new("Article").build().unwrap();
//! let mut chain = RouterChain::new();
//! chain.add_router(Box::new(ReadReplicaRouter));
//! assert_eq!(chain.db_for_read(&article, None), "replica");
//! assert_eq!(chain.db_for_write(&article, None), "default");
//! ```

use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;

use crate::model::ModelDefinition;

/// Hints about which database a model's queries go to. Each method returns
/// `None` to defer to the next router.
pub trait DatabaseRouter: Send + Sync {
    fn db_for_read(&self, model: &ModelDefinition) -> Option<String> {
        let _ = model;
        None
    }

    fn db_for_write(&self, model: &ModelDefinition) -> Option<String> {
        let _ = model;
        None
    }

    /// Whether a relation between instances of the two models is allowed.
    fn allow_relation(&self, model1: &ModelDefinition, model2: &ModelDefinition) -> Option<bool> {
        let _ = (model1, model2);
        None
    }

    /// Whether the model's table belongs on `db`.
    fn allow_migrate(&self, db: &str, model: &ModelDefinition) -> Option<bool> {
        let _ = (db, model);
        None
    }
}

/// Routers evaluated in insertion order.
#[derive(Default)]
pub struct RouterChain {
    routers: Vec<Box<dyn DatabaseRouter>>,
}

impl RouterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_router(&mut self, router: Box<dyn DatabaseRouter>) {
        self.routers.push(router);
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn db_for_read(&self, model: &ModelDefinition, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| model.using().map(str::to_string))
            .or_else(|| self.routers.iter().find_map(|r| r.db_for_read(model)))
            .unwrap_or_else(|| DEFAULT_DB_ALIAS.to_string())
    }

    pub fn db_for_write(&self, model: &ModelDefinition, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| model.using().map(str::to_string))
            .or_else(|| self.routers.iter().find_map(|r| r.db_for_write(model)))
            .unwrap_or_else(|| DEFAULT_DB_ALIAS.to_string())
    }

    /// `true` when no router objects.
    pub fn allow_relation(&self, model1: &ModelDefinition, model2: &ModelDefinition) -> bool {
        self.routers
            .iter()
            .find_map(|r| r.allow_relation(model1, model2))
            .unwrap_or(true)
    }

    /// Without a deciding router, a model is only migrated on its own alias.
    pub fn allow_migrate(&self, db: &str, model: &ModelDefinition) -> bool {
        self.routers
            .iter()
            .find_map(|r| r.allow_migrate(db, model))
            .unwrap_or_else(|| model.database_alias() == db)
    }
}

static ROUTERS: Lazy<RwLock<RouterChain>> = Lazy::new(|| RwLock::new(RouterChain::new()));

/// Installs a router process-wide, after the ones already installed.
pub fn add_router(router: Box<dyn DatabaseRouter>) {
    ROUTERS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .add_router(router);
}

/// Removes every installed router.
pub fn clear_routers() {
    *ROUTERS.write().unwrap_or_else(PoisonError::into_inner) = RouterChain::new();
}

pub fn db_for_read(model: &ModelDefinition, explicit: Option<&str>) -> String {
    ROUTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .db_for_read(model, explicit)
}

pub fn db_for_write(model: &ModelDefinition, explicit: Option<&str>) -> String {
    ROUTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .db_for_write(model, explicit)
}

pub fn allow_relation(model1: &ModelDefinition, model2: &ModelDefinition) -> bool {
    ROUTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .allow_relation(model1, model2)
}

pub fn allow_migrate(db: &str, model: &ModelDefinition) -> bool {
    ROUTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .allow_migrate(db, model)
}
