//! Application registry.
//!
//! The engine's migration tooling groups models by application. Models
//! declared through sqlorm do not live in a real application, so they are all
//! attributed to [`SqlormApp`] (label `sqlorm_app`), which [`setup`]
//! registers once per process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::error::{SqlormError, SqlormResult};

/// Label of the application every sqlorm model belongs to.
pub const SQLORM_APP_LABEL: &str = "sqlorm_app";

/// Configuration for an installed application.
///
/// # Examples
///
/// ```
/// use sqlorm_core::apps::AppConfig;
///
/// struct Reports;
///
/// impl AppConfig for Reports {
///     fn name(&self) -> &str { "scripts.reports" }
/// }
///
/// assert_eq!(Reports.label(), "reports");
/// ```
pub trait AppConfig: Send + Sync {
    /// The dotted path of the application.
    fn name(&self) -> &str;

    /// A short label, by default the last component of the name.
    fn label(&self) -> &str {
        self.name().rsplit('.').next().unwrap_or_else(|| self.name())
    }

    /// A human-readable name.
    fn verbose_name(&self) -> &str {
        self.name()
    }

    /// Called once after all apps have been registered.
    fn ready(&self) {}
}

/// The application that owns every dynamically declared model.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlormApp;

impl AppConfig for SqlormApp {
    fn name(&self) -> &str {
        "sqlorm.app"
    }

    fn label(&self) -> &str {
        SQLORM_APP_LABEL
    }

    fn verbose_name(&self) -> &str {
        "SQLORM Models"
    }

    fn ready(&self) {
        tracing::debug!(label = SQLORM_APP_LABEL, "sqlorm application ready");
    }
}

/// The registry of installed applications.
pub struct AppRegistry {
    apps: Vec<Box<dyn AppConfig>>,
    app_labels: HashMap<String, usize>,
    ready: bool,
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AppRegistry {
    /// Creates a new, empty `AppRegistry`.
    pub fn new() -> Self {
        Self {
            apps: Vec::new(),
            app_labels: HashMap::new(),
            ready: false,
        }
    }

    /// Registers an application. Labels must be unique and the registry must
    /// not be populated yet.
    pub fn register(&mut self, app: Box<dyn AppConfig>) -> SqlormResult<()> {
        if self.ready {
            return Err(SqlormError::ConfigurationError(
                "Cannot register apps after the registry has been populated".to_string(),
            ));
        }

        let label = app.label().to_string();
        if self.app_labels.contains_key(&label) {
            return Err(SqlormError::ConfigurationError(format!(
                "Application with label '{label}' is already registered"
            )));
        }

        self.app_labels.insert(label, self.apps.len());
        self.apps.push(app);
        Ok(())
    }

    /// Returns the configuration for the app with the given label.
    pub fn get_app_config(&self, label: &str) -> Option<&dyn AppConfig> {
        self.app_labels
            .get(label)
            .and_then(|&idx| self.apps.get(idx))
            .map(AsRef::as_ref)
    }

    pub fn get_app_configs(&self) -> &[Box<dyn AppConfig>] {
        &self.apps
    }

    /// Calls `ready()` on each app in registration order. Populating twice
    /// is a no-op.
    pub fn populate(&mut self) {
        if self.ready {
            return;
        }
        for app in &self.apps {
            app.ready();
        }
        self.ready = true;
    }

    pub const fn is_ready(&self) -> bool {
        self.ready
    }
}

static APPS: Lazy<Mutex<AppRegistry>> = Lazy::new(|| Mutex::new(AppRegistry::new()));

/// One-time process initialization: registers [`SqlormApp`] and populates
/// the global registry. Safe to call repeatedly.
pub fn setup() -> SqlormResult<()> {
    let mut apps = APPS.lock().unwrap_or_else(PoisonError::into_inner);
    if apps.is_ready() {
        return Ok(());
    }
    apps.register(Box::new(SqlormApp))?;
    apps.populate();
    Ok(())
}

/// Returns `true` once [`setup`] has run.
pub fn is_setup() -> bool {
    APPS.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_ready()
}

/// Returns the verbose name of an installed app, if any.
pub fn installed_app_verbose_name(label: &str) -> Option<String> {
    APPS.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_app_config(label)
        .map(|app| app.verbose_name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestApp {
        app_name: String,
        ready_called: Arc<AtomicBool>,
    }

    impl TestApp {
        fn new(name: &str, ready_called: Arc<AtomicBool>) -> Self {
            Self {
                app_name: name.to_string(),
                ready_called,
            }
        }
    }

    impl AppConfig for TestApp {
        fn name(&self) -> &str {
            &self.app_name
        }

        fn ready(&self) {
            self.ready_called.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sqlorm_app_identity() {
        let app = SqlormApp;
        assert_eq!(app.label(), "sqlorm_app");
        assert_eq!(app.name(), "sqlorm.app");
        assert_eq!(app.verbose_name(), "SQLORM Models");
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = AppRegistry::new();
        let ready = Arc::new(AtomicBool::new(false));
        registry
            .register(Box::new(TestApp::new("scripts.reports", ready)))
            .unwrap();

        let app = registry.get_app_config("reports").expect("app should exist");
        assert_eq!(app.name(), "scripts.reports");
        assert_eq!(registry.get_app_configs().len(), 1);
    }

    #[test]
    fn test_populate_calls_ready_once() {
        let mut registry = AppRegistry::new();
        let ready = Arc::new(AtomicBool::new(false));
        registry
            .register(Box::new(TestApp::new("reports", ready.clone())))
            .unwrap();

        assert!(!registry.is_ready());
        registry.populate();
        assert!(registry.is_ready());
        assert!(ready.load(Ordering::SeqCst));

        ready.store(false, Ordering::SeqCst);
        registry.populate();
        assert!(!ready.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut registry = AppRegistry::new();
        registry.register(Box::new(SqlormApp)).unwrap();
        let err = registry.register(Box::new(SqlormApp)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_register_after_populate_rejected() {
        let mut registry = AppRegistry::new();
        registry.populate();
        assert!(registry.register(Box::new(SqlormApp)).is_err());
    }

    #[test]
    fn test_global_setup_is_idempotent() {
        setup().unwrap();
        setup().unwrap();
        assert!(is_setup());
        assert_eq!(
            installed_app_verbose_name(SQLORM_APP_LABEL).as_deref(),
            Some("SQLORM Models")
        );
    }
}
