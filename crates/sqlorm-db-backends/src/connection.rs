//! Alias-keyed connections.
//!
//! [`ConnectionHandler`] opens one backend per database alias on first use
//! and hands out shared references to it. When the configuration for an
//! alias changes (a script calls `configure` again), the next `get` closes
//! the stale backend and opens a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use sqlorm_core::error::SqlormResult;
use sqlorm_core::settings::{DatabaseSettings, GLOBAL_SETTINGS};
use tokio::sync::Mutex;

use crate::base::{self, DatabaseBackend};

struct Entry {
    settings: DatabaseSettings,
    backend: Arc<dyn DatabaseBackend>,
}

#[derive(Default)]
pub struct ConnectionHandler {
    connections: Mutex<HashMap<String, Entry>>,
}

impl ConnectionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backend for `alias` under the global settings.
    pub async fn get(&self, alias: &str) -> SqlormResult<Arc<dyn DatabaseBackend>> {
        let settings = GLOBAL_SETTINGS.with(|s| s.database(alias).cloned())??;
        self.get_with(alias, &settings).await
    }

    /// The backend for `alias`, (re)opened from `settings` unless the
    /// cached one was opened from identical settings.
    pub async fn get_with(
        &self,
        alias: &str,
        settings: &DatabaseSettings,
    ) -> SqlormResult<Arc<dyn DatabaseBackend>> {
        let mut connections = self.connections.lock().await;
        if let Some(entry) = connections.get(alias) {
            if entry.settings == *settings {
                return Ok(Arc::clone(&entry.backend));
            }
        }
        if let Some(stale) = connections.remove(alias) {
            tracing::debug!(alias, "configuration changed, reopening connection");
            if let Err(e) = stale.backend.close().await {
                tracing::warn!(alias, error = %e, "failed to close stale connection");
            }
        }

        let backend: Arc<dyn DatabaseBackend> = Arc::from(base::open(settings)?);
        tracing::debug!(alias, vendor = backend.vendor(), "opened connection");
        connections.insert(
            alias.to_string(),
            Entry {
                settings: settings.clone(),
                backend: Arc::clone(&backend),
            },
        );
        Ok(backend)
    }

    /// Closes and forgets the connection for `alias`. Returns whether one
    /// was open.
    pub async fn close(&self, alias: &str) -> SqlormResult<bool> {
        let entry = self.connections.lock().await.remove(alias);
        match entry {
            Some(entry) => {
                entry.backend.close().await?;
                tracing::debug!(alias, "closed connection");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn close_all(&self) -> SqlormResult<()> {
        let entries: Vec<(String, Entry)> = self.connections.lock().await.drain().collect();
        for (alias, entry) in entries {
            entry.backend.close().await?;
            tracing::debug!(alias = %alias, "closed connection");
        }
        Ok(())
    }

    /// Aliases with an open connection, sorted.
    pub async fn open_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

static CONNECTIONS: Lazy<ConnectionHandler> = Lazy::new(ConnectionHandler::new);

/// The process-wide connection handler.
pub fn connections() -> &'static ConnectionHandler {
    &CONNECTIONS
}
