//! # sqlorm
//!
//! Models, queries and migrations for scripts, without project
//! scaffolding. Configure a database, declare models with a builder, and
//! run querysets against the connection for the model's alias.
//!
//! ```no_run
//! use sqlorm::fields;
//! use sqlorm::{ConfigureOptions, DatabaseSettings, ModelBuilder, Q};
//!
//! # async fn demo() -> sqlorm::SqlormResult<()> {
//! sqlorm::configure(DatabaseSettings::sqlite("blog.sqlite3"), ConfigureOptions::default())?;
//!
//! let post = ModelBuilder::new("Post")
//!     .field("title", fields::char_field(200))
//!     .field("views", fields::integer_field().default(0))
//!     .register()?;
//! sqlorm::create_all_tables(1).await?;
//!
//! let db = sqlorm::get_connection("default").await?;
//! post.objects()
//!     .create_exec(db.as_executor(), &[("title", "Hello".into())])
//!     .await?;
//! let popular = post
//!     .objects()
//!     .filter(Q::kw("views__gte", 0))
//!     .fetch(db.as_executor())
//!     .await?;
//! assert_eq!(popular.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! This is the facade crate: it re-exports the engine crates and adds the
//! process-wide helpers that resolve connections from the configuration.
//!
//! - [`conf`] - global configuration
//! - [`connection`] - connections, raw SQL, transactions
//! - [`schema`] - table helpers without migration files
//! - [`management`] - `makemigrations`, `migrate` and friends

#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]

use std::collections::HashMap;
use std::sync::Arc;

pub mod conf;
pub mod connection;
pub mod management;
pub mod schema;

/// Errors, settings and logging.
pub use sqlorm_core as core;

/// Fields, models, querysets and transactions.
pub use sqlorm_db as db;

/// SQLite and PostgreSQL connections.
pub use sqlorm_db_backends as db_backends;

/// Schema editor and migration engine.
pub use sqlorm_migrations as migrations;

pub use conf::{
    add_database, configure, configure_databases, configure_from_dict, configure_from_file,
    configure_settings, get_database_aliases, get_database_config, get_migrations_dir,
    get_settings, is_configured, ConfigureOptions,
};
pub use connection::{
    close_all_connections, close_connection, connection_for_read, connection_for_write,
    execute_raw_sql, execute_raw_sql_dict, get_connection, get_database_info,
    get_table_description, get_table_names, transaction, DatabaseInfo, TransactionFuture,
};
pub use management::{inspectdb, makemigrations, migrate, showmigrations, syncdb};
pub use schema::create_all_tables;

pub use sqlorm_core::settings::DEFAULT_DB_ALIAS;
pub use sqlorm_core::{DatabaseSettings, Settings, SqlormError, SqlormResult, ValidationError};
pub use sqlorm_db::fields;
pub use sqlorm_db::query::expressions::functions;
pub use sqlorm_db::query::expressions::{avg, count, count_distinct, max, min, sum};
pub use sqlorm_db::query::Prefetch;
pub use sqlorm_db::{
    AggregateFunc, Exists, Expression, FieldDef, FieldType, Instance, Manager, ModelAttribute,
    ModelBuilder, ModelDefinition, ModelOptions, OnDelete, OuterRef, QuerySet, Subquery, Value,
    When, Q,
};
pub use sqlorm_db_backends::{ColumnInfo, DatabaseBackend};
pub use sqlorm_migrations::{ColumnSpec, MigrateOptions, SchemaDiff};

/// Every registered model keyed by name.
pub fn get_registered_models() -> HashMap<String, Arc<ModelDefinition>> {
    sqlorm_db::registry()
        .get_all()
        .into_iter()
        .map(|model| (model.name().to_string(), model))
        .collect()
}

/// Forgets every registered model.
pub fn clear_registry() {
    sqlorm_db::registry().clear();
    tracing::debug!("model registry cleared");
}
