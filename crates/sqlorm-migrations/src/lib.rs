//! # sqlorm-migrations
//!
//! Schema management for sqlorm: quick table helpers that work straight from
//! registered models, and a file-based migration engine.
//!
//! ## Architecture
//!
//! - [`Migration`] is a named, ordered list of [`Operation`]s stored as a
//!   JSON file under `<migrations_dir>/sqlorm_app/`.
//! - [`MigrationGraph`] orders migrations by their dependencies.
//! - [`MigrationAutodetector`] diffs two [`ProjectState`]s to produce operations.
//! - [`SchemaEditor`] translates operations into backend-specific DDL.
//! - [`MigrationExecutor`] applies or reverts a plan of migrations and keeps
//!   the `sqlorm_migrations` table up to date.
//!
//! ## Module Overview
//!
//! - [`migration`] - `Migration`, `MigrationGraph`
//! - [`serializer`] - migration file naming, reading and writing
//! - [`loader`] - `MigrationLoader` for filesystem discovery
//! - [`operations`] - the `Operation` enum
//! - [`schema_editor`] - `SchemaEditor` trait and PostgreSQL/SQLite implementations
//! - [`executor`] - `MigrationExecutor`, `MigrationPlan`, `MigrationRecorder`
//! - [`autodetect`] - `MigrationAutodetector`, `ProjectState`, `ModelState`
//! - [`schema`] - table helpers without migration files
//! - [`management`] - `makemigrations`, `migrate`, `showmigrations`, `syncdb`, `inspectdb`

#![allow(clippy::too_many_lines)]
#![allow(clippy::result_large_err)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod autodetect;
pub mod executor;
pub mod loader;
pub mod management;
pub mod migration;
pub mod operations;
pub mod schema;
pub mod schema_editor;
pub mod serializer;

// Re-export key types at the crate root.
pub use autodetect::{MigrationAutodetector, ModelState, ProjectState, StateOptions};
pub use executor::{MigrationExecutor, MigrationPlan, MigrationRecorder, MigrationStep};
pub use loader::MigrationLoader;
pub use management::{inspectdb, makemigrations, migrate, showmigrations, syncdb, MigrateOptions};
pub use migration::{Migration, MigrationGraph, MigrationKey};
pub use operations::Operation;
pub use schema::{ColumnSpec, SchemaDiff};
pub use schema_editor::{editor_for, PostgresSchemaEditor, SchemaEditor, SqliteSchemaEditor};
