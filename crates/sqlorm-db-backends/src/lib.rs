//! # sqlorm-db-backends
//!
//! Database drivers for sqlorm. Each backend implements both
//! [`DatabaseBackend`] (connection-level operations and introspection) and
//! `sqlorm_db::DbExecutor` (what querysets and instances run against).
//!
//! - [`sqlite`]: `rusqlite`, always available
//! - [`postgresql`]: `tokio-postgres` + `deadpool-postgres`, behind the
//!   `postgres` feature
//!
//! [`connection::connections()`] keeps one open backend per configured alias.

#![allow(clippy::doc_markdown)]
#![allow(clippy::result_large_err)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::significant_drop_tightening)]

pub mod base;
pub mod connection;
#[cfg(feature = "postgres")]
pub mod postgresql;
pub mod sqlite;

pub use base::{ColumnInfo, DatabaseBackend, Engine};
pub use connection::{connections, ConnectionHandler};
#[cfg(feature = "postgres")]
pub use postgresql::PostgresBackend;
pub use sqlite::SqliteBackend;
