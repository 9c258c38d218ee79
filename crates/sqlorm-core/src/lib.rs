//! # sqlorm-core
//!
//! Foundation types shared by every sqlorm crate: the error hierarchy,
//! settings and the process-wide configuration slot, configuration-file
//! loading, logging setup, and the application registry that owns every
//! dynamically declared model.
//!
//! ## Modules
//!
//! - [`error`] - [`SqlormError`] and the [`SqlormResult`] alias
//! - [`settings`] - [`Settings`], [`DatabaseSettings`](settings::DatabaseSettings) and [`GLOBAL_SETTINGS`]
//! - [`config_loader`] - Building settings from dictionaries, JSON/TOML files and `SQLORM_*` variables
//! - [`apps`] - The `sqlorm_app` application and process setup
//! - [`logging`] - Tracing subscriber installation

// result_large_err: SqlormError carries ValidationError inline and is used consistently
#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]

pub mod apps;
pub mod config_loader;
pub mod error;
pub mod logging;
pub mod settings;

pub use error::{SqlormError, SqlormResult, ValidationError};
pub use settings::{DatabaseSettings, Settings, GLOBAL_SETTINGS};
