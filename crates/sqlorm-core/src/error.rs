//! Error types shared by every sqlorm crate.
//!
//! [`SqlormError`] is the single base error: configuration problems, model
//! definition mistakes, migration failures, connection failures and query
//! errors are all variants of it, so callers can match one enum to catch
//! everything the library raises.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// A validation failure with optional per-field errors.
///
/// # Examples
///
/// ```
/// use sqlorm_core::error::ValidationError;
///
/// let err = ValidationError::new("This field is required.", "required");
/// assert_eq!(err.to_string(), "This field is required.");
/// ```
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The primary error message.
    pub message: String,
    /// A short code identifying the failure (e.g. "required", "max_length").
    pub code: String,
    /// Additional parameters for the message.
    pub params: HashMap<String, String>,
    /// Per-field validation errors, keyed by field name.
    pub field_errors: HashMap<String, Vec<Self>>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            params: HashMap::new(),
            field_errors: HashMap::new(),
        }
    }

    /// Creates a `ValidationError` containing per-field errors.
    pub fn with_field_errors(field_errors: HashMap<String, Vec<Self>>) -> Self {
        Self {
            message: String::new(),
            code: String::new(),
            params: HashMap::new(),
            field_errors,
        }
    }

    /// Adds a parameter to this validation error.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            return write!(f, "{}", self.message);
        }
        let mut fields: Vec<_> = self.field_errors.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        let mut first = true;
        for (field, errors) in fields {
            for error in errors {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{field}: {error}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        Self::new(message, "invalid")
    }
}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        Self::new(message, "invalid")
    }
}

/// The base error for everything sqlorm raises.
#[derive(Error, Debug)]
pub enum SqlormError {
    // ── Shim-level errors ────────────────────────────────────────────

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A model definition or model operation is invalid.
    #[error("Model error: {0}")]
    ModelError(String),

    /// Creating, loading or applying migrations failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Opening a connection or running SQL through it failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A query could not be built or compiled.
    #[error("Query error: {0}")]
    QueryError(String),

    /// One or more values failed validation.
    #[error("Validation error: {0}")]
    ValidationError(ValidationError),

    // ── Engine-level errors ──────────────────────────────────────────

    /// A query expected exactly one row but found none.
    #[error("{0}")]
    DoesNotExist(String),

    /// A query expected exactly one row but found several.
    #[error("{0}")]
    MultipleObjectsReturned(String),

    /// A generic database driver error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// The database could not perform the operation (locked, missing table, ...).
    #[error("Operational error: {0}")]
    OperationalError(String),

    // ── Serialization / IO ───────────────────────────────────────────

    /// JSON or TOML (de)serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SqlormError {
    /// A stable short name for the error category, used by the CLI when
    /// reporting failures.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationError(_) => "ConfigurationError",
            Self::ModelError(_) => "ModelError",
            Self::MigrationError(_) => "MigrationError",
            Self::ConnectionError(_) => "ConnectionError",
            Self::QueryError(_) => "QueryError",
            Self::ValidationError(_) => "ValidationError",
            Self::DoesNotExist(_) => "DoesNotExist",
            Self::MultipleObjectsReturned(_) => "MultipleObjectsReturned",
            Self::DatabaseError(_) => "DatabaseError",
            Self::IntegrityError(_) => "IntegrityError",
            Self::OperationalError(_) => "OperationalError",
            Self::SerializationError(_) => "SerializationError",
            Self::IoError(_) => "IoError",
        }
    }

    /// Returns `true` for errors reported by the database driver itself.
    pub const fn is_database_error(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::IntegrityError(_) | Self::OperationalError(_)
        )
    }
}

impl From<serde_json::Error> for SqlormError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

/// A convenience alias for `Result<T, SqlormError>`.
pub type SqlormResult<T> = Result<T, SqlormError>;
