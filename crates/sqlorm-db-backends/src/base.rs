//! The backend trait, engine selection and introspection types.

use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_core::settings::DatabaseSettings;
use sqlorm_db::query::compiler::{DatabaseBackendType, SqlCompiler};
use sqlorm_db::value::Value;
use sqlorm_db::{DbExecutor, Row};

/// The database engines a configuration can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Sqlite,
    Postgres,
}

impl Engine {
    /// Parses an engine string. Both the dotted module path
    /// (`django.db.backends.sqlite3`) and the short forms are accepted.
    ///
    /// ```
    /// use sqlorm_db_backends::base::Engine;
    ///
    /// assert_eq!(Engine::parse("django.db.backends.sqlite3").unwrap(), Engine::Sqlite);
    /// assert_eq!(Engine::parse("postgres").unwrap(), Engine::Postgres);
    /// assert!(Engine::parse("oracle").is_err());
    /// ```
    pub fn parse(engine: &str) -> SqlormResult<Self> {
        let short = engine.trim().rsplit('.').next().unwrap_or_default();
        match short.to_ascii_lowercase().as_str() {
            "sqlite3" | "sqlite" => Ok(Self::Sqlite),
            "postgresql" | "postgres" | "postgresql_psycopg2" => Ok(Self::Postgres),
            _ => Err(SqlormError::ConfigurationError(format!(
                "Unsupported database engine: '{engine}'"
            ))),
        }
    }

    pub const fn backend_type(self) -> DatabaseBackendType {
        match self {
            Self::Sqlite => DatabaseBackendType::SQLite,
            Self::Postgres => DatabaseBackendType::PostgreSQL,
        }
    }
}

/// One column as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// The declared type, as the database spells it (`varchar(100)`, `integer`...).
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

/// A live connection to one database.
///
/// Every method is async. `rusqlite` is synchronous, so the SQLite backend
/// runs its statements on the blocking pool.
#[async_trait::async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// `"sqlite"` or `"postgresql"`.
    fn vendor(&self) -> &str;

    fn backend_type(&self) -> DatabaseBackendType;

    /// The server version string.
    async fn version(&self) -> SqlormResult<String>;

    /// Runs a statement that returns no rows. Returns the rows affected.
    async fn execute(&self, sql: &str, params: &[Value]) -> SqlormResult<u64>;

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>>;

    async fn query_one(&self, sql: &str, params: &[Value]) -> SqlormResult<Row> {
        let mut rows = self.query(sql, params).await?;
        match rows.len() {
            0 => Err(SqlormError::DoesNotExist("No rows returned".to_string())),
            1 => Ok(rows.remove(0)),
            n => Err(SqlormError::MultipleObjectsReturned(format!(
                "Expected 1 row, got {n}"
            ))),
        }
    }

    /// Runs an INSERT and returns the generated primary key.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value>;

    async fn begin(&self) -> SqlormResult<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&self) -> SqlormResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&self) -> SqlormResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    /// User tables, sorted by name.
    async fn table_names(&self) -> SqlormResult<Vec<String>>;

    /// The columns of `table` in declaration order. Empty when the table
    /// does not exist.
    async fn table_description(&self, table: &str) -> SqlormResult<Vec<ColumnInfo>>;

    /// Closes the connection. Later calls fail with a `ConnectionError`.
    async fn close(&self) -> SqlormResult<()>;

    /// This backend as the executor querysets and instances run against.
    fn as_executor(&self) -> &dyn DbExecutor;

    /// A connection reserved for the caller until the returned executor is
    /// dropped. Transactions run on one so that nothing else lands inside
    /// them: SQLite callers of this backend wait for the release, and
    /// PostgreSQL hands out a pooled client of its own.
    async fn exclusive(&self) -> SqlormResult<Box<dyn DbExecutor>>;

    fn compiler(&self) -> SqlCompiler {
        SqlCompiler::new(self.backend_type())
    }
}

/// Opens the backend `settings` describe.
pub fn open(settings: &DatabaseSettings) -> SqlormResult<Box<dyn DatabaseBackend>> {
    settings.validate()?;
    match Engine::parse(&settings.engine)? {
        Engine::Sqlite => Ok(Box::new(crate::sqlite::SqliteBackend::open(&settings.name)?)),
        #[cfg(feature = "postgres")]
        Engine::Postgres => Ok(Box::new(crate::postgresql::PostgresBackend::from_settings(
            settings,
        )?)),
        #[cfg(not(feature = "postgres"))]
        Engine::Postgres => Err(SqlormError::ConfigurationError(
            "PostgreSQL support requires the 'postgres' feature of sqlorm-db-backends"
                .to_string(),
        )),
    }
}

pub(crate) fn closed_error() -> SqlormError {
    SqlormError::ConnectionError("Connection is closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_strings() {
        for s in ["django.db.backends.sqlite3", "sqlite3", "sqlite", "SQLite"] {
            assert_eq!(Engine::parse(s).unwrap(), Engine::Sqlite, "{s}");
        }
        for s in ["django.db.backends.postgresql", "postgresql", "postgres"] {
            assert_eq!(Engine::parse(s).unwrap(), Engine::Postgres, "{s}");
        }
        let err = Engine::parse("django.db.backends.mysql").unwrap_err();
        assert!(err.to_string().contains("Unsupported database engine"));
    }

    #[test]
    fn test_engine_backend_type() {
        assert_eq!(Engine::Sqlite.backend_type(), DatabaseBackendType::SQLite);
        assert_eq!(Engine::Postgres.backend_type(), DatabaseBackendType::PostgreSQL);
    }

    #[test]
    fn test_open_validates_settings() {
        let err = open(&DatabaseSettings::default()).err().unwrap();
        assert!(err.to_string().contains("'ENGINE'"));
    }

    #[tokio::test]
    async fn test_open_sqlite_memory() {
        let backend = open(&DatabaseSettings::sqlite(":memory:")).unwrap();
        assert_eq!(backend.vendor(), "sqlite");
        assert_eq!(backend.compiler().placeholder(1), "?");
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn test_postgres_needs_feature() {
        let settings = DatabaseSettings::postgres("app", "u", "p", "localhost", 5432);
        let err = open(&settings).err().unwrap();
        assert!(err.to_string().contains("'postgres' feature"));
    }
}
