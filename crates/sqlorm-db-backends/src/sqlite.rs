//! SQLite backend on `rusqlite`.
//!
//! One connection per backend, behind an async mutex; statements run on
//! tokio's blocking pool. A [`SqliteSession`] keeps the mutex for a whole
//! transaction. File databases use WAL journaling, and foreign
//! keys are enforced. A `REGEXP` function backed by the `regex` crate is
//! registered so `__regex` / `__iregex` lookups work.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::ErrorCode;
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_db::query::compiler::DatabaseBackendType;
use sqlorm_db::value::Value;
use sqlorm_db::{DbExecutor, Row};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::base::{closed_error, ColumnInfo, DatabaseBackend};

const MEMORY: &str = ":memory:";

type ConnGuard = OwnedMutexGuard<Option<rusqlite::Connection>>;

pub struct SqliteBackend {
    path: PathBuf,
    /// `None` once closed.
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
}

impl SqliteBackend {
    /// Opens (creating if needed) the database at `path`; `:memory:` gives a
    /// private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> SqlormResult<Self> {
        let path = path.as_ref().to_path_buf();
        let in_memory = path.to_str() == Some(MEMORY);
        let conn = if in_memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| {
            SqlormError::ConnectionError(format!(
                "Failed to open SQLite database '{}': {e}",
                path.display()
            ))
        })?;

        let pragmas = if in_memory {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
        };
        conn.execute_batch(pragmas)
            .map_err(|e| SqlormError::OperationalError(format!("Failed to set pragmas: {e}")))?;
        register_regexp(&conn)?;

        tracing::debug!(path = %path.display(), "opened sqlite connection");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn memory() -> SqlormResult<Self> {
        Self::open(MEMORY)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> SqlormResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> SqlormResult<T> + Send + 'static,
    {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let (_, result) = run_guarded(guard, f).await?;
        result
    }

    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> SqlormResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => {
                    stmt.raw_bind_parameter(idx, dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
                }
                Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(vals) => {
                    let items: Vec<String> = vals.iter().map(ToString::to_string).collect();
                    stmt.raw_bind_parameter(idx, serde_json::Value::from(items).to_string())
                }
            }
            .map_err(map_error)?;
        }
        Ok(())
    }

    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> Row {
        let values = (0..column_names.len())
            .map(|i| match sqlite_row.get_ref(i).unwrap_or(ValueRef::Null) {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Int(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            })
            .collect();
        Row::new(column_names.to_vec(), values)
    }

    fn run_query(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        let mut stmt = conn.prepare(sql).map_err(map_error)?;
        let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        Self::bind_params(&mut stmt, params)?;
        let mut raw_rows = stmt.raw_query();
        let mut rows = Vec::new();
        while let Some(row) = raw_rows.next().map_err(map_error)? {
            rows.push(Self::convert_row(row, &column_names));
        }
        Ok(rows)
    }

    fn run_execute(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        let mut stmt = conn.prepare(sql).map_err(map_error)?;
        Self::bind_params(&mut stmt, params)?;
        let count = stmt.raw_execute().map_err(map_error)?;
        Ok(count as u64)
    }
}

/// Runs `f` on the blocking pool and hands the guard back with its result.
async fn run_guarded<T, F>(guard: ConnGuard, f: F) -> SqlormResult<(ConnGuard, SqlormResult<T>)>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> SqlormResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = guard.as_ref().ok_or_else(closed_error).and_then(f);
        (guard, result)
    })
    .await
    .map_err(|e| SqlormError::DatabaseError(format!("Task join error: {e}")))
}

/// Sorts rusqlite failures into the error kinds callers match on.
fn map_error(e: rusqlite::Error) -> SqlormError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => SqlormError::IntegrityError(e.to_string()),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            SqlormError::OperationalError(e.to_string())
        }
        _ if e.to_string().contains("no such table") => SqlormError::OperationalError(e.to_string()),
        _ => SqlormError::DatabaseError(e.to_string()),
    }
}

/// `x REGEXP y` calls `regexp(y, x)`. NULL never matches.
fn register_regexp(conn: &rusqlite::Connection) -> SqlormResult<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let text = match ctx.get_raw(1) {
                ValueRef::Null | ValueRef::Blob(_) => return Ok(false),
                ValueRef::Integer(i) => i.to_string(),
                ValueRef::Real(f) => f.to_string(),
                ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
            };
            let re = regex::Regex::new(&pattern)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(re.is_match(&text))
        },
    )
    .map_err(|e| SqlormError::ConnectionError(format!("Failed to register REGEXP: {e}")))
}

#[async_trait::async_trait]
impl DatabaseBackend for SqliteBackend {
    fn vendor(&self) -> &str {
        "sqlite"
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn version(&self) -> SqlormResult<String> {
        let row = DatabaseBackend::query_one(self, "SELECT sqlite_version() AS version", &[]).await?;
        row.get("version")
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| Self::run_execute(conn, &sql, &params))
            .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| Self::run_query(conn, &sql, &params))
            .await
    }

    /// The INSERT and `last_insert_rowid()` run under one lock so another
    /// task cannot insert in between.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            Self::run_execute(conn, &sql, &params)?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
    }

    async fn table_names(&self) -> SqlormResult<Vec<String>> {
        let rows = DatabaseBackend::query(
            self,
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )
        .await?;
        rows.iter().map(|r| r.get::<String>("name")).collect()
    }

    async fn table_description(&self, table: &str) -> SqlormResult<Vec<ColumnInfo>> {
        let sql = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
        let rows = DatabaseBackend::query(self, &sql, &[]).await?;
        rows.iter()
            .map(|r| {
                Ok(ColumnInfo {
                    name: r.get("name")?,
                    data_type: r.get("type")?,
                    nullable: r.get::<i64>("notnull")? == 0,
                    default: r.get("dflt_value")?,
                    primary_key: r.get::<i64>("pk")? > 0,
                })
            })
            .collect()
    }

    async fn close(&self) -> SqlormResult<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| SqlormError::ConnectionError(format!("Failed to close: {e}")))?;
            tracing::debug!(path = %self.path.display(), "closed sqlite connection");
        }
        Ok(())
    }

    fn as_executor(&self) -> &dyn DbExecutor {
        self
    }

    async fn exclusive(&self) -> SqlormResult<Box<dyn DbExecutor>> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        if guard.is_none() {
            return Err(closed_error());
        }
        tracing::trace!(path = %self.path.display(), "sqlite connection reserved");
        Ok(Box::new(SqliteSession {
            guard: Mutex::new(Some(guard)),
        }))
    }
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        DatabaseBackend::execute(self, sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        DatabaseBackend::query(self, sql, params).await
    }

    async fn query_one(&self, sql: &str, params: &[Value]) -> SqlormResult<Row> {
        DatabaseBackend::query_one(self, sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        DatabaseBackend::insert_returning_id(self, sql, params).await
    }
}

/// Sole use of a [`SqliteBackend`]'s connection, from
/// [`DatabaseBackend::exclusive`] until dropped. Statements sent to the
/// backend itself wait until then.
pub struct SqliteSession {
    /// Lent to the blocking pool while a statement runs.
    guard: Mutex<Option<ConnGuard>>,
}

impl SqliteSession {
    async fn with_conn<T, F>(&self, f: F) -> SqlormResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> SqlormResult<T> + Send + 'static,
    {
        let mut slot = self.guard.lock().await;
        let guard = slot.take().ok_or_else(closed_error)?;
        let (guard, result) = run_guarded(guard, f).await?;
        *slot = Some(guard);
        result
    }
}

#[async_trait::async_trait]
impl DbExecutor for SqliteSession {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| SqliteBackend::run_execute(conn, &sql, &params))
            .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| SqliteBackend::run_query(conn, &sql, &params))
            .await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            SqliteBackend::run_execute(conn, &sql, &params)?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
    }
}
