//! PostgreSQL backend on `tokio-postgres` with a `deadpool-postgres` pool.
//!
//! Statements normally take any pooled client. Between `BEGIN` and
//! `COMMIT`/`ROLLBACK` the backend pins one client so the whole
//! transaction runs on the same session. [`PostgresSession`] holds a client
//! of its own for as long as it lives.

use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_core::settings::DatabaseSettings;
use sqlorm_db::query::compiler::DatabaseBackendType;
use sqlorm_db::value::Value;
use sqlorm_db::{DbExecutor, Row};
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};

use crate::base::{closed_error, ColumnInfo, DatabaseBackend};

type Param = Box<dyn ToSql + Sync + Send>;

pub struct PostgresBackend {
    pool: deadpool_postgres::Pool,
    /// The client holding the open transaction, if any.
    pinned: Mutex<Option<deadpool_postgres::Object>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxControl {
    Begin,
    End,
}

fn tx_control(sql: &str) -> Option<TxControl> {
    let upper = sql.trim().trim_end_matches(';').to_ascii_uppercase();
    if upper == "BEGIN" || upper.starts_with("START TRANSACTION") {
        Some(TxControl::Begin)
    } else if upper == "COMMIT" || upper == "ROLLBACK" {
        Some(TxControl::End)
    } else {
        None
    }
}

fn as_client(obj: &deadpool_postgres::Object) -> &tokio_postgres::Client {
    obj
}

impl PostgresBackend {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self {
            pool,
            pinned: Mutex::new(None),
        }
    }

    /// Builds a pool from an alias configuration. No connection is made
    /// until the first statement.
    pub fn from_settings(settings: &DatabaseSettings) -> SqlormResult<Self> {
        let mut pg_config = deadpool_postgres::Config::new();
        pg_config.dbname = Some(settings.name.clone());
        pg_config.host = (!settings.host.is_empty()).then(|| settings.host.clone());
        pg_config.port = (settings.port != 0).then_some(settings.port);
        pg_config.user = (!settings.user.is_empty()).then(|| settings.user.clone());
        pg_config.password = (!settings.password.is_empty()).then(|| settings.password.clone());
        if let Some(app) = settings.options.get("application_name") {
            pg_config.application_name = Some(app.clone());
        }

        let pool = pg_config
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| SqlormError::ConnectionError(format!("Failed to create pool: {e}")))?;
        tracing::debug!(db = %settings.name, host = %settings.host, "created postgres pool");
        Ok(Self::new(pool))
    }

    fn to_params(params: &[Value]) -> Vec<Param> {
        params
            .iter()
            .map(|v| -> Param {
                match v {
                    Value::Null => Box::new(Option::<String>::None),
                    Value::Bool(b) => Box::new(*b),
                    Value::Int(i) => Box::new(*i),
                    Value::Float(f) => Box::new(*f),
                    Value::String(s) => Box::new(s.clone()),
                    Value::Bytes(b) => Box::new(b.clone()),
                    Value::Date(d) => Box::new(*d),
                    Value::DateTime(dt) => Box::new(*dt),
                    Value::DateTimeTz(dt) => Box::new(*dt),
                    Value::Time(t) => Box::new(*t),
                    Value::Uuid(u) => Box::new(*u),
                    Value::Json(j) => Box::new(j.clone()),
                    Value::List(items) => {
                        Box::new(items.iter().map(ToString::to_string).collect::<Vec<_>>())
                    }
                }
            })
            .collect()
    }

    fn convert_row(pg_row: &tokio_postgres::Row) -> Row {
        let columns: Vec<String> = pg_row.columns().iter().map(|c| c.name().to_string()).collect();
        let values = pg_row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| {
                macro_rules! get {
                    ($t:ty, $wrap:expr) => {
                        pg_row
                            .try_get::<_, Option<$t>>(i)
                            .ok()
                            .flatten()
                            .map_or(Value::Null, $wrap)
                    };
                }
                match *col.type_() {
                    Type::BOOL => get!(bool, Value::Bool),
                    Type::INT2 => get!(i16, |v| Value::Int(i64::from(v))),
                    Type::INT4 => get!(i32, |v| Value::Int(i64::from(v))),
                    Type::INT8 => get!(i64, Value::Int),
                    Type::FLOAT4 => get!(f32, |v| Value::Float(f64::from(v))),
                    Type::FLOAT8 => get!(f64, Value::Float),
                    Type::BYTEA => get!(Vec<u8>, Value::Bytes),
                    Type::UUID => get!(uuid::Uuid, Value::Uuid),
                    Type::DATE => get!(chrono::NaiveDate, Value::Date),
                    Type::TIMESTAMP => get!(chrono::NaiveDateTime, Value::DateTime),
                    Type::TIMESTAMPTZ => get!(chrono::DateTime<chrono::Utc>, Value::DateTimeTz),
                    Type::TIME => get!(chrono::NaiveTime, Value::Time),
                    Type::JSON | Type::JSONB => get!(serde_json::Value, Value::Json),
                    _ => get!(String, Value::String),
                }
            })
            .collect();
        Row::new(columns, values)
    }

    fn db_error(e: &tokio_postgres::Error) -> SqlormError {
        use tokio_postgres::error::SqlState;
        match e.code() {
            Some(code)
                if *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::FOREIGN_KEY_VIOLATION
                    || *code == SqlState::NOT_NULL_VIOLATION
                    || *code == SqlState::CHECK_VIOLATION =>
            {
                SqlormError::IntegrityError(e.to_string())
            }
            Some(code) if *code == SqlState::UNDEFINED_TABLE => {
                SqlormError::OperationalError(e.to_string())
            }
            _ => SqlormError::DatabaseError(e.to_string()),
        }
    }

    async fn pooled(&self) -> SqlormResult<deadpool_postgres::Object> {
        if self.pool.is_closed() {
            return Err(closed_error());
        }
        self.pool
            .get()
            .await
            .map_err(|e| SqlormError::ConnectionError(format!("Pool error: {e}")))
    }

    async fn execute_on(
        client: &tokio_postgres::Client,
        sql: &str,
        params: &[Value],
    ) -> SqlormResult<u64> {
        let owned = Self::to_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        client.execute(sql, &refs).await.map_err(|e| Self::db_error(&e))
    }

    async fn query_on(
        client: &tokio_postgres::Client,
        sql: &str,
        params: &[Value],
    ) -> SqlormResult<Vec<Row>> {
        let owned = Self::to_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = client.query(sql, &refs).await.map_err(|e| Self::db_error(&e))?;
        Ok(rows.iter().map(Self::convert_row).collect())
    }

    async fn run_execute(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        let mut pinned = self.pinned.lock().await;
        let control = tx_control(sql);
        if control == Some(TxControl::Begin) && pinned.is_none() {
            *pinned = Some(self.pooled().await?);
        }
        let pooled;
        let client = match pinned.as_ref() {
            Some(obj) => as_client(obj),
            None => {
                pooled = self.pooled().await?;
                as_client(&pooled)
            }
        };
        let result = Self::execute_on(client, sql, params).await;
        if control == Some(TxControl::End) {
            pinned.take();
        }
        result
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        let pinned = self.pinned.lock().await;
        let pooled;
        let client = match pinned.as_ref() {
            Some(obj) => as_client(obj),
            None => {
                pooled = self.pooled().await?;
                as_client(&pooled)
            }
        };
        Self::query_on(client, sql, params).await
    }
}

#[async_trait::async_trait]
impl DatabaseBackend for PostgresBackend {
    fn vendor(&self) -> &str {
        "postgresql"
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn version(&self) -> SqlormResult<String> {
        let row = DatabaseBackend::query_one(self, "SHOW server_version", &[]).await?;
        row.get_by_index(0)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        self.run_execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        self.run_query(sql, params).await
    }

    /// The INSERT is compiled with `RETURNING <pk>`.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        let rows = self.run_query(sql, params).await?;
        rows.into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .ok_or_else(|| {
                SqlormError::DatabaseError("INSERT ... RETURNING returned no rows".to_string())
            })
    }

    async fn table_names(&self) -> SqlormResult<Vec<String>> {
        let rows = self
            .run_query(
                "SELECT table_name::text AS name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )
            .await?;
        rows.iter().map(|r| r.get::<String>("name")).collect()
    }

    async fn table_description(&self, table: &str) -> SqlormResult<Vec<ColumnInfo>> {
        let rows = self
            .run_query(
                "SELECT c.column_name::text AS name, \
                        c.data_type::text AS data_type, \
                        c.is_nullable::text AS nullable, \
                        c.column_default::text AS dflt, \
                        EXISTS ( \
                            SELECT 1 FROM information_schema.table_constraints tc \
                            JOIN information_schema.key_column_usage k \
                              ON tc.constraint_name = k.constraint_name \
                             AND tc.table_schema = k.table_schema \
                            WHERE tc.table_schema = c.table_schema \
                              AND tc.table_name = c.table_name \
                              AND tc.constraint_type = 'PRIMARY KEY' \
                              AND k.column_name = c.column_name \
                        ) AS pk \
                 FROM information_schema.columns c \
                 WHERE c.table_schema = current_schema() AND c.table_name = $1 \
                 ORDER BY c.ordinal_position",
                &[Value::from(table)],
            )
            .await?;
        rows.iter()
            .map(|r| {
                Ok(ColumnInfo {
                    name: r.get("name")?,
                    data_type: r.get("data_type")?,
                    nullable: r.get::<String>("nullable")? == "YES",
                    default: r.get("dflt")?,
                    primary_key: r.get("pk")?,
                })
            })
            .collect()
    }

    async fn close(&self) -> SqlormResult<()> {
        self.pinned.lock().await.take();
        self.pool.close();
        tracing::debug!("closed postgres pool");
        Ok(())
    }

    fn as_executor(&self) -> &dyn DbExecutor {
        self
    }

    async fn exclusive(&self) -> SqlormResult<Box<dyn DbExecutor>> {
        Ok(Box::new(PostgresSession {
            client: self.pooled().await?,
        }))
    }
}

/// A pooled client kept for one caller until dropped.
pub struct PostgresSession {
    client: deadpool_postgres::Object,
}

#[async_trait::async_trait]
impl DbExecutor for PostgresSession {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        PostgresBackend::execute_on(as_client(&self.client), sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        PostgresBackend::query_on(as_client(&self.client), sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        let rows = self.query(sql, params).await?;
        rows.into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .ok_or_else(|| {
                SqlormError::DatabaseError("INSERT ... RETURNING returned no rows".to_string())
            })
    }
}

#[async_trait::async_trait]
impl DbExecutor for PostgresBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        self.run_execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        self.run_query(sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        DatabaseBackend::insert_returning_id(self, sql, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_control_detection() {
        assert_eq!(tx_control("BEGIN"), Some(TxControl::Begin));
        assert_eq!(tx_control(" start transaction isolation level serializable"), Some(TxControl::Begin));
        assert_eq!(tx_control("COMMIT;"), Some(TxControl::End));
        assert_eq!(tx_control("rollback"), Some(TxControl::End));
        assert_eq!(tx_control("ROLLBACK TO SAVEPOINT sp"), None);
        assert_eq!(tx_control("SAVEPOINT sp"), None);
        assert_eq!(tx_control("SELECT 1"), None);
    }

    #[test]
    fn test_param_conversion_count() {
        let params = PostgresBackend::to_params(&[
            Value::Null,
            Value::from(1),
            Value::from("x"),
            Value::List(vec![Value::from(1), Value::from(2)]),
        ]);
        assert_eq!(params.len(), 4);
    }

    #[tokio::test]
    async fn test_pool_is_lazy() {
        let settings = DatabaseSettings::postgres("sqlorm_test", "nobody", "", "127.0.0.1", 1);
        let backend = PostgresBackend::from_settings(&settings).unwrap();
        assert_eq!(backend.vendor(), "postgresql");
        backend.close().await.unwrap();
        let err = backend.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, SqlormError::ConnectionError(_)));
    }
}
