//! The database executor trait.
//!
//! [`DbExecutor`] is the minimal async interface that queryset execution and
//! instance persistence need. Concrete backends in `sqlorm-db-backends`
//! implement it; keeping it here avoids a dependency cycle between the ORM
//! and the drivers.

use sqlorm_core::error::{SqlormError, SqlormResult};

use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

/// Minimal async database executor.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync {
    /// The SQL dialect to compile for.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Runs a statement that returns no rows. Returns the rows affected.
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64>;

    /// Runs a query and returns every row.
    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>>;

    /// Runs a query that must return exactly one row.
    async fn query_one(&self, sql: &str, params: &[Value]) -> SqlormResult<Row> {
        let mut rows = self.query(sql, params).await?;
        match rows.len() {
            0 => Err(SqlormError::DoesNotExist("Query returned no rows".into())),
            1 => Ok(rows.remove(0)),
            n => Err(SqlormError::MultipleObjectsReturned(format!(
                "Query returned {n} rows"
            ))),
        }
    }

    /// Runs an INSERT and returns the generated primary key.
    ///
    /// The default reads `last_insert_rowid()`, which is right for SQLite.
    /// PostgreSQL compiles the INSERT with `RETURNING` and overrides this.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        self.execute_sql(sql, params).await?;
        let row = self.query("SELECT last_insert_rowid() AS id", &[]).await?;
        match row.into_iter().next() {
            Some(r) => r.get::<Value>("id"),
            None => Err(SqlormError::DatabaseError(
                "Failed to retrieve last inserted ID".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records statements and answers queries from a canned row set.
    struct RecordingDb {
        statements: Mutex<Vec<String>>,
        rows: Vec<Row>,
    }

    #[async_trait::async_trait]
    impl DbExecutor for RecordingDb {
        fn backend_type(&self) -> DatabaseBackendType {
            DatabaseBackendType::SQLite
        }

        async fn execute_sql(&self, sql: &str, _params: &[Value]) -> SqlormResult<u64> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(1)
        }

        async fn query(&self, sql: &str, _params: &[Value]) -> SqlormResult<Vec<Row>> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(self.rows.clone())
        }
    }

    fn id_row(id: i64) -> Row {
        Row::new(vec!["id".into()], vec![Value::Int(id)])
    }

    #[tokio::test]
    async fn test_insert_returning_id_reads_last_rowid() {
        let db = RecordingDb {
            statements: Mutex::new(Vec::new()),
            rows: vec![id_row(42)],
        };
        let id = db
            .insert_returning_id("INSERT INTO t DEFAULT VALUES", &[])
            .await
            .unwrap();
        assert_eq!(id, Value::Int(42));
        let statements = db.statements.lock().unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[1].contains("last_insert_rowid"));
    }

    #[tokio::test]
    async fn test_query_one_counts_rows() {
        let empty = RecordingDb {
            statements: Mutex::new(Vec::new()),
            rows: vec![],
        };
        assert!(matches!(
            empty.query_one("SELECT 1", &[]).await,
            Err(SqlormError::DoesNotExist(_))
        ));

        let two = RecordingDb {
            statements: Mutex::new(Vec::new()),
            rows: vec![id_row(1), id_row(2)],
        };
        assert!(matches!(
            two.query_one("SELECT 1", &[]).await,
            Err(SqlormError::MultipleObjectsReturned(_))
        ));
    }
}
