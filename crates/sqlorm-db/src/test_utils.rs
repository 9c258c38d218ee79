//! A scripted executor for unit tests.

use sqlorm_core::error::SqlormResult;
use tokio::sync::Mutex;

use crate::executor::DbExecutor;
use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

/// Records every statement. Queries answer from `responses` in order, then
/// with no rows; `insert_returning_id` counts up from 1.
pub(crate) struct MockDb {
    backend: DatabaseBackendType,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    responses: Mutex<Vec<Vec<Row>>>,
    next_id: Mutex<i64>,
}

impl MockDb {
    pub fn new(backend: DatabaseBackendType) -> Self {
        Self::with_responses(backend, Vec::new())
    }

    pub fn with_responses(backend: DatabaseBackendType, responses: Vec<Vec<Row>>) -> Self {
        Self {
            backend,
            statements: Mutex::new(Vec::new()),
            responses: Mutex::new(responses),
            next_id: Mutex::new(1),
        }
    }

    pub async fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.statements.lock().await.clone()
    }

    async fn record(&self, sql: &str, params: &[Value]) {
        self.statements
            .lock()
            .await
            .push((sql.to_string(), params.to_vec()));
    }
}

#[async_trait::async_trait]
impl DbExecutor for MockDb {
    fn backend_type(&self) -> DatabaseBackendType {
        self.backend
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        self.record(sql, params).await;
        Ok(1)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        self.record(sql, params).await;
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        self.record(sql, params).await;
        let mut id = self.next_id.lock().await;
        let current = *id;
        *id += 1;
        Ok(Value::Int(current))
    }
}
