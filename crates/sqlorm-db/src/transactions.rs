//! Transactions: atomic blocks, savepoints and on-commit callbacks.
//!
//! [`atomic()`] opens a transaction on an executor, runs a closure and
//! commits when it returns `Ok` or rolls back on `Err`. Inside the block,
//! [`TransactionManager::atomic`] nests: with `savepoint = true` the inner
//! block gets its own `SAVEPOINT`, so a failure there only undoes the inner
//! work.
//!
//! ```ignore
//! use sqlorm_db::transactions::atomic;
//!
//! atomic(&db, |txn| async move {
//!     txn.execute_sql("INSERT INTO ledger (amount) VALUES (?)", &[10.into()]).await?;
//!     let inner = txn
//!         .atomic(true, |sp| async move {
//!             sp.execute_sql("INSERT INTO ledger (amount) VALUES (?)", &[(-99).into()]).await?;
//!             Err::<(), _>(SqlormError::ValidationError("overdrawn".into()))
//!         })
//!         .await;
//!     assert!(inner.is_err());
//!     Ok(())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlorm_core::error::{SqlormError, SqlormResult};
use tokio::sync::Mutex;

use crate::executor::DbExecutor;
use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Standard SQL isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// PostgreSQL default.
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// The statement that applies this level on `backend`. SQLite only knows
    /// the `read_uncommitted` pragma.
    pub fn set_sql(&self, backend: DatabaseBackendType) -> String {
        match backend {
            DatabaseBackendType::SQLite => match self {
                Self::ReadUncommitted => "PRAGMA read_uncommitted = 1".to_string(),
                _ => "PRAGMA read_uncommitted = 0".to_string(),
            },
            DatabaseBackendType::PostgreSQL => {
                format!("SET TRANSACTION ISOLATION LEVEL {}", self.as_sql())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Savepoint {
    pub name: String,
    pub released: bool,
    pub rolled_back: bool,
}

impl Savepoint {
    /// A savepoint with a generated, process-unique name.
    pub fn new() -> Self {
        let id = SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::with_name(format!("sqlorm_sp_{id}"))
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            released: false,
            rolled_back: false,
        }
    }
}

impl Default for Savepoint {
    fn default() -> Self {
        Self::new()
    }
}

type OnCommitCallbacks = Vec<Box<dyn FnOnce() + Send + 'static>>;

/// Transaction state for one executor: nesting depth, open savepoints and
/// callbacks waiting for the outermost commit.
///
/// The manager is itself a [`DbExecutor`], so querysets and instances can
/// run inside the transaction by being handed the manager.
pub struct TransactionManager<'a> {
    db: &'a dyn DbExecutor,
    /// 0 = no transaction, 1 = outermost, 2+ = savepoint.
    depth: Arc<Mutex<u32>>,
    savepoints: Arc<Mutex<Vec<Savepoint>>>,
    on_commit_callbacks: Arc<Mutex<OnCommitCallbacks>>,
}

impl<'a> TransactionManager<'a> {
    pub fn new(db: &'a dyn DbExecutor) -> Self {
        Self {
            db,
            depth: Arc::new(Mutex::new(0)),
            savepoints: Arc::new(Mutex::new(Vec::new())),
            on_commit_callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn depth(&self) -> u32 {
        *self.depth.lock().await
    }

    pub async fn in_transaction(&self) -> bool {
        self.depth().await > 0
    }

    pub fn executor(&self) -> &dyn DbExecutor {
        self.db
    }

    /// Opens the transaction, or a savepoint when one is already open.
    pub async fn begin(&self) -> SqlormResult<()> {
        let mut depth = self.depth.lock().await;
        if *depth == 0 {
            self.db.execute_sql("BEGIN", &[]).await?;
        } else {
            self.push_savepoint().await?;
        }
        *depth += 1;
        tracing::debug!(depth = *depth, "transaction begin");
        Ok(())
    }

    pub async fn begin_with_isolation(&self, level: IsolationLevel) -> SqlormResult<()> {
        let mut depth = self.depth.lock().await;
        if *depth == 0 {
            let backend = self.db.backend_type();
            // The SQLite pragma must precede BEGIN; PostgreSQL sets it inside.
            if backend == DatabaseBackendType::SQLite {
                self.db.execute_sql(&level.set_sql(backend), &[]).await?;
                self.db.execute_sql("BEGIN", &[]).await?;
            } else {
                self.db.execute_sql("BEGIN", &[]).await?;
                self.db.execute_sql(&level.set_sql(backend), &[]).await?;
            }
        } else {
            self.push_savepoint().await?;
        }
        *depth += 1;
        Ok(())
    }

    async fn push_savepoint(&self) -> SqlormResult<()> {
        let sp = Savepoint::new();
        self.db
            .execute_sql(&format!("SAVEPOINT {}", sp.name), &[])
            .await?;
        self.savepoints.lock().await.push(sp);
        Ok(())
    }

    /// Commits the transaction, or releases the innermost savepoint.
    /// Callbacks run only after the outermost commit.
    pub async fn commit(&self) -> SqlormResult<()> {
        let mut depth = self.depth.lock().await;
        match *depth {
            0 => {
                return Err(SqlormError::DatabaseError(
                    "Cannot commit: not in a transaction".to_string(),
                ))
            }
            1 => {
                self.db.execute_sql("COMMIT", &[]).await?;
                *depth = 0;
                let callbacks = std::mem::take(&mut *self.on_commit_callbacks.lock().await);
                for cb in callbacks {
                    cb();
                }
            }
            _ => {
                if let Some(mut sp) = self.savepoints.lock().await.pop() {
                    self.db
                        .execute_sql(&format!("RELEASE SAVEPOINT {}", sp.name), &[])
                        .await?;
                    sp.released = true;
                }
                *depth -= 1;
            }
        }
        tracing::debug!(depth = *depth, "transaction commit");
        Ok(())
    }

    /// Rolls back the transaction, or back to the innermost savepoint.
    pub async fn rollback(&self) -> SqlormResult<()> {
        let mut depth = self.depth.lock().await;
        match *depth {
            0 => {
                return Err(SqlormError::DatabaseError(
                    "Cannot rollback: not in a transaction".to_string(),
                ))
            }
            1 => {
                self.db.execute_sql("ROLLBACK", &[]).await?;
                *depth = 0;
                self.on_commit_callbacks.lock().await.clear();
            }
            _ => {
                if let Some(mut sp) = self.savepoints.lock().await.pop() {
                    self.db
                        .execute_sql(&format!("ROLLBACK TO SAVEPOINT {}", sp.name), &[])
                        .await?;
                    sp.rolled_back = true;
                }
                *depth -= 1;
            }
        }
        tracing::debug!(depth = *depth, "transaction rollback");
        Ok(())
    }

    pub async fn create_savepoint(&self, name: impl Into<String>) -> SqlormResult<Savepoint> {
        if *self.depth.lock().await == 0 {
            return Err(SqlormError::DatabaseError(
                "Cannot create savepoint: not in a transaction".to_string(),
            ));
        }
        let sp = Savepoint::with_name(name);
        self.db
            .execute_sql(&format!("SAVEPOINT {}", sp.name), &[])
            .await?;
        self.savepoints.lock().await.push(sp.clone());
        Ok(sp)
    }

    pub async fn release_savepoint(&self, name: &str) -> SqlormResult<()> {
        self.db
            .execute_sql(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await?;
        let mut savepoints = self.savepoints.lock().await;
        if let Some(sp) = savepoints.iter_mut().find(|s| s.name == name) {
            sp.released = true;
        }
        Ok(())
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> SqlormResult<()> {
        self.db
            .execute_sql(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        let mut savepoints = self.savepoints.lock().await;
        if let Some(sp) = savepoints.iter_mut().find(|s| s.name == name) {
            sp.rolled_back = true;
        }
        Ok(())
    }

    /// Runs `callback` after the outermost commit, or right away when no
    /// transaction is open. Dropped on rollback.
    pub async fn on_commit<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let depth = self.depth.lock().await;
        if *depth == 0 {
            drop(depth);
            callback();
        } else {
            self.on_commit_callbacks.lock().await.push(Box::new(callback));
        }
    }

    pub async fn pending_callbacks(&self) -> usize {
        self.on_commit_callbacks.lock().await.len()
    }

    /// A nested atomic block. With `savepoint` the block is wrapped in a
    /// savepoint and an `Err` undoes only its own statements; without it
    /// the block simply joins the enclosing transaction.
    pub async fn atomic<F, Fut, T>(self: &Arc<Self>, savepoint: bool, f: F) -> SqlormResult<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = SqlormResult<T>>,
    {
        if !savepoint {
            return f(Arc::clone(self)).await;
        }
        self.begin().await?;
        match f(Arc::clone(self)).await {
            Ok(result) => {
                self.commit().await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback to savepoint failed");
                }
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl DbExecutor for TransactionManager<'_> {
    fn backend_type(&self) -> DatabaseBackendType {
        self.db.backend_type()
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> SqlormResult<u64> {
        self.db.execute_sql(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SqlormResult<Vec<Row>> {
        self.db.query(sql, params).await
    }

    async fn query_one(&self, sql: &str, params: &[Value]) -> SqlormResult<Row> {
        self.db.query_one(sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> SqlormResult<Value> {
        self.db.insert_returning_id(sql, params).await
    }
}

async fn run_atomic<'a, F, Fut, T>(txn: Arc<TransactionManager<'a>>, f: F) -> SqlormResult<T>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: Future<Output = SqlormResult<T>>,
{
    match f(Arc::clone(&txn)).await {
        Ok(result) => {
            txn.commit().await?;
            Ok(result)
        }
        Err(e) => {
            // The closure's error wins over a failed rollback.
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

/// Runs `f` in a transaction on `db`: commit on `Ok`, rollback on `Err`.
pub async fn atomic<'a, F, Fut, T>(db: &'a dyn DbExecutor, f: F) -> SqlormResult<T>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: Future<Output = SqlormResult<T>>,
{
    let txn = Arc::new(TransactionManager::new(db));
    txn.begin().await?;
    run_atomic(txn, f).await
}

/// [`atomic()`] with an explicit isolation level.
pub async fn atomic_with_isolation<'a, F, Fut, T>(
    db: &'a dyn DbExecutor,
    level: IsolationLevel,
    f: F,
) -> SqlormResult<T>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: Future<Output = SqlormResult<T>>,
{
    let txn = Arc::new(TransactionManager::new(db));
    txn.begin_with_isolation(level).await?;
    run_atomic(txn, f).await
}
