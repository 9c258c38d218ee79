//! Connections, raw SQL and transactions by database alias.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_db::model::ModelDefinition;
use sqlorm_db::query::QuerySet;
use sqlorm_db::transactions::{self, TransactionManager};
use sqlorm_db::{router, Row, SqlCompiler, Value};
use sqlorm_db_backends::{connections, ColumnInfo, DatabaseBackend};

use crate::conf;

/// The future a [`transaction`] block returns.
pub type TransactionFuture<'t, T> = Pin<Box<dyn Future<Output = SqlormResult<T>> + 't>>;

fn wrap(context: &'static str) -> impl FnOnce(SqlormError) -> SqlormError {
    move |e| SqlormError::ConnectionError(format!("{context}: {e}"))
}

/// The open connection for `alias`, opened on first use.
pub async fn get_connection(alias: &str) -> SqlormResult<Arc<dyn DatabaseBackend>> {
    connections().get(alias).await
}

/// Closes the connection for `alias` if one is open.
pub async fn close_connection(alias: &str) -> SqlormResult<()> {
    connections()
        .close(alias)
        .await
        .map(|_| ())
        .map_err(wrap("Failed to close connection"))
}

pub async fn close_all_connections() -> SqlormResult<()> {
    connections()
        .close_all()
        .await
        .map_err(wrap("Failed to close connections"))
}

/// The connection reads of `queryset` go to.
pub async fn connection_for_read(queryset: &QuerySet) -> SqlormResult<Arc<dyn DatabaseBackend>> {
    get_connection(&queryset.read_alias()).await
}

/// The connection writes to `model` go to, `using` taking precedence.
pub async fn connection_for_write(
    model: &ModelDefinition,
    using: Option<&str>,
) -> SqlormResult<Arc<dyn DatabaseBackend>> {
    get_connection(&router::db_for_write(model, using)).await
}

/// Rewrites `%s` parameter markers into the backend's placeholders. `%%`
/// stands for a literal `%`.
fn translate_placeholders(sql: &str, compiler: &SqlCompiler) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut index = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('%', Some('s')) => {
                chars.next();
                index += 1;
                out.push_str(&compiler.placeholder(index));
            }
            ('%', Some('%')) => {
                chars.next();
                out.push('%');
            }
            _ => out.push(c),
        }
    }
    out
}

async fn raw_rows(sql: &str, params: &[Value], alias: &str) -> SqlormResult<Vec<Row>> {
    let db = get_connection(alias).await?;
    let sql = translate_placeholders(sql, &db.compiler());
    db.query(&sql, params).await
}

/// Runs raw SQL on `alias`. Parameters are bound to `%s` markers (or the
/// backend's native `?`/`$n`). With `fetch`, returns the rows as value
/// lists; without, returns `None`.
pub async fn execute_raw_sql(
    sql: &str,
    params: &[Value],
    alias: &str,
    fetch: bool,
) -> SqlormResult<Option<Vec<Vec<Value>>>> {
    const CONTEXT: &str = "Failed to execute SQL";
    if fetch {
        let rows = raw_rows(sql, params, alias).await.map_err(wrap(CONTEXT))?;
        return Ok(Some(rows.into_iter().map(Row::into_values).collect()));
    }
    let db = get_connection(alias).await.map_err(wrap(CONTEXT))?;
    let sql = translate_placeholders(sql, &db.compiler());
    db.execute(&sql, params).await.map_err(wrap(CONTEXT))?;
    Ok(None)
}

/// Like [`execute_raw_sql`], returning each row as a column → value map.
pub async fn execute_raw_sql_dict(
    sql: &str,
    params: &[Value],
    alias: &str,
) -> SqlormResult<Vec<HashMap<String, Value>>> {
    let rows = raw_rows(sql, params, alias)
        .await
        .map_err(wrap("Failed to execute SQL"))?;
    Ok(rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|(column, value)| (column.to_string(), value.clone()))
                .collect()
        })
        .collect())
}

/// What [`get_database_info`] reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub vendor: String,
    pub version: String,
    pub name: String,
    pub alias: String,
    pub engine: String,
}

async fn database_info(alias: &str) -> SqlormResult<DatabaseInfo> {
    let config = conf::get_database_config(alias)?;
    let db = get_connection(alias).await?;
    Ok(DatabaseInfo {
        vendor: db.vendor().to_string(),
        version: db.version().await?,
        name: config.name,
        alias: alias.to_string(),
        engine: config.engine,
    })
}

pub async fn get_database_info(alias: &str) -> SqlormResult<DatabaseInfo> {
    database_info(alias)
        .await
        .map_err(wrap("Failed to get database info"))
}

pub async fn get_table_names(alias: &str) -> SqlormResult<Vec<String>> {
    const CONTEXT: &str = "Failed to get table names";
    let db = get_connection(alias).await.map_err(wrap(CONTEXT))?;
    db.table_names().await.map_err(wrap(CONTEXT))
}

/// Column details of `table`, empty when the table does not exist.
pub async fn get_table_description(table: &str, alias: &str) -> SqlormResult<Vec<ColumnInfo>> {
    const CONTEXT: &str = "Failed to get table description";
    let db = get_connection(alias).await.map_err(wrap(CONTEXT))?;
    db.table_description(table).await.map_err(wrap(CONTEXT))
}

/// Runs `f` in a transaction on `alias`: committed when it returns `Ok`,
/// rolled back on `Err`.
///
/// The outermost block always opens a transaction, so `savepoint` only
/// shows up in the logs here. Nested blocks go through
/// [`TransactionManager::atomic`], where a savepoint lets an inner failure
/// undo only the inner statements.
///
/// The block has the alias's connection to itself until it ends. Run its
/// statements through `txn`: on SQLite, going back to
/// [`get_connection`] for the same alias inside the block waits for the
/// block to finish.
///
/// ```no_run
/// # async fn demo(author: std::sync::Arc<sqlorm::ModelDefinition>) -> sqlorm::SqlormResult<()> {
/// sqlorm::transaction("default", true, |txn| {
///     Box::pin(async move {
///         author.objects().create_exec(&*txn, &[("name", "Ann".into())]).await?;
///         Ok(())
///     })
/// })
/// .await
/// # }
/// ```
pub async fn transaction<T, F>(alias: &str, savepoint: bool, f: F) -> SqlormResult<T>
where
    F: for<'t> FnOnce(Arc<TransactionManager<'t>>) -> TransactionFuture<'t, T>,
{
    let db = get_connection(alias).await?;
    let session = db.exclusive().await?;
    tracing::debug!(alias, savepoint, "transaction");
    transactions::atomic(&*session, f).await
}
