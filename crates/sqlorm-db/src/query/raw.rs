//! Raw SQL.
//!
//! [`RawQuerySet`] maps the rows of a hand-written SELECT onto model
//! instances, like `Model.objects.raw()`. [`RawSql`] runs any statement and
//! returns plain rows, the equivalent of `cursor.execute()`.
//!
//! Values must be passed as parameters (`?` on SQLite, `$n` on PostgreSQL),
//! never interpolated into the SQL text.

use std::collections::HashMap;
use std::sync::Arc;

use sqlorm_core::error::SqlormResult;

use crate::executor::DbExecutor;
use crate::instance::Instance;
use crate::model::ModelDefinition;
use crate::query::compiler::Row;
use crate::value::Value;

/// A raw SELECT whose rows become instances of `model`. Columns that are
/// not fields become annotations.
#[derive(Debug, Clone)]
pub struct RawQuerySet {
    model: Arc<ModelDefinition>,
    sql: String,
    params: Vec<Value>,
    /// `(sql column, field name)` pairs.
    translations: Vec<(String, String)>,
}

impl RawQuerySet {
    pub fn new(model: Arc<ModelDefinition>, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            model,
            sql: sql.into(),
            params,
            translations: Vec::new(),
        }
    }

    /// Maps result columns to field names when they differ.
    #[must_use]
    pub fn translate(mut self, translations: &[(&str, &str)]) -> Self {
        self.translations = translations
            .iter()
            .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
            .collect();
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub async fn execute(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<Instance>> {
        let rows = db.query(&self.sql, &self.params).await?;
        Ok(rows.iter().map(|row| self.model.from_row(&self.translate_row(row))).collect())
    }

    pub async fn first(&self, db: &dyn DbExecutor) -> SqlormResult<Option<Instance>> {
        let rows = db.query(&self.sql, &self.params).await?;
        Ok(rows
            .first()
            .map(|row| self.model.from_row(&self.translate_row(row))))
    }

    fn translate_row(&self, row: &Row) -> Row {
        if self.translations.is_empty() {
            return row.clone();
        }
        let columns = row
            .columns()
            .iter()
            .map(|col| {
                self.translations
                    .iter()
                    .find(|(from, _)| from == col)
                    .map_or_else(|| col.clone(), |(_, to)| to.clone())
            })
            .collect();
        Row::new(columns, row.values().to_vec())
    }
}

/// A statement executed as written.
#[derive(Debug, Clone)]
pub struct RawSql {
    sql: String,
    params: Vec<Value>,
}

impl RawSql {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub async fn fetch_all(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<Row>> {
        db.query(&self.sql, &self.params).await
    }

    pub async fn fetch_one(&self, db: &dyn DbExecutor) -> SqlormResult<Option<Row>> {
        Ok(db.query(&self.sql, &self.params).await?.into_iter().next())
    }

    /// Rows as column-name maps.
    pub async fn fetch_dicts(&self, db: &dyn DbExecutor) -> SqlormResult<Vec<HashMap<String, Value>>> {
        let rows = self.fetch_all(db).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let columns = row.columns().to_vec();
                columns.into_iter().zip(row.into_values()).collect()
            })
            .collect())
    }

    /// Runs an INSERT, UPDATE, DELETE or DDL statement. Returns the rows affected.
    pub async fn execute(&self, db: &dyn DbExecutor) -> SqlormResult<u64> {
        db.execute_sql(&self.sql, &self.params).await
    }
}
