//! Bulk database operations.
//!
//! `bulk_create` and `bulk_update` batch many instances into few statements;
//! `get_or_create` and `update_or_create` combine a lookup with a write.
//! The [`Manager`](crate::query::queryset::Manager) methods of the same
//! names forward here.

use std::sync::Arc;

use sqlorm_core::error::{SqlormError, SqlormResult};

use crate::executor::DbExecutor;
use crate::instance::Instance;
use crate::model::ModelDefinition;
use crate::query::compiler::{DatabaseBackendType, SqlCompiler, WhereNode};
use crate::query::expressions::Expression;
use crate::query::lookups::{Lookup, Q};
use crate::query::queryset::QuerySet;
use crate::value::Value;

/// Options for `bulk_create`.
#[derive(Debug, Clone, Default)]
pub struct BulkCreateOptions {
    /// Number of rows per INSERT. `None` inserts everything at once.
    pub batch_size: Option<usize>,
    /// Skip rows that violate a unique constraint.
    pub ignore_conflicts: bool,
    /// Upsert: update `update_fields` of conflicting rows.
    pub update_conflicts: bool,
    pub update_fields: Vec<String>,
    /// The conflict target. Field names, converted to columns.
    pub unique_fields: Vec<String>,
}

/// Options for `bulk_update`.
#[derive(Debug, Clone, Default)]
pub struct BulkUpdateOptions {
    pub batch_size: Option<usize>,
}

/// Compiles a multi-row INSERT.
///
/// ```sql
/// INSERT INTO "table" ("a", "b") VALUES ($1, $2), ($3, $4)
///     ON CONFLICT ("a") DO UPDATE SET "b" = EXCLUDED."b"
/// ```
///
/// Every row must list the same columns in the same order.
pub fn compile_bulk_insert(
    table: &str,
    rows: &[Vec<(&str, Value)>],
    options: &BulkCreateOptions,
    backend: DatabaseBackendType,
) -> (String, Vec<Value>) {
    let Some(first) = rows.first() else {
        return (String::new(), Vec::new());
    };
    let compiler = SqlCompiler::new(backend);
    let mut params = Vec::new();

    let col_list = first
        .iter()
        .map(|(name, _)| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("INSERT INTO \"{table}\" ({col_list}) VALUES ");

    let row_strings: Vec<String> = rows
        .iter()
        .map(|row| {
            let placeholders: Vec<String> = row
                .iter()
                .map(|(_, val)| {
                    params.push(val.clone());
                    compiler.placeholder(params.len())
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    sql.push_str(&row_strings.join(", "));

    if options.ignore_conflicts || options.update_conflicts {
        if options.unique_fields.is_empty() {
            sql.push_str(" ON CONFLICT");
        } else {
            let unique_cols = options
                .unique_fields
                .iter()
                .map(|f| format!("\"{f}\""))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ON CONFLICT ({unique_cols})"));
        }

        if options.update_conflicts && !options.update_fields.is_empty() {
            let set_parts = options
                .update_fields
                .iter()
                .map(|f| format!("\"{f}\" = EXCLUDED.\"{f}\""))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" DO UPDATE SET {set_parts}"));
        } else {
            sql.push_str(" DO NOTHING");
        }
    }

    (sql, params)
}

/// Compiles one `UPDATE ... WHERE pk = ?` per object, restricted to `columns`.
pub fn compile_bulk_update(
    table: &str,
    pk_column: &str,
    objects: &[(Value, Vec<(&str, Value)>)],
    columns: &[&str],
    backend: DatabaseBackendType,
) -> Vec<(String, Vec<Value>)> {
    if columns.is_empty() {
        return Vec::new();
    }
    let compiler = SqlCompiler::new(backend);
    objects
        .iter()
        .filter_map(|(pk, values)| {
            let assignments: Vec<(&str, Expression)> = values
                .iter()
                .filter(|(column, _)| columns.contains(column))
                .map(|(column, value)| (*column, Expression::Value(value.clone())))
                .collect();
            if assignments.is_empty() {
                return None;
            }
            let where_clause = WhereNode::column(pk_column, Lookup::Exact(pk.clone()));
            Some(compiler.compile_update(table, &assignments, &where_clause))
        })
        .collect()
}

fn columns_for(model: &ModelDefinition, names: &[String]) -> SqlormResult<Vec<String>> {
    names
        .iter()
        .map(|name| {
            model.field(name).map(|f| f.column.clone()).ok_or_else(|| {
                SqlormError::QueryError(format!(
                    "{} has no field named '{name}'",
                    model.name()
                ))
            })
        })
        .collect()
}

/// Inserts `objects` in batched statements. Returns the rows inserted.
///
/// Primary keys generated by the database are not read back.
pub async fn bulk_create(
    model: &Arc<ModelDefinition>,
    objects: &mut [Instance],
    options: &BulkCreateOptions,
    db: &dyn DbExecutor,
) -> SqlormResult<u64> {
    if objects.is_empty() {
        return Ok(0);
    }
    if let Some(other) = objects.iter().find(|o| o.model().name() != model.name()) {
        return Err(SqlormError::ModelError(format!(
            "bulk_create() expected {} instances, got {}",
            model.name(),
            other.model().name()
        )));
    }
    let options = BulkCreateOptions {
        unique_fields: columns_for(model, &options.unique_fields)?,
        update_fields: columns_for(model, &options.update_fields)?,
        ..options.clone()
    };

    for object in objects.iter_mut() {
        object.full_clean()?;
        object.touch_timestamps();
    }
    let include_pk = objects.iter().all(|o| o.pk().is_some());
    let batch_size = options.batch_size.unwrap_or(objects.len()).max(1);
    let mut inserted = 0u64;

    for chunk in objects.chunks(batch_size) {
        let rows: Vec<Vec<(&str, Value)>> = chunk
            .iter()
            .map(|o| {
                o.all_column_values()
                    .into_iter()
                    .filter(|(column, _)| include_pk || *column != model.pk_field().column)
                    .collect()
            })
            .collect();
        let (sql, params) = compile_bulk_insert(model.table_name(), &rows, &options, db.backend_type());
        inserted += db.execute_sql(&sql, &params).await?;
    }
    tracing::debug!(model = %model.name(), rows = inserted, "bulk_create");
    Ok(inserted)
}

/// Writes `fields` of every object, one UPDATE per object. Every object
/// needs a primary key.
pub async fn bulk_update(
    model: &Arc<ModelDefinition>,
    objects: &[Instance],
    fields: &[&str],
    options: &BulkUpdateOptions,
    db: &dyn DbExecutor,
) -> SqlormResult<u64> {
    if objects.is_empty() {
        return Ok(0);
    }
    if fields.is_empty() {
        return Err(SqlormError::QueryError(
            "Field names must be given to bulk_update().".into(),
        ));
    }
    let names: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
    let columns = columns_for(model, &names)?;
    if model.fields().iter().any(|f| f.primary_key && columns.contains(&f.column)) {
        return Err(SqlormError::QueryError(
            "bulk_update() cannot be used with primary key fields.".into(),
        ));
    }
    let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();

    let mut total = 0u64;
    let batch_size = options.batch_size.unwrap_or(objects.len()).max(1);
    for chunk in objects.chunks(batch_size) {
        let pairs: Vec<(Value, Vec<(&str, Value)>)> = chunk
            .iter()
            .map(|o| {
                let pk = o.pk().cloned().ok_or_else(|| {
                    SqlormError::QueryError(
                        "All bulk_update() objects must have a primary key set.".into(),
                    )
                })?;
                Ok((pk, o.all_column_values()))
            })
            .collect::<SqlormResult<_>>()?;
        let statements = compile_bulk_update(
            model.table_name(),
            &model.pk_field().column,
            &pairs,
            &column_refs,
            db.backend_type(),
        );
        for (sql, params) in &statements {
            total += db.execute_sql(sql, params).await?;
        }
    }
    Ok(total)
}

fn lookup_filter(lookup: &[(&str, Value)]) -> Q {
    Q::And(lookup.iter().map(|(key, value)| Q::kw(key, value.clone())).collect())
}

/// Applies plain (non-lookup) keyword arguments to a fresh instance.
fn new_instance(
    queryset: &QuerySet,
    lookup: &[(&str, Value)],
    defaults: &[(&str, Value)],
) -> SqlormResult<Instance> {
    let mut instance = queryset.model().new_instance();
    for (key, value) in lookup.iter().filter(|(key, _)| !key.contains("__")) {
        instance.set(key, value.clone())?;
    }
    for (key, value) in defaults {
        instance.set(key, value.clone())?;
    }
    Ok(instance)
}

/// Fetches the object matching `lookup`, creating it from `lookup` and
/// `defaults` when none exists. Returns `(object, created)`.
pub async fn get_or_create(
    queryset: &QuerySet,
    lookup: &[(&str, Value)],
    defaults: &[(&str, Value)],
    db: &dyn DbExecutor,
) -> SqlormResult<(Instance, bool)> {
    match queryset.clone().filter(lookup_filter(lookup)).get_exec(db).await {
        Ok(found) => Ok((found, false)),
        Err(SqlormError::DoesNotExist(_)) => {
            let mut instance = new_instance(queryset, lookup, defaults)?;
            instance.set_db(queryset.write_alias());
            instance.save(db).await?;
            Ok((instance, true))
        }
        Err(e) => Err(e),
    }
}

/// Updates the object matching `lookup` with `defaults`, creating it when
/// none exists. Returns `(object, created)`.
pub async fn update_or_create(
    queryset: &QuerySet,
    lookup: &[(&str, Value)],
    defaults: &[(&str, Value)],
    db: &dyn DbExecutor,
) -> SqlormResult<(Instance, bool)> {
    match queryset.clone().filter(lookup_filter(lookup)).get_exec(db).await {
        Ok(mut found) => {
            for (key, value) in defaults {
                found.set(key, value.clone())?;
            }
            found.save(db).await?;
            Ok((found, false))
        }
        Err(SqlormError::DoesNotExist(_)) => {
            let mut instance = new_instance(queryset, lookup, defaults)?;
            instance.set_db(queryset.write_alias());
            instance.save(db).await?;
            Ok((instance, true))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::model::ModelBuilder;
    use crate::query::compiler::Row;
    use crate::test_utils::MockDb;

    fn item() -> Arc<ModelDefinition> {
        ModelBuilder::new("BulkItem")
            .field("name", fields::char_field(100).unique())
            .field("price", fields::integer_field().default(0))
            .build()
            .unwrap()
    }

    fn item_row(id: i64, name: &str, price: i64) -> Row {
        Row::new(
            vec!["id".into(), "name".into(), "price".into()],
            vec![Value::Int(id), Value::from(name), Value::Int(price)],
        )
    }

    #[test]
    fn test_bulk_insert_pg_basic() {
        let rows = vec![
            vec![("name", Value::from("Alice")), ("price", Value::from(10))],
            vec![("name", Value::from("Bob")), ("price", Value::from(20))],
        ];
        let (sql, params) = compile_bulk_insert(
            "test_item",
            &rows,
            &BulkCreateOptions::default(),
            DatabaseBackendType::PostgreSQL,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"test_item\" (\"name\", \"price\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_bulk_insert_sqlite_basic() {
        let rows = vec![vec![("name", Value::from("Alice"))]];
        let (sql, _) = compile_bulk_insert(
            "test_item",
            &rows,
            &BulkCreateOptions::default(),
            DatabaseBackendType::SQLite,
        );
        assert_eq!(sql, "INSERT INTO \"test_item\" (\"name\") VALUES (?)");
    }

    #[test]
    fn test_bulk_insert_empty() {
        let (sql, params) = compile_bulk_insert(
            "test_item",
            &[],
            &BulkCreateOptions::default(),
            DatabaseBackendType::SQLite,
        );
        assert!(sql.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn test_bulk_insert_conflicts() {
        let rows = vec![vec![("name", Value::from("A")), ("price", Value::from(1))]];
        let ignore = BulkCreateOptions {
            ignore_conflicts: true,
            ..Default::default()
        };
        let (sql, _) = compile_bulk_insert("t", &rows, &ignore, DatabaseBackendType::SQLite);
        assert!(sql.ends_with(" ON CONFLICT DO NOTHING"));

        let upsert = BulkCreateOptions {
            update_conflicts: true,
            unique_fields: vec!["name".into()],
            update_fields: vec!["price".into()],
            ..Default::default()
        };
        let (sql, _) = compile_bulk_insert("t", &rows, &upsert, DatabaseBackendType::PostgreSQL);
        assert!(sql.ends_with(" ON CONFLICT (\"name\") DO UPDATE SET \"price\" = EXCLUDED.\"price\""));
    }

    #[test]
    fn test_bulk_update_compiles_one_statement_per_object() {
        let objects = vec![
            (Value::Int(1), vec![("name", Value::from("A")), ("price", Value::from(5))]),
            (Value::Int(2), vec![("name", Value::from("B")), ("price", Value::from(6))]),
        ];
        let statements =
            compile_bulk_update("t", "id", &objects, &["price"], DatabaseBackendType::SQLite);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].0, "UPDATE \"t\" SET \"price\" = ? WHERE \"id\" = ?");
        assert_eq!(statements[1].1, vec![Value::Int(6), Value::Int(2)]);
        assert!(compile_bulk_update("t", "id", &objects, &[], DatabaseBackendType::SQLite).is_empty());
    }

    #[tokio::test]
    async fn test_bulk_create_batches() {
        let model = item();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let mut items: Vec<Instance> = ["A", "B", "C"]
            .iter()
            .map(|name| {
                let mut i = model.new_instance();
                i.set("name", *name).unwrap();
                i
            })
            .collect();
        let options = BulkCreateOptions {
            batch_size: Some(2),
            ..Default::default()
        };
        let count = bulk_create(&model, &mut items, &options, &db).await.unwrap();
        assert_eq!(count, 2);
        let stmts = db.statements().await;
        assert_eq!(stmts.len(), 2);
        assert_eq!(
            stmts[0].0,
            "INSERT INTO \"sqlorm_app_bulkitem\" (\"name\", \"price\") VALUES (?, ?), (?, ?)"
        );
    }

    #[tokio::test]
    async fn test_bulk_create_validates() {
        let model = item();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let mut items = vec![model.new_instance()];
        let err = bulk_create(&model, &mut items, &BulkCreateOptions::default(), &db)
            .await
            .unwrap_err();
        assert!(matches!(err, SqlormError::ValidationError(_)));
        assert!(db.statements().await.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_update_requires_pk() {
        let model = item();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let err = bulk_update(
            &model,
            &[model.new_instance()],
            &["price"],
            &BulkUpdateOptions::default(),
            &db,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("must have a primary key"));
        let err = bulk_update(&model, &[model.new_instance()], &["id"], &BulkUpdateOptions::default(), &db)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("primary key fields"));
    }

    #[tokio::test]
    async fn test_get_or_create_existing() {
        let model = item();
        let db = MockDb::with_responses(DatabaseBackendType::SQLite, vec![vec![item_row(1, "Alice", 10)]]);
        let (found, created) = get_or_create(&model.objects().all(), &[("name", Value::from("Alice"))], &[], &db)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(found.pk(), Some(&Value::Int(1)));
        assert_eq!(db.statements().await.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_new() {
        let model = item();
        let db = MockDb::with_responses(DatabaseBackendType::SQLite, vec![vec![]]);
        let (created_obj, created) = get_or_create(
            &model.objects().all(),
            &[("name", Value::from("Bob"))],
            &[("price", Value::from(20))],
            &db,
        )
        .await
        .unwrap();
        assert!(created);
        assert_eq!(created_obj.get("price"), Some(&Value::Int(20)));
        assert_eq!(created_obj.pk(), Some(&Value::Int(1)));
        let stmts = db.statements().await;
        assert!(stmts[0].0.starts_with("SELECT"));
        assert!(stmts[1].0.starts_with("INSERT"));
    }

    #[tokio::test]
    async fn test_update_or_create_existing_updates() {
        let model = item();
        let db = MockDb::with_responses(DatabaseBackendType::SQLite, vec![vec![item_row(3, "Cy", 1)]]);
        let (obj, created) = update_or_create(
            &model.objects().all(),
            &[("name", Value::from("Cy"))],
            &[("price", Value::from(9))],
            &db,
        )
        .await
        .unwrap();
        assert!(!created);
        assert_eq!(obj.get("price"), Some(&Value::Int(9)));
        let stmts = db.statements().await;
        assert!(stmts[1].0.starts_with("UPDATE \"sqlorm_app_bulkitem\" SET"));
    }
}
