//! End-to-end tests of the migration workflow against SQLite files.
//!
//! Models here are built but never registered, so the process-wide registry
//! stays untouched and every test can run in parallel.

use std::path::Path;
use std::sync::Arc;

use sqlorm_db::fields::{self, OnDelete};
use sqlorm_db::model::{ModelBuilder, ModelDefinition};
use sqlorm_db_backends::{DatabaseBackend, SqliteBackend};
use sqlorm_migrations::schema::{self, ColumnSpec};
use sqlorm_migrations::{
    inspectdb, makemigrations, migrate, showmigrations, syncdb, Migration, MigrateOptions,
    Operation,
};

fn author_v1() -> Arc<ModelDefinition> {
    ModelBuilder::new("ItAuthor")
        .db_table("it_author")
        .field("name", fields::char_field(100))
        .build()
        .unwrap()
}

fn author_v2() -> Arc<ModelDefinition> {
    ModelBuilder::new("ItAuthor")
        .db_table("it_author")
        .field("name", fields::char_field(100))
        .field("age", fields::integer_field().default(0))
        .build()
        .unwrap()
}

fn book() -> Arc<ModelDefinition> {
    ModelBuilder::new("ItBook")
        .db_table("it_book")
        .field("title", fields::char_field(200))
        .field("author", fields::foreign_key("ItAuthor", OnDelete::Cascade))
        .build()
        .unwrap()
}

async fn columns(db: &SqliteBackend, table: &str) -> Vec<String> {
    db.table_description(table)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect()
}

fn names(applied: &[(String, bool)]) -> Vec<(&str, bool)> {
    applied.iter().map(|(n, a)| (n.as_str(), *a)).collect()
}

#[tokio::test]
async fn test_makemigrations_then_migrate() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();

    let path = makemigrations(&migrations, &[book(), author_v1()], None)
        .unwrap()
        .unwrap();
    assert!(path.ends_with("sqlorm_app/0001_initial.json"));

    let initial = Migration::read_from_file(&path).unwrap();
    assert!(initial.initial);
    assert!(initial.dependencies.is_empty());
    let created: Vec<&str> = initial
        .operations
        .iter()
        .filter_map(|op| match op {
            Operation::CreateModel { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec!["ItAuthor", "ItBook"]);

    let applied = migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();
    assert_eq!(applied, vec!["0001_initial"]);
    assert_eq!(columns(&db, "it_author").await, vec!["id", "name"]);
    assert_eq!(columns(&db, "it_book").await, vec!["id", "title", "author_id"]);

    let status = showmigrations(&db, &migrations).await.unwrap();
    assert_eq!(names(&status), vec![("0001_initial", true)]);
}

#[tokio::test]
async fn test_migrate_twice_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();

    makemigrations(&migrations, &[author_v1()], None).unwrap();
    migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();
    let again = migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();
    assert!(again.is_empty());
    assert!(makemigrations(&migrations, &[author_v1()], None).unwrap().is_none());
}

#[tokio::test]
async fn test_added_field_makes_second_migration() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();

    makemigrations(&migrations, &[author_v1()], None).unwrap();
    migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();
    db.execute("INSERT INTO \"it_author\" (\"name\") VALUES ('Ann')", &[])
        .await
        .unwrap();

    let path = makemigrations(&migrations, &[author_v2()], None).unwrap().unwrap();
    assert!(path.ends_with("0002_itauthor_age.json"));
    let second = Migration::read_from_file(&path).unwrap();
    assert_eq!(
        second.dependencies,
        vec![("sqlorm_app".to_string(), "0001_initial".to_string())]
    );

    let status = showmigrations(&db, &migrations).await.unwrap();
    assert_eq!(
        names(&status),
        vec![("0001_initial", true), ("0002_itauthor_age", false)]
    );

    let applied = migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();
    assert_eq!(applied, vec!["0002_itauthor_age"]);
    assert_eq!(columns(&db, "it_author").await, vec!["id", "name", "age"]);
    let row = db
        .query_one("SELECT \"age\" FROM \"it_author\" WHERE \"name\" = 'Ann'", &[])
        .await
        .unwrap();
    assert_eq!(row.get::<i64>("age").unwrap(), 0);
}

#[tokio::test]
async fn test_migrate_back_to_target_and_fake() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();

    makemigrations(&migrations, &[author_v1()], None).unwrap();
    makemigrations(&migrations, &[author_v2()], Some("Author Age")).unwrap();
    migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();

    let back = MigrateOptions {
        target: Some("0001".into()),
        ..MigrateOptions::default()
    };
    let unapplied = migrate(&db, &migrations, &back).await.unwrap();
    assert_eq!(unapplied, vec!["0002_author_age"]);
    assert_eq!(columns(&db, "it_author").await, vec!["id", "name"]);

    let fake = MigrateOptions {
        fake: true,
        ..MigrateOptions::default()
    };
    migrate(&db, &migrations, &fake).await.unwrap();
    let status = showmigrations(&db, &migrations).await.unwrap();
    assert!(status.iter().all(|(_, applied)| *applied));
    assert_eq!(columns(&db, "it_author").await, vec!["id", "name"]);
}

#[tokio::test]
async fn test_syncdb_creates_only_missing_tables() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();

    let created = syncdb(&db, "default", &[book(), author_v1()], 1).await.unwrap();
    assert_eq!(created, vec!["it_author", "it_book"]);
    let again = syncdb(&db, "default", &[book(), author_v1()], 1).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_schema_utilities() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();
    let v1 = author_v1();
    let v2 = author_v2();

    assert!(!schema::table_exists(&db, "it_author").await.unwrap());
    schema::create_table(&db, &v1).await.unwrap();
    assert!(schema::column_exists(&db, "it_author", "name").await.unwrap());

    let diff = schema::get_schema_diff(&db, &v2).await.unwrap();
    assert_eq!(diff.missing_in_db, vec!["age"]);
    assert!(diff.extra_in_db.is_empty());
    assert_eq!(schema::sync_schema(&db, &v2).await.unwrap(), vec!["age"]);
    assert!(schema::get_schema_diff(&db, &v2).await.unwrap().is_empty());

    let spec = ColumnSpec::new("VARCHAR(20)").default("'new'").not_null();
    assert!(schema::safe_add_column(&db, "it_author", "status", &spec).await.unwrap());
    assert!(!schema::safe_add_column(&db, "it_author", "status", &spec).await.unwrap());
    schema::rename_column(&db, "it_author", "status", "state").await.unwrap();
    assert_eq!(
        schema::get_table_columns(&db, "it_author").await.unwrap(),
        vec!["id", "name", "age", "state"]
    );
    let err = schema::rename_column(&db, "it_author", "missing", "other").await.unwrap_err();
    assert_eq!(err.kind(), "OperationalError");

    assert!(schema::drop_table(&db, &v2, false).await.is_err());
    schema::drop_table(&db, &v2, true).await.unwrap();
    assert!(!schema::table_exists(&db, "it_author").await.unwrap());
}

#[tokio::test]
async fn test_migrate_model_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();
    assert!(!schema::migrate_model(&db, &author_v1()).await.unwrap().is_empty());
    assert!(!schema::migrate_model(&db, &author_v2()).await.unwrap().is_empty());
    assert!(schema::migrate_model(&db, &author_v2()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_inspectdb_describes_tables() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    let db = SqliteBackend::open(dir.path().join("db.sqlite3")).unwrap();
    makemigrations(&migrations, &[author_v2()], None).unwrap();
    migrate(&db, &migrations, &MigrateOptions::default()).await.unwrap();

    let output = inspectdb(&db).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
    let models = parsed["models"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"], "ItAuthor");
    assert_eq!(models[0]["_db_table"], "it_author");
    let fields = models[0]["fields"].as_array().unwrap();
    assert_eq!(fields[0]["name"], "name");
    assert_eq!(fields[0]["type"], "CharField");
    assert_eq!(fields[0]["max_length"], 100);
    assert_eq!(fields[1]["type"], "IntegerField");

    let model = sqlorm_db::model::builder_from_value(&models[0]).unwrap().build().unwrap();
    assert_eq!(model.table_name(), "it_author");
    assert!(model.field("age").is_some());
}

fn assert_dir_has(dir: &Path, count: usize) {
    let files = sqlorm_migrations::serializer::migration_files(dir, "sqlorm_app").unwrap();
    assert_eq!(files.len(), count);
}

#[test]
fn test_no_changes_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    assert!(makemigrations(dir.path(), &[], None).unwrap().is_none());
    assert_dir_has(dir.path(), 0);
    makemigrations(dir.path(), &[author_v1()], None).unwrap();
    assert_dir_has(dir.path(), 1);
}
