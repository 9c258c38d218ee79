//! Applying migrations to a database.
//!
//! The [`MigrationRecorder`] keeps track of applied migrations in the
//! `sqlorm_migrations` table. The [`MigrationExecutor`] plans which
//! migrations to apply or unapply and runs their DDL, one migration per
//! transaction.
//!
//! An operation only runs on a database the routers allow the model to
//! migrate on. Operations whose model is not registered in this process run
//! on the default database only.

use std::collections::BTreeSet;

use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_db::query::compiler::DatabaseBackendType;
use sqlorm_db::registry::registry;
use sqlorm_db::router;
use sqlorm_db::value::Value;
use sqlorm_db_backends::DatabaseBackend;

use crate::autodetect::ProjectState;
use crate::loader::MigrationLoader;
use crate::migration::{Migration, MigrationKey};
use crate::operations::Operation;
use crate::schema_editor::{editor_for, quote_name, SchemaEditor};

/// One migration to apply or unapply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub migration: MigrationKey,
    pub backwards: bool,
}

impl MigrationStep {
    pub fn forward(key: MigrationKey) -> Self {
        Self {
            migration: key,
            backwards: false,
        }
    }

    pub fn backward(key: MigrationKey) -> Self {
        Self {
            migration: key,
            backwards: true,
        }
    }
}

/// The ordered steps bringing a database to a target.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// The applied migrations of one database.
#[derive(Debug, Clone, Default)]
pub struct MigrationRecorder {
    applied: BTreeSet<MigrationKey>,
}

impl MigrationRecorder {
    pub const TABLE: &'static str = "sqlorm_migrations";

    pub fn schema_sql(backend: DatabaseBackendType) -> String {
        let (id, text) = match backend {
            DatabaseBackendType::SQLite => ("INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT", "VARCHAR(255)"),
            DatabaseBackendType::PostgreSQL => ("BIGSERIAL NOT NULL PRIMARY KEY", "VARCHAR(255)"),
        };
        let applied = match backend {
            DatabaseBackendType::SQLite => "DATETIME",
            DatabaseBackendType::PostgreSQL => "TIMESTAMP",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"id\" {id}, \"app\" {text} NOT NULL, \
             \"name\" {text} NOT NULL, \"applied\" {applied} NOT NULL)",
            quote_name(Self::TABLE)
        )
    }

    /// Creates the table if needed and reads the applied migrations.
    pub async fn load(db: &dyn DatabaseBackend) -> SqlormResult<Self> {
        db.execute(&Self::schema_sql(db.backend_type()), &[]).await?;
        let rows = db
            .query(
                &format!("SELECT \"app\", \"name\" FROM {}", quote_name(Self::TABLE)),
                &[],
            )
            .await?;
        let mut applied = BTreeSet::new();
        for row in &rows {
            applied.insert((row.get::<String>("app")?, row.get::<String>("name")?));
        }
        Ok(Self { applied })
    }

    pub fn is_applied(&self, key: &MigrationKey) -> bool {
        self.applied.contains(key)
    }

    pub fn applied(&self) -> &BTreeSet<MigrationKey> {
        &self.applied
    }

    pub async fn record_applied(&mut self, db: &dyn DatabaseBackend, key: &MigrationKey) -> SqlormResult<()> {
        let compiler = db.compiler();
        let sql = format!(
            "INSERT INTO {} (\"app\", \"name\", \"applied\") VALUES ({}, {}, {})",
            quote_name(Self::TABLE),
            compiler.placeholder(1),
            compiler.placeholder(2),
            compiler.placeholder(3)
        );
        let params = [
            Value::from(key.0.as_str()),
            Value::from(key.1.as_str()),
            Value::DateTime(chrono::Utc::now().naive_utc()),
        ];
        db.execute(&sql, &params).await?;
        self.applied.insert(key.clone());
        Ok(())
    }

    pub async fn record_unapplied(&mut self, db: &dyn DatabaseBackend, key: &MigrationKey) -> SqlormResult<()> {
        let compiler = db.compiler();
        let sql = format!(
            "DELETE FROM {} WHERE \"app\" = {} AND \"name\" = {}",
            quote_name(Self::TABLE),
            compiler.placeholder(1),
            compiler.placeholder(2)
        );
        db.execute(&sql, &[Value::from(key.0.as_str()), Value::from(key.1.as_str())])
            .await?;
        self.applied.remove(key);
        Ok(())
    }
}

/// Plans and applies migrations against one database alias.
pub struct MigrationExecutor<'a> {
    db: &'a dyn DatabaseBackend,
    alias: String,
    editor: Box<dyn SchemaEditor>,
    recorder: MigrationRecorder,
}

impl<'a> MigrationExecutor<'a> {
    pub async fn new(db: &'a dyn DatabaseBackend, alias: impl Into<String>) -> SqlormResult<Self> {
        Ok(Self {
            db,
            alias: alias.into(),
            editor: editor_for(db.backend_type()),
            recorder: MigrationRecorder::load(db).await?,
        })
    }

    pub fn recorder(&self) -> &MigrationRecorder {
        &self.recorder
    }

    /// Steps to reach `target`, or every unapplied migration without one.
    /// Migrating to an earlier target unapplies the later migrations,
    /// newest first.
    pub fn make_plan(
        &self,
        loader: &MigrationLoader,
        target: Option<&MigrationKey>,
    ) -> SqlormResult<MigrationPlan> {
        let order = loader.graph().topological_order()?;
        let mut plan = MigrationPlan::default();
        match target {
            None => {
                plan.steps = order
                    .into_iter()
                    .filter(|key| !self.recorder.is_applied(key))
                    .map(MigrationStep::forward)
                    .collect();
            }
            Some(target) => {
                let wanted: BTreeSet<MigrationKey> =
                    loader.graph().ancestors(target)?.into_iter().collect();
                for key in order.iter().rev() {
                    if key.0 == target.0 && !wanted.contains(key) && self.recorder.is_applied(key) {
                        plan.steps.push(MigrationStep::backward(key.clone()));
                    }
                }
                for key in order {
                    if wanted.contains(&key) && !self.recorder.is_applied(&key) {
                        plan.steps.push(MigrationStep::forward(key));
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Runs `plan` and returns the names of the migrations it applied or
    /// unapplied. With `fake`, migrations are only recorded.
    pub async fn execute(
        &mut self,
        loader: &MigrationLoader,
        plan: &MigrationPlan,
        fake: bool,
    ) -> SqlormResult<Vec<String>> {
        let mut done = Vec::with_capacity(plan.len());
        for step in &plan.steps {
            let migration = loader.get(&step.migration).ok_or_else(|| {
                SqlormError::MigrationError(format!(
                    "Migration {}.{} not found",
                    step.migration.0, step.migration.1
                ))
            })?;
            let verb = if step.backwards { "Unapplying" } else { "Applying" };

            if fake {
                self.record(step).await?;
                tracing::info!(alias = %self.alias, "{verb} {}.{}... FAKED", migration.app_label, migration.name);
            } else {
                let sql = self.migration_sql(loader, migration, step.backwards)?;
                self.run(step, &sql).await.map_err(|e| {
                    SqlormError::MigrationError(format!(
                        "{verb} {}.{} failed: {e}",
                        migration.app_label, migration.name
                    ))
                })?;
                tracing::info!(alias = %self.alias, "{verb} {}.{}... OK", migration.app_label, migration.name);
            }
            done.push(migration.name.clone());
        }
        Ok(done)
    }

    async fn record(&mut self, step: &MigrationStep) -> SqlormResult<()> {
        if step.backwards {
            self.recorder.record_unapplied(self.db, &step.migration).await
        } else {
            self.recorder.record_applied(self.db, &step.migration).await
        }
    }

    /// Executes one migration's DDL and bookkeeping in a transaction.
    async fn run(&mut self, step: &MigrationStep, sql: &[String]) -> SqlormResult<()> {
        for statement in self.editor.prepare_sql() {
            self.db.execute(&statement, &[]).await?;
        }
        self.db.begin().await?;
        let mut result = Ok(());
        for statement in sql {
            tracing::debug!(alias = %self.alias, sql = %statement, "executing DDL");
            if let Err(e) = self.db.execute(statement, &[]).await {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = self.record(step).await;
        }
        match result {
            Ok(()) => self.db.commit().await?,
            Err(_) => {
                if let Err(e) = self.db.rollback().await {
                    tracing::warn!(error = %e, "rollback after failed migration failed");
                }
            }
        }
        for statement in self.editor.finish_sql() {
            self.db.execute(&statement, &[]).await?;
        }
        result
    }

    /// The DDL for one migration in the given direction, with operations the
    /// routers keep off this database left out.
    pub fn migration_sql(
        &self,
        loader: &MigrationLoader,
        migration: &Migration,
        backwards: bool,
    ) -> SqlormResult<Vec<String>> {
        let mut state = state_before(loader, &migration.key())?;
        let mut transitions: Vec<(&Operation, ProjectState, ProjectState)> = Vec::new();
        for op in &migration.operations {
            let before = state.clone();
            op.state_forwards(&mut state)?;
            transitions.push((op, before, state.clone()));
        }
        if backwards {
            transitions.reverse();
        }

        let mut sql = Vec::new();
        for (op, before, after) in &transitions {
            if !self.allowed(op) {
                tracing::warn!(alias = %self.alias, operation = %op.describe(), "skipped by router");
                continue;
            }
            if backwards {
                sql.extend(op.database_backwards(self.editor.as_ref(), before, after)?);
            } else {
                sql.extend(op.database_forwards(self.editor.as_ref(), before, after)?);
            }
        }
        Ok(sql)
    }

    fn allowed(&self, op: &Operation) -> bool {
        match op.model_name().and_then(|name| registry().get_lowercase(name)) {
            Some(model) => router::allow_migrate(&self.alias, &model),
            None => self.alias == DEFAULT_DB_ALIAS,
        }
    }
}

/// The state right before `key` runs: its dependencies replayed.
fn state_before(loader: &MigrationLoader, key: &MigrationKey) -> SqlormResult<ProjectState> {
    let mut state = ProjectState::new();
    for ancestor in loader.graph().ancestors(key)? {
        if &ancestor == key {
            continue;
        }
        if let Some(migration) = loader.get(&ancestor) {
            for op in &migration.operations {
                op.state_forwards(&mut state)?;
            }
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlorm_core::apps::SQLORM_APP_LABEL;
    use sqlorm_db_backends::SqliteBackend;

    use crate::autodetect::StateOptions;
    use crate::serializer::migration_file_path;
    use sqlorm_db::fields;

    fn key(name: &str) -> MigrationKey {
        (SQLORM_APP_LABEL.to_string(), name.to_string())
    }

    fn write_migrations(dir: &std::path::Path) {
        let first = Migration::new(SQLORM_APP_LABEL, "0001_initial")
            .initial()
            .operation(Operation::CreateModel {
                name: "ExecWidget".into(),
                db_table: "exec_widget".into(),
                fields: vec![
                    fields::big_auto_field().named("id"),
                    fields::char_field(30).named("label"),
                ],
                options: StateOptions::default(),
            });
        let second = Migration::new(SQLORM_APP_LABEL, "0002_execwidget_size")
            .depends_on(SQLORM_APP_LABEL, "0001_initial")
            .operation(Operation::AddField {
                model_name: "ExecWidget".into(),
                field: fields::integer_field().default(1).named("size"),
            });
        for m in [first, second] {
            m.write_to_file(&migration_file_path(dir, SQLORM_APP_LABEL, &m.name))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_recorder_roundtrip() {
        let db = SqliteBackend::memory().unwrap();
        let mut recorder = MigrationRecorder::load(&db).await.unwrap();
        assert!(recorder.applied().is_empty());
        recorder.record_applied(&db, &key("0001_initial")).await.unwrap();

        let reloaded = MigrationRecorder::load(&db).await.unwrap();
        assert!(reloaded.is_applied(&key("0001_initial")));
        recorder.record_unapplied(&db, &key("0001_initial")).await.unwrap();
        assert!(!MigrationRecorder::load(&db).await.unwrap().is_applied(&key("0001_initial")));
    }

    #[tokio::test]
    async fn test_apply_then_unapply() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let loader = MigrationLoader::load(dir.path()).unwrap();
        let db = SqliteBackend::memory().unwrap();

        let mut executor = MigrationExecutor::new(&db, "default").await.unwrap();
        let plan = executor.make_plan(&loader, None).unwrap();
        assert_eq!(plan.len(), 2);
        let applied = executor.execute(&loader, &plan, false).await.unwrap();
        assert_eq!(applied, vec!["0001_initial", "0002_execwidget_size"]);

        let columns: Vec<String> = db
            .table_description("exec_widget")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(columns, vec!["id", "label", "size"]);
        assert!(executor.make_plan(&loader, None).unwrap().is_empty());

        let back = executor.make_plan(&loader, Some(&key("0001_initial"))).unwrap();
        assert_eq!(back.steps, vec![MigrationStep::backward(key("0002_execwidget_size"))]);
        executor.execute(&loader, &back, false).await.unwrap();
        let columns = db.table_description("exec_widget").await.unwrap();
        assert_eq!(columns.len(), 2);
        assert!(!executor.recorder().is_applied(&key("0002_execwidget_size")));
    }

    #[tokio::test]
    async fn test_fake_only_records() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let loader = MigrationLoader::load(dir.path()).unwrap();
        let db = SqliteBackend::memory().unwrap();
        let mut executor = MigrationExecutor::new(&db, "default").await.unwrap();
        let plan = executor.make_plan(&loader, Some(&key("0001_initial"))).unwrap();
        executor.execute(&loader, &plan, true).await.unwrap();
        assert!(executor.recorder().is_applied(&key("0001_initial")));
        assert!(!db.table_names().await.unwrap().contains(&"exec_widget".to_string()));
    }

    #[tokio::test]
    async fn test_unregistered_models_skip_other_aliases() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let loader = MigrationLoader::load(dir.path()).unwrap();
        let db = SqliteBackend::memory().unwrap();
        let executor = MigrationExecutor::new(&db, "analytics").await.unwrap();
        let migration = loader.find("0001").unwrap();
        assert!(executor.migration_sql(&loader, migration, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let broken = Migration::new(SQLORM_APP_LABEL, "0001_broken").operation(Operation::RunSql {
            sql: "CREATE TABLE nope (".into(),
            reverse_sql: None,
        });
        broken
            .write_to_file(&migration_file_path(dir.path(), SQLORM_APP_LABEL, &broken.name))
            .unwrap();
        let loader = MigrationLoader::load(dir.path()).unwrap();
        let db = SqliteBackend::memory().unwrap();
        let mut executor = MigrationExecutor::new(&db, "default").await.unwrap();
        let plan = executor.make_plan(&loader, None).unwrap();
        let err = executor.execute(&loader, &plan, false).await.unwrap_err();
        assert_eq!(err.kind(), "MigrationError");
        assert!(err.to_string().contains("0001_broken"));
        assert!(!MigrationRecorder::load(&db).await.unwrap().is_applied(&key("0001_broken")));
    }
}
