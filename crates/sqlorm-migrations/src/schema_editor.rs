//! DDL generation.
//!
//! The [`SchemaEditor`] trait turns schema changes into SQL statements for
//! one backend. Every method returns `Vec<String>` because several changes
//! need more than one statement: a `CREATE TABLE` comes with its indexes,
//! and SQLite rebuilds a table to alter or drop a constrained column.
//!
//! Column definitions follow the field flags: `NOT NULL` unless `null`,
//! `UNIQUE`, `DEFAULT` for a declared default and `REFERENCES` with the
//! `ON DELETE` action for relations.

use sqlorm_core::apps::SQLORM_APP_LABEL;
use sqlorm_db::fields::{FieldDef, FieldType, OnDelete};
use sqlorm_db::model::Index;
use sqlorm_db::query::compiler::DatabaseBackendType;
use sqlorm_db::value::Value;

use crate::autodetect::ModelState;

/// Generates DDL for one database backend.
pub trait SchemaEditor: Send + Sync {
    fn backend_type(&self) -> DatabaseBackendType;

    /// The column type for a field, without constraints.
    fn column_type(&self, field: &FieldDef) -> String;

    /// The type, nullability and key clause of an auto-increment primary key.
    fn auto_pk_sql(&self, field: &FieldDef) -> String;

    /// Statements run before a migration. SQLite switches foreign key
    /// enforcement off so tables can be rebuilt.
    fn prepare_sql(&self) -> Vec<String> {
        Vec::new()
    }

    /// Statements run after a migration, undoing [`prepare_sql`](Self::prepare_sql).
    fn finish_sql(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `ALTER TABLE ... ADD COLUMN` accepts an inline `UNIQUE`.
    fn inline_unique_on_add(&self) -> bool {
        true
    }

    /// The full definition of a column, after its quoted name.
    fn column_sql(&self, model: &ModelState, field: &FieldDef, inline_unique: bool) -> String {
        if field.is_auto() {
            return self.auto_pk_sql(field);
        }
        let mut sql = self.column_type(field);
        if field.primary_key {
            sql.push_str(" NOT NULL PRIMARY KEY");
        } else {
            sql.push_str(if field.null { " NULL" } else { " NOT NULL" });
            if field.unique && inline_unique {
                sql.push_str(" UNIQUE");
            }
        }
        if let Some(default) = field.default.as_ref().and_then(literal) {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default);
        }
        if matches!(field.field_type, FieldType::PositiveIntegerField) {
            sql.push_str(&format!(" CHECK ({} >= 0)", quote_name(&field.column)));
        }
        if let Some(references) = references_sql(model, field) {
            sql.push(' ');
            sql.push_str(&references);
        }
        sql
    }

    /// `CREATE TABLE` followed by the table's indexes.
    fn create_table(&self, model: &ModelState) -> Vec<String> {
        let columns: Vec<String> = model
            .fields
            .iter()
            .map(|f| format!("{} {}", quote_name(&f.column), self.column_sql(model, f, true)))
            .collect();
        let mut stmts = vec![format!(
            "CREATE TABLE {} ({})",
            quote_name(&model.db_table),
            columns.join(", ")
        )];
        stmts.extend(self.table_indexes(model));
        stmts
    }

    /// Every index a table carries besides its columns: `db_index` and
    /// relation columns, `unique_together` sets and `Meta.indexes`.
    fn table_indexes(&self, model: &ModelState) -> Vec<String> {
        let mut stmts = Vec::new();
        for field in &model.fields {
            if needs_column_index(field) {
                stmts.extend(self.create_column_index(&model.db_table, &field.column));
            }
        }
        for fields in &model.options.unique_together {
            stmts.extend(self.create_unique_together(model, fields));
        }
        for index in &model.options.indexes {
            stmts.extend(self.create_index(model, index));
        }
        stmts
    }

    fn drop_table(&self, model: &ModelState) -> Vec<String> {
        vec![format!("DROP TABLE IF EXISTS {}", quote_name(&model.db_table))]
    }

    /// Adds `field` to `model`'s table.
    ///
    /// A `NOT NULL` column without a default needs a value for existing
    /// rows: strings get `''`, numbers `0` and booleans `FALSE`. Other
    /// types are added as nullable.
    fn add_column(&self, model: &ModelState, field: &FieldDef) -> Vec<String> {
        let mut field = field.clone();
        let mut temporary_default = false;
        if !field.null && field.default.is_none() {
            match fill_value(&field.field_type) {
                Some(value) => {
                    field.default = Some(value);
                    temporary_default = true;
                }
                None => {
                    tracing::warn!(
                        table = %model.db_table,
                        column = %field.column,
                        "no default for existing rows, adding the column as nullable"
                    );
                    field.null = true;
                }
            }
        }

        let table = quote_name(&model.db_table);
        let column = quote_name(&field.column);
        let inline_unique = self.inline_unique_on_add();
        let mut stmts = vec![format!(
            "ALTER TABLE {table} ADD COLUMN {column} {}",
            self.column_sql(model, &field, inline_unique)
        )];
        if temporary_default && self.backend_type() == DatabaseBackendType::PostgreSQL {
            stmts.push(format!("ALTER TABLE {table} ALTER COLUMN {column} DROP DEFAULT"));
        }
        if field.unique && !inline_unique {
            stmts.push(format!(
                "CREATE UNIQUE INDEX {} ON {table} ({column})",
                quote_name(&format!("{}_{}_uniq", model.db_table, field.column))
            ));
        }
        if needs_column_index(&field) {
            stmts.extend(self.create_column_index(&model.db_table, &field.column));
        }
        stmts
    }

    /// Drops `field`. `old` still has the field, `new` no longer does.
    fn drop_column(&self, old: &ModelState, new: &ModelState, field: &FieldDef) -> Vec<String>;

    /// Changes `old_field` into `new_field`.
    fn alter_column(
        &self,
        old: &ModelState,
        new: &ModelState,
        old_field: &FieldDef,
        new_field: &FieldDef,
    ) -> Vec<String>;

    fn rename_column(&self, model: &ModelState, old_column: &str, new_column: &str) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_name(&model.db_table),
            quote_name(old_column),
            quote_name(new_column)
        )]
    }

    fn create_index(&self, model: &ModelState, index: &Index) -> Vec<String> {
        let columns: Vec<String> = index
            .fields
            .iter()
            .map(|f| quote_name(model.column_for(f.trim_start_matches('-'))))
            .collect();
        vec![format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_name(&index.name_for(&model.db_table)),
            quote_name(&model.db_table),
            columns.join(", ")
        )]
    }

    fn drop_index(&self, name: &str) -> Vec<String> {
        vec![format!("DROP INDEX IF EXISTS {}", quote_name(name))]
    }

    fn create_column_index(&self, table: &str, column: &str) -> Vec<String> {
        vec![format!(
            "CREATE INDEX {} ON {} ({})",
            quote_name(&column_index_name(table, column)),
            quote_name(table),
            quote_name(column)
        )]
    }

    fn create_unique_together(&self, model: &ModelState, fields: &[String]) -> Vec<String> {
        let columns: Vec<&str> = fields.iter().map(|f| model.column_for(f)).collect();
        let quoted: Vec<String> = columns.iter().map(|c| quote_name(c)).collect();
        vec![format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            quote_name(&unique_together_name(&model.db_table, &columns)),
            quote_name(&model.db_table),
            quoted.join(", ")
        )]
    }

    /// Replaces the `unique_together` sets of `old` by those of `new`.
    fn alter_unique_together(&self, old: &ModelState, new: &ModelState) -> Vec<String> {
        let mut stmts = Vec::new();
        for fields in &old.options.unique_together {
            if !new.options.unique_together.contains(fields) {
                let columns: Vec<&str> = fields.iter().map(|f| old.column_for(f)).collect();
                stmts.extend(self.drop_index(&unique_together_name(&old.db_table, &columns)));
            }
        }
        for fields in &new.options.unique_together {
            if !old.options.unique_together.contains(fields) {
                stmts.extend(self.create_unique_together(new, fields));
            }
        }
        stmts
    }
}

/// Returns the editor for a backend.
pub fn editor_for(backend: DatabaseBackendType) -> Box<dyn SchemaEditor> {
    match backend {
        DatabaseBackendType::SQLite => Box::new(SqliteSchemaEditor),
        DatabaseBackendType::PostgreSQL => Box::new(PostgresSchemaEditor),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Double-quotes an identifier.
pub fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A value as an SQL literal. Binary and list values have none.
pub fn literal(value: &Value) -> Option<String> {
    let quoted = |s: &str| format!("'{}'", s.replace('\'', "''"));
    Some(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => quoted(s),
        Value::Date(d) => quoted(&d.to_string()),
        Value::DateTime(dt) => quoted(&dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::DateTimeTz(dt) => quoted(&dt.to_rfc3339()),
        Value::Time(t) => quoted(&t.to_string()),
        Value::Uuid(u) => quoted(&u.to_string()),
        Value::Json(j) => quoted(&j.to_string()),
        Value::Bytes(_) | Value::List(_) => return None,
    })
}

fn on_delete_sql(on_delete: OnDelete) -> &'static str {
    match on_delete {
        OnDelete::Cascade => "CASCADE",
        OnDelete::Protect => "RESTRICT",
        OnDelete::SetNull => "SET NULL",
        OnDelete::SetDefault => "SET DEFAULT",
        OnDelete::DoNothing => "NO ACTION",
    }
}

/// The table a relation points to. Unresolved targets live in the
/// default app; `self` points back at the model's own table.
fn target_table(model: &ModelState, to: &str, to_table: Option<&String>) -> String {
    if let Some(table) = to_table {
        return table.clone();
    }
    if to.eq_ignore_ascii_case("self") || to.eq_ignore_ascii_case(&model.name) {
        return model.db_table.clone();
    }
    let name = to.rsplit('.').next().unwrap_or(to);
    format!("{SQLORM_APP_LABEL}_{}", name.to_lowercase())
}

fn references_sql(model: &ModelState, field: &FieldDef) -> Option<String> {
    match &field.field_type {
        FieldType::ForeignKey {
            to,
            on_delete,
            to_table,
        }
        | FieldType::OneToOneField {
            to,
            on_delete,
            to_table,
        } => Some(format!(
            "REFERENCES {} ON DELETE {}",
            quote_name(&target_table(model, to, to_table.as_ref())),
            on_delete_sql(*on_delete)
        )),
        _ => None,
    }
}

/// The value existing rows receive when a required column is added.
fn fill_value(field_type: &FieldType) -> Option<Value> {
    match field_type {
        FieldType::CharField
        | FieldType::TextField
        | FieldType::EmailField
        | FieldType::UrlField
        | FieldType::SlugField => Some(Value::String(String::new())),
        FieldType::IntegerField
        | FieldType::BigIntegerField
        | FieldType::SmallIntegerField
        | FieldType::PositiveIntegerField
        | FieldType::DurationField => Some(Value::Int(0)),
        FieldType::FloatField | FieldType::DecimalField { .. } => Some(Value::Float(0.0)),
        FieldType::BooleanField => Some(Value::Bool(false)),
        _ => None,
    }
}

/// Relation columns and `db_index` fields get their own index, unless the
/// column is already unique.
fn needs_column_index(field: &FieldDef) -> bool {
    !field.primary_key
        && !field.unique
        && (field.db_index || matches!(field.field_type, FieldType::ForeignKey { .. }))
}

pub fn column_index_name(table: &str, column: &str) -> String {
    format!("{table}_{column}_index")
}

pub fn unique_together_name(table: &str, columns: &[&str]) -> String {
    format!("{table}_{}_uniq", columns.join("_"))
}

/// Whether two fields produce the same column apart from its name.
fn same_definition(a: &FieldDef, b: &FieldDef) -> bool {
    a.field_type == b.field_type
        && a.null == b.null
        && a.primary_key == b.primary_key
        && a.unique == b.unique
        && a.default == b.default
        && a.max_length == b.max_length
}

// ── PostgreSQL ───────────────────────────────────────────────────────────

/// Schema editor for PostgreSQL.
///
/// Integers are stored as `BIGINT` because parameters are bound as `i64`.
pub struct PostgresSchemaEditor;

impl PostgresSchemaEditor {
    fn constraint_name(table: &str, column: &str, suffix: &str) -> String {
        format!("{table}_{column}_{suffix}")
    }
}

impl SchemaEditor for PostgresSchemaEditor {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    fn column_type(&self, field: &FieldDef) -> String {
        match &field.field_type {
            FieldType::AutoField
            | FieldType::BigAutoField
            | FieldType::IntegerField
            | FieldType::BigIntegerField
            | FieldType::SmallIntegerField
            | FieldType::PositiveIntegerField
            | FieldType::DurationField
            | FieldType::ForeignKey { .. }
            | FieldType::OneToOneField { .. } => "BIGINT".to_string(),
            FieldType::CharField
            | FieldType::EmailField
            | FieldType::UrlField
            | FieldType::SlugField => format!("VARCHAR({})", field.max_length.unwrap_or(255)),
            FieldType::TextField => "TEXT".to_string(),
            FieldType::FloatField | FieldType::DecimalField { .. } => {
                "DOUBLE PRECISION".to_string()
            }
            FieldType::BooleanField => "BOOLEAN".to_string(),
            FieldType::DateField => "DATE".to_string(),
            FieldType::DateTimeField => "TIMESTAMP".to_string(),
            FieldType::TimeField => "TIME".to_string(),
            FieldType::UuidField => "UUID".to_string(),
            FieldType::BinaryField => "BYTEA".to_string(),
            FieldType::JsonField => "JSONB".to_string(),
        }
    }

    fn auto_pk_sql(&self, _field: &FieldDef) -> String {
        "BIGSERIAL NOT NULL PRIMARY KEY".to_string()
    }

    fn drop_table(&self, model: &ModelState) -> Vec<String> {
        vec![format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            quote_name(&model.db_table)
        )]
    }

    fn drop_column(&self, old: &ModelState, _new: &ModelState, field: &FieldDef) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} DROP COLUMN {} CASCADE",
            quote_name(&old.db_table),
            quote_name(&field.column)
        )]
    }

    fn alter_column(
        &self,
        old: &ModelState,
        new: &ModelState,
        old_field: &FieldDef,
        new_field: &FieldDef,
    ) -> Vec<String> {
        let table_name = &new.db_table;
        let table = quote_name(table_name);
        let col_name = &new_field.column;
        let col = quote_name(col_name);
        let alter = |clause: String| format!("ALTER TABLE {table} ALTER COLUMN {col} {clause}");
        let mut stmts = Vec::new();

        if old_field.column != new_field.column {
            stmts.extend(self.rename_column(old, &old_field.column, col_name));
        }

        let new_type = self.column_type(new_field);
        if self.column_type(old_field) != new_type {
            stmts.push(alter(format!("TYPE {new_type} USING {col}::{new_type}")));
        }

        if old_field.default != new_field.default {
            match new_field.default.as_ref().and_then(literal) {
                Some(default) => stmts.push(alter(format!("SET DEFAULT {default}"))),
                None => stmts.push(alter("DROP DEFAULT".to_string())),
            }
        }

        if old_field.null && !new_field.null {
            if let Some(default) = new_field.default.as_ref().and_then(literal) {
                stmts.push(format!("UPDATE {table} SET {col} = {default} WHERE {col} IS NULL"));
            }
            stmts.push(alter("SET NOT NULL".to_string()));
        } else if !old_field.null && new_field.null {
            stmts.push(alter("DROP NOT NULL".to_string()));
        }

        let unique_name = quote_name(&Self::constraint_name(table_name, col_name, "key"));
        if old_field.unique && !new_field.unique {
            stmts.push(format!("ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {unique_name}"));
        } else if !old_field.unique && new_field.unique {
            stmts.push(format!("ALTER TABLE {table} ADD CONSTRAINT {unique_name} UNIQUE ({col})"));
        }

        let old_ref = references_sql(old, old_field);
        let new_ref = references_sql(new, new_field);
        if old_ref != new_ref {
            let fk_name = quote_name(&Self::constraint_name(table_name, col_name, "fkey"));
            stmts.push(format!("ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {fk_name}"));
            if let Some(references) = new_ref {
                stmts.push(format!(
                    "ALTER TABLE {table} ADD CONSTRAINT {fk_name} FOREIGN KEY ({col}) {references}"
                ));
            }
        }

        match (needs_column_index(old_field), needs_column_index(new_field)) {
            (true, false) => stmts.extend(
                self.drop_index(&column_index_name(&old.db_table, &old_field.column)),
            ),
            (false, true) => stmts.extend(self.create_column_index(table_name, col_name)),
            _ => {}
        }
        stmts
    }
}

// ── SQLite ───────────────────────────────────────────────────────────────

/// Schema editor for SQLite.
///
/// SQLite cannot alter a column in place. Altering a column, or dropping
/// one that carries a constraint, rebuilds the table: create `new__<table>`
/// with the new layout, copy the rows, drop the old table, rename, then
/// recreate the indexes.
pub struct SqliteSchemaEditor;

impl SqliteSchemaEditor {
    /// Rebuilds `old`'s table with `new`'s layout. `sources` maps each new
    /// column to the SQL expression reading its value from the old table.
    fn remake_table(&self, new: &ModelState, sources: &[(String, String)]) -> Vec<String> {
        let temp = ModelState {
            db_table: format!("new__{}", new.db_table),
            ..new.clone()
        };
        let columns: Vec<String> = temp
            .fields
            .iter()
            .map(|f| format!("{} {}", quote_name(&f.column), self.column_sql(new, f, true)))
            .collect();
        let targets: Vec<String> = sources.iter().map(|(c, _)| quote_name(c)).collect();
        let exprs: Vec<&str> = sources.iter().map(|(_, e)| e.as_str()).collect();

        let mut stmts = vec![format!(
            "CREATE TABLE {} ({})",
            quote_name(&temp.db_table),
            columns.join(", ")
        )];
        if !sources.is_empty() {
            stmts.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_name(&temp.db_table),
                targets.join(", "),
                exprs.join(", "),
                quote_name(&new.db_table)
            ));
        }
        stmts.push(format!("DROP TABLE {}", quote_name(&new.db_table)));
        stmts.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_name(&temp.db_table),
            quote_name(&new.db_table)
        ));
        stmts.extend(self.table_indexes(new));
        stmts
    }
}

impl SchemaEditor for SqliteSchemaEditor {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn column_type(&self, field: &FieldDef) -> String {
        match &field.field_type {
            FieldType::AutoField
            | FieldType::BigAutoField
            | FieldType::IntegerField
            | FieldType::PositiveIntegerField
            | FieldType::ForeignKey { .. }
            | FieldType::OneToOneField { .. } => "INTEGER".to_string(),
            FieldType::BigIntegerField | FieldType::DurationField => "BIGINT".to_string(),
            FieldType::SmallIntegerField => "SMALLINT".to_string(),
            FieldType::CharField
            | FieldType::EmailField
            | FieldType::UrlField
            | FieldType::SlugField => format!("VARCHAR({})", field.max_length.unwrap_or(255)),
            FieldType::TextField | FieldType::JsonField => "TEXT".to_string(),
            FieldType::FloatField => "REAL".to_string(),
            FieldType::DecimalField {
                max_digits,
                decimal_places,
            } => format!("DECIMAL({max_digits}, {decimal_places})"),
            FieldType::BooleanField => "BOOL".to_string(),
            FieldType::DateField => "DATE".to_string(),
            FieldType::DateTimeField => "DATETIME".to_string(),
            FieldType::TimeField => "TIME".to_string(),
            FieldType::UuidField => "CHAR(36)".to_string(),
            FieldType::BinaryField => "BLOB".to_string(),
        }
    }

    fn auto_pk_sql(&self, _field: &FieldDef) -> String {
        "INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT".to_string()
    }

    fn prepare_sql(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys = OFF".to_string()]
    }

    fn finish_sql(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys = ON".to_string()]
    }

    fn inline_unique_on_add(&self) -> bool {
        false
    }

    fn drop_column(&self, old: &ModelState, new: &ModelState, field: &FieldDef) -> Vec<String> {
        let simple = !field.primary_key
            && !field.unique
            && !field.db_index
            && !field.is_relation()
            && !old
                .options
                .unique_together
                .iter()
                .any(|set| set.contains(&field.name))
            && !old
                .options
                .indexes
                .iter()
                .any(|index| index.fields.contains(&field.name));
        if simple {
            return vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_name(&old.db_table),
                quote_name(&field.column)
            )];
        }
        let sources: Vec<(String, String)> = new
            .fields
            .iter()
            .filter(|f| old.field(&f.name).is_some())
            .map(|f| (f.column.clone(), quote_name(old.column_for(&f.name))))
            .collect();
        self.remake_table(new, &sources)
    }

    fn alter_column(
        &self,
        old: &ModelState,
        new: &ModelState,
        old_field: &FieldDef,
        new_field: &FieldDef,
    ) -> Vec<String> {
        if same_definition(old_field, new_field) {
            let mut stmts = Vec::new();
            if old_field.column != new_field.column {
                stmts.extend(self.rename_column(old, &old_field.column, &new_field.column));
            }
            match (needs_column_index(old_field), needs_column_index(new_field)) {
                (true, false) => stmts.extend(
                    self.drop_index(&column_index_name(&old.db_table, &old_field.column)),
                ),
                (false, true) => {
                    stmts.extend(self.create_column_index(&new.db_table, &new_field.column));
                }
                _ => {}
            }
            return stmts;
        }

        let sources: Vec<(String, String)> = new
            .fields
            .iter()
            .filter_map(|f| {
                let source = old.field(&f.name)?;
                let column = quote_name(&source.column);
                let expr = if f.name == new_field.name && old_field.null && !new_field.null {
                    match new_field.default.as_ref().and_then(literal) {
                        Some(default) => format!("COALESCE({column}, {default})"),
                        None => column,
                    }
                } else {
                    column
                };
                Some((f.column.clone(), expr))
            })
            .collect();
        self.remake_table(new, &sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodetect::StateOptions;
    use sqlorm_db::fields;

    fn author() -> ModelState {
        ModelState::new(
            "Author",
            "sqlorm_app_author",
            vec![
                fields::big_auto_field().named("id"),
                fields::char_field(100).named("name"),
                fields::email_field().max_length(254).unique().named("email"),
                fields::integer_field().nullable().named("age"),
            ],
        )
    }

    fn book() -> ModelState {
        ModelState::new(
            "Book",
            "sqlorm_app_book",
            vec![
                fields::big_auto_field().named("id"),
                fields::char_field(200).db_index().named("title"),
                fields::boolean_field().default(true).named("in_print"),
                fields::foreign_key("Author", OnDelete::Cascade).named("author"),
            ],
        )
        .with_options(StateOptions {
            unique_together: vec![vec!["title".into(), "author".into()]],
            indexes: vec![],
        })
    }

    #[test]
    fn test_sqlite_create_table() {
        let stmts = SqliteSchemaEditor.create_table(&author());
        assert_eq!(
            stmts,
            vec![
                "CREATE TABLE \"sqlorm_app_author\" (\"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT, \
                 \"name\" VARCHAR(100) NOT NULL, \"email\" VARCHAR(254) NOT NULL UNIQUE, \
                 \"age\" INTEGER NULL)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_create_table_indexes_and_references() {
        let stmts = SqliteSchemaEditor.create_table(&book());
        assert!(stmts[0].contains(
            "\"author_id\" INTEGER NOT NULL REFERENCES \"sqlorm_app_author\" ON DELETE CASCADE"
        ));
        assert!(stmts[0].contains("\"in_print\" BOOL NOT NULL DEFAULT TRUE"));
        assert_eq!(
            &stmts[1..],
            &[
                "CREATE INDEX \"sqlorm_app_book_title_index\" ON \"sqlorm_app_book\" (\"title\")"
                    .to_string(),
                "CREATE INDEX \"sqlorm_app_book_author_id_index\" ON \"sqlorm_app_book\" (\"author_id\")"
                    .to_string(),
                "CREATE UNIQUE INDEX \"sqlorm_app_book_title_author_id_uniq\" ON \"sqlorm_app_book\" (\"title\", \"author_id\")"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_postgres_types() {
        let stmts = PostgresSchemaEditor.create_table(&author());
        assert!(stmts[0].starts_with(
            "CREATE TABLE \"sqlorm_app_author\" (\"id\" BIGSERIAL NOT NULL PRIMARY KEY"
        ));
        assert!(stmts[0].contains("\"age\" BIGINT NULL"));
        let uuid = fields::uuid_field().named("token");
        assert_eq!(PostgresSchemaEditor.column_type(&uuid), "UUID");
        assert_eq!(SqliteSchemaEditor.column_type(&uuid), "CHAR(36)");
    }

    #[test]
    fn test_add_column_fills_required_values() {
        let model = author();
        let status = fields::char_field(20).named("status");
        let stmts = SqliteSchemaEditor.add_column(&model, &status);
        assert_eq!(
            stmts,
            vec!["ALTER TABLE \"sqlorm_app_author\" ADD COLUMN \"status\" VARCHAR(20) NOT NULL DEFAULT ''"]
        );

        let pg = PostgresSchemaEditor.add_column(&model, &status);
        assert_eq!(pg.len(), 2);
        assert!(pg[1].ends_with("DROP DEFAULT"));

        let born = fields::date_field().named("born");
        let stmts = SqliteSchemaEditor.add_column(&model, &born);
        assert!(stmts[0].ends_with("\"born\" DATE NULL"));
    }

    #[test]
    fn test_sqlite_add_unique_column_uses_index() {
        let code = fields::char_field(8).unique().named("code");
        let stmts = SqliteSchemaEditor.add_column(&author(), &code);
        assert_eq!(stmts.len(), 2);
        assert!(!stmts[0].contains("UNIQUE"));
        assert_eq!(
            stmts[1],
            "CREATE UNIQUE INDEX \"sqlorm_app_author_code_uniq\" ON \"sqlorm_app_author\" (\"code\")"
        );
    }

    #[test]
    fn test_sqlite_drop_column() {
        let old = author();
        let mut new = old.clone();
        new.fields.retain(|f| f.name != "age");
        let age = old.field("age").unwrap();
        assert_eq!(
            SqliteSchemaEditor.drop_column(&old, &new, age),
            vec!["ALTER TABLE \"sqlorm_app_author\" DROP COLUMN \"age\""]
        );

        let mut new = old.clone();
        new.fields.retain(|f| f.name != "email");
        let email = old.field("email").unwrap();
        let stmts = SqliteSchemaEditor.drop_column(&old, &new, email);
        assert!(stmts[0].starts_with("CREATE TABLE \"new__sqlorm_app_author\""));
        assert_eq!(
            stmts[1],
            "INSERT INTO \"new__sqlorm_app_author\" (\"id\", \"name\", \"age\") \
             SELECT \"id\", \"name\", \"age\" FROM \"sqlorm_app_author\""
        );
        assert_eq!(stmts[2], "DROP TABLE \"sqlorm_app_author\"");
        assert_eq!(
            stmts[3],
            "ALTER TABLE \"new__sqlorm_app_author\" RENAME TO \"sqlorm_app_author\""
        );
    }

    #[test]
    fn test_sqlite_alter_coalesces_nulls() {
        let old = author();
        let mut new = old.clone();
        let age = fields::integer_field().default(18).named("age");
        new.fields[3] = age.clone();
        let stmts =
            SqliteSchemaEditor.alter_column(&old, &new, old.field("age").unwrap(), &age);
        assert!(stmts[0].contains("\"age\" INTEGER NOT NULL DEFAULT 18"));
        assert!(stmts[1].contains("COALESCE(\"age\", 18)"));
    }

    #[test]
    fn test_postgres_alter_column() {
        let old = author();
        let mut new = old.clone();
        let age = fields::integer_field().named("age");
        new.fields[3] = age.clone();
        let stmts =
            PostgresSchemaEditor.alter_column(&old, &new, old.field("age").unwrap(), &age);
        assert_eq!(
            stmts,
            vec!["ALTER TABLE \"sqlorm_app_author\" ALTER COLUMN \"age\" SET NOT NULL"]
        );

        let email = fields::email_field().max_length(254).named("email");
        let stmts =
            PostgresSchemaEditor.alter_column(&old, &new, old.field("email").unwrap(), &email);
        assert_eq!(
            stmts,
            vec!["ALTER TABLE \"sqlorm_app_author\" DROP CONSTRAINT IF EXISTS \"sqlorm_app_author_email_key\""]
        );
    }

    #[test]
    fn test_alter_unique_together() {
        let old = book();
        let mut new = old.clone();
        new.options.unique_together = vec![vec!["title".into(), "in_print".into()]];
        let stmts = SqliteSchemaEditor.alter_unique_together(&old, &new);
        assert_eq!(
            stmts,
            vec![
                "DROP INDEX IF EXISTS \"sqlorm_app_book_title_author_id_uniq\"".to_string(),
                "CREATE UNIQUE INDEX \"sqlorm_app_book_title_in_print_uniq\" ON \"sqlorm_app_book\" (\"title\", \"in_print\")"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(&Value::from("it's")).as_deref(), Some("'it''s'"));
        assert_eq!(literal(&Value::Bool(false)).as_deref(), Some("FALSE"));
        assert_eq!(literal(&Value::Bytes(vec![1])), None);
    }
}
