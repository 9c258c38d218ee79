//! Migration operations.
//!
//! An [`Operation`] is one schema change. It updates the in-memory
//! [`ProjectState`] and produces the DDL to apply or reverse itself against
//! a database. Operations are stored verbatim in migration files, tagged by
//! their `type`.

use serde::{Deserialize, Serialize};
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_db::fields::FieldDef;
use sqlorm_db::model::Index;

use crate::autodetect::{ModelState, ProjectState, StateOptions};
use crate::schema_editor::SchemaEditor;

/// A single schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    CreateModel {
        name: String,
        db_table: String,
        fields: Vec<FieldDef>,
        #[serde(default)]
        options: StateOptions,
    },
    DeleteModel {
        name: String,
    },
    AddField {
        model_name: String,
        field: FieldDef,
    },
    RemoveField {
        model_name: String,
        name: String,
    },
    AlterField {
        model_name: String,
        name: String,
        field: FieldDef,
    },
    RenameField {
        model_name: String,
        old_name: String,
        new_name: String,
    },
    AddIndex {
        model_name: String,
        index: Index,
    },
    RemoveIndex {
        model_name: String,
        name: String,
    },
    AlterUniqueTogether {
        model_name: String,
        unique_together: Vec<Vec<String>>,
    },
    /// Raw SQL. Without `reverse_sql` the operation cannot be unapplied.
    RunSql {
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse_sql: Option<String>,
    },
}

fn missing_field(model: &str, field: &str) -> SqlormError {
    SqlormError::MigrationError(format!("Model '{model}' has no field named '{field}'"))
}

impl Operation {
    /// A human-readable description, as shown while migrating.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateModel { name, .. } => format!("Create model {name}"),
            Self::DeleteModel { name } => format!("Delete model {name}"),
            Self::AddField { model_name, field } => {
                format!("Add field {} to {}", field.name, model_name.to_lowercase())
            }
            Self::RemoveField { model_name, name } => {
                format!("Remove field {name} from {}", model_name.to_lowercase())
            }
            Self::AlterField {
                model_name, name, ..
            } => format!("Alter field {name} on {}", model_name.to_lowercase()),
            Self::RenameField {
                model_name,
                old_name,
                new_name,
            } => format!(
                "Rename field {old_name} on {} to {new_name}",
                model_name.to_lowercase()
            ),
            Self::AddIndex { model_name, index } => format!(
                "Create index on field(s) {} of model {}",
                index.fields.join(", "),
                model_name.to_lowercase()
            ),
            Self::RemoveIndex { model_name, name } => {
                format!("Remove index {name} from {}", model_name.to_lowercase())
            }
            Self::AlterUniqueTogether {
                model_name,
                unique_together,
            } => format!(
                "Alter unique_together for {} ({} constraint(s))",
                model_name.to_lowercase(),
                unique_together.len()
            ),
            Self::RunSql { .. } => "Raw SQL operation".to_string(),
        }
    }

    /// The model this operation touches, if any.
    pub fn model_name(&self) -> Option<&str> {
        match self {
            Self::CreateModel { name, .. } | Self::DeleteModel { name } => Some(name),
            Self::AddField { model_name, .. }
            | Self::RemoveField { model_name, .. }
            | Self::AlterField { model_name, .. }
            | Self::RenameField { model_name, .. }
            | Self::AddIndex { model_name, .. }
            | Self::RemoveIndex { model_name, .. }
            | Self::AlterUniqueTogether { model_name, .. } => Some(model_name),
            Self::RunSql { .. } => None,
        }
    }

    pub fn reversible(&self) -> bool {
        match self {
            Self::RunSql { reverse_sql, .. } => reverse_sql.is_some(),
            _ => true,
        }
    }

    /// Applies this operation to `state`.
    pub fn state_forwards(&self, state: &mut ProjectState) -> SqlormResult<()> {
        match self {
            Self::CreateModel {
                name,
                db_table,
                fields,
                options,
            } => {
                state.add_model(
                    ModelState::new(name.clone(), db_table.clone(), fields.clone())
                        .with_options(options.clone()),
                );
            }
            Self::DeleteModel { name } => {
                state.remove(name).ok_or_else(|| {
                    SqlormError::MigrationError(format!("Cannot delete unknown model '{name}'"))
                })?;
            }
            Self::AddField { model_name, field } => {
                let model = state.model_mut(model_name)?;
                if model.field(&field.name).is_some() {
                    return Err(SqlormError::MigrationError(format!(
                        "Model '{model_name}' already has a field named '{}'",
                        field.name
                    )));
                }
                model.fields.push(field.clone());
            }
            Self::RemoveField { model_name, name } => {
                let model = state.model_mut(model_name)?;
                let before = model.fields.len();
                model.fields.retain(|f| &f.name != name);
                if model.fields.len() == before {
                    return Err(missing_field(model_name, name));
                }
            }
            Self::AlterField {
                model_name,
                name,
                field,
            } => {
                let model = state.model_mut(model_name)?;
                let slot = model
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == name)
                    .ok_or_else(|| missing_field(model_name, name))?;
                *slot = field.clone();
            }
            Self::RenameField {
                model_name,
                old_name,
                new_name,
            } => {
                let model = state.model_mut(model_name)?;
                let slot = model
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == old_name)
                    .ok_or_else(|| missing_field(model_name, old_name))?;
                *slot = renamed(slot, new_name);
                for set in &mut model.options.unique_together {
                    for field in set.iter_mut().filter(|f| f.as_str() == old_name.as_str()) {
                        field.clone_from(new_name);
                    }
                }
                for index in &mut model.options.indexes {
                    for field in index.fields.iter_mut().filter(|f| f.as_str() == old_name.as_str()) {
                        field.clone_from(new_name);
                    }
                }
            }
            Self::AddIndex { model_name, index } => {
                state.model_mut(model_name)?.options.indexes.push(index.clone());
            }
            Self::RemoveIndex { model_name, name } => {
                let model = state.model_mut(model_name)?;
                let table = model.db_table.clone();
                model.options.indexes.retain(|i| &i.name_for(&table) != name);
            }
            Self::AlterUniqueTogether {
                model_name,
                unique_together,
            } => {
                state.model_mut(model_name)?.options.unique_together = unique_together.clone();
            }
            Self::RunSql { .. } => {}
        }
        Ok(())
    }

    /// The DDL applying this operation. `before` is the state the
    /// operation starts from and `after` the state it produces.
    pub fn database_forwards(
        &self,
        editor: &dyn SchemaEditor,
        before: &ProjectState,
        after: &ProjectState,
    ) -> SqlormResult<Vec<String>> {
        Ok(match self {
            Self::CreateModel { name, .. } => editor.create_table(after.model(name)?),
            Self::DeleteModel { name } => editor.drop_table(before.model(name)?),
            Self::AddField { model_name, field } => {
                let model = after.model(model_name)?;
                let field = model
                    .field(&field.name)
                    .ok_or_else(|| missing_field(model_name, &field.name))?;
                editor.add_column(model, field)
            }
            Self::RemoveField { model_name, name } => {
                let old = before.model(model_name)?;
                let field = old.field(name).ok_or_else(|| missing_field(model_name, name))?;
                editor.drop_column(old, after.model(model_name)?, field)
            }
            Self::AlterField {
                model_name, name, ..
            } => {
                let old = before.model(model_name)?;
                let new = after.model(model_name)?;
                let old_field = old.field(name).ok_or_else(|| missing_field(model_name, name))?;
                let new_field = new.field(name).ok_or_else(|| missing_field(model_name, name))?;
                editor.alter_column(old, new, old_field, new_field)
            }
            Self::RenameField {
                model_name,
                old_name,
                new_name,
            } => rename_sql(editor, before, after, model_name, old_name, new_name)?,
            Self::AddIndex { model_name, index } => {
                editor.create_index(after.model(model_name)?, index)
            }
            Self::RemoveIndex { name, .. } => editor.drop_index(name),
            Self::AlterUniqueTogether { model_name, .. } => {
                editor.alter_unique_together(before.model(model_name)?, after.model(model_name)?)
            }
            Self::RunSql { sql, .. } => vec![sql.clone()],
        })
    }

    /// The DDL undoing this operation, with the same `before` and `after`
    /// states that [`database_forwards`](Self::database_forwards) received.
    pub fn database_backwards(
        &self,
        editor: &dyn SchemaEditor,
        before: &ProjectState,
        after: &ProjectState,
    ) -> SqlormResult<Vec<String>> {
        Ok(match self {
            Self::CreateModel { name, .. } => editor.drop_table(after.model(name)?),
            Self::DeleteModel { name } => editor.create_table(before.model(name)?),
            Self::AddField { model_name, field } => {
                let old = after.model(model_name)?;
                let field = old
                    .field(&field.name)
                    .ok_or_else(|| missing_field(model_name, &field.name))?;
                editor.drop_column(old, before.model(model_name)?, field)
            }
            Self::RemoveField { model_name, name } => {
                let model = before.model(model_name)?;
                let field = model.field(name).ok_or_else(|| missing_field(model_name, name))?;
                editor.add_column(model, field)
            }
            Self::AlterField {
                model_name, name, ..
            } => {
                let old = after.model(model_name)?;
                let new = before.model(model_name)?;
                let old_field = old.field(name).ok_or_else(|| missing_field(model_name, name))?;
                let new_field = new.field(name).ok_or_else(|| missing_field(model_name, name))?;
                editor.alter_column(old, new, old_field, new_field)
            }
            Self::RenameField {
                model_name,
                old_name,
                new_name,
            } => rename_sql(editor, after, before, model_name, new_name, old_name)?,
            Self::AddIndex { model_name, index } => {
                editor.drop_index(&index.name_for(&after.model(model_name)?.db_table))
            }
            Self::RemoveIndex { model_name, name } => {
                let model = before.model(model_name)?;
                let index = model
                    .options
                    .indexes
                    .iter()
                    .find(|i| &i.name_for(&model.db_table) == name)
                    .ok_or_else(|| {
                        SqlormError::MigrationError(format!(
                            "Model '{model_name}' has no index named '{name}'"
                        ))
                    })?;
                editor.create_index(model, index)
            }
            Self::AlterUniqueTogether { model_name, .. } => {
                editor.alter_unique_together(after.model(model_name)?, before.model(model_name)?)
            }
            Self::RunSql { reverse_sql, .. } => match reverse_sql {
                Some(sql) => vec![sql.clone()],
                None => {
                    return Err(SqlormError::MigrationError(
                        "Raw SQL operation has no reverse_sql and cannot be unapplied".into(),
                    ))
                }
            },
        })
    }
}

fn rename_sql(
    editor: &dyn SchemaEditor,
    from: &ProjectState,
    to: &ProjectState,
    model_name: &str,
    old_name: &str,
    new_name: &str,
) -> SqlormResult<Vec<String>> {
    let old = from.model(model_name)?;
    let old_field = old
        .field(old_name)
        .ok_or_else(|| missing_field(model_name, old_name))?;
    let new_field = to
        .model(model_name)?
        .field(new_name)
        .ok_or_else(|| missing_field(model_name, new_name))?;
    if old_field.column == new_field.column {
        return Ok(Vec::new());
    }
    Ok(editor.rename_column(old, &old_field.column, &new_field.column))
}

/// `field` under a new name. A column or verbose name derived from the
/// old name follows the rename; explicit ones are kept.
fn renamed(field: &FieldDef, new_name: &str) -> FieldDef {
    let mut field = field.clone();
    let derived_column = if field.is_relation() {
        format!("{}_id", field.name)
    } else {
        field.name.clone()
    };
    if field.column == derived_column {
        field.column.clear();
    }
    if field.verbose_name == field.name.replace('_', " ") {
        field.verbose_name.clear();
    }
    field.named(new_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_editor::SqliteSchemaEditor;
    use sqlorm_db::fields;

    fn initial() -> ProjectState {
        ProjectState::new()
            .apply(&[Operation::CreateModel {
                name: "Note".into(),
                db_table: "sqlorm_app_note".into(),
                fields: vec![
                    fields::big_auto_field().named("id"),
                    fields::text_field().named("body"),
                ],
                options: StateOptions::default(),
            }])
            .unwrap()
    }

    #[test]
    fn test_state_forwards_add_and_remove() {
        let state = initial()
            .apply(&[Operation::AddField {
                model_name: "Note".into(),
                field: fields::boolean_field().default(false).named("pinned"),
            }])
            .unwrap();
        assert!(state.get("note").unwrap().field("pinned").is_some());

        let state = state
            .apply(&[Operation::RemoveField {
                model_name: "note".into(),
                name: "pinned".into(),
            }])
            .unwrap();
        assert!(state.get("Note").unwrap().field("pinned").is_none());
    }

    #[test]
    fn test_state_errors() {
        let err = initial()
            .apply(&[Operation::RemoveField {
                model_name: "Note".into(),
                name: "missing".into(),
            }])
            .unwrap_err();
        assert_eq!(err.kind(), "MigrationError");
        assert!(initial()
            .apply(&[Operation::DeleteModel { name: "Ghost".into() }])
            .is_err());
    }

    #[test]
    fn test_rename_moves_derived_column() {
        let state = initial()
            .apply(&[
                Operation::AddIndex {
                    model_name: "Note".into(),
                    index: Index::new(&["body"]),
                },
                Operation::RenameField {
                    model_name: "Note".into(),
                    old_name: "body".into(),
                    new_name: "content".into(),
                },
            ])
            .unwrap();
        let note = state.get("Note").unwrap();
        let field = note.field("content").unwrap();
        assert_eq!(field.column, "content");
        assert_eq!(field.verbose_name, "content");
        assert_eq!(note.options.indexes[0].fields, vec!["content"]);
    }

    #[test]
    fn test_forwards_and_backwards_sql() {
        let before = initial();
        let op = Operation::RenameField {
            model_name: "Note".into(),
            old_name: "body".into(),
            new_name: "content".into(),
        };
        let after = before.apply(std::slice::from_ref(&op)).unwrap();
        assert_eq!(
            op.database_forwards(&SqliteSchemaEditor, &before, &after).unwrap(),
            vec!["ALTER TABLE \"sqlorm_app_note\" RENAME COLUMN \"body\" TO \"content\""]
        );
        assert_eq!(
            op.database_backwards(&SqliteSchemaEditor, &before, &after).unwrap(),
            vec!["ALTER TABLE \"sqlorm_app_note\" RENAME COLUMN \"content\" TO \"body\""]
        );

        let create = Operation::CreateModel {
            name: "Tag".into(),
            db_table: "sqlorm_app_tag".into(),
            fields: vec![fields::big_auto_field().named("id")],
            options: StateOptions::default(),
        };
        let with_tag = after.apply(std::slice::from_ref(&create)).unwrap();
        assert_eq!(
            create.database_backwards(&SqliteSchemaEditor, &after, &with_tag).unwrap(),
            vec!["DROP TABLE IF EXISTS \"sqlorm_app_tag\""]
        );
    }

    #[test]
    fn test_run_sql_reversibility() {
        let op = Operation::RunSql {
            sql: "UPDATE t SET x = 1".into(),
            reverse_sql: None,
        };
        assert!(!op.reversible());
        let state = ProjectState::new();
        assert!(op.database_backwards(&SqliteSchemaEditor, &state, &state).is_err());
        assert_eq!(op.model_name(), None);
    }

    #[test]
    fn test_serialized_tag() {
        let op = Operation::DeleteModel { name: "Note".into() };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, serde_json::json!({"type": "DeleteModel", "name": "Note"}));
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
        assert_eq!(op.describe(), "Delete model Note");
    }
}
