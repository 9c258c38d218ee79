//! Project state and change detection.
//!
//! A [`ProjectState`] is a snapshot of every model's schema: table, fields
//! and table-level options. The current state comes from the model
//! registry; the historical state is rebuilt by replaying migration files.
//! [`MigrationAutodetector`] diffs the two and returns the operations that
//! turn one into the other.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlorm_core::error::{SqlormError, SqlormResult};
use sqlorm_db::fields::{FieldDef, FieldType};
use sqlorm_db::model::{Index, ModelDefinition};

use crate::operations::Operation;

/// Table-level options that affect the schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateOptions {
    pub unique_together: Vec<Vec<String>>,
    pub indexes: Vec<Index>,
}

impl StateOptions {
    fn is_empty(&self) -> bool {
        self.unique_together.is_empty() && self.indexes.is_empty()
    }
}

/// The schema of one model at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// The model name as declared (`Book`).
    pub name: String,
    pub db_table: String,
    pub fields: Vec<FieldDef>,
    #[serde(default, skip_serializing_if = "StateOptions::is_empty")]
    pub options: StateOptions,
}

impl ModelState {
    pub fn new(name: impl Into<String>, db_table: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            db_table: db_table.into(),
            fields,
            options: StateOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: StateOptions) -> Self {
        self.options = options;
        self
    }

    /// Captures the schema of a built model.
    pub fn from_definition(model: &ModelDefinition) -> Self {
        Self {
            name: model.name().to_string(),
            db_table: model.table_name().to_string(),
            fields: model.fields().to_vec(),
            options: StateOptions {
                unique_together: model.options().unique_together.clone(),
                indexes: model.options().indexes.clone(),
            },
        }
    }

    /// The key models are stored under: the lowercase name.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// The column behind a field name, or the name itself when the model
    /// has no such field.
    pub fn column_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.field(name).map_or(name, |f| f.column.as_str())
    }

    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.column.as_str()).collect()
    }

    pub fn pk_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.primary_key)
    }
}

/// Every model of the project, keyed by lowercase model name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectState {
    pub models: BTreeMap<String, ModelState>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state of the given models. Abstract models are skipped.
    pub fn from_models<'a>(models: impl IntoIterator<Item = &'a ModelDefinition>) -> Self {
        let mut state = Self::new();
        for model in models {
            if !model.is_abstract() {
                state.add_model(ModelState::from_definition(model));
            }
        }
        state
    }

    pub fn add_model(&mut self, model: ModelState) {
        self.models.insert(model.key(), model);
    }

    pub fn get(&self, name: &str) -> Option<&ModelState> {
        self.models.get(&name.to_lowercase())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ModelState> {
        self.models.get_mut(&name.to_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<ModelState> {
        self.models.remove(&name.to_lowercase())
    }

    /// Like [`get`](Self::get), but a missing model is a `MigrationError`.
    pub fn model(&self, name: &str) -> SqlormResult<&ModelState> {
        self.get(name).ok_or_else(|| {
            SqlormError::MigrationError(format!("Model '{name}' is not in the migration state"))
        })
    }

    pub fn model_mut(&mut self, name: &str) -> SqlormResult<&mut ModelState> {
        self.get_mut(name).ok_or_else(|| {
            SqlormError::MigrationError(format!("Model '{name}' is not in the migration state"))
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Applies `operations` in order and returns the resulting state.
    pub fn apply(&self, operations: &[Operation]) -> SqlormResult<Self> {
        let mut state = self.clone();
        for op in operations {
            op.state_forwards(&mut state)?;
        }
        Ok(state)
    }
}

/// Diffs two project states.
///
/// Detected changes, in the order they are emitted:
/// - new models (`CreateModel`, targets of foreign keys first)
/// - renamed fields (one field removed and one added that only differ by name)
/// - added, removed and altered fields
/// - changed `unique_together` and added or removed indexes
/// - deleted models
pub struct MigrationAutodetector<'a> {
    from_state: &'a ProjectState,
    to_state: &'a ProjectState,
}

impl<'a> MigrationAutodetector<'a> {
    pub fn new(from_state: &'a ProjectState, to_state: &'a ProjectState) -> Self {
        Self {
            from_state,
            to_state,
        }
    }

    pub fn changes(&self) -> Vec<Operation> {
        let mut ops = self.created_models();
        for (key, new_model) in &self.to_state.models {
            if let Some(old_model) = self.from_state.models.get(key) {
                ops.extend(field_changes(old_model, new_model));
                ops.extend(option_changes(old_model, new_model));
            }
        }
        for (key, old_model) in self.from_state.models.iter().rev() {
            if !self.to_state.models.contains_key(key) {
                ops.push(Operation::DeleteModel {
                    name: old_model.name.clone(),
                });
            }
        }
        ops
    }

    /// `CreateModel` operations ordered so a model comes after the new
    /// models its foreign keys point to.
    fn created_models(&self) -> Vec<Operation> {
        let mut pending: Vec<&ModelState> = self
            .to_state
            .models
            .iter()
            .filter(|(key, _)| !self.from_state.models.contains_key(*key))
            .map(|(_, model)| model)
            .collect();
        let new_keys: BTreeSet<String> = pending.iter().map(|m| m.key()).collect();
        let mut created: BTreeSet<String> = BTreeSet::new();
        let mut ordered = Vec::new();

        while !pending.is_empty() {
            let ready = pending.iter().position(|model| {
                model.fields.iter().all(|f| {
                    f.field_type.related_model().map_or(true, |target| {
                        let target = target.to_lowercase();
                        target == model.key()
                            || target == "self"
                            || !new_keys.contains(&target)
                            || created.contains(&target)
                    })
                })
            });
            // A cycle between new models: emit the rest in name order.
            let model = pending.remove(ready.unwrap_or(0));
            created.insert(model.key());
            ordered.push(Operation::CreateModel {
                name: model.name.clone(),
                db_table: model.db_table.clone(),
                fields: model.fields.clone(),
                options: model.options.clone(),
            });
        }
        ordered
    }
}

fn field_changes(old_model: &ModelState, new_model: &ModelState) -> Vec<Operation> {
    let mut ops = Vec::new();
    let model_name = new_model.name.clone();
    let mut added: Vec<&FieldDef> = new_model
        .fields
        .iter()
        .filter(|f| old_model.field(&f.name).is_none())
        .collect();
    let mut removed: Vec<&FieldDef> = old_model
        .fields
        .iter()
        .filter(|f| new_model.field(&f.name).is_none())
        .collect();

    if let ([new_field], [old_field]) = (added.as_slice(), removed.as_slice()) {
        if same_apart_from_name(old_field, new_field) {
            ops.push(Operation::RenameField {
                model_name: model_name.clone(),
                old_name: old_field.name.clone(),
                new_name: new_field.name.clone(),
            });
            added.clear();
            removed.clear();
        }
    }

    for field in added {
        ops.push(Operation::AddField {
            model_name: model_name.clone(),
            field: field.clone(),
        });
    }
    for field in removed {
        ops.push(Operation::RemoveField {
            model_name: model_name.clone(),
            name: field.name.clone(),
        });
    }
    for new_field in &new_model.fields {
        if let Some(old_field) = old_model.field(&new_field.name) {
            if fields_differ(old_field, new_field) {
                ops.push(Operation::AlterField {
                    model_name: model_name.clone(),
                    name: new_field.name.clone(),
                    field: new_field.clone(),
                });
            }
        }
    }
    ops
}

fn option_changes(old_model: &ModelState, new_model: &ModelState) -> Vec<Operation> {
    let mut ops = Vec::new();
    if old_model.options.unique_together != new_model.options.unique_together {
        ops.push(Operation::AlterUniqueTogether {
            model_name: new_model.name.clone(),
            unique_together: new_model.options.unique_together.clone(),
        });
    }

    let old_names: Vec<String> = old_model
        .options
        .indexes
        .iter()
        .map(|i| i.name_for(&old_model.db_table))
        .collect();
    let new_names: Vec<String> = new_model
        .options
        .indexes
        .iter()
        .map(|i| i.name_for(&new_model.db_table))
        .collect();
    for name in &old_names {
        if !new_names.contains(name) {
            ops.push(Operation::RemoveIndex {
                model_name: new_model.name.clone(),
                name: name.clone(),
            });
        }
    }
    for (index, name) in new_model.options.indexes.iter().zip(&new_names) {
        if !old_names.contains(name) {
            ops.push(Operation::AddIndex {
                model_name: new_model.name.clone(),
                index: index.clone().named(name.clone()),
            });
        }
    }
    ops
}

/// A field with only its name and derived column changed is a rename.
fn same_apart_from_name(old: &FieldDef, new: &FieldDef) -> bool {
    let derived = |f: &FieldDef| matches!(
        f.column.strip_suffix("_id"),
        Some(base) if base == f.name
    ) || f.column == f.name;
    if !(derived(old) && derived(new)) {
        return false;
    }
    let mut renamed = old.clone();
    renamed.name.clone_from(&new.name);
    renamed.column.clone_from(&new.column);
    renamed.verbose_name.clone_from(&new.verbose_name);
    !fields_differ(&renamed, new)
}

/// Differences that change the column. Help text, verbose names, choices
/// and `blank` never reach the database.
fn fields_differ(a: &FieldDef, b: &FieldDef) -> bool {
    relation_free(&a.field_type) != relation_free(&b.field_type)
        || a.field_type.related_model().map(str::to_lowercase)
            != b.field_type.related_model().map(str::to_lowercase)
        || a.column != b.column
        || a.null != b.null
        || a.primary_key != b.primary_key
        || a.unique != b.unique
        || a.db_index != b.db_index
        || a.max_length != b.max_length
        || a.default != b.default
}

/// The field type with relation targets blanked, so `to_table` resolution
/// differences don't count as changes.
fn relation_free(field_type: &FieldType) -> FieldType {
    match field_type {
        FieldType::ForeignKey { on_delete, .. } => FieldType::ForeignKey {
            to: String::new(),
            on_delete: *on_delete,
            to_table: None,
        },
        FieldType::OneToOneField { on_delete, .. } => FieldType::OneToOneField {
            to: String::new(),
            on_delete: *on_delete,
            to_table: None,
        },
        other => other.clone(),
    }
}

/// A migration name describing `operations`, `initial` for the first one.
pub fn suggest_name(operations: &[Operation], initial: bool) -> String {
    if initial {
        return "initial".to_string();
    }
    match operations {
        [Operation::CreateModel { name, .. }] => name.to_lowercase(),
        [Operation::DeleteModel { name }] => format!("delete_{}", name.to_lowercase()),
        [Operation::AddField { model_name, field }] => {
            format!("{}_{}", model_name.to_lowercase(), field.name)
        }
        [Operation::RemoveField { model_name, name }] => {
            format!("remove_{}_{name}", model_name.to_lowercase())
        }
        [Operation::AlterField { model_name, name, .. }] => {
            format!("alter_{}_{name}", model_name.to_lowercase())
        }
        [Operation::RenameField {
            model_name,
            new_name,
            ..
        }] => format!("rename_{}_{new_name}", model_name.to_lowercase()),
        _ => format!("auto_{}", chrono::Utc::now().format("%Y%m%d_%H%M")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlorm_db::fields::{self, OnDelete};
    use sqlorm_db::model::ModelBuilder;

    fn state(models: &[ModelState]) -> ProjectState {
        let mut state = ProjectState::new();
        for m in models {
            state.add_model(m.clone());
        }
        state
    }

    fn book(extra: &[(&str, FieldDef)]) -> ModelState {
        let mut fields = vec![
            fields::big_auto_field().named("id"),
            fields::char_field(200).named("title"),
        ];
        for (name, field) in extra {
            fields.push(field.clone().named(*name));
        }
        ModelState::new("Book", "sqlorm_app_book", fields)
    }

    #[test]
    fn test_state_from_definition() {
        let model = ModelBuilder::new("Shelf")
            .field("label", fields::char_field(20))
            .build()
            .unwrap();
        let state = ModelState::from_definition(&model);
        assert_eq!(state.db_table, "sqlorm_app_shelf");
        assert_eq!(state.columns(), vec!["id", "label"]);
        assert_eq!(state.key(), "shelf");
    }

    #[test]
    fn test_new_models_depend_order() {
        let author = ModelState::new(
            "Author",
            "sqlorm_app_author",
            vec![fields::big_auto_field().named("id")],
        );
        let review = ModelState::new(
            "AReview",
            "sqlorm_app_areview",
            vec![
                fields::big_auto_field().named("id"),
                fields::foreign_key("Author", OnDelete::Cascade).named("author"),
            ],
        );
        let to = state(&[author, review]);
        let from = ProjectState::new();
        let ops = MigrationAutodetector::new(&from, &to).changes();
        let names: Vec<_> = ops
            .iter()
            .map(|op| match op {
                Operation::CreateModel { name, .. } => name.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(names, vec!["Author", "AReview"]);
    }

    #[test]
    fn test_add_remove_alter() {
        let from = state(&[book(&[("pages", fields::integer_field())])]);
        let to = state(&[book(&[
            ("pages", fields::integer_field().nullable()),
            ("isbn", fields::char_field(13)),
            ("price", fields::float_field()),
        ])]);
        let ops = MigrationAutodetector::new(&from, &to).changes();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], Operation::AddField { field, .. } if field.name == "isbn"));
        assert!(matches!(&ops[1], Operation::AddField { field, .. } if field.name == "price"));
        assert!(matches!(&ops[2], Operation::AlterField { name, .. } if name == "pages"));

        let back = MigrationAutodetector::new(&to, &from).changes();
        let removed: Vec<_> = back
            .iter()
            .filter_map(|op| match op {
                Operation::RemoveField { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec!["isbn", "price"]);
    }

    #[test]
    fn test_rename_detected() {
        let from = state(&[book(&[("pages", fields::integer_field())])]);
        let to = state(&[book(&[("page_count", fields::integer_field())])]);
        let ops = MigrationAutodetector::new(&from, &to).changes();
        assert_eq!(
            ops,
            vec![Operation::RenameField {
                model_name: "Book".into(),
                old_name: "pages".into(),
                new_name: "page_count".into(),
            }]
        );
    }

    #[test]
    fn test_type_change_is_not_rename() {
        let from = state(&[book(&[("pages", fields::integer_field())])]);
        let to = state(&[book(&[("blurb", fields::text_field())])]);
        let ops = MigrationAutodetector::new(&from, &to).changes();
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_help_text_is_not_a_change() {
        let from = state(&[book(&[("pages", fields::integer_field())])]);
        let to = state(&[book(&[("pages", fields::integer_field().help_text("how many"))])]);
        assert!(MigrationAutodetector::new(&from, &to).changes().is_empty());
    }

    #[test]
    fn test_deleted_model_and_indexes() {
        let tagged = book(&[]).with_options(StateOptions {
            unique_together: vec![],
            indexes: vec![Index::new(&["title"])],
        });
        let gone = ModelState::new("Gone", "sqlorm_app_gone", vec![]);
        let from = state(&[book(&[]), gone]);
        let to = state(&[tagged]);
        let ops = MigrationAutodetector::new(&from, &to).changes();
        assert!(matches!(
            &ops[0],
            Operation::AddIndex { index, .. } if index.name.as_deref() == Some("sqlorm_app_book_title_idx")
        ));
        assert!(matches!(&ops[1], Operation::DeleteModel { name } if name == "Gone"));
    }

    #[test]
    fn test_suggest_name() {
        assert_eq!(suggest_name(&[], true), "initial");
        let add = Operation::AddField {
            model_name: "Book".into(),
            field: fields::integer_field().named("pages"),
        };
        assert_eq!(suggest_name(&[add], false), "book_pages");
        let drop = Operation::DeleteModel { name: "Book".into() };
        assert_eq!(suggest_name(&[drop.clone(), drop], false).len(), "auto_20240101_1200".len());
    }
}
