//! `prefetch_related`: one extra query per relation instead of one per row.
//!
//! A forward foreign key (`"author"`) loads every referenced target with a
//! single `pk IN (...)` query; a reverse relation (`"book_set"` or `"book"`)
//! loads every child whose foreign key points at one of the fetched rows.
//! Results are cached on each instance and read back through
//! [`Instance::related`] or [`Instance::prefetched_set`].

use std::collections::HashMap;

use sqlorm_core::error::{SqlormError, SqlormResult};

use crate::executor::DbExecutor;
use crate::instance::{related_model, reverse_field, Instance, Prefetched};
use crate::query::lookups::{Lookup, Q};
use crate::query::queryset::QuerySet;
use crate::registry::registry;
use crate::value::Value;

/// A relation to load alongside a queryset, Django's `Prefetch()`.
#[derive(Debug, Clone)]
pub struct Prefetch {
    lookup: String,
    queryset: Option<QuerySet>,
    to_attr: Option<String>,
}

impl Prefetch {
    pub fn new(lookup: impl Into<String>) -> Self {
        Self {
            lookup: lookup.into(),
            queryset: None,
            to_attr: None,
        }
    }

    /// Loads the related rows through `queryset` (filtered, ordered...).
    #[must_use]
    pub fn queryset(mut self, queryset: QuerySet) -> Self {
        self.queryset = Some(queryset);
        self
    }

    /// Caches the result under `name` instead of the lookup.
    #[must_use]
    pub fn to_attr(mut self, name: impl Into<String>) -> Self {
        self.to_attr = Some(name.into());
        self
    }

    pub fn lookup(&self) -> &str {
        &self.lookup
    }

    fn cache_name(&self) -> &str {
        self.to_attr.as_deref().unwrap_or(&self.lookup)
    }
}

impl From<&str> for Prefetch {
    fn from(lookup: &str) -> Self {
        Self::new(lookup)
    }
}

fn key(value: &Value) -> String {
    value.to_string()
}

fn dedup(values: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    values.filter(|v| seen.insert(key(v))).collect()
}

/// Runs every prefetch against `instances` and caches the results on them.
pub(crate) async fn prefetch_related_objects(
    prefetches: &[Prefetch],
    instances: &mut [Instance],
    db: &dyn DbExecutor,
) -> SqlormResult<()> {
    let Some(first) = instances.first() else {
        return Ok(());
    };
    let model = first.model().clone();

    for prefetch in prefetches {
        let name = prefetch.lookup.as_str();
        if let Some(field) = model.field(name).filter(|f| f.is_relation()) {
            let target = related_model(&model, field.field_type.related_model().unwrap_or_default())?;
            let keys = dedup(
                instances
                    .iter()
                    .filter_map(|i| i.get(&field.name).filter(|v| !v.is_null()).cloned()),
            );
            let related = if keys.is_empty() {
                Vec::new()
            } else {
                let base = prefetch.queryset.clone().unwrap_or_else(|| target.objects().all());
                base.filter(Q::filter("pk", Lookup::In(keys))).fetch(db).await?
            };
            let by_pk: HashMap<String, Instance> = related
                .into_iter()
                .filter_map(|r| r.pk().map(key).map(|k| (k, r)))
                .collect();
            for instance in instances.iter_mut() {
                let target = instance
                    .get(&field.name)
                    .and_then(|v| by_pk.get(&key(v)))
                    .cloned()
                    .map(Box::new);
                instance.set_prefetched(prefetch.cache_name(), Prefetched::One(target));
            }
            continue;
        }

        let child_name = name.strip_suffix("_set").unwrap_or(name);
        let child = registry()
            .get_lowercase(child_name)
            .filter(|child| reverse_field(child, &model).is_some())
            .ok_or_else(|| {
                SqlormError::QueryError(format!(
                    "Cannot find '{name}' on {} object, '{name}' is an invalid parameter to prefetch_related()",
                    model.name()
                ))
            })?;
        let fk = reverse_field(&child, &model).unwrap_or_default();
        let pks = dedup(instances.iter().filter_map(|i| i.pk().cloned()));
        let children = if pks.is_empty() {
            Vec::new()
        } else {
            let base = prefetch.queryset.clone().unwrap_or_else(|| child.objects().all());
            base.filter(Q::filter(fk.as_str(), Lookup::In(pks))).fetch(db).await?
        };
        let mut groups: HashMap<String, Vec<Instance>> = HashMap::new();
        for row in children {
            if let Some(parent) = row.get(&fk).filter(|v| !v.is_null()) {
                groups.entry(key(parent)).or_default().push(row);
            }
        }
        for instance in instances.iter_mut() {
            let items = instance
                .pk()
                .and_then(|pk| groups.get(&key(pk)))
                .cloned()
                .unwrap_or_default();
            instance.set_prefetched(prefetch.cache_name(), Prefetched::Many(items));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{self, OnDelete};
    use crate::model::ModelBuilder;
    use crate::query::compiler::{DatabaseBackendType, Row};
    use crate::test_utils::MockDb;

    fn row(columns: &[&str], values: Vec<Value>) -> Row {
        Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
    }

    #[tokio::test]
    async fn test_forward_prefetch_uses_one_query() {
        ModelBuilder::new("PfAuthor")
            .field("name", fields::char_field(20))
            .register()
            .unwrap();
        let book = ModelBuilder::new("PfBook")
            .field("title", fields::char_field(20))
            .field("author", fields::foreign_key("PfAuthor", OnDelete::Cascade))
            .register()
            .unwrap();

        let db = MockDb::with_responses(
            DatabaseBackendType::SQLite,
            vec![
                vec![
                    row(&["id", "title", "author_id"], vec![Value::Int(1), Value::from("A"), Value::Int(7)]),
                    row(&["id", "title", "author_id"], vec![Value::Int(2), Value::from("B"), Value::Int(7)]),
                ],
                vec![row(&["id", "name"], vec![Value::Int(7), Value::from("Ann")])],
            ],
        );
        let books = book
            .objects()
            .all()
            .prefetch_related(&["author"])
            .fetch(&db)
            .await
            .unwrap();
        assert_eq!(books.len(), 2);
        let author = books[1].related("author", &db).await.unwrap().unwrap();
        assert_eq!(author.get("name"), Some(&Value::from("Ann")));

        let stmts = db.statements().await;
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].0.contains("\"id\" IN (?)"));
        assert_eq!(stmts[1].1, vec![Value::Int(7)]);
    }

    #[tokio::test]
    async fn test_reverse_prefetch_groups_children() {
        let shelf = ModelBuilder::new("PfShelf")
            .field("label", fields::char_field(20))
            .register()
            .unwrap();
        ModelBuilder::new("PfVolume")
            .field("shelf", fields::foreign_key("PfShelf", OnDelete::Cascade))
            .register()
            .unwrap();

        let db = MockDb::with_responses(
            DatabaseBackendType::SQLite,
            vec![
                vec![
                    row(&["id", "label"], vec![Value::Int(1), Value::from("x")]),
                    row(&["id", "label"], vec![Value::Int(2), Value::from("y")]),
                ],
                vec![
                    row(&["id", "shelf_id"], vec![Value::Int(10), Value::Int(1)]),
                    row(&["id", "shelf_id"], vec![Value::Int(11), Value::Int(1)]),
                ],
            ],
        );
        let shelves = shelf
            .objects()
            .all()
            .prefetch_related(&["pfvolume_set"])
            .fetch(&db)
            .await
            .unwrap();
        assert_eq!(shelves[0].prefetched_set("pfvolume_set").unwrap().len(), 2);
        assert!(shelves[1].prefetched_set("pfvolume_set").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_prefetch_is_an_error() {
        let lonely = ModelBuilder::new("PfLonely").register().unwrap();
        let db = MockDb::with_responses(
            DatabaseBackendType::SQLite,
            vec![vec![row(&["id"], vec![Value::Int(1)])]],
        );
        let err = lonely
            .objects()
            .all()
            .prefetch_related(&["nothing"])
            .fetch(&db)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid parameter to prefetch_related()"));
    }
}
