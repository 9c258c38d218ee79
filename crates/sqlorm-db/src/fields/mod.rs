//! Field definitions and constructors.
//!
//! The functions in this module stand in for Django's field classes:
//! `fields::char_field(100)` plays the role of `models.CharField(max_length=100)`.
//! [`by_name`] and [`from_spec`] build fields from a class name plus keyword
//! options, which is how declarative model files describe them.

pub mod types;

use sqlorm_core::error::{SqlormError, SqlormResult};

pub use types::{parse_date, parse_datetime, FieldDef, FieldType, OnDelete};

use crate::value::Value;

fn unnamed(field_type: FieldType) -> FieldDef {
    FieldDef::new("", field_type)
}

pub fn auto_field() -> FieldDef {
    unnamed(FieldType::AutoField).primary_key()
}

pub fn big_auto_field() -> FieldDef {
    unnamed(FieldType::BigAutoField).primary_key()
}

pub fn char_field(max_length: usize) -> FieldDef {
    unnamed(FieldType::CharField).max_length(max_length)
}

pub fn text_field() -> FieldDef {
    unnamed(FieldType::TextField)
}

pub fn integer_field() -> FieldDef {
    unnamed(FieldType::IntegerField)
}

pub fn big_integer_field() -> FieldDef {
    unnamed(FieldType::BigIntegerField)
}

pub fn small_integer_field() -> FieldDef {
    unnamed(FieldType::SmallIntegerField)
}

pub fn positive_integer_field() -> FieldDef {
    unnamed(FieldType::PositiveIntegerField)
}

pub fn float_field() -> FieldDef {
    unnamed(FieldType::FloatField)
}

pub fn decimal_field(max_digits: u32, decimal_places: u32) -> FieldDef {
    unnamed(FieldType::DecimalField {
        max_digits,
        decimal_places,
    })
}

pub fn boolean_field() -> FieldDef {
    unnamed(FieldType::BooleanField)
}

pub fn date_field() -> FieldDef {
    unnamed(FieldType::DateField)
}

pub fn datetime_field() -> FieldDef {
    unnamed(FieldType::DateTimeField)
}

pub fn time_field() -> FieldDef {
    unnamed(FieldType::TimeField)
}

pub fn duration_field() -> FieldDef {
    unnamed(FieldType::DurationField)
}

pub fn uuid_field() -> FieldDef {
    unnamed(FieldType::UuidField)
}

pub fn binary_field() -> FieldDef {
    unnamed(FieldType::BinaryField)
}

pub fn json_field() -> FieldDef {
    unnamed(FieldType::JsonField)
}

/// An email column, 254 characters by default.
pub fn email_field() -> FieldDef {
    unnamed(FieldType::EmailField).max_length(254)
}

pub fn url_field() -> FieldDef {
    unnamed(FieldType::UrlField).max_length(200)
}

pub fn slug_field() -> FieldDef {
    unnamed(FieldType::SlugField).max_length(50).db_index()
}

/// A many-to-one reference to the model named `to`.
pub fn foreign_key(to: impl Into<String>, on_delete: OnDelete) -> FieldDef {
    unnamed(FieldType::ForeignKey {
        to: to.into(),
        on_delete,
        to_table: None,
    })
}

pub fn one_to_one_field(to: impl Into<String>, on_delete: OnDelete) -> FieldDef {
    unnamed(FieldType::OneToOneField {
        to: to.into(),
        on_delete,
        to_table: None,
    })
    .unique()
}

/// Builds a field from its Django class name and keyword options.
///
/// Recognized options: `max_length`, `null`, `blank`, `unique`, `db_index`,
/// `primary_key`, `default`, `db_column`, `auto_now`, `auto_now_add`,
/// `help_text`, `verbose_name`, `choices`, `max_digits`, `decimal_places`,
/// `to`, `on_delete`.
pub fn by_name(
    type_name: &str,
    options: &serde_json::Map<String, serde_json::Value>,
) -> SqlormResult<FieldDef> {
    let opt_u32 = |key: &str, fallback: u32| {
        options
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(fallback)
    };
    let relation = || -> SqlormResult<(String, OnDelete)> {
        let to = options
            .get("to")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                SqlormError::ModelError(format!("{type_name} requires a 'to' option"))
            })?;
        let on_delete = match options.get("on_delete").and_then(serde_json::Value::as_str) {
            Some(name) => OnDelete::parse(name).ok_or_else(|| {
                SqlormError::ModelError(format!("Unknown on_delete behavior: {name}"))
            })?,
            None => OnDelete::Cascade,
        };
        Ok((to.to_string(), on_delete))
    };

    let mut field = match type_name {
        "AutoField" => auto_field(),
        "BigAutoField" => big_auto_field(),
        "CharField" => char_field(255),
        "TextField" => text_field(),
        "IntegerField" => integer_field(),
        "BigIntegerField" => big_integer_field(),
        "SmallIntegerField" => small_integer_field(),
        "PositiveIntegerField" => positive_integer_field(),
        "FloatField" => float_field(),
        "DecimalField" => decimal_field(opt_u32("max_digits", 10), opt_u32("decimal_places", 2)),
        "BooleanField" => boolean_field(),
        "DateField" => date_field(),
        "DateTimeField" => datetime_field(),
        "TimeField" => time_field(),
        "DurationField" => duration_field(),
        "UUIDField" | "UuidField" => uuid_field(),
        "BinaryField" => binary_field(),
        "JSONField" | "JsonField" => json_field(),
        "EmailField" => email_field(),
        "URLField" | "UrlField" => url_field(),
        "SlugField" => slug_field(),
        "ForeignKey" => {
            let (to, on_delete) = relation()?;
            foreign_key(to, on_delete)
        }
        "OneToOneField" => {
            let (to, on_delete) = relation()?;
            one_to_one_field(to, on_delete)
        }
        other => {
            return Err(SqlormError::ModelError(format!("Unknown field: {other}")));
        }
    };

    for (key, value) in options {
        let flag = value.as_bool().unwrap_or(false);
        match key.as_str() {
            "max_length" => {
                if let Some(n) = value.as_u64().and_then(|n| usize::try_from(n).ok()) {
                    field.max_length = Some(n);
                }
            }
            "null" => field.null = flag,
            "blank" => field.blank = flag,
            "unique" => field.unique = flag,
            "db_index" => field.db_index = flag,
            "primary_key" => field.primary_key = flag,
            "auto_now" => field.auto_now = flag,
            "auto_now_add" => field.auto_now_add = flag,
            "default" => field.default = Some(Value::from_json(value)),
            "db_column" => {
                if let Some(column) = value.as_str() {
                    field.column = column.to_string();
                }
            }
            "help_text" => field.help_text = value.as_str().unwrap_or_default().to_string(),
            "verbose_name" => {
                field.verbose_name = value.as_str().unwrap_or_default().to_string();
            }
            "choices" => field.choices = Some(parse_choices(value)?),
            "max_digits" | "decimal_places" | "to" | "on_delete" | "type" => {}
            other => {
                return Err(SqlormError::ModelError(format!(
                    "Unknown option '{other}' for {type_name}"
                )));
            }
        }
    }
    Ok(field)
}

fn parse_choices(value: &serde_json::Value) -> SqlormResult<Vec<(Value, String)>> {
    let invalid = || SqlormError::ModelError("choices must be a list of [value, label] pairs".into());
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([v, label]) => Ok((
                Value::from_json(v),
                label.as_str().map_or_else(|| label.to_string(), str::to_string),
            )),
            _ => Err(invalid()),
        })
        .collect()
}

/// Builds a field from a spec object such as
/// `{"type": "CharField", "max_length": 100}` or the bare string `"TextField"`.
pub fn from_spec(spec: &serde_json::Value) -> SqlormResult<FieldDef> {
    match spec {
        serde_json::Value::String(type_name) => by_name(type_name, &serde_json::Map::new()),
        serde_json::Value::Object(options) => {
            let type_name = options
                .get("type")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| SqlormError::ModelError("Field spec requires a 'type'".into()))?;
            by_name(type_name, options)
        }
        other => Err(SqlormError::ModelError(format!(
            "Invalid field spec: {other}"
        ))),
    }
}
