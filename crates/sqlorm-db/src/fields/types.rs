//! Field type definitions.
//!
//! Each [`FieldType`] variant corresponds to a Django model field class, and
//! [`FieldDef`] captures everything about one column: type, constraints,
//! default and the conversions between Rust values and stored values.

use sqlorm_core::error::ValidationError;

use crate::value::Value;

/// The type of a model field, determining its column type and conversions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    /// Auto-incrementing 32-bit integer primary key.
    AutoField,
    /// Auto-incrementing 64-bit integer primary key.
    BigAutoField,
    /// Variable-length string with a max length.
    CharField,
    /// Unlimited-length text.
    TextField,
    IntegerField,
    BigIntegerField,
    SmallIntegerField,
    /// Non-negative integer.
    PositiveIntegerField,
    FloatField,
    /// Fixed-precision decimal number, handled as `f64` in Rust.
    DecimalField {
        max_digits: u32,
        decimal_places: u32,
    },
    BooleanField,
    DateField,
    DateTimeField,
    TimeField,
    /// Duration stored as whole microseconds.
    DurationField,
    UuidField,
    BinaryField,
    JsonField,
    /// Email address (CharField with format validation).
    EmailField,
    UrlField,
    SlugField,
    /// Many-to-one relationship stored as `<name>_id`.
    ForeignKey {
        /// The target model name.
        to: String,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
        /// The target table, resolved when the model is built.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_table: Option<String>,
    },
    /// One-to-one relationship (unique foreign key).
    OneToOneField {
        to: String,
        on_delete: OnDelete,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_table: Option<String>,
    },
}

/// Behavior when a referenced row is deleted (ON DELETE action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OnDelete {
    Cascade,
    Protect,
    SetNull,
    SetDefault,
    DoNothing,
}

impl OnDelete {
    /// Parses Django spellings such as `CASCADE` or `models.SET_NULL`.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.rsplit('.').next().unwrap_or(name);
        match name.to_ascii_uppercase().as_str() {
            "CASCADE" => Some(Self::Cascade),
            "PROTECT" | "RESTRICT" => Some(Self::Protect),
            "SET_NULL" | "SETNULL" => Some(Self::SetNull),
            "SET_DEFAULT" | "SETDEFAULT" => Some(Self::SetDefault),
            "DO_NOTHING" | "DONOTHING" => Some(Self::DoNothing),
            _ => None,
        }
    }
}

impl FieldType {
    /// The Django class name of this type.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AutoField => "AutoField",
            Self::BigAutoField => "BigAutoField",
            Self::CharField => "CharField",
            Self::TextField => "TextField",
            Self::IntegerField => "IntegerField",
            Self::BigIntegerField => "BigIntegerField",
            Self::SmallIntegerField => "SmallIntegerField",
            Self::PositiveIntegerField => "PositiveIntegerField",
            Self::FloatField => "FloatField",
            Self::DecimalField { .. } => "DecimalField",
            Self::BooleanField => "BooleanField",
            Self::DateField => "DateField",
            Self::DateTimeField => "DateTimeField",
            Self::TimeField => "TimeField",
            Self::DurationField => "DurationField",
            Self::UuidField => "UUIDField",
            Self::BinaryField => "BinaryField",
            Self::JsonField => "JSONField",
            Self::EmailField => "EmailField",
            Self::UrlField => "URLField",
            Self::SlugField => "SlugField",
            Self::ForeignKey { .. } => "ForeignKey",
            Self::OneToOneField { .. } => "OneToOneField",
        }
    }

    /// Returns `true` for auto-incrementing primary key types.
    pub const fn is_auto(&self) -> bool {
        matches!(self, Self::AutoField | Self::BigAutoField)
    }

    /// Returns `true` for types stored as bounded strings.
    pub const fn is_char_like(&self) -> bool {
        matches!(
            self,
            Self::CharField | Self::EmailField | Self::UrlField | Self::SlugField
        )
    }

    /// The referenced model name for relation types.
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::ForeignKey { to, .. } | Self::OneToOneField { to, .. } => Some(to),
            _ => None,
        }
    }
}

/// Complete definition of a model field.
///
/// Fields are usually created through the constructors in
/// [`fields`](crate::fields) and receive their name when attached to a model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldDef {
    /// The attribute name of this field.
    pub name: String,
    /// The database column name (`<name>_id` for relations).
    pub column: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default)]
    pub primary_key: bool,
    /// Whether NULL is allowed in the database.
    #[serde(default)]
    pub null: bool,
    #[serde(default)]
    pub blank: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub db_index: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Set to the current time on every save.
    #[serde(default)]
    pub auto_now: bool,
    /// Set to the current time when the row is first inserted.
    #[serde(default)]
    pub auto_now_add: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub help_text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verbose_name: String,
    /// Allowed values as (value, label) pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<(Value, String)>>,
}

impl FieldDef {
    /// Creates a new `FieldDef`. Relation fields get an `_id` column.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let mut field = Self {
            name: String::new(),
            column: String::new(),
            field_type,
            primary_key: false,
            null: false,
            blank: false,
            default: None,
            unique: false,
            db_index: false,
            max_length: None,
            auto_now: false,
            auto_now_add: false,
            help_text: String::new(),
            verbose_name: String::new(),
            choices: None,
        };
        let name = name.into();
        if !name.is_empty() {
            field = field.named(name);
        }
        field
    }

    /// Assigns the attribute name, deriving the column and verbose name when
    /// they were not set explicitly.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        if self.column.is_empty() {
            self.column = if self.is_relation() {
                format!("{}_id", self.name)
            } else {
                self.name.clone()
            };
        }
        if self.verbose_name.is_empty() {
            self.verbose_name = self.name.replace('_', " ");
        }
        self
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allows NULL values in the database.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    #[must_use]
    pub const fn blank(mut self) -> Self {
        self.blank = true;
        self
    }

    #[must_use]
    pub const fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub const fn db_index(mut self) -> Self {
        self.db_index = true;
        self
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub const fn auto_now(mut self) -> Self {
        self.auto_now = true;
        self
    }

    #[must_use]
    pub const fn auto_now_add(mut self) -> Self {
        self.auto_now_add = true;
        self
    }

    #[must_use]
    pub fn choices(mut self, choices: Vec<(Value, String)>) -> Self {
        self.choices = Some(choices);
        self
    }

    #[must_use]
    pub fn verbose_name(mut self, name: impl Into<String>) -> Self {
        self.verbose_name = name.into();
        self
    }

    #[must_use]
    pub fn help_text(mut self, text: impl Into<String>) -> Self {
        self.help_text = text.into();
        self
    }

    /// Returns `true` if this field references another model.
    pub const fn is_relation(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. }
        )
    }

    /// Whether the database assigns this field's value on insert.
    pub const fn is_auto(&self) -> bool {
        self.primary_key && self.field_type.is_auto()
    }

    /// The value a new instance starts with.
    pub fn get_default(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }

    /// Normalizes a user-supplied value before it is written.
    pub fn to_db(&self, value: Value) -> Value {
        match (&self.field_type, value) {
            (_, Value::Null) => Value::Null,
            (FieldType::BooleanField, v @ Value::Int(_)) => v.as_bool().map_or(v, Value::Bool),
            (FieldType::DateTimeField, Value::String(s)) => {
                parse_datetime(&s).map_or(Value::String(s), Value::DateTime)
            }
            (FieldType::DateField, Value::String(s)) => {
                parse_date(&s).map_or(Value::String(s), Value::Date)
            }
            (FieldType::JsonField, Value::Json(j)) => Value::Json(j),
            (FieldType::JsonField, other) => Value::Json(other.to_json()),
            (FieldType::FloatField | FieldType::DecimalField { .. }, Value::Int(i)) => {
                Value::Float(i as f64)
            }
            (_, other) => other,
        }
    }

    /// Converts a stored value back into the field's natural representation.
    /// `SQLite` returns booleans as integers and dates, UUIDs and JSON as text.
    pub fn from_db(&self, value: Value) -> Value {
        match (&self.field_type, value) {
            (_, Value::Null) => Value::Null,
            (FieldType::BooleanField, v @ Value::Int(_)) => v.as_bool().map_or(v, Value::Bool),
            (FieldType::DateTimeField, Value::String(s)) => {
                parse_datetime(&s).map_or(Value::String(s), Value::DateTime)
            }
            (FieldType::DateField, Value::String(s)) => {
                parse_date(&s).map_or(Value::String(s), Value::Date)
            }
            (FieldType::TimeField, Value::String(s)) => {
                chrono::NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
                    .map_or(Value::String(s), Value::Time)
            }
            (FieldType::UuidField, Value::String(s)) => {
                uuid::Uuid::parse_str(&s).map_or(Value::String(s), Value::Uuid)
            }
            (FieldType::JsonField, Value::String(s)) => {
                serde_json::from_str(&s).map_or(Value::String(s), Value::Json)
            }
            (FieldType::FloatField | FieldType::DecimalField { .. }, Value::Int(i)) => {
                Value::Float(i as f64)
            }
            (FieldType::DecimalField { .. }, Value::String(s)) => {
                s.parse().map_or(Value::String(s), Value::Float)
            }
            (_, other) => other,
        }
    }

    /// Checks nullability, length, sign and choices.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if value.is_null() {
            if self.null || self.is_auto() || self.auto_now || self.auto_now_add {
                return Ok(());
            }
            return Err(ValidationError::new("This field cannot be null.", "null")
                .with_param("field", self.name.clone()));
        }

        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            let len = s.chars().count();
            if len > max {
                return Err(ValidationError::new(
                    format!(
                        "Ensure this value has at most {max} characters (it has {len})."
                    ),
                    "max_length",
                )
                .with_param("max", max.to_string()));
            }
        }

        if matches!(self.field_type, FieldType::PositiveIntegerField)
            && value.as_int().is_some_and(|i| i < 0)
        {
            return Err(ValidationError::new(
                "Ensure this value is greater than or equal to 0.",
                "min_value",
            ));
        }

        if matches!(self.field_type, FieldType::EmailField) {
            if let Some(s) = value.as_str() {
                if !looks_like_email(s) {
                    return Err(ValidationError::new(
                        "Enter a valid email address.",
                        "invalid",
                    ));
                }
            }
        }

        if let Some(choices) = &self.choices {
            if !choices.iter().any(|(choice, _)| choice == value) {
                return Err(ValidationError::new(
                    format!("Value {value} is not a valid choice."),
                    "invalid_choice",
                ));
            }
        }
        Ok(())
    }
}

fn looks_like_email(s: &str) -> bool {
    let mut parts = s.splitn(2, '@');
    match (parts.next(), parts.next()) {
        (Some(local), Some(domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        _ => false,
    }
}

/// Parses `YYYY-MM-DD HH:MM:SS[.f]`, accepting `T` as separator.
pub fn parse_datetime(s: &str) -> Option<chrono::NaiveDateTime> {
    let normalized = s.trim().replacen('T', " ", 1);
    let without_zone = normalized
        .strip_suffix('Z')
        .unwrap_or(&normalized)
        .split('+')
        .next()
        .unwrap_or(&normalized)
        .to_string();
    chrono::NaiveDateTime::parse_from_str(&without_zone, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(&without_zone, "%Y-%m-%d %H:%M"))
        .ok()
}

/// Parses `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}
