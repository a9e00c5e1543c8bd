//! Declarative attribute tables and the engine that applies them.
//!
//! Each resource kind describes its attributes once, as a static [`Schema`].
//! The same engine validates and normalizes manifest records, decides which
//! attributes changed between two records, and whether a change forces the
//! resource to be replaced.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use rootcause::prelude::ResultExt;
use rootcause::{Report, report};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::role::Role;

/// Attribute values of one resource, keyed by attribute name.
pub type Record = Map<String, Value>;

pub type Validator = fn(&str) -> Result<(), String>;
pub type Normalizer = fn(&str) -> String;
pub type DiffSuppressor = fn(&str, &str) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Bool,
    Int,
    /// Unordered strings; stored deduplicated and sorted.
    StringSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    /// Set by the server only.
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Bool(bool),
    Str(&'static str),
}

impl Fallback {
    fn to_value(self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(b),
            Self::Str(s) => Value::String(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub presence: Presence,
    pub fallback: Option<Fallback>,
    /// Changing the value replaces the resource.
    pub force_new: bool,
    /// Checked against the raw value (each element, for sets).
    pub validate: Option<Validator>,
    /// Applied after validation; the result is what gets stored and compared.
    pub normalize: Option<Normalizer>,
    /// Returns true when an old and new value should be treated as equal.
    pub diff_suppress: Option<DiffSuppressor>,
}

impl Field {
    const fn new(name: &'static str, kind: FieldKind, presence: Presence) -> Self {
        Self {
            name,
            kind,
            presence,
            fallback: None,
            force_new: false,
            validate: None,
            normalize: None,
            diff_suppress: None,
        }
    }

    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self::new(name, kind, Presence::Required)
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self::new(name, kind, Presence::Optional)
    }

    pub const fn computed(name: &'static str, kind: FieldKind) -> Self {
        Self::new(name, kind, Presence::Computed)
    }

    pub const fn with_fallback(self, fallback: Fallback) -> Self {
        Self {
            fallback: Some(fallback),
            ..self
        }
    }

    pub const fn force_new(self) -> Self {
        Self {
            force_new: true,
            ..self
        }
    }

    pub const fn validated_by(self, validate: Validator) -> Self {
        Self {
            validate: Some(validate),
            ..self
        }
    }

    pub const fn normalized_by(self, normalize: Normalizer) -> Self {
        Self {
            normalize: Some(normalize),
            ..self
        }
    }

    pub const fn diff_suppressed_by(self, diff_suppress: DiffSuppressor) -> Self {
        Self {
            diff_suppress: Some(diff_suppress),
            ..self
        }
    }

    /// Value used when the attribute is absent.
    fn zero(&self) -> Value {
        match self.kind {
            FieldKind::String => Value::String(String::new()),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Int => Value::from(0),
            FieldKind::StringSet => Value::Array(Vec::new()),
        }
    }

    fn effective(&self, record: &Record) -> Value {
        match record.get(self.name) {
            None | Some(Value::Null) => self.zero(),
            Some(value) => value.clone(),
        }
    }

    fn differs(&self, old: &Record, new: &Record) -> bool {
        let (old, new) = (self.effective(old), self.effective(new));
        if let (Some(suppress), Value::String(a), Value::String(b)) = (self.diff_suppress, &old, &new)
            && suppress(a, b)
        {
            return false;
        }
        old != new
    }

    fn check_string(&self, raw: &str, problems: &mut Vec<String>) -> String {
        if let Some(validate) = self.validate
            && let Err(problem) = validate(raw)
        {
            problems.push(format!("'{}': {problem}", self.name));
        }
        match self.normalize {
            Some(normalize) => normalize(raw),
            None => raw.to_string(),
        }
    }

    fn prepare(&self, raw: &Value, problems: &mut Vec<String>) -> Option<Value> {
        match (self.kind, raw) {
            (FieldKind::String, Value::String(s)) => {
                Some(Value::String(self.check_string(s, problems)))
            }
            (FieldKind::Bool, Value::Bool(_)) => Some(raw.clone()),
            (FieldKind::Int, Value::Number(n)) if n.is_i64() => Some(raw.clone()),
            (FieldKind::StringSet, Value::Array(items)) => {
                let mut set = BTreeSet::new();
                for item in items {
                    let Value::String(s) = item else {
                        problems.push(format!("'{}': every element must be a string", self.name));
                        return None;
                    };
                    set.insert(self.check_string(s, problems));
                }
                Some(Value::Array(set.into_iter().map(Value::String).collect()))
            }
            (kind, _) => {
                problems.push(format!("'{}': expected {kind:?}, got {raw}", self.name));
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct Schema {
    pub kind: &'static str,
    pub fields: &'static [Field],
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validates a manifest record and returns its normalized form, with
    /// fallbacks filled in. All problems are reported together.
    pub fn prepare(&self, raw: &Record) -> Result<Record, Report> {
        let mut problems = Vec::new();
        let mut prepared = Record::new();

        for name in raw.keys() {
            match self.field(name) {
                None => problems.push(format!("'{name}' is not a known attribute")),
                Some(field) if field.presence == Presence::Computed => {
                    problems.push(format!("'{name}' is computed and cannot be set"))
                }
                Some(_) => {}
            }
        }

        for field in self.fields.iter().filter(|f| f.presence != Presence::Computed) {
            match raw.get(field.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if let Some(value) = field.prepare(value, &mut problems) {
                        prepared.insert(field.name.to_string(), value);
                    }
                }
                None => match (field.fallback, field.presence) {
                    (Some(fallback), _) => {
                        let value = fallback.to_value();
                        if let Some(value) = field.prepare(&value, &mut problems) {
                            prepared.insert(field.name.to_string(), value);
                        }
                    }
                    (None, Presence::Required) => {
                        problems.push(format!("'{}' is required", field.name))
                    }
                    (None, _) => {}
                },
            }
        }

        if problems.is_empty() {
            return Ok(prepared);
        }

        let mut error = report!("Invalid {} attributes", self.kind);
        for problem in problems {
            error = error.attach(problem);
        }
        Err(error)
    }

    /// Configurable attributes whose values differ between `old` and `new`.
    pub fn changed_fields(&self, old: &Record, new: &Record) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|f| f.presence != Presence::Computed)
            .filter(|f| f.differs(old, new))
            .map(|f| f.name)
            .collect()
    }

    pub fn requires_replacement(&self, old: &Record, new: &Record) -> bool {
        self.fields
            .iter()
            .any(|f| f.force_new && f.differs(old, new))
    }

    pub fn decode<T: DeserializeOwned>(&self, record: &Record) -> Result<T, Report> {
        let value = serde_json::from_value(Value::Object(record.clone()))
            .context("Decoding resource attributes")
            .attach(format!("kind: '{}'", self.kind))?;
        Ok(value)
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Record, Report> {
        match serde_json::to_value(value)
            .context("Encoding resource attributes")
            .attach(format!("kind: '{}'", self.kind))?
        {
            Value::Object(record) => Ok(record),
            other => Err(report!("Resource attributes must encode to an object")
                .attach(format!("kind: '{}'", self.kind))
                .attach(format!("value: {other}"))),
        }
    }
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("email pattern is valid")
});

pub fn starts_lowercase_alphanumeric(value: &str) -> Result<(), String> {
    match value.chars().next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => Ok(()),
        _ => Err(format!("'{value}' must start with a lowercase letter or a digit")),
    }
}

pub fn email(value: &str) -> Result<(), String> {
    if EMAIL.is_match(value) {
        Ok(())
    } else {
        Err(format!("'{value}' is not a valid email"))
    }
}

pub fn role(value: &str) -> Result<(), String> {
    value
        .parse::<Role>()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

pub fn canonical_role(value: &str) -> String {
    value
        .parse::<Role>()
        .map(|role| role.to_string())
        .unwrap_or_else(|_| value.to_string())
}

pub fn equal_ignoring_case(old: &str, new: &str) -> bool {
    old.eq_ignore_ascii_case(new)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    static WIDGET: Schema = Schema {
        kind: "widget",
        fields: &[
            Field::required("name", FieldKind::String)
                .force_new()
                .validated_by(starts_lowercase_alphanumeric)
                .diff_suppressed_by(equal_ignoring_case),
            Field::optional("role", FieldKind::String)
                .with_fallback(Fallback::Str("User"))
                .validated_by(role)
                .normalized_by(canonical_role),
            Field::optional("email", FieldKind::String).validated_by(email),
            Field::optional("tags", FieldKind::StringSet),
            Field::optional("external", FieldKind::Bool).with_fallback(Fallback::Bool(false)),
            Field::computed("id", FieldKind::Int),
        ],
    };

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn prepare_fills_fallbacks_and_normalizes() {
        let prepared = WIDGET
            .prepare(&record(json!({
                "name": "w1",
                "role": "ADMINISTRATOR",
                "tags": ["b", "a", "b"]
            })))
            .unwrap();

        assert_eq!(
            Value::Object(prepared),
            json!({
                "name": "w1",
                "role": "Administrator",
                "tags": ["a", "b"],
                "external": false
            })
        );
    }

    #[test]
    fn prepare_reports_all_problems() {
        let err = WIDGET
            .prepare(&record(json!({
                "name": "W1",
                "role": "root",
                "email": "not-an-email",
                "external": "yes",
                "id": 4,
                "colour": "red"
            })))
            .unwrap_err();
        let rendered = format!("{err:?}");

        assert!(rendered.contains("Invalid widget attributes"));
        assert!(rendered.contains("must start with a lowercase letter"));
        assert!(rendered.contains("unknown role 'root'"));
        assert!(rendered.contains("is not a valid email"));
        assert!(rendered.contains("'external': expected Bool"));
        assert!(rendered.contains("'id' is computed"));
        assert!(rendered.contains("'colour' is not a known attribute"));
    }

    #[test]
    fn prepare_requires_required_fields() {
        let err = WIDGET.prepare(&Record::new()).unwrap_err();

        assert!(format!("{err:?}").contains("'name' is required"));
    }

    #[test]
    fn email_accepts_common_addresses() {
        assert!(email("ops+dns@example.co.uk").is_ok());
        assert!(email("a@b").is_ok());
        assert!(email("@example.com").is_err());
        assert!(email("ops@-example.com").is_err());
    }

    #[test]
    fn changed_fields_treats_absent_as_empty() {
        let old = record(json!({ "name": "w1", "email": "", "tags": [], "id": 3 }));
        let new = record(json!({ "name": "w1" }));

        assert!(WIDGET.changed_fields(&old, &new).is_empty());
    }

    #[test]
    fn changed_fields_ignores_computed_and_suppressed() {
        let old = record(json!({ "name": "web", "email": "a@example.com", "id": 3 }));
        let new = record(json!({ "name": "WEB", "email": "b@example.com", "id": 4 }));

        assert_eq!(WIDGET.changed_fields(&old, &new), vec!["email"]);
        assert!(!WIDGET.requires_replacement(&old, &new));
    }

    #[test]
    fn force_new_change_requires_replacement() {
        let old = record(json!({ "name": "web" }));
        let new = record(json!({ "name": "api" }));

        assert!(WIDGET.requires_replacement(&old, &new));
    }

    #[test]
    fn encode_and_decode_typed_attributes() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Widget {
            name: String,
            #[serde(default)]
            tags: Vec<String>,
        }

        let widget = Widget {
            name: "w1".to_string(),
            tags: vec!["a".to_string()],
        };
        let encoded = WIDGET.encode(&widget).unwrap();

        assert_eq!(WIDGET.decode::<Widget>(&encoded).unwrap(), widget);
        assert!(WIDGET.encode(&"just a string").is_err());
    }
}
