//! Document model
//!
//! Records are JSON objects keyed by `_id`. Sensitive fields are addressed by
//! a [`FieldPath`] that is either top-level (`mrn`) or one level nested
//! (`demographics.postcode`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::result::{Error, Result};

/// Key under which every document stores its identifier
pub const ID_FIELD: &str = "_id";

/// Path to a field, at most one level deep
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    parent: Option<String>,
    leaf: String,
}

impl FieldPath {
    pub fn top(leaf: impl Into<String>) -> Self {
        Self { parent: None, leaf: leaf.into() }
    }

    pub fn nested(parent: impl Into<String>, leaf: impl Into<String>) -> Self {
        Self { parent: Some(parent.into()), leaf: leaf.into() }
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn leaf(&self) -> &str {
        &self.leaf
    }

    /// Sibling path with `suffix` appended to the leaf (`demographics.x` -> `demographics.x_hash`)
    pub fn with_leaf_suffix(&self, suffix: &str) -> Self {
        Self {
            parent: self.parent.clone(),
            leaf: format!("{}{}", self.leaf, suffix),
        }
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::validation(format!("invalid field path '{s}'")));
        }
        match parts.as_slice() {
            [leaf] => Ok(Self::top(*leaf)),
            [parent, leaf] => Ok(Self::nested(*parent, *leaf)),
            _ => Err(Error::validation(format!(
                "field path '{s}' nests deeper than one level"
            ))),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}.{}", parent, self.leaf),
            None => f.write_str(&self.leaf),
        }
    }
}

impl Serialize for FieldPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Empty document with a fresh random id
    pub fn new() -> Self {
        let mut map = Map::new();
        map.insert(
            ID_FIELD.to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build from an arbitrary JSON value; only objects are documents
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::validation(format!(
                "document must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Document identifier; numeric ids are rendered as strings
    pub fn id(&self) -> Option<String> {
        match self.0.get(ID_FIELD)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Identifier or a validation error
    pub fn require_id(&self) -> Result<String> {
        self.id()
            .ok_or_else(|| Error::validation("document has no string or numeric _id"))
    }

    /// Value at `path`; a missing or non-object parent means absent
    pub fn get_path(&self, path: &FieldPath) -> Option<&Value> {
        match path.parent() {
            None => self.0.get(path.leaf()),
            Some(parent) => self.0.get(parent)?.as_object()?.get(path.leaf()),
        }
    }

    /// String value at `path`, if it is a string
    pub fn get_str(&self, path: &FieldPath) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    /// Set the value at `path`, creating the parent object if needed.
    ///
    /// Fails if the parent exists and is not an object.
    pub fn set_path(&mut self, path: &FieldPath, value: Value) -> Result<()> {
        match path.parent() {
            None => {
                self.0.insert(path.leaf().to_string(), value);
                Ok(())
            }
            Some(parent) => {
                let slot = self
                    .0
                    .entry(parent.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if slot.is_null() {
                    *slot = Value::Object(Map::new());
                }
                match slot {
                    Value::Object(obj) => {
                        obj.insert(path.leaf().to_string(), value);
                        Ok(())
                    }
                    other => Err(Error::validation(format!(
                        "cannot set '{}': '{}' is a {}",
                        path,
                        parent,
                        json_kind(other)
                    ))),
                }
            }
        }
    }

    /// Remove the value at `path`, returning it
    pub fn remove_path(&mut self, path: &FieldPath) -> Option<Value> {
        match path.parent() {
            None => self.0.remove(path.leaf()),
            Some(parent) => self.0.get_mut(parent)?.as_object_mut()?.remove(path.leaf()),
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

impl TryFrom<Value> for Document {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Document::from_value(value)
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Predicate over documents, used for selection queries
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document
    All,
    /// Field present and not null
    Exists(FieldPath),
    /// Field absent or null
    Missing(FieldPath),
    /// Field is a string equal to the value
    Equals(FieldPath, String),
    /// Field is a string starting with the prefix
    StartsWith(FieldPath, String),
    /// Field present, not null and not a blank string
    NonEmpty(FieldPath),
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Exists(path) => !matches!(doc.get_path(path), None | Some(Value::Null)),
            Filter::Missing(path) => matches!(doc.get_path(path), None | Some(Value::Null)),
            Filter::Equals(path, expected) => doc.get_str(path) == Some(expected.as_str()),
            Filter::StartsWith(path, prefix) => doc
                .get_str(path)
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            Filter::NonEmpty(path) => match doc.get_path(path) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            },
            Filter::Not(inner) => !inner.matches(doc),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Keyset page over document ids (ascending)
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Only return documents whose id sorts after this one
    pub after: Option<String>,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn after(id: impl Into<String>, limit: usize) -> Self {
        Self { after: Some(id.into()), limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_field_path_parsing() {
        let top: FieldPath = "mrn".parse().unwrap();
        assert_eq!(top.parent(), None);
        assert_eq!(top.to_string(), "mrn");

        let nested: FieldPath = "demographics.postcode".parse().unwrap();
        assert_eq!(nested.parent(), Some("demographics"));
        assert_eq!(nested.leaf(), "postcode");
        assert_eq!(
            nested.with_leaf_suffix("_hash").to_string(),
            "demographics.postcode_hash"
        );

        assert!("a.b.c".parse::<FieldPath>().is_err());
        assert!("a.".parse::<FieldPath>().is_err());
        assert!("".parse::<FieldPath>().is_err());
    }

    #[test]
    fn test_missing_parent_is_absent() {
        let d = doc(json!({"_id": "1", "mrn": "X1"}));
        let path: FieldPath = "demographics.postcode".parse().unwrap();
        assert!(d.get_path(&path).is_none());

        let d = doc(json!({"_id": "1", "demographics": "not an object"}));
        assert!(d.get_path(&path).is_none());
    }

    #[test]
    fn test_set_path_creates_parent() {
        let mut d = doc(json!({"_id": "1"}));
        let path: FieldPath = "demographics.postcode".parse().unwrap();
        d.set_path(&path, json!("AB1 2CD")).unwrap();
        assert_eq!(d.get_str(&path), Some("AB1 2CD"));

        let mut d = doc(json!({"_id": "1", "demographics": 5}));
        assert!(d.set_path(&path, json!("x")).is_err());
    }

    #[test]
    fn test_filters() {
        let mrn: FieldPath = "mrn".parse().unwrap();
        let hash = mrn.with_leaf_suffix("_hash");
        let d = doc(json!({"_id": "1", "mrn": "ENC:abc", "other": null}));

        assert!(Filter::Exists(mrn.clone()).matches(&d));
        assert!(Filter::Missing(hash.clone()).matches(&d));
        assert!(Filter::Missing("other".parse().unwrap()).matches(&d));
        assert!(Filter::StartsWith(mrn.clone(), "ENC:".into()).matches(&d));
        assert!(!Filter::not(Filter::StartsWith(mrn.clone(), "ENC:".into())).matches(&d));
        assert!(Filter::And(vec![Filter::NonEmpty(mrn.clone()), Filter::Missing(hash)]).matches(&d));
        assert!(!Filter::Or(vec![]).matches(&d));

        let empty = doc(json!({"_id": "2", "mrn": ""}));
        assert!(!Filter::NonEmpty(mrn).matches(&empty));
    }

    #[test]
    fn test_numeric_id() {
        let d = doc(json!({"_id": 42}));
        assert_eq!(d.id().as_deref(), Some("42"));
        assert!(doc(json!({"name": "x"})).require_id().is_err());
    }
}
