//! Records, typed entities and change descriptions.

use crate::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object holding a record's fields.
pub type Document = Map<String, Value>;

/// A persisted entity of a given type, unique per `(entity_type, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_type: String,
    pub key: String,
    /// Always a JSON object.
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(
        entity_type: impl Into<String>,
        key: impl Into<String>,
        data: Document,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
            data: Value::Object(data),
            updated_at,
        }
    }

    /// Builds a record from a typed entity.
    pub fn from_entity<T: Entity>(entity: &T, updated_at: DateTime<Utc>) -> Result<Self> {
        let document = to_document(entity)?;
        Ok(Self::new(T::ENTITY_TYPE, entity.key(), document, updated_at))
    }

    /// Resolves a dot-separated field path (`"course.id"`) inside the document.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, path)
    }

    /// Document fields, empty when the stored value is not an object.
    pub fn document(&self) -> Document {
        match &self.data {
            Value::Object(map) => map.clone(),
            _ => Document::new(),
        }
    }

    /// Decodes the document into a typed entity.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |message: &str| StoreError::InvalidRecord {
            entity_type: self.entity_type.clone(),
            key: self.key.clone(),
            message: message.to_string(),
        };

        if self.entity_type.is_empty() {
            return Err(invalid("entity type cannot be empty"));
        }
        if self.key.is_empty() {
            return Err(invalid("uniquing key cannot be empty"));
        }
        if !self.data.is_object() {
            return Err(invalid("data must be a JSON object"));
        }
        Ok(())
    }
}

/// A record type with exactly one uniquing key.
///
/// ```rust
/// use core_store::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ContextColor {
///     canvas_context_id: String,
///     color: String,
/// }
///
/// impl Entity for ContextColor {
///     const ENTITY_TYPE: &'static str = "context_color";
///
///     fn key(&self) -> String {
///         self.canvas_context_id.clone()
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ENTITY_TYPE: &'static str;

    fn key(&self) -> String;
}

/// Serializes an entity into a JSON object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::mutator(format!(
            "expected a JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

/// Dot-path lookup into nested JSON objects.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One committed modification.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Inserted(Record),
    Updated { old: Record, new: Record },
    Deleted(Record),
}

impl Change {
    pub fn entity_type(&self) -> &str {
        match self {
            Change::Inserted(record) | Change::Deleted(record) => &record.entity_type,
            Change::Updated { new, .. } => &new.entity_type,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Change::Inserted(record) | Change::Deleted(record) => &record.key,
            Change::Updated { new, .. } => &new.key,
        }
    }

    /// Version visible after the commit.
    pub fn current(&self) -> Option<&Record> {
        match self {
            Change::Inserted(record) => Some(record),
            Change::Updated { new, .. } => Some(new),
            Change::Deleted(_) => None,
        }
    }

    /// Version visible before the commit.
    pub fn previous(&self) -> Option<&Record> {
        match self {
            Change::Inserted(_) => None,
            Change::Updated { old, .. } => Some(old),
            Change::Deleted(record) => Some(record),
        }
    }

    /// Net change between two versions of the same record, `None` when nothing changed.
    pub(crate) fn between(before: Option<Record>, after: Option<Record>) -> Option<Change> {
        match (before, after) {
            (None, Some(new)) => Some(Change::Inserted(new)),
            (Some(old), Some(new)) if old.data != new.data => Some(Change::Updated { old, new }),
            (Some(old), None) => Some(Change::Deleted(old)),
            _ => None,
        }
    }
}

/// Changes delivered to a listener after a commit, in write order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn inserted(&self) -> usize {
        self.count(|c| matches!(c, Change::Inserted(_)))
    }

    pub fn updated(&self) -> usize {
        self.count(|c| matches!(c, Change::Updated { .. }))
    }

    pub fn deleted(&self) -> usize {
        self.count(|c| matches!(c, Change::Deleted(_)))
    }

    fn count(&self, pred: impl Fn(&Change) -> bool) -> usize {
        self.changes.iter().filter(|c| pred(c)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Course {
        id: String,
        name: String,
    }

    impl Entity for Course {
        const ENTITY_TYPE: &'static str = "course";

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    #[test]
    fn test_entity_round_trip_through_record() {
        let course = Course {
            id: "7".to_string(),
            name: "Biology".to_string(),
        };
        let record = Record::from_entity(&course, Utc::now()).unwrap();

        assert_eq!(record.entity_type, "course");
        assert_eq!(record.key, "7");
        assert_eq!(record.field("name"), Some(&json!("Biology")));
        assert_eq!(record.decode::<Course>().unwrap(), course);
    }

    #[test]
    fn test_lookup_follows_dot_paths() {
        let value = json!({"course": {"term": {"name": "Fall"}}, "id": 1});

        assert_eq!(lookup(&value, "course.term.name"), Some(&json!("Fall")));
        assert_eq!(lookup(&value, "id"), Some(&json!(1)));
        assert_eq!(lookup(&value, "course.missing"), None);
        assert_eq!(lookup(&value, "id.nested"), None);
    }

    #[test]
    fn test_validate_rejects_empty_key_and_scalar_data() {
        let mut record = Record::new("course", "", Document::new(), Utc::now());
        assert!(record.validate().is_err());

        record.key = "1".to_string();
        record.data = json!(5);
        assert!(record.validate().is_err());

        record.data = json!({});
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_change_between_ignores_identical_documents() {
        let now = Utc::now();
        let old = Record::new("course", "A", to_document(&json!({"name": "Old"})).unwrap(), now);
        let same = old.clone();
        let new = Record::new("course", "A", to_document(&json!({"name": "New"})).unwrap(), now);

        assert!(Change::between(Some(old.clone()), Some(same)).is_none());
        assert!(matches!(
            Change::between(Some(old.clone()), Some(new)),
            Some(Change::Updated { .. })
        ));
        assert!(matches!(Change::between(Some(old), None), Some(Change::Deleted(_))));
        assert!(Change::between(None, None).is_none());
    }
}
