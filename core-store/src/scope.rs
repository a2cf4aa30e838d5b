//! # Query Scopes
//!
//! A [`Scope`] is the `(predicate, ordering, section grouping)` triple a
//! reader observes. Scopes are evaluated in Rust against the JSON document of
//! each record, so every backend filters and orders identically.
//!
//! ## Ordering
//!
//! Values compare with a total order: `null < bool < number < string <
//! array < object`. Missing fields sort as `null`. Ties are broken by the
//! record key, which keeps results deterministic across backends.

use crate::record::{Entity, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter over record documents. Field names are dot paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Lt(String, Value),
    Gt(String, Value),
    KeyPrefix(String),
    FieldPrefix(String, String),
    /// Field missing or explicitly `null`.
    IsNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ne(field.into(), value.into())
    }

    pub fn one_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.into(), value.into())
    }

    pub fn key_prefix(prefix: impl Into<String>) -> Self {
        Predicate::KeyPrefix(prefix.into())
    }

    pub fn field_prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Predicate::FieldPrefix(field.into(), prefix.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull(field.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, q) => Predicate::And(vec![p, q]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Or(mut left), p) => {
                left.push(p);
                Predicate::Or(left)
            }
            (p, q) => Predicate::Or(vec![p, q]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq(field, expected) => values_equal(field_value(record, field), expected),
            Predicate::Ne(field, expected) => !values_equal(field_value(record, field), expected),
            Predicate::In(field, options) => {
                let actual = field_value(record, field);
                options.iter().any(|option| values_equal(actual, option))
            }
            Predicate::Lt(field, bound) => {
                comparable(field_value(record, field), bound) == Some(Ordering::Less)
            }
            Predicate::Gt(field, bound) => {
                comparable(field_value(record, field), bound) == Some(Ordering::Greater)
            }
            Predicate::KeyPrefix(prefix) => record.key.starts_with(prefix.as_str()),
            Predicate::FieldPrefix(field, prefix) => field_value(record, field)
                .as_str()
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            Predicate::IsNull(field) => field_value(record, field).is_null(),
            Predicate::And(all) => all.iter().all(|p| p.matches(record)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(record)),
            Predicate::Not(inner) => !inner.matches(record),
        }
    }
}

static NULL: Value = Value::Null;

fn field_value<'a>(record: &'a Record, field: &str) -> &'a Value {
    record.field(field).unwrap_or(&NULL)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Ordering for range predicates, only defined within one value kind.
fn comparable(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            Some(compare_values(a, b))
        }
        _ => None,
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| compare_values(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// One ordering criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub field: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// Records of one entity type matching a predicate, in a fixed order.
///
/// A scope is fixed for the lifetime of a subscription; observe a new scope
/// to change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub entity_type: String,
    pub predicate: Predicate,
    pub order: Vec<SortDescriptor>,
    pub section_by: Option<String>,
}

/// Consecutive records sharing a section value.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub value: Value,
    pub records: Vec<Record>,
}

impl Scope {
    pub fn all(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            predicate: Predicate::All,
            order: Vec::new(),
            section_by: None,
        }
    }

    pub fn of<T: Entity>() -> Self {
        Self::all(T::ENTITY_TYPE)
    }

    /// Narrows the scope; combined with any existing predicate.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        let current = std::mem::replace(&mut self.predicate, Predicate::All);
        self.predicate = current.and(predicate);
        self
    }

    pub fn order_by(mut self, sort: SortDescriptor) -> Self {
        self.order.push(sort);
        self
    }

    pub fn section_by(mut self, field: impl Into<String>) -> Self {
        self.section_by = Some(field.into());
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.entity_type == self.entity_type && self.predicate.matches(record)
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.order
            .iter()
            .map(|sort| {
                let ordering = compare_values(field_value(a, &sort.field), field_value(b, &sort.field));
                if sort.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.key.cmp(&b.key))
    }

    /// Filters and orders a candidate set.
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut matched: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
    }

    /// Groups already ordered records by the section field. Without a section
    /// field everything lands in a single `null` section.
    pub fn sections(&self, records: &[Record]) -> Vec<Section> {
        let Some(field) = &self.section_by else {
            if records.is_empty() {
                return Vec::new();
            }
            return vec![Section {
                value: Value::Null,
                records: records.to_vec(),
            }];
        };

        let mut sections: Vec<Section> = Vec::new();
        for record in records {
            let value = field_value(record, field);
            match sections.last_mut() {
                Some(section) if values_equal(&section.value, value) => {
                    section.records.push(record.clone())
                }
                _ => sections.push(Section {
                    value: value.clone(),
                    records: vec![record.clone()],
                }),
            }
        }
        sections
    }
}
