//! Core value and reference types for the Strata persistence core

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Attribute values (heterogeneous types)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Text form used by string operators (STARTS_WITH, CONTAINS, LIKE, MATCHES).
    /// Numeric and boolean values are string-coercible; bytes and lists are not.
    pub fn as_text(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Int(v) => Some(v.to_string()),
            AttributeValue::Float(v) => Some(v.to_string()),
            AttributeValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Canonical text form used as a lookup key (identifier maps, visited sets).
    /// Stable across the boxed numeric coercions `loose_eq` allows.
    pub fn canonical_text(&self) -> String {
        match self {
            AttributeValue::Null => String::new(),
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Int(v) => v.to_string(),
            AttributeValue::Float(v) => {
                // Whole floats key the same as their integer counterpart
                if v.fract() == 0.0 && v.is_finite() {
                    (*v as i64).to_string()
                } else {
                    v.to_string()
                }
            }
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Bytes(b) => format!("{:?}", b),
            AttributeValue::List(items) => {
                let parts: Vec<String> = items.iter().map(AttributeValue::canonical_text).collect();
                parts.join(",")
            }
        }
    }

    /// Value equality with coercion across boxed numeric types
    pub fn loose_eq(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::Null, AttributeValue::Null) => true,
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => a == b,
            (AttributeValue::Int(a), AttributeValue::Int(b)) => a == b,
            (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
            (AttributeValue::Bytes(a), AttributeValue::Bytes(b)) => a == b,
            (AttributeValue::Float(a), AttributeValue::Float(b)) => (a - b).abs() < f64::EPSILON,
            (AttributeValue::Int(a), AttributeValue::Float(b))
            | (AttributeValue::Float(b), AttributeValue::Int(a)) => {
                (*a as f64 - b).abs() < f64::EPSILON
            }
            (AttributeValue::List(a), AttributeValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y))
            }
            _ => false,
        }
    }

    /// Total-order comparison over comparable attribute types.
    /// Numeric types coerce to a common width; incomparable pairs yield None.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        match (self, other) {
            (AttributeValue::Int(a), AttributeValue::Int(b)) => Some(a.cmp(b)),
            (AttributeValue::Float(a), AttributeValue::Float(b)) => a.partial_cmp(b),
            (AttributeValue::Int(a), AttributeValue::Float(b)) => (*a as f64).partial_cmp(b),
            (AttributeValue::Float(a), AttributeValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (AttributeValue::String(a), AttributeValue::String(b)) => Some(a.cmp(b)),
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttributeValue::Int(i)
                } else {
                    AttributeValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => AttributeValue::String(s),
            serde_json::Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            serde_json::Value::Object(_) => AttributeValue::Null,
        }
    }
}

/// Attributes map (row columns / object fields)
pub type Attributes = HashMap<String, AttributeValue>;

/// A managed entity instance: a dynamic property map described by a
/// registered [`EntityDescriptor`](crate::schema::EntityDescriptor).
///
/// Relationship links held in memory before a cascade (or after hydration)
/// live in `relations`, keyed by relationship name. Absent keys mean
/// "not loaded"; an empty list means "loaded, no links".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub attributes: Attributes,
    #[serde(default)]
    pub relations: HashMap<String, Vec<Entity>>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Entity {
            entity_type: entity_type.into(),
            attributes: Attributes::new(),
            relations: HashMap::new(),
        }
    }

    /// Get attribute value
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Set attribute value (builder style)
    pub fn set(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Set attribute value in place
    pub fn put(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }

    /// Attach a related entity under a relationship name (builder style)
    pub fn relate(mut self, relationship: impl Into<String>, related: Entity) -> Self {
        self.relations
            .entry(relationship.into())
            .or_default()
            .push(related);
        self
    }
}

/// Physical address of a stored record: `(partition, record)`.
///
/// Partition 0 is the unpartitioned/default partition. A `Reference` is a
/// lookup key recomputed on demand, never an owning pointer; it must not be
/// cached across mutations without re-resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub partition_id: i64,
    pub record_ref: i64,
}

impl Reference {
    pub fn new(partition_id: i64, record_ref: i64) -> Self {
        Reference {
            partition_id,
            record_ref,
        }
    }

    /// A reference with record 0 points at nothing
    pub fn is_set(&self) -> bool {
        self.record_ref != 0
    }
}

/// Logical key `(identifier, partition)` stored inside relationship index
/// structures. A weak, lookup-only association; survives record moves because
/// it resolves through the identifier rather than a live physical reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipReference {
    pub identifier: AttributeValue,
    pub partition_id: i64,
}

impl RelationshipReference {
    pub fn new(identifier: AttributeValue, partition_id: i64) -> Self {
        RelationshipReference {
            identifier,
            partition_id,
        }
    }
}
