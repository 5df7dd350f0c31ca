//! Secondary index maintenance
//!
//! Keeps declared indexes consistent with record moves. The controller
//! contract is the narrow seam to the physical index structure; a
//! B-tree-backed in-memory controller ships with the crate.

use crate::registry::SchemaRegistry;
use crate::schema::EntityDescriptor;
use crate::types::{AttributeValue, Entity};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-index controller contract.
///
/// `save` must atomically remove any pointer at `previous_ref` and insert one
/// at `new_ref` for the given value; `delete` removes whatever pointer lives
/// at the reference.
pub trait IndexController: Send + Sync {
    fn field(&self) -> &str;
    fn save(&self, value: &AttributeValue, previous_ref: i64, new_ref: i64);
    fn delete(&self, record_ref: i64);
    /// Exact-match lookup, used by update execution and tests
    fn find(&self, value: &AttributeValue) -> Vec<i64>;
}

/// Refresh every declared index after a save. `previous_ref` is the physical
/// reference captured before the write (0 for a first insert), `new_ref` the
/// reference produced by it.
pub fn save_indexes(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    entity: &Entity,
    previous_ref: i64,
    new_ref: i64,
) {
    if !descriptor.has_indexes() {
        return;
    }
    for index in descriptor.indexes.values() {
        if let Some(controller) = registry.index_controller(&descriptor.entity_type, &index.name) {
            let value = entity
                .get(&index.field)
                .cloned()
                .unwrap_or(AttributeValue::Null);
            controller.save(&value, previous_ref, new_ref);
        }
    }
}

/// Drop every declared index pointer for a deleted record
pub fn delete_indexes(registry: &SchemaRegistry, descriptor: &EntityDescriptor, record_ref: i64) {
    if !descriptor.has_indexes() {
        return;
    }
    for index in descriptor.indexes.values() {
        if let Some(controller) = registry.index_controller(&descriptor.entity_type, &index.name) {
            controller.delete(record_ref);
        }
    }
}

/// Index key - wrapper around AttributeValue usable as a BTreeMap key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
}

/// Wrapper for f64 to make it Ord (required for BTreeMap keys)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl From<&AttributeValue> for IndexKey {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(b) => IndexKey::Bool(*b),
            AttributeValue::Int(i) => IndexKey::Int(*i),
            AttributeValue::Float(f) => IndexKey::Float(OrderedFloat(*f)),
            AttributeValue::String(s) => IndexKey::String(s.clone()),
            _ => IndexKey::Null,
        }
    }
}

/// B-tree index controller for one indexed field
pub struct BTreeIndexController {
    field: String,
    tree: RwLock<BTreeMap<IndexKey, Vec<i64>>>,
    /// Reverse map so `delete(ref)` and previous-ref removal stay O(log n)
    by_ref: DashMap<i64, IndexKey>,
}

impl BTreeIndexController {
    pub fn new(field: impl Into<String>) -> Self {
        BTreeIndexController {
            field: field.into(),
            tree: RwLock::new(BTreeMap::new()),
            by_ref: DashMap::new(),
        }
    }

    fn remove_pointer(&self, tree: &mut BTreeMap<IndexKey, Vec<i64>>, record_ref: i64) {
        if let Some((_, key)) = self.by_ref.remove(&record_ref) {
            if let Some(refs) = tree.get_mut(&key) {
                refs.retain(|r| *r != record_ref);
                if refs.is_empty() {
                    tree.remove(&key);
                }
            }
        }
    }
}

impl IndexController for BTreeIndexController {
    fn field(&self) -> &str {
        &self.field
    }

    fn save(&self, value: &AttributeValue, previous_ref: i64, new_ref: i64) {
        let key = IndexKey::from(value);
        let mut tree = self.tree.write();
        if previous_ref != 0 {
            self.remove_pointer(&mut tree, previous_ref);
        }
        // A record keeps a single index pointer per field
        self.remove_pointer(&mut tree, new_ref);
        tree.entry(key.clone()).or_default().push(new_ref);
        self.by_ref.insert(new_ref, key);
    }

    fn delete(&self, record_ref: i64) {
        let mut tree = self.tree.write();
        self.remove_pointer(&mut tree, record_ref);
    }

    fn find(&self, value: &AttributeValue) -> Vec<i64> {
        let key = IndexKey::from(value);
        self.tree.read().get(&key).cloned().unwrap_or_default()
    }
}
