//! Record storage seam
//!
//! The core consumes a narrow record-accessor contract; physical
//! serialization, I/O and buffer pooling live behind it. An in-memory
//! implementation ships with the crate so the engine is embeddable
//! out of the box.

use crate::types::{AttributeValue, Entity, Reference};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// Storage-layer errors. Propagated unchanged through the core; no retries,
/// no partial-failure recovery.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("entity '{entity_type}' has no identifier value")]
    MissingIdentifier { entity_type: String },

    #[error("unknown record reference {reference}")]
    UnknownReference { reference: i64 },
}

/// Record accessor bound to one entity type
pub trait RecordStore: Send + Sync {
    /// Persist the entity's attribute state, returning its record reference.
    /// Re-saving an existing identifier overwrites in place.
    fn save(
        &self,
        partition_id: i64,
        identifier: &AttributeValue,
        entity: &Entity,
    ) -> Result<i64, StoreError>;

    /// Remove the record at the given reference
    fn delete(&self, record_ref: i64) -> Result<(), StoreError>;

    /// Physical reference for an identifier, 0 if the identifier is unknown
    fn get_reference_id(&self, identifier: &AttributeValue) -> i64;

    /// Materialize the record stored under an identifier
    fn get_with_id(&self, identifier: &AttributeValue) -> Option<Entity>;

    /// Materialize the record at a physical reference
    fn get_with_reference_id(&self, record_ref: i64) -> Option<Entity>;

    /// Read a single attribute at a physical reference
    fn get_attribute_with_reference_id(
        &self,
        field: &str,
        record_ref: i64,
    ) -> Option<AttributeValue>;

    /// Full scan of every record with its physical address
    fn scan(&self) -> Vec<(Reference, Entity)>;
}

/// In-memory record store backed by concurrent maps
pub struct InMemoryStore {
    records: DashMap<i64, (i64, Entity)>,
    by_identifier: DashMap<String, i64>,
    next_ref: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            records: DashMap::new(),
            by_identifier: DashMap::new(),
            next_ref: AtomicI64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for InMemoryStore {
    fn save(
        &self,
        partition_id: i64,
        identifier: &AttributeValue,
        entity: &Entity,
    ) -> Result<i64, StoreError> {
        let key = identifier.canonical_text();
        if identifier.is_null() || key.is_empty() {
            return Err(StoreError::MissingIdentifier {
                entity_type: entity.entity_type.clone(),
            });
        }

        // Only attribute state is physical; relationship links live in the
        // relationship index structures.
        let mut snapshot = entity.clone();
        snapshot.relations.clear();

        let record_ref = *self
            .by_identifier
            .entry(key)
            .or_insert_with(|| self.next_ref.fetch_add(1, Ordering::SeqCst));
        self.records.insert(record_ref, (partition_id, snapshot));
        Ok(record_ref)
    }

    fn delete(&self, record_ref: i64) -> Result<(), StoreError> {
        self.records
            .remove(&record_ref)
            .ok_or(StoreError::UnknownReference {
                reference: record_ref,
            })?;
        self.by_identifier
            .retain(|_, stored_ref| *stored_ref != record_ref);
        Ok(())
    }

    fn get_reference_id(&self, identifier: &AttributeValue) -> i64 {
        self.by_identifier
            .get(&identifier.canonical_text())
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    fn get_with_id(&self, identifier: &AttributeValue) -> Option<Entity> {
        let record_ref = self.get_reference_id(identifier);
        self.get_with_reference_id(record_ref)
    }

    fn get_with_reference_id(&self, record_ref: i64) -> Option<Entity> {
        self.records
            .get(&record_ref)
            .map(|entry| entry.value().1.clone())
    }

    fn get_attribute_with_reference_id(
        &self,
        field: &str,
        record_ref: i64,
    ) -> Option<AttributeValue> {
        self.records
            .get(&record_ref)
            .and_then(|entry| entry.value().1.attributes.get(field).cloned())
    }

    fn scan(&self) -> Vec<(Reference, Entity)> {
        let mut rows: Vec<(Reference, Entity)> = self
            .records
            .iter()
            .map(|entry| {
                let (partition_id, entity) = entry.value();
                (Reference::new(*partition_id, *entry.key()), entity.clone())
            })
            .collect();
        // Deterministic scan order for paging
        rows.sort_by_key(|(reference, _)| reference.record_ref);
        rows
    }
}
