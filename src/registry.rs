//! Process-wide schema registry
//!
//! Owns every registered descriptor (keyed by entity type, plus partition
//! value for partition-specific variants) and the collaborators bound to it:
//! record stores, index controllers, relationship interactors, identifier
//! sequences and the partition value table.

use crate::index::{BTreeIndexController, IndexController};
use crate::relationship::{build_interactor, RelationshipInteractor};
use crate::schema::{validate, EntityDescriptor, SchemaError};
use crate::store::{InMemoryStore, RecordStore};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

fn descriptor_key(entity_type: &str, partition_value: Option<&str>) -> (String, String) {
    (
        entity_type.to_string(),
        partition_value.unwrap_or("").to_string(),
    )
}

pub struct SchemaRegistry {
    descriptors: DashMap<(String, String), Arc<EntityDescriptor>>,
    stores: DashMap<String, Arc<dyn RecordStore>>,
    index_controllers: DashMap<(String, String), Arc<dyn IndexController>>,
    interactors: DashMap<(String, String), Arc<dyn RelationshipInteractor>>,
    sequences: DashMap<String, Arc<AtomicI64>>,
    partitions_by_value: DashMap<String, i64>,
    partitions_by_id: DashMap<i64, String>,
    next_partition_id: AtomicI64,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry {
            descriptors: DashMap::new(),
            stores: DashMap::new(),
            index_controllers: DashMap::new(),
            interactors: DashMap::new(),
            sequences: DashMap::new(),
            partitions_by_value: DashMap::new(),
            partitions_by_id: DashMap::new(),
            // Partition 0 is the unpartitioned default
            next_partition_id: AtomicI64::new(1),
        }
    }

    /// Register an entity type. Validation runs first; a failure leaves the
    /// registry untouched (no partial registration).
    pub fn register(&self, descriptor: EntityDescriptor) -> Result<(), SchemaError> {
        self.register_variant(descriptor, None)
    }

    /// Register a partition-specific descriptor variant
    pub fn register_variant(
        &self,
        descriptor: EntityDescriptor,
        partition_value: Option<&str>,
    ) -> Result<(), SchemaError> {
        validate(&descriptor)?;

        let entity_type = descriptor.entity_type.clone();
        let descriptor = Arc::new(descriptor);

        self.stores
            .entry(entity_type.clone())
            .or_insert_with(|| Arc::new(InMemoryStore::new()) as Arc<dyn RecordStore>);
        self.sequences
            .entry(entity_type.clone())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));

        for index in descriptor.indexes.values() {
            self.index_controllers
                .entry((entity_type.clone(), index.name.clone()))
                .or_insert_with(|| {
                    Arc::new(BTreeIndexController::new(index.field.clone()))
                        as Arc<dyn IndexController>
                });
        }
        for relationship in descriptor.relationships.values() {
            self.interactors
                .entry((entity_type.clone(), relationship.name.clone()))
                .or_insert_with(|| build_interactor(relationship.clone()));
        }

        self.descriptors
            .insert(descriptor_key(&entity_type, partition_value), descriptor);
        Ok(())
    }

    /// Descriptor for an entity type, preferring a partition-specific variant
    /// when one is registered for the given value
    pub fn descriptor_for(
        &self,
        entity_type: &str,
        partition_value: Option<&str>,
    ) -> Option<Arc<EntityDescriptor>> {
        if partition_value.is_some() {
            if let Some(found) = self
                .descriptors
                .get(&descriptor_key(entity_type, partition_value))
            {
                return Some(found.value().clone());
            }
        }
        self.descriptors
            .get(&descriptor_key(entity_type, None))
            .map(|entry| entry.value().clone())
    }

    /// Bind a custom record store for an entity type (replaces the default
    /// in-memory store)
    pub fn bind_store(&self, entity_type: &str, store: Arc<dyn RecordStore>) {
        self.stores.insert(entity_type.to_string(), store);
    }

    pub fn store_for(&self, entity_type: &str) -> Option<Arc<dyn RecordStore>> {
        self.stores
            .get(entity_type)
            .map(|entry| entry.value().clone())
    }

    pub fn index_controller(
        &self,
        entity_type: &str,
        index_name: &str,
    ) -> Option<Arc<dyn IndexController>> {
        self.index_controllers
            .get(&(entity_type.to_string(), index_name.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn interactor(
        &self,
        entity_type: &str,
        relationship: &str,
    ) -> Option<Arc<dyn RelationshipInteractor>> {
        self.interactors
            .get(&(entity_type.to_string(), relationship.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Next identifier from the per-type sequence
    pub fn next_sequence(&self, entity_type: &str) -> i64 {
        let counter = self
            .sequences
            .entry(entity_type.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a partition value, returning its numeric id (idempotent)
    pub fn add_partition(&self, value: &str) -> i64 {
        if let Some(existing) = self.partitions_by_value.get(value) {
            return *existing;
        }
        let id = self.next_partition_id.fetch_add(1, Ordering::SeqCst);
        self.partitions_by_value.insert(value.to_string(), id);
        self.partitions_by_id.insert(id, value.to_string());
        id
    }

    pub fn partition_with_value(&self, value: &str) -> Option<i64> {
        self.partitions_by_value.get(value).map(|entry| *entry)
    }

    pub fn partition_with_id(&self, id: i64) -> Option<String> {
        self.partitions_by_id.get(&id).map(|entry| entry.clone())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
