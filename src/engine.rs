//! Persistence engine façade
//!
//! Ties the registry, stores, indexes, relationship interactors and the
//! query machinery together behind save/delete/find/update/hydrate
//! operations. The engine is `Send + Sync`; all shared state lives in the
//! registry's concurrent structures and every query evaluation carries its
//! own per-candidate context.

use crate::error::EngineError;
use crate::evaluator;
use crate::index::{delete_indexes, save_indexes, IndexController};
use crate::query::{PartitionTarget, Query};
use crate::reference;
use crate::registry::SchemaRegistry;
use crate::relationship::{
    delete_relationships, hydrate_relationships, save_relationships, visit, CascadeContext,
    EntityPersister, RelationshipError, RelationshipTransaction,
};
use crate::schema::{EntityDescriptor, GeneratorStrategy, LifecycleCallback};
use crate::store::{RecordStore, StoreError};
use crate::types::{AttributeValue, Entity, Reference};
use crate::validator::{self, QueryError, QueryRunner};
use std::sync::Arc;
use tracing::debug;

pub struct Engine {
    registry: Arc<SchemaRegistry>,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            registry: Arc::new(SchemaRegistry::new()),
        }
    }

    pub fn with_registry(registry: Arc<SchemaRegistry>) -> Self {
        Engine { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn register(&self, descriptor: EntityDescriptor) -> Result<(), EngineError> {
        self.registry.register(descriptor)?;
        Ok(())
    }

    pub fn add_partition(&self, value: &str) -> i64 {
        self.registry.add_partition(value)
    }

    /// Save an entity and cascade through its relationship graph. Assigns a
    /// sequence identifier when the type declares one and none is set.
    /// Returns the entity's physical address.
    pub fn save(&self, entity: &mut Entity) -> Result<Reference, EngineError> {
        let mut txn = RelationshipTransaction::new();
        self.save_internal(entity, &mut txn)
    }

    /// Delete an entity, unlink its relationships and cascade removal where
    /// the schema asks for it
    pub fn delete(&self, entity: &Entity) -> Result<(), EngineError> {
        let mut txn = RelationshipTransaction::new();
        self.delete_internal(entity, &mut txn)
    }

    /// Validate and run a query, returning matched entities in scan order
    /// with the paging window applied. `query.results_count` is set to the
    /// match count before paging.
    pub fn find(&self, query: &mut Query) -> Result<Vec<Entity>, EngineError> {
        Ok(self.run(query)?)
    }

    /// Match count without materializing a page
    pub fn count(&self, query: &mut Query) -> Result<usize, EngineError> {
        self.run(query)?;
        Ok(query.results_count)
    }

    /// Apply the query's update assignments to every matched record,
    /// refreshing any bound indexes. Returns the number of updated records.
    pub fn execute_update(&self, query: &mut Query) -> Result<usize, EngineError> {
        let matched = self.run(query)?;
        let descriptor = self.descriptor_for(&query.entity_type)?;
        let store = self.store_for(&query.entity_type)?;

        let mut updated = 0;
        for mut entity in matched {
            let identifier = self.identifier_of(&descriptor, &entity);
            let record_ref = store.get_reference_id(&identifier);
            if record_ref == 0 {
                continue;
            }
            for update in &query.updates {
                entity.put(update.field_name.clone(), update.value.clone());
                if let Some(controller) = &update.index_controller {
                    controller.save(&update.value, record_ref, record_ref);
                }
            }
            let partition_id = reference::partition_id(&self.registry, &descriptor, &entity);
            store.save(partition_id, &identifier, &entity)?;
            updated += 1;
        }
        debug!(entity_type = %query.entity_type, updated, "update executed");
        Ok(updated)
    }

    /// Run a projection query: one row per matched entity, one value per
    /// selection in declaration order
    pub fn select(&self, query: &mut Query) -> Result<Vec<Vec<AttributeValue>>, EngineError> {
        let matched = self.run(query)?;
        let rows = matched
            .iter()
            .map(|entity| {
                query
                    .selections
                    .iter()
                    .map(|selection| selection.apply(entity.get(selection.attribute())))
                    .collect()
            })
            .collect();
        Ok(rows)
    }

    /// Populate the entity's relationship fields from the stored links.
    /// `deep` recurses through the graph, visiting each identity once.
    pub fn hydrate(&self, entity: &mut Entity, deep: bool) -> Result<(), EngineError> {
        let descriptor = self.descriptor_for(&entity.entity_type)?;
        let mut txn = RelationshipTransaction::new();
        let ctx = CascadeContext {
            registry: &self.registry,
            persister: self,
        };
        hydrate_relationships(&ctx, &descriptor, entity, &mut txn, deep)?;
        Ok(())
    }

    fn save_internal(
        &self,
        entity: &mut Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<Reference, EngineError> {
        let base = self.descriptor_for(&entity.entity_type)?;
        let partition_value = reference::partition_value(&base, entity);
        let descriptor = self
            .registry
            .descriptor_for(&entity.entity_type, partition_value.as_deref())
            .unwrap_or(base);

        let identifier_name = descriptor.identifier.name.clone();
        if entity.get(&identifier_name).map_or(true, AttributeValue::is_null)
            && descriptor.identifier.generator == GeneratorStrategy::Sequence
        {
            let next = self.registry.next_sequence(&descriptor.entity_type);
            entity.put(identifier_name.clone(), AttributeValue::Int(next));
        }
        let identifier = entity
            .get(&identifier_name)
            .cloned()
            .unwrap_or(AttributeValue::Null);
        if identifier.is_null() {
            return Err(StoreError::MissingIdentifier {
                entity_type: descriptor.entity_type.clone(),
            }
            .into());
        }

        // An identity already saved in this transaction is not re-saved;
        // this is what terminates cyclic cascades. The guard sits ahead of
        // the callbacks so each identity's callbacks fire exactly once per
        // top-level call.
        if !txn.visit(visit::SAVE, &descriptor.entity_type, &identifier) {
            return Ok(reference::reference(&self.registry, &descriptor, entity));
        }

        self.run_callback(
            &descriptor,
            "pre-persist",
            descriptor.callbacks.pre_persist.as_ref(),
            entity,
        )?;

        let previous_ref = reference::reference_id(&self.registry, &descriptor, entity);
        let partition_id = reference::partition_id(&self.registry, &descriptor, entity);
        let store = self.store_for(&descriptor.entity_type)?;
        let record_ref = store.save(partition_id, &identifier, entity)?;
        save_indexes(&self.registry, &descriptor, entity, previous_ref, record_ref);

        let ctx = CascadeContext {
            registry: &self.registry,
            persister: self,
        };
        save_relationships(&ctx, &descriptor, entity, txn)?;

        self.run_callback(
            &descriptor,
            "post-persist",
            descriptor.callbacks.post_persist.as_ref(),
            entity,
        )?;
        debug!(
            entity_type = %descriptor.entity_type,
            record_ref,
            partition_id,
            "entity saved"
        );
        Ok(Reference::new(partition_id, record_ref))
    }

    fn delete_internal(
        &self,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), EngineError> {
        let descriptor = self.descriptor_for(&entity.entity_type)?;
        let identifier = self.identifier_of(&descriptor, entity);
        if identifier.is_null() {
            return Err(StoreError::MissingIdentifier {
                entity_type: descriptor.entity_type.clone(),
            }
            .into());
        }
        if !txn.visit(visit::DELETE, &descriptor.entity_type, &identifier) {
            return Ok(());
        }

        let mut working = entity.clone();
        self.run_callback(
            &descriptor,
            "pre-remove",
            descriptor.callbacks.pre_remove.as_ref(),
            &mut working,
        )?;

        let record_ref = reference::reference_id(&self.registry, &descriptor, &working);
        let ctx = CascadeContext {
            registry: &self.registry,
            persister: self,
        };
        delete_relationships(&ctx, &descriptor, &working, txn)?;
        delete_indexes(&self.registry, &descriptor, record_ref);
        if record_ref != 0 {
            let store = self.store_for(&descriptor.entity_type)?;
            store.delete(record_ref)?;
        }

        self.run_callback(
            &descriptor,
            "post-remove",
            descriptor.callbacks.post_remove.as_ref(),
            &mut working,
        )?;
        debug!(entity_type = %descriptor.entity_type, record_ref, "entity deleted");
        Ok(())
    }

    /// Validate-and-execute shared by find/count/update/select and by
    /// sub-query resolution
    fn execute(&self, query: &mut Query) -> Result<Vec<Entity>, QueryError> {
        let descriptor = self
            .registry
            .descriptor_for(&query.entity_type, None)
            .ok_or_else(|| QueryError::UnknownEntityType(query.entity_type.clone()))?;
        let store = self
            .registry
            .store_for(&query.entity_type)
            .ok_or_else(|| QueryError::UnknownEntityType(query.entity_type.clone()))?;

        let partition_filter = match &query.partition {
            PartitionTarget::Value(value) => match self.registry.partition_with_value(value) {
                Some(id) => Some(id),
                // An unknown partition value can match nothing. Note the
                // asymmetry with saves: a record carrying an unregistered
                // partition value lands in partition 0, so a query pinned
                // to that value misses it; only an all-partitions scan
                // sees such records.
                None => {
                    query.results_count = 0;
                    return Ok(Vec::new());
                }
            },
            PartitionTarget::All | PartitionTarget::Unset => None,
        };

        let mut matched = Vec::new();
        for (entity_ref, entity) in store.scan() {
            if let Some(partition_id) = partition_filter {
                if entity_ref.partition_id != partition_id {
                    continue;
                }
            }
            let met = match &query.criteria {
                Some(criteria) => evaluator::meets_criteria(
                    &self.registry,
                    &descriptor,
                    criteria,
                    query.node_count,
                    &entity,
                    &entity_ref,
                ),
                None => true,
            };
            if met {
                matched.push(entity);
            }
        }

        query.results_count = matched.len();
        let page: Vec<Entity> = matched
            .into_iter()
            .skip(query.first_row)
            .take(query.max_results.unwrap_or(usize::MAX))
            .collect();
        Ok(page)
    }

    fn descriptor_for(&self, entity_type: &str) -> Result<Arc<EntityDescriptor>, EngineError> {
        self.registry
            .descriptor_for(entity_type, None)
            .ok_or_else(|| EngineError::UnknownEntityType(entity_type.to_string()))
    }

    fn store_for(&self, entity_type: &str) -> Result<Arc<dyn RecordStore>, EngineError> {
        self.registry
            .store_for(entity_type)
            .ok_or_else(|| EngineError::UnknownEntityType(entity_type.to_string()))
    }

    fn identifier_of(&self, descriptor: &EntityDescriptor, entity: &Entity) -> AttributeValue {
        entity
            .get(&descriptor.identifier.name)
            .cloned()
            .unwrap_or(AttributeValue::Null)
    }

    fn run_callback(
        &self,
        descriptor: &EntityDescriptor,
        name: &str,
        callback: Option<&LifecycleCallback>,
        entity: &mut Entity,
    ) -> Result<(), EngineError> {
        if let Some(callback) = callback {
            callback(entity).map_err(|message| EngineError::Callback {
                callback: name.to_string(),
                entity_type: descriptor.entity_type.clone(),
                message,
            })?;
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRunner for Engine {
    fn run(&self, query: &mut Query) -> Result<Vec<Entity>, QueryError> {
        validator::validate(&self.registry, self, query)?;
        self.execute(query)
    }
}

impl EntityPersister for Engine {
    fn persist(
        &self,
        entity: &mut Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<Reference, RelationshipError> {
        self.save_internal(entity, txn)
            .map_err(|err| RelationshipError::Persist(err.to_string()))
    }

    fn remove(
        &self,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), RelationshipError> {
        self.delete_internal(entity, txn)
            .map_err(|err| RelationshipError::Persist(err.to_string()))
    }
}
