//! Relationship graph engine
//!
//! Cascading save/delete/hydrate over cyclic entity graphs, guarded by a
//! per-call visited set, plus dotted relationship-path resolution against
//! the relationship index structures.

use crate::reference;
use crate::registry::SchemaRegistry;
use crate::schema::{EntityDescriptor, RelationshipDescriptor};
use crate::store::{RecordStore, StoreError};
use crate::types::{AttributeValue, Entity, Reference, RelationshipReference};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum RelationshipError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("entity type '{0}' is not registered")]
    UnknownEntityType(String),

    #[error("relationship '{relationship}' on '{entity_type}' has no bound interactor")]
    MissingInteractor {
        entity_type: String,
        relationship: String,
    },

    #[error("cascade failed: {0}")]
    Persist(String),
}

/// Per-top-level-call visited set. Keys are (context, entity type, identifier)
/// so the same entity can appear once per traversal context; identity is
/// logical (type + identifier), not object identity.
///
/// Created fresh at the start of an external save/delete/hydrate call unless
/// a caller already inside a cascade threads one through; dropped when that
/// call returns. Its sole purpose is terminating cyclic graphs and skipping
/// duplicate work.
#[derive(Debug, Default)]
pub struct RelationshipTransaction {
    visited: HashSet<(&'static str, String, String)>,
}

/// Traversal contexts tracked independently within one transaction
pub mod visit {
    pub const SAVE: &str = "save";
    pub const RELATIONSHIPS: &str = "relationships";
    pub const DELETE: &str = "delete";
    pub const HYDRATE: &str = "hydrate";
}

impl RelationshipTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit; returns false if the pair was already present
    pub fn visit(
        &mut self,
        context: &'static str,
        entity_type: &str,
        identifier: &AttributeValue,
    ) -> bool {
        self.visited.insert((
            context,
            entity_type.to_string(),
            identifier.canonical_text(),
        ))
    }

    pub fn contains(
        &self,
        context: &'static str,
        entity_type: &str,
        identifier: &AttributeValue,
    ) -> bool {
        self.visited.contains(&(
            context,
            entity_type.to_string(),
            identifier.canonical_text(),
        ))
    }
}

/// Recursion seam back into the persistence façade. Interactors cascade into
/// linked entities through this rather than depending on the engine directly.
pub trait EntityPersister {
    fn persist(
        &self,
        entity: &mut Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<Reference, RelationshipError>;

    fn remove(
        &self,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), RelationshipError>;
}

/// Everything an interactor needs during one cascade
pub struct CascadeContext<'a> {
    pub registry: &'a SchemaRegistry,
    pub persister: &'a dyn EntityPersister,
}

/// Variant-polymorphic relationship interactor bound to one declared
/// relationship. Owns the relationship index structure for that edge.
pub trait RelationshipInteractor: Send + Sync {
    fn descriptor(&self) -> &RelationshipDescriptor;

    fn save_relationship_for_entity(
        &self,
        ctx: &CascadeContext<'_>,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), RelationshipError>;

    fn delete_relationship_for_entity(
        &self,
        ctx: &CascadeContext<'_>,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), RelationshipError>;

    fn hydrate_relationship_for_entity(
        &self,
        ctx: &CascadeContext<'_>,
        entity: &mut Entity,
        txn: &mut RelationshipTransaction,
        deep: bool,
    ) -> Result<(), RelationshipError>;

    /// Stored links for a physical reference
    fn relationship_identifiers_with_reference_id(
        &self,
        reference: &Reference,
    ) -> Vec<RelationshipReference>;

    /// Inverse-side maintenance: attach a link without cascading
    fn add_link(&self, record_ref: i64, link: RelationshipReference);

    /// Inverse-side maintenance: detach a link by identifier
    fn remove_link(&self, record_ref: i64, identifier: &AttributeValue);
}

/// Build the interactor for a declared relationship
pub fn build_interactor(descriptor: RelationshipDescriptor) -> Arc<dyn RelationshipInteractor> {
    Arc::new(LinkInteractor::new(descriptor))
}

/// Cascade-save the relationships of an entity. No-op when the type declares
/// no relationships or the entity was already visited in this transaction;
/// the cycle guard is applied before recursing.
pub fn save_relationships(
    ctx: &CascadeContext<'_>,
    descriptor: &EntityDescriptor,
    entity: &Entity,
    txn: &mut RelationshipTransaction,
) -> Result<(), RelationshipError> {
    if !descriptor.has_relationships() {
        return Ok(());
    }
    let identifier = identifier_of(descriptor, entity);
    if !txn.visit(visit::RELATIONSHIPS, &descriptor.entity_type, &identifier) {
        trace!(
            entity_type = %descriptor.entity_type,
            id = %identifier.canonical_text(),
            "relationship save already visited, skipping"
        );
        return Ok(());
    }
    debug!(
        entity_type = %descriptor.entity_type,
        id = %identifier.canonical_text(),
        "saving relationships"
    );
    for relationship in descriptor.relationships.values() {
        let interactor = interactor_for(ctx.registry, relationship)?;
        interactor.save_relationship_for_entity(ctx, entity, txn)?;
    }
    Ok(())
}

/// Cascade-delete the relationships of an entity. Unlike the save path this
/// is not self-guarded; callers thread a transaction through explicitly to
/// get cycle protection on delete cascades.
pub fn delete_relationships(
    ctx: &CascadeContext<'_>,
    descriptor: &EntityDescriptor,
    entity: &Entity,
    txn: &mut RelationshipTransaction,
) -> Result<(), RelationshipError> {
    if !descriptor.has_relationships() {
        return Ok(());
    }
    debug!(entity_type = %descriptor.entity_type, "deleting relationships");
    for relationship in descriptor.relationships.values() {
        let interactor = interactor_for(ctx.registry, relationship)?;
        interactor.delete_relationship_for_entity(ctx, entity, txn)?;
    }
    Ok(())
}

/// Lazily populate relationship fields from the stored links, skipping
/// entities already visited so cycles are traversed at most once.
pub fn hydrate_relationships(
    ctx: &CascadeContext<'_>,
    descriptor: &EntityDescriptor,
    entity: &mut Entity,
    txn: &mut RelationshipTransaction,
    deep: bool,
) -> Result<(), RelationshipError> {
    if !descriptor.has_relationships() {
        return Ok(());
    }
    let identifier = identifier_of(descriptor, entity);
    if !txn.visit(visit::HYDRATE, &descriptor.entity_type, &identifier) {
        return Ok(());
    }
    for relationship in descriptor.relationships.values() {
        let interactor = interactor_for(ctx.registry, relationship)?;
        interactor.hydrate_relationship_for_entity(ctx, entity, txn, deep)?;
    }
    Ok(())
}

/// Result of resolving a dotted path against the relationship store
#[derive(Debug)]
pub enum StorePathResult {
    /// First segment is not a declared relationship; the caller falls back
    /// to direct attribute access
    Unresolved,
    /// Entities materialized at the deepest relationship segment, plus any
    /// trailing non-relationship segments left to read off each entity
    Resolved {
        entities: Vec<Entity>,
        entity_type: String,
        suffix: Vec<String>,
    },
}

/// Resolve a dotted path (`"child.someOtherField"`) for the record at
/// `reference`. Relationship segments are consumed greedily; each level fans
/// out through the stored links and the per-entity results are flattened,
/// which is what implements a to-many join. An empty entity list downstream
/// is the basis for IS_NULL matching.
pub fn relationship_from_store(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    path: &[String],
    reference: &Reference,
) -> StorePathResult {
    let Some(first) = path.first() else {
        return StorePathResult::Unresolved;
    };
    if descriptor.relationship(first).is_none() {
        return StorePathResult::Unresolved;
    }

    // Walk the schema first: the relationship chain and trailing suffix are
    // fixed by the descriptors, independent of any particular record.
    let mut chain: Vec<RelationshipDescriptor> = Vec::new();
    let mut current = descriptor.clone();
    let mut consumed = 0;
    for segment in path {
        match current.relationship(segment) {
            Some(relationship) => {
                chain.push(relationship.clone());
                consumed += 1;
                match registry.descriptor_for(&relationship.inverse_entity, None) {
                    Some(next) => current = (*next).clone(),
                    None => break,
                }
            }
            None => break,
        }
    }
    let suffix: Vec<String> = path[consumed..].to_vec();
    let terminal_type = chain
        .last()
        .map(|relationship| relationship.inverse_entity.clone())
        .unwrap_or_else(|| descriptor.entity_type.clone());

    // Fan out level by level through the stored links
    let mut frontier: Vec<Reference> = vec![*reference];
    let mut entities: Vec<Entity> = Vec::new();
    for (level, relationship) in chain.iter().enumerate() {
        let Some(interactor) = registry.interactor(&relationship.parent_entity, &relationship.name)
        else {
            return StorePathResult::Resolved {
                entities: Vec::new(),
                entity_type: terminal_type,
                suffix,
            };
        };
        let inverse_descriptor = registry.descriptor_for(&relationship.inverse_entity, None);
        let store = registry.store_for(&relationship.inverse_entity);
        let mut next_frontier = Vec::new();
        let mut next_entities = Vec::new();
        for current_ref in &frontier {
            for link in interactor.relationship_identifiers_with_reference_id(current_ref) {
                let Some(store) = &store else { continue };
                let Some(entity) = store.get_with_id(&link.identifier) else {
                    continue;
                };
                if let Some(inverse_descriptor) = &inverse_descriptor {
                    next_frontier.push(reference::reference(registry, inverse_descriptor, &entity));
                }
                next_entities.push(entity);
            }
        }
        frontier = next_frontier;
        if level == chain.len() - 1 {
            entities = next_entities;
        }
    }

    StorePathResult::Resolved {
        entities,
        entity_type: terminal_type,
        suffix,
    }
}

fn identifier_of(descriptor: &EntityDescriptor, entity: &Entity) -> AttributeValue {
    entity
        .get(&descriptor.identifier.name)
        .cloned()
        .unwrap_or(AttributeValue::Null)
}

fn interactor_for(
    registry: &SchemaRegistry,
    relationship: &RelationshipDescriptor,
) -> Result<Arc<dyn RelationshipInteractor>, RelationshipError> {
    registry
        .interactor(&relationship.parent_entity, &relationship.name)
        .ok_or_else(|| RelationshipError::MissingInteractor {
            entity_type: relationship.parent_entity.clone(),
            relationship: relationship.name.clone(),
        })
}

/// Interactor backed by an in-memory relationship index: parent record
/// reference mapped to the set of logical links. To-one variants keep a
/// single link per parent.
struct LinkInteractor {
    descriptor: RelationshipDescriptor,
    links: DashMap<i64, Vec<RelationshipReference>>,
}

impl LinkInteractor {
    fn new(descriptor: RelationshipDescriptor) -> Self {
        LinkInteractor {
            descriptor,
            links: DashMap::new(),
        }
    }

    fn inverse_descriptor(
        &self,
        registry: &SchemaRegistry,
    ) -> Result<Arc<EntityDescriptor>, RelationshipError> {
        registry
            .descriptor_for(&self.descriptor.inverse_entity, None)
            .ok_or_else(|| {
                RelationshipError::UnknownEntityType(self.descriptor.inverse_entity.clone())
            })
    }

    /// Mirror a saved link onto the inverse relationship, if one is declared
    fn attach_inverse(
        &self,
        ctx: &CascadeContext<'_>,
        parent: &Entity,
        parent_descriptor: &EntityDescriptor,
        child_ref: i64,
    ) {
        let Some(inverse_name) = &self.descriptor.inverse else {
            return;
        };
        let Some(inverse_interactor) = ctx
            .registry
            .interactor(&self.descriptor.inverse_entity, inverse_name)
        else {
            return;
        };
        let identifier = identifier_of(parent_descriptor, parent);
        let partition_id = reference::partition_id(ctx.registry, parent_descriptor, parent);
        inverse_interactor.add_link(
            child_ref,
            RelationshipReference::new(identifier, partition_id),
        );
    }
}

impl RelationshipInteractor for LinkInteractor {
    fn descriptor(&self) -> &RelationshipDescriptor {
        &self.descriptor
    }

    fn save_relationship_for_entity(
        &self,
        ctx: &CascadeContext<'_>,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), RelationshipError> {
        // Absent key means "links not loaded": leave the stored set alone
        let Some(children) = entity.relations.get(&self.descriptor.name) else {
            return Ok(());
        };
        let parent_descriptor = ctx
            .registry
            .descriptor_for(&self.descriptor.parent_entity, None)
            .ok_or_else(|| {
                RelationshipError::UnknownEntityType(self.descriptor.parent_entity.clone())
            })?;
        let inverse_descriptor = self.inverse_descriptor(ctx.registry)?;
        let parent_ref = reference::reference(ctx.registry, &parent_descriptor, entity);

        let mut new_links = Vec::new();
        for child in children {
            let mut child = child.clone();
            let child_ref = if self.descriptor.cascade.cascades_save() {
                ctx.persister.persist(&mut child, txn)?
            } else {
                reference::reference(ctx.registry, &inverse_descriptor, &child)
            };
            let identifier = identifier_of(&inverse_descriptor, &child);
            if identifier.is_null() {
                continue;
            }
            new_links.push(RelationshipReference::new(
                identifier,
                child_ref.partition_id,
            ));
            self.attach_inverse(ctx, entity, &parent_descriptor, child_ref.record_ref);
            if !self.descriptor.variant.is_to_many() {
                break;
            }
        }
        self.links.insert(parent_ref.record_ref, new_links);
        Ok(())
    }

    fn delete_relationship_for_entity(
        &self,
        ctx: &CascadeContext<'_>,
        entity: &Entity,
        txn: &mut RelationshipTransaction,
    ) -> Result<(), RelationshipError> {
        let parent_descriptor = ctx
            .registry
            .descriptor_for(&self.descriptor.parent_entity, None)
            .ok_or_else(|| {
                RelationshipError::UnknownEntityType(self.descriptor.parent_entity.clone())
            })?;
        let parent_ref = reference::reference(ctx.registry, &parent_descriptor, entity);
        let removed = self
            .links
            .remove(&parent_ref.record_ref)
            .map(|(_, links)| links)
            .unwrap_or_default();

        let store = ctx.registry.store_for(&self.descriptor.inverse_entity);
        for link in removed {
            // Detach the mirror link on the inverse side
            if let (Some(inverse_name), Some(store)) = (&self.descriptor.inverse, &store) {
                if let Some(inverse_interactor) = ctx
                    .registry
                    .interactor(&self.descriptor.inverse_entity, inverse_name)
                {
                    let child_ref = store.get_reference_id(&link.identifier);
                    let parent_id = identifier_of(&parent_descriptor, entity);
                    inverse_interactor.remove_link(child_ref, &parent_id);
                }
            }
            if self.descriptor.cascade.cascades_delete() {
                if let Some(store) = &store {
                    if let Some(child) = store.get_with_id(&link.identifier) {
                        ctx.persister.remove(&child, txn)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn hydrate_relationship_for_entity(
        &self,
        ctx: &CascadeContext<'_>,
        entity: &mut Entity,
        txn: &mut RelationshipTransaction,
        deep: bool,
    ) -> Result<(), RelationshipError> {
        let parent_descriptor = ctx
            .registry
            .descriptor_for(&self.descriptor.parent_entity, None)
            .ok_or_else(|| {
                RelationshipError::UnknownEntityType(self.descriptor.parent_entity.clone())
            })?;
        let inverse_descriptor = self.inverse_descriptor(ctx.registry)?;
        let store = ctx
            .registry
            .store_for(&self.descriptor.inverse_entity)
            .ok_or_else(|| {
                RelationshipError::UnknownEntityType(self.descriptor.inverse_entity.clone())
            })?;
        let parent_ref = reference::reference(ctx.registry, &parent_descriptor, entity);

        let mut children = Vec::new();
        for link in self.relationship_identifiers_with_reference_id(&parent_ref) {
            if let Some(mut child) = store.get_with_id(&link.identifier) {
                if deep {
                    hydrate_relationships(ctx, &inverse_descriptor, &mut child, txn, deep)?;
                }
                children.push(child);
            }
        }
        entity.relations.insert(self.descriptor.name.clone(), children);
        Ok(())
    }

    fn relationship_identifiers_with_reference_id(
        &self,
        reference: &Reference,
    ) -> Vec<RelationshipReference> {
        self.links
            .get(&reference.record_ref)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn add_link(&self, record_ref: i64, link: RelationshipReference) {
        if record_ref == 0 {
            return;
        }
        let mut entry = self.links.entry(record_ref).or_default();
        if !self.descriptor.variant.is_to_many() {
            entry.clear();
        }
        if !entry.iter().any(|existing| existing.identifier.loose_eq(&link.identifier)) {
            entry.push(link);
        }
    }

    fn remove_link(&self, record_ref: i64, identifier: &AttributeValue) {
        if let Some(mut entry) = self.links.get_mut(&record_ref) {
            entry.retain(|link| !link.identifier.loose_eq(identifier));
        }
    }
}
