//! Reference and partition resolution
//!
//! Maps a logical entity to its physical `(partition, record)` address.
//! Pure lookups; nothing here mutates state.

use crate::registry::SchemaRegistry;
use crate::schema::EntityDescriptor;
use crate::store::RecordStore;
use crate::types::{AttributeValue, Entity, Reference};
use tracing::warn;

/// The partition attribute's value, None when unset/empty ("no partition")
pub fn partition_value(descriptor: &EntityDescriptor, entity: &Entity) -> Option<String> {
    let attribute = descriptor.partition.as_deref()?;
    match entity.get(attribute) {
        Some(AttributeValue::Null) | None => None,
        Some(value) => {
            let text = value.canonical_text();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
    }
}

/// Numeric partition id for an entity. Types with no partition attribute and
/// entities with an unset partition value resolve to 0; an unregistered value
/// defaults to 0 as a best effort rather than erroring.
pub fn partition_id(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    entity: &Entity,
) -> i64 {
    let Some(value) = partition_value(descriptor, entity) else {
        return 0;
    };
    match registry.partition_with_value(&value) {
        Some(id) => id,
        None => {
            warn!(
                entity_type = %descriptor.entity_type,
                partition = %value,
                "partition value not registered, defaulting to partition 0"
            );
            0
        }
    }
}

/// Physical record reference for an entity, 0 if its identifier is unset or
/// the record has never been stored
pub fn reference_id(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    entity: &Entity,
) -> i64 {
    let identifier = match entity.get(&descriptor.identifier.name) {
        Some(value) if !value.is_null() => value,
        _ => return 0,
    };
    match registry.store_for(&descriptor.entity_type) {
        Some(store) => store.get_reference_id(identifier),
        None => 0,
    }
}

/// Full physical address for an entity
pub fn reference(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    entity: &Entity,
) -> Reference {
    Reference::new(
        partition_id(registry, descriptor, entity),
        reference_id(registry, descriptor, entity),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        AttributeDescriptor, AttributeType, GeneratorStrategy, IdentifierDescriptor,
    };

    fn plain() -> EntityDescriptor {
        EntityDescriptor::new(
            "Note",
            IdentifierDescriptor::new("id", GeneratorStrategy::None),
        )
        .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
    }

    fn partitioned() -> EntityDescriptor {
        EntityDescriptor::new(
            "Order",
            IdentifierDescriptor::new("id", GeneratorStrategy::None),
        )
        .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
        .add_attribute(AttributeDescriptor::new("region", AttributeType::String))
        .with_partition("region")
    }

    #[test]
    fn test_no_partition_attribute_resolves_to_zero() {
        let registry = SchemaRegistry::new();
        registry.register(plain()).unwrap();
        let descriptor = registry.descriptor_for("Note", None).unwrap();

        let entity = Entity::new("Note").set("id", AttributeValue::Int(1));
        assert_eq!(partition_id(&registry, &descriptor, &entity), 0);
    }

    #[test]
    fn test_unset_partition_value_resolves_to_zero() {
        let registry = SchemaRegistry::new();
        registry.register(partitioned()).unwrap();
        let descriptor = registry.descriptor_for("Order", None).unwrap();

        let entity = Entity::new("Order").set("id", AttributeValue::Int(1));
        assert_eq!(partition_id(&registry, &descriptor, &entity), 0);
    }

    #[test]
    fn test_registered_partition_value_resolves() {
        let registry = SchemaRegistry::new();
        registry.register(partitioned()).unwrap();
        let eu = registry.add_partition("eu");
        let descriptor = registry.descriptor_for("Order", None).unwrap();

        let entity = Entity::new("Order")
            .set("id", AttributeValue::Int(1))
            .set("region", AttributeValue::String("eu".into()));
        assert_eq!(partition_id(&registry, &descriptor, &entity), eu);

        // Unregistered values default to 0 rather than erroring
        let stray = Entity::new("Order")
            .set("id", AttributeValue::Int(2))
            .set("region", AttributeValue::String("mars".into()));
        assert_eq!(partition_id(&registry, &descriptor, &stray), 0);
    }

    #[test]
    fn test_reference_id_zero_when_identifier_unset() {
        let registry = SchemaRegistry::new();
        registry.register(plain()).unwrap();
        let descriptor = registry.descriptor_for("Note", None).unwrap();

        let entity = Entity::new("Note");
        assert_eq!(reference_id(&registry, &descriptor, &entity), 0);
        assert!(!reference(&registry, &descriptor, &entity).is_set());
    }
}
