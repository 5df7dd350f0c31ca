//! Schema model for the Strata persistence core
//!
//! Validated descriptors for entity types: attributes, identifier,
//! relationships, indexes and the optional partition attribute. Descriptors
//! are created once at registration, validated as a whole, and immutable
//! thereafter.

use crate::types::Entity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Supported attribute types. This is the whitelist applied at registration;
/// nested or byte-element lists are deliberately not representable as index
/// or identifier material and are rejected by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List(Box<AttributeType>),
}

impl AttributeType {
    /// Whitelist check: scalar types and single-level lists of scalars
    pub fn is_supported(&self) -> bool {
        match self {
            AttributeType::List(inner) => {
                !matches!(**inner, AttributeType::List(_) | AttributeType::Bytes)
            }
            _ => true,
        }
    }

    /// Type name for error messages
    pub fn name(&self) -> String {
        match self {
            AttributeType::Bool => "Bool".to_string(),
            AttributeType::Int => "Int".to_string(),
            AttributeType::Float => "Float".to_string(),
            AttributeType::String => "String".to_string(),
            AttributeType::Bytes => "Bytes".to_string(),
            AttributeType::List(inner) => format!("List<{}>", inner.name()),
        }
    }
}

/// Attribute definition within an entity descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub attribute_type: AttributeType,
    pub nullable: bool,
    /// Maximum length for string attributes, unlimited if absent
    pub max_size: Option<usize>,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        AttributeDescriptor {
            name: name.into(),
            attribute_type,
            nullable: true,
            max_size: None,
        }
    }

    pub fn non_nullable(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// Identifier generation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratorStrategy {
    /// Caller supplies the identifier value
    None,
    /// Engine assigns the next value from a per-type sequence; requires an
    /// orderable numeric identifier type
    Sequence,
}

/// The single identifier of an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierDescriptor {
    pub name: String,
    pub generator: GeneratorStrategy,
}

impl IdentifierDescriptor {
    pub fn new(name: impl Into<String>, generator: GeneratorStrategy) -> Self {
        IdentifierDescriptor {
            name: name.into(),
            generator,
        }
    }
}

/// Relationship variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipVariant {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl RelationshipVariant {
    /// Whether the owning side holds a list-like container
    pub fn is_to_many(&self) -> bool {
        matches!(
            self,
            RelationshipVariant::OneToMany | RelationshipVariant::ManyToMany
        )
    }
}

/// What a cascade does when it reaches a linked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadePolicy {
    /// Maintain links only; never touch linked records
    None,
    /// Persist linked records on save
    Save,
    /// Remove linked records on delete
    Delete,
    /// Both
    All,
}

impl CascadePolicy {
    pub fn cascades_save(&self) -> bool {
        matches!(self, CascadePolicy::Save | CascadePolicy::All)
    }

    pub fn cascades_delete(&self) -> bool {
        matches!(self, CascadePolicy::Delete | CascadePolicy::All)
    }
}

/// Relationship definition within an entity descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub variant: RelationshipVariant,
    /// Name of the inverse relationship on the target type, if bidirectional
    pub inverse: Option<String>,
    /// Entity type on the far side of the relationship
    pub inverse_entity: String,
    /// Entity type declaring this relationship
    pub parent_entity: String,
    pub cascade: CascadePolicy,
}

impl RelationshipDescriptor {
    pub fn new(
        name: impl Into<String>,
        variant: RelationshipVariant,
        parent_entity: impl Into<String>,
        inverse_entity: impl Into<String>,
    ) -> Self {
        RelationshipDescriptor {
            name: name.into(),
            variant,
            inverse: None,
            inverse_entity: inverse_entity.into(),
            parent_entity: parent_entity.into(),
            cascade: CascadePolicy::Save,
        }
    }

    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub field: String,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        IndexDescriptor {
            name: name.into(),
            field: field.into(),
        }
    }
}

/// Lifecycle callback bound to an entity type. Failures abort the cascade
/// that invoked them; the engine wraps the message with the callback identity.
pub type LifecycleCallback = Arc<dyn Fn(&mut Entity) -> Result<(), String> + Send + Sync>;

/// Optional lifecycle callbacks for one entity type
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    pub pre_persist: Option<LifecycleCallback>,
    pub post_persist: Option<LifecycleCallback>,
    pub pre_remove: Option<LifecycleCallback>,
    pub post_remove: Option<LifecycleCallback>,
}

impl fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("pre_persist", &self.pre_persist.is_some())
            .field("post_persist", &self.post_persist.is_some())
            .field("pre_remove", &self.pre_remove.is_some())
            .field("post_remove", &self.post_remove.is_some())
            .finish()
    }
}

/// Immutable schema metadata for one entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity_type: String,
    pub identifier: IdentifierDescriptor,
    pub attributes: HashMap<String, AttributeDescriptor>,
    pub relationships: HashMap<String, RelationshipDescriptor>,
    pub indexes: HashMap<String, IndexDescriptor>,
    /// Name of the attribute selecting the partition, if partitioned
    pub partition: Option<String>,
    #[serde(skip)]
    pub callbacks: LifecycleCallbacks,
    /// Set once at construction so the zero-index common case stays cheap
    has_indexes: bool,
}

impl EntityDescriptor {
    pub fn new(entity_type: impl Into<String>, identifier: IdentifierDescriptor) -> Self {
        EntityDescriptor {
            entity_type: entity_type.into(),
            identifier,
            attributes: HashMap::new(),
            relationships: HashMap::new(),
            indexes: HashMap::new(),
            partition: None,
            callbacks: LifecycleCallbacks::default(),
            has_indexes: false,
        }
    }

    pub fn add_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }

    pub fn add_relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships
            .insert(relationship.name.clone(), relationship);
        self
    }

    pub fn add_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self.has_indexes = true;
        self
    }

    pub fn with_partition(mut self, attribute: impl Into<String>) -> Self {
        self.partition = Some(attribute.into());
        self
    }

    pub fn with_callbacks(mut self, callbacks: LifecycleCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn has_indexes(&self) -> bool {
        self.has_indexes
    }

    pub fn has_relationships(&self) -> bool {
        !self.relationships.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.get(name)
    }
}

/// Schema validation errors, fatal to registering the entity type
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("entity type '{entity_type}': {reason}")]
    EntityTypeMismatch { entity_type: String, reason: String },

    #[error("index '{index}' on '{entity_type}' references unknown field '{field}'")]
    InvalidIndex {
        entity_type: String,
        index: String,
        field: String,
    },

    #[error("invalid identifier '{identifier}' on '{entity_type}': {reason}")]
    InvalidIdentifier {
        entity_type: String,
        identifier: String,
        reason: String,
    },

    #[error("invalid relationship '{relationship}' on '{entity_type}': {reason}")]
    InvalidRelationshipType {
        entity_type: String,
        relationship: String,
        reason: String,
    },

    #[error("relationship '{relationship}' on '{entity_type}' targets unknown entity type")]
    EntityClassNotFound {
        entity_type: String,
        relationship: String,
    },
}

/// Validate a descriptor for registration. Pure and side-effect free; any
/// failure is fatal to registering the entity type, never a partial result.
///
/// Check order: base entity contract, attribute type whitelist, index fields,
/// identifier, relationship structure.
pub fn validate(descriptor: &EntityDescriptor) -> Result<(), SchemaError> {
    let entity_type = &descriptor.entity_type;

    if entity_type.trim().is_empty() {
        return Err(SchemaError::EntityTypeMismatch {
            entity_type: entity_type.clone(),
            reason: "entity type name is empty".to_string(),
        });
    }

    for attribute in descriptor.attributes.values() {
        if !attribute.attribute_type.is_supported() {
            return Err(SchemaError::EntityTypeMismatch {
                entity_type: entity_type.clone(),
                reason: format!(
                    "attribute '{}' has unsupported type {}",
                    attribute.name,
                    attribute.attribute_type.name()
                ),
            });
        }
    }

    for index in descriptor.indexes.values() {
        if !descriptor.attributes.contains_key(&index.field) {
            return Err(SchemaError::InvalidIndex {
                entity_type: entity_type.clone(),
                index: index.name.clone(),
                field: index.field.clone(),
            });
        }
    }

    let identifier = &descriptor.identifier;
    let id_attribute = descriptor.attributes.get(&identifier.name).ok_or_else(|| {
        SchemaError::InvalidIdentifier {
            entity_type: entity_type.clone(),
            identifier: identifier.name.clone(),
            reason: "identifier is not a declared attribute".to_string(),
        }
    })?;
    match id_attribute.attribute_type {
        AttributeType::Int | AttributeType::String => {}
        _ => {
            return Err(SchemaError::InvalidIdentifier {
                entity_type: entity_type.clone(),
                identifier: identifier.name.clone(),
                reason: format!(
                    "identifier type {} is not supported",
                    id_attribute.attribute_type.name()
                ),
            });
        }
    }
    if identifier.generator == GeneratorStrategy::Sequence
        && id_attribute.attribute_type != AttributeType::Int
    {
        return Err(SchemaError::InvalidIdentifier {
            entity_type: entity_type.clone(),
            identifier: identifier.name.clone(),
            reason: "sequence generator requires an orderable numeric identifier".to_string(),
        });
    }

    for relationship in descriptor.relationships.values() {
        if relationship.inverse_entity.trim().is_empty() {
            return Err(SchemaError::EntityClassNotFound {
                entity_type: entity_type.clone(),
                relationship: relationship.name.clone(),
            });
        }
        if relationship.parent_entity != *entity_type {
            return Err(SchemaError::InvalidRelationshipType {
                entity_type: entity_type.clone(),
                relationship: relationship.name.clone(),
                reason: format!(
                    "parent entity '{}' does not match declaring type",
                    relationship.parent_entity
                ),
            });
        }
        // A relationship field must not shadow a declared attribute
        if descriptor.attributes.contains_key(&relationship.name) {
            return Err(SchemaError::InvalidRelationshipType {
                entity_type: entity_type.clone(),
                relationship: relationship.name.clone(),
                reason: "relationship shadows a declared attribute".to_string(),
            });
        }
    }

    if let Some(partition_attribute) = &descriptor.partition {
        if !descriptor.attributes.contains_key(partition_attribute) {
            return Err(SchemaError::EntityTypeMismatch {
                entity_type: entity_type.clone(),
                reason: format!(
                    "partition attribute '{}' is not a declared attribute",
                    partition_attribute
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> EntityDescriptor {
        EntityDescriptor::new(
            "Person",
            IdentifierDescriptor::new("id", GeneratorStrategy::Sequence),
        )
        .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
        .add_attribute(AttributeDescriptor::new("name", AttributeType::String))
        .add_attribute(AttributeDescriptor::new("age", AttributeType::Int))
    }

    #[test]
    fn test_valid_descriptor() {
        assert!(validate(&person()).is_ok());
    }

    #[test]
    fn test_validation_is_idempotent() {
        let descriptor = person();
        assert_eq!(validate(&descriptor), validate(&descriptor));

        let bad = person().add_index(IndexDescriptor::new("idx_missing", "nope"));
        assert_eq!(validate(&bad), validate(&bad));
    }

    #[test]
    fn test_index_field_must_exist() {
        let descriptor = person().add_index(IndexDescriptor::new("idx_email", "email"));
        assert!(matches!(
            validate(&descriptor),
            Err(SchemaError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn test_identifier_must_be_declared() {
        let descriptor = EntityDescriptor::new(
            "Ghost",
            IdentifierDescriptor::new("missing", GeneratorStrategy::None),
        )
        .add_attribute(AttributeDescriptor::new("name", AttributeType::String));
        assert!(matches!(
            validate(&descriptor),
            Err(SchemaError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_sequence_requires_numeric_identifier() {
        let descriptor = EntityDescriptor::new(
            "Tag",
            IdentifierDescriptor::new("code", GeneratorStrategy::Sequence),
        )
        .add_attribute(AttributeDescriptor::new("code", AttributeType::String));
        assert!(matches!(
            validate(&descriptor),
            Err(SchemaError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_nested_list_type_rejected() {
        let descriptor = person().add_attribute(AttributeDescriptor::new(
            "matrix",
            AttributeType::List(Box::new(AttributeType::List(Box::new(AttributeType::Int)))),
        ));
        assert!(matches!(
            validate(&descriptor),
            Err(SchemaError::EntityTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_relationship_requires_target_type() {
        let descriptor = person().add_relationship(RelationshipDescriptor::new(
            "children",
            RelationshipVariant::OneToMany,
            "Person",
            "",
        ));
        assert!(matches!(
            validate(&descriptor),
            Err(SchemaError::EntityClassNotFound { .. })
        ));
    }

    #[test]
    fn test_relationship_must_not_shadow_attribute() {
        let descriptor = person().add_relationship(RelationshipDescriptor::new(
            "name",
            RelationshipVariant::ManyToOne,
            "Person",
            "Person",
        ));
        assert!(matches!(
            validate(&descriptor),
            Err(SchemaError::InvalidRelationshipType { .. })
        ));
    }
}
