//! Query validation
//!
//! Runs once before execution: fills in the default criteria, collapses
//! sub-queries into literal value lists, derives the partition target from
//! the criteria tree, compiles the tree for evaluation and type-checks
//! update assignments against the schema.

use crate::criteria::{CriteriaValue, Operator, QueryCriteria};
use crate::evaluator;
use crate::query::{PartitionTarget, Query};
use crate::registry::SchemaRegistry;
use crate::schema::{AttributeType, EntityDescriptor};
use crate::types::{AttributeValue, Entity};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("entity type '{0}' is not registered")]
    UnknownEntityType(String),

    #[error("attribute '{attribute}' does not exist on '{entity_type}'")]
    AttributeMissing {
        entity_type: String,
        attribute: String,
    },

    #[error("attribute '{attribute}' on '{entity_type}' is not nullable")]
    AttributeNonNull {
        entity_type: String,
        attribute: String,
    },

    #[error("attribute '{attribute}' on '{entity_type}' exceeds max size {max_size}")]
    AttributeSize {
        entity_type: String,
        attribute: String,
        max_size: usize,
    },

    #[error("identifier '{attribute}' on '{entity_type}' cannot be updated")]
    AttributeUpdateOnIdentifier {
        entity_type: String,
        attribute: String,
    },

    #[error("value for '{attribute}' on '{entity_type}' is not a {expected}")]
    AttributeTypeMismatch {
        entity_type: String,
        attribute: String,
        expected: String,
    },

    #[error("sub-query failed: {0}")]
    SubQuery(String),

    #[error("relationship traversal failed: {0}")]
    Relationship(String),

    #[error("storage failed: {0}")]
    Store(String),
}

/// Execution seam handed to the validator so sub-queries can run eagerly
pub trait QueryRunner {
    fn run(&self, query: &mut Query) -> Result<Vec<Entity>, QueryError>;
}

/// Validate and prepare a query in place. After this returns Ok the query
/// carries a criteria tree with no sub-query values, a concrete partition
/// target, compiled evaluation slots and type-checked updates.
pub fn validate(
    registry: &SchemaRegistry,
    runner: &dyn QueryRunner,
    query: &mut Query,
) -> Result<(), QueryError> {
    let descriptor = registry
        .descriptor_for(&query.entity_type, None)
        .ok_or_else(|| QueryError::UnknownEntityType(query.entity_type.clone()))?;

    // No criteria means "everything": an always-true predicate on the
    // identifier keeps the evaluation path uniform
    if query.criteria.is_none() {
        query.criteria = Some(QueryCriteria::new(
            descriptor.identifier.name.clone(),
            Operator::NotNull,
            AttributeValue::Null,
        ));
    }

    if let Some(criteria) = query.criteria.as_mut() {
        resolve_sub_queries(registry, runner, criteria)?;
    }

    if query.partition == PartitionTarget::Unset {
        query.partition = derive_partition(&descriptor, query.criteria.as_ref());
        debug!(entity_type = %query.entity_type, partition = ?query.partition, "derived partition target");
    }

    let mut node_count = 0;
    if let Some(criteria) = query.criteria.as_mut() {
        evaluator::compile(&descriptor, criteria, &mut node_count);
    }
    query.node_count = node_count;
    if let Some(criteria) = query.criteria.as_ref() {
        validate_paths(registry, &descriptor, criteria)?;
    }

    validate_updates(registry, &descriptor, query)?;
    Ok(())
}

/// Replace every sub-query value in the tree with the distinct list of
/// values it selects: the first selection when one is given, the nested
/// type's identifier otherwise.
fn resolve_sub_queries(
    registry: &SchemaRegistry,
    runner: &dyn QueryRunner,
    criteria: &mut QueryCriteria,
) -> Result<(), QueryError> {
    if let CriteriaValue::SubQuery(sub_query) = &mut criteria.value {
        let selection = sub_query.selections.first().cloned();
        let identifier_name = registry
            .descriptor_for(&sub_query.entity_type, None)
            .ok_or_else(|| QueryError::UnknownEntityType(sub_query.entity_type.clone()))?
            .identifier
            .name
            .clone();

        let results = runner
            .run(sub_query)
            .map_err(|err| QueryError::SubQuery(err.to_string()))?;

        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for entity in &results {
            let value = match &selection {
                Some(selection) => selection.apply(entity.get(selection.attribute())),
                None => entity
                    .get(&identifier_name)
                    .cloned()
                    .unwrap_or(AttributeValue::Null),
            };
            if value.is_null() {
                continue;
            }
            if seen.insert(value.canonical_text()) {
                values.push(value);
            }
        }
        criteria.value = CriteriaValue::Value(AttributeValue::List(values));
    }
    for sub in &mut criteria.sub_criteria {
        resolve_sub_queries(registry, runner, sub)?;
    }
    Ok(())
}

/// Derive the partition target from the top-level conjuncts: a non-negated
/// equality on the partition attribute pins the query to one partition,
/// anything else scans them all.
fn derive_partition(
    descriptor: &EntityDescriptor,
    criteria: Option<&QueryCriteria>,
) -> PartitionTarget {
    let Some(partition_attribute) = descriptor.partition.as_deref() else {
        return PartitionTarget::All;
    };
    let Some(criteria) = criteria else {
        return PartitionTarget::All;
    };

    let mut conjuncts = vec![criteria];
    conjuncts.extend(criteria.sub_criteria.iter().filter(|sub| !sub.is_or));
    for node in conjuncts {
        if node.attribute == partition_attribute
            && node.operator == Operator::Equal
            && !node.is_not
        {
            if let Some(value) = node.value.literal() {
                if let Some(text) = value.as_text() {
                    if !text.is_empty() {
                        return PartitionTarget::Value(text);
                    }
                }
            }
        }
    }
    PartitionTarget::All
}

/// Reject paths that descend through a relationship and then try to read
/// more than one trailing non-relationship segment. Stored attribute maps
/// are flat, so such a path could never match anything; failing here beats
/// a predicate that silently never matches. Dotted paths whose head is a
/// plain attribute are left alone (they fall back to the value graph).
fn validate_paths(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    criteria: &QueryCriteria,
) -> Result<(), QueryError> {
    if criteria
        .path
        .first()
        .is_some_and(|first| descriptor.relationship(first).is_some())
    {
        let mut current = descriptor.clone();
        let mut consumed = 0;
        for segment in &criteria.path {
            match current.relationship(segment) {
                Some(relationship) => {
                    consumed += 1;
                    match registry.descriptor_for(&relationship.inverse_entity, None) {
                        Some(next) => current = (*next).clone(),
                        None => break,
                    }
                }
                None => break,
            }
        }
        if criteria.path.len() - consumed > 1 {
            return Err(QueryError::AttributeMissing {
                entity_type: current.entity_type.clone(),
                attribute: criteria.attribute.clone(),
            });
        }
    }
    for sub in &criteria.sub_criteria {
        validate_paths(registry, descriptor, sub)?;
    }
    Ok(())
}

fn validate_updates(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    query: &mut Query,
) -> Result<(), QueryError> {
    for update in &mut query.updates {
        let attribute = descriptor.attribute(&update.field_name).ok_or_else(|| {
            QueryError::AttributeMissing {
                entity_type: descriptor.entity_type.clone(),
                attribute: update.field_name.clone(),
            }
        })?;
        if update.field_name == descriptor.identifier.name {
            return Err(QueryError::AttributeUpdateOnIdentifier {
                entity_type: descriptor.entity_type.clone(),
                attribute: update.field_name.clone(),
            });
        }
        if update.value.is_null() {
            if !attribute.nullable {
                return Err(QueryError::AttributeNonNull {
                    entity_type: descriptor.entity_type.clone(),
                    attribute: update.field_name.clone(),
                });
            }
        } else {
            update.value = coerce_to(&update.value, &attribute.attribute_type).ok_or_else(|| {
                QueryError::AttributeTypeMismatch {
                    entity_type: descriptor.entity_type.clone(),
                    attribute: update.field_name.clone(),
                    expected: attribute.attribute_type.name(),
                }
            })?;
            if let (Some(max_size), AttributeValue::String(text)) =
                (attribute.max_size, &update.value)
            {
                if text.len() > max_size {
                    return Err(QueryError::AttributeSize {
                        entity_type: descriptor.entity_type.clone(),
                        attribute: update.field_name.clone(),
                        max_size,
                    });
                }
            }
        }
        update.descriptor = Some(attribute.clone());
        update.index_controller = descriptor
            .indexes
            .values()
            .find(|index| index.field == update.field_name)
            .and_then(|index| registry.index_controller(&descriptor.entity_type, &index.name));
    }
    Ok(())
}

/// Coerce a value into a declared attribute type. Numeric widening, lossless
/// narrowing and string parsing are accepted; anything else is a mismatch.
fn coerce_to(value: &AttributeValue, target: &AttributeType) -> Option<AttributeValue> {
    match (value, target) {
        (AttributeValue::Bool(_), AttributeType::Bool)
        | (AttributeValue::Int(_), AttributeType::Int)
        | (AttributeValue::Float(_), AttributeType::Float)
        | (AttributeValue::String(_), AttributeType::String)
        | (AttributeValue::Bytes(_), AttributeType::Bytes)
        | (AttributeValue::List(_), AttributeType::List(_)) => Some(value.clone()),
        (AttributeValue::Int(i), AttributeType::Float) => Some(AttributeValue::Float(*i as f64)),
        (AttributeValue::Float(f), AttributeType::Int) if f.fract() == 0.0 => {
            Some(AttributeValue::Int(*f as i64))
        }
        (AttributeValue::String(s), AttributeType::Int) => {
            s.trim().parse::<i64>().ok().map(AttributeValue::Int)
        }
        (AttributeValue::String(s), AttributeType::Float) => {
            s.trim().parse::<f64>().ok().map(AttributeValue::Float)
        }
        (AttributeValue::String(s), AttributeType::Bool) => {
            s.trim().parse::<bool>().ok().map(AttributeValue::Bool)
        }
        (value, AttributeType::String) => value.as_text().map(AttributeValue::String),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        AttributeDescriptor, GeneratorStrategy, IdentifierDescriptor, IndexDescriptor,
        RelationshipDescriptor, RelationshipVariant,
    };

    struct NoRunner;
    impl QueryRunner for NoRunner {
        fn run(&self, _query: &mut Query) -> Result<Vec<Entity>, QueryError> {
            Ok(Vec::new())
        }
    }

    fn order() -> EntityDescriptor {
        EntityDescriptor::new(
            "Order",
            IdentifierDescriptor::new("id", GeneratorStrategy::None),
        )
        .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
        .add_attribute(AttributeDescriptor::new("total", AttributeType::Int).non_nullable())
        .add_attribute(
            AttributeDescriptor::new("code", AttributeType::String).with_max_size(4),
        )
        .add_attribute(AttributeDescriptor::new("region", AttributeType::String))
        .add_index(IndexDescriptor::new("idx_total", "total"))
        .with_partition("region")
    }

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry.register(order()).unwrap();
        registry
    }

    #[test]
    fn test_default_criteria_is_installed() {
        let registry = registry();
        let mut query = Query::new("Order");
        validate(&registry, &NoRunner, &mut query).unwrap();
        let criteria = query.criteria.unwrap();
        assert_eq!(criteria.attribute, "id");
        assert_eq!(criteria.operator, Operator::NotNull);
        assert_eq!(query.node_count, 1);
    }

    #[test]
    fn test_partition_derived_from_equality() {
        let registry = registry();
        let mut query = Query::new("Order").with_criteria(
            QueryCriteria::new(
                "region",
                Operator::Equal,
                AttributeValue::String("eu".into()),
            )
            .and(QueryCriteria::new(
                "total",
                Operator::GreaterThan,
                AttributeValue::Int(10),
            )),
        );
        validate(&registry, &NoRunner, &mut query).unwrap();
        assert_eq!(query.partition, PartitionTarget::Value("eu".into()));

        // A negated or OR-combined equality does not pin the partition
        let mut query = Query::new("Order").with_criteria(
            QueryCriteria::new(
                "region",
                Operator::Equal,
                AttributeValue::String("eu".into()),
            )
            .not(),
        );
        validate(&registry, &NoRunner, &mut query).unwrap();
        assert_eq!(query.partition, PartitionTarget::All);
    }

    #[test]
    fn test_update_rejects_identifier() {
        let registry = registry();
        let mut query = Query::new("Order").set("id", AttributeValue::Int(9));
        let err = validate(&registry, &NoRunner, &mut query).unwrap_err();
        assert!(matches!(
            err,
            QueryError::AttributeUpdateOnIdentifier { .. }
        ));
    }

    #[test]
    fn test_update_coerces_and_binds_index() {
        let registry = registry();
        let mut query = Query::new("Order").set("total", AttributeValue::String("6".into()));
        validate(&registry, &NoRunner, &mut query).unwrap();
        let update = &query.updates[0];
        assert_eq!(update.value, AttributeValue::Int(6));
        assert!(update.index_controller.is_some());
    }

    #[test]
    fn test_update_size_and_type_checks() {
        let registry = registry();

        let mut query = Query::new("Order").set("code", AttributeValue::String("toolong".into()));
        assert!(matches!(
            validate(&registry, &NoRunner, &mut query).unwrap_err(),
            QueryError::AttributeSize { max_size: 4, .. }
        ));

        let mut query = Query::new("Order").set("total", AttributeValue::String("abc".into()));
        assert!(matches!(
            validate(&registry, &NoRunner, &mut query).unwrap_err(),
            QueryError::AttributeTypeMismatch { .. }
        ));

        let mut query = Query::new("Order").set("total", AttributeValue::Null);
        assert!(matches!(
            validate(&registry, &NoRunner, &mut query).unwrap_err(),
            QueryError::AttributeNonNull { .. }
        ));
    }

    #[test]
    fn test_nested_relationship_suffix_rejected() {
        let registry = SchemaRegistry::new();
        registry
            .register(
                EntityDescriptor::new(
                    "Parent",
                    IdentifierDescriptor::new("id", GeneratorStrategy::Sequence),
                )
                .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
                .add_relationship(RelationshipDescriptor::new(
                    "children",
                    RelationshipVariant::OneToMany,
                    "Parent",
                    "Child",
                )),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new(
                    "Child",
                    IdentifierDescriptor::new("id", GeneratorStrategy::Sequence),
                )
                .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
                .add_attribute(AttributeDescriptor::new("age", AttributeType::Int)),
            )
            .unwrap();

        // One trailing attribute segment after the relationship is fine
        let mut query = Query::new("Parent").with_criteria(QueryCriteria::new(
            "children.age",
            Operator::Equal,
            AttributeValue::Int(1),
        ));
        validate(&registry, &NoRunner, &mut query).unwrap();

        // A deeper suffix can never resolve against a flat attribute map
        let mut query = Query::new("Parent").with_criteria(QueryCriteria::new(
            "children.a.b",
            Operator::Equal,
            AttributeValue::Int(1),
        ));
        assert!(matches!(
            validate(&registry, &NoRunner, &mut query).unwrap_err(),
            QueryError::AttributeMissing { .. }
        ));
    }

    #[test]
    fn test_unknown_entity_type() {
        let registry = registry();
        let mut query = Query::new("Missing");
        assert!(matches!(
            validate(&registry, &NoRunner, &mut query).unwrap_err(),
            QueryError::UnknownEntityType(_)
        ));
    }
}
