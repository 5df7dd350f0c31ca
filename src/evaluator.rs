//! Criteria evaluation
//!
//! Three passes over a criteria tree. A compile pass (run once per query by
//! the validator) assigns evaluation slots and classifies each node's
//! attribute path. A flat pass evaluates every predicate node for one
//! candidate record into a per-candidate `EvalContext`. A pure fold combines
//! the flat results with the AND/OR/NOT structure.
//!
//! Keeping per-candidate state in the context rather than on the tree means
//! any number of candidates (and threads) can evaluate the same compiled
//! query concurrently.

use crate::criteria::{Operator, QueryCriteria};
use crate::registry::SchemaRegistry;
use crate::relationship::{relationship_from_store, StorePathResult};
use crate::schema::EntityDescriptor;
use crate::types::{AttributeValue, Entity, Reference};

/// Per-candidate evaluation results, indexed by the node ids assigned at
/// compile time. Flip wrappers never populate their slot; the fold reads
/// the combination identity for them instead.
#[derive(Debug)]
pub struct EvalContext {
    flat: Vec<Option<bool>>,
}

impl EvalContext {
    pub fn new(node_count: usize) -> Self {
        EvalContext {
            flat: vec![None; node_count],
        }
    }

    fn set(&mut self, node_id: usize, met: bool) {
        if let Some(slot) = self.flat.get_mut(node_id) {
            *slot = Some(met);
        }
    }

    fn get(&self, node_id: usize) -> Option<bool> {
        self.flat.get(node_id).copied().flatten()
    }
}

/// Compile pass: assign node ids depth-first, split dotted attributes into
/// path segments and mark relationship traversals. Runs once per validated
/// query; evaluation never re-parses paths.
pub fn compile(descriptor: &EntityDescriptor, criteria: &mut QueryCriteria, next_id: &mut usize) {
    criteria.node_id = *next_id;
    *next_id += 1;
    if criteria.attribute.is_empty() {
        criteria.path = Vec::new();
    } else {
        criteria.path = criteria.attribute.split('.').map(String::from).collect();
    }
    criteria.is_relationship = criteria.path.len() > 1
        || criteria
            .path
            .first()
            .is_some_and(|first| descriptor.relationship(first).is_some());
    for sub in &mut criteria.sub_criteria {
        compile(descriptor, sub, next_id);
    }
}

/// Flat pass: evaluate every predicate node of the tree against one
/// candidate and record the outcomes in the context
pub fn fill(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    criteria: &QueryCriteria,
    entity: &Entity,
    reference: &Reference,
    ctx: &mut EvalContext,
) {
    if !criteria.flip {
        let met = node_met(registry, descriptor, criteria, entity, reference);
        ctx.set(criteria.node_id, met);
    }
    for sub in &criteria.sub_criteria {
        fill(registry, descriptor, sub, entity, reference, ctx);
    }
}

/// Fold the flat results back through the tree structure. Children combine
/// in declaration order, each ANDed or ORed into the running result by its
/// own flag; NOT inverts the folded result of the node it sits on. Reads
/// only, so re-folding the same context is stable.
pub fn calculate_criteria_met(criteria: &QueryCriteria, ctx: &EvalContext) -> bool {
    let mut result = match ctx.get(criteria.node_id) {
        Some(met) => met,
        // Flip wrapper: start from the identity of its child's combination
        None => criteria.sub_criteria.first().map_or(true, |sub| !sub.is_or),
    };
    for sub in &criteria.sub_criteria {
        let sub_met = calculate_criteria_met(sub, ctx);
        result = if sub.is_or {
            result || sub_met
        } else {
            result && sub_met
        };
    }
    if criteria.is_not {
        !result
    } else {
        result
    }
}

/// Full evaluation of one candidate with a fresh context
pub fn meets_criteria(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    criteria: &QueryCriteria,
    node_count: usize,
    entity: &Entity,
    reference: &Reference,
) -> bool {
    let mut ctx = EvalContext::new(node_count);
    fill(registry, descriptor, criteria, entity, reference, &mut ctx);
    calculate_criteria_met(criteria, &ctx)
}

fn node_met(
    registry: &SchemaRegistry,
    descriptor: &EntityDescriptor,
    criteria: &QueryCriteria,
    entity: &Entity,
    reference: &Reference,
) -> bool {
    let null = AttributeValue::Null;
    let expected = criteria.value.literal().unwrap_or(&null);

    if !criteria.is_relationship {
        return criteria
            .operator
            .matches(entity.get(&criteria.attribute), expected);
    }

    match relationship_from_store(registry, descriptor, &criteria.path, reference) {
        StorePathResult::Resolved {
            entities,
            entity_type,
            suffix,
        } => {
            // An empty related set satisfies IS_NULL and nothing else
            if entities.is_empty() {
                return criteria.operator == Operator::IsNull;
            }
            // Existential semantics: any related entity may satisfy the
            // predicate. With no suffix the terminal identifier is compared.
            let identifier_name = registry
                .descriptor_for(&entity_type, None)
                .map(|terminal| terminal.identifier.name.clone());
            entities.iter().any(|related| {
                let actual = match suffix.first() {
                    Some(field) if suffix.len() == 1 => related.get(field),
                    Some(_) => None,
                    None => identifier_name.as_deref().and_then(|name| related.get(name)),
                };
                criteria.operator.matches(actual, expected)
            })
        }
        // First segment is a plain attribute after all: value-graph fallback.
        // A list-valued attribute matches existentially over its elements.
        StorePathResult::Unresolved => {
            let first = criteria.path.first().map(String::as_str).unwrap_or("");
            match entity.get(first) {
                Some(AttributeValue::List(items)) => items
                    .iter()
                    .any(|item| criteria.operator.matches(Some(item), expected)),
                actual => criteria.operator.matches(actual, expected),
            }
        }
    }
}
