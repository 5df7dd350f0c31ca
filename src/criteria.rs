//! Criteria trees and match operators
//!
//! A query's predicate is a tree of `QueryCriteria` nodes combined with
//! `and`/`or` and negated with `not`. Leaves name an attribute (possibly a
//! dotted relationship path), an operator and a comparison value; the value
//! may be a sub-query resolved before evaluation.

use crate::query::Query;
use crate::types::AttributeValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operators for a criteria leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    StartsWith,
    NotStartsWith,
    Contains,
    NotContains,
    Like,
    NotLike,
    Matches,
    NotMatches,
    IsNull,
    NotNull,
    In,
    NotIn,
}

impl Operator {
    /// Apply the operator to a stored value. `actual` is `None` when the
    /// attribute is absent from the record; only IS_NULL (and the negating
    /// operators) match in that case.
    pub fn matches(&self, actual: Option<&AttributeValue>, expected: &AttributeValue) -> bool {
        match self {
            Operator::IsNull => actual.map_or(true, AttributeValue::is_null),
            Operator::NotNull => !Operator::IsNull.matches(actual, expected),
            Operator::Equal => actual.is_some_and(|value| value.loose_eq(expected)),
            Operator::NotEqual => !Operator::Equal.matches(actual, expected),
            Operator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
            Operator::GreaterThanEqual => {
                matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal))
            }
            Operator::LessThan => compare(actual, expected) == Some(Ordering::Less),
            Operator::LessThanEqual => {
                matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal))
            }
            Operator::StartsWith => {
                text_pair(actual, expected).is_some_and(|(a, e)| a.starts_with(&e))
            }
            Operator::NotStartsWith => !Operator::StartsWith.matches(actual, expected),
            Operator::Contains => text_pair(actual, expected).is_some_and(|(a, e)| a.contains(&e)),
            Operator::NotContains => !Operator::Contains.matches(actual, expected),
            Operator::Like => text_pair(actual, expected)
                .is_some_and(|(a, e)| a.to_lowercase() == e.to_lowercase()),
            Operator::NotLike => !Operator::Like.matches(actual, expected),
            Operator::Matches => text_pair(actual, expected).is_some_and(|(a, e)| {
                Regex::new(&e).map(|re| re.is_match(&a)).unwrap_or(false)
            }),
            Operator::NotMatches => !Operator::Matches.matches(actual, expected),
            Operator::In => match expected {
                AttributeValue::List(items) => actual
                    .is_some_and(|value| items.iter().any(|item| value.loose_eq(item))),
                other => Operator::Equal.matches(actual, other),
            },
            Operator::NotIn => !Operator::In.matches(actual, expected),
        }
    }
}

fn compare(actual: Option<&AttributeValue>, expected: &AttributeValue) -> Option<Ordering> {
    actual.and_then(|value| value.compare(expected))
}

fn text_pair(
    actual: Option<&AttributeValue>,
    expected: &AttributeValue,
) -> Option<(String, String)> {
    Some((actual?.as_text()?, expected.as_text()?))
}

/// Comparison value of a criteria leaf: a literal, or a sub-query whose
/// result set is collapsed into a value list before evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CriteriaValue {
    Value(AttributeValue),
    SubQuery(Box<Query>),
}

impl CriteriaValue {
    pub fn literal(&self) -> Option<&AttributeValue> {
        match self {
            CriteriaValue::Value(value) => Some(value),
            CriteriaValue::SubQuery(_) => None,
        }
    }
}

impl From<AttributeValue> for CriteriaValue {
    fn from(value: AttributeValue) -> Self {
        CriteriaValue::Value(value)
    }
}

impl From<Query> for CriteriaValue {
    fn from(query: Query) -> Self {
        CriteriaValue::SubQuery(Box::new(query))
    }
}

/// One node of a criteria tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCriteria {
    pub attribute: String,
    pub operator: Operator,
    pub value: CriteriaValue,
    /// Negate this node's folded result
    pub is_not: bool,
    /// OR-combine this node into its parent (AND is the default)
    pub is_or: bool,
    pub sub_criteria: Vec<QueryCriteria>,
    /// Synthetic wrapper produced by negating a compound tree; carries no
    /// predicate of its own and reads the fold identity instead
    pub flip: bool,
    /// Evaluation slot assigned by the compile pass
    #[serde(skip)]
    pub(crate) node_id: usize,
    /// Set by the compile pass when `attribute` traverses a relationship
    #[serde(skip)]
    pub(crate) is_relationship: bool,
    /// Dotted path split into segments by the compile pass
    #[serde(skip)]
    pub(crate) path: Vec<String>,
}

impl QueryCriteria {
    pub fn new(
        attribute: impl Into<String>,
        operator: Operator,
        value: impl Into<CriteriaValue>,
    ) -> Self {
        QueryCriteria {
            attribute: attribute.into(),
            operator,
            value: value.into(),
            is_not: false,
            is_or: false,
            sub_criteria: Vec::new(),
            flip: false,
            node_id: 0,
            is_relationship: false,
            path: Vec::new(),
        }
    }

    pub fn and(mut self, criteria: QueryCriteria) -> Self {
        self.sub_criteria.push(criteria);
        self
    }

    pub fn or(mut self, mut criteria: QueryCriteria) -> Self {
        criteria.is_or = true;
        self.sub_criteria.push(criteria);
        self
    }

    /// Negate. On a leaf this toggles the node itself; on a compound tree a
    /// flip wrapper is introduced so the negation covers the whole subtree.
    pub fn not(mut self) -> Self {
        if self.sub_criteria.is_empty() {
            self.is_not = !self.is_not;
            return self;
        }
        let mut wrapper = QueryCriteria::new("", Operator::NotNull, AttributeValue::Null);
        wrapper.flip = true;
        wrapper.is_not = true;
        wrapper.sub_criteria.push(self);
        wrapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(attribute: &str, value: i64) -> QueryCriteria {
        QueryCriteria::new(attribute, Operator::Equal, AttributeValue::Int(value))
    }

    #[test]
    fn test_and_or_shape() {
        let tree = eq("a", 1).and(eq("b", 2)).or(eq("c", 3));
        assert_eq!(tree.sub_criteria.len(), 2);
        assert!(!tree.sub_criteria[0].is_or);
        assert!(tree.sub_criteria[1].is_or);
    }

    #[test]
    fn test_not_on_leaf_toggles() {
        let leaf = eq("a", 1).not();
        assert!(leaf.is_not);
        assert!(!leaf.flip);
        assert!(!leaf.not().is_not);
    }

    #[test]
    fn test_not_on_compound_wraps() {
        let tree = eq("a", 1).and(eq("b", 2)).not();
        assert!(tree.flip);
        assert!(tree.is_not);
        assert_eq!(tree.sub_criteria.len(), 1);
        assert_eq!(tree.sub_criteria[0].sub_criteria.len(), 1);
    }

    #[test]
    fn test_equal_coerces_numerics() {
        let actual = AttributeValue::Int(5);
        assert!(Operator::Equal.matches(Some(&actual), &AttributeValue::Float(5.0)));
        assert!(Operator::NotEqual.matches(Some(&actual), &AttributeValue::Int(6)));
        assert!(Operator::NotEqual.matches(None, &AttributeValue::Int(6)));
    }

    #[test]
    fn test_ordering_operators() {
        let actual = AttributeValue::Int(6);
        assert!(Operator::GreaterThan.matches(Some(&actual), &AttributeValue::Int(5)));
        assert!(Operator::LessThanEqual.matches(Some(&actual), &AttributeValue::Float(6.0)));
        assert!(!Operator::LessThan.matches(Some(&actual), &AttributeValue::Int(6)));
        // Missing values never satisfy an ordering operator
        assert!(!Operator::GreaterThan.matches(None, &AttributeValue::Int(0)));
    }

    #[test]
    fn test_string_operators() {
        let name = AttributeValue::String("Alice".into());
        assert!(Operator::StartsWith.matches(Some(&name), &AttributeValue::String("Al".into())));
        assert!(Operator::Contains.matches(Some(&name), &AttributeValue::String("lic".into())));
        assert!(Operator::Like.matches(Some(&name), &AttributeValue::String("alice".into())));
        assert!(Operator::Matches.matches(Some(&name), &AttributeValue::String("^A.*e$".into())));
        assert!(!Operator::Matches.matches(Some(&name), &AttributeValue::String("[".into())));
    }

    #[test]
    fn test_null_and_membership() {
        assert!(Operator::IsNull.matches(None, &AttributeValue::Null));
        assert!(Operator::IsNull.matches(Some(&AttributeValue::Null), &AttributeValue::Null));
        assert!(!Operator::IsNull.matches(Some(&AttributeValue::Int(1)), &AttributeValue::Null));

        let list = AttributeValue::List(vec![AttributeValue::Int(1), AttributeValue::Int(2)]);
        assert!(Operator::In.matches(Some(&AttributeValue::Int(2)), &list));
        assert!(Operator::NotIn.matches(Some(&AttributeValue::Int(3)), &list));
        // A scalar comparison value degrades to equality
        assert!(Operator::In.matches(Some(&AttributeValue::Int(4)), &AttributeValue::Int(4)));
    }
}
