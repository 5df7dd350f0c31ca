//! Query envelope
//!
//! Bundles the entity type, criteria tree, selections, updates, partition
//! target and paging window. Built fluently; validation and execution live
//! in `validator` and `engine`.

use crate::criteria::QueryCriteria;
use crate::index::IndexController;
use crate::schema::AttributeDescriptor;
use crate::types::AttributeValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which partitions a query runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionTarget {
    /// Not specified by the caller; the validator derives one from the
    /// criteria tree, defaulting to all partitions
    Unset,
    Value(String),
    All,
}

impl Default for PartitionTarget {
    fn default() -> Self {
        PartitionTarget::Unset
    }
}

/// One field assignment of an update query. The validator resolves the
/// attribute descriptor, coerces the value and binds the index controller
/// that must be refreshed when the update runs.
#[derive(Clone, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub field_name: String,
    pub value: AttributeValue,
    #[serde(skip)]
    pub(crate) descriptor: Option<AttributeDescriptor>,
    #[serde(skip)]
    pub(crate) index_controller: Option<Arc<dyn IndexController>>,
}

impl AttributeUpdate {
    pub fn new(field_name: impl Into<String>, value: AttributeValue) -> Self {
        AttributeUpdate {
            field_name: field_name.into(),
            value,
            descriptor: None,
            index_controller: None,
        }
    }
}

impl fmt::Debug for AttributeUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeUpdate")
            .field("field_name", &self.field_name)
            .field("value", &self.value)
            .finish()
    }
}

/// A projected column: a plain attribute or a scalar function over one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    Attribute(String),
    Function {
        name: String,
        attribute: String,
        params: Vec<String>,
    },
}

impl Selection {
    /// Parse a selection expression like `name` or `substring(name, 0, 3)`.
    ///
    /// The grammar is deliberately small: one function call, arguments split
    /// on commas with quotes and whitespace stripped. Commas inside quoted
    /// arguments are not understood.
    pub fn parse(text: &str) -> Selection {
        let pattern = Regex::new(r"^(\w+)\((.+)\)$").ok();
        if let Some(captures) = pattern.and_then(|re| re.captures(text.trim())) {
            let mut parts = captures[2]
                .split(',')
                .map(|part| part.trim().trim_matches(|c| c == '\'' || c == '"').to_string());
            if let Some(attribute) = parts.next() {
                return Selection::Function {
                    name: captures[1].to_lowercase(),
                    attribute,
                    params: parts.collect(),
                };
            }
        }
        Selection::Attribute(text.trim().to_string())
    }

    /// The attribute this selection reads
    pub fn attribute(&self) -> &str {
        match self {
            Selection::Attribute(attribute) => attribute,
            Selection::Function { attribute, .. } => attribute,
        }
    }

    /// Apply the selection to a raw attribute value
    pub fn apply(&self, value: Option<&AttributeValue>) -> AttributeValue {
        let Some(value) = value else {
            return AttributeValue::Null;
        };
        match self {
            Selection::Attribute(_) => value.clone(),
            Selection::Function { name, params, .. } => match (name.as_str(), value.as_text()) {
                ("upper", Some(text)) => AttributeValue::String(text.to_uppercase()),
                ("lower", Some(text)) => AttributeValue::String(text.to_lowercase()),
                ("substring", Some(text)) => {
                    let start = params
                        .first()
                        .and_then(|p| p.parse::<usize>().ok())
                        .unwrap_or(0);
                    let length = params
                        .get(1)
                        .and_then(|p| p.parse::<usize>().ok())
                        .unwrap_or(text.len());
                    let slice: String = text.chars().skip(start).take(length).collect();
                    AttributeValue::String(slice)
                }
                _ => value.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub entity_type: String,
    pub criteria: Option<QueryCriteria>,
    pub selections: Vec<Selection>,
    pub updates: Vec<AttributeUpdate>,
    pub partition: PartitionTarget,
    /// Zero-based offset into the matched set
    pub first_row: usize,
    pub max_results: Option<usize>,
    /// Total matches before paging, populated by execution
    #[serde(skip)]
    pub results_count: usize,
    /// Evaluation slots allocated by the compile pass
    #[serde(skip)]
    pub(crate) node_count: usize,
}

impl Query {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Query {
            entity_type: entity_type.into(),
            criteria: None,
            selections: Vec::new(),
            updates: Vec::new(),
            partition: PartitionTarget::Unset,
            first_row: 0,
            max_results: None,
            results_count: 0,
            node_count: 0,
        }
    }

    pub fn with_criteria(mut self, criteria: QueryCriteria) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn select(mut self, expression: &str) -> Self {
        self.selections.push(Selection::parse(expression));
        self
    }

    pub fn set(mut self, field_name: impl Into<String>, value: AttributeValue) -> Self {
        self.updates.push(AttributeUpdate::new(field_name, value));
        self
    }

    pub fn in_partition(mut self, value: impl Into<String>) -> Self {
        self.partition = PartitionTarget::Value(value.into());
        self
    }

    pub fn for_all_partitions(mut self) -> Self {
        self.partition = PartitionTarget::All;
        self
    }

    pub fn first_row(mut self, first_row: usize) -> Self {
        self.first_row = first_row;
        self
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }
}
