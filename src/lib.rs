//! Strata - Embeddable Object-Graph Persistence Engine
//!
//! Query evaluation and relationship consistency core for a schema-described
//! object graph: entities are dynamic attribute maps described by registered
//! descriptors, related to each other through declared relationships and
//! stored across named partitions.
//!
//! # Architecture
//!
//! - Schema Layer: runtime entity descriptors with validation
//! - Storage Layer: narrow record-store seam, in-memory store included
//! - Index Layer: B-tree secondary indexes kept consistent on every write
//! - Relationship Layer: cascading save/delete/hydrate over cyclic graphs
//! - Query Layer: criteria trees, sub-queries, selections and updates
//! - Evaluation Layer: per-candidate contexts safe for concurrent use

pub mod types;
pub mod schema;
pub mod store;
pub mod index;
pub mod registry;
pub mod reference;

// Relationship graph modules
pub mod relationship;

// Query modules
pub mod criteria;
pub mod query;
pub mod evaluator;
pub mod validator;

// Engine facade
pub mod engine;
pub mod error;

pub use types::{Attributes, AttributeValue, Entity, Reference, RelationshipReference};
pub use schema::{
    AttributeDescriptor, AttributeType, CascadePolicy, EntityDescriptor, GeneratorStrategy,
    IdentifierDescriptor, IndexDescriptor, LifecycleCallback, LifecycleCallbacks,
    RelationshipDescriptor, RelationshipVariant, SchemaError,
};
pub use store::{InMemoryStore, RecordStore, StoreError};
pub use index::{BTreeIndexController, IndexController, IndexKey};
pub use registry::SchemaRegistry;

// Relationship exports
pub use relationship::{
    CascadeContext, EntityPersister, RelationshipError, RelationshipInteractor,
    RelationshipTransaction, StorePathResult,
};

// Query exports
pub use criteria::{CriteriaValue, Operator, QueryCriteria};
pub use query::{AttributeUpdate, PartitionTarget, Query, Selection};
pub use evaluator::EvalContext;
pub use validator::{QueryError, QueryRunner};

// Engine exports
pub use engine::Engine;
pub use error::EngineError;
