//! Crate-level error type

use crate::relationship::RelationshipError;
use crate::schema::SchemaError;
use crate::store::StoreError;
use crate::validator::QueryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relationship(#[from] RelationshipError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("entity type '{0}' is not registered")]
    UnknownEntityType(String),

    #[error("{callback} callback failed for '{entity_type}': {message}")]
    Callback {
        callback: String,
        entity_type: String,
        message: String,
    },
}
