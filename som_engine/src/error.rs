//! Engine error taxonomy.
//!
//! Expected business conditions (missing entity, rejected mutation,
//! conflicting end) are ordinary `Err` values the caller inspects.
//! Every variant maps to a stable machine-readable code.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::RelationshipId;
use crate::validator::ValidationFailure;

/// Kind of entity an id refers to. Used in `NotFound` / `DuplicateId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    Holon,
    Relationship,
    Document,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Event => "event",
            EntityKind::Holon => "holon",
            EntityKind::Relationship => "relationship",
            EntityKind::Document => "document",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("{kind} not found: {}", ids.join(", "))]
    NotFound { kind: EntityKind, ids: Vec<String> },

    #[error("validation failed: {0}")]
    Validation(ValidationFailure),

    #[error("dependency cycle rejected: {0}")]
    CycleDetected(ValidationFailure),

    #[error("cannot end relationship {relationship_id}: {reason}")]
    ConflictOnEnd {
        relationship_id: RelationshipId,
        reason: String,
    },

    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: EntityKind, id: String },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            ids: vec![id.into()],
        }
    }

    /// Wrap a validation failure, promoting it to `CycleDetected` when any
    /// of its errors is a dependency-cycle rule.
    pub fn from_validation(failure: ValidationFailure) -> Self {
        if failure.is_cycle() {
            EngineError::CycleDetected(failure)
        } else {
            EngineError::Validation(failure)
        }
    }

    /// Stable machine-readable code for the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Validation(_) => "validation_failure",
            EngineError::CycleDetected(_) => "cycle_detected",
            EngineError::ConflictOnEnd { .. } => "conflict_on_end",
            EngineError::DuplicateId { .. } => "duplicate_id",
            EngineError::InvalidEvent(_) => "invalid_event",
            EngineError::InvalidFilter(_) => "invalid_filter",
            EngineError::Serialization(_) => "serialization_error",
        }
    }

    /// The validation failure carried by this error, if any.
    pub fn validation_failure(&self) -> Option<&ValidationFailure> {
        match self {
            EngineError::Validation(f) | EngineError::CycleDetected(f) => Some(f),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
