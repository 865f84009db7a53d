//! Boundary operations consumed by an API/routing layer.
//!
//! Every failure leaves here as an `ApiError` with a stable machine code.
//! Kernel errors keep their own code and message; storage and other
//! internal failures are logged and reported generically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use som_engine::domain::{Holon, Relationship};
use som_engine::engine::{BatchOutcome, Direction, ModelEngine, SubmitReceipt};
use som_engine::error::EngineError;
use som_engine::event_log::EventFilter;
use som_engine::events::{Event, EventDraft};
use som_engine::graph::{PatternMatch, PatternQuery};
use som_engine::holon_store::HolonFilter;
use som_engine::ids::{EventId, HolonId, RelationshipId};
use som_engine::relationship_store::{RelationshipFilter, RelationshipQuery};
use som_engine::temporal::{AsOf, CausalTrace};

use crate::error::RuntimeError;
use crate::session::SharedSession;

pub const INTERNAL_ERROR: &str = "internal_error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Engine(e) => ApiError {
                error: e.to_string(),
                code: e.code(),
            },
            other => {
                tracing::error!(error = %other, "internal failure at api boundary");
                ApiError {
                    error: "internal error".to_string(),
                    code: INTERNAL_ERROR,
                }
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        RuntimeError::Engine(err).into()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Cloneable handle over a shared session.
#[derive(Clone)]
pub struct Api {
    session: Arc<SharedSession>,
}

impl Api {
    pub fn new(session: Arc<SharedSession>) -> Self {
        Self { session }
    }

    /// Run a read that may itself fail with a kernel error.
    fn read<R>(
        &self,
        f: impl FnOnce(&ModelEngine) -> som_engine::error::Result<R>,
    ) -> ApiResult<R> {
        Ok(self.session.read(f)??)
    }

    pub fn submit_event(&self, draft: EventDraft) -> ApiResult<SubmitReceipt> {
        Ok(self.session.submit_event(draft)?)
    }

    pub fn submit_events_batch(
        &self,
        drafts: Vec<EventDraft>,
        atomic: bool,
    ) -> ApiResult<BatchOutcome> {
        Ok(self.session.submit_events_batch(drafts, atomic)?)
    }

    pub fn end_relationship(
        &self,
        relationship_id: &RelationshipId,
        effective_end: DateTime<Utc>,
        reason: Option<String>,
        actor: &HolonId,
    ) -> ApiResult<SubmitReceipt> {
        Ok(self
            .session
            .end_relationship(relationship_id, effective_end, reason, actor.clone())?)
    }

    pub fn get_event(&self, id: EventId) -> ApiResult<Event> {
        self.read(|e| e.get_event(id).cloned())
    }

    pub fn query_events(&self, filter: &EventFilter) -> ApiResult<Vec<Event>> {
        self.read(|e| Ok(e.query_events(filter)?.into_iter().cloned().collect()))
    }

    pub fn get_holon(&self, id: &HolonId) -> ApiResult<Holon> {
        self.read(|e| e.get_holon(id).cloned())
    }

    pub fn query_holons(&self, filter: &HolonFilter) -> ApiResult<Vec<Holon>> {
        self.read(|e| Ok(e.query_holons(filter).into_iter().cloned().collect()))
    }

    pub fn get_holon_relationships(
        &self,
        holon: &HolonId,
        direction: Direction,
        relationship_type: Option<&str>,
        filter: RelationshipFilter,
    ) -> ApiResult<Vec<Relationship>> {
        self.read(|e| {
            Ok(e.get_holon_relationships(holon, direction, relationship_type, filter)?
                .into_iter()
                .cloned()
                .collect())
        })
    }

    pub fn query_relationships(&self, query: &RelationshipQuery) -> ApiResult<Vec<Relationship>> {
        self.read(|e| Ok(e.query_relationships(query).into_iter().cloned().collect()))
    }

    pub fn query_holons_as_of(&self, filter: &HolonFilter, as_of: &AsOf) -> ApiResult<Vec<Holon>> {
        self.read(|e| Ok(e.query_holons_as_of(filter, as_of)))
    }

    pub fn holon_as_of(&self, id: &HolonId, as_of: &AsOf) -> ApiResult<Holon> {
        self.read(|e| e.holon_as_of(id, as_of))
    }

    pub fn query_relationships_as_of(
        &self,
        query: &RelationshipQuery,
        as_of: &AsOf,
    ) -> ApiResult<Vec<Relationship>> {
        self.read(|e| Ok(e.query_relationships_as_of(query, as_of)))
    }

    pub fn trace_causal_chain(
        &self,
        id: EventId,
        max_depth: Option<usize>,
    ) -> ApiResult<CausalTrace> {
        self.read(|e| e.trace_causal_chain(id, max_depth))
    }

    pub fn trace_consequences(
        &self,
        id: EventId,
        max_depth: Option<usize>,
    ) -> ApiResult<CausalTrace> {
        self.read(|e| e.trace_consequences(id, max_depth))
    }

    /// Pattern match over the last built index. Rebuilds first when the
    /// index is behind the projection.
    pub fn match_pattern(&self, query: &PatternQuery) -> ApiResult<Vec<PatternMatch>> {
        if self.session.read(|e| e.index_is_stale())? {
            self.session.rebuild_indices()?;
        }
        self.read(|e| e.match_pattern(query))
    }

    pub fn search(
        &self,
        term: &str,
        holon_types: &[String],
        max_results: usize,
    ) -> ApiResult<Vec<HolonId>> {
        if self.session.read(|e| e.index_is_stale())? {
            self.session.rebuild_indices()?;
        }
        Ok(self.session.read(|e| e.search(term, holon_types, max_results))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn kernel_errors_keep_their_code() {
        let err: ApiError = EngineError::InvalidFilter("limit must be positive".into()).into();
        assert_eq!(err.code, "invalid_filter");
        assert!(err.error.contains("limit must be positive"));
    }

    #[test]
    fn internal_errors_are_generic() {
        let io_err = io::Error::new(io::ErrorKind::Other, "/secret/path");
        let err: ApiError = RuntimeError::Io(io_err).into();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(!err.error.contains("secret"));
    }
}
