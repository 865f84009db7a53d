//! Top-level orchestrator.
//!
//! `ModelEngine` wires the event log, projector, validator and graph index
//! together and exposes the boundary operations. Writes are two-phase
//! (`prepare` then `commit`) so a durable store can persist the prepared
//! event before it becomes visible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::constraints::{DocumentRegistry, InMemoryDocumentRegistry};
use crate::domain::{Holon, Relationship};
use crate::error::{EngineError, Result};
use crate::event_log::{EventFilter, EventLog};
use crate::events::{Event, EventBody, EventDraft, RelationshipEnded};
use crate::graph::{GraphIndex, PatternMatch, PatternQuery};
use crate::holon_store::HolonFilter;
use crate::ids::{EventId, HolonId, RelationshipId};
use crate::projector::StateProjector;
use crate::relationship_store::{RelationshipFilter, RelationshipQuery};
use crate::state::Projection;
use crate::temporal::{AsOf, CausalTrace, TemporalQueryEngine};
use crate::transitions::TransitionResult;
use crate::validator::ConstraintValidator;

/// Outcome of one committed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub event_id: EventId,
    pub result: TransitionResult,
}

impl SubmitReceipt {
    pub fn is_rejected(&self) -> bool {
        self.result.is_rejected()
    }

    /// The refusal, if the event was recorded but its effect refused.
    pub fn rejection(&self) -> Option<&EngineError> {
        self.result.error.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Accepted(SubmitReceipt),
    Failed { index: usize, code: &'static str, message: String },
}

impl BatchItem {
    pub fn failed(index: usize, error: &EngineError) -> Self {
        BatchItem::Failed {
            index,
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// For atomic batches: whether anything was recorded.
    pub committed: bool,
    pub items: Vec<BatchItem>,
}

/// An atomic batch folded on copies of the log and projection, ready to
/// be persisted and installed.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    log: EventLog,
    projector: StateProjector,
    receipts: Vec<SubmitReceipt>,
    first: EventId,
}

impl StagedBatch {
    /// The new events, in order.
    pub fn events(&self) -> &[Event] {
        let start = (self.first.value() - 1) as usize;
        &self.log.events()[start..]
    }

    pub fn receipts(&self) -> &[SubmitReceipt] {
        &self.receipts
    }
}

/// Failure of an atomic batch at position `index`. Nothing was recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub index: usize,
    pub error: EngineError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

pub struct ModelEngine {
    config: EngineConfig,
    log: EventLog,
    projector: StateProjector,
    index: GraphIndex,
}

impl ModelEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn DocumentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let log = EventLog::new(clock, config.future_grace());
        let projector = StateProjector::new(ConstraintValidator::new(registry));
        Self {
            config,
            log,
            projector,
            index: GraphIndex::default(),
        }
    }

    /// Engine with the built-in governance rules.
    pub fn with_defaults(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(InMemoryDocumentRegistry::with_defaults(&config));
        Self::new(config, registry, clock)
    }

    /// Rebuild an engine from previously recorded events: restore the log,
    /// replay it and index the result.
    pub fn restore(
        config: EngineConfig,
        registry: Arc<dyn DocumentRegistry>,
        clock: Arc<dyn Clock>,
        events: Vec<Event>,
    ) -> Result<Self> {
        let log = EventLog::restore(events, clock, config.future_grace())?;
        let mut engine = Self {
            config,
            log,
            projector: StateProjector::new(ConstraintValidator::new(registry)),
            index: GraphIndex::default(),
        };
        engine.replay_all();
        engine.rebuild_indices();
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn state(&self) -> &Projection {
        self.projector.state()
    }

    pub fn validator(&self) -> &ConstraintValidator {
        self.projector.validator()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.log.clock()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Validate a draft and assign its id and `recorded_at` without
    /// recording it.
    pub fn prepare(&self, draft: EventDraft) -> Result<Event> {
        self.log.prepare(draft)
    }

    /// Record a prepared event and fold it into current state.
    pub fn commit(&mut self, event: Event) -> Result<SubmitReceipt> {
        let event_id = self.log.append(event)?;
        let event = self.log.get(event_id)?;
        let result = self.projector.apply_new_event(&self.log, event)?;
        if let Some(err) = &result.error {
            tracing::warn!(
                event_id = %event_id,
                event_type = %result.event_type,
                code = err.code(),
                error = %err,
                "event recorded, effect refused"
            );
        }
        Ok(SubmitReceipt { event_id, result })
    }

    pub fn submit_event(&mut self, draft: EventDraft) -> Result<SubmitReceipt> {
        let event = self.prepare(draft)?;
        self.commit(event)
    }

    /// Fold `drafts` on copies of the log and projection. Fails on the
    /// first draft that is malformed or whose effect would be refused.
    pub fn stage_batch(
        &self,
        drafts: Vec<EventDraft>,
    ) -> std::result::Result<StagedBatch, BatchFailure> {
        let mut log = self.log.clone();
        let mut projector = self.projector.clone();
        let first = log.next_id();
        let mut receipts = Vec::with_capacity(drafts.len());

        for (index, draft) in drafts.into_iter().enumerate() {
            let fail = |error| BatchFailure { index, error };
            let event = log.prepare(draft).map_err(fail)?;
            let event_id = log.append(event).map_err(fail)?;
            let event = log.get(event_id).map_err(fail)?;
            let result = projector.apply_new_event(&log, event).map_err(fail)?;
            if let Some(error) = result.error.clone() {
                return Err(fail(error));
            }
            receipts.push(SubmitReceipt { event_id, result });
        }

        Ok(StagedBatch {
            log,
            projector,
            receipts,
            first,
        })
    }

    /// Install a staged batch. The live log must not have moved since the
    /// batch was staged.
    pub fn apply_staged(&mut self, staged: StagedBatch) -> Result<Vec<SubmitReceipt>> {
        if staged.first != self.log.next_id() {
            return Err(EngineError::InvalidEvent(format!(
                "staged batch starts at event {}, log is at {}",
                staged.first,
                self.log.next_id()
            )));
        }
        self.log = staged.log;
        self.projector = staged.projector;
        Ok(staged.receipts)
    }

    /// Submit several drafts. Atomic batches record all events or none;
    /// otherwise each draft is submitted on its own and failures are
    /// reported per item.
    pub fn submit_events_batch(&mut self, drafts: Vec<EventDraft>, atomic: bool) -> BatchOutcome {
        if atomic {
            return match self.stage_batch(drafts) {
                Ok(staged) => match self.apply_staged(staged) {
                    Ok(receipts) => BatchOutcome {
                        committed: true,
                        items: receipts.into_iter().map(BatchItem::Accepted).collect(),
                    },
                    Err(err) => BatchOutcome {
                        committed: false,
                        items: vec![BatchItem::failed(0, &err)],
                    },
                },
                Err(failure) => {
                    tracing::warn!(
                        index = failure.index,
                        code = failure.error.code(),
                        "atomic batch aborted"
                    );
                    BatchOutcome {
                        committed: false,
                        items: vec![BatchItem::failed(failure.index, &failure.error)],
                    }
                }
            };
        }

        let items: Vec<BatchItem> = drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| match self.submit_event(draft) {
                Ok(receipt) => BatchItem::Accepted(receipt),
                Err(err) => BatchItem::failed(index, &err),
            })
            .collect();
        let committed = items.iter().any(|i| matches!(i, BatchItem::Accepted(_)));
        BatchOutcome { committed, items }
    }

    /// Draft the event that ends `relationship_id`, causally linked to the
    /// event that created it. Fails with `ConflictOnEnd` up front.
    pub fn end_relationship_draft(
        &self,
        relationship_id: &RelationshipId,
        effective_end: DateTime<Utc>,
        reason: Option<String>,
        actor: impl Into<HolonId>,
    ) -> Result<EventDraft> {
        let created_by = self
            .state()
            .relationships
            .check_end(relationship_id, effective_end)?;
        let mut payload = RelationshipEnded::new(relationship_id.clone()).at(effective_end);
        payload.reason = reason;
        let now = self.clock().now();
        let occurred_at = if effective_end < now { effective_end } else { now };
        Ok(
            EventDraft::new(EventBody::RelationshipEnded(payload), occurred_at, actor)
                .caused_by(created_by),
        )
    }

    pub fn end_relationship(
        &mut self,
        relationship_id: &RelationshipId,
        effective_end: DateTime<Utc>,
        reason: Option<String>,
        actor: impl Into<HolonId>,
    ) -> Result<SubmitReceipt> {
        let draft = self.end_relationship_draft(relationship_id, effective_end, reason, actor)?;
        self.submit_event(draft)
    }

    // ── Current-state reads ────────────────────────────────────────

    pub fn get_event(&self, id: EventId) -> Result<&Event> {
        self.log.get(id)
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<&Event>> {
        self.log.query(filter)
    }

    pub fn get_holon(&self, id: &HolonId) -> Result<&Holon> {
        self.state().holons.get(id)
    }

    pub fn query_holons(&self, filter: &HolonFilter) -> Vec<&Holon> {
        self.state().holons.query(filter)
    }

    pub fn get_relationship(&self, id: &RelationshipId) -> Result<&Relationship> {
        self.state().relationships.get(id)
    }

    pub fn get_holon_relationships(
        &self,
        holon: &HolonId,
        direction: Direction,
        relationship_type: Option<&str>,
        filter: RelationshipFilter,
    ) -> Result<Vec<&Relationship>> {
        let state = self.state();
        state.holons.get(holon)?;
        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            out.extend(state.relationships.get_from(holon, relationship_type, filter));
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            out.extend(
                state
                    .relationships
                    .get_to(holon, relationship_type, filter)
                    .into_iter()
                    .filter(|r| direction == Direction::Incoming || r.source != r.target),
            );
        }
        Ok(out)
    }

    pub fn query_relationships(&self, query: &RelationshipQuery) -> Vec<&Relationship> {
        self.state().relationships.query(query)
    }

    // ── Historical reads ───────────────────────────────────────────

    pub fn temporal(&self) -> TemporalQueryEngine<'_> {
        TemporalQueryEngine::new(&self.log, self.validator())
    }

    pub fn holon_as_of(&self, id: &HolonId, as_of: &AsOf) -> Result<Holon> {
        self.temporal().holon_as_of(id, as_of)
    }

    pub fn query_holons_as_of(&self, filter: &HolonFilter, as_of: &AsOf) -> Vec<Holon> {
        self.temporal().holons_as_of(filter, as_of)
    }

    pub fn query_relationships_as_of(
        &self,
        query: &RelationshipQuery,
        as_of: &AsOf,
    ) -> Vec<Relationship> {
        self.temporal().relationships_as_of(query, as_of)
    }

    /// Upstream causal chain. `max_depth` defaults to the configured depth.
    pub fn trace_causal_chain(&self, id: EventId, max_depth: Option<usize>) -> Result<CausalTrace> {
        let depth = max_depth.unwrap_or(self.config.default_trace_depth);
        self.temporal().trace_causal_chain(id, depth)
    }

    pub fn trace_consequences(&self, id: EventId, max_depth: Option<usize>) -> Result<CausalTrace> {
        let depth = max_depth.unwrap_or(self.config.default_trace_depth);
        self.temporal().trace_consequences(id, depth)
    }

    // ── Projection and index maintenance ───────────────────────────

    /// Rebuild current state from the whole log. The graph index is left
    /// untouched; call `rebuild_indices` afterwards.
    pub fn replay_all(&mut self) -> &Projection {
        self.projector.replay_all(&self.log)
    }

    pub fn rebuild_indices(&mut self) -> &GraphIndex {
        self.index = GraphIndex::build(self.projector.state(), self.clock().now());
        &self.index
    }

    /// Install an index built elsewhere. An index built from an older
    /// state than the installed one is dropped; returns whether it was kept.
    pub fn install_index(&mut self, index: GraphIndex) -> bool {
        if index.source_event() < self.index.source_event() {
            tracing::debug!(
                offered = ?index.source_event(),
                installed = ?self.index.source_event(),
                "ignoring index built from older state"
            );
            return false;
        }
        self.index = index;
        true
    }

    pub fn index(&self) -> &GraphIndex {
        &self.index
    }

    /// True when events were folded after the index was built.
    pub fn index_is_stale(&self) -> bool {
        self.index.source_event() != self.state().last_event
    }

    /// Pattern match over the last built index. `max_results` is clamped
    /// to the configured ceiling.
    pub fn match_pattern(&self, query: &PatternQuery) -> Result<Vec<PatternMatch>> {
        let mut query = query.clone();
        query.max_results = query.max_results.min(self.config.max_pattern_results);
        self.index.match_pattern(&query)
    }

    pub fn search(&self, term: &str, holon_types: &[String], max_results: usize) -> Vec<HolonId> {
        self.index
            .search(term, holon_types, max_results.min(self.config.max_pattern_results))
    }
}
