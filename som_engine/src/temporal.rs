//! Temporal query engine.
//!
//! Historical state is never stored. An as-of query selects the events with
//! `occurred_at <= valid_at` (and, bitemporally, `recorded_at <= known_at`)
//! and folds them through `StateProjector::fold`, in the same temporal
//! order and with the same reducers as the live projection.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Holon, Relationship};
use crate::error::{EngineError, EntityKind, Result};
use crate::event_log::EventLog;
use crate::events::Event;
use crate::holon_store::HolonFilter;
use crate::ids::{EventId, HolonId};
use crate::projector::{temporal_order, StateProjector};
use crate::relationship_store::RelationshipQuery;
use crate::state::Projection;
use crate::validator::ConstraintValidator;

/// Point in valid time, optionally bounded in recorded time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsOf {
    pub valid_at: DateTime<Utc>,
    /// What the system knew at this recorded time. `None` means "now".
    #[serde(default)]
    pub known_at: Option<DateTime<Utc>>,
}

impl AsOf {
    pub fn valid(valid_at: DateTime<Utc>) -> Self {
        Self {
            valid_at,
            known_at: None,
        }
    }

    pub fn known_at(mut self, known_at: DateTime<Utc>) -> Self {
        self.known_at = Some(known_at);
        self
    }

    pub fn admits(&self, event: &Event) -> bool {
        event.occurred_at <= self.valid_at && self.known_at.map_or(true, |k| event.recorded_at <= k)
    }
}

// ── Causal traces ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalLinkKind {
    Root,
    CausedBy,
    PrecededBy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalNode {
    pub event_id: EventId,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub depth: usize,
    /// How this node is linked to `parent`.
    pub link: CausalLinkKind,
    pub parent: Option<EventId>,
}

/// Breadth-first causal traversal, nodes in visit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalTrace {
    pub root: EventId,
    pub nodes: Vec<CausalNode>,
    /// Set when links were left unexplored because `max_depth` was reached.
    pub truncated: bool,
}

impl CausalTrace {
    pub fn event_ids(&self) -> Vec<EventId> {
        self.nodes.iter().map(|n| n.event_id).collect()
    }
}

// ── Engine ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TemporalQueryEngine<'a> {
    log: &'a EventLog,
    validator: &'a ConstraintValidator,
}

impl<'a> TemporalQueryEngine<'a> {
    pub fn new(log: &'a EventLog, validator: &'a ConstraintValidator) -> Self {
        Self { log, validator }
    }

    /// Events admitted by `as_of`, optionally narrowed to one subject, in
    /// temporal order.
    pub fn window(&self, as_of: &AsOf, subject: Option<&str>) -> Vec<&'a Event> {
        match subject {
            Some(s) => temporal_order(self.log.events_affecting(s).filter(|e| as_of.admits(e))),
            None => temporal_order(self.log.iter().filter(|e| as_of.admits(e))),
        }
    }

    /// Full projection as of `as_of`.
    pub fn project_as_of(&self, as_of: &AsOf) -> Projection {
        StateProjector::fold(self.validator, self.window(as_of, None))
    }

    /// Holon state as of `as_of`, or `NotFound` if it did not exist yet.
    ///
    /// Holon reducers only consult the holon itself, so folding the events
    /// that name it is enough.
    pub fn holon_as_of(&self, id: &HolonId, as_of: &AsOf) -> Result<Holon> {
        let window = self.window(as_of, Some(id.as_str()));
        let state = StateProjector::fold(self.validator, window);
        state.holons.get(id).cloned().map_err(|_| {
            EngineError::not_found(EntityKind::Holon, id.to_string())
        })
    }

    pub fn holons_as_of(&self, filter: &HolonFilter, as_of: &AsOf) -> Vec<Holon> {
        let state = self.project_as_of(as_of);
        state.holons.query(filter).into_iter().cloned().collect()
    }

    /// Relationships as of `as_of`. A query without a time filter is
    /// evaluated at `as_of.valid_at`.
    pub fn relationships_as_of(
        &self,
        query: &RelationshipQuery,
        as_of: &AsOf,
    ) -> Vec<Relationship> {
        let mut query = query.clone();
        if query.filter.effective_at.is_none() && !query.filter.include_ended {
            query.filter.effective_at = Some(as_of.valid_at);
        }
        let state = self.project_as_of(as_of);
        state.relationships.query(&query).into_iter().cloned().collect()
    }

    /// Walk `caused_by` / `preceded_by` links upstream from `id`.
    pub fn trace_causal_chain(&self, id: EventId, max_depth: usize) -> Result<CausalTrace> {
        self.trace(id, max_depth, |event| {
            let links = &event.causal_links;
            links
                .caused_by
                .iter()
                .map(|p| (*p, CausalLinkKind::CausedBy))
                .chain(links.preceded_by.iter().map(|p| (*p, CausalLinkKind::PrecededBy)))
                .collect()
        })
    }

    /// Walk the reverse links: events that name `id` as cause or predecessor.
    pub fn trace_consequences(&self, id: EventId, max_depth: usize) -> Result<CausalTrace> {
        let log = self.log;
        self.trace(id, max_depth, |event| {
            log.consequences_of(event.id)
                .filter_map(|c| log.get(c).ok())
                .map(|c| {
                    let kind = if c.causal_links.caused_by.contains(&event.id) {
                        CausalLinkKind::CausedBy
                    } else {
                        CausalLinkKind::PrecededBy
                    };
                    (c.id, kind)
                })
                .collect()
        })
    }

    fn trace(
        &self,
        root: EventId,
        max_depth: usize,
        neighbours: impl Fn(&Event) -> Vec<(EventId, CausalLinkKind)>,
    ) -> Result<CausalTrace> {
        let root_event = self.log.get(root)?;
        let mut visited: BTreeSet<EventId> = BTreeSet::new();
        let mut queue: VecDeque<(&Event, usize, CausalLinkKind, Option<EventId>)> = VecDeque::new();
        let mut nodes = Vec::new();
        let mut truncated = false;

        visited.insert(root);
        queue.push_back((root_event, 0, CausalLinkKind::Root, None));

        while let Some((event, depth, link, parent)) = queue.pop_front() {
            nodes.push(CausalNode {
                event_id: event.id,
                event_type: event.type_name().to_string(),
                occurred_at: event.occurred_at,
                depth,
                link,
                parent,
            });
            for (next, kind) in neighbours(event) {
                if visited.contains(&next) {
                    continue;
                }
                if depth >= max_depth {
                    truncated = true;
                    continue;
                }
                let Ok(next_event) = self.log.get(next) else {
                    continue;
                };
                visited.insert(next);
                queue.push_back((next_event, depth + 1, kind, Some(event.id)));
            }
        }

        Ok(CausalTrace {
            root,
            nodes,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::constraints::InMemoryDocumentRegistry;
    use crate::events::{EventBody, EventDraft, HolonCreated};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 0, 0, 0).unwrap()
    }

    fn validator() -> ConstraintValidator {
        ConstraintValidator::new(Arc::new(InMemoryDocumentRegistry::with_defaults(
            &EngineConfig::default(),
        )))
    }

    fn chain_log() -> EventLog {
        let mut log = EventLog::new(Arc::new(ManualClock::new(ts(20))), Duration::minutes(5));
        let a = log
            .submit(EventDraft::new(
                EventBody::PersonCreated(HolonCreated::new("a")),
                ts(1),
                "admin",
            ))
            .unwrap();
        let b = log
            .submit(
                EventDraft::new(EventBody::PersonCreated(HolonCreated::new("b")), ts(2), "admin")
                    .caused_by(a),
            )
            .unwrap();
        log.submit(
            EventDraft::new(EventBody::PersonCreated(HolonCreated::new("c")), ts(3), "admin")
                .preceded_by(b),
        )
        .unwrap();
        log
    }

    #[test]
    fn upstream_trace_follows_links_in_bfs_order() {
        let log = chain_log();
        let v = validator();
        let engine = TemporalQueryEngine::new(&log, &v);
        let trace = engine.trace_causal_chain(EventId(3), 10).unwrap();
        assert_eq!(trace.event_ids(), vec![EventId(3), EventId(2), EventId(1)]);
        assert_eq!(trace.nodes[1].link, CausalLinkKind::PrecededBy);
        assert_eq!(trace.nodes[2].link, CausalLinkKind::CausedBy);
        assert_eq!(trace.nodes[2].parent, Some(EventId(2)));
        assert!(!trace.truncated);
    }

    #[test]
    fn trace_stops_at_max_depth() {
        let log = chain_log();
        let v = validator();
        let trace = TemporalQueryEngine::new(&log, &v)
            .trace_causal_chain(EventId(3), 1)
            .unwrap();
        assert_eq!(trace.event_ids(), vec![EventId(3), EventId(2)]);
        assert!(trace.truncated);
    }

    #[test]
    fn downstream_trace_uses_reverse_index() {
        let log = chain_log();
        let v = validator();
        let trace = TemporalQueryEngine::new(&log, &v)
            .trace_consequences(EventId(1), 5)
            .unwrap();
        assert_eq!(trace.event_ids(), vec![EventId(1), EventId(2), EventId(3)]);
    }

    #[test]
    fn unknown_root_is_not_found() {
        let log = chain_log();
        let v = validator();
        let err = TemporalQueryEngine::new(&log, &v)
            .trace_causal_chain(EventId(42), 3)
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn known_at_hides_later_recordings() {
        let clock = Arc::new(ManualClock::new(ts(10)));
        let mut log = EventLog::new(clock.clone(), Duration::minutes(5));
        log.submit(EventDraft::new(
            EventBody::PersonCreated(HolonCreated::new("a")),
            ts(1),
            "admin",
        ))
        .unwrap();
        clock.set(ts(15));
        // Backdated fact, learned later.
        log.submit(EventDraft::new(
            EventBody::PersonCreated(HolonCreated::new("b")),
            ts(2),
            "admin",
        ))
        .unwrap();

        let v = validator();
        let engine = TemporalQueryEngine::new(&log, &v);
        let all = HolonFilter::of_type("Person");
        assert_eq!(engine.holons_as_of(&all, &AsOf::valid(ts(5))).len(), 2);
        assert_eq!(
            engine
                .holons_as_of(&all, &AsOf::valid(ts(5)).known_at(ts(12)))
                .len(),
            1
        );
    }
}
