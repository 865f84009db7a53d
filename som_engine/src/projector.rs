//! State projector.
//!
//! Owns the current projection. Every fold, live or historical, visits
//! events in temporal order (`occurred_at`, then `recorded_at`, then id),
//! so current state always equals a replay of the whole log.
//!
//! `apply_new_event` folds a fresh event in place when it sorts after
//! everything already folded. A backdated event changes the order of what
//! came before it, so the projection is folded again from the log.

use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::event_log::EventLog;
use crate::events::Event;
use crate::ids::EventId;
use crate::state::Projection;
use crate::transitions::{apply_event, TransitionResult};
use crate::validator::ConstraintValidator;

type TemporalKey = (DateTime<Utc>, DateTime<Utc>, EventId);

#[derive(Debug, Clone)]
pub struct StateProjector {
    validator: ConstraintValidator,
    state: Projection,
    /// Temporal key of the latest event folded so far.
    frontier: Option<TemporalKey>,
}

/// `events` in the order every fold visits them.
pub fn temporal_order<'a>(events: impl IntoIterator<Item = &'a Event>) -> Vec<&'a Event> {
    let mut events: Vec<&'a Event> = events.into_iter().collect();
    events.sort_by_key(|e| e.temporal_key());
    events
}

impl StateProjector {
    pub fn new(validator: ConstraintValidator) -> Self {
        Self {
            validator,
            state: Projection::new(),
            frontier: None,
        }
    }

    pub fn validator(&self) -> &ConstraintValidator {
        &self.validator
    }

    pub fn state(&self) -> &Projection {
        &self.state
    }

    /// Fold `events` from an empty projection, in temporal order.
    pub fn fold<'a>(
        validator: &ConstraintValidator,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Projection {
        let mut state = Projection::new();
        for event in temporal_order(events) {
            apply_event(&mut state, event, validator);
        }
        state
    }

    /// Discard current state and rebuild it from the whole log.
    pub fn replay_all(&mut self, log: &EventLog) -> &Projection {
        self.refold(log, None);
        tracing::info!(
            events = log.len(),
            holons = self.state.holons.len(),
            relationships = self.state.relationships.len(),
            rejected = self.state.rejections.len(),
            "projection rebuilt"
        );
        &self.state
    }

    /// Fold the event just appended to `log`. It must be the successor of
    /// the last folded event.
    pub fn apply_new_event(&mut self, log: &EventLog, event: &Event) -> Result<TransitionResult> {
        let expected = self.state.last_event.map_or(EventId(1), EventId::next);
        if event.id != expected {
            return Err(EngineError::InvalidEvent(format!(
                "projection expects event {}, got {}",
                expected, event.id
            )));
        }

        let key = event.temporal_key();
        if self.frontier.is_some_and(|frontier| key < frontier) {
            tracing::info!(
                event_id = %event.id,
                occurred_at = %event.occurred_at,
                "backdated event, folding projection again"
            );
            return self.refold(log, Some(event.id)).ok_or_else(|| {
                EngineError::InvalidEvent(format!("event {} is not in the log", event.id))
            });
        }

        let result = apply_event(&mut self.state, event, &self.validator);
        self.frontier = Some(key);
        tracing::debug!(
            event_id = %event.id,
            event_type = event.type_name(),
            rejected = result.is_rejected(),
            "event applied"
        );
        Ok(result)
    }

    /// Fold the whole log from empty, returning the result of `target`.
    fn refold(&mut self, log: &EventLog, target: Option<EventId>) -> Option<TransitionResult> {
        let mut state = Projection::new();
        let mut found = None;
        for event in temporal_order(log.iter()) {
            let result = apply_event(&mut state, event, &self.validator);
            if Some(event.id) == target {
                found = Some(result);
            }
        }
        self.state = state;
        self.frontier = log.iter().map(Event::temporal_key).max();
        found
    }
}
