//! Append-only event log.
//!
//! Rules:
//!   - Strict append only: no mutation, no deletion, no reordering
//!   - Ids strictly increasing from 1, no gaps
//!   - `recorded_at` assigned here, never decreasing
//!   - Causal links may only name already-recorded events
//!
//! Submission is split in two so a durable store can sit in between:
//! `prepare` validates and stamps a draft without touching the log,
//! `append` records a prepared event. `submit` does both.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::error::{EngineError, EntityKind, Result};
use crate::events::{to_micros, Event, EventDraft, EventType, ValidityWindow};
use crate::ids::{validate_id, EventId, HolonId};

/// Filter for `EventLog::query`. Empty fields do not constrain.
/// Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub subject: Option<String>,
    pub event_types: Vec<EventType>,
    pub actor: Option<HolonId>,
    pub occurred_from: Option<DateTime<Utc>>,
    pub occurred_until: Option<DateTime<Utc>>,
    pub recorded_from: Option<DateTime<Utc>>,
    pub recorded_until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    pub fn occurred_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.occurred_from = from;
        self.occurred_until = until;
        self
    }

    fn check(&self) -> Result<()> {
        if let (Some(from), Some(until)) = (self.occurred_from, self.occurred_until) {
            if from > until {
                return Err(EngineError::InvalidFilter(format!(
                    "occurred_from {} is after occurred_until {}",
                    from, until
                )));
            }
        }
        if let (Some(from), Some(until)) = (self.recorded_from, self.recorded_until) {
            if from > until {
                return Err(EngineError::InvalidFilter(format!(
                    "recorded_from {} is after recorded_until {}",
                    from, until
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(EngineError::InvalidFilter("limit must be positive".to_string()));
        }
        Ok(())
    }

    fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty()
            && !event
                .event_type()
                .is_some_and(|t| self.event_types.contains(&t))
        {
            return false;
        }
        if self.actor.as_ref().is_some_and(|a| a != &event.actor) {
            return false;
        }
        if self.occurred_from.is_some_and(|t| event.occurred_at < t)
            || self.occurred_until.is_some_and(|t| event.occurred_at > t)
        {
            return false;
        }
        if self.recorded_from.is_some_and(|t| event.recorded_at < t)
            || self.recorded_until.is_some_and(|t| event.recorded_at > t)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct EventLog {
    events: Vec<Event>,
    by_subject: BTreeMap<String, Vec<EventId>>,
    /// Reverse causal index: event id → later events linking to it.
    consequences: BTreeMap<EventId, BTreeSet<EventId>>,
    clock: Arc<dyn Clock>,
    future_grace: Duration,
}

impl EventLog {
    pub fn new(clock: Arc<dyn Clock>, future_grace: Duration) -> Self {
        Self {
            events: Vec::new(),
            by_subject: BTreeMap::new(),
            consequences: BTreeMap::new(),
            clock,
            future_grace,
        }
    }

    /// Rebuild a log from previously recorded events (e.g. loaded from
    /// durable storage). The same append rules apply; timestamps are kept.
    pub fn restore(
        events: impl IntoIterator<Item = Event>,
        clock: Arc<dyn Clock>,
        future_grace: Duration,
    ) -> Result<Self> {
        let mut log = Self::new(clock, future_grace);
        for event in events {
            log.append(event)?;
        }
        Ok(log)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.events.last().map(|e| e.id)
    }

    pub fn next_id(&self) -> EventId {
        EventId(self.events.len() as u64 + 1)
    }

    pub fn contains(&self, id: EventId) -> bool {
        id.0 >= 1 && id.0 <= self.events.len() as u64
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Validate a draft and stamp it with the next id and `recorded_at`.
    /// The log is not modified.
    pub fn prepare(&self, mut draft: EventDraft) -> Result<Event> {
        let occurred_at = DateTime::parse_from_rfc3339(draft.occurred_at.trim())
            .map_err(|e| {
                EngineError::InvalidEvent(format!(
                    "occurred_at {:?} is not an RFC 3339 timestamp: {}",
                    draft.occurred_at, e
                ))
            })
            .map(|t| to_micros(t.with_timezone(&Utc)))?;

        let now = to_micros(self.clock.now());
        if occurred_at > now + self.future_grace {
            return Err(EngineError::InvalidEvent(format!(
                "occurred_at {} is more than {}s in the future",
                occurred_at,
                self.future_grace.num_seconds()
            )));
        }

        validate_id(draft.actor.as_str())?;
        if draft.source_system.trim().is_empty() {
            return Err(EngineError::InvalidEvent("source_system is empty".to_string()));
        }
        draft.validity_window = draft.validity_window.map(ValidityWindow::truncated);
        if let Some(window) = &draft.validity_window {
            window.check()?;
        }
        draft.body.truncate_times();
        draft.body.check()?;
        self.check_causal_links(draft.causal_links.all())?;

        let id = self.next_id();
        let recorded_at = match self.events.last() {
            Some(last) if last.recorded_at > now => last.recorded_at,
            _ => now,
        };

        let mut subjects: Vec<String> = Vec::new();
        for s in draft.subjects.into_iter().chain(draft.body.referenced_ids(id)) {
            if !subjects.contains(&s) {
                subjects.push(s);
            }
        }

        Ok(Event {
            id,
            body: draft.body,
            occurred_at,
            recorded_at,
            actor: draft.actor,
            subjects,
            source_system: draft.source_system,
            source_document: draft.source_document,
            validity_window: draft.validity_window,
            causal_links: draft.causal_links,
        })
    }

    /// Record a prepared event. It must carry the next id.
    pub fn append(&mut self, event: Event) -> Result<EventId> {
        let expected = self.next_id();
        if event.id != expected {
            return Err(EngineError::InvalidEvent(format!(
                "sequence violation: expected event id {}, got {}",
                expected, event.id
            )));
        }
        if let Some(last) = self.events.last() {
            if event.recorded_at < last.recorded_at {
                return Err(EngineError::InvalidEvent(format!(
                    "recorded_at {} precedes previous event's {}",
                    event.recorded_at, last.recorded_at
                )));
            }
        }
        self.check_causal_links(event.causal_links.all())?;

        let id = event.id;
        for subject in &event.subjects {
            self.by_subject.entry(subject.clone()).or_default().push(id);
        }
        for cause in event.causal_links.preceded_by.iter().chain(&event.causal_links.caused_by) {
            self.consequences.entry(*cause).or_default().insert(id);
        }
        tracing::debug!(event_id = %id, event_type = event.type_name(), "event recorded");
        self.events.push(event);
        Ok(id)
    }

    /// Validate, stamp and record a draft. Returns the assigned id.
    pub fn submit(&mut self, draft: EventDraft) -> Result<EventId> {
        let event = self.prepare(draft)?;
        self.append(event)
    }

    pub fn get(&self, id: EventId) -> Result<&Event> {
        if !self.contains(id) {
            return Err(EngineError::not_found(EntityKind::Event, id.to_string()));
        }
        Ok(&self.events[(id.0 - 1) as usize])
    }

    /// Events matching `filter`, in log order.
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<&Event>> {
        filter.check()?;
        let limit = filter.limit.unwrap_or(usize::MAX);
        let matched: Vec<&Event> = match &filter.subject {
            Some(subject) => self
                .events_affecting(subject)
                .filter(|e| filter.matches(e))
                .take(limit)
                .collect(),
            None => self
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .take(limit)
                .collect(),
        };
        Ok(matched)
    }

    /// Events naming `subject`, in log order.
    pub fn events_affecting<'a>(&'a self, subject: &str) -> impl Iterator<Item = &'a Event> + 'a {
        self.by_subject
            .get(subject)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |id| &self.events[(id.0 - 1) as usize])
    }

    /// Later events whose `caused_by` / `preceded_by` name `id`.
    pub fn consequences_of(&self, id: EventId) -> impl Iterator<Item = EventId> + '_ {
        self.consequences.get(&id).into_iter().flatten().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    fn check_causal_links(&self, links: impl Iterator<Item = EventId>) -> Result<()> {
        let missing: Vec<String> = links
            .filter(|id| !self.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::InvalidEvent(format!(
                "causal links reference unrecorded events: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}
