//! Current-state relationship table.
//!
//! Relationships are indexed by source and by target. Ending a
//! relationship sets `effective_end`; the row itself is never removed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Relationship, RelationshipSpec};
use crate::error::{EngineError, EntityKind, Result};
use crate::ids::{EventId, HolonId, RelationshipId};

/// Time/lifecycle filter for relationship lookups.
///
/// | `include_ended` | `effective_at` | selects                                  |
/// |-----------------|----------------|------------------------------------------|
/// | false           | `Some(t)`      | relationships active at `t`              |
/// | false           | `None`         | relationships with no `effective_end`    |
/// | true            | `Some(t)`      | relationships started at or before `t`   |
/// | true            | `None`         | everything                               |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipFilter {
    #[serde(default)]
    pub effective_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_ended: bool,
}

impl RelationshipFilter {
    pub fn active_at(t: DateTime<Utc>) -> Self {
        Self {
            effective_at: Some(t),
            include_ended: false,
        }
    }

    pub fn all() -> Self {
        Self {
            effective_at: None,
            include_ended: true,
        }
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        match (self.include_ended, self.effective_at) {
            (false, Some(t)) => rel.is_active_at(t),
            (false, None) => rel.effective_end.is_none(),
            (true, Some(t)) => rel.effective_start <= t,
            (true, None) => true,
        }
    }
}

/// Free-form relationship query used at the API boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipQuery {
    #[serde(default)]
    pub relationship_type: Option<String>,
    #[serde(default)]
    pub source: Option<HolonId>,
    #[serde(default)]
    pub target: Option<HolonId>,
    #[serde(flatten)]
    pub filter: RelationshipFilter,
}

impl RelationshipQuery {
    pub fn of_type(relationship_type: impl Into<String>) -> Self {
        Self {
            relationship_type: Some(relationship_type.into()),
            ..Default::default()
        }
    }

    pub fn from_source(mut self, source: impl Into<HolonId>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn to_target(mut self, target: impl Into<HolonId>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_filter(mut self, filter: RelationshipFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        self.relationship_type
            .as_ref()
            .map_or(true, |t| t == &rel.relationship_type)
            && self.source.as_ref().map_or(true, |s| s == &rel.source)
            && self.target.as_ref().map_or(true, |t| t == &rel.target)
            && self.filter.matches(rel)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipStore {
    relationships: BTreeMap<RelationshipId, Relationship>,
    outgoing: BTreeMap<HolonId, BTreeSet<RelationshipId>>,
    incoming: BTreeMap<HolonId, BTreeSet<RelationshipId>>,
}

impl RelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }

    pub fn contains(&self, id: &RelationshipId) -> bool {
        self.relationships.contains_key(id)
    }

    pub fn create(&mut self, spec: RelationshipSpec, created_by: EventId) -> Result<Relationship> {
        self.insert(spec.into_relationship(created_by))
    }

    /// Insert an already materialized relationship. Used by `create` and
    /// by replay paths that validated the candidate beforehand.
    pub fn insert(&mut self, rel: Relationship) -> Result<Relationship> {
        if self.relationships.contains_key(&rel.id) {
            return Err(EngineError::DuplicateId {
                kind: EntityKind::Relationship,
                id: rel.id.to_string(),
            });
        }
        self.outgoing
            .entry(rel.source.clone())
            .or_default()
            .insert(rel.id.clone());
        self.incoming
            .entry(rel.target.clone())
            .or_default()
            .insert(rel.id.clone());
        self.relationships.insert(rel.id.clone(), rel.clone());
        Ok(rel)
    }

    /// Check whether `id` could be ended at `end` without mutating anything.
    /// Returns the event that created the relationship.
    pub fn check_end(&self, id: &RelationshipId, end: DateTime<Utc>) -> Result<EventId> {
        let conflict = |reason: String| EngineError::ConflictOnEnd {
            relationship_id: id.clone(),
            reason,
        };
        let rel = self
            .relationships
            .get(id)
            .ok_or_else(|| conflict("relationship does not exist".to_string()))?;
        if let Some(existing) = rel.effective_end {
            return Err(conflict(format!("already ended at {}", existing.to_rfc3339())));
        }
        if end < rel.effective_start {
            return Err(conflict(format!(
                "end {} precedes effective start {}",
                end.to_rfc3339(),
                rel.effective_start.to_rfc3339()
            )));
        }
        Ok(rel.created_by)
    }

    /// Set `effective_end`. Returns the event that created the relationship
    /// so the caller can record the causal link.
    pub fn end(
        &mut self,
        id: &RelationshipId,
        end: DateTime<Utc>,
        reason: Option<String>,
        ended_by: EventId,
    ) -> Result<EventId> {
        let created_by = self.check_end(id, end)?;
        if let Some(rel) = self.relationships.get_mut(id) {
            rel.effective_end = Some(end);
            rel.end_reason = reason;
            rel.ended_by = Some(ended_by);
        }
        Ok(created_by)
    }

    pub fn get(&self, id: &RelationshipId) -> Result<&Relationship> {
        self.relationships
            .get(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Relationship, id.to_string()))
    }

    /// Outgoing relationships of `holon`, optionally narrowed to one type.
    pub fn get_from(
        &self,
        holon: &HolonId,
        relationship_type: Option<&str>,
        filter: RelationshipFilter,
    ) -> Vec<&Relationship> {
        self.collect(self.outgoing.get(holon), relationship_type, filter)
    }

    /// Incoming relationships of `holon`, optionally narrowed to one type.
    pub fn get_to(
        &self,
        holon: &HolonId,
        relationship_type: Option<&str>,
        filter: RelationshipFilter,
    ) -> Vec<&Relationship> {
        self.collect(self.incoming.get(holon), relationship_type, filter)
    }

    pub fn query(&self, query: &RelationshipQuery) -> Vec<&Relationship> {
        let ids = match (&query.source, &query.target) {
            (Some(s), _) => self.outgoing.get(s),
            (None, Some(t)) => self.incoming.get(t),
            (None, None) => None,
        };
        let mut out: Vec<&Relationship> = match (&query.source, &query.target) {
            (None, None) => self
                .relationships
                .values()
                .filter(|r| query.matches(r))
                .collect(),
            _ => ids
                .into_iter()
                .flatten()
                .filter_map(|id| self.relationships.get(id))
                .filter(|r| query.matches(r))
                .collect(),
        };
        sort_by_creation(&mut out);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    fn collect(
        &self,
        ids: Option<&BTreeSet<RelationshipId>>,
        relationship_type: Option<&str>,
        filter: RelationshipFilter,
    ) -> Vec<&Relationship> {
        let mut out: Vec<&Relationship> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.relationships.get(id))
            .filter(|r| relationship_type.map_or(true, |t| r.relationship_type == t))
            .filter(|r| filter.matches(r))
            .collect();
        sort_by_creation(&mut out);
        out
    }
}

/// Results come back in creation order, ties broken by id.
fn sort_by_creation(rels: &mut [&Relationship]) {
    rels.sort_by(|a, b| (a.created_by, &a.id).cmp(&(b.created_by, &b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn occupies(store: &mut RelationshipStore, id: &str, target: &str, start: u32, by: u64) {
        store
            .create(
                RelationshipSpec::new("OCCUPIES", "p1", target, ts(start)).with_id(id),
                EventId(by),
            )
            .unwrap();
    }

    #[test]
    fn get_from_filters_by_type_and_time() {
        let mut store = RelationshipStore::new();
        occupies(&mut store, "r1", "pos-1", 1, 1);
        occupies(&mut store, "r2", "pos-2", 5, 2);
        store
            .create(
                RelationshipSpec::new("MEMBER_OF", "p1", "org-1", ts(1)).with_id("r3"),
                EventId(3),
            )
            .unwrap();

        let p1: HolonId = "p1".into();
        assert_eq!(store.get_from(&p1, None, RelationshipFilter::default()).len(), 3);
        assert_eq!(
            store.get_from(&p1, Some("OCCUPIES"), RelationshipFilter::active_at(ts(3))).len(),
            1
        );
        assert_eq!(
            store.get_to(&"pos-2".into(), None, RelationshipFilter::default())[0].id.as_str(),
            "r2"
        );
    }

    #[test]
    fn ended_relationships_follow_filter_table() {
        let mut store = RelationshipStore::new();
        occupies(&mut store, "r1", "pos-1", 1, 1);
        occupies(&mut store, "r2", "pos-2", 2, 2);
        store.end(&"r1".into(), ts(4), None, EventId(3)).unwrap();

        let p1: HolonId = "p1".into();
        let ids = |f: RelationshipFilter| -> Vec<String> {
            store
                .get_from(&p1, None, f)
                .iter()
                .map(|r| r.id.to_string())
                .collect()
        };
        assert_eq!(ids(RelationshipFilter::default()), vec!["r2"]);
        assert_eq!(ids(RelationshipFilter::all()), vec!["r1", "r2"]);
        assert_eq!(ids(RelationshipFilter::active_at(ts(3))), vec!["r1", "r2"]);
        assert_eq!(ids(RelationshipFilter::active_at(ts(4))), vec!["r2"]);
        let started_by_day_1 = RelationshipFilter {
            effective_at: Some(ts(1)),
            include_ended: true,
        };
        assert_eq!(ids(started_by_day_1), vec!["r1"]);
    }

    #[test]
    fn end_returns_creating_event_and_records_ender() {
        let mut store = RelationshipStore::new();
        occupies(&mut store, "r1", "pos-1", 1, 7);
        let created_by = store
            .end(&"r1".into(), ts(3), Some("reassigned".into()), EventId(9))
            .unwrap();
        assert_eq!(created_by, EventId(7));
        let rel = store.get(&"r1".into()).unwrap();
        assert_eq!(rel.ended_by, Some(EventId(9)));
        assert_eq!(rel.end_reason.as_deref(), Some("reassigned"));
    }

    #[test]
    fn end_conflicts() {
        let mut store = RelationshipStore::new();
        occupies(&mut store, "r1", "pos-1", 5, 1);

        let missing = store.end(&"nope".into(), ts(6), None, EventId(2)).unwrap_err();
        assert_eq!(missing.code(), "conflict_on_end");

        let early = store.end(&"r1".into(), ts(4), None, EventId(2)).unwrap_err();
        assert_eq!(early.code(), "conflict_on_end");

        store.end(&"r1".into(), ts(6), None, EventId(2)).unwrap();
        let twice = store.end(&"r1".into(), ts(7), None, EventId(3)).unwrap_err();
        assert_eq!(twice.code(), "conflict_on_end");
    }

    #[test]
    fn duplicate_relationship_id_is_rejected() {
        let mut store = RelationshipStore::new();
        occupies(&mut store, "r1", "pos-1", 1, 1);
        let err = store
            .create(
                RelationshipSpec::new("OCCUPIES", "p2", "pos-1", ts(1)).with_id("r1"),
                EventId(2),
            )
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_id");
    }

    #[test]
    fn query_by_type_and_target() {
        let mut store = RelationshipStore::new();
        occupies(&mut store, "r1", "pos-1", 1, 1);
        occupies(&mut store, "r2", "pos-2", 1, 2);
        let hits = store.query(&RelationshipQuery::of_type("OCCUPIES").to_target("pos-2"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "r2");
        assert_eq!(store.query(&RelationshipQuery::default()).len(), 2);
    }
}
