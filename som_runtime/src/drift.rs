//! Drift detection: determinism verification and projection comparison.

use std::collections::BTreeSet;

use serde::Serialize;

use som_engine::events::Event;
use som_engine::ids::{HolonId, RelationshipId};
use som_engine::state::Projection;
use som_engine::validator::ConstraintValidator;

use crate::error::{Result, RuntimeError};
use crate::replay;

/// Replay `events` twice and require identical hashes. Returns the hash.
pub fn verify_determinism(validator: &ConstraintValidator, events: &[Event]) -> Result<String> {
    let first = replay::rebuild_hash(validator, events);
    let second = replay::rebuild_hash(validator, events);
    if first != second {
        return Err(RuntimeError::Determinism { first, second });
    }
    Ok(first)
}

/// Structured comparison of two projections, `a` before `b`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub holon_count_a: i64,
    pub holon_count_b: i64,
    pub holon_count_delta: i64,
    pub visible_holon_a: i64,
    pub visible_holon_b: i64,
    pub visible_holon_delta: i64,
    pub open_relationship_a: i64,
    pub open_relationship_b: i64,
    pub open_relationship_delta: i64,
    pub added_holons: Vec<HolonId>,
    pub removed_holons: Vec<HolonId>,
    pub activated_holons: Vec<HolonId>,
    pub deactivated_holons: Vec<HolonId>,
    pub added_relationships: Vec<RelationshipId>,
    pub ended_relationships: Vec<RelationshipId>,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.added_holons.is_empty()
            && self.removed_holons.is_empty()
            && self.activated_holons.is_empty()
            && self.deactivated_holons.is_empty()
            && self.added_relationships.is_empty()
            && self.ended_relationships.is_empty()
    }
}

pub fn compare_states(a: &Projection, b: &Projection) -> DriftReport {
    let ids_a: BTreeSet<&HolonId> = a.holons.iter().map(|h| &h.id).collect();
    let ids_b: BTreeSet<&HolonId> = b.holons.iter().map(|h| &h.id).collect();

    let added_holons = ids_b.difference(&ids_a).map(|id| (*id).clone()).collect();
    let removed_holons = ids_a.difference(&ids_b).map(|id| (*id).clone()).collect();

    let mut activated_holons = Vec::new();
    let mut deactivated_holons = Vec::new();
    for id in ids_a.intersection(&ids_b) {
        let (Ok(before), Ok(after)) = (a.holons.get(id), b.holons.get(id)) else {
            continue;
        };
        match (before.status.is_visible(), after.status.is_visible()) {
            (false, true) => activated_holons.push((*id).clone()),
            (true, false) => deactivated_holons.push((*id).clone()),
            _ => {}
        }
    }

    let added_relationships = b
        .relationships
        .iter()
        .filter(|r| !a.relationships.contains(&r.id))
        .map(|r| r.id.clone())
        .collect();
    let ended_relationships = b
        .relationships
        .iter()
        .filter(|r| r.is_ended())
        .filter(|r| a.relationships.get(&r.id).is_ok_and(|before| !before.is_ended()))
        .map(|r| r.id.clone())
        .collect();

    let visible = |p: &Projection| p.holons.iter().filter(|h| h.status.is_visible()).count() as i64;
    let open = |p: &Projection| p.relationships.iter().filter(|r| !r.is_ended()).count() as i64;

    DriftReport {
        holon_count_a: a.holons.len() as i64,
        holon_count_b: b.holons.len() as i64,
        holon_count_delta: b.holons.len() as i64 - a.holons.len() as i64,
        visible_holon_a: visible(a),
        visible_holon_b: visible(b),
        visible_holon_delta: visible(b) - visible(a),
        open_relationship_a: open(a),
        open_relationship_b: open(b),
        open_relationship_delta: open(b) - open(a),
        added_holons,
        removed_holons,
        activated_holons,
        deactivated_holons,
        added_relationships,
        ended_relationships,
    }
}
