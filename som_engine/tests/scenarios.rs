//! End-to-end scenarios against the kernel: append-only log, replay
//! idempotence, read-your-writes and the governance rules.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use som_engine::clock::ManualClock;
use som_engine::config::EngineConfig;
use som_engine::constraints::rules;
use som_engine::domain::relationship_types;
use som_engine::engine::{Direction, ModelEngine};
use som_engine::error::EngineError;
use som_engine::events::{
    EventBody, EventDraft, HolonCreated, HolonPropertiesUpdated, RelationshipCreated,
};
use som_engine::graph::PatternQuery;
use som_engine::hashing::canonical_hash;
use som_engine::holon_store::HolonFilter;
use som_engine::ids::{EventId, HolonId};
use som_engine::relationship_store::{RelationshipFilter, RelationshipQuery};
use som_engine::transitions::Effect;

fn t(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap() + Duration::hours(hours)
}

fn engine() -> ModelEngine {
    ModelEngine::with_defaults(EngineConfig::default(), Arc::new(ManualClock::new(t(48))))
}

fn holon(kind: fn(HolonCreated) -> EventBody, id: &str, at: DateTime<Utc>) -> EventDraft {
    EventDraft::new(kind(HolonCreated::new(id)), at, "hr-admin")
}

fn link(
    kind: fn(RelationshipCreated) -> EventBody,
    source: &str,
    target: &str,
    at: DateTime<Utc>,
) -> EventDraft {
    EventDraft::new(kind(RelationshipCreated::new(source, target)), at, "hr-admin")
}

fn seeded() -> ModelEngine {
    let mut engine = engine();
    engine.submit_event(holon(EventBody::PersonCreated, "p1", t(0))).unwrap();
    for pos in ["pos-1", "pos-2", "pos-3", "pos-4"] {
        engine.submit_event(holon(EventBody::PositionCreated, pos, t(0))).unwrap();
    }
    engine
}

#[test]
fn identical_payloads_get_distinct_ids_and_never_change() {
    let mut engine = engine();
    let a = engine.submit_event(holon(EventBody::MissionCreated, "m1", t(0))).unwrap();
    let before = engine.get_event(a.event_id).unwrap().clone();
    let b = engine.submit_event(holon(EventBody::MissionCreated, "m1", t(0))).unwrap();

    assert_ne!(a.event_id, b.event_id);
    // The second creation is a duplicate: recorded, effect refused.
    assert!(matches!(b.rejection(), Some(EngineError::DuplicateId { .. })));

    for i in 0..3 {
        engine
            .submit_event(holon(EventBody::MissionCreated, &format!("m{}", i + 2), t(1)))
            .unwrap();
    }
    assert_eq!(engine.get_event(a.event_id).unwrap(), &before);
}

#[test]
fn replay_twice_yields_identical_projection() {
    let mut engine = seeded();
    engine.submit_event(link(EventBody::AssignmentStarted, "p1", "pos-1", t(1))).unwrap();
    engine
        .submit_event(EventDraft::new(
            EventBody::HolonPropertiesUpdated(HolonPropertiesUpdated {
                holon_id: "p1".into(),
                set: [("grade".to_string(), json!("E-5"))].into_iter().collect(),
                unset: vec![],
            }),
            t(2),
            "hr-admin",
        ))
        .unwrap();

    let live = engine.state().clone();
    let first = engine.replay_all().clone();
    let second = engine.replay_all().clone();
    assert_eq!(first, second);
    assert_eq!(live, first);
    assert_eq!(canonical_hash(&first), canonical_hash(&second));
}

#[test]
fn reads_observe_writes_without_rebuild() {
    let mut engine = seeded();
    engine
        .submit_event(EventDraft::new(
            EventBody::HolonPropertiesUpdated(HolonPropertiesUpdated {
                holon_id: "pos-1".into(),
                set: [("title".to_string(), json!("Watch Officer"))].into_iter().collect(),
                unset: vec![],
            }),
            t(3),
            "hr-admin",
        ))
        .unwrap();

    let pos = engine.get_holon(&"pos-1".into()).unwrap();
    assert_eq!(pos.properties["title"], json!("Watch Officer"));
    assert_eq!(pos.version, 2);
}

#[test]
fn relationship_window_is_half_open() {
    let mut engine = seeded();
    engine
        .submit_event(EventDraft::new(
            EventBody::AssignmentStarted(
                RelationshipCreated::new("p1", "pos-1")
                    .with_id("a1")
                    .starting_at(t(10))
                    .ending_at(t(20)),
            ),
            t(1),
            "hr-admin",
        ))
        .unwrap();

    let active_at = |at| {
        engine
            .query_relationships(
                &RelationshipQuery::of_type("OCCUPIES")
                    .with_filter(RelationshipFilter::active_at(at)),
            )
            .len()
    };
    assert_eq!(active_at(t(9)), 0);
    assert_eq!(active_at(t(10)), 1);
    assert_eq!(active_at(t(19)), 1);
    assert_eq!(active_at(t(20)), 0);

    let with_ended = |at| {
        engine
            .query_relationships(&RelationshipQuery::of_type("OCCUPIES").with_filter(
                RelationshipFilter {
                    effective_at: Some(at),
                    include_ended: true,
                },
            ))
            .len()
    };
    assert_eq!(with_ended(t(9)), 0);
    assert_eq!(with_ended(t(10)), 1);
    assert_eq!(with_ended(t(25)), 1);
    assert_eq!(with_ended(t(1000)), 1);
}

#[test]
fn closing_a_dependency_cycle_is_rejected() {
    let mut engine = engine();
    for q in ["qual-a", "qual-b", "qual-c"] {
        engine.submit_event(holon(EventBody::QualificationDefined, q, t(0))).unwrap();
    }
    let mut prerequisite = |of: &str, on: &str, at| {
        engine.submit_event(link(EventBody::PrerequisiteAdded, of, on, at)).unwrap()
    };
    let b_on_a = prerequisite("qual-b", "qual-a", t(1));
    let c_on_b = prerequisite("qual-c", "qual-b", t(1));
    assert!(!b_on_a.is_rejected());
    assert!(!c_on_b.is_rejected());

    let a_on_c = prerequisite("qual-a", "qual-c", t(2));
    let Some(EngineError::CycleDetected(failure)) = a_on_c.rejection() else {
        panic!("expected a cycle rejection, got {:?}", a_on_c.result);
    };
    assert!(failure.has_rule(rules::NO_CYCLES));

    let deps =
        engine.query_relationships(&RelationshipQuery::of_type(relationship_types::DEPENDS_ON));
    assert_eq!(deps.len(), 2);
    assert!(engine.state().rejection(a_on_c.event_id).is_some());
    // The attempt itself stays in the log.
    assert_eq!(engine.log().len(), 6);
}

#[test]
fn self_prerequisite_is_a_cycle() {
    let mut engine = engine();
    engine.submit_event(holon(EventBody::QualificationDefined, "qual-a", t(0))).unwrap();
    let receipt = engine
        .submit_event(link(EventBody::PrerequisiteAdded, "qual-a", "qual-a", t(1)))
        .unwrap();
    assert_eq!(receipt.rejection().map(EngineError::code), Some("cycle_detected"));
}

#[test]
fn fourth_concurrent_position_is_refused() {
    let mut engine = seeded();
    for pos in ["pos-1", "pos-2", "pos-3"] {
        let receipt = engine
            .submit_event(link(EventBody::AssignmentStarted, "p1", pos, t(1)))
            .unwrap();
        assert!(!receipt.is_rejected(), "{} should be accepted", pos);
    }
    let fourth = engine
        .submit_event(link(EventBody::AssignmentStarted, "p1", "pos-4", t(1)))
        .unwrap();
    let failure = fourth.rejection().and_then(EngineError::validation_failure).unwrap();
    assert!(failure.has_rule(rules::CONCURRENT_POSITION));

    let positions: Vec<&HolonId> = engine
        .state()
        .relationships
        .get_from(&"p1".into(), Some("OCCUPIES"), RelationshipFilter::active_at(t(2)))
        .into_iter()
        .map(|r| &r.target)
        .collect();
    let expected = [HolonId::from("pos-1"), HolonId::from("pos-2"), HolonId::from("pos-3")];
    assert_eq!(positions, expected.iter().collect::<Vec<_>>());
}

#[test]
fn ending_a_position_frees_a_slot() {
    let mut engine = seeded();
    for pos in ["pos-1", "pos-2", "pos-3"] {
        engine
            .submit_event(EventDraft::new(
                EventBody::AssignmentStarted(
                    RelationshipCreated::new("p1", pos).with_id(format!("occ-{}", pos)),
                ),
                t(1),
                "hr-admin",
            ))
            .unwrap();
    }
    engine
        .end_relationship(&"occ-pos-2".into(), t(5), Some("reassigned".into()), "hr-admin")
        .unwrap();

    let later = EventDraft::new(
        EventBody::AssignmentStarted(RelationshipCreated::new("p1", "pos-4").starting_at(t(6))),
        t(6),
        "hr-admin",
    );
    assert!(!engine.submit_event(later).unwrap().is_rejected());
}

#[test]
fn requirement_on_position_without_prerequisites_succeeds() {
    let mut engine = engine();
    engine.submit_event(holon(EventBody::PositionCreated, "pos-1", t(0))).unwrap();
    engine.submit_event(holon(EventBody::QualificationDefined, "qual-1", t(0))).unwrap();

    let receipt = engine
        .submit_event(link(EventBody::QualificationRequired, "qual-1", "pos-1", t(1)))
        .unwrap();
    assert!(!receipt.is_rejected());
    let Effect::RelationshipCreated { relationship_id } = &receipt.result.effect else {
        panic!("unexpected effect {:?}", receipt.result.effect);
    };
    let rel = engine.get_relationship(relationship_id).unwrap();
    assert_eq!(rel.relationship_type, relationship_types::REQUIRED_FOR);
    assert_eq!(rel.effective_start, t(1));
}

#[test]
fn assignment_requires_the_positions_qualifications() {
    let mut engine = seeded();
    engine.submit_event(holon(EventBody::QualificationDefined, "qual-1", t(0))).unwrap();
    engine.submit_event(link(EventBody::QualificationRequired, "qual-1", "pos-1", t(1))).unwrap();

    let refused = engine
        .submit_event(link(EventBody::AssignmentStarted, "p1", "pos-1", t(2)))
        .unwrap();
    let failure = refused.rejection().and_then(EngineError::validation_failure).unwrap();
    assert!(failure.has_rule(rules::MISSING_PREREQUISITE));

    engine.submit_event(link(EventBody::QualificationAwarded, "p1", "qual-1", t(2))).unwrap();
    let accepted = engine
        .submit_event(link(EventBody::AssignmentStarted, "p1", "pos-1", t(3)))
        .unwrap();
    assert!(!accepted.is_rejected());
}

#[test]
fn relationship_to_missing_holon_is_refused_and_not_stored() {
    let mut engine = seeded();
    let receipt = engine
        .submit_event(link(EventBody::AssignmentStarted, "p1", "pos-99", t(1)))
        .unwrap();
    let failure = receipt.rejection().and_then(EngineError::validation_failure).unwrap();
    assert!(failure.has_rule(rules::HOLON_MUST_EXIST));
    assert!(engine.state().relationships.is_empty());
}

#[test]
fn ending_twice_conflicts() {
    let mut engine = seeded();
    engine
        .submit_event(EventDraft::new(
            EventBody::AssignmentStarted(RelationshipCreated::new("p1", "pos-1").with_id("a1")),
            t(1),
            "hr-admin",
        ))
        .unwrap();
    engine.end_relationship(&"a1".into(), t(2), None, "hr-admin").unwrap();
    let err = engine.end_relationship(&"a1".into(), t(3), None, "hr-admin").unwrap_err();
    assert!(matches!(err, EngineError::ConflictOnEnd { .. }));

    let err = engine.end_relationship(&"nope".into(), t(3), None, "hr-admin").unwrap_err();
    assert_eq!(err.code(), "conflict_on_end");
}

#[test]
fn holon_relationships_by_direction() {
    let mut engine = seeded();
    engine.submit_event(holon(EventBody::OrganizationCreated, "unit-1", t(0))).unwrap();
    engine.submit_event(link(EventBody::AssignmentStarted, "p1", "pos-1", t(1))).unwrap();
    engine.submit_event(link(EventBody::MembershipStarted, "p1", "unit-1", t(1))).unwrap();

    let filter = RelationshipFilter::active_at(t(2));
    let p1 = HolonId::from("p1");
    let count = |direction| {
        engine.get_holon_relationships(&p1, direction, None, filter).unwrap().len()
    };
    assert_eq!(count(Direction::Outgoing), 2);
    assert_eq!(count(Direction::Incoming), 0);
    let members = engine
        .get_holon_relationships(&"unit-1".into(), Direction::Both, Some("MEMBER_OF"), filter)
        .unwrap();
    assert_eq!(members.len(), 1);
}

#[test]
fn pattern_match_after_rebuild() {
    let mut engine = seeded();
    engine.submit_event(link(EventBody::AssignmentStarted, "p1", "pos-1", t(1))).unwrap();
    engine.submit_event(link(EventBody::AssignmentStarted, "p1", "pos-2", t(1))).unwrap();

    let query = PatternQuery::path(&["Person", "Position"], &["OCCUPIES"], 10);
    // Nothing indexed yet.
    assert!(engine.match_pattern(&query).unwrap().is_empty());

    engine.rebuild_indices();
    let matches = engine.match_pattern(&query).unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|m| m.holons[0] == HolonId::from("p1")));
}

#[test]
fn query_holons_skips_archived() {
    let mut engine = seeded();
    engine
        .submit_event(EventDraft::new(
            EventBody::HolonStatusChanged(som_engine::events::HolonStatusChanged {
                holon_id: "pos-4".into(),
                status: som_engine::domain::HolonStatus::Archived,
                reason: Some("billet removed".into()),
            }),
            t(2),
            "hr-admin",
        ))
        .unwrap();
    assert_eq!(engine.query_holons(&HolonFilter::of_type("Position")).len(), 3);
    let retired = engine.get_holon(&"pos-4".into()).unwrap();
    assert_eq!(retired.status_reason.as_deref(), Some("billet removed"));
}

#[test]
fn restore_rebuilds_state_and_index() {
    let mut engine = seeded();
    engine.submit_event(link(EventBody::AssignmentStarted, "p1", "pos-1", t(1))).unwrap();
    let events = engine.log().events().to_vec();

    let restored = ModelEngine::restore(
        EngineConfig::default(),
        engine.validator().registry().clone(),
        engine.clock().clone(),
        events,
    )
    .unwrap();
    assert_eq!(restored.state(), engine.state());
    assert!(!restored.index_is_stale());
    assert_eq!(restored.get_event(EventId(6)).unwrap().type_name(), "AssignmentStarted");
}
