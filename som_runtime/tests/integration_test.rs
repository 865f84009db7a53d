//! Integration tests for som_runtime.
//!
//! Every test works in its own temporary directory.

use std::fs;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};
use pretty_assertions::assert_eq;

use som_engine::clock::{ManualClock, SystemClock};
use som_engine::constraints::InMemoryDocumentRegistry;
use som_engine::engine::{BatchItem, Direction};
use som_engine::event_log::EventFilter;
use som_engine::events::{EventBody, EventDraft, HolonCreated, RelationshipCreated};
use som_engine::graph::PatternQuery;
use som_engine::ids::{EventId, HolonId};
use som_engine::relationship_store::RelationshipFilter;
use som_engine::state::Projection;

use som_runtime::api::{Api, INTERNAL_ERROR};
use som_runtime::config::RuntimeConfig;
use som_runtime::event_store::EventStore;
use som_runtime::proto_bridge::kernel_to_proto;
use som_runtime::replay;
use som_runtime::session::{Session, SharedSession, SnapshotCheck};
use som_runtime::snapshot;

fn t(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap() + Duration::hours(hours)
}

fn config(dir: &tempfile::TempDir, snapshot_interval: u64) -> RuntimeConfig {
    RuntimeConfig {
        data_dir: dir.path().to_path_buf(),
        snapshot_interval,
        ..RuntimeConfig::default()
    }
}

fn open(config: &RuntimeConfig, session_id: &str) -> Session {
    Session::open(
        config,
        session_id,
        Arc::new(InMemoryDocumentRegistry::with_defaults(&config.engine)),
        Arc::new(ManualClock::new(t(72))),
    )
    .unwrap()
}

fn holon(kind: fn(HolonCreated) -> EventBody, id: &str, at: DateTime<Utc>) -> EventDraft {
    EventDraft::new(kind(HolonCreated::new(id)), at, "hr-admin")
}

fn assignment(id: &str, person: &str, position: &str, at: DateTime<Utc>) -> EventDraft {
    EventDraft::new(
        EventBody::AssignmentStarted(RelationshipCreated::new(person, position).with_id(id)),
        at,
        "hr-admin",
    )
}

fn seed(session: &mut Session) {
    session.submit_event(holon(EventBody::PersonCreated, "p1", t(0))).unwrap();
    for pos in ["pos-1", "pos-2"] {
        session.submit_event(holon(EventBody::PositionCreated, pos, t(0))).unwrap();
    }
    session.submit_event(assignment("a1", "p1", "pos-1", t(1))).unwrap();
}

// ─────────────────────────────────────────────────────────────
// Persistence and replay
// ─────────────────────────────────────────────────────────────

#[test]
fn reopen_replays_to_the_same_hash() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);

    let (hash, sequence) = {
        let mut session = open(&cfg, "main");
        seed(&mut session);
        session
            .end_relationship(&"a1".into(), t(5), Some("reassigned".into()), "hr-admin")
            .unwrap();
        (session.current_hash(), session.current_sequence())
    };
    assert_eq!(sequence, 5);

    let mut reopened = open(&cfg, "main");
    assert_eq!(reopened.current_hash(), hash);
    assert_eq!(reopened.current_sequence(), 5);
    let ended = reopened.state().relationships.get(&"a1".into()).unwrap();
    assert_eq!(ended.effective_end, Some(t(5)));

    let (_, replayed) = reopened.replay_full().unwrap();
    assert_eq!(replayed, hash);
}

#[test]
fn events_read_back_unchanged_after_reopen_with_system_clock() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let open_live = || {
        Session::open(
            &cfg,
            "live",
            Arc::new(InMemoryDocumentRegistry::with_defaults(&cfg.engine)),
            Arc::new(SystemClock),
        )
        .unwrap()
    };
    let base = (Utc::now() - Duration::hours(1)).trunc_subsecs(0);
    let precise = base + Duration::nanoseconds(123_456_789);

    let (events, person, link) = {
        let mut session = open_live();
        let mut draft = holon(EventBody::PersonCreated, "p1", base);
        draft.occurred_at = precise.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        session.submit_event(draft).unwrap();
        session.submit_event(holon(EventBody::PositionCreated, "pos-1", base)).unwrap();
        session
            .submit_event(EventDraft::new(
                EventBody::AssignmentStarted(
                    RelationshipCreated::new("p1", "pos-1")
                        .with_id("a1")
                        .starting_at(precise),
                ),
                precise,
                "hr-admin",
            ))
            .unwrap();

        let engine = session.engine();
        (
            engine.log().events().to_vec(),
            engine.get_holon(&"p1".into()).unwrap().clone(),
            engine.get_relationship(&"a1".into()).unwrap().clone(),
        )
    };
    assert_eq!(events[0].occurred_at.timestamp_subsec_nanos(), 123_456_000);

    let reopened = open_live();
    let engine = reopened.engine();
    assert_eq!(engine.log().events(), events.as_slice());
    assert_eq!(engine.get_holon(&"p1".into()).unwrap(), &person);
    assert_eq!(engine.get_relationship(&"a1".into()).unwrap(), &link);
}

#[test]
fn two_replays_of_the_on_disk_log_agree() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");
    seed(&mut session);

    let store = EventStore::open(&dir.path().join("main").join("events.log")).unwrap();
    let events = replay::load_events(&store).unwrap();
    let validator = session.engine().validator();
    let (first, hash1) = replay::rebuild_state(validator, &events);
    let (second, hash2) = replay::rebuild_state(validator, &events);

    assert_eq!(first, second);
    assert_eq!(hash1, hash2);
    assert_eq!(hash1, session.current_hash());
}

#[test]
fn truncated_log_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    {
        let mut session = open(&cfg, "main");
        seed(&mut session);
    }

    let log_path = dir.path().join("main").join("events.log");
    let data = fs::read(&log_path).unwrap();
    fs::write(&log_path, &data[..data.len() - 10]).unwrap();

    let reopened = Session::open(
        &cfg,
        "main",
        Arc::new(InMemoryDocumentRegistry::with_defaults(&cfg.engine)),
        Arc::new(ManualClock::new(t(72))),
    );
    assert!(reopened.is_err());
}

#[test]
fn rejected_events_are_persisted_and_replayed_as_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    {
        let mut session = open(&cfg, "main");
        seed(&mut session);
        let receipt = session.submit_event(assignment("a9", "p1", "pos-99", t(2))).unwrap();
        assert!(receipt.is_rejected());
    }

    let reopened = open(&cfg, "main");
    assert_eq!(reopened.current_sequence(), 5);
    assert!(reopened.state().rejections.contains_key(&EventId(5)));
    assert!(!reopened.state().relationships.contains(&"a9".into()));
}

// ─────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────

#[test]
fn sessions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);

    let mut a = open(&cfg, "session_a");
    let mut b = open(&cfg, "session_b");
    seed(&mut a);
    b.submit_event(holon(EventBody::PersonCreated, "p1", t(0))).unwrap();

    assert_ne!(a.current_hash(), b.current_hash());
    assert_eq!(a.current_sequence(), 4);
    assert_eq!(b.current_sequence(), 1);
    assert!(b.engine().get_holon(&"pos-1".into()).is_err());
}

#[test]
fn atomic_batch_failure_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");
    seed(&mut session);
    let hash = session.current_hash();

    let outcome = session
        .submit_events_batch(
            vec![
                holon(EventBody::PersonCreated, "p2", t(2)),
                assignment("a2", "p2", "pos-99", t(2)),
            ],
            true,
        )
        .unwrap();

    assert!(!outcome.committed);
    assert!(matches!(outcome.items.as_slice(), [BatchItem::Failed { index: 1, .. }]));
    assert_eq!(session.current_sequence(), 4);
    assert_eq!(session.current_hash(), hash);

    let reopened = open(&cfg, "main");
    assert_eq!(reopened.current_sequence(), 4);
    assert!(reopened.engine().get_holon(&"p2".into()).is_err());
}

#[test]
fn atomic_batch_success_persists_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");
    seed(&mut session);

    let outcome = session
        .submit_events_batch(
            vec![
                holon(EventBody::PersonCreated, "p2", t(2)),
                assignment("a2", "p2", "pos-2", t(2)),
            ],
            true,
        )
        .unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.items.len(), 2);

    let reopened = open(&cfg, "main");
    assert_eq!(reopened.current_sequence(), 6);
    assert_eq!(reopened.current_hash(), session.current_hash());
}

#[test]
fn non_atomic_batch_keeps_accepted_events() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");

    let mut bad = holon(EventBody::PersonCreated, "p3", t(0));
    bad.occurred_at = "not a timestamp".to_string();
    let outcome = session
        .submit_events_batch(
            vec![holon(EventBody::PersonCreated, "p2", t(0)), bad],
            false,
        )
        .unwrap();

    assert!(outcome.committed);
    assert!(matches!(outcome.items[0], BatchItem::Accepted(_)));
    assert!(matches!(outcome.items[1], BatchItem::Failed { index: 1, .. }));
    assert_eq!(session.current_sequence(), 1);
}

// ─────────────────────────────────────────────────────────────
// Snapshots and drift
// ─────────────────────────────────────────────────────────────

#[test]
fn snapshot_written_at_interval_matches_replay() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 2);
    {
        let mut session = open(&cfg, "main");
        seed(&mut session);
    }

    let snap_dir = dir.path().join("main").join("snapshots");
    let latest = snapshot::load_latest_snapshot(&snap_dir).unwrap().unwrap();
    assert_eq!(latest.sequence, 4);
    assert!(snapshot::verify_snapshot_hash(&latest));

    let reopened = open(&cfg, "main");
    assert_eq!(latest.hash, reopened.current_hash());
    assert_eq!(
        reopened.check_latest_snapshot().unwrap(),
        SnapshotCheck::Matches { sequence: 4 }
    );
}

#[test]
fn drifted_snapshot_loses_to_replay() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let hash = {
        let mut session = open(&cfg, "main");
        seed(&mut session);
        session.current_hash()
    };
    let snap_dir = dir.path().join("main").join("snapshots");
    snapshot::save_snapshot(&snap_dir, 4, &Projection::new()).unwrap();

    let reopened = open(&cfg, "main");
    assert_eq!(reopened.current_hash(), hash);
    assert!(matches!(
        reopened.check_latest_snapshot().unwrap(),
        SnapshotCheck::Drifted { sequence: 4, .. }
    ));
}

#[test]
fn verify_reports_no_drift_for_a_healthy_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");
    seed(&mut session);
    assert!(session.verify().unwrap().is_empty());
}

#[test]
fn proto_round_trip_preserves_causal_links() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");
    seed(&mut session);
    let receipt = session
        .submit_event(
            holon(EventBody::PersonCreated, "p2", t(3))
                .caused_by(EventId(4))
                .preceded_by(EventId(1)),
        )
        .unwrap();

    let event = session.engine().get_event(receipt.event_id).unwrap().clone();
    let proto = kernel_to_proto(&event).unwrap();
    assert_eq!(proto.causal_links.as_ref().map(|l| l.caused_by.clone()), Some(vec![4]));

    let reopened = open(&cfg, "main");
    assert_eq!(reopened.engine().get_event(receipt.event_id).unwrap(), &event);
}

// ─────────────────────────────────────────────────────────────
// Shared session and API boundary
// ─────────────────────────────────────────────────────────────

#[test]
fn shared_session_serializes_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let shared = Arc::new(SharedSession::new(open(&cfg, "main")));

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for i in 0..5 {
                    let id = format!("m-{}-{}", w, i);
                    shared
                        .submit_event(holon(EventBody::MissionCreated, &id, t(0)))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.current_sequence().unwrap(), 20);
    let holons = shared.read(|e| e.state().holons.len()).unwrap();
    assert_eq!(holons, 20);

    let hash = shared.current_hash().unwrap();
    drop(shared);
    assert_eq!(open(&cfg, "main").current_hash(), hash);
}

#[test]
fn rebuild_indices_installs_an_index_for_current_state() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let shared = SharedSession::new(open(&cfg, "main"));
    shared.submit_event(holon(EventBody::PersonCreated, "p1", t(0))).unwrap();
    shared.submit_event(holon(EventBody::PersonCreated, "p2", t(0))).unwrap();
    assert!(shared.read(|e| e.index_is_stale()).unwrap());

    assert!(shared.rebuild_indices().unwrap());
    assert_eq!(shared.read(|e| e.index().source_event()).unwrap(), Some(EventId(2)));
    // Rebuilding from the same state is still accepted.
    assert!(shared.rebuild_indices().unwrap());
    assert!(!shared.read(|e| e.index_is_stale()).unwrap());
}

#[test]
fn api_reports_stable_error_codes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let mut session = open(&cfg, "main");
    seed(&mut session);
    let api = Api::new(Arc::new(SharedSession::new(session)));

    let missing = api.get_holon(&"nobody".into()).unwrap_err();
    assert_eq!(missing.code, "not_found");

    let missing_event = api.get_event(EventId(99)).unwrap_err();
    assert_eq!(missing_event.code, "not_found");

    let bad_filter = api
        .query_events(&EventFilter {
            limit: Some(0),
            ..EventFilter::default()
        })
        .unwrap_err();
    assert_eq!(bad_filter.code, "invalid_filter");
    assert_ne!(bad_filter.code, INTERNAL_ERROR);

    let first_end = api.end_relationship(&"a1".into(), t(3), None, &"hr-admin".into());
    assert!(first_end.is_ok());
    let conflict = api
        .end_relationship(&"a1".into(), t(4), None, &"hr-admin".into())
        .unwrap_err();
    assert_eq!(conflict.code, "conflict_on_end");
}

#[test]
fn api_reads_see_writes_and_rebuild_stale_index() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 0);
    let api = Api::new(Arc::new(SharedSession::new(open(&cfg, "main"))));

    api.submit_events_batch(
        vec![
            holon(EventBody::PersonCreated, "p1", t(0)),
            holon(EventBody::PositionCreated, "pos-1", t(0)),
            assignment("a1", "p1", "pos-1", t(1)),
        ],
        true,
    )
    .unwrap();

    let rels = api
        .get_holon_relationships(
            &"pos-1".into(),
            Direction::Incoming,
            Some("OCCUPIES"),
            RelationshipFilter::default(),
        )
        .unwrap();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].source, HolonId::from("p1"));

    let matches = api
        .match_pattern(&PatternQuery::path(&["Person", "Position"], &["OCCUPIES"], 10))
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].holons, vec![HolonId::from("p1"), HolonId::from("pos-1")]);
}
