//! Session manager: isolated sessions with persist-before-visible writes.
//!
//! Each session gets its own directory with an event log and snapshots.
//! Concurrency: one `RwLock` serializes writers and lets readers share the
//! engine. No global mutable state.
//!
//! Write order:
//!   1. engine.prepare(draft)        (structural validation, id, recorded_at)
//!   2. event_store.append_event()   (fsync; only if step 1 succeeded)
//!   3. engine.commit(event)         (append to the in-memory log and fold)
//!   4. snapshot if the interval is reached

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use som_engine::clock::Clock;
use som_engine::constraints::DocumentRegistry;
use som_engine::engine::{BatchItem, BatchOutcome, ModelEngine, SubmitReceipt};
use som_engine::events::{Event, EventDraft};
use som_engine::graph::GraphIndex;
use som_engine::hashing::canonical_hash;
use som_engine::ids::{HolonId, RelationshipId};
use som_engine::state::Projection;

use crate::config::RuntimeConfig;
use crate::drift;
use crate::error::{Result, RuntimeError};
use crate::event_store::EventStore;
use crate::proto_bridge::kernel_to_proto;
use crate::replay;
use crate::snapshot;

/// Outcome of checking the latest snapshot against a replay of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotCheck {
    NoSnapshot,
    Matches { sequence: u64 },
    /// The snapshot disagrees with replay; the replayed state is in use.
    Drifted {
        sequence: u64,
        snapshot_hash: String,
        replay_hash: String,
    },
}

/// An isolated session with its own event log and state.
pub struct Session {
    session_id: String,
    dir: PathBuf,
    engine: ModelEngine,
    event_store: EventStore,
    snapshot_interval: u64,
}

impl Session {
    /// Open (or create) session `session_id` under `config.data_dir`,
    /// replaying any events already on disk.
    ///
    /// Directory structure:
    ///   <data_dir>/<session_id>/events.log
    ///   <data_dir>/<session_id>/snapshots/
    pub fn open(
        config: &RuntimeConfig,
        session_id: &str,
        registry: Arc<dyn DocumentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = config.data_dir.join(session_id);
        let event_store = EventStore::open(&dir.join("events.log"))?;
        let events = replay::load_events(&event_store)?;
        let engine = ModelEngine::restore(config.engine.clone(), registry, clock, events)?;

        tracing::info!(
            session = session_id,
            events = engine.log().len(),
            holons = engine.state().holons.len(),
            relationships = engine.state().relationships.len(),
            "session opened"
        );

        let session = Self {
            session_id: session_id.to_string(),
            dir,
            engine,
            event_store,
            snapshot_interval: config.snapshot_interval,
        };
        session.check_latest_snapshot()?;
        Ok(session)
    }

    /// Prepare, persist, then fold a single event.
    pub fn submit_event(&mut self, draft: EventDraft) -> Result<SubmitReceipt> {
        let event = self.engine.prepare(draft)?;
        self.persist(&event)?;
        let receipt = self.engine.commit(event)?;
        self.maybe_snapshot()?;
        Ok(receipt)
    }

    /// Submit several drafts. Atomic batches are staged in memory first and
    /// persisted only when every draft folds cleanly.
    pub fn submit_events_batch(
        &mut self,
        drafts: Vec<EventDraft>,
        atomic: bool,
    ) -> Result<BatchOutcome> {
        if atomic {
            let staged = match self.engine.stage_batch(drafts) {
                Ok(staged) => staged,
                Err(failure) => {
                    tracing::warn!(
                        session = %self.session_id,
                        index = failure.index,
                        code = failure.error.code(),
                        "atomic batch aborted"
                    );
                    return Ok(BatchOutcome {
                        committed: false,
                        items: vec![BatchItem::failed(failure.index, &failure.error)],
                    });
                }
            };
            for event in staged.events() {
                self.persist(event)?;
            }
            let receipts = self.engine.apply_staged(staged)?;
            self.maybe_snapshot()?;
            return Ok(BatchOutcome {
                committed: true,
                items: receipts.into_iter().map(BatchItem::Accepted).collect(),
            });
        }

        let mut items = Vec::new();
        for (index, draft) in drafts.into_iter().enumerate() {
            match self.submit_event(draft) {
                Ok(receipt) => items.push(BatchItem::Accepted(receipt)),
                Err(RuntimeError::Engine(err)) => items.push(BatchItem::failed(index, &err)),
                Err(other) => return Err(other),
            }
        }
        let committed = items.iter().any(|i| matches!(i, BatchItem::Accepted(_)));
        Ok(BatchOutcome { committed, items })
    }

    /// End a relationship through the durable write path.
    pub fn end_relationship(
        &mut self,
        relationship_id: &RelationshipId,
        effective_end: DateTime<Utc>,
        reason: Option<String>,
        actor: impl Into<HolonId>,
    ) -> Result<SubmitReceipt> {
        let draft = self
            .engine
            .end_relationship_draft(relationship_id, effective_end, reason, actor)?;
        self.submit_event(draft)
    }

    /// Full replay from the on-disk log. Resets the engine and its index.
    pub fn replay_full(&mut self) -> Result<(Projection, String)> {
        let events = replay::load_events(&self.event_store)?;
        let engine = ModelEngine::restore(
            self.engine.config().clone(),
            self.engine.validator().registry().clone(),
            self.engine.clock().clone(),
            events,
        )?;
        self.engine = engine;
        let state = self.engine.state().clone();
        let hash = canonical_hash(&state);
        Ok((state, hash))
    }

    /// Double-replay the on-disk log and compare with the live projection.
    pub fn verify(&self) -> Result<drift::DriftReport> {
        let events = replay::load_events(&self.event_store)?;
        drift::verify_determinism(self.engine.validator(), &events)?;
        let (replayed, _) = replay::rebuild_state(self.engine.validator(), &events);
        Ok(drift::compare_states(self.engine.state(), &replayed))
    }

    /// Compare the newest snapshot with a replay of the log prefix it covers.
    pub fn check_latest_snapshot(&self) -> Result<SnapshotCheck> {
        let Some(snap) = snapshot::load_latest_snapshot(&self.snapshot_dir())? else {
            return Ok(SnapshotCheck::NoSnapshot);
        };
        if !snapshot::verify_snapshot_hash(&snap) {
            return Err(RuntimeError::CorruptSnapshot {
                sequence: snap.sequence,
            });
        }
        let events = self.engine.log().events();
        let prefix = &events[..(snap.sequence as usize).min(events.len())];
        let replay_hash = replay::rebuild_hash(self.engine.validator(), prefix);
        if replay_hash == snap.hash {
            return Ok(SnapshotCheck::Matches {
                sequence: snap.sequence,
            });
        }
        tracing::warn!(
            session = %self.session_id,
            sequence = snap.sequence,
            snapshot_hash = %snap.hash,
            replay_hash = %replay_hash,
            "snapshot drift: replayed state takes precedence"
        );
        Ok(SnapshotCheck::Drifted {
            sequence: snap.sequence,
            snapshot_hash: snap.hash,
            replay_hash,
        })
    }

    pub fn engine(&self) -> &ModelEngine {
        &self.engine
    }

    pub fn state(&self) -> &Projection {
        self.engine.state()
    }

    pub fn current_hash(&self) -> String {
        canonical_hash(self.engine.state())
    }

    pub fn current_sequence(&self) -> u64 {
        self.event_store.last_sequence()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    fn persist(&mut self, event: &Event) -> Result<()> {
        let proto = kernel_to_proto(event)?;
        self.event_store.append_event(&proto)
    }

    fn maybe_snapshot(&self) -> Result<()> {
        let sequence = self.current_sequence();
        if self.snapshot_interval > 0 && sequence > 0 && sequence % self.snapshot_interval == 0 {
            snapshot::save_snapshot(&self.snapshot_dir(), sequence, self.engine.state())?;
        }
        Ok(())
    }
}

/// Thread-safe session handle.
///
/// Writers hold the write lock for prepare, persist and fold only. Index
/// rebuilds build against a cloned projection outside the lock.
pub struct SharedSession {
    inner: RwLock<Session>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: RwLock::new(session),
        }
    }

    pub fn submit_event(&self, draft: EventDraft) -> Result<SubmitReceipt> {
        let mut session = self.inner.write().map_err(|_| RuntimeError::LockPoisoned)?;
        session.submit_event(draft)
    }

    pub fn submit_events_batch(
        &self,
        drafts: Vec<EventDraft>,
        atomic: bool,
    ) -> Result<BatchOutcome> {
        let mut session = self.inner.write().map_err(|_| RuntimeError::LockPoisoned)?;
        session.submit_events_batch(drafts, atomic)
    }

    pub fn end_relationship(
        &self,
        relationship_id: &RelationshipId,
        effective_end: DateTime<Utc>,
        reason: Option<String>,
        actor: impl Into<HolonId>,
    ) -> Result<SubmitReceipt> {
        let mut session = self.inner.write().map_err(|_| RuntimeError::LockPoisoned)?;
        session.end_relationship(relationship_id, effective_end, reason, actor)
    }

    /// Run `f` against the engine under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ModelEngine) -> R) -> Result<R> {
        let session = self.inner.read().map_err(|_| RuntimeError::LockPoisoned)?;
        Ok(f(session.engine()))
    }

    /// Rebuild the graph index from a snapshot of current state. Only the
    /// final install takes the write lock, and a concurrent rebuild that
    /// already installed a newer index wins. Returns whether this build
    /// was installed.
    pub fn rebuild_indices(&self) -> Result<bool> {
        let (state, at) = self.read(|engine| (engine.state().clone(), engine.clock().now()))?;
        let index = GraphIndex::build(&state, at);
        let mut session = self.inner.write().map_err(|_| RuntimeError::LockPoisoned)?;
        Ok(session.engine.install_index(index))
    }

    pub fn replay_full(&self) -> Result<(Projection, String)> {
        let mut session = self.inner.write().map_err(|_| RuntimeError::LockPoisoned)?;
        session.replay_full()
    }

    pub fn current_hash(&self) -> Result<String> {
        let session = self.inner.read().map_err(|_| RuntimeError::LockPoisoned)?;
        Ok(session.current_hash())
    }

    pub fn current_sequence(&self) -> Result<u64> {
        let session = self.inner.read().map_err(|_| RuntimeError::LockPoisoned)?;
        Ok(session.current_sequence())
    }
}
