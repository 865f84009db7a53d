//! Replay orchestrator: rebuild state from an event stream.
//!
//! Delegates all domain logic to the kernel's reducers. No shortcuts, no
//! cached state.

use som_engine::events::Event;
use som_engine::hashing::canonical_hash;
use som_engine::projector::StateProjector;
use som_engine::state::Projection;
use som_engine::validator::ConstraintValidator;

use crate::error::Result;
use crate::event_store::EventStore;
use crate::proto_bridge::proto_to_kernel;

/// Fold `events` in log order from an empty projection and return it with
/// its canonical hash.
pub fn rebuild_state(validator: &ConstraintValidator, events: &[Event]) -> (Projection, String) {
    let state = StateProjector::fold(validator, events);
    let hash = canonical_hash(&state);
    (state, hash)
}

pub fn rebuild_hash(validator: &ConstraintValidator, events: &[Event]) -> String {
    rebuild_state(validator, events).1
}

/// Decode every event in `store`.
pub fn load_events(store: &EventStore) -> Result<Vec<Event>> {
    store
        .load_all_events()?
        .iter()
        .map(proto_to_kernel)
        .collect()
}
