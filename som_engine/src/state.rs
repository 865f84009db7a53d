//! Projected state: the fold of an event window.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::holon_store::HolonStore;
use crate::ids::EventId;
use crate::relationship_store::RelationshipStore;

/// Current (or as-of) holons and relationships, plus the ledger of events
/// whose effect was refused. Compared by deep equality in replay checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub holons: HolonStore,
    pub relationships: RelationshipStore,
    /// Events folded as no-ops because a constraint or conflict refused them.
    #[serde(skip)]
    pub rejections: BTreeMap<EventId, EngineError>,
    /// Highest event id folded.
    pub last_event: Option<EventId>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejection(&self, id: EventId) -> Option<&EngineError> {
        self.rejections.get(&id)
    }

    pub fn event_count_hint(&self) -> u64 {
        self.last_event.map_or(0, EventId::value)
    }
}
