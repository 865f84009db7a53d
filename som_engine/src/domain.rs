//! Core domain types: holons and relationships.
//!
//! Pure data. Entities refer to each other only by id; the stores own
//! them in flat id-keyed tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, HolonId, RelationshipId};

/// Heterogeneous, type-dependent key/value data. Sorted by key.
pub type PropertyBag = BTreeMap<String, Value>;

/// Relationship types the default governance set refers to.
pub mod relationship_types {
    /// Person → Position occupancy.
    pub const OCCUPIES: &str = "OCCUPIES";
    /// Person → Qualification.
    pub const HAS_QUALIFICATION: &str = "HAS_QUALIFICATION";
    /// Qualification → Position requirement.
    pub const REQUIRED_FOR: &str = "REQUIRED_FOR";
    /// Qualification → Qualification prerequisite (source depends on target).
    pub const DEPENDS_ON: &str = "DEPENDS_ON";
    /// Person / unit → Organization.
    pub const MEMBER_OF: &str = "MEMBER_OF";
}

// ── Holon ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolonStatus {
    Active,
    Inactive,
    Archived,
    Draft,
}

impl HolonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HolonStatus::Active => "active",
            HolonStatus::Inactive => "inactive",
            HolonStatus::Archived => "archived",
            HolonStatus::Draft => "draft",
        }
    }

    /// Whether holons in this status take part in normal (non-audit) queries
    /// and may be the endpoint of a new relationship.
    pub fn is_visible(self) -> bool {
        matches!(self, HolonStatus::Active | HolonStatus::Draft)
    }
}

/// Versioned entity snapshot: the fold of every event naming it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holon {
    pub id: HolonId,
    pub holon_type: String,
    pub properties: PropertyBag,
    pub created_at: DateTime<Utc>,
    pub created_by: EventId,
    pub status: HolonStatus,
    pub status_reason: Option<String>,
    pub source_documents: Vec<String>,
    /// Number of events folded into this snapshot, starting at 1.
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub updated_by: EventId,
}

/// Input to `HolonStore::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct HolonSpec {
    pub id: Option<HolonId>,
    pub holon_type: String,
    pub properties: PropertyBag,
    pub status: HolonStatus,
    pub source_documents: Vec<String>,
}

impl HolonSpec {
    pub fn new(holon_type: impl Into<String>) -> Self {
        Self {
            id: None,
            holon_type: holon_type.into(),
            properties: PropertyBag::new(),
            status: HolonStatus::Active,
            source_documents: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<HolonId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

// ── Relationship ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityLevel {
    #[default]
    Authoritative,
    Derived,
    Inferred,
}

impl AuthorityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthorityLevel::Authoritative => "authoritative",
            AuthorityLevel::Derived => "derived",
            AuthorityLevel::Inferred => "inferred",
        }
    }
}

/// Typed, directed, effective-dated edge between two holons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub relationship_type: String,
    pub source: HolonId,
    pub target: HolonId,
    pub properties: PropertyBag,
    pub effective_start: DateTime<Utc>,
    pub effective_end: Option<DateTime<Utc>>,
    pub created_by: EventId,
    pub source_documents: Vec<String>,
    pub authority_level: AuthorityLevel,
    pub confidence_score: Option<f64>,
    pub ended_by: Option<EventId>,
    pub end_reason: Option<String>,
}

impl Relationship {
    /// `effective_start <= t` and (`effective_end` unset or `effective_end > t`).
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.effective_start <= t && self.effective_end.map_or(true, |end| end > t)
    }

    pub fn is_ended(&self) -> bool {
        self.effective_end.is_some()
    }

    /// Whether `[effective_start, effective_end)` intersects `[start, end)`.
    /// An unset end is open-ended.
    pub fn overlaps(&self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> bool {
        let starts_before_other_ends = end.map_or(true, |e| self.effective_start < e);
        let ends_after_other_starts = self.effective_end.map_or(true, |e| e > start);
        starts_before_other_ends && ends_after_other_starts
    }

    pub fn endpoints(&self) -> [&HolonId; 2] {
        [&self.source, &self.target]
    }
}

/// Input to `RelationshipStore::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSpec {
    pub id: Option<RelationshipId>,
    pub relationship_type: String,
    pub source: HolonId,
    pub target: HolonId,
    pub properties: PropertyBag,
    pub effective_start: DateTime<Utc>,
    pub effective_end: Option<DateTime<Utc>>,
    pub authority_level: AuthorityLevel,
    pub confidence_score: Option<f64>,
    pub source_documents: Vec<String>,
}

impl RelationshipSpec {
    pub fn new(
        relationship_type: impl Into<String>,
        source: impl Into<HolonId>,
        target: impl Into<HolonId>,
        effective_start: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            relationship_type: relationship_type.into(),
            source: source.into(),
            target: target.into(),
            properties: PropertyBag::new(),
            effective_start,
            effective_end: None,
            authority_level: AuthorityLevel::Authoritative,
            confidence_score: None,
            source_documents: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<RelationshipId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.effective_end = Some(end);
        self
    }

    /// Materialize the relationship this spec would create from `created_by`.
    pub fn into_relationship(self, created_by: EventId) -> Relationship {
        Relationship {
            id: self.id.unwrap_or_else(|| RelationshipId::derived(created_by)),
            relationship_type: self.relationship_type,
            source: self.source,
            target: self.target,
            properties: self.properties,
            effective_start: self.effective_start,
            effective_end: self.effective_end,
            created_by,
            source_documents: self.source_documents,
            authority_level: self.authority_level,
            confidence_score: self.confidence_score,
            ended_by: None,
            end_reason: None,
        }
    }
}
