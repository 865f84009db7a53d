//! Event definitions.
//!
//! Events are pure data. They carry intent and payload only; all folding
//! logic lives in `transitions`. The payload is a sum type indexed by the
//! declared event type, with an `Unknown` fallback so that events written
//! by newer producers are retained (and folded as no-ops).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::domain::{relationship_types, AuthorityLevel, HolonStatus, PropertyBag};
use crate::error::{EngineError, Result};
use crate::ids::{validate_id, EventId, HolonId, RelationshipId};

/// Source system recorded when the caller does not name one.
pub const DEFAULT_SOURCE_SYSTEM: &str = "som";

/// Drop sub-microsecond precision. Recorded events never carry more
/// precision than the durable log stores.
pub fn to_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

fn parse<T: DeserializeOwned>(event_type: EventType, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| EngineError::InvalidEvent(format!("{} payload: {}", event_type, e)))
}

// ── Event type ─────────────────────────────────────────────────────

/// Closed enumeration of declared event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    HolonCreated,
    PersonCreated,
    PositionCreated,
    OrganizationCreated,
    QualificationDefined,
    MissionCreated,
    ObligationDefined,
    HolonPropertiesUpdated,
    HolonStatusChanged,
    RelationshipCreated,
    AssignmentStarted,
    QualificationAwarded,
    QualificationRequired,
    PrerequisiteAdded,
    MembershipStarted,
    RelationshipEnded,
    AssignmentEnded,
    QualificationExpired,
    MembershipEnded,
}

impl EventType {
    pub const ALL: [EventType; 19] = [
        EventType::HolonCreated,
        EventType::PersonCreated,
        EventType::PositionCreated,
        EventType::OrganizationCreated,
        EventType::QualificationDefined,
        EventType::MissionCreated,
        EventType::ObligationDefined,
        EventType::HolonPropertiesUpdated,
        EventType::HolonStatusChanged,
        EventType::RelationshipCreated,
        EventType::AssignmentStarted,
        EventType::QualificationAwarded,
        EventType::QualificationRequired,
        EventType::PrerequisiteAdded,
        EventType::MembershipStarted,
        EventType::RelationshipEnded,
        EventType::AssignmentEnded,
        EventType::QualificationExpired,
        EventType::MembershipEnded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::HolonCreated => "HolonCreated",
            EventType::PersonCreated => "PersonCreated",
            EventType::PositionCreated => "PositionCreated",
            EventType::OrganizationCreated => "OrganizationCreated",
            EventType::QualificationDefined => "QualificationDefined",
            EventType::MissionCreated => "MissionCreated",
            EventType::ObligationDefined => "ObligationDefined",
            EventType::HolonPropertiesUpdated => "HolonPropertiesUpdated",
            EventType::HolonStatusChanged => "HolonStatusChanged",
            EventType::RelationshipCreated => "RelationshipCreated",
            EventType::AssignmentStarted => "AssignmentStarted",
            EventType::QualificationAwarded => "QualificationAwarded",
            EventType::QualificationRequired => "QualificationRequired",
            EventType::PrerequisiteAdded => "PrerequisiteAdded",
            EventType::MembershipStarted => "MembershipStarted",
            EventType::RelationshipEnded => "RelationshipEnded",
            EventType::AssignmentEnded => "AssignmentEnded",
            EventType::QualificationExpired => "QualificationExpired",
            EventType::MembershipEnded => "MembershipEnded",
        }
    }

    /// Holon type implied by a typed creation event.
    pub fn implied_holon_type(self) -> Option<&'static str> {
        match self {
            EventType::PersonCreated => Some("Person"),
            EventType::PositionCreated => Some("Position"),
            EventType::OrganizationCreated => Some("Organization"),
            EventType::QualificationDefined => Some("Qualification"),
            EventType::MissionCreated => Some("Mission"),
            EventType::ObligationDefined => Some("Obligation"),
            _ => None,
        }
    }

    /// Relationship type implied by a typed relationship event.
    pub fn implied_relationship_type(self) -> Option<&'static str> {
        match self {
            EventType::AssignmentStarted | EventType::AssignmentEnded => {
                Some(relationship_types::OCCUPIES)
            }
            EventType::QualificationAwarded | EventType::QualificationExpired => {
                Some(relationship_types::HAS_QUALIFICATION)
            }
            EventType::QualificationRequired => Some(relationship_types::REQUIRED_FOR),
            EventType::PrerequisiteAdded => Some(relationship_types::DEPENDS_ON),
            EventType::MembershipStarted | EventType::MembershipEnded => {
                Some(relationship_types::MEMBER_OF)
            }
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::InvalidEvent(format!("unknown event type {:?}", s)))
    }
}

// ── Payloads ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HolonCreated {
    #[serde(default)]
    pub holon_id: Option<HolonId>,
    /// Required for the generic `HolonCreated`; typed creation events imply it.
    #[serde(default)]
    pub holon_type: Option<String>,
    #[serde(default)]
    pub properties: PropertyBag,
    #[serde(default)]
    pub status: Option<HolonStatus>,
    #[serde(default)]
    pub source_documents: Vec<String>,
}

impl HolonCreated {
    pub fn new(holon_id: impl Into<HolonId>) -> Self {
        Self {
            holon_id: Some(holon_id.into()),
            holon_type: None,
            properties: PropertyBag::new(),
            status: None,
            source_documents: Vec::new(),
        }
    }

    pub fn with_type(mut self, holon_type: impl Into<String>) -> Self {
        self.holon_type = Some(holon_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_source_document(mut self, document: impl Into<String>) -> Self {
        self.source_documents.push(document.into());
        self
    }

    pub fn resolve_id(&self, event_id: EventId) -> HolonId {
        self.holon_id
            .clone()
            .unwrap_or_else(|| HolonId::derived(event_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HolonPropertiesUpdated {
    pub holon_id: HolonId,
    #[serde(default)]
    pub set: PropertyBag,
    #[serde(default)]
    pub unset: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HolonStatusChanged {
    pub holon_id: HolonId,
    pub status: HolonStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipCreated {
    #[serde(default)]
    pub relationship_id: Option<RelationshipId>,
    /// Required for the generic `RelationshipCreated`; typed events imply it.
    #[serde(default)]
    pub relationship_type: Option<String>,
    pub source: HolonId,
    pub target: HolonId,
    #[serde(default)]
    pub properties: PropertyBag,
    /// Defaults to the validity window start, then to `occurred_at`.
    #[serde(default)]
    pub effective_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authority_level: AuthorityLevel,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub source_documents: Vec<String>,
}

impl RelationshipCreated {
    pub fn new(source: impl Into<HolonId>, target: impl Into<HolonId>) -> Self {
        Self {
            relationship_id: None,
            relationship_type: None,
            source: source.into(),
            target: target.into(),
            properties: PropertyBag::new(),
            effective_start: None,
            effective_end: None,
            authority_level: AuthorityLevel::Authoritative,
            confidence_score: None,
            source_documents: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<RelationshipId>) -> Self {
        self.relationship_id = Some(id.into());
        self
    }

    pub fn with_type(mut self, relationship_type: impl Into<String>) -> Self {
        self.relationship_type = Some(relationship_type.into());
        self
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.effective_start = Some(start);
        self
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.effective_end = Some(end);
        self
    }

    pub fn with_authority(mut self, level: AuthorityLevel, confidence: Option<f64>) -> Self {
        self.authority_level = level;
        self.confidence_score = confidence;
        self
    }

    pub fn resolve_id(&self, event_id: EventId) -> RelationshipId {
        self.relationship_id
            .clone()
            .unwrap_or_else(|| RelationshipId::derived(event_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipEnded {
    pub relationship_id: RelationshipId,
    /// Defaults to the validity window end, then to `occurred_at`.
    #[serde(default)]
    pub effective_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RelationshipEnded {
    pub fn new(relationship_id: impl Into<RelationshipId>) -> Self {
        Self {
            relationship_id: relationship_id.into(),
            effective_end: None,
            reason: None,
        }
    }

    pub fn at(mut self, end: DateTime<Utc>) -> Self {
        self.effective_end = Some(end);
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ── Event body (type + payload) ────────────────────────────────────

/// Declared event type together with its strongly typed payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEventBody")]
pub enum EventBody {
    HolonCreated(HolonCreated),
    PersonCreated(HolonCreated),
    PositionCreated(HolonCreated),
    OrganizationCreated(HolonCreated),
    QualificationDefined(HolonCreated),
    MissionCreated(HolonCreated),
    ObligationDefined(HolonCreated),
    HolonPropertiesUpdated(HolonPropertiesUpdated),
    HolonStatusChanged(HolonStatusChanged),
    RelationshipCreated(RelationshipCreated),
    AssignmentStarted(RelationshipCreated),
    QualificationAwarded(RelationshipCreated),
    QualificationRequired(RelationshipCreated),
    PrerequisiteAdded(RelationshipCreated),
    MembershipStarted(RelationshipCreated),
    RelationshipEnded(RelationshipEnded),
    AssignmentEnded(RelationshipEnded),
    QualificationExpired(RelationshipEnded),
    MembershipEnded(RelationshipEnded),
    /// Event type this engine does not know. Retained, folded as a no-op.
    Unknown { event_type: String, payload: Value },
}

/// Payload shape shared by a family of event types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PayloadRef<'a> {
    HolonCreated(&'a HolonCreated),
    HolonPropertiesUpdated(&'a HolonPropertiesUpdated),
    HolonStatusChanged(&'a HolonStatusChanged),
    RelationshipCreated(&'a RelationshipCreated),
    RelationshipEnded(&'a RelationshipEnded),
    Unknown(&'a Value),
}

impl EventBody {
    /// Declared type, or `None` for an unknown event type.
    pub fn event_type(&self) -> Option<EventType> {
        let t = match self {
            EventBody::HolonCreated(_) => EventType::HolonCreated,
            EventBody::PersonCreated(_) => EventType::PersonCreated,
            EventBody::PositionCreated(_) => EventType::PositionCreated,
            EventBody::OrganizationCreated(_) => EventType::OrganizationCreated,
            EventBody::QualificationDefined(_) => EventType::QualificationDefined,
            EventBody::MissionCreated(_) => EventType::MissionCreated,
            EventBody::ObligationDefined(_) => EventType::ObligationDefined,
            EventBody::HolonPropertiesUpdated(_) => EventType::HolonPropertiesUpdated,
            EventBody::HolonStatusChanged(_) => EventType::HolonStatusChanged,
            EventBody::RelationshipCreated(_) => EventType::RelationshipCreated,
            EventBody::AssignmentStarted(_) => EventType::AssignmentStarted,
            EventBody::QualificationAwarded(_) => EventType::QualificationAwarded,
            EventBody::QualificationRequired(_) => EventType::QualificationRequired,
            EventBody::PrerequisiteAdded(_) => EventType::PrerequisiteAdded,
            EventBody::MembershipStarted(_) => EventType::MembershipStarted,
            EventBody::RelationshipEnded(_) => EventType::RelationshipEnded,
            EventBody::AssignmentEnded(_) => EventType::AssignmentEnded,
            EventBody::QualificationExpired(_) => EventType::QualificationExpired,
            EventBody::MembershipEnded(_) => EventType::MembershipEnded,
            EventBody::Unknown { .. } => return None,
        };
        Some(t)
    }

    pub fn type_name(&self) -> &str {
        match self {
            EventBody::Unknown { event_type, .. } => event_type,
            other => other.event_type().map(EventType::as_str).unwrap_or_default(),
        }
    }

    pub fn payload(&self) -> PayloadRef<'_> {
        match self {
            EventBody::HolonCreated(p)
            | EventBody::PersonCreated(p)
            | EventBody::PositionCreated(p)
            | EventBody::OrganizationCreated(p)
            | EventBody::QualificationDefined(p)
            | EventBody::MissionCreated(p)
            | EventBody::ObligationDefined(p) => PayloadRef::HolonCreated(p),
            EventBody::HolonPropertiesUpdated(p) => PayloadRef::HolonPropertiesUpdated(p),
            EventBody::HolonStatusChanged(p) => PayloadRef::HolonStatusChanged(p),
            EventBody::RelationshipCreated(p)
            | EventBody::AssignmentStarted(p)
            | EventBody::QualificationAwarded(p)
            | EventBody::QualificationRequired(p)
            | EventBody::PrerequisiteAdded(p)
            | EventBody::MembershipStarted(p) => PayloadRef::RelationshipCreated(p),
            EventBody::RelationshipEnded(p)
            | EventBody::AssignmentEnded(p)
            | EventBody::QualificationExpired(p)
            | EventBody::MembershipEnded(p) => PayloadRef::RelationshipEnded(p),
            EventBody::Unknown { payload, .. } => PayloadRef::Unknown(payload),
        }
    }

    /// Build a body from a type name and a raw JSON payload. Unrecognized
    /// type names become `Unknown`; a recognized type with a malformed
    /// payload is an error.
    pub fn from_parts(event_type: &str, payload: Value) -> Result<Self> {
        let Ok(t) = event_type.parse::<EventType>() else {
            return Ok(EventBody::Unknown {
                event_type: event_type.to_string(),
                payload,
            });
        };
        let body = match t {
            EventType::HolonCreated => EventBody::HolonCreated(parse(t, payload)?),
            EventType::PersonCreated => EventBody::PersonCreated(parse(t, payload)?),
            EventType::PositionCreated => EventBody::PositionCreated(parse(t, payload)?),
            EventType::OrganizationCreated => EventBody::OrganizationCreated(parse(t, payload)?),
            EventType::QualificationDefined => EventBody::QualificationDefined(parse(t, payload)?),
            EventType::MissionCreated => EventBody::MissionCreated(parse(t, payload)?),
            EventType::ObligationDefined => EventBody::ObligationDefined(parse(t, payload)?),
            EventType::HolonPropertiesUpdated => {
                EventBody::HolonPropertiesUpdated(parse(t, payload)?)
            }
            EventType::HolonStatusChanged => EventBody::HolonStatusChanged(parse(t, payload)?),
            EventType::RelationshipCreated => EventBody::RelationshipCreated(parse(t, payload)?),
            EventType::AssignmentStarted => EventBody::AssignmentStarted(parse(t, payload)?),
            EventType::QualificationAwarded => EventBody::QualificationAwarded(parse(t, payload)?),
            EventType::QualificationRequired => {
                EventBody::QualificationRequired(parse(t, payload)?)
            }
            EventType::PrerequisiteAdded => EventBody::PrerequisiteAdded(parse(t, payload)?),
            EventType::MembershipStarted => EventBody::MembershipStarted(parse(t, payload)?),
            EventType::RelationshipEnded => EventBody::RelationshipEnded(parse(t, payload)?),
            EventType::AssignmentEnded => EventBody::AssignmentEnded(parse(t, payload)?),
            EventType::QualificationExpired => EventBody::QualificationExpired(parse(t, payload)?),
            EventType::MembershipEnded => EventBody::MembershipEnded(parse(t, payload)?),
        };
        Ok(body)
    }

    /// Truncate payload timestamps to microseconds.
    pub fn truncate_times(&mut self) {
        match self {
            EventBody::RelationshipCreated(p)
            | EventBody::AssignmentStarted(p)
            | EventBody::QualificationAwarded(p)
            | EventBody::QualificationRequired(p)
            | EventBody::PrerequisiteAdded(p)
            | EventBody::MembershipStarted(p) => {
                p.effective_start = p.effective_start.map(to_micros);
                p.effective_end = p.effective_end.map(to_micros);
            }
            EventBody::RelationshipEnded(p)
            | EventBody::AssignmentEnded(p)
            | EventBody::QualificationExpired(p)
            | EventBody::MembershipEnded(p) => {
                p.effective_end = p.effective_end.map(to_micros);
            }
            _ => {}
        }
    }

    /// Payload as a JSON value.
    pub fn payload_value(&self) -> Result<Value> {
        let value = match self.payload() {
            PayloadRef::HolonCreated(p) => serde_json::to_value(p)?,
            PayloadRef::HolonPropertiesUpdated(p) => serde_json::to_value(p)?,
            PayloadRef::HolonStatusChanged(p) => serde_json::to_value(p)?,
            PayloadRef::RelationshipCreated(p) => serde_json::to_value(p)?,
            PayloadRef::RelationshipEnded(p) => serde_json::to_value(p)?,
            PayloadRef::Unknown(v) => v.clone(),
        };
        Ok(value)
    }

    /// Ids of holons and relationships the payload touches, in payload
    /// order. Entities created without a supplied id get the id derived
    /// from `event_id`.
    pub fn referenced_ids(&self, event_id: EventId) -> Vec<String> {
        match self.payload() {
            PayloadRef::HolonCreated(p) => vec![p.resolve_id(event_id).to_string()],
            PayloadRef::HolonPropertiesUpdated(p) => vec![p.holon_id.to_string()],
            PayloadRef::HolonStatusChanged(p) => vec![p.holon_id.to_string()],
            PayloadRef::RelationshipCreated(p) => vec![
                p.resolve_id(event_id).to_string(),
                p.source.to_string(),
                p.target.to_string(),
            ],
            PayloadRef::RelationshipEnded(p) => vec![p.relationship_id.to_string()],
            PayloadRef::Unknown(_) => Vec::new(),
        }
    }

    /// Structural checks performed at submission time.
    pub fn check(&self) -> Result<()> {
        let event_type = self.event_type();
        match self.payload() {
            PayloadRef::HolonCreated(p) => {
                if let Some(id) = &p.holon_id {
                    validate_id(id.as_str())?;
                }
                let has_type = p.holon_type.as_deref().is_some_and(|t| !t.is_empty())
                    || event_type.and_then(EventType::implied_holon_type).is_some();
                if !has_type {
                    return Err(EngineError::InvalidEvent(format!(
                        "{}: holon_type is required",
                        self.type_name()
                    )));
                }
            }
            PayloadRef::HolonPropertiesUpdated(p) => validate_id(p.holon_id.as_str())?,
            PayloadRef::HolonStatusChanged(p) => validate_id(p.holon_id.as_str())?,
            PayloadRef::RelationshipCreated(p) => {
                if let Some(id) = &p.relationship_id {
                    validate_id(id.as_str())?;
                }
                validate_id(p.source.as_str())?;
                validate_id(p.target.as_str())?;
                let has_type = p.relationship_type.as_deref().is_some_and(|t| !t.is_empty())
                    || event_type
                        .and_then(EventType::implied_relationship_type)
                        .is_some();
                if !has_type {
                    return Err(EngineError::InvalidEvent(format!(
                        "{}: relationship_type is required",
                        self.type_name()
                    )));
                }
                if let Some(score) = p.confidence_score {
                    if !(0.0..=1.0).contains(&score) {
                        return Err(EngineError::InvalidEvent(format!(
                            "confidence_score {} outside [0, 1]",
                            score
                        )));
                    }
                }
            }
            PayloadRef::RelationshipEnded(p) => validate_id(p.relationship_id.as_str())?,
            PayloadRef::Unknown(_) => {}
        }
        Ok(())
    }
}

impl Serialize for EventBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("EventBody", 2)?;
        st.serialize_field("type", self.type_name())?;
        match self.payload() {
            PayloadRef::HolonCreated(p) => st.serialize_field("payload", p)?,
            PayloadRef::HolonPropertiesUpdated(p) => st.serialize_field("payload", p)?,
            PayloadRef::HolonStatusChanged(p) => st.serialize_field("payload", p)?,
            PayloadRef::RelationshipCreated(p) => st.serialize_field("payload", p)?,
            PayloadRef::RelationshipEnded(p) => st.serialize_field("payload", p)?,
            PayloadRef::Unknown(v) => st.serialize_field("payload", v)?,
        }
        st.end()
    }
}

/// Wire form of `EventBody`: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl TryFrom<RawEventBody> for EventBody {
    type Error = EngineError;

    fn try_from(raw: RawEventBody) -> Result<Self> {
        EventBody::from_parts(&raw.event_type, raw.payload)
    }
}

// ── Envelope parts ─────────────────────────────────────────────────

/// References to earlier events. Each set may only name recorded ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalLinks {
    #[serde(default)]
    pub preceded_by: BTreeSet<EventId>,
    #[serde(default)]
    pub caused_by: BTreeSet<EventId>,
    #[serde(default)]
    pub grouped_with: BTreeSet<EventId>,
}

impl CausalLinks {
    pub fn is_empty(&self) -> bool {
        self.preceded_by.is_empty() && self.caused_by.is_empty() && self.grouped_with.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = EventId> + '_ {
        self.preceded_by
            .iter()
            .chain(&self.caused_by)
            .chain(&self.grouped_with)
            .copied()
    }
}

/// Domain-time window in which the fact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    pub fn truncated(self) -> Self {
        Self {
            start: self.start.map(to_micros),
            end: self.end.map(to_micros),
        }
    }

    pub fn check(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err(EngineError::InvalidEvent(format!(
                    "validity window end {} is not after start {}",
                    end, start
                )));
            }
        }
        Ok(())
    }
}

// ── Recorded event ─────────────────────────────────────────────────

/// Immutable fact as recorded by the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub body: EventBody,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub actor: HolonId,
    pub subjects: Vec<String>,
    pub source_system: String,
    pub source_document: Option<String>,
    pub validity_window: Option<ValidityWindow>,
    pub causal_links: CausalLinks,
}

impl Event {
    pub fn event_type(&self) -> Option<EventType> {
        self.body.event_type()
    }

    pub fn type_name(&self) -> &str {
        self.body.type_name()
    }

    pub fn affects(&self, id: &str) -> bool {
        self.subjects.iter().any(|s| s == id)
    }

    /// Replay order for temporal reconstruction.
    pub fn temporal_key(&self) -> (DateTime<Utc>, DateTime<Utc>, EventId) {
        (self.occurred_at, self.recorded_at, self.id)
    }
}

// ── Submission draft ───────────────────────────────────────────────

/// Caller-supplied event before the log assigns id and `recorded_at`.
///
/// `occurred_at` is kept as text so that the log can reject unparseable
/// timestamps at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub body: EventBody,
    pub occurred_at: String,
    pub actor: HolonId,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default = "default_source_system")]
    pub source_system: String,
    #[serde(default)]
    pub source_document: Option<String>,
    #[serde(default)]
    pub validity_window: Option<ValidityWindow>,
    #[serde(default)]
    pub causal_links: CausalLinks,
}

fn default_source_system() -> String {
    DEFAULT_SOURCE_SYSTEM.to_string()
}

impl EventDraft {
    pub fn new(body: EventBody, occurred_at: DateTime<Utc>, actor: impl Into<HolonId>) -> Self {
        Self {
            body,
            occurred_at: occurred_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            actor: actor.into(),
            subjects: Vec::new(),
            source_system: default_source_system(),
            source_document: None,
            validity_window: None,
            causal_links: CausalLinks::default(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    pub fn from_source(mut self, system: impl Into<String>, document: Option<String>) -> Self {
        self.source_system = system.into();
        self.source_document = document;
        self
    }

    pub fn valid_between(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.validity_window = Some(ValidityWindow { start, end });
        self
    }

    pub fn caused_by(mut self, id: EventId) -> Self {
        self.causal_links.caused_by.insert(id);
        self
    }

    pub fn preceded_by(mut self, id: EventId) -> Self {
        self.causal_links.preceded_by.insert(id);
        self
    }

    pub fn grouped_with(mut self, id: EventId) -> Self {
        self.causal_links.grouped_with.insert(id);
        self
    }
}
