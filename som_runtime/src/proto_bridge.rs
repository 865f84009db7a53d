//! Proto ↔ kernel conversion bridge.
//!
//! Converts between the protobuf wire types (proto_types.rs) and the
//! kernel's `Event`. Timestamps travel as microseconds since the epoch.
//! The event log truncates every timestamp to that precision before an
//! event is recorded, so an event decoded from its own encoding compares
//! equal to the original.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use som_engine::domain::PropertyBag;
use som_engine::events::{
    CausalLinks, Event, EventBody, HolonCreated, HolonPropertiesUpdated, HolonStatusChanged,
    PayloadRef, RelationshipCreated, RelationshipEnded, ValidityWindow,
};
use som_engine::ids::{EventId, HolonId, RelationshipId};

use crate::error::{Result, RuntimeError};
use crate::proto_types::*;

/// Convert a kernel event to its protobuf form for the binary log.
pub fn kernel_to_proto(event: &Event) -> Result<ProtoEventEnvelope> {
    let kind = match event.body.payload() {
        PayloadRef::HolonCreated(p) => PayloadKind::HolonCreated(ProtoHolonCreated {
            holon_id: p.holon_id.as_ref().map(|id| id.to_string()),
            holon_type: p.holon_type.clone(),
            properties_json: serde_json::to_string(&p.properties)?,
            status: p.status.map(|s| s.as_str().to_string()),
            source_documents: p.source_documents.clone(),
        }),
        PayloadRef::HolonPropertiesUpdated(p) => {
            PayloadKind::PropertiesUpdated(ProtoPropertiesUpdated {
                holon_id: p.holon_id.to_string(),
                set_json: serde_json::to_string(&p.set)?,
                unset: p.unset.clone(),
            })
        }
        PayloadRef::HolonStatusChanged(p) => PayloadKind::StatusChanged(ProtoStatusChanged {
            holon_id: p.holon_id.to_string(),
            status: p.status.as_str().to_string(),
            reason: p.reason.clone(),
        }),
        PayloadRef::RelationshipCreated(p) => {
            PayloadKind::RelationshipCreated(ProtoRelationshipCreated {
                relationship_id: p.relationship_id.as_ref().map(|id| id.to_string()),
                relationship_type: p.relationship_type.clone(),
                source: p.source.to_string(),
                target: p.target.to_string(),
                properties_json: serde_json::to_string(&p.properties)?,
                effective_start_micros: p.effective_start.map(|t| t.timestamp_micros()),
                effective_end_micros: p.effective_end.map(|t| t.timestamp_micros()),
                authority_level: p.authority_level.as_str().to_string(),
                confidence_score: p.confidence_score,
                source_documents: p.source_documents.clone(),
            })
        }
        PayloadRef::RelationshipEnded(p) => {
            PayloadKind::RelationshipEnded(ProtoRelationshipEnded {
                relationship_id: p.relationship_id.to_string(),
                effective_end_micros: p.effective_end.map(|t| t.timestamp_micros()),
                reason: p.reason.clone(),
            })
        }
        PayloadRef::Unknown(v) => PayloadKind::UnknownJson(serde_json::to_string(v)?),
    };

    let links = &event.causal_links;
    Ok(ProtoEventEnvelope {
        sequence: event.id.value(),
        event_type: event.type_name().to_string(),
        occurred_at_micros: event.occurred_at.timestamp_micros(),
        recorded_at_micros: event.recorded_at.timestamp_micros(),
        actor: event.actor.to_string(),
        subjects: event.subjects.clone(),
        source_system: event.source_system.clone(),
        source_document: event.source_document.clone(),
        validity_window: event.validity_window.map(|w| ProtoValidityWindow {
            start_micros: w.start.map(|t| t.timestamp_micros()),
            end_micros: w.end.map(|t| t.timestamp_micros()),
        }),
        causal_links: Some(ProtoCausalLinks {
            preceded_by: links.preceded_by.iter().map(|id| id.value()).collect(),
            caused_by: links.caused_by.iter().map(|id| id.value()).collect(),
            grouped_with: links.grouped_with.iter().map(|id| id.value()).collect(),
        }),
        payload: Some(ProtoPayload { kind: Some(kind) }),
    })
}

/// Convert a stored protobuf envelope back into a kernel event.
pub fn proto_to_kernel(proto: &ProtoEventEnvelope) -> Result<Event> {
    let kind = proto
        .payload
        .as_ref()
        .and_then(|p| p.kind.as_ref())
        .ok_or_else(|| corrupt(proto.sequence, "missing payload"))?;

    let payload: Value = match kind {
        PayloadKind::HolonCreated(p) => to_value(
            proto.sequence,
            &HolonCreated {
                holon_id: p.holon_id.clone().map(HolonId::from),
                holon_type: p.holon_type.clone(),
                properties: properties(proto.sequence, &p.properties_json)?,
                status: p.status.as_deref().map(|s| parse_label(proto.sequence, s)).transpose()?,
                source_documents: p.source_documents.clone(),
            },
        )?,
        PayloadKind::PropertiesUpdated(p) => to_value(
            proto.sequence,
            &HolonPropertiesUpdated {
                holon_id: HolonId::from(p.holon_id.as_str()),
                set: properties(proto.sequence, &p.set_json)?,
                unset: p.unset.clone(),
            },
        )?,
        PayloadKind::StatusChanged(p) => to_value(
            proto.sequence,
            &HolonStatusChanged {
                holon_id: HolonId::from(p.holon_id.as_str()),
                status: parse_label(proto.sequence, &p.status)?,
                reason: p.reason.clone(),
            },
        )?,
        PayloadKind::RelationshipCreated(p) => to_value(
            proto.sequence,
            &RelationshipCreated {
                relationship_id: p.relationship_id.clone().map(RelationshipId::from),
                relationship_type: p.relationship_type.clone(),
                source: HolonId::from(p.source.as_str()),
                target: HolonId::from(p.target.as_str()),
                properties: properties(proto.sequence, &p.properties_json)?,
                effective_start: p
                    .effective_start_micros
                    .map(|m| micros(proto.sequence, m))
                    .transpose()?,
                effective_end: p
                    .effective_end_micros
                    .map(|m| micros(proto.sequence, m))
                    .transpose()?,
                authority_level: parse_label(proto.sequence, &p.authority_level)?,
                confidence_score: p.confidence_score,
                source_documents: p.source_documents.clone(),
            },
        )?,
        PayloadKind::RelationshipEnded(p) => to_value(
            proto.sequence,
            &RelationshipEnded {
                relationship_id: RelationshipId::from(p.relationship_id.as_str()),
                effective_end: p
                    .effective_end_micros
                    .map(|m| micros(proto.sequence, m))
                    .transpose()?,
                reason: p.reason.clone(),
            },
        )?,
        PayloadKind::UnknownJson(json) => serde_json::from_str(json)
            .map_err(|e| corrupt(proto.sequence, format!("unknown payload: {}", e)))?,
    };

    // Also rejects a payload family that does not fit the declared type.
    let body = EventBody::from_parts(&proto.event_type, payload)
        .map_err(|e| corrupt(proto.sequence, e.to_string()))?;

    let links = proto.causal_links.clone().unwrap_or_default();
    let ids = |v: Vec<u64>| -> BTreeSet<EventId> { v.into_iter().map(EventId).collect() };

    Ok(Event {
        id: EventId(proto.sequence),
        body,
        occurred_at: micros(proto.sequence, proto.occurred_at_micros)?,
        recorded_at: micros(proto.sequence, proto.recorded_at_micros)?,
        actor: HolonId::from(proto.actor.as_str()),
        subjects: proto.subjects.clone(),
        source_system: proto.source_system.clone(),
        source_document: proto.source_document.clone(),
        validity_window: proto
            .validity_window
            .as_ref()
            .map(|w| -> Result<ValidityWindow> {
                Ok(ValidityWindow {
                    start: w.start_micros.map(|m| micros(proto.sequence, m)).transpose()?,
                    end: w.end_micros.map(|m| micros(proto.sequence, m)).transpose()?,
                })
            })
            .transpose()?,
        causal_links: CausalLinks {
            preceded_by: ids(links.preceded_by),
            caused_by: ids(links.caused_by),
            grouped_with: ids(links.grouped_with),
        },
    })
}

fn corrupt(sequence: u64, detail: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::CorruptLog(format!("event {}: {}", sequence, detail))
}

fn micros(sequence: u64, m: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(m)
        .ok_or_else(|| corrupt(sequence, format!("timestamp {} out of range", m)))
}

fn properties(sequence: u64, json: &str) -> Result<PropertyBag> {
    if json.is_empty() {
        return Ok(PropertyBag::new());
    }
    serde_json::from_str(json).map_err(|e| corrupt(sequence, format!("property bag: {}", e)))
}

/// Enum labels (status, authority level) use their serde names.
fn parse_label<T: DeserializeOwned>(sequence: u64, label: &str) -> Result<T> {
    serde_json::from_value(Value::String(label.to_string()))
        .map_err(|e| corrupt(sequence, format!("label {:?}: {}", label, e)))
}

fn to_value<T: Serialize>(sequence: u64, payload: &T) -> Result<Value> {
    serde_json::to_value(payload).map_err(|e| corrupt(sequence, e))
}
