//! Centralized transition logic.
//!
//! Every state mutation lives here: one reducer per payload family, one
//! dispatcher. The state projector and the temporal query engine both fold
//! through `apply_event`; they differ only in which events they feed it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{HolonSpec, HolonStatus, RelationshipSpec};
use crate::error::{EngineError, EntityKind, Result};
use crate::events::{
    Event, EventType, HolonCreated, HolonPropertiesUpdated, HolonStatusChanged, PayloadRef,
    RelationshipCreated, RelationshipEnded,
};
use crate::ids::{EventId, HolonId, RelationshipId};
use crate::state::Projection;
use crate::validator::{ConstraintValidator, ValidationContext};

/// What folding one event did to the projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    HolonCreated { holon_id: HolonId },
    HolonUpdated { holon_id: HolonId, version: u32 },
    HolonStatusChanged { holon_id: HolonId, status: HolonStatus },
    RelationshipCreated { relationship_id: RelationshipId },
    RelationshipEnded {
        relationship_id: RelationshipId,
        created_by: EventId,
    },
    /// The event stays in the log but its effect was refused. A holon
    /// rejected after creation remains in the store, flagged inactive.
    Rejected { error: String, code: &'static str },
    /// Unknown event type: retained, no effect.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionResult {
    pub event_id: EventId,
    pub event_type: String,
    #[serde(flatten)]
    pub effect: Effect,
    #[serde(skip)]
    pub error: Option<EngineError>,
}

impl TransitionResult {
    pub fn is_rejected(&self) -> bool {
        self.error.is_some()
    }

    pub fn holon_id(&self) -> Option<&HolonId> {
        match &self.effect {
            Effect::HolonCreated { holon_id }
            | Effect::HolonUpdated { holon_id, .. }
            | Effect::HolonStatusChanged { holon_id, .. } => Some(holon_id),
            _ => None,
        }
    }

    pub fn relationship_id(&self) -> Option<&RelationshipId> {
        match &self.effect {
            Effect::RelationshipCreated { relationship_id }
            | Effect::RelationshipEnded {
                relationship_id, ..
            } => Some(relationship_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Public dispatcher
// ---------------------------------------------------------------------------

/// Fold `event` into `state`.
///
/// Refused effects are not errors of the fold: they are recorded in
/// `state.rejections` and reported as `Effect::Rejected`, so a fold never
/// stops part-way through an event window.
pub fn apply_event(
    state: &mut Projection,
    event: &Event,
    validator: &ConstraintValidator,
) -> TransitionResult {
    let ctx = ValidationContext {
        at: event.occurred_at,
        event_type: event.event_type(),
    };

    let outcome = match event.body.payload() {
        PayloadRef::HolonCreated(p) => apply_holon_created(state, event, p, validator, &ctx),
        PayloadRef::HolonPropertiesUpdated(p) => {
            apply_properties_updated(state, event, p, validator, &ctx)
        }
        PayloadRef::HolonStatusChanged(p) => apply_status_changed(state, event, p),
        PayloadRef::RelationshipCreated(p) => {
            apply_relationship_created(state, event, p, validator, &ctx)
        }
        PayloadRef::RelationshipEnded(p) => apply_relationship_ended(state, event, p),
        PayloadRef::Unknown(_) => Ok(Effect::Ignored),
    };

    state.last_event = state.last_event.max(Some(event.id));

    let (effect, error) = match outcome {
        Ok(effect) => (effect, None),
        Err(err) => {
            tracing::debug!(
                event_id = %event.id,
                event_type = event.type_name(),
                code = err.code(),
                "event effect refused"
            );
            state.rejections.insert(event.id, err.clone());
            (
                Effect::Rejected {
                    error: err.to_string(),
                    code: err.code(),
                },
                Some(err),
            )
        }
    };

    TransitionResult {
        event_id: event.id,
        event_type: event.type_name().to_string(),
        effect,
        error,
    }
}

// ---------------------------------------------------------------------------
// Individual transition handlers (private)
// ---------------------------------------------------------------------------

fn apply_holon_created(
    state: &mut Projection,
    event: &Event,
    p: &HolonCreated,
    validator: &ConstraintValidator,
    ctx: &ValidationContext,
) -> Result<Effect> {
    let holon_type = p
        .holon_type
        .clone()
        .or_else(|| {
            event
                .event_type()
                .and_then(EventType::implied_holon_type)
                .map(str::to_string)
        })
        .ok_or_else(|| EngineError::InvalidEvent("holon_type is required".to_string()))?;

    let spec = HolonSpec {
        id: Some(p.resolve_id(event.id)),
        holon_type,
        properties: p.properties.clone(),
        status: p.status.unwrap_or(HolonStatus::Active),
        source_documents: p.source_documents.clone(),
    };
    let holon = state.holons.create(spec, event.id, event.occurred_at)?;

    // Compensating action: the holon stays, flagged inactive.
    if let Err(failure) = validator.validate_holon(&holon, ctx).into_result() {
        state
            .holons
            .mark_inactive(&holon.id, failure.to_string(), event.id, event.occurred_at)?;
        return Err(EngineError::from_validation(failure));
    }

    Ok(Effect::HolonCreated { holon_id: holon.id })
}

fn apply_properties_updated(
    state: &mut Projection,
    event: &Event,
    p: &HolonPropertiesUpdated,
    validator: &ConstraintValidator,
    ctx: &ValidationContext,
) -> Result<Effect> {
    let mut candidate = state.holons.get(&p.holon_id)?.clone();
    for (k, v) in &p.set {
        candidate.properties.insert(k.clone(), v.clone());
    }
    for k in &p.unset {
        candidate.properties.remove(k);
    }
    validator
        .validate_holon(&candidate, ctx)
        .into_result()
        .map_err(EngineError::from_validation)?;

    let holon =
        state
            .holons
            .update_properties(&p.holon_id, &p.set, &p.unset, event.id, event.occurred_at)?;
    Ok(Effect::HolonUpdated {
        holon_id: holon.id.clone(),
        version: holon.version,
    })
}

fn apply_status_changed(
    state: &mut Projection,
    event: &Event,
    p: &HolonStatusChanged,
) -> Result<Effect> {
    state.holons.set_status(
        &p.holon_id,
        p.status,
        p.reason.clone(),
        event.id,
        event.occurred_at,
    )?;
    Ok(Effect::HolonStatusChanged {
        holon_id: p.holon_id.clone(),
        status: p.status,
    })
}

fn apply_relationship_created(
    state: &mut Projection,
    event: &Event,
    p: &RelationshipCreated,
    validator: &ConstraintValidator,
    ctx: &ValidationContext,
) -> Result<Effect> {
    let implied = event.event_type().and_then(EventType::implied_relationship_type);
    let relationship_type = match (&p.relationship_type, implied) {
        (Some(explicit), Some(implied)) if explicit != implied => {
            return Err(EngineError::InvalidEvent(format!(
                "{} implies {} but payload names {}",
                event.type_name(),
                implied,
                explicit
            )))
        }
        (Some(explicit), _) => explicit.clone(),
        (None, Some(implied)) => implied.to_string(),
        (None, None) => {
            return Err(EngineError::InvalidEvent(
                "relationship_type is required".to_string(),
            ))
        }
    };

    let (window_start, window_end) = event
        .validity_window
        .map_or((None, None), |w| (w.start, w.end));
    let spec = RelationshipSpec {
        id: Some(p.resolve_id(event.id)),
        relationship_type,
        source: p.source.clone(),
        target: p.target.clone(),
        properties: p.properties.clone(),
        effective_start: p.effective_start.or(window_start).unwrap_or(event.occurred_at),
        effective_end: p.effective_end.or(window_end),
        authority_level: p.authority_level,
        confidence_score: p.confidence_score,
        source_documents: p.source_documents.clone(),
    };
    let candidate = spec.into_relationship(event.id);
    if state.relationships.contains(&candidate.id) {
        return Err(EngineError::DuplicateId {
            kind: EntityKind::Relationship,
            id: candidate.id.to_string(),
        });
    }

    // Validated before insertion: a refused relationship never exists.
    validator
        .validate_relationship(&candidate, state, ctx)
        .into_result()
        .map_err(EngineError::from_validation)?;

    let rel = state.relationships.insert(candidate)?;
    Ok(Effect::RelationshipCreated {
        relationship_id: rel.id,
    })
}

fn apply_relationship_ended(
    state: &mut Projection,
    event: &Event,
    p: &RelationshipEnded,
) -> Result<Effect> {
    if let Some(implied) = event.event_type().and_then(EventType::implied_relationship_type) {
        if let Ok(existing) = state.relationships.get(&p.relationship_id) {
            if existing.relationship_type != implied {
                return Err(EngineError::ConflictOnEnd {
                    relationship_id: p.relationship_id.clone(),
                    reason: format!(
                        "{} cannot end a {} relationship",
                        event.type_name(),
                        existing.relationship_type
                    ),
                });
            }
        }
    }

    let end = resolve_end(event, p);
    let created_by = state
        .relationships
        .end(&p.relationship_id, end, p.reason.clone(), event.id)?;
    Ok(Effect::RelationshipEnded {
        relationship_id: p.relationship_id.clone(),
        created_by,
    })
}

/// Payload end, then validity window end, then `occurred_at`.
pub fn resolve_end(event: &Event, p: &RelationshipEnded) -> DateTime<Utc> {
    p.effective_end
        .or(event.validity_window.and_then(|w| w.end))
        .unwrap_or(event.occurred_at)
}
