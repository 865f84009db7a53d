//! Governance constraints and the document registry that supplies them.
//!
//! Constraints are registered by governance, never by domain events. The
//! validator reads them through the `DocumentRegistry` trait so callers can
//! plug in their own registry; `InMemoryDocumentRegistry` is the reference
//! implementation and carries the default rule set.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::domain::relationship_types;
use crate::error::{EngineError, EntityKind, Result};
use crate::events::EventType;

/// Tags carried in `ValidationError::violated_rule`.
pub mod rules {
    pub const HOLON_MUST_EXIST: &str = "holon_must_exist";
    pub const HOLON_NOT_ACTIVE: &str = "holon_not_active";
    pub const CONCURRENT_POSITION: &str = "concurrent_position_constraint";
    pub const MISSING_PREREQUISITE: &str = "missing_prerequisite";
    pub const NO_SELF_PREREQUISITE: &str = "no_self_prerequisite";
    pub const NO_CYCLES: &str = "no_cycles";
    pub const INVALID_EFFECTIVE_WINDOW: &str = "invalid_effective_window";
    pub const INVALID_ENDPOINT_TYPE: &str = "invalid_endpoint_type";
    pub const REQUIRED_PROPERTY_MISSING: &str = "required_property_missing";
    pub const UNCLASSIFIED_SOURCE_DOCUMENT: &str = "unclassified_source_document";
    pub const CONFIDENCE_BELOW_FLOOR: &str = "confidence_below_floor";

    /// Tags that mark a dependency-cycle rejection.
    pub const CYCLE_RULES: [&str; 2] = [NO_SELF_PREREQUISITE, NO_CYCLES];
}

/// Id of the existence checks, which are built in rather than registered.
pub const EXISTENCE_CONSTRAINT_ID: &str = "C-EXIST-000";

/// Document the default rule set is attributed to.
pub const DEFAULT_GOVERNANCE_DOCUMENT: &str = "GOV-DEFAULT";

// ── Constraint ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConstraintType {
    Structural,
    Policy,
    Eligibility,
    Temporal,
    Capacity,
    Dependency,
    Risk,
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which candidates a constraint applies to. An empty list matches anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintScope {
    #[serde(default)]
    pub holon_types: Vec<String>,
    #[serde(default)]
    pub relationship_types: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<EventType>,
}

impl ConstraintScope {
    pub fn relationship(relationship_type: impl Into<String>) -> Self {
        Self {
            relationship_types: vec![relationship_type.into()],
            ..Default::default()
        }
    }

    pub fn holon(holon_type: impl Into<String>) -> Self {
        Self {
            holon_types: vec![holon_type.into()],
            ..Default::default()
        }
    }

    fn admits_event(&self, event_type: Option<EventType>) -> bool {
        self.event_types.is_empty()
            || event_type.is_some_and(|t| self.event_types.contains(&t))
    }

    pub fn admits_holon(&self, holon_type: &str, event_type: Option<EventType>) -> bool {
        self.relationship_types.is_empty()
            && (self.holon_types.is_empty() || self.holon_types.iter().any(|t| t == holon_type))
            && self.admits_event(event_type)
    }

    pub fn admits_relationship(
        &self,
        relationship_type: &str,
        event_type: Option<EventType>,
    ) -> bool {
        self.holon_types.is_empty()
            && (self.relationship_types.is_empty()
                || self.relationship_types.iter().any(|t| t == relationship_type))
            && self.admits_event(event_type)
    }
}

/// Rule body. Each rule belongs to exactly one `ConstraintType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConstraintRule {
    /// At most `max` overlapping relationships of the scoped type per source.
    MaxConcurrent { max: usize, violated_rule: String },
    /// The source must hold an active `held_via` edge to every holon linked
    /// to the target through a `required_via` edge.
    Prerequisites { required_via: String, held_via: String },
    /// The scoped relationship type must stay acyclic.
    Acyclic,
    /// `effective_end`, when set, must lie after `effective_start`.
    EffectiveWindowOrder,
    /// Endpoint holon types. Empty lists allow any type.
    EndpointTypes {
        #[serde(default)]
        source_types: Vec<String>,
        #[serde(default)]
        target_types: Vec<String>,
    },
    /// Holons of the scoped types must carry every listed property.
    RequiredProperties { keys: Vec<String> },
    /// Every cited source document must carry one of these classifications.
    ClassifiedSources { allowed: Vec<String> },
    /// Non-authoritative relationships need at least this confidence.
    ConfidenceFloor { min: f64 },
}

impl ConstraintRule {
    pub fn constraint_type(&self) -> ConstraintType {
        match self {
            ConstraintRule::MaxConcurrent { .. } => ConstraintType::Capacity,
            ConstraintRule::Prerequisites { .. } => ConstraintType::Eligibility,
            ConstraintRule::Acyclic => ConstraintType::Dependency,
            ConstraintRule::EffectiveWindowOrder => ConstraintType::Temporal,
            ConstraintRule::EndpointTypes { .. } | ConstraintRule::RequiredProperties { .. } => {
                ConstraintType::Structural
            }
            ConstraintRule::ClassifiedSources { .. } => ConstraintType::Policy,
            ConstraintRule::ConfidenceFloor { .. } => ConstraintType::Risk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    #[serde(default)]
    pub scope: ConstraintScope,
    #[serde(flatten)]
    pub rule: ConstraintRule,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_until: Option<DateTime<Utc>>,
    /// Lower runs first.
    #[serde(default)]
    pub precedence: i32,
    pub source_document: String,
}

impl Constraint {
    pub fn new(id: impl Into<String>, scope: ConstraintScope, rule: ConstraintRule) -> Self {
        Self {
            id: id.into(),
            scope,
            rule,
            effective_from: None,
            effective_until: None,
            precedence: 0,
            source_document: DEFAULT_GOVERNANCE_DOCUMENT.to_string(),
        }
    }

    pub fn with_precedence(mut self, precedence: i32) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn from_document(mut self, document: impl Into<String>) -> Self {
        self.source_document = document.into();
        self
    }

    pub fn effective_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.effective_from = from;
        self.effective_until = until;
        self
    }

    pub fn constraint_type(&self) -> ConstraintType {
        self.rule.constraint_type()
    }

    /// In force over `[effective_from, effective_until)`.
    pub fn is_in_force_at(&self, t: DateTime<Utc>) -> bool {
        self.effective_from.map_or(true, |from| from <= t)
            && self.effective_until.map_or(true, |until| t < until)
    }
}

// ── Document registry ──────────────────────────────────────────────

/// Governance document metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub classification: Option<String>,
}

/// Source of constraint definitions and document classification metadata.
pub trait DocumentRegistry: Send + Sync + fmt::Debug {
    /// All registered constraints, in precedence order.
    fn constraints(&self) -> &[Constraint];

    fn document(&self, id: &str) -> Option<&GovernanceDocument>;

    fn constraints_for_document(&self, document: &str) -> Vec<&Constraint> {
        self.constraints()
            .iter()
            .filter(|c| c.source_document == document)
            .collect()
    }

    fn classification(&self, document: &str) -> Option<&str> {
        self.document(document)?.classification.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InMemoryDocumentRegistry {
    documents: BTreeMap<String, GovernanceDocument>,
    constraints: Vec<Constraint>,
}

impl InMemoryDocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry carrying the built-in rule set, parameterized by `config`.
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.add_document(GovernanceDocument {
            id: DEFAULT_GOVERNANCE_DOCUMENT.to_string(),
            title: "Default governance rules".to_string(),
            classification: Some("internal".to_string()),
        });
        if !config.install_default_constraints {
            return registry;
        }
        let position = config.position_relationship_type.as_str();
        for constraint in [
            Constraint::new(
                "C-TMP-001",
                ConstraintScope::default(),
                ConstraintRule::EffectiveWindowOrder,
            )
            .with_precedence(-10),
            Constraint::new(
                "C-CAP-001",
                ConstraintScope::relationship(position),
                ConstraintRule::MaxConcurrent {
                    max: config.max_concurrent_positions,
                    violated_rule: rules::CONCURRENT_POSITION.to_string(),
                },
            ),
            Constraint::new(
                "C-ELIG-001",
                ConstraintScope::relationship(position),
                ConstraintRule::Prerequisites {
                    required_via: relationship_types::REQUIRED_FOR.to_string(),
                    held_via: relationship_types::HAS_QUALIFICATION.to_string(),
                },
            )
            .with_precedence(10),
            Constraint::new(
                "C-DEP-001",
                ConstraintScope::relationship(relationship_types::DEPENDS_ON),
                ConstraintRule::Acyclic,
            ),
        ] {
            registry.constraints.push(constraint);
        }
        registry.sort();
        registry
    }

    pub fn add_document(&mut self, document: GovernanceDocument) {
        self.documents.insert(document.id.clone(), document);
    }

    /// Register a constraint. Its source document must be registered first.
    pub fn register(&mut self, constraint: Constraint) -> Result<()> {
        if !self.documents.contains_key(&constraint.source_document) {
            return Err(EngineError::not_found(
                EntityKind::Document,
                constraint.source_document.clone(),
            ));
        }
        if self.constraints.iter().any(|c| c.id == constraint.id) {
            return Err(EngineError::DuplicateId {
                kind: EntityKind::Document,
                id: constraint.id,
            });
        }
        tracing::debug!(
            constraint = %constraint.id,
            kind = %constraint.constraint_type(),
            "constraint registered"
        );
        self.constraints.push(constraint);
        self.sort();
        Ok(())
    }

    fn sort(&mut self) {
        self.constraints
            .sort_by(|a, b| (a.precedence, &a.id).cmp(&(b.precedence, &b.id)));
    }
}

impl DocumentRegistry for InMemoryDocumentRegistry {
    fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    fn document(&self, id: &str) -> Option<&GovernanceDocument> {
        self.documents.get(id)
    }
}
