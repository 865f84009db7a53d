//! Constraint validator.
//!
//! Evaluates registered constraints against a proposed holon or relationship
//! and the current projection. Read-only: it never writes to the log or the
//! stores, and a failed check is an ordinary `ValidationResult`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constraints::{
    rules, Constraint, ConstraintRule, DocumentRegistry, EXISTENCE_CONSTRAINT_ID,
};
use crate::domain::{AuthorityLevel, Holon, Relationship};
use crate::events::EventType;
use crate::ids::HolonId;
use crate::relationship_store::RelationshipFilter;
use crate::state::Projection;

// ── Results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub constraint_id: String,
    pub message: String,
    pub violated_rule: String,
    pub affected_holons: Vec<HolonId>,
}

impl ValidationError {
    fn new(
        constraint_id: &str,
        violated_rule: &str,
        message: String,
        affected_holons: Vec<HolonId>,
    ) -> Self {
        Self {
            constraint_id: constraint_id.to_string(),
            message,
            violated_rule: violated_rule.to_string(),
            affected_holons,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> Result<(), ValidationFailure> {
        if self.valid {
            Ok(())
        } else {
            Err(ValidationFailure {
                errors: self.errors,
            })
        }
    }
}

/// A rejected mutation: one or more violated constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub errors: Vec<ValidationError>,
}

impl ValidationFailure {
    pub fn is_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| rules::CYCLE_RULES.contains(&e.violated_rule.as_str()))
    }

    pub fn violated_rules(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.violated_rule.as_str())
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.violated_rules().any(|r| r == rule)
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}:{}] {}", e.constraint_id, e.violated_rule, e.message)?;
        }
        Ok(())
    }
}

// ── Validator ──────────────────────────────────────────────────────

/// Mutation under review.
#[derive(Debug, Clone, Copy)]
pub enum Candidate<'a> {
    Holon(&'a Holon),
    Relationship(&'a Relationship),
}

/// When, and on behalf of which event type, a candidate is validated.
/// Constraints are selected by their effective dates at `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationContext {
    pub at: DateTime<Utc>,
    pub event_type: Option<EventType>,
}

#[derive(Debug, Clone)]
pub struct ConstraintValidator {
    registry: Arc<dyn DocumentRegistry>,
}

impl ConstraintValidator {
    pub fn new(registry: Arc<dyn DocumentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn DocumentRegistry> {
        &self.registry
    }

    pub fn validate(
        &self,
        candidate: Candidate<'_>,
        state: &Projection,
        ctx: &ValidationContext,
    ) -> ValidationResult {
        match candidate {
            Candidate::Holon(h) => self.validate_holon(h, ctx),
            Candidate::Relationship(r) => self.validate_relationship(r, state, ctx),
        }
    }

    /// Holon rules only look at the holon itself.
    pub fn validate_holon(&self, holon: &Holon, ctx: &ValidationContext) -> ValidationResult {
        let mut errors = Vec::new();
        for c in self.in_force(ctx) {
            if !c.scope.admits_holon(&holon.holon_type, ctx.event_type) {
                continue;
            }
            match &c.rule {
                ConstraintRule::RequiredProperties { keys } => {
                    for key in keys.iter().filter(|k| !holon.properties.contains_key(*k)) {
                        errors.push(ValidationError::new(
                            &c.id,
                            rules::REQUIRED_PROPERTY_MISSING,
                            format!("{} {} lacks property {:?}", holon.holon_type, holon.id, key),
                            vec![holon.id.clone()],
                        ));
                    }
                }
                ConstraintRule::ClassifiedSources { allowed } => {
                    let affected = || vec![holon.id.clone()];
                    self.check_sources(c, allowed, &holon.source_documents, affected, &mut errors);
                }
                _ => {}
            }
        }
        ValidationResult::from_errors(errors)
    }

    /// Existence is checked first; registered rules run only when both
    /// endpoints exist and are active.
    pub fn validate_relationship(
        &self,
        rel: &Relationship,
        state: &Projection,
        ctx: &ValidationContext,
    ) -> ValidationResult {
        let existence = check_existence(rel, state);
        if !existence.is_empty() {
            return ValidationResult::from_errors(existence);
        }

        let mut errors = Vec::new();
        for c in self.in_force(ctx) {
            if !c.scope.admits_relationship(&rel.relationship_type, ctx.event_type) {
                continue;
            }
            match &c.rule {
                ConstraintRule::MaxConcurrent { max, violated_rule } => {
                    check_max_concurrent(c, *max, violated_rule, rel, state, &mut errors)
                }
                ConstraintRule::Prerequisites {
                    required_via,
                    held_via,
                } => check_prerequisites(c, required_via, held_via, rel, state, &mut errors),
                ConstraintRule::Acyclic => check_acyclic(c, rel, state, &mut errors),
                ConstraintRule::EffectiveWindowOrder => {
                    if rel.effective_end.is_some_and(|end| end <= rel.effective_start) {
                        errors.push(ValidationError::new(
                            &c.id,
                            rules::INVALID_EFFECTIVE_WINDOW,
                            format!("relationship {} ends before it starts", rel.id),
                            rel.endpoints().into_iter().cloned().collect(),
                        ));
                    }
                }
                ConstraintRule::EndpointTypes {
                    source_types,
                    target_types,
                } => check_endpoint_types(c, source_types, target_types, rel, state, &mut errors),
                ConstraintRule::RequiredProperties { keys } => {
                    for key in keys.iter().filter(|k| !rel.properties.contains_key(*k)) {
                        errors.push(ValidationError::new(
                            &c.id,
                            rules::REQUIRED_PROPERTY_MISSING,
                            format!(
                                "{} {} lacks property {:?}",
                                rel.relationship_type, rel.id, key
                            ),
                            rel.endpoints().into_iter().cloned().collect(),
                        ));
                    }
                }
                ConstraintRule::ClassifiedSources { allowed } => {
                    let affected = || rel.endpoints().into_iter().cloned().collect();
                    self.check_sources(c, allowed, &rel.source_documents, affected, &mut errors);
                }
                ConstraintRule::ConfidenceFloor { min } => {
                    let score = rel.confidence_score.unwrap_or(0.0);
                    if rel.authority_level != AuthorityLevel::Authoritative && score < *min {
                        errors.push(ValidationError::new(
                            &c.id,
                            rules::CONFIDENCE_BELOW_FLOOR,
                            format!(
                                "{} relationship {} has confidence {} below {}",
                                rel.authority_level.as_str(),
                                rel.id,
                                score,
                                min
                            ),
                            rel.endpoints().into_iter().cloned().collect(),
                        ));
                    }
                }
            }
        }
        ValidationResult::from_errors(errors)
    }

    fn in_force<'a>(&'a self, ctx: &'a ValidationContext) -> impl Iterator<Item = &'a Constraint> {
        self.registry
            .constraints()
            .iter()
            .filter(move |c| c.is_in_force_at(ctx.at))
    }

    fn check_sources(
        &self,
        c: &Constraint,
        allowed: &[String],
        documents: &[String],
        affected: impl Fn() -> Vec<HolonId>,
        errors: &mut Vec<ValidationError>,
    ) {
        for doc in documents {
            let ok = self
                .registry
                .classification(doc)
                .is_some_and(|cls| allowed.iter().any(|a| a == cls));
            if !ok {
                errors.push(ValidationError::new(
                    &c.id,
                    rules::UNCLASSIFIED_SOURCE_DOCUMENT,
                    format!("source document {:?} lacks an allowed classification", doc),
                    affected(),
                ));
            }
        }
    }
}

// ── Rule implementations ───────────────────────────────────────────

fn check_existence(rel: &Relationship, state: &Projection) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for id in rel.endpoints() {
        match state.holons.get(id) {
            Err(_) => errors.push(ValidationError::new(
                EXISTENCE_CONSTRAINT_ID,
                rules::HOLON_MUST_EXIST,
                format!("holon {} does not exist", id),
                vec![id.clone()],
            )),
            Ok(h) if !h.status.is_visible() => errors.push(ValidationError::new(
                EXISTENCE_CONSTRAINT_ID,
                rules::HOLON_NOT_ACTIVE,
                format!("holon {} is {}", id, h.status.as_str()),
                vec![id.clone()],
            )),
            Ok(_) => {}
        }
    }
    errors
}

fn check_max_concurrent(
    c: &Constraint,
    max: usize,
    violated_rule: &str,
    rel: &Relationship,
    state: &Projection,
    errors: &mut Vec<ValidationError>,
) {
    let concurrent: Vec<&Relationship> = state
        .relationships
        .get_from(&rel.source, Some(&rel.relationship_type), RelationshipFilter::all())
        .into_iter()
        .filter(|r| r.id != rel.id && r.overlaps(rel.effective_start, rel.effective_end))
        .collect();
    if concurrent.len() >= max {
        let mut affected = vec![rel.source.clone(), rel.target.clone()];
        affected.extend(concurrent.iter().map(|r| r.target.clone()));
        errors.push(ValidationError::new(
            &c.id,
            violated_rule,
            format!(
                "{} already holds {} concurrent {} relationships (max {})",
                rel.source,
                concurrent.len(),
                rel.relationship_type,
                max
            ),
            affected,
        ));
    }
}

fn check_prerequisites(
    c: &Constraint,
    required_via: &str,
    held_via: &str,
    rel: &Relationship,
    state: &Projection,
    errors: &mut Vec<ValidationError>,
) {
    let at = RelationshipFilter::active_at(rel.effective_start);
    let required: BTreeSet<&HolonId> = state
        .relationships
        .get_to(&rel.target, Some(required_via), at)
        .into_iter()
        .map(|r| &r.source)
        .collect();
    if required.is_empty() {
        return;
    }
    let held: BTreeSet<&HolonId> = state
        .relationships
        .get_from(&rel.source, Some(held_via), at)
        .into_iter()
        .map(|r| &r.target)
        .collect();
    let missing: Vec<HolonId> = required.difference(&held).map(|id| (*id).clone()).collect();
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(HolonId::as_str).collect();
        let mut affected = vec![rel.source.clone(), rel.target.clone()];
        affected.extend(missing.iter().cloned());
        errors.push(ValidationError::new(
            &c.id,
            rules::MISSING_PREREQUISITE,
            format!("{} lacks prerequisites for {}: {}", rel.source, rel.target, names.join(", ")),
            affected,
        ));
    }
}

/// Rejects the edge if `source == target` or if `source` is reachable from
/// `target` over not-yet-ended edges of the same type.
fn check_acyclic(
    c: &Constraint,
    rel: &Relationship,
    state: &Projection,
    errors: &mut Vec<ValidationError>,
) {
    if rel.source == rel.target {
        errors.push(ValidationError::new(
            &c.id,
            rules::NO_SELF_PREREQUISITE,
            format!("{} cannot depend on itself", rel.source),
            vec![rel.source.clone()],
        ));
        return;
    }

    let live = |r: &&Relationship| r.effective_end.map_or(true, |end| end > rel.effective_start);
    let mut visited: BTreeSet<&HolonId> = BTreeSet::new();
    let mut parent: BTreeMap<&HolonId, &HolonId> = BTreeMap::new();
    let mut stack: Vec<&HolonId> = vec![&rel.target];
    visited.insert(&rel.target);

    while let Some(node) = stack.pop() {
        if node == &rel.source {
            let mut path = vec![node.clone()];
            let mut cur = node;
            while let Some(p) = parent.get(cur) {
                path.push((*p).clone());
                cur = p;
            }
            path.reverse();
            let mut cycle: Vec<&str> = vec![rel.source.as_str()];
            cycle.extend(path.iter().map(HolonId::as_str));
            errors.push(ValidationError::new(
                &c.id,
                rules::NO_CYCLES,
                format!("adding {} would close a cycle: {}", rel.id, cycle.join(" -> ")),
                path,
            ));
            return;
        }
        let next = state
            .relationships
            .get_from(node, Some(&rel.relationship_type), RelationshipFilter::all());
        for edge in next.into_iter().filter(live).rev() {
            if visited.insert(&edge.target) {
                parent.insert(&edge.target, node);
                stack.push(&edge.target);
            }
        }
    }
}

fn check_endpoint_types(
    c: &Constraint,
    source_types: &[String],
    target_types: &[String],
    rel: &Relationship,
    state: &Projection,
    errors: &mut Vec<ValidationError>,
) {
    for (id, allowed, role) in [
        (&rel.source, source_types, "source"),
        (&rel.target, target_types, "target"),
    ] {
        if allowed.is_empty() {
            continue;
        }
        let Ok(holon) = state.holons.get(id) else {
            continue;
        };
        if !allowed.iter().any(|t| t == &holon.holon_type) {
            errors.push(ValidationError::new(
                &c.id,
                rules::INVALID_ENDPOINT_TYPE,
                format!(
                    "{} {} of {} is a {}, expected one of {}",
                    role,
                    id,
                    rel.relationship_type,
                    holon.holon_type,
                    allowed.join(", ")
                ),
                vec![id.clone()],
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::constraints::{ConstraintScope, GovernanceDocument, InMemoryDocumentRegistry};
    use crate::domain::{HolonSpec, HolonStatus, RelationshipSpec};
    use crate::ids::EventId;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    fn ctx() -> ValidationContext {
        ValidationContext {
            at: ts(1),
            event_type: None,
        }
    }

    fn default_validator() -> ConstraintValidator {
        ConstraintValidator::new(Arc::new(InMemoryDocumentRegistry::with_defaults(
            &EngineConfig::default(),
        )))
    }

    fn state_with(holons: &[(&str, &str)]) -> Projection {
        let mut state = Projection::default();
        for (i, (id, ty)) in holons.iter().enumerate() {
            state
                .holons
                .create(HolonSpec::new(*ty).with_id(*id), EventId(i as u64 + 1), ts(1))
                .unwrap();
        }
        state
    }

    fn add(state: &mut Projection, ty: &str, s: &str, t: &str, by: u64) {
        state
            .relationships
            .create(RelationshipSpec::new(ty, s, t, ts(1)), EventId(by))
            .unwrap();
    }

    fn propose(ty: &str, s: &str, t: &str) -> Relationship {
        RelationshipSpec::new(ty, s, t, ts(2)).into_relationship(EventId(999))
    }

    #[test]
    fn missing_endpoint_fails_existence_only() {
        let state = state_with(&[("p1", "Person")]);
        let result = default_validator().validate(
            Candidate::Relationship(&propose("OCCUPIES", "p1", "ghost")),
            &state,
            &ctx(),
        );
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].violated_rule, rules::HOLON_MUST_EXIST);
        assert_eq!(result.errors[0].affected_holons, vec![HolonId::from("ghost")]);
    }

    #[test]
    fn inactive_endpoint_is_rejected() {
        let mut state = state_with(&[("p1", "Person"), ("pos-1", "Position")]);
        state
            .holons
            .set_status(&"pos-1".into(), HolonStatus::Archived, None, EventId(9), ts(1))
            .unwrap();
        let result = default_validator().validate_relationship(
            &propose("OCCUPIES", "p1", "pos-1"),
            &state,
            &ctx(),
        );
        assert_eq!(result.errors[0].violated_rule, rules::HOLON_NOT_ACTIVE);
    }

    #[test]
    fn fourth_concurrent_position_is_rejected() {
        let mut state = state_with(&[
            ("p1", "Person"),
            ("pos-1", "Position"),
            ("pos-2", "Position"),
            ("pos-3", "Position"),
            ("pos-4", "Position"),
        ]);
        for (i, pos) in ["pos-1", "pos-2", "pos-3"].iter().enumerate() {
            add(&mut state, "OCCUPIES", "p1", pos, 10 + i as u64);
        }
        let failure = default_validator()
            .validate_relationship(&propose("OCCUPIES", "p1", "pos-4"), &state, &ctx())
            .into_result()
            .unwrap_err();
        assert!(failure.has_rule(rules::CONCURRENT_POSITION));
        assert!(!failure.is_cycle());
    }

    #[test]
    fn ended_positions_do_not_count_toward_the_cap() {
        let mut state = state_with(&[
            ("p1", "Person"),
            ("pos-1", "Position"),
            ("pos-2", "Position"),
            ("pos-3", "Position"),
            ("pos-4", "Position"),
        ]);
        for (i, pos) in ["pos-1", "pos-2", "pos-3"].iter().enumerate() {
            add(&mut state, "OCCUPIES", "p1", pos, 10 + i as u64);
        }
        let first = state.relationships.get_from(&"p1".into(), None, RelationshipFilter::all())[0]
            .id
            .clone();
        state.relationships.end(&first, ts(2), None, EventId(20)).unwrap();
        let result = default_validator().validate_relationship(
            &propose("OCCUPIES", "p1", "pos-4"),
            &state,
            &ctx(),
        );
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn missing_qualification_blocks_assignment() {
        let mut state = state_with(&[
            ("p1", "Person"),
            ("pos-1", "Position"),
            ("qual-1", "Qualification"),
        ]);
        add(&mut state, "REQUIRED_FOR", "qual-1", "pos-1", 10);
        let v = default_validator();

        let failure = v
            .validate_relationship(&propose("OCCUPIES", "p1", "pos-1"), &state, &ctx())
            .into_result()
            .unwrap_err();
        assert!(failure.has_rule(rules::MISSING_PREREQUISITE));
        assert!(failure.errors[0].affected_holons.contains(&"qual-1".into()));

        add(&mut state, "HAS_QUALIFICATION", "p1", "qual-1", 11);
        assert!(v
            .validate_relationship(&propose("OCCUPIES", "p1", "pos-1"), &state, &ctx())
            .valid);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let state = state_with(&[("q-a", "Qualification")]);
        let failure = default_validator()
            .validate_relationship(&propose("DEPENDS_ON", "q-a", "q-a"), &state, &ctx())
            .into_result()
            .unwrap_err();
        assert!(failure.is_cycle());
        assert!(failure.has_rule(rules::NO_SELF_PREREQUISITE));
    }

    #[test]
    fn transitive_cycle_is_rejected_with_path() {
        let mut state = state_with(&[
            ("a", "Qualification"),
            ("b", "Qualification"),
            ("c", "Qualification"),
        ]);
        add(&mut state, "DEPENDS_ON", "b", "a", 10);
        add(&mut state, "DEPENDS_ON", "c", "b", 11);

        let failure = default_validator()
            .validate_relationship(&propose("DEPENDS_ON", "a", "c"), &state, &ctx())
            .into_result()
            .unwrap_err();
        assert!(failure.has_rule(rules::NO_CYCLES));
        assert!(failure.errors[0].message.contains("a -> c -> b -> a"));
    }

    #[test]
    fn traversal_terminates_on_malformed_cycle() {
        let mut state = state_with(&[
            ("a", "Qualification"),
            ("b", "Qualification"),
            ("x", "Qualification"),
        ]);
        // Already-cyclic data inserted behind the validator's back.
        add(&mut state, "DEPENDS_ON", "a", "b", 10);
        add(&mut state, "DEPENDS_ON", "b", "a", 11);
        let result = default_validator().validate_relationship(
            &propose("DEPENDS_ON", "x", "a"),
            &state,
            &ctx(),
        );
        assert!(result.valid);
    }

    #[test]
    fn registered_rules_apply_by_scope() {
        let mut registry = InMemoryDocumentRegistry::new();
        registry.add_document(GovernanceDocument {
            id: "POL-1".into(),
            title: "Org policy".into(),
            classification: Some("public".into()),
        });
        registry
            .register(
                Constraint::new(
                    "C-STR-1",
                    ConstraintScope::holon("Position"),
                    ConstraintRule::RequiredProperties {
                        keys: vec!["title".into()],
                    },
                )
                .from_document("POL-1"),
            )
            .unwrap();
        registry
            .register(
                Constraint::new(
                    "C-RISK-1",
                    ConstraintScope::relationship("MEMBER_OF"),
                    ConstraintRule::ConfidenceFloor { min: 0.5 },
                )
                .from_document("POL-1"),
            )
            .unwrap();
        let v = ConstraintValidator::new(Arc::new(registry));

        let mut state = state_with(&[("p1", "Person"), ("org", "Organization")]);
        let bare = state
            .holons
            .create(HolonSpec::new("Position").with_id("pos-9"), EventId(50), ts(1))
            .unwrap();
        let result = v.validate_holon(&bare, &ctx());
        assert_eq!(result.errors[0].violated_rule, rules::REQUIRED_PROPERTY_MISSING);

        let titled = HolonSpec::new("Position").with_property("title", json!("Chief"));
        let titled = state.holons.create(titled, EventId(51), ts(1)).unwrap();
        assert!(v.validate_holon(&titled, &ctx()).valid);

        let mut inferred = propose("MEMBER_OF", "p1", "org");
        inferred.authority_level = AuthorityLevel::Inferred;
        inferred.confidence_score = Some(0.2);
        let result = v.validate_relationship(&inferred, &state, &ctx());
        assert_eq!(result.errors[0].violated_rule, rules::CONFIDENCE_BELOW_FLOOR);
    }
}
