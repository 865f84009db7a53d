//! Graph index over a current-state snapshot.
//!
//! Built from a `Projection` at a point in valid time and never updated in
//! place: after bulk changes the caller rebuilds it. Holds only visible
//! holons and relationships active at `built_at`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Holon;
use crate::error::{EngineError, Result};
use crate::ids::{EventId, HolonId, RelationshipId};
use crate::relationship_store::RelationshipFilter;
use crate::state::Projection;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    relationship_id: RelationshipId,
    relationship_type: String,
    peer: HolonId,
}

// ---------------------------------------------------------------------------
// Pattern queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOp {
    Eq,
    NotEq,
    Contains,
    Exists,
    Gt,
    Lt,
}

/// Property test on the holon at `position` in the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConstraint {
    pub position: usize,
    pub key: String,
    pub op: PropertyOp,
    #[serde(default)]
    pub value: Value,
}

impl PropertyConstraint {
    pub fn eq(position: usize, key: impl Into<String>, value: Value) -> Self {
        Self {
            position,
            key: key.into(),
            op: PropertyOp::Eq,
            value,
        }
    }

    pub fn matches(&self, holon: &Holon) -> bool {
        let actual = holon.properties.get(&self.key);
        match (self.op, actual) {
            (PropertyOp::Exists, a) => a.is_some(),
            (PropertyOp::Eq, Some(a)) => a == &self.value,
            (PropertyOp::NotEq, a) => a != Some(&self.value),
            (PropertyOp::Contains, Some(Value::String(s))) => {
                self.value.as_str().is_some_and(|needle| s.contains(needle))
            }
            (PropertyOp::Contains, Some(Value::Array(items))) => items.contains(&self.value),
            (PropertyOp::Gt, Some(a)) => compare(a, &self.value) == Some(Ordering::Greater),
            (PropertyOp::Lt, Some(a)) => compare(a, &self.value) == Some(Ordering::Less),
            _ => false,
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Path pattern `H0 -R0-> H1 -R1-> ... Hn`.
///
/// `holon_types[i]` filters position `i`, `relationship_types[i]` the edge
/// leaving it. An empty string matches any type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternQuery {
    pub holon_types: Vec<String>,
    #[serde(default)]
    pub relationship_types: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<PropertyConstraint>,
    pub max_results: usize,
}

impl PatternQuery {
    pub fn path(holon_types: &[&str], relationship_types: &[&str], max_results: usize) -> Self {
        Self {
            holon_types: holon_types.iter().map(|s| s.to_string()).collect(),
            relationship_types: relationship_types.iter().map(|s| s.to_string()).collect(),
            constraints: Vec::new(),
            max_results,
        }
    }

    pub fn with_constraint(mut self, constraint: PropertyConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    fn check(&self) -> Result<()> {
        if self.holon_types.is_empty() {
            return Err(EngineError::InvalidFilter(
                "pattern needs at least one holon position".to_string(),
            ));
        }
        if self.relationship_types.len() + 1 != self.holon_types.len() {
            return Err(EngineError::InvalidFilter(format!(
                "{} holon positions need {} relationship types, got {}",
                self.holon_types.len(),
                self.holon_types.len() - 1,
                self.relationship_types.len()
            )));
        }
        if self.max_results == 0 {
            return Err(EngineError::InvalidFilter("max_results must be positive".to_string()));
        }
        if let Some(c) = self.constraints.iter().find(|c| c.position >= self.holon_types.len()) {
            return Err(EngineError::InvalidFilter(format!(
                "constraint on {:?} targets position {} beyond the pattern",
                c.key, c.position
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub holons: Vec<HolonId>,
    pub relationships: Vec<RelationshipId>,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    built_at: Option<DateTime<Utc>>,
    source_event: Option<EventId>,
    holons: BTreeMap<HolonId, Holon>,
    by_type: BTreeMap<String, BTreeSet<HolonId>>,
    by_property: BTreeMap<String, BTreeMap<String, BTreeSet<HolonId>>>,
    outgoing: BTreeMap<HolonId, Vec<Edge>>,
    incoming: BTreeMap<HolonId, Vec<Edge>>,
    edge_count: usize,
}

impl GraphIndex {
    /// Index the visible holons of `state` and the relationships active at
    /// `at` between them.
    pub fn build(state: &Projection, at: DateTime<Utc>) -> Self {
        let mut index = GraphIndex {
            built_at: Some(at),
            source_event: state.last_event,
            ..Default::default()
        };

        for holon in state.holons.iter().filter(|h| h.status.is_visible()) {
            index
                .by_type
                .entry(holon.holon_type.clone())
                .or_default()
                .insert(holon.id.clone());
            for (key, value) in &holon.properties {
                index
                    .by_property
                    .entry(key.clone())
                    .or_default()
                    .entry(value.to_string())
                    .or_default()
                    .insert(holon.id.clone());
            }
            index.holons.insert(holon.id.clone(), holon.clone());
        }

        let active = RelationshipFilter::active_at(at);
        for rel in state.relationships.iter().filter(|r| active.matches(r)) {
            if !index.holons.contains_key(&rel.source) || !index.holons.contains_key(&rel.target) {
                continue;
            }
            index.outgoing.entry(rel.source.clone()).or_default().push(Edge {
                relationship_id: rel.id.clone(),
                relationship_type: rel.relationship_type.clone(),
                peer: rel.target.clone(),
            });
            index.incoming.entry(rel.target.clone()).or_default().push(Edge {
                relationship_id: rel.id.clone(),
                relationship_type: rel.relationship_type.clone(),
                peer: rel.source.clone(),
            });
            index.edge_count += 1;
        }
        for list in index.outgoing.values_mut().chain(index.incoming.values_mut()) {
            list.sort_by(|a, b| (&a.peer, &a.relationship_id).cmp(&(&b.peer, &b.relationship_id)));
        }

        tracing::info!(
            holons = index.holons.len(),
            relationships = index.edge_count,
            source_event = ?index.source_event,
            "graph index rebuilt"
        );
        index
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    /// Last event folded into the projection this index was built from.
    pub fn source_event(&self) -> Option<EventId> {
        self.source_event
    }

    pub fn holon_count(&self) -> usize {
        self.holons.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.edge_count
    }

    /// Directed density: edges / (n * (n - 1)). Zero below two holons.
    pub fn density(&self) -> f64 {
        let n = self.holons.len();
        if n < 2 {
            return 0.0;
        }
        self.edge_count as f64 / (n * (n - 1)) as f64
    }

    pub fn holons_of_type(&self, holon_type: &str) -> Vec<&HolonId> {
        self.by_type.get(holon_type).into_iter().flatten().collect()
    }

    /// Holons whose `key` equals `value` exactly.
    pub fn holons_with_property(&self, key: &str, value: &Value) -> Vec<&HolonId> {
        self.by_property
            .get(key)
            .and_then(|values| values.get(&value.to_string()))
            .into_iter()
            .flatten()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Pattern matching
    // -----------------------------------------------------------------------

    /// Bounded search for simple paths matching `query`. Stops once
    /// `query.max_results` matches are found.
    pub fn match_pattern(&self, query: &PatternQuery) -> Result<Vec<PatternMatch>> {
        query.check()?;
        let mut matches = Vec::new();
        for start in self.seeds(query) {
            if matches.len() >= query.max_results {
                break;
            }
            let mut path = PatternMatch {
                holons: vec![start.clone()],
                relationships: Vec::new(),
            };
            self.extend(query, &mut path, &mut matches);
        }
        Ok(matches)
    }

    fn seeds(&self, query: &PatternQuery) -> Vec<HolonId> {
        let mut candidates: Vec<&HolonId> = match query.holon_types[0].as_str() {
            "" => self.holons.keys().collect(),
            t => self.holons_of_type(t),
        };
        if let Some(c) = query
            .constraints
            .iter()
            .find(|c| c.position == 0 && c.op == PropertyOp::Eq)
        {
            let hits: BTreeSet<&HolonId> =
                self.holons_with_property(&c.key, &c.value).into_iter().collect();
            candidates.retain(|id| hits.contains(id));
        }
        candidates
            .into_iter()
            .filter(|id| self.position_matches(query, 0, id))
            .cloned()
            .collect()
    }

    fn position_matches(&self, query: &PatternQuery, position: usize, id: &HolonId) -> bool {
        let Some(holon) = self.holons.get(id) else {
            return false;
        };
        let wanted = query.holon_types[position].as_str();
        (wanted.is_empty() || wanted == holon.holon_type)
            && query
                .constraints
                .iter()
                .filter(|c| c.position == position)
                .all(|c| c.matches(holon))
    }

    fn extend(&self, query: &PatternQuery, path: &mut PatternMatch, out: &mut Vec<PatternMatch>) {
        if out.len() >= query.max_results {
            return;
        }
        let position = path.holons.len() - 1;
        if position + 1 == query.holon_types.len() {
            out.push(path.clone());
            return;
        }
        let Some(current) = path.holons.last().cloned() else {
            return;
        };
        let wanted = query.relationship_types[position].as_str();
        for edge in self.outgoing.get(&current).into_iter().flatten() {
            if !wanted.is_empty() && edge.relationship_type != wanted {
                continue;
            }
            if path.holons.contains(&edge.peer)
                || !self.position_matches(query, position + 1, &edge.peer)
            {
                continue;
            }
            path.holons.push(edge.peer.clone());
            path.relationships.push(edge.relationship_id.clone());
            self.extend(query, path, out);
            path.holons.pop();
            path.relationships.pop();
            if out.len() >= query.max_results {
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Case-insensitive substring search over ids and string property values.
    pub fn search(&self, term: &str, holon_types: &[String], max_results: usize) -> Vec<HolonId> {
        let needle = term.to_lowercase();
        self.holons
            .values()
            .filter(|h| holon_types.is_empty() || holon_types.contains(&h.holon_type))
            .filter(|h| {
                h.id.as_str().to_lowercase().contains(&needle)
                    || h.properties.values().any(|v| {
                        v.as_str().is_some_and(|s| s.to_lowercase().contains(&needle))
                    })
            })
            .take(max_results)
            .map(|h| h.id.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Isolation
    // -----------------------------------------------------------------------

    /// Holons with no active incoming or outgoing relationship.
    pub fn find_isolated_holons(&self) -> Vec<HolonId> {
        self.holons
            .keys()
            .filter(|id| {
                self.outgoing.get(*id).map_or(true, Vec::is_empty)
                    && self.incoming.get(*id).map_or(true, Vec::is_empty)
            })
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Cycle detection
    // -----------------------------------------------------------------------

    /// Cycles among edges of `relationship_type`. Uses iterative DFS with
    /// explicit colour tracking, sorted traversal for determinism.
    pub fn detect_cycles(&self, relationship_type: &str) -> Vec<Vec<HolonId>> {
        let mut adj: BTreeMap<&HolonId, Vec<&HolonId>> = BTreeMap::new();
        for (source, edges) in &self.outgoing {
            let targets: Vec<&HolonId> = edges
                .iter()
                .filter(|e| e.relationship_type == relationship_type)
                .map(|e| &e.peer)
                .collect();
            if !targets.is_empty() {
                adj.insert(source, targets);
            }
        }

        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let mut colour: BTreeMap<&HolonId, u8> = self.holons.keys().map(|id| (id, WHITE)).collect();
        let mut cycles: Vec<Vec<HolonId>> = Vec::new();

        for start in self.holons.keys() {
            if colour.get(start).copied().unwrap_or(WHITE) != WHITE {
                continue;
            }
            let mut stack: Vec<(&HolonId, usize)> = vec![(start, 0)];
            colour.insert(start, GREY);

            while let Some(&(node, idx)) = stack.last() {
                let neighbours = adj.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if idx < neighbours.len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 = idx + 1;
                    }
                    let nbr = neighbours[idx];
                    match colour.get(nbr).copied().unwrap_or(WHITE) {
                        GREY => {
                            let mut cycle = vec![nbr.clone()];
                            for (sn, _) in stack.iter().rev() {
                                cycle.push((*sn).clone());
                                if *sn == nbr {
                                    break;
                                }
                            }
                            cycle.reverse();
                            cycles.push(cycle);
                        }
                        WHITE => {
                            colour.insert(nbr, GREY);
                            stack.push((nbr, 0));
                        }
                        _ => {}
                    }
                } else {
                    colour.insert(node, BLACK);
                    stack.pop();
                }
            }
        }

        cycles
    }
}
