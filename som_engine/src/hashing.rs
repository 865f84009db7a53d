//! Canonical hashing.
//!
//! Deterministic canonical serialization + SHA-256 of a projection.
//!
//! Rules:
//!   - holons sorted by id, relationships sorted by id
//!   - fixed field order inside every record
//!   - object keys inside property values sorted recursively
//!   - timestamps as RFC 3339 UTC with microseconds
//!   - UTF-8 JSON, no whitespace

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::{Holon, Relationship};
use crate::state::Projection;
use crate::KERNEL_VERSION;

/// Canonical serialization of a projection to UTF-8 JSON bytes.
pub fn canonical_serialize(state: &Projection) -> Vec<u8> {
    build_canonical_value(state).to_string().into_bytes()
}

/// SHA-256 of the canonical serialization. Lowercase hex.
pub fn canonical_hash(state: &Projection) -> String {
    sha256_hex(&canonical_serialize(state))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Field order: kernel_version, last_event, holons, relationships, rejections.
pub fn build_canonical_value(state: &Projection) -> Value {
    let mut root = Map::new();
    root.insert("kernel_version".into(), Value::from(KERNEL_VERSION));
    root.insert(
        "last_event".into(),
        state.last_event.map_or(Value::Null, |id| Value::from(id.value())),
    );
    root.insert(
        "holons".into(),
        Value::Array(state.holons.iter().map(canonical_holon).collect()),
    );
    let mut rels: Vec<&Relationship> = state.relationships.iter().collect();
    rels.sort_by(|a, b| a.id.cmp(&b.id));
    root.insert(
        "relationships".into(),
        Value::Array(rels.into_iter().map(canonical_relationship).collect()),
    );
    root.insert(
        "rejections".into(),
        Value::Array(
            state
                .rejections
                .iter()
                .map(|(id, err)| {
                    let mut m = Map::new();
                    m.insert("event_id".into(), Value::from(id.value()));
                    m.insert("code".into(), Value::from(err.code()));
                    Value::Object(m)
                })
                .collect(),
        ),
    );
    Value::Object(root)
}

fn canonical_holon(h: &Holon) -> Value {
    let mut m = Map::new();
    m.insert("id".into(), Value::from(h.id.as_str()));
    m.insert("holon_type".into(), Value::from(h.holon_type.as_str()));
    m.insert("status".into(), Value::from(h.status.as_str()));
    m.insert("status_reason".into(), opt_str(h.status_reason.as_deref()));
    m.insert("version".into(), Value::from(h.version));
    m.insert("created_at".into(), ts(&h.created_at));
    m.insert("created_by".into(), Value::from(h.created_by.value()));
    m.insert("updated_at".into(), ts(&h.updated_at));
    m.insert("updated_by".into(), Value::from(h.updated_by.value()));
    m.insert("properties".into(), canonical_properties(&h.properties));
    m.insert("source_documents".into(), sorted_strings(&h.source_documents));
    Value::Object(m)
}

fn canonical_relationship(r: &Relationship) -> Value {
    let mut m = Map::new();
    m.insert("id".into(), Value::from(r.id.as_str()));
    m.insert("relationship_type".into(), Value::from(r.relationship_type.as_str()));
    m.insert("source".into(), Value::from(r.source.as_str()));
    m.insert("target".into(), Value::from(r.target.as_str()));
    m.insert("effective_start".into(), ts(&r.effective_start));
    m.insert("effective_end".into(), r.effective_end.as_ref().map_or(Value::Null, ts));
    m.insert("created_by".into(), Value::from(r.created_by.value()));
    m.insert(
        "ended_by".into(),
        r.ended_by.map_or(Value::Null, |id| Value::from(id.value())),
    );
    m.insert("end_reason".into(), opt_str(r.end_reason.as_deref()));
    m.insert("authority_level".into(), Value::from(r.authority_level.as_str()));
    m.insert(
        "confidence_score".into(),
        r.confidence_score.map_or(Value::Null, Value::from),
    );
    m.insert("properties".into(), canonical_properties(&r.properties));
    m.insert("source_documents".into(), sorted_strings(&r.source_documents));
    Value::Object(m)
}

fn canonical_properties(props: &crate::domain::PropertyBag) -> Value {
    Value::Object(props.iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect())
}

/// Rebuild `v` with object keys in byte order at every level.
fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), sort_keys(&obj[k])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn sorted_strings(items: &[String]) -> Value {
    let mut items = items.to_vec();
    items.sort();
    Value::Array(items.into_iter().map(Value::String).collect())
}

fn opt_str(s: Option<&str>) -> Value {
    s.map_or(Value::Null, Value::from)
}

fn ts(t: &DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true))
}
