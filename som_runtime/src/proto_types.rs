//! Hand-written protobuf types for the durable event log.
//!
//! Uses prost derive macros for encode/decode without prost-build.
//! Timestamps are microseconds since the Unix epoch. Property bags are
//! carried as canonical JSON strings since their values are open-ended.

use prost::Message;

// ── Envelope ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoEventEnvelope {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(string, tag = "2")]
    pub event_type: String,
    #[prost(int64, tag = "3")]
    pub occurred_at_micros: i64,
    #[prost(int64, tag = "4")]
    pub recorded_at_micros: i64,
    #[prost(string, tag = "5")]
    pub actor: String,
    #[prost(string, repeated, tag = "6")]
    pub subjects: Vec<String>,
    #[prost(string, tag = "7")]
    pub source_system: String,
    #[prost(string, optional, tag = "8")]
    pub source_document: Option<String>,
    #[prost(message, optional, tag = "9")]
    pub validity_window: Option<ProtoValidityWindow>,
    #[prost(message, optional, tag = "10")]
    pub causal_links: Option<ProtoCausalLinks>,
    #[prost(message, optional, tag = "11")]
    pub payload: Option<ProtoPayload>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoValidityWindow {
    #[prost(int64, optional, tag = "1")]
    pub start_micros: Option<i64>,
    #[prost(int64, optional, tag = "2")]
    pub end_micros: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoCausalLinks {
    #[prost(uint64, repeated, tag = "1")]
    pub preceded_by: Vec<u64>,
    #[prost(uint64, repeated, tag = "2")]
    pub caused_by: Vec<u64>,
    #[prost(uint64, repeated, tag = "3")]
    pub grouped_with: Vec<u64>,
}

// ── Payload ────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoPayload {
    #[prost(oneof = "PayloadKind", tags = "1, 2, 3, 4, 5, 6")]
    pub kind: Option<PayloadKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum PayloadKind {
    #[prost(message, tag = "1")]
    HolonCreated(ProtoHolonCreated),
    #[prost(message, tag = "2")]
    PropertiesUpdated(ProtoPropertiesUpdated),
    #[prost(message, tag = "3")]
    StatusChanged(ProtoStatusChanged),
    #[prost(message, tag = "4")]
    RelationshipCreated(ProtoRelationshipCreated),
    #[prost(message, tag = "5")]
    RelationshipEnded(ProtoRelationshipEnded),
    /// Payload of an event type this build does not know, as JSON.
    #[prost(string, tag = "6")]
    UnknownJson(String),
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoHolonCreated {
    #[prost(string, optional, tag = "1")]
    pub holon_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub holon_type: Option<String>,
    #[prost(string, tag = "3")]
    pub properties_json: String,
    #[prost(string, optional, tag = "4")]
    pub status: Option<String>,
    #[prost(string, repeated, tag = "5")]
    pub source_documents: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoPropertiesUpdated {
    #[prost(string, tag = "1")]
    pub holon_id: String,
    #[prost(string, tag = "2")]
    pub set_json: String,
    #[prost(string, repeated, tag = "3")]
    pub unset: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoStatusChanged {
    #[prost(string, tag = "1")]
    pub holon_id: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(string, optional, tag = "3")]
    pub reason: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoRelationshipCreated {
    #[prost(string, optional, tag = "1")]
    pub relationship_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub relationship_type: Option<String>,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(string, tag = "4")]
    pub target: String,
    #[prost(string, tag = "5")]
    pub properties_json: String,
    #[prost(int64, optional, tag = "6")]
    pub effective_start_micros: Option<i64>,
    #[prost(int64, optional, tag = "7")]
    pub effective_end_micros: Option<i64>,
    #[prost(string, tag = "8")]
    pub authority_level: String,
    #[prost(double, optional, tag = "9")]
    pub confidence_score: Option<f64>,
    #[prost(string, repeated, tag = "10")]
    pub source_documents: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoRelationshipEnded {
    #[prost(string, tag = "1")]
    pub relationship_id: String,
    #[prost(int64, optional, tag = "2")]
    pub effective_end_micros: Option<i64>,
    #[prost(string, optional, tag = "3")]
    pub reason: Option<String>,
}
