#![forbid(unsafe_code)]

//! Durable runtime for the semantic operating model engine.
//!
//! Wraps the kernel with an on-disk event log, replay, snapshots, isolated
//! sessions, drift detection and the boundary `Api`.
//!
//! No domain logic lives here. Transitions, rules and projections are all
//! delegated to `som_engine`.

pub mod api;
pub mod config;
pub mod drift;
pub mod error;
pub mod event_store;
pub mod proto_bridge;
pub mod proto_types;
pub mod replay;
pub mod session;
pub mod snapshot;
