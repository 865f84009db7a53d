#![forbid(unsafe_code)]

//! Semantic operating model kernel.
//!
//! An append-only event log is the only source of truth. Holons and
//! relationships are projections of it, historical state is recomputed
//! by folding a time-bounded window of events, and every mutation is
//! checked against registered governance constraints before it becomes
//! visible.

/// Version of the canonical projection form. Changing how events fold or
/// how state hashes requires a new version.
pub const KERNEL_VERSION: u32 = 1;

pub mod clock;
pub mod config;
pub mod constraints;
pub mod domain;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod events;
pub mod graph;
pub mod hashing;
pub mod holon_store;
pub mod ids;
pub mod projector;
pub mod relationship_store;
pub mod state;
pub mod temporal;
pub mod transitions;
pub mod validator;
