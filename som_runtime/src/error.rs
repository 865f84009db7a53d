//! Runtime error type.

use std::io;

use thiserror::Error;

use som_engine::error::EngineError;

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("corrupt event log: {0}")]
    CorruptLog(String),

    #[error("sequence violation in event store: expected {expected}, got {got}")]
    Sequence { expected: u64, got: u64 },

    #[error("snapshot at sequence {sequence} does not match its content")]
    CorruptSnapshot { sequence: u64 },

    #[error("determinism failure: two replays produced {first} and {second}")]
    Determinism { first: String, second: String },

    #[error("session lock poisoned")]
    LockPoisoned,
}

impl RuntimeError {
    /// The kernel error, if this is one.
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            RuntimeError::Engine(e) => Some(e),
            _ => None,
        }
    }
}
