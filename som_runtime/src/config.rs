//! Runtime configuration, loaded from TOML.
//!
//! ```toml
//! data_dir = "/var/lib/som"
//! snapshot_interval = 100
//! log_filter = "som_runtime=debug,info"
//!
//! [engine]
//! max_concurrent_positions = 3
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use som_engine::config::EngineConfig;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sessions live in `<data_dir>/<session_id>/`.
    /// Default: ./som-data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Write a projection snapshot every N events. 0 disables snapshots.
    /// Default: 100
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    /// Default: info
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./som-data")
}

fn default_snapshot_interval() -> u64 {
    100
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_interval: default_snapshot_interval(),
            log_filter: default_log_filter(),
            engine: EngineConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
