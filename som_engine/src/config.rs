//! Engine configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::relationship_types;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How far into the future `occurred_at` may lie relative to the clock.
    /// Default: 300 seconds
    #[serde(default = "default_future_grace_secs")]
    pub future_grace_secs: i64,

    /// Concurrent occupancy cap installed by the default constraint set.
    /// Default: 3
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,

    /// Relationship type the occupancy cap and eligibility rule apply to.
    /// Default: OCCUPIES
    #[serde(default = "default_position_relationship_type")]
    pub position_relationship_type: String,

    /// Depth used when a causal trace is requested without one.
    /// Default: 16
    #[serde(default = "default_trace_depth")]
    pub default_trace_depth: usize,

    /// Hard ceiling on pattern match results regardless of the request.
    /// Default: 1000
    #[serde(default = "default_max_pattern_results")]
    pub max_pattern_results: usize,

    /// Register the built-in governance constraints when the engine builds
    /// its own document registry.
    /// Default: true
    #[serde(default = "default_install_default_constraints")]
    pub install_default_constraints: bool,
}

fn default_future_grace_secs() -> i64 {
    300
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_position_relationship_type() -> String {
    relationship_types::OCCUPIES.to_string()
}

fn default_trace_depth() -> usize {
    16
}

fn default_max_pattern_results() -> usize {
    1000
}

fn default_install_default_constraints() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            future_grace_secs: default_future_grace_secs(),
            max_concurrent_positions: default_max_concurrent_positions(),
            position_relationship_type: default_position_relationship_type(),
            default_trace_depth: default_trace_depth(),
            max_pattern_results: default_max_pattern_results(),
            install_default_constraints: default_install_default_constraints(),
        }
    }
}

impl EngineConfig {
    pub fn future_grace(&self) -> Duration {
        Duration::seconds(self.future_grace_secs.max(0))
    }
}
