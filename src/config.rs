//! Typed configuration object. Loading it from disk/env/CLI flags is
//! out of scope for the core; this module only defines the shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_tpm: u32,
    pub daily_budget_usd: f64,
    pub max_connections: u32,
    pub cpm_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCounts {
    pub max_coders: usize,
    pub architect_model: String,
    pub pm_model: String,
    pub coder_model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_iterations: usize,
    pub retry_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShutdownSettings {
    pub stop_timeout_seconds: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { stop_timeout_seconds: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaestroConfig {
    pub models: HashMap<String, ModelLimits>,
    pub agents: AgentCounts,
    pub queue: QueueSettings,
    pub shutdown: ShutdownSettings,
    /// Bounded mailbox capacity per agent, defaulting to 64.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_mailbox_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_json() {
        let json = serde_json::json!({
            "models": {
                "claude": {"max_tpm": 100, "daily_budget_usd": 10.0, "max_connections": 3, "cpm_usd": 0.01}
            },
            "agents": {
                "max_coders": 2,
                "architect_model": "claude",
                "pm_model": "claude",
                "coder_model": "claude"
            },
            "queue": {"max_iterations": 4, "retry_limit": 3},
            "shutdown": {"stop_timeout_seconds": 5}
        });
        let cfg: MaestroConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.mailbox_capacity, 64);
        assert_eq!(cfg.models["claude"].max_tpm, 100);
    }
}
