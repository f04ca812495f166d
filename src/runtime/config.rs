use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// Engine tuning knobs. Every field has a default so partial YAML files work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on agenda operations in one command. Exceeding it aborts the
    /// command with a configuration error (usually an unguarded loop in the graph).
    pub max_operations_per_command: usize,
    /// How often the worker loop polls the scheduler for due timers.
    pub job_poll_interval_ms: u64,
    /// Maximum number of due jobs fetched per poll.
    pub job_batch_size: usize,
    /// Key namespace used by the Redis backends.
    pub key_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations_per_command: 100_000,
            job_poll_interval_ms: 500,
            job_batch_size: 64,
            key_prefix: "flowtree".to_string(),
        }
    }
}

pub fn load_config_from_yaml(file_path: &str) -> Result<EngineConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path))?;

    let config: EngineConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path))?;

    Ok(config)
}
