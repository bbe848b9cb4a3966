use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::service::IsolationLevel;

/// 引擎配置 (Engine Configuration)
/// 所有开关在构造时显式传入，不使用进程级全局状态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Promote access to an undeclared process variable to a fatal error.
    pub strict_variables: bool,
    /// Maximum call stack depth. Exceeding it is fatal (recursion guard).
    pub max_call_depth: usize,
    /// Isolation level for the executable-context query of persistent backends.
    pub isolation: IsolationLevel,
    /// Worker poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum contexts a worker claims per poll. 0 = unbounded.
    pub batch_size: usize,
    /// Default time-to-live of session registry entries, in seconds.
    pub session_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_variables: false,
            max_call_depth: 50,
            isolation: IsolationLevel::Merge,
            poll_interval_ms: 500,
            batch_size: 8,
            session_ttl_secs: 1800,
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
