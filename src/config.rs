//! Relay configuration parser
//!
//! Parses `relay.toml` into the agent, permission, and loop settings.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::acp::models::{AdapterConfig, PermissionMode};

/// Agent subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Executable to spawn (resolved on PATH)
    pub command: String,
    /// Arguments passed to the agent
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-turn timeout in seconds (default: 300)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
            args: vec!["--experimental-acp".to_string()],
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Permission policy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionConfig {
    /// Decision mode for agent tool-use requests
    #[serde(default)]
    pub mode: PermissionMode,
    /// Patterns consulted in `allowlist` mode
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// Orchestration loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopConfig {
    /// File whose contents become the prompt each iteration
    #[serde(default = "default_prompt_file")]
    pub prompt_file: String,
    /// Hard cap on iterations (default: 100)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Marker in agent output that means the task is done
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
    /// Stop after this many consecutive failed turns (default: 3)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_prompt_file() -> String {
    "PROMPT.md".to_string()
}

const fn default_max_iterations() -> u32 {
    100
}

fn default_completion_marker() -> String {
    "TASK_COMPLETE".to_string()
}

const fn default_max_consecutive_failures() -> u32 {
    3
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            prompt_file: default_prompt_file(),
            max_iterations: default_max_iterations(),
            completion_marker: default_completion_marker(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Top-level Relay configuration parsed from relay.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Agent subprocess settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// Permission policy settings
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// Orchestration loop settings
    #[serde(rename = "loop", default)]
    pub run: LoopConfig,
}

impl RelayConfig {
    /// Parse a relay.toml file from a path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse relay.toml content from a string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse relay.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Build the adapter configuration from the agent and permission
    /// sections.
    #[must_use]
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            agent_command: self.agent.command.clone(),
            agent_args: self.agent.args.clone(),
            timeout: Duration::from_secs(self.agent.timeout_secs),
            permission_mode: self.permissions.mode,
            allowlist: self.permissions.allowlist.clone(),
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.adapter_config().validate()?;
        if self.run.max_iterations == 0 {
            bail!("loop.max_iterations must be at least 1");
        }
        if self.run.completion_marker.trim().is_empty() {
            bail!("loop.completion_marker must not be empty");
        }
        if self.run.max_consecutive_failures == 0 {
            bail!("loop.max_consecutive_failures must be at least 1");
        }
        Ok(())
    }
}
