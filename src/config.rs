//! Configuration for AGIdentity
//!
//! Configuration is a JSON document with every field optional. Missing
//! sections fall back to their defaults, so an empty `{}` is a valid config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgidError, Result};

/// Default model name sent to the provider.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
/// Default approximate token budget for replayed session history.
pub const DEFAULT_TOKEN_BUDGET: usize = 100_000;
/// Characters per estimated token.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub session: SessionConfig,
    pub anchor: AnchorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

/// Per-agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentDefaults {
    /// Model identifier passed through to the provider
    pub model: String,
    /// Max output tokens per provider call
    pub max_tokens: u32,
    /// Provider calls allowed per run before returning partial progress
    pub max_tool_iterations: u32,
    /// Sign the final response text with the attached wallet
    pub sign_responses: bool,
    /// Replaces the built-in system prompt when set
    pub system_prompt: Option<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            max_tool_iterations: 10,
            sign_responses: false,
            system_prompt: None,
        }
    }
}

/// Session history replay settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub token_budget: usize,
    pub chars_per_token: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnchorConfig {
    /// Entries appended between two checkpoints
    pub checkpoint_interval: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Base directory for configuration and on-disk state (`~/.agidentity`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agidentity")
    }

    /// Path of the default config file.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load the default config file, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate a config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| AgidError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.agents.defaults.max_tool_iterations == 0 {
            return Err(AgidError::Config(
                "agents.defaults.max_tool_iterations must be at least 1".into(),
            ));
        }
        if self.session.chars_per_token == 0 {
            return Err(AgidError::Config(
                "session.chars_per_token must be at least 1".into(),
            ));
        }
        if self.session.token_budget == 0 {
            return Err(AgidError::Config(
                "session.token_budget must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
