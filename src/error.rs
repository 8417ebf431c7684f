//! Error types for AGIdentity
//!
//! A single crate-wide error enum. Tool failures never surface as `AgidError`
//! from the agent loop; they are converted into tool-result data at the
//! registry boundary. Provider, storage and cancellation errors propagate.

use thiserror::Error;

/// Errors produced by the agent core.
#[derive(Error, Debug)]
pub enum AgidError {
    /// The LLM provider failed (network, parse, or script exhaustion).
    #[error("Provider error: {0}")]
    Provider(String),

    /// A tool rejected its input or failed while executing.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Session store failure or broken turn invariants.
    #[error("Session error: {0}")]
    Session(String),

    /// The signing resource failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// Anchor chain storage failure.
    #[error("Anchor error: {0}")]
    Anchor(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The run was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgidError {
    /// Whether this error represents a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgidError::Cancelled)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgidError>;
