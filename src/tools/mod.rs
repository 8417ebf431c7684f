//! Tools module - Callable capabilities exposed to the LLM
//!
//! Each tool declares its interface (name, description, JSON-schema
//! parameters) and whether it needs exclusive access to the signing
//! resource. The [`ToolRegistry`] is filled once at startup and never throws
//! on execution: tool errors and panics become [`ToolOutput`] values with
//! `is_error` set.

pub mod wallet;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::anchor::AnchorKind;
use crate::error::Result;

pub use wallet::register_wallet_tools;

/// Execution context handed to every tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Session key of the conversation that issued the call
    pub session_key: Option<String>,
    /// Provider-assigned invocation id
    pub invocation_id: Option<String>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_key: &str) -> Self {
        self.session_key = Some(session_key.to_string());
        self
    }

    pub fn with_invocation(mut self, invocation_id: &str) -> Self {
        self.invocation_id = Some(invocation_id.to_string());
        self
    }
}

/// Outcome of one tool call as seen by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Interface declaration sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A callable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted input.
    fn parameters(&self) -> Value;

    /// Whether execution must hold the signing serializer's lock.
    fn requires_exclusive_signing(&self) -> bool {
        false
    }

    /// Anchor entry type recorded for each invocation.
    fn anchor_kind(&self) -> AnchorKind {
        AnchorKind::ToolUse
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// Name-keyed set of tools, resolved once at composition time.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!(tool = %name, "Replacing previously registered tool");
        } else {
            debug!(tool = %name, "Registering tool");
        }
        self.tools.insert(name, Arc::from(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declarations for the provider, sorted by name.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> = self
            .tools
            .values()
            .map(|tool| ToolDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters(),
            })
            .collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// Unknown names are treated as read-only.
    pub fn requires_exclusive_signing(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|tool| tool.requires_exclusive_signing())
            .unwrap_or(false)
    }

    /// Unknown names are recorded as plain tool use.
    pub fn anchor_kind(&self, name: &str) -> AnchorKind {
        self.tools
            .get(name)
            .map(|tool| tool.anchor_kind())
            .unwrap_or(AnchorKind::ToolUse)
    }

    /// Execute a tool by name. Never fails: errors, panics and unknown names
    /// come back as `ToolOutput { is_error: true, .. }`.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            warn!(tool = %name, "Unknown tool requested");
            return ToolOutput::error(format!("Unknown tool: {}", name));
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind().await;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Ok(content)) => {
                debug!(tool = %name, latency_ms, "Tool executed successfully");
                ToolOutput::success(content)
            }
            Ok(Err(e)) => {
                error!(tool = %name, latency_ms, error = %e, "Tool execution failed");
                ToolOutput::error(format!("Error: {}", e))
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(tool = %name, latency_ms, reason = %reason, "Tool panicked");
                ToolOutput::error(format!("Error: tool '{}' panicked: {}", name, reason))
            }
        }
    }
}
