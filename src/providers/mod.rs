//! Providers module - LLM backend interface
//!
//! The agent loop talks to language models only through [`LLMProvider`].
//! Requests and responses use canonical turns; each provider maps them to its
//! own wire format. HTTP clients for concrete backends live outside this
//! crate. [`ScriptedProvider`] replays canned responses for tests and demos.

mod scripted;

pub use scripted::ScriptedProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::session::{CanonicalContent, ContentBlock, Turn};
use crate::tools::ToolDeclaration;

/// One provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub messages: Vec<Turn>,
    pub tools: Vec<ToolDeclaration>,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Tool outcome correlated to its invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub invocation_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Token counts reported by one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Provider reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    /// The model finished its turn
    pub done: bool,
    /// Provider's own rendering of the assistant turn for history, if it
    /// wants something other than text + invocation blocks
    pub raw_content: Option<CanonicalContent>,
    pub usage: Usage,
}

impl ChatResponse {
    /// Final text answer.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
            ..Default::default()
        }
    }

    /// Tool calls, optionally with leading text.
    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage::new(input_tokens, output_tokens);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Content to persist for the assistant turn.
    pub fn assistant_content(&self) -> CanonicalContent {
        if let Some(ref raw) = self.raw_content {
            return raw.clone();
        }
        if self.tool_calls.is_empty() {
            return CanonicalContent::Text(self.text.clone());
        }
        let mut blocks = Vec::with_capacity(self.tool_calls.len() + 1);
        if !self.text.is_empty() {
            blocks.push(ContentBlock::text(self.text.clone()));
        }
        blocks.extend(
            self.tool_calls
                .iter()
                .map(|tc| ContentBlock::tool_invocation(&tc.id, &tc.name, tc.input.clone())),
        );
        CanonicalContent::Blocks(blocks)
    }
}

/// An LLM backend.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Build the turn that feeds tool results back, preserving `results` order.
    fn build_tool_result_message(&self, results: &[ToolResultPayload]) -> Turn {
        Turn::user(
            results
                .iter()
                .map(|r| ContentBlock::tool_result(&r.invocation_id, &r.content, r.is_error))
                .collect::<Vec<_>>(),
        )
    }
}
