//! Agent module - tool-execution loop and conversation handling
//!
//! This module provides the agent loop and context building for an agent
//! with a persistent cryptographic identity. The agent is responsible for:
//!
//! - Persisting each inbound message before anything else happens
//! - Building conversation context with system prompt and trimmed history
//! - Calling the LLM provider until it signals completion
//! - Executing tool calls and feeding results back to the LLM
//! - Recording every message and tool call in the anchor chain
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   caller    │────>│  AgentLoop  │────>│ LLMProvider │
//! │ (respond)   │     │             │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │    │    │
//!                       ▼    │    ▼
//!            ┌─────────────┐ │ ┌─────────────┐     ┌─────────────┐
//!            │   Session   │ │ │    Tools    │────>│  Signing    │
//!            │   Manager   │ │ │  Registry   │     │ Serializer  │
//!            └─────────────┘ │ └─────────────┘     └─────────────┘
//!                            ▼
//!                     ┌─────────────┐
//!                     │ AnchorChain │
//!                     └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agidentity::agent::AgentLoop;
//! use agidentity::anchor::AnchorChain;
//! use agidentity::config::Config;
//! use agidentity::session::SessionManager;
//! use agidentity::signing::LocalWallet;
//! use agidentity::tools::{register_wallet_tools, ToolRegistry};
//!
//! async fn run_agent(provider: Arc<dyn agidentity::providers::LLMProvider>) {
//!     let wallet = Arc::new(LocalWallet::generate(10_000).unwrap());
//!     let mut tools = ToolRegistry::new();
//!     register_wallet_tools(&mut tools, wallet.clone());
//!
//!     let agent = AgentLoop::new(
//!         Config::default(),
//!         SessionManager::new().unwrap(),
//!         provider,
//!         tools,
//!         Arc::new(AnchorChain::new()),
//!     )
//!     .with_wallet(wallet);
//!
//!     let reply = agent.respond("telegram:chat1", "Sign 'hello' for me").await;
//!     println!("{}", reply);
//! }
//! ```

mod context;
pub mod events;
mod r#loop;
pub mod usage;

pub use context::{repair_tool_pairing, ContextBuilder};
pub use events::{AgentEvent, ChannelEventSink, EventSink};
pub use r#loop::{
    check_tool_pairing, AgentLoop, ExecutedToolCall, RunOutcome, RunResult,
    EMPTY_RESPONSE_FALLBACK, FALLBACK_APOLOGY, RESPONSE_PROTOCOL,
};
pub use usage::UsageAccumulator;
