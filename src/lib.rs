//! AGIdentity - an LLM agent with a persistent cryptographic identity
//!
//! This crate contains:
//! - **agent**: the tool-execution loop, context builder and progress events
//! - **session**: canonical message format and the per-session JSONL store
//! - **tools**: Tool trait, registry and the built-in wallet tools
//! - **signing**: Wallet trait, the local Ed25519 wallet and the signing serializer
//! - **anchor**: the hash-chained audit log and signed checkpoints
//! - **providers**: LLM provider trait and a scripted provider for tests
//! - **config**, **error**, **logging**: ambient plumbing

pub mod agent;
pub mod anchor;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod session;
pub mod signing;
pub mod tools;

pub use agent::{AgentLoop, RunOutcome, RunResult};
pub use anchor::{AnchorChain, AnchorEntry, AnchorKind};
pub use config::Config;
pub use error::{AgidError, Result};
pub use providers::{ChatRequest, ChatResponse, LLMProvider};
pub use session::{normalize, SessionManager, Turn};
pub use signing::{LocalWallet, SigningSerializer, Wallet};
pub use tools::{Tool, ToolRegistry};
