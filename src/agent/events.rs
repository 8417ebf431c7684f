//! Progress events emitted by the agent loop
//!
//! Callers that stream progress to a channel pass an [`EventSink`] to
//! [`AgentLoop::run_with_events`](super::AgentLoop::run_with_events). Events
//! are delivered one at a time and a failing sink never affects the run.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::error::{AgidError, Result};

use super::RunOutcome;

/// Lifecycle event of one run.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// About to call the provider.
    Thinking { iteration: u32 },
    ToolStarted { invocation_id: String, name: String },
    ToolFinished {
        invocation_id: String,
        name: String,
        is_error: bool,
        elapsed_ms: u64,
    },
    Completed { iterations: u32, outcome: RunOutcome },
}

/// Receiver of progress events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: AgentEvent) -> Result<()>;
}

/// Forwards events into an unbounded channel.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn on_event(&self, event: AgentEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| AgidError::Provider("Event receiver dropped".into()))
    }
}

/// Serializes delivery to an optional sink and swallows its errors.
pub(crate) struct EventEmitter {
    sink: Option<Arc<dyn EventSink>>,
    gate: Mutex<()>,
}

impl EventEmitter {
    pub(crate) fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            sink,
            gate: Mutex::new(()),
        }
    }

    pub(crate) fn none() -> Self {
        Self::new(None)
    }

    pub(crate) async fn emit(&self, event: AgentEvent) {
        let Some(ref sink) = self.sink else {
            return;
        };
        let _gate = self.gate.lock().await;
        if let Err(e) = sink.on_event(event).await {
            warn!(error = %e, "Event sink failed; continuing run");
        }
    }
}
