//! Agent loop implementation
//!
//! This module provides the core agent loop that processes messages,
//! calls LLM providers, executes tools and records every action in the
//! anchor chain.
//!
//! ```text
//! BUILD_CONTEXT -> AWAIT_PROVIDER -> DONE
//!                       |   ^
//!                       v   |
//!                  DISPATCH_TOOLS        (or MAX_ITERATIONS / EMPTY_RESPONSE)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::anchor::{AnchorChain, AnchorKind, Checkpointer};
use crate::config::Config;
use crate::error::{AgidError, Result};
use crate::providers::{ChatRequest, LLMProvider, ToolInvocation, ToolResultPayload};
use crate::session::{CanonicalContent, SessionManager, Turn};
use crate::signing::{SigningSerializer, Wallet};
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};

use super::context::ContextBuilder;
use super::events::{AgentEvent, EventEmitter, EventSink};
use super::usage::UsageAccumulator;

/// Returned to the user when a run fails.
pub const FALLBACK_APOLOGY: &str =
    "I'm sorry, something went wrong while handling your request. Please try again.";

/// Used when the provider answers with neither text nor tool calls.
pub const EMPTY_RESPONSE_FALLBACK: &str =
    "I wasn't able to produce a response this time. Could you rephrase your request?";

/// Protocol label for signed responses.
pub const RESPONSE_PROTOCOL: &str = "agent response";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The provider signalled completion.
    Completed,
    /// The iteration cap was hit; the response reports partial progress.
    MaxIterations,
    /// The provider returned neither completion nor tool calls.
    EmptyResponse,
}

/// One tool call made during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedToolCall {
    pub invocation_id: String,
    pub name: String,
    pub input: Value,
    pub output: ToolOutput,
    /// Ran under the signing serializer
    pub exclusive: bool,
    pub elapsed_ms: u64,
    /// Anchor entry recording this call
    pub anchor_sequence: u64,
}

/// Result of one `run()`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub response_text: String,
    /// Every tool call, in provider order within each iteration
    pub tool_calls: Vec<ExecutedToolCall>,
    pub usage: UsageAccumulator,
    /// Provider calls made
    pub iterations: u32,
    pub outcome: RunOutcome,
    /// Hex signature over `response_text` when response signing is enabled
    pub signature: Option<String>,
}

/// The main agent loop.
///
/// The `AgentLoop` is responsible for:
/// - Loading and trimming session history, persisting the inbound turn
/// - Calling the LLM provider until it signals completion
/// - Running read-only tool calls concurrently and exclusive-signing tool
///   calls one at a time under the signing serializer
/// - Appending one anchor entry per inbound message, tool call and response
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use agidentity::agent::AgentLoop;
/// use agidentity::anchor::AnchorChain;
/// use agidentity::config::Config;
/// use agidentity::session::SessionManager;
/// use agidentity::tools::ToolRegistry;
///
/// let agent = AgentLoop::new(
///     Config::default(),
///     SessionManager::new_memory(),
///     Arc::new(my_provider),
///     ToolRegistry::new(),
///     Arc::new(AnchorChain::new()),
/// );
/// let reply = agent.respond("telegram:chat1", "What is my balance?").await;
/// ```
pub struct AgentLoop {
    /// Agent configuration
    config: Config,
    /// Session manager for conversation state
    session_manager: Arc<SessionManager>,
    /// The LLM provider
    provider: Arc<dyn LLMProvider>,
    /// Tools, fixed at construction
    tools: Arc<ToolRegistry>,
    /// Audit chain shared by all sessions of this identity
    anchors: Arc<AnchorChain>,
    /// Guards every call into the signing resource
    signing: SigningSerializer,
    /// Wallet used for response signing
    wallet: Option<Arc<dyn Wallet>>,
    checkpointer: Option<Arc<Checkpointer>>,
    /// Context builder for system prompt and history
    context_builder: ContextBuilder,
    /// Per-session locks to serialize concurrent messages for the same session
    session_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AgentLoop {
    /// Create a new agent loop using the process-wide signing serializer.
    pub fn new(
        config: Config,
        session_manager: SessionManager,
        provider: Arc<dyn LLMProvider>,
        tools: ToolRegistry,
        anchors: Arc<AnchorChain>,
    ) -> Self {
        let mut context_builder = ContextBuilder::new();
        if let Some(ref prompt) = config.agents.defaults.system_prompt {
            context_builder = context_builder.with_system_prompt(prompt);
        }
        let session_manager = session_manager.configured(&config);
        Self {
            config,
            session_manager: Arc::new(session_manager),
            provider,
            tools: Arc::new(tools),
            anchors,
            signing: SigningSerializer::global(),
            wallet: None,
            checkpointer: None,
            context_builder,
            session_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use a specific signing serializer instead of the global one.
    pub fn with_signing(mut self, signing: SigningSerializer) -> Self {
        self.signing = signing;
        self
    }

    /// Attach the wallet used for response signing.
    pub fn with_wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    /// Commit anchor checkpoints at the end of runs.
    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = Some(Arc::new(checkpointer));
        self
    }

    pub fn with_context_builder(mut self, context_builder: ContextBuilder) -> Self {
        self.context_builder = context_builder;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn anchors(&self) -> Arc<AnchorChain> {
        Arc::clone(&self.anchors)
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.session_manager)
    }

    pub fn signing(&self) -> &SigningSerializer {
        &self.signing
    }

    /// Handle one inbound message and always produce a reply string.
    ///
    /// Errors are logged and replaced by [`FALLBACK_APOLOGY`].
    pub async fn respond(&self, session_key: &str, text: &str) -> String {
        match self.run(session_key, text, &CancellationToken::new()).await {
            Ok(result) => result.response_text,
            Err(e) => {
                error!(session = %session_key, error = %e, "Agent run failed");
                FALLBACK_APOLOGY.to_string()
            }
        }
    }

    /// Process a single inbound message.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The provider call fails
    /// - Session or anchor storage fails
    /// - `cancel` fires (`AgidError::Cancelled`)
    ///
    /// Tool failures are not errors; they are fed back to the provider.
    pub async fn run(
        &self,
        session_key: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        self.run_inner(session_key, text, cancel, EventEmitter::none())
            .instrument(info_span!("agent_run", session = %session_key))
            .await
    }

    /// Same as [`run`](Self::run), reporting progress to `sink`.
    pub async fn run_with_events(
        &self,
        session_key: &str,
        text: &str,
        cancel: &CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<RunResult> {
        self.run_inner(session_key, text, cancel, EventEmitter::new(Some(sink)))
            .instrument(info_span!("agent_run", session = %session_key, events = true))
            .await
    }

    async fn run_inner(
        &self,
        session_key: &str,
        text: &str,
        cancel: &CancellationToken,
        events: EventEmitter,
    ) -> Result<RunResult> {
        // Acquire a per-session lock to serialize concurrent messages for the
        // same session key. Different sessions can still proceed concurrently.
        let session_lock = {
            let mut locks = self.session_locks.lock().await;
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _session_guard = session_lock.lock().await;

        // BUILD_CONTEXT: the inbound turn is persisted before any provider call.
        let history = self.session_manager.get_messages(session_key).await?;
        let user_turn = Turn::user(text);
        self.session_manager
            .add_turn(session_key, user_turn.clone())
            .await?;
        self.anchors
            .add_anchor(
                AnchorKind::MessageReceived,
                format!("message received ({} chars)", text.chars().count()),
                text.as_bytes(),
            )
            .await?;

        let mut messages = self.context_builder.build_messages(history, user_turn);
        let system_prompt = self.context_builder.build_system_prompt();
        let tool_declarations = self.tools.declarations();
        let defaults = &self.config.agents.defaults;
        let max_iterations = defaults.max_tool_iterations;

        let mut usage = UsageAccumulator::new();
        let mut executed: Vec<ExecutedToolCall> = Vec::new();
        let mut iterations: u32 = 0;
        let mut last_text = String::new();

        let (response_text, outcome) = loop {
            if iterations >= max_iterations {
                info!(
                    iterations,
                    tool_calls = executed.len(),
                    "Tool loop reached maximum iterations, returning partial response"
                );
                let partial = partial_progress_text(max_iterations, &executed, &last_text);
                self.session_manager
                    .add_turn(session_key, Turn::assistant(partial.as_str()))
                    .await?;
                break (partial, RunOutcome::MaxIterations);
            }
            iterations += 1;
            debug!("Provider iteration {} of {}", iterations, max_iterations);

            // AWAIT_PROVIDER
            events.emit(AgentEvent::Thinking { iteration: iterations }).await;
            let request = ChatRequest {
                model: defaults.model.clone(),
                max_tokens: defaults.max_tokens,
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: tool_declarations.clone(),
            };
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(iteration = iterations, "Run cancelled while waiting for provider");
                    return Err(AgidError::Cancelled);
                }
                response = self.provider.chat(request) => response?,
            };
            usage.record(&response.usage);

            if response.done {
                // Skipped invocations are not stored; they would never get a result.
                let content = if response.has_tool_calls() {
                    warn!(
                        ignored = response.tool_calls.len(),
                        "Provider signalled completion alongside tool calls; not executing them"
                    );
                    CanonicalContent::Text(response.text.clone())
                } else {
                    response.assistant_content()
                };
                self.session_manager
                    .add_turn(session_key, Turn::assistant(content))
                    .await?;
                break (response.text, RunOutcome::Completed);
            }

            if !response.has_tool_calls() {
                warn!(iteration = iterations, "Provider returned neither completion nor tool calls");
                let fallback = if response.text.trim().is_empty() {
                    EMPTY_RESPONSE_FALLBACK.to_string()
                } else {
                    response.text
                };
                self.session_manager
                    .add_turn(session_key, Turn::assistant(fallback.as_str()))
                    .await?;
                break (fallback, RunOutcome::EmptyResponse);
            }

            // DISPATCH_TOOLS
            if !response.text.trim().is_empty() {
                last_text = response.text.clone();
            }
            let assistant_turn = Turn::assistant(response.assistant_content());
            self.session_manager
                .add_turn(session_key, assistant_turn.clone())
                .await?;
            messages.push(assistant_turn.clone());

            let ctx = ToolContext::new().with_session(session_key);
            let completed = self
                .dispatch_tools(&response.tool_calls, &ctx, &events, cancel)
                .await?;

            if cancel.is_cancelled() {
                // Close out the invocations so the session stays replayable.
                let results = cancelled_results(&response.tool_calls, &completed);
                let result_turn = self.provider.build_tool_result_message(&results);
                self.session_manager.add_turn(session_key, result_turn).await?;
                info!(iteration = iterations, "Run cancelled during tool dispatch");
                return Err(AgidError::Cancelled);
            }

            let calls: Vec<ExecutedToolCall> = completed.into_iter().flatten().collect();
            let results: Vec<ToolResultPayload> = calls
                .iter()
                .map(|c| ToolResultPayload {
                    invocation_id: c.invocation_id.clone(),
                    content: c.output.content.clone(),
                    is_error: c.output.is_error,
                })
                .collect();
            let result_turn = self.provider.build_tool_result_message(&results);
            check_tool_pairing(&assistant_turn, &result_turn)?;
            self.session_manager
                .add_turn(session_key, result_turn.clone())
                .await?;
            messages.push(result_turn);
            executed.extend(calls);
        };

        let signature = self.sign_response(&response_text).await?;

        self.anchors
            .add_anchor(
                AnchorKind::MessageSent,
                format!("message sent ({} chars)", response_text.chars().count()),
                response_text.as_bytes(),
            )
            .await?;

        if let Some(ref checkpointer) = self.checkpointer {
            if let Err(e) = checkpointer.maybe_checkpoint(&self.anchors).await {
                warn!(error = %e, "Anchor checkpoint failed");
            }
        }

        events
            .emit(AgentEvent::Completed {
                iterations,
                outcome,
            })
            .await;

        info!(
            iterations,
            tool_calls = executed.len(),
            total_tokens = usage.total_tokens,
            outcome = ?outcome,
            "Agent run finished"
        );

        Ok(RunResult {
            response_text,
            tool_calls: executed,
            usage,
            iterations,
            outcome,
            signature,
        })
    }

    /// Run one batch of tool calls.
    ///
    /// Read-only calls fan out concurrently. Exclusive-signing calls run one
    /// after another, each holding the signing lock only for its own
    /// execution. Both partitions proceed side by side. Returns one slot per
    /// call in provider order; a slot is `None` when `cancel` fired before
    /// that call finished.
    async fn dispatch_tools(
        &self,
        calls: &[ToolInvocation],
        ctx: &ToolContext,
        events: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<ExecutedToolCall>>> {
        let (exclusive, read_only): (Vec<_>, Vec<_>) = calls
            .iter()
            .enumerate()
            .partition(|(_, call)| self.tools.requires_exclusive_signing(&call.name));
        debug!(
            read_only = read_only.len(),
            exclusive = exclusive.len(),
            "Dispatching tool calls"
        );

        let read_only_batch = futures::future::try_join_all(read_only.into_iter().map(
            |(index, call)| async move {
                let executed = self.execute_call(call, ctx, events, false, cancel).await?;
                Ok::<_, AgidError>((index, executed))
            },
        ));

        let exclusive_batch = async {
            let mut finished = Vec::with_capacity(exclusive.len());
            for (index, call) in exclusive {
                if cancel.is_cancelled() {
                    break;
                }
                let executed = self.execute_call(call, ctx, events, true, cancel).await?;
                finished.push((index, executed));
            }
            Ok::<_, AgidError>(finished)
        };

        let (read_only_done, exclusive_done) = tokio::try_join!(read_only_batch, exclusive_batch)?;
        let mut slots = vec![None; calls.len()];
        for (index, executed) in read_only_done.into_iter().chain(exclusive_done) {
            slots[index] = executed;
        }
        Ok(slots)
    }

    /// Execute one call and append its anchor entry.
    ///
    /// Only the tool execution itself races `cancel`. Once a tool has
    /// returned, its anchor and result are always recorded, so a finished
    /// payment or signature is never reported as cancelled.
    async fn execute_call(
        &self,
        call: &ToolInvocation,
        ctx: &ToolContext,
        events: &EventEmitter,
        exclusive: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<ExecutedToolCall>> {
        events
            .emit(AgentEvent::ToolStarted {
                invocation_id: call.id.clone(),
                name: call.name.clone(),
            })
            .await;

        let ctx = ctx.clone().with_invocation(&call.id);
        let start = Instant::now();
        let execution = async {
            if exclusive {
                self.signing
                    .run(&call.name, self.tools.execute(&call.name, call.input.clone(), &ctx))
                    .await
            } else {
                self.tools
                    .execute(&call.name, call.input.clone(), &ctx)
                    .await
            }
        };
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(tool = %call.name, invocation = %call.id, "Tool call cancelled");
                return Ok(None);
            }
            output = execution => output,
        };
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = json!({
            "invocation_id": call.id,
            "tool": call.name,
            "input": call.input,
            "output": output.content,
            "is_error": output.is_error,
        });
        let entry = self
            .anchors
            .add_anchor(
                self.tools.anchor_kind(&call.name),
                format!(
                    "{} {}",
                    call.name,
                    if output.is_error { "failed" } else { "succeeded" }
                ),
                record.to_string().as_bytes(),
            )
            .await?;

        let executed = ExecutedToolCall {
            invocation_id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
            output,
            exclusive,
            elapsed_ms,
            anchor_sequence: entry.sequence_number,
        };

        events
            .emit(AgentEvent::ToolFinished {
                invocation_id: executed.invocation_id.clone(),
                name: executed.name.clone(),
                is_error: executed.output.is_error,
                elapsed_ms,
            })
            .await;

        Ok(Some(executed))
    }

    async fn sign_response(&self, text: &str) -> Result<Option<String>> {
        if !self.config.agents.defaults.sign_responses {
            return Ok(None);
        }
        let Some(ref wallet) = self.wallet else {
            warn!("Response signing enabled but no wallet attached");
            return Ok(None);
        };
        let signature = self
            .signing
            .run("sign_response", wallet.sign(text.as_bytes(), RESPONSE_PROTOCOL))
            .await?;
        Ok(Some(signature))
    }
}

/// Every tool result must answer an invocation of the preceding assistant turn.
pub fn check_tool_pairing(assistant_turn: &Turn, result_turn: &Turn) -> Result<()> {
    let issued = assistant_turn.invocation_ids();
    for id in result_turn.result_ids() {
        if !issued.contains(&id) {
            return Err(AgidError::Session(format!(
                "Tool result '{}' has no matching invocation in the preceding assistant turn",
                id
            )));
        }
    }
    Ok(())
}

fn cancelled_results(
    calls: &[ToolInvocation],
    completed: &[Option<ExecutedToolCall>],
) -> Vec<ToolResultPayload> {
    calls
        .iter()
        .zip(completed)
        .map(|(call, done)| match done {
            Some(executed) => ToolResultPayload {
                invocation_id: call.id.clone(),
                content: executed.output.content.clone(),
                is_error: executed.output.is_error,
            },
            None => ToolResultPayload {
                invocation_id: call.id.clone(),
                content: "Cancelled before completion".to_string(),
                is_error: true,
            },
        })
        .collect()
}

fn partial_progress_text(max_iterations: u32, executed: &[ExecutedToolCall], last_text: &str) -> String {
    let mut text = format!(
        "I reached my limit of {} steps before finishing. So far I made {} tool call(s)",
        max_iterations,
        executed.len()
    );
    if !executed.is_empty() {
        let names: Vec<&str> = executed.iter().map(|c| c.name.as_str()).collect();
        text.push_str(&format!(": {}", names.join(", ")));
    }
    text.push('.');
    if !last_text.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(last_text.trim());
    }
    text
}
