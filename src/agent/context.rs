//! Context builder: system prompt and replayable history

use std::collections::HashSet;

use crate::session::{CanonicalContent, ContentBlock, Role, Turn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous agent with a persistent cryptographic identity. \
You can inspect your identity and balance, sign messages, encrypt and decrypt data, and send payments \
using the provided tools. Signing and payments are irreversible: only perform them when the user clearly \
asks for them. Every action you take is recorded in a tamper-evident audit log.";

/// Builds the system prompt and the message list sent to the provider.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    system_prompt: String,
    identity_key: Option<String>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            identity_key: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// Mention the agent's public key in the system prompt.
    pub fn with_identity(mut self, public_key: &str) -> Self {
        self.identity_key = Some(public_key.to_string());
        self
    }

    pub fn build_system_prompt(&self) -> String {
        match self.identity_key {
            Some(ref key) => format!("{}\n\nYour identity public key: {}", self.system_prompt, key),
            None => self.system_prompt.clone(),
        }
    }

    /// Assemble history plus the new user turn.
    ///
    /// Trimming can cut an assistant turn away from the results that answer
    /// it, and an interrupted run can leave invocations without results.
    /// Both are rewritten as text so providers that check id pairing accept
    /// the history.
    pub fn build_messages(&self, history: Vec<Turn>, user_turn: Turn) -> Vec<Turn> {
        let mut messages = repair_tool_pairing(history);
        messages.push(user_turn);
        messages
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite tool-result blocks whose invocation is not in the immediately
/// preceding assistant turn, and tool-invocation blocks that the next turn
/// does not answer.
pub fn repair_tool_pairing(turns: Vec<Turn>) -> Vec<Turn> {
    let mut repaired: Vec<Turn> = Vec::with_capacity(turns.len());
    for mut turn in turns {
        if turn.role == Role::User && turn.is_tool_result() {
            let issued: HashSet<String> = repaired
                .last()
                .filter(|prev| prev.role == Role::Assistant)
                .map(|prev| prev.invocation_ids().into_iter().map(str::to_string).collect())
                .unwrap_or_default();

            if let CanonicalContent::Blocks(ref mut blocks) = turn.content {
                for block in blocks.iter_mut() {
                    let orphaned = match block {
                        ContentBlock::ToolResult {
                            invocation_id,
                            content,
                            ..
                        } if !issued.contains(invocation_id.as_str()) => {
                            Some(format!("[earlier tool result] {}", content))
                        }
                        _ => None,
                    };
                    if let Some(text) = orphaned {
                        *block = ContentBlock::text(text);
                    }
                }
            }
        }
        repaired.push(turn);
    }

    let answered: Vec<HashSet<String>> = (0..repaired.len())
        .map(|i| {
            repaired
                .get(i + 1)
                .filter(|next| next.role == Role::User)
                .map(|next| next.result_ids().into_iter().map(str::to_string).collect())
                .unwrap_or_default()
        })
        .collect();
    for (turn, answered) in repaired.iter_mut().zip(answered) {
        if turn.role != Role::Assistant {
            continue;
        }
        if let CanonicalContent::Blocks(ref mut blocks) = turn.content {
            for block in blocks.iter_mut() {
                let dangling = match block {
                    ContentBlock::ToolInvocation { id, name, .. }
                        if !answered.contains(id.as_str()) =>
                    {
                        Some(format!("[unanswered tool call] {}", name))
                    }
                    _ => None,
                };
                if let Some(text) = dangling {
                    *block = ContentBlock::text(text);
                }
            }
        }
    }
    repaired
}
