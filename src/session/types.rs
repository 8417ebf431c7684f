//! Session types: canonical turns and their content blocks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current on-disk turn format. Older lines are upgraded by `normalize`.
pub const FORMAT_VERSION: u32 = 2;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of structured turn content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolInvocation {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        invocation_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_invocation(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolInvocation {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(
        invocation_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ContentBlock::ToolResult {
            invocation_id: invocation_id.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Rough character length used for token estimation.
    pub fn char_len(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.chars().count(),
            ContentBlock::ToolInvocation { id, name, input } => {
                id.len() + name.len() + input.to_string().chars().count()
            }
            ContentBlock::ToolResult {
                invocation_id,
                content,
                ..
            } => invocation_id.len() + content.chars().count(),
        }
    }
}

/// Turn content: either plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl CanonicalContent {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        match self {
            CanonicalContent::Text(text) => text.clone(),
            CanonicalContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            CanonicalContent::Text(_) => &[],
            CanonicalContent::Blocks(blocks) => blocks,
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            CanonicalContent::Text(text) => text.chars().count(),
            CanonicalContent::Blocks(blocks) => blocks.iter().map(ContentBlock::char_len).sum(),
        }
    }
}

impl From<&str> for CanonicalContent {
    fn from(text: &str) -> Self {
        CanonicalContent::Text(text.to_string())
    }
}

impl From<String> for CanonicalContent {
    fn from(text: String) -> Self {
        CanonicalContent::Text(text)
    }
}

impl From<Vec<ContentBlock>> for CanonicalContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        CanonicalContent::Blocks(blocks)
    }
}

/// A single immutable message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: CanonicalContent,
    pub timestamp: DateTime<Utc>,
    pub format_version: u32,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<CanonicalContent>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            format_version: FORMAT_VERSION,
        }
    }

    /// Create a user turn.
    pub fn user(content: impl Into<CanonicalContent>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<CanonicalContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Ids of every tool invocation block in this turn, in order.
    pub fn invocation_ids(&self) -> Vec<&str> {
        self.content
            .blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolInvocation { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Invocation ids referenced by tool result blocks in this turn, in order.
    pub fn result_ids(&self) -> Vec<&str> {
        self.content
            .blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { invocation_id, .. } => Some(invocation_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_invocations(&self) -> bool {
        !self.invocation_ids().is_empty()
    }

    pub fn is_tool_result(&self) -> bool {
        !self.result_ids().is_empty()
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// A conversation: an append-only ordered list of turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique id assigned on creation
    pub session_id: String,
    /// Identity-derived key the session is looked up by
    pub key: String,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            turns: Vec::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Append a turn and bump the activity timestamp.
    pub fn push(&mut self, turn: Turn) {
        self.last_activity_at = Utc::now();
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_constructors() {
        let user = Turn::user("Hello");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.text(), "Hello");
        assert_eq!(user.format_version, FORMAT_VERSION);

        let assistant = Turn::assistant(vec![
            ContentBlock::text("Checking."),
            ContentBlock::tool_invocation("call_1", "check_balance", json!({})),
        ]);
        assert_eq!(assistant.role, Role::Assistant);
        assert!(assistant.has_tool_invocations());
        assert_eq!(assistant.invocation_ids(), vec!["call_1"]);
        assert_eq!(assistant.text(), "Checking.");
    }

    #[test]
    fn test_tool_result_turn() {
        let turn = Turn::user(vec![
            ContentBlock::tool_result("call_1", "42 sats", false),
            ContentBlock::tool_result("call_2", "boom", true),
        ]);
        assert!(turn.is_tool_result());
        assert_eq!(turn.result_ids(), vec!["call_1", "call_2"]);
        assert!(!turn.has_tool_invocations());
    }

    #[test]
    fn test_block_serialization_shape() {
        let block = ContentBlock::tool_result("call_9", "ok", false);
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["invocation_id"], "call_9");
        assert_eq!(value["is_error"], false);
    }

    #[test]
    fn test_char_len() {
        let content = CanonicalContent::Text("abcd".into());
        assert_eq!(content.char_len(), 4);

        let blocks = CanonicalContent::Blocks(vec![
            ContentBlock::text("ab"),
            ContentBlock::tool_result("id", "xyz", false),
        ]);
        assert_eq!(blocks.char_len(), 2 + 2 + 3);
    }

    #[test]
    fn test_session_push() {
        let mut session = Session::new("telegram:chat1");
        assert!(session.is_empty());
        session.push(Turn::user("hi"));
        assert_eq!(session.len(), 1);
        assert!(session.last_activity_at >= session.created_at);
        assert!(!session.session_id.is_empty());
    }
}
