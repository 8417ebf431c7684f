//! Canonical message normalization
//!
//! Every turn read from storage or handed over by a provider passes through
//! [`normalize`] before anything else touches it. Provider-specific and
//! legacy shapes stop here.
//!
//! Accepted inputs:
//! - canonical turns (returned unchanged)
//! - plain-string content
//! - block arrays using legacy names (`tool_use`, `tool_use_id`, `isError`, ...)
//! - anything else, stringified into a text turn
//!
//! Unrecognized blocks inside an array are dropped.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::types::{CanonicalContent, ContentBlock, Role, Turn, FORMAT_VERSION};

/// Field names that have carried the tool-result correlation id over time.
const RESULT_ID_FIELDS: &[&str] = &["invocation_id", "tool_use_id", "toolUseId", "tool_call_id"];

/// Normalize any JSON value into a canonical turn. Never fails.
pub fn normalize(raw: &Value) -> Turn {
    let Some(obj) = raw.as_object() else {
        return Turn {
            role: Role::User,
            content: CanonicalContent::Text(stringify(raw)),
            timestamp: epoch(),
            format_version: FORMAT_VERSION,
        };
    };

    let role = match obj.get("role").and_then(Value::as_str) {
        Some("assistant") => Role::Assistant,
        _ => Role::User,
    };

    let content = match obj.get("content") {
        None | Some(Value::Null) => CanonicalContent::Text(String::new()),
        Some(Value::String(text)) => CanonicalContent::Text(text.clone()),
        Some(Value::Array(items)) => {
            CanonicalContent::Blocks(items.iter().filter_map(normalize_block).collect())
        }
        Some(other) => CanonicalContent::Text(other.to_string()),
    };

    Turn {
        role,
        content,
        timestamp: obj.get("timestamp").map(parse_timestamp).unwrap_or_else(epoch),
        format_version: FORMAT_VERSION,
    }
}

/// Re-normalize an already typed turn.
pub fn normalize_turn(turn: &Turn) -> Turn {
    match serde_json::to_value(turn) {
        Ok(value) => normalize(&value),
        Err(_) => turn.clone(),
    }
}

/// Normalize one block, or `None` when its shape is not recognized.
pub fn normalize_block(raw: &Value) -> Option<ContentBlock> {
    if let Value::String(text) = raw {
        return Some(ContentBlock::text(text.clone()));
    }
    let obj = raw.as_object()?;

    match obj.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = obj.get("text").and_then(Value::as_str)?;
            Some(ContentBlock::text(text))
        }
        "tool_invocation" | "tool_use" | "tool_call" => {
            let id = obj.get("id").and_then(Value::as_str)?;
            let name = obj.get("name").and_then(Value::as_str)?;
            // `arguments` is the legacy JSON-encoded string form; `input` is taken as-is.
            let input = match (obj.get("input"), obj.get("arguments")) {
                (Some(v), _) => v.clone(),
                (None, Some(Value::String(s))) => {
                    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
                }
                (None, Some(v)) => v.clone(),
                (None, None) => Value::Object(Default::default()),
            };
            Some(ContentBlock::tool_invocation(id, name, input))
        }
        "tool_result" => {
            let invocation_id = RESULT_ID_FIELDS
                .iter()
                .find_map(|field| obj.get(*field).and_then(Value::as_str))?;
            let content = match obj.get("content") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| match normalize_block(p) {
                        Some(ContentBlock::Text { text }) => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Some(other) => other.to_string(),
            };
            let is_error = obj
                .get("is_error")
                .or_else(|| obj.get("isError"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Some(ContentBlock::tool_result(invocation_id, content, is_error))
        }
        _ => None,
    }
}

fn stringify(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_timestamp(raw: &Value) -> DateTime<Utc> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| epoch()),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(epoch),
        _ => epoch(),
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn twice(raw: &Value) -> (Turn, Turn) {
        let once = normalize(raw);
        let again = normalize(&serde_json::to_value(&once).unwrap());
        (once, again)
    }

    #[test]
    fn test_canonical_passthrough() {
        let turn = Turn::assistant(vec![
            ContentBlock::text("Signing now."),
            ContentBlock::tool_invocation("call_1", "sign_message", json!({"message": "hi"})),
        ]);
        assert_eq!(normalize_turn(&turn), turn);
    }

    #[test]
    fn test_plain_string_content() {
        let turn = normalize(&json!({"role": "user", "content": "Hello"}));
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, CanonicalContent::Text("Hello".into()));
        assert_eq!(turn.timestamp, DateTime::<Utc>::default());
    }

    #[test]
    fn test_legacy_tool_result_field() {
        let turn = normalize(&json!({
            "role": "user",
            "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "done"},
                {"type": "tool_result", "toolUseId": "toolu_2", "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}], "isError": true}
            ]
        }));
        assert_eq!(
            turn.content.blocks(),
            &[
                ContentBlock::tool_result("toolu_1", "done", false),
                ContentBlock::tool_result("toolu_2", "a\nb", true),
            ]
        );
    }

    #[test]
    fn test_legacy_tool_use_block() {
        let turn = normalize(&json!({
            "role": "assistant",
            "content": [{"type": "tool_use", "id": "toolu_1", "name": "check_balance", "input": {}}]
        }));
        assert_eq!(turn.invocation_ids(), vec!["toolu_1"]);
    }

    #[test]
    fn test_openai_style_string_arguments() {
        let turn = normalize(&json!({
            "role": "assistant",
            "content": [{"type": "tool_call", "id": "c1", "name": "sign_message", "arguments": "{\"message\":\"x\"}"}]
        }));
        assert_eq!(
            turn.content.blocks()[0],
            ContentBlock::tool_invocation("c1", "sign_message", json!({"message": "x"}))
        );
    }

    #[test]
    fn test_unknown_blocks_dropped() {
        let turn = normalize(&json!({
            "role": "assistant",
            "content": [{"type": "image", "source": "..."}, {"type": "text", "text": "kept"}, 17]
        }));
        assert_eq!(turn.content.blocks(), &[ContentBlock::text("kept")]);
    }

    #[test]
    fn test_fallback_shapes() {
        assert_eq!(normalize(&json!(42)).text(), "42");
        assert_eq!(normalize(&json!("bare")).text(), "bare");
        assert_eq!(normalize(&json!({"role": "user", "content": {"a": 1}})).text(), r#"{"a":1}"#);
        assert_eq!(normalize(&json!({"role": "system"})).role, Role::User);
        assert_eq!(normalize(&Value::Null).text(), "");
    }

    #[test]
    fn test_timestamp_forms() {
        let from_millis = normalize(&json!({"role": "user", "content": "x", "timestamp": 1_700_000_000_000i64}));
        assert_eq!(from_millis.timestamp.timestamp(), 1_700_000_000);

        let from_str = normalize(&json!({"role": "user", "content": "x", "timestamp": "2024-05-01T10:00:00Z"}));
        assert_eq!(from_str.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_idempotence_across_shapes() {
        let inputs = vec![
            json!({"role": "user", "content": "plain"}),
            json!({"role": "assistant", "content": [{"type": "tool_use", "id": "t", "name": "n", "input": {"k": [1, 2]}}]}),
            json!({"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t", "content": null}]}),
            json!({"role": "user", "content": []}),
            json!({"content": 3.5, "timestamp": "garbage"}),
            json!([1, 2, 3]),
            json!(true),
            Value::Null,
        ];
        for input in inputs {
            let (once, again) = twice(&input);
            assert_eq!(once, again, "not idempotent for {}", input);
        }
    }
}
