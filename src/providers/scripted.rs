//! Provider that replays a fixed list of responses.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ChatRequest, ChatResponse, LLMProvider};
use crate::error::{AgidError, Result};

/// Returns queued responses in order and records every request.
///
/// Once the queue is empty, further calls fail with a provider error.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatResponse>>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Queue an error after the current responses.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.responses
            .get_mut()
            .push_back(Err(AgidError::Provider(message.to_string())));
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received so far.
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().await.push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(AgidError::Provider("Script exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            max_tokens: 10,
            system_prompt: String::new(),
            messages: vec![],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_replays_in_order_then_fails() {
        let provider = ScriptedProvider::new(vec![ChatResponse::text("one"), ChatResponse::text("two")]);
        assert_eq!(provider.chat(request()).await.unwrap().text, "one");
        assert_eq!(provider.chat(request()).await.unwrap().text, "two");
        assert!(provider.chat(request()).await.is_err());
        assert_eq!(provider.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn test_then_fail() {
        let provider = ScriptedProvider::new(vec![]).then_fail("rate limited");
        let err = provider.chat(request()).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }
}
