use async_trait::async_trait;
use kimi_contracts::PayloadMessage;
use kimi_core::{ApiRequest, KimiError, ModelCatalog, MoonshotApi, RemoteFault};
use serde_json::{Value, json};

/// Deterministic stand-in for the Moonshot API. Replies echo the last message.
pub struct MockMoonshotClient {
    failure: Option<RemoteFault>,
}

impl MockMoonshotClient {
    pub fn new() -> Self {
        Self { failure: None }
    }

    /// Every call fails with `fault`.
    pub fn failing(fault: RemoteFault) -> Self {
        Self { failure: Some(fault) }
    }

    fn check(&self) -> Result<(), KimiError> {
        match &self.failure {
            Some(fault) => Err(KimiError::Remote(fault.clone())),
            None => Ok(()),
        }
    }
}

impl Default for MockMoonshotClient {
    fn default() -> Self {
        Self::new()
    }
}

fn message_text(message: &PayloadMessage) -> String {
    match message {
        PayloadMessage::Typed(message) => message.content.to_plain_text(),
        PayloadMessage::Raw(raw) => match raw.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
    }
}

#[async_trait]
impl MoonshotApi for MockMoonshotClient {
    async fn chat_completions(&self, request: ApiRequest<'_>) -> Result<Value, KimiError> {
        self.check()?;
        let payload = request.payload;
        let prompt_tokens: usize =
            payload.messages.iter().map(|m| message_text(m).split_whitespace().count()).sum();
        let last = payload.messages.last().map(message_text).unwrap_or_default();
        if last.trim().is_empty() {
            return Err(KimiError::Remote(
                RemoteFault::new("provider returned empty output").with_status(400),
            ));
        }

        let content = format!("[mock:{}] {}", payload.model, last.trim());
        let completion_tokens = content.split_whitespace().count();
        let mut message = json!({ "role": "assistant", "content": content });
        if payload.model.to_ascii_lowercase().contains("thinking") && payload.thinking.is_none() {
            message["reasoning_content"] = json!("Mock reasoning before the final answer.");
        }

        Ok(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 0,
            "model": payload.model,
            "choices": [{ "index": 0, "message": message, "finish_reason": "stop" }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens
            }
        }))
    }

    async fn list_models(&self, _base_url: &str) -> Result<Value, KimiError> {
        self.check()?;
        let data: Vec<Value> = ModelCatalog::builtin()
            .fallback()
            .iter()
            .map(|model| json!({ "id": model.id, "object": "model", "owned_by": "moonshot" }))
            .collect();
        Ok(json!({ "object": "list", "data": data }))
    }
}
