//! Chat-completion client abstraction.
//!
//! Defines the [`ChatModel`] trait and two implementations:
//! - **[`DisabledChat`]**: always errors. Used when `llm.provider = "disabled"`;
//!   every caller then takes its template/text fallback path.
//! - **[`OpenAiChat`]**: calls an OpenAI-compatible `POST /chat/completions`
//!   endpoint with retry and backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

/// A single chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Provider-independent completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Ask the provider to return a JSON object (`response_format`).
    pub json_mode: bool,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, `"disabled"` for the no-op provider.
    fn model_name(&self) -> &str;

    /// Runs one completion and returns the assistant message content.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

// ============ Disabled Provider ============

pub struct DisabledChat;

#[async_trait]
impl ChatModel for DisabledChat {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Chat model backed by an OpenAI-compatible API.
///
/// The API key is read from the environment variable named by
/// `llm.api_key_env` at construction time.
pub struct OpenAiChat {
    model: String,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }

    fn request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_completion(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM request failed after retries")))
    }
}

/// Extracts `choices[0].message.content` from a chat-completions response.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid LLM response: missing choices[0].message.content"))
}

/// Creates the chat model named by `llm.provider`.
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChat)),
        "openai" => Ok(Arc::new(OpenAiChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "{\"title\":\"x\"}" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "{\"title\":\"x\"}");
    }

    #[test]
    fn test_parse_completion_missing_content() {
        let json = serde_json::json!({ "choices": [] });
        assert!(parse_completion(&json).is_err());
    }

    #[tokio::test]
    async fn test_disabled_always_errors() {
        let model = create_chat_model(&LlmConfig::default()).unwrap();
        assert_eq!(model.model_name(), "disabled");
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.2,
            json_mode: false,
        };
        assert!(model.complete(&req).await.is_err());
    }

    #[test]
    fn test_json_mode_sets_response_format() {
        let chat = OpenAiChat {
            model: "m".into(),
            base_url: "http://localhost".into(),
            api_key: "k".into(),
            max_retries: 0,
            client: reqwest::Client::new(),
        };
        let req = ChatRequest {
            messages: vec![ChatMessage::system("s"), ChatMessage::user("u")],
            temperature: 0.3,
            json_mode: true,
        };
        let body = chat.request_body(&req);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["role"], "user");
    }
}
