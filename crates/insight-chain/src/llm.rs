//! Prompt-in / text-out boundary to the language model.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
    pub temperature: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub text: String,
    /// Provider-reported usage, when the provider reports it.
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[async_trait]
pub trait CompletionClient: Send + Sync + 'static {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion>;
}

/// Client for OpenAI-compatible `chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let base_url = config
            .api_base
            .clone()
            .filter(|base| !base.trim().is_empty())
            .ok_or_else(|| anyhow!("AI API base URL not configured"))?;
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("AI API key not configured"))?;
        if config.model_name.trim().is_empty() {
            return Err(anyhow!("AI model name not configured"));
        }
        Ok(Self::new(base_url, api_key))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
        let body = ChatRequest {
            model: request.model,
            temperature: request.temperature,
            messages: [ChatMessage {
                role: "user",
                content: request.prompt,
            }],
        };

        let url = self.endpoint();
        debug!(%url, model = request.model, prompt_len = request.prompt.len(), "sending completion request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("completion request to {url} failed"))?
            .error_for_status()
            .context("completion endpoint returned an error status")?;

        let parsed: ChatResponse = response
            .json()
            .await
            .context("completion response was not valid JSON")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("completion response contained no choices"))?;

        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((None, None));

        Ok(Completion {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// Rough token count used when the provider does not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_requires_endpoint_key_and_model() {
        let mut config = LlmConfig::default();
        assert!(OpenAiCompatClient::from_config(&config).is_err());

        config.api_base = Some("https://llm.example/v1/".into());
        config.api_key = Some("k".into());
        assert!(OpenAiCompatClient::from_config(&config).is_err());

        config.model_name = "m".into();
        let client = OpenAiCompatClient::from_config(&config).unwrap();
        assert_eq!(client.endpoint(), "https://llm.example/v1/chat/completions");
    }

    #[test]
    fn token_estimate_is_quarter_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 2);
    }
}
