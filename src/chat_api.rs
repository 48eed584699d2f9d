//! OpenAI-compatible chat-completions adapter.
//!
//! One concrete LLM backend speaking the widely cloned
//! `POST {base_url}/chat/completions` wire format. Connection pooling,
//! keep-alive and compressed responses are configured once per adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{BackendAdapter, Capabilities, TranslateRequest, TranslateResponse};
use crate::error::{Result, TranslateError};

/// Adapter configuration with serde defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatApiConfig {
    /// Registry name for this adapter instance (e.g. "openai", "ollama")
    pub name: String,

    /// API root, e.g. "https://api.openai.com/v1"
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Model used when the request does not carry one
    pub default_model: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Advertised request text limit in runes
    #[serde(default)]
    pub max_text_len: Option<usize>,
}

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

/// Chat-style LLM backend
pub struct ChatApiBackend {
    config: ChatApiConfig,
    client: reqwest::Client,
}

impl ChatApiBackend {
    pub fn new(config: ChatApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| {
                TranslateError::config(format!("failed to build HTTP client: {e}")).with_source(e)
            })?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl BackendAdapter for ChatApiBackend {
    async fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.text,
        });

        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.config.default_model);
        let body = ChatCompletionRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = self.config.api_key.as_deref() {
            http = http.bearer_auth(key);
        }
        let response = http.send().await?;

        let status = response.status();
        if !status.is_success() {
            // Extract Retry-After for 429 responses
            let retry_after_secs = if status.as_u16() == 429 {
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
            } else {
                None
            };
            return Err(TranslateError::from_status_with_retry_after(
                status,
                retry_after_secs,
            ));
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TranslateError::llm("empty choices in chat response"))?;
        if choice.message.content.is_empty() {
            return Err(TranslateError::llm("empty response content"));
        }

        Ok(TranslateResponse {
            text: choice.message.content,
            tokens_in: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            tokens_out: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
            model: parsed.model,
            finish_reason: choice.finish_reason,
            id: parsed.id,
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_steps(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_text_len: self.config.max_text_len,
            requests_per_minute: None,
            supports_batching: true,
            requires_credentials: self.config.api_key.is_some(),
        }
    }
}
