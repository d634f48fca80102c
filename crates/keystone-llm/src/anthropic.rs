use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use keystone_core::errors::ProviderError;
use keystone_core::provider::{ChunkStream, CompletionOptions, CompletionProvider};
use keystone_core::security::{ApiKey, ProviderType};
use keystone_core::stream::CompletionChunk;
use keystone_core::tokens::TokenUsage;

use crate::models;
use crate::sse::{SseEventParser, SseStream};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anthropic Messages API provider (streaming).
pub struct AnthropicProvider {
    client: Client,
    api_key: ApiKey,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: ApiKey, model: Option<&str>) -> Result<Self, ProviderError> {
        let model = model
            .map(str::to_string)
            .unwrap_or_else(|| models::default_model(ProviderType::Anthropic).name.to_string());
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NetworkError(format!("build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
        })
    }

    /// Point the provider at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

/// Build the Messages API request body for a single-prompt completion.
pub fn build_request_body(prompt: &str, options: &CompletionOptions, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "max_tokens": models::resolve_max_tokens(model, options.max_tokens),
        "messages": [{ "role": "user", "content": prompt }],
    });

    if let Some(system) = &options.system {
        body["system"] = json!(system);
    }

    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }

    body
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, prompt, options), fields(model = %options.model.as_deref().unwrap_or(&self.model), prompt_len = prompt.len()))]
    async fn stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let body = build_request_body(prompt, options, model);

        let resp = self
            .client
            .post(self.messages_url())
            .header("x-api-key", self.api_key.0.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        debug!("anthropic stream opened");
        Ok(Box::pin(SseStream::new(resp.bytes_stream(), AnthropicParser::new())))
    }
}

/// State machine for Anthropic SSE events. Only text blocks are surfaced;
/// thinking and tool blocks are not requested and are ignored if present.
#[derive(Default)]
pub struct AnthropicParser {
    usage: TokenUsage,
    stop_reason: Option<String>,
    done: bool,
}

impl AnthropicParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SseEventParser for AnthropicParser {
    fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<CompletionChunk> {
        let mut chunks = Vec::new();

        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStartEvent>(data) {
                    if let Some(usage) = msg.message.usage {
                        self.usage.prompt_tokens = usage.input_tokens.unwrap_or(0)
                            + usage.cache_read_input_tokens.unwrap_or(0)
                            + usage.cache_creation_input_tokens.unwrap_or(0);
                        self.usage.completion_tokens = usage.output_tokens.unwrap_or(0);
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(data) {
                    if delta.delta.get("type").and_then(Value::as_str) == Some("text_delta") {
                        let text = delta.delta.get("text").and_then(Value::as_str).unwrap_or("");
                        if !text.is_empty() {
                            chunks.push(CompletionChunk::text(text));
                        }
                    }
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    if let Some(usage) = delta.usage {
                        self.usage.completion_tokens = usage.output_tokens.unwrap_or(0);
                    }
                    if let Some(reason) = delta.delta.and_then(|d| d.stop_reason) {
                        self.stop_reason = Some(reason);
                    }
                }
            }

            "message_stop" => {
                self.done = true;
                chunks.push(CompletionChunk::Done {
                    usage: Some(self.usage),
                    finish_reason: self.stop_reason.clone(),
                });
            }

            "error" => {
                self.done = true;
                let error = match serde_json::from_str::<ErrorEvent>(data) {
                    Ok(err) => classify_error(&err),
                    Err(_) => ProviderError::ServerError {
                        status: 500,
                        body: data.to_string(),
                    },
                };
                chunks.push(CompletionChunk::Error { error });
            }

            _ => {} // ping, content_block_start/stop, etc.
        }

        chunks
    }

    fn finish(&mut self) -> Vec<CompletionChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![CompletionChunk::Error {
            error: ProviderError::StreamInterrupted("stream ended before message_stop".into()),
        }]
    }
}

fn classify_error(err: &ErrorEvent) -> ProviderError {
    match err.error.error_type.as_str() {
        "overloaded_error" => ProviderError::ProviderOverloaded,
        "rate_limit_error" => ProviderError::RateLimited,
        "authentication_error" | "permission_error" => {
            ProviderError::AuthenticationFailed(err.error.message.clone())
        }
        "invalid_request_error" | "not_found_error" => {
            ProviderError::InvalidRequest(err.error.message.clone())
        }
        _ => ProviderError::ServerError {
            status: 500,
            body: err.error.message.clone(),
        },
    }
}

// --- Deserialization types for Anthropic SSE events ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    delta: Value,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
