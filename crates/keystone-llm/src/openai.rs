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

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI Chat Completions provider (streaming).
pub struct OpenAiProvider {
    client: Client,
    api_key: ApiKey,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: ApiKey, model: Option<&str>) -> Result<Self, ProviderError> {
        let model = model
            .map(str::to_string)
            .unwrap_or_else(|| models::default_model(ProviderType::OpenAI).name.to_string());
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

pub fn build_request_body(prompt: &str, options: &CompletionOptions, model: &str) -> Value {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &options.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": prompt }));

    let mut body = json!({
        "model": model,
        "stream": true,
        "stream_options": { "include_usage": true },
        "max_tokens": models::resolve_max_tokens(model, options.max_tokens),
        "messages": messages,
    });

    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }

    body
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
            .post(self.completions_url())
            .bearer_auth(self.api_key.0.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        debug!("openai stream opened");
        Ok(Box::pin(SseStream::new(resp.bytes_stream(), OpenAiParser::new())))
    }
}

/// Parses `data:` frames from the Chat Completions stream. With
/// `include_usage` the final usage arrives in a chunk with empty `choices`
/// just before `[DONE]`, after `finish_reason` has been seen.
#[derive(Default)]
pub struct OpenAiParser {
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    done: bool,
}

impl OpenAiParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn done_chunk(&mut self) -> CompletionChunk {
        self.done = true;
        CompletionChunk::Done {
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        }
    }
}

impl SseEventParser for OpenAiParser {
    fn parse_event(&mut self, _event_type: &str, data: &str) -> Vec<CompletionChunk> {
        let data = data.trim();
        if data == "[DONE]" {
            return vec![self.done_chunk()];
        }

        let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
            return Vec::new();
        };

        if let Some(err) = chunk.error {
            self.done = true;
            return vec![CompletionChunk::Error {
                error: classify_error(&err),
            }];
        }

        let mut out = Vec::new();
        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.and_then(|d| d.content) {
                if !text.is_empty() {
                    out.push(CompletionChunk::text(text));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<CompletionChunk> {
        if self.done {
            return Vec::new();
        }
        // Some compatible servers close the stream without `[DONE]`.
        if self.finish_reason.is_some() {
            return vec![self.done_chunk()];
        }
        self.done = true;
        vec![CompletionChunk::Error {
            error: ProviderError::StreamInterrupted("stream ended before finish_reason".into()),
        }]
    }
}

fn classify_error(err: &ErrorPayload) -> ProviderError {
    let message = err.message.clone().unwrap_or_default();
    match err.error_type.as_deref().or(err.code.as_deref()) {
        Some("rate_limit_exceeded") | Some("rate_limit_error") => ProviderError::RateLimited,
        Some("invalid_api_key") | Some("authentication_error") => {
            ProviderError::AuthenticationFailed(message)
        }
        Some("invalid_request_error") => ProviderError::InvalidRequest(message),
        Some("server_overloaded") => ProviderError::ProviderOverloaded,
        _ => ProviderError::ServerError {
            status: 500,
            body: message,
        },
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<UsagePayload>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct Choice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}
