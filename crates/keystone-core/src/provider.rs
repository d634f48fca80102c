use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::errors::ProviderError;
use crate::stream::CompletionChunk;
use crate::tokens::TokenUsage;

pub type ChunkStream = Pin<Box<dyn Stream<Item = CompletionChunk> + Send>>;

/// Options controlling a single completion.
#[derive(Clone, Debug, Default)]
pub struct CompletionOptions {
    /// Overrides the provider's configured model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// System instructions sent alongside the prompt.
    pub system: Option<String>,
}

impl CompletionOptions {
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Result of a non-streaming completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Trait implemented by each AI provider (Anthropic, OpenAI).
///
/// One call is one network request. Implementations never retry and never
/// impose a deadline; dropping the returned stream aborts the request.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<ChunkStream, ProviderError>;

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, ProviderError> {
        let stream = self.stream(prompt, options).await?;
        collect_stream(stream).await
    }
}

/// Drain a chunk stream into a single response. The first `Error` chunk ends
/// collection; a stream that ends without `Done` is reported as interrupted.
pub async fn collect_stream(mut stream: ChunkStream) -> Result<CompletionResponse, ProviderError> {
    let mut response = CompletionResponse::default();
    while let Some(chunk) = stream.next().await {
        match chunk {
            CompletionChunk::Text { text } => response.content.push_str(&text),
            CompletionChunk::Done {
                usage,
                finish_reason,
            } => {
                if let Some(usage) = usage {
                    response.usage = usage;
                }
                response.finish_reason = finish_reason;
                return Ok(response);
            }
            CompletionChunk::Error { error } => return Err(error),
        }
    }
    Err(ProviderError::StreamInterrupted(
        "stream ended without a terminal event".into(),
    ))
}
