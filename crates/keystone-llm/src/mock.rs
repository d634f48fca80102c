use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use keystone_core::errors::ProviderError;
use keystone_core::provider::{ChunkStream, CompletionOptions, CompletionProvider};
use keystone_core::stream::CompletionChunk;
use keystone_core::tokens::TokenUsage;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of chunks.
    Chunks(Vec<CompletionChunk>),
    /// Return an error from the `stream()` call itself.
    Error(ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield the given chunks, then never finish.
    Pending(Vec<CompletionChunk>),
}

impl MockResponse {
    /// A complete response delivered as one text chunk.
    pub fn text(text: &str) -> Self {
        Self::stream_text(&[text])
    }

    /// A complete response delivered in several text chunks.
    pub fn stream_text(parts: &[&str]) -> Self {
        let mut chunks: Vec<CompletionChunk> =
            parts.iter().map(|p| CompletionChunk::text(*p)).collect();
        chunks.push(CompletionChunk::Done {
            usage: Some(TokenUsage::new(10, parts.len() as u32)),
            finish_reason: Some("end_turn".into()),
        });
        Self::Chunks(chunks)
    }

    /// Text chunks followed by an in-stream error.
    pub fn stream_error(parts: &[&str], error: ProviderError) -> Self {
        let mut chunks: Vec<CompletionChunk> =
            parts.iter().map(|p| CompletionChunk::text(*p)).collect();
        chunks.push(CompletionChunk::Error { error });
        Self::Chunks(chunks)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// A prompt the mock received, kept for assertions.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub prompt: String,
    pub options: CompletionOptions,
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
    model: String,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            model: "mock-model".into(),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.calls.lock().last().map(|c| c.prompt.clone())
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let idx = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                prompt: prompt.to_string(),
                options: options.clone(),
            });
            calls.len() - 1
        };

        let response = self.responses.lock().pop_front().ok_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            ))
        })?;

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ChunkStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Chunks(chunks) => return Ok(Box::pin(stream::iter(chunks))),
            MockResponse::Pending(chunks) => {
                use futures::StreamExt;
                return Ok(Box::pin(stream::iter(chunks).chain(stream::pending::<CompletionChunk>())));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
