use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::tokens::TokenUsage;

/// Events emitted while a completion streams. Ordering contract:
///
/// Text* → (Done | Error)
///
/// Exactly one terminal event ends a well-formed stream.
#[derive(Clone, Debug)]
pub enum CompletionChunk {
    Text { text: String },
    Done {
        usage: Option<TokenUsage>,
        finish_reason: Option<String>,
    },
    Error { error: ProviderError },
}

impl CompletionChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Lightweight error info suitable for serialization into client frames.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&ProviderError> for ProviderErrorInfo {
    fn from(e: &ProviderError) -> Self {
        Self {
            kind: e.error_kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let done = CompletionChunk::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        };
        assert!(done.is_terminal());
        assert!(CompletionChunk::Error { error: ProviderError::Cancelled }.is_terminal());
        assert!(!CompletionChunk::text("x").is_terminal());
    }

    #[test]
    fn error_info_from_provider_error() {
        let info = ProviderErrorInfo::from(&ProviderError::RateLimited);
        assert_eq!(info.kind, "rate_limited");
        assert!(info.message.contains("rate limited"));
    }
}
