use serde::Serialize;

use keystone_core::ids::OutputId;
use keystone_core::models::SynthesisStatus;
use keystone_core::stream::ProviderErrorInfo;
use keystone_core::tokens::TokenUsage;

use crate::parse::ParseTier;
use crate::prompt::AssemblyMode;

/// Progress of one synthesis run, forwarded to clients as SSE frames.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SynthesisEvent {
    #[serde(rename_all = "camelCase")]
    Prompt {
        mode: AssemblyMode,
        /// True when a rerun had to rebuild the full context.
        fell_back_to_full: bool,
        system: String,
        user: String,
    },
    Chunk {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        output_id: OutputId,
        status: SynthesisStatus,
        tier: ParseTier,
        extracted_systems: usize,
        extracted_system_details: usize,
        suggested_systems: usize,
        suggested_system_details: usize,
        usage: TokenUsage,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        output_id: Option<OutputId>,
        #[serde(flatten)]
        error: ProviderErrorInfo,
    },
}

impl SynthesisEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as one Server-Sent-Events frame: `event:` line, one `data:`
    /// line of JSON, blank line.
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "kind": "serialization", "message": e.to_string() })
                .to_string()
        });
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}
