use keystone_core::security::ProviderType;

/// Known model capabilities used to pick sensible request defaults.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub name: &'static str,
    pub provider: ProviderType,
    pub context_window: usize,
    pub max_output: u32,
}

/// Output budget used when the caller does not set `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 8_192;

pub static CLAUDE_SONNET_4_5: ModelInfo = ModelInfo {
    name: "claude-sonnet-4-5-20250929",
    provider: ProviderType::Anthropic,
    context_window: 200_000,
    max_output: 64_000,
};

pub static CLAUDE_HAIKU_4_5: ModelInfo = ModelInfo {
    name: "claude-haiku-4-5-20251001",
    provider: ProviderType::Anthropic,
    context_window: 200_000,
    max_output: 64_000,
};

pub static GPT_4O: ModelInfo = ModelInfo {
    name: "gpt-4o",
    provider: ProviderType::OpenAI,
    context_window: 128_000,
    max_output: 16_384,
};

pub static GPT_4O_MINI: ModelInfo = ModelInfo {
    name: "gpt-4o-mini",
    provider: ProviderType::OpenAI,
    context_window: 128_000,
    max_output: 16_384,
};

pub static ALL_MODELS: &[&ModelInfo] = &[&CLAUDE_SONNET_4_5, &CLAUDE_HAIKU_4_5, &GPT_4O, &GPT_4O_MINI];

pub fn find_model(name: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().copied().find(|m| m.name == name)
}

pub fn default_model(provider: ProviderType) -> &'static ModelInfo {
    match provider {
        ProviderType::Anthropic => &CLAUDE_SONNET_4_5,
        ProviderType::OpenAI => &GPT_4O,
    }
}

/// Requested output budget, clamped to what a known model can produce.
/// Unknown model names are passed through unclamped.
pub fn resolve_max_tokens(model: &str, requested: Option<u32>) -> u32 {
    let wanted = requested.unwrap_or(DEFAULT_MAX_TOKENS);
    match find_model(model) {
        Some(info) => wanted.min(info.max_output),
        None => wanted,
    }
}
