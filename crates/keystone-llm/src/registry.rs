use std::sync::Arc;

use tracing::info;

use keystone_core::errors::ProviderError;
use keystone_core::provider::CompletionProvider;
use keystone_core::security::{ApiKey, ProviderType};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;

/// Everything needed to construct a provider.
#[derive(Clone, Debug, Default)]
pub struct ProviderConfig {
    /// Provider identifier, e.g. `anthropic` or `openai`.
    pub provider: String,
    /// Model override; the provider default is used when unset.
    pub model: Option<String>,
    /// Explicit key. When unset the provider's environment variable is read.
    pub api_key: Option<ApiKey>,
    /// Endpoint override for proxies and tests.
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, key: ApiKey) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Construct a provider from config, reading API keys from the process
/// environment when the config does not carry one.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    create_provider_with_env(config, |name| std::env::var(name).ok())
}

/// Same as [`create_provider`] with an injectable environment lookup.
/// Fails fast on an unknown provider or a missing key; no request is sent.
pub fn create_provider_with_env<F>(
    config: &ProviderConfig,
    env: F,
) -> Result<Arc<dyn CompletionProvider>, ProviderError>
where
    F: Fn(&str) -> Option<String>,
{
    let provider_type: ProviderType = config.provider.parse()?;
    let api_key = resolve_api_key(provider_type, config.api_key.clone(), env)?;
    let model = config.model.as_deref();

    let provider: Arc<dyn CompletionProvider> = match provider_type {
        ProviderType::Anthropic => {
            let mut p = AnthropicProvider::new(api_key, model)?;
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url.as_str());
            }
            Arc::new(p)
        }
        ProviderType::OpenAI => {
            let mut p = OpenAiProvider::new(api_key, model)?;
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url.as_str());
            }
            Arc::new(p)
        }
    };

    info!(provider = %provider_type, model = provider.model(), "provider created");
    Ok(provider)
}

fn resolve_api_key<F>(
    provider: ProviderType,
    explicit: Option<ApiKey>,
    env: F,
) -> Result<ApiKey, ProviderError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = explicit {
        return Ok(key);
    }
    let var = provider.api_key_env_var();
    match env(var) {
        Some(value) if !value.trim().is_empty() => Ok(ApiKey::new(value.trim())),
        _ => Err(ProviderError::MissingApiKey(format!("{provider} (set {var})"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = create_provider_with_env(&ProviderConfig::new("gemini"), no_env)
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::UnsupportedProvider(_)));
    }

    #[test]
    fn missing_key_rejected() {
        let err = create_provider_with_env(&ProviderConfig::new("openai"), no_env)
            .err()
            .unwrap();
        match err {
            ProviderError::MissingApiKey(msg) => assert!(msg.contains("OPENAI_API_KEY")),
            other => panic!("expected MissingApiKey, got {other:?}"),
        }
    }

    #[test]
    fn blank_env_key_is_missing() {
        let err = create_provider_with_env(&ProviderConfig::new("anthropic"), |_| {
            Some("   ".into())
        })
        .err()
        .unwrap();
        assert!(matches!(err, ProviderError::MissingApiKey(_)));
    }

    #[test]
    fn key_from_env() {
        let provider = create_provider_with_env(&ProviderConfig::new("Anthropic"), |name| {
            (name == "ANTHROPIC_API_KEY").then(|| "sk-ant-x".to_string())
        })
        .unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.model(), "claude-sonnet-4-5-20250929");
    }

    #[test]
    fn explicit_key_and_model() {
        let config = ProviderConfig::new("openai")
            .with_api_key(ApiKey::new("sk-test"))
            .with_model("gpt-4o-mini");
        let provider = create_provider_with_env(&config, no_env).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), "gpt-4o-mini");
    }
}
