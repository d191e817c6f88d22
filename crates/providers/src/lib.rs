//! Language-model providers for murmur.
//!
//! All providers implement the `murmur_core::Provider` trait. The only
//! backend is the OpenAI-compatible chat-completions API, which covers
//! OpenAI itself, OpenRouter, Ollama, vLLM and most hosted gateways.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use murmur_config::AppConfig;
use murmur_core::error::ProviderError;

/// Build the configured provider.
///
/// A missing API key is only accepted for endpoints on the local machine.
pub fn build_from_config(config: &AppConfig) -> Result<OpenAiCompatProvider, ProviderError> {
    let base_url = &config.provider.base_url;
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None if is_local(base_url) => String::new(),
        None => {
            return Err(ProviderError::NotConfigured(
                "no API key (set api_key in config.toml or MURMUR_API_KEY)".into(),
            ));
        }
    };
    OpenAiCompatProvider::new(
        provider_name(base_url),
        base_url,
        api_key,
        config.provider.timeout_secs,
    )
}

fn is_local(base_url: &str) -> bool {
    ["://localhost", "://127.0.0.1", "://[::1]"]
        .iter()
        .any(|host| base_url.contains(host))
}

fn provider_name(base_url: &str) -> &'static str {
    if base_url.contains("openrouter.ai") {
        "openrouter"
    } else if base_url.contains("api.openai.com") {
        "openai"
    } else if is_local(base_url) {
        "local"
    } else {
        "openai-compatible"
    }
}
