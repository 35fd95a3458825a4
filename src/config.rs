//! Connection settings for OpenAI-compatible chat endpoints

use crate::retry::RetryConfig;
use crate::{Error, Result};
use std::env;
use std::time::Duration;

pub const BASE_URL_ENV: &str = "OPEN_KERNEL_BASE_URL";
pub const MODEL_ENV: &str = "OPEN_KERNEL_MODEL";
pub const API_KEY_ENV: &str = "OPEN_KERNEL_API_KEY";

/// Well-known OpenAI-compatible servers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    LMStudio,
    Ollama,
    LlamaCpp,
    VLLM,
}

impl Provider {
    pub fn default_url(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LlamaCpp => "http://localhost:8080/v1",
            Provider::VLLM => "http://localhost:8000/v1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "lmstudio" | "lm-studio" | "lm_studio" => Some(Provider::LMStudio),
            "ollama" => Some(Provider::Ollama),
            "llamacpp" | "llama-cpp" | "llama_cpp" | "llama.cpp" => Some(Provider::LlamaCpp),
            "vllm" => Some(Provider::VLLM),
            _ => None,
        }
    }
}

/// Base URL from `OPEN_KERNEL_BASE_URL`, else the provider default, else
/// `fallback`, else LM Studio.
pub fn get_base_url(provider: Option<Provider>, fallback: Option<&str>) -> String {
    resolve_base_url(|key| env::var(key).ok(), provider, fallback)
}

/// Model from `OPEN_KERNEL_MODEL` when `prefer_env` is set, else `fallback`.
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    resolve_model(|key| env::var(key).ok(), fallback, prefer_env)
}

fn resolve_base_url(
    lookup: impl Fn(&str) -> Option<String>,
    provider: Option<Provider>,
    fallback: Option<&str>,
) -> String {
    if let Some(url) = lookup(BASE_URL_ENV) {
        return url;
    }
    if let Some(p) = provider {
        return p.default_url().to_string();
    }
    fallback
        .unwrap_or(Provider::LMStudio.default_url())
        .to_string()
}

fn resolve_model(
    lookup: impl Fn(&str) -> Option<String>,
    fallback: Option<&str>,
    prefer_env: bool,
) -> Option<String> {
    if prefer_env {
        if let Some(model) = lookup(MODEL_ENV) {
            return Some(model);
        }
    }
    fallback.map(str::to_string)
}

/// Everything the OpenAI connector needs to reach a server.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub service_id: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl OpenAIConfig {
    pub fn builder() -> OpenAIConfigBuilder {
        OpenAIConfigBuilder::default()
    }

    /// Config from `OPEN_KERNEL_*` variables, falling back to LM Studio.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder().base_url(get_base_url(None, None));
        if let Some(model) = get_model(None, true) {
            builder = builder.model(model);
        }
        if let Ok(key) = env::var(API_KEY_ENV) {
            builder = builder.api_key(key);
        }
        builder.build()
    }

    /// URL of the chat completions endpoint.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Default)]
pub struct OpenAIConfigBuilder {
    service_id: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Option<Duration>,
    retry: Option<RetryConfig>,
}

impl OpenAIConfigBuilder {
    pub fn service_id(mut self, id: impl Into<String>) -> Self {
        self.service_id = Some(id.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn provider(mut self, provider: Provider) -> Self {
        self.base_url = Some(provider.default_url().to_string());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<OpenAIConfig> {
        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::config("model is required"))?;
        let base_url = self
            .base_url
            .ok_or_else(|| Error::config("base_url is required"))?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(format!(
                "base_url must start with http:// or https://, got {}",
                base_url
            )));
        }

        Ok(OpenAIConfig {
            service_id: self
                .service_id
                .unwrap_or_else(|| crate::settings::DEFAULT_SERVICE_ID.to_string()),
            model,
            base_url,
            api_key: self.api_key,
            timeout: self.timeout.unwrap_or(Duration::from_secs(60)),
            retry: self.retry.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_provider_parse_and_urls() {
        assert_eq!(Provider::parse("LM-Studio"), Some(Provider::LMStudio));
        assert_eq!(Provider::parse("llama.cpp"), Some(Provider::LlamaCpp));
        assert_eq!(Provider::parse("OpenAI"), Some(Provider::OpenAI));
        assert_eq!(Provider::parse("unknown"), None);
        assert_eq!(Provider::Ollama.default_url(), "http://localhost:11434/v1");
    }

    #[test]
    fn test_base_url_priority() {
        let env_set = |key: &str| (key == BASE_URL_ENV).then(|| "http://env:1/v1".to_string());

        assert_eq!(
            resolve_base_url(env_set, Some(Provider::Ollama), None),
            "http://env:1/v1"
        );
        assert_eq!(
            resolve_base_url(empty_env, Some(Provider::VLLM), Some("http://x/v1")),
            "http://localhost:8000/v1"
        );
        assert_eq!(
            resolve_base_url(empty_env, None, Some("http://custom:8080/v1")),
            "http://custom:8080/v1"
        );
        assert_eq!(
            resolve_base_url(empty_env, None, None),
            "http://localhost:1234/v1"
        );
    }

    #[test]
    fn test_model_priority() {
        let env_set = |key: &str| (key == MODEL_ENV).then(|| "env-model".to_string());

        assert_eq!(resolve_model(env_set, Some("fallback"), true).as_deref(), Some("env-model"));
        assert_eq!(resolve_model(env_set, Some("fallback"), false).as_deref(), Some("fallback"));
        assert_eq!(resolve_model(empty_env, None, true), None);
    }

    #[test]
    fn test_builder_validation() {
        let config = OpenAIConfig::builder()
            .model("qwen2.5")
            .provider(Provider::Ollama)
            .build()
            .unwrap();
        assert_eq!(config.service_id, "default");
        assert_eq!(
            config.chat_completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );

        assert!(OpenAIConfig::builder().base_url("http://x").build().is_err());
        assert!(OpenAIConfig::builder().model("m").build().is_err());
        assert!(
            OpenAIConfig::builder()
                .model("m")
                .base_url("ftp://x")
                .build()
                .is_err()
        );
    }
}
