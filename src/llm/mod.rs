//! Language-model collaborators.
//!
//! Two traits sit at the boundary between medctx and hosted models:
//!
//! - [`Generator`]: role-tagged turns in, text out. Used for chat answers,
//!   note enhancement, summaries and trend analysis.
//! - [`VisionAnalyzer`]: image bytes plus a prompt in, text out. Used for
//!   medical image analysis during ingestion.
//!
//! Both return [`GenerationError`] so call sites can turn a failed call into
//! degraded text instead of aborting the surrounding unit of work.
//!
//! # Providers
//!
//! | `generation.provider` | Client | Credential |
//! |-----------------------|--------|------------|
//! | `"disabled"` | [`Disabled`] | none |
//! | `"openai"` | [`openai::OpenAiClient`] | `OPENAI_API_KEY` |
//! | `"gemini"` | [`gemini::GeminiClient`] | `GEMINI_API_KEY` or `GOOGLE_API_KEY` |
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network errors are retried with
//! exponential backoff (1s, 2s, 4s, ... capped at 32s) up to
//! `generation.max_retries` times. 401/403 fail immediately as
//! [`GenerationError::AuthFailure`]; other 4xx fail immediately.

pub mod gemini;
pub mod openai;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, GenerationConfig};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("authentication with the model provider failed")]
    AuthFailure,
    #[error("the model provider timed out")]
    Timeout,
    #[error("model provider error: {0}")]
    ProviderError(String),
    #[error("no generation provider is configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        turns: &[Turn],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Generation, GenerationError>;
}

#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze_image(
        &self,
        image: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<String, GenerationError>;
}

/// Stand-in for both traits when no provider is configured.
pub struct Disabled;

#[async_trait]
impl Generator for Disabled {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _turns: &[Turn],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<Generation, GenerationError> {
        Err(GenerationError::NotConfigured)
    }
}

#[async_trait]
impl VisionAnalyzer for Disabled {
    async fn analyze_image(
        &self,
        _image: &[u8],
        _mime: &str,
        _prompt: &str,
    ) -> Result<String, GenerationError> {
        Err(GenerationError::NotConfigured)
    }
}

/// Sampling settings used for image analysis.
pub const VISION_TEMPERATURE: f32 = 0.1;
pub const VISION_MAX_TOKENS: u32 = 1500;

/// Transport settings shared by the HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl HttpSettings {
    fn from_config(config: &GenerationConfig, default_url: &str) -> Self {
        Self {
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        }
    }
}

/// POST `body` as JSON and return the parsed JSON response, retrying
/// transient failures.
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value, GenerationError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| GenerationError::ProviderError(e.to_string()));
                }

                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return Err(GenerationError::AuthFailure);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = GenerationError::ProviderError(format!("{}: {}", status, body_text));

                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) if e.is_timeout() => {
                last_err = Some(GenerationError::Timeout);
            }
            Err(e) => {
                last_err = Some(GenerationError::ProviderError(e.to_string()));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| GenerationError::ProviderError("request failed after retries".into())))
}

pub(crate) fn build_client(settings: &HttpSettings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(settings.timeout).build()?)
}

fn gemini_api_key() -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .or_else(|_| std::env::var("GOOGLE_API_KEY"))
        .ok()
        .filter(|k| !k.trim().is_empty())
}

fn openai_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

/// Create the configured [`Generator`].
///
/// A selected provider without its credential is a startup error.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(Disabled)),
        "openai" => {
            let Some(key) = openai_api_key() else {
                bail!("OPENAI_API_KEY environment variable not set");
            };
            Ok(Arc::new(openai::OpenAiClient::new(config, key)?))
        }
        "gemini" => {
            let Some(key) = gemini_api_key() else {
                bail!("GEMINI_API_KEY (or GOOGLE_API_KEY) environment variable not set");
            };
            Ok(Arc::new(gemini::GeminiClient::new(config, key)?))
        }
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Create the configured [`VisionAnalyzer`]; [`Disabled`] unless
/// `vision.enabled` is set.
pub fn create_vision(config: &Config) -> Result<Arc<dyn VisionAnalyzer>> {
    if !config.vision.enabled {
        return Ok(Arc::new(Disabled));
    }
    let generation = &config.generation;
    match generation.provider.as_str() {
        "openai" => {
            let Some(key) = openai_api_key() else {
                bail!("OPENAI_API_KEY environment variable not set");
            };
            Ok(Arc::new(openai::OpenAiClient::new(generation, key)?))
        }
        "gemini" => {
            let Some(key) = gemini_api_key() else {
                bail!("GEMINI_API_KEY (or GOOGLE_API_KEY) environment variable not set");
            };
            Ok(Arc::new(gemini::GeminiClient::new(generation, key)?))
        }
        other => bail!("vision is not available for provider: {}", other),
    }
}
