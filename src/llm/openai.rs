//! OpenAI-compatible chat completions client.
//!
//! Works against `api.openai.com` or any server exposing the same
//! `POST {base}/chat/completions` shape (set `generation.url`).

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use super::{
    build_client, post_json_with_retry, Generation, GenerationError, Generator, HttpSettings,
    Turn, Usage, VisionAnalyzer, VISION_MAX_TOKENS, VISION_TEMPERATURE,
};
use crate::config::GenerationConfig;

const DEFAULT_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    client: reqwest::Client,
    settings: HttpSettings,
    model: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let settings = HttpSettings::from_config(config, DEFAULT_URL);
        Ok(Self {
            client: build_client(&settings)?,
            settings,
            model: config.model_name(),
            api_key,
        })
    }

    async fn complete(
        &self,
        messages: serde_json::Value,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Generation, GenerationError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let url = format!("{}/chat/completions", self.settings.base_url);
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];

        let json = post_json_with_retry(
            &self.client,
            &url,
            &headers,
            &body,
            self.settings.max_retries,
        )
        .await?;
        parse_response(&json, &self.model)
    }
}

fn parse_response(json: &serde_json::Value, model: &str) -> Result<Generation, GenerationError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| GenerationError::ProviderError("response has no choices".into()))?;

    let text = choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let usage = json.get("usage").map(|u| Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()),
        completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()),
        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()),
    });

    Ok(Generation {
        text,
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string(),
        usage,
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(str::to_string),
    })
}

#[async_trait]
impl Generator for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        turns: &[Turn],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Generation, GenerationError> {
        let messages: Vec<serde_json::Value> = turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content }))
            .collect();
        self.complete(json!(messages), temperature, max_tokens).await
    }
}

#[async_trait]
impl VisionAnalyzer for OpenAiClient {
    async fn analyze_image(
        &self,
        image: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", mime, encoded) }
                }
            ]
        }]);
        let generation = self
            .complete(messages, VISION_TEMPERATURE, VISION_MAX_TOKENS)
            .await?;
        Ok(generation.text)
    }
}
