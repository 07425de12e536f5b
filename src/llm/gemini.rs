//! Google Gemini `generateContent` client.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{
    build_client, post_json_with_retry, Generation, GenerationError, Generator, HttpSettings,
    Role, Turn, Usage, VisionAnalyzer, VISION_MAX_TOKENS, VISION_TEMPERATURE,
};
use crate::config::GenerationConfig;

const DEFAULT_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// --- request and response shapes ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationParams,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Inline { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationParams {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ContentResponse>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ContentResponse {
    #[serde(default)]
    parts: Vec<PartResponse>,
}

#[derive(Deserialize, Debug)]
struct PartResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

pub struct GeminiClient {
    client: reqwest::Client,
    settings: HttpSettings,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let settings = HttpSettings::from_config(config, DEFAULT_URL);
        Ok(Self {
            client: build_client(&settings)?,
            settings,
            model: config.model_name(),
            api_key,
        })
    }

    async fn send(&self, request: &GeminiRequest) -> Result<Generation, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.settings.base_url, self.model, self.api_key
        );
        let body = serde_json::to_value(request)
            .map_err(|e| GenerationError::ProviderError(e.to_string()))?;

        let json =
            post_json_with_retry(&self.client, &url, &[], &body, self.settings.max_retries)
                .await?;
        let response: GeminiResponse = serde_json::from_value(json)
            .map_err(|e| GenerationError::ProviderError(e.to_string()))?;

        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| GenerationError::ProviderError("response has no candidates".into()))?;
        let text = candidate
            .content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(Generation {
            text,
            model: response.model_version.unwrap_or_else(|| self.model.clone()),
            usage: response.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
            finish_reason: candidate.finish_reason.clone(),
        })
    }
}

#[async_trait]
impl Generator for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        turns: &[Turn],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Generation, GenerationError> {
        let system: Vec<Part> = turns
            .iter()
            .filter(|t| t.role == Role::System)
            .map(|t| Part::Text {
                text: t.content.clone(),
            })
            .collect();

        let contents = turns
            .iter()
            .filter(|t| t.role != Role::System)
            .map(|t| Content {
                role: Some(if t.role == Role::Assistant { "model" } else { "user" }),
                parts: vec![Part::Text {
                    text: t.content.clone(),
                }],
            })
            .collect();

        let request = GeminiRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| Content {
                role: None,
                parts: system,
            }),
            generation_config: GenerationParams {
                temperature,
                max_output_tokens: max_tokens,
            },
        };
        self.send(&request).await
    }
}

#[async_trait]
impl VisionAnalyzer for GeminiClient {
    async fn analyze_image(
        &self,
        image: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let request = GeminiRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![
                    Part::Text {
                        text: prompt.to_string(),
                    },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: mime.to_string(),
                            data: base64::engine::general_purpose::STANDARD.encode(image),
                        },
                    },
                ],
            }],
            system_instruction: None,
            generation_config: GenerationParams {
                temperature: VISION_TEMPERATURE,
                max_output_tokens: VISION_MAX_TOKENS,
            },
        };
        Ok(self.send(&request).await?.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GeminiClient {
        let config = GenerationConfig {
            provider: "gemini".to_string(),
            url: Some(server.uri()),
            max_retries: 0,
            timeout_secs: 5,
            ..GenerationConfig::default()
        };
        GeminiClient::new(&config, "g-key".to_string()).unwrap()
    }

    #[tokio::test]
    async fn joins_candidate_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(query_param("key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "Chest " }, { "text": "clear." }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7 }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let out = client
            .generate(&[Turn::system("sys"), Turn::user("q")], 0.2, 50)
            .await
            .unwrap();
        assert_eq!(out.text, "Chest clear.");
        assert_eq!(out.model, "gemini-1.5-flash");
        assert_eq!(out.usage.unwrap().total_tokens, Some(7));

        let vision = client
            .analyze_image(b"jpg", "image/jpeg", "describe")
            .await
            .unwrap();
        assert_eq!(vision, "Chest clear.");
    }

    #[tokio::test]
    async fn empty_candidates_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&[Turn::user("q")], 0.2, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ProviderError(_)));
    }
}
