//! Text extraction from images (OCR).
//!
//! Only [`TextExtraction::Text`] carries data. The other outcomes are kept
//! apart so the image pipeline can record why no text is available without
//! mistaking a status message for a transcription.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::OcrConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TextExtraction {
    Text(String),
    NoText,
    NotConfigured,
    Failed(String),
}

impl TextExtraction {
    /// The extracted text, if any was found.
    pub fn text(&self) -> Option<&str> {
        match self {
            TextExtraction::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TextExtraction::Text(t) => t.clone(),
            TextExtraction::NoText => "No text detected in image".to_string(),
            TextExtraction::NotConfigured => "Text extraction not configured".to_string(),
            TextExtraction::Failed(e) => format!("Text extraction failed: {}", e),
        }
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, image: &[u8]) -> TextExtraction;
}

pub struct DisabledExtractor;

#[async_trait]
impl TextExtractor for DisabledExtractor {
    async fn extract_text(&self, _image: &[u8]) -> TextExtraction {
        TextExtraction::NotConfigured
    }
}

const GOOGLE_VISION_URL: &str = "https://vision.googleapis.com/v1";

/// Google Cloud Vision `images:annotate` with `TEXT_DETECTION`.
pub struct GoogleVisionExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoogleVisionExtractor {
    pub fn new(config: &OcrConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| GOOGLE_VISION_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
        })
    }

    async fn annotate(&self, image: &[u8]) -> Result<TextExtraction> {
        let body = json!({
            "requests": [{
                "image": { "content": base64::engine::general_purpose::STANDARD.encode(image) },
                "features": [{ "type": "TEXT_DETECTION" }]
            }]
        });

        let response = self
            .client
            .post(format!("{}/images:annotate", self.base_url))
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Vision API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let first = json.pointer("/responses/0");

        if let Some(message) = first
            .and_then(|r| r.pointer("/error/message"))
            .and_then(|m| m.as_str())
        {
            bail!("Vision API error: {}", message);
        }

        let text = first
            .and_then(|r| r.pointer("/textAnnotations/0/description"))
            .and_then(|d| d.as_str())
            .map(str::trim)
            .unwrap_or_default();

        if text.is_empty() {
            Ok(TextExtraction::NoText)
        } else {
            Ok(TextExtraction::Text(text.to_string()))
        }
    }
}

#[async_trait]
impl TextExtractor for GoogleVisionExtractor {
    async fn extract_text(&self, image: &[u8]) -> TextExtraction {
        match self.annotate(image).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Text extraction failed");
                TextExtraction::Failed(e.to_string())
            }
        }
    }
}

/// Create the configured [`TextExtractor`].
///
/// `"google"` requires `GOOGLE_VISION_API_KEY`.
pub fn create_extractor(config: &OcrConfig) -> Result<Arc<dyn TextExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledExtractor)),
        "google" => {
            let key = std::env::var("GOOGLE_VISION_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
            let Some(key) = key else {
                bail!("GOOGLE_VISION_API_KEY environment variable not set");
            };
            Ok(Arc::new(GoogleVisionExtractor::new(config, key)?))
        }
        other => bail!("Unknown ocr provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn extractor_for(server: &MockServer) -> GoogleVisionExtractor {
        let config = OcrConfig {
            provider: "google".to_string(),
            url: Some(server.uri()),
            timeout_secs: 5,
        };
        GoogleVisionExtractor::new(&config, "v-key".to_string()).unwrap()
    }

    #[tokio::test]
    async fn returns_first_annotation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images:annotate"))
            .and(query_param("key", "v-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responses": [{ "textAnnotations": [
                    { "description": "L  R\nPORTABLE" },
                    { "description": "L" }
                ]}]
            })))
            .mount(&server)
            .await;

        let out = extractor_for(&server).extract_text(b"img").await;
        assert_eq!(out, TextExtraction::Text("L  R\nPORTABLE".to_string()));
        assert_eq!(out.text(), Some("L  R\nPORTABLE"));
    }

    #[tokio::test]
    async fn empty_response_is_no_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "responses": [{}] })))
            .mount(&server)
            .await;

        let out = extractor_for(&server).extract_text(b"img").await;
        assert_eq!(out, TextExtraction::NoText);
        assert_eq!(out.text(), None);
    }

    #[tokio::test]
    async fn http_error_is_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let out = extractor_for(&server).extract_text(b"img").await;
        assert!(matches!(out, TextExtraction::Failed(_)));
    }

    #[tokio::test]
    async fn disabled_is_not_configured() {
        let extractor = create_extractor(&OcrConfig::default()).unwrap();
        assert_eq!(extractor.extract_text(b"img").await, TextExtraction::NotConfigured);
    }
}
