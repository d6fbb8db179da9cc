//! Gemini `generateContent` backend.

use super::{ContentGenerator, PreparedImage};
use crate::server::config::GeminiConfig;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use core::time::Duration;
use nemo_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn generation_error(message: impl Into<String>) -> Error {
    Error::Generation {
        message: message.into(),
    }
}

pub struct GeminiGenerator {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiGenerator {
    /// Builds a generator with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Generation`] if the HTTP client cannot be constructed
    /// (for example when no TLS backend is available).
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| generation_error(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        )
    }

    fn request_body(&self, prompt: &str, image: Option<&PreparedImage>) -> Value {
        let mut parts = vec![json!({
            "text": format!("{}\n\nUser: {prompt}", self.config.system_prompt),
        })];

        if let Some(image) = image {
            parts.push(json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": general_purpose::STANDARD.encode(&image.data),
                }
            }));
        }

        json!({ "contents": [{ "role": "user", "parts": parts }] })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Concatenates the text parts of the first candidate.
fn extract_text(response: GenerateResponse) -> Result<String> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(generation_error(format!("prompt was blocked: {reason}")));
    }

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(generation_error("model returned no text"));
    }
    Ok(text)
}

#[async_trait]
impl ContentGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str, image: Option<&PreparedImage>) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&self.request_body(prompt, image))
            .send()
            .await
            .map_err(|e| generation_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(generation_error(format!(
                "Gemini returned {status}: {}",
                body.trim()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| generation_error(format!("malformed response: {e}")))?;

        extract_text(parsed)
    }
}
