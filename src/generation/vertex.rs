//! Vertex AI generation backend
//!
//! Calls the `generateContent` REST method of a Vertex AI publisher model.

use super::{ContentGenerator, GenerationRequest, GenerationResponse, TokenUsage};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

const SERVICE: &str = "vertex-ai";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Vertex AI backend
#[derive(Debug, Clone)]
pub struct VertexConfig {
    pub project_id: String,
    pub location: String,
    pub model: String,
    /// OAuth access token sent as a bearer token
    pub access_token: String,
    /// Override for the API base URL (tests, private endpoints)
    pub endpoint: Option<String>,
    pub request_timeout: Duration,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            location: "us-central1".into(),
            model: "gemini-1.5-pro".into(),
            access_token: String::new(),
            endpoint: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl VertexConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            access_token: access_token.into(),
            ..Default::default()
        }
    }

    /// Full `generateContent` URL
    pub fn url(&self) -> String {
        let base = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", self.location));
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            base.trim_end_matches('/'),
            self.project_id,
            self.location,
            self.model
        )
    }
}

// =============================================================================
// Wire Format
// =============================================================================

fn request_body(request: &GenerationRequest) -> Value {
    let mut body = json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.prompt }],
        }],
    });

    if let Some(instruction) = &request.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".into(), json!(temperature));
    }
    if let Some(max) = request.max_output_tokens {
        generation_config.insert("maxOutputTokens".into(), json!(max));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

fn parse_response(model: &str, body: GenerateContentResponse) -> Result<GenerationResponse> {
    let candidate = body.candidates.into_iter().next().ok_or_else(|| Error::Upstream {
        service: SERVICE.into(),
        reason: "response contained no candidates".into(),
    })?;

    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    Ok(GenerationResponse {
        text,
        model: model.to_string(),
        finish_reason: candidate.finish_reason,
        usage: body.usage_metadata.map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }),
        cached: false,
    })
}

// =============================================================================
// Backend
// =============================================================================

/// Vertex AI `generateContent` client
#[derive(Debug)]
pub struct VertexBackend {
    config: VertexConfig,
    client: Client,
}

impl VertexBackend {
    pub fn new(config: VertexConfig) -> Result<Self> {
        if config.project_id.is_empty() {
            return Err(Error::Configuration("vertex project id is required".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &VertexConfig {
        &self.config
    }
}

#[async_trait]
impl ContentGenerator for VertexBackend {
    fn name(&self) -> &str {
        "vertex"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request), fields(model = %self.config.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let response = self
            .client
            .post(self.config.url())
            .bearer_auth(&self.config.access_token)
            .json(&request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        operation: "vertex.generate_content".into(),
                        duration: self.config.request_timeout,
                    }
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                service: SERVICE.into(),
                reason: format!("{}: {}", status, detail.chars().take(512).collect::<String>()),
            });
        }

        let body: GenerateContentResponse = response.json().await?;
        let parsed = parse_response(&self.config.model, body)?;
        debug!(
            finish_reason = ?parsed.finish_reason,
            chars = parsed.text.len(),
            "Vertex AI response received"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_url() {
        let config = VertexConfig::new("proj", "token");
        assert_eq!(
            config.url(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-1.5-pro:generateContent"
        );

        let config = VertexConfig {
            endpoint: Some("http://localhost:9000/".into()),
            ..config
        };
        assert!(config.url().starts_with("http://localhost:9000/v1/projects/proj/"));
    }

    #[test]
    fn test_request_body() {
        let request = GenerationRequest::new("hi")
            .with_system_instruction("be brief")
            .with_temperature(0.5);
        let body = request_body(&request);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["generationConfig"]["temperature"], 0.5);
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn test_parse_response() {
        let body: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "Hel" }, { "text": "lo" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 2, "candidatesTokenCount": 1, "totalTokenCount": 3 }
        }))
        .unwrap();

        let response = parse_response("gemini", body).unwrap();
        assert_eq!(response.text, "Hello");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(3));
    }

    #[test]
    fn test_empty_candidates_is_upstream_error() {
        let body: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert_matches!(parse_response("gemini", body), Err(Error::Upstream { .. }));
    }

    #[test]
    fn test_missing_project_rejected() {
        assert_matches!(
            VertexBackend::new(VertexConfig::default()),
            Err(Error::Configuration(_))
        );
    }
}
