//! Content Generation
//!
//! The [`ContentGenerator`] capability with two interchangeable backends,
//! selected once at construction:
//! - [`VertexBackend`]: Vertex AI `generateContent` over HTTPS
//! - [`SimulatedBackend`]: deterministic canned responses
//!
//! [`CachedGenerator`] wraps either backend with the response cache.

pub mod cached;
pub mod simulated;
pub mod vertex;

pub use cached::{CachedGenerator, GENERATION_NAMESPACE};
pub use simulated::SimulatedBackend;
pub use vertex::{VertexBackend, VertexConfig};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Request/Response Types
// =============================================================================

/// A text generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Owner of the request; scopes cache keys per user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// A generated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Served from the response cache
    #[serde(default)]
    pub cached: bool,
}

// =============================================================================
// ContentGenerator Trait (Port)
// =============================================================================

/// Text generation capability
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Model that answers requests
    fn model(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// Type alias for Arc'd ContentGenerator
pub type ContentGeneratorRef = Arc<dyn ContentGenerator>;

/// Which backend to build
#[derive(Debug, Clone)]
pub enum GeneratorBackend {
    Vertex(VertexConfig),
    Simulated { model: String },
}

/// Build the configured backend
pub fn build_generator(backend: GeneratorBackend) -> Result<ContentGeneratorRef> {
    Ok(match backend {
        GeneratorBackend::Vertex(config) => Arc::new(VertexBackend::new(config)?),
        GeneratorBackend::Simulated { model } => Arc::new(SimulatedBackend::new(model)),
    })
}
