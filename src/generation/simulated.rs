//! Simulated generation backend
//!
//! Deterministic responses derived from the request, for local runs and tests.

use super::{ContentGenerator, GenerationRequest, GenerationResponse, TokenUsage};
use crate::cache::keys::content_hash;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct SimulatedBackend {
    model: String,
    latency: Duration,
    calls: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_latency(model, Duration::ZERO)
    }

    /// Simulate upstream latency on every call
    pub fn with_latency(model: impl Into<String>, latency: Duration) -> Self {
        Self {
            model: model.into(),
            latency,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of generate calls served
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContentGenerator for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let digest = content_hash(request.prompt.as_bytes());
        let text = format!(
            "Simulated response {:08x} to: {}",
            digest as u32,
            request.prompt.chars().take(80).collect::<String>()
        );
        let prompt_tokens = request.prompt.split_whitespace().count() as u32;
        let output_tokens = text.split_whitespace().count() as u32;

        Ok(GenerationResponse {
            text,
            model: self.model.clone(),
            finish_reason: Some("STOP".into()),
            usage: Some(TokenUsage {
                prompt_tokens,
                output_tokens,
                total_tokens: prompt_tokens + output_tokens,
            }),
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic_output() {
        let backend = SimulatedBackend::new("sim");
        let request = GenerationRequest::new("what is a cache");
        let a = backend.generate(&request).await.unwrap();
        let b = backend.generate(&request).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.calls(), 2);
        assert_eq!(a.usage.map(|u| u.prompt_tokens), Some(4));
    }

    #[test]
    fn test_simulated_latency() {
        let backend = SimulatedBackend::with_latency("sim", Duration::from_millis(20));
        let started = std::time::Instant::now();
        let response = tokio_test::block_on(backend.generate(&GenerationRequest::new("slow")));
        let response = tokio_test::assert_ok!(response);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(response.text.ends_with("slow"));
    }
}
