//! Cache-fronted content generation
//!
//! Looks a request up in the response cache before calling the backend and
//! stores the backend's answer after a miss. Keys are scoped per user:
//!
//! ```text
//! vertex:generate_content:user_<id>:<hash16>
//! vertex:generate_content:global:<hash16>
//! ```

use super::{ContentGenerator, ContentGeneratorRef, GenerationRequest, GenerationResponse};
use crate::cache::CacheStoreRef;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Namespace of generation cache keys
pub const GENERATION_NAMESPACE: &str = "generate_content";

/// Request fields that determine the answer
#[derive(Serialize)]
struct KeyPayload<'a> {
    model: &'a str,
    prompt: &'a str,
    system_instruction: Option<&'a str>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
}

/// Generator that consults the response cache first
pub struct CachedGenerator {
    backend: ContentGeneratorRef,
    cache: CacheStoreRef,
    ttl: Option<Duration>,
}

impl CachedGenerator {
    pub fn new(backend: ContentGeneratorRef, cache: CacheStoreRef) -> Self {
        Self {
            backend,
            cache,
            ttl: None,
        }
    }

    /// TTL for cached responses (cache default when unset)
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn backend(&self) -> &ContentGeneratorRef {
        &self.backend
    }

    fn operation(user_id: Option<&str>) -> String {
        match user_id {
            Some(id) => format!("user_{}", id),
            None => "global".to_string(),
        }
    }

    /// Cache key for a request
    pub fn cache_key(&self, request: &GenerationRequest) -> Result<String> {
        let payload = KeyPayload {
            model: self.backend.model(),
            prompt: &request.prompt,
            system_instruction: request.system_instruction.as_deref(),
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
        };
        self.cache.codec().key(
            &payload,
            Some(&Self::operation(request.user_id.as_deref())),
            Some(GENERATION_NAMESPACE),
        )
    }

    /// Drop every cached response for one user
    pub async fn invalidate_user(&self, user_id: &str) -> Result<usize> {
        let pattern = self
            .cache
            .codec()
            .pattern(Some(GENERATION_NAMESPACE), Some(&Self::operation(Some(user_id))));
        self.cache.invalidate_pattern(&pattern).await
    }

    /// Drop cached responses matching an arbitrary glob
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        self.cache.invalidate_pattern(pattern).await
    }
}

#[async_trait]
impl ContentGenerator for CachedGenerator {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn model(&self) -> &str {
        self.backend.model()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let key = self.cache_key(request)?;

        if let Some(bytes) = self.cache.get(&key).await {
            match serde_json::from_slice::<GenerationResponse>(&bytes) {
                Ok(mut response) => {
                    debug!(key = %key, "Serving generation from cache");
                    response.cached = true;
                    return Ok(response);
                }
                Err(e) => warn!(key = %key, error = %e, "Discarding undecodable cached response"),
            }
        }

        let response = self.backend.generate(request).await?;
        match serde_json::to_vec(&response) {
            Ok(encoded) => {
                if let Err(e) = self
                    .cache
                    .set_with_ttl(&key, Bytes::from(encoded), self.ttl)
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to cache generation response");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode generation response"),
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, CacheManagerConfig};
    use crate::generation::SimulatedBackend;
    use std::sync::Arc;

    fn setup() -> (Arc<SimulatedBackend>, CachedGenerator) {
        let backend = Arc::new(SimulatedBackend::new("gemini-sim"));
        let cache = Arc::new(CacheManager::new(CacheManagerConfig::default()).unwrap());
        let generator = CachedGenerator::new(backend.clone(), cache);
        (backend, generator)
    }

    #[tokio::test]
    async fn test_second_call_is_cached() {
        let (backend, generator) = setup();
        let request = GenerationRequest::new("explain tiers").for_user("42");

        let first = generator.generate(&request).await.unwrap();
        let second = generator.generate(&request).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.text, second.text);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_key_layout() {
        let (_, generator) = setup();
        let key = generator
            .cache_key(&GenerationRequest::new("p").for_user("7"))
            .unwrap();
        assert!(key.starts_with("vertex:generate_content:user_7:"));
        let key = generator.cache_key(&GenerationRequest::new("p")).unwrap();
        assert!(key.starts_with("vertex:generate_content:global:"));
    }

    #[tokio::test]
    async fn test_invalidate_user() {
        let (backend, generator) = setup();
        let alice = GenerationRequest::new("q").for_user("alice");
        let bob = GenerationRequest::new("q").for_user("bob");
        generator.generate(&alice).await.unwrap();
        generator.generate(&bob).await.unwrap();

        assert_eq!(generator.invalidate_user("alice").await.unwrap(), 1);
        assert!(!generator.generate(&alice).await.unwrap().cached);
        assert!(generator.generate(&bob).await.unwrap().cached);
        assert_eq!(backend.calls(), 3);
    }
}
