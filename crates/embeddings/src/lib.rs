//! Embedding client for Xiaoxing.
//!
//! Provides the [`Embedder`] trait, an OpenAI-compatible HTTP implementation
//! and an exact-text cache ([`CachedEmbedder`]) in front of any embedder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

mod cache;

pub use cache::{CacheStats, CachedEmbedder, SharedEmbedding};

/// Default dimensionality of the Qwen3 embedding model.
pub const DEFAULT_DIMENSIONS: usize = 4096;

/// Errors raised while talking to the embedding service.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("embedding response contained no vectors")]
    Empty,
}

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Creates the embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Length of the vectors this embedder produces.
    fn dimensions(&self) -> usize;

    /// Model identifier used for the upstream call.
    fn model(&self) -> &str;
}

/// Client for OpenAI-compatible `/embeddings` endpoints (ModelScope, vLLM, ...).
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: Url,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

/// Request body for the embeddings API.
#[derive(Debug, Serialize)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: &'a str,
    pub encoding_format: &'static str,
}

/// Response body of the embeddings API.
#[derive(Debug, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    /// Creates a new embedder.
    ///
    /// # Arguments
    ///
    /// * `client` - shared HTTP client
    /// * `base_url` - API root, e.g. `https://api-inference.modelscope.cn/v1`
    /// * `model` - embedding model name
    pub fn new(client: reqwest::Client, base_url: Url, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url,
            model: model.into(),
            api_key: None,
            dimensions: DEFAULT_DIMENSIONS,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url.as_str().trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = self.endpoint();
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            encoding_format: "float",
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(EmbedError::Empty)?;

        tracing::debug!(
            model = %self.model,
            dims = embedding.len(),
            "embedding fetched"
        );
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}
