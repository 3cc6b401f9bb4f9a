//! Embedding provider abstraction and the OpenAI-compatible client.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]**: always errors; used when `embedding.provider = "disabled"`.
//! - **[`OpenAiEmbedder`]**: calls `POST {base_url}/embeddings` on any
//!   OpenAI-compatible endpoint with batching, retry, and backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error): retry
//! - HTTP 4xx (client error, not 429): fail immediately
//! - Network errors: retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("{0} environment variable not set")]
    MissingApiKey(String),
    #[error("embedding request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("embedding API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },
    #[error("expected {expected}-dimensional embeddings, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Trait for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-large"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `3072`).
    fn dims(&self) -> usize;
    /// Largest number of texts accepted by one [`embed_batch`](Embedder::embed_batch) call.
    fn max_batch(&self) -> usize;
    /// Embed one batch, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Embed any number of texts, splitting them into provider-sized batches.
///
/// Output order matches `texts`. An empty input makes no request.
pub async fn embed_all(
    embedder: &dyn Embedder,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(embedder.max_batch().max(1)) {
        let embedded = embedder.embed_batch(batch).await?;
        if embedded.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                got: embedded.len(),
            });
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}

// ============ Disabled Provider ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn max_batch(&self) -> usize {
        1
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ OpenAI-compatible Provider ============

/// Embedding client for OpenAI-compatible `/embeddings` endpoints.
///
/// Works against the OpenAI API itself or any gateway exposing the same
/// request and response shape.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiEmbedder {
    /// Create a client with an explicit API key.
    pub fn new(config: &EmbeddingConfig, api_key: String) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            dims,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    /// Create a client reading the API key from `config.api_key_env`.
    pub fn from_env(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EmbeddingError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config, api_key)
    }

    /// Base delay for the exponential backoff.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = ?last_err.as_ref().map(ToString::to_string),
                    "Retrying embedding request"
                );
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                            EmbeddingError::InvalidResponse(e.to_string())
                        })?;
                        return self.order_vectors(parsed, texts.len());
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = EmbeddingError::Api {
                        status: status.as_u16(),
                        body: body_text,
                    };

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }

                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EmbeddingError::InvalidResponse("embedding failed after retries".into())
        }))
    }

    /// Put returned vectors back in input order and check their shape.
    fn order_vectors(
        &self,
        mut parsed: EmbeddingResponse,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if parsed.data.len() != expected {
            return Err(EmbeddingError::CountMismatch {
                expected,
                got: parsed.data.len(),
            });
        }
        parsed.data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(expected);
        for (position, datum) in parsed.data.into_iter().enumerate() {
            if datum.index != position {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "missing embedding for input {}",
                    position
                )));
            }
            if datum.embedding.len() != self.dims {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dims,
                    got: datum.embedding.len(),
                });
            }
            vectors.push(datum.embedding);
        }
        Ok(vectors)
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        self.batch_size
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ============ Factory ============

/// Create the configured embedder.
///
/// A missing API key is an error here, before any item is processed.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAiEmbedder::from_env(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}
