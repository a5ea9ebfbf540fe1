//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`MockProvider`]** — deterministic hash-based vectors, for tests and offline development.
//!
//! Vector blob encoding lives in [`crate::db`] (`serialize_f32`/`deserialize_f32`);
//! this module is concerned with producing vectors, not with their on-disk form.
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding API error: {0}")]
    ApiError(String),
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("unknown embedding provider: {0}")]
    UnknownProvider(String),
    #[error("missing configuration: {0}")]
    MissingConfig(String),
}

/// Trait for embedding providers.
///
/// The actual embedding computation is performed by [`embed_texts`] (kept as
/// a free function, since trait methods can't be `async fn` in a `dyn`-safe
/// trait without `async-trait`, and dispatch here is config-based anyway).
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
}

/// Embed a batch of texts using the configured provider, then L2-normalize
/// every vector. Normalization happens exactly once, here, at the boundary
/// between provider output and anything that stores or compares vectors —
/// callers never need to normalize again.
pub async fn embed_texts(
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut vectors = match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await?,
        "ollama" => embed_ollama(config, texts).await?,
        "mock" => embed_mock(texts, provider.dims()),
        "disabled" => return Err(EmbeddingError::Disabled),
        other => return Err(EmbeddingError::UnknownProvider(other.to_string())),
    };

    if config.normalize {
        for v in &mut vectors {
            normalize_in_place(v);
        }
    }

    let expected = provider.dims();
    for v in &vectors {
        if expected != 0 && v.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: v.len(),
            });
        }
    }

    Ok(vectors)
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    let results = embed_texts(provider, config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".into()))
}

fn normalize_in_place(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ Mock Provider ============

/// Deterministic, dependency-free provider for tests and offline development.
/// Derives each vector from a hash of the input text, so identical inputs
/// always produce identical vectors without any network call.
pub struct MockProvider {
    dims: usize,
}

impl MockProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            dims: config.dims.unwrap_or(16),
        }
    }
}

impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn embed_mock(texts: &[String], dims: usize) -> Vec<Vec<f32>> {
    use sha2::{Digest, Sha256};
    texts
        .iter()
        .map(|text| {
            let mut vec = Vec::with_capacity(dims);
            let mut seed = Sha256::digest(text.as_bytes()).to_vec();
            while vec.len() < dims {
                seed = Sha256::digest(&seed).to_vec();
                for chunk in seed.chunks(4) {
                    if vec.len() >= dims {
                        break;
                    }
                    let byte_sum: u32 = chunk.iter().map(|b| *b as u32).sum();
                    vec.push((byte_sum as f32 / (255.0 * 4.0)) - 0.5);
                }
            }
            vec
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EmbeddingError::MissingConfig("embedding.model".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| EmbeddingError::MissingConfig("embedding.dims".into()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(EmbeddingError::MissingConfig(
                "OPENAI_API_KEY environment variable".into(),
            ));
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_openai(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| EmbeddingError::MissingConfig("OPENAI_API_KEY".into()))?;

    let model = config
        .model
        .as_ref()
        .ok_or_else(|| EmbeddingError::MissingConfig("embedding.model".into()))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| EmbeddingError::ApiError(e.to_string()))?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                    return parse_openai_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(EmbeddingError::ApiError(format!(
                        "OpenAI API error {status}: {body_text}"
                    )));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::ApiError(format!(
                    "OpenAI API error {status}: {body_text}"
                )));
            }
            Err(e) => {
                last_err = Some(EmbeddingError::ApiError(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EmbeddingError::ApiError("exhausted retries".into())))
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".into()))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".into()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured Ollama URL (default: `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EmbeddingError::MissingConfig("embedding.model".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| EmbeddingError::MissingConfig("embedding.dims".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self { model, dims, url })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// The external interface is one `{model, prompt}` POST per text, expecting
/// a single `{embedding: [float]}` back — batching happens by looping over
/// `texts` here, not by widening the wire format.
async fn embed_ollama(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| EmbeddingError::MissingConfig("embedding.model".into()))?;

    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| EmbeddingError::ApiError(e.to_string()))?;

    let mut result = Vec::with_capacity(texts.len());
    for text in texts {
        result.push(embed_ollama_one(&client, url, model, config.max_retries, text).await?);
    }

    Ok(result)
}

async fn embed_ollama_one(
    client: &reqwest::Client,
    url: &str,
    model: &str,
    max_retries: u32,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    let body = serde_json::json!({
        "model": model,
        "prompt": text,
    });

    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{url}/api/embed"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                    return parse_ollama_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(EmbeddingError::ApiError(format!(
                        "Ollama API error {status}: {body_text}"
                    )));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::ApiError(format!(
                    "Ollama API error {status}: {body_text}"
                )));
            }
            Err(e) => {
                last_err = Some(EmbeddingError::ApiError(format!(
                    "Ollama connection error (is Ollama running at {url}?): {e}"
                )));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EmbeddingError::ApiError("exhausted retries".into())))
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let embedding = json
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding array".into()))?;

    Ok(embedding.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>, EmbeddingError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "mock" => Ok(Box::new(MockProvider::new(config))),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => Err(EmbeddingError::UnknownProvider(other.to_string())),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(provider: &str, dims: Option<usize>) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: provider.to_string(),
            model: Some("test-model".to_string()),
            dims,
            url: None,
            batch_size: 8,
            max_retries: 0,
            timeout_secs: 5,
            normalize: true,
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn parses_singular_embedding_response() {
        let json = serde_json::json!({"embedding": [0.1, 0.2, 0.3]});
        let vec = parse_ollama_response(&json).unwrap();
        assert_eq!(vec, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn rejects_response_without_embedding_field() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2]]});
        let result = parse_ollama_response(&json);
        assert!(matches!(result, Err(EmbeddingError::InvalidResponse(_))));
    }

    #[test]
    fn test_cosine_different_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[tokio::test]
    async fn mock_provider_is_deterministic() {
        let config = config_with("mock", Some(16));
        let provider = MockProvider::new(&config);

        let a = embed_texts(&provider, &config, &["hello world".to_string()])
            .await
            .unwrap();
        let b = embed_texts(&provider, &config, &["hello world".to_string()])
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
    }

    #[tokio::test]
    async fn mock_provider_normalizes_output() {
        let config = config_with("mock", Some(16));
        let provider = MockProvider::new(&config);

        let vecs = embed_texts(&provider, &config, &["anything".to_string()])
            .await
            .unwrap();
        let norm: f32 = vecs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        let config = config_with("disabled", None);
        let provider = DisabledProvider;
        let result = embed_texts(&provider, &config, &["x".to_string()]).await;
        assert!(matches!(result, Err(EmbeddingError::Disabled)));
    }

    #[test]
    fn create_provider_rejects_unknown() {
        let config = config_with("not-a-real-provider", None);
        let result = create_provider(&config);
        assert!(matches!(result, Err(EmbeddingError::UnknownProvider(_))));
    }
}
