use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::RemoteError;
use crate::retry::{ensure_success, BackoffPolicy};

/// Turns texts into vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    normalize: bool,
    truncate: bool,
}

/// Client for a text-embeddings-inference style `/embed` endpoint.
///
/// Each worker owns its own instance, and with it its own HTTP session.
pub struct EmbeddingClient {
    http: reqwest::Client,
    url: String,
    policy: BackoffPolicy,
}

impl EmbeddingClient {
    pub fn new(url: impl Into<String>, timeout: Duration, policy: BackoffPolicy) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            policy,
        })
    }

    async fn post(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
        let response = self
            .http
            .post(&self.url)
            .json(&EmbedRequest {
                inputs: texts,
                normalize: true,
                truncate: true,
            })
            .send()
            .await?;
        let response = ensure_success(&self.url, response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} texts via {}", texts.len(), self.url);
        let vectors = self.policy.run(&self.url, || self.post(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(RemoteError::Malformed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}
