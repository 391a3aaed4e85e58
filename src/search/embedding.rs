//! HTTP client for the remote embedding service.
//!
//! The wire contract is a single endpoint: `POST ${base}/api/embeddings`
//! with `{ "model": …, "prompt": … }`, answered by
//! `{ "embedding": [float, …] }` of a fixed dimensionality.

use crate::search::Embedder;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            dimensions,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self) -> String {
        format!("{}/api/embeddings", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        trace!("Embedding {} bytes via {}", text.len(), self.url());

        let response = self
            .client
            .post(self.url())
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .context("send embedding request")?
            .error_for_status()
            .context("embedding service rejected the request")?;

        let payload: EmbeddingResponse = response
            .json()
            .await
            .context("decode embedding response")?;

        if payload.embedding.len() != self.dimensions {
            bail!(
                "embedding dimensionality mismatch: got {}, expected {}",
                payload.embedding.len(),
                self.dimensions
            );
        }

        Ok(payload.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
