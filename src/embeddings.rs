//! Text embedding via an OpenAI-compatible `/embeddings` endpoint.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl EmbeddingClient {
    /// `None` when no embedding provider is configured; memories are then
    /// stored without vectors and retrieval falls back to returning all.
    pub fn from_config(config: &Config) -> Option<Arc<Self>> {
        let api_key = config.embedding_api_key.clone()?;
        Some(Arc::new(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
        }))
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "input": [text],
            "model": self.model,
            "encoding_format": "float",
        });
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("embedding API error: {status} {body}");
        }
        let parsed: EmbeddingResponse = resp.json().await?;
        let Some(first) = parsed.data.into_iter().next() else {
            bail!("embedding API returned no vectors");
        };
        debug!("embedded {} chars into {}-dim vector", text.len(), first.embedding.len());
        Ok(first.embedding)
    }
}

/// `dot(a,b) / (||a||·||b||)`; mismatched dimensions score 0.
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
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = [0.5f32, 0.2, -0.3];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn mismatched_dimensions_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn zero_vector_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
