//! Advisor: an optional AI classifier/embedding client consulted at market
//! submission. Never authoritative, never blocking — any failure (missing
//! API key, network error, malformed response) falls back to an
//! `UNCERTAIN` label rather than propagating an error.

use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::AdvisorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub prediction: String,
    pub confidence: Decimal,
    pub reasoning: String,
    pub embedding: Option<serde_json::Value>,
}

impl Analysis {
    fn fallback() -> Self {
        Self {
            prediction: "UNCERTAIN".to_string(),
            confidence: Decimal::new(50, 0),
            reasoning: "AI unavailable".to_string(),
            embedding: None,
        }
    }
}

#[derive(Clone)]
pub struct Advisor {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    prediction: String,
    confidence: Decimal,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f64>,
}

impl Advisor {
    pub fn new(cfg: &AdvisorConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
        }
    }

    /// Whether an advisor endpoint is configured at all (vs. `classify`
    /// always falling back to `UNCERTAIN`).
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Classifies `text` via the advisor's `/classify` endpoint, falling
    /// back to `UNCERTAIN` on any failure or when no advisor is configured.
    pub async fn classify(&self, text: &str) -> Analysis {
        match self.try_classify(text).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(error = %e, "advisor classification unavailable, using fallback");
                Analysis::fallback()
            }
        }
    }

    async fn try_classify(&self, text: &str) -> anyhow::Result<Analysis> {
        let base_url = self
            .base_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("advisor not configured"))?;

        let mut request = self
            .client
            .post(format!("{base_url}/classify"))
            .json(&serde_json::json!({ "text": text }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response: ClassifyResponse = request.send().await?.json().await?;
        let embedding = self.embed(text).await.ok();

        Ok(Analysis {
            prediction: response.prediction,
            confidence: response.confidence,
            reasoning: response.reasoning,
            embedding,
        })
    }

    async fn embed(&self, text: &str) -> anyhow::Result<serde_json::Value> {
        let base_url = self
            .base_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("advisor not configured"))?;

        let mut request = self
            .client
            .post(format!("{base_url}/embed"))
            .json(&serde_json::json!({ "text": text }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response: EmbeddingResponse = request.send().await?.json().await?;
        Ok(serde_json::json!(response.embedding))
    }
}

/// Cosine similarity between two embedding vectors, used to flag likely
/// duplicate submissions before a market is created.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub const DUPLICATE_SIMILARITY_THRESHOLD: f64 = 0.85;

pub fn is_likely_duplicate(a: &[f64], b: &[f64]) -> bool {
    cosine_similarity(a, b) > DUPLICATE_SIMILARITY_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_are_maximally_similar() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_are_not_duplicates() {
        assert!(!is_likely_duplicate(&[1.0, 0.0], &[0.0, 1.0]));
    }
}
