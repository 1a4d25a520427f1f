//! Embedding generation using LLM providers.
//!
//! Wraps a [`Provider`] with the configured embedding model, batches inputs and
//! checks every returned vector against the index dimension.

use crate::config::EmbeddingModel;
use crate::provider::{Provider, ProviderError};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during embedding generation.
#[derive(Debug, Error)]
pub enum EmbedderError {
    /// The provider API returned an error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The API response contained no embeddings.
    #[error("No embeddings returned")]
    NoEmbeddings,

    /// A vector's length differs from the configured dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedderError>;

/// Generates vector embeddings for text.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn Provider>,
    model: EmbeddingModel,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn Provider>, model: EmbeddingModel, batch_size: usize) -> Self {
        Self {
            provider,
            model,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dim(&self) -> usize {
        self.model.dim
    }

    pub fn model_name(&self) -> &str {
        &self.model.name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embeds a single text, typically a query.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or(EmbedderError::NoEmbeddings)
    }

    /// Embeds `texts` in one provider call. Output order equals input order.
    ///
    /// Callers wanting bounded request sizes split by [`Embedder::batch_size`]
    /// first.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = texts.len(), model = %self.model.name, "Embedding batch");
        let vectors = self.provider.embed(texts, &self.model.name).await?;

        if vectors.len() != texts.len() {
            return Err(EmbedderError::NoEmbeddings);
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.model.dim) {
            return Err(EmbedderError::DimensionMismatch {
                expected: self.model.dim,
                actual: bad.len(),
            });
        }

        Ok(vectors)
    }
}
