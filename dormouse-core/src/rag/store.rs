//! Vector store abstraction and factory.
//!
//! This module provides a unified interface for different vector database implementations.

use super::lancedb_store::LanceDbStore;
use super::memory_store::InMemoryStore;
use super::types::{Document, SearchResult};
use crate::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Unified interface for vector database operations.
///
/// Records are keyed by id; writing an existing id replaces it.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces documents by id.
    async fn upsert(&self, documents: Vec<Document>) -> Result<()>;

    /// Searches for the most similar documents using vector similarity.
    ///
    /// Returns at most `top_k` results, sorted by descending similarity score.
    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<SearchResult>>;

    /// Returns the total number of documents in the store.
    async fn count(&self) -> Result<usize>;

    /// Removes all documents from the store.
    async fn clear(&self) -> Result<()>;

    /// Returns all unique source file paths that have been indexed.
    async fn get_indexed_paths(&self) -> Result<Vec<String>>;

    /// Removes all documents whose source equals `source_path` or lies under it.
    ///
    /// Returns the number of documents removed.
    async fn remove_by_source(&self, source_path: &str) -> Result<usize>;

    /// Removes the chunks of `source` numbered `keep_below` and up.
    ///
    /// Called after re-indexing a file that now yields fewer chunks.
    async fn remove_stale(&self, source: &str, keep_below: usize) -> Result<usize>;
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Embedded LanceDB table under the working directory.
    Lance,
    /// Process-local map, nothing persisted.
    Memory,
}

/// Creates a vector store instance for `kind`.
///
/// # Arguments
///
/// * `storage_config` - Working directory, table name and distance metric
/// * `vector_size` - Dimension of the embedding vectors
pub async fn create_vector_store(
    kind: StoreKind,
    storage_config: &StorageConfig,
    vector_size: usize,
) -> Result<Arc<dyn VectorStore>> {
    match kind {
        StoreKind::Lance => {
            let store = LanceDbStore::new(storage_config, vector_size).await?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => Ok(Arc::new(InMemoryStore::new(storage_config.distance))),
    }
}

/// `true` when `candidate` is `source` itself or a path beneath it.
pub(crate) fn source_matches(candidate: &str, source: &str) -> bool {
    let candidate = candidate.replace('\\', "/");
    let source = source.replace('\\', "/");
    let source = source.trim_end_matches('/');
    candidate == source || candidate.starts_with(&format!("{source}/"))
}
