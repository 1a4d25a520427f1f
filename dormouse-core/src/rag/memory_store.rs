//! Process-local vector store.
//!
//! Linear scan over every record. Fine for tests and small corpora; nothing
//! survives the process.

use super::store::{source_matches, VectorStore};
use super::types::{Document, SearchResult};
use crate::config::Distance;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

pub struct InMemoryStore {
    distance: Distance,
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryStore {
    pub fn new(distance: Distance) -> Self {
        Self {
            distance,
            documents: RwLock::new(HashMap::new()),
        }
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.distance {
            Distance::Cosine => cosine_similarity(a, b),
            Distance::Dot => a.iter().zip(b).map(|(x, y)| x * y).sum(),
            Distance::L2 => -a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>(),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, documents: Vec<Document>) -> Result<()> {
        let mut store = self.documents.write().await;
        for document in documents {
            store.insert(document.id.clone(), document);
        }
        Ok(())
    }

    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        let store = self.documents.read().await;

        let mut results = Vec::with_capacity(store.len());
        for document in store.values() {
            if document.embedding.len() != query_embedding.len() {
                return Err(anyhow!(
                    "Query dimension {} does not match stored dimension {}",
                    query_embedding.len(),
                    document.embedding.len()
                ));
            }
            results.push(SearchResult {
                score: self.score(query_embedding, &document.embedding),
                document: document.clone(),
            });
        }

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.documents.read().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.documents.write().await.clear();
        Ok(())
    }

    async fn get_indexed_paths(&self) -> Result<Vec<String>> {
        let store = self.documents.read().await;
        let paths: BTreeSet<String> = store
            .values()
            .filter_map(|doc| doc.source().map(str::to_string))
            .collect();
        Ok(paths.into_iter().collect())
    }

    async fn remove_by_source(&self, source_path: &str) -> Result<usize> {
        let mut store = self.documents.write().await;
        let before = store.len();
        store.retain(|_, doc| !doc.source().is_some_and(|s| source_matches(s, source_path)));
        Ok(before - store.len())
    }

    async fn remove_stale(&self, source: &str, keep_below: usize) -> Result<usize> {
        let mut store = self.documents.write().await;
        let before = store.len();
        store.retain(|_, doc| {
            let stale = doc.source() == Some(source)
                && doc.chunk_index().is_some_and(|index| index >= keep_below);
            !stale
        });
        Ok(before - store.len())
    }
}
