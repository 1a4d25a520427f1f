//! Index manifest stored next to the vector table.
//!
//! Records which embedding model, dimension and metric built the index so a
//! later run cannot mix incompatible vectors into it.

use crate::config::{Config, Distance};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// File name of the manifest inside the working directory.
pub const MANIFEST_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to access index manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt index manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Index was built with {field} {indexed}, but the current configuration uses {configured}")]
    Incompatible {
        field: &'static str,
        indexed: String,
        configured: String,
    },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub distance: Distance,
    pub collection_name: String,
    /// Unix seconds.
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub files_indexed: usize,
    #[serde(default)]
    pub chunks_indexed: usize,
}

impl IndexManifest {
    /// A fresh manifest describing the active configuration.
    pub fn new(config: &Config) -> Self {
        let now = unix_now();
        Self {
            embedding_model: config.rag.embedding_model.name.clone(),
            embedding_dim: config.rag.embedding_model.dim,
            distance: config.storage.distance,
            collection_name: config.storage.collection_name.clone(),
            created_at: now,
            updated_at: now,
            files_indexed: 0,
            chunks_indexed: 0,
        }
    }

    /// Reads the manifest at `path`, or `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the manifest to `path`, replacing any previous copy.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Rejects a configuration whose vectors could not share this index.
    ///
    /// A different model name with the same dimension is only logged.
    pub fn check_compatible(&self, config: &Config) -> Result<()> {
        let model = &config.rag.embedding_model;
        if self.embedding_dim != model.dim {
            return Err(ManifestError::Incompatible {
                field: "embedding dimension",
                indexed: self.embedding_dim.to_string(),
                configured: model.dim.to_string(),
            });
        }
        if self.distance != config.storage.distance {
            return Err(ManifestError::Incompatible {
                field: "distance metric",
                indexed: self.distance.to_string(),
                configured: config.storage.distance.to_string(),
            });
        }
        if self.embedding_model != model.name {
            warn!(
                indexed = %self.embedding_model,
                configured = %model.name,
                "Embedding model differs from the one that built the index"
            );
        }
        Ok(())
    }

    /// Stores the index totals after an indexing run.
    pub fn record_totals(&mut self, files: usize, chunks: usize) {
        self.files_indexed = files;
        self.chunks_indexed = chunks;
        self.updated_at = unix_now();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
