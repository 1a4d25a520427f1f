use crate::chunker::Granularity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the whole tool.
///
/// Built once at program entry (defaults, then an optional YAML file, then
/// command-line overrides) and handed by reference to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Configuration for the hosted model API.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Never written back to disk.
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub generation: GenerationOptions,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("generation", &self.generation)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Sampling options forwarded to the chat completion endpoint.
///
/// Unset fields are left out of the request so the provider's own defaults apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Backoff policy for transient API failures (429, 5xx, connect errors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

/// Embedding model identity. The dimension is fixed for the lifetime of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub name: String,
    pub dim: usize,
}

impl Default for EmbeddingModel {
    fn default() -> Self {
        Self {
            name: "text-embedding-3-large".to_string(),
            dim: 3072,
        }
    }
}

/// Configuration for RAG processing.
///
/// This covers embedding settings, chunking and retrieval behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub embedding_model: EmbeddingModel,
    /// Token budget per chunk. Soft: a single oversized paragraph or word still
    /// becomes its own chunk.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

/// Configuration for file collection during indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// File extensions to index, compared case-insensitively and without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_recursive")]
    pub recursive: bool,

    /// Number of files processed concurrently; each worker owns one file end-to-end.
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// Directory or file names to skip; a path is skipped when any component equals one.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

/// Distance metric used by the vector index.
///
/// Fixed when an index is created; querying with a different metric is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    L2,
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
            Distance::L2 => "l2",
        };
        f.write_str(name)
    }
}

/// Storage configuration for the persisted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the vector table and the index manifest.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    #[serde(default)]
    pub distance: Distance,
}

impl StorageConfig {
    /// Directory LanceDB writes its tables into.
    pub fn vectors_path(&self) -> PathBuf {
        self.working_dir.join("vectors")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.working_dir.join(crate::rag::MANIFEST_FILE)
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> usize {
    500
}

fn default_top_k() -> usize {
    5
}

fn default_embed_batch_size() -> usize {
    32
}

fn default_system_prompt() -> String {
    "You are a helpful assistant that answers questions based only on the provided context. \
     If the context does not contain the answer, say so."
        .to_string()
}

fn default_extensions() -> Vec<String> {
    crate::patterns::markdown_extensions()
}

fn default_recursive() -> bool {
    true
}

fn default_max_concurrent_files() -> usize {
    4
}

fn default_exclude_patterns() -> Vec<String> {
    crate::patterns::default_exclude_patterns()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("./rag_storage")
}

fn default_collection_name() -> String {
    "docs".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key: None,
            generation: GenerationOptions::default(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding_model: EmbeddingModel::default(),
            max_tokens: default_max_tokens(),
            granularity: Granularity::default(),
            top_k: default_top_k(),
            embed_batch_size: default_embed_batch_size(),
            system_prompt: default_system_prompt(),
            indexer: IndexerConfig::default(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            recursive: default_recursive(),
            max_concurrent_files: default_max_concurrent_files(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            collection_name: default_collection_name(),
            distance: Distance::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `path` if given, otherwise use defaults.
    ///
    /// An explicitly named file that cannot be read is an error; silently falling
    /// back would run with settings the user did not ask for.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Checks numeric settings that would make indexing or retrieval meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.rag.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be at least 1".into()));
        }
        if self.rag.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be at least 1".into()));
        }
        if self.rag.embedding_model.dim == 0 {
            return Err(ConfigError::Invalid("embedding dimension must be at least 1".into()));
        }
        if self.rag.embed_batch_size == 0 {
            return Err(ConfigError::Invalid("embed_batch_size must be at least 1".into()));
        }
        if self.rag.indexer.max_concurrent_files == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_files must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the API key or a configuration error naming how to provide one.
    pub fn require_api_key(&self) -> Result<&str> {
        match self.llm.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigError::Invalid(
                "OpenAI API key is required. Set OPENAI_API_KEY environment variable or use --api-key"
                    .into(),
            )),
        }
    }
}
