//! dormouse-core - retrieval augmented generation over Markdown notes
//!
//! Provides the components behind the `dormouse` command line tool:
//! - Token-bounded chunking with pluggable tokenizers
//! - OpenAI-compatible provider for embeddings and chat completions
//! - Vector storage (embedded LanceDB or in-memory)
//! - Indexing orchestration and the retrieve-then-generate query pipeline
//! - Configuration management
//!
//! ## Primary API
//!
//! Most callers build a [`Config`], open a [`RagEngine`] and call
//! [`RagEngine::index_directory`] or [`RagEngine::answer`].

pub mod chunker;
pub mod config;
pub mod patterns;
pub mod provider;
pub mod rag;
pub mod tokenizer;

pub use chunker::{Chunker, Granularity};
pub use config::{Config, IndexerConfig};
pub use rag::{Answer, QueryMode, QueryOptions, RagEngine, RagError};

pub use provider::{ChatRequest, ChatResponse, Message, OpenAiProvider, Provider, ProviderError};
pub use tokenizer::{TiktokenTokenizer, Tokenizer, WhitespaceTokenizer};
