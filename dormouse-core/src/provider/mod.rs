//! LLM provider abstraction layer.
//!
//! This module defines a common interface for model backends that provide
//! chat completions and embeddings. The shipped backend speaks the
//! OpenAI-compatible HTTP API.

mod types;
pub mod openai;
pub(crate) mod retry;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export common types
pub use types::{
    Provider,
    ProviderError,
    Result,
    ChatRequest,
    ChatResponse,
    Message,
};

// Re-export provider implementations
pub use openai::OpenAiProvider;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockProvider;
