//! Token counting for chunk budgeting.
//!
//! The chunker only needs to know how many tokens a piece of text costs; it
//! never needs the tokens themselves. [`Tokenizer`] is that narrow seam, with a
//! BPE implementation matching the OpenAI embedding models and a whitespace
//! implementation for tests and offline use.

use thiserror::Error;
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// Errors that can occur while counting tokens.
#[derive(Debug, Error)]
pub enum TokenizerError {
    /// The BPE tables for an encoding could not be loaded.
    #[error("Failed to load encoding '{encoding}': {message}")]
    Load { encoding: String, message: String },

    /// The tokenizer rejected the input text.
    #[error("Failed to tokenize text: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;

/// Counts tokens the way a particular model does.
///
/// Implementations must be deterministic: the same text always yields the
/// same count for a given tokenizer.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> Result<usize>;

    /// Short identifier shown in logs.
    fn name(&self) -> &str;
}

/// BPE token counter backed by `tiktoken-rs`.
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
    encoding: String,
}

impl TiktokenTokenizer {
    /// The `cl100k_base` encoding used by the `text-embedding-3-*` family.
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| TokenizerError::Load {
            encoding: "cl100k_base".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            bpe,
            encoding: "cl100k_base".to_string(),
        })
    }

    /// Picks the encoding for `model`, falling back to `cl100k_base` for names
    /// tiktoken does not know (self-hosted or renamed models).
    pub fn for_model(model: &str) -> Result<Self> {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Ok(Self {
                bpe,
                encoding: model.to_string(),
            }),
            Err(e) => {
                debug!(model, error = %e, "Unknown model for tiktoken, using cl100k_base");
                Self::cl100k()
            }
        }
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.bpe.encode_ordinary(text).len())
    }

    fn name(&self) -> &str {
        &self.encoding
    }
}

/// Counts whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(text.split_whitespace().count())
    }

    fn name(&self) -> &str {
        "whitespace"
    }
}
