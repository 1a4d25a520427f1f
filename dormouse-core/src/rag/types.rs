use std::collections::HashMap;
use std::path::Path;

/// Metadata key holding the full path of the file a chunk came from.
pub const SOURCE_KEY: &str = "source";
/// Metadata key holding the chunk's sequence number within its file.
pub const CHUNK_KEY: &str = "chunk";

/// A document stored in the vector database.
///
/// One document per chunk. The text is stored verbatim next to its embedding so
/// retrieval never has to go back to the source file.
///
/// # Example
///
/// ```no_run
/// # use dormouse_core::rag::Document;
/// let embedding = vec![0.1, 0.2, 0.3];
/// let doc = Document::new("notes.md-0", "Hello world", embedding)
///     .with_metadata("source", "docs/notes.md")
///     .with_metadata("chunk", "0");
/// ```
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds the record for chunk `index` of the file at `path`.
    pub fn chunk(path: &Path, index: usize, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self::new(record_id(path, index), content, embedding)
            .with_metadata(SOURCE_KEY, path.to_string_lossy())
            .with_metadata(CHUNK_KEY, index.to_string())
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(SOURCE_KEY).map(String::as_str)
    }

    pub fn chunk_index(&self) -> Option<usize> {
        self.metadata.get(CHUNK_KEY).and_then(|value| value.parse().ok())
    }
}

/// Record id for chunk `index` of `path`: `"{file_name}-{index}"`.
///
/// Only the file name takes part, so re-indexing a file overwrites its old
/// records. Two files with the same name in different directories share ids.
pub fn record_id(path: &Path, index: usize) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_else(|| path.to_string_lossy());
    format!("{name}-{index}")
}

/// A search result containing a document and its similarity score.
///
/// Returned by vector search operations, ordered by descending score. For the
/// L2 metric the score is the negated distance so "higher is closer" holds for
/// every metric.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub document: Document,
    pub score: f32,
}
