//! Query-side types and prompt assembly.

use super::types::SearchResult;
use crate::provider::Message;
use std::fmt;
use std::str::FromStr;

/// Header line opening each retrieved chunk in the prompt context.
///
/// Chunk text may hold thematic breaks and headings; boundaries are marked
/// only by these numbered lines.
pub fn chunk_header(position: usize, source: &str) -> String {
    format!("[chunk {position} · {source}]")
}

/// Retrieval strategy requested by the caller.
///
/// The graph-based modes need an entity graph that the vector index does not
/// build; vector retrieval serves every mode as top-k similarity search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMode {
    Local,
    Global,
    #[default]
    Hybrid,
    Naive,
    Mix,
}

impl QueryMode {
    pub const ALL: [QueryMode; 5] = [
        QueryMode::Local,
        QueryMode::Global,
        QueryMode::Hybrid,
        QueryMode::Naive,
        QueryMode::Mix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Naive => "naive",
            QueryMode::Mix => "mix",
        }
    }

    /// `true` for modes that would consult an entity graph.
    pub fn uses_graph(&self) -> bool {
        !matches!(self, QueryMode::Naive)
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueryMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "Unknown query mode '{s}'. Expected one of: local, global, hybrid, naive, mix"
                )
            })
    }
}

/// Per-query settings.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub mode: QueryMode,
    pub stream: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            mode: QueryMode::default(),
            stream: false,
        }
    }
}

/// Result of answering a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Generated text plus the distinct sources of the chunks it was given.
    Found { text: String, sources: Vec<String> },
    /// Retrieval returned nothing, so no generation was attempted.
    NotFound,
}

/// Lays out chunk texts in result order (most similar first), each under its
/// own numbered [`chunk_header`].
pub fn build_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let source = result.document.source().unwrap_or("unknown");
            format!("{}\n{}", chunk_header(i + 1, source), result.document.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Distinct sources of `results`, in first-seen order.
pub fn collect_sources(results: &[SearchResult]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for source in results.iter().filter_map(|r| r.document.source()) {
        if !sources.iter().any(|seen| seen == source) {
            sources.push(source.to_string());
        }
    }
    sources
}

/// System instruction followed by the context-and-question user turn.
pub fn build_messages(system_prompt: &str, context: &str, question: &str) -> Vec<Message> {
    vec![
        Message::system(system_prompt),
        Message::user(format!("Context:\n{context}\n\nQuestion: {question}")),
    ]
}
