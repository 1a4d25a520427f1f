//! Retrieval Augmented Generation (RAG) system.
//!
//! Indexes a directory of Markdown notes into a vector store and answers
//! questions from the most similar chunks.
//!
//! # Architecture
//!
//! - [`RagEngine`]: orchestrates indexing and querying
//! - [`embedder`]: batches text through the provider's embedding endpoint
//! - [`store`]: vector store trait with LanceDB and in-memory backends
//! - [`indexer`]: file collection, run reports and progress events
//! - [`pipeline`]: query modes, context assembly and prompt construction
//! - [`manifest`]: records the embedding model and metric an index was built with
//!
//! # How It Works
//!
//! 1. **Indexing Phase**:
//!    - Each file is split into token-bounded chunks
//!    - Chunks are embedded in batches and upserted with id `{file_name}-{chunk}`
//!    - Chunks left over from a longer previous version of the file are removed
//!
//! 2. **Query Phase**:
//!    - The question is embedded and the top-k most similar chunks are retrieved
//!    - Chunks are joined into one context block, most similar first
//!    - One chat completion answers the question from that context

pub mod embedder;
pub mod indexer;
mod lancedb_store;
pub mod manifest;
mod memory_store;
pub mod pipeline;
pub mod store;
mod types;

pub use embedder::{Embedder, EmbedderError};
pub use indexer::{
    collect_files, collect_files_except, silent_progress, FileFailure, IndexReport, IndexerError,
    ProgressEvent, ProgressSink,
};
pub use lancedb_store::LanceDbStore;
pub use manifest::{IndexManifest, ManifestError, MANIFEST_FILE};
pub use memory_store::InMemoryStore;
pub use pipeline::{Answer, QueryMode, QueryOptions};
pub use store::{create_vector_store, StoreKind, VectorStore};
pub use types::{record_id, Document, SearchResult};

use crate::chunker::Chunker;
use crate::config::{Config, ConfigError, StorageConfig};
use crate::provider::{ChatRequest, ChatResponse, Provider, ProviderError};
use crate::tokenizer::{TiktokenTokenizer, Tokenizer, TokenizerError};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RagError {
    #[error("Embedder error: {0}")]
    Embedder(#[from] EmbedderError),

    #[error("Indexer error: {0}")]
    Indexer(#[from] IndexerError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Generation failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Working directory does not exist: {0}. Have you processed documents yet?")]
    NotIndexed(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RagError>;

fn store_err(e: anyhow::Error) -> RagError {
    RagError::Store(format!("{e:#}"))
}

/// Failure of one file, with the chunk being processed when it happened.
struct FileError {
    chunk: Option<usize>,
    error: RagError,
}

impl FileError {
    fn whole(error: impl Into<RagError>) -> Self {
        Self {
            chunk: None,
            error: error.into(),
        }
    }

    fn at(chunk: usize, error: impl Into<RagError>) -> Self {
        Self {
            chunk: Some(chunk),
            error: error.into(),
        }
    }
}

/// Checks that `storage` holds a processed index and returns its manifest.
///
/// Touches only the local filesystem, so callers can run it before any
/// credentials are checked or network calls made.
pub fn ensure_indexed(storage: &StorageConfig) -> Result<IndexManifest> {
    if !storage.working_dir.is_dir() {
        return Err(RagError::NotIndexed(storage.working_dir.clone()));
    }
    IndexManifest::load(&storage.manifest_path())?
        .ok_or_else(|| RagError::NotIndexed(storage.working_dir.clone()))
}

/// The main RAG engine orchestrating all components.
///
/// Cheap to clone; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct RagEngine {
    config: Arc<Config>,
    provider: Arc<dyn Provider>,
    embedder: Embedder,
    chunker: Arc<Chunker>,
    store: Arc<dyn VectorStore>,
    manifest_path: Option<PathBuf>,
}

impl RagEngine {
    /// Assembles an engine from explicit components.
    ///
    /// No manifest is maintained unless [`RagEngine::with_manifest`] is called.
    pub fn new(
        config: &Config,
        provider: Arc<dyn Provider>,
        tokenizer: Arc<dyn Tokenizer>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate()?;

        let embedder = Embedder::new(
            Arc::clone(&provider),
            config.rag.embedding_model.clone(),
            config.rag.embed_batch_size,
        );
        let chunker = Chunker::new(tokenizer, config.rag.max_tokens, config.rag.granularity);

        Ok(Self {
            config: Arc::new(config.clone()),
            provider,
            embedder,
            chunker: Arc::new(chunker),
            store,
            manifest_path: None,
        })
    }

    /// Opens the persistent index under `config.storage.working_dir`.
    ///
    /// Creates the LanceDB table on first use. An existing manifest must agree
    /// with the configured embedding dimension and distance metric.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use dormouse_core::{Config, provider::OpenAiProvider, rag::RagEngine};
    /// # use std::sync::Arc;
    /// # async fn example() {
    /// let mut config = Config::default();
    /// config.llm.api_key = Some("sk-...".to_string());
    /// let provider = Arc::new(OpenAiProvider::new(&config.llm).unwrap());
    /// let engine = RagEngine::open(&config, provider).await.unwrap();
    /// # }
    /// ```
    pub async fn open(config: &Config, provider: Arc<dyn Provider>) -> Result<Self> {
        config.validate()?;

        let manifest_path = config.storage.manifest_path();
        if let Some(manifest) = IndexManifest::load(&manifest_path)? {
            manifest.check_compatible(config)?;
        }

        let tokenizer = Arc::new(TiktokenTokenizer::for_model(&config.rag.embedding_model.name)?);
        let store = create_vector_store(
            StoreKind::Lance,
            &config.storage,
            config.rag.embedding_model.dim,
        )
        .await
        .map_err(store_err)?;

        info!(
            working_dir = %config.storage.working_dir.display(),
            tokenizer = tokenizer.name(),
            "Opened index"
        );

        Ok(Self::new(config, provider, tokenizer, store)?.with_manifest(manifest_path))
    }

    /// Like [`RagEngine::open`], but fails unless documents were processed before.
    pub async fn open_existing(config: &Config, provider: Arc<dyn Provider>) -> Result<Self> {
        ensure_indexed(&config.storage)?;
        Self::open(config, provider).await
    }

    /// Keeps the manifest at `path` up to date after each indexing run.
    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Indexes every Markdown file under `dir_path`.
    ///
    /// Up to `rag.indexer.max_concurrent_files` files are processed at once,
    /// each end-to-end by one worker. A file that fails is recorded in the
    /// report and the run continues. Once `cancel` fires no new file is
    /// started and the file in flight stops before its next write.
    ///
    /// # Errors
    ///
    /// Returns an error only when the directory cannot be walked or the
    /// manifest cannot be written.
    pub async fn index_directory(
        &self,
        dir_path: &Path,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<IndexReport> {
        let files = collect_files_except(
            dir_path,
            &self.config.rag.indexer,
            std::slice::from_ref(&self.config.storage.working_dir),
        )?;
        let total = files.len();
        info!(directory = %dir_path.display(), files = total, "Found files to index");

        let mut report = IndexReport {
            files_found: total,
            ..IndexReport::default()
        };

        let workers = self.config.rag.indexer.max_concurrent_files.max(1);
        let mut outcomes = stream::iter(files.into_iter().enumerate())
            .map(|(i, path)| {
                let progress = Arc::clone(&progress);
                async move {
                    if cancel.is_cancelled() {
                        return (path, Err(FileError::whole(RagError::Cancelled)));
                    }

                    progress(ProgressEvent::Started {
                        index: i + 1,
                        total,
                        path: &path,
                    });
                    let outcome = self.index_path(&path, cancel).await;
                    match &outcome {
                        Ok(chunks) => progress(ProgressEvent::Finished {
                            index: i + 1,
                            total,
                            path: &path,
                            chunks: *chunks,
                        }),
                        Err(FileError {
                            error: RagError::Cancelled,
                            ..
                        }) => {}
                        Err(failure) => {
                            let message = failure.error.to_string();
                            progress(ProgressEvent::Failed {
                                index: i + 1,
                                total,
                                path: &path,
                                error: &message,
                            });
                        }
                    }
                    (path, outcome)
                }
            })
            .buffer_unordered(workers);

        while let Some((path, outcome)) = outcomes.next().await {
            match outcome {
                Ok(chunks) => {
                    report.files_indexed += 1;
                    report.chunks_indexed += chunks;
                }
                Err(FileError {
                    error: RagError::Cancelled,
                    ..
                }) => report.cancelled = true,
                Err(FileError { chunk, error }) => {
                    error!(
                        file = %path.display(),
                        chunk = ?chunk,
                        error = %error,
                        "Failed to index file"
                    );
                    report.failures.push(FileFailure {
                        path,
                        chunk,
                        error: error.to_string(),
                    });
                }
            }
        }
        drop(outcomes);

        report.cancelled |= cancel.is_cancelled();
        report.failures.sort_by(|a, b| a.path.cmp(&b.path));

        if report.cancelled {
            warn!(
                indexed = report.files_indexed,
                total, "Indexing cancelled before all files were processed"
            );
        }
        info!(
            files = report.files_indexed,
            chunks = report.chunks_indexed,
            failures = report.failures.len(),
            "Indexing finished"
        );

        self.update_manifest().await?;
        Ok(report)
    }

    /// Indexes a single file, returning the number of chunks written.
    pub async fn index_file(&self, file_path: &Path, cancel: &CancellationToken) -> Result<usize> {
        let chunks = self
            .index_path(file_path, cancel)
            .await
            .map_err(|failure| failure.error)?;
        self.update_manifest().await?;
        Ok(chunks)
    }

    async fn index_path(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<usize, FileError> {
        let text = indexer::read_text(path).await.map_err(FileError::whole)?;
        let chunks = self.split(&text)?;
        let source = path.to_string_lossy();

        if chunks.is_empty() {
            warn!(file = %path.display(), "File has no content, nothing to embed");
        }

        let mut written = 0;
        for batch in chunks.chunks(self.embedder.batch_size()) {
            if cancel.is_cancelled() {
                return Err(FileError::at(written, RagError::Cancelled));
            }

            let embeddings = tokio::select! {
                _ = cancel.cancelled() => return Err(FileError::at(written, RagError::Cancelled)),
                result = self.embedder.embed_batch(batch) => {
                    result.map_err(|e| FileError::at(written, e))?
                }
            };

            let documents: Vec<Document> = batch
                .iter()
                .zip(embeddings)
                .enumerate()
                .map(|(offset, (content, embedding))| {
                    Document::chunk(path, written + offset, content.as_str(), embedding)
                })
                .collect();

            self.store
                .upsert(documents)
                .await
                .map_err(|e| FileError::at(written, store_err(e)))?;

            written += batch.len();
            debug!(file = %path.display(), chunks = written, "Wrote chunk batch");
        }

        self.store
            .remove_stale(&source, chunks.len())
            .await
            .map_err(|e| FileError::whole(store_err(e)))?;

        Ok(chunks.len())
    }

    /// Chunks `text` without suspending.
    ///
    /// Blank input yields no chunks; there is nothing worth embedding.
    fn split(&self, text: &str) -> std::result::Result<Vec<String>, FileError> {
        let mut chunks = Vec::new();
        for chunk in self.chunker.chunks(text) {
            let chunk = chunk.map_err(|e| FileError::at(chunks.len(), e))?;
            chunks.push(chunk);
        }
        if chunks.iter().all(|chunk| chunk.trim().is_empty()) {
            chunks.clear();
        }
        Ok(chunks)
    }

    async fn update_manifest(&self) -> Result<()> {
        let Some(path) = &self.manifest_path else {
            return Ok(());
        };

        let mut manifest =
            IndexManifest::load(path)?.unwrap_or_else(|| IndexManifest::new(&self.config));
        let files = self.store.get_indexed_paths().await.map_err(store_err)?.len();
        let chunks = self.store.count().await.map_err(store_err)?;
        manifest.record_totals(files, chunks);
        manifest.save(path)?;
        Ok(())
    }

    /// Retrieves the `options.top_k` chunks most similar to `question`.
    ///
    /// An empty index returns no results without calling the embedding model.
    pub async fn retrieve(&self, question: &str, options: &QueryOptions) -> Result<Vec<SearchResult>> {
        if options.mode.uses_graph() {
            debug!(mode = %options.mode, "Graph retrieval unavailable, serving with vector search");
        }

        let count = self.store.count().await.map_err(store_err)?;
        if count == 0 {
            debug!("Knowledge base is empty");
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(question).await?;
        let results = self
            .store
            .search(&query_embedding, options.top_k)
            .await
            .map_err(store_err)?;

        for (i, result) in results.iter().enumerate() {
            debug!(
                rank = i + 1,
                score = result.score,
                source = ?result.document.source(),
                "Retrieved chunk"
            );
        }
        info!(results = results.len(), "Retrieved context");
        Ok(results)
    }

    /// Answers `question` from the index in a single completion.
    pub async fn answer(&self, question: &str, options: &QueryOptions) -> Result<Answer> {
        self.generate(question, options, false, |_| {}).await
    }

    /// Answers `question`, handing each fragment to `on_fragment` as it arrives.
    ///
    /// The returned text equals the concatenation of every fragment.
    pub async fn answer_stream<F>(
        &self,
        question: &str,
        options: &QueryOptions,
        on_fragment: F,
    ) -> Result<Answer>
    where
        F: FnMut(&str) + Send,
    {
        self.generate(question, options, true, on_fragment).await
    }

    async fn generate<F>(
        &self,
        question: &str,
        options: &QueryOptions,
        stream: bool,
        mut on_fragment: F,
    ) -> Result<Answer>
    where
        F: FnMut(&str) + Send,
    {
        let results = self.retrieve(question, options).await?;
        if results.is_empty() {
            return Ok(Answer::NotFound);
        }

        let context = pipeline::build_context(&results);
        let messages = pipeline::build_messages(&self.config.rag.system_prompt, &context, question);
        let request = ChatRequest::new(&self.config.llm.model, messages)
            .with_options(self.config.llm.generation.clone())
            .with_stream(stream);

        let mut text = String::new();
        self.provider
            .chat(
                request,
                Box::new(|response: ChatResponse| {
                    if !response.content.is_empty() {
                        on_fragment(&response.content);
                        text.push_str(&response.content);
                    }
                }),
            )
            .await?;

        Ok(Answer::Found {
            text,
            sources: pipeline::collect_sources(&results),
        })
    }

    /// Returns the total number of documents (chunks) in the knowledge base.
    pub async fn count(&self) -> Result<usize> {
        self.store.count().await.map_err(store_err)
    }

    /// Removes all documents from the knowledge base.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await.map_err(store_err)?;
        self.update_manifest().await
    }

    /// Returns all unique file paths that have been indexed.
    pub async fn get_indexed_paths(&self) -> Result<Vec<String>> {
        self.store.get_indexed_paths().await.map_err(store_err)
    }

    /// Removes every chunk whose source is `source_path` or lies under it.
    pub async fn remove_from_knowledge_base(&self, source_path: &str) -> Result<usize> {
        let removed = self.store.remove_by_source(source_path).await.map_err(store_err)?;
        info!(source = source_path, removed, "Removed documents");
        self.update_manifest().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distance;
    use crate::provider::MockProvider;
    use crate::tokenizer::WhitespaceTokenizer;
    use std::fs;
    use std::sync::Mutex;

    const DIM: usize = 64;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.rag.embedding_model.name = "mock-embed".to_string();
        config.rag.embedding_model.dim = DIM;
        config.rag.max_tokens = 8;
        config.rag.embed_batch_size = 2;
        config
    }

    struct Harness {
        engine: RagEngine,
        provider: Arc<MockProvider>,
        store: Arc<InMemoryStore>,
    }

    fn harness_with(config: &Config, provider: MockProvider) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(InMemoryStore::new(Distance::Cosine));
        let engine = RagEngine::new(
            config,
            provider.clone(),
            Arc::new(WhitespaceTokenizer),
            store.clone(),
        )
        .unwrap();
        Harness {
            engine,
            provider,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(&test_config(), MockProvider::new(DIM))
    }

    fn write(root: &Path, name: &str, content: &str) -> PathBuf {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn notes(root: &Path) {
        write(
            root,
            "rust.md",
            "Rust ownership moves values between bindings.\n\nBorrowing lends references without moving.",
        );
        write(
            root,
            "bread.md",
            "Knead the dough for ten minutes.\n\nBake bread at high heat until golden.",
        );
        write(root, "sub/tea.md", "Green tea steeps at eighty degrees.");
    }

    async fn ids(store: &InMemoryStore) -> Vec<String> {
        let results = store.search(&vec![1.0; DIM], 1_000).await.unwrap();
        let mut ids: Vec<String> = results.into_iter().map(|r| r.document.id).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_index_directory_writes_one_record_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        let h = harness();

        let report = h
            .engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        assert_eq!(report.files_found, 3);
        assert_eq!(report.files_indexed, 3);
        assert_eq!(report.chunks_indexed, 5);
        assert!(report.failures.is_empty());
        assert!(!report.cancelled);
        assert_eq!(
            ids(&h.store).await,
            vec!["bread.md-0", "bread.md-1", "rust.md-0", "rust.md-1", "tea.md-0"]
        );
    }

    #[tokio::test]
    async fn test_reindexing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        let h = harness();
        let cancel = CancellationToken::new();

        h.engine.index_directory(dir.path(), &cancel, silent_progress()).await.unwrap();
        let first = ids(&h.store).await;
        h.engine.index_directory(dir.path(), &cancel, silent_progress()).await.unwrap();

        assert_eq!(ids(&h.store).await, first);
        assert_eq!(h.engine.count().await.unwrap(), first.len());
    }

    #[tokio::test]
    async fn test_shrunk_file_drops_tail_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "log.md",
            "one two three four five\n\nsix seven eight nine ten\n\neleven twelve thirteen fourteen fifteen",
        );
        let h = harness();
        let cancel = CancellationToken::new();

        assert_eq!(h.engine.index_file(&path, &cancel).await.unwrap(), 3);
        fs::write(&path, "one two three four five").unwrap();
        assert_eq!(h.engine.index_file(&path, &cancel).await.unwrap(), 1);
        assert_eq!(ids(&h.store).await, vec!["log.md-0"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_file_does_not_abort_run() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        fs::write(dir.path().join("broken.md"), [0xff, 0xfe, 0xfd]).unwrap();
        let h = harness();

        let report = h
            .engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        assert_eq!(report.files_found, 4);
        assert_eq!(report.files_indexed, 3);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("broken.md"));
        assert!(!report.all_failed());
    }

    #[tokio::test]
    async fn test_embedding_failure_reports_chunk() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ok.md", "fine words here");
        write(dir.path(), "bad.md", "a b c d e\n\nf g h i j\n\nPOISON here");
        let h = harness_with(&test_config(), MockProvider::new(DIM).failing_on("POISON"));

        let report = h
            .engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].chunk, Some(2));
        // The batch written before the failure stays in place.
        assert!(ids(&h.store).await.contains(&"bad.md-1".to_string()));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_indexes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h
            .engine
            .index_directory(dir.path(), &cancel, silent_progress())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.files_indexed, 0);
        assert!(report.failures.is_empty());
        assert_eq!(h.provider.embed_calls(), 0);
        assert_eq!(h.engine.count().await.unwrap(), 0);
    }

    const SIX_PARAGRAPHS: &str = "Alpha one two three four.\n\nBravo one two three four.\n\n\
        Saffron one two three four.\n\nDelta one two three four.\n\n\
        Echo one two three four.\n\nFoxtrot one two three four.";

    /// Two files indexed one at a time, with stale tail records for `a.md`
    /// left over from a longer earlier version.
    async fn mid_run_setup(provider: MockProvider) -> (tempfile::TempDir, Harness) {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.md", SIX_PARAGRAPHS);
        write(dir.path(), "b.md", "Bread needs flour and water.");

        let mut config = test_config();
        config.rag.indexer.max_concurrent_files = 1;
        let h = harness_with(&config, provider);
        h.store
            .upsert(vec![
                Document::chunk(&a, 6, "old tail", vec![0.5; DIM]),
                Document::chunk(&a, 7, "old tail", vec![0.5; DIM]),
            ])
            .await
            .unwrap();
        (dir, h)
    }

    #[tokio::test]
    async fn test_cancel_during_embed_abandons_rest_of_file() {
        let cancel = CancellationToken::new();
        let provider = MockProvider::new(DIM).stalling_on("Saffron", cancel.clone());
        let (dir, h) = mid_run_setup(provider).await;

        let report = h
            .engine
            .index_directory(dir.path(), &cancel, silent_progress())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.files_indexed, 0);
        assert!(report.failures.is_empty());
        assert_eq!(h.provider.embed_calls(), 2);
        // First batch kept, nothing after it, tail not pruned, b.md never started.
        assert_eq!(
            ids(&h.store).await,
            vec!["a.md-0", "a.md-1", "a.md-6", "a.md-7"]
        );
    }

    #[tokio::test]
    async fn test_cancel_between_batches_stops_before_next_batch() {
        let cancel = CancellationToken::new();
        let provider = MockProvider::new(DIM).cancelling_on("Saffron", cancel.clone());
        let (dir, h) = mid_run_setup(provider).await;

        let report = h
            .engine
            .index_directory(dir.path(), &cancel, silent_progress())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.files_indexed, 0);
        assert_eq!(h.provider.embed_calls(), 2);
        assert_eq!(
            ids(&h.store).await,
            vec!["a.md-0", "a.md-1", "a.md-2", "a.md-3", "a.md-6", "a.md-7"]
        );
    }

    #[tokio::test]
    async fn test_progress_events_cover_every_file() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressSink = Arc::new(move |event: ProgressEvent<'_>| {
            if let ProgressEvent::Finished { total, chunks, .. } = event {
                sink.lock().unwrap().push((total, chunks));
            }
        });

        h.engine
            .index_directory(dir.path(), &CancellationToken::new(), progress)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(total, _)| *total == 3));
        assert_eq!(seen.iter().map(|(_, chunks)| chunks).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_empty_file_counts_without_embedding() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "empty.md", "   \n\n  ");
        let h = harness();

        let report = h
            .engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.chunks_indexed, 0);
        assert_eq!(h.provider.embed_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_index_is_not_found() {
        let h = harness();
        let answer = h
            .engine
            .answer("What is ownership?", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, Answer::NotFound);
        assert_eq!(h.provider.chat_calls(), 0);
    }

    #[tokio::test]
    async fn test_top_k_larger_than_index() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "one.md", "single chunk only");
        write(dir.path(), "two.md", "another chunk here");
        let h = harness();
        h.engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        let options = QueryOptions {
            top_k: 5,
            ..QueryOptions::default()
        };
        let results = h.engine.retrieve("chunk", &options).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_answer_uses_retrieved_context() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        let h = harness_with(
            &test_config(),
            MockProvider::new(DIM).with_answer("Ownership moves values."),
        );
        h.engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        let options = QueryOptions {
            top_k: 1,
            ..QueryOptions::default()
        };
        let answer = h
            .engine
            .answer("How does Rust ownership move values?", &options)
            .await
            .unwrap();

        match answer {
            Answer::Found { text, sources } => {
                assert_eq!(text, "Ownership moves values.");
                assert_eq!(sources.len(), 1);
                assert!(sources[0].ends_with("rust.md"));
            }
            Answer::NotFound => panic!("expected an answer"),
        }

        let request = h.provider.last_request().unwrap();
        assert!(!request.stream);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, "system");
        let prompt = &request.messages[1].content;
        assert!(prompt.starts_with("Context:\n[chunk 1 · "));
        assert!(prompt.contains("rust.md]\nRust ownership moves values between bindings."));
        assert!(request.messages[1]
            .content
            .ends_with("\n\nQuestion: How does Rust ownership move values?"));
    }

    #[tokio::test]
    async fn test_stream_matches_non_stream() {
        let dir = tempfile::tempdir().unwrap();
        notes(dir.path());
        let h = harness_with(
            &test_config(),
            MockProvider::new(DIM).with_answer("Bake it hot and long."),
        );
        h.engine
            .index_directory(dir.path(), &CancellationToken::new(), silent_progress())
            .await
            .unwrap();
        let options = QueryOptions::default();

        let mut fragments = Vec::new();
        let streamed = h
            .engine
            .answer_stream("bread", &options, |fragment| fragments.push(fragment.to_string()))
            .await
            .unwrap();
        let whole = h.engine.answer("bread", &options).await.unwrap();

        assert!(fragments.len() > 1);
        assert_eq!(streamed, whole);
        if let Answer::Found { text, .. } = streamed {
            assert_eq!(fragments.concat(), text);
        }
    }

    #[tokio::test]
    async fn test_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        let result = h
            .engine
            .index_directory(&dir.path().join("absent"), &CancellationToken::new(), silent_progress())
            .await;
        assert!(matches!(result, Err(RagError::Indexer(IndexerError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_manifest_written_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let notes_dir = dir.path().join("notes");
        notes(&notes_dir);
        let manifest_path = dir.path().join("store").join(MANIFEST_FILE);
        let h = harness();
        let engine = h.engine.clone().with_manifest(&manifest_path);

        engine
            .index_directory(&notes_dir, &CancellationToken::new(), silent_progress())
            .await
            .unwrap();

        let manifest = IndexManifest::load(&manifest_path).unwrap().unwrap();
        assert_eq!(manifest.embedding_dim, DIM);
        assert_eq!(manifest.files_indexed, 3);
        assert_eq!(manifest.chunks_indexed, 5);
    }

    #[test]
    fn test_ensure_indexed_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            working_dir: dir.path().join("never-processed"),
            ..StorageConfig::default()
        };
        assert!(matches!(ensure_indexed(&storage), Err(RagError::NotIndexed(_))));

        fs::create_dir_all(&storage.working_dir).unwrap();
        assert!(matches!(ensure_indexed(&storage), Err(RagError::NotIndexed(_))));

        IndexManifest::new(&Config::default())
            .save(&storage.manifest_path())
            .unwrap();
        assert!(ensure_indexed(&storage).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.rag.top_k = 0;
        let result = RagEngine::new(
            &config,
            Arc::new(MockProvider::new(DIM)),
            Arc::new(WhitespaceTokenizer),
            Arc::new(InMemoryStore::new(Distance::Cosine)),
        );
        assert!(matches!(result, Err(RagError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_lancedb_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let notes_dir = dir.path().join("notes");
        notes(&notes_dir);
        let mut config = test_config();
        config.storage.working_dir = dir.path().join("rag_storage");

        let engine = RagEngine::open(&config, Arc::new(MockProvider::new(DIM)))
            .await
            .unwrap();
        let report = engine
            .index_directory(&notes_dir, &CancellationToken::new(), silent_progress())
            .await
            .unwrap();
        assert_eq!(report.files_indexed, 3);

        let reopened = RagEngine::open_existing(&config, Arc::new(MockProvider::new(DIM)))
            .await
            .unwrap();
        let count = reopened.count().await.unwrap();
        assert!(count > 0);
        let results = reopened
            .retrieve("green tea", &QueryOptions::default())
            .await
            .unwrap();
        assert!(!results.is_empty());

        let mut wider = config.clone();
        wider.rag.embedding_model.dim = DIM * 2;
        assert!(matches!(
            RagEngine::open(&wider, Arc::new(MockProvider::new(DIM * 2))).await,
            Err(RagError::Manifest(_))
        ));
    }
}
