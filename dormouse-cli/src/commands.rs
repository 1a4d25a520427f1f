use anyhow::{bail, Context, Result};
use colored::Colorize;
use dormouse_core::config::Config;
use dormouse_core::rag::{
    self, create_vector_store, IndexManifest, ProgressEvent, ProgressSink, RagError, StoreKind,
};
use dormouse_core::{Answer, OpenAiProvider, QueryMode, QueryOptions, RagEngine};
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const RULE_WIDTH: usize = 80;

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

fn open_provider(config: &Config) -> Result<Arc<OpenAiProvider>> {
    config.require_api_key()?;
    let provider = OpenAiProvider::new(&config.llm).context("Failed to create API client")?;
    Ok(Arc::new(provider))
}

fn interrupted() -> ExitCode {
    eprintln!("{}", "Interrupted by user".yellow());
    ExitCode::from(130)
}

pub async fn process(config: &Config, directory: &Path, cancel: &CancellationToken) -> Result<ExitCode> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!(directory = %directory.display(), "Processing Markdown files");
    info!(working_dir = %config.storage.working_dir.display(), "Working directory");
    info!(
        recursive = config.rag.indexer.recursive,
        max_workers = config.rag.indexer.max_concurrent_files,
        max_tokens = config.rag.max_tokens,
        granularity = %config.rag.granularity,
        "Indexing options"
    );

    let provider = open_provider(config)?;
    let engine = RagEngine::open(config, provider).await?;

    let progress: ProgressSink = Arc::new(|event: ProgressEvent<'_>| match event {
        ProgressEvent::Started { index, total, path } => {
            let name = path.file_name().unwrap_or(path.as_os_str()).to_string_lossy();
            println!("{} Processing {}...", format!("[{index}/{total}]").dimmed(), name);
        }
        ProgressEvent::Finished { path, chunks, .. } => {
            println!("  {} {} ({} chunks)", "✓".green(), path.display(), chunks);
        }
        ProgressEvent::Failed { path, error, .. } => {
            println!("  {} {}: {}", "✗".red(), path.display(), error);
        }
    });

    let report = engine.index_directory(directory, cancel, progress).await?;

    println!();
    if report.files_found == 0 {
        println!("{}", "No Markdown files found.".yellow());
    }
    println!(
        "{} Indexed {} of {} files ({} chunks)",
        "→".blue(),
        report.files_indexed.to_string().bold(),
        report.files_found,
        report.chunks_indexed
    );
    for failure in &report.failures {
        let at = failure
            .chunk
            .map(|chunk| format!(" (chunk {chunk})"))
            .unwrap_or_default();
        println!("  {} {}{}: {}", "✗".red(), failure.path.display(), at, failure.error);
    }

    if report.cancelled {
        return Ok(interrupted());
    }
    if report.all_failed() {
        bail!("Every file failed to index");
    }

    println!("{}", "✓ Processing complete!".green().bold());
    println!("You can now query your Markdown files using:");
    println!("  {}", "dormouse query \"your question here\"".bold());
    Ok(ExitCode::SUCCESS)
}

pub async fn query(
    config: &Config,
    question: &str,
    mode: QueryMode,
    stream: bool,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    info!(question, mode = %mode, "Query");

    if let Err(e) = rag::ensure_indexed(&config.storage) {
        if matches!(e, RagError::NotIndexed(_)) {
            eprintln!(
                "Run: {} to process your Markdown files first",
                "dormouse process <directory>".bold()
            );
        }
        return Err(e.into());
    }

    let provider = open_provider(config)?;
    let engine = RagEngine::open_existing(config, provider).await?;
    let options = QueryOptions {
        top_k: config.rag.top_k,
        mode,
        stream,
    };

    info!("Executing query...");
    let answer = tokio::select! {
        _ = cancel.cancelled() => return Ok(interrupted()),
        answer = answer_question(&engine, question, &options) => answer?,
    };

    match answer {
        Answer::Found { text, sources } => {
            if !stream {
                print_answer_header();
                println!("{text}");
            }
            println!("{}", rule());
            if !sources.is_empty() {
                println!("{}", "Sources:".bold());
                for source in sources {
                    println!("  {} {}", "•".cyan(), source);
                }
            }
            println!();
        }
        Answer::NotFound => {
            println!("{}", "No relevant documents found".yellow());
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn answer_question(
    engine: &RagEngine,
    question: &str,
    options: &QueryOptions,
) -> dormouse_core::rag::Result<Answer> {
    if !options.stream {
        return engine.answer(question, options).await;
    }

    let mut started = false;
    let answer = engine
        .answer_stream(question, options, |fragment| {
            if !started {
                print_answer_header();
                started = true;
            }
            print!("{fragment}");
            std::io::stdout().flush().ok();
        })
        .await?;

    if let Answer::Found { .. } = answer {
        if !started {
            print_answer_header();
        }
        println!();
    }
    Ok(answer)
}

fn print_answer_header() {
    println!("\n{}", rule());
    println!("{}", "ANSWER:".bold());
    println!("{}", rule());
}

pub async fn info(config: &Config) -> Result<ExitCode> {
    let storage = &config.storage;

    println!("\n{}", rule());
    println!("{}", "DORMOUSE - RAG System Information".bold().green());
    println!("{}", rule());

    println!("\nWorking Directory: {}", storage.working_dir.display());

    if storage.working_dir.is_dir() {
        println!("Status: {}", "✓ Initialized".green());
        let (files, dirs) = count_entries(&storage.working_dir);
        println!("Files: {files}");
        println!("Directories: {dirs}");

        match IndexManifest::load(&storage.manifest_path()) {
            Ok(Some(manifest)) => print_manifest(config, &manifest).await,
            Ok(None) => println!("{}", "No index manifest found.".yellow()),
            Err(e) => println!("{} {}", "Could not read index manifest:".yellow(), e),
        }
    } else {
        println!("Status: {}", "✗ Not initialized".red());
        println!(
            "Run '{}' to initialize",
            "dormouse process <directory>".bold()
        );
    }

    println!("\n{}", "Configuration:".bold());
    println!("  Model:               {}", config.llm.model.cyan());
    println!("  Embedding Model:     {}", config.rag.embedding_model.name.cyan());
    println!("  Embedding Dimension: {}", config.rag.embedding_model.dim);
    let key_status = if config.require_api_key().is_ok() {
        "✓ Set".green()
    } else {
        "✗ Not set".red()
    };
    println!("  API Key:             {key_status}");
    println!("  Base URL:            {}", config.llm.base_url);
    println!("  Chunk Tokens:        {}", config.rag.max_tokens);
    println!("  Granularity:         {}", config.rag.granularity);
    println!("  Top K:               {}", config.rag.top_k);
    println!("  Distance:            {}", storage.distance);
    println!("{}\n", rule());

    Ok(ExitCode::SUCCESS)
}

async fn print_manifest(config: &Config, manifest: &IndexManifest) {
    println!("\n{}", "Index:".bold());
    println!("  Embedding Model:     {}", manifest.embedding_model);
    println!("  Embedding Dimension: {}", manifest.embedding_dim);
    println!("  Distance:            {}", manifest.distance);
    println!("  Files Indexed:       {}", manifest.files_indexed);

    match create_vector_store(StoreKind::Lance, &config.storage, manifest.embedding_dim).await {
        Ok(store) => match store.count().await {
            Ok(count) => println!("  Records:             {count}"),
            Err(e) => println!("  Records:             {} ({e:#})", "unavailable".yellow()),
        },
        Err(e) => println!("  Records:             {} ({e:#})", "unavailable".yellow()),
    }

    if let Err(e) = manifest.check_compatible(config) {
        println!("  {} {}", "Warning:".yellow().bold(), e);
    }
}

/// Counts files and directories below `root`, not counting `root` itself.
fn count_entries(root: &Path) -> (usize, usize) {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .fold((0, 0), |(files, dirs), entry| {
            if entry.file_type().is_dir() {
                (files, dirs + 1)
            } else {
                (files + 1, dirs)
            }
        })
}
