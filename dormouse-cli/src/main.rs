use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use colored::Colorize;
use dormouse_core::config::Config;
use dormouse_core::{Granularity, QueryMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;

const EXAMPLES: &str = "\
Examples:
  # Process a directory of markdown files
  dormouse process ./my_notes

  # Process with custom working directory
  dormouse process ./my_notes --working-dir ./my_rag_storage

  # Query processed content
  dormouse query \"What are the main topics discussed?\"

  # Stream the answer as it is generated
  dormouse query \"Explain the concept\" --stream --working-dir ./my_rag_storage";

#[derive(Parser)]
#[command(name = "dormouse")]
#[command(about = "Index a directory of Markdown files and ask it questions", long_about = None)]
#[command(version, after_help = EXAMPLES)]
struct Cli {
    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Chat model used to answer questions [default: gpt-4o-mini]
    #[arg(long, env = "OPENAI_MODEL", global = true)]
    model: Option<String>,

    /// Embedding model [default: text-embedding-3-large]
    #[arg(long, env = "EMBEDDING_MODEL", global = true)]
    embedding_model: Option<String>,

    /// Embedding dimension [default: 3072]
    #[arg(long, env = "EMBEDDING_DIM", global = true)]
    embedding_dim: Option<usize>,

    /// Working directory for RAG storage [default: ./rag_storage]
    #[arg(short, long, visible_alias = "db-path", global = true)]
    working_dir: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Process a directory of Markdown files")]
    Process {
        #[arg(help = "Directory containing Markdown files")]
        directory: PathBuf,

        /// Token budget per chunk
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Chunking unit: paragraph or word
        #[arg(long)]
        granularity: Option<Granularity>,

        /// Process subdirectories recursively [default: true]
        #[arg(short, long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
        recursive: Option<bool>,

        /// Maximum number of files processed concurrently
        #[arg(long)]
        max_workers: Option<usize>,
    },

    #[command(about = "Query the processed Markdown files")]
    Query {
        #[arg(help = "Question to ask")]
        question: String,

        /// Query mode: local, global, hybrid, naive or mix
        #[arg(long, default_value = "hybrid")]
        mode: QueryMode,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,

        /// Number of chunks to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    #[command(about = "Show information about the RAG system")]
    Info,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => return usage_error(e),
    };
    init_tracing(cli.verbose);

    let Some(command) = cli.command.as_ref() else {
        // Printing help can only fail on a closed stdout.
        Cli::command().print_help().ok();
        println!();
        return ExitCode::from(1);
    };

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted by user");
            watcher.cancel();
        }
    });

    match run(&cli, command, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(1)
        }
    }
}

/// `--help` and `--version` succeed; any other parse failure exits 1.
fn usage_exit_code(error: &clap::Error) -> u8 {
    if error.use_stderr() {
        1
    } else {
        0
    }
}

fn usage_error(error: clap::Error) -> ExitCode {
    // Printing can only fail on a closed stream.
    error.print().ok();
    ExitCode::from(usage_exit_code(&error))
}

async fn run(cli: &Cli, command: &Commands, cancel: &CancellationToken) -> Result<ExitCode> {
    let mut config = resolve_config(cli)?;

    match command {
        Commands::Process {
            directory,
            max_tokens,
            granularity,
            recursive,
            max_workers,
        } => {
            if let Some(max_tokens) = max_tokens {
                config.rag.max_tokens = *max_tokens;
            }
            if let Some(granularity) = granularity {
                config.rag.granularity = *granularity;
            }
            if let Some(recursive) = recursive {
                config.rag.indexer.recursive = *recursive;
            }
            if let Some(max_workers) = max_workers {
                config.rag.indexer.max_concurrent_files = *max_workers;
            }
            config.validate().context("Invalid process options")?;
            commands::process(&config, directory, cancel).await
        }
        Commands::Query {
            question,
            mode,
            stream,
            top_k,
        } => {
            if let Some(top_k) = top_k {
                config.rag.top_k = *top_k;
            }
            config.validate().context("Invalid query options")?;
            commands::query(&config, question, *mode, *stream, cancel).await
        }
        Commands::Info => commands::info(&config).await,
    }
}

/// Defaults, then the YAML file, then environment and flags.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(cli.config.as_deref())
        .context("Failed to load config")?;

    if let Some(key) = non_empty(&cli.api_key) {
        config.llm.api_key = Some(key);
    }
    if let Some(base_url) = non_empty(&cli.base_url) {
        config.llm.base_url = base_url;
    }
    if let Some(model) = non_empty(&cli.model) {
        config.llm.model = model;
    }
    if let Some(embedding_model) = non_empty(&cli.embedding_model) {
        config.rag.embedding_model.name = embedding_model;
    }
    if let Some(dim) = cli.embedding_dim {
        config.rag.embedding_model.dim = dim;
    }
    if let Some(working_dir) = &cli.working_dir {
        config.storage.working_dir = working_dir.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "warn,dormouse=debug,dormouse_core=debug"
    } else {
        "warn,dormouse=info,dormouse_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
