//! # knowbase CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb sources` | List configured directories and their index state |
//! | `kb update [connector]` | Refresh the index from notes, PDFs, and EPUBs |
//! | `kb search "<query>"` | Ranked document search |
//! | `kb ask "<question>"` | Answer one question from your documents |
//! | `kb chat` | Interactive chat with follow-up questions |
//! | `kb get <id>` | Print a document and its chunks |
//! | `kb embed pending` | Backfill missing or stale embeddings |
//! | `kb embed rebuild` | Delete and regenerate all embeddings |
//! | `kb stats` | Index totals per source |
//! | `kb serve` | Start the HTTP API |
//! | `kb completions <shell>` | Print shell completions |
//!
//! `.env` in the working directory is loaded before the config, so API
//! keys and `KB_NOTES_DIRS` can live there.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use knowbase::config;
use knowbase::ingest::{self, SyncOptions};
use knowbase::progress::ProgressMode;
use knowbase::search::{self, SearchMode, SearchOptions};
use knowbase::{chat, embed_cmd, get, logging, migrate, query, server, sources, stats};

/// knowbase: ask questions about your notes, papers, and books.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "knowbase: a local-first personal knowledge base with question answering",
    version,
    long_about = "knowbase indexes directories of Obsidian notes, PDFs, and EPUBs into SQLite, \
    retrieves the passages relevant to a question with keyword and semantic search, and asks a \
    language model to answer from them. Conversations keep context for follow-up questions."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Let `.env` values replace variables already set in the environment.
    #[arg(long, global = true)]
    env_override: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// List configured directories, whether they exist, and what is indexed.
    Sources,

    /// Refresh the index from the configured directories.
    ///
    /// New and changed files are indexed, documents whose files were deleted
    /// are removed, and unchanged files are skipped. Safe to run from cron.
    ///
    /// Connector format: `all`, `filesystem`, or `filesystem:<name>`.
    #[command(alias = "sync")]
    Update {
        #[arg(default_value = "all")]
        connector: String,

        /// Ignore checkpoints and re-check every file.
        #[arg(long)]
        full: bool,

        /// Show what would change without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of changed files per connector.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search indexed documents.
    Search {
        query: String,

        /// `keyword`, `semantic`, or `hybrid`. Defaults to hybrid when
        /// embeddings are enabled, keyword otherwise.
        #[arg(long)]
        mode: Option<SearchMode>,

        /// Restrict to one source, e.g. `filesystem:vault`.
        #[arg(long)]
        source: Option<String>,

        /// Only documents updated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        limit: Option<i64>,

        /// Show keyword and semantic score components.
        #[arg(long)]
        explain: bool,
    },

    /// Answer a question from your documents.
    Ask {
        question: String,

        /// One of `llm.models`; `/models` in chat lists them.
        #[arg(long)]
        model: Option<String>,

        /// Restrict retrieval to one source.
        #[arg(long)]
        source: Option<String>,

        /// Do not list the cited documents.
        #[arg(long)]
        no_sources: bool,
    },

    /// Chat about your documents, with follow-up questions.
    Chat {
        #[arg(long)]
        model: Option<String>,

        /// List the cited documents under each answer.
        #[arg(long = "sources")]
        show_sources: bool,
    },

    /// Print a document by id.
    Get { id: String },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Index totals and per-source breakdown.
    Stats,

    /// Start the HTTP API.
    Serve {
        /// Overrides `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print shell completions to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings.
    Pending {
        #[arg(long)]
        limit: Option<usize>,

        /// Texts per provider request; overrides `embedding.batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings, e.g. after switching models.
    Rebuild {
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.env_override {
        dotenvy::dotenv_override().ok();
    } else {
        dotenvy::dotenv().ok();
    }
    logging::init_logging(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "kb", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Update {
            connector,
            full,
            dry_run,
            limit,
            progress,
        } => {
            let opts = SyncOptions {
                full,
                dry_run,
                limit,
            };
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_sync(&cfg, &connector, opts, progress).await?;
        }
        Commands::Search {
            query,
            mode,
            source,
            since,
            limit,
            explain,
        } => {
            let opts = SearchOptions {
                query,
                mode,
                source,
                since,
                limit,
                explain,
            };
            search::run_search(&cfg, opts).await?;
        }
        Commands::Ask {
            question,
            model,
            source,
            no_sources,
        } => {
            query::run_ask(&cfg, &question, model, source, !no_sources).await?;
        }
        Commands::Chat {
            model,
            show_sources,
        } => {
            chat::run_chat(&cfg, model, show_sources).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve { bind } => {
            server::run_server(&cfg, bind).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
