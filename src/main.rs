//! # Mailseek CLI
//!
//! The `mailseek` binary drives the indexing and retrieval pipeline.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mailseek init` | Create the SQLite database and run schema migrations |
//! | `mailseek sync` | Run one sync cycle against the configured mail source |
//! | `mailseek watch` | Run the background sync engine until Ctrl-C |
//! | `mailseek search "<query>"` | Search indexed mail |
//! | `mailseek stats` | Show index and sync statistics |
//! | `mailseek rebuild` | Delete and regenerate all embedding vectors |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! mailseek init --config ./config/mailseek.toml
//!
//! # One-shot sync from the configured export file
//! mailseek sync --config ./config/mailseek.toml
//!
//! # Full resync from scratch
//! mailseek sync --full --config ./config/mailseek.toml
//!
//! # Hybrid search
//! mailseek search "deploy window" --strategy hybrid
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use mailseek::{config, db, migrate, search, service::ServiceContext, state, stats, sync};

/// Mailseek — local-first email indexing and hybrid search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mailseek.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mailseek",
    about = "Mailseek — local-first email indexing and hybrid search",
    version,
    long_about = "Mailseek ingests email from a configured source, scores each message for \
    content quality, chunks accepted messages along their structural boundaries, and indexes \
    the chunks into SQLite for hybrid (keyword + semantic) search with optional reranking."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mailseek.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (chunks,
    /// chunks_fts, chunk_vectors, index_meta, processed_messages,
    /// sync_state). Idempotent — running it multiple times is safe.
    Init,

    /// Run one sync cycle against the configured mail source.
    ///
    /// Fetches messages past the stored resumption point, scores and
    /// chunks them, and appends accepted content to the index. Progress
    /// is saved so the next run resumes where this one left off.
    Sync {
        /// Discard the index and resumption state — reindex everything.
        #[arg(long)]
        full: bool,
    },

    /// Run the background sync engine until Ctrl-C.
    ///
    /// Cycles at the configured interval, reconnecting fresh each cycle.
    /// Errors back off and retry without losing committed progress.
    Watch,

    /// Search indexed mail.
    ///
    /// Returns ranked chunks with scores and message metadata. Semantic
    /// and hybrid strategies require an embedding backend.
    Search {
        /// The search query string.
        query: String,

        /// Search strategy: `keyword` (FTS5), `semantic` (vector), or
        /// `hybrid` (weighted fusion).
        #[arg(long, default_value = "hybrid")]
        strategy: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show index and sync statistics.
    Stats,

    /// Delete and regenerate all embedding vectors.
    ///
    /// Useful when switching embedding models or dimensions. Clears all
    /// existing vectors and re-embeds every stored chunk.
    Rebuild,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mailseek=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sync { full } => {
            let ctx = ServiceContext::init(cfg).await?;
            if full {
                println!("Full resync: clearing index and resumption state...");
                ctx.indexer().clear_index().await?;
                state::reset(&ctx.pool).await?;
            }
            let transport = ctx.transport()?;
            let cycle = sync::run_once(&ctx, transport.as_ref()).await?;
            println!(
                "Sync complete: {} fetched, {} indexed ({} chunks), {} skipped, {} rejected, {} failed.",
                cycle.fetched,
                cycle.report.indexed_messages,
                cycle.report.added_chunks,
                cycle.report.skipped_messages,
                cycle.report.rejected_messages,
                cycle.report.failed_messages
            );
        }
        Commands::Watch => {
            let ctx = Arc::new(ServiceContext::init(cfg).await?);
            let transport: Arc<dyn mailseek::transport::MailTransport> =
                Arc::from(ctx.transport()?);
            let handle = sync::spawn(ctx, transport);
            println!("Sync engine running — press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            println!("Stopping...");
            let status = handle.status();
            handle.stop().await;
            println!(
                "Stopped after {} cycle{}: {} indexed, {} skipped, {} rejected, {} failed.",
                status.cycles_completed,
                if status.cycles_completed == 1 { "" } else { "s" },
                status.messages_indexed,
                status.messages_skipped,
                status.messages_rejected,
                status.messages_failed
            );
        }
        Commands::Search {
            query,
            strategy,
            top_k,
        } => {
            let ctx = ServiceContext::init(cfg).await?;
            let top_k = top_k.unwrap_or(ctx.config.retrieval.final_limit);
            search::run_search(&ctx, &query, &strategy, top_k).await?;
        }
        Commands::Stats => {
            let ctx = ServiceContext::init(cfg).await?;
            stats::run_stats(&ctx).await?;
        }
        Commands::Rebuild => {
            let ctx = ServiceContext::init(cfg).await?;
            let count = ctx.indexer().rebuild_vectors().await?;
            println!("Rebuilt embeddings for {} chunks.", count);
        }
    }

    Ok(())
}
