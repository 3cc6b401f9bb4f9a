//! # postsync CLI
//!
//! ## Usage
//!
//! ```bash
//! postsync --config ./config/postsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `postsync init` | Create the SQLite ledger and run schema migrations |
//! | `postsync sources` | List configured sources and probe the browser |
//! | `postsync sync <source>` | Sync new posts from one source (or `all`) |
//! | `postsync status` | Show per-source ledger counts and last run |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `postsync=info`); the run summary goes to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use postsync::config;
use postsync::ingest::{self, SyncOptions};
use postsync::migrate;
use postsync::progress::ProgressMode;
use postsync::sources;
use postsync::status;

/// postsync: incremental article sync from a feed into a vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/postsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "postsync",
    about = "Incremental article sync: rendered fetch, extraction, chunking, vector upsert",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/postsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the ledger database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// List configured sources.
    Sources,

    /// Sync new posts from a source.
    ///
    /// Fetches the feed, skips posts already in the ledger, then renders,
    /// extracts, chunks, embeds, and upserts each remaining post.
    Sync {
        /// Source name from the config, or `all`.
        source: String,

        /// Maximum number of new posts to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Reprocess posts already recorded as synced.
        #[arg(long)]
        force: bool,

        /// Fetch and reconcile only; print what would be synced.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr (default: human when stderr is a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show per-source sync status.
    Status,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("postsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync {
            source,
            limit,
            force,
            dry_run,
            progress,
        } => {
            let opts = SyncOptions {
                limit,
                force,
                dry_run,
            };
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            if source == "all" {
                ingest::run_sync_all(&cfg, opts, reporter.as_ref()).await?;
            } else {
                ingest::run_sync(&cfg, &source, opts, reporter.as_ref()).await?;
            }
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}
