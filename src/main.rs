//! # Collection Mirror CLI (`colm`)
//!
//! The `colm` binary drives the mirror: initializing local state, syncing
//! from the private upstream, rebuilding the search index, querying it,
//! and serving the public read API.
//!
//! ## Usage
//!
//! ```bash
//! colm --config ./config/mirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `colm init` | Create the archive layout and the search database |
//! | `colm sync` | Incremental sync from the upstream (watermark-driven) |
//! | `colm sync --full` | Walk every upstream record, ignoring the watermark |
//! | `colm reindex` | Rebuild the search index from the archive alone |
//! | `colm search "<query>"` | Query the search index from the command line |
//! | `colm serve` | Start the public read API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use collection_mirror::archive::ArchiveStore;
use collection_mirror::config;
use collection_mirror::index::{self, FtsIndex, SearchIndex, SearchQuery};
use collection_mirror::server;
use collection_mirror::sync;
use collection_mirror::upstream::SyncMode;

/// Collection Mirror — mirrors a private collection API into a public,
/// read-only one.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mirror.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "colm",
    about = "Collection Mirror — mirrors a private collection API into a public read-only one",
    version,
    long_about = "Collection Mirror syncs records from a private collection-management API, \
    relocates media assets into public object storage, strips private fields, archives each \
    record as JSON, maintains a full-text search index, and serves it all over a public HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mirror.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize local state.
    ///
    /// Creates the archive directory layout and the search database with
    /// its schema. Idempotent — running it multiple times is safe.
    Init,

    /// Sync from the upstream source.
    ///
    /// Fetches changed records page by page, relocates their assets,
    /// archives them, and updates the search index. Incremental by
    /// default: only records modified since the last completed run.
    Sync {
        /// Ignore the watermark and walk every upstream record.
        #[arg(long)]
        full: bool,

        /// Stop after roughly this many records (whole pages are
        /// processed, so the count may overshoot by up to one page).
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Re-fetch one record from the upstream and republish it.
    ///
    /// Bypasses pagination and the watermark; useful after a bad asset is
    /// fixed upstream or when a single record is known to be stale. If the
    /// upstream no longer publishes the record, the local entry is
    /// tombstoned.
    Refresh {
        /// The work's upstream identifier.
        id: i64,
    },

    /// Rebuild the search index from the archive.
    ///
    /// Drops nothing and reads nothing from upstream: every published
    /// archive entry is re-indexed in place.
    Reindex,

    /// Query the search index.
    Search {
        /// The search query string.
        query: String,

        /// Restrict matching to one field: title, description, creators,
        /// or record_type.
        #[arg(long)]
        field: Option<String>,

        /// Number of results to return.
        #[arg(long)]
        size: Option<u32>,

        /// 1-based page of results.
        #[arg(long, default_value_t = 1)]
        page: u32,
    },

    /// Start the public read API.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// archive and search index. Never contacts the upstream.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            ArchiveStore::new(&cfg.archive.root)?;
            FtsIndex::open(&cfg.search.db_path).await?.close().await;
            println!("Archive and search index initialized.");
        }
        Commands::Sync { full, limit } => {
            let mode = if full {
                SyncMode::Full
            } else {
                SyncMode::Incremental
            };
            let report = sync::run_sync(&cfg, mode, limit).await?;
            println!("Sync {} ({} run {})", report.phase, report.mode, report.run_id);
            println!("  pages:          {}", report.pages);
            println!("  fetched:        {}", report.fetched);
            println!("  created:        {}", report.created);
            println!("  updated:        {}", report.updated);
            println!("  unchanged:      {}", report.unchanged);
            println!("  tombstoned:     {}", report.tombstoned);
            println!("  skipped:        {}", report.skipped_records);
            println!("  asset failures: {}", report.asset_failures);
            println!("  indexed:        {}", report.indexed);
            if report.index_failures > 0 {
                println!(
                    "  index failures: {} (run `colm reindex` to catch up)",
                    report.index_failures
                );
            }
        }
        Commands::Refresh { id } => match sync::run_refresh(&cfg, id).await? {
            Some(work) => println!("Work {} republished: {}", work.id, work.title),
            None => println!(
                "Work {} is not published upstream; any local entry was tombstoned.",
                id
            ),
        },
        Commands::Reindex => {
            let archive = ArchiveStore::new(&cfg.archive.root)?;
            let fts = FtsIndex::open(&cfg.search.db_path).await?;
            let indexed = index::rebuild(&fts, &archive).await?;
            println!("Reindexed {} works from the archive.", indexed);
        }
        Commands::Search {
            query,
            field,
            size,
            page,
        } => {
            let fts = FtsIndex::open(&cfg.search.db_path).await?;
            let results = fts
                .search(&SearchQuery {
                    query,
                    field,
                    page: page.max(1),
                    page_size: size
                        .unwrap_or(cfg.search.page_size)
                        .clamp(1, cfg.search.max_page_size),
                })
                .await?;

            println!("{} result(s)", results.count);
            for work in &results.results {
                println!("  {:>8}  {}", work.id, work.title);
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
