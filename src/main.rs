//! # docsage CLI
//!
//! ## Usage
//!
//! ```bash
//! docsage --config ./config/docsage.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsage init` | Write a starter config and create the index |
//! | `docsage sync` | Index new and changed documents, drop removed ones |
//! | `docsage ask "<query>"` | Print the ranked context for a question |
//! | `docsage status` | Show index counts and the active model |
//! | `docsage rebuild` | Delete the index and re-index from scratch |

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use docsage::config::{self, Config, DEFAULT_CONFIG_PATH};
use docsage::retrieve::RetrievalMode;
use docsage::{cli, logging};

/// docsage: a local document index and retrieval engine.
#[derive(Parser)]
#[command(
    name = "docsage",
    version,
    about = "A local document index and retrieval engine for grounded chat answers"
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config (if missing) and create the index database.
    Init,

    /// Reconcile the index with the source directory.
    ///
    /// Only added and modified documents are re-embedded. Failed documents
    /// are reported and keep their previous records.
    Sync {
        /// Clear the index first and re-index every document.
        #[arg(long)]
        full: bool,
    },

    /// Retrieve the ranked context for a question.
    Ask {
        /// The question.
        query: String,

        /// Number of passages (defaults to `retrieval.top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Ranking mode (defaults to `retrieval.mode`).
        #[arg(long, value_enum)]
        mode: Option<RetrievalMode>,

        /// Print passages and context as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Status,

    /// Delete the index database and re-index from the source documents.
    ///
    /// Recovers from a corrupt index.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            logging::init(&Default::default());
            cli::run_init(&cli.config).await?;
        }
        Commands::Sync { full } => cli::run_sync(&load(&cli.config)?, full).await?,
        Commands::Ask {
            query,
            top_k,
            mode,
            json,
        } => cli::run_ask(&load(&cli.config)?, &query, top_k, mode, json).await?,
        Commands::Status => cli::run_status(&load(&cli.config)?).await?,
        Commands::Rebuild => cli::run_rebuild(&load(&cli.config)?).await?,
    }

    Ok(())
}

/// Load the config and start logging at its level.
fn load(path: &Path) -> anyhow::Result<Config> {
    let cfg = config::load_config(path)?;
    logging::init(&cfg.logging);
    Ok(cfg)
}
