//! # Ticket Corpus CLI (`tcorp`)
//!
//! The `tcorp` binary drives corpus builds. It provides commands for
//! database initialization, building and resuming the corpus, and
//! inspecting checkpoints, errors and statistics.
//!
//! ## Usage
//!
//! ```bash
//! tcorp --config ./config/tcorp.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tcorp init` | Create the SQLite database and run schema migrations |
//! | `tcorp build` | Group, score and persist all records |
//! | `tcorp build --resume` | Continue from the latest checkpoint |
//! | `tcorp checkpoints` | List recent checkpoints |
//! | `tcorp errors` | Print the recovery report |
//! | `tcorp stats` | Show corpus statistics |

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use ticket_corpus::pipeline::RunOptions;
use ticket_corpus::progress::ProgressMode;
use ticket_corpus::{config, history, logging, migrate, pipeline, stats};

/// Ticket Corpus CLI — builds a scored text corpus from issue-tracker records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tcorp.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tcorp",
    about = "Ticket Corpus — resilient corpus builds over issue-tracker records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tcorp.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running
    /// it more than once is safe.
    Init,

    /// Build the corpus.
    ///
    /// Loads records, groups related ones, scores them in batches and
    /// persists the results, checkpointing along the way.
    Build {
        /// Continue from the latest resumable checkpoint instead of starting over.
        #[arg(long)]
        resume: bool,

        /// Stop after this many batches.
        #[arg(long)]
        max_batches: Option<usize>,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// List recent checkpoints for the configured process.
    Checkpoints {
        /// Maximum number of checkpoints to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Print the recovery report from the persisted error log.
    Errors,

    /// Show corpus statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Build {
            resume,
            max_batches,
            progress,
        } => {
            let options = RunOptions {
                resume,
                max_batches,
            };
            pipeline::run_build(&cfg, options, progress.mode().reporter()).await?;
        }
        Commands::Checkpoints { limit } => {
            history::run_checkpoints(&cfg, limit).await?;
        }
        Commands::Errors => {
            history::run_errors(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
