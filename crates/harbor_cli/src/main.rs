//! HarborDB CLI
//!
//! Command-line tools for HarborDB store directories.
//!
//! # Commands
//!
//! - `inspect` - Display record counts, metadata and log size
//! - `outbox` - List mutations waiting to be sent to the remote
//! - `verify` - Check every frame of the log
//! - `compact` - Rewrite the log as a single snapshot frame

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// HarborDB command-line store tools.
#[derive(Parser)]
#[command(name = "harbor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Report format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display record counts, metadata and log size
    Inspect {
        /// Also list sync cursors
        #[arg(short, long)]
        cursors: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List mutations waiting to be sent to the remote
    Outbox {
        /// Only show entries for this model type
        #[arg(short, long)]
        model: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Check every frame of the log
    Verify,

    /// Rewrite the log as a single snapshot frame
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { cursors, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, cursors, format)?;
        }
        Commands::Outbox {
            model,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for outbox")?;
            commands::outbox::run(&path, model.as_deref(), limit, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("HarborDB CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
