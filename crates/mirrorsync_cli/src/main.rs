//! Mirrorsync CLI
//!
//! Command-line tools for the state directory a sync engine keeps its
//! action queue and identity links in.
//!
//! # Commands
//!
//! - `inspect` - Display queue, link and watermark summary
//! - `verify` - Verify journal integrity
//! - `compact` - Rewrite the journal with only live records
//! - `dump-journal` - Dump journal records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Mirrorsync state directory tools.
#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the engine state directory
    #[arg(global = true, short = 'd', long)]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue, link and watermark summary
    Inspect {
        /// List pending actions
        #[arg(short, long)]
        actions: bool,

        /// List identity links
        #[arg(short, long)]
        links: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify,

    /// Rewrite the journal with only live records
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump journal records for debugging
    DumpJournal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip records before this byte offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            actions,
            links,
            format,
        } => {
            let dir = cli.state_dir.ok_or("State directory required for inspect")?;
            commands::inspect::run(&dir, actions, links, &format)?;
        }
        Commands::Verify => {
            let dir = cli.state_dir.ok_or("State directory required for verify")?;
            commands::verify::run(&dir)?;
        }
        Commands::Compact { dry_run } => {
            let dir = cli.state_dir.ok_or("State directory required for compact")?;
            commands::compact::run(&dir, dry_run)?;
        }
        Commands::DumpJournal {
            limit,
            offset,
            format,
        } => {
            let dir = cli
                .state_dir
                .ok_or("State directory required for dump-journal")?;
            commands::dump_journal::run(&dir, limit, offset, &format)?;
        }
        Commands::Version => {
            println!("Mirrorsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Journal format {}",
                String::from_utf8_lossy(&mirrorsync_engine::JOURNAL_MAGIC)
            );
        }
    }

    Ok(())
}
