//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Segmented, resumable download manager.
///
/// Without a subcommand, dlm starts an interactive shell that manages the
/// download queue, batches, crawls and schedules.
#[derive(Parser, Debug)]
#[command(name = "dlm")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored log output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the given URLs and exit
    Get(GetArgs),
}

/// Arguments of the one-shot `get` command.
#[derive(ClapArgs, Debug, Clone)]
pub struct GetArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Destination directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Segments per download (1-32)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub segments: Option<u8>,

    /// Per-download limit in bytes per second
    #[arg(short, long, value_name = "BPS")]
    pub limit: Option<u64>,

    /// Downloads running at once
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,
}
