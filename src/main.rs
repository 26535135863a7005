//! CLI entry point for dlm.

use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use dlm_core::Settings;
use dlm_core::config::resolve_default_config_path;
use tracing::{debug, info};

mod app;
mod cli;

use app::context::AppContext;
use app::terminal::{
    default_log_level, init_tracing, is_dumb_terminal, no_color_env_requested,
    should_disable_color, should_show_progress,
};
use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: explicit -q/-v > RUST_LOG > default (info)
    let no_color = should_disable_color(args.no_color, no_color_env_requested(), is_dumb_terminal());
    init_tracing(
        default_log_level(args.quiet, args.verbose),
        args.quiet || args.verbose > 0,
        no_color,
    );
    debug!(?args, "CLI arguments parsed");

    let config_path = args.config.clone().or_else(resolve_default_config_path);
    let settings = match &config_path {
        Some(path) => Settings::load_or_default(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    let show_progress = should_show_progress(io::stderr().is_terminal(), args.quiet, is_dumb_terminal());

    match args.command {
        Some(Command::Get(get)) => {
            let outcome = app::get::run_get(settings, get, show_progress).await?;
            Ok(outcome.into())
        }
        None => {
            info!("dlm starting");
            let mut ctx = AppContext::build(settings, config_path, show_progress).await?;
            let result = app::shell::run_shell(&mut ctx).await;
            ctx.shutdown().await;
            result?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
