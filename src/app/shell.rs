//! Interactive command shell.
//!
//! Each stdin line is split into words and parsed with clap, so the shell
//! commands get the same validation and `help` output as the top-level CLI.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use dlm_core::config::SETTING_KEYS;
use dlm_core::{
    BatchSource, CrawlConfig, DomainScope, DownloadRequest, Recurrence, ScheduleAction,
    ScheduleId, TaskId, TaskStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::app::context::AppContext;
use crate::app::progress::{format_bytes, format_speed};

/// A line typed at the `dlm>` prompt.
#[derive(Parser, Debug)]
#[command(name = "dlm", no_binary_name = true, disable_version_flag = true)]
pub(crate) struct ShellLine {
    #[command(subcommand)]
    pub(crate) command: ShellCommand,
}

/// Shell commands.
#[derive(Subcommand, Debug)]
pub(crate) enum ShellCommand {
    /// Add a download
    #[command(visible_alias = "add")]
    Download(DownloadArgs),
    /// List downloads, optionally only those in one status
    #[command(visible_alias = "ls")]
    List { status: Option<String> },
    /// Show one download in detail
    Info { id: TaskId },
    /// Pause a download, or `all`
    Pause { target: Target },
    /// Resume a download, or `all`
    Resume { target: Target },
    /// Cancel a download, or `all`
    Cancel { target: Target },
    /// Restart a failed or canceled download
    Restart { id: TaskId },
    /// Remove a download from the list, or `all`
    #[command(visible_alias = "rm")]
    Remove {
        target: Target,
        /// Also delete the file on disk
        #[arg(long)]
        delete_file: bool,
    },
    /// Set a per-download speed limit in bytes per second (`none` clears it)
    Limit { id: TaskId, limit: String },
    /// Totals across all downloads
    Stats,
    /// Batch downloads
    #[command(subcommand)]
    Batch(BatchCommand),
    /// Crawl a website, or control the running crawl
    Crawl(CrawlCli),
    /// Timed actions
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Show or change settings
    Settings {
        /// Dotted key, e.g. `general.segment_count`
        key: Option<String>,
        /// New value
        value: Option<String>,
        /// Write the settings file after changing them
        #[arg(long)]
        save: bool,
    },
    /// Turn the progress display on or off
    Progress { state: Toggle },
    /// Leave the shell
    #[command(alias = "exit")]
    Quit,
}

#[derive(ClapArgs, Debug, Clone)]
pub(crate) struct DownloadArgs {
    pub(crate) url: String,
    /// Destination directory
    #[arg(short, long)]
    pub(crate) output: Option<PathBuf>,
    /// Filename to save as
    #[arg(short = 'n', long = "name")]
    pub(crate) filename: Option<String>,
    /// Segment count (1-32)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub(crate) segments: Option<u8>,
    /// Speed limit in bytes per second
    #[arg(short, long)]
    pub(crate) limit: Option<u64>,
    /// Expected SHA-256 of the finished file
    #[arg(long)]
    pub(crate) sha256: Option<String>,
}

impl DownloadArgs {
    fn to_request(&self) -> DownloadRequest {
        let mut request = DownloadRequest::new(self.url.as_str());
        if let Some(dir) = &self.output {
            request = request.destination(dir.clone());
        }
        if let Some(name) = &self.filename {
            request = request.filename(name.as_str());
        }
        if let Some(segments) = self.segments {
            request = request.segments(usize::from(segments));
        }
        if let Some(limit) = self.limit {
            request = request.speed_limit(limit);
        }
        if let Some(hex) = &self.sha256 {
            request = request.expected_sha256(hex.as_str());
        }
        request
    }
}

/// A task id or `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    All,
    Task(TaskId),
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse()
            .map(Self::Task)
            .map_err(|_| format!("expected a task id or 'all', got '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Toggle {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
pub(crate) enum BatchCommand {
    /// Add URLs
    Add {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Add every URL from a file; the kind defaults to the extension
    File {
        path: PathBuf,
        /// text, html, csv or sitemap
        #[arg(long)]
        kind: Option<SourceKind>,
    },
    /// Add every URL found at a web address (sitemap, page or list)
    Fetch { url: String },
    /// Add URLs from a numeric or alphabetic range, e.g. `img[001-050].jpg`
    Pattern { pattern: String },
    /// List batch items
    #[command(visible_alias = "ls")]
    List,
    /// Start dispatching
    Start {
        /// Items active at once
        #[arg(short, long)]
        concurrent: Option<usize>,
        /// Stop after this many items (0 = no cap)
        #[arg(long)]
        max_total: Option<usize>,
    },
    /// Hold further dispatching
    Pause,
    /// Continue dispatching
    Resume,
    /// Stop the run; active downloads keep going
    Stop,
    /// Remove every item
    Clear,
    /// Show progress counters
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum SourceKind {
    Text,
    Html,
    Csv,
    Sitemap,
}

impl SourceKind {
    fn source(self, path: PathBuf) -> BatchSource {
        match self {
            Self::Text => BatchSource::TextFile(path),
            Self::Html => BatchSource::HtmlFile(path),
            Self::Csv => BatchSource::CsvFile(path),
            Self::Sitemap => BatchSource::Sitemap(path),
        }
    }
}

/// `crawl <url> [options]` starts a crawl; `crawl <command>` controls it.
#[derive(ClapArgs, Debug)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
pub(crate) struct CrawlCli {
    #[command(subcommand)]
    pub(crate) control: Option<CrawlCommand>,
    #[command(flatten)]
    pub(crate) start: CrawlArgs,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CrawlCommand {
    /// Pause fetching
    Pause,
    /// Continue fetching
    Resume,
    /// Stop the crawl
    Stop,
    /// Show state and counters
    Status,
    /// List downloadable files found so far
    Files,
    /// List visited pages
    Pages,
}

#[derive(ClapArgs, Debug, Clone)]
pub(crate) struct CrawlArgs {
    /// Start page
    #[arg(required = true)]
    pub(crate) url: Option<String>,
    /// Link hops from the start page
    #[arg(short, long)]
    pub(crate) depth: Option<usize>,
    /// Upper bound on visited URLs
    #[arg(long)]
    pub(crate) pages: Option<usize>,
    /// Delay between requests to one domain, in milliseconds
    #[arg(long, value_name = "MS")]
    pub(crate) delay: Option<u64>,
    /// same-domain, same-host, all, or a comma-separated domain list
    #[arg(long)]
    pub(crate) scope: Option<DomainScope>,
    /// Only follow links matching this regex (repeatable)
    #[arg(long)]
    pub(crate) include: Vec<String>,
    /// Never follow links matching this regex (repeatable)
    #[arg(long)]
    pub(crate) exclude: Vec<String>,
    /// Downloadable extensions, comma separated
    #[arg(long, value_delimiter = ',')]
    pub(crate) ext: Vec<String>,
    /// Ignore robots.txt
    #[arg(long)]
    pub(crate) no_robots: bool,
    /// Follow links to other hosts
    #[arg(long)]
    pub(crate) external: bool,
    /// Queue every found file for download
    #[arg(long)]
    pub(crate) download: bool,
    /// Destination for downloaded files
    #[arg(short, long)]
    pub(crate) output: Option<PathBuf>,
    /// Pages fetched at once
    #[arg(short, long)]
    pub(crate) concurrency: Option<usize>,
}

impl CrawlArgs {
    fn to_config(&self, url: &str, defaults: &dlm_core::config::CrawlerSettings) -> CrawlConfig {
        let mut config = CrawlConfig::from_settings(url, defaults);
        if let Some(depth) = self.depth {
            config.max_depth = depth;
        }
        if let Some(pages) = self.pages {
            config.max_pages = pages;
        }
        if let Some(ms) = self.delay {
            config.request_delay = Duration::from_millis(ms);
        }
        if let Some(scope) = &self.scope {
            config.scope = scope.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        if !self.ext.is_empty() {
            config.downloadable_extensions.clone_from(&self.ext);
        }
        config.include_patterns.clone_from(&self.include);
        config.exclude_patterns.clone_from(&self.exclude);
        config.respect_robots_txt &= !self.no_robots;
        config.follow_external_links |= self.external;
        config.auto_download = self.download;
        config.destination.clone_from(&self.output);
        config
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum ScheduleCommand {
    /// Download a URL later, optionally repeating
    Add {
        url: String,
        #[command(flatten)]
        when: When,
        /// Destination directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Start, pause or resume an existing download later
    Action {
        id: TaskId,
        action: ScheduleAction,
        #[command(flatten)]
        when: When,
    },
    /// List entries
    #[command(visible_alias = "ls")]
    List,
    /// Delete an entry
    #[command(visible_alias = "rm")]
    Remove { id: ScheduleId },
    /// Re-activate an entry
    Enable { id: ScheduleId },
    /// Keep an entry without firing it
    Disable { id: ScheduleId },
}

#[derive(ClapArgs, Debug, Clone)]
pub(crate) struct When {
    /// Local time (`YYYY-MM-DD HH:MM[:SS]`, `HH:MM`) or RFC 3339
    #[arg(long, conflicts_with = "after")]
    pub(crate) at: Option<String>,
    /// Seconds from now
    #[arg(long = "in", value_name = "SECS")]
    pub(crate) after: Option<u64>,
    /// once, hourly, daily, weekly, monthly, or a number of seconds
    #[arg(long, default_value = "once")]
    pub(crate) every: Recurrence,
}

impl When {
    fn start_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match (&self.at, self.after) {
            (Some(at), _) => parse_time(at, now),
            (None, Some(secs)) => {
                let secs = i64::try_from(secs).context("delay is too large")?;
                chrono::TimeDelta::try_seconds(secs)
                    .and_then(|d| now.checked_add_signed(d))
                    .context("delay is too large")
            }
            (None, None) => Ok(now),
        }
    }
}

/// Parses `--at` values. A bare `HH:MM` means today, or tomorrow once that
/// time has passed.
pub(crate) fn parse_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Ok(time.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return local_to_utc(naive);
        }
    }
    for format in ["%H:%M:%S", "%H:%M"] {
        if let Ok(time) = chrono::NaiveTime::parse_from_str(input, format) {
            let today = now.with_timezone(&Local).date_naive();
            let mut at = local_to_utc(today.and_time(time))?;
            if at <= now {
                let tomorrow = today.succ_opt().context("date out of range")?;
                at = local_to_utc(tomorrow.and_time(time))?;
            }
            return Ok(at);
        }
    }
    bail!("unrecognized time '{input}'")
}

fn local_to_utc(naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("{naive} does not exist in the local time zone"))
}

/// Splits a line into words; single and double quotes group words.
pub(crate) fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        bail!("unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// What the loop does after a command.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Quit,
}

/// Reads commands from stdin until `quit`, end of input or Ctrl-C.
pub(crate) async fn run_shell(ctx: &mut AppContext) -> Result<()> {
    let interactive = std::io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if interactive {
        println!("dlm shell. Type 'help' for commands.");
    }

    loop {
        if interactive {
            print!("dlm> ");
            let _ = std::io::stdout().flush();
        }
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let words = match split_words(line) {
            Ok(words) => words,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };
        let parsed = match ShellLine::try_parse_from(words) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = e.print();
                continue;
            }
        };
        match execute(ctx, parsed.command).await {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}

/// Runs one shell command.
pub(crate) async fn execute(ctx: &mut AppContext, command: ShellCommand) -> Result<Flow> {
    match command {
        ShellCommand::Download(args) => {
            let id = ctx.manager.add_download(args.to_request()).await?;
            println!("added #{id}");
        }
        ShellCommand::List { status } => {
            let tasks = match status {
                Some(name) => {
                    let status = parse_status(&name)?;
                    ctx.manager.tasks_by_status(status)
                }
                None => ctx.manager.tasks(),
            };
            if tasks.is_empty() {
                println!("no downloads");
            }
            for task in tasks {
                let percent = task
                    .progress()
                    .map_or_else(|| "  ?".to_string(), |p| format!("{:3.0}", p * 100.0));
                println!(
                    "#{:<4} {:<11} {}% {:>10} {:>12}  {}",
                    task.id,
                    task.status,
                    percent,
                    format_bytes(task.downloaded),
                    format_speed(task.speed),
                    task.filename.as_deref().unwrap_or(&task.url)
                );
            }
        }
        ShellCommand::Info { id } => {
            let task = ctx
                .manager
                .task(id)
                .with_context(|| format!("no download #{id}"))?
                .snapshot();
            println!("id:          #{}", task.id);
            println!("url:         {}", task.url);
            println!("status:      {}", task.status);
            if let Some(path) = &task.path {
                println!("file:        {}", path.display());
            }
            println!(
                "size:        {} / {}",
                format_bytes(task.downloaded),
                task.total_size.map_or_else(|| "unknown".to_string(), format_bytes)
            );
            println!("speed:       {} (avg {})", format_speed(task.speed), format_speed(task.average_speed));
            println!("resumable:   {}", task.resumable);
            if let Some(limit) = task.speed_limit {
                println!("limit:       {}/s", format_bytes(limit));
            }
            for segment in &task.segments {
                let end = segment.end().map_or_else(|| "end".to_string(), |e| e.to_string());
                println!(
                    "  segment {}: {}-{} {} ({})",
                    segment.index(),
                    segment.start(),
                    end,
                    format_bytes(segment.downloaded()),
                    segment.status()
                );
            }
            if let Some(error) = &task.error {
                println!("error:       {error}");
            }
        }
        ShellCommand::Pause { target } => match target {
            Target::All => println!("paused {}", ctx.manager.pause_all()),
            Target::Task(id) => report(id, "paused", ctx.manager.pause_download(id)?),
        },
        ShellCommand::Resume { target } => match target {
            Target::All => println!("resumed {}", ctx.manager.resume_all()),
            Target::Task(id) => report(id, "resumed", ctx.manager.resume_download(id)?),
        },
        ShellCommand::Cancel { target } => match target {
            Target::All => println!("canceled {}", ctx.manager.cancel_all()),
            Target::Task(id) => report(id, "canceled", ctx.manager.cancel_download(id)?),
        },
        ShellCommand::Restart { id } => report(id, "restarted", ctx.manager.restart_download(id)?),
        ShellCommand::Remove { target, delete_file } => {
            let ids = match target {
                Target::All => ctx.manager.tasks().into_iter().map(|t| t.id).collect(),
                Target::Task(id) => vec![id],
            };
            for id in ids {
                ctx.manager.remove_download(id, delete_file).await?;
                println!("removed #{id}");
            }
        }
        ShellCommand::Limit { id, limit } => {
            let limit = if limit.eq_ignore_ascii_case("none") || limit == "0" {
                None
            } else {
                Some(limit.parse::<u64>().with_context(|| format!("invalid limit '{limit}'"))?)
            };
            ctx.manager.set_task_speed_limit(id, limit)?;
            println!("#{id} limit set");
        }
        ShellCommand::Stats => {
            let stats = ctx.manager.stats();
            println!(
                "{} total, {} queued, {} active, {} paused, {} completed, {} failed, {} canceled",
                stats.total,
                stats.queued,
                stats.active,
                stats.paused,
                stats.completed,
                stats.failed,
                stats.canceled
            );
            println!(
                "{} of {} at {}",
                format_bytes(stats.downloaded_bytes),
                format_bytes(stats.total_bytes),
                format_speed(stats.speed)
            );
        }
        ShellCommand::Batch(command) => batch(ctx, command).await?,
        ShellCommand::Crawl(command) => crawl(ctx, command).await?,
        ShellCommand::Schedule(command) => schedule(ctx, command)?,
        ShellCommand::Settings { key, value, save } => settings(ctx, key, value, save).await?,
        ShellCommand::Progress { state } => {
            ctx.set_progress(state == Toggle::On).await;
            println!("progress {}", if ctx.progress_enabled() { "on" } else { "off" });
        }
        ShellCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn report(id: TaskId, verb: &str, changed: bool) {
    if changed {
        println!("#{id} {verb}");
    } else {
        println!("#{id} unchanged");
    }
}

fn parse_status(name: &str) -> Result<TaskStatus> {
    TaskStatus::ALL
        .into_iter()
        .find(|s| s.as_str().eq_ignore_ascii_case(name.trim()))
        .with_context(|| format!("unknown status '{name}'"))
}

async fn batch(ctx: &AppContext, command: BatchCommand) -> Result<()> {
    let batch = &ctx.batch;
    let summary = match command {
        BatchCommand::Add { urls } => batch.add_urls(&urls),
        BatchCommand::File { path, kind } => {
            let source = match kind {
                Some(kind) => kind.source(path),
                None => BatchSource::from_path(path),
            };
            batch.add_from_source(&source).await?
        }
        BatchCommand::Fetch { url } => batch.add_from_source(&BatchSource::Http(url)).await?,
        BatchCommand::Pattern { pattern } => batch.add_pattern(&pattern)?,
        BatchCommand::List => {
            for (index, item) in batch.items().iter().enumerate() {
                let task = item.task_id.map(|id| format!(" #{id}")).unwrap_or_default();
                println!("{index:>4} {:<9}{task} {}", item.status, item.url);
                if let Some(error) = &item.error {
                    println!("       {error}");
                }
            }
            return Ok(());
        }
        BatchCommand::Start {
            concurrent,
            max_total,
        } => {
            if let Some(limit) = concurrent {
                batch.set_max_concurrent(limit);
            }
            if let Some(limit) = max_total {
                batch.set_max_total_downloads(limit);
            }
            batch.start()?;
            println!("batch started with {} items", batch.len());
            return Ok(());
        }
        BatchCommand::Pause => {
            batch.pause();
            println!("batch paused");
            return Ok(());
        }
        BatchCommand::Resume => {
            batch.resume();
            println!("batch resumed");
            return Ok(());
        }
        BatchCommand::Stop => {
            batch.stop().await;
            println!("batch stopped");
            return Ok(());
        }
        BatchCommand::Clear => {
            batch.clear()?;
            println!("batch cleared");
            return Ok(());
        }
        BatchCommand::Status => {
            let progress = batch.progress();
            println!(
                "{}/{} processed ({:.0}%), {} ok, {} failed{}{}",
                progress.processed,
                progress.total,
                progress.overall_progress * 100.0,
                progress.success,
                progress.failure,
                if batch.is_running() { ", running" } else { "" },
                if batch.is_paused() { ", paused" } else { "" },
            );
            return Ok(());
        }
    };
    for skipped in &summary.skipped {
        warn!(skipped = %skipped, "Skipped unrecognized input");
    }
    println!("added {} items, skipped {}", summary.added, summary.skipped.len());
    Ok(())
}

async fn crawl(ctx: &AppContext, cli: CrawlCli) -> Result<()> {
    let crawler = &ctx.crawler;
    let Some(command) = cli.control else {
        let url = cli.start.url.as_deref().context("a start URL is required")?;
        let config = cli.start.to_config(url, &ctx.manager.settings().crawler);
        crawler.start(config)?;
        println!("crawling {url}");
        return Ok(());
    };
    match command {
        CrawlCommand::Pause => {
            crawler.pause();
            println!("crawl {}", crawler.state());
        }
        CrawlCommand::Resume => {
            crawler.resume();
            println!("crawl {}", crawler.state());
        }
        CrawlCommand::Stop => {
            crawler.stop().await;
            println!("crawl {}", crawler.state());
        }
        CrawlCommand::Status => {
            let progress = crawler.progress();
            println!(
                "{}: {} pages visited, {} urls seen, {} files found, {} queued",
                crawler.state(),
                progress.pages_visited,
                progress.total_urls,
                progress.resources_found,
                progress.downloads_queued
            );
        }
        CrawlCommand::Files => {
            for url in crawler.downloadable_files() {
                println!("{url}");
            }
        }
        CrawlCommand::Pages => {
            for url in crawler.visited_urls() {
                println!("{url}");
            }
        }
    }
    Ok(())
}

fn schedule(ctx: &AppContext, command: ScheduleCommand) -> Result<()> {
    let scheduler = &ctx.scheduler;
    match command {
        ScheduleCommand::Add { url, when, output } => {
            let mut request = DownloadRequest::new(url);
            if let Some(dir) = output {
                request = request.destination(dir);
            }
            let at = when.start_time(Utc::now())?;
            let id = scheduler.schedule_recurring_download(request, at, when.every)?;
            println!("scheduled #{id} at {}", at.with_timezone(&Local));
        }
        ScheduleCommand::Action { id, action, when } => {
            let at = when.start_time(Utc::now())?;
            let entry = scheduler.schedule_action(id, action, at, when.every)?;
            println!("scheduled #{entry}: {action} #{id} at {}", at.with_timezone(&Local));
        }
        ScheduleCommand::List => {
            let entries = scheduler.entries();
            if entries.is_empty() {
                println!("no schedules");
            }
            for entry in entries {
                let target = match &entry.target {
                    dlm_core::scheduler::ScheduleTarget::Task { id } => format!("#{id}"),
                    dlm_core::scheduler::ScheduleTarget::NewDownload { request } => {
                        request.url.clone()
                    }
                };
                println!(
                    "#{:<4} {:<6} {} at {} ({}){}",
                    entry.id,
                    entry.action,
                    target,
                    entry.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    entry.recurrence,
                    if entry.active { "" } else { " inactive" }
                );
            }
        }
        ScheduleCommand::Remove { id } => {
            if scheduler.remove(id) {
                println!("removed schedule #{id}");
            } else {
                bail!("no schedule #{id}");
            }
        }
        ScheduleCommand::Enable { id } => {
            scheduler.set_active(id, true)?;
            println!("schedule #{id} enabled");
        }
        ScheduleCommand::Disable { id } => {
            scheduler.set_active(id, false)?;
            println!("schedule #{id} disabled");
        }
    }
    Ok(())
}

async fn settings(
    ctx: &AppContext,
    key: Option<String>,
    value: Option<String>,
    save: bool,
) -> Result<()> {
    match (key, value) {
        (None, _) => {
            let current = ctx.manager.settings();
            for key in SETTING_KEYS {
                println!("{key} = {}", current.get(key)?);
            }
        }
        (Some(key), None) => println!("{key} = {}", ctx.manager.settings().get(&key)?),
        (Some(key), Some(value)) => {
            ctx.manager.update_setting(&key, &value)?;
            if key.starts_with("batch.") {
                let batch = ctx.manager.settings().batch;
                ctx.batch.set_max_concurrent(batch.max_concurrent);
                ctx.batch.set_max_total_downloads(batch.max_total_downloads);
            }
            println!("{key} = {}", ctx.manager.settings().get(&key)?);
        }
    }
    if save {
        let path = ctx
            .config_path
            .as_deref()
            .context("no settings file location; pass --config")?;
        ctx.manager.settings().save(path)?;
        println!("saved {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn parse(line: &str) -> ShellCommand {
        ShellLine::try_parse_from(split_words(line).unwrap())
            .unwrap()
            .command
    }

    // ==================== Word splitting ====================

    #[test]
    fn test_split_words_plain() {
        assert_eq!(split_words("pause  all ").unwrap(), vec!["pause", "all"]);
    }

    #[test]
    fn test_split_words_quotes_group() {
        assert_eq!(
            split_words(r#"download "https://e.com/a b.zip" -f 'my file.zip'"#).unwrap(),
            vec!["download", "https://e.com/a b.zip", "-f", "my file.zip"]
        );
        assert_eq!(split_words("x \"\"").unwrap(), vec!["x", ""]);
    }

    #[test]
    fn test_split_words_unterminated_quote_errors() {
        assert!(split_words("download \"https://e.com").is_err());
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_download_with_options() {
        let ShellCommand::Download(args) = parse("add https://e.com/f.iso -s 8 -l 1024 -o /tmp") else {
            panic!("expected download");
        };
        let request = args.to_request();
        assert_eq!(request.url, "https://e.com/f.iso");
        assert_eq!(request.segments, Some(8));
        assert_eq!(request.speed_limit, Some(1024));
        assert_eq!(request.destination, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_parse_targets() {
        assert!(matches!(parse("pause all"), ShellCommand::Pause { target: Target::All }));
        assert!(matches!(
            parse("cancel #3"),
            ShellCommand::Cancel { target: Target::Task(id) } if id == TaskId::new(3)
        ));
        assert!(ShellLine::try_parse_from(["pause", "soon"]).is_err());
    }

    #[test]
    fn test_parse_remove_delete_file() {
        assert!(matches!(
            parse("rm 2 --delete-file"),
            ShellCommand::Remove { delete_file: true, .. }
        ));
        assert!(matches!(
            parse("remove all"),
            ShellCommand::Remove { target: Target::All, delete_file: false }
        ));
    }

    #[test]
    fn test_parse_list_with_status() {
        assert!(matches!(
            parse("list paused"),
            ShellCommand::List { status: Some(s) } if s == "paused"
        ));
        assert!(matches!(parse("ls"), ShellCommand::List { status: None }));
    }

    #[test]
    fn test_parse_batch_file_kind() {
        let ShellCommand::Batch(BatchCommand::File { path, kind }) =
            parse("batch file links.dat --kind html")
        else {
            panic!("expected batch file");
        };
        assert_eq!(kind, Some(SourceKind::Html));
        assert!(matches!(kind.unwrap().source(path), BatchSource::HtmlFile(_)));
    }

    #[test]
    fn test_parse_exit_alias() {
        assert!(matches!(parse("exit"), ShellCommand::Quit));
    }

    #[test]
    fn test_parse_crawl_start_builds_config() {
        let ShellCommand::Crawl(CrawlCli {
            control: None,
            start,
        }) = parse(
            "crawl https://e.com -d 3 --pages 50 --scope same-host --ext pdf,zip --download --no-robots",
        )
        else {
            panic!("expected crawl start");
        };
        let url = start.url.clone().unwrap();
        assert_eq!(url, "https://e.com");
        let config = start.to_config(&url, &dlm_core::config::CrawlerSettings::default());
        assert_eq!(config.max_pages, 50);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.scope, DomainScope::SameHost);
        assert_eq!(config.downloadable_extensions, vec!["pdf", "zip"]);
        assert!(config.auto_download);
        assert!(!config.respect_robots_txt);
    }

    #[test]
    fn test_parse_crawl_controls() {
        assert!(matches!(
            parse("crawl stop"),
            ShellCommand::Crawl(CrawlCli { control: Some(CrawlCommand::Stop), .. })
        ));
        assert!(ShellLine::try_parse_from(["crawl"]).is_err());
    }

    #[test]
    fn test_parse_schedule_add_recurring() {
        let ShellCommand::Schedule(ScheduleCommand::Add { when, .. }) =
            parse("schedule add https://e.com/x --in 60 --every daily")
        else {
            panic!("expected schedule add");
        };
        assert_eq!(when.every, Recurrence::Daily);
        let now = Utc::now();
        assert_eq!(when.start_time(now).unwrap(), now + TimeDelta::seconds(60));
    }

    #[test]
    fn test_parse_schedule_at_conflicts_with_in() {
        let words = split_words("schedule add https://e.com/x --in 5 --at 10:00").unwrap();
        assert!(ShellLine::try_parse_from(words).is_err());
    }

    #[test]
    fn test_parse_status_names() {
        assert_eq!(parse_status("Paused").unwrap(), TaskStatus::Paused);
        assert!(parse_status("sleeping").is_err());
    }

    // ==================== Times ====================

    #[test]
    fn test_parse_time_rfc3339() {
        let now = Utc::now();
        let at = parse_time("2030-05-01T10:00:00Z", now).unwrap();
        assert_eq!(at.to_rfc3339(), "2030-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_time_of_day_is_in_the_future() {
        let now = Utc::now();
        let at = parse_time("00:00", now).unwrap();
        assert!(at > now);
        assert!(at - now <= TimeDelta::hours(25));
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("next tuesday", Utc::now()).is_err());
    }
}
