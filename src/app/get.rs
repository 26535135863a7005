//! One-shot `dlm get`: submit the URLs, wait for them, and report.

use std::sync::Arc;

use anyhow::{Context, Result};
use dlm_core::{DownloadManager, DownloadRequest, Settings, TaskStatus, parse_input};
use tracing::{debug, error, info};

use crate::app::exit_handler::{ProcessExit, determine_exit_outcome};
use crate::app::progress::spawn_progress_ui;
use crate::cli::GetArgs;

/// Applies the `get` flags on top of the loaded settings. Tasks are never
/// persisted in one-shot mode.
pub(crate) fn settings_for_get(mut settings: Settings, args: &GetArgs) -> Settings {
    if let Some(dir) = &args.output {
        settings.general.download_directory.clone_from(dir);
    }
    if let Some(segments) = args.segments {
        settings.general.segment_count = usize::from(segments);
    }
    if let Some(concurrency) = args.concurrency {
        settings.general.max_concurrent_downloads = usize::from(concurrency);
    }
    settings.general.state_file = None;
    settings
}

/// Downloads every URL in `args` and maps the results to an exit outcome.
pub(crate) async fn run_get(settings: Settings, args: GetArgs, show_progress: bool) -> Result<ProcessExit> {
    let settings = settings_for_get(settings, &args);
    let manager =
        Arc::new(DownloadManager::new(settings).context("failed to create download manager")?);
    manager.start();

    // Invalid entries are logged by the parser and count as failures.
    let parsed = parse_input(&args.urls.join("\n"));
    let mut failed = parsed.skipped_count();
    let mut ids = Vec::with_capacity(parsed.len());
    for url in parsed.urls() {
        let mut request = DownloadRequest::new(url);
        if let Some(limit) = args.limit {
            request = request.speed_limit(limit);
        }
        match manager.add_download(request).await {
            Ok(id) => ids.push(id),
            Err(e) => {
                error!(url = %url, error = %e, "could not add download");
                failed += 1;
            }
        }
    }
    debug!(submitted = ids.len(), "downloads submitted");

    let progress = spawn_progress_ui(show_progress, &manager);
    let mut completed = 0;
    for id in ids {
        match manager.wait_for_download(id).await {
            Ok(TaskStatus::Completed) => {
                completed += 1;
                if let Some(path) = manager.task(id).and_then(|t| t.final_path()) {
                    info!(id = %id, path = %path.display(), "download complete");
                }
            }
            Ok(status) => {
                let reason = manager.task(id).and_then(|t| t.error()).unwrap_or_default();
                error!(id = %id, status = %status, error = %reason, "download did not complete");
                failed += 1;
            }
            Err(e) => {
                error!(id = %id, error = %e, "lost track of download");
                failed += 1;
            }
        }
    }
    if let Some(ui) = progress {
        ui.stop().await;
    }
    manager.shutdown().await;

    info!(completed, failed, "all downloads finished");
    Ok(determine_exit_outcome(completed, failed))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn args(urls: &[&str]) -> GetArgs {
        GetArgs {
            urls: urls.iter().map(ToString::to_string).collect(),
            output: None,
            segments: None,
            limit: None,
            concurrency: None,
        }
    }

    #[test]
    fn test_settings_for_get_applies_flags() {
        let mut get = args(&["https://e.com/a"]);
        get.output = Some(PathBuf::from("/tmp/out"));
        get.segments = Some(8);
        get.concurrency = Some(5);
        let mut base = Settings::default();
        base.general.state_file = Some(PathBuf::from("state.json"));

        let settings = settings_for_get(base, &get);
        assert_eq!(settings.general.download_directory, PathBuf::from("/tmp/out"));
        assert_eq!(settings.general.segment_count, 8);
        assert_eq!(settings.general.max_concurrent_downloads, 5);
        assert!(settings.general.state_file.is_none());
    }

    #[test]
    fn test_settings_for_get_keeps_defaults_without_flags() {
        let settings = settings_for_get(Settings::default(), &args(&["https://e.com/a"]));
        assert_eq!(settings.general.segment_count, 4);
        assert_eq!(settings.general.max_concurrent_downloads, 3);
    }

    #[tokio::test]
    async fn test_run_get_only_invalid_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut get = args(&["not a url", "ftp://e.com/file"]);
        get.output = Some(dir.path().to_path_buf());
        let exit = run_get(Settings::default(), get, false).await.unwrap();
        assert_eq!(exit, ProcessExit::Failure);
    }
}
