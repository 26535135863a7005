//! Progress bars driven by task events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dlm_core::{DownloadManager, TaskEvent, TaskId, TaskStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:>4} {wide_msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}";

/// Running progress display. Dropping it leaves the task running; call
/// [`ProgressUi::stop`].
pub(crate) struct ProgressUi {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl ProgressUi {
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

/// Spawns the progress display when `enabled`; `None` otherwise.
pub(crate) fn spawn_progress_ui(enabled: bool, manager: &Arc<DownloadManager>) -> Option<ProgressUi> {
    if !enabled {
        return None;
    }
    let stop = CancellationToken::new();
    let handle = tokio::spawn(render(Arc::clone(manager), stop.clone()));
    Some(ProgressUi { handle, stop })
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn new_bar(multi: &MultiProgress, id: TaskId, label: &str) -> ProgressBar {
    let bar = multi.add(ProgressBar::new(0));
    bar.set_style(bar_style());
    bar.set_prefix(format!("#{id}"));
    bar.set_message(label.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn render(manager: Arc<DownloadManager>, stop: CancellationToken) {
    let mut events = manager.subscribe();
    let multi = MultiProgress::new();
    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();

    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "progress display lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            TaskEvent::Added { id, url } => {
                bars.entry(id).or_insert_with(|| new_bar(&multi, id, &url));
            }
            TaskEvent::Progress {
                id,
                downloaded,
                total,
                ..
            } => {
                let bar = bars.entry(id).or_insert_with(|| {
                    let label = manager
                        .task(id)
                        .map(|t| t.url().to_string())
                        .unwrap_or_default();
                    new_bar(&multi, id, &label)
                });
                if let Some(total) = total {
                    bar.set_length(total);
                }
                bar.set_position(downloaded);
                if let Some(name) = manager.task(id).and_then(|t| t.filename()) {
                    bar.set_message(name);
                }
            }
            TaskEvent::StatusChanged { id, status } if status.is_terminal() => {
                if let Some(bar) = bars.remove(&id) {
                    let note = match status {
                        TaskStatus::Completed => "done",
                        TaskStatus::Failed => "failed",
                        _ => "canceled",
                    };
                    bar.finish_with_message(note);
                }
            }
            TaskEvent::StatusChanged {
                id,
                status: TaskStatus::Paused,
            } => {
                if let Some(bar) = bars.get(&id) {
                    bar.set_message("paused");
                }
            }
            TaskEvent::Removed { id } => {
                if let Some(bar) = bars.remove(&id) {
                    bar.finish_and_clear();
                }
            }
            TaskEvent::StatusChanged { .. } => {}
        }
    }

    for bar in bars.into_values() {
        bar.abandon();
    }
}

/// Human-readable byte count, binary units.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Speed in bytes per second, formatted with [`format_bytes`].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn format_speed(bytes_per_second: f64) -> String {
    let rounded = if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
        bytes_per_second.round() as u64
    } else {
        0
    };
    format!("{}/s", format_bytes(rounded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_small_values_are_exact() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn test_format_bytes_scales_units() {
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MiB");
    }

    #[test]
    fn test_format_speed_handles_non_finite() {
        assert_eq!(format_speed(f64::NAN), "0 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KiB/s");
    }

    #[tokio::test]
    async fn test_progress_ui_disabled_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = dlm_core::Settings::default();
        settings.general.download_directory = dir.path().to_path_buf();
        let manager = Arc::new(DownloadManager::with_store(settings, None).unwrap());
        assert!(spawn_progress_ui(false, &manager).is_none());
        let ui = spawn_progress_ui(true, &manager);
        assert!(ui.is_some());
        if let Some(ui) = ui {
            ui.stop().await;
        }
    }
}
