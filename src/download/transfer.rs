//! Runs one task's transfer: probe, plan, segment workers, finalize.
//!
//! Each admitted task gets one [`run_transfer`] call on its own tokio task.
//! Segment workers write disjoint ranges of a shared `.part` file through their
//! own file handles, so no write lock is needed.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{HttpClient, RangeResponse};
use super::error::DownloadError;
use super::filename::{part_path, resolve_unique_path};
use super::retry::{RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::segment::SegmentStatus;
use super::task::{DownloadTask, TaskStatus};
use crate::throttle::Throttler;

/// Final paths claimed by tasks in this process.
///
/// Two tasks admitted in the same tick must not resolve to the same file even
/// though neither has created it yet.
#[derive(Debug, Default)]
pub(crate) struct PathReservations {
    paths: Mutex<HashSet<PathBuf>>,
}

impl PathReservations {
    /// Resolves a unique path for `filename` in `dir` and claims it.
    pub(crate) fn reserve(&self, dir: &Path, filename: &str) -> PathBuf {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let path = resolve_unique_path(dir, filename, |p| paths.contains(p));
        paths.insert(path.clone());
        path
    }

    /// Claims a path restored from the task store.
    pub(crate) fn insert(&self, path: PathBuf) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path);
    }

    /// Releases a removed task's path.
    pub(crate) fn release(&self, path: &Path) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }
}

/// Shared collaborators for every transfer.
#[derive(Debug)]
pub(crate) struct TransferContext {
    pub client: HttpClient,
    pub retry: RetryPolicy,
    pub global_throttle: Arc<Throttler>,
    pub reservations: Arc<PathReservations>,
}

enum Outcome {
    Completed,
    Interrupted,
}

/// Drives a task from Connecting to a terminal status, or until `cancel`
/// fires because the user paused or canceled it.
#[instrument(skip_all, fields(task_id = %task.id(), url = %task.url()))]
pub(crate) async fn run_transfer(
    task: Arc<DownloadTask>,
    ctx: Arc<TransferContext>,
    cancel: CancellationToken,
) {
    match transfer(&task, &ctx, &cancel).await {
        Ok(Outcome::Completed) => {
            info!(bytes = task.downloaded_bytes(), "download completed");
        }
        Ok(Outcome::Interrupted) => {
            task.settle_segments();
            debug!(status = %task.status(), "transfer interrupted");
        }
        Err(_) if cancel.is_cancelled() => {
            task.settle_segments();
            debug!(status = %task.status(), "transfer interrupted");
        }
        Err(e) => {
            warn!(error = %e, "download failed");
            task.fail(e.to_string());
        }
    }
}

async fn transfer(
    task: &Arc<DownloadTask>,
    ctx: &Arc<TransferContext>,
    cancel: &CancellationToken,
) -> Result<Outcome, DownloadError> {
    let final_path = if task.needs_probe() {
        let Some(probe) = probe_with_retries(task, ctx, cancel).await? else {
            return Ok(Outcome::Interrupted);
        };
        let dir = task.destination().to_path_buf();
        let planned = task.apply_probe(&probe, |name| ctx.reservations.reserve(&dir, name));
        match planned {
            Some(path) => path,
            None => return Ok(Outcome::Interrupted),
        }
    } else {
        match task.final_path() {
            Some(path) => path,
            None => return Ok(Outcome::Interrupted),
        }
    };

    let part = part_path(&final_path);
    if task.all_segments_complete() && !part.exists() && final_path.exists() {
        // Paused between the rename and the final status change.
        task.advance(TaskStatus::Connecting, TaskStatus::Downloading);
        return Ok(if task.advance(TaskStatus::Downloading, TaskStatus::Completed) {
            Outcome::Completed
        } else {
            Outcome::Interrupted
        });
    }
    prepare_part_file(&part, task.total_size()).await?;

    if !task.advance(TaskStatus::Connecting, TaskStatus::Downloading) {
        return Ok(Outcome::Interrupted);
    }
    debug!(
        path = %final_path.display(),
        total = ?task.total_size(),
        segments = task.segments().len(),
        "transfer started"
    );

    let workers_cancel = cancel.child_token();
    let mut workers = JoinSet::new();
    for index in task.pending_segments() {
        workers.spawn(download_segment(
            Arc::clone(task),
            Arc::clone(ctx),
            part.clone(),
            index,
            workers_cancel.clone(),
        ));
    }

    let mut failure = None;
    while let Some(joined) = workers.join_next().await {
        let result = joined.unwrap_or_else(|join_error| {
            Err(DownloadError::io(
                &part,
                std::io::Error::other(join_error.to_string()),
            ))
        });
        if let Err(e) = result
            && failure.is_none()
        {
            // One exhausted segment fails the task; stop the siblings.
            workers_cancel.cancel();
            failure = Some(e);
        }
    }

    if cancel.is_cancelled() {
        return Ok(Outcome::Interrupted);
    }
    if let Some(e) = failure {
        return Err(e);
    }

    finalize(task, &part, &final_path).await?;
    if task.advance(TaskStatus::Downloading, TaskStatus::Completed) {
        Ok(Outcome::Completed)
    } else {
        Ok(Outcome::Interrupted)
    }
}

async fn probe_with_retries(
    task: &DownloadTask,
    ctx: &TransferContext,
    cancel: &CancellationToken,
) -> Result<Option<super::client::ProbeResult>, DownloadError> {
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return Ok(None),
            result = ctx.client.probe(task.url()) => result,
        };
        match result {
            Ok(probe) => return Ok(Some(probe)),
            Err(e) => match ctx.retry.should_retry(classify_error(&e), attempt) {
                RetryDecision::Retry { delay, attempt: next } => {
                    let delay = retry_delay(&e, delay);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "probe failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(reason = %reason, "probe not retried");
                    return Err(e);
                }
            },
        }
    }
}

/// Server-requested delay wins when it is longer than the backoff.
fn retry_delay(error: &DownloadError, backoff: std::time::Duration) -> std::time::Duration {
    error
        .retry_after()
        .and_then(parse_retry_after)
        .map_or(backoff, |server| server.max(backoff))
}

async fn prepare_part_file(part: &Path, total: Option<u64>) -> Result<(), DownloadError> {
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(part)
        .await
        .map_err(|e| DownloadError::io(part, e))?;
    // Known sizes are preallocated; unknown sizes restart from zero.
    file.set_len(total.unwrap_or(0))
        .await
        .map_err(|e| DownloadError::io(part, e))?;
    Ok(())
}

/// Retries one segment until it completes, the budget runs out, or the run is
/// canceled. Progress made during an attempt resets the attempt counter.
async fn download_segment(
    task: Arc<DownloadTask>,
    ctx: Arc<TransferContext>,
    part: PathBuf,
    index: usize,
    cancel: CancellationToken,
) -> Result<(), DownloadError> {
    let mut attempt = 1;
    loop {
        let before = task.downloaded_bytes();
        let result = stream_segment(&task, &ctx, &part, index, &cancel).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Err(e) = result else {
            return Ok(());
        };
        if task.downloaded_bytes() > before {
            attempt = 1;
        }
        task.set_segment_status(index, SegmentStatus::Pending);
        match ctx.retry.should_retry(classify_error(&e), attempt) {
            RetryDecision::Retry { delay, attempt: next } => {
                let delay = retry_delay(&e, delay);
                warn!(
                    task_id = %task.id(),
                    segment = index,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "segment failed, retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt = next;
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(task_id = %task.id(), segment = index, reason = %reason, error = %e, "segment failed");
                task.set_segment_status(index, SegmentStatus::Failed);
                return Err(e);
            }
        }
    }
}

async fn stream_segment(
    task: &DownloadTask,
    ctx: &TransferContext,
    part: &Path,
    index: usize,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let Some((offset, end)) = task.segment_range(index) else {
        return Ok(());
    };
    if end.is_some_and(|end| offset >= end) {
        task.set_segment_status(index, SegmentStatus::Completed);
        return Ok(());
    }
    task.set_segment_status(index, SegmentStatus::Active);

    let url = task.url();
    let RangeResponse { partial, response } = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        result = ctx.client.fetch_range(url, offset, end) => result?,
    };
    if offset > 0 && !partial {
        return Err(DownloadError::range_ignored(url.as_str(), offset));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(part)
        .await
        .map_err(|e| DownloadError::io(part, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| DownloadError::io(part, e))?;

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|e| DownloadError::network(url.as_str(), e))?;

        // A server that ignored the range for segment 0 sends the whole body;
        // only this segment's share is written.
        let remaining = task.segment_remaining(index);
        let take = remaining.map_or(chunk.len(), |r| {
            usize::try_from(r).map_or(chunk.len(), |r| r.min(chunk.len()))
        });
        if take == 0 {
            break;
        }

        let throttled = async {
            task.throttle().request(take as u64).await;
            ctx.global_throttle.request(take as u64).await;
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = throttled => {}
        }

        file.write_all(&chunk[..take])
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        task.record_progress(index, take as u64);
        if remaining == Some(take as u64) {
            break;
        }
    }
    file.flush().await.map_err(|e| DownloadError::io(part, e))?;

    if cancel.is_cancelled() {
        return Ok(());
    }
    match (task.segment_remaining(index), end) {
        (Some(0), _) => Ok(()),
        (Some(_), Some(end)) => Err(DownloadError::incomplete(url.as_str(), end - offset)),
        (Some(_), None) | (None, _) => {
            task.finish_open_ended(index);
            Ok(())
        }
    }
}

/// Checks the byte count, moves the `.part` file into place and verifies the
/// checksum when one was requested.
async fn finalize(task: &DownloadTask, part: &Path, final_path: &Path) -> Result<(), DownloadError> {
    if !task.all_segments_complete() {
        return Err(DownloadError::integrity(
            part,
            task.total_size().unwrap_or(0),
            task.downloaded_bytes(),
        ));
    }
    let downloaded = task.downloaded_bytes();
    let on_disk = fs::metadata(part)
        .await
        .map_err(|e| DownloadError::io(part, e))?
        .len();
    let expected = task.total_size().unwrap_or(downloaded);
    if downloaded != expected || on_disk != expected {
        return Err(DownloadError::integrity(part, expected, on_disk.min(downloaded)));
    }

    fs::rename(part, final_path)
        .await
        .map_err(|e| DownloadError::io(final_path, e))?;

    if let Some(expected) = task.expected_sha256() {
        let actual = sha256_file(final_path).await?;
        if actual != expected {
            return Err(DownloadError::checksum(final_path, expected, actual));
        }
        debug!(path = %final_path.display(), "checksum verified");
    }
    Ok(())
}

/// Lowercase hex SHA-256 of a file.
pub(crate) async fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reservations_prevent_duplicate_paths() {
        let dir = TempDir::new().unwrap();
        let reservations = PathReservations::default();
        let first = reservations.reserve(dir.path(), "a.zip");
        let second = reservations.reserve(dir.path(), "a.zip");
        assert_eq!(first, dir.path().join("a.zip"));
        assert_eq!(second, dir.path().join("a_1.zip"));

        reservations.release(&first);
        assert_eq!(reservations.reserve(dir.path(), "a.zip"), first);
    }

    #[tokio::test]
    async fn test_sha256_file_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_prepare_part_file_preallocates() {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("sub").join("f.bin.part");
        prepare_part_file(&part, Some(4096)).await.unwrap();
        assert_eq!(std::fs::metadata(&part).unwrap().len(), 4096);
    }

    #[test]
    fn test_retry_delay_prefers_longer_server_hint() {
        let e = DownloadError::http_status_with_retry_after("u", 503, Some("5".to_string()));
        assert_eq!(
            retry_delay(&e, std::time::Duration::from_secs(1)),
            std::time::Duration::from_secs(5)
        );
        let e = DownloadError::http_status("u", 503);
        assert_eq!(
            retry_delay(&e, std::time::Duration::from_secs(1)),
            std::time::Duration::from_secs(1)
        );
    }
}
