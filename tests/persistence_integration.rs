//! Integration tests for saving tasks and resuming them after a restart.

mod support;

use std::sync::Arc;
use std::time::Duration;

use dlm_core::{DownloadManager, DownloadRequest, TaskStatus, TaskStore};
use support::{patterned_body, serve_ranged, test_settings, wait_terminal};
use tempfile::TempDir;
use wiremock::MockServer;

#[tokio::test]
async fn test_paused_download_resumes_after_restart() {
    let server = MockServer::start().await;
    let body = patterned_body(2 * 1024 * 1024);
    serve_ranged(&server, "/disk.img", body.clone()).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let store_path = temp_dir.path().join("state").join("tasks.json");
    let settings = test_settings(temp_dir.path());

    // First session: start, pause part way, shut down.
    let first = Arc::new(
        DownloadManager::with_store(settings.clone(), Some(TaskStore::new(&store_path)))
            .expect("manager should build"),
    );
    first.start();
    let id = first
        .add_download(
            DownloadRequest::new(format!("{}/disk.img", server.uri()))
                .segments(4)
                .speed_limit(512 * 1024),
        )
        .await
        .expect("download should be accepted");
    let task = first.task(id).expect("task should exist");
    tokio::time::timeout(Duration::from_secs(20), async {
        while task.downloaded_bytes() < 256 * 1024 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("some bytes should arrive");
    assert!(first.pause_download(id).expect("pause should succeed"));
    first.shutdown().await;
    let saved = task.downloaded_bytes();
    assert!(store_path.exists(), "store should be written on shutdown");

    // Second session: the task comes back paused with its progress.
    let second = Arc::new(
        DownloadManager::with_store(settings, Some(TaskStore::new(&store_path)))
            .expect("manager should build"),
    );
    assert_eq!(second.restore().await.expect("restore should succeed"), 1);
    second.start();
    let restored = second.task(id).expect("task should be restored");
    assert_eq!(restored.status(), TaskStatus::Paused);
    assert_eq!(restored.downloaded_bytes(), saved);
    assert_eq!(restored.segment_count(), 4);

    assert!(second.resume_download(id).expect("resume should succeed"));
    assert_eq!(
        wait_terminal(&second, id, Duration::from_secs(30)).await,
        TaskStatus::Completed
    );
    let path = restored.final_path().expect("final path should be set");
    assert_eq!(std::fs::read(path).expect("should read file"), body);

    // New ids continue after restored ones.
    let next = second
        .add_download(DownloadRequest::new(format!("{}/disk.img", server.uri())))
        .await
        .expect("download should be accepted");
    assert!(next > id);
    second.shutdown().await;
}

#[tokio::test]
async fn test_completed_tasks_are_not_restored() {
    let server = MockServer::start().await;
    serve_ranged(&server, "/small.txt", patterned_body(512)).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let store_path = temp_dir.path().join("tasks.json");
    let settings = test_settings(temp_dir.path());

    let first = Arc::new(
        DownloadManager::with_store(settings.clone(), Some(TaskStore::new(&store_path)))
            .expect("manager should build"),
    );
    first.start();
    let id = first
        .add_download(DownloadRequest::new(format!("{}/small.txt", server.uri())))
        .await
        .expect("download should be accepted");
    assert_eq!(
        wait_terminal(&first, id, Duration::from_secs(30)).await,
        TaskStatus::Completed
    );
    first.shutdown().await;

    let second = DownloadManager::with_store(settings, Some(TaskStore::new(&store_path)))
        .expect("manager should build");
    assert_eq!(second.restore().await.expect("restore should succeed"), 0);
    assert!(second.tasks().is_empty());
}

#[tokio::test]
async fn test_corrupt_store_starts_empty() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let store_path = temp_dir.path().join("tasks.json");
    std::fs::write(&store_path, b"{ not json").expect("should write store");

    let manager = DownloadManager::with_store(
        test_settings(temp_dir.path()),
        Some(TaskStore::new(&store_path)),
    )
    .expect("manager should build");
    assert_eq!(manager.restore().await.expect("restore should succeed"), 0);
}
