//! Task registry and the admission loop.
//!
//! # Overview
//!
//! [`DownloadQueue`] owns every [`DownloadTask`] by id and runs a loop that
//! wakes on a 100ms tick or whenever something changes (enqueue, resume,
//! completion, settings). Each wake admits `Queued` tasks in FIFO order while
//! fewer than `max_concurrent` tasks are `Connecting` or `Downloading`, then
//! samples the speed of every transferring task.
//!
//! # Lock ordering
//!
//! The registry lock is released before any task lock is taken: lookups clone
//! the `Arc`s out first.

mod error;

pub use error::QueueError;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::download::constants::QUEUE_TICK;
use crate::download::transfer::{TransferContext, run_transfer};
use crate::download::{DownloadTask, TaskId, TaskStatus};
use crate::events::TaskEvent;

/// Registry of tasks plus the concurrency-limited admission loop.
#[derive(Debug)]
pub struct DownloadQueue {
    tasks: RwLock<BTreeMap<TaskId, Arc<DownloadTask>>>,
    running: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    max_concurrent: AtomicUsize,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    ctx: RwLock<Arc<TransferContext>>,
    events: broadcast::Sender<TaskEvent>,
}

impl DownloadQueue {
    pub(crate) fn new(
        max_concurrent: usize,
        ctx: TransferContext,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            running: Mutex::new(HashMap::new()),
            max_concurrent: AtomicUsize::new(max_concurrent.max(1)),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            ctx: RwLock::new(Arc::new(ctx)),
            events,
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the next task id.
    pub(crate) fn allocate_id(&self) -> TaskId {
        TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Keeps future ids above a restored one.
    pub(crate) fn observe_id(&self, id: TaskId) {
        self.next_id.fetch_max(id.get() + 1, Ordering::Relaxed);
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn transfer_context(&self) -> Arc<TransferContext> {
        Arc::clone(&self.ctx.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the collaborators used by transfers admitted from now on.
    pub(crate) fn set_transfer_context(&self, ctx: TransferContext) {
        *self.ctx.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ctx);
    }

    // ==================== Registry ====================

    /// Registers a task without enqueueing it.
    pub fn insert(&self, task: Arc<DownloadTask>) {
        let id = task.id();
        let url = task.url().to_string();
        self.observe_id(id);
        if task.status() == TaskStatus::Queued {
            task.set_queue_seq(self.next_seq());
        }
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);
        let _ = self.events.send(TaskEvent::Added { id, url });
        self.wake.notify_one();
    }

    /// Moves a New task to Queued and wakes the loop.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for unknown ids.
    pub fn enqueue(&self, id: TaskId) -> Result<bool, QueueError> {
        let task = self.get(id).ok_or(QueueError::NotFound(id))?;
        let enqueued = task.enqueue(self.next_seq());
        if enqueued {
            self.wake.notify_one();
        }
        Ok(enqueued)
    }

    /// Looks up a task.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// All tasks in id order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true when no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels (if needed) and unregisters a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for unknown ids.
    pub fn remove(&self, id: TaskId) -> Result<Arc<DownloadTask>, QueueError> {
        let task = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(QueueError::NotFound(id))?;
        if !task.status().is_terminal() {
            let _ = task.cancel();
        }
        if let Some(path) = task.final_path() {
            self.transfer_context().reservations.release(&path);
        }
        let _ = self.events.send(TaskEvent::Removed { id });
        self.wake.notify_one();
        Ok(task)
    }

    // ==================== Task Operations ====================

    /// Pauses a task. `Ok(false)` when already paused.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] for unknown ids and invalid transitions.
    pub fn pause(&self, id: TaskId) -> Result<bool, QueueError> {
        let task = self.get(id).ok_or(QueueError::NotFound(id))?;
        let changed = task.pause()?;
        if changed {
            self.wake.notify_one();
        }
        Ok(changed)
    }

    /// Re-queues a paused task at the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] for unknown ids and invalid transitions.
    pub fn resume(&self, id: TaskId) -> Result<bool, QueueError> {
        let task = self.get(id).ok_or(QueueError::NotFound(id))?;
        let changed = task.resume()?;
        if changed {
            task.set_queue_seq(self.next_seq());
            self.wake.notify_one();
        }
        Ok(changed)
    }

    /// Cancels a task. `Ok(false)` when already canceled.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] for unknown ids and invalid transitions.
    pub fn cancel(&self, id: TaskId) -> Result<bool, QueueError> {
        let task = self.get(id).ok_or(QueueError::NotFound(id))?;
        let changed = task.cancel()?;
        if changed {
            self.wake.notify_one();
        }
        Ok(changed)
    }

    /// Re-queues a failed or canceled task from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] for unknown ids and invalid transitions.
    pub fn restart(&self, id: TaskId) -> Result<bool, QueueError> {
        let task = self.get(id).ok_or(QueueError::NotFound(id))?;
        let changed = task.restart()?;
        if changed {
            task.set_queue_seq(self.next_seq());
            self.wake.notify_one();
        }
        Ok(changed)
    }

    /// Pauses every task that can be paused; returns how many changed.
    pub fn pause_all(&self) -> usize {
        self.tasks()
            .iter()
            .filter(|task| matches!(task.pause(), Ok(true)))
            .count()
    }

    /// Resumes every paused task; returns how many changed.
    pub fn resume_all(&self) -> usize {
        let ids: Vec<TaskId> = self.tasks().iter().map(|t| t.id()).collect();
        ids.into_iter()
            .filter(|id| matches!(self.resume(*id), Ok(true)))
            .count()
    }

    /// Cancels every non-terminal task; returns how many changed.
    pub fn cancel_all(&self) -> usize {
        let changed = self
            .tasks()
            .iter()
            .filter(|task| matches!(task.cancel(), Ok(true)))
            .count();
        self.wake.notify_one();
        changed
    }

    // ==================== Admission Loop ====================

    /// Current concurrency limit.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }

    /// Changes the concurrency limit. Lowering it never interrupts running
    /// transfers; it only delays admissions.
    pub fn set_max_concurrent(&self, max: usize) {
        self.max_concurrent.store(max.max(1), Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Admits queued tasks up to the limit; returns how many started.
    ///
    /// A task whose previous worker has not exited yet is skipped until it has.
    pub fn process_queue(&self) -> usize {
        let mut running = self.running();
        running.retain(|_, handle| !handle.is_finished());
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let tasks = self.tasks();
        let active = tasks.iter().filter(|t| t.status().is_active()).count();
        let slots = self.max_concurrent().saturating_sub(active);
        if slots == 0 {
            return 0;
        }

        let mut queued: Vec<(u64, Arc<DownloadTask>)> = tasks
            .into_iter()
            .filter(|t| t.status() == TaskStatus::Queued && !running.contains_key(&t.id()))
            .map(|t| (t.queue_seq(), t))
            .collect();
        queued.sort_by_key(|(seq, task)| (*seq, task.id()));

        let ctx = self.transfer_context();
        let mut admitted = 0;
        for (_, task) in queued {
            if admitted == slots {
                break;
            }
            let cancel = self.shutdown.child_token();
            if !task.begin(cancel.clone()) {
                continue;
            }
            debug!(task_id = %task.id(), "admitted");
            let id = task.id();
            let wake = Arc::clone(&self.wake);
            let ctx = Arc::clone(&ctx);
            let handle = tokio::spawn(async move {
                run_transfer(task, ctx, cancel).await;
                wake.notify_one();
            });
            running.insert(id, handle);
            admitted += 1;
        }
        admitted
    }

    /// One loop iteration: admission plus speed sampling.
    pub fn tick(&self) {
        self.process_queue();
        let now = Instant::now();
        for task in self.tasks() {
            if task.status() != TaskStatus::Downloading {
                continue;
            }
            let (downloaded, total, speed) = task.sample_speed(now);
            let _ = self.events.send(TaskEvent::Progress {
                id: task.id(),
                downloaded,
                total,
                speed,
            });
        }
    }

    /// Spawns the loop; it runs until [`shutdown`](Self::shutdown).
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run().await })
    }

    #[instrument(skip(self), fields(max_concurrent = self.max_concurrent()))]
    async fn run(&self) {
        info!("queue loop started");
        let mut interval = tokio::time::interval(QUEUE_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                () = self.wake.notified() => {}
            }
            self.tick();
        }
        info!("queue loop stopped");
    }

    /// Stops the loop and every transfer, then waits for workers to exit.
    ///
    /// Task statuses are left as they are; callers pause tasks first when they
    /// want them resumable.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.running().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::transfer::PathReservations;
    use crate::download::{HttpClient, RetryPolicy, TaskOptions};
    use crate::throttle::Throttler;
    use url::Url;

    fn queue(max: usize) -> DownloadQueue {
        let (events, _) = broadcast::channel(64);
        let ctx = TransferContext {
            client: HttpClient::new(),
            retry: RetryPolicy::default(),
            global_throttle: Arc::new(Throttler::unlimited()),
            reservations: Arc::new(PathReservations::default()),
        };
        DownloadQueue::new(max, ctx, events)
    }

    fn add(queue: &DownloadQueue) -> TaskId {
        let id = queue.allocate_id();
        let task = DownloadTask::new(
            id,
            // Port 9 (discard) on localhost refuses quickly; these tests never
            // wait for transfers to finish.
            Url::parse("http://127.0.0.1:9/file.bin").unwrap(),
            std::env::temp_dir(),
            TaskOptions::default(),
            queue.events.clone(),
        );
        queue.insert(Arc::new(task));
        queue.enqueue(id).unwrap();
        id
    }

    // ==================== Registry ====================

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let queue = queue(1);
        let a = queue.allocate_id();
        let b = queue.allocate_id();
        assert!(b > a);
        queue.observe_id(TaskId::new(100));
        assert_eq!(queue.allocate_id(), TaskId::new(101));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let queue = queue(1);
        assert_eq!(
            queue.pause(TaskId::new(42)),
            Err(QueueError::NotFound(TaskId::new(42)))
        );
    }

    // ==================== Admission ====================

    #[tokio::test]
    async fn test_admission_respects_limit_and_fifo() {
        let queue = queue(2);
        let ids: Vec<TaskId> = (0..4).map(|_| add(&queue)).collect();

        assert_eq!(queue.process_queue(), 2);
        let statuses: Vec<TaskStatus> = ids.iter().map(|id| queue.get(*id).unwrap().status()).collect();
        assert!(statuses[0].is_active() || statuses[0].is_terminal());
        assert!(statuses[1].is_active() || statuses[1].is_terminal());
        assert_eq!(statuses[2], TaskStatus::Queued);
        assert_eq!(statuses[3], TaskStatus::Queued);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_paused_task_is_not_admitted() {
        let queue = queue(1);
        let id = add(&queue);
        assert!(queue.pause(id).unwrap());
        assert_eq!(queue.process_queue(), 0);
        assert_eq!(queue.get(id).unwrap().status(), TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_bulk_operations_are_idempotent() {
        let queue = queue(1);
        for _ in 0..3 {
            add(&queue);
        }
        assert_eq!(queue.pause_all(), 3);
        assert_eq!(queue.pause_all(), 0);
        assert_eq!(queue.resume_all(), 3);
        assert_eq!(queue.resume_all(), 0);
        assert_eq!(queue.cancel_all(), 3);
        assert_eq!(queue.cancel_all(), 0);
    }

    #[tokio::test]
    async fn test_resume_moves_task_to_back() {
        let queue = queue(1);
        let first = add(&queue);
        let second = add(&queue);
        queue.pause(first).unwrap();
        queue.resume(first).unwrap();
        assert!(
            queue.get(second).unwrap().queue_seq() < queue.get(first).unwrap().queue_seq()
        );
    }

    #[tokio::test]
    async fn test_remove_cancels_and_unregisters() {
        let queue = queue(1);
        let id = add(&queue);
        let task = queue.remove(id).unwrap();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(queue.get(id).is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_admission() {
        let queue = queue(1);
        add(&queue);
        queue.shutdown().await;
        assert_eq!(queue.process_queue(), 0);
        assert!(queue.is_shut_down());
    }
}
