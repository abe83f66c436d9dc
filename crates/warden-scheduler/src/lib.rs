use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrder};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, warn};
use warden_common::SchedulerSettings;
use warden_core::MessageTask;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A registered task handler. Unregistered task types degrade to a logged
/// skip, never an error.
pub type TaskHandler = Arc<dyn Fn(MessageTask) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("task queue is full (capacity {0})")]
    QueueFull(usize),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Debug)]
struct QueuedTask {
    seq: u64,
    task: MessageTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest
        // (priority, enqueue sequence) pair surfaces first. The sequence
        // tiebreak keeps FIFO order within a priority class.
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TypeCounters {
    pub processed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct LatencyTracker {
    total_ms: u64,
    samples: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub active_workers: usize,
    pub enqueued: u64,
    pub dropped_queue_full: u64,
    pub per_type: HashMap<String, TypeCounters>,
    pub avg_latency_ms: f64,
}

/// Bounded-concurrency priority scheduler: one dispatch loop, a semaphore
/// ceiling on in-flight units, a per-unit timeout, and fail-fast enqueue.
pub struct TaskScheduler {
    settings: SchedulerSettings,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
    queue_notify: Notify,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    workers: Arc<Semaphore>,
    handlers: Mutex<HashMap<String, TaskHandler>>,
    enqueued: AtomicU64,
    dropped_full: AtomicU64,
    counters: Mutex<HashMap<String, TypeCounters>>,
    latency: Mutex<LatencyTracker>,
}

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    // Handler state is counters and registrations only; a panicked writer
    // cannot leave them logically torn, so poisoning is ignored.
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskScheduler {
    pub fn new(settings: SchedulerSettings) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(settings.worker_ceiling));
        Arc::new(Self {
            settings,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            queue_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            workers,
            handlers: Mutex::new(HashMap::new()),
            enqueued: AtomicU64::new(0),
            dropped_full: AtomicU64::new(0),
            counters: Mutex::new(HashMap::new()),
            latency: Mutex::new(LatencyTracker::default()),
        })
    }

    pub fn register_handler(&self, task_type: &str, handler: TaskHandler) {
        relock(self.handlers.lock()).insert(task_type.to_string(), handler);
    }

    pub fn register_fn<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(MessageTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: TaskHandler = Arc::new(move |task| Box::pin(handler(task)));
        self.register_handler(task_type, wrapped);
    }

    /// Fail-fast admission: a full queue drops the task immediately rather
    /// than blocking the caller.
    pub fn enqueue(&self, task: MessageTask) -> Result<(), EnqueueError> {
        if self.shutdown.load(AtomicOrder::Relaxed) {
            return Err(EnqueueError::ShuttingDown);
        }
        {
            let mut queue = relock(self.queue.lock());
            if queue.len() >= self.settings.queue_capacity {
                self.dropped_full.fetch_add(1, AtomicOrder::Relaxed);
                return Err(EnqueueError::QueueFull(self.settings.queue_capacity));
            }
            let seq = self.seq.fetch_add(1, AtomicOrder::Relaxed);
            queue.push(QueuedTask { seq, task });
        }
        self.enqueued.fetch_add(1, AtomicOrder::Relaxed);
        self.queue_notify.notify_one();
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        relock(self.queue.lock()).len()
    }

    pub fn active_workers(&self) -> usize {
        self.settings.worker_ceiling - self.workers.available_permits()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let latency = relock(self.latency.lock());
        let avg_latency_ms = if latency.samples == 0 {
            0.0
        } else {
            latency.total_ms as f64 / latency.samples as f64
        };
        StatsSnapshot {
            queue_depth: self.queue_depth(),
            active_workers: self.active_workers(),
            enqueued: self.enqueued.load(AtomicOrder::Relaxed),
            dropped_queue_full: self.dropped_full.load(AtomicOrder::Relaxed),
            per_type: relock(self.counters.lock()).clone(),
            avg_latency_ms,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrder::Relaxed);
        self.shutdown_notify.notify_waiters();
        self.queue_notify.notify_waiters();
    }

    /// The single dispatch loop. Dequeues the highest-priority, oldest task;
    /// when the worker ceiling is reached the task is pushed back and the
    /// loop yields briefly. Under sustained saturation that gives eventual
    /// admission, not strict ordering.
    pub async fn run(self: Arc<Self>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            if self.shutdown.load(AtomicOrder::Relaxed) {
                break;
            }
            // Reap finished units so the join set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}

            let Some(queued) = self.pop() else {
                tokio::select! {
                    _ = self.queue_notify.notified() => {}
                    _ = self.shutdown_notify.notified() => break,
                }
                continue;
            };

            let permit = match Arc::clone(&self.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.requeue(queued);
                    tokio::time::sleep(Duration::from_millis(self.settings.dispatch_backoff_ms))
                        .await;
                    continue;
                }
            };

            let scheduler = Arc::clone(&self);
            in_flight.spawn(async move {
                let _permit = permit;
                scheduler.execute(queued.task).await;
            });
        }
        self.drain(in_flight).await;
    }

    fn pop(&self) -> Option<QueuedTask> {
        relock(self.queue.lock()).pop()
    }

    fn requeue(&self, queued: QueuedTask) {
        // The original sequence number is kept so the task does not lose its
        // FIFO position within its priority class.
        relock(self.queue.lock()).push(queued);
    }

    async fn execute(&self, task: MessageTask) {
        let task_type = task.task_type.clone();
        let handler = relock(self.handlers.lock()).get(&task_type).cloned();
        let Some(handler) = handler else {
            warn!(task_type = %task_type, "no handler registered, skipping task");
            self.record(&task_type, ProcessingResult::Skipped, None);
            return;
        };

        let started = Instant::now();
        let budget = Duration::from_millis(self.settings.task_timeout_ms);
        let result = match timeout(budget, handler(task)).await {
            Err(_) => {
                warn!(
                    task_type = %task_type,
                    timeout_ms = self.settings.task_timeout_ms,
                    "task exceeded its execution budget"
                );
                ProcessingResult::TimedOut
            }
            Ok(Err(err)) => {
                error!(task_type = %task_type, error = %err, "task handler failed");
                ProcessingResult::Failed
            }
            Ok(Ok(())) => ProcessingResult::Completed,
        };
        self.record(&task_type, result, Some(started.elapsed()));
    }

    fn record(&self, task_type: &str, result: ProcessingResult, elapsed: Option<Duration>) {
        {
            let mut counters = relock(self.counters.lock());
            let entry = counters.entry(task_type.to_string()).or_default();
            match result {
                ProcessingResult::Completed => entry.processed += 1,
                ProcessingResult::Failed => entry.failed += 1,
                ProcessingResult::TimedOut => entry.timed_out += 1,
                ProcessingResult::Skipped => entry.skipped += 1,
            }
        }
        if result == ProcessingResult::Completed
            && let Some(elapsed) = elapsed
        {
            let mut latency = relock(self.latency.lock());
            latency.total_ms += elapsed.as_millis() as u64;
            latency.samples += 1;
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.settings.shutdown_grace_ms);
        while !in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, in_flight.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining_tasks = in_flight.len(),
                        "shutdown grace period elapsed, cancelling in-flight tasks"
                    );
                    in_flight.abort_all();
                    break;
                }
            }
        }
    }
}
