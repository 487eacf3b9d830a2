//! The Event Loop: a priority+delay task scheduler over a worker pool.
//!
//! Modeled on `taskdaemon`'s `scheduler::core::Scheduler` (a `BinaryHeap`
//! guarded by a `tokio::sync::Mutex`, with a `Notify` to wake idle workers),
//! generalized from an admission-control gate into a full task executor: a
//! ready heap ordered `(priority DESC, ready_at ASC, id ASC)`, a timer heap
//! for delayed/periodic work not yet due, and a fixed pool of worker tasks.
//!
//! This is the sole entry point for asynchronous work in the core (§1).

mod task;

pub use task::{TaskHandle, TaskId, TaskStatus};
use task::{ScheduledTask, StatusCell, TaskBody};

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, oneshot};
use tracing::{debug, warn};

use crate::error::CoreResult;

/// A task waiting for its `ready_at` instant to arrive.
struct TimerEntry {
    ready_at: Instant,
    task: ScheduledTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on ready_at: BinaryHeap pops the greatest, so reverse.
        other.ready_at.cmp(&self.ready_at)
    }
}

struct Inner {
    ready: BinaryHeap<ScheduledTask>,
    timer: BinaryHeap<TimerEntry>,
    stopped: bool,
}

/// Configuration for an `EventLoop`.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Number of worker tasks pulling from the ready heap.
    pub workers: usize,
    /// How often the timer task checks the timer heap for due entries.
    pub timer_tick: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timer_tick: Duration::from_millis(5),
        }
    }
}

/// The event loop: owns N worker tasks, a ready heap, and a timer heap.
pub struct EventLoop {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    next_id: Arc<AtomicU64>,
    config: EventLoopConfig,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    timer_handle: Option<tokio::task::JoinHandle<()>>,
}

impl EventLoop {
    /// Start the loop: spawns `config.workers` worker tasks plus one timer task.
    pub fn start(config: EventLoopConfig) -> Self {
        debug!(workers = config.workers, "EventLoop::start: called");
        let inner = Arc::new(Mutex::new(Inner {
            ready: BinaryHeap::new(),
            timer: BinaryHeap::new(),
            stopped: false,
        }));
        let notify = Arc::new(Notify::new());

        let mut worker_handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let inner = inner.clone();
            let notify = notify.clone();
            worker_handles.push(tokio::spawn(worker_loop(worker_id, inner, notify)));
        }

        let timer_handle = {
            let inner = inner.clone();
            let notify = notify.clone();
            let tick = config.timer_tick;
            Some(tokio::spawn(timer_loop(inner, notify, tick)))
        };

        Self {
            inner,
            notify,
            next_id: Arc::new(AtomicU64::new(1)),
            config,
            worker_handles,
            timer_handle,
        }
    }

    pub fn start_default() -> Self {
        Self::start(EventLoopConfig::default())
    }

    fn next_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Schedule immediate work.
    pub fn post<F>(&self, work: F, priority: i32) -> TaskHandle
    where
        F: Fn() -> CoreResult<serde_json::Value> + Send + Sync + 'static,
    {
        self.post_at(work, priority, Instant::now(), None)
    }

    /// Schedule work due at `now + delay`.
    pub fn post_delayed<F>(&self, work: F, delay: Duration, priority: i32) -> TaskHandle
    where
        F: Fn() -> CoreResult<serde_json::Value> + Send + Sync + 'static,
    {
        self.post_at(work, priority, Instant::now() + delay, None)
    }

    /// Schedule periodic work, first run at `now + period`.
    pub fn post_periodic<F>(&self, work: F, period: Duration, priority: i32) -> TaskHandle
    where
        F: Fn() -> CoreResult<serde_json::Value> + Send + Sync + 'static,
    {
        self.post_at(work, priority, Instant::now() + period, Some(period))
    }

    fn post_at(
        &self,
        work: impl Fn() -> CoreResult<serde_json::Value> + Send + Sync + 'static,
        priority: i32,
        ready_at: Instant,
        period: Option<Duration>,
    ) -> TaskHandle {
        let id = self.next_id();
        let status = Arc::new(StatusCell::new(TaskStatus::Pending));
        let (tx, rx) = oneshot::channel();
        let body: TaskBody = Arc::new(work);

        let task = ScheduledTask {
            id,
            priority,
            ready_at,
            period,
            status: status.clone(),
            work: body,
            completion: Some(tx),
            created_at: Instant::now(),
        };

        let inner = self.inner.clone();
        let notify = self.notify.clone();
        let now = Instant::now();
        tokio::spawn(async move {
            let mut guard = inner.lock().await;
            if guard.stopped {
                debug!(id, "EventLoop::post_at: loop stopped, dropping task");
                return;
            }
            if ready_at <= now {
                guard.ready.push(task);
            } else {
                guard.timer.push(TimerEntry { ready_at, task });
            }
            drop(guard);
            notify.notify_one();
        });

        debug!(id, priority, periodic = period.is_some(), "EventLoop::post_at: scheduled");
        TaskHandle {
            id,
            status,
            completion_rx: Some(rx),
        }
    }

    /// Mark pending; returns `false` if already Running/Completed/Canceled.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let canceled = handle.status.try_cancel();
        debug!(id = handle.id, canceled, "EventLoop::cancel: called");
        canceled
    }

    /// Stop accepting new work. If `drain`, finish queued work; else cancel
    /// all pending tasks immediately.
    pub async fn stop(&self, drain: bool) {
        debug!(drain, "EventLoop::stop: called");
        let mut guard = self.inner.lock().await;
        guard.stopped = true;
        if !drain {
            while let Some(task) = guard.ready.pop() {
                task.status.try_cancel();
            }
            while let Some(entry) = guard.timer.pop() {
                entry.task.status.try_cancel();
            }
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Number of tasks currently sitting in the ready heap (for introspection/tests).
    pub async fn ready_len(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    /// Number of tasks currently sitting in the timer heap.
    pub async fn timer_len(&self) -> usize {
        self.inner.lock().await.timer.len()
    }

    /// Wait for all worker and timer tasks to exit (best-effort; call after `stop`).
    pub async fn join(mut self) {
        self.notify.notify_waiters();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.timer_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn timer_loop(inner: Arc<Mutex<Inner>>, notify: Arc<Notify>, tick: Duration) {
    loop {
        tokio::time::sleep(tick).await;
        let mut guard = inner.lock().await;
        if guard.stopped {
            debug!("timer_loop: loop stopped, exiting");
            return;
        }
        let now = Instant::now();
        let mut moved = 0usize;
        while let Some(entry) = guard.timer.peek() {
            if entry.ready_at > now {
                break;
            }
            let entry = guard.timer.pop().unwrap();
            guard.ready.push(entry.task);
            moved += 1;
        }
        if moved > 0 {
            drop(guard);
            notify.notify_waiters();
        }
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<Mutex<Inner>>, notify: Arc<Notify>) {
    loop {
        let task = {
            loop {
                let mut guard = inner.lock().await;
                if guard.stopped && guard.ready.is_empty() {
                    debug!(worker_id, "worker_loop: stopped and drained, exiting");
                    return;
                }
                if let Some(task) = guard.ready.pop() {
                    break task;
                }
                drop(guard);
                notify.notified().await;
            }
        };

        // CAS Pending -> Running; losing the race means canceled, skip it.
        if !task.status.try_start() {
            debug!(worker_id, id = task.id, "worker_loop: task canceled before start, skipping");
            continue;
        }

        debug!(worker_id, id = task.id, "worker_loop: running task");
        let work = task.work.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work()));
        let outcome = match result {
            Ok(res) => res,
            Err(_) => {
                warn!(worker_id, id = task.id, "worker_loop: task body panicked");
                Err(crate::error::CoreError::HandlerFailed(format!("task {} panicked", task.id)))
            }
        };

        let failed = outcome.is_err();
        task.status.finish(if failed { TaskStatus::Failed } else { TaskStatus::Completed });

        if let Some(completion) = task.completion {
            let _ = completion.send(outcome);
        }

        // Periodic re-enqueue happens after the body returns, drift-tolerant:
        // ready_at = now + period, no catch-up spin for a slow run. The same
        // status cell carries forward so a handle's cancel() reaches every
        // future run, not just the first.
        if let Some(period) = task.period {
            let mut guard = inner.lock().await;
            if !guard.stopped && task.status.rearm_unless_canceled() {
                let next = ScheduledTask {
                    id: task.id,
                    priority: task.priority,
                    ready_at: Instant::now() + period,
                    period: Some(period),
                    status: task.status,
                    work: task.work,
                    completion: None,
                    created_at: task.created_at,
                };
                guard.timer.push(TimerEntry {
                    ready_at: next.ready_at,
                    task: next,
                });
            }
        }
    }
}
