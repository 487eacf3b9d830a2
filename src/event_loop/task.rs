//! Task identity, status, and the handle returned to callers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::CoreResult;

/// Monotonically increasing task identifier. Ordering within equal
/// `(priority, ready_at)` falls back to this field (I-A.2 invariant).
pub type TaskId = u64;

/// Lifecycle status of a scheduled task.
///
/// Valid transitions: `Pending -> {Canceled, Running}`, `Running -> {Completed, Failed}`.
/// No other edge is reachable; `status_code()`/`from_code()` encode this as a
/// small integer so the CAS in the worker loop (§4.A "Worker protocol") can
/// be expressed with `AtomicU8::compare_exchange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    const fn code(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Canceled => 4,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Running,
            2 => TaskStatus::Completed,
            3 => TaskStatus::Failed,
            _ => TaskStatus::Canceled,
        }
    }
}

/// Atomic status cell shared between the scheduler, the worker that runs the
/// task, and any caller holding a `TaskHandle`.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(initial: TaskStatus) -> Self {
        Self(AtomicU8::new(initial.code()))
    }

    pub fn load(&self) -> TaskStatus {
        TaskStatus::from_code(self.0.load(Ordering::Acquire))
    }

    /// Attempt to move `Pending -> Running`. Returns `false` if the task was
    /// already canceled (lost the race) — the worker must skip it.
    pub fn try_start(&self) -> bool {
        self.0
            .compare_exchange(
                TaskStatus::Pending.code(),
                TaskStatus::Running.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Attempt to move `Pending -> Canceled`. Returns `false` if the task is
    /// no longer Pending (already running or finished).
    pub fn try_cancel(&self) -> bool {
        self.0
            .compare_exchange(
                TaskStatus::Pending.code(),
                TaskStatus::Canceled.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self, status: TaskStatus) {
        debug_assert!(matches!(status, TaskStatus::Completed | TaskStatus::Failed));
        self.0.store(status.code(), Ordering::Release);
    }

    /// Rearm a finished periodic task for its next run, unless it was
    /// canceled while waiting. Returns `false` (and leaves the cell alone)
    /// if the task is `Canceled`, so the caller knows not to re-enqueue it.
    pub fn rearm_unless_canceled(&self) -> bool {
        if self.load() == TaskStatus::Canceled {
            return false;
        }
        self.0.store(TaskStatus::Pending.code(), Ordering::Release);
        true
    }
}

/// A unit of work. Stored as `Fn` rather than `FnOnce` so periodic tasks can
/// be invoked repeatedly from the same registration; one-shot and delayed
/// tasks simply happen to be called exactly once.
pub type TaskBody = std::sync::Arc<dyn Fn() -> CoreResult<serde_json::Value> + Send + Sync + 'static>;

/// A scheduled unit of work as tracked internally by the event loop.
pub(super) struct ScheduledTask {
    pub id: TaskId,
    pub priority: i32,
    pub ready_at: Instant,
    pub period: Option<Duration>,
    pub status: std::sync::Arc<StatusCell>,
    pub work: TaskBody,
    pub completion: Option<oneshot::Sender<CoreResult<serde_json::Value>>>,
    pub created_at: Instant,
}

impl ScheduledTask {
    /// Ordering key used by the ready heap: `(priority DESC, ready_at ASC, id ASC)`.
    pub(super) fn order_key(&self) -> (i32, std::cmp::Reverse<Instant>, std::cmp::Reverse<TaskId>) {
        (self.priority, std::cmp::Reverse(self.ready_at), std::cmp::Reverse(self.id))
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want priority DESC, ready_at ASC, id ASC
        // to pop first, so compare priority directly (higher priority = greater)
        // but ready_at/id need Reverse since we want the *earliest*/*smallest* first.
        self.priority
            .cmp(&other.priority)
            .then(self.order_key().1.cmp(&other.order_key().1))
            .then(self.order_key().2.cmp(&other.order_key().2))
    }
}

/// Opaque token returned by `post`/`post_delayed`/`post_periodic`.
///
/// Carries the task id plus a means to retrieve the completion channel, per
/// the Handle data model in §3.
pub struct TaskHandle {
    pub(super) id: TaskId,
    pub(super) status: std::sync::Arc<StatusCell>,
    pub(super) completion_rx: Option<oneshot::Receiver<CoreResult<serde_json::Value>>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    /// Block (async-wait) until the task completes. Consumes the handle's
    /// completion receiver; a periodic task's handle only resolves its
    /// *first* run (subsequent runs re-enqueue a fresh internal task).
    pub async fn wait(mut self) -> CoreResult<serde_json::Value> {
        match self.completion_rx.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(crate::error::CoreError::Canceled("task dropped".into()))),
            None => Err(crate::error::CoreError::InvalidState(
                "handle already awaited".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_pending_to_running() {
        let cell = StatusCell::new(TaskStatus::Pending);
        assert!(cell.try_start());
        assert_eq!(cell.load(), TaskStatus::Running);
    }

    #[test]
    fn canceled_task_never_starts() {
        let cell = StatusCell::new(TaskStatus::Pending);
        assert!(cell.try_cancel());
        assert!(!cell.try_start());
        assert_eq!(cell.load(), TaskStatus::Canceled);
    }

    #[test]
    fn cannot_cancel_running_task() {
        let cell = StatusCell::new(TaskStatus::Pending);
        assert!(cell.try_start());
        assert!(!cell.try_cancel());
    }

    #[test]
    fn ordering_prefers_higher_priority() {
        let now = Instant::now();
        let status = std::sync::Arc::new(StatusCell::new(TaskStatus::Pending));
        let noop: TaskBody = std::sync::Arc::new(|| Ok(serde_json::Value::Null));
        let low = ScheduledTask {
            id: 1,
            priority: 0,
            ready_at: now,
            period: None,
            status: status.clone(),
            work: noop.clone(),
            completion: None,
            created_at: now,
        };
        let high = ScheduledTask {
            id: 2,
            priority: 10,
            ready_at: now,
            period: None,
            status,
            work: noop,
            completion: None,
            created_at: now,
        };
        assert!(high > low);
    }
}
