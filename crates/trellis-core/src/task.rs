//! Deferred task queue.
//!
//! Holds two kinds of work: tasks that should run on the next turn, and
//! tasks that should run once a deadline passes. Nothing runs until someone
//! drives the queue. Under tokio, [`TaskDriver`] does so against the wall
//! clock, sleeping until the next deadline and waking early when work is
//! posted. Tests call [`run_due`](TaskQueue::run_due) directly or
//! [`run_until_idle`](TaskQueue::run_until_idle), which advances a virtual
//! clock instead of sleeping.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::logging::targets;

/// A unique identifier for a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Get the raw u64 value of this task ID.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

/// Called after a task is posted, so a sleeping driver can re-check the queue.
pub type QueueWaker = Arc<dyn Fn() + Send + Sync>;

/// An entry in the delayed queue (min-heap by deadline, then insertion).
#[derive(Debug, Clone, Copy)]
struct DelayedEntry {
    id: TaskId,
    due: Instant,
    seq: u64,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(TaskId, BoxedTask)>,
    delayed: BinaryHeap<DelayedEntry>,
    delayed_tasks: HashMap<TaskId, BoxedTask>,
    seq: u64,
    skew: Duration,
}

impl QueueState {
    fn now(&self) -> Instant {
        Instant::now() + self.skew
    }

    fn promote_due(&mut self) {
        let now = self.now();
        while let Some(entry) = self.delayed.peek().copied() {
            if entry.due > now {
                break;
            }
            self.delayed.pop();
            // Cancelled entries stay in the heap until they surface here.
            if let Some(task) = self.delayed_tasks.remove(&entry.id) {
                self.ready.push_back((entry.id, task));
            }
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.delayed.peek() {
            if self.delayed_tasks.contains_key(&entry.id) {
                return Some(entry.due);
            }
            self.delayed.pop();
        }
        None
    }
}

/// Upper bound on turns taken by [`TaskQueue::run_until_idle`].
const MAX_IDLE_TURNS: usize = 10_000;

/// A thread-safe queue of deferred and delayed tasks.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    waker: Mutex<Option<QueueWaker>>,
}

impl TaskQueue {
    /// Create a new task queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            waker: Mutex::new(None),
        }
    }

    /// Install the hook run after every post, replacing any earlier one.
    pub fn set_waker(&self, waker: Option<QueueWaker>) {
        *self.waker.lock() = waker;
    }

    fn wake(&self) {
        let waker = self.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    /// The queue's notion of the current time.
    ///
    /// This runs ahead of the wall clock once `run_until_idle` has skipped
    /// over delays.
    pub fn now(&self) -> Instant {
        self.state.lock().now()
    }

    /// Post a task to run on the next turn.
    pub fn post<F>(&self, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = next_task_id();
        self.state.lock().ready.push_back((id, Box::new(task)));
        self.wake();
        id
    }

    /// Post a task to run once `delay` has elapsed.
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = next_task_id();
        {
            let mut state = self.state.lock();
            let due = state.now() + delay;
            state.seq += 1;
            let seq = state.seq;
            state.delayed.push(DelayedEntry { id, due, seq });
            state.delayed_tasks.insert(id, Box::new(task));
        }
        self.wake();
        id
    }

    /// Cancel a pending task.
    ///
    /// Returns `true` if the task was found and cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        if state.delayed_tasks.remove(&id).is_some() {
            return true;
        }
        if let Some(pos) = state.ready.iter().position(|(task_id, _)| *task_id == id) {
            state.ready.remove(pos);
            true
        } else {
            false
        }
    }

    /// Check if there are any pending tasks, immediate or delayed.
    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Get the number of pending tasks.
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.delayed_tasks.len()
    }

    /// Time from the queue's clock until the next task is due.
    ///
    /// Zero when something is ready now, `None` when nothing is pending.
    pub fn time_until_due(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        if !state.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        let now = state.now();
        state.next_deadline().map(|due| due.saturating_duration_since(now))
    }

    /// The earliest deadline among delayed tasks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().next_deadline()
    }

    /// Run every task that is due now.
    ///
    /// Tasks posted while running land on the next call. Returns the number
    /// of tasks run.
    pub fn run_due(&self) -> usize {
        let batch: Vec<(TaskId, BoxedTask)> = {
            let mut state = self.state.lock();
            state.promote_due();
            state.ready.drain(..).collect()
        };
        let count = batch.len();
        for (_, task) in batch {
            task();
        }
        count
    }

    /// Run tasks until nothing is pending, jumping the clock to each deadline.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_IDLE_TURNS {
            let ran = self.run_due();
            total += ran;
            if ran > 0 {
                continue;
            }

            let mut state = self.state.lock();
            if !state.ready.is_empty() {
                continue;
            }
            match state.next_deadline() {
                Some(deadline) => {
                    let now = state.now();
                    if deadline > now {
                        state.skew += deadline - now;
                    }
                }
                None => return total,
            }
        }
        tracing::warn!(target: targets::TASK, turns = MAX_IDLE_TURNS, "task queue did not go idle");
        total
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(TaskQueue: Send, Sync);

/// Drives a [`TaskQueue`] in real time on a tokio runtime.
///
/// The driver holds the queue weakly and stops when the queue is dropped.
/// Dropping the driver aborts it.
#[cfg(feature = "tokio")]
pub struct TaskDriver {
    handle: tokio::task::JoinHandle<()>,
}

#[cfg(feature = "tokio")]
impl TaskDriver {
    /// Start driving `queue` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(queue: &Arc<TaskQueue>) -> Self {
        Self::spawn_on(queue, &tokio::runtime::Handle::current())
    }

    /// Start driving `queue` on `runtime`.
    pub fn spawn_on(queue: &Arc<TaskQueue>, runtime: &tokio::runtime::Handle) -> Self {
        let notify = Arc::new(tokio::sync::Notify::new());
        let wake = notify.clone();
        queue.set_waker(Some(Arc::new(move || wake.notify_one())));

        let weak = Arc::downgrade(queue);
        let handle = runtime.spawn(async move {
            tracing::debug!(target: targets::TASK, "task driver started");
            loop {
                let wait = {
                    let Some(queue) = weak.upgrade() else {
                        break;
                    };
                    queue.run_due();
                    queue.time_until_due()
                };
                match wait {
                    Some(delay) if delay.is_zero() => tokio::task::yield_now().await,
                    Some(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = notify.notified() => {}
                        }
                    }
                    None => notify.notified().await,
                }
            }
            tracing::debug!(target: targets::TASK, "task driver stopped");
        });
        Self { handle }
    }

    /// Whether the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(feature = "tokio")]
impl Drop for TaskDriver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(feature = "tokio")]
impl std::fmt::Debug for TaskDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDriver")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
