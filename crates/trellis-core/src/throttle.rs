//! Coalescing of bursts of notifications.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::logging::targets;
use crate::task::{TaskId, TaskQueue};

#[derive(Default)]
struct ThrottleState {
    pending: Option<TaskId>,
    first_trigger: Option<Instant>,
}

/// Collapses repeated triggers into a single delayed callback.
///
/// Each trigger moves the deadline to `delay` from now, but never past
/// `max_delay` after the first trigger of the burst. Once the callback runs
/// the next trigger starts a new burst.
pub struct Throttle {
    self_ref: Weak<Throttle>,
    queue: Arc<TaskQueue>,
    delay: Duration,
    max_delay: Duration,
    callback: Box<dyn Fn() + Send + Sync>,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// Create a throttle that posts to `queue`.
    pub fn new<F>(queue: Arc<TaskQueue>, delay: Duration, max_delay: Duration, callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            queue,
            delay,
            max_delay: max_delay.max(delay),
            callback: Box::new(callback),
            state: Mutex::new(ThrottleState::default()),
        })
    }

    /// Request the callback.
    pub fn trigger(&self) {
        let now = self.queue.now();
        let mut state = self.state.lock();
        let first = *state.first_trigger.get_or_insert(now);
        let deadline = (now + self.delay).min(first + self.max_delay);

        if let Some(previous) = state.pending.take() {
            self.queue.cancel(previous);
        }

        let weak = self.self_ref.clone();
        let id = self
            .queue
            .post_delayed(deadline.saturating_duration_since(now), move || {
                if let Some(throttle) = weak.upgrade() {
                    throttle.fire();
                }
            });
        state.pending = Some(id);
        tracing::trace!(target: targets::TASK, ?deadline, "throttle armed");
    }

    /// Drop a pending callback, if any.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        state.first_trigger = None;
        state
            .pending
            .take()
            .is_some_and(|id| self.queue.cancel(id))
    }

    /// Whether a callback is scheduled.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    fn fire(&self) {
        {
            let mut state = self.state.lock();
            state.pending = None;
            state.first_trigger = None;
        }
        (self.callback)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_throttle(queue: &Arc<TaskQueue>, delay: u64, max: u64) -> (Arc<Throttle>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let throttle = Throttle::new(
            queue.clone(),
            Duration::from_millis(delay),
            Duration::from_millis(max),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        (throttle, count)
    }

    #[test]
    fn test_burst_collapses_to_one_call() {
        let queue = Arc::new(TaskQueue::new());
        let (throttle, count) = counting_throttle(&queue, 1, 2000);

        for _ in 0..10 {
            throttle.trigger();
        }
        assert!(throttle.is_pending());
        queue.run_until_idle();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!throttle.is_pending());

        throttle.trigger();
        queue.run_until_idle();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deadline_capped_by_max_delay() {
        let queue = Arc::new(TaskQueue::new());
        let (throttle, _) = counting_throttle(&queue, 50, 60);

        let start = queue.now();
        throttle.trigger();
        throttle.trigger();
        let deadline = queue.next_deadline().unwrap();
        assert!(deadline <= start + Duration::from_millis(60) + Duration::from_millis(5));
    }

    #[test]
    fn test_cancel() {
        let queue = Arc::new(TaskQueue::new());
        let (throttle, count) = counting_throttle(&queue, 1, 10);
        throttle.trigger();
        assert!(throttle.cancel());
        queue.run_until_idle();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
