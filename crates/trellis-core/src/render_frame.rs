//! Render-frame batching.
//!
//! Work that touches the view is queued under a string key and executed in
//! one batch when the host's next-paint signal fires. Re-queuing a key before
//! the frame runs replaces the earlier callback in place, so a burst of
//! updates to the same target costs a single write. Callbacks run in the
//! order their keys were first queued.
//!
//! A frame runs in two phases: every "next frame" callback, then every "end
//! of frame" callback. The pending maps are swapped out before either phase
//! starts, so anything queued while a frame executes lands on the following
//! frame.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::logging::targets;
use crate::task::TaskQueue;

/// A callback run by the host when it is time to paint.
pub type HostFrame = Box<dyn FnOnce() + Send + 'static>;

/// A queued frame callback. Receives the time elapsed since the frame was
/// requested.
pub type FrameCallback = Box<dyn FnOnce(Duration) + Send + 'static>;

/// The host's "run this before the next repaint" primitive.
pub trait FrameHost: Send + Sync {
    /// Arrange for `frame` to run once, before the next paint.
    fn request_frame(&self, frame: HostFrame);
}

/// A frame host driven explicitly by its owner.
///
/// Useful for tests and for embedders that own the paint loop.
#[derive(Default)]
pub struct ManualFrameHost {
    pending: Mutex<Vec<HostFrame>>,
}

impl ManualFrameHost {
    /// Create a host with no pending frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the pending frame requests. Returns `false` if none were pending.
    pub fn fire(&self) -> bool {
        let frames = std::mem::take(&mut *self.pending.lock());
        let fired = !frames.is_empty();
        for frame in frames {
            frame();
        }
        fired
    }

}

impl FrameHost for ManualFrameHost {
    fn request_frame(&self, frame: HostFrame) {
        self.pending.lock().push(frame);
    }
}

/// Zero-delay fallback: frames run on the next turn of a [`TaskQueue`].
pub struct DeferredFrameHost {
    queue: Arc<TaskQueue>,
}

impl DeferredFrameHost {
    /// Create a host that posts frames to `queue`.
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

impl FrameHost for DeferredFrameHost {
    fn request_frame(&self, frame: HostFrame) {
        self.queue.post(frame);
    }
}

/// Frames paced by a tokio timer at a fixed paint interval.
#[cfg(feature = "tokio")]
pub struct TokioFrameHost {
    handle: tokio::runtime::Handle,
    interval: Duration,
}

#[cfg(feature = "tokio")]
impl TokioFrameHost {
    /// Default paint interval (60 Hz).
    pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(16_667);

    /// Create a host on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current(), Self::DEFAULT_INTERVAL)
    }

    /// Create a host on `handle` that paints every `interval`.
    pub fn new(handle: tokio::runtime::Handle, interval: Duration) -> Self {
        Self { handle, interval }
    }
}

#[cfg(feature = "tokio")]
impl FrameHost for TokioFrameHost {
    fn request_frame(&self, frame: HostFrame) {
        let interval = self.interval;
        self.handle.spawn(async move {
            tokio::time::sleep(interval).await;
            frame();
        });
    }
}

/// Which batch of a frame a callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Runs in the first batch.
    Next,
    /// Runs after every `Next` callback of the same frame.
    End,
}

/// Counters describing the frame currently being collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Distinct keys queued for the pending frame.
    pub callbacks: usize,
    /// Schedule calls made for the pending frame, duplicates included.
    pub calls: usize,
    /// Frames executed since the scheduler was created.
    pub frames_executed: u64,
}

#[derive(Default)]
struct FrameQueues {
    next: IndexMap<String, FrameCallback>,
    end: IndexMap<String, FrameCallback>,
    callbacks: usize,
    calls: usize,
    trace: bool,
    frame_requested: bool,
    requested_at: Option<Instant>,
    frames_executed: u64,
}

impl FrameQueues {
    fn map(&mut self, phase: FramePhase) -> &mut IndexMap<String, FrameCallback> {
        match phase {
            FramePhase::Next => &mut self.next,
            FramePhase::End => &mut self.end,
        }
    }
}

/// Keyed, de-duplicating render-frame scheduler.
///
/// At most one host frame request is outstanding at a time.
pub struct RenderFrameScheduler {
    self_ref: Weak<RenderFrameScheduler>,
    host: Arc<dyn FrameHost>,
    queues: Mutex<FrameQueues>,
    trace_frames: bool,
}

impl RenderFrameScheduler {
    /// Create a scheduler on `host`.
    pub fn new(host: Arc<dyn FrameHost>) -> Arc<Self> {
        Self::with_tracing(host, false)
    }

    /// Create a scheduler that logs every frame when `trace_frames` is set.
    pub fn with_tracing(host: Arc<dyn FrameHost>, trace_frames: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            host,
            queues: Mutex::new(FrameQueues::default()),
            trace_frames,
        })
    }

    /// Queue `callback` under `key` for the next frame.
    pub fn on_next_frame<F>(&self, key: impl Into<String>, callback: F)
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.schedule(FramePhase::Next, key, false, callback);
    }

    /// Queue `callback` under `key` for the end of the next frame.
    pub fn on_end_of_frame<F>(&self, key: impl Into<String>, callback: F)
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.schedule(FramePhase::End, key, false, callback);
    }

    /// Queue `callback` under `key` in `phase`.
    ///
    /// A previous callback under the same key in the same phase is dropped.
    /// Setting `hide_from_trace` keeps this call from turning on the frame
    /// log.
    pub fn schedule<F>(&self, phase: FramePhase, key: impl Into<String>, hide_from_trace: bool, callback: F)
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let key = key.into();
        let request = {
            let mut queues = self.queues.lock();
            let map = queues.map(phase);
            let replaced = map.insert(key, Box::new(callback)).is_some();
            if !replaced {
                queues.callbacks += 1;
            }
            queues.calls += 1;
            queues.trace |= !hide_from_trace;

            let request = !queues.frame_requested;
            if request {
                queues.frame_requested = true;
                queues.requested_at = Some(Instant::now());
            }
            request
        };

        if request {
            let weak = self.self_ref.clone();
            self.host.request_frame(Box::new(move || {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.execute_frame();
                }
            }));
        }
    }

    /// Drop the next-frame callback under `key`.
    pub fn cancel_next_frame(&self, key: &str) -> bool {
        self.queues.lock().next.shift_remove(key).is_some()
    }

    /// Drop the end-of-frame callback under `key`.
    pub fn cancel_end_of_frame(&self, key: &str) -> bool {
        self.queues.lock().end.shift_remove(key).is_some()
    }

    /// Invoke `callback` on the `n`-th frame from now with the summed frame
    /// durations. The key is re-armed on each intermediate frame.
    pub fn every_n_frames<F>(&self, key: impl Into<String>, n: usize, callback: F)
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.arm_every(key.into(), n.max(1), 1, Duration::ZERO, Box::new(callback));
    }

    fn arm_every(&self, key: String, n: usize, frame: usize, elapsed: Duration, callback: FrameCallback) {
        let weak = self.self_ref.clone();
        let rearm_key = key.clone();
        self.schedule(FramePhase::Next, key, false, move |duration| {
            let elapsed = elapsed + duration;
            if frame >= n {
                callback(elapsed);
            } else if let Some(scheduler) = weak.upgrade() {
                scheduler.arm_every(rearm_key, n, frame + 1, elapsed, callback);
            }
        });
    }

    /// Run one frame now.
    ///
    /// Normally invoked by the host. Returns the number of callbacks run.
    #[tracing::instrument(skip_all, target = "trellis_core::render_frame", level = "trace")]
    pub fn execute_frame(&self) -> usize {
        let (next, end, callbacks, calls, trace, duration) = {
            let mut queues = self.queues.lock();
            let next = std::mem::take(&mut queues.next);
            let end = std::mem::take(&mut queues.end);
            let callbacks = std::mem::take(&mut queues.callbacks);
            let calls = std::mem::take(&mut queues.calls);
            let trace = std::mem::take(&mut queues.trace);
            let duration = queues
                .requested_at
                .take()
                .map(|at| at.elapsed())
                .unwrap_or_default();
            queues.frame_requested = false;
            queues.frames_executed += 1;
            (next, end, callbacks, calls, trace, duration)
        };

        if (self.trace_frames || trace) && calls > 0 {
            let saved = 100.0 - (callbacks as f64 / calls as f64) * 100.0;
            tracing::debug!(
                target: targets::RENDER_FRAME,
                callbacks,
                calls,
                saved = format_args!("{saved:.0}%"),
                elapsed_ms = duration.as_secs_f64() * 1000.0,
                "render frame"
            );
        }

        let count = next.len() + end.len();
        for (_, callback) in next {
            callback(duration);
        }
        for (_, callback) in end {
            callback(duration);
        }
        count
    }

    /// Counters for the pending frame.
    pub fn stats(&self) -> FrameStats {
        let queues = self.queues.lock();
        FrameStats {
            callbacks: queues.callbacks,
            calls: queues.calls,
            frames_executed: queues.frames_executed,
        }
    }

    /// Whether any callback is queued.
    pub fn has_pending(&self) -> bool {
        let queues = self.queues.lock();
        !queues.next.is_empty() || !queues.end.is_empty()
    }
}

static_assertions::assert_impl_all!(RenderFrameScheduler: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> (Arc<ManualFrameHost>, Arc<RenderFrameScheduler>) {
        let host = Arc::new(ManualFrameHost::new());
        let scheduler = RenderFrameScheduler::new(host.clone());
        (host, scheduler)
    }

    #[test]
    fn test_same_key_keeps_last_callback() {
        let (host, scheduler) = manual();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        scheduler.on_next_frame("k", move |_| l.lock().push("first"));
        let l = log.clone();
        scheduler.on_next_frame("k", move |_| l.lock().push("second"));

        assert_eq!(scheduler.stats().callbacks, 1);
        assert_eq!(scheduler.stats().calls, 2);
        assert!(log.lock().is_empty());

        assert!(host.fire());
        assert_eq!(*log.lock(), vec!["second"]);
    }

    #[test]
    fn test_callbacks_run_in_scheduling_order() {
        let (host, scheduler) = manual();
        let log = Arc::new(Mutex::new(Vec::new()));

        for key in ["b", "a", "c"] {
            let l = log.clone();
            scheduler.on_next_frame(key, move |_| l.lock().push(key));
        }
        // Replacing a key keeps its original slot.
        let l = log.clone();
        scheduler.on_next_frame("b", move |_| l.lock().push("b2"));
        let l = log.clone();
        scheduler.on_next_frame("a", move |_| l.lock().push("a2"));
        assert!(scheduler.cancel_next_frame("c"));
        let l = log.clone();
        scheduler.on_next_frame("c", move |_| l.lock().push("c2"));

        host.fire();
        assert_eq!(*log.lock(), vec!["b2", "a2", "c2"]);
    }

    #[test]
    fn test_next_frame_runs_before_end_of_frame() {
        let (host, scheduler) = manual();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        scheduler.on_end_of_frame("a", move |_| l.lock().push("end"));
        let l = log.clone();
        scheduler.on_next_frame("b", move |_| l.lock().push("next"));

        host.fire();
        assert_eq!(*log.lock(), vec!["next", "end"]);
    }

    #[test]
    fn test_one_host_request_per_frame() {
        let (host, scheduler) = manual();
        scheduler.on_next_frame("a", |_| {});
        scheduler.on_next_frame("b", |_| {});
        scheduler.on_end_of_frame("c", |_| {});
        assert_eq!(host.pending.lock().len(), 1);
        assert_eq!(scheduler.execute_frame(), 3);
    }

    #[test]
    fn test_scheduled_during_frame_lands_on_next_frame() {
        let (host, scheduler) = manual();
        let log = Arc::new(Mutex::new(Vec::new()));

        let s = scheduler.clone();
        let l = log.clone();
        scheduler.on_next_frame("outer", move |_| {
            l.lock().push("outer");
            let l = l.clone();
            s.on_next_frame("inner", move |_| l.lock().push("inner"));
        });

        host.fire();
        assert_eq!(*log.lock(), vec!["outer"]);
        assert!(scheduler.has_pending());
        host.fire();
        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_cancel() {
        let (host, scheduler) = manual();
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        scheduler.on_next_frame("k", move |_| *r.lock() = true);
        assert!(scheduler.cancel_next_frame("k"));
        assert!(!scheduler.cancel_end_of_frame("k"));
        assert!(!scheduler.has_pending());
        host.fire();
        assert!(!*ran.lock());
    }

    #[test]
    fn test_every_n_frames_fires_on_nth() {
        let (host, scheduler) = manual();
        let fired = Arc::new(Mutex::new(0));
        let f = fired.clone();
        scheduler.every_n_frames("tick", 3, move |_| *f.lock() += 1);

        host.fire();
        host.fire();
        assert_eq!(*fired.lock(), 0);
        host.fire();
        assert_eq!(*fired.lock(), 1);
        assert!(!host.fire());
        assert_eq!(*fired.lock(), 1);
    }

    #[test]
    fn test_deferred_host_runs_on_queue_turn() {
        let queue = Arc::new(TaskQueue::new());
        let scheduler = RenderFrameScheduler::new(Arc::new(DeferredFrameHost::new(queue.clone())));
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        scheduler.on_next_frame("k", move |_| *r.lock() = true);

        assert!(!*ran.lock());
        queue.run_due();
        assert!(*ran.lock());
        assert_eq!(scheduler.stats().frames_executed, 1);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_tokio_host_paints_after_interval() {
        let host = TokioFrameHost::new(tokio::runtime::Handle::current(), Duration::from_millis(5));
        let scheduler = RenderFrameScheduler::new(Arc::new(host));
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.on_next_frame("k", move |_| {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("frame never painted")
            .expect("sender dropped");
    }
}
