//! The per-application service object.
//!
//! A [`Runtime`] bundles the event bus, the task queue, the render-frame
//! scheduler, the contract sink and the control id counter. One is created
//! per application root and handed to every constructor that needs it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::contract::Contracts;
use crate::event::EventBus;
use crate::logging::targets;
use crate::render_frame::{DeferredFrameHost, FrameHost, ManualFrameHost, RenderFrameScheduler};
#[cfg(feature = "tokio")]
use crate::render_frame::TokioFrameHost;
#[cfg(feature = "tokio")]
use crate::task::TaskDriver;
use crate::task::TaskQueue;

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Change-loop iterations allowed before a control is declared to be in
    /// a feedback loop.
    ///
    /// A violation is reported only when the control is still dirty after
    /// this many evaluations. A loop whose last allowed evaluation leaves it
    /// clean is accepted, so `5` permits five full passes.
    pub max_change_cycles: usize,
    /// Minimum delay before an invalidated item set raises `change`.
    pub invalidate_delay: Duration,
    /// Maximum delay before an invalidated item set raises `change`.
    pub invalidate_max_delay: Duration,
    /// Panic on contract violations instead of returning them.
    pub halt_on_contract_violation: bool,
    /// Log every render frame, regardless of per-call trace flags.
    pub trace_render_frames: bool,
    /// Name of the group an item set reports when it has no groupings.
    pub default_group_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_change_cycles: 5,
            invalidate_delay: Duration::from_millis(1),
            invalidate_max_delay: Duration::from_millis(2000),
            halt_on_contract_violation: cfg!(debug_assertions),
            trace_render_frames: false,
            default_group_name: "Default".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// A configuration that panics on contract violations.
    pub fn strict() -> Self {
        Self {
            halt_on_contract_violation: true,
            ..Default::default()
        }
    }

    /// A configuration that returns contract violations as errors.
    pub fn lenient() -> Self {
        Self {
            halt_on_contract_violation: false,
            ..Default::default()
        }
    }

    /// Set the change-loop ceiling.
    pub fn with_max_change_cycles(mut self, cycles: usize) -> Self {
        self.max_change_cycles = cycles.max(1);
        self
    }

    /// Set the item set invalidation delays.
    pub fn with_invalidate_delays(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.invalidate_delay = delay;
        self.invalidate_max_delay = max_delay;
        self
    }

    /// Enable or disable per-frame logging.
    pub fn with_trace_render_frames(mut self, trace: bool) -> Self {
        self.trace_render_frames = trace;
        self
    }

    /// Set the default group name.
    pub fn with_default_group_name(mut self, name: impl Into<String>) -> Self {
        self.default_group_name = name.into();
        self
    }
}

/// Shared services for one application root.
pub struct Runtime {
    config: RuntimeConfig,
    bus: Arc<EventBus>,
    tasks: Arc<TaskQueue>,
    frames: Arc<RenderFrameScheduler>,
    contracts: Contracts,
    next_control: AtomicU64,
    #[cfg(feature = "tokio")]
    driver: parking_lot::Mutex<Option<TaskDriver>>,
}

impl Runtime {
    /// Create a runtime with default settings whose frames run on the task
    /// queue.
    pub fn new() -> Arc<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime whose frames run on the task queue.
    pub fn with_config(config: RuntimeConfig) -> Arc<Self> {
        let tasks = Arc::new(TaskQueue::new());
        let host = Arc::new(DeferredFrameHost::new(tasks.clone()));
        Self::assemble(config, tasks, host)
    }

    /// Create a runtime on an explicit frame host.
    pub fn with_frame_host(config: RuntimeConfig, host: Arc<dyn FrameHost>) -> Arc<Self> {
        Self::assemble(config, Arc::new(TaskQueue::new()), host)
    }

    /// Create a runtime on the current tokio runtime.
    ///
    /// Frames are painted by a [`TokioFrameHost`] and the task queue is
    /// driven in real time, so throttled work such as item set
    /// invalidation fires without anyone calling `run_until_idle`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[cfg(feature = "tokio")]
    pub fn with_tokio(config: RuntimeConfig) -> Arc<Self> {
        let runtime = Self::with_frame_host(config, Arc::new(TokioFrameHost::current()));
        runtime.spawn_driver();
        runtime
    }

    /// Create a runtime whose frames fire only when the returned host is
    /// told to.
    pub fn manual(config: RuntimeConfig) -> (Arc<Self>, Arc<ManualFrameHost>) {
        let host = Arc::new(ManualFrameHost::new());
        (Self::with_frame_host(config, host.clone()), host)
    }

    fn assemble(config: RuntimeConfig, tasks: Arc<TaskQueue>, host: Arc<dyn FrameHost>) -> Arc<Self> {
        tracing::debug!(target: targets::CORE, ?config, "runtime created");
        Arc::new(Self {
            bus: Arc::new(EventBus::new()),
            frames: RenderFrameScheduler::with_tracing(host, config.trace_render_frames),
            contracts: Contracts::new(config.halt_on_contract_violation),
            tasks,
            config,
            next_control: AtomicU64::new(0),
            #[cfg(feature = "tokio")]
            driver: parking_lot::Mutex::new(None),
        })
    }

    /// The runtime settings.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The task queue.
    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }

    /// The render-frame scheduler.
    pub fn frames(&self) -> &Arc<RenderFrameScheduler> {
        &self.frames
    }

    /// The contract sink.
    pub fn contracts(&self) -> Contracts {
        self.contracts
    }

    /// Allocate a control id of the form `name-N`.
    pub fn next_control_id(&self, name: &str) -> String {
        let n = self.next_control.fetch_add(1, Ordering::Relaxed);
        format!("{name}-{n}")
    }

    /// Drive the task queue against the wall clock on the current tokio
    /// runtime until this runtime is dropped.
    ///
    /// Calling it again replaces the previous driver.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[cfg(feature = "tokio")]
    pub fn spawn_driver(&self) {
        let driver = TaskDriver::spawn(&self.tasks);
        tracing::debug!(target: targets::CORE, "task queue driven in real time");
        *self.driver.lock() = Some(driver);
    }

    /// Whether a real-time task driver is running.
    #[cfg(feature = "tokio")]
    pub fn is_driven(&self) -> bool {
        self.driver.lock().as_ref().is_some_and(|driver| !driver.is_finished())
    }

    /// Drain the task queue, frames included when they run on it.
    pub fn run_until_idle(&self) -> usize {
        self.tasks.run_until_idle()
    }
}

static_assertions::assert_impl_all!(Runtime: Send, Sync);
