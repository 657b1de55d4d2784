//! Core systems for Trellis.
//!
//! This crate provides the host-independent pieces of the Trellis UI framework:
//!
//! - **Event Bus**: Object-to-object listener registration, scoped disposal and bubbling
//! - **Values**: Dynamically typed values with explicit object capabilities
//! - **Data Contexts**: Change-tracked, reference-counted property bags
//! - **Task Queue**: Deferred and delayed task processing with a virtual clock
//! - **Render Frames**: Keyed, de-duplicating batches of view work
//! - **Item Sets**: Filterable, groupable collections for list controls
//! - **Promises**: Cancellable tasks and retry (feature `tokio`)
//!
//! # Data Context Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use trellis_core::{DataContext, Runtime, Value, events};
//!
//! let runtime = Runtime::new();
//! let context = DataContext::new(runtime.bus());
//!
//! let changes = Arc::new(AtomicUsize::new(0));
//! let observer = runtime.bus().register_object::<()>("observer");
//! let counter = changes.clone();
//! runtime.bus().on(observer, context.id(), events::CHANGE, move |_| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! assert!(context.set_data([("title", "Inbox")]));
//! assert!(!context.set_data([("title", "Inbox")]));
//! assert_eq!(context.get("title"), Value::from("Inbox"));
//! assert_eq!(changes.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Render Frame Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use trellis_core::{Runtime, RuntimeConfig};
//!
//! let (runtime, host) = Runtime::manual(RuntimeConfig::default());
//! let writes = Arc::new(Mutex::new(Vec::new()));
//!
//! for value in ["a", "b", "c"] {
//!     let writes = writes.clone();
//!     runtime.frames().on_next_frame("title", move |_| writes.lock().push(value));
//! }
//!
//! host.fire();
//! assert_eq!(*writes.lock(), vec!["c"]);
//! ```

pub mod contract;
pub mod data_context;
mod error;
pub mod event;
pub mod item_set;
pub mod logging;
pub mod object;
#[cfg(feature = "tokio")]
pub mod promise;
pub mod render_frame;
mod runtime;
pub mod task;
pub mod throttle;
pub mod value;

pub use contract::{ContractViolation, Contracts};
pub use data_context::{DataContext, DataContextBuilder, Notify, Ownership};
pub use error::{Result, TrellisError};
pub use event::{EventArgs, EventBus, EventFlow, IntoEventFlow, ListenerGroup, ListenerId, events};
pub use item_set::{GroupCollection, IndexSpace, ItemFilter, ItemGroup, ItemSet, SetItem};
pub use logging::PerfSpan;
pub use object::{ObjectError, ObjectId, ObjectRegistry, ObjectResult, SharedObjectRegistry};
#[cfg(feature = "tokio")]
pub use promise::{Promise, PromiseError, PromiseState, RetriablePromise, RetryPolicy};
#[cfg(feature = "tokio")]
pub use render_frame::TokioFrameHost;
pub use render_frame::{
    DeferredFrameHost, FrameCallback, FrameHost, FramePhase, FrameStats, ManualFrameHost, RenderFrameScheduler,
};
pub use runtime::{Runtime, RuntimeConfig};
#[cfg(feature = "tokio")]
pub use task::TaskDriver;
pub use task::{QueueWaker, TaskId, TaskQueue};
pub use throttle::Throttle;
pub use value::{ObjectValue, Observable, RefCounted, SharedResource, Value};
