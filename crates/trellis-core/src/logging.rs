//! Logging facilities for Trellis.
//!
//! Trellis uses the `tracing` crate for instrumentation. Nothing is printed
//! unless the application installs a subscriber:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("trellis_core::render_frame=debug,trellis::control=trace")
//!     .init();
//! ```
//!
//! The constants below are the targets and span names used across both
//! crates, so filters can be written against them instead of string literals.

/// Span names used throughout Trellis for tracing.
pub mod span_names {
    /// Event raise span.
    pub const RAISE: &str = "trellis::raise";
    /// Render frame execution span.
    pub const RENDER_FRAME: &str = "trellis::render_frame";
    /// Control change-propagation span.
    pub const CHANGE: &str = "trellis::change";
    /// Filtered view rebuild span.
    pub const FILTER: &str = "trellis::filter";
}

/// Target names for log filtering.
pub mod targets {
    /// Core framework target.
    pub const CORE: &str = "trellis_core";
    /// Object registry target.
    pub const OBJECT: &str = "trellis_core::object";
    /// Event bus target.
    pub const EVENT: &str = "trellis_core::event";
    /// Data context target.
    pub const DATA_CONTEXT: &str = "trellis_core::data_context";
    /// Render frame scheduler target.
    pub const RENDER_FRAME: &str = "trellis_core::render_frame";
    /// Task queue and throttle target.
    pub const TASK: &str = "trellis_core::task";
    /// Item set target.
    pub const ITEM_SET: &str = "trellis_core::item_set";
    /// Promise and retry target.
    pub const PROMISE: &str = "trellis_core::promise";
    /// Contract violation target.
    pub const CONTRACT: &str = "trellis_core::contract";
    /// Control lifecycle target.
    pub const CONTROL: &str = "trellis::control";
    /// Binding update target.
    pub const BINDING: &str = "trellis::binding";
    /// DOM host target.
    pub const DOM: &str = "trellis::dom";
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Useful for timing a lifecycle phase in a profiler.
#[derive(Debug)]
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Create a new performance span.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "trellis::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_are_namespaced() {
        for target in [
            targets::OBJECT,
            targets::EVENT,
            targets::DATA_CONTEXT,
            targets::RENDER_FRAME,
            targets::TASK,
            targets::ITEM_SET,
            targets::PROMISE,
            targets::CONTRACT,
        ] {
            assert!(target.starts_with(targets::CORE));
        }
    }

    #[test]
    fn test_perf_span() {
        let _span = PerfSpan::new("test_operation");
    }
}
