//! Prelude module for Trellis.
//!
//! ```ignore
//! use trellis::prelude::*;
//! ```

// ============================================================================
// Runtime and Data
// ============================================================================

pub use trellis_core::{
    DataContext, EventArgs, EventBus, ItemSet, ListenerGroup, Runtime, RuntimeConfig, SetItem, Value, events,
};

// ============================================================================
// Controls
// ============================================================================

pub use crate::binding::{Annotation, Template};
pub use crate::control::{ContextSource, Control, ControlBehavior, ControlOptions, ControlState};

// ============================================================================
// Document
// ============================================================================

pub use crate::dom::{DomEvent, DomHost, Document, NodeId};
