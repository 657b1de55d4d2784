//! Trellis - a control lifecycle and data-binding framework.
//!
//! This is the umbrella crate. It re-exports everything from `trellis-core`
//! and adds the control layer on top of it:
//!
//! - **DOM host**: the document surface controls render into, with an
//!   in-memory [`Document`](dom::Document)
//! - **Bindings**: the destination handler table and template annotations
//! - **Controls**: render, activate, change and dispose a tree of UI nodes
//!
//! # Example
//!
//! ```
//! use trellis::prelude::*;
//!
//! let (runtime, _host) = Runtime::manual(RuntimeConfig::strict());
//! let document = Document::new();
//! let control = Control::new(&runtime, document.clone(), ControlOptions::default());
//!
//! let markup = control.render_html().unwrap();
//! assert_eq!(markup, r#"<div id="Control-0" class="c-Control"></div>"#);
//!
//! document.append_html(document.body(), &markup).unwrap();
//! control.activate().unwrap();
//! assert_eq!(control.element(), document.element_by_id("Control-0"));
//!
//! control.dispose();
//! assert_eq!(control.state(), ControlState::Disposed);
//! ```

pub use trellis_core::*;

pub mod binding;
pub mod control;
pub mod dom;
pub mod element_events;
pub mod logging;
pub mod prelude;

pub use binding::{Annotation, Binding, BindingKind, Handler, Template};
pub use control::{ContextSource, Control, ControlBehavior, ControlOptions, ControlState, DefaultBehavior};
pub use dom::{DomError, DomEvent, DomHost, DomListener, DomListenerId, DomResult, Document, ElementRect, NodeId};
pub use element_events::ElementListeners;
