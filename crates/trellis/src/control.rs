//! Controls: the lifecycle and change engine of a UI tree node.
//!
//! A [`Control`] moves through [`ControlState::Created`] →
//! [`Inactive`](ControlState::Inactive) ⇄ [`Active`](ControlState::Active) →
//! [`Disposed`](ControlState::Disposed). It renders markup while inactive,
//! binds to its element once that markup is in the document, and from then on
//! turns data context changes into DOM writes that are batched onto the next
//! render frame.
//!
//! Behavior specific to a control type lives in a [`ControlBehavior`]. Its
//! hooks are always invoked with no internal lock held, so they may call back
//! into the control freely.
//!
//! # Example
//!
//! ```
//! use trellis::prelude::*;
//!
//! let (runtime, host) = Runtime::manual(RuntimeConfig::strict());
//! let document = Document::new();
//! let template = Template::new(vec![Annotation::new(0).attr("title", "title")]);
//! let control = Control::new(
//!     &runtime,
//!     document.clone(),
//!     ControlOptions::new("Control").with_template(template),
//! );
//!
//! let markup = control.render_html().unwrap();
//! document.append_html(document.body(), &markup).unwrap();
//! control.activate().unwrap();
//!
//! control.set_data_context(ContextSource::data([("title", "Hello")])).unwrap();
//! let element = control.element().unwrap();
//! assert_eq!(document.attribute(element, "title"), None);
//!
//! host.fire();
//! assert_eq!(document.attribute(element, "title").as_deref(), Some("Hello"));
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use trellis_core::logging::targets;
use trellis_core::{
    ContractViolation, DataContext, EventArgs, ListenerId, ObjectId, Observable, PerfSpan, RefCounted, Result,
    Runtime, Value, events,
};

use crate::binding::Template;
use crate::dom::{DomEvent, DomHost, NodeId};
use crate::element_events::ElementListeners;

/// Lifecycle state of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    /// Constructed, not yet initialized.
    Created,
    /// Initialized and not bound to the document.
    Inactive,
    /// Bound to its element in the document.
    Active,
    /// Torn down. Terminal.
    Disposed,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Per-control render parameters.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// The control type name. Used for generated ids and the `c-` class.
    pub control_name: String,
    /// An explicit id. Generated at initialization when absent.
    pub id: Option<String>,
    /// The root element's tag. Empty when the control renders no element.
    pub base_tag: String,
    /// Extra classes on the root element.
    pub base_class: String,
    /// Inline style on the root element.
    pub base_style: String,
    /// Processed annotations for the control's markup.
    pub template: Option<Arc<Template>>,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            control_name: "Control".to_string(),
            id: None,
            base_tag: "div".to_string(),
            base_class: String::new(),
            base_style: String::new(),
            template: None,
        }
    }
}

impl ControlOptions {
    /// Options for a control type named `control_name`.
    pub fn new(control_name: impl Into<String>) -> Self {
        Self {
            control_name: control_name.into(),
            ..Default::default()
        }
    }

    /// Use an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the root element's tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.base_tag = tag.into();
        self
    }

    /// Render no root element.
    pub fn without_tag(mut self) -> Self {
        self.base_tag.clear();
        self
    }

    /// Add classes to the root element.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.base_class = class.into();
        self
    }

    /// Set the root element's inline style.
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.base_style = style.into();
        self
    }

    /// Attach a template.
    pub fn with_template(mut self, template: Template) -> Self {
        self.template = Some(Arc::new(template));
        self
    }
}

/// What to bind a control to.
#[derive(Debug, Clone)]
pub enum ContextSource {
    /// Share an existing context.
    Context(Arc<DataContext>),
    /// Write values into the control's own context, creating it if needed.
    Data(Vec<(String, Value)>),
    /// Reset the current context.
    Clear,
}

impl ContextSource {
    /// Build a [`ContextSource::Data`] from key/value pairs.
    pub fn data<I, K, V>(data: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Data(data.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<Arc<DataContext>> for ContextSource {
    fn from(context: Arc<DataContext>) -> Self {
        Self::Context(context)
    }
}

/// Type-specific control behavior.
///
/// Every hook has a default, so a plain control needs none of them.
pub trait ControlBehavior: Send + Sync + 'static {
    /// Called once, when the control leaves `Created`.
    fn on_initialize(&self, _control: &Control) {}

    /// Produce the control's markup. Only called when the control has a tag.
    fn on_render_html(&self, control: &Control) -> String {
        control.default_render_html("")
    }

    /// Called after the control binds to its element.
    fn on_activate(&self, _control: &Control) {}

    /// Called after the control unbinds from its element.
    fn on_deactivate(&self, _control: &Control) {}

    /// Called while the control is being disposed.
    fn on_dispose(&self, _control: &Control) {}

    /// Re-evaluate view state after a data change.
    fn on_data_context_changed(&self, _control: &Control) {}

    /// Called at the end of a frame after `resize`.
    fn on_resize(&self, _control: &Control) {}

    /// Run a user action declared by the template.
    ///
    /// Returning `false` prevents the event's default action.
    fn on_user_action(&self, _control: &Control, action: &str, _event: &DomEvent) -> bool {
        tracing::debug!(target: targets::CONTROL, action, "unhandled user action");
        true
    }

    /// The current value of a bound source property.
    fn binding_value(&self, control: &Control, source: &str) -> Value {
        control.data_context().map_or(Value::Null, |context| context.get(source))
    }
}

/// Behavior of a control with no type-specific logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBehavior;

impl ControlBehavior for DefaultBehavior {}

#[derive(Debug, Clone)]
struct PendingWrite {
    node: NodeId,
    value: Value,
}

#[derive(Debug, Clone)]
struct UserAction {
    node: NodeId,
    event: String,
    action: String,
}

#[derive(Default)]
struct SubElements {
    by_index: HashMap<u32, NodeId>,
    by_name: HashMap<String, NodeId>,
    user_actions: Vec<UserAction>,
}

struct ControlInner {
    state: ControlState,
    id: Option<String>,
    parent: Option<Weak<Control>>,
    children: Vec<Arc<Control>>,
    data_context: Option<Arc<DataContext>>,
    context_listener: Option<ListenerId>,
    element: Option<NodeId>,
    sub_elements: Option<SubElements>,
    dirty: bool,
    processing: bool,
    last_values: Vec<Option<Value>>,
    pending_writes: BTreeMap<usize, PendingWrite>,
    resources: HashMap<String, Value>,
}

/// A node in the control tree.
pub struct Control {
    self_ref: Weak<Control>,
    runtime: Arc<Runtime>,
    dom: Arc<dyn DomHost>,
    object: ObjectId,
    options: ControlOptions,
    behavior: Box<dyn ControlBehavior>,
    inner: Mutex<ControlInner>,
    element_listeners: ElementListeners,
    disposing: AtomicBool,
}

/// Resets the change loop's processing flag even if a hook panics.
struct ProcessingGuard<'a>(&'a Control);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().processing = false;
    }
}

impl Control {
    /// Create a control with no type-specific behavior.
    pub fn new(runtime: &Arc<Runtime>, dom: Arc<dyn DomHost>, options: ControlOptions) -> Arc<Self> {
        Self::with_behavior(runtime, dom, options, DefaultBehavior)
    }

    /// Create a control driven by `behavior`.
    pub fn with_behavior<B>(runtime: &Arc<Runtime>, dom: Arc<dyn DomHost>, options: ControlOptions, behavior: B) -> Arc<Self>
    where
        B: ControlBehavior,
    {
        let object = runtime.bus().register_object::<Control>(options.control_name.clone());
        let id = options.id.clone();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            runtime: runtime.clone(),
            element_listeners: ElementListeners::new(dom.clone()),
            dom,
            object,
            options,
            behavior: Box::new(behavior),
            inner: Mutex::new(ControlInner {
                state: ControlState::Created,
                id,
                parent: None,
                children: Vec::new(),
                data_context: None,
                context_listener: None,
                element: None,
                sub_elements: None,
                dirty: false,
                processing: false,
                last_values: Vec::new(),
                pending_writes: BTreeMap::new(),
                resources: HashMap::new(),
            }),
            disposing: AtomicBool::new(false),
        })
    }

    /// The control associated with `node`, if any.
    pub fn from_element(dom: &dyn DomHost, node: NodeId) -> Option<Arc<Control>> {
        dom.associated(node)?.downcast::<Control>().ok()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The id events are raised under.
    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    /// The control id. `None` until initialized unless given explicitly.
    pub fn id(&self) -> Option<String> {
        self.inner.lock().id.clone()
    }

    /// The control type name.
    pub fn control_name(&self) -> &str {
        &self.options.control_name
    }

    /// The render parameters.
    pub fn options(&self) -> &ControlOptions {
        &self.options
    }

    /// The runtime the control belongs to.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The document the control renders into.
    pub fn dom(&self) -> &Arc<dyn DomHost> {
        &self.dom
    }

    /// The lifecycle state.
    pub fn state(&self) -> ControlState {
        self.inner.lock().state
    }

    /// Whether the control is bound to its element.
    pub fn is_active(&self) -> bool {
        self.state() == ControlState::Active
    }

    /// Whether the control has been disposed (or is being disposed).
    pub fn is_disposed(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// Whether a data change is waiting to be evaluated.
    pub fn has_pending_change(&self) -> bool {
        self.inner.lock().dirty
    }

    /// The root element. Only set while active.
    pub fn element(&self) -> Option<NodeId> {
        let inner = self.inner.lock();
        (inner.state == ControlState::Active).then_some(inner.element).flatten()
    }

    /// The element annotated as `name` in the template.
    pub fn sub_element(&self, name: &str) -> Option<NodeId> {
        self.inner.lock().sub_elements.as_ref()?.by_name.get(name).copied()
    }

    /// The element with annotation index `index`.
    pub fn sub_element_at(&self, index: u32) -> Option<NodeId> {
        self.inner.lock().sub_elements.as_ref()?.by_index.get(&index).copied()
    }

    /// The data context, if one is bound.
    pub fn data_context(&self) -> Option<Arc<DataContext>> {
        self.inner.lock().data_context.clone()
    }

    /// The parent control.
    pub fn parent(&self) -> Option<Arc<Control>> {
        self.inner.lock().parent.as_ref()?.upgrade()
    }

    /// The children, in order.
    pub fn children(&self) -> Vec<Arc<Control>> {
        self.inner.lock().children.clone()
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    fn display_id(&self) -> String {
        self.id().unwrap_or_else(|| format!("{}(uninitialized)", self.options.control_name))
    }

    fn raise(&self, event: &str, args: &EventArgs) {
        self.runtime.bus().raise(self.object, event, args, false);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Leave `Created`, assigning an id if none was given.
    ///
    /// Does nothing in any other state.
    pub fn initialize(&self) {
        let context = {
            let mut inner = self.inner.lock();
            if inner.state != ControlState::Created {
                return;
            }
            if inner.id.is_none() {
                inner.id = Some(self.runtime.next_control_id(&self.options.control_name));
            }
            inner.state = ControlState::Inactive;
            inner.data_context.clone()
        };
        tracing::debug!(target: targets::CONTROL, id = %self.display_id(), "initialized");
        self.behavior.on_initialize(self);
        self.raise(events::INITIALIZE, &EventArgs::new(context));
    }

    /// The id sub-element `index` renders with. Index 0 is the root element.
    pub fn sub_element_id(&self, index: u32) -> String {
        let id = self.display_id();
        if index == 0 { id } else { format!("{id}_{index}") }
    }

    /// Produce the control's markup.
    ///
    /// Fails if the control is active. Returns an empty string for controls
    /// without a tag.
    pub fn render_html(&self) -> Result<String> {
        let _span = PerfSpan::new("Control::render_html");
        self.runtime.contracts().check(self.state() != ControlState::Active, || {
            ContractViolation::RenderWhileActive {
                control: self.display_id(),
            }
        })?;
        self.initialize();

        if self.has_pending_change() {
            self.change(true)?;
        }
        self.clear_element_references();
        self.raise(events::RENDER_HTML, &EventArgs::none());

        if self.options.base_tag.is_empty() {
            return Ok(String::new());
        }
        Ok(self.behavior.on_render_html(self))
    }

    /// The default markup: the root tag wrapping `body`.
    pub fn default_render_html(&self, body: &str) -> String {
        let options = &self.options;
        let class = format!("c-{} {}", options.control_name, options.base_class);
        let mut html = format!(
            "<{} id=\"{}\" class=\"{}\"",
            options.base_tag,
            html_escape::encode_double_quoted_attribute(&self.sub_element_id(0)),
            html_escape::encode_double_quoted_attribute(class.trim_end()),
        );
        if !options.base_style.is_empty() {
            html.push_str(&format!(
                " style=\"{}\"",
                html_escape::encode_double_quoted_attribute(&options.base_style)
            ));
        }
        html.push('>');
        html.push_str(body);
        html.push_str(&format!("</{}>", options.base_tag));
        html
    }

    /// Bind the control and its children to the document.
    ///
    /// The control's markup must already be in the document. Activating an
    /// active control does nothing.
    pub fn activate(&self) -> Result<()> {
        let contracts = self.runtime.contracts();
        if self.is_disposed() {
            contracts.report(ContractViolation::ActivateDisposed {
                control: self.display_id(),
            })?;
            return Ok(());
        }
        self.initialize();

        for child in self.children() {
            child.activate()?;
        }

        if self.state() != ControlState::Inactive {
            return Ok(());
        }

        let id = self.display_id();
        let element = if self.options.base_tag.is_empty() {
            None
        } else {
            let element = self.dom.element_by_id(&id);
            contracts.check(element.is_some(), || ContractViolation::MissingElement {
                control: id.clone(),
                element: id.clone(),
            })?;
            element
        };

        let cached = self.inner.lock().sub_elements.is_some();
        if !cached && element.is_some() {
            let found = self.find_sub_elements()?;
            self.inner.lock().sub_elements = Some(found);
        }
        self.attach_user_actions();

        let pending = {
            let mut inner = self.inner.lock();
            inner.element = element;
            inner.state = ControlState::Active;
            inner.dirty
        };
        if let Some(node) = element {
            let owner: Weak<dyn Any + Send + Sync> = self.self_ref.clone();
            self.dom.associate(node, Some(owner));
        }

        tracing::debug!(target: targets::CONTROL, %id, pending, "activated");
        self.behavior.on_activate(self);
        self.raise(events::ACTIVATE, &EventArgs::none());

        if pending {
            self.change(false)?;
        } else {
            // Markup carries no bound values, so bring the element up to date.
            self.update_bindings();
        }
        Ok(())
    }

    fn find_sub_elements(&self) -> Result<SubElements> {
        let mut found = SubElements::default();
        let Some(template) = &self.options.template else {
            return Ok(found);
        };
        for annotation in template.annotations() {
            let element_id = self.sub_element_id(annotation.id);
            let Some(node) = self.dom.element_by_id(&element_id) else {
                self.runtime.contracts().report(ContractViolation::MissingSubElement {
                    control: self.display_id(),
                    element: element_id,
                })?;
                continue;
            };
            found.by_index.insert(annotation.id, node);
            if let Some(name) = &annotation.child_id {
                found.by_name.insert(name.clone(), node);
            }
            found.user_actions.extend(annotation.user_actions.iter().map(|(event, action)| UserAction {
                node,
                event: event.clone(),
                action: action.clone(),
            }));
        }
        Ok(found)
    }

    fn attach_user_actions(&self) {
        let actions = self
            .inner
            .lock()
            .sub_elements
            .as_ref()
            .map(|s| s.user_actions.clone())
            .unwrap_or_default();
        for UserAction { node, event, action } in actions {
            let weak = self.self_ref.clone();
            self.element_listeners.add(node, &event, move |dom_event| {
                match weak.upgrade() {
                    Some(control) if control.is_active() => {
                        tracing::trace!(target: targets::CONTROL, action = %action, "user action");
                        control.behavior.on_user_action(&control, &action, dom_event)
                    }
                    _ => true,
                }
            });
        }
    }

    /// Unbind the control and its children from the document.
    ///
    /// Binding writes that had not reached a frame are kept as a pending
    /// change and replayed on the next activation.
    pub fn deactivate(&self) {
        for child in self.children() {
            child.deactivate();
        }

        let element = {
            let mut inner = self.inner.lock();
            if inner.state != ControlState::Active {
                return;
            }
            inner.state = ControlState::Inactive;
            if !inner.pending_writes.is_empty() {
                inner.dirty = true;
                inner.pending_writes.clear();
            }
            inner.element.take()
        };

        self.element_listeners.clear();
        if let Some(node) = element {
            self.dom.associate(node, None);
        }
        tracing::debug!(target: targets::CONTROL, id = %self.display_id(), "deactivated");
        self.behavior.on_deactivate(self);
        self.raise(events::DEACTIVATE, &EventArgs::none());
    }

    /// Tear the control down, children first. A second call does nothing.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _span = PerfSpan::new("Control::dispose");

        for child in self.children() {
            child.dispose();
        }
        if self.state() == ControlState::Active {
            self.deactivate();
        }

        self.behavior.on_dispose(self);
        self.raise(events::DISPOSE, &EventArgs::none());
        self.clear_element_references();

        let (context, listener, parent) = {
            let mut inner = self.inner.lock();
            inner.children.clear();
            inner.pending_writes.clear();
            (inner.data_context.take(), inner.context_listener.take(), inner.parent.take())
        };
        if let Some(listener) = listener {
            self.runtime.bus().off_listener(listener);
        }
        if let Some(context) = context {
            context.remove_ref();
        }
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            parent.detach(self);
        }

        self.runtime.bus().set_parent(self.object, None);
        self.runtime.bus().dispose(self.object);
        self.inner.lock().state = ControlState::Disposed;
        tracing::debug!(target: targets::CONTROL, id = %self.display_id(), "disposed");
    }

    fn clear_element_references(&self) {
        let element = {
            let mut inner = self.inner.lock();
            inner.sub_elements = None;
            inner.last_values.clear();
            inner.element.take()
        };
        if let Some(node) = element {
            self.dom.associate(node, None);
        }
    }

    // =========================================================================
    // Change propagation
    // =========================================================================

    /// Evaluate a data change.
    ///
    /// An inactive control only records the change unless `force` is set. An
    /// active control re-evaluates its view and bindings until nothing is
    /// dirty, up to the configured cycle ceiling. A call arriving while the
    /// loop is running is folded into the running loop.
    #[tracing::instrument(skip_all, target = "trellis::control", level = "trace")]
    pub fn change(&self, force: bool) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            inner.dirty = true;
            if !(inner.state == ControlState::Active || force) || inner.processing {
                return Ok(());
            }
            inner.processing = true;
        }

        let max_cycles = self.runtime.config().max_change_cycles;
        let mut cycles = 0;
        let still_dirty = {
            let _guard = ProcessingGuard(self);
            loop {
                {
                    let mut inner = self.inner.lock();
                    if !inner.dirty {
                        break false;
                    }
                    if cycles == max_cycles {
                        inner.dirty = false;
                        break true;
                    }
                    inner.dirty = false;
                }
                cycles += 1;
                self.behavior.on_data_context_changed(self);
                self.raise(events::EVALUATE_VIEW, &EventArgs::none());
                self.update_bindings();
            }
        };

        tracing::trace!(target: targets::CONTROL, id = %self.display_id(), cycles, "change evaluated");
        if still_dirty {
            self.runtime.contracts().report(ContractViolation::RedundantUpdateCycle {
                control: self.display_id(),
                cycles: max_cycles,
            })?;
        }
        Ok(())
    }

    fn update_bindings(&self) {
        let Some(template) = &self.options.template else {
            return;
        };
        let bindings = template.bindings();
        let (nodes, mut last_values) = {
            let mut inner = self.inner.lock();
            if inner.state != ControlState::Active {
                return;
            }
            inner.pending_writes.clear();
            let Some(sub_elements) = &inner.sub_elements else {
                return;
            };
            let nodes: Vec<Option<NodeId>> = bindings
                .iter()
                .map(|b| sub_elements.by_index.get(&b.element).copied())
                .collect();
            let mut last = inner.last_values.clone();
            last.resize(bindings.len(), None);
            (nodes, last)
        };

        let mut writes = BTreeMap::new();
        for (index, binding) in bindings.iter().enumerate() {
            let Some(node) = nodes[index] else {
                continue;
            };
            let last = last_values[index]
                .get_or_insert_with(|| binding.handler.get(self.dom.as_ref(), node, &binding.destination))
                .clone();
            let current = self.behavior.binding_value(self, &binding.source).coerce_like(&last);
            if !current.identical(&last) {
                writes.insert(index, PendingWrite { node, value: current });
            }
        }

        let schedule = !writes.is_empty();
        {
            let mut inner = self.inner.lock();
            inner.last_values = last_values;
            inner.pending_writes = writes;
        }
        if schedule {
            tracing::trace!(target: targets::BINDING, id = %self.display_id(), "binding writes queued");
            self.do_on_render_frame("bindings", |control, _| control.flush_bindings());
        }
    }

    fn flush_bindings(&self) {
        let Some(template) = &self.options.template else {
            return;
        };
        let writes = std::mem::take(&mut self.inner.lock().pending_writes);
        if writes.is_empty() {
            return;
        }
        let bindings = template.bindings();
        for (index, write) in &writes {
            let binding = &bindings[*index];
            binding
                .handler
                .set(self.dom.as_ref(), write.node, &binding.destination, &write.value);
        }
        {
            let mut inner = self.inner.lock();
            inner.last_values.resize(bindings.len(), None);
            for (index, write) in writes {
                inner.last_values[index] = Some(write.value);
            }
        }
        self.raise(events::UPDATE_VIEW, &EventArgs::none());
    }

    /// The current value of every bound source property.
    pub fn state_snapshot(&self) -> BTreeMap<String, Value> {
        let Some(template) = &self.options.template else {
            return BTreeMap::new();
        };
        template
            .sources()
            .into_iter()
            .map(|source| (source.to_string(), self.behavior.binding_value(self, source)))
            .collect()
    }

    // =========================================================================
    // Data context
    // =========================================================================

    /// Bind the control to new data.
    pub fn set_data_context(&self, source: impl Into<ContextSource>) -> Result<()> {
        self.set_data_context_with(source, false)
    }

    /// Bind the control to new data. With `force`, re-binding the current
    /// context still triggers a change.
    pub fn set_data_context_with(&self, source: impl Into<ContextSource>, force: bool) -> Result<()> {
        if self.is_disposed() {
            tracing::warn!(target: targets::CONTROL, id = %self.display_id(), "set_data_context on a disposed control");
            return Ok(());
        }
        match source.into() {
            ContextSource::Context(context) => {
                let same = self
                    .data_context()
                    .is_some_and(|current| Arc::ptr_eq(&current, &context));
                if same {
                    if force {
                        self.change(false)?;
                    }
                    return Ok(());
                }
                context.add_ref();
                let listener = self.listen_to(&context);
                let (old, old_listener) = {
                    let mut inner = self.inner.lock();
                    inner.dirty = true;
                    (
                        inner.data_context.replace(context),
                        inner.context_listener.replace(listener),
                    )
                };
                if let Some(old_listener) = old_listener {
                    self.runtime.bus().off_listener(old_listener);
                }
                if let Some(old) = old {
                    old.remove_ref();
                }
                self.change(false)
            }
            ContextSource::Data(data) => {
                let context = self.data_context_or_create();
                let changed = context.set_data(data);
                if force && !changed {
                    self.change(false)?;
                }
                Ok(())
            }
            ContextSource::Clear => {
                if let Some(context) = self.data_context() {
                    context.reset();
                    context.change();
                }
                Ok(())
            }
        }
    }

    /// The control's data context, creating a default-owned one if needed.
    pub fn data_context_or_create(&self) -> Arc<DataContext> {
        if let Some(context) = self.data_context() {
            return context;
        }
        let context = DataContext::builder(self.runtime.bus())
            .name(format!("{} context", self.options.control_name))
            .build();
        context.add_ref();
        let listener = self.listen_to(&context);
        let mut inner = self.inner.lock();
        inner.data_context = Some(context.clone());
        inner.context_listener = Some(listener);
        inner.dirty = true;
        context
    }

    fn listen_to(&self, context: &Arc<DataContext>) -> ListenerId {
        let weak = self.self_ref.clone();
        self.runtime
            .bus()
            .on(self.object, context.id(), events::CHANGE, move |_: &EventArgs| {
                if let Some(control) = weak.upgrade()
                    && let Err(err) = control.change(false)
                {
                    tracing::debug!(target: targets::CONTROL, %err, "change from data context failed");
                }
            })
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Create a control sharing this control's runtime and document, and add
    /// it as a child.
    pub fn create_child<B>(&self, options: ControlOptions, behavior: B) -> Arc<Control>
    where
        B: ControlBehavior,
    {
        let child = Control::with_behavior(&self.runtime, self.dom.clone(), options, behavior);
        self.add_child(child.clone());
        child
    }

    /// Append `child`, taking it from its previous parent.
    pub fn add_child(&self, child: Arc<Control>) {
        if let Some(previous) = child.parent() {
            previous.detach(&child);
        }
        child.inner.lock().parent = Some(self.self_ref.clone());
        self.runtime.bus().set_parent(child.object, Some(self.object));
        self.inner.lock().children.push(child);
    }

    /// Remove `child`. `index` is tried first and the children are searched
    /// if it does not hold `child`.
    pub fn remove_child(&self, child: &Arc<Control>, index: Option<usize>) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let position = index
                .filter(|i| inner.children.get(*i).is_some_and(|c| Arc::ptr_eq(c, child)))
                .or_else(|| inner.children.iter().position(|c| Arc::ptr_eq(c, child)));
            position.map(|i| inner.children.remove(i))
        };
        let Some(removed) = removed else {
            return false;
        };
        removed.inner.lock().parent = None;
        self.runtime.bus().set_parent(removed.object, None);
        true
    }

    /// Dispose and remove every child.
    pub fn clear_children(&self) {
        let children = std::mem::take(&mut self.inner.lock().children);
        for child in children {
            child.dispose();
            child.inner.lock().parent = None;
        }
    }

    fn detach(&self, child: &Control) {
        self.inner.lock().children.retain(|c| !std::ptr::eq(Arc::as_ptr(c), child));
        self.runtime.bus().set_parent(child.object, None);
    }

    /// Re-layout the active subtree. `on_resize` runs at the end of the
    /// frame, and only if the control is still active then.
    pub fn resize(&self) {
        for child in self.children() {
            if child.is_active() {
                child.resize();
            }
        }
        if self.is_active() {
            self.do_on_end_of_render_frame("resize", |control, _| control.behavior.on_resize(control));
        }
    }

    // =========================================================================
    // Render-frame helpers
    // =========================================================================

    fn frame_key(&self, key: &str) -> String {
        format!("{}:{}:{}:{}", self.options.control_name, self.display_id(), key, self.object.as_raw())
    }

    fn guarded<F>(&self, callback: F) -> impl FnOnce(Duration) + Send + use<F>
    where
        F: FnOnce(&Control, Duration) + Send + 'static,
    {
        let weak = self.self_ref.clone();
        move |elapsed| {
            if let Some(control) = weak.upgrade()
                && control.is_active()
            {
                callback(&control, elapsed);
            }
        }
    }

    /// Run `callback` on the next frame if the control is still active then.
    ///
    /// Keys are scoped to this control instance.
    pub fn do_on_render_frame<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&Control, Duration) + Send + 'static,
    {
        self.runtime.frames().on_next_frame(self.frame_key(key), self.guarded(callback));
    }

    /// Run `callback` at the end of the next frame if the control is still
    /// active then.
    pub fn do_on_end_of_render_frame<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&Control, Duration) + Send + 'static,
    {
        self.runtime.frames().on_end_of_frame(self.frame_key(key), self.guarded(callback));
    }

    /// Run `callback` on the `n`-th frame from now with the summed durations.
    pub fn do_on_render_frame_every_n<F>(&self, key: &str, n: usize, callback: F)
    where
        F: FnOnce(&Control, Duration) + Send + 'static,
    {
        self.runtime.frames().every_n_frames(self.frame_key(key), n, self.guarded(callback));
    }

    /// Cancel a pending [`do_on_render_frame`](Self::do_on_render_frame).
    pub fn cancel_render_frame(&self, key: &str) -> bool {
        self.runtime.frames().cancel_next_frame(&self.frame_key(key))
    }

    /// Cancel a pending [`do_on_end_of_render_frame`](Self::do_on_end_of_render_frame).
    pub fn cancel_end_of_render_frame(&self, key: &str) -> bool {
        self.runtime.frames().cancel_end_of_frame(&self.frame_key(key))
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Make `value` available to this control and its descendants.
    pub fn expose(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.lock().resources.insert(name.into(), value.into());
    }

    /// Find a resource exposed by this control or its nearest ancestor.
    pub fn resource(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.lock().resources.get(name) {
            return Some(value.clone());
        }
        let found = self.parent().and_then(|parent| parent.resource(name));
        if found.is_none() {
            tracing::warn!(target: targets::CONTROL, id = %self.display_id(), name, "resource not found");
        }
        found
    }
}

impl Observable for Control {
    fn object_id(&self) -> ObjectId {
        self.object
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(listener) = inner.context_listener.take() {
            self.runtime.bus().off_listener(listener);
        }
        if let Some(context) = inner.data_context.take() {
            context.remove_ref();
        }
        self.runtime.bus().unregister_object(self.object);
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Control")
            .field("name", &self.options.control_name)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("children", &inner.children.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(Control: Send, Sync);
