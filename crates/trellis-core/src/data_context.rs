//! Change-tracked property bags.
//!
//! A [`DataContext`] holds named [`Value`]s and raises `change` when any of
//! them is replaced. Values that are themselves observable have their
//! `change` forwarded as the context's own, and reference-counted values
//! are held with a counted reference for as long as the context keeps them.
//!
//! Contexts are shared between controls by reference counting. A context
//! created by default disposes itself when the last reference is released;
//! an externally owned one is left for its owner to dispose.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event::{EventArgs, EventBus, ListenerId, events};
use crate::logging::targets;
use crate::object::ObjectId;
use crate::value::{Observable, ObjectValue, RefCounted, Value};

/// Whether `set_data` raises `change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Notify {
    /// Raise only when some value changed.
    #[default]
    Auto,
    /// Always raise.
    Always,
    /// Never raise.
    Never,
}

/// Who is responsible for disposing a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Disposed when its reference count returns to zero.
    Default,
    /// Never disposed by reference counting.
    External,
}

type DefaultsFn = Box<dyn Fn() -> Vec<(String, Value)> + Send + Sync>;
type DisposeHook = Box<dyn FnOnce() + Send>;

struct Forward {
    listener: ListenerId,
    holders: usize,
}

#[derive(Default)]
struct ContextState {
    values: BTreeMap<String, Value>,
    forwards: HashMap<ObjectId, Forward>,
}

/// Objects gained and lost during one mutation, settled after the lock is released.
#[derive(Default)]
struct RefChanges {
    acquired: Vec<ObjectValue>,
    released: Vec<ObjectValue>,
}

impl RefChanges {
    fn settle(self) {
        // Take before release so a value moving between keys never hits zero.
        for object in &self.acquired {
            object.add_ref();
        }
        for object in &self.released {
            object.remove_ref();
        }
    }
}

/// An observable, reference-counted property bag.
pub struct DataContext {
    id: ObjectId,
    bus: Arc<EventBus>,
    state: Mutex<ContextState>,
    refs: AtomicUsize,
    ownership: Ownership,
    disposed: AtomicBool,
    defaults: Option<DefaultsFn>,
    dispose_hook: Mutex<Option<DisposeHook>>,
}

/// Builder for [`DataContext`].
pub struct DataContextBuilder {
    bus: Arc<EventBus>,
    name: String,
    ownership: Ownership,
    defaults: Option<DefaultsFn>,
}

impl DataContextBuilder {
    /// Set the debug name the context registers under.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the context as externally owned.
    pub fn external(mut self) -> Self {
        self.ownership = Ownership::External;
        self
    }

    /// Supply the values applied at construction and on every `reset`.
    pub fn defaults<F>(mut self, defaults: F) -> Self
    where
        F: Fn() -> Vec<(String, Value)> + Send + Sync + 'static,
    {
        self.defaults = Some(Box::new(defaults));
        self
    }

    /// Build the context.
    pub fn build(self) -> Arc<DataContext> {
        let id = self.bus.register_object::<DataContext>(self.name);
        let context = Arc::new(DataContext {
            id,
            bus: self.bus,
            state: Mutex::new(ContextState::default()),
            refs: AtomicUsize::new(0),
            ownership: self.ownership,
            disposed: AtomicBool::new(false),
            defaults: self.defaults,
            dispose_hook: Mutex::new(None),
        });
        context.apply_defaults();
        context
    }
}

impl DataContext {
    /// Start building a context on `bus`.
    pub fn builder(bus: &Arc<EventBus>) -> DataContextBuilder {
        DataContextBuilder {
            bus: bus.clone(),
            name: "DataContext".to_owned(),
            ownership: Ownership::Default,
            defaults: None,
        }
    }

    /// Create an empty, default-owned context.
    pub fn new(bus: &Arc<EventBus>) -> Arc<Self> {
        Self::builder(bus).build()
    }

    /// Create an empty, externally owned context.
    pub fn external(bus: &Arc<EventBus>) -> Arc<Self> {
        Self::builder(bus).external().build()
    }

    /// The id this context raises events under.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// How this context is disposed.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Register the hook run once during `dispose`.
    pub fn on_dispose<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.dispose_hook.lock() = Some(Box::new(hook));
    }

    /// The value under `key`, or `Null`.
    pub fn get(&self, key: &str) -> Value {
        self.state.lock().values.get(key).cloned().unwrap_or_default()
    }

    /// Keys currently held, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().values.keys().cloned().collect()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Whether no keys are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assign every entry of `data`, raising `change` if anything differed.
    ///
    /// Returns whether any value changed.
    pub fn set_data<I, K, V>(&self, data: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.set_data_with(data, Notify::Auto)
    }

    /// Assign every entry of `data` with an explicit notification policy.
    ///
    /// Values are compared by identity. Returns whether any value changed.
    pub fn set_data_with<I, K, V>(&self, data: I, notify: Notify) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        if self.is_disposed() {
            tracing::warn!(target: targets::DATA_CONTEXT, id = ?self.id, "set_data on a disposed context");
            return false;
        }

        let mut refs = RefChanges::default();
        let mut changed = false;
        {
            let mut state = self.state.lock();
            for (key, value) in data {
                changed |= self.assign(&mut state, key.into(), value.into(), &mut refs);
            }
        }
        refs.settle();

        let raise = match notify {
            Notify::Auto => changed,
            Notify::Always => true,
            Notify::Never => false,
        };
        tracing::trace!(target: targets::DATA_CONTEXT, id = ?self.id, changed, raise, "set_data");
        if raise {
            self.change();
        }
        changed
    }

    /// Raise `change` with no payload.
    pub fn change(&self) -> bool {
        self.change_with(&EventArgs::none())
    }

    /// Raise `change` with `args`.
    pub fn change_with(&self, args: &EventArgs) -> bool {
        self.bus.raise(self.id, events::CHANGE, args, false)
    }

    /// Drop every value and restore the defaults, without raising `change`.
    pub fn reset(&self) {
        let mut refs = RefChanges::default();
        {
            let mut state = self.state.lock();
            let values = std::mem::take(&mut state.values);
            for (_, value) in values {
                self.release(&mut state, value, &mut refs);
            }
        }
        refs.settle();
        self.apply_defaults();
    }

    /// Release every held value, run the dispose hook and raise `dispose`.
    ///
    /// A second call does nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: targets::DATA_CONTEXT, id = ?self.id, "disposing");

        let mut refs = RefChanges::default();
        {
            let mut state = self.state.lock();
            let values = std::mem::take(&mut state.values);
            for (_, value) in values {
                self.release(&mut state, value, &mut refs);
            }
        }
        refs.settle();

        let hook = self.dispose_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.bus.raise(self.id, events::DISPOSE, &EventArgs::none(), false);
        self.bus.dispose(self.id);
    }

    fn apply_defaults(&self) {
        let Some(defaults) = &self.defaults else {
            return;
        };
        let mut refs = RefChanges::default();
        {
            let mut state = self.state.lock();
            for (key, value) in defaults() {
                self.assign(&mut state, key, value, &mut refs);
            }
        }
        refs.settle();
    }

    fn assign(&self, state: &mut ContextState, key: String, value: Value, refs: &mut RefChanges) -> bool {
        if state.values.get(&key).is_some_and(|old| old.identical(&value)) {
            return false;
        }
        // A missing key compares equal to null.
        if value.is_null() && !state.values.contains_key(&key) {
            state.values.insert(key, value);
            return false;
        }
        self.hold(state, &value, refs);
        if let Some(old) = state.values.insert(key, value) {
            self.release(state, old, refs);
        }
        true
    }

    fn hold(&self, state: &mut ContextState, value: &Value, refs: &mut RefChanges) {
        let Value::Object(object) = value else {
            return;
        };
        if object.is_ref_counted() {
            refs.acquired.push(object.clone());
        }
        let Some(source) = object.observed_id() else {
            return;
        };
        if let Some(forward) = state.forwards.get_mut(&source) {
            forward.holders += 1;
            return;
        }
        let bus: Weak<EventBus> = Arc::downgrade(&self.bus);
        let context = self.id;
        let listener = self.bus.on(self.id, source, events::CHANGE, move |args: &EventArgs| {
            if let Some(bus) = bus.upgrade() {
                bus.raise(context, events::CHANGE, args, false);
            }
        });
        state.forwards.insert(source, Forward { listener, holders: 1 });
    }

    fn release(&self, state: &mut ContextState, value: Value, refs: &mut RefChanges) {
        let Value::Object(object) = value else {
            return;
        };
        if let Some(source) = object.observed_id()
            && let Some(forward) = state.forwards.get_mut(&source)
        {
            forward.holders -= 1;
            if forward.holders == 0 {
                let listener = forward.listener;
                state.forwards.remove(&source);
                self.bus.off_listener(listener);
            }
        }
        if object.is_ref_counted() {
            refs.released.push(object);
        }
    }
}

impl Observable for DataContext {
    fn object_id(&self) -> ObjectId {
        self.id
    }
}

impl RefCounted for DataContext {
    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn remove_ref(&self) {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) if self.ownership == Ownership::Default => self.dispose(),
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(target: targets::DATA_CONTEXT, id = ?self.id, "remove_ref on an unreferenced context");
            }
        }
    }
}

impl Drop for DataContext {
    fn drop(&mut self) {
        self.bus.unregister_object(self.id);
    }
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("id", &self.id)
            .field("refs", &self.ref_count())
            .field("ownership", &self.ownership)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

static_assertions::assert_impl_all!(DataContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        refs: AtomicUsize,
        removed: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refs: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
            })
        }
    }

    impl RefCounted for Counter {
        fn add_ref(&self) {
            self.refs.fetch_add(1, Ordering::SeqCst);
        }
        fn remove_ref(&self) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn change_counter(bus: &Arc<EventBus>, context: &DataContext) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let observer = bus.register_object::<()>("observer");
        bus.on(observer, context.id(), events::CHANGE, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_set_data_reports_change_once() {
        let bus = Arc::new(EventBus::new());
        let context = DataContext::new(&bus);
        let changes = change_counter(&bus, &context);

        assert!(context.set_data([("title", "a"), ("body", "b")]));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        assert!(!context.set_data([("title", "a"), ("body", "b")]));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        assert_eq!(context.get("title"), Value::from("a"));
        assert_eq!(context.get("missing"), Value::Null);
    }

    #[test]
    fn test_notify_policies() {
        let bus = Arc::new(EventBus::new());
        let context = DataContext::new(&bus);
        let changes = change_counter(&bus, &context);

        assert!(context.set_data_with([("x", 1)], Notify::Never));
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        assert!(!context.set_data_with([("x", 1)], Notify::Always));
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observable_value_change_is_forwarded_once() {
        let bus = Arc::new(EventBus::new());
        let outer = DataContext::new(&bus);
        let inner = DataContext::external(&bus);
        let changes = change_counter(&bus, &outer);

        let value = Value::observable(inner.clone());
        outer.set_data([("a", value.clone()), ("b", value)]);
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        inner.change();
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        outer.set_data([("a", Value::Null)]);
        inner.change();
        assert_eq!(changes.load(Ordering::SeqCst), 4);

        outer.set_data([("b", Value::Null)]);
        inner.change();
        assert_eq!(changes.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_ref_counted_values_follow_holding() {
        let bus = Arc::new(EventBus::new());
        let context = DataContext::new(&bus);
        let counter = Counter::new();

        context.set_data([("item", Value::ref_counted(counter.clone()))]);
        assert_eq!(counter.refs.load(Ordering::SeqCst), 1);

        context.set_data([("item", Value::from(3))]);
        assert_eq!(counter.refs.load(Ordering::SeqCst), 0);
        assert_eq!(counter.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let context = DataContext::new(&bus);
        let counter = Counter::new();
        let hooks = Arc::new(AtomicUsize::new(0));
        let h = hooks.clone();
        context.on_dispose(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        context.set_data([("item", Value::ref_counted(counter.clone()))]);

        context.dispose();
        context.dispose();
        assert!(context.is_disposed());
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(counter.removed.load(Ordering::SeqCst), 1);
        assert!(!context.set_data([("x", 1)]));
    }

    #[test]
    fn test_default_owned_disposes_at_zero_refs() {
        let bus = Arc::new(EventBus::new());
        let owned = DataContext::new(&bus);
        let external = DataContext::external(&bus);

        for context in [&owned, &external] {
            context.add_ref();
            context.add_ref();
            context.remove_ref();
            assert!(!context.is_disposed());
            context.remove_ref();
        }
        assert!(owned.is_disposed());
        assert!(!external.is_disposed());
    }

    #[test]
    fn test_reset_restores_defaults_silently() {
        let bus = Arc::new(EventBus::new());
        let context = DataContext::builder(&bus)
            .defaults(|| vec![("label".to_owned(), Value::from("none"))])
            .build();
        let changes = change_counter(&bus, &context);
        assert_eq!(context.get("label"), Value::from("none"));

        context.set_data([("label", "set"), ("extra", "x")]);
        context.reset();
        assert_eq!(context.get("label"), Value::from("none"));
        assert_eq!(context.keys(), vec!["label".to_owned()]);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }
}
