//! Object-to-object event bus.
//!
//! The [`EventBus`] holds every listener registration in the runtime. A
//! registration is the record `{source, event, owner, callback}`:
//!
//! - `source` is the object the event is raised on,
//! - `owner` is the object that registered the callback and is the only one
//!   allowed to remove it (individually, per source, or in bulk on dispose).
//!
//! Records are indexed by source (for [`raise`](EventBus::raise)) and by owner
//! (for [`dispose`](EventBus::dispose)); removal always clears both indices.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trellis_core::{EventArgs, EventBus};
//!
//! struct Widget;
//!
//! let bus = Arc::new(EventBus::new());
//! let widget = bus.register_object::<Widget>("widget");
//! let observer = bus.register_object::<Widget>("observer");
//!
//! bus.on(observer, widget, "change", |args: &EventArgs| {
//!     println!("changed: {:?}", args.get::<i32>());
//! });
//!
//! bus.raise(widget, "change", &EventArgs::new(42), false);
//! bus.dispose(observer);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::logging::targets;
use crate::object::{ObjectId, SharedObjectRegistry};

new_key_type! {
    /// Identifies a single listener registration on an [`EventBus`].
    pub struct ListenerId;
}

/// Well-known event names.
pub mod events {
    /// Raised when an object's observable state changed.
    pub const CHANGE: &str = "change";
    /// Raised when an object is disposed.
    pub const DISPOSE: &str = "dispose";
    /// Raised by an item that asks its containing set to drop it.
    pub const REMOVE_ITEM: &str = "removeItem";
    /// Raised when a control initializes.
    pub const INITIALIZE: &str = "initialize";
    /// Raised when a control renders markup.
    pub const RENDER_HTML: &str = "renderHtml";
    /// Raised when a control activates.
    pub const ACTIVATE: &str = "activate";
    /// Raised when a control re-evaluates its view.
    pub const EVALUATE_VIEW: &str = "evaluateView";
    /// Raised when a control applies pending binding writes.
    pub const UPDATE_VIEW: &str = "updateView";
    /// Raised when a control deactivates.
    pub const DEACTIVATE: &str = "deactivate";
}

/// Whether a raise should continue after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFlow {
    /// Keep invoking callbacks and bubbling.
    #[default]
    Continue,
    /// Stop this raise, including bubbling.
    Stop,
}

/// Conversion from a callback's return value into an [`EventFlow`].
///
/// Only an explicit `false` (or [`EventFlow::Stop`]) vetoes a raise.
pub trait IntoEventFlow {
    /// Convert into an event flow.
    fn into_event_flow(self) -> EventFlow;
}

impl IntoEventFlow for () {
    fn into_event_flow(self) -> EventFlow {
        EventFlow::Continue
    }
}

impl IntoEventFlow for bool {
    fn into_event_flow(self) -> EventFlow {
        if self {
            EventFlow::Continue
        } else {
            EventFlow::Stop
        }
    }
}

impl IntoEventFlow for EventFlow {
    fn into_event_flow(self) -> EventFlow {
        self
    }
}

/// Type-erased arguments passed to event callbacks.
#[derive(Clone, Default)]
pub struct EventArgs {
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl EventArgs {
    /// Arguments with no payload.
    pub fn none() -> Self {
        Self { payload: None }
    }

    /// Wrap a payload.
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Some(Arc::new(payload)),
        }
    }

    /// Wrap an already shared payload.
    pub fn from_arc(payload: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            payload: Some(payload),
        }
    }

    /// Borrow the payload as `T`, if it is one.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Whether the arguments carry no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }
}

impl fmt::Debug for EventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventArgs")
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

type Callback = Arc<dyn Fn(&EventArgs) -> EventFlow + Send + Sync>;

struct ListenerRecord {
    source: ObjectId,
    event: String,
    owner: ObjectId,
    callback: Callback,
}

#[derive(Default)]
struct ListenerIndex {
    records: SlotMap<ListenerId, ListenerRecord>,
    by_source: HashMap<ObjectId, HashMap<String, Vec<ListenerId>>>,
    by_owner: HashMap<ObjectId, Vec<ListenerId>>,
}

impl ListenerIndex {
    fn insert(&mut self, record: ListenerRecord) -> ListenerId {
        let source = record.source;
        let owner = record.owner;
        let event = record.event.clone();
        let id = self.records.insert(record);
        self.by_source
            .entry(source)
            .or_default()
            .entry(event)
            .or_default()
            .push(id);
        self.by_owner.entry(owner).or_default().push(id);
        id
    }

    fn remove(&mut self, id: ListenerId) -> Option<ListenerRecord> {
        let record = self.records.remove(id)?;

        if let Some(per_event) = self.by_source.get_mut(&record.source) {
            if let Some(ids) = per_event.get_mut(&record.event) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    per_event.remove(&record.event);
                }
            }
            if per_event.is_empty() {
                self.by_source.remove(&record.source);
            }
        }

        if let Some(ids) = self.by_owner.get_mut(&record.owner) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.by_owner.remove(&record.owner);
            }
        }

        Some(record)
    }

    fn callbacks_for(&self, source: ObjectId, event: &str) -> Vec<(ListenerId, Callback)> {
        self.by_source
            .get(&source)
            .and_then(|per_event| per_event.get(event))
            .map(|ids| {
                ids.iter()
                    .filter_map(|&id| self.records.get(id).map(|r| (id, r.callback.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Listener registry and dispatcher shared by every object in a runtime.
///
/// `EventBus` is `Send + Sync`. Callbacks are never invoked while internal
/// locks are held, so a callback may freely register, remove or raise.
pub struct EventBus {
    objects: SharedObjectRegistry,
    listeners: Mutex<ListenerIndex>,
}

impl EventBus {
    /// Create an empty bus with its own object registry.
    pub fn new() -> Self {
        Self {
            objects: SharedObjectRegistry::new(),
            listeners: Mutex::new(ListenerIndex::default()),
        }
    }

    /// The registry of objects known to this bus.
    pub fn objects(&self) -> &SharedObjectRegistry {
        &self.objects
    }

    /// Register an object so it can raise and receive events.
    pub fn register_object<T: ?Sized + 'static>(&self, name: impl Into<String>) -> ObjectId {
        self.objects.register::<T>(name)
    }

    /// Remove an object and every registration it owns or is the source of.
    pub fn unregister_object(&self, id: ObjectId) {
        {
            let mut index = self.listeners.lock();
            let mut doomed: Vec<ListenerId> = index.by_owner.get(&id).cloned().unwrap_or_default();
            if let Some(per_event) = index.by_source.get(&id) {
                doomed.extend(per_event.values().flatten().copied());
            }
            for listener in doomed {
                index.remove(listener);
            }
        }
        let _ = self.objects.unregister(id);
    }

    /// Set the parent used for bubbling.
    pub fn set_parent(&self, id: ObjectId, parent: Option<ObjectId>) {
        if let Err(err) = self.objects.set_parent(id, parent) {
            tracing::warn!(target: targets::EVENT, ?id, ?parent, %err, "failed to set event parent");
        }
    }

    /// Register `callback` to run whenever `event` is raised on `source`.
    ///
    /// Registrations are never de-duplicated: registering the same callback
    /// twice invokes it twice.
    pub fn on<F, R>(&self, owner: ObjectId, source: ObjectId, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&EventArgs) -> R + Send + Sync + 'static,
        R: IntoEventFlow,
    {
        let callback: Callback = Arc::new(move |args: &EventArgs| callback(args).into_event_flow());
        let id = self.listeners.lock().insert(ListenerRecord {
            source,
            event: event.to_owned(),
            owner,
            callback,
        });
        tracing::trace!(target: targets::EVENT, ?owner, ?source, event, "listener added");
        id
    }

    /// Remove `owner`'s registrations on `source`, for one event or all.
    ///
    /// Returns the number of registrations removed.
    pub fn off(&self, owner: ObjectId, source: ObjectId, event: Option<&str>) -> usize {
        let mut index = self.listeners.lock();
        let doomed: Vec<ListenerId> = index
            .by_owner
            .get(&owner)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|&id| {
                        index.records.get(id).is_some_and(|r| {
                            r.source == source && event.is_none_or(|e| r.event == e)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        for &id in &doomed {
            index.remove(id);
        }
        doomed.len()
    }

    /// Remove a single registration.
    pub fn off_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(id).is_some()
    }

    /// Remove every registration owned by `owner`, across all sources.
    pub fn dispose(&self, owner: ObjectId) -> usize {
        let mut index = self.listeners.lock();
        let doomed = index.by_owner.remove(&owner).unwrap_or_default();
        for &id in &doomed {
            index.remove(id);
        }
        if !doomed.is_empty() {
            tracing::trace!(target: targets::EVENT, ?owner, count = doomed.len(), "listeners disposed");
        }
        doomed.len()
    }

    /// Raise `event` on `object`.
    ///
    /// Callbacks run synchronously in registration order. A callback that
    /// returns `false` stops the raise, bubbling included, and makes this
    /// return `false`. With `bubble` set, the raise continues on the parent
    /// chain until a root is reached.
    #[tracing::instrument(skip_all, target = "trellis_core::event", level = "trace")]
    pub fn raise(&self, object: ObjectId, event: &str, args: &EventArgs, bubble: bool) -> bool {
        let mut current = Some(object);

        while let Some(target) = current {
            let callbacks = self.listeners.lock().callbacks_for(target, event);

            for (id, callback) in callbacks {
                // A callback earlier in this raise may have removed this one.
                if !self.listeners.lock().records.contains_key(id) {
                    continue;
                }
                if callback(args) == EventFlow::Stop {
                    tracing::trace!(target: targets::EVENT, ?target, event, "raise vetoed");
                    return false;
                }
            }

            if !bubble {
                break;
            }
            current = self.objects.parent(target).ok().flatten();
        }

        true
    }

    /// Raise a non-bubbling `change` event with no payload.
    pub fn change(&self, object: ObjectId) -> bool {
        self.raise(object, events::CHANGE, &EventArgs::none(), false)
    }

    /// Whether any callback is registered for `event` on `source`.
    pub fn has_observers(&self, source: ObjectId, event: &str) -> bool {
        self.listeners
            .lock()
            .by_source
            .get(&source)
            .and_then(|per_event| per_event.get(event))
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Total number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().records.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(EventBus: Send, Sync);

/// An owner-scoped set of registrations.
///
/// The group registers its own object on the bus and owns every listener
/// added through it. Dropping the group (or calling [`dispose`](Self::dispose))
/// removes them all.
pub struct ListenerGroup {
    bus: Weak<EventBus>,
    owner: ObjectId,
}

impl ListenerGroup {
    /// Create a group with a fresh owner object.
    pub fn new(bus: &Arc<EventBus>, name: impl Into<String>) -> Self {
        let owner = bus.register_object::<ListenerGroup>(name);
        Self {
            bus: Arc::downgrade(bus),
            owner,
        }
    }

    /// The object that owns this group's registrations.
    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    /// Listen for `event` on `source`.
    pub fn on<F, R>(&self, source: ObjectId, event: &str, callback: F) -> Option<ListenerId>
    where
        F: Fn(&EventArgs) -> R + Send + Sync + 'static,
        R: IntoEventFlow,
    {
        self.bus
            .upgrade()
            .map(|bus| bus.on(self.owner, source, event, callback))
    }

    /// Stop listening to `source`, for one event or all.
    pub fn off(&self, source: ObjectId, event: Option<&str>) -> usize {
        self.bus
            .upgrade()
            .map_or(0, |bus| bus.off(self.owner, source, event))
    }

    /// Raise `event` on this group's owner object.
    pub fn raise(&self, event: &str, args: &EventArgs, bubble: bool) -> bool {
        self.bus
            .upgrade()
            .is_none_or(|bus| bus.raise(self.owner, event, args, bubble))
    }

    /// Remove every registration in this group.
    pub fn dispose(&self) -> usize {
        self.bus.upgrade().map_or(0, |bus| bus.dispose(self.owner))
    }
}

impl Drop for ListenerGroup {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unregister_object(self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing;

    fn setup() -> (Arc<EventBus>, ObjectId, ObjectId) {
        let bus = Arc::new(EventBus::new());
        let source = bus.register_object::<Thing>("source");
        let owner = bus.register_object::<Thing>("owner");
        (bus, source, owner)
    }

    #[test]
    fn test_raise_in_registration_order() {
        let (bus, source, owner) = setup();
        let received = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let received = received.clone();
            bus.on(owner, source, "change", move |_: &EventArgs| {
                received.lock().push(tag);
            });
        }

        assert!(bus.raise(source, "change", &EventArgs::none(), false));
        assert_eq!(*received.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_duplicate_registrations_both_fire() {
        let (bus, source, owner) = setup();
        let count = Arc::new(Mutex::new(0));

        for _ in 0..2 {
            let count = count.clone();
            bus.on(owner, source, "change", move |_: &EventArgs| {
                *count.lock() += 1;
            });
        }

        bus.change(source);
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_raise_without_listeners_is_noop() {
        let (bus, source, _) = setup();
        assert!(bus.raise(source, "nothing", &EventArgs::none(), true));
    }

    #[test]
    fn test_false_stops_raise_and_bubble() {
        let (bus, source, owner) = setup();
        let parent = bus.register_object::<Thing>("parent");
        bus.set_parent(source, Some(parent));

        let received = Arc::new(Mutex::new(Vec::new()));
        let r1 = received.clone();
        bus.on(owner, source, "click", move |_: &EventArgs| {
            r1.lock().push("veto");
            false
        });
        let r2 = received.clone();
        bus.on(owner, source, "click", move |_: &EventArgs| {
            r2.lock().push("after");
        });
        let r3 = received.clone();
        bus.on(owner, parent, "click", move |_: &EventArgs| {
            r3.lock().push("parent");
        });

        assert!(!bus.raise(source, "click", &EventArgs::none(), true));
        assert_eq!(*received.lock(), vec!["veto"]);
    }

    #[test]
    fn test_bubble_only_when_requested() {
        let (bus, child, owner) = setup();
        let parent = bus.register_object::<Thing>("parent");
        bus.set_parent(child, Some(parent));

        let received = Arc::new(Mutex::new(None::<String>));
        let r = received.clone();
        bus.on(owner, parent, "change", move |args: &EventArgs| {
            *r.lock() = args.get::<&str>().map(|s| s.to_string());
        });

        bus.raise(child, "change", &EventArgs::new("argsProvided"), false);
        assert!(received.lock().is_none());

        bus.raise(child, "change", &EventArgs::new("argsProvided"), true);
        assert_eq!(received.lock().as_deref(), Some("argsProvided"));
    }

    #[test]
    fn test_off_by_event_and_source() {
        let (bus, source, owner) = setup();
        let other = bus.register_object::<Thing>("other");
        let received = Arc::new(Mutex::new(Vec::new()));

        let r = received.clone();
        bus.on(owner, source, "a", move |_: &EventArgs| r.lock().push("a"));
        let r = received.clone();
        bus.on(owner, source, "b", move |_: &EventArgs| r.lock().push("b"));
        let r = received.clone();
        bus.on(owner, other, "a", move |_: &EventArgs| r.lock().push("other"));

        assert_eq!(bus.off(owner, source, Some("a")), 1);
        bus.raise(source, "a", &EventArgs::none(), false);
        bus.raise(source, "b", &EventArgs::none(), false);
        bus.raise(other, "a", &EventArgs::none(), false);
        assert_eq!(*received.lock(), vec!["b", "other"]);

        assert_eq!(bus.off(owner, source, None), 1);
        assert!(!bus.has_observers(source, "b"));
        assert!(bus.has_observers(other, "a"));
    }

    #[test]
    fn test_off_only_removes_callers_registrations() {
        let (bus, source, owner) = setup();
        let stranger = bus.register_object::<Thing>("stranger");
        bus.on(owner, source, "change", |_: &EventArgs| {});

        assert_eq!(bus.off(stranger, source, None), 0);
        assert!(bus.has_observers(source, "change"));
    }

    #[test]
    fn test_dispose_clears_both_indices() {
        let (bus, source, owner) = setup();
        let other = bus.register_object::<Thing>("other");
        bus.on(owner, source, "change", |_: &EventArgs| {});
        bus.on(owner, other, "dispose", |_: &EventArgs| {});

        assert_eq!(bus.dispose(owner), 2);
        assert_eq!(bus.listener_count(), 0);
        assert!(!bus.listeners.lock().by_owner.contains_key(&owner));
        assert!(!bus.has_observers(source, "change"));
        assert!(!bus.has_observers(other, "dispose"));
    }

    #[test]
    fn test_listener_removed_during_raise_is_skipped() {
        let (bus, source, owner) = setup();
        let received = Arc::new(Mutex::new(Vec::new()));
        let second: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let weak_bus = Arc::downgrade(&bus);
        let second_clone = second.clone();
        let r = received.clone();
        bus.on(owner, source, "change", move |_: &EventArgs| {
            r.lock().push("first");
            if let (Some(bus), Some(id)) = (weak_bus.upgrade(), *second_clone.lock()) {
                bus.off_listener(id);
            }
        });
        let r = received.clone();
        *second.lock() = Some(bus.on(owner, source, "change", move |_: &EventArgs| {
            r.lock().push("second");
        }));

        bus.change(source);
        assert_eq!(*received.lock(), vec!["first"]);
    }

    #[test]
    fn test_listener_group_dispose_and_drop() {
        let bus = Arc::new(EventBus::new());
        let bar = bus.register_object::<Thing>("bar");
        let received = Arc::new(Mutex::new(None::<String>));

        let group = ListenerGroup::new(&bus, "foo.events");
        let r = received.clone();
        group.on(bar, "change", move |args: &EventArgs| {
            *r.lock() = args.get::<String>().cloned();
        });

        bus.raise(bar, "change", &EventArgs::new("argsProvided".to_string()), false);
        assert_eq!(received.lock().as_deref(), Some("argsProvided"));

        group.dispose();
        bus.raise(bar, "change", &EventArgs::new("newArgs".to_string()), false);
        assert_eq!(received.lock().as_deref(), Some("argsProvided"));

        group.on(bar, "change", |_: &EventArgs| {});
        let owner = group.owner();
        drop(group);
        assert_eq!(bus.listener_count(), 0);
        assert!(!bus.objects().contains(owner));
    }

    #[test]
    fn test_unregister_object_drops_inbound_listeners() {
        let (bus, source, owner) = setup();
        bus.on(owner, source, "change", |_: &EventArgs| {});
        bus.unregister_object(source);
        assert_eq!(bus.listener_count(), 0);
    }
}
