//! Element-scoped listener bookkeeping.
//!
//! A control attaches DOM listeners while it is active. [`ElementListeners`]
//! remembers every registration so they can all be detached in one call when
//! the control deactivates, and detaches whatever is left when dropped.

use std::sync::Arc;

use parking_lot::Mutex;

use trellis_core::logging::targets;

use crate::dom::{DomEvent, DomHost, DomListenerId, NodeId};

#[derive(Debug, Clone)]
struct Registration {
    id: DomListenerId,
    node: NodeId,
    event: String,
}

/// The DOM listeners one owner has attached.
pub struct ElementListeners {
    dom: Arc<dyn DomHost>,
    registrations: Mutex<Vec<Registration>>,
}

impl ElementListeners {
    /// Track listeners on `dom`.
    pub fn new(dom: Arc<dyn DomHost>) -> Self {
        Self {
            dom,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Attach `callback` for `event` on `node`.
    pub fn add<F>(&self, node: NodeId, event: &str, callback: F) -> DomListenerId
    where
        F: Fn(&DomEvent) -> bool + Send + Sync + 'static,
    {
        let id = self.dom.add_listener(node, event, Arc::new(callback));
        self.registrations.lock().push(Registration {
            id,
            node,
            event: event.to_string(),
        });
        tracing::trace!(target: targets::DOM, ?node, event, "element listener added");
        id
    }

    /// Detach one listener.
    pub fn remove(&self, id: DomListenerId) -> bool {
        let found = {
            let mut registrations = self.registrations.lock();
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            registrations.len() != before
        };
        found && self.dom.remove_listener(id)
    }

    /// Detach every listener on `node` for `event`.
    pub fn remove_for(&self, node: NodeId, event: &str) -> usize {
        let removed: Vec<DomListenerId> = {
            let mut registrations = self.registrations.lock();
            let (matching, kept) = std::mem::take(&mut *registrations)
                .into_iter()
                .partition(|r| r.node == node && r.event == event);
            *registrations = kept;
            matching.into_iter().map(|r: Registration| r.id).collect()
        };
        removed.into_iter().filter(|id| self.dom.remove_listener(*id)).count()
    }

    /// Detach everything.
    pub fn clear(&self) -> usize {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        let count = registrations.len();
        for registration in registrations {
            self.dom.remove_listener(registration.id);
        }
        if count > 0 {
            tracing::trace!(target: targets::DOM, count, "element listeners cleared");
        }
        count
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Whether nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ElementListeners {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for ElementListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementListeners").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dom::Document;

    #[test]
    fn test_clear_detaches_everything() {
        let doc = Document::parse(r#"<div id="a"><b id="b"></b></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        let b = doc.element_by_id("b").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let listeners = ElementListeners::new(doc.clone());

        for node in [a, b] {
            let h = hits.clone();
            listeners.add(node, "click", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        doc.dispatch(b, "click");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert_eq!(listeners.clear(), 2);
        assert!(listeners.is_empty());
        doc.dispatch(b, "click");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(doc.listener_count(), 0);
    }

    #[test]
    fn test_remove_single_and_by_event() {
        let doc = Document::parse(r#"<div id="a"></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        let listeners = ElementListeners::new(doc.clone());

        let first = listeners.add(a, "click", |_| true);
        listeners.add(a, "click", |_| true);
        listeners.add(a, "keydown", |_| true);

        assert!(listeners.remove(first));
        assert!(!listeners.remove(first));
        assert_eq!(listeners.remove_for(a, "click"), 1);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_drop_detaches() {
        let doc = Document::parse(r#"<div id="a"></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        {
            let listeners = ElementListeners::new(doc.clone());
            listeners.add(a, "click", |_| true);
            assert_eq!(doc.listener_count(), 1);
        }
        assert_eq!(doc.listener_count(), 0);
    }
}
