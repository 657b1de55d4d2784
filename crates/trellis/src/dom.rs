//! The DOM surface controls render into.
//!
//! Controls never touch a browser directly. They talk to a [`DomHost`], which
//! looks elements up by id, reads and writes attributes, and routes element
//! events. [`Document`] is the in-memory host used by tests and headless
//! embedders: markup is parsed with `kuchiki` and copied into a slotmap arena
//! so the document can be shared across threads.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use kuchiki::traits::*;
use kuchiki::{NodeRef, parse_html};
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use trellis_core::logging::targets;

new_key_type! {
    /// A node in a [`Document`].
    pub struct NodeId;
    /// A registered element listener.
    pub struct DomListenerId;
}

/// Errors raised by DOM hosts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    /// The node is not (or no longer) part of the document.
    #[error("node {0:?} is not in the document")]
    UnknownNode(NodeId),
    /// No element carries the requested id.
    #[error("no element with id `{0}`")]
    UnknownElement(String),
    /// The markup could not be turned into a node tree.
    #[error("failed to parse markup: {0}")]
    Parse(String),
}

/// A specialized Result type for DOM operations.
pub type DomResult<T> = std::result::Result<T, DomError>;

/// An element's box, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ElementRect {
    /// Distance from the left edge.
    pub left: f64,
    /// Distance from the top edge.
    pub top: f64,
    /// Box width.
    pub width: f64,
    /// Box height.
    pub height: f64,
}

/// An event being dispatched to element listeners.
#[derive(Debug, Clone)]
pub struct DomEvent {
    /// The event name, e.g. `click`.
    pub name: String,
    /// The node the event was dispatched on.
    pub target: NodeId,
    /// The node whose listener is currently running.
    pub current_target: NodeId,
}

/// An element listener. Returning `false` prevents the default action.
pub type DomListener = Arc<dyn Fn(&DomEvent) -> bool + Send + Sync>;

/// The collaborator surface a control needs from its document.
///
/// Class and style access have default implementations on top of the
/// `class` and `style` attributes, so a host only has to provide the
/// primitive operations.
pub trait DomHost: Send + Sync {
    /// Find the first element carrying `id`.
    fn element_by_id(&self, id: &str) -> Option<NodeId>;

    /// Read an attribute.
    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;

    /// Write an attribute.
    fn set_attribute(&self, node: NodeId, name: &str, value: &str);

    /// Remove an attribute.
    fn remove_attribute(&self, node: NodeId, name: &str);

    /// The concatenated text of the node's subtree.
    fn text(&self, node: NodeId) -> String;

    /// Replace the node's children with a single text node.
    fn set_text(&self, node: NodeId, text: &str);

    /// Serialize the node's children.
    fn inner_html(&self, node: NodeId) -> String;

    /// Replace the node's children with parsed markup.
    fn set_inner_html(&self, node: NodeId, html: &str) -> DomResult<()>;

    /// Register `listener` for `event` on `node`.
    fn add_listener(&self, node: NodeId, event: &str, listener: DomListener) -> DomListenerId;

    /// Remove a listener. Returns whether it was registered.
    fn remove_listener(&self, id: DomListenerId) -> bool;

    /// Dispatch `event` on `node`, bubbling to its ancestors.
    ///
    /// Returns `false` if a listener prevented the default action.
    fn dispatch(&self, node: NodeId, event: &str) -> bool;

    /// The node's box.
    fn bounding_rect(&self, node: NodeId) -> ElementRect;

    /// Associate an owner object (a control) with `node`.
    fn associate(&self, node: NodeId, owner: Option<Weak<dyn Any + Send + Sync>>);

    /// The owner associated with `node`, if still alive.
    fn associated(&self, node: NodeId) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Whether `class` is in the node's class list.
    fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .is_some_and(|list| list.split_whitespace().any(|c| c == class))
    }

    /// Add or remove `class`.
    fn toggle_class(&self, node: NodeId, class: &str, on: bool) {
        let current = self.attribute(node, "class").unwrap_or_default();
        let mut classes: Vec<&str> = current.split_whitespace().filter(|c| *c != class).collect();
        if on {
            classes.push(class);
        }
        self.set_attribute(node, "class", &classes.join(" "));
    }

    /// Read one inline style property, or `""`.
    fn style(&self, node: NodeId, property: &str) -> String {
        let css = self.attribute(node, "style").unwrap_or_default();
        parse_style(&css)
            .into_iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
            .unwrap_or_default()
    }

    /// Write one inline style property. An empty value removes it.
    fn set_style(&self, node: NodeId, property: &str, value: &str) {
        let css = self.attribute(node, "style").unwrap_or_default();
        let mut declarations = parse_style(&css);
        match declarations.iter_mut().find(|(name, _)| name == property) {
            Some(entry) if !value.is_empty() => entry.1 = value.to_string(),
            Some(_) => declarations.retain(|(name, _)| name != property),
            None if !value.is_empty() => declarations.push((property.to_string(), value.to_string())),
            None => {}
        }
        self.set_attribute(node, "style", &format_style(&declarations));
    }
}

/// Split inline CSS into `(property, value)` pairs.
pub fn parse_style(css: &str) -> Vec<(String, String)> {
    css.split(';')
        .filter_map(|declaration| {
            let (name, value) = declaration.split_once(':')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn format_style(declarations: &[(String, String)]) -> String {
    declarations
        .iter()
        .map(|(name, value)| format!("{name}: {value};"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn px(value: &str) -> f64 {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    digits.parse().unwrap_or(0.0)
}

enum NodeData {
    Element { tag: String, attrs: Vec<(String, String)> },
    Text(String),
}

struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

struct ListenerEntry {
    node: NodeId,
    event: String,
    callback: DomListener,
}

struct DocumentState {
    nodes: SlotMap<NodeId, Node>,
    body: NodeId,
    listeners: SlotMap<DomListenerId, ListenerEntry>,
    owners: HashMap<NodeId, Weak<dyn Any + Send + Sync>>,
}

impl DocumentState {
    fn element_mut(&mut self, node: NodeId) -> Option<&mut Vec<(String, String)>> {
        match self.nodes.get_mut(node).map(|n| &mut n.data) {
            Some(NodeData::Element { attrs, .. }) => Some(attrs),
            _ => None,
        }
    }

    fn remove_subtree(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(removed) = self.nodes.remove(id) {
                stack.extend(removed.children);
                self.owners.remove(&id);
            }
        }
        self.listeners.retain(|_, entry| self.nodes.contains_key(entry.node));
    }

    fn clear_children(&mut self, node: NodeId) {
        let children = self
            .nodes
            .get_mut(node)
            .map(|n| std::mem::take(&mut n.children))
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(child);
        }
    }

    fn import(&mut self, parent: NodeId, source: &NodeRef) -> Vec<NodeId> {
        let mut added = Vec::new();
        for child in source.children() {
            let data = if let Some(element) = child.as_element() {
                let attrs = element
                    .attributes
                    .borrow()
                    .map
                    .iter()
                    .map(|(name, attr)| (name.local.to_string(), attr.value.clone()))
                    .collect();
                NodeData::Element {
                    tag: element.name.local.to_string(),
                    attrs,
                }
            } else if let Some(text) = child.as_text() {
                NodeData::Text(text.borrow().clone())
            } else {
                continue;
            };

            let id = self.nodes.insert(Node {
                data,
                parent: Some(parent),
                children: Vec::new(),
            });
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.push(id);
            }
            self.import(id, &child);
            added.push(id);
        }
        added
    }

    fn text_into(&self, node: NodeId, out: &mut String) {
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        match &n.data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Element { .. } => {
                for child in &n.children {
                    self.text_into(*child, out);
                }
            }
        }
    }

    fn serialize_children(&self, node: NodeId, out: &mut String) {
        if let Some(n) = self.nodes.get(node) {
            for child in &n.children {
                self.serialize_node(*child, out);
            }
        }
    }

    fn serialize_node(&self, node: NodeId, out: &mut String) {
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        match &n.data {
            NodeData::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
                out.push('>');
                self.serialize_children(node, out);
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
            NodeData::Text(text) => out.push_str(&html_escape::encode_text(text)),
        }
    }

    fn find_by_id(&self, node: NodeId, id: &str) -> Option<NodeId> {
        let n = self.nodes.get(node)?;
        if let NodeData::Element { attrs, .. } = &n.data
            && attrs.iter().any(|(name, value)| name == "id" && value == id)
        {
            return Some(node);
        }
        n.children.iter().find_map(|child| self.find_by_id(*child, id))
    }
}

/// An in-memory document.
///
/// The document has a single `body` element; markup is appended beneath it.
pub struct Document {
    state: Mutex<DocumentState>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Arc<Self> {
        let mut nodes = SlotMap::with_key();
        let body = nodes.insert(Node {
            data: NodeData::Element {
                tag: "body".to_string(),
                attrs: Vec::new(),
            },
            parent: None,
            children: Vec::new(),
        });
        Arc::new(Self {
            state: Mutex::new(DocumentState {
                nodes,
                body,
                listeners: SlotMap::with_key(),
                owners: HashMap::new(),
            }),
        })
    }

    /// Create a document whose body holds `html`.
    pub fn parse(html: &str) -> DomResult<Arc<Self>> {
        let document = Self::new();
        let body = document.body();
        document.append_html(body, html)?;
        Ok(document)
    }

    /// The body element.
    pub fn body(&self) -> NodeId {
        self.state.lock().body
    }

    /// Parse `html` and append the result to `parent`.
    ///
    /// Returns the top-level nodes that were added.
    pub fn append_html(&self, parent: NodeId, html: &str) -> DomResult<Vec<NodeId>> {
        let fragment = parse_fragment(html)?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(parent) {
            return Err(DomError::UnknownNode(parent));
        }
        let added = state.import(parent, &fragment);
        tracing::trace!(target: targets::DOM, ?parent, nodes = added.len(), "markup appended");
        Ok(added)
    }

    /// Detach `node` and its subtree from the document.
    pub fn remove(&self, node: NodeId) -> DomResult<()> {
        let mut state = self.state.lock();
        let parent = state.nodes.get(node).ok_or(DomError::UnknownNode(node))?.parent;
        if let Some(p) = parent.and_then(|p| state.nodes.get_mut(p)) {
            p.children.retain(|c| *c != node);
        }
        state.remove_subtree(node);
        Ok(())
    }

    /// Whether `node` is in the document.
    pub fn contains(&self, node: NodeId) -> bool {
        self.state.lock().nodes.contains_key(node)
    }

    /// The element's tag name.
    pub fn tag_name(&self, node: NodeId) -> Option<String> {
        match &self.state.lock().nodes.get(node)?.data {
            NodeData::Element { tag, .. } => Some(tag.clone()),
            NodeData::Text(_) => None,
        }
    }

    /// The node's parent.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.state.lock().nodes.get(node)?.parent
    }

    /// The node's children.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Serialize the node including its own tag.
    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.state.lock().serialize_node(node, &mut out);
        out
    }

    /// Serialize the body's contents.
    pub fn to_html(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        state.serialize_children(state.body, &mut out);
        out
    }

    /// Number of registered element listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

fn parse_fragment(html: &str) -> DomResult<NodeRef> {
    let parsed = parse_html().one(html);
    let body = parsed
        .select_first("body")
        .map_err(|()| DomError::Parse("markup has no body".to_string()))?;
    Ok(body.as_node().clone())
}

impl DomHost for Document {
    fn element_by_id(&self, id: &str) -> Option<NodeId> {
        let state = self.state.lock();
        state.find_by_id(state.body, id)
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        match &self.state.lock().nodes.get(node)?.data {
            NodeData::Element { attrs, .. } => attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()),
            NodeData::Text(_) => None,
        }
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        let mut state = self.state.lock();
        let Some(attrs) = state.element_mut(node) else {
            tracing::warn!(target: targets::DOM, ?node, name, "set_attribute on a missing element");
            return;
        };
        match attrs.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => attrs.push((name.to_string(), value.to_string())),
        }
    }

    fn remove_attribute(&self, node: NodeId, name: &str) {
        if let Some(attrs) = self.state.lock().element_mut(node) {
            attrs.retain(|(n, _)| n != name);
        }
    }

    fn text(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.state.lock().text_into(node, &mut out);
        out
    }

    fn set_text(&self, node: NodeId, text: &str) {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(node) {
            return;
        }
        state.clear_children(node);
        if !text.is_empty() {
            let child = state.nodes.insert(Node {
                data: NodeData::Text(text.to_string()),
                parent: Some(node),
                children: Vec::new(),
            });
            if let Some(n) = state.nodes.get_mut(node) {
                n.children.push(child);
            }
        }
    }

    fn inner_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.state.lock().serialize_children(node, &mut out);
        out
    }

    fn set_inner_html(&self, node: NodeId, html: &str) -> DomResult<()> {
        let fragment = parse_fragment(html)?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(node) {
            return Err(DomError::UnknownNode(node));
        }
        state.clear_children(node);
        state.import(node, &fragment);
        Ok(())
    }

    fn add_listener(&self, node: NodeId, event: &str, listener: DomListener) -> DomListenerId {
        self.state.lock().listeners.insert(ListenerEntry {
            node,
            event: event.to_string(),
            callback: listener,
        })
    }

    fn remove_listener(&self, id: DomListenerId) -> bool {
        self.state.lock().listeners.remove(id).is_some()
    }

    fn dispatch(&self, node: NodeId, event: &str) -> bool {
        let path: Vec<(NodeId, Vec<DomListener>)> = {
            let state = self.state.lock();
            let mut path = Vec::new();
            let mut current = Some(node);
            while let Some(id) = current {
                let Some(n) = state.nodes.get(id) else {
                    break;
                };
                let callbacks = state
                    .listeners
                    .values()
                    .filter(|entry| entry.node == id && entry.event == event)
                    .map(|entry| entry.callback.clone())
                    .collect();
                path.push((id, callbacks));
                current = n.parent;
            }
            path
        };

        tracing::trace!(target: targets::DOM, ?node, event, "dispatch");
        let mut proceed = true;
        for (current_target, callbacks) in path {
            let dom_event = DomEvent {
                name: event.to_string(),
                target: node,
                current_target,
            };
            for callback in callbacks {
                proceed &= callback(&dom_event);
            }
        }
        proceed
    }

    fn bounding_rect(&self, node: NodeId) -> ElementRect {
        ElementRect {
            left: px(&self.style(node, "left")),
            top: px(&self.style(node, "top")),
            width: px(&self.style(node, "width")),
            height: px(&self.style(node, "height")),
        }
    }

    fn associate(&self, node: NodeId, owner: Option<Weak<dyn Any + Send + Sync>>) {
        let mut state = self.state.lock();
        match owner {
            Some(owner) if state.nodes.contains_key(node) => {
                state.owners.insert(node, owner);
            }
            Some(_) => {}
            None => {
                state.owners.remove(&node);
            }
        }
    }

    fn associated(&self, node: NodeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state.lock().owners.get(&node)?.upgrade()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Document")
            .field("nodes", &state.nodes.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(Document: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let doc = Document::parse(r#"<div id="a" class="x y"><span id="b">hi</span></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        let b = doc.element_by_id("b").unwrap();
        assert_eq!(doc.tag_name(a).as_deref(), Some("div"));
        assert_eq!(doc.parent(b), Some(a));
        assert_eq!(doc.text(a), "hi");
        assert!(doc.has_class(a, "y"));
        assert!(doc.element_by_id("missing").is_none());
    }

    #[test]
    fn test_class_and_style_helpers() {
        let doc = Document::parse(r#"<div id="a" style="color: red;"></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();

        doc.toggle_class(a, "selected", true);
        assert!(doc.has_class(a, "selected"));
        doc.toggle_class(a, "selected", false);
        assert!(!doc.has_class(a, "selected"));

        doc.set_style(a, "width", "40px");
        assert_eq!(doc.style(a, "color"), "red");
        assert_eq!(doc.style(a, "width"), "40px");
        assert_eq!(doc.bounding_rect(a).width, 40.0);
        doc.set_style(a, "color", "");
        assert_eq!(doc.attribute(a, "style").as_deref(), Some("width: 40px;"));
    }

    #[test]
    fn test_serialization_escapes() {
        let doc = Document::new();
        let body = doc.body();
        let added = doc.append_html(body, r#"<p id="p"></p>"#).unwrap();
        assert_eq!(added.len(), 1);
        let p = doc.element_by_id("p").unwrap();
        doc.set_text(p, "a < b");
        doc.set_attribute(p, "title", "\"q\"");
        assert_eq!(doc.outer_html(p), r#"<p id="p" title="&quot;q&quot;">a &lt; b</p>"#);
    }

    #[test]
    fn test_inner_html_replaces_children() {
        let doc = Document::parse(r#"<div id="a"><b id="old">x</b></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        let old = doc.element_by_id("old").unwrap();
        doc.set_inner_html(a, "<i>y</i>").unwrap();
        assert!(!doc.contains(old));
        assert_eq!(doc.inner_html(a), "<i>y</i>");
    }

    #[test]
    fn test_dispatch_bubbles_and_prevents_default() {
        let doc = Document::parse(r#"<div id="outer"><button id="inner"></button></div>"#).unwrap();
        let outer = doc.element_by_id("outer").unwrap();
        let inner = doc.element_by_id("inner").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        doc.add_listener(outer, "click", Arc::new(move |e: &DomEvent| {
            s.lock().push(("outer", e.target == inner));
            false
        }));
        let s = seen.clone();
        let id = doc.add_listener(inner, "click", Arc::new(move |_: &DomEvent| {
            s.lock().push(("inner", true));
            true
        }));

        assert!(!doc.dispatch(inner, "click"));
        assert_eq!(*seen.lock(), vec![("inner", true), ("outer", true)]);

        assert!(doc.remove_listener(id));
        assert!(!doc.remove_listener(id));
        seen.lock().clear();
        doc.dispatch(inner, "click");
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_removing_node_drops_its_listeners() {
        let doc = Document::parse(r#"<div id="a"></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        doc.add_listener(a, "click", Arc::new(|_: &DomEvent| true));
        assert_eq!(doc.listener_count(), 1);
        doc.remove(a).unwrap();
        assert_eq!(doc.listener_count(), 0);
        assert_eq!(doc.remove(a), Err(DomError::UnknownNode(a)));
    }

    #[test]
    fn test_association_is_weak() {
        let doc = Document::parse(r#"<div id="a"></div>"#).unwrap();
        let a = doc.element_by_id("a").unwrap();
        let owner: Arc<dyn Any + Send + Sync> = Arc::new(7u32);
        doc.associate(a, Some(Arc::downgrade(&owner)));
        assert!(doc.associated(a).is_some());
        drop(owner);
        assert!(doc.associated(a).is_none());
    }
}
