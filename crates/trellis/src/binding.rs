//! Declarative bindings between control properties and DOM elements.
//!
//! A template compiler describes each rendered element that needs wiring as
//! an [`Annotation`]: which attributes, classes and styles are bound to which
//! source properties, and which DOM events trigger which user actions.
//! [`Template::new`] flattens the annotations into [`Binding`]s, each of which
//! carries the [`Handler`] that reads and writes its destination.

use std::fmt;

use trellis_core::Value;
use trellis_core::logging::targets;

use crate::dom::{DomHost, NodeId};

/// The family a binding destination belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// An element attribute, or one of the `attr.*` special cases.
    Attr,
    /// Presence of a class in the element's class list.
    ClassName,
    /// An inline style property, or one of the `css.*` special cases.
    Css,
}

impl BindingKind {
    /// Kinds in the order their bindings are declared for one annotation.
    pub const ORDER: [BindingKind; 3] = [BindingKind::Attr, BindingKind::ClassName, BindingKind::Css];

    /// The kind's name as used in handler names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attr => "attr",
            Self::ClassName => "className",
            Self::Css => "css",
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type GetFn = fn(&dyn DomHost, NodeId, &str) -> Value;
type SetFn = fn(&dyn DomHost, NodeId, &str, &Value);

/// Reads and writes one kind of binding destination.
#[derive(Clone, Copy)]
pub struct Handler {
    name: &'static str,
    get: GetFn,
    set: SetFn,
}

impl Handler {
    /// The handler's name, e.g. `css.display`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read the destination's current value.
    pub fn get(&self, dom: &dyn DomHost, node: NodeId, destination: &str) -> Value {
        (self.get)(dom, node, destination)
    }

    /// Write `value` to the destination.
    pub fn set(&self, dom: &dyn DomHost, node: NodeId, destination: &str, value: &Value) {
        tracing::trace!(target: targets::BINDING, handler = self.name, destination, %value, "write");
        (self.set)(dom, node, destination, value)
    }

    /// Find the handler for `destination` under `kind`.
    ///
    /// Specialized handlers (`attr.checked`, `css.display` and so on) win over
    /// the generic handler of the kind.
    pub fn resolve(kind: BindingKind, destination: &str) -> Handler {
        match (kind, destination) {
            (BindingKind::Attr, "style") => ATTR_STYLE,
            (BindingKind::Attr, "class") => ATTR_CLASS,
            (BindingKind::Attr, "checked") => ATTR_CHECKED,
            (BindingKind::Attr, "disabled") => ATTR_DISABLED,
            (BindingKind::Attr, "aria-expanded" | "aria-selected" | "aria-checked" | "aria-pressed") => ATTR_BOOLEAN,
            (BindingKind::Attr, "html") => ATTR_HTML,
            (BindingKind::Attr, "text") => ATTR_TEXT,
            (BindingKind::Attr, _) => ATTR,
            (BindingKind::ClassName, _) => CLASS_NAME,
            (BindingKind::Css, "display") => CSS_DISPLAY,
            (BindingKind::Css, "display.inline") => CSS_DISPLAY_INLINE,
            (BindingKind::Css, "display.inlineBlock") => CSS_DISPLAY_INLINE_BLOCK,
            (BindingKind::Css, "visibility") => CSS_VISIBILITY,
            (BindingKind::Css, "width.px" | "height.px" | "left.px" | "right.px" | "top.px" | "bottom.px") => CSS_PX,
            (BindingKind::Css, _) => CSS,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.name).finish()
    }
}

fn text_or_null(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

const ATTR: Handler = Handler {
    name: "attr",
    get: |dom, node, name| text_or_null(dom.attribute(node, name)),
    set: |dom, node, name, value| match value {
        Value::Null | Value::Bool(false) => dom.remove_attribute(node, name),
        other => dom.set_attribute(node, name, &other.to_text()),
    },
};

const ATTR_STYLE: Handler = Handler {
    name: "attr.style",
    get: |dom, node, _| Value::Text(dom.attribute(node, "style").unwrap_or_default()),
    set: |dom, node, _, value| dom.set_attribute(node, "style", &value.to_text()),
};

const ATTR_CLASS: Handler = Handler {
    name: "attr.class",
    get: |dom, node, _| Value::Text(dom.attribute(node, "class").unwrap_or_default()),
    set: |dom, node, _, value| dom.set_attribute(node, "class", &value.to_text()),
};

const ATTR_CHECKED: Handler = Handler {
    name: "attr.checked",
    get: |dom, node, name| Value::Bool(dom.attribute(node, name).as_deref() == Some("checked")),
    set: |dom, node, name, value| set_flag_attribute(dom, node, name, value),
};

const ATTR_DISABLED: Handler = Handler {
    name: "attr.disabled",
    get: |dom, node, name| Value::Bool(dom.attribute(node, name).as_deref() == Some("disabled")),
    set: |dom, node, name, value| set_flag_attribute(dom, node, name, value),
};

fn set_flag_attribute(dom: &dyn DomHost, node: NodeId, name: &str, value: &Value) {
    if value.is_truthy() {
        dom.set_attribute(node, name, name);
    } else {
        dom.remove_attribute(node, name);
    }
}

const ATTR_BOOLEAN: Handler = Handler {
    name: "attr.aria",
    get: |dom, node, name| Value::Bool(dom.attribute(node, name).as_deref() == Some("true")),
    set: |dom, node, name, value| dom.set_attribute(node, name, if value.is_truthy() { "true" } else { "false" }),
};

const ATTR_HTML: Handler = Handler {
    name: "attr.html",
    get: |dom, node, _| Value::Text(dom.inner_html(node)),
    set: |dom, node, _, value| {
        if let Err(err) = dom.set_inner_html(node, &value.to_text()) {
            tracing::warn!(target: targets::BINDING, ?node, %err, "html binding failed");
        }
    },
};

const ATTR_TEXT: Handler = Handler {
    name: "attr.text",
    get: |dom, node, _| Value::Text(dom.text(node)),
    set: |dom, node, _, value| dom.set_text(node, &value.to_text()),
};

const CLASS_NAME: Handler = Handler {
    name: "className",
    get: |dom, node, class| Value::Bool(dom.has_class(node, class)),
    set: |dom, node, class, value| dom.toggle_class(node, class, value.is_truthy()),
};

const CSS: Handler = Handler {
    name: "css",
    get: |dom, node, property| Value::Text(dom.style(node, property)),
    set: |dom, node, property, value| dom.set_style(node, property, &value.to_text()),
};

fn toggle_display(dom: &dyn DomHost, node: NodeId, value: &Value, shown: &str) {
    dom.set_style(node, "display", if value.is_truthy() { shown } else { "none" });
}

const CSS_DISPLAY: Handler = Handler {
    name: "css.display",
    get: |dom, node, _| Value::Bool(dom.style(node, "display") != "none"),
    set: |dom, node, _, value| toggle_display(dom, node, value, "block"),
};

const CSS_DISPLAY_INLINE: Handler = Handler {
    name: "css.display.inline",
    get: |dom, node, _| Value::Bool(dom.style(node, "display") != "none"),
    set: |dom, node, _, value| toggle_display(dom, node, value, "inline"),
};

const CSS_DISPLAY_INLINE_BLOCK: Handler = Handler {
    name: "css.display.inlineBlock",
    get: |dom, node, _| Value::Bool(dom.style(node, "display") != "none"),
    set: |dom, node, _, value| toggle_display(dom, node, value, "inline-block"),
};

const CSS_VISIBILITY: Handler = Handler {
    name: "css.visibility",
    get: |dom, node, _| Value::Bool(dom.style(node, "visibility") == "visible"),
    set: |dom, node, _, value| {
        dom.set_style(node, "visibility", if value.is_truthy() { "visible" } else { "hidden" })
    },
};

const CSS_PX: Handler = Handler {
    name: "css.px",
    get: |dom, node, destination| {
        let property = destination.trim_end_matches(".px");
        dom.style(node, property)
            .trim_end_matches("px")
            .trim()
            .parse::<f64>()
            .map_or(Value::Null, |n| Value::Number(n.trunc()))
    },
    set: |dom, node, destination, value| {
        let property = destination.trim_end_matches(".px");
        dom.set_style(node, property, &format!("{}px", value.to_text()));
    },
};

/// The markup metadata for one rendered element.
///
/// Annotation `0` is the control's root element; annotation `n` is the
/// element whose id is `{control id}_{n}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    /// The element's index within the control's markup.
    pub id: u32,
    /// A name under which the element is exposed as a sub-element.
    pub child_id: Option<String>,
    /// `(destination, source)` pairs for attribute bindings.
    pub attr: Vec<(String, String)>,
    /// `(class, source)` pairs for class toggles.
    pub class_name: Vec<(String, String)>,
    /// `(property, source)` pairs for style bindings.
    pub css: Vec<(String, String)>,
    /// `(event, action)` pairs wiring DOM events to user actions.
    pub user_actions: Vec<(String, String)>,
}

impl Annotation {
    /// An annotation for element `id` with nothing declared.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Expose the element under `name`.
    pub fn child(mut self, name: impl Into<String>) -> Self {
        self.child_id = Some(name.into());
        self
    }

    /// Bind attribute `destination` to `source`.
    pub fn attr(mut self, destination: impl Into<String>, source: impl Into<String>) -> Self {
        self.attr.push((destination.into(), source.into()));
        self
    }

    /// Toggle class `class` on the truthiness of `source`.
    pub fn class_name(mut self, class: impl Into<String>, source: impl Into<String>) -> Self {
        self.class_name.push((class.into(), source.into()));
        self
    }

    /// Bind style `property` to `source`.
    pub fn css(mut self, property: impl Into<String>, source: impl Into<String>) -> Self {
        self.css.push((property.into(), source.into()));
        self
    }

    /// Run `action` when `event` fires on the element.
    pub fn user_action(mut self, event: impl Into<String>, action: impl Into<String>) -> Self {
        self.user_actions.push((event.into(), action.into()));
        self
    }

    fn pairs(&self, kind: BindingKind) -> &[(String, String)] {
        match kind {
            BindingKind::Attr => &self.attr,
            BindingKind::ClassName => &self.class_name,
            BindingKind::Css => &self.css,
        }
    }
}

/// One source-to-destination binding.
#[derive(Debug, Clone)]
pub struct Binding {
    /// The annotation (element index) the binding targets.
    pub element: u32,
    /// The binding family.
    pub kind: BindingKind,
    /// The attribute, class or style property written.
    pub destination: String,
    /// The control property read.
    pub source: String,
    /// Reads and writes the destination.
    pub handler: Handler,
}

/// Processed annotations for a control type.
#[derive(Debug, Clone, Default)]
pub struct Template {
    annotations: Vec<Annotation>,
    bindings: Vec<Binding>,
}

impl Template {
    /// Process `annotations` into bindings.
    pub fn new(annotations: Vec<Annotation>) -> Self {
        let bindings = annotations
            .iter()
            .flat_map(|annotation| {
                BindingKind::ORDER.into_iter().flat_map(move |kind| {
                    annotation.pairs(kind).iter().map(move |(destination, source)| Binding {
                        element: annotation.id,
                        kind,
                        destination: destination.clone(),
                        source: source.clone(),
                        handler: Handler::resolve(kind, destination),
                    })
                })
            })
            .collect();
        Self { annotations, bindings }
    }

    /// The annotations, in declaration order.
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// The flattened bindings, in declaration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// The distinct source properties read by the bindings.
    pub fn sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = Vec::new();
        for binding in &self.bindings {
            if !sources.contains(&binding.source.as_str()) {
                sources.push(&binding.source);
            }
        }
        sources
    }
}
