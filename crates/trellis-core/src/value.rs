//! Dynamically typed values held by data contexts and read by bindings.
//!
//! A [`Value`] is either a primitive or an object. Objects carry their
//! capabilities explicitly through [`ObjectValue`]: a plain payload, an
//! [`Observable`] that raises `change` on the bus, a [`RefCounted`] resource,
//! or a [`SharedResource`] that is both.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::object::ObjectId;

/// Something that raises `change` events on the bus under its own id.
pub trait Observable: Send + Sync {
    /// The id the object raises events under.
    fn object_id(&self) -> ObjectId;
}

/// Something whose lifetime is governed by explicit reference counting.
pub trait RefCounted: Send + Sync {
    /// Take a reference.
    fn add_ref(&self);
    /// Release a reference.
    fn remove_ref(&self);
}

/// An object that is both observable and reference counted.
pub trait SharedResource: Observable + RefCounted {}

impl<T: Observable + RefCounted + ?Sized> SharedResource for T {}

/// An object value, tagged with its capabilities.
#[derive(Clone)]
pub enum ObjectValue {
    /// An opaque payload.
    Plain(Arc<dyn Any + Send + Sync>),
    /// A payload that raises `change`.
    Observable(Arc<dyn Observable>),
    /// A reference-counted payload.
    RefCounted(Arc<dyn RefCounted>),
    /// A payload that is both observable and reference counted.
    Both(Arc<dyn SharedResource>),
}

impl ObjectValue {
    /// The id to subscribe to, if this object is observable.
    pub fn observed_id(&self) -> Option<ObjectId> {
        match self {
            Self::Observable(o) => Some(o.object_id()),
            Self::Both(o) => Some(o.object_id()),
            Self::Plain(_) | Self::RefCounted(_) => None,
        }
    }

    /// Take a reference if this object is reference counted.
    pub fn add_ref(&self) {
        match self {
            Self::RefCounted(r) => r.add_ref(),
            Self::Both(r) => r.add_ref(),
            Self::Plain(_) | Self::Observable(_) => {}
        }
    }

    /// Release a reference if this object is reference counted.
    pub fn remove_ref(&self) {
        match self {
            Self::RefCounted(r) => r.remove_ref(),
            Self::Both(r) => r.remove_ref(),
            Self::Plain(_) | Self::Observable(_) => {}
        }
    }

    /// Whether this object is reference counted.
    pub fn is_ref_counted(&self) -> bool {
        matches!(self, Self::RefCounted(_) | Self::Both(_))
    }

    /// Downcast a plain payload.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Plain(p) => Arc::clone(p).downcast::<T>().ok(),
            _ => None,
        }
    }

    fn data_ptr(&self) -> *const () {
        match self {
            Self::Plain(p) => Arc::as_ptr(p) as *const (),
            Self::Observable(p) => Arc::as_ptr(p) as *const (),
            Self::RefCounted(p) => Arc::as_ptr(p) as *const (),
            Self::Both(p) => Arc::as_ptr(p) as *const (),
        }
    }

    /// Identity comparison: the same allocation.
    pub fn same(&self, other: &ObjectValue) -> bool {
        std::ptr::eq(self.data_ptr(), other.data_ptr())
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Plain(_) => "Plain",
            Self::Observable(_) => "Observable",
            Self::RefCounted(_) => "RefCounted",
            Self::Both(_) => "Both",
        };
        write!(f, "{kind}({:p})", self.data_ptr())
    }
}

/// A dynamically typed value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A string.
    Text(String),
    /// An object.
    Object(ObjectValue),
}

impl Value {
    /// Wrap an opaque payload.
    pub fn plain<T: Any + Send + Sync>(payload: T) -> Self {
        Self::Object(ObjectValue::Plain(Arc::new(payload)))
    }

    /// Wrap an observable.
    pub fn observable(object: Arc<dyn Observable>) -> Self {
        Self::Object(ObjectValue::Observable(object))
    }

    /// Wrap a reference-counted object.
    pub fn ref_counted(object: Arc<dyn RefCounted>) -> Self {
        Self::Object(ObjectValue::RefCounted(object))
    }

    /// Wrap an object that is observable and reference counted.
    pub fn shared(object: Arc<dyn SharedResource>) -> Self {
        Self::Object(ObjectValue::Both(object))
    }

    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The object, if this is one.
    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Strict identity: primitives by value, objects by allocation.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.same(b),
            _ => false,
        }
    }

    /// Truthiness: null, false, zero, NaN and the empty string are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Text(s) => !s.is_empty(),
            Self::Object(_) => true,
        }
    }

    /// Render as text. `Null` renders as the empty string.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::Text(s) => s.clone(),
            Self::Object(_) => "[object]".to_owned(),
        }
    }

    /// Convert to a number. Values without a numeric reading become 0.
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Null | Self::Object(_) => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Number(n) if n.is_nan() => 0.0,
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        }
    }

    /// Normalize to the primitive type of `like`.
    ///
    /// Text targets get text (null becomes empty), boolean targets get
    /// truthiness, numeric targets get a number (null becomes 0). Any other
    /// target leaves the value unchanged.
    pub fn coerce_like(&self, like: &Value) -> Value {
        match like {
            Self::Text(_) => Self::Text(self.to_text()),
            Self::Bool(_) => Self::Bool(self.is_truthy()),
            Self::Number(_) => Self::Number(self.to_number()),
            Self::Null | Self::Object(_) => self.clone(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.identical(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<ObjectValue> for Value {
    fn from(value: ObjectValue) -> Self {
        Self::Object(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
