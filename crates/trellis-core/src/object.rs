//! Object identity for Trellis.
//!
//! Every participant in eventing (controls, data contexts, item sets, items,
//! listener groups) is registered here and addressed by an [`ObjectId`]. The
//! registry also stores the parent link that [`EventBus::raise`] follows when
//! an event bubbles.
//!
//! Unlike a widget tree, the registry does not own lifetimes: unregistering
//! an object orphans its children instead of destroying them. Ownership of
//! child controls stays with the control layer.
//!
//! [`EventBus::raise`]: crate::EventBus::raise

use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};

use crate::logging::targets;

new_key_type! {
    /// A unique identifier for an object registered with an [`ObjectRegistry`].
    ///
    /// `ObjectId`s stay valid until the object is unregistered.
    pub struct ObjectId;
}

impl ObjectId {
    /// Convert the ObjectId to a raw u64 value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }
}

/// Errors that can occur during object operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// The object ID is invalid or has been unregistered.
    #[error("invalid or unregistered object id")]
    InvalidObjectId,
    /// Attempted to set an object as its own parent/ancestor.
    #[error("cannot set an object as its own parent or ancestor")]
    CircularParentage,
}

/// Result type for object operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

struct ObjectData {
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
}

/// Arena of registered objects and their parent links.
pub struct ObjectRegistry {
    objects: SlotMap<ObjectId, ObjectData>,
}

impl ObjectRegistry {
    /// Create a new empty object registry.
    pub fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
        }
    }

    /// Register a new object of type `T` and return its ID.
    ///
    /// `name` and the type only show up in trace output.
    pub fn register<T: ?Sized + 'static>(&mut self, name: impl Into<String>) -> ObjectId {
        let type_name = std::any::type_name::<T>();
        let id = self.objects.insert(ObjectData {
            parent: None,
            children: Vec::new(),
        });
        tracing::trace!(target: targets::OBJECT, ?id, name = %name.into(), type_name, "registered object");
        id
    }

    /// Remove an object from the registry.
    ///
    /// The object is detached from its parent and its children become roots.
    pub fn unregister(&mut self, id: ObjectId) -> ObjectResult<()> {
        let data = self.objects.remove(id).ok_or(ObjectError::InvalidObjectId)?;
        if let Some(parent_id) = data.parent
            && let Some(parent) = self.objects.get_mut(parent_id)
        {
            parent.children.retain(|&child| child != id);
        }
        for child_id in data.children {
            if let Some(child) = self.objects.get_mut(child_id) {
                child.parent = None;
            }
        }
        tracing::trace!(target: targets::OBJECT, ?id, "unregistered object");
        Ok(())
    }

    /// Check if an object exists in the registry.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Set the parent of an object. Passing `None` makes it a root.
    pub fn set_parent(&mut self, id: ObjectId, new_parent: Option<ObjectId>) -> ObjectResult<()> {
        if !self.objects.contains_key(id) {
            return Err(ObjectError::InvalidObjectId);
        }

        if let Some(parent_id) = new_parent {
            if !self.objects.contains_key(parent_id) {
                return Err(ObjectError::InvalidObjectId);
            }
            if self.is_ancestor_of(id, parent_id) {
                return Err(ObjectError::CircularParentage);
            }
        }

        let old_parent = self.objects.get(id).and_then(|d| d.parent);
        if old_parent == new_parent {
            return Ok(());
        }
        if let Some(old_parent_id) = old_parent
            && let Some(parent_data) = self.objects.get_mut(old_parent_id)
        {
            parent_data.children.retain(|&child| child != id);
        }

        if let Some(data) = self.objects.get_mut(id) {
            data.parent = new_parent;
        }

        if let Some(parent_id) = new_parent
            && let Some(parent_data) = self.objects.get_mut(parent_id)
        {
            parent_data.children.push(id);
        }

        Ok(())
    }

    fn is_ancestor_of(&self, potential_ancestor: ObjectId, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == potential_ancestor {
                return true;
            }
            current = self.objects.get(current_id).and_then(|d| d.parent);
        }
        false
    }

    /// Get the parent of an object.
    pub fn parent(&self, id: ObjectId) -> ObjectResult<Option<ObjectId>> {
        self.objects
            .get(id)
            .map(|d| d.parent)
            .ok_or(ObjectError::InvalidObjectId)
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread-safe wrapper around [`ObjectRegistry`].
pub struct SharedObjectRegistry {
    inner: RwLock<ObjectRegistry>,
}

impl SharedObjectRegistry {
    /// Create a new shared object registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ObjectRegistry::new()),
        }
    }

    /// Register a new object.
    pub fn register<T: ?Sized + 'static>(&self, name: impl Into<String>) -> ObjectId {
        self.inner.write().register::<T>(name)
    }

    /// Unregister an object.
    pub fn unregister(&self, id: ObjectId) -> ObjectResult<()> {
        self.inner.write().unregister(id)
    }

    /// Check if an object exists.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.read().contains(id)
    }

    /// Set the parent of an object.
    pub fn set_parent(&self, id: ObjectId, parent: Option<ObjectId>) -> ObjectResult<()> {
        self.inner.write().set_parent(id, parent)
    }

    /// Get the parent of an object.
    pub fn parent(&self, id: ObjectId) -> ObjectResult<Option<ObjectId>> {
        self.inner.read().parent(id)
    }
}

impl Default for SharedObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node;

    fn children(registry: &ObjectRegistry, id: ObjectId) -> &[ObjectId] {
        &registry.objects[id].children
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = ObjectRegistry::new();
        let id = registry.register::<Node>("root");
        assert!(registry.contains(id));
        assert_eq!(registry.parent(id).unwrap(), None);
        registry.unregister(id).unwrap();
        assert_eq!(registry.parent(id), Err(ObjectError::InvalidObjectId));
    }

    #[test]
    fn test_set_parent_moves_between_parents() {
        let mut registry = ObjectRegistry::new();
        let a = registry.register::<Node>("a");
        let b = registry.register::<Node>("b");
        let child = registry.register::<Node>("child");

        registry.set_parent(child, Some(a)).unwrap();
        assert_eq!(children(&registry, a), &[child]);

        registry.set_parent(child, Some(b)).unwrap();
        assert!(children(&registry, a).is_empty());
        assert_eq!(children(&registry, b), &[child]);
        assert_eq!(registry.parent(child).unwrap(), Some(b));
    }

    #[test]
    fn test_circular_parentage_rejected() {
        let mut registry = ObjectRegistry::new();
        let a = registry.register::<Node>("a");
        let b = registry.register::<Node>("b");
        registry.set_parent(b, Some(a)).unwrap();

        assert_eq!(
            registry.set_parent(a, Some(b)),
            Err(ObjectError::CircularParentage)
        );
        assert_eq!(
            registry.set_parent(a, Some(a)),
            Err(ObjectError::CircularParentage)
        );
    }

    #[test]
    fn test_unregister_orphans_children() {
        let registry = SharedObjectRegistry::new();
        let parent = registry.register::<Node>("parent");
        let child = registry.register::<Node>("child");
        registry.set_parent(child, Some(parent)).unwrap();

        registry.unregister(parent).unwrap();
        assert!(!registry.contains(parent));
        assert_eq!(registry.parent(child).unwrap(), None);
        assert_eq!(registry.unregister(parent), Err(ObjectError::InvalidObjectId));
    }
}
