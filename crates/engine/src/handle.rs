//! Shared object handles.
//!
//! A handle pairs a shared value with the ObjectId the store assigned to
//! it. The id lives on the handle, never inside a smart pointer's
//! metadata: [`Handle`] is the exact-typed form used by the typed store
//! API, [`AnyHandle`] the type-erased form used wherever the runtime class
//! may be any registered subclass of a declared base.

use std::any::Any;
use std::sync::Arc;

use opal_core::{ClassId, ObjectId};

/// Exact-typed shared handle to a stored object.
///
/// `oid == 0` means the value has not been persisted yet.
#[derive(Debug)]
pub struct Handle<T> {
    value: Arc<T>,
    oid: ObjectId,
}

impl<T> Handle<T> {
    /// Wrap a fresh, not-yet-persisted value.
    pub fn new(value: T) -> Self {
        Handle {
            value: Arc::new(value),
            oid: 0,
        }
    }

    pub(crate) fn with_oid(value: Arc<T>, oid: ObjectId) -> Self {
        Handle { value, oid }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    /// Whether the store has not yet assigned an id to this value.
    pub fn is_new(&self) -> bool {
        self.oid == 0
    }

    pub(crate) fn arc(&self) -> &Arc<T> {
        &self.value
    }

    pub(crate) fn arc_mut(&mut self) -> &mut Arc<T> {
        &mut self.value
    }

    pub(crate) fn set_oid(&mut self, oid: ObjectId) {
        self.oid = oid;
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            value: Arc::clone(&self.value),
            oid: self.oid,
        }
    }
}

impl<T: Any + Send + Sync> From<&Handle<T>> for AnyHandle {
    fn from(h: &Handle<T>) -> Self {
        AnyHandle {
            value: Some(Arc::clone(h.arc()) as Arc<dyn Any + Send + Sync>),
            class_id: 0,
            oid: h.oid(),
        }
    }
}

/// Type-erased shared handle for polymorphic slots.
///
/// `class_id == 0` means "resolve from the value's runtime type when
/// needed". A handle with no value is *unloaded*: it carries the target's
/// identity (written by a lazy property load) and can be materialized with
/// the transaction's `load_handle`.
#[derive(Debug, Clone)]
pub struct AnyHandle {
    pub(crate) value: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) class_id: ClassId,
    pub(crate) oid: ObjectId,
}

impl AnyHandle {
    /// Wrap a fresh, not-yet-persisted value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        AnyHandle {
            value: Some(Arc::new(value)),
            class_id: 0,
            oid: 0,
        }
    }

    /// A handle that knows its stored identity but has not loaded the
    /// value. Produced by lazy property loads.
    pub(crate) fn unloaded(class_id: ClassId, oid: ObjectId) -> Self {
        AnyHandle {
            value: None,
            class_id,
            oid,
        }
    }

    pub(crate) fn loaded(
        value: Arc<dyn Any + Send + Sync>,
        class_id: ClassId,
        oid: ObjectId,
    ) -> Self {
        AnyHandle {
            value: Some(value),
            class_id,
            oid,
        }
    }

    /// Runtime ClassId, or 0 when not yet resolved against the registry.
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    pub fn is_new(&self) -> bool {
        self.oid == 0
    }

    /// Whether the value itself is present.
    pub fn is_loaded(&self) -> bool {
        self.value.is_some()
    }

    /// Borrow the value as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    /// Convert into an exact-typed handle if the value is a `T`.
    pub fn to_handle<T: Any + Send + Sync>(&self) -> Option<Handle<T>> {
        let arc = Arc::clone(self.value.as_ref()?);
        let typed = arc.downcast::<T>().ok()?;
        Some(Handle::with_oid(typed, self.oid))
    }

    pub(crate) fn value_type_id(&self) -> Option<std::any::TypeId> {
        self.value.as_ref().map(|v| (**v).type_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_new_has_no_oid() {
        let h = Handle::new(42i32);
        assert!(h.is_new());
        assert_eq!(*h.value(), 42);
    }

    #[test]
    fn test_handle_clone_shares_value() {
        let mut h = Handle::new(String::from("abc"));
        h.set_oid(7);
        let c = h.clone();
        assert_eq!(c.oid(), 7);
        assert!(Arc::ptr_eq(h.arc(), c.arc()));
    }

    #[test]
    fn test_any_handle_downcast() {
        let h = AnyHandle::new(3.25f64);
        assert!(h.is_loaded());
        assert_eq!(h.downcast_ref::<f64>(), Some(&3.25));
        assert_eq!(h.downcast_ref::<i32>(), None);
    }

    #[test]
    fn test_any_handle_to_typed() {
        let mut h = AnyHandle::new(11u32);
        h.oid = 5;
        let typed = h.to_handle::<u32>().unwrap();
        assert_eq!(typed.oid(), 5);
        assert_eq!(*typed.value(), 11);
        assert!(h.to_handle::<i16>().is_none());
    }

    #[test]
    fn test_unloaded_handle() {
        let h = AnyHandle::unloaded(12, 9);
        assert!(!h.is_loaded());
        assert_eq!(h.class_id(), 12);
        assert_eq!(h.oid(), 9);
        assert!(h.downcast_ref::<u8>().is_none());
    }
}
