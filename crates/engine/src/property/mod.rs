//! Property storage strategies.
//!
//! Every mapped property is bound to one strategy implementing
//! [`PropertyStorage`]. A strategy answers four questions: how many bytes
//! the property occupies inside a serialized record
//! (`size_from_buffer`), how many bytes a live value will need
//! (`size_from_value`), and how to `save` and `load` it. The declared
//! [`StoreLayout`] drives record composition: embedded strategies write
//! into the current buffer of the transaction's buffer stack, while
//! separately-keyed strategies write records of their own.
//!
//! Strategies are invoked only after the runtime class of the target
//! object has been resolved, so the `&dyn Any` downcasts here are the
//! final, exact-typed step of dispatch.

mod collection_ref;
mod object;
mod scalar;
mod vector;

pub(crate) use collection_ref::CollectionRefStorage;
pub(crate) use object::{EmbeddedObjectStorage, ObjectIdStorage, ObjectRefStorage};
pub(crate) use scalar::ScalarStorage;
pub(crate) use vector::{
    resolve_handle_class, EmbeddedVecStorage, HandleVecStorage, ObjectVecStorage,
    PolyEmbeddedVecStorage, ValueSetStorage, ValueVecStorage,
};

use std::any::Any;

use opal_core::{ClassId, Error, ObjectId, ReadCursor, Result, StoreLayout, StoreMode};

use crate::registry::{Property, Registry};
use crate::transaction::{ReadContext, WriteTransaction};

/// Strategy binding an in-memory property to a storage layout.
pub trait PropertyStorage: Send + Sync {
    /// Which part of the record this strategy occupies.
    fn layout(&self) -> StoreLayout;

    /// Constant embedded width, if the strategy always occupies the same
    /// number of inline bytes. Used for the per-class fixed-size cache.
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    /// Bytes this property occupies at the start of `buf`, which points
    /// into a serialized record at this property's position.
    fn size_from_buffer(&self, registry: &Registry, buf: &[u8]) -> Result<usize>;

    /// Bytes required to serialize the live value of this property.
    fn size_from_value(&self, registry: &Registry, obj: &dyn Any, prop: &Property)
        -> Result<usize>;

    /// Serialize the property. Embedded parts go to the transaction's
    /// current write buffer; separately-keyed parts are put directly.
    fn save(
        &self,
        txn: &mut WriteTransaction<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()>;

    /// Deserialize the property, advancing `cur` past its embedded bytes.
    fn load(
        &self,
        ctx: &dyn ReadContext,
        cur: &mut ReadCursor<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()>;

    /// The host object's ObjectId as mapped by this strategy, if this is
    /// the object-id mapping.
    fn object_id_of(&self, _obj: &dyn Any) -> Option<ObjectId> {
        None
    }

    /// Store the assigned ObjectId into the host object, if this is the
    /// object-id mapping. Returns whether anything was written.
    fn assign_object_id(&self, _obj: &mut dyn Any, _oid: ObjectId) -> bool {
        false
    }
}

pub(crate) fn cast<T: Any>(obj: &dyn Any) -> Result<&T> {
    obj.downcast_ref::<T>().ok_or_else(|| {
        Error::internal(format!(
            "property dispatched against wrong type, expected {}",
            std::any::type_name::<T>()
        ))
    })
}

pub(crate) fn cast_mut<T: Any>(obj: &mut dyn Any) -> Result<&mut T> {
    obj.downcast_mut::<T>().ok_or_else(|| {
        Error::internal(format!(
            "property dispatched against wrong type, expected {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Whether a separately-keyed mapping executes its keyed side under `mode`.
pub(crate) fn writes_property_side(lazy: bool, mode: StoreMode) -> bool {
    match mode {
        StoreMode::ForceBuffer => false,
        StoreMode::ForceNone => !lazy,
        StoreMode::ForceAll | StoreMode::ForceProperty => true,
    }
}
