//! Object-valued property storage.
//!
//! Owned value objects and polymorphic references are saved under their
//! own keys; the owning record embeds the 14-byte cross-reference. The
//! object-id mapping is the degenerate inline strategy occupying zero
//! bytes: the value is the record key itself, supplied at load time.

use std::any::{Any, TypeId};

use opal_core::{
    ClassId, Error, ObjectId, ReadCursor, Result, StorageKey, StoreLayout, StoreMode,
    STORAGE_KEY_SIZE,
};

use crate::handle::AnyHandle;
use crate::object;
use crate::registry::{Property, Registry};
use crate::transaction::{ReadContext, WriteTransaction};

use super::{cast, cast_mut, PropertyStorage};

/// Maps the host object's own id into a user-visible field.
pub(crate) struct ObjectIdStorage<T> {
    pub(crate) get: fn(&T) -> ObjectId,
    pub(crate) set: fn(&mut T, ObjectId),
}

impl<T: Any> PropertyStorage for ObjectIdStorage<T> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::AllEmbedded
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(0)
    }

    fn size_from_buffer(&self, _registry: &Registry, _buf: &[u8]) -> Result<usize> {
        Ok(0)
    }

    fn size_from_value(
        &self,
        _registry: &Registry,
        _obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        Ok(0)
    }

    fn save(
        &self,
        _txn: &mut WriteTransaction<'_>,
        _class_id: ClassId,
        _object_id: ObjectId,
        _obj: &mut dyn Any,
        _prop: &Property,
        _mode: StoreMode,
    ) -> Result<()> {
        // Not saved, only loaded: the id is part of the key.
        Ok(())
    }

    fn load(
        &self,
        _ctx: &dyn ReadContext,
        _cur: &mut ReadCursor<'_>,
        _class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        _prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if mode == StoreMode::ForceProperty {
            return Ok(());
        }
        (self.set)(cast_mut::<T>(obj)?, object_id);
        Ok(())
    }

    fn object_id_of(&self, obj: &dyn Any) -> Option<ObjectId> {
        obj.downcast_ref::<T>().map(|o| (self.get)(o))
    }

    fn assign_object_id(&self, obj: &mut dyn Any, oid: ObjectId) -> bool {
        match obj.downcast_mut::<T>() {
            Some(o) => {
                (self.set)(o, oid);
                true
            }
            None => false,
        }
    }
}

/// Owned value object saved under its own key, non-polymorphic.
///
/// The target type must map its object id so updates can find the
/// existing child record.
pub(crate) struct EmbeddedObjectStorage<T, V> {
    pub(crate) get: fn(&T) -> &V,
    pub(crate) set: fn(&mut T, V),
}

impl<T: Any, V: Any + Send + Sync + Clone> PropertyStorage for EmbeddedObjectStorage<T, V> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::EmbeddedKey
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(STORAGE_KEY_SIZE)
    }

    fn size_from_buffer(&self, _registry: &Registry, _buf: &[u8]) -> Result<usize> {
        Ok(STORAGE_KEY_SIZE)
    }

    fn size_from_value(
        &self,
        _registry: &Registry,
        _obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        Ok(STORAGE_KEY_SIZE)
    }

    fn save(
        &self,
        txn: &mut WriteTransaction<'_>,
        _class_id: ClassId,
        _object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        let store = txn.store();
        let child_info = store
            .registry()
            .require_by_token(TypeId::of::<V>(), std::any::type_name::<V>())?;

        let mut child: V = (self.get)(cast::<T>(obj)?).clone();
        let mut oid = child_info
            .properties()
            .object_id_of(&child)
            .ok_or_else(|| value_object_error(prop))?;

        if mode != StoreMode::ForceBuffer {
            oid = txn.save_child_value(child_info, &mut child)?;
            (self.set)(cast_mut::<T>(obj)?, child);
        }

        if mode != StoreMode::ForceProperty {
            let key = StorageKey::new(child_info.class_id(), oid, 0);
            txn.buffers.current().append(&key.encode())?;
        }
        Ok(())
    }

    fn load(
        &self,
        ctx: &dyn ReadContext,
        cur: &mut ReadCursor<'_>,
        _class_id: ClassId,
        _object_id: ObjectId,
        obj: &mut dyn Any,
        _prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        let sk = StorageKey::decode(cur)?;
        if mode == StoreMode::ForceBuffer || sk.class_id == 0 {
            return Ok(());
        }
        let info = ctx.registry().class_by_id(sk.class_id)?;
        let boxed = object::load_value_object(ctx, info, sk.object_id)?
            .ok_or_else(|| Error::not_found(StorageKey::new(sk.class_id, sk.object_id, 0)))?;
        let child = boxed
            .downcast::<V>()
            .map_err(|_| Error::internal("embedded object record has unexpected type"))?;
        (self.set)(cast_mut::<T>(obj)?, *child);
        Ok(())
    }
}

/// Polymorphic owned reference, optionally lazy.
pub(crate) struct ObjectRefStorage<T> {
    pub(crate) lazy: bool,
    pub(crate) get: fn(&T) -> Option<&AnyHandle>,
    pub(crate) set: fn(&mut T, AnyHandle),
}

impl<T: Any> PropertyStorage for ObjectRefStorage<T> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::EmbeddedKey
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(STORAGE_KEY_SIZE)
    }

    fn size_from_buffer(&self, _registry: &Registry, _buf: &[u8]) -> Result<usize> {
        Ok(STORAGE_KEY_SIZE)
    }

    fn size_from_value(
        &self,
        _registry: &Registry,
        _obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        Ok(STORAGE_KEY_SIZE)
    }

    fn save(
        &self,
        txn: &mut WriteTransaction<'_>,
        _class_id: ClassId,
        _object_id: ObjectId,
        obj: &mut dyn Any,
        _prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        let maybe = (self.get)(cast::<T>(obj)?).cloned();

        let mut cid: ClassId = 0;
        let mut oid: ObjectId = 0;
        if let Some(mut h) = maybe {
            if mode != StoreMode::ForceBuffer && h.is_loaded() {
                txn.save_child_handle(&mut h)?;
                cid = h.class_id;
                oid = h.oid;
                (self.set)(cast_mut::<T>(obj)?, h);
            } else {
                cid = h.class_id;
                oid = h.oid;
                if cid == 0 {
                    if let Some(token) = h.value_type_id() {
                        if let Some(info) = txn.store().registry().class_by_token(token) {
                            cid = info.class_id();
                        }
                    }
                }
            }
        }

        if mode != StoreMode::ForceProperty {
            let key = StorageKey::new(cid, oid, 0);
            txn.buffers.current().append(&key.encode())?;
        }
        Ok(())
    }

    fn load(
        &self,
        ctx: &dyn ReadContext,
        cur: &mut ReadCursor<'_>,
        _class_id: ClassId,
        _object_id: ObjectId,
        obj: &mut dyn Any,
        _prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        let sk = StorageKey::decode(cur)?;
        if sk.class_id == 0 {
            return Ok(());
        }
        // A lazy load records the target's identity without dereferencing.
        if mode == StoreMode::ForceBuffer || (self.lazy && mode == StoreMode::ForceNone) {
            (self.set)(
                cast_mut::<T>(obj)?,
                AnyHandle::unloaded(sk.class_id, sk.object_id),
            );
            return Ok(());
        }
        match object::load_dyn(ctx, sk.class_id, sk.object_id)? {
            Some(h) => (self.set)(cast_mut::<T>(obj)?, h),
            None => {
                return Err(Error::not_found(StorageKey::new(
                    sk.class_id,
                    sk.object_id,
                    0,
                )))
            }
        }
        Ok(())
    }
}

pub(crate) fn value_object_error(prop: &Property) -> Error {
    Error::internal(format!(
        "property '{}': mapped value-object type must map its object id",
        prop.name()
    ))
}
