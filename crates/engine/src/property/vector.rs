//! Vector and set property storage.
//!
//! Scalar vectors and sets serialize into one buffer stored under the
//! property's own key. Object vectors come in four shapes: value-based
//! with per-element keys, value-based inlined into the parent record, and
//! the two polymorphic variants of the same.

use std::any::{Any, TypeId};
use std::collections::BTreeSet;

use opal_core::{
    ClassId, Error, ObjectId, ReadCursor, Result, Scalar, StorageKey, StoreLayout, StoreMode,
    WriteBuffer, STORAGE_KEY_SIZE,
};

use crate::handle::AnyHandle;
use crate::object;
use crate::registry::{Property, Registry};
use crate::transaction::{ReadContext, WriteTransaction};

use super::object::value_object_error;
use super::{cast, cast_mut, writes_property_side, PropertyStorage};

/// `Vec<V>` of scalars, concatenated under a property key.
pub(crate) struct ValueVecStorage<T, V> {
    pub(crate) get: fn(&T) -> &Vec<V>,
    pub(crate) set: fn(&mut T, Vec<V>),
}

impl<T: Any, V: Scalar> PropertyStorage for ValueVecStorage<T, V> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::SeparateProperty
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
        txn: &mut WriteTransaction<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(false, mode) {
            return Ok(());
        }
        let values = (self.get)(cast::<T>(obj)?);
        let total: usize = values.iter().map(Scalar::encoded_size).sum();
        let mut buf = WriteBuffer::new();
        buf.start(total);
        for v in values {
            v.encode(&mut buf)?;
        }
        txn.put_data(StorageKey::new(class_id, object_id, prop.id()), buf.as_written())
    }

    fn load(
        &self,
        ctx: &dyn ReadContext,
        _cur: &mut ReadCursor<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(false, mode) {
            return Ok(());
        }
        let mut values = Vec::new();
        if let Some(bytes) = ctx.get_data(StorageKey::new(class_id, object_id, prop.id()))? {
            let mut cur = ReadCursor::new(&bytes);
            while !cur.at_end() {
                values.push(V::decode(&mut cur)?);
            }
        }
        (self.set)(cast_mut::<T>(obj)?, values);
        Ok(())
    }
}

/// Ordered set of scalars, concatenated under a property key.
pub(crate) struct ValueSetStorage<T, V> {
    pub(crate) get: fn(&T) -> &BTreeSet<V>,
    pub(crate) set: fn(&mut T, BTreeSet<V>),
}

impl<T: Any, V: Scalar + Ord> PropertyStorage for ValueSetStorage<T, V> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::SeparateProperty
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
        txn: &mut WriteTransaction<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(false, mode) {
            return Ok(());
        }
        let values = (self.get)(cast::<T>(obj)?);
        let total: usize = values.iter().map(Scalar::encoded_size).sum();
        let mut buf = WriteBuffer::new();
        buf.start(total);
        for v in values {
            v.encode(&mut buf)?;
        }
        txn.put_data(StorageKey::new(class_id, object_id, prop.id()), buf.as_written())
    }

    fn load(
        &self,
        ctx: &dyn ReadContext,
        _cur: &mut ReadCursor<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(false, mode) {
            return Ok(());
        }
        let mut values = BTreeSet::new();
        if let Some(bytes) = ctx.get_data(StorageKey::new(class_id, object_id, prop.id()))? {
            let mut cur = ReadCursor::new(&bytes);
            while !cur.at_end() {
                values.insert(V::decode(&mut cur)?);
            }
        }
        (self.set)(cast_mut::<T>(obj)?, values);
        Ok(())
    }
}

/// `Vec<V>` of value objects, each saved under its own key; the key array
/// goes under the property key. Non-polymorphic.
pub(crate) struct ObjectVecStorage<T, V> {
    pub(crate) lazy: bool,
    pub(crate) get: fn(&T) -> &Vec<V>,
    pub(crate) set: fn(&mut T, Vec<V>),
}

impl<T: Any, V: Any + Send + Sync + Clone> PropertyStorage for ObjectVecStorage<T, V> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::SeparateProperty
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
        txn: &mut WriteTransaction<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(self.lazy, mode) {
            return Ok(());
        }
        let store = txn.store();
        let child_info = store
            .registry()
            .require_by_token(TypeId::of::<V>(), std::any::type_name::<V>())?;

        let mut items: Vec<V> = (self.get)(cast::<T>(obj)?).clone();
        let mut buf = WriteBuffer::new();
        buf.start(items.len() * STORAGE_KEY_SIZE);
        for item in items.iter_mut() {
            child_info
                .properties()
                .object_id_of(&*item)
                .ok_or_else(|| value_object_error(prop))?;
            let oid = txn.save_child_value(child_info, item)?;
            buf.append(&StorageKey::new(child_info.class_id(), oid, 0).encode())?;
        }
        (self.set)(cast_mut::<T>(obj)?, items);

        txn.put_data(StorageKey::new(class_id, object_id, prop.id()), buf.as_written())
    }

    fn load(
        &self,
        ctx: &dyn ReadContext,
        _cur: &mut ReadCursor<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(self.lazy, mode) {
            return Ok(());
        }
        let mut items = Vec::new();
        if let Some(bytes) = ctx.get_data(StorageKey::new(class_id, object_id, prop.id()))? {
            let mut cur = ReadCursor::new(&bytes);
            while !cur.at_end() {
                let sk = StorageKey::decode(&mut cur)?;
                let info = ctx.registry().class_by_id(sk.class_id)?;
                let boxed = object::load_value_object(ctx, info, sk.object_id)?.ok_or_else(
                    || Error::not_found(StorageKey::new(sk.class_id, sk.object_id, 0)),
                )?;
                let item = boxed
                    .downcast::<V>()
                    .map_err(|_| Error::internal("object vector element has unexpected type"))?;
                items.push(*item);
            }
        }
        (self.set)(cast_mut::<T>(obj)?, items);
        Ok(())
    }
}

/// `Vec<V>` of value objects inlined into the parent record.
///
/// Elements receive synthetic ids equal to their index plus one; the ids
/// are not valid outside the vector. Only the shallow element buffer is
/// stored.
pub(crate) struct EmbeddedVecStorage<T, V> {
    pub(crate) get: fn(&T) -> &Vec<V>,
    pub(crate) set: fn(&mut T, Vec<V>),
}

impl<T: Any, V: Any + Send + Sync + Clone> PropertyStorage for EmbeddedVecStorage<T, V> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::AllEmbedded
    }

    fn size_from_buffer(&self, _registry: &Registry, buf: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(buf);
        let count = cur.read_u32()?;
        for _ in 0..count {
            let elem = cur.read_u32()? as usize;
            cur.skip(elem)?;
        }
        Ok(cur.position())
    }

    fn size_from_value(
        &self,
        registry: &Registry,
        obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        let child_info =
            registry.require_by_token(TypeId::of::<V>(), std::any::type_name::<V>())?;
        let items = (self.get)(cast::<T>(obj)?);
        if let Some(fixed) = child_info.properties().fixed_size() {
            return Ok(4 + items.len() * (4 + fixed));
        }
        let mut size = 4;
        for item in items {
            size += 4 + object::shallow_size(registry, child_info, item)?;
        }
        Ok(size)
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
        if mode == StoreMode::ForceProperty {
            return Ok(());
        }
        let store = txn.store();
        let registry = store.registry();
        let child_info =
            registry.require_by_token(TypeId::of::<V>(), std::any::type_name::<V>())?;

        let items: Vec<V> = (self.get)(cast::<T>(obj)?).clone();
        txn.buffers.current().write_u32(items.len() as u32)?;
        for (index, mut item) in items.into_iter().enumerate() {
            let size = object::shallow_size(registry, child_info, &item)?;
            txn.buffers.current().write_u32(size as u32)?;
            object::write_object(
                txn,
                child_info,
                index as ObjectId + 1,
                &mut item,
                StoreMode::ForceBuffer,
            )?;
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
        if mode == StoreMode::ForceProperty {
            return Ok(());
        }
        let child_info = ctx
            .registry()
            .require_by_token(TypeId::of::<V>(), std::any::type_name::<V>())?;

        let count = cur.read_u32()?;
        let mut items = Vec::with_capacity(count as usize);
        for index in 0..count {
            cur.read_u32()?; // element size, derivable from the mappings
            let mut boxed = (child_info.factory())();
            object::read_object_into(
                ctx,
                cur,
                child_info,
                child_info.class_id(),
                index as ObjectId + 1,
                boxed.as_mut(),
                StoreMode::ForceBuffer,
            )?;
            let item = boxed
                .downcast::<V>()
                .map_err(|_| Error::internal("embedded vector element has unexpected type"))?;
            items.push(*item);
        }
        (self.set)(cast_mut::<T>(obj)?, items);
        Ok(())
    }
}

/// Polymorphic variant of [`EmbeddedVecStorage`]: each element is tagged
/// with its ClassId.
pub(crate) struct PolyEmbeddedVecStorage<T> {
    pub(crate) target: &'static str,
    pub(crate) get: fn(&T) -> &Vec<AnyHandle>,
    pub(crate) set: fn(&mut T, Vec<AnyHandle>),
}

impl<T: Any> PropertyStorage for PolyEmbeddedVecStorage<T> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::AllEmbedded
    }

    fn size_from_buffer(&self, _registry: &Registry, buf: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(buf);
        let count = cur.read_u32()?;
        for _ in 0..count {
            cur.read_u32()?; // class id
            let elem = cur.read_u32()? as usize;
            cur.skip(elem)?;
        }
        Ok(cur.position())
    }

    fn size_from_value(
        &self,
        registry: &Registry,
        obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        let mut size = 4;
        for handle in (self.get)(cast::<T>(obj)?) {
            let info = resolve_handle_class(registry, handle)?;
            let value = handle.value.as_ref().ok_or(Error::InvalidPointer)?;
            size += 8 + object::shallow_size(registry, info, value.as_ref())?;
        }
        Ok(size)
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
        if mode == StoreMode::ForceProperty {
            return Ok(());
        }
        let store = txn.store();
        let registry = store.registry();

        let handles: Vec<AnyHandle> = (self.get)(cast::<T>(obj)?).clone();
        txn.buffers.current().write_u32(handles.len() as u32)?;
        for (index, mut handle) in handles.into_iter().enumerate() {
            let info = resolve_handle_class(registry, &handle)?;
            let value = handle.value.as_ref().ok_or(Error::InvalidPointer)?;
            let size = object::shallow_size(registry, info, value.as_ref())?;
            txn.buffers.current().write_u32(info.class_id())?;
            txn.buffers.current().write_u32(size as u32)?;
            object::with_handle_value_mut(registry, &mut handle, |value| {
                object::write_object(
                    txn,
                    info,
                    index as ObjectId + 1,
                    value,
                    StoreMode::ForceBuffer,
                )
            })?;
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
        if mode == StoreMode::ForceProperty {
            return Ok(());
        }
        let registry = ctx.registry();
        let root = registry.require_by_name(self.target)?;

        let count = cur.read_u32()?;
        let mut handles = Vec::with_capacity(count as usize);
        for index in 0..count {
            let cid: ClassId = cur.read_u32()?;
            let size = cur.read_u32()? as usize;
            // Absolute repositioning, not mark/unmark: this load may itself
            // run inside a marked chunk-element read.
            let payload_start = cur.position();
            if registry.is_instance(root.class_id(), cid) {
                let info = registry.class_by_id(cid)?;
                let mut boxed = (info.factory())();
                object::read_object_into(
                    ctx,
                    cur,
                    info,
                    cid,
                    index as ObjectId + 1,
                    boxed.as_mut(),
                    StoreMode::ForceBuffer,
                )?;
                handles.push(AnyHandle::loaded(boxed.into(), cid, 0));
            } else if let Some((sub_info, mut substitute)) =
                registry.make_substitute(root.class_id())
            {
                object::read_object_into(
                    ctx,
                    cur,
                    sub_info,
                    cid,
                    index as ObjectId + 1,
                    substitute.as_mut(),
                    StoreMode::ForceBuffer,
                )?;
                handles.push(AnyHandle::loaded(substitute.into(), cid, 0));
            }
            // Unknown without a substitute: drop the element.
            cur.seek(payload_start + size)?;
        }
        (self.set)(cast_mut::<T>(obj)?, handles);
        Ok(())
    }
}

/// Vector of polymorphic handles; elements saved under individual keys,
/// the key array under the property key.
pub(crate) struct HandleVecStorage<T> {
    pub(crate) target: &'static str,
    pub(crate) lazy: bool,
    pub(crate) get: fn(&T) -> &Vec<AnyHandle>,
    pub(crate) set: fn(&mut T, Vec<AnyHandle>),
}

impl<T: Any> PropertyStorage for HandleVecStorage<T> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::SeparateProperty
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
        txn: &mut WriteTransaction<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(self.lazy, mode) {
            return Ok(());
        }
        let mut handles: Vec<AnyHandle> = (self.get)(cast::<T>(obj)?).clone();
        let mut buf = WriteBuffer::new();
        buf.start(handles.len() * STORAGE_KEY_SIZE);
        for handle in handles.iter_mut() {
            if handle.is_loaded() {
                txn.save_child_handle(handle)?;
            } else if handle.class_id == 0 {
                return Err(Error::InvalidPointer);
            }
            buf.append(&StorageKey::new(handle.class_id, handle.oid, 0).encode())?;
        }
        (self.set)(cast_mut::<T>(obj)?, handles);

        txn.put_data(StorageKey::new(class_id, object_id, prop.id()), buf.as_written())
    }

    fn load(
        &self,
        ctx: &dyn ReadContext,
        _cur: &mut ReadCursor<'_>,
        class_id: ClassId,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: &Property,
        mode: StoreMode,
    ) -> Result<()> {
        if !writes_property_side(self.lazy, mode) {
            return Ok(());
        }
        let registry = ctx.registry();
        let root = registry.require_by_name(self.target)?;

        let mut handles = Vec::new();
        if let Some(bytes) = ctx.get_data(StorageKey::new(class_id, object_id, prop.id()))? {
            let mut cur = ReadCursor::new(&bytes);
            while !cur.at_end() {
                let sk = StorageKey::decode(&mut cur)?;
                if registry.class_by_id(sk.class_id).is_ok() {
                    match object::load_dyn(ctx, sk.class_id, sk.object_id)? {
                        Some(h) => handles.push(h),
                        None => {
                            return Err(Error::not_found(StorageKey::new(
                                sk.class_id,
                                sk.object_id,
                                0,
                            )))
                        }
                    }
                } else if let Some((sub_info, mut substitute)) =
                    registry.make_substitute(root.class_id())
                {
                    if object::load_substitute_into(
                        ctx,
                        sub_info,
                        sk.class_id,
                        sk.object_id,
                        substitute.as_mut(),
                    )? {
                        handles.push(AnyHandle::loaded(
                            substitute.into(),
                            sk.class_id,
                            sk.object_id,
                        ));
                    }
                }
                // Unknown without a substitute: drop the element.
            }
        }
        (self.set)(cast_mut::<T>(obj)?, handles);
        Ok(())
    }
}

pub(crate) fn resolve_handle_class<'r>(
    registry: &'r Registry,
    handle: &AnyHandle,
) -> Result<&'r crate::registry::ClassInfo> {
    if handle.class_id != 0 {
        return registry.class_by_id(handle.class_id);
    }
    let token = handle.value_type_id().ok_or(Error::InvalidPointer)?;
    registry.require_by_token(token, "<anonymous handle>")
}
