//! Object record composition.
//!
//! An object record is the object header followed by the property payloads
//! of all enabled properties in id order. A *shallow* pass serializes only
//! the embedded parts (`ForceBuffer`); a deep pass additionally writes the
//! separately-keyed parts and child objects.

use std::any::{Any, TypeId};
use std::sync::Arc;

use opal_core::{
    ClassId, Error, ObjectHeader, ObjectId, ReadCursor, Result, StorageKey, StoreMode,
};

use crate::handle::AnyHandle;
use crate::registry::{ClassInfo, Registry};
use crate::transaction::{ReadContext, WriteTransaction};

/// Shallow byte size of `obj`: the record payload without the header.
///
/// Separately-keyed properties contribute zero. Falls back to per-property
/// computation when the class has no constant size.
pub(crate) fn shallow_size(registry: &Registry, info: &ClassInfo, obj: &dyn Any) -> Result<usize> {
    if let Some(fixed) = info.properties().fixed_size() {
        return Ok(fixed);
    }
    let mut size = 0;
    for prop in info.properties().enabled() {
        size += prop.storage().size_from_value(registry, obj, prop)?;
    }
    Ok(size)
}

/// Serialize all enabled properties of `obj` into the transaction's
/// current buffer (and, unless `mode` says otherwise, their separately
/// keyed records).
pub(crate) fn write_object(
    txn: &mut WriteTransaction<'_>,
    info: &ClassInfo,
    object_id: ObjectId,
    obj: &mut dyn Any,
    mode: StoreMode,
) -> Result<()> {
    for prop in info.properties().enabled() {
        prop.storage()
            .save(txn, info.class_id(), object_id, &mut *obj, prop, mode)?;
    }
    Ok(())
}

/// Deserialize all enabled properties from `cur` into `obj`.
///
/// `class_id` names the key namespace the record was stored under; for
/// substitute loads it is the missing class, not `info`'s own id.
pub(crate) fn read_object_into(
    ctx: &dyn ReadContext,
    cur: &mut ReadCursor<'_>,
    info: &ClassInfo,
    class_id: ClassId,
    object_id: ObjectId,
    obj: &mut dyn Any,
    mode: StoreMode,
) -> Result<()> {
    for prop in info.properties().enabled() {
        prop.storage()
            .load(ctx, cur, class_id, object_id, &mut *obj, prop, mode)?;
    }
    Ok(())
}

/// Load the record of an exact class into a fresh instance.
pub(crate) fn load_value_object(
    ctx: &dyn ReadContext,
    info: &ClassInfo,
    object_id: ObjectId,
) -> Result<Option<Box<dyn Any + Send + Sync>>> {
    let key = StorageKey::new(info.class_id(), object_id, 0);
    let Some(bytes) = ctx.get_data(key)? else {
        return Ok(None);
    };
    let mut cur = ReadCursor::new(&bytes);
    let header = ObjectHeader::read(&mut cur)?;
    if header.class_id != info.class_id() {
        return Err(Error::corrupt(format!(
            "record {} carries class id {} in its header",
            key, header.class_id
        )));
    }
    let mut boxed = (info.factory())();
    read_object_into(
        ctx,
        &mut cur,
        info,
        info.class_id(),
        object_id,
        boxed.as_mut(),
        StoreMode::ForceNone,
    )?;
    Ok(Some(boxed))
}

/// Load a record of a known class polymorphically, by its on-disk id.
pub(crate) fn load_dyn(
    ctx: &dyn ReadContext,
    class_id: ClassId,
    object_id: ObjectId,
) -> Result<Option<AnyHandle>> {
    let info = ctx.registry().class_by_id(class_id)?;
    match load_value_object(ctx, info, object_id)? {
        Some(boxed) => Ok(Some(AnyHandle::loaded(boxed.into(), class_id, object_id))),
        None => Ok(None),
    }
}

/// Load the record of a *missing* class into a substitute instance, using
/// the substitute's own property table, which mirrors the known ancestor's
/// prefix. Returns whether a record existed.
pub(crate) fn load_substitute_into(
    ctx: &dyn ReadContext,
    substitute_info: &ClassInfo,
    missing_class: ClassId,
    object_id: ObjectId,
    obj: &mut dyn Any,
) -> Result<bool> {
    let key = StorageKey::new(missing_class, object_id, 0);
    let Some(bytes) = ctx.get_data(key)? else {
        return Ok(false);
    };
    let mut cur = ReadCursor::new(&bytes);
    ObjectHeader::read(&mut cur)?;
    read_object_into(
        ctx,
        &mut cur,
        substitute_info,
        missing_class,
        object_id,
        obj,
        StoreMode::ForceNone,
    )?;
    Ok(true)
}

/// Load a record of an exact type `T`.
pub(crate) fn load_exact<T: Any + Send + Sync>(
    ctx: &dyn ReadContext,
    object_id: ObjectId,
) -> Result<Option<T>> {
    let info = ctx
        .registry()
        .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
    match load_value_object(ctx, info, object_id)? {
        Some(boxed) => {
            let value = boxed
                .downcast::<T>()
                .map_err(|_| Error::internal("record factory produced unexpected type"))?;
            Ok(Some(*value))
        }
        None => Ok(None),
    }
}

/// Run `f` over the handle's value with mutable access.
///
/// A uniquely-held value is mutated in place. A shared value is cloned
/// through its class's clone hook, mutated, and swapped into the handle;
/// other holders of the old `Arc` keep the pre-save state.
pub(crate) fn with_handle_value_mut<R>(
    registry: &Registry,
    h: &mut AnyHandle,
    f: impl FnOnce(&mut dyn Any) -> Result<R>,
) -> Result<R> {
    let arc: &mut Arc<dyn Any + Send + Sync> = h.value.as_mut().ok_or(Error::InvalidPointer)?;
    if let Some(value) = Arc::get_mut(arc) {
        return f(value);
    }
    let token = (**arc).type_id();
    let info = registry.class_by_token(token).ok_or_else(|| {
        Error::internal("cannot save a shared value of an unregistered class")
    })?;
    let mut boxed = info
        .clone_value(arc.as_ref())
        .ok_or_else(|| Error::internal("value clone hook failed"))?;
    let result = f(boxed.as_mut())?;
    *arc = Arc::from(boxed);
    Ok(result)
}
