//! Reference to a top-level chunked collection.
//!
//! Only the collection id is embedded in the host record. The collection
//! itself is written and read through the transaction's collection APIs.

use std::any::Any;

use opal_core::{ClassId, ObjectId, ReadCursor, Result, StoreLayout, StoreMode};

use crate::registry::{Property, Registry};
use crate::transaction::{ReadContext, WriteTransaction};

use super::{cast, cast_mut, PropertyStorage};

pub(crate) struct CollectionRefStorage<T> {
    pub(crate) get: fn(&T) -> ObjectId,
    pub(crate) set: fn(&mut T, ObjectId),
}

impl<T: Any> PropertyStorage for CollectionRefStorage<T> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::AllEmbedded
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn size_from_buffer(&self, _registry: &Registry, _buf: &[u8]) -> Result<usize> {
        Ok(8)
    }

    fn size_from_value(
        &self,
        _registry: &Registry,
        _obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        Ok(8)
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
        let collection_id = (self.get)(cast::<T>(obj)?);
        txn.buffers.current().write_u64(collection_id)
    }

    fn load(
        &self,
        _ctx: &dyn ReadContext,
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
        let collection_id = cur.read_u64()?;
        (self.set)(cast_mut::<T>(obj)?, collection_id);
        Ok(())
    }
}
