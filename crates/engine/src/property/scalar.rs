//! Scalar property storage: value bytes inline in the owning record.

use std::any::Any;

use opal_core::{ClassId, Error, ObjectId, ReadCursor, Result, Scalar, StoreLayout, StoreMode};

use crate::registry::{Property, Registry};
use crate::transaction::{ReadContext, WriteTransaction};

use super::{cast, cast_mut, PropertyStorage};

/// Storage for int/float/bool/string properties.
pub(crate) struct ScalarStorage<T, V> {
    pub(crate) get: fn(&T) -> V,
    pub(crate) set: fn(&mut T, V),
}

impl<T: Any, V: Scalar> PropertyStorage for ScalarStorage<T, V> {
    fn layout(&self) -> StoreLayout {
        StoreLayout::AllEmbedded
    }

    fn fixed_size(&self) -> Option<usize> {
        if V::BYTE_SIZE == 0 {
            None
        } else {
            Some(V::BYTE_SIZE as usize)
        }
    }

    fn size_from_buffer(&self, _registry: &Registry, buf: &[u8]) -> Result<usize> {
        if V::BYTE_SIZE != 0 {
            return Ok(V::BYTE_SIZE as usize);
        }
        // Variable length: a zero-terminated string.
        match buf.iter().position(|b| *b == 0) {
            Some(nul) => Ok(nul + 1),
            None => Err(Error::corrupt("unterminated string in record")),
        }
    }

    fn size_from_value(
        &self,
        _registry: &Registry,
        obj: &dyn Any,
        _prop: &Property,
    ) -> Result<usize> {
        Ok((self.get)(cast::<T>(obj)?).encoded_size())
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
        let value = (self.get)(cast::<T>(obj)?);
        value.encode(txn.buffers.current())
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
        let value = V::decode(cur)?;
        (self.set)(cast_mut::<T>(obj)?, value);
        Ok(())
    }
}
