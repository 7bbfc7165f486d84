//! Read, exclusive-read and write transactions.
//!
//! Any number of read transactions run concurrently with each other and
//! with the single write transaction, each over its own backend snapshot.
//! Exclusive reads additionally block writers, which makes it safe to hand
//! out borrowed raw-data views into the store. The write transaction owns
//! the buffer stack and the in-flight collection metadata.
//!
//! ## Commit sequence
//!
//! ```text
//! 1. Check the buffer stack is balanced (else abort, TransactionMisuse)
//! 2. Serialize every modified CollectionInfo through the primary buffer
//!    and put it under (COLLECTION_INFO, collection_id, 0)
//! 3. Release the collection cache
//! 4. Commit the backend transaction (failure surfaces as BackendCommit)
//! ```
//!
//! Dropping an uncommitted write transaction rolls the backend back; a
//! `reset` keeps the handles alive for a later `renew`.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;

use opal_core::{
    ClassId, Error, ObjectHeader, ObjectId, PropertyId, RawValue, ReadCursor, Result, Scalar,
    StorageKey, StoreLayout, StoreMode, WriteBuffer, CHUNK_HEADER_SIZE, COLLECTION_CLSID,
    COLLECTION_INFO_CLSID, DEFAULT_CHUNK_SIZE, OBJECT_HEADER_SIZE,
};
use opal_core::BufferStack;
use opal_storage::{ChunkCursor, KeyCursor, ReadOps, ReadTxn, WriteTxn};
use tracing::debug;

use crate::collection::{
    CollectionData, CollectionInfo, DataCollectionAppender, ObjectCollectionAppender,
    ObjectCollectionCursor, ValueCollectionAppender, ValueCollectionCursor,
};
use crate::handle::{AnyHandle, Handle};
use crate::object;
use crate::property::resolve_handle_class;
use crate::registry::{ClassInfo, Property, Registry};
use crate::store::{Store, WriterGuard};

/// Read surface shared by all transaction kinds.
///
/// Property mappings and cursors are written against this trait so that
/// loads work identically inside read and write transactions.
pub trait ReadContext {
    fn registry(&self) -> &Registry;

    /// Fetch a copy of the value stored under `key`.
    fn get_data(&self, key: StorageKey) -> Result<Option<Vec<u8>>>;

    /// Cursor over the main records of the given classes.
    fn open_class_cursor(&self, class_ids: &[ClassId]) -> Result<Box<dyn KeyCursor + '_>>;

    /// Cursor over the chunks of a collection.
    fn open_chunk_cursor(
        &self,
        collection_id: ObjectId,
        at_end: bool,
    ) -> Result<Box<dyn ChunkCursor + '_>>;

    /// Collection metadata, loaded once per transaction and cached.
    fn collection_info(&self, collection_id: ObjectId) -> Result<CollectionInfo>;
}

fn reset_error() -> Error {
    Error::misuse("transaction was reset; renew it before use")
}

// ---------------------------------------------------------------------------
// Shared read operations
// ---------------------------------------------------------------------------

fn load_object_impl<T: Any + Send + Sync>(
    ctx: &dyn ReadContext,
    object_id: ObjectId,
) -> Result<Option<T>> {
    object::load_exact::<T>(ctx, object_id)
}

fn get_object_impl<T: Any + Send + Sync>(
    ctx: &dyn ReadContext,
    object_id: ObjectId,
) -> Result<Option<Handle<T>>> {
    Ok(object::load_exact::<T>(ctx, object_id)?
        .map(|value| Handle::with_oid(std::sync::Arc::new(value), object_id)))
}

fn load_handle_impl(ctx: &dyn ReadContext, handle: &mut AnyHandle) -> Result<()> {
    if handle.is_loaded() {
        return Ok(());
    }
    if handle.class_id == 0 || handle.oid == 0 {
        return Err(Error::InvalidPointer);
    }
    match object::load_dyn(ctx, handle.class_id, handle.oid)? {
        Some(loaded) => {
            *handle = loaded;
            Ok(())
        }
        None => Err(Error::not_found(StorageKey::new(
            handle.class_id,
            handle.oid,
            0,
        ))),
    }
}

fn class_cursor_impl<'t, T: Any>(ctx: &'t dyn ReadContext) -> Result<ClassCursor<'t>> {
    let root = ctx
        .registry()
        .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
    let ids = ctx.registry().all_class_ids(root.class_id());
    let cursor = ctx.open_class_cursor(&ids)?;
    Ok(ClassCursor {
        ctx,
        cursor,
        root,
        current: None,
    })
}

fn collection_contents_impl<T: Any>(
    ctx: &dyn ReadContext,
    collection_id: ObjectId,
) -> Result<Vec<AnyHandle>> {
    let root = ctx
        .registry()
        .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
    let mut cursor = ObjectCollectionCursor::new(ctx, root, collection_id)?;
    let mut out = Vec::new();
    while let Some(handle) = cursor.next()? {
        out.push(handle);
    }
    Ok(out)
}

fn value_collection_contents_impl<V: Scalar>(
    ctx: &dyn ReadContext,
    collection_id: ObjectId,
) -> Result<Vec<V>> {
    let mut cursor = ValueCollectionCursor::<V>::new(ctx, collection_id)?;
    let mut out = Vec::new();
    while let Some(value) = cursor.next()? {
        out.push(value);
    }
    Ok(out)
}

fn attached_collection_impl(
    ctx: &dyn ReadContext,
    class_id: ClassId,
    object_id: ObjectId,
    property_id: PropertyId,
) -> Result<Vec<AnyHandle>> {
    let Some(bytes) = ctx.get_data(StorageKey::new(class_id, object_id, property_id))? else {
        return Ok(Vec::new());
    };
    let mut cur = ReadCursor::new(&bytes);
    let count = cur.read_u32()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let sk = StorageKey::decode(&mut cur)?;
        if ctx.registry().class_by_id(sk.class_id).is_err() {
            // Element of a class this process does not know; skip it.
            continue;
        }
        match object::load_dyn(ctx, sk.class_id, sk.object_id)? {
            Some(handle) => out.push(handle),
            None => {
                return Err(Error::not_found(StorageKey::new(
                    sk.class_id,
                    sk.object_id,
                    0,
                )))
            }
        }
    }
    Ok(out)
}

fn load_property_impl<T: Any + Send + Sync>(
    ctx: &dyn ReadContext,
    object_id: ObjectId,
    obj: &mut T,
    name: &str,
) -> Result<()> {
    let info = ctx
        .registry()
        .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
    let prop = property_of(info, name)?;
    if prop.layout() != StoreLayout::SeparateProperty {
        return Err(Error::misuse(
            "only separately-keyed properties can be loaded individually",
        ));
    }
    let mut cur = ReadCursor::new(&[]);
    prop.storage()
        .load(ctx, &mut cur, info.class_id(), object_id, obj, prop, StoreMode::ForceAll)
}

fn property_of<'i>(info: &'i ClassInfo, name: &str) -> Result<&'i Property> {
    info.properties().get(name).ok_or_else(|| {
        Error::internal(format!("class {} has no property '{}'", info.name(), name))
    })
}

// ---------------------------------------------------------------------------
// Read transaction
// ---------------------------------------------------------------------------

/// Transaction allowing read operations only. Any number can run
/// concurrently, also alongside one write transaction.
pub struct ReadTransaction<'s> {
    store: &'s Store,
    backend: Option<Box<dyn ReadTxn + 's>>,
    infos: RefCell<HashMap<ObjectId, CollectionInfo>>,
}

impl<'s> ReadTransaction<'s> {
    pub(crate) fn new(store: &'s Store) -> Result<Self> {
        Ok(ReadTransaction {
            store,
            backend: Some(store.backend().begin_read()?),
            infos: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn backend_ref(&self) -> Result<&(dyn ReadTxn + 's)> {
        self.backend.as_deref().ok_or_else(reset_error)
    }

    /// Load an object of exact type `T` by its id.
    pub fn load_object<T: Any + Send + Sync>(&self, object_id: ObjectId) -> Result<Option<T>> {
        load_object_impl(self, object_id)
    }

    /// Load an object into a shared handle carrying its id.
    pub fn get_object<T: Any + Send + Sync>(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<Handle<T>>> {
        get_object_impl(self, object_id)
    }

    /// Reload the current stored state of a handle's object.
    pub fn reload_object<T: Any + Send + Sync>(
        &self,
        handle: &Handle<T>,
    ) -> Result<Option<Handle<T>>> {
        if handle.oid() == 0 {
            return Err(Error::InvalidPointer);
        }
        get_object_impl(self, handle.oid())
    }

    /// Materialize an unloaded handle produced by a lazy property load.
    pub fn load_handle(&self, handle: &mut AnyHandle) -> Result<()> {
        load_handle_impl(self, handle)
    }

    /// Cursor over all stored instances of `T` and its subclasses.
    pub fn cursor<T: Any>(&self) -> Result<ClassCursor<'_>> {
        class_cursor_impl::<T>(self)
    }

    /// Cursor over a top-level object collection with element base `T`.
    pub fn collection_cursor<T: Any>(
        &self,
        collection_id: ObjectId,
    ) -> Result<ObjectCollectionCursor<'_>> {
        let root = self
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        ObjectCollectionCursor::new(self, root, collection_id)
    }

    /// Cursor over a top-level value collection.
    pub fn value_collection_cursor<V: Scalar>(
        &self,
        collection_id: ObjectId,
    ) -> Result<ValueCollectionCursor<'_, V>> {
        ValueCollectionCursor::new(self, collection_id)
    }

    /// Load a whole object collection.
    pub fn get_collection<T: Any>(&self, collection_id: ObjectId) -> Result<Vec<AnyHandle>> {
        collection_contents_impl::<T>(self, collection_id)
    }

    /// Load a whole value collection.
    pub fn get_value_collection<V: Scalar>(&self, collection_id: ObjectId) -> Result<Vec<V>> {
        value_collection_contents_impl::<V>(self, collection_id)
    }

    /// Load an attached member collection of `host`.
    pub fn get_attached_collection<T: Any + Send + Sync>(
        &self,
        host: &Handle<T>,
        property_id: PropertyId,
    ) -> Result<Vec<AnyHandle>> {
        if host.oid() == 0 {
            return Err(Error::InvalidPointer);
        }
        let info = self
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        attached_collection_impl(self, info.class_id(), host.oid(), property_id)
    }

    /// Load a single separately-keyed (e.g. lazy) property of an object.
    pub fn load_property<T: Any + Send + Sync>(
        &self,
        object_id: ObjectId,
        obj: &mut T,
        name: &str,
    ) -> Result<()> {
        load_property_impl(self, object_id, obj, name)
    }

    /// Abort the backend transaction but keep the handles for `renew`.
    pub fn reset(&mut self) {
        self.backend = None;
        self.infos.borrow_mut().clear();
    }

    /// Reopen a fresh backend transaction after a `reset`.
    pub fn renew(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Err(Error::misuse("renew on a transaction that was not reset"));
        }
        self.backend = Some(self.store.backend().begin_read()?);
        Ok(())
    }

    /// Close the transaction. Equivalent to dropping it.
    pub fn abort(self) {}
}

impl ReadContext for ReadTransaction<'_> {
    fn registry(&self) -> &Registry {
        self.store.registry()
    }

    fn get_data(&self, key: StorageKey) -> Result<Option<Vec<u8>>> {
        Ok(self.backend_ref()?.get(key).map(|b| b.to_vec()))
    }

    fn open_class_cursor(&self, class_ids: &[ClassId]) -> Result<Box<dyn KeyCursor + '_>> {
        Ok(self.backend_ref()?.open_class_cursor(class_ids))
    }

    fn open_chunk_cursor(
        &self,
        collection_id: ObjectId,
        at_end: bool,
    ) -> Result<Box<dyn ChunkCursor + '_>> {
        Ok(self.backend_ref()?.open_chunk_cursor(collection_id, at_end))
    }

    fn collection_info(&self, collection_id: ObjectId) -> Result<CollectionInfo> {
        if let Some(info) = self.infos.borrow().get(&collection_id) {
            return Ok(info.clone());
        }
        let key = StorageKey::new(COLLECTION_INFO_CLSID, collection_id, 0);
        let bytes = self.get_data(key)?.ok_or_else(|| Error::not_found(key))?;
        let info = CollectionInfo::decode(&bytes)?;
        self.infos.borrow_mut().insert(collection_id, info.clone());
        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// Exclusive read transaction
// ---------------------------------------------------------------------------

/// Read transaction that blocks writers for its lifetime.
///
/// Required for the raw-data API, whose borrowed views point into the
/// store's own memory.
pub struct ExclusiveReadTransaction<'s> {
    inner: ReadTransaction<'s>,
}

impl<'s> ExclusiveReadTransaction<'s> {
    pub(crate) fn new(inner: ReadTransaction<'s>) -> Self {
        ExclusiveReadTransaction { inner }
    }

    /// Raw view over `length` elements of a data collection starting at
    /// `start`.
    ///
    /// Returns a borrowed slice when the range lies within one chunk and
    /// the chunk bytes are suitably aligned; an owned copy otherwise.
    /// `None` when the collection does not exist or the range is out of
    /// bounds.
    pub fn get_data_collection<T: RawValue>(
        &self,
        collection_id: ObjectId,
        start: u64,
        length: usize,
    ) -> Result<Option<CollectionData<'_, T>>> {
        let info = match self.inner.collection_info(collection_id) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let width = T::BYTE_SIZE as usize;
        let end = match start.checked_add(length as u64) {
            Some(end) if end <= info.len() => end,
            _ => return Ok(None),
        };
        if length == 0 {
            return Ok(Some(CollectionData::Owned(Vec::new())));
        }

        if let Some(chunk) = info.chunk_for(start) {
            if end <= chunk.start_index + chunk.element_count {
                let backend = self.inner.backend_ref()?;
                let key = StorageKey::new(COLLECTION_CLSID, collection_id, chunk.chunk_id);
                let bytes = backend.get(key).ok_or_else(|| Error::not_found(key))?;
                let offset = CHUNK_HEADER_SIZE + (start - chunk.start_index) as usize * width;
                let byte_end = offset + length * width;
                if byte_end > bytes.len() {
                    return Err(Error::corrupt("data chunk shorter than its element range"));
                }
                let region = &bytes[offset..byte_end];
                if region.as_ptr().align_offset(std::mem::align_of::<T>()) == 0 {
                    // SAFETY: T is a RawValue (fixed width equal to its
                    // in-memory size, no padding), the region holds exactly
                    // `length` encoded elements, and alignment was checked.
                    let slice = unsafe {
                        std::slice::from_raw_parts(region.as_ptr() as *const T, length)
                    };
                    return Ok(Some(CollectionData::Borrowed(slice)));
                }
            }
        }

        // The range spans chunks (or alignment failed): stitch a copy.
        let mut out = Vec::with_capacity(length);
        let mut index = start;
        while index < end {
            let chunk = info
                .chunk_for(index)
                .ok_or_else(|| Error::corrupt("collection metadata has an element gap"))?;
            let key = StorageKey::new(COLLECTION_CLSID, collection_id, chunk.chunk_id);
            let bytes = self
                .inner
                .get_data(key)?
                .ok_or_else(|| Error::not_found(key))?;
            let take = ((chunk.start_index + chunk.element_count).min(end) - index) as usize;
            let mut cur = ReadCursor::new(&bytes);
            cur.skip(CHUNK_HEADER_SIZE + (index - chunk.start_index) as usize * width)?;
            for _ in 0..take {
                out.push(T::decode(&mut cur)?);
            }
            index += take as u64;
        }
        Ok(Some(CollectionData::Owned(out)))
    }
}

impl<'s> std::ops::Deref for ExclusiveReadTransaction<'s> {
    type Target = ReadTransaction<'s>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::ops::DerefMut for ExclusiveReadTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for ExclusiveReadTransaction<'_> {
    fn drop(&mut self) {
        self.inner.store.exclusive_read_ended();
    }
}

// ---------------------------------------------------------------------------
// Write transaction
// ---------------------------------------------------------------------------

struct CachedInfo {
    info: CollectionInfo,
    dirty: bool,
}

/// The singleton read/write transaction.
pub struct WriteTransaction<'s> {
    pub(crate) store: &'s Store,
    backend: Option<Box<dyn WriteTxn + 's>>,
    pub(crate) buffers: BufferStack,
    infos: RefCell<HashMap<ObjectId, CachedInfo>>,
    append: bool,
    last_key: Option<StorageKey>,
    _guard: WriterGuard<'s>,
}

impl<'s> WriteTransaction<'s> {
    pub(crate) fn new(store: &'s Store, guard: WriterGuard<'s>, append: bool) -> Result<Self> {
        Ok(WriteTransaction {
            store,
            backend: Some(store.backend().begin_write(append)?),
            buffers: BufferStack::new(),
            infos: RefCell::new(HashMap::new()),
            append,
            last_key: None,
            _guard: guard,
        })
    }

    /// The store this transaction runs against.
    pub(crate) fn store(&self) -> &'s Store {
        self.store
    }

    fn backend_read(&self) -> Result<&(dyn WriteTxn + 's)> {
        self.backend.as_deref().ok_or_else(reset_error)
    }

    fn check_append_order(&self, key: StorageKey) -> Result<()> {
        if self.append {
            if let Some(last) = self.last_key {
                if key <= last {
                    return Err(Error::invalid_append(format!(
                        "key {} does not follow {} in append order",
                        key, last
                    )));
                }
            }
        }
        Ok(())
    }

    /// Store bytes under `key`, growing the backend once on `OutOfSpace`.
    pub(crate) fn put_data(&mut self, key: StorageKey, bytes: &[u8]) -> Result<()> {
        self.check_append_order(key)?;
        let store = self.store;
        let backend = self.backend.as_mut().ok_or_else(reset_error)?;
        match backend.put(key, bytes) {
            Err(Error::OutOfSpace) => {
                grow_backend(store)?;
                backend.put(key, bytes)?;
            }
            other => other?,
        }
        self.last_key = Some(key);
        Ok(())
    }

    /// Reserve a zero-filled region under `key`.
    pub(crate) fn allocate_data(&mut self, key: StorageKey, size: usize) -> Result<()> {
        self.check_append_order(key)?;
        let store = self.store;
        let backend = self.backend.as_mut().ok_or_else(reset_error)?;
        match backend.allocate(key, size) {
            Err(Error::OutOfSpace) => {
                grow_backend(store)?;
                backend.allocate(key, size)?;
            }
            other => other?,
        }
        self.last_key = Some(key);
        Ok(())
    }

    pub(crate) fn remove_data(&mut self, key: StorageKey) -> Result<bool> {
        let backend = self.backend.as_mut().ok_or_else(reset_error)?;
        Ok(backend.remove(key))
    }

    /// Put the filled prefix of the current buffer under `key`.
    pub(crate) fn put_current_buffer(&mut self, key: StorageKey) -> Result<()> {
        self.check_append_order(key)?;
        let store = self.store;
        let backend = self.backend.as_mut().ok_or_else(reset_error)?;
        let bytes = self.buffers.current().as_written();
        match backend.put(key, bytes) {
            Err(Error::OutOfSpace) => {
                grow_backend(store)?;
                backend.put(key, bytes)?;
            }
            other => other?,
        }
        self.last_key = Some(key);
        Ok(())
    }

    /// Put the whole extent of the current buffer (slack included) under
    /// `key`. Used for chunk records.
    pub(crate) fn put_chunk_from_current(&mut self, key: StorageKey) -> Result<()> {
        self.check_append_order(key)?;
        let store = self.store;
        let backend = self.backend.as_mut().ok_or_else(reset_error)?;
        let bytes = self.buffers.current().full_extent();
        match backend.put(key, bytes) {
            Err(Error::OutOfSpace) => {
                grow_backend(store)?;
                backend.put(key, bytes)?;
            }
            other => other?,
        }
        self.last_key = Some(key);
        Ok(())
    }

    // -- object operations ------------------------------------------------

    /// Serialize one object record: header, then the enabled properties.
    pub(crate) fn save_object_with(
        &mut self,
        info: &ClassInfo,
        object_id: ObjectId,
        obj: &mut dyn Any,
        prop: Option<&Property>,
        shallow: bool,
    ) -> Result<()> {
        let store = self.store;
        let payload = object::shallow_size(store.registry(), info, &*obj)?;
        let size = payload + OBJECT_HEADER_SIZE;
        self.buffers.current().start(size);
        ObjectHeader::new(info.class_id(), object_id, size as u32)
            .write(self.buffers.current())?;
        let mode = if shallow {
            StoreMode::ForceBuffer
        } else {
            StoreMode::ForceNone
        };
        object::write_object(self, info, object_id, &mut *obj, mode)?;
        if shallow {
            if let Some(prop) = prop {
                prop.storage().save(
                    self,
                    info.class_id(),
                    object_id,
                    &mut *obj,
                    prop,
                    StoreMode::ForceProperty,
                )?;
            }
        }
        let key = StorageKey::new(info.class_id(), object_id, 0);
        self.put_current_buffer(key)?;
        self.buffers.current().reset();
        Ok(())
    }

    /// Save a child value object in its own buffer, assigning an id when
    /// it has none yet.
    pub(crate) fn save_child_value(
        &mut self,
        info: &ClassInfo,
        obj: &mut dyn Any,
    ) -> Result<ObjectId> {
        let existing = info.properties().object_id_of(&*obj).unwrap_or(0);
        let oid = if existing != 0 {
            existing
        } else {
            info.next_object_id()
        };
        self.buffers.push();
        let saved = self.save_object_with(info, oid, &mut *obj, None, false);
        let popped = self.buffers.pop();
        saved?;
        popped?;
        if existing == 0 {
            info.properties().assign_object_id(obj, oid);
        }
        Ok(oid)
    }

    /// Save the object behind a polymorphic handle in its own buffer,
    /// updating the handle's identity.
    pub(crate) fn save_child_handle(&mut self, handle: &mut AnyHandle) -> Result<()> {
        let store = self.store;
        let registry = store.registry();
        let info = resolve_handle_class(registry, handle)?;
        let oid = if handle.oid != 0 {
            handle.oid
        } else {
            info.next_object_id()
        };
        self.buffers.push();
        let saved = object::with_handle_value_mut(registry, handle, |value| {
            self.save_object_with(info, oid, value, None, false)?;
            info.properties().assign_object_id(value, oid);
            Ok(())
        });
        let popped = self.buffers.pop();
        saved?;
        popped?;
        handle.class_id = info.class_id();
        handle.oid = oid;
        Ok(())
    }

    /// Put a new object, assigning it the next ObjectId of its class. The
    /// id is also stored into the object's own id mapping, if declared.
    pub fn put_object<T: Any + Send + Sync>(&mut self, obj: &mut T) -> Result<ObjectId> {
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        self.reject_complex_append(info)?;
        let oid = info.next_object_id();
        self.save_object_with(info, oid, obj, None, false)?;
        info.properties().assign_object_id(obj, oid);
        Ok(oid)
    }

    /// Rewrite an existing object under its id.
    pub fn update_object<T: Any + Send + Sync>(
        &mut self,
        object_id: ObjectId,
        obj: &mut T,
    ) -> Result<()> {
        if object_id == 0 {
            return Err(Error::InvalidPointer);
        }
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        self.save_object_with(info, object_id, obj, None, false)
    }

    /// Save a handle's object: update in place when it has an id, insert
    /// otherwise.
    pub fn save_handle<T: Any + Send + Sync + Clone>(
        &mut self,
        handle: &mut Handle<T>,
    ) -> Result<ObjectId> {
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        self.reject_complex_append(info)?;
        let oid = if handle.oid() != 0 {
            handle.oid()
        } else {
            info.next_object_id()
        };
        if std::sync::Arc::get_mut(handle.arc_mut()).is_some() {
            let value = std::sync::Arc::get_mut(handle.arc_mut())
                .expect("uniqueness checked above");
            self.save_object_with(info, oid, value, None, false)?;
            info.properties().assign_object_id(value, oid);
        } else {
            let mut value: T = handle.value().clone();
            self.save_object_with(info, oid, &mut value, None, false)?;
            info.properties().assign_object_id(&mut value, oid);
            *handle.arc_mut() = std::sync::Arc::new(value);
        }
        handle.set_oid(oid);
        Ok(oid)
    }

    /// Polymorphic save of a type-erased handle.
    pub fn save_any(&mut self, handle: &mut AnyHandle) -> Result<ObjectId> {
        if !handle.is_loaded() {
            return Err(Error::InvalidPointer);
        }
        {
            let store = self.store;
            let info = resolve_handle_class(store.registry(), handle)?;
            self.reject_complex_append(info)?;
        }
        self.save_child_handle(handle)?;
        Ok(handle.oid)
    }

    /// Delete an object: separately-keyed property records first, then the
    /// main record. A missing object reports `NotFound`.
    pub fn delete_object<T: Any + Send + Sync>(&mut self, object_id: ObjectId) -> Result<()> {
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        self.delete_by_info(info, object_id)
    }

    /// Delete the object a handle refers to.
    pub fn delete_handle(&mut self, handle: &AnyHandle) -> Result<()> {
        let store = self.store;
        let info = resolve_handle_class(store.registry(), handle)?;
        self.delete_by_info(info, handle.oid)
    }

    fn delete_by_info(&mut self, info: &ClassInfo, object_id: ObjectId) -> Result<()> {
        let key = StorageKey::new(info.class_id(), object_id, 0);
        if self.get_data(key)?.is_none() {
            return Err(Error::not_found(key));
        }
        // Every separately-keyed record of the object goes first, attached
        // collections included; the main record is removed last.
        let mut property_keys = Vec::new();
        {
            let backend = self.backend_read()?;
            let mut cursor = backend.open_property_cursor(info.class_id(), object_id);
            while let Some(k) = cursor.next() {
                property_keys.push(k);
            }
        }
        for property_key in property_keys {
            self.remove_data(property_key)?;
        }
        self.remove_data(key)?;
        Ok(())
    }

    /// Rewrite a single member of an already-persistent object.
    pub fn update_property<T: Any + Send + Sync>(
        &mut self,
        object_id: ObjectId,
        obj: &mut T,
        name: &str,
        shallow: bool,
    ) -> Result<()> {
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        let prop = property_of(info, name)?;
        if !prop.enabled() {
            return Ok(());
        }
        match prop.layout() {
            // The value has its own key; the object buffer is untouched.
            StoreLayout::SeparateProperty => prop.storage().save(
                self,
                info.class_id(),
                object_id,
                obj,
                prop,
                if shallow {
                    StoreMode::ForceBuffer
                } else {
                    StoreMode::ForceAll
                },
            ),
            // Rewrite the shallow buffer and the property's keyed side.
            StoreLayout::EmbeddedKey => self.save_object_with(info, object_id, obj, Some(prop), true),
            // Shallow buffer only.
            StoreLayout::AllEmbedded | StoreLayout::None => {
                self.save_object_with(info, object_id, obj, None, true)
            }
        }
    }

    fn reject_complex_append(&self, info: &ClassInfo) -> Result<()> {
        if self.append && info.is_complex() {
            return Err(Error::invalid_append(format!(
                "class {} references mapped objects and cannot be written in append mode",
                info.name()
            )));
        }
        Ok(())
    }

    // -- collections ------------------------------------------------------

    pub(crate) fn take_collection_info(&self, collection_id: ObjectId) -> Result<CollectionInfo> {
        if let Some(cached) = self.infos.borrow_mut().remove(&collection_id) {
            return Ok(cached.info);
        }
        let key = StorageKey::new(COLLECTION_INFO_CLSID, collection_id, 0);
        let bytes = self.get_data(key)?.ok_or_else(|| Error::not_found(key))?;
        CollectionInfo::decode(&bytes)
    }

    pub(crate) fn cache_collection_info(&self, info: CollectionInfo, dirty: bool) {
        self.infos
            .borrow_mut()
            .insert(info.collection_id, CachedInfo { info, dirty });
    }

    /// Store a new top-level object collection. Elements are serialized
    /// shallowly into chunks of the default size.
    pub fn put_collection(&mut self, items: &mut [AnyHandle]) -> Result<ObjectId> {
        let collection_id = self.store.allocate_collection_id();
        self.cache_collection_info(CollectionInfo::new(collection_id), true);
        let mut appender = ObjectCollectionAppender::new(
            self,
            collection_id,
            DEFAULT_CHUNK_SIZE,
            StoreMode::ForceBuffer,
        )?;
        for item in items.iter_mut() {
            appender.put(item)?;
        }
        appender.close()?;
        Ok(collection_id)
    }

    /// Typed variant of [`put_collection`] for value-based elements.
    ///
    /// [`put_collection`]: WriteTransaction::put_collection
    pub fn put_collection_of<T: Any + Send + Sync>(
        &mut self,
        items: &mut [T],
    ) -> Result<ObjectId> {
        let collection_id = self.store.allocate_collection_id();
        self.cache_collection_info(CollectionInfo::new(collection_id), true);
        let mut appender = ObjectCollectionAppender::new(
            self,
            collection_id,
            DEFAULT_CHUNK_SIZE,
            StoreMode::ForceBuffer,
        )?;
        for item in items.iter_mut() {
            appender.put_object(item)?;
        }
        appender.close()?;
        Ok(collection_id)
    }

    /// Append elements to an existing object collection.
    pub fn append_collection(
        &mut self,
        collection_id: ObjectId,
        items: &mut [AnyHandle],
    ) -> Result<()> {
        let mut appender = ObjectCollectionAppender::new(
            self,
            collection_id,
            DEFAULT_CHUNK_SIZE,
            StoreMode::ForceBuffer,
        )?;
        for item in items.iter_mut() {
            appender.put(item)?;
        }
        appender.close()
    }

    /// Appender for incrementally extending an object collection.
    /// Elements are saved deeply (child objects under their own keys).
    pub fn collection_appender<'w>(
        &'w mut self,
        collection_id: ObjectId,
        chunk_size: usize,
    ) -> Result<ObjectCollectionAppender<'w, 's>> {
        ObjectCollectionAppender::new(self, collection_id, chunk_size, StoreMode::ForceNone)
    }

    /// Store a new top-level value collection.
    pub fn put_value_collection<V: Scalar>(&mut self, values: &[V]) -> Result<ObjectId> {
        let collection_id = self.store.allocate_collection_id();
        self.cache_collection_info(CollectionInfo::new(collection_id), true);
        let mut appender =
            ValueCollectionAppender::<V>::new(self, collection_id, DEFAULT_CHUNK_SIZE)?;
        for value in values {
            appender.put(value)?;
        }
        appender.close()?;
        Ok(collection_id)
    }

    /// Append values to an existing value collection.
    pub fn append_value_collection<V: Scalar>(
        &mut self,
        collection_id: ObjectId,
        values: &[V],
    ) -> Result<()> {
        let mut appender =
            ValueCollectionAppender::<V>::new(self, collection_id, DEFAULT_CHUNK_SIZE)?;
        for value in values {
            appender.put(value)?;
        }
        appender.close()
    }

    /// Appender for incrementally extending a value collection.
    pub fn value_appender<'w, V: Scalar>(
        &'w mut self,
        collection_id: ObjectId,
        chunk_size: usize,
    ) -> Result<ValueCollectionAppender<'w, 's, V>> {
        ValueCollectionAppender::new(self, collection_id, chunk_size)
    }

    /// Store a new raw-data collection.
    pub fn put_data_collection<T: RawValue>(&mut self, values: &[T]) -> Result<ObjectId> {
        let collection_id = self.store.allocate_collection_id();
        self.cache_collection_info(CollectionInfo::new(collection_id), true);
        let mut appender =
            DataCollectionAppender::<T>::new(self, collection_id, DEFAULT_CHUNK_SIZE)?;
        appender.put_slice(values)?;
        appender.close()?;
        Ok(collection_id)
    }

    /// Append raw data to an existing data collection.
    pub fn append_data_collection<T: RawValue>(
        &mut self,
        collection_id: ObjectId,
        values: &[T],
    ) -> Result<()> {
        let mut appender =
            DataCollectionAppender::<T>::new(self, collection_id, DEFAULT_CHUNK_SIZE)?;
        appender.put_slice(values)?;
        appender.close()
    }

    /// Appender for incrementally extending a raw-data collection.
    pub fn data_appender<'w, T: RawValue>(
        &'w mut self,
        collection_id: ObjectId,
        chunk_size: usize,
    ) -> Result<DataCollectionAppender<'w, 's, T>> {
        DataCollectionAppender::new(self, collection_id, chunk_size)
    }

    // -- attached collections ---------------------------------------------

    /// Store an attached member collection under the host object's key
    /// namespace. Members are saved first, then the key array.
    pub fn put_attached_collection<T: Any + Send + Sync>(
        &mut self,
        host: &Handle<T>,
        property_id: PropertyId,
        items: &mut [AnyHandle],
    ) -> Result<()> {
        if host.oid() == 0 {
            return Err(Error::InvalidPointer);
        }
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        for item in items.iter_mut() {
            self.save_any(item)?;
        }
        let mut buf = WriteBuffer::new();
        buf.start(4 + items.len() * opal_core::STORAGE_KEY_SIZE);
        buf.write_u32(items.len() as u32)?;
        for item in items.iter() {
            buf.append(&StorageKey::new(item.class_id, item.oid, 0).encode())?;
        }
        self.put_data(
            StorageKey::new(info.class_id(), host.oid(), property_id),
            buf.as_written(),
        )
    }

    /// Add or remove one element of an attached member collection.
    ///
    /// Adding saves the value (assigning an id when new), appends its key
    /// and persists the rebuilt buffer; if the key is already present only
    /// the stored object is updated. Returns whether the key array
    /// changed.
    pub fn update_attached_collection<T: Any + Send + Sync>(
        &mut self,
        host: &Handle<T>,
        property_id: PropertyId,
        value: &mut AnyHandle,
        remove: bool,
    ) -> Result<bool> {
        if host.oid() == 0 {
            return Err(Error::InvalidPointer);
        }
        let store = self.store;
        let registry = store.registry();
        let info = registry.require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        let key = StorageKey::new(info.class_id(), host.oid(), property_id);

        let bytes = self.get_data(key)?.ok_or_else(|| Error::not_found(key))?;
        let mut cur = ReadCursor::new(&bytes);
        let count = cur.read_u32()?;
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            keys.push(StorageKey::decode(&mut cur)?);
        }

        let value_class = resolve_handle_class(registry, value)?.class_id();
        let position = keys
            .iter()
            .position(|k| k.class_id == value_class && k.object_id == value.oid && value.oid != 0);

        let changed = if remove {
            match position {
                Some(i) => {
                    keys.remove(i);
                    true
                }
                None => return Ok(false),
            }
        } else {
            self.save_any(value)?;
            match position {
                Some(_) => return Ok(false),
                None => {
                    keys.push(StorageKey::new(value.class_id, value.oid, 0));
                    true
                }
            }
        };

        let mut buf = WriteBuffer::new();
        buf.start(4 + keys.len() * opal_core::STORAGE_KEY_SIZE);
        buf.write_u32(keys.len() as u32)?;
        for k in &keys {
            buf.append(&k.encode())?;
        }
        self.put_data(key, buf.as_written())?;
        Ok(changed)
    }

    /// One past the highest PropertyId stored for the host object; free
    /// for use as an attached collection's property id.
    pub fn next_attached_property_id<T: Any + Send + Sync>(
        &self,
        host: &Handle<T>,
    ) -> Result<PropertyId> {
        if host.oid() == 0 {
            return Err(Error::InvalidPointer);
        }
        let store = self.store;
        let info = store
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        let declared_max = info.properties().iter().map(|p| p.id()).max().unwrap_or(1);
        let stored_next = self
            .backend_read()?
            .next_property_id(info.class_id(), host.oid());
        Ok(stored_next.max(declared_max + 1))
    }

    // -- reads inside a write transaction ----------------------------------

    pub fn load_object<T: Any + Send + Sync>(&self, object_id: ObjectId) -> Result<Option<T>> {
        load_object_impl(self, object_id)
    }

    pub fn get_object<T: Any + Send + Sync>(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<Handle<T>>> {
        get_object_impl(self, object_id)
    }

    pub fn load_handle(&self, handle: &mut AnyHandle) -> Result<()> {
        load_handle_impl(self, handle)
    }

    pub fn cursor<T: Any>(&self) -> Result<ClassCursor<'_>> {
        class_cursor_impl::<T>(self)
    }

    pub fn get_collection<T: Any>(&self, collection_id: ObjectId) -> Result<Vec<AnyHandle>> {
        collection_contents_impl::<T>(self, collection_id)
    }

    pub fn get_value_collection<V: Scalar>(&self, collection_id: ObjectId) -> Result<Vec<V>> {
        value_collection_contents_impl::<V>(self, collection_id)
    }

    pub fn get_attached_collection<T: Any + Send + Sync>(
        &self,
        host: &Handle<T>,
        property_id: PropertyId,
    ) -> Result<Vec<AnyHandle>> {
        if host.oid() == 0 {
            return Err(Error::InvalidPointer);
        }
        let info = self
            .registry()
            .require_by_token(TypeId::of::<T>(), std::any::type_name::<T>())?;
        attached_collection_impl(self, info.class_id(), host.oid(), property_id)
    }

    pub fn load_property<T: Any + Send + Sync>(
        &self,
        object_id: ObjectId,
        obj: &mut T,
        name: &str,
    ) -> Result<()> {
        load_property_impl(self, object_id, obj, name)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Commit: flush modified collection metadata, release the cache, then
    /// commit the backend transaction.
    pub fn commit(mut self) -> Result<()> {
        if !self.buffers.is_balanced() {
            return Err(Error::misuse("unbalanced buffer push/pop at commit"));
        }
        let dirty: Vec<CollectionInfo> = self
            .infos
            .borrow()
            .values()
            .filter(|c| c.dirty)
            .map(|c| c.info.clone())
            .collect();
        for info in dirty {
            self.buffers.current().start(info.encoded_size());
            info.encode_into(self.buffers.current())?;
            let key = StorageKey::new(COLLECTION_INFO_CLSID, info.collection_id, 0);
            self.put_current_buffer(key)?;
            self.buffers.current().reset();
        }
        self.infos.borrow_mut().clear();
        let backend = self.backend.take().ok_or_else(reset_error)?;
        backend
            .commit()
            .map_err(|e| Error::BackendCommit {
                message: e.to_string(),
            })
    }

    /// Roll back and close the transaction. Equivalent to dropping it.
    pub fn abort(self) {}

    /// Roll back the backend transaction but keep the handles alive.
    pub fn reset(&mut self) {
        self.backend = None;
        self.infos.borrow_mut().clear();
        self.buffers = BufferStack::new();
        self.last_key = None;
    }

    /// Reopen a fresh backend transaction after a `reset`.
    pub fn renew(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Err(Error::misuse("renew on a transaction that was not reset"));
        }
        self.backend = Some(self.store.backend().begin_write(self.append)?);
        Ok(())
    }
}

fn grow_backend(store: &Store) -> Result<()> {
    let increment = store.backend().options().increase_map_size_kb as u64;
    debug!(increment_kb = increment, "backend out of space, growing");
    store.backend().grow(increment)
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.backend.is_some() {
            debug!("write transaction dropped without commit; rolling back");
        }
    }
}

impl ReadContext for WriteTransaction<'_> {
    fn registry(&self) -> &Registry {
        self.store.registry()
    }

    fn get_data(&self, key: StorageKey) -> Result<Option<Vec<u8>>> {
        Ok(self.backend_read()?.get(key).map(|b| b.to_vec()))
    }

    fn open_class_cursor(&self, class_ids: &[ClassId]) -> Result<Box<dyn KeyCursor + '_>> {
        Ok(self.backend_read()?.open_class_cursor(class_ids))
    }

    fn open_chunk_cursor(
        &self,
        collection_id: ObjectId,
        at_end: bool,
    ) -> Result<Box<dyn ChunkCursor + '_>> {
        Ok(self.backend_read()?.open_chunk_cursor(collection_id, at_end))
    }

    fn collection_info(&self, collection_id: ObjectId) -> Result<CollectionInfo> {
        if let Some(cached) = self.infos.borrow().get(&collection_id) {
            return Ok(cached.info.clone());
        }
        let key = StorageKey::new(COLLECTION_INFO_CLSID, collection_id, 0);
        let bytes = self.get_data(key)?.ok_or_else(|| Error::not_found(key))?;
        let info = CollectionInfo::decode(&bytes)?;
        self.cache_collection_info(info.clone(), false);
        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// Class cursor
// ---------------------------------------------------------------------------

/// Cursor over all stored instances of a class subtree.
///
/// Elements whose exact class is unknown to this process fall back to the
/// substitute registered under the root class; without one they are
/// skipped.
pub struct ClassCursor<'t> {
    ctx: &'t dyn ReadContext,
    cursor: Box<dyn KeyCursor + 't>,
    root: &'t ClassInfo,
    current: Option<(StorageKey, Vec<u8>, &'t ClassInfo)>,
}

impl<'t> ClassCursor<'t> {
    /// Advance to the next instance and load it.
    pub fn next(&mut self) -> Result<Option<AnyHandle>> {
        loop {
            let Some(key) = self.cursor.next() else {
                self.current = None;
                return Ok(None);
            };
            let bytes = self.cursor.value().to_vec();
            let registry = self.ctx.registry();

            if let Ok(info) = registry.class_by_id(key.class_id) {
                let mut cur = ReadCursor::new(&bytes);
                let header = ObjectHeader::read(&mut cur)?;
                if header.class_id != key.class_id {
                    return Err(Error::corrupt(format!(
                        "record {} carries class id {} in its header",
                        key, header.class_id
                    )));
                }
                let mut boxed = (info.factory())();
                object::read_object_into(
                    self.ctx,
                    &mut cur,
                    info,
                    key.class_id,
                    key.object_id,
                    boxed.as_mut(),
                    StoreMode::ForceNone,
                )?;
                self.current = Some((key, bytes, info));
                return Ok(Some(AnyHandle::loaded(
                    boxed.into(),
                    key.class_id,
                    key.object_id,
                )));
            }
            if let Some((sub_info, mut substitute)) = registry.make_substitute(self.root.class_id())
            {
                let mut cur = ReadCursor::new(&bytes);
                ObjectHeader::read(&mut cur)?;
                object::read_object_into(
                    self.ctx,
                    &mut cur,
                    sub_info,
                    key.class_id,
                    key.object_id,
                    substitute.as_mut(),
                    StoreMode::ForceNone,
                )?;
                self.current = Some((key, bytes, sub_info));
                return Ok(Some(AnyHandle::loaded(
                    substitute.into(),
                    key.class_id,
                    key.object_id,
                )));
            }
            // Unknown class without a substitute: skip.
        }
    }

    /// Key of the current instance.
    pub fn key(&self) -> Option<StorageKey> {
        self.current.as_ref().map(|(k, _, _)| *k)
    }

    /// Raw bytes of one embedded property of the current record.
    ///
    /// The offset is derived by walking the preceding properties'
    /// buffer sizes. `None` for separately-keyed properties and before the
    /// first `next`.
    pub fn property_bytes(&self, name: &str) -> Result<Option<&[u8]>> {
        let Some((_, bytes, info)) = &self.current else {
            return Ok(None);
        };
        let registry = self.ctx.registry();
        let mut offset = OBJECT_HEADER_SIZE;
        for prop in info.properties().enabled() {
            let size = prop.storage().size_from_buffer(registry, &bytes[offset..])?;
            if prop.name() == name {
                if prop.layout() == StoreLayout::SeparateProperty {
                    return Ok(None);
                }
                return Ok(Some(&bytes[offset..offset + size]));
            }
            offset += size;
        }
        Ok(None)
    }
}
