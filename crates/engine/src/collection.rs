//! Chunked collection engine.
//!
//! A top-level collection stores its elements in fixed-capacity chunks
//! under `(COLLECTION, collection_id, chunk_id)` and its metadata under
//! `(COLLECTION_INFO, collection_id, 0)`. Chunk ids are assigned
//! monotonically from 1; element order within a chunk is insertion order,
//! and ascending chunk ids continue that order across chunks.
//!
//! Appending reopens the most recent chunk when it still has slack,
//! otherwise finalizes it (patching the chunk header) and allocates a
//! fresh chunk. The collection metadata is flushed to its record when the
//! owning write transaction commits.
//!
//! # CollectionInfo record
//!
//! ```text
//! ┌───────────────────┬─────────────────┬────────────────────┐
//! │ collection_id u64 │ chunk_count u32 │ chunk_count × info │
//! └───────────────────┴─────────────────┴────────────────────┘
//! info:
//! ┌──────────────┬─────────────────┬───────────────────┬───────────────┐
//! │ chunk_id u16 │ start_index u64 │ element_count u64 │ data_size u64 │
//! └──────────────┴─────────────────┴───────────────────┴───────────────┘
//! ```

use std::marker::PhantomData;

use opal_core::codec::RawValue;
use opal_core::{
    ChunkHeader, Error, ObjectHeader, ObjectId, PropertyId, ReadCursor, Result, Scalar,
    StorageKey, StoreMode, WriteBuffer, CHUNK_HEADER_SIZE, COLLECTION_CLSID, OBJECT_HEADER_SIZE,
};
use opal_storage::ChunkCursor;
use tracing::warn;

use crate::handle::AnyHandle;
use crate::object;
use crate::property::resolve_handle_class;
use crate::registry::ClassInfo;
use crate::transaction::{ReadContext, WriteTransaction};

/// Metadata of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: PropertyId,
    /// Logical index of the chunk's first element.
    pub start_index: u64,
    pub element_count: u64,
    /// Filled-region length of the chunk, header included.
    pub data_size: u64,
}

/// Metadata of one top-level collection.
///
/// `chunk_infos` is sorted by ascending chunk id; start indexes are the
/// prefix sums of the element counts, and `next_start_index` equals the
/// collection's logical length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub collection_id: ObjectId,
    pub chunk_infos: Vec<ChunkInfo>,
    pub next_chunk_id: PropertyId,
    pub next_start_index: u64,
}

impl CollectionInfo {
    pub fn new(collection_id: ObjectId) -> Self {
        CollectionInfo {
            collection_id,
            chunk_infos: Vec::new(),
            next_chunk_id: 1,
            next_start_index: 0,
        }
    }

    /// Logical number of elements.
    pub fn len(&self) -> u64 {
        self.next_start_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_start_index == 0
    }

    pub(crate) fn encoded_size(&self) -> usize {
        8 + 4 + self.chunk_infos.len() * 26
    }

    pub(crate) fn encode_into(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.write_u64(self.collection_id)?;
        buf.write_u32(self.chunk_infos.len() as u32)?;
        for chunk in &self.chunk_infos {
            buf.write_u16(chunk.chunk_id)?;
            buf.write_u64(chunk.start_index)?;
            buf.write_u64(chunk.element_count)?;
            buf.write_u64(chunk.data_size)?;
        }
        Ok(())
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(bytes);
        let collection_id = cur.read_u64()?;
        let count = cur.read_u32()?;
        let mut chunk_infos = Vec::with_capacity(count as usize);
        let mut next_chunk_id: PropertyId = 1;
        let mut next_start_index: u64 = 0;
        for _ in 0..count {
            let chunk = ChunkInfo {
                chunk_id: cur.read_u16()?,
                start_index: cur.read_u64()?,
                element_count: cur.read_u64()?,
                data_size: cur.read_u64()?,
            };
            if chunk.start_index != next_start_index {
                return Err(Error::corrupt(format!(
                    "collection {}: chunk {} starts at {}, expected prefix sum {}",
                    collection_id, chunk.chunk_id, chunk.start_index, next_start_index
                )));
            }
            next_chunk_id = next_chunk_id.max(chunk.chunk_id + 1);
            next_start_index += chunk.element_count;
            chunk_infos.push(chunk);
        }
        Ok(CollectionInfo {
            collection_id,
            chunk_infos,
            next_chunk_id,
            next_start_index,
        })
    }

    /// The chunk whose element range contains `index`.
    pub(crate) fn chunk_for(&self, index: u64) -> Option<&ChunkInfo> {
        self.chunk_infos
            .iter()
            .find(|c| index >= c.start_index && index < c.start_index + c.element_count)
    }
}

/// Raw view over the elements of a data collection.
///
/// Borrowed when the requested range lies within a single chunk of an
/// exclusive-read snapshot; owned when the range had to be stitched
/// together across chunks.
pub enum CollectionData<'a, T> {
    Borrowed(&'a [T]),
    Owned(Vec<T>),
}

impl<T> CollectionData<'_, T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            CollectionData::Borrowed(s) => s,
            CollectionData::Owned(v) => v,
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, CollectionData::Borrowed(_))
    }
}

impl<T> std::ops::Deref for CollectionData<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Start,
    InChunk,
    BetweenChunks,
    End,
}

/// Reads one element record from a chunk, resolving its class
/// polymorphically.
///
/// Unknown classes fall back to the substitute registered under `root`;
/// without one the element is skipped (`Ok(None)`), or rejected when the
/// caller asked for strict traversal. The cursor always ends up at the
/// element boundary, positioned by the header's size hint.
pub(crate) fn read_element(
    ctx: &dyn ReadContext,
    cur: &mut ReadCursor<'_>,
    root: &ClassInfo,
    strict: bool,
) -> Result<Option<AnyHandle>> {
    cur.mark();
    let header = ObjectHeader::read(cur)?;
    let registry = ctx.registry();

    let result = if registry.class_by_id(header.class_id).is_ok() {
        if registry.is_instance(root.class_id(), header.class_id) {
            let info = registry.class_by_id(header.class_id)?;
            let mut boxed = (info.factory())();
            object::read_object_into(
                ctx,
                cur,
                info,
                header.class_id,
                header.object_id,
                boxed.as_mut(),
                StoreMode::ForceNone,
            )?;
            Some(AnyHandle::loaded(
                boxed.into(),
                header.class_id,
                header.object_id,
            ))
        } else {
            // An element of a foreign hierarchy; not ours to read.
            None
        }
    } else if let Some((sub_info, mut substitute)) = registry.make_substitute(root.class_id()) {
        object::read_object_into(
            ctx,
            cur,
            sub_info,
            header.class_id,
            header.object_id,
            substitute.as_mut(),
            StoreMode::ForceNone,
        )?;
        Some(AnyHandle::loaded(
            substitute.into(),
            header.class_id,
            header.object_id,
        ))
    } else if strict {
        return Err(Error::UnknownClass(header.class_id));
    } else {
        None
    };

    cur.unmark(header.size_hint as usize)?;
    Ok(result)
}

/// Cursor over a top-level object collection.
pub struct ObjectCollectionCursor<'t> {
    ctx: &'t dyn ReadContext,
    chunks: Box<dyn ChunkCursor + 't>,
    root: &'t ClassInfo,
    strict: bool,
    chunk_data: Vec<u8>,
    pos: usize,
    element_count: u32,
    cur_element: u32,
    state: CursorState,
}

impl<'t> ObjectCollectionCursor<'t> {
    pub(crate) fn new(
        ctx: &'t dyn ReadContext,
        root: &'t ClassInfo,
        collection_id: ObjectId,
    ) -> Result<Self> {
        let chunks = ctx.open_chunk_cursor(collection_id, false)?;
        Ok(ObjectCollectionCursor {
            ctx,
            chunks,
            root,
            strict: false,
            chunk_data: Vec::new(),
            pos: 0,
            element_count: 0,
            cur_element: 0,
            state: CursorState::Start,
        })
    }

    /// Propagate `UnknownClass` instead of skipping unresolvable elements.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn load_chunk(&mut self) -> Result<()> {
        let bytes = self.chunks.get();
        let header = ChunkHeader::decode(bytes)?;
        let data_size = header.data_size as usize;
        if data_size > bytes.len() {
            return Err(Error::corrupt(format!(
                "chunk data_size {} exceeds stored length {}",
                data_size,
                bytes.len()
            )));
        }
        self.chunk_data = bytes[..data_size].to_vec();
        self.pos = CHUNK_HEADER_SIZE;
        self.element_count = header.element_count;
        self.cur_element = 0;
        Ok(())
    }

    /// Advance to the next element, or `None` past the end.
    pub fn next(&mut self) -> Result<Option<AnyHandle>> {
        loop {
            match self.state {
                CursorState::Start => {
                    if self.chunks.at_end() {
                        self.state = CursorState::End;
                    } else {
                        self.load_chunk()?;
                        self.state = CursorState::InChunk;
                    }
                }
                CursorState::InChunk => {
                    if self.cur_element >= self.element_count {
                        self.state = CursorState::BetweenChunks;
                        continue;
                    }
                    let mut cur = ReadCursor::new(&self.chunk_data);
                    cur.skip(self.pos)?;
                    let element = read_element(self.ctx, &mut cur, self.root, self.strict)?;
                    let end = cur.position();
                    self.pos = end;
                    self.cur_element += 1;
                    if let Some(handle) = element {
                        return Ok(Some(handle));
                    }
                }
                CursorState::BetweenChunks => {
                    if self.chunks.next() {
                        self.load_chunk()?;
                        self.state = CursorState::InChunk;
                    } else {
                        self.state = CursorState::End;
                    }
                }
                CursorState::End => return Ok(None),
            }
        }
    }

    pub fn at_end(&self) -> bool {
        self.state == CursorState::End
    }

    /// Index of the next element within the current chunk; resets to zero
    /// at every chunk boundary.
    pub fn element_in_chunk(&self) -> u32 {
        self.cur_element
    }

    /// Chunk id of the chunk currently being read.
    pub fn current_chunk_id(&self) -> Option<PropertyId> {
        match self.state {
            CursorState::InChunk => Some(self.chunks.chunk_id()),
            _ => None,
        }
    }
}

/// Cursor over a top-level value collection. Non-polymorphic.
pub struct ValueCollectionCursor<'t, V> {
    chunks: Box<dyn ChunkCursor + 't>,
    chunk_data: Vec<u8>,
    pos: usize,
    element_count: u32,
    cur_element: u32,
    state: CursorState,
    _marker: PhantomData<V>,
}

impl<'t, V: Scalar> ValueCollectionCursor<'t, V> {
    pub(crate) fn new(ctx: &'t dyn ReadContext, collection_id: ObjectId) -> Result<Self> {
        let chunks = ctx.open_chunk_cursor(collection_id, false)?;
        Ok(ValueCollectionCursor {
            chunks,
            chunk_data: Vec::new(),
            pos: 0,
            element_count: 0,
            cur_element: 0,
            state: CursorState::Start,
            _marker: PhantomData,
        })
    }

    fn load_chunk(&mut self) -> Result<()> {
        let bytes = self.chunks.get();
        let header = ChunkHeader::decode(bytes)?;
        let data_size = header.data_size as usize;
        if data_size > bytes.len() {
            return Err(Error::corrupt("chunk data_size exceeds stored length"));
        }
        self.chunk_data = bytes[..data_size].to_vec();
        self.pos = CHUNK_HEADER_SIZE;
        self.element_count = header.element_count;
        self.cur_element = 0;
        Ok(())
    }

    pub fn next(&mut self) -> Result<Option<V>> {
        loop {
            match self.state {
                CursorState::Start => {
                    if self.chunks.at_end() {
                        self.state = CursorState::End;
                    } else {
                        self.load_chunk()?;
                        self.state = CursorState::InChunk;
                    }
                }
                CursorState::InChunk => {
                    if self.cur_element >= self.element_count {
                        self.state = CursorState::BetweenChunks;
                        continue;
                    }
                    let mut cur = ReadCursor::new(&self.chunk_data);
                    cur.skip(self.pos)?;
                    let value = V::decode(&mut cur)?;
                    self.pos = cur.position();
                    self.cur_element += 1;
                    return Ok(Some(value));
                }
                CursorState::BetweenChunks => {
                    if self.chunks.next() {
                        self.load_chunk()?;
                        self.state = CursorState::InChunk;
                    } else {
                        self.state = CursorState::End;
                    }
                }
                CursorState::End => return Ok(None),
            }
        }
    }

    pub fn at_end(&self) -> bool {
        self.state == CursorState::End
    }
}

/// Shared chunk-filling machinery of the appenders.
///
/// The chunk under construction lives in the write transaction's current
/// buffer; nested child-object saves stack their own buffers on top of it.
pub(crate) struct ChunkWriter<'w, 's> {
    pub(crate) txn: &'w mut WriteTransaction<'s>,
    info: CollectionInfo,
    chunk_size: usize,
    chunk_open: bool,
    chunk_id: PropertyId,
    chunk_start: u64,
    count: u64,
    closed: bool,
}

impl<'w, 's> ChunkWriter<'w, 's> {
    pub(crate) fn new(
        txn: &'w mut WriteTransaction<'s>,
        collection_id: ObjectId,
        chunk_size: usize,
    ) -> Result<Self> {
        let info = txn.take_collection_info(collection_id)?;
        let chunk_start = info.next_start_index;
        let mut writer = ChunkWriter {
            txn,
            info,
            chunk_size,
            chunk_open: false,
            chunk_id: 0,
            chunk_start,
            count: 0,
            closed: false,
        };
        writer.resume_last_chunk()?;
        Ok(writer)
    }

    /// Reopen the most recent chunk when slack remains in it.
    fn resume_last_chunk(&mut self) -> Result<()> {
        let Some(last) = self.info.chunk_infos.last().cloned() else {
            return Ok(());
        };
        let probe = {
            let cursor = self
                .txn
                .open_chunk_cursor(self.info.collection_id, true)?;
            if cursor.at_end() {
                None
            } else {
                Some(cursor.get().to_vec())
            }
        };
        let Some(bytes) = probe else { return Ok(()) };
        let header = ChunkHeader::decode(&bytes)?;
        if (header.data_size as usize) >= bytes.len() {
            return Ok(());
        }
        self.info.chunk_infos.pop();
        self.txn
            .buffers
            .current()
            .start_from(&bytes, header.data_size as usize);
        self.chunk_open = true;
        self.chunk_id = last.chunk_id;
        self.chunk_start = last.start_index;
        self.count = last.element_count;
        Ok(())
    }

    pub(crate) fn available(&mut self) -> usize {
        self.txn.buffers.current().available()
    }

    /// Make room for a put of `need` bytes, rolling over to a fresh chunk
    /// when the current one cannot hold it.
    pub(crate) fn prepare_put(&mut self, need: usize) -> Result<()> {
        if !self.chunk_open {
            self.open_chunk(need)?;
        } else if self.available() < need {
            self.finalize_chunk()?;
            self.open_chunk(need)?;
        }
        Ok(())
    }

    fn open_chunk(&mut self, need: usize) -> Result<()> {
        let size = self.chunk_size.max(need + CHUNK_HEADER_SIZE);
        let chunk_id = self.info.next_chunk_id;
        self.info.next_chunk_id += 1;
        let key = StorageKey::new(COLLECTION_CLSID, self.info.collection_id, chunk_id);
        self.txn.allocate_data(key, size)?;
        let buf = self.txn.buffers.current();
        buf.start(size);
        // Header space, patched at finalize.
        buf.allocate(CHUNK_HEADER_SIZE)?;
        self.chunk_open = true;
        self.chunk_id = chunk_id;
        self.count = 0;
        Ok(())
    }

    fn finalize_chunk(&mut self) -> Result<()> {
        let data_size = self.txn.buffers.current().len();
        let header = ChunkHeader::new(data_size as u32, self.chunk_start as u32, self.count as u32);
        self.txn.buffers.current().patch(0, &header.encode())?;
        let key = StorageKey::new(COLLECTION_CLSID, self.info.collection_id, self.chunk_id);
        self.txn.put_chunk_from_current(key)?;
        self.info.chunk_infos.push(ChunkInfo {
            chunk_id: self.chunk_id,
            start_index: self.chunk_start,
            element_count: self.count,
            data_size: data_size as u64,
        });
        self.chunk_start += self.count;
        self.chunk_open = false;
        Ok(())
    }

    pub(crate) fn bump(&mut self, elements: u64) {
        self.count += elements;
    }

    /// Flush the open chunk and hand the updated metadata back to the
    /// transaction for commit.
    pub(crate) fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.chunk_open {
            self.finalize_chunk()?;
        }
        self.info.next_start_index = self.chunk_start;
        let info = std::mem::replace(&mut self.info, CollectionInfo::new(0));
        self.txn.cache_collection_info(info, true);
        self.closed = true;
        Ok(())
    }
}

impl Drop for ChunkWriter<'_, '_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                collection = self.info.collection_id,
                "collection appender dropped without close; flushing best-effort"
            );
            if let Err(err) = self.close() {
                warn!(error = %err, "appender flush on drop failed");
            }
        }
    }
}

/// Appender for sequentially extending a top-level object collection.
pub struct ObjectCollectionAppender<'w, 's> {
    writer: ChunkWriter<'w, 's>,
    mode: StoreMode,
}

impl<'w, 's> ObjectCollectionAppender<'w, 's> {
    pub(crate) fn new(
        txn: &'w mut WriteTransaction<'s>,
        collection_id: ObjectId,
        chunk_size: usize,
        mode: StoreMode,
    ) -> Result<Self> {
        Ok(ObjectCollectionAppender {
            writer: ChunkWriter::new(txn, collection_id, chunk_size)?,
            mode,
        })
    }

    /// Append one element, assigning it a fresh ObjectId within its
    /// runtime class. The handle's identity is updated in place.
    pub fn put(&mut self, handle: &mut AnyHandle) -> Result<()> {
        let store = self.writer.txn.store();
        let registry = store.registry();
        let info = resolve_handle_class(registry, handle)?;

        let value = handle.value.as_ref().ok_or(Error::InvalidPointer)?;
        let payload = object::shallow_size(registry, info, value.as_ref())?;
        let need = payload + OBJECT_HEADER_SIZE;

        self.writer.prepare_put(need)?;
        let oid = info.next_object_id();
        ObjectHeader::new(info.class_id(), oid, need as u32)
            .write(self.writer.txn.buffers.current())?;
        let mode = self.mode;
        object::with_handle_value_mut(registry, handle, |value| {
            object::write_object(self.writer.txn, info, oid, value, mode)
        })?;
        handle.class_id = info.class_id();
        handle.oid = oid;
        self.writer.bump(1);
        Ok(())
    }

    /// Typed convenience for value-based elements.
    pub fn put_object<T: std::any::Any + Send + Sync>(&mut self, obj: &mut T) -> Result<()> {
        let store = self.writer.txn.store();
        let registry = store.registry();
        let info = registry
            .require_by_token(std::any::TypeId::of::<T>(), std::any::type_name::<T>())?;

        let payload = object::shallow_size(registry, info, &*obj)?;
        let need = payload + OBJECT_HEADER_SIZE;

        self.writer.prepare_put(need)?;
        let oid = info.next_object_id();
        ObjectHeader::new(info.class_id(), oid, need as u32)
            .write(self.writer.txn.buffers.current())?;
        object::write_object(self.writer.txn, info, oid, obj, self.mode)?;
        info.properties().assign_object_id(obj, oid);
        self.writer.bump(1);
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.close()
    }
}

/// Appender for sequentially extending a top-level value collection.
pub struct ValueCollectionAppender<'w, 's, V> {
    writer: ChunkWriter<'w, 's>,
    _marker: PhantomData<V>,
}

impl<'w, 's, V: Scalar> ValueCollectionAppender<'w, 's, V> {
    pub(crate) fn new(
        txn: &'w mut WriteTransaction<'s>,
        collection_id: ObjectId,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(ValueCollectionAppender {
            writer: ChunkWriter::new(txn, collection_id, chunk_size)?,
            _marker: PhantomData,
        })
    }

    pub fn put(&mut self, value: &V) -> Result<()> {
        self.writer.prepare_put(value.encoded_size())?;
        value.encode(self.writer.txn.buffers.current())?;
        self.writer.bump(1);
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.close()
    }
}

/// Appender for raw data collections. Chunks are filled in whole
/// elements; an element never spans two chunks.
pub struct DataCollectionAppender<'w, 's, V> {
    writer: ChunkWriter<'w, 's>,
    _marker: PhantomData<V>,
}

impl<'w, 's, V: RawValue> DataCollectionAppender<'w, 's, V> {
    pub(crate) fn new(
        txn: &'w mut WriteTransaction<'s>,
        collection_id: ObjectId,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(DataCollectionAppender {
            writer: ChunkWriter::new(txn, collection_id, chunk_size)?,
            _marker: PhantomData,
        })
    }

    pub fn put_slice(&mut self, values: &[V]) -> Result<()> {
        let width = V::BYTE_SIZE as usize;
        let mut rest = values;
        while !rest.is_empty() {
            self.writer.prepare_put(width)?;
            let fit = (self.writer.available() / width).min(rest.len());
            for value in &rest[..fit] {
                value.encode(self.writer.txn.buffers.current())?;
            }
            self.writer.bump(fit as u64);
            rest = &rest[fit..];
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.close()
    }
}
