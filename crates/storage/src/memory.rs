//! Ordered in-memory backend with snapshot reads.
//!
//! Values live in a `BTreeMap` keyed directly on [`StorageKey`], whose
//! derived ordering is the class-major composite order the adapter contract
//! requires. Read transactions clone the tree (values are shared `Arc`s, so
//! the clone is structural); the single write transaction stages a private
//! copy and swaps it in atomically on commit. Readers therefore observe
//! either all of a transaction or none of it.
//!
//! The backend enforces a map-size budget so the engine's
//! `OutOfSpace`-resize-retry path is honest: every stored entry is charged
//! its key and value bytes against `initial_map_size_mb`, and [`grow`]
//! raises the budget by the configured increment.
//!
//! [`grow`]: MemoryBackend::grow

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use opal_core::{
    ClassId, Error, ObjectId, PropertyId, Result, StorageKey, COLLECTION_CLSID,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::backend::{Backend, ChunkCursor, KeyCursor, ReadOps, ReadTxn, WriteTxn};
use crate::options::BackendOptions;

type Value = Arc<[u8]>;
type Map = BTreeMap<StorageKey, Value>;

#[derive(Default)]
struct State {
    map: Map,
    bytes_used: u64,
}

/// In-memory backend implementing the full adapter contract.
pub struct MemoryBackend {
    options: BackendOptions,
    state: RwLock<State>,
    map_size: AtomicU64,
    write_gate: Mutex<()>,
}

impl MemoryBackend {
    pub fn new(options: BackendOptions) -> Self {
        let map_size = options.initial_map_size_mb as u64 * 1024 * 1024;
        MemoryBackend {
            options,
            state: RwLock::new(State::default()),
            map_size: AtomicU64::new(map_size),
            write_gate: Mutex::new(()),
        }
    }

    /// Bytes charged for one entry.
    fn entry_cost(value_len: usize) -> u64 {
        (opal_core::STORAGE_KEY_SIZE + value_len) as u64
    }

    fn free_space(&self) -> u64 {
        let used = self.state.read().bytes_used;
        self.map_size.load(Ordering::SeqCst).saturating_sub(used)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new(BackendOptions::default())
    }
}

impl Backend for MemoryBackend {
    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        let snapshot = self.state.read().map.clone();
        Ok(Box::new(MemoryReadTxn { snapshot }))
    }

    fn begin_write(&self, append: bool) -> Result<Box<dyn WriteTxn + '_>> {
        // Resize up front when the transaction would start below the
        // configured free-space threshold.
        let threshold = self.options.min_transaction_space_kb as u64 * 1024;
        if self.free_space() < threshold {
            self.grow(self.options.increase_map_size_kb as u64)?;
        }

        let gate = self.write_gate.lock();
        let state = self.state.read();
        Ok(Box::new(MemoryWriteTxn {
            backend: self,
            _gate: gate,
            staged: state.map.clone(),
            bytes_used: state.bytes_used,
            append,
        }))
    }

    fn grow(&self, additional_kb: u64) -> Result<()> {
        let added = additional_kb * 1024;
        let new_size = self.map_size.fetch_add(added, Ordering::SeqCst) + added;
        debug!(new_size, "grew backend map");
        Ok(())
    }

    fn options(&self) -> &BackendOptions {
        &self.options
    }
}

struct MemoryReadTxn {
    snapshot: Map,
}

impl ReadOps for MemoryReadTxn {
    fn get(&self, key: StorageKey) -> Option<&[u8]> {
        map_get(&self.snapshot, key)
    }

    fn open_class_cursor(&self, class_ids: &[ClassId]) -> Box<dyn KeyCursor + '_> {
        Box::new(class_cursor(&self.snapshot, class_ids))
    }

    fn open_property_cursor(
        &self,
        class_id: ClassId,
        object_id: ObjectId,
    ) -> Box<dyn KeyCursor + '_> {
        Box::new(property_cursor(&self.snapshot, class_id, object_id))
    }

    fn open_chunk_cursor(&self, collection_id: ObjectId, at_end: bool) -> Box<dyn ChunkCursor + '_> {
        Box::new(chunk_cursor(&self.snapshot, collection_id, at_end))
    }

    fn next_property_id(&self, class_id: ClassId, object_id: ObjectId) -> PropertyId {
        map_next_property_id(&self.snapshot, class_id, object_id)
    }

    fn last_object_id(&self, class_id: ClassId) -> ObjectId {
        map_last_object_id(&self.snapshot, class_id)
    }
}

impl ReadTxn for MemoryReadTxn {}

struct MemoryWriteTxn<'b> {
    backend: &'b MemoryBackend,
    _gate: MutexGuard<'b, ()>,
    staged: Map,
    bytes_used: u64,
    #[allow(dead_code)]
    append: bool,
}

impl MemoryWriteTxn<'_> {
    fn charge(&mut self, key: StorageKey, new_len: usize) -> Result<()> {
        let old = self.staged.get(&key).map(|v| MemoryBackend::entry_cost(v.len()));
        let new_used =
            self.bytes_used - old.unwrap_or(0) + MemoryBackend::entry_cost(new_len);
        if new_used > self.backend.map_size.load(Ordering::SeqCst) {
            return Err(Error::OutOfSpace);
        }
        self.bytes_used = new_used;
        Ok(())
    }
}

impl ReadOps for MemoryWriteTxn<'_> {
    fn get(&self, key: StorageKey) -> Option<&[u8]> {
        map_get(&self.staged, key)
    }

    fn open_class_cursor(&self, class_ids: &[ClassId]) -> Box<dyn KeyCursor + '_> {
        Box::new(class_cursor(&self.staged, class_ids))
    }

    fn open_property_cursor(
        &self,
        class_id: ClassId,
        object_id: ObjectId,
    ) -> Box<dyn KeyCursor + '_> {
        Box::new(property_cursor(&self.staged, class_id, object_id))
    }

    fn open_chunk_cursor(&self, collection_id: ObjectId, at_end: bool) -> Box<dyn ChunkCursor + '_> {
        Box::new(chunk_cursor(&self.staged, collection_id, at_end))
    }

    fn next_property_id(&self, class_id: ClassId, object_id: ObjectId) -> PropertyId {
        map_next_property_id(&self.staged, class_id, object_id)
    }

    fn last_object_id(&self, class_id: ClassId) -> ObjectId {
        map_last_object_id(&self.staged, class_id)
    }
}

impl WriteTxn for MemoryWriteTxn<'_> {
    fn put(&mut self, key: StorageKey, value: &[u8]) -> Result<()> {
        self.charge(key, value.len())?;
        self.staged.insert(key, Arc::from(value));
        Ok(())
    }

    fn allocate(&mut self, key: StorageKey, size: usize) -> Result<()> {
        self.charge(key, size)?;
        self.staged.insert(key, Arc::from(vec![0u8; size]));
        Ok(())
    }

    fn remove(&mut self, key: StorageKey) -> bool {
        match self.staged.remove(&key) {
            Some(v) => {
                self.bytes_used -= MemoryBackend::entry_cost(v.len());
                true
            }
            None => false,
        }
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.backend.state.write();
        state.map = self.staged;
        state.bytes_used = self.bytes_used;
        Ok(())
    }
}

fn map_get(map: &Map, key: StorageKey) -> Option<&[u8]> {
    map.get(&key).map(|v| &v[..])
}

fn map_next_property_id(map: &Map, class_id: ClassId, object_id: ObjectId) -> PropertyId {
    let lo = StorageKey::new(class_id, object_id, 0);
    let hi = StorageKey::new(class_id, object_id, PropertyId::MAX);
    let max = map
        .range(lo..=hi)
        .next_back()
        .map(|(k, _)| k.property_id)
        .unwrap_or(0);
    max.max(1) + 1
}

fn map_last_object_id(map: &Map, class_id: ClassId) -> ObjectId {
    let lo = StorageKey::new(class_id, 0, 0);
    let hi = StorageKey::new(class_id, ObjectId::MAX, PropertyId::MAX);
    map.range(lo..=hi)
        .next_back()
        .map(|(k, _)| k.object_id)
        .unwrap_or(0)
}

struct VecKeyCursor {
    entries: Vec<(StorageKey, Value)>,
    /// Index of the current entry; `entries.len()` means "before first"
    /// until the initial `next`.
    pos: Option<usize>,
}

impl KeyCursor for VecKeyCursor {
    fn next(&mut self) -> Option<StorageKey> {
        let next = match self.pos {
            None => 0,
            Some(i) => i + 1,
        };
        if next >= self.entries.len() {
            self.pos = Some(self.entries.len());
            return None;
        }
        self.pos = Some(next);
        Some(self.entries[next].0)
    }

    fn value(&self) -> &[u8] {
        let i = self.pos.expect("cursor not positioned");
        &self.entries[i].1
    }
}

fn class_cursor(map: &Map, class_ids: &[ClassId]) -> VecKeyCursor {
    let mut ids: Vec<ClassId> = class_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut entries = Vec::new();
    for cid in ids {
        let lo = StorageKey::new(cid, 0, 0);
        let hi = StorageKey::new(cid, ObjectId::MAX, PropertyId::MAX);
        for (k, v) in map.range(lo..=hi) {
            if k.property_id == 0 {
                entries.push((*k, v.clone()));
            }
        }
    }
    VecKeyCursor { entries, pos: None }
}

fn property_cursor(map: &Map, class_id: ClassId, object_id: ObjectId) -> VecKeyCursor {
    let lo = StorageKey::new(class_id, object_id, 1);
    let hi = StorageKey::new(class_id, object_id, PropertyId::MAX);
    let entries = map
        .range(lo..=hi)
        .map(|(k, v)| (*k, v.clone()))
        .collect();
    VecKeyCursor { entries, pos: None }
}

struct VecChunkCursor {
    chunks: Vec<(PropertyId, Value)>,
    pos: usize,
}

impl ChunkCursor for VecChunkCursor {
    fn at_end(&self) -> bool {
        self.pos >= self.chunks.len()
    }

    fn next(&mut self) -> bool {
        if self.pos < self.chunks.len() {
            self.pos += 1;
        }
        self.pos < self.chunks.len()
    }

    fn chunk_id(&self) -> PropertyId {
        self.chunks[self.pos].0
    }

    fn get(&self) -> &[u8] {
        &self.chunks[self.pos].1
    }
}

fn chunk_cursor(map: &Map, collection_id: ObjectId, at_end: bool) -> VecChunkCursor {
    let lo = StorageKey::new(COLLECTION_CLSID, collection_id, 0);
    let hi = StorageKey::new(COLLECTION_CLSID, collection_id, PropertyId::MAX);
    let chunks: Vec<(PropertyId, Value)> = map
        .range(lo..=hi)
        .map(|(k, v)| (k.property_id, v.clone()))
        .collect();
    let pos = if at_end {
        chunks.len().saturating_sub(1)
    } else {
        0
    };
    VecChunkCursor { chunks, pos }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: ClassId, o: ObjectId, p: PropertyId) -> StorageKey {
        StorageKey::new(c, o, p)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 1, 0), b"hello").unwrap();
            w.commit().unwrap();
        }
        let r = backend.begin_read().unwrap();
        assert_eq!(r.get(key(10, 1, 0)), Some(&b"hello"[..]));
        assert_eq!(r.get(key(10, 2, 0)), None);
    }

    #[test]
    fn test_snapshot_isolation() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 1, 0), b"v1").unwrap();
            w.commit().unwrap();
        }

        let r = backend.begin_read().unwrap();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 1, 0), b"v2").unwrap();
            // The writer sees its own staged state.
            assert_eq!(w.get(key(10, 1, 0)), Some(&b"v2"[..]));
            w.commit().unwrap();
        }
        // The older snapshot still sees the pre-commit value.
        assert_eq!(r.get(key(10, 1, 0)), Some(&b"v1"[..]));

        let r2 = backend.begin_read().unwrap();
        assert_eq!(r2.get(key(10, 1, 0)), Some(&b"v2"[..]));
    }

    #[test]
    fn test_abandoned_write_leaves_no_trace() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 1, 0), b"ghost").unwrap();
            // Dropped without commit.
        }
        let r = backend.begin_read().unwrap();
        assert_eq!(r.get(key(10, 1, 0)), None);
    }

    #[test]
    fn test_out_of_space_and_grow() {
        let mut options = BackendOptions::default();
        options.initial_map_size_mb = 0;
        options.min_transaction_space_kb = 0;
        let backend = MemoryBackend::new(options);

        let mut w = backend.begin_write(false).unwrap();
        let err = w.put(key(10, 1, 0), &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace));

        backend.grow(1).unwrap();
        w.put(key(10, 1, 0), &[0u8; 64]).unwrap();
        w.commit().unwrap();
    }

    #[test]
    fn test_remove_refunds_space() {
        let mut options = BackendOptions::default();
        options.initial_map_size_mb = 0;
        options.min_transaction_space_kb = 0;
        let backend = MemoryBackend::new(options);
        backend.grow(1).unwrap();

        let mut w = backend.begin_write(false).unwrap();
        w.put(key(10, 1, 0), &[0u8; 900]).unwrap();
        assert!(w.put(key(10, 2, 0), &[0u8; 900]).is_err());
        assert!(w.remove(key(10, 1, 0)));
        w.put(key(10, 2, 0), &[0u8; 900]).unwrap();
    }

    #[test]
    fn test_class_cursor_order_and_filter() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(11, 1, 0), b"b1").unwrap();
            w.put(key(10, 2, 0), b"a2").unwrap();
            w.put(key(10, 1, 0), b"a1").unwrap();
            w.put(key(10, 1, 2), b"prop").unwrap(); // not a main record
            w.put(key(12, 1, 0), b"other").unwrap(); // class not requested
            w.commit().unwrap();
        }
        let r = backend.begin_read().unwrap();
        let mut cursor = r.open_class_cursor(&[11, 10]);
        let mut seen = Vec::new();
        while let Some(k) = cursor.next() {
            seen.push((k, cursor.value().to_vec()));
        }
        assert_eq!(
            seen.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            vec![key(10, 1, 0), key(10, 2, 0), key(11, 1, 0)]
        );
        assert_eq!(seen[0].1, b"a1");
    }

    #[test]
    fn test_chunk_cursor_positions() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(COLLECTION_CLSID, 5, 1), b"c1").unwrap();
            w.put(key(COLLECTION_CLSID, 5, 2), b"c2").unwrap();
            w.put(key(COLLECTION_CLSID, 5, 3), b"c3").unwrap();
            w.commit().unwrap();
        }
        let r = backend.begin_read().unwrap();

        let mut forward = r.open_chunk_cursor(5, false);
        assert!(!forward.at_end());
        assert_eq!(forward.chunk_id(), 1);
        assert!(forward.next());
        assert_eq!(forward.chunk_id(), 2);
        assert!(forward.next());
        assert_eq!(forward.chunk_id(), 3);
        assert!(!forward.next());
        assert!(forward.at_end());

        let last = r.open_chunk_cursor(5, true);
        assert_eq!(last.chunk_id(), 3);
        assert_eq!(last.get(), b"c3");

        let empty = r.open_chunk_cursor(99, false);
        assert!(empty.at_end());
    }

    #[test]
    fn test_property_cursor_skips_main_record() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 1, 0), b"main").unwrap();
            w.put(key(10, 1, 3), b"p3").unwrap();
            w.put(key(10, 1, 7), b"p7").unwrap();
            w.put(key(10, 2, 3), b"other object").unwrap();
            w.commit().unwrap();
        }
        let r = backend.begin_read().unwrap();
        let mut cursor = r.open_property_cursor(10, 1);
        let mut seen = Vec::new();
        while let Some(k) = cursor.next() {
            seen.push(k.property_id);
        }
        assert_eq!(seen, vec![3, 7]);
    }

    #[test]
    fn test_next_property_id() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 1, 0), b"main").unwrap();
            w.put(key(10, 1, 2), b"p2").unwrap();
            w.put(key(10, 1, 5), b"p5").unwrap();
            w.commit().unwrap();
        }
        let r = backend.begin_read().unwrap();
        assert_eq!(r.next_property_id(10, 1), 6);
        assert_eq!(r.next_property_id(10, 2), 2);
    }

    #[test]
    fn test_last_object_id() {
        let backend = MemoryBackend::default();
        {
            let mut w = backend.begin_write(false).unwrap();
            w.put(key(10, 3, 0), b"x").unwrap();
            w.put(key(10, 7, 2), b"y").unwrap();
            w.put(key(11, 90, 0), b"z").unwrap();
            w.commit().unwrap();
        }
        let r = backend.begin_read().unwrap();
        assert_eq!(r.last_object_id(10), 7);
        assert_eq!(r.last_object_id(11), 90);
        assert_eq!(r.last_object_id(12), 0);
    }

    #[test]
    fn test_allocate_reserves_zeroed_region() {
        let backend = MemoryBackend::default();
        let mut w = backend.begin_write(false).unwrap();
        w.allocate(key(COLLECTION_CLSID, 1, 1), 32).unwrap();
        assert_eq!(w.get(key(COLLECTION_CLSID, 1, 1)).unwrap(), &[0u8; 32][..]);
    }
}
