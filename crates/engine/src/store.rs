//! The store facade.
//!
//! A [`Store`] owns a backend and the class registry. Registration happens
//! through `&mut self` before transactions open, so the borrow checker
//! enforces what the concurrency model demands: the registry is frozen
//! while any transaction is alive.
//!
//! Transaction kinds and their exclusion rules:
//!
//! - [`begin_read`]: any number, concurrent with one writer.
//! - [`begin_exclusive_read`]: blocks writers; fails with `ReadBlocked`
//!   while a write transaction is active.
//! - [`begin_write`]: singleton (later callers block on the writer lock);
//!   fails with `WriteBlocked` while an exclusive read is active.
//!
//! [`begin_read`]: Store::begin_read
//! [`begin_exclusive_read`]: Store::begin_exclusive_read
//! [`begin_write`]: Store::begin_write

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use opal_core::{
    ClassId, Error, ObjectId, PropertyId, Result, StorageKey, CLASS_META_CLSID,
    COLLECTION_INFO_CLSID,
};
use opal_storage::{Backend, BackendOptions, MemoryBackend, ReadOps, WriteTxn};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::handle::Handle;
use crate::registry::{
    decode_class_meta, encode_class_meta, ClassSpec, PersistedClass, PropertyMetaInfo, Registry,
};
use crate::transaction::{ExclusiveReadTransaction, ReadTransaction, WriteTransaction};

/// Resets the store's writer flag when the write transaction ends.
pub(crate) struct WriterGuard<'s> {
    store: &'s Store,
    _lock: MutexGuard<'s, ()>,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.store.write_active.store(false, Ordering::SeqCst);
    }
}

/// An object store over an ordered key/value backend.
pub struct Store {
    backend: Arc<dyn Backend>,
    registry: Registry,
    max_collection_id: AtomicU64,
    write_lock: Mutex<()>,
    write_active: AtomicBool,
    exclusive_reads: AtomicUsize,
}

impl Store {
    /// Open a store over the given backend, scanning the persisted class
    /// schemas and the collection id generator.
    pub fn open(backend: Arc<dyn Backend>) -> Result<Self> {
        let mut registry = Registry::new();
        let max_collection_id;
        {
            let txn = backend.begin_read()?;
            let mut cursor = txn.open_class_cursor(&[CLASS_META_CLSID]);
            while cursor.next().is_some() {
                let (name, persisted) = decode_class_meta(cursor.value())?;
                registry.add_persisted(name, persisted);
            }
            max_collection_id = txn.last_object_id(COLLECTION_INFO_CLSID);
        }
        debug!(max_collection_id, "opened store");
        Ok(Store {
            backend,
            registry,
            max_collection_id: AtomicU64::new(max_collection_id),
            write_lock: Mutex::new(()),
            write_active: AtomicBool::new(false),
            exclusive_reads: AtomicUsize::new(0),
        })
    }

    /// Open a store over a fresh in-memory backend.
    pub fn open_in_memory(options: BackendOptions) -> Result<Self> {
        Store::open(Arc::new(MemoryBackend::new(options)))
    }

    /// Register a mapped type.
    ///
    /// The first registration in a store's lifetime assigns a ClassId and
    /// persists the property table as the class schema. Later openings
    /// adopt the persisted ids and check compatibility: a changed property
    /// type is `IncompatibleSchema`, a live property missing from the
    /// schema is disabled, a persisted property missing from the live
    /// mapping is tolerated as opaque. Registering the same type twice is
    /// a no-op returning the existing id.
    pub fn register<T: Any + Send + Sync>(&mut self, spec: ClassSpec<T>) -> Result<ClassId> {
        let token = TypeId::of::<T>();
        if let Some(existing) = self.registry.class_by_token(token) {
            return Ok(existing.class_id());
        }

        let ClassSpec {
            name,
            mut props,
            extends,
            factory,
            clone_fn,
            _marker,
        } = spec;

        let class_id = match self.registry.persisted(name).cloned() {
            Some(persisted) => {
                for meta in &persisted.properties {
                    if let Some(live) = props.iter_mut().find(|p| p.name == meta.name) {
                        if !meta.matches(&live.ptype) {
                            return Err(Error::IncompatibleSchema {
                                class_name: name.to_string(),
                                property: meta.name.clone(),
                            });
                        }
                        live.id = meta.id;
                    }
                    // Persisted-only properties stay opaque on disk.
                }
                let mut next_id = persisted
                    .properties
                    .iter()
                    .map(|m| m.id)
                    .max()
                    .unwrap_or(1)
                    + 1;
                for live in props.iter_mut() {
                    if live.id == 0 {
                        live.enabled = false;
                        live.id = next_id;
                        next_id += 1;
                        warn!(
                            class = name,
                            property = live.name,
                            "property missing from persisted schema; disabled"
                        );
                    }
                }
                persisted.class_id
            }
            None => {
                let class_id = self.registry.allocate_class_id();
                for (index, prop) in props.iter_mut().enumerate() {
                    prop.id = 2 + index as PropertyId;
                }
                let metas: Vec<PropertyMetaInfo> =
                    props.iter().map(PropertyMetaInfo::from_property).collect();
                let bytes = encode_class_meta(name, class_id, &metas)?;
                {
                    let key = StorageKey::new(CLASS_META_CLSID, class_id as ObjectId, 0);
                    let mut txn = self.backend.begin_write(false)?;
                    match txn.put(key, &bytes) {
                        Err(Error::OutOfSpace) => {
                            self.backend
                                .grow(self.backend.options().increase_map_size_kb as u64)?;
                            txn.put(key, &bytes)?;
                        }
                        other => other?,
                    }
                    txn.commit()?;
                }
                self.registry.add_persisted(
                    name.to_string(),
                    PersistedClass {
                        class_id,
                        properties: metas,
                    },
                );
                class_id
            }
        };

        for prop in props.iter_mut() {
            prop.class_id = class_id;
        }

        let max_object_id = self.backend.begin_read()?.last_object_id(class_id);
        let info = Registry::build_class_info::<T>(
            name,
            class_id,
            max_object_id,
            factory,
            clone_fn,
            props,
        );
        let index = self.registry.len();
        self.registry.insert(info);
        for (super_token, super_name) in extends {
            self.registry.link_subclass(super_token, super_name, index)?;
        }
        debug!(class = name, class_id, max_object_id, "registered class");
        Ok(class_id)
    }

    /// Register `S` as the substitute instantiated when the store meets an
    /// object whose class is unknown but descends from `Base`.
    ///
    /// The substitute must not itself be a mapped class. Its spec binds
    /// `Base`'s property prefix to `S`'s fields, so records of missing
    /// subclasses can be decoded as far as the known ancestor goes; the
    /// spec is never persisted and takes no part in schema checks.
    pub fn register_substitute<Base: Any, S: Any + Send + Sync + Clone>(
        &mut self,
        spec: ClassSpec<S>,
    ) -> Result<()> {
        let base_cid = self
            .registry
            .require_by_token(TypeId::of::<Base>(), std::any::type_name::<Base>())?
            .class_id();
        if self.registry.class_by_token(TypeId::of::<S>()).is_some() {
            return Err(Error::internal(
                "a substitute type must not be a mapped class",
            ));
        }
        let ClassSpec {
            name,
            mut props,
            factory,
            clone_fn,
            extends: _,
            _marker,
        } = spec;
        for (index, prop) in props.iter_mut().enumerate() {
            prop.id = 2 + index as PropertyId;
            prop.class_id = base_cid;
        }
        let info = Registry::build_class_info::<S>(name, 0, 0, factory, clone_fn, props);
        self.registry.set_substitute(base_cid, info)
    }

    /// Begin a read transaction.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>> {
        ReadTransaction::new(self)
    }

    /// Begin an exclusive read transaction, which blocks writers.
    pub fn begin_exclusive_read(&self) -> Result<ExclusiveReadTransaction<'_>> {
        if self.write_active.load(Ordering::SeqCst) {
            return Err(Error::ReadBlocked);
        }
        self.exclusive_reads.fetch_add(1, Ordering::SeqCst);
        match ReadTransaction::new(self) {
            Ok(inner) => Ok(ExclusiveReadTransaction::new(inner)),
            Err(err) => {
                self.exclusive_reads.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Begin the write transaction. Blocks while another write transaction
    /// is active in this process.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        self.begin_write_with(false, 0)
    }

    /// Begin a write transaction in append mode: keys must be written in
    /// strictly increasing order and complex objects are rejected, which
    /// lets the backend skip rebalancing on the hot path.
    pub fn begin_append_write(&self) -> Result<WriteTransaction<'_>> {
        self.begin_write_with(true, 0)
    }

    /// Begin a write transaction, reserving `needs_kb` kilobytes of
    /// backend space up front.
    pub fn begin_write_with(&self, append: bool, needs_kb: u32) -> Result<WriteTransaction<'_>> {
        let lock = self.write_lock.lock();
        if self.exclusive_reads.load(Ordering::SeqCst) > 0 {
            return Err(Error::WriteBlocked);
        }
        self.write_active.store(true, Ordering::SeqCst);
        let guard = WriterGuard { store: self, _lock: lock };
        if needs_kb > 0 {
            self.backend.grow(needs_kb as u64)?;
        }
        WriteTransaction::new(self, guard, append)
    }

    /// The registry of mapped classes.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The ObjectId the store assigned to `obj`, through its object-id
    /// mapping. `Some(0)` means "mapped but not yet persisted".
    pub fn object_id_of<T: Any + Send + Sync>(&self, obj: &T) -> Option<ObjectId> {
        self.registry
            .class_by_token(TypeId::of::<T>())?
            .properties()
            .object_id_of(obj)
    }

    /// Whether a handle has not been persisted yet.
    pub fn is_new<T>(&self, handle: &Handle<T>) -> bool {
        handle.is_new()
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn allocate_collection_id(&self) -> ObjectId {
        self.max_collection_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn exclusive_read_ended(&self) {
        self.exclusive_reads.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("registry", &self.registry)
            .field("write_active", &self.write_active.load(Ordering::SeqCst))
            .finish()
    }
}
