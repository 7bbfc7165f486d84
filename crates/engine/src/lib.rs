//! Engine of the opal object store.
//!
//! Maps statically-typed application objects and collections of such
//! objects onto a flat, ordered key/value namespace:
//!
//! - [`registry`] — class identity, property metadata, inheritance graph,
//!   schema compatibility, substitutes.
//! - [`property`] — the storage strategies binding an in-memory property
//!   to its on-disk layout.
//! - [`collection`] — chunked sequences with cursors and appenders.
//! - [`transaction`] — read, exclusive-read and write transactions.
//! - [`store`] — the [`Store`] facade tying it all together.
//!
//! # Quick start
//!
//! ```no_run
//! use opal_engine::{ClassSpec, Store};
//! use opal_storage::BackendOptions;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Point {
//!     id: u64,
//!     x: i32,
//!     y: i32,
//! }
//!
//! fn main() -> opal_core::Result<()> {
//!     let mut store = Store::open_in_memory(BackendOptions::default())?;
//!     store.register(
//!         ClassSpec::<Point>::new("Point")
//!             .object_id(|p| p.id, |p, id| p.id = id)
//!             .scalar("x", |p| p.x, |p, v| p.x = v)
//!             .scalar("y", |p| p.y, |p, v| p.y = v),
//!     )?;
//!
//!     let mut txn = store.begin_write()?;
//!     let mut point = Point { id: 0, x: 3, y: -5 };
//!     let oid = txn.put_object(&mut point)?;
//!     txn.commit()?;
//!
//!     let txn = store.begin_read()?;
//!     assert_eq!(txn.load_object::<Point>(oid)?, Some(point));
//!     Ok(())
//! }
//! ```

pub mod collection;
pub mod handle;
mod object;
pub mod property;
pub mod registry;
pub mod store;
pub mod transaction;

pub use collection::{
    ChunkInfo, CollectionData, CollectionInfo, DataCollectionAppender, ObjectCollectionAppender,
    ObjectCollectionCursor, ValueCollectionAppender, ValueCollectionCursor,
};
pub use handle::{AnyHandle, Handle};
pub use registry::{ClassInfo, ClassSpec, Property, PropertyMetaInfo, Registry};
pub use store::Store;
pub use transaction::{
    ClassCursor, ExclusiveReadTransaction, ReadContext, ReadTransaction, WriteTransaction,
};

pub use opal_core::{
    ClassId, Error, ObjectId, PropertyId, RawValue, Result, Scalar, StorageKey, StoreLayout,
    StoreMode, CHUNK_HEADER_SIZE, COLLECTION_CLSID, COLLECTION_INFO_CLSID, DEFAULT_CHUNK_SIZE,
    MIN_USER_CLSID, OBJECT_HEADER_SIZE, STORAGE_KEY_SIZE,
};
pub use opal_storage::{Backend, BackendOptions, MemoryBackend};
