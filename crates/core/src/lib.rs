//! Core building blocks for the opal object store.
//!
//! This crate holds everything the engine and the storage backends agree on:
//! the identifier axes ([`ClassId`], [`ObjectId`], [`PropertyId`]) and their
//! composite [`StorageKey`], the little-endian byte codec with its read and
//! write cursors, the write-buffer stack used for nested serialization, the
//! object/chunk record headers, and the unified [`Error`] type.
//!
//! Nothing in here performs I/O. All persistence goes through the backend
//! adapter in `opal-storage` and the engine in `opal-engine`.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod record;
pub mod types;

pub use buffer::BufferStack;
pub use codec::{read_integer, write_integer, RawValue, ReadCursor, Scalar, WriteBuffer};
pub use error::{Error, Result};
pub use record::{ChunkHeader, ObjectHeader};
pub use types::{
    ClassId, ObjectId, PropertyId, PropertyType, StorageKey, StoreLayout, StoreMode,
    CHUNK_HEADER_SIZE, CLASS_META_CLSID, COLLECTION_CLSID, COLLECTION_INFO_CLSID,
    DEFAULT_CHUNK_SIZE, MIN_USER_CLSID, OBJECT_HEADER_SIZE, STORAGE_KEY_SIZE,
};
