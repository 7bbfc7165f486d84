//! Identifier types, reserved ids and on-disk constants.
//!
//! The store addresses every record by a composite key of three dense,
//! allocator-assigned identifier axes. The value `0` is reserved as the
//! "not assigned" sentinel on all three axes.

use serde::{Deserialize, Serialize};

use crate::codec::ReadCursor;
use crate::error::Result;

/// Identifies a registered class. Dense, assigned by the registry.
pub type ClassId = u32;

/// Identifies an object within its class. Allocated strictly increasing
/// from 1 per class.
pub type ObjectId = u64;

/// Identifies a property within a class, or a chunk within a collection.
pub type PropertyId = u16;

/// ClassId of chunk records of top-level collections.
pub const COLLECTION_CLSID: ClassId = 1;

/// ClassId of persisted collection metadata records.
pub const COLLECTION_INFO_CLSID: ClassId = 2;

/// ClassId of persisted per-class schema records.
pub const CLASS_META_CLSID: ClassId = 3;

/// First ClassId available to user classes. Ids below are reserved.
pub const MIN_USER_CLSID: ClassId = 10;

/// Encoded width of a [`ClassId`].
pub const CLASS_ID_SIZE: usize = 4;

/// Encoded width of an [`ObjectId`].
pub const OBJECT_ID_SIZE: usize = 8;

/// Encoded width of a [`PropertyId`].
pub const PROPERTY_ID_SIZE: usize = 2;

/// Encoded width of a [`StorageKey`]: ClassId + ObjectId + PropertyId.
pub const STORAGE_KEY_SIZE: usize = CLASS_ID_SIZE + OBJECT_ID_SIZE + PROPERTY_ID_SIZE;

/// Encoded width of an object record header: ClassId + ObjectId + size hint.
pub const OBJECT_HEADER_SIZE: usize = CLASS_ID_SIZE + OBJECT_ID_SIZE + 4;

/// Encoded width of a chunk header: data size + start index + element count.
pub const CHUNK_HEADER_SIZE: usize = 12;

/// Default capacity of a collection chunk, header included.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Composite key addressing one record in the backing key/value store.
///
/// Keys order class-major, then by object, then by property, which is what
/// the polymorphic class cursor relies on. The same triple doubles as the
/// 14-byte cross-reference embedded inside object records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
    pub class_id: ClassId,
    pub object_id: ObjectId,
    pub property_id: PropertyId,
}

impl StorageKey {
    pub const fn new(class_id: ClassId, object_id: ObjectId, property_id: PropertyId) -> Self {
        StorageKey {
            class_id,
            object_id,
            property_id,
        }
    }

    /// Serialize to the fixed 14-byte little-endian wire form.
    pub fn encode(&self) -> [u8; STORAGE_KEY_SIZE] {
        let mut out = [0u8; STORAGE_KEY_SIZE];
        out[0..4].copy_from_slice(&self.class_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.object_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.property_id.to_le_bytes());
        out
    }

    /// Read a key from a cursor, advancing it by 14 bytes.
    pub fn decode(cur: &mut ReadCursor<'_>) -> Result<Self> {
        let class_id = cur.read_u32()?;
        let object_id = cur.read_u64()?;
        let property_id = cur.read_u16()?;
        Ok(StorageKey {
            class_id,
            object_id,
            property_id,
        })
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.class_id, self.object_id, self.property_id)
    }
}

/// How a property's value is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLayout {
    /// The value bytes live inline in the owning object's record.
    AllEmbedded,
    /// The value is stored under its own key; a 14-byte cross-reference
    /// lives inline in the owning object's record.
    EmbeddedKey,
    /// The value is stored under a property key of the owning object,
    /// with nothing inline.
    SeparateProperty,
    /// The property does not occupy storage (e.g. the object-id mapping).
    None,
}

/// Selects which side of a split mapping a save or load executes.
///
/// Whole-object saves run with [`StoreMode::ForceNone`]; shallow saves used
/// when composing a child record inside a parent's buffer run with
/// [`StoreMode::ForceBuffer`], which suppresses all separately-keyed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Default behavior: lazy mappings skip their separately-keyed side.
    #[default]
    ForceNone,
    /// Execute both the inline and the separately-keyed side.
    ForceAll,
    /// Only the inline side.
    ForceBuffer,
    /// Only the separately-keyed side.
    ForceProperty,
}

/// Describes the persisted type of a mapped property.
///
/// `byte_size == 0` means variable length (strings). `class_name` is present
/// iff the property refers to a mapped object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyType {
    pub base_type_id: u32,
    pub is_vector: bool,
    pub byte_size: u16,
    pub class_name: Option<String>,
}

impl PropertyType {
    /// A scalar base type.
    pub fn base(base_type_id: u32, byte_size: u16) -> Self {
        PropertyType {
            base_type_id,
            is_vector: false,
            byte_size,
            class_name: None,
        }
    }

    /// A vector of a scalar base type.
    pub fn base_vector(base_type_id: u32, byte_size: u16) -> Self {
        PropertyType {
            base_type_id,
            is_vector: true,
            byte_size,
            class_name: None,
        }
    }

    /// A reference to a mapped object type.
    pub fn object(class_name: &str) -> Self {
        PropertyType {
            base_type_id: 0,
            is_vector: false,
            byte_size: STORAGE_KEY_SIZE as u16,
            class_name: Some(class_name.to_string()),
        }
    }

    /// A vector of references to a mapped object type.
    pub fn object_vector(class_name: &str) -> Self {
        PropertyType {
            base_type_id: 0,
            is_vector: true,
            byte_size: STORAGE_KEY_SIZE as u16,
            class_name: Some(class_name.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_encode_layout() {
        let key = StorageKey::new(10, 1, 0);
        let bytes = key.encode();
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[0..4], &[0x0A, 0, 0, 0]);
        assert_eq!(&bytes[4..12], &[0x01, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[12..14], &[0, 0]);
    }

    #[test]
    fn test_storage_key_roundtrip() {
        let key = StorageKey::new(0xAABBCCDD, 0x1122334455667788, 0x99AA);
        let bytes = key.encode();
        let mut cur = ReadCursor::new(&bytes);
        let back = StorageKey::decode(&mut cur).unwrap();
        assert_eq!(back, key);
        assert!(cur.at_end());
    }

    #[test]
    fn test_storage_key_ordering_is_class_major() {
        let a = StorageKey::new(1, 99, 99);
        let b = StorageKey::new(2, 0, 0);
        let c = StorageKey::new(2, 0, 1);
        let d = StorageKey::new(2, 1, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_reserved_ids() {
        assert_eq!(COLLECTION_CLSID, 1);
        assert_eq!(COLLECTION_INFO_CLSID, 2);
        assert!(CLASS_META_CLSID < MIN_USER_CLSID);
        assert_eq!(MIN_USER_CLSID, 10);
    }
}
