//! Object and chunk record headers.
//!
//! # Format
//!
//! ```text
//! Object record, stored under (class_id, object_id, 0):
//! ┌───────────────────────┬──────────────────────────────────────────┐
//! │ ObjectHeader (16 B)   │ property payloads in declared id order   │
//! └───────────────────────┴──────────────────────────────────────────┘
//! ObjectHeader:
//! ┌────────────────┬────────────────┬──────────────────┐
//! │ class_id  u32  │ object_id u64  │ size_hint  u32   │
//! └────────────────┴────────────────┴──────────────────┘
//!
//! Chunk record, stored under (COLLECTION, collection_id, chunk_id):
//! ┌─────────────────────┬───────────────────────────────┬──────────┐
//! │ ChunkHeader (12 B)  │ element records, concatenated │ slack    │
//! └─────────────────────┴───────────────────────────────┴──────────┘
//! ChunkHeader:
//! ┌────────────────┬──────────────────┬───────────────────┐
//! │ data_size u32  │ start_index u32  │ element_count u32 │
//! └────────────────┴──────────────────┴───────────────────┘
//! ```
//!
//! All fields little-endian. `size_hint` is the total record length, header
//! included; readers derive the exact extent from the property mappings and
//! the stored value length and treat the hint as advisory. `data_size`
//! counts the chunk's filled region including the header itself; bytes past
//! `data_size` up to the stored value length are reusable slack.

use crate::codec::{ReadCursor, WriteBuffer};
use crate::error::{Error, Result};
use crate::types::{ClassId, ObjectId, CHUNK_HEADER_SIZE};

/// Header of an object record, also used for elements inside chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub class_id: ClassId,
    pub object_id: ObjectId,
    /// Total record length as computed at save time.
    pub size_hint: u32,
}

impl ObjectHeader {
    pub fn new(class_id: ClassId, object_id: ObjectId, size_hint: u32) -> Self {
        ObjectHeader {
            class_id,
            object_id,
            size_hint,
        }
    }

    pub fn write(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.write_u32(self.class_id)?;
        buf.write_u64(self.object_id)?;
        buf.write_u32(self.size_hint)
    }

    pub fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        let class_id = cur.read_u32()?;
        let object_id = cur.read_u64()?;
        let size_hint = cur.read_u32()?;
        if class_id == 0 {
            return Err(Error::corrupt("object header with sentinel class id 0"));
        }
        Ok(ObjectHeader {
            class_id,
            object_id,
            size_hint,
        })
    }
}

/// Header of a collection chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    /// Filled-region length, header included.
    pub data_size: u32,
    /// Logical index of the chunk's first element within the collection.
    pub start_index: u32,
    /// Number of elements in the chunk.
    pub element_count: u32,
}

impl ChunkHeader {
    pub fn new(data_size: u32, start_index: u32, element_count: u32) -> Self {
        ChunkHeader {
            data_size,
            start_index,
            element_count,
        }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.data_size.to_le_bytes());
        out[4..8].copy_from_slice(&self.start_index.to_le_bytes());
        out[8..12].copy_from_slice(&self.element_count.to_le_bytes());
        out
    }

    pub fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        let data_size = cur.read_u32()?;
        let start_index = cur.read_u32()?;
        let element_count = cur.read_u32()?;
        if (data_size as usize) < CHUNK_HEADER_SIZE {
            return Err(Error::corrupt(format!(
                "chunk data_size {} smaller than its header",
                data_size
            )));
        }
        Ok(ChunkHeader {
            data_size,
            start_index,
            element_count,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(bytes);
        Self::read(&mut cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OBJECT_HEADER_SIZE;

    #[test]
    fn test_object_header_layout() {
        let mut buf = WriteBuffer::new();
        buf.start(OBJECT_HEADER_SIZE);
        ObjectHeader::new(10, 1, 24).write(&mut buf).unwrap();
        assert_eq!(
            buf.as_written(),
            &[
                0x0A, 0, 0, 0, // class id
                0x01, 0, 0, 0, 0, 0, 0, 0, // object id
                0x18, 0, 0, 0, // size hint
            ]
        );
    }

    #[test]
    fn test_object_header_roundtrip() {
        let hdr = ObjectHeader::new(77, 0xFFEE_DDCC_BBAA_0099, 4096);
        let mut buf = WriteBuffer::new();
        buf.start(OBJECT_HEADER_SIZE);
        hdr.write(&mut buf).unwrap();
        let mut cur = ReadCursor::new(buf.as_written());
        assert_eq!(ObjectHeader::read(&mut cur).unwrap(), hdr);
        assert!(cur.at_end());
    }

    #[test]
    fn test_object_header_zero_class_rejected() {
        let bytes = [0u8; OBJECT_HEADER_SIZE];
        let mut cur = ReadCursor::new(&bytes);
        assert!(ObjectHeader::read(&mut cur).is_err());
    }

    #[test]
    fn test_chunk_header_layout() {
        let hdr = ChunkHeader::new(24, 0, 3);
        assert_eq!(
            hdr.encode(),
            [0x18, 0, 0, 0, 0, 0, 0, 0, 0x03, 0, 0, 0]
        );
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let hdr = ChunkHeader::new(2048, 1000, 42);
        let back = ChunkHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn test_chunk_header_undersized_rejected() {
        let hdr = ChunkHeader::new(4, 0, 0);
        assert!(ChunkHeader::decode(&hdr.encode()).is_err());
    }
}
