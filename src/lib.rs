//! # Opal
//!
//! An embedded object-persistence engine over an ordered key/value store.
//!
//! Opal maps statically-typed application objects and collections of such
//! objects onto a flat `(class, object, property)` key space, providing
//! transactional read/write access with polymorphic dispatch, schema
//! compatibility checks and chunked storage of large sequences.
//!
//! # Quick start
//!
//! ```no_run
//! use opal::{BackendOptions, ClassSpec, Store};
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Point {
//!     id: u64,
//!     x: i32,
//!     y: i32,
//! }
//!
//! fn main() -> opal::Result<()> {
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
//!     let series = txn.put_value_collection(&[10u32, 20, 30])?;
//!     txn.commit()?;
//!
//!     let txn = store.begin_read()?;
//!     assert_eq!(txn.load_object::<Point>(oid)?, Some(point));
//!     assert_eq!(txn.get_value_collection::<u32>(series)?, vec![10, 20, 30]);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate | Responsibility |
//! |-------|-------|----------------|
//! | Core | `opal-core` | Identifiers, byte codec, buffers, record headers, errors |
//! | Storage | `opal-storage` | Backend adapter contract, in-memory ordered backend |
//! | Engine | `opal-engine` | Registry, property mappings, collections, transactions |
//!
//! The [`Store`] struct is the entry point. Production deployments bind
//! the storage contract to an embedded B-tree store; the in-memory backend
//! ships for embedding and tests.

pub use opal_engine::*;
