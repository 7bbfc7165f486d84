//! Error types for the opal object store.
//!
//! A single [`Error`] enum is surfaced by every layer; the embedding
//! application can match on the variants it cares about. We use `thiserror`
//! for the `Display` and `Error` trait implementations.
//!
//! Two variants deserve a note on recovery policy:
//!
//! - [`Error::OutOfSpace`] is recoverable: the write path performs one
//!   resize-and-retry cycle against the backend before surfacing it.
//! - Every other error aborts the current transaction and propagates.

use crate::types::{ClassId, StorageKey};
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all opal operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A persisted property's type differs from the live mapping.
    ///
    /// Schema migration is out of scope; a type change is a hard error.
    #[error("class {class_name}: data type for property '{property}' has changed")]
    IncompatibleSchema {
        /// Name of the registered class
        class_name: String,
        /// Name of the mismatching property
        property: String,
    },

    /// An on-disk ClassId has no registered class and no substitute.
    #[error("unknown class id {0}: is the class registered?")]
    UnknownClass(ClassId),

    /// A type was used with the store without prior registration.
    #[error("class has not been registered: {type_name}")]
    ClassNotRegistered {
        /// Rust type name or mapped class name
        type_name: String,
    },

    /// Header or buffer contents failed validation.
    #[error("corrupt data: {context}")]
    CorruptData {
        /// What was being decoded when the corruption was detected
        context: String,
    },

    /// A record was required to exist but the key is absent.
    #[error("not found: {key}")]
    NotFound {
        /// The absent key
        key: StorageKey,
    },

    /// An append-mode contract violation: a complex object was submitted,
    /// or keys were not written in strictly increasing order.
    #[error("invalid append: {reason}")]
    InvalidAppend {
        /// Which contract was broken
        reason: String,
    },

    /// A write transaction cannot begin while an exclusive read is active.
    #[error("write transactions are blocked by an active exclusive read")]
    WriteBlocked,

    /// An exclusive read cannot begin while a write transaction is active.
    #[error("exclusive reads are blocked by an active write transaction")]
    ReadBlocked,

    /// The backend signalled space exhaustion.
    ///
    /// Recoverable: the transaction grows the map by the configured
    /// increment and retries once before surfacing this.
    #[error("backend is out of space")]
    OutOfSpace,

    /// A fixed-extent write buffer overflowed its allocation.
    #[error("write buffer full: requested {requested} bytes, {available} available")]
    BufferFull {
        /// Bytes requested from the buffer
        requested: usize,
        /// Bytes remaining in the buffer
        available: usize,
    },

    /// Transaction lifecycle misuse: unbalanced buffer push/pop, an
    /// operation between reset and renew, or similar.
    #[error("transaction misuse: {reason}")]
    TransactionMisuse {
        /// Which rule was broken
        reason: String,
    },

    /// The backend failed while committing the underlying KV transaction.
    #[error("backend commit failed: {message}")]
    BackendCommit {
        /// Backend-supplied failure description
        message: String,
    },

    /// A shared object handle was not produced by the store and therefore
    /// carries no ObjectId.
    #[error("invalid pointer argument: not created by the store")]
    InvalidPointer,

    /// A bug or broken invariant inside the engine.
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Create a `CorruptData` error.
    pub fn corrupt(context: impl Into<String>) -> Self {
        Error::CorruptData {
            context: context.into(),
        }
    }

    /// Create a `TransactionMisuse` error.
    pub fn misuse(reason: impl Into<String>) -> Self {
        Error::TransactionMisuse {
            reason: reason.into(),
        }
    }

    /// Create an `InvalidAppend` error.
    pub fn invalid_append(reason: impl Into<String>) -> Self {
        Error::InvalidAppend {
            reason: reason.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a `NotFound` error for the given key.
    pub fn not_found(key: StorageKey) -> Self {
        Error::NotFound { key }
    }

    /// Whether the operation may succeed if retried after a resize.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::OutOfSpace)
    }

    /// Whether this error indicates on-disk damage or an engine bug.
    pub fn is_serious(&self) -> bool {
        matches!(self, Error::CorruptData { .. } | Error::Internal { .. })
    }

    /// Whether this is an absence result rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
