//! Backend configuration.

use serde::{Deserialize, Serialize};

/// Configuration recognized by backend implementations.
///
/// The fields mirror the tuning knobs of an embedded memory-mapped store.
/// Backends that have no use for a particular option accept and ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Initial map/file size in megabytes.
    pub initial_map_size_mb: u32,

    /// Free-space threshold in kilobytes below which a write transaction
    /// triggers a map resize up front.
    pub min_transaction_space_kb: u32,

    /// Granularity of each map-size growth, in kilobytes.
    pub increase_map_size_kb: u32,

    /// Whether to use a side lock file for cross-process coordination.
    pub lock_file: bool,

    /// Whether writes go through a writable memory map instead of the
    /// page cache.
    pub write_map: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            initial_map_size_mb: 1,
            min_transaction_space_kb: 512,
            increase_map_size_kb: 512,
            lock_file: false,
            write_map: true,
        }
    }
}

impl BackendOptions {
    /// Options sized for a map of `mb` megabytes.
    pub fn with_map_size_mb(mb: u32) -> Self {
        BackendOptions {
            initial_map_size_mb: mb,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = BackendOptions::default();
        assert_eq!(opts.initial_map_size_mb, 1);
        assert_eq!(opts.min_transaction_space_kb, 512);
        assert_eq!(opts.increase_map_size_kb, 512);
        assert!(!opts.lock_file);
        assert!(opts.write_map);
    }

    #[test]
    fn test_with_map_size() {
        let opts = BackendOptions::with_map_size_mb(64);
        assert_eq!(opts.initial_map_size_mb, 64);
        assert_eq!(opts.increase_map_size_kb, 512);
    }
}
