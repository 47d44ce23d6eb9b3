//! # Engine Core
//!
//! Foundational types shared by every subsystem:
//! - The engine-wide error taxonomy and `Result` alias
//! - Sector/bucket unit constants
//! - The B-tree key model ([`keys`])
//! - Sharded statistics counters ([`counters`])

use thiserror::Error;

pub mod counters;
pub mod keys;

/// Engine error taxonomy.
///
/// These are semantic categories, not exception types: `Retry` and `Busy`
/// are always recovered locally by the caller, resource errors and hard
/// errors propagate to the submitter, and `Corrupted` escalates to set-wide
/// read-only.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Concurrency race; the caller should re-acquire state and loop.
    #[error("lock sequence changed, retry")]
    Retry,

    /// No bucket available in the required reserve.
    #[error("no space in reserve: {0}")]
    NoSpace(&'static str),

    /// Heap exhaustion; never partial progress.
    #[error("out of memory: {0}")]
    NoMem(&'static str),

    /// A device reported a hard error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Checksum or invariant violation.
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// Key or device absent; usually returned to the caller as data.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// Try-lock contention.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Pointer generation mismatch; treated as a cache miss.
    #[error("stale pointer")]
    Stale,

    /// Operation not supported by this device surface.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

impl EngineError {
    /// Whether the caller should loop and re-acquire state.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Retry | EngineError::Busy(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Log2 of the sector size
pub const SECTOR_SHIFT: u32 = 9;

/// Smallest addressable unit on any device, in bytes
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Maximum replicas an extent can carry
pub const REPLICAS_MAX: usize = 4;

/// Open bucket slots across the whole set. Enough for 16 cache devices,
/// 2 tiers and some left over for pipelining.
pub const OPEN_BUCKETS_COUNT: usize = 256;

/// Foreground write points, hashed by submitter thread
pub const WRITE_POINT_COUNT: usize = 16;

/// Maximum B-tree depth (leaf is level 0)
pub const BTREE_MAX_DEPTH: usize = 4;

/// Ceiling for the congestion soft signal
pub const CONGESTED_MAX: i32 = 1024;

/// Stop adding to the cache when available space drops below this
/// percentage of capacity
pub const CUTOFF_CACHE_ADD: u64 = 10;

/// Stop readahead promotion below this percentage of capacity
pub const CUTOFF_CACHE_READA: u64 = 15;

/// Largest single segment the write pipeline will build an extent for,
/// in sectors (128 KiB)
pub const WRITE_SEGMENT_SECTORS: u64 = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(EngineError::Retry.is_transient());
        assert!(EngineError::Busy("node lock").is_transient());
        assert!(!EngineError::NoSpace("none").is_transient());
        assert!(!EngineError::Stale.is_transient());
    }

    #[test]
    fn sector_units() {
        assert!(WRITE_SEGMENT_SECTORS.is_power_of_two());
        assert_eq!(SECTOR_SIZE, 512);
    }
}
