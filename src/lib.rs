//! # CASCADE - Copy-on-Write Block Cache Engine
//!
//! A multi-device block cache and filesystem substrate built in Rust.
//!
//! ## Architecture
//!
//! - `core`: error taxonomy, key model, counters
//! - `device`: member devices, bucket state, priority clocks, free lists
//! - `alloc`: open-bucket pool, write points, capacity
//! - `btree`: node cache, three-mode locking, cursors, inserts
//! - `extent`: pointer selection and stale detection
//! - `journal`: sequence-stamped durability records
//! - `io`: bio model, extent reads, the write pipeline
//! - `writeback`: dirty-key queue and background copy-out
//! - `request`: the block-device front door (cached devices, volumes)
//! - `set`: the cache set tying it all together

#![warn(missing_docs)]
#![warn(clippy::all)]

// Foundational types
pub mod core;

// Member devices and bucket allocation
pub mod device;

// Open buckets and write points
pub mod alloc;

// The metadata btree
pub mod btree;

// Extent pointer handling
pub mod extent;

// Durability records
pub mod journal;

// IO model and data paths
pub mod io;

// Background writeback
pub mod writeback;

// Request routing
pub mod request;

// Memory-pressure cooperation
pub mod shrinker;

// The cache set
pub mod set;

// Re-export commonly used types
pub use crate::core::{EngineError, Result};
pub use crate::request::{BlockdevVolume, CacheMode, CachedDev};
pub use crate::set::{CacheSet, CacheSetConfig, CacheStatsSnapshot};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
