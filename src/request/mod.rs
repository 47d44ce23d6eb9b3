//! # Request routing
//!
//! The block-device front door. Each bio is inspected once to decide
//! bypass vs cache vs writeback, then routed:
//! - reads walk the extents tree and split into hits, stale hits, and
//!   misses with optional promotion
//! - writes go straight into the extent write pipeline
//!
//! This module owns the bypass decision (capacity cutoff, cache mode,
//! alignment, congestion, the sequential detector, torture mode) and the
//! per-request bookkeeping; the cached-device and volume paths live in
//! [`cached`] and [`volume`].

use crate::core::CUTOFF_CACHE_ADD;
use crate::io::{get_congested, Bio, BioFlags, BioOp};
use crate::set::CacheSet;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};

pub mod cached;
pub mod volume;

pub use cached::{CacheMode, CachedDev};
pub use volume::BlockdevVolume;

/// Recent-IO entries tracked per cached device
const RECENT_IO: usize = 128;

/// A sequential run is merged only within this window
const RECENT_IO_WINDOW: Duration = Duration::from_secs(5);

/// EWMA weight shift for the per-device sequential average
const SEQUENTIAL_EWMA_SHIFT: u64 = 3;

fn ewma_add(avg: u64, val: u64, shift: u64) -> u64 {
    avg - (avg >> shift) + (val >> shift)
}

/// One recent-IO slot: where the last request ended and how long the run
/// leading to it was
#[derive(Debug, Clone)]
struct IoEntry {
    last_io: Instant,
    sequential_bytes: u64,
}

/// Per-device sequential detector: a small LRU hashed by end sector
#[derive(Debug)]
pub struct SequentialDetector {
    entries: Mutex<LruCache<u64, IoEntry>>,
    avg: std::sync::atomic::AtomicU64,
}

impl Default for SequentialDetector {
    fn default() -> Self {
        SequentialDetector {
            entries: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(RECENT_IO).unwrap(),
            )),
            avg: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl SequentialDetector {
    /// Merge this bio into a run. Returns the effective sequential byte
    /// count to compare against the cutoff.
    pub fn note(&self, bio: &Bio) -> u64 {
        use std::sync::atomic::Ordering;

        let mut entries = self.entries.lock();
        let now = Instant::now();

        let run = match entries.pop(&bio.sector) {
            Some(e) if now.duration_since(e.last_io) < RECENT_IO_WINDOW => e.sequential_bytes,
            _ => {
                // New run; fold the finished one into the average.
                let old = self.avg.load(Ordering::Relaxed);
                self.avg
                    .store(ewma_add(old, 0, SEQUENTIAL_EWMA_SHIFT), Ordering::Relaxed);
                0
            }
        };

        let run = run.saturating_add(bio.data.len() as u64);
        entries.push(
            bio.end_sector(),
            IoEntry {
                last_io: now,
                sequential_bytes: run,
            },
        );
        drop(entries);

        let old = self.avg.load(Ordering::Relaxed);
        self.avg
            .store(ewma_add(old, run, SEQUENTIAL_EWMA_SHIFT), Ordering::Relaxed);

        run.max(self.avg.load(Ordering::Relaxed))
    }
}

/// Per-request state carried from the bypass decision to completion
#[derive(Debug)]
pub struct Search {
    /// Logical device the request addresses
    pub inode: u64,
    /// Skip cache insertion (reads) / send to backing only (writes)
    pub bypass: bool,
    /// Set until a non-retryable error source is involved; only cache
    /// read errors are recoverable
    pub recoverable: bool,
    /// The request read dirty data (forbids verify)
    pub read_dirty_data: bool,
    /// At least one range missed the cache
    pub cache_miss: bool,
    /// When the request entered the engine
    pub start_time: Instant,
}

impl Search {
    /// Fresh per-request state
    pub fn new(inode: u64, bypass: bool) -> Search {
        Search {
            inode,
            bypass,
            recoverable: true,
            read_dirty_data: false,
            cache_miss: false,
            start_time: Instant::now(),
        }
    }
}

/// The bypass decision for a cached device.
///
/// Any of: set nearly full, cache mode excludes this IO, unaligned,
/// discard, congestion (unless a synchronous writeback-mode write),
/// sequential run past the cutoff, or the torture test. Bypassed sectors
/// are accounted.
pub fn check_should_bypass(dc: &CachedDev, bio: &Bio) -> bool {
    let c = &dc.c;
    let is_write = bio.op != BioOp::Read;
    let congested = get_congested(c);
    let mode = dc.mode();

    let skip = 'decision: {
        if dc.is_detaching()
            || crate::alloc::sectors_available(c) * 100 < c.capacity() * CUTOFF_CACHE_ADD
            || bio.op == BioOp::Discard
        {
            break 'decision true;
        }

        if mode == CacheMode::None || (mode == CacheMode::Writearound && is_write) {
            break 'decision true;
        }

        let block = c.config.block_sectors as u64;
        if !bio.is_aligned(block) {
            log::debug!("skipping unaligned io at sector {}", bio.sector);
            break 'decision true;
        }

        if dc.torture_bypass() {
            break 'decision rand::thread_rng().gen_range(0..4u8) == 3;
        }

        let cutoff = dc.sequential_cutoff();
        if congested == 0 && cutoff == 0 {
            break 'decision false;
        }

        if congested == 0
            && mode == CacheMode::Writeback
            && is_write
            && bio.flags.contains(BioFlags::SYNC)
        {
            break 'decision false;
        }

        let sectors = dc.sequential.note(bio) >> 9;

        if cutoff != 0 && sectors >= cutoff >> 9 {
            log::debug!("bypass: sequential run of {} sectors", sectors);
            break 'decision true;
        }
        if congested != 0 && sectors >= congested {
            log::debug!("bypass: congested ({})", congested);
            break 'decision true;
        }
        false
    };

    if skip {
        c.stats.sectors_bypassed.add(bio.sectors());
    }
    skip
}

/// Hit/miss/bypass accounting at request completion
pub fn mark_cache_accounting(c: &CacheSet, hit: bool, bypass: bool) {
    let counter = match (hit, bypass) {
        (true, false) => &c.stats.cache_hits,
        (false, false) => &c.stats.cache_misses,
        (true, true) => &c.stats.cache_bypass_hits,
        (false, true) => &c.stats.cache_bypass_misses,
    };
    counter.add(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges() {
        let mut avg = 0;
        for _ in 0..64 {
            avg = ewma_add(avg, 1 << 20, SEQUENTIAL_EWMA_SHIFT);
        }
        assert!(avg > (1 << 20) - (1 << 14));
        assert!(avg <= 1 << 20);
    }

    #[test]
    fn sequential_runs_merge() {
        let det = SequentialDetector::default();
        let mut total = 0;
        for i in 0..8u64 {
            let bio = Bio::read(i * 16, 16);
            total = det.note(&bio);
        }
        // Eight contiguous 8 KiB reads accumulate into one run.
        assert!(total >= 8 * 16 * 512);

        // A jump elsewhere starts a fresh run.
        let elsewhere = det.note(&Bio::read(1 << 20, 16));
        assert!(elsewhere < total);
    }
}
