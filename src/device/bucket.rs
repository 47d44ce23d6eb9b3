//! Per-bucket state table.
//!
//! Every bucket on a device has exactly one state, derived from its packed
//! mark word: FREE (nothing accounted, not open), OPEN (reserved by an open
//! bucket), DIRTY / CACHED / META (by which sector count is live). The
//! generation counter is bumped on every transition out of use; extent
//! pointers carry the generation they were written with and stale pointers
//! are detected by mismatch.

use crate::core::{EngineError, Result};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Observable bucket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// On some free list, content undefined
    Free,
    /// Reserved by an open bucket, sectors being appended
    Open,
    /// Contains at least one live dirty sector
    Dirty,
    /// Contains only clean cached sectors
    Cached,
    /// Holds btree node or journal data
    Meta,
}

/// Snapshot of a bucket's packed sector accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketMark {
    /// Live dirty sectors (not yet on a backing device)
    pub dirty_sectors: u16,
    /// Clean cached sectors
    pub cached_sectors: u16,
    /// Btree node / journal sectors
    pub meta_sectors: u16,
    /// Currently owned by an open bucket
    pub open: bool,
    /// Queued on free_inc or a free fifo
    pub owned_by_allocator: bool,
}

impl BucketMark {
    fn pack(self) -> u64 {
        self.dirty_sectors as u64
            | (self.cached_sectors as u64) << 16
            | (self.meta_sectors as u64) << 32
            | (self.open as u64) << 48
            | (self.owned_by_allocator as u64) << 49
    }

    fn unpack(w: u64) -> BucketMark {
        BucketMark {
            dirty_sectors: w as u16,
            cached_sectors: (w >> 16) as u16,
            meta_sectors: (w >> 32) as u16,
            open: (w >> 48) & 1 != 0,
            owned_by_allocator: (w >> 49) & 1 != 0,
        }
    }

    /// Total live sectors
    pub fn live_sectors(self) -> u32 {
        self.dirty_sectors as u32 + self.cached_sectors as u32 + self.meta_sectors as u32
    }

    /// State derived from the mark
    pub fn state(self) -> BucketState {
        if self.open {
            BucketState::Open
        } else if self.dirty_sectors > 0 {
            BucketState::Dirty
        } else if self.meta_sectors > 0 {
            BucketState::Meta
        } else if self.cached_sectors > 0 {
            BucketState::Cached
        } else {
            BucketState::Free
        }
    }
}

/// Which sector class an update accounts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorKind {
    /// Foreground data not yet written back
    Dirty,
    /// Clean cached copy
    Cached,
    /// Btree / journal metadata
    Meta,
}

/// One bucket's mutable state. All fields are atomics: the mark word is
/// updated by compare-exchange, prios are plain stores under the device
/// clock.
#[derive(Debug, Default)]
pub struct Bucket {
    gen: AtomicU8,
    pin: AtomicU32,
    read_prio: AtomicU16,
    write_prio: AtomicU16,
    mark: AtomicU64,
}

impl Bucket {
    /// Current generation
    pub fn gen(&self) -> u8 {
        self.gen.load(Ordering::Acquire)
    }

    /// Bump the generation; called on every transition out of use.
    /// Returns the new generation.
    pub fn bump_gen(&self) -> u8 {
        self.gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Restore a generation read from disk
    pub fn set_gen(&self, gen: u8) {
        self.gen.store(gen, Ordering::Release);
    }

    /// Pin against reclaim (reads in flight)
    pub fn pin(&self) {
        self.pin.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reclaim pin
    pub fn unpin(&self) {
        let prev = self.pin.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Current pin count
    pub fn pinned(&self) -> bool {
        self.pin.load(Ordering::Acquire) > 0
    }

    /// Read priority (compared against the device read clock hand)
    pub fn read_prio(&self) -> u16 {
        self.read_prio.load(Ordering::Relaxed)
    }

    /// Write priority
    pub fn write_prio(&self) -> u16 {
        self.write_prio.load(Ordering::Relaxed)
    }

    /// Reset a priority to the given clock hand
    pub fn set_prio(&self, rw: super::clock::Rw, hand: u16) {
        match rw {
            super::clock::Rw::Read => self.read_prio.store(hand, Ordering::Relaxed),
            super::clock::Rw::Write => self.write_prio.store(hand, Ordering::Relaxed),
        }
    }

    /// Halve a priority's distance from `min`, for clock rescale
    pub fn rescale_prio(&self, rw: super::clock::Rw) {
        let a = match rw {
            super::clock::Rw::Read => &self.read_prio,
            super::clock::Rw::Write => &self.write_prio,
        };
        let _ = a.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p / 2));
    }

    /// Current mark snapshot
    pub fn mark(&self) -> BucketMark {
        BucketMark::unpack(self.mark.load(Ordering::Acquire))
    }

    fn update_mark<F>(&self, mut f: F) -> Result<BucketMark>
    where
        F: FnMut(BucketMark) -> Result<BucketMark>,
    {
        let mut old = self.mark.load(Ordering::Acquire);
        loop {
            let new = f(BucketMark::unpack(old))?;
            match self.mark.compare_exchange_weak(
                old,
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(new),
                Err(cur) => old = cur,
            }
        }
    }

    /// Mark this bucket as owned by an open bucket
    pub fn mark_open(&self) -> Result<()> {
        self.update_mark(|mut m| {
            if m.state() != BucketState::Free {
                return Err(EngineError::Corrupted(
                    "bucket allocated while not free".into(),
                ));
            }
            m.open = true;
            Ok(m)
        })?;
        Ok(())
    }

    /// Release open-bucket ownership; state falls out of the sector counts
    pub fn clear_open(&self) {
        // The mark is consistent at every step, no invariant to re-check.
        let _ = self.update_mark(|mut m| {
            m.open = false;
            Ok(m)
        });
    }

    /// Account sectors into the bucket. Fails if the per-bucket size
    /// invariant would be violated.
    pub fn add_sectors(&self, kind: SectorKind, sectors: u16, bucket_sectors: u32) -> Result<()> {
        self.update_mark(|mut m| {
            match kind {
                SectorKind::Dirty => m.dirty_sectors += sectors,
                SectorKind::Cached => m.cached_sectors += sectors,
                SectorKind::Meta => m.meta_sectors += sectors,
            }
            if m.live_sectors() > bucket_sectors {
                return Err(EngineError::Corrupted(format!(
                    "bucket sector counts {} exceed bucket size {}",
                    m.live_sectors(),
                    bucket_sectors
                )));
            }
            Ok(m)
        })?;
        Ok(())
    }

    /// Remove sectors (extent dropped or converted)
    pub fn sub_sectors(&self, kind: SectorKind, sectors: u16) {
        let _ = self.update_mark(|mut m| {
            match kind {
                SectorKind::Dirty => m.dirty_sectors = m.dirty_sectors.saturating_sub(sectors),
                SectorKind::Cached => m.cached_sectors = m.cached_sectors.saturating_sub(sectors),
                SectorKind::Meta => m.meta_sectors = m.meta_sectors.saturating_sub(sectors),
            }
            Ok(m)
        });
    }

    /// Convert dirty sectors to cached after writeback completes
    pub fn dirty_to_cached(&self, sectors: u16) {
        let _ = self.update_mark(|mut m| {
            m.dirty_sectors = m.dirty_sectors.saturating_sub(sectors);
            m.cached_sectors += sectors;
            Ok(m)
        });
    }

    /// Begin reclaim: drop all accounting and take allocator ownership.
    /// Only legal for CACHED or FREE buckets that nothing else owns; the
    /// generation bump happens later, when the bucket is drained from the
    /// invalidate queue.
    pub fn start_invalidate(&self) -> Result<()> {
        self.update_mark(|m| {
            if m.owned_by_allocator {
                return Err(EngineError::Busy("bucket already queued"));
            }
            match m.state() {
                BucketState::Cached | BucketState::Free => Ok(BucketMark {
                    owned_by_allocator: true,
                    ..BucketMark::default()
                }),
                s => Err(EngineError::Busy(match s {
                    BucketState::Dirty => "bucket has dirty data",
                    BucketState::Meta => "bucket holds metadata",
                    _ => "bucket is open",
                })),
            }
        })?;
        Ok(())
    }

    /// Hand the bucket from the free list to an allocating caller
    pub fn release_to_caller(&self) {
        let _ = self.update_mark(|mut m| {
            m.owned_by_allocator = false;
            Ok(m)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let b = Bucket::default();
        assert_eq!(b.mark().state(), BucketState::Free);

        b.mark_open().unwrap();
        assert_eq!(b.mark().state(), BucketState::Open);
        assert!(b.mark_open().is_err());

        b.add_sectors(SectorKind::Dirty, 64, 128).unwrap();
        b.clear_open();
        assert_eq!(b.mark().state(), BucketState::Dirty);

        b.dirty_to_cached(64);
        assert_eq!(b.mark().state(), BucketState::Cached);

        let g0 = b.gen();
        b.start_invalidate().unwrap();
        assert!(b.start_invalidate().is_err());
        let g1 = b.bump_gen();
        assert_eq!(g1, g0.wrapping_add(1));
        b.release_to_caller();
        assert_eq!(b.mark().state(), BucketState::Free);
        assert!(!b.mark().owned_by_allocator);
    }

    #[test]
    fn size_invariant_enforced() {
        let b = Bucket::default();
        b.add_sectors(SectorKind::Cached, 100, 128).unwrap();
        assert!(b.add_sectors(SectorKind::Cached, 29, 128).is_err());
        assert!(b.add_sectors(SectorKind::Cached, 28, 128).is_ok());
    }

    #[test]
    fn dirty_bucket_not_reclaimable() {
        let b = Bucket::default();
        b.add_sectors(SectorKind::Dirty, 8, 128).unwrap();
        assert!(b.start_invalidate().is_err());
        b.dirty_to_cached(8);
        assert!(b.start_invalidate().is_ok());
    }
}
