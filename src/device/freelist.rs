//! Free-list pipeline and allocator worker.
//!
//! Between the bucket table and foreground allocation sit, per device:
//! - `free_inc`, an invalidate queue of buckets selected for reclaim but
//!   not yet discarded
//! - four reserve fifos, `PRIO < BTREE < MOVINGGC < NONE` (lower index is
//!   higher priority; metadata reserves are strictly <= BTREE)
//!
//! The allocator worker loops: select reclaim candidates by the device's
//! replacement policy, queue them on `free_inc`, then drain `free_inc` -
//! bumping generations, discarding, and topping up reserve fifos that are
//! under their low-water mark, with the surplus going to `NONE`.

use crate::core::{EngineError, Result};
use crate::device::bucket::BucketState;
use crate::device::clock::Rw;
use crate::device::{Device, DeviceConfig, ReplacementPolicy};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Allocation reserve classes, in priority order. There is one reserve
/// for priority sets, one for the btree, one for moving GC, and the
/// general pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Reserve {
    /// Priority-set writes
    Prio = 0,
    /// Btree node allocation
    Btree = 1,
    /// Moving GC
    MovingGc = 2,
    /// Foreground data
    None = 3,
}

/// Number of reserve classes
pub const RESERVE_NR: usize = 4;

impl Reserve {
    /// Metadata reserves are strictly <= BTREE
    pub fn is_metadata(self) -> bool {
        self <= Reserve::Btree
    }
}

/// Per-device free fifos plus the invalidate queue
pub struct FreeLists {
    free: [ArrayQueue<u64>; RESERVE_NR],
    free_inc: ArrayQueue<u64>,
    /// Woken when a bucket lands on a free fifo
    bucket_wait: (Mutex<()>, Condvar),
    /// Woken when a free fifo gains space
    space_wait: (Mutex<()>, Condvar),
    /// Rotating scan cursor for the FIFO policy
    fifo_cursor: AtomicU64,
}

impl std::fmt::Debug for FreeLists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeLists")
            .field("free", &self.free.iter().map(|q| q.len()).collect::<Vec<_>>())
            .field("free_inc", &self.free_inc.len())
            .finish()
    }
}

fn clamp(v: u64, lo: usize, hi: usize) -> usize {
    (v as usize).clamp(lo, hi)
}

impl FreeLists {
    /// Size the fifos for a device's geometry
    pub fn new(cfg: &DeviceConfig) -> FreeLists {
        let data_buckets = cfg.nbuckets - cfg.first_bucket;
        FreeLists {
            free: [
                ArrayQueue::new(8),
                ArrayQueue::new(16),
                ArrayQueue::new(16),
                ArrayQueue::new(clamp(data_buckets / 4, 16, 256)),
            ],
            free_inc: ArrayQueue::new(clamp(data_buckets / 8, 8, 64)),
            bucket_wait: (Mutex::new(()), Condvar::new()),
            space_wait: (Mutex::new(()), Condvar::new()),
            fifo_cursor: AtomicU64::new(0),
        }
    }

    /// Buckets currently sitting on a reserve fifo
    pub fn fifo_len(&self, r: Reserve) -> usize {
        self.free[r as usize].len()
    }

    /// Low-water mark below which the allocator prefers this reserve
    pub fn low_water(&self, r: Reserve) -> usize {
        self.free[r as usize].capacity() / 2
    }

    fn pop(&self, r: Reserve) -> Option<u64> {
        let b = self.free[r as usize].pop()?;
        // Reserve fifo gained space; let the worker continue draining.
        self.space_wait.1.notify_one();
        Some(b)
    }

    fn wait_for_bucket(&self, timeout: Duration) {
        let (lock, cvar) = &self.bucket_wait;
        let mut guard = lock.lock();
        let _ = cvar.wait_for(&mut guard, timeout);
    }

    fn notify_bucket(&self) {
        self.bucket_wait.1.notify_all();
    }

    fn wait_for_space(&self, timeout: Duration) {
        let (lock, cvar) = &self.space_wait;
        let mut guard = lock.lock();
        let _ = cvar.wait_for(&mut guard, timeout);
    }
}

/// Pop a free bucket for `reserve`, without blocking.
///
/// The caller's own fifo is tried first; callers above the general pool
/// are additionally entitled to drain `NONE`. The general pool never
/// touches the dedicated reserves, which is what keeps single-key inserts
/// and priority writes live under `NoSpace` pressure.
pub fn bucket_alloc(dev: &Device, reserve: Reserve) -> Result<u64> {
    let b = dev
        .lists
        .pop(reserve)
        .or_else(|| {
            if reserve != Reserve::None {
                dev.lists.pop(Reserve::None)
            } else {
                None
            }
        })
        .ok_or(EngineError::NoSpace("free list empty"))?;

    let bucket = &dev.buckets[b as usize];
    bucket.release_to_caller();
    bucket.set_prio(Rw::Read, dev.clock(Rw::Read).hand());
    bucket.set_prio(Rw::Write, dev.clock(Rw::Write).hand());

    dev.wake_allocator();
    log::trace!("device {}: allocated bucket {} from {:?}", dev.idx, b, reserve);
    Ok(b)
}

/// Blocking [`bucket_alloc`]: parks on the freelist wait queue until the
/// allocator worker produces a bucket.
pub fn bucket_alloc_wait(dev: &Device, reserve: Reserve) -> Result<u64> {
    loop {
        match bucket_alloc(dev, reserve) {
            Err(EngineError::NoSpace(_)) => {
                dev.wake_allocator();
                dev.lists.wait_for_bucket(Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

/// One pass of reclaim-candidate selection. Returns how many buckets were
/// queued on `free_inc`.
fn fill_free_inc(dev: &Device) -> usize {
    let space = dev.lists.free_inc.capacity() - dev.lists.free_inc.len();
    if space == 0 {
        return 0;
    }

    let first = dev.cfg.first_bucket;
    let nbuckets = dev.cfg.nbuckets;
    let eligible = |b: u64| {
        let bucket = &dev.buckets[b as usize];
        let m = bucket.mark();
        !m.owned_by_allocator
            && !bucket.pinned()
            && matches!(m.state(), BucketState::Cached | BucketState::Free)
    };

    let mut picked = Vec::with_capacity(space);
    match dev.cfg.replacement {
        ReplacementPolicy::Lru => {
            // Oldest read priority first; track min_prio while we're here.
            let clock = dev.clock(Rw::Read);
            let mut candidates: Vec<(u16, u64)> = (first..nbuckets)
                .filter(|&b| eligible(b))
                .map(|b| (clock.age(dev.buckets[b as usize].read_prio()), b))
                .collect();
            if let Some(&(oldest_age, _)) = candidates.iter().max_by_key(|&&(age, _)| age) {
                clock.set_min_prio(clock.hand().wrapping_sub(oldest_age));
            }
            candidates.sort_by(|a, b| b.0.cmp(&a.0));
            picked.extend(candidates.into_iter().take(space).map(|(_, b)| b));
        }
        ReplacementPolicy::Fifo => {
            let start = dev.lists.fifo_cursor.load(Ordering::Relaxed);
            let span = nbuckets - first;
            for i in 0..span {
                if picked.len() == space {
                    break;
                }
                let b = first + (start + i) % span;
                if eligible(b) {
                    picked.push(b);
                }
            }
            dev.lists.fifo_cursor.store(
                picked.last().map_or(start, |&b| b - first + 1),
                Ordering::Relaxed,
            );
        }
        ReplacementPolicy::Random => {
            let mut rng = rand::thread_rng();
            let span = nbuckets - first;
            let mut attempts = span * 2;
            while picked.len() < space && attempts > 0 {
                attempts -= 1;
                let b = first + rng.gen_range(0..span);
                if eligible(b) && !picked.contains(&b) {
                    picked.push(b);
                }
            }
        }
    }

    let mut queued = 0;
    for b in picked {
        if dev.buckets[b as usize].start_invalidate().is_err() {
            continue;
        }
        if dev.lists.free_inc.push(b).is_err() {
            // Queue filled up under us; put the bucket back in play.
            dev.buckets[b as usize].release_to_caller();
            break;
        }
        queued += 1;
    }
    queued
}

/// Drain `free_inc`: bump generations, discard, top up the reserves.
/// Returns false if the worker should park because every fifo is full.
fn drain_free_inc(dev: &Device) -> bool {
    while let Some(b) = dev.lists.free_inc.pop() {
        dev.buckets[b as usize].bump_gen();

        if dev.cfg.discard && dev.backend.supports_discard() {
            let sector = dev.bucket_to_sector(b);
            if let Err(e) = dev
                .backend
                .discard(sector, dev.cfg.bucket_sectors as u64)
            {
                // Discard failure is non-fatal.
                log::warn!("device {}: discard of bucket {} failed: {}", dev.idx, b, e);
            }
        }

        let mut target = Reserve::None;
        for r in [Reserve::Prio, Reserve::Btree, Reserve::MovingGc] {
            if dev.lists.fifo_len(r) < dev.lists.low_water(r) {
                target = r;
                break;
            }
        }

        let mut bucket = b;
        loop {
            match dev.lists.free[target as usize].push(bucket) {
                Ok(()) => break,
                Err(rejected) => {
                    if target != Reserve::None {
                        target = Reserve::None;
                        bucket = rejected;
                        continue;
                    }
                    // Everything is full: park until a consumer makes
                    // space, then re-queue this bucket first.
                    if dev.lists.free_inc.push(rejected).is_err() {
                        dev.buckets[rejected as usize].release_to_caller();
                    }
                    dev.lists.notify_bucket();
                    return false;
                }
            }
        }

        dev.lists.notify_bucket();
    }
    true
}

/// Run synchronous allocator passes until the fifos stop absorbing
/// buckets. Used at device bring-up before the worker thread exists, and
/// by tests.
pub fn drive_allocator_once(dev: &Device) {
    loop {
        let queued = fill_free_inc(dev);
        let drained = drain_free_inc(dev);
        if queued == 0 || !drained {
            break;
        }
    }
}

/// Allocator worker body; one per device, runs until
/// [`Device::stop_allocator`].
pub fn run_allocator(dev: Arc<Device>) {
    log::debug!("device {}: allocator running", dev.idx);
    while !dev.allocator_stopping() {
        let queued = fill_free_inc(&dev);
        let drained = drain_free_inc(&dev);

        if drained && queued == 0 {
            // Nothing reclaimable or fifos content; wait for IO to free
            // buckets or for a consumer to wake us.
            dev.allocator_wait(Duration::from_millis(100));
        } else if !drained {
            dev.lists.wait_for_space(Duration::from_millis(50));
        }
    }
    log::debug!("device {}: allocator stopped", dev.idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBackend;

    fn test_device(nbuckets: u64) -> Arc<Device> {
        let cfg = DeviceConfig {
            nbuckets,
            bucket_sectors: 8,
            first_bucket: 1,
            discard: true,
            ..DeviceConfig::default()
        };
        let backend = Arc::new(MemBackend::new(nbuckets * 8, true));
        Device::new(0, cfg, backend).unwrap()
    }

    #[test]
    fn worker_pass_fills_reserves() {
        let dev = test_device(128);
        loop {
            let queued = fill_free_inc(&dev);
            let drained = drain_free_inc(&dev);
            if queued == 0 || !drained {
                break;
            }
        }

        // Metadata reserves at their low-water marks, surplus in NONE.
        assert!(dev.lists.fifo_len(Reserve::Prio) >= dev.lists.low_water(Reserve::Prio));
        assert!(dev.lists.fifo_len(Reserve::Btree) >= dev.lists.low_water(Reserve::Btree));
        assert!(dev.lists.fifo_len(Reserve::None) > 0);
    }

    #[test]
    fn alloc_pops_and_bumps_gen() {
        let dev = test_device(64);
        let gens: Vec<u8> = dev.buckets.iter().map(|b| b.gen()).collect();
        fill_free_inc(&dev);
        drain_free_inc(&dev);

        let b = bucket_alloc(&dev, Reserve::None).unwrap();
        assert!(b >= dev.cfg.first_bucket);
        assert_eq!(dev.buckets[b as usize].gen(), gens[b as usize].wrapping_add(1));
        assert!(!dev.buckets[b as usize].mark().owned_by_allocator);
    }

    #[test]
    fn general_pool_cannot_drain_reserves() {
        let dev = test_device(64);
        fill_free_inc(&dev);
        drain_free_inc(&dev);

        while bucket_alloc(&dev, Reserve::None).is_ok() {}
        // NONE is exhausted but the metadata reserves are untouched.
        assert!(dev.lists.fifo_len(Reserve::Prio) > 0);
        assert!(dev.lists.fifo_len(Reserve::Btree) > 0);
        assert!(matches!(
            bucket_alloc(&dev, Reserve::None),
            Err(EngineError::NoSpace(_))
        ));
        assert!(bucket_alloc(&dev, Reserve::Btree).is_ok());
    }

    #[test]
    fn pinned_buckets_skipped() {
        let dev = test_device(16);
        for b in &dev.buckets {
            b.pin();
        }
        assert_eq!(fill_free_inc(&dev), 0);
        dev.buckets[4].unpin();
        assert_eq!(fill_free_inc(&dev), 1);
    }
}
