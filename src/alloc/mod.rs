//! # Sector allocation
//!
//! Foreground writers get sector ranges through a bounded pool of open
//! buckets and named write points. A write point keeps at most one open
//! bucket current; an open bucket holds one freshly allocated bucket per
//! replica and hands out contiguous sector ranges until they are full.
//!
//! Also here: whole-set capacity accounting.

use crate::core::keys::{ExtentPtr, ExtentValue};
use crate::core::{EngineError, Result, OPEN_BUCKETS_COUNT};
use crate::device::bucket::SectorKind;
use crate::device::freelist::{bucket_alloc, bucket_alloc_wait, Reserve};
use crate::device::{CacheGroup, Device};
use crate::set::CacheSet;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One replica inside an open bucket
#[derive(Debug, Clone)]
pub struct OpenBucketPtr {
    /// Device holding the bucket
    pub dev: Arc<Device>,
    /// Bucket index on the device
    pub bucket: u64,
    /// Generation the bucket was allocated with
    pub gen: u8,
    /// Sectors already handed out from this bucket
    pub ptr_offset: u32,
}

#[derive(Debug, Default)]
struct ObInner {
    sectors_free: u32,
    has_full_ptrs: bool,
    ptrs: Vec<OpenBucketPtr>,
}

/// Handle to an actively-written bucket range. Reference-counted by
/// in-flight writes via the pin.
#[derive(Debug)]
pub struct OpenBucket {
    slot: usize,
    pin: AtomicU32,
    inner: Mutex<ObInner>,
}

impl OpenBucket {
    fn pin_get(&self) {
        self.pin.fetch_add(1, Ordering::AcqRel);
    }

    fn pin_put(&self) -> bool {
        self.pin.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Sectors still available for appending
    pub fn sectors_free(&self) -> u32 {
        self.inner.lock().sectors_free
    }

    /// Whether every requested replica got a bucket
    pub fn has_full_ptrs(&self) -> bool {
        self.inner.lock().has_full_ptrs
    }
}

/// The bounded pool of open-bucket slots
pub struct OpenBucketPool {
    slots: Vec<Arc<OpenBucket>>,
    free: Mutex<Vec<usize>>,
    wait: Condvar,
}

impl Default for OpenBucketPool {
    fn default() -> Self {
        let slots = (0..OPEN_BUCKETS_COUNT)
            .map(|slot| {
                Arc::new(OpenBucket {
                    slot,
                    pin: AtomicU32::new(0),
                    inner: Mutex::new(ObInner::default()),
                })
            })
            .collect();
        OpenBucketPool {
            slots,
            free: Mutex::new((0..OPEN_BUCKETS_COUNT).collect()),
            wait: Condvar::new(),
        }
    }
}

impl OpenBucketPool {
    fn take_slot(&self, wait: bool) -> Result<Arc<OpenBucket>> {
        let mut free = self.free.lock();
        loop {
            if let Some(slot) = free.pop() {
                return Ok(Arc::clone(&self.slots[slot]));
            }
            if !wait {
                return Err(EngineError::NoSpace("open bucket pool exhausted"));
            }
            self.wait.wait(&mut free);
        }
    }

    fn put_slot(&self, slot: usize) {
        self.free.lock().push(slot);
        self.wait.notify_one();
    }

    /// Free slots remaining (stats)
    pub fn free_slots(&self) -> usize {
        self.free.lock().len()
    }
}

/// Named allocation context. Makes at most one open bucket current at a
/// time; switching happens under the point's lock.
#[derive(Default)]
pub struct WritePoint {
    cur: Mutex<Option<Arc<OpenBucket>>>,
    /// Throttle writes here instead of failing over when tier 0 is full
    pub throttle: bool,
    /// Constrain allocation to this group (tiering / promotion / GC);
    /// otherwise any tier-0 device serves
    pub group: Option<Arc<CacheGroup>>,
}

impl WritePoint {
    /// A foreground write point
    pub fn new(throttle: bool) -> WritePoint {
        WritePoint {
            cur: Mutex::new(None),
            throttle,
            group: None,
        }
    }
}

fn alloc_replica_buckets(
    group: &CacheGroup,
    nr_replicas: usize,
    reserve: Reserve,
    throttle: bool,
    nowait: bool,
) -> Result<Vec<OpenBucketPtr>> {
    let ndevs = group.len();
    if ndevs == 0 {
        return Err(EngineError::NoSpace("no devices in allocation group"));
    }
    // Replicas go to distinct devices; a group that cannot seat them all
    // must fail rather than quietly weaken the replication target.
    if ndevs < nr_replicas {
        return Err(EngineError::NoSpace("fewer devices than requested replicas"));
    }

    let mut out: Vec<OpenBucketPtr> = Vec::with_capacity(nr_replicas);
    let mut spins = 0;
    while out.len() < nr_replicas {
        let Some(dev) = group.next_device() else {
            break;
        };
        if out.iter().any(|p| p.dev.idx == dev.idx) {
            // Round-robin came back around; if the group shrank under us
            // there may be no fresh device left to visit.
            spins += 1;
            if spins > 2 * ndevs {
                break;
            }
            continue;
        }
        spins = 0;
        let res = if nowait {
            bucket_alloc(&dev, reserve)
        } else if throttle {
            // Tier-0 full with throttle set: park until space appears
            // rather than fall through to another tier.
            bucket_alloc_wait(&dev, reserve)
        } else {
            bucket_alloc(&dev, reserve)
        };
        match res {
            Ok(bucket) => {
                dev.buckets[bucket as usize].mark_open()?;
                out.push(OpenBucketPtr {
                    gen: dev.buckets[bucket as usize].gen(),
                    dev,
                    bucket,
                    ptr_offset: 0,
                });
            }
            Err(e) => {
                // The write-point layer never silently switches tiers,
                // and a partial replica set never leaves here.
                for p in &out {
                    p.dev.buckets[p.bucket as usize].clear_open();
                }
                return Err(e);
            }
        }
    }

    if out.len() < nr_replicas {
        // The group shrank under us before every replica was seated.
        for p in &out {
            p.dev.buckets[p.bucket as usize].clear_open();
        }
        return Err(EngineError::NoSpace("no bucket in any group device"));
    }
    Ok(out)
}

/// Get an open bucket with free sectors for `wp`, pinned for the caller.
///
/// If the point's current open bucket still has sectors, it is reused;
/// otherwise one bucket per requested replica is allocated (round-robin
/// over the group, distinct devices). With `nowait` the call never blocks
/// and fails with `NoSpace`.
pub fn alloc_sectors_start(
    c: &CacheSet,
    wp: &WritePoint,
    nr_replicas: usize,
    reserve: Reserve,
    nowait: bool,
) -> Result<Arc<OpenBucket>> {
    let mut cur = wp.cur.lock();

    if let Some(ob) = cur.as_ref() {
        if ob.inner.lock().sectors_free > 0 {
            let ob = Arc::clone(ob);
            ob.pin_get();
            return Ok(ob);
        }
        // Exhausted; in-flight writers still hold pins, the slot returns
        // to the pool when the last one drops.
        *cur = None;
    }

    let group = wp
        .group
        .clone()
        .unwrap_or_else(|| c.tier_group(0));

    let ob = c.open_buckets.take_slot(!nowait)?;
    let ptrs = match alloc_replica_buckets(&group, nr_replicas, reserve, wp.throttle, nowait) {
        Ok(p) => p,
        Err(e) => {
            c.open_buckets.put_slot(ob.slot);
            return Err(e);
        }
    };

    let sectors_free = ptrs
        .iter()
        .map(|p| p.dev.cfg.bucket_sectors)
        .min()
        .unwrap_or(0);
    {
        let mut inner = ob.inner.lock();
        inner.sectors_free = sectors_free;
        inner.has_full_ptrs = ptrs.len() == nr_replicas;
        inner.ptrs = ptrs;
    }
    ob.pin.store(1, Ordering::Release);
    *cur = Some(Arc::clone(&ob));
    log::trace!("write point: new open bucket slot {}", ob.slot);
    Ok(ob)
}

/// Append the open bucket's pointer tuples to an extent under
/// construction and advance the open bucket. Returns the device sector
/// targets the caller must write the payload to.
pub fn alloc_sectors_append_ptrs(
    extent: &mut ExtentValue,
    ob: &OpenBucket,
    sectors: u32,
    cached: bool,
) -> Result<Vec<(Arc<Device>, u64)>> {
    let mut inner = ob.inner.lock();
    if sectors > inner.sectors_free {
        return Err(EngineError::NoSpace("open bucket out of sectors"));
    }

    let mut targets = Vec::with_capacity(inner.ptrs.len());
    for p in &mut inner.ptrs {
        let sector = p.dev.bucket_to_sector(p.bucket) + p.ptr_offset as u64;
        extent.ptrs.push(ExtentPtr {
            dev: p.dev.idx,
            offset: sector,
            gen: p.gen,
            cached,
        });
        let kind = if cached {
            SectorKind::Cached
        } else {
            SectorKind::Dirty
        };
        p.dev.buckets[p.bucket as usize].add_sectors(
            kind,
            sectors as u16,
            p.dev.cfg.bucket_sectors,
        )?;
        p.dev.add_used_sectors(sectors as u64);
        p.ptr_offset += sectors;
        targets.push((Arc::clone(&p.dev), sector));
    }
    inner.sectors_free -= sectors;
    Ok(targets)
}

/// Drop the caller's pin. When the open bucket is both unpinned and out
/// of sectors, its buckets leave the OPEN state (their sector counts now
/// say dirty/cached) and the slot returns to the pool.
pub fn alloc_sectors_done(c: &CacheSet, wp: &WritePoint, ob: &Arc<OpenBucket>) {
    if !ob.pin_put() {
        return;
    }
    let exhausted = {
        let inner = ob.inner.lock();
        inner.sectors_free == 0
    };
    if !exhausted {
        // Still usable; keep it attached to the write point.
        return;
    }

    {
        let mut cur = wp.cur.lock();
        if cur.as_ref().is_some_and(|c| Arc::ptr_eq(c, ob)) {
            *cur = None;
        }
    }
    let mut inner = ob.inner.lock();
    for p in inner.ptrs.drain(..) {
        p.dev.buckets[p.bucket as usize].clear_open();
    }
    inner.has_full_ptrs = false;
    drop(inner);
    c.open_buckets.put_slot(ob.slot);
}

/// Detach the write point's current open bucket so the next allocation
/// starts on fresh buckets (write retry after a device error). In-flight
/// pins still drain through [`alloc_sectors_done`].
pub fn write_point_reset(c: &CacheSet, wp: &WritePoint) {
    let taken = wp.cur.lock().take();
    let Some(ob) = taken else { return };

    let mut inner = ob.inner.lock();
    inner.sectors_free = 0;
    if ob.pin.load(Ordering::Acquire) == 0 {
        for p in inner.ptrs.drain(..) {
            p.dev.buckets[p.bucket as usize].clear_open();
        }
        inner.has_full_ptrs = false;
        drop(inner);
        c.open_buckets.put_slot(ob.slot);
    }
}

/// Recompute whole-set capacity: tier-0 data sectors minus a small
/// metadata reserve. Triggered on device add/remove or tier change.
pub fn recalc_capacity(c: &CacheSet) {
    let mut capacity: u64 = 0;
    for dev in c.tier_group(0).devices() {
        capacity += dev.data_sectors();
    }
    // Hold back a slice for btree nodes and priority sets.
    capacity -= capacity / 16;
    c.set_capacity(capacity);
    log::info!("capacity now {} sectors", capacity);
}

/// Sectors not yet occupied by live data on tier 0
pub fn sectors_available(c: &CacheSet) -> u64 {
    let used: u64 = c
        .tier_group(0)
        .devices()
        .iter()
        .map(|d| d.used_sectors())
        .sum();
    c.capacity().saturating_sub(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_slots_cycle() {
        let pool = OpenBucketPool::default();
        assert_eq!(pool.free_slots(), OPEN_BUCKETS_COUNT);

        let a = pool.take_slot(false).unwrap();
        let b = pool.take_slot(false).unwrap();
        assert_ne!(a.slot, b.slot);
        assert_eq!(pool.free_slots(), OPEN_BUCKETS_COUNT - 2);

        pool.put_slot(a.slot);
        pool.put_slot(b.slot);
        assert_eq!(pool.free_slots(), OPEN_BUCKETS_COUNT);
    }

    #[test]
    fn pool_exhaustion_without_wait() {
        let pool = OpenBucketPool::default();
        let mut held = Vec::new();
        while let Ok(ob) = pool.take_slot(false) {
            held.push(ob);
        }
        assert_eq!(held.len(), OPEN_BUCKETS_COUNT);
        assert!(matches!(
            pool.take_slot(false),
            Err(EngineError::NoSpace(_))
        ));
        pool.put_slot(held.pop().unwrap().slot);
        assert!(pool.take_slot(false).is_ok());
    }
}

