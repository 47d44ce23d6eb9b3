//! # Devices
//!
//! One [`Device`] per backing block device in the set. A device is
//! partitioned into fixed-size buckets; this module owns:
//! - The immutable device attributes (bucket geometry, tier, policy)
//! - The per-bucket state table ([`bucket`])
//! - The read/write priority clocks ([`clock`])
//! - The free-list pipeline and allocator worker ([`freelist`])
//! - On-disk priority sets ([`prio`])
//!
//! Actual sector IO goes through the [`BlockBackend`] trait so the engine
//! can run against files, raw devices, or memory in tests.

use crate::core::{EngineError, Result, SECTOR_SIZE};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod bucket;
pub mod clock;
pub mod freelist;
pub mod prio;

use bucket::Bucket;
use clock::{PrioClock, Rw};
use freelist::FreeLists;

/// Bucket replacement policy for the allocator scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicy {
    /// Reclaim the bucket least recently read (by priority clock age)
    #[default]
    Lru,
    /// Reclaim in bucket order, oldest allocation first
    Fifo,
    /// Reclaim uniformly at random among eligible buckets
    Random,
}

/// Immutable device attributes
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device identity
    pub uuid: Uuid,
    /// Bucket size in sectors; must be a power of two
    pub bucket_sectors: u32,
    /// Total buckets on the device
    pub nbuckets: u64,
    /// First bucket usable for data (the head is reserved for the
    /// superblock and priority sets)
    pub first_bucket: u64,
    /// Performance tier; 0 is fastest
    pub tier: u8,
    /// Replacement policy
    pub replacement: ReplacementPolicy,
    /// Whether to issue discards on reclaim
    pub discard: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            uuid: Uuid::nil(),
            bucket_sectors: 128,
            nbuckets: 1024,
            first_bucket: 2,
            tier: 0,
            replacement: ReplacementPolicy::Lru,
            discard: false,
        }
    }
}

/// Sector IO surface a device runs against
pub trait BlockBackend: Send + Sync {
    /// Read `buf.len()` bytes starting at `sector`
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `sector`
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Hint that a sector range no longer holds live data
    fn discard(&self, sector: u64, nr_sectors: u64) -> Result<()>;

    /// Flush the device write cache
    fn flush(&self) -> Result<()>;

    /// Device size in sectors
    fn size_sectors(&self) -> u64;

    /// Whether discard is supported at all
    fn supports_discard(&self) -> bool {
        false
    }

    /// Driver ioctl passthrough; backends without one refuse
    fn ioctl(&self, _cmd: u32, _arg: u64) -> Result<i64> {
        Err(EngineError::NotSupported("ioctl"))
    }
}

/// Memory-backed [`BlockBackend`] with write-failure injection, used by
/// tests and as the reference backend.
pub struct MemBackend {
    data: RwLock<Vec<u8>>,
    discard_supported: bool,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    io_delay: Mutex<Option<Duration>>,
}

impl MemBackend {
    /// A zeroed backend of `nsectors` sectors
    pub fn new(nsectors: u64, discard_supported: bool) -> MemBackend {
        MemBackend {
            data: RwLock::new(vec![0u8; nsectors as usize * SECTOR_SIZE]),
            discard_supported,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            io_delay: Mutex::new(None),
        }
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Make every subsequent read fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Inject a fixed delay per IO, for congestion tests
    pub fn set_io_delay(&self, delay: Option<Duration>) {
        *self.io_delay.lock() = delay;
    }

    fn delay(&self) {
        if let Some(d) = *self.io_delay.lock() {
            std::thread::sleep(d);
        }
    }

    fn check_range(&self, sector: u64, bytes: usize) -> Result<usize> {
        let start = sector as usize * SECTOR_SIZE;
        if start + bytes > self.data.read().len() {
            return Err(EngineError::Io(format!(
                "IO past end of device: sector {} + {} bytes",
                sector, bytes
            )));
        }
        Ok(start)
    }
}

impl BlockBackend for MemBackend {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(EngineError::Io("injected read failure".into()));
        }
        self.delay();
        let start = self.check_range(sector, buf.len())?;
        buf.copy_from_slice(&self.data.read()[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(EngineError::Io("injected write failure".into()));
        }
        self.delay();
        let start = self.check_range(sector, buf.len())?;
        self.data.write()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn discard(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        if !self.discard_supported {
            return Err(EngineError::NotSupported("discard"));
        }
        let bytes = nr_sectors as usize * SECTOR_SIZE;
        let start = self.check_range(sector, bytes)?;
        self.data.write()[start..start + bytes].fill(0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size_sectors(&self) -> u64 {
        (self.data.read().len() / SECTOR_SIZE) as u64
    }

    fn supports_discard(&self) -> bool {
        self.discard_supported
    }
}

/// IO latency EWMA weight (shift)
const LATENCY_EWMA_SHIFT: u64 = 3;

/// One member device of the cache set
pub struct Device {
    /// Member index within the set
    pub idx: u8,
    /// Immutable attributes
    pub cfg: DeviceConfig,
    /// Sector IO surface
    pub backend: Arc<dyn BlockBackend>,
    /// Per-bucket state, indexed by bucket number
    pub buckets: Vec<Bucket>,
    /// Read ([0]) and write ([1]) priority clocks
    pub clocks: [PrioClock; 2],
    /// Free-list pipeline
    pub lists: FreeLists,
    /// Hard IO errors observed on this device
    pub io_errors: AtomicU64,
    /// Buckets holding the live on-disk priority set chain
    pub prio_chain: Mutex<Vec<u64>>,
    io_latency_us: AtomicU64,
    used_sectors: AtomicU64,
    alloc_stop: AtomicBool,
    alloc_wake: (Mutex<bool>, Condvar),
}

impl Device {
    /// Construct a device over a backend. Fails if the backend is too
    /// small for the configured geometry.
    pub fn new(idx: u8, cfg: DeviceConfig, backend: Arc<dyn BlockBackend>) -> Result<Arc<Device>> {
        if !cfg.bucket_sectors.is_power_of_two() {
            return Err(EngineError::Corrupted(format!(
                "bucket size {} not a power of two",
                cfg.bucket_sectors
            )));
        }
        if cfg.nbuckets * cfg.bucket_sectors as u64 > backend.size_sectors() {
            return Err(EngineError::Corrupted(format!(
                "device {}: {} buckets of {} sectors exceed backend size",
                idx, cfg.nbuckets, cfg.bucket_sectors
            )));
        }
        if cfg.first_bucket >= cfg.nbuckets {
            return Err(EngineError::Corrupted("no usable buckets".into()));
        }

        let buckets = (0..cfg.nbuckets).map(|_| Bucket::default()).collect();
        let lists = FreeLists::new(&cfg);

        Ok(Arc::new(Device {
            idx,
            cfg,
            backend,
            buckets,
            clocks: [PrioClock::default(), PrioClock::default()],
            lists,
            io_errors: AtomicU64::new(0),
            prio_chain: Mutex::new(Vec::new()),
            io_latency_us: AtomicU64::new(0),
            used_sectors: AtomicU64::new(0),
            alloc_stop: AtomicBool::new(false),
            alloc_wake: (Mutex::new(false), Condvar::new()),
        }))
    }

    /// First sector of a bucket
    pub fn bucket_to_sector(&self, bucket: u64) -> u64 {
        bucket * self.cfg.bucket_sectors as u64
    }

    /// Bucket containing a device sector
    pub fn sector_to_bucket(&self, sector: u64) -> u64 {
        sector / self.cfg.bucket_sectors as u64
    }

    /// Bucket state for a device sector
    pub fn bucket_for_sector(&self, sector: u64) -> &Bucket {
        &self.buckets[self.sector_to_bucket(sector) as usize]
    }

    /// Whether a pointer generation no longer matches its bucket
    pub fn ptr_stale(&self, sector: u64, gen: u8) -> bool {
        self.bucket_for_sector(sector).gen() != gen
    }

    /// Clock for a direction
    pub fn clock(&self, rw: Rw) -> &PrioClock {
        match rw {
            Rw::Read => &self.clocks[0],
            Rw::Write => &self.clocks[1],
        }
    }

    /// Advance a priority clock by completed IO, rescaling every bucket
    /// priority if the hand is about to wrap.
    pub fn increment_clock(&self, sectors: u64, rw: Rw) {
        if self.clock(rw).advance(sectors) {
            for b in &self.buckets {
                b.rescale_prio(rw);
            }
            self.clock(rw).finish_rescale();
            log::debug!("device {}: rescaled {:?} priorities", self.idx, rw);
        }
    }

    /// Record a completed IO's latency; returns the new EWMA in
    /// microseconds
    pub fn note_io_latency(&self, elapsed: Duration) -> u64 {
        let us = elapsed.as_micros() as u64;
        let mut old = self.io_latency_us.load(Ordering::Relaxed);
        loop {
            let new = old - (old >> LATENCY_EWMA_SHIFT) + (us >> LATENCY_EWMA_SHIFT);
            match self.io_latency_us.compare_exchange_weak(
                old,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return new,
                Err(cur) => old = cur,
            }
        }
    }

    /// IO latency EWMA in microseconds
    pub fn io_latency_us(&self) -> u64 {
        self.io_latency_us.load(Ordering::Relaxed)
    }

    /// Count a hard IO error
    pub fn note_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Account live data sectors for capacity tracking
    pub fn add_used_sectors(&self, sectors: u64) {
        self.used_sectors.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Release live data sectors
    pub fn sub_used_sectors(&self, sectors: u64) {
        self.used_sectors.fetch_sub(sectors, Ordering::Relaxed);
    }

    /// Live data sectors on this device
    pub fn used_sectors(&self) -> u64 {
        self.used_sectors.load(Ordering::Relaxed)
    }

    /// Data capacity in sectors, excluding the metadata head
    pub fn data_sectors(&self) -> u64 {
        (self.cfg.nbuckets - self.cfg.first_bucket) * self.cfg.bucket_sectors as u64
    }

    /// Wake the allocator worker
    pub fn wake_allocator(&self) {
        let (lock, cvar) = &self.alloc_wake;
        let mut pending = lock.lock();
        *pending = true;
        cvar.notify_one();
    }

    /// Park the allocator worker until woken or `timeout` elapses
    pub(crate) fn allocator_wait(&self, timeout: Duration) {
        let (lock, cvar) = &self.alloc_wake;
        let mut pending = lock.lock();
        if !*pending {
            let _ = cvar.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }

    /// Ask the allocator worker to exit
    pub fn stop_allocator(&self) {
        self.alloc_stop.store(true, Ordering::Release);
        self.wake_allocator();
    }

    /// Whether the allocator worker should exit
    pub(crate) fn allocator_stopping(&self) -> bool {
        self.alloc_stop.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("idx", &self.idx)
            .field("tier", &self.cfg.tier)
            .field("nbuckets", &self.cfg.nbuckets)
            .field("bucket_sectors", &self.cfg.bucket_sectors)
            .finish()
    }
}

/// A group of devices allocations draw from (a tier, or a write point's
/// target group). Device selection rotates `cur_device` round-robin.
#[derive(Debug, Default)]
pub struct CacheGroup {
    devices: RwLock<Vec<Arc<Device>>>,
    cur_device: AtomicUsize,
}

impl CacheGroup {
    /// Add a device to the group
    pub fn add(&self, dev: Arc<Device>) {
        let mut devs = self.devices.write();
        if !devs.iter().any(|d| d.idx == dev.idx) {
            devs.push(dev);
        }
    }

    /// Remove a device from the group
    pub fn remove(&self, idx: u8) {
        self.devices.write().retain(|d| d.idx != idx);
    }

    /// Snapshot of the member devices
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    /// Number of member devices
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether the group has no members
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Next device in round-robin order
    pub fn next_device(&self) -> Option<Arc<Device>> {
        let devs = self.devices.read();
        if devs.is_empty() {
            return None;
        }
        let i = self.cur_device.fetch_add(1, Ordering::Relaxed) % devs.len();
        Some(Arc::clone(&devs[i]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Arc<Device> {
        let cfg = DeviceConfig {
            nbuckets: 64,
            bucket_sectors: 8,
            first_bucket: 1,
            ..DeviceConfig::default()
        };
        let backend = Arc::new(MemBackend::new(64 * 8, true));
        Device::new(0, cfg, backend).unwrap()
    }

    #[test]
    fn geometry() {
        let dev = test_device();
        assert_eq!(dev.bucket_to_sector(3), 24);
        assert_eq!(dev.sector_to_bucket(25), 3);
        assert_eq!(dev.data_sectors(), 63 * 8);
    }

    #[test]
    fn stale_pointer_detection() {
        let dev = test_device();
        let gen = dev.buckets[2].gen();
        assert!(!dev.ptr_stale(dev.bucket_to_sector(2), gen));
        dev.buckets[2].bump_gen();
        assert!(dev.ptr_stale(dev.bucket_to_sector(2), gen));
    }

    #[test]
    fn bad_geometry_rejected() {
        let backend = Arc::new(MemBackend::new(64, true));
        let cfg = DeviceConfig {
            nbuckets: 64,
            bucket_sectors: 8,
            ..DeviceConfig::default()
        };
        assert!(Device::new(0, cfg, backend).is_err());

        let backend = Arc::new(MemBackend::new(640, true));
        let cfg = DeviceConfig {
            nbuckets: 64,
            bucket_sectors: 10,
            ..DeviceConfig::default()
        };
        assert!(Device::new(0, cfg, backend).is_err());
    }

    #[test]
    fn group_round_robin() {
        let group = CacheGroup::default();
        assert!(group.next_device().is_none());
        group.add(test_device());
        let d1 = {
            let cfg = DeviceConfig {
                nbuckets: 64,
                bucket_sectors: 8,
                first_bucket: 1,
                ..DeviceConfig::default()
            };
            Device::new(1, cfg, Arc::new(MemBackend::new(64 * 8, true))).unwrap()
        };
        group.add(d1);
        let a = group.next_device().unwrap().idx;
        let b = group.next_device().unwrap().idx;
        assert_ne!(a, b);
    }
}
