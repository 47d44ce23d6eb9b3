//! # The cache set
//!
//! One [`CacheSet`] owns the member devices, the btree cache and roots,
//! the journal, the open-bucket pool and write points, and the set-wide
//! statistics. Foreground IO runs on the submitter's thread; background
//! work (per-device allocators, writeback workers) runs on dedicated
//! threads started at bring-up.

use crate::alloc::{recalc_capacity, sectors_available, OpenBucketPool, WritePoint};
use crate::btree::cache::{node_write, BtreeCache};
use crate::btree::insert::btree_root_alloc;
use crate::btree::{BtreeId, BtreeNode, BtreeRoot, NodeFlags, BTREE_ID_NR, DEFAULT_NODE_SECTORS};
use crate::core::counters::ShardedU64;
use crate::core::keys::{ChecksumType, CompressionType};
use crate::core::{EngineError, Result, CONGESTED_MAX, SECTOR_SIZE, WRITE_POINT_COUNT};
use crate::device::freelist::{drive_allocator_once, run_allocator};
use crate::device::prio::prio_write;
use crate::device::{BlockBackend, CacheGroup, Device, DeviceConfig};
use crate::journal::Journal;
use crate::shrinker::{Shrinker, ShrinkerRegistry};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use uuid::Uuid;

/// Number of device tiers
pub const TIER_NR: usize = 2;

/// Set-wide configuration
#[derive(Debug, Clone)]
pub struct CacheSetConfig {
    /// Set identity
    pub uuid: Uuid,
    /// Btree node size in sectors (power of two)
    pub btree_node_sectors: u32,
    /// Cache block size in sectors; unaligned IO bypasses
    pub block_sectors: u32,
    /// Node cache memory budget, in containers
    pub btree_cache_max_nodes: usize,
    /// Replicas for foreground data writes
    pub data_replicas: usize,
    /// Replicas that must survive for a write to commit
    pub required_replicas: usize,
    /// Compression for data extents
    pub compression: CompressionType,
    /// Checksums for data extents
    pub csum_type: ChecksumType,
}

impl Default for CacheSetConfig {
    fn default() -> Self {
        CacheSetConfig {
            uuid: Uuid::nil(),
            btree_node_sectors: DEFAULT_NODE_SECTORS,
            block_sectors: 8,
            btree_cache_max_nodes: 1024,
            data_replicas: 1,
            required_replicas: 1,
            compression: CompressionType::None,
            csum_type: ChecksumType::Blake3_64,
        }
    }
}

/// Set-wide hot counters
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Data sectors written through the pipeline
    pub sectors_written: ShardedU64,
    /// Sectors that bypassed the cache
    pub sectors_bypassed: ShardedU64,
    /// Full cache hits
    pub cache_hits: ShardedU64,
    /// Cache misses
    pub cache_misses: ShardedU64,
    /// Hits on bypassed requests
    pub cache_bypass_hits: ShardedU64,
    /// Misses on bypassed requests
    pub cache_bypass_misses: ShardedU64,
    /// Reads that lost the bucket-reuse race and retried
    pub cache_read_races: ShardedU64,
    /// Requests completed
    pub requests: ShardedU64,
    /// Total request service time in microseconds
    pub request_us: ShardedU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Data sectors written
    pub sectors_written: u64,
    /// Sectors bypassed
    pub sectors_bypassed: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Stale-pointer read races
    pub cache_read_races: u64,
}

/// The cache set
pub struct CacheSet {
    /// Configuration fixed at open
    pub config: CacheSetConfig,
    /// The btree node cache
    pub btree_cache: BtreeCache,
    /// The journal
    pub journal: Journal,
    /// The open-bucket pool
    pub open_buckets: OpenBucketPool,
    /// Hot counters
    pub stats: CacheStats,
    /// Memory-pressure registry
    pub shrinkers: ShrinkerRegistry,

    devices: RwLock<Vec<Arc<Device>>>,
    tiers: [Arc<CacheGroup>; TIER_NR],
    btree_roots: [BtreeRoot; BTREE_ID_NR],
    write_points: Vec<Arc<WritePoint>>,
    promote_wp: Arc<WritePoint>,
    capacity: AtomicU64,
    next_inode: AtomicU64,
    read_only: AtomicBool,

    congested: AtomicI32,
    congested_last: Mutex<Option<Instant>>,
    congested_read_threshold_us: AtomicU64,
    congested_write_threshold_us: AtomicU64,

    alloc_threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CacheSet {
    /// Open an empty set; add devices, then [`start`](Self::start)
    pub fn open(config: CacheSetConfig) -> Arc<CacheSet> {
        let max_nodes = config.btree_cache_max_nodes;
        Arc::new(CacheSet {
            config,
            btree_cache: BtreeCache::new(max_nodes),
            journal: Journal::new(),
            open_buckets: OpenBucketPool::default(),
            stats: CacheStats::default(),
            shrinkers: ShrinkerRegistry::default(),
            devices: RwLock::new(Vec::new()),
            tiers: [Arc::new(CacheGroup::default()), Arc::new(CacheGroup::default())],
            btree_roots: Default::default(),
            write_points: (0..WRITE_POINT_COUNT)
                .map(|_| Arc::new(WritePoint::new(true)))
                .collect(),
            promote_wp: Arc::new(WritePoint::new(false)),
            capacity: AtomicU64::new(0),
            next_inode: AtomicU64::new(1),
            read_only: AtomicBool::new(false),
            congested: AtomicI32::new(0),
            congested_last: Mutex::new(None),
            congested_read_threshold_us: AtomicU64::new(0),
            congested_write_threshold_us: AtomicU64::new(0),
            alloc_threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Register a member device. Must happen before [`start`](Self::start).
    pub fn add_device(
        &self,
        cfg: DeviceConfig,
        backend: Arc<dyn BlockBackend>,
    ) -> Result<Arc<Device>> {
        if cfg.bucket_sectors < self.config.btree_node_sectors {
            return Err(EngineError::Corrupted(format!(
                "bucket size {} smaller than btree node size {}",
                cfg.bucket_sectors, self.config.btree_node_sectors
            )));
        }
        let mut devices = self.devices.write();
        let idx = devices.len() as u8;
        let tier = (cfg.tier as usize).min(TIER_NR - 1);
        let dev = Device::new(idx, cfg, backend)?;
        devices.push(Arc::clone(&dev));
        self.tiers[tier].add(Arc::clone(&dev));
        drop(devices);
        log::info!("added device {} (tier {})", idx, tier);
        Ok(dev)
    }

    /// Bring the set online: fill the free lists, start the per-device
    /// allocator workers, create btree roots, compute capacity, register
    /// the node-cache shrinker.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for dev in self.devices() {
            drive_allocator_once(&dev);
        }
        recalc_capacity(self);

        for id in BtreeId::all() {
            if self.btree_root(id).is_none() {
                btree_root_alloc(self, id)?;
            }
        }

        let mut threads = self.alloc_threads.lock();
        for dev in self.devices() {
            let d = Arc::clone(&dev);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("alloc/{}", dev.idx))
                    .spawn(move || run_allocator(d))
                    .expect("spawning allocator"),
            );
        }
        drop(threads);

        let weak: Weak<CacheSet> = Arc::downgrade(self);
        let weak2 = weak.clone();
        self.shrinkers.register(Shrinker {
            name: "btree-cache".into(),
            count: Box::new(move || {
                weak.upgrade().map_or(0, |c| c.btree_cache.shrink_count())
            }),
            scan: Box::new(move |nr| {
                weak2
                    .upgrade()
                    .map_or(0, |c| c.btree_cache.shrink_scan(&c, nr))
            }),
        });

        log::info!("cache set {} started", self.config.uuid);
        Ok(())
    }

    /// Stop: halt workers, flush the journal, write back dirty nodes and
    /// priorities.
    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for dev in self.devices() {
            dev.stop_allocator();
        }
        for t in self.alloc_threads.lock().drain(..) {
            let _ = t.join();
        }

        if let Err(e) = self.journal.flush_all() {
            log::error!("journal flush at stop failed: {}", e);
        }

        for id in BtreeId::all() {
            if let Some(root) = self.btree_root(id) {
                self.flush_subtree(&root);
            }
        }

        for dev in self.devices() {
            drive_allocator_once(&dev);
            if let Err(e) = prio_write(&dev) {
                log::error!("device {}: priority write at stop failed: {}", dev.idx, e);
            }
        }
        log::info!("cache set {} stopped", self.config.uuid);
    }

    fn flush_subtree(&self, node: &Arc<BtreeNode>) {
        if node.level() > 0 {
            let children: Vec<_> = node
                .data
                .read()
                .as_ref()
                .map(|d| d.merged_keys())
                .unwrap_or_default();
            for child_key in children {
                if let Some(child) = self.btree_cache.node_find(&child_key) {
                    self.flush_subtree(&child);
                }
            }
        }
        if node.has_flag(NodeFlags::DIRTY) {
            node.lock.lock_read();
            if let Err(e) = node_write(self, node) {
                log::error!("flushing node {} failed: {}", node.uid, e);
            }
            node.lock.unlock_read();
        }
    }

    /// Member devices
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    /// A member device by index
    pub fn device(&self, idx: u8) -> Option<Arc<Device>> {
        self.devices.read().get(idx as usize).cloned()
    }

    /// The device group of a tier
    pub fn tier_group(&self, tier: usize) -> Arc<CacheGroup> {
        Arc::clone(&self.tiers[tier.min(TIER_NR - 1)])
    }

    /// Current root of a btree
    pub fn btree_root(&self, id: BtreeId) -> Option<Arc<BtreeNode>> {
        self.btree_roots[id as usize].node.read().clone()
    }

    /// Swap in a new root (root split / bring-up) and recompute the node
    /// cache reserve.
    pub fn set_btree_root(&self, id: BtreeId, node: Arc<BtreeNode>) {
        *self.btree_roots[id as usize].node.write() = Some(node);
        let levels: Vec<Option<u8>> = BtreeId::all()
            .iter()
            .map(|&i| self.btree_root(i).map(|r| r.level()))
            .collect();
        self.btree_cache.recalc_reserve(&levels);
    }

    /// Btree node size in bytes
    pub fn node_bytes(&self) -> usize {
        self.config.btree_node_sectors as usize * SECTOR_SIZE
    }

    /// Allocate a logical device id
    pub fn alloc_inode(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::Relaxed)
    }

    /// Whole-set capacity in sectors
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn set_capacity(&self, sectors: u64) {
        self.capacity.store(sectors, Ordering::Release);
    }

    /// The per-thread foreground write point
    pub fn foreground_write_point(&self) -> Arc<WritePoint> {
        let token = std::thread::current().id();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        token.hash(&mut hasher);
        let i = hasher.finish() as usize % self.write_points.len();
        Arc::clone(&self.write_points[i])
    }

    /// The promotion write point
    pub fn promote_write_point(&self) -> Arc<WritePoint> {
        Arc::clone(&self.promote_wp)
    }

    /// Reserve space for a volume write; `NoSpace` when the set cannot
    /// hold it.
    pub fn disk_reservation(&self, sectors: u64) -> Result<()> {
        if sectors_available(self) < sectors {
            return Err(EngineError::NoSpace("disk reservation"));
        }
        Ok(())
    }

    /// Escalate a corruption: the set goes read-only
    pub fn mark_corrupted(&self, e: &EngineError) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            log::error!("going read-only: {}", e);
        }
    }

    /// Whether the set has been forced read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Congestion thresholds in microseconds (read, write); zero disables
    pub fn congested_thresholds(&self) -> (u64, u64) {
        (
            self.congested_read_threshold_us.load(Ordering::Relaxed),
            self.congested_write_threshold_us.load(Ordering::Relaxed),
        )
    }

    /// Set the congestion thresholds
    pub fn set_congested_thresholds(&self, read_us: u64, write_us: u64) {
        self.congested_read_threshold_us
            .store(read_us, Ordering::Relaxed);
        self.congested_write_threshold_us
            .store(write_us, Ordering::Relaxed);
    }

    /// Microseconds since the last congestion event
    pub fn us_since_congested(&self) -> i64 {
        match *self.congested_last.lock() {
            None => i64::MAX,
            Some(t) => t.elapsed().as_micros().min(i64::MAX as u128) as i64,
        }
    }

    /// Current congestion counter (negative while congested)
    pub fn congested_count(&self) -> i32 {
        self.congested.load(Ordering::Relaxed)
    }

    /// Device IO completed; feed the congestion signal
    pub fn note_io_time(&self, elapsed: std::time::Duration, is_write: bool) {
        let threshold = if is_write {
            self.congested_write_threshold_us.load(Ordering::Relaxed)
        } else {
            self.congested_read_threshold_us.load(Ordering::Relaxed)
        };
        if threshold == 0 {
            return;
        }
        let us = elapsed.as_micros() as u64;
        if us > threshold {
            *self.congested_last.lock() = Some(Instant::now());
            let _ = self
                .congested
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    (v > -CONGESTED_MAX).then(|| v - 1)
                });
        }
    }

    /// Request finished; update service-time stats
    pub fn note_request_done(&self, start: Instant) {
        self.stats.requests.add(1);
        self.stats
            .request_us
            .add(start.elapsed().as_micros().min(u64::MAX as u128) as u64);
    }

    /// Counter snapshot
    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            sectors_written: self.stats.sectors_written.sum(),
            sectors_bypassed: self.stats.sectors_bypassed.sum(),
            cache_hits: self.stats.cache_hits.sum(),
            cache_misses: self.stats.cache_misses.sum(),
            cache_read_races: self.stats.cache_read_races.sum(),
        }
    }
}

impl Drop for CacheSet {
    fn drop(&mut self) {
        for dev in self.devices.read().iter() {
            dev.stop_allocator();
        }
        for t in self.alloc_threads.lock().drain(..) {
            let _ = t.join();
        }
    }
}
