//! Cached devices: a backing block device fronted by the cache set.
//!
//! Reads walk the extents tree with a hole-synthesising cursor; each
//! overlapping extent becomes a device read (with stale-pointer retry),
//! each hole a backing-device read with optional promotion into the
//! cache. Writes route by mode: writeback inserts dirty extents and
//! completes, writethrough writes cache and backing in parallel, bypass
//! and discards go to the backing device and invalidate the cached range.

use crate::alloc::sectors_available;
use crate::btree::insert::btree_insert_check_key;
use crate::btree::iter::BtreeIter;
use crate::btree::BtreeId;
use crate::core::keys::{Bkey, Bpos, CompressionType};
use crate::core::{EngineError, Result, CUTOFF_CACHE_READA, SECTOR_SIZE};
use crate::device::BlockBackend;
use crate::extent::pick_ptr;
use crate::io::read::read_extent;
use crate::io::write::{WriteFlags, WriteOp};
use crate::io::{Bio, BioFlags, BioOp};
use crate::request::{check_should_bypass, mark_cache_accounting, Search, SequentialDetector};
use crate::set::CacheSet;
use crate::writeback::KeyBuf;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Cache mode of a cached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Write to cache and backing in parallel
    Writethrough,
    /// Write to cache only; a worker copies to backing later
    Writeback,
    /// Reads cached, writes go around the cache
    Writearound,
    /// Cache disabled
    None,
}

/// Writeback batch size in keys
const WRITEBACK_BATCH: usize = 32;

/// A backing device attached to the set
pub struct CachedDev {
    /// The cache set
    pub c: Arc<CacheSet>,
    /// Logical device id; extents for this device live under this inode
    pub inode: u64,
    /// The backing device
    pub backing: Arc<dyn BlockBackend>,
    /// Sequential detector feeding the bypass decision
    pub sequential: SequentialDetector,
    /// Dirty keys queued for writeback
    pub writeback_keys: KeyBuf,
    /// Read by the write path, write-held by the writeback worker while
    /// draining a batch
    pub writeback_lock: RwLock<()>,
    mode: Mutex<CacheMode>,
    sequential_cutoff: AtomicU64,
    promote: AtomicBool,
    verify: AtomicBool,
    torture: AtomicBool,
    detaching: AtomicBool,
    wb_running: AtomicBool,
    wb_stop: AtomicBool,
    wb_wake: (Mutex<bool>, Condvar),
    wb_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CachedDev {
    /// Attach a backing device to the set in `mode`. Spawns the
    /// writeback worker.
    pub fn attach(c: Arc<CacheSet>, backing: Arc<dyn BlockBackend>, mode: CacheMode) -> Arc<CachedDev> {
        let inode = c.alloc_inode();
        let dc = Arc::new(CachedDev {
            c,
            inode,
            backing,
            sequential: SequentialDetector::default(),
            writeback_keys: KeyBuf::default(),
            writeback_lock: RwLock::new(()),
            mode: Mutex::new(mode),
            sequential_cutoff: AtomicU64::new(0),
            promote: AtomicBool::new(true),
            verify: AtomicBool::new(false),
            torture: AtomicBool::new(false),
            detaching: AtomicBool::new(false),
            wb_running: AtomicBool::new(true),
            wb_stop: AtomicBool::new(false),
            wb_wake: (Mutex::new(false), Condvar::new()),
            wb_thread: Mutex::new(None),
        });

        let worker = {
            let dc = Arc::clone(&dc);
            std::thread::Builder::new()
                .name(format!("writeback/{}", inode))
                .spawn(move || writeback_worker(dc))
                .expect("spawning writeback worker")
        };
        *dc.wb_thread.lock() = Some(worker);

        log::info!("attached cached device inode {} in {:?} mode", inode, mode);
        dc
    }

    /// Detach: drain writeback and stop the worker
    pub fn detach(&self) {
        self.detaching.store(true, Ordering::Release);
        self.wb_stop.store(true, Ordering::Release);
        self.wake_writeback();
        if let Some(t) = self.wb_thread.lock().take() {
            let _ = t.join();
        }
        log::info!("detached cached device inode {}", self.inode);
    }

    /// Current cache mode
    pub fn mode(&self) -> CacheMode {
        *self.mode.lock()
    }

    /// Change cache mode
    pub fn set_mode(&self, mode: CacheMode) {
        *self.mode.lock() = mode;
    }

    /// Sequential cutoff in bytes; zero disables the detector
    pub fn sequential_cutoff(&self) -> u64 {
        self.sequential_cutoff.load(Ordering::Relaxed)
    }

    /// Set the sequential cutoff
    pub fn set_sequential_cutoff(&self, bytes: u64) {
        self.sequential_cutoff.store(bytes, Ordering::Relaxed);
    }

    /// Enable or disable read-miss promotion
    pub fn set_promote(&self, on: bool) {
        self.promote.store(on, Ordering::Relaxed);
    }

    /// Enable the verify-after-read debug mode
    pub fn set_verify(&self, on: bool) {
        self.verify.store(on, Ordering::Relaxed);
    }

    /// Enable the 1-in-4 random bypass torture test
    pub fn set_torture_bypass(&self, on: bool) {
        self.torture.store(on, Ordering::Relaxed);
    }

    /// Pause or resume the writeback worker; dirty keys queue up while
    /// paused
    pub fn set_writeback_running(&self, on: bool) {
        self.wb_running.store(on, Ordering::Release);
        if on {
            self.wake_writeback();
        }
    }

    pub(crate) fn torture_bypass(&self) -> bool {
        self.torture.load(Ordering::Relaxed)
    }

    pub(crate) fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::Acquire)
    }

    fn wake_writeback(&self) {
        let (lock, cvar) = &self.wb_wake;
        *lock.lock() = true;
        cvar.notify_one();
    }

    /// ioctl passthrough to the backing device
    pub fn ioctl(&self, cmd: u32, arg: u64) -> Result<i64> {
        self.backing.ioctl(cmd, arg)
    }

    /// Congestion aggregate over backing and cache devices
    pub fn congested(&self) -> bool {
        crate::io::get_congested(&self.c) > 0
    }

    /// Service one request. Completion is synchronous: when this returns
    /// the bio's payload (for reads) is filled and durability follows the
    /// flags.
    pub fn make_request(&self, bio: &mut Bio) -> Result<()> {
        if bio.is_flush_only() {
            // Flush the journal and send the flush on to the backing
            // device; no cache traffic.
            let start = std::time::Instant::now();
            self.c.journal.flush_all()?;
            let res = self.backing.flush();
            self.c.note_request_done(start);
            return res;
        }

        let bypass = check_should_bypass(self, bio);
        let mut s = Search::new(self.inode, bypass);

        let res = match bio.op {
            BioOp::Read => self.read(bio, &mut s),
            _ => self.write(bio, &mut s),
        };
        self.c.note_request_done(s.start_time);
        res
    }

    /// The read path
    fn read(&self, bio: &mut Bio, s: &mut Search) -> Result<()> {
        let c = Arc::clone(&self.c);
        let total = bio.sectors();
        let mut iter = BtreeIter::new(
            Arc::clone(&c),
            BtreeId::Extents,
            Bpos::new(s.inode, bio.sector),
            0,
        );

        let mut covered = 0u64;
        while covered < total {
            let pos = bio.sector + covered;
            iter.set_pos(Bpos::new(s.inode, pos));

            let k = match iter.peek_with_holes() {
                Ok(Some(k)) => k,
                Ok(None) => break,
                Err(e) => {
                    // Btree IO error; the cursor cannot make progress.
                    iter.unlock_all();
                    return self.read_error_fallback(bio, s, covered, e);
                }
            };
            // Work on a snapshot; drop tree locks before device IO.
            iter.unlock_all();

            let sectors = (k.k.p.offset - pos).min(total - covered);
            let from = covered as usize * SECTOR_SIZE;
            let to = from + sectors as usize * SECTOR_SIZE;

            if k.is_data() {
                match pick_ptr(&c, &k) {
                    Ok(Some(pick)) => {
                        let skip = pos - k.k.start().offset;
                        match read_extent(&c, &k, &pick, skip, &mut bio.data[from..to]) {
                            Ok(dirty) => {
                                s.read_dirty_data |= dirty;
                                covered += sectors;
                                continue;
                            }
                            Err(EngineError::Stale) => {
                                // Bucket reused under the read; re-peek.
                                c.stats.cache_read_races.add(1);
                                continue;
                            }
                            Err(e) => {
                                log::warn!(
                                    "cache read failed at {}:{}: {}",
                                    s.inode,
                                    pos,
                                    e
                                );
                                if matches!(e, EngineError::Corrupted(_)) {
                                    c.mark_corrupted(&e);
                                }
                                if !s.recoverable {
                                    return Err(e);
                                }
                                // Recoverable: fall through to the miss
                                // path and read from backing.
                            }
                        }
                    }
                    Ok(None) => {
                        // A data key whose pointers are all stale lost
                        // the bucket-reuse race since it was inserted.
                        c.stats.cache_read_races.add(1);
                    }
                    Err(e) => return Err(e),
                }
            }

            self.cache_miss(&mut iter, s, pos, sectors, &mut bio.data[from..to])?;
            covered += sectors;
        }
        drop(iter);

        mark_cache_accounting(&c, !s.cache_miss, s.bypass);

        #[cfg(feature = "verify")]
        if self.verify.load(Ordering::Relaxed) && s.recoverable && !s.read_dirty_data {
            self.verify_read(bio)?;
        }

        Ok(())
    }

    /// Unrecoverable btree error mid-read: retry the remainder against
    /// the backing device if nothing dirty was involved.
    fn read_error_fallback(
        &self,
        bio: &mut Bio,
        s: &Search,
        covered: u64,
        e: EngineError,
    ) -> Result<()> {
        if !s.recoverable || s.read_dirty_data {
            return Err(e);
        }
        log::warn!("read retry from backing device after: {}", e);
        let from = covered as usize * SECTOR_SIZE;
        self.backing
            .read_sectors(bio.sector + covered, &mut bio.data[from..])
    }

    /// Populate a missed range from the backing device, optionally
    /// reserving it and promoting the data into the cache.
    fn cache_miss(
        &self,
        iter: &mut BtreeIter,
        s: &mut Search,
        pos: u64,
        sectors: u64,
        out: &mut [u8],
    ) -> Result<()> {
        s.cache_miss = true;

        let promote = !s.bypass && self.promote.load(Ordering::Relaxed);
        let mut reserved = false;
        if promote {
            let replace = Bkey::extent(s.inode, pos + sectors, sectors);
            match btree_insert_check_key(&self.c, iter, &replace) {
                Ok(ok) => reserved = ok,
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
            iter.unlock_all();
        }

        if let Err(e) = self.backing.read_sectors(pos, out) {
            s.recoverable = false;
            return Err(e);
        }

        // Promotion is best-effort: cache-full must never block a
        // foreground read, and under space pressure it is not worth the
        // churn.
        let space_ok =
            sectors_available(&self.c) * 100 >= self.c.capacity() * CUTOFF_CACHE_READA;
        if promote && reserved && space_ok {
            let wp = self.c.promote_write_point();
            let op = WriteOp {
                c: &self.c,
                wp,
                inode: s.inode,
                sector: pos,
                flags: WriteFlags::CACHED
                    | WriteFlags::ALLOC_NOWAIT
                    | WriteFlags::DISCARD_ON_ERROR,
                nr_replicas: 1,
                required_replicas: 1,
                reserve: crate::device::freelist::Reserve::None,
                compression: self.c.config.compression,
                csum_type: self.c.config.csum_type,
            };
            if let Err(e) = op.execute(out, 0) {
                log::debug!("promotion of {}:{} skipped: {}", s.inode, pos, e);
            }
        }
        Ok(())
    }

    /// The write path
    fn write(&self, bio: &mut Bio, s: &mut Search) -> Result<()> {
        let c = Arc::clone(&self.c);
        let _wb = self.writeback_lock.read();

        let start = Bpos::new(s.inode, bio.sector);
        let end = Bpos::new(s.inode, bio.end_sector());
        let mut bypass = s.bypass;
        let mut writeback = false;

        if self.writeback_keys.check_overlapping(start, end) {
            // Dirty data undergoing background writeback overlaps; this
            // write must go the same way.
            bypass = false;
            writeback = true;
        }

        if bio.op == BioOp::Discard {
            bypass = true;
        }

        if self.mode() == CacheMode::Writeback && !bypass {
            writeback = true;
        }

        let mut flags = WriteFlags::DISCARD_ON_ERROR;
        if bio.flags.intersects(BioFlags::PREFLUSH | BioFlags::FUA) {
            flags |= WriteFlags::FLUSH;
        }

        if bypass {
            // Backing device only; discards the device cannot take are
            // simply dropped. Either way the cached range is invalidated.
            match bio.op {
                BioOp::Discard => {
                    if self.backing.supports_discard() {
                        self.backing.discard(bio.sector, bio.discard_sectors)?;
                    }
                }
                _ => self.backing.write_sectors(bio.sector, &bio.data)?,
            }
            let op = WriteOp {
                c: &c,
                wp: c.foreground_write_point(),
                inode: s.inode,
                sector: bio.sector,
                flags: flags | WriteFlags::DISCARD,
                nr_replicas: 1,
                required_replicas: 1,
                reserve: crate::device::freelist::Reserve::None,
                compression: CompressionType::None,
                csum_type: c.config.csum_type,
            };
            op.execute(&[], bio.sectors())?;
            return Ok(());
        }

        if writeback {
            if bio.flags.contains(BioFlags::PREFLUSH) {
                // The backing device needs the flush barrier even though
                // the payload stays in the cache.
                self.backing.flush()?;
            }
            let op = WriteOp {
                c: &c,
                wp: c.foreground_write_point(),
                inode: s.inode,
                sector: bio.sector,
                flags,
                nr_replicas: c.config.data_replicas,
                required_replicas: c.config.required_replicas,
                reserve: crate::device::freelist::Reserve::None,
                compression: c.config.compression,
                csum_type: c.config.csum_type,
            };
            op.execute(&bio.data, 0)?;

            let key = Bkey::extent(s.inode, bio.end_sector(), bio.sectors());
            self.writeback_keys.add(crate::core::keys::BkeyI::extent(
                key,
                crate::core::keys::ExtentValue::default(),
            ));
            self.wake_writeback();
            return Ok(());
        }

        // Writethrough: backing and cache in parallel, completion waits
        // for both.
        let backing_res = std::thread::scope(|scope| {
            let backing = scope.spawn(|| self.backing.write_sectors(bio.sector, &bio.data));

            let op = WriteOp {
                c: &c,
                wp: c.foreground_write_point(),
                inode: s.inode,
                sector: bio.sector,
                flags: flags | WriteFlags::CACHED | WriteFlags::ALLOC_NOWAIT,
                nr_replicas: 1,
                required_replicas: 1,
                reserve: crate::device::freelist::Reserve::None,
                compression: c.config.compression,
                csum_type: c.config.csum_type,
            };
            if let Err(e) = op.execute(&bio.data, 0) {
                log::debug!("writethrough cache insert skipped: {}", e);
            }

            backing.join().expect("backing writer panicked")
        });
        backing_res
    }

    /// Compare a completed cache read against the backing device
    #[cfg(feature = "verify")]
    fn verify_read(&self, bio: &Bio) -> Result<()> {
        let mut from_backing = vec![0u8; bio.data.len()];
        self.backing.read_sectors(bio.sector, &mut from_backing)?;
        if from_backing != bio.data {
            return Err(EngineError::Corrupted(format!(
                "verify failed: cached read of sector {} diverges from backing device",
                bio.sector
            )));
        }
        Ok(())
    }
}

/// Writeback worker: drain batches of dirty keys, copying them to the
/// backing device and converting the cache copies to clean.
fn writeback_worker(dc: Arc<CachedDev>) {
    log::debug!("writeback worker for inode {} running", dc.inode);
    loop {
        {
            let (lock, cvar) = &dc.wb_wake;
            let mut pending = lock.lock();
            if !*pending {
                let _ = cvar.wait_for(&mut pending, Duration::from_millis(50));
            }
            *pending = false;
        }
        if dc.wb_stop.load(Ordering::Acquire) && dc.writeback_keys.is_empty() {
            break;
        }
        if !dc.wb_running.load(Ordering::Acquire) && !dc.wb_stop.load(Ordering::Acquire) {
            continue;
        }

        let batch = dc.writeback_keys.start_batch(WRITEBACK_BATCH);
        if batch.is_empty() {
            if dc.wb_stop.load(Ordering::Acquire) {
                break;
            }
            continue;
        }

        let _wl = dc.writeback_lock.write();
        for queued in batch {
            if let Err(e) = writeback_one(&dc, &queued) {
                if e.is_transient() {
                    dc.writeback_keys.requeue(queued);
                } else {
                    log::error!(
                        "writeback of {}:{} failed: {}",
                        queued.k.p.inode,
                        queued.k.start().offset,
                        e
                    );
                    dc.writeback_keys.finish(&queued);
                }
            } else {
                dc.writeback_keys.finish(&queued);
            }
        }
    }
    log::debug!("writeback worker for inode {} stopped", dc.inode);
}

/// Copy one queued dirty range to the backing device and mark its
/// extents clean. The queued key is only a position hint; live extents
/// are re-read from the tree.
fn writeback_one(dc: &Arc<CachedDev>, queued: &crate::core::keys::BkeyI) -> Result<()> {
    let c = &dc.c;
    let inode = queued.k.p.inode;
    let end = queued.k.p.offset;
    let mut pos = queued.k.start().offset;
    let mut iter = BtreeIter::new(
        Arc::clone(c),
        BtreeId::Extents,
        Bpos::new(inode, pos),
        0,
    );

    while pos < end {
        iter.set_pos(Bpos::new(inode, pos));
        let Some(k) = iter.peek_with_holes()? else {
            break;
        };
        iter.unlock_all();

        let next = k.k.p.offset.min(end);
        if !k.is_data() || k.is_cached() {
            // Hole, or already clean / overwritten.
            pos = next;
            continue;
        }

        let sectors = k.k.size;
        let mut buf = vec![0u8; sectors as usize * SECTOR_SIZE];
        let Some(pick) = pick_ptr(c, &k)? else {
            pos = next;
            continue;
        };
        read_extent(c, &k, &pick, 0, &mut buf)?;

        dc.backing.write_sectors(k.k.start().offset, &buf)?;

        // Re-insert with cached pointers: the overwrite drops the dirty
        // accounting, then the same sectors come back as clean cached.
        let mut clean = k.clone();
        clean.k.version = clean.k.version.wrapping_add(1);
        for p in &mut clean.v.ptrs {
            p.cached = true;
        }
        crate::btree::insert::btree_insert(c, BtreeId::Extents, clean.clone())?;

        for p in &clean.v.ptrs {
            if let Some(dev) = c.device(p.dev) {
                let _ = dev.bucket_for_sector(p.offset).add_sectors(
                    crate::device::bucket::SectorKind::Cached,
                    sectors as u16,
                    dev.cfg.bucket_sectors,
                );
                dev.add_used_sectors(sectors);
            }
        }
        log::trace!(
            "writeback: {}:{} + {} sectors now clean",
            inode,
            k.k.start().offset,
            sectors
        );
        pos = next;
    }
    Ok(())
}
