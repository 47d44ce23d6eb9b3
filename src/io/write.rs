//! Extent write pipeline.
//!
//! A write op covers a contiguous logical range. Per segment (up to
//! 128 KiB) the pipeline compresses into a bounce buffer if configured,
//! acquires sectors from the write point, fans the payload out to every
//! replica with checksums computed inline, and inserts the resulting
//! extent key transactionally with a journal entry.
//!
//! Replica failures: the write commits with the surviving pointers as
//! long as at least `required_replicas` remain; otherwise it retries on
//! fresh buckets a bounded number of times before reporting `IOError`
//! (or degrading to a discard of the range with `DISCARD_ON_ERROR`).

use crate::alloc::{
    alloc_sectors_append_ptrs, alloc_sectors_done, alloc_sectors_start, write_point_reset,
    WritePoint,
};
use crate::btree::insert::{btree_delete_range, btree_insert};
use crate::btree::BtreeId;
use crate::core::keys::{
    Bkey, BkeyI, ChecksumType, CompressionType, ExtentCrc, ExtentValue,
};
use crate::core::{EngineError, Result, SECTOR_SIZE, WRITE_SEGMENT_SECTORS};
use crate::device::freelist::Reserve;
use crate::extent::csum_data;
use crate::io::submit_write;
use crate::set::CacheSet;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Write op flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Insert pointers as clean cached copies (reclaimable)
        const CACHED = 1 << 0;
        /// Flush the journal through this write's sequence before
        /// completing
        const FLUSH = 1 << 1;
        /// Drop the covered range instead of writing data
        const DISCARD = 1 << 2;
        /// Never block on allocation; fail with NoSpace instead
        const ALLOC_NOWAIT = 1 << 3;
        /// Turn a terminal write failure into a discard of the range
        const DISCARD_ON_ERROR = 1 << 4;
    }
}

/// How many times a failing segment is retried on fresh buckets
const WRITE_RETRIES: usize = 3;

/// One logical write against the extents tree
pub struct WriteOp<'a> {
    /// The set
    pub c: &'a Arc<CacheSet>,
    /// Allocation context
    pub wp: Arc<WritePoint>,
    /// Logical device
    pub inode: u64,
    /// Starting sector
    pub sector: u64,
    /// Flags
    pub flags: WriteFlags,
    /// Replicas to write
    pub nr_replicas: usize,
    /// Replicas that must survive for the write to commit
    pub required_replicas: usize,
    /// Allocation reserve class
    pub reserve: Reserve,
    /// Compression to attempt
    pub compression: CompressionType,
    /// Data checksum type
    pub csum_type: ChecksumType,
}

impl<'a> WriteOp<'a> {
    /// A foreground data write
    pub fn new(c: &'a Arc<CacheSet>, wp: Arc<WritePoint>, inode: u64, sector: u64) -> WriteOp<'a> {
        WriteOp {
            c,
            wp,
            inode,
            sector,
            flags: WriteFlags::empty(),
            nr_replicas: 1,
            required_replicas: 1,
            reserve: Reserve::None,
            compression: CompressionType::None,
            csum_type: ChecksumType::Blake3_64,
        }
    }

    /// Execute the op over `data`, which must be sector aligned (empty
    /// for discards). Returns the highest journal sequence committed.
    pub fn execute(&self, data: &[u8], discard_sectors: u64) -> Result<u64> {
        if self.c.is_read_only() {
            return Err(EngineError::Corrupted("set is read-only".into()));
        }
        if self.flags.contains(WriteFlags::DISCARD) {
            let sectors = if data.is_empty() {
                discard_sectors
            } else {
                (data.len() / SECTOR_SIZE) as u64
            };
            let seq = btree_delete_range(self.c, self.inode, self.sector, self.sector + sectors)?;
            if self.flags.contains(WriteFlags::FLUSH) {
                self.c.journal.flush_seq(seq)?;
                self.flush_devices();
            }
            return Ok(seq);
        }

        debug_assert!(data.len() % SECTOR_SIZE == 0);
        let total_sectors = (data.len() / SECTOR_SIZE) as u64;
        let mut pos = 0u64;
        let mut last_seq = 0u64;

        while pos < total_sectors {
            let seq = self.write_segment(data, total_sectors, &mut pos)?;
            last_seq = seq;
        }

        if self.flags.contains(WriteFlags::FLUSH) {
            self.c.journal.flush_seq(last_seq)?;
            self.flush_devices();
        }
        self.c.stats.sectors_written.add(total_sectors);
        Ok(last_seq)
    }

    fn flush_devices(&self) {
        for dev in self.c.devices() {
            if let Err(e) = dev.backend.flush() {
                log::warn!("device {}: flush failed: {}", dev.idx, e);
            }
        }
    }

    /// Write one segment starting at `*pos`, advancing it on success
    fn write_segment(&self, data: &[u8], total_sectors: u64, pos: &mut u64) -> Result<u64> {
        let nowait = self.flags.contains(WriteFlags::ALLOC_NOWAIT);
        let cached = self.flags.contains(WriteFlags::CACHED);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ob = alloc_sectors_start(self.c, &self.wp, self.nr_replicas, self.reserve, nowait)?;

            let seg_sectors = (total_sectors - *pos)
                .min(WRITE_SEGMENT_SECTORS)
                .min(ob.sectors_free() as u64);
            if seg_sectors == 0 {
                alloc_sectors_done(self.c, &self.wp, &ob);
                write_point_reset(self.c, &self.wp);
                continue;
            }

            let from = (*pos as usize) * SECTOR_SIZE;
            let slice = &data[from..from + seg_sectors as usize * SECTOR_SIZE];
            let (payload, crc) = self.build_payload(slice, seg_sectors);
            let payload_sectors = (payload.len() / SECTOR_SIZE) as u32;

            let mut value = ExtentValue { crc, ptrs: Vec::new() };
            let targets =
                match alloc_sectors_append_ptrs(&mut value, &ob, payload_sectors, cached) {
                    Ok(t) => t,
                    Err(e) => {
                        alloc_sectors_done(self.c, &self.wp, &ob);
                        return Err(e);
                    }
                };

            let mut surviving = Vec::new();
            for (i, (dev, sector)) in targets.iter().enumerate() {
                match submit_write(self.c, dev, *sector, &payload) {
                    Ok(()) => surviving.push(value.ptrs[i]),
                    Err(e) => {
                        log::warn!(
                            "replica write to dev {} sector {} failed: {}",
                            dev.idx,
                            sector,
                            e
                        );
                        // The sectors we accounted for this replica hold
                        // no live data now.
                        let kind = if cached {
                            crate::device::bucket::SectorKind::Cached
                        } else {
                            crate::device::bucket::SectorKind::Dirty
                        };
                        dev.bucket_for_sector(*sector)
                            .sub_sectors(kind, payload_sectors as u16);
                        dev.sub_used_sectors(payload_sectors as u64);
                    }
                }
            }
            alloc_sectors_done(self.c, &self.wp, &ob);

            if surviving.len() < self.required_replicas.max(1) {
                write_point_reset(self.c, &self.wp);
                if attempt <= WRITE_RETRIES {
                    log::warn!(
                        "write segment at {}:{} retrying on fresh buckets ({}/{})",
                        self.inode,
                        self.sector + *pos,
                        attempt,
                        WRITE_RETRIES
                    );
                    continue;
                }
                if self.flags.contains(WriteFlags::DISCARD_ON_ERROR) {
                    let start = self.sector + *pos;
                    let seq =
                        btree_delete_range(self.c, self.inode, start, start + seg_sectors)?;
                    *pos += seg_sectors;
                    return Ok(seq);
                }
                return Err(EngineError::Io("write failed on all replicas".into()));
            }

            value.ptrs = surviving;
            let end = self.sector + *pos + seg_sectors;
            let key = BkeyI::extent(Bkey::extent(self.inode, end, seg_sectors), value);
            let seq = btree_insert(self.c, BtreeId::Extents, key)?;

            *pos += seg_sectors;
            return Ok(seq);
        }
    }

    /// Build the stored payload: optionally compressed (with an exact
    /// length prefix), sector padded, checksummed.
    fn build_payload(&self, slice: &[u8], seg_sectors: u64) -> (Vec<u8>, Option<ExtentCrc>) {
        let mut compressed: Option<Vec<u8>> = None;
        if self.compression == CompressionType::Lz4 {
            if let Ok(c) = lz4::block::compress(slice, None, false) {
                let stored = 4 + c.len();
                let padded = stored.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
                if padded < slice.len() {
                    let mut buf = Vec::with_capacity(padded);
                    buf.extend_from_slice(&(c.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&c);
                    buf.resize(padded, 0);
                    compressed = Some(buf);
                }
            }
        }

        match compressed {
            Some(buf) => {
                let crc = ExtentCrc {
                    compressed_sectors: (buf.len() / SECTOR_SIZE) as u32,
                    uncompressed_sectors: seg_sectors as u32,
                    offset_sectors: 0,
                    csum_type: self.csum_type,
                    compression_type: CompressionType::Lz4,
                    csum: csum_data(self.csum_type, &buf),
                };
                (buf, Some(crc))
            }
            None if self.csum_type != ChecksumType::None => {
                let crc = ExtentCrc {
                    compressed_sectors: seg_sectors as u32,
                    uncompressed_sectors: seg_sectors as u32,
                    offset_sectors: 0,
                    csum_type: self.csum_type,
                    compression_type: CompressionType::None,
                    csum: csum_data(self.csum_type, slice),
                };
                (slice.to_vec(), Some(crc))
            }
            None => (slice.to_vec(), None),
        }
    }
}
