//! Blockdev volumes: logical block devices carved straight out of the
//! cache set, with no backing device. Reads return zeroes for holes;
//! writes take a disk reservation first and fail with `NoSpace` when the
//! set cannot hold them.

use crate::btree::insert::btree_insert;
use crate::btree::iter::BtreeIter;
use crate::btree::BtreeId;
use crate::core::keys::{Bkey, BkeyI, Bpos};
use crate::core::{EngineError, Result, SECTOR_SIZE};
use crate::extent::pick_ptr;
use crate::io::read::read_extent;
use crate::io::write::{WriteFlags, WriteOp};
use crate::io::{Bio, BioFlags, BioOp};
use crate::set::CacheSet;
use std::sync::Arc;

/// A flash-only logical block device
pub struct BlockdevVolume {
    /// The set
    pub c: Arc<CacheSet>,
    /// Extents for this volume live under this inode
    pub inode: u64,
    /// Volume size in sectors
    pub size_sectors: u64,
}

impl BlockdevVolume {
    /// Create a volume of `size_sectors`, recording it in the inodes
    /// btree.
    pub fn create(c: Arc<CacheSet>, size_sectors: u64) -> Result<Arc<BlockdevVolume>> {
        let inode = c.alloc_inode();
        let mut key = BkeyI::discard(Bkey {
            p: Bpos::new(inode, 0),
            size: 0,
            version: 0,
        });
        // The inode record's version carries the size for bring-up.
        key.k.version = (size_sectors & 0xffff_ffff) as u32;
        btree_insert(&c, BtreeId::Inodes, key)?;

        log::info!("created blockdev volume inode {} ({} sectors)", inode, size_sectors);
        Ok(Arc::new(BlockdevVolume {
            c,
            inode,
            size_sectors,
        }))
    }

    /// ioctl surface: volumes take none
    pub fn ioctl(&self, _cmd: u32, _arg: u64) -> Result<i64> {
        Err(EngineError::NotSupported("volume ioctl"))
    }

    /// Service one request
    pub fn make_request(&self, bio: &mut Bio) -> Result<()> {
        if bio.end_sector() > self.size_sectors {
            return Err(EngineError::Io(format!(
                "IO past end of volume: sector {} + {}",
                bio.sector,
                bio.sectors()
            )));
        }

        if bio.is_flush_only() {
            return self.c.journal.flush_all();
        }

        match bio.op {
            BioOp::Read => self.read(bio),
            BioOp::Write | BioOp::Discard => self.write(bio),
        }
    }

    fn read(&self, bio: &mut Bio) -> Result<()> {
        let c = Arc::clone(&self.c);
        let total = bio.sectors();
        let mut iter = BtreeIter::new(
            Arc::clone(&c),
            BtreeId::Extents,
            Bpos::new(self.inode, bio.sector),
            0,
        );

        let mut covered = 0u64;
        while covered < total {
            let pos = bio.sector + covered;
            iter.set_pos(Bpos::new(self.inode, pos));
            let k = match iter.peek_with_holes()? {
                Some(k) => k,
                None => break,
            };
            iter.unlock_all();

            let sectors = (k.k.p.offset - pos).min(total - covered);
            let from = covered as usize * SECTOR_SIZE;
            let to = from + sectors as usize * SECTOR_SIZE;

            if k.is_data() {
                match pick_ptr(&c, &k)? {
                    Some(pick) => {
                        let skip = pos - k.k.start().offset;
                        match read_extent(&c, &k, &pick, skip, &mut bio.data[from..to]) {
                            Ok(_) => {}
                            Err(EngineError::Stale) => {
                                c.stats.cache_read_races.add(1);
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    None => bio.data[from..to].fill(0),
                }
            } else {
                // Hole: a volume has no backing device, reads as zeroes.
                bio.data[from..to].fill(0);
            }
            covered += sectors;
        }
        Ok(())
    }

    fn write(&self, bio: &mut Bio) -> Result<()> {
        let c = Arc::clone(&self.c);

        let mut flags = WriteFlags::empty();
        if bio.flags.intersects(BioFlags::PREFLUSH | BioFlags::FUA) {
            flags |= WriteFlags::FLUSH;
        }
        if bio.op == BioOp::Discard {
            flags |= WriteFlags::DISCARD;
        } else {
            // Volumes reserve space up front; the cache never evicts
            // their only copy, so over-committing is not an option.
            c.disk_reservation(bio.sectors())?;
        }

        let op = WriteOp {
            c: &c,
            wp: c.foreground_write_point(),
            inode: self.inode,
            sector: bio.sector,
            flags,
            nr_replicas: c.config.data_replicas,
            required_replicas: c.config.required_replicas,
            reserve: crate::device::freelist::Reserve::None,
            compression: c.config.compression,
            csum_type: c.config.csum_type,
        };
        op.execute(&bio.data, bio.discard_sectors)?;
        Ok(())
    }
}
