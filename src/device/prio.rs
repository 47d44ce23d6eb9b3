//! On-disk priority sets.
//!
//! Bucket priorities and generations persist as a chain of buckets, each
//! holding a checksummed `prio_set` header followed by an array of
//! per-bucket `(read_prio, write_prio, generation)` entries. The chain is
//! rewritten copy-on-write: fresh buckets come from the PRIO reserve, the
//! old chain is released afterwards. Failure to read priorities blocks
//! device bring-up.

use crate::core::{EngineError, Result, SECTOR_SIZE};
use crate::device::bucket::SectorKind;
use crate::device::clock::Rw;
use crate::device::freelist::{bucket_alloc, Reserve};
use crate::device::Device;

const PRIO_SET_MAGIC: u64 = 0x5052_494f_5345_5453; // "PRIOSETS"

/// Header at the front of each prio bucket
const HEADER_BYTES: usize = 32;

/// One entry: read_prio u16 | write_prio u16 | gen u8 | pad
const ENTRY_BYTES: usize = 8;

/// Entries that fit in one bucket after the header
pub fn prios_per_bucket(dev: &Device) -> usize {
    (dev.cfg.bucket_sectors as usize * SECTOR_SIZE - HEADER_BYTES) / ENTRY_BYTES
}

/// Buckets needed to persist every bucket's priorities
pub fn prio_buckets(dev: &Device) -> usize {
    (dev.cfg.nbuckets as usize).div_ceil(prios_per_bucket(dev))
}

fn csum_of(buf: &[u8]) -> u64 {
    let hash = blake3::hash(&buf[8..]);
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

/// Write the full priority set, returning the head bucket of the new
/// chain. The previous chain's buckets are released for reclaim.
pub fn prio_write(dev: &Device) -> Result<u64> {
    let per = prios_per_bucket(dev);
    let nr = prio_buckets(dev);
    let bucket_bytes = dev.cfg.bucket_sectors as usize * SECTOR_SIZE;

    let mut chain = Vec::with_capacity(nr);
    for _ in 0..nr {
        let b = bucket_alloc(dev, Reserve::Prio)?;
        dev.buckets[b as usize]
            .add_sectors(SectorKind::Meta, dev.cfg.bucket_sectors as u16, dev.cfg.bucket_sectors)?;
        chain.push(b);
    }

    for (i, &b) in chain.iter().enumerate() {
        let mut buf = vec![0u8; bucket_bytes];
        let next = chain.get(i + 1).copied().unwrap_or(0);
        buf[8..16].copy_from_slice(&PRIO_SET_MAGIC.to_le_bytes());
        buf[16..24].copy_from_slice(&next.to_le_bytes());

        let base = i * per;
        let count = per.min(dev.cfg.nbuckets as usize - base);
        buf[24..28].copy_from_slice(&(count as u32).to_le_bytes());

        for j in 0..count {
            let bucket = &dev.buckets[base + j];
            let off = HEADER_BYTES + j * ENTRY_BYTES;
            buf[off..off + 2].copy_from_slice(&bucket.read_prio().to_le_bytes());
            buf[off + 2..off + 4].copy_from_slice(&bucket.write_prio().to_le_bytes());
            buf[off + 4] = bucket.gen();
        }

        let csum = csum_of(&buf);
        buf[0..8].copy_from_slice(&csum.to_le_bytes());
        dev.backend.write_sectors(dev.bucket_to_sector(b), &buf)?;
    }
    dev.backend.flush()?;

    let old = std::mem::replace(&mut *dev.prio_chain.lock(), chain.clone());
    for b in old {
        dev.buckets[b as usize].sub_sectors(SectorKind::Meta, dev.cfg.bucket_sectors as u16);
    }

    log::debug!(
        "device {}: wrote {} prio buckets, head {}",
        dev.idx,
        nr,
        chain[0]
    );
    Ok(chain[0])
}

/// Read the priority chain starting at `head`, restoring every bucket's
/// priorities and generation.
pub fn prio_read(dev: &Device, head: u64) -> Result<()> {
    let per = prios_per_bucket(dev);
    let bucket_bytes = dev.cfg.bucket_sectors as usize * SECTOR_SIZE;
    let mut chain = Vec::new();
    let mut b = head;
    let mut base = 0usize;

    while base < dev.cfg.nbuckets as usize {
        if b >= dev.cfg.nbuckets || chain.contains(&b) {
            return Err(EngineError::Corrupted(format!(
                "prio chain bucket {} out of range or looping",
                b
            )));
        }
        let mut buf = vec![0u8; bucket_bytes];
        dev.backend.read_sectors(dev.bucket_to_sector(b), &mut buf)?;

        let csum = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if csum != csum_of(&buf) {
            return Err(EngineError::Corrupted(format!(
                "prio bucket {}: checksum mismatch",
                b
            )));
        }
        let magic = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if magic != PRIO_SET_MAGIC {
            return Err(EngineError::Corrupted(format!("prio bucket {}: bad magic", b)));
        }
        let next = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let count = u32::from_le_bytes(buf[24..28].try_into().unwrap()) as usize;
        if count > per || base + count > dev.cfg.nbuckets as usize {
            return Err(EngineError::Corrupted(format!(
                "prio bucket {}: bad entry count {}",
                b, count
            )));
        }

        for j in 0..count {
            let off = HEADER_BYTES + j * ENTRY_BYTES;
            let bucket = &dev.buckets[base + j];
            bucket.set_prio(
                Rw::Read,
                u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()),
            );
            bucket.set_prio(
                Rw::Write,
                u16::from_le_bytes(buf[off + 2..off + 4].try_into().unwrap()),
            );
            bucket.set_gen(buf[off + 4]);
        }

        chain.push(b);
        base += count;
        b = next;
    }

    for &b in &chain {
        dev.buckets[b as usize]
            .add_sectors(SectorKind::Meta, dev.cfg.bucket_sectors as u16, dev.cfg.bucket_sectors)?;
    }
    *dev.prio_chain.lock() = chain;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::freelist::drive_allocator_once;
    use crate::device::{DeviceConfig, MemBackend};
    use std::sync::Arc;

    fn test_device() -> Arc<Device> {
        let cfg = DeviceConfig {
            nbuckets: 64,
            bucket_sectors: 8,
            first_bucket: 1,
            ..DeviceConfig::default()
        };
        let backend = Arc::new(MemBackend::new(64 * 8, true));
        let dev = Device::new(0, cfg, backend).unwrap();
        drive_allocator_once(&dev);
        dev
    }

    #[test]
    fn write_read_roundtrip() {
        let dev = test_device();
        for (i, b) in dev.buckets.iter().enumerate() {
            b.set_prio(Rw::Read, i as u16);
            b.set_prio(Rw::Write, (i * 2) as u16);
        }

        // The chain buckets themselves get reallocated during the write,
        // so the written set reflects the device state at serialisation.
        let head = prio_write(&dev).unwrap();

        let cfg = dev.cfg.clone();
        let fresh = Device::new(0, cfg, Arc::clone(&dev.backend)).unwrap();
        prio_read(&fresh, head).unwrap();

        for (i, b) in fresh.buckets.iter().enumerate() {
            assert_eq!(b.read_prio(), dev.buckets[i].read_prio());
            assert_eq!(b.write_prio(), dev.buckets[i].write_prio());
            assert_eq!(b.gen(), dev.buckets[i].gen());
        }
    }

    #[test]
    fn corrupt_chain_rejected() {
        let dev = test_device();
        let head = prio_write(&dev).unwrap();

        // Flip a byte in the payload.
        let sector = dev.bucket_to_sector(head);
        let mut buf = vec![0u8; dev.cfg.bucket_sectors as usize * SECTOR_SIZE];
        dev.backend.read_sectors(sector, &mut buf).unwrap();
        buf[100] ^= 0xff;
        dev.backend.write_sectors(sector, &buf).unwrap();

        let fresh = Device::new(0, dev.cfg.clone(), Arc::clone(&dev.backend)).unwrap();
        assert!(matches!(
            prio_read(&fresh, head),
            Err(EngineError::Corrupted(_))
        ));
    }

    #[test]
    fn rewrite_releases_old_chain() {
        let dev = test_device();
        let _ = prio_write(&dev).unwrap();
        let first_chain = dev.prio_chain.lock().clone();
        drive_allocator_once(&dev);
        let _ = prio_write(&dev).unwrap();
        let second_chain = dev.prio_chain.lock().clone();
        assert_ne!(first_chain, second_chain);
        for b in first_chain {
            assert_eq!(dev.buckets[b as usize].mark().meta_sectors, 0);
        }
    }
}
