//! # Extents
//!
//! Operations on extent keys: choosing which replica pointer to read,
//! stale-pointer detection against bucket generations, and data checksums.
//! The key and value layout itself lives in [`crate::core::keys`].

use crate::core::keys::{BkeyI, ChecksumType, ExtentPtr};
use crate::core::{EngineError, Result};
use crate::device::Device;
use crate::set::CacheSet;
use std::sync::Arc;

/// A chosen replica pointer plus its device
pub struct PickedPtr {
    /// The pointer
    pub ptr: ExtentPtr,
    /// The device it lives on
    pub dev: Arc<Device>,
}

/// Pick the best live pointer of an extent: skip stale pointers and
/// offline devices, prefer the fastest tier, break ties on IO latency.
///
/// `Ok(None)` means every pointer is stale or unreachable but the data is
/// clean cached - treat as a cache miss. An unreadable dirty extent is a
/// hard error: the cache holds the only copy.
pub fn pick_ptr(c: &CacheSet, k: &BkeyI) -> Result<Option<PickedPtr>> {
    if !k.is_data() {
        return Ok(None);
    }

    let mut best: Option<PickedPtr> = None;
    for ptr in &k.v.ptrs {
        let Some(dev) = c.device(ptr.dev) else {
            continue;
        };
        if dev.ptr_stale(ptr.offset, ptr.gen) {
            continue;
        }
        let better = match &best {
            None => true,
            Some(cur) => {
                let (t0, t1) = (dev.cfg.tier, cur.dev.cfg.tier);
                t0 < t1 || (t0 == t1 && dev.io_latency_us() < cur.dev.io_latency_us())
            }
        };
        if better {
            best = Some(PickedPtr {
                ptr: *ptr,
                dev,
            });
        }
    }

    if best.is_none() && !k.is_cached() {
        return Err(EngineError::Io("no device to read from".into()));
    }
    Ok(best)
}

/// Pin the pointer's bucket across a read. Returns a guard; when the read
/// completes the caller re-checks staleness with [`PtrPin::still_valid`].
pub struct PtrPin {
    dev: Arc<Device>,
    sector: u64,
    gen: u8,
}

impl PtrPin {
    /// Pin the bucket under `ptr`
    pub fn new(dev: Arc<Device>, ptr: &ExtentPtr) -> PtrPin {
        dev.bucket_for_sector(ptr.offset).pin();
        PtrPin {
            dev,
            sector: ptr.offset,
            gen: ptr.gen,
        }
    }

    /// Whether the pointer generation still matches after the IO.
    /// A mismatch means the bucket was invalidated mid-read and the data
    /// cannot be trusted.
    pub fn still_valid(&self) -> bool {
        !self.dev.ptr_stale(self.sector, self.gen)
    }
}

impl Drop for PtrPin {
    fn drop(&mut self) {
        self.dev.bucket_for_sector(self.sector).unpin();
    }
}

/// 64-bit data checksum
pub fn csum_data(typ: ChecksumType, data: &[u8]) -> u64 {
    match typ {
        ChecksumType::None => 0,
        ChecksumType::Blake3_64 => {
            let h = blake3::hash(data);
            u64::from_le_bytes(h.as_bytes()[..8].try_into().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        let a = csum_data(ChecksumType::Blake3_64, b"hello sectors");
        let b = csum_data(ChecksumType::Blake3_64, b"hello sectors");
        let c = csum_data(ChecksumType::Blake3_64, b"hello sector!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(csum_data(ChecksumType::None, b"whatever"), 0);
    }
}
