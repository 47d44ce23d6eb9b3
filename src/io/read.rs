//! Extent reads.
//!
//! Reading through an extent pointer always bounces through the stored
//! payload: the payload is read whole, its checksum verified, decompressed
//! if needed, and the requested slice copied out. The pointer's bucket is
//! pinned across the IO and staleness is re-checked when it completes - a
//! bucket may be invalidated while reads from it are in flight, and such
//! reads must be retried rather than trusted.

use crate::core::keys::{BkeyI, ChecksumType, CompressionType};
use crate::core::{EngineError, Result, SECTOR_SIZE};
use crate::device::clock::Rw;
use crate::extent::{csum_data, PickedPtr, PtrPin};
use crate::io::submit_read;
use crate::set::CacheSet;
use std::sync::Arc;

/// Read `out.len()` bytes of an extent's data, starting `skip_sectors`
/// into the key's covered range. Returns whether the data read was dirty
/// (which forbids a later verify pass against the backing device).
pub fn read_extent(
    c: &CacheSet,
    k: &BkeyI,
    pick: &PickedPtr,
    skip_sectors: u64,
    out: &mut [u8],
) -> Result<bool> {
    debug_assert!(out.len() % SECTOR_SIZE == 0);
    let want_sectors = (out.len() / SECTOR_SIZE) as u64;
    debug_assert!(skip_sectors + want_sectors <= k.k.size);

    let pin = PtrPin::new(Arc::clone(&pick.dev), &pick.ptr);

    match &k.v.crc {
        None => {
            // Raw payload; trims already adjusted the pointer.
            submit_read(
                c,
                &pick.dev,
                pick.ptr.offset + skip_sectors,
                out,
            )?;
        }
        Some(crc) => {
            let stored_bytes = crc.compressed_sectors as usize * SECTOR_SIZE;
            let mut payload = vec![0u8; stored_bytes];
            submit_read(c, &pick.dev, pick.ptr.offset, &mut payload)?;

            if crc.csum_type != ChecksumType::None {
                let got = csum_data(crc.csum_type, &payload);
                if got != crc.csum {
                    return Err(EngineError::Corrupted(format!(
                        "extent checksum mismatch at dev {} sector {}: {:x} != {:x}",
                        pick.ptr.dev, pick.ptr.offset, got, crc.csum
                    )));
                }
            }

            let uncompressed = match crc.compression_type {
                CompressionType::None => payload,
                CompressionType::Lz4 => {
                    if payload.len() < 4 {
                        return Err(EngineError::Corrupted("short compressed payload".into()));
                    }
                    let comp_len =
                        u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                    if 4 + comp_len > payload.len() {
                        return Err(EngineError::Corrupted(
                            "compressed payload length out of range".into(),
                        ));
                    }
                    let raw_bytes = crc.uncompressed_sectors as usize * SECTOR_SIZE;
                    lz4::block::decompress(
                        &payload[4..4 + comp_len],
                        Some(raw_bytes as i32),
                    )
                    .map_err(|e| {
                        EngineError::Corrupted(format!("lz4 decompress failed: {}", e))
                    })?
                }
            };

            let from = (crc.offset_sectors as u64 + skip_sectors) as usize * SECTOR_SIZE;
            if from + out.len() > uncompressed.len() {
                return Err(EngineError::Corrupted(
                    "extent range past stored payload".into(),
                ));
            }
            out.copy_from_slice(&uncompressed[from..from + out.len()]);
        }
    }

    // The race this guards: the allocator invalidated the bucket and a
    // writer reused it while our read was in flight.
    if !pin.still_valid() {
        return Err(EngineError::Stale);
    }

    // Freshly read data ages the bucket forward.
    pick.dev
        .bucket_for_sector(pick.ptr.offset)
        .set_prio(Rw::Read, pick.dev.clock(Rw::Read).hand());

    Ok(!k.is_cached())
}
