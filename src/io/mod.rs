//! # IO model
//!
//! The logical IO descriptor ([`Bio`]) that the request router consumes,
//! plus device submission wrappers that feed the latency EWMA, the IO
//! error counters, and the congestion soft signal.

use crate::core::{Result, CONGESTED_MAX, SECTOR_SIZE};
use crate::device::clock::Rw;
use crate::device::Device;
use crate::set::CacheSet;
use bitflags::bitflags;
use rand::Rng;
use std::time::Instant;

pub mod read;
pub mod write;

/// IO direction / operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    /// Read data
    Read,
    /// Write data
    Write,
    /// Drop a range
    Discard,
}

bitflags! {
    /// Request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BioFlags: u32 {
        /// Flush the device write cache before the payload
        const PREFLUSH = 1 << 0;
        /// Force unit access: payload durable before completion
        const FUA = 1 << 1;
        /// Synchronous request; latency-sensitive
        const SYNC = 1 << 2;
        /// Metadata IO
        const META = 1 << 3;
        /// Readahead; drop rather than block
        const RAHEAD = 1 << 4;
    }
}

/// A logical IO request against a cached device or volume
#[derive(Debug)]
pub struct Bio {
    /// Operation
    pub op: BioOp,
    /// Flags
    pub flags: BioFlags,
    /// Starting sector (logical)
    pub sector: u64,
    /// Payload: full for writes, filled in for reads. Empty payload with
    /// PREFLUSH/FUA is a pure flush.
    pub data: Vec<u8>,
    /// For discards (no payload): length in sectors
    pub discard_sectors: u64,
}

impl Bio {
    /// A read of `sectors` sectors at `sector`
    pub fn read(sector: u64, sectors: u64) -> Bio {
        Bio {
            op: BioOp::Read,
            flags: BioFlags::empty(),
            sector,
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
            discard_sectors: 0,
        }
    }

    /// A write of `data` at `sector`
    pub fn write(sector: u64, data: Vec<u8>) -> Bio {
        Bio {
            op: BioOp::Write,
            flags: BioFlags::empty(),
            sector,
            data,
            discard_sectors: 0,
        }
    }

    /// A discard of `sectors` sectors at `sector`
    pub fn discard(sector: u64, sectors: u64) -> Bio {
        Bio {
            op: BioOp::Discard,
            flags: BioFlags::empty(),
            sector,
            data: Vec::new(),
            discard_sectors: sectors,
        }
    }

    /// An empty flush
    pub fn flush() -> Bio {
        Bio {
            op: BioOp::Write,
            flags: BioFlags::PREFLUSH,
            sector: 0,
            data: Vec::new(),
            discard_sectors: 0,
        }
    }

    /// Attach flags
    pub fn with_flags(mut self, flags: BioFlags) -> Bio {
        self.flags |= flags;
        self
    }

    /// Length in sectors
    pub fn sectors(&self) -> u64 {
        match self.op {
            BioOp::Discard => self.discard_sectors,
            _ => (self.data.len() / SECTOR_SIZE) as u64,
        }
    }

    /// Sector one past the end
    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors()
    }

    /// Whether this is a zero-length flush
    pub fn is_flush_only(&self) -> bool {
        self.data.is_empty()
            && self.op != BioOp::Discard
            && self.flags.intersects(BioFlags::PREFLUSH | BioFlags::FUA)
    }

    /// Whether sector and length are aligned to `block_sectors`
    pub fn is_aligned(&self, block_sectors: u64) -> bool {
        self.sector % block_sectors == 0 && self.sectors() % block_sectors == 0
    }
}

/// Read from a cache device, feeding latency/error accounting and the
/// set's congestion signal.
pub fn submit_read(c: &CacheSet, dev: &Device, sector: u64, buf: &mut [u8]) -> Result<()> {
    let start = Instant::now();
    let res = dev.backend.read_sectors(sector, buf);
    let elapsed = start.elapsed();
    dev.note_io_latency(elapsed);
    dev.increment_clock((buf.len() / SECTOR_SIZE) as u64, Rw::Read);
    match res {
        Ok(()) => {
            c.note_io_time(elapsed, false);
            Ok(())
        }
        Err(e) => {
            dev.note_io_error();
            Err(e)
        }
    }
}

/// Write to a cache device, with the same accounting
pub fn submit_write(c: &CacheSet, dev: &Device, sector: u64, buf: &[u8]) -> Result<()> {
    let start = Instant::now();
    let res = dev.backend.write_sectors(sector, buf);
    let elapsed = start.elapsed();
    dev.note_io_latency(elapsed);
    dev.increment_clock((buf.len() / SECTOR_SIZE) as u64, Rw::Write);
    match res {
        Ok(()) => {
            c.note_io_time(elapsed, true);
            Ok(())
        }
        Err(e) => {
            dev.note_io_error();
            Err(e)
        }
    }
}

/// Piecewise-linear approximation of `2^(x / 2^fract_bits)`: the high
/// bits pick the power of two, the low `fract_bits` interpolate linearly
/// towards the next one.
fn fract_exp_two(x: i64, fract_bits: u32) -> i64 {
    let fract = x & ((1 << fract_bits) - 1);
    let x = 1i64 << (x >> fract_bits);
    x + ((x * fract) >> fract_bits)
}

/// The congestion soft signal.
///
/// Zero when both thresholds are disabled or the set has not been
/// congested recently. Otherwise the headroom left under
/// [`CONGESTED_MAX`] is shaped through a fractional exponential curve
/// (low 6 bits fractional), dithered by the popcount of a random word,
/// and floored at 1 while any signal remains.
pub fn get_congested(c: &CacheSet) -> u64 {
    let (read_us, write_us) = c.congested_thresholds();
    if read_us == 0 && write_us == 0 {
        return 0;
    }

    let mut i = (c.us_since_congested() / 1024) as i64;
    if i < 0 {
        return 0;
    }
    i += c.congested_count() as i64;
    if i >= 0 {
        return 0;
    }
    i += CONGESTED_MAX as i64;

    if i > 0 {
        i = fract_exp_two(i, 6);
    }

    let rand: u64 = rand::thread_rng().gen();
    i -= rand.count_ones() as i64;
    i.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bio_geometry() {
        let b = Bio::read(8, 16);
        assert_eq!(b.sectors(), 16);
        assert_eq!(b.end_sector(), 24);
        assert!(b.is_aligned(8));
        assert!(!b.is_aligned(16));

        let d = Bio::discard(0, 64);
        assert_eq!(d.sectors(), 64);
    }

    #[test]
    fn flush_only_detection() {
        assert!(Bio::flush().is_flush_only());
        assert!(!Bio::read(0, 1).is_flush_only());
        let w = Bio::write(0, vec![0u8; 512]).with_flags(BioFlags::FUA);
        assert!(!w.is_flush_only());
    }

    #[test]
    fn fract_exp_two_curve() {
        // Exact powers of two at whole exponents.
        assert_eq!(fract_exp_two(0, 6), 1);
        assert_eq!(fract_exp_two(64, 6), 2);
        assert_eq!(fract_exp_two(128, 6), 4);
        assert_eq!(fract_exp_two(640, 6), 1024);
        // Halfway interpolates linearly towards the next power.
        assert_eq!(fract_exp_two(64 + 32, 6), 3);
        // Monotonic over the whole congestion range.
        let mut prev = 0;
        for x in 0..CONGESTED_MAX as i64 {
            let v = fract_exp_two(x, 6);
            assert!(v >= prev);
            prev = v;
        }
    }
}
