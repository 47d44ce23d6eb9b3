//! Read/write priority clocks.
//!
//! "Now" in read or write IO time: the hand advances whenever a configured
//! amount of data is read or written. Buckets store the hand value from
//! their last access, so `hand - prio` is the time since the bucket was
//! last touched - the LRU replacement policy sorts on it. The units can
//! change on the fly when the hand overflows and everything is rescaled to
//! fit back into a u16; the only guarantee is that they stay consistent.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Clock direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rw {
    /// Read clock
    Read,
    /// Write clock
    Write,
}

/// Hand advances once per this many sectors of IO
const SECTORS_PER_TICK: u64 = 1 << 11;

/// Rescale when the hand gets within this distance of wrapping
const RESCALE_HEADROOM: u16 = 1 << 10;

#[derive(Debug)]
struct ClockState {
    hand: u16,
    min_prio: u16,
}

/// One priority clock (there are two per device, read and write)
#[derive(Debug)]
pub struct PrioClock {
    state: Mutex<ClockState>,
    pending_sectors: AtomicU64,
}

impl Default for PrioClock {
    fn default() -> Self {
        PrioClock {
            state: Mutex::new(ClockState { hand: 0, min_prio: 0 }),
            pending_sectors: AtomicU64::new(0),
        }
    }
}

impl PrioClock {
    /// Current hand
    pub fn hand(&self) -> u16 {
        self.state.lock().hand
    }

    /// Oldest priority currently assigned to any bucket, maintained by the
    /// allocator scan
    pub fn min_prio(&self) -> u16 {
        self.state.lock().min_prio
    }

    /// Record that `prio` was observed as the oldest live priority
    pub fn set_min_prio(&self, prio: u16) {
        self.state.lock().min_prio = prio;
    }

    /// Age of a bucket priority relative to the hand
    pub fn age(&self, prio: u16) -> u16 {
        self.state.lock().hand.wrapping_sub(prio)
    }

    /// Advance the clock by completed IO. Returns true when the hand came
    /// close to wrapping and the caller must rescale every bucket priority
    /// with [`finish_rescale`](Self::finish_rescale).
    pub fn advance(&self, sectors: u64) -> bool {
        let pending = self.pending_sectors.fetch_add(sectors, Ordering::Relaxed) + sectors;
        if pending < SECTORS_PER_TICK {
            return false;
        }
        let ticks = pending / SECTORS_PER_TICK;
        self.pending_sectors
            .fetch_sub(ticks * SECTORS_PER_TICK, Ordering::Relaxed);

        let mut st = self.state.lock();
        st.hand = st.hand.wrapping_add(ticks as u16);
        st.hand.wrapping_sub(st.min_prio) > u16::MAX - RESCALE_HEADROOM
    }

    /// Complete a rescale: the caller has halved every bucket's priority,
    /// halve the hand to match.
    pub fn finish_rescale(&self) {
        let mut st = self.state.lock();
        st.hand /= 2;
        st.min_prio /= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_advances_per_tick() {
        let c = PrioClock::default();
        assert_eq!(c.hand(), 0);
        assert!(!c.advance(SECTORS_PER_TICK - 1));
        assert_eq!(c.hand(), 0);
        c.advance(1);
        assert_eq!(c.hand(), 1);
        c.advance(SECTORS_PER_TICK * 5);
        assert_eq!(c.hand(), 6);
    }

    #[test]
    fn rescale_requested_near_wrap() {
        let c = PrioClock::default();
        let mut wants_rescale = false;
        for _ in 0..u16::MAX as u64 {
            if c.advance(SECTORS_PER_TICK) {
                wants_rescale = true;
                break;
            }
        }
        assert!(wants_rescale);
        let before = c.hand();
        c.finish_rescale();
        assert_eq!(c.hand(), before / 2);
    }

    #[test]
    fn age_wraps() {
        let c = PrioClock::default();
        c.advance(SECTORS_PER_TICK * 10);
        assert_eq!(c.age(4), 6);
    }
}
