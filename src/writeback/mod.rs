//! # Writeback
//!
//! Writeback-mode writes complete as soon as the dirty extent is in the
//! tree and journalled; a per-device worker later copies dirty extents to
//! the backing device and converts them to clean cached copies.
//!
//! The dirty-key buffer tracks extents queued for writeback. The write
//! path consults it: a write overlapping a key whose IO has already
//! started must itself go to writeback (the backing device is about to be
//! overwritten with older data). Overlapping keys whose IO has not
//! started yet are simply dropped from the queue.

use crate::core::keys::{BkeyI, Bpos};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct KeyBufEntry {
    key: BkeyI,
    io_started: bool,
}

/// Buffer of dirty extents awaiting writeback, ordered by end position
#[derive(Debug, Default)]
pub struct KeyBuf {
    keys: Mutex<BTreeMap<Bpos, KeyBufEntry>>,
}

impl KeyBuf {
    /// Queue a dirty extent
    pub fn add(&self, key: BkeyI) {
        self.keys.lock().insert(key.k.p, KeyBufEntry { key, io_started: false });
    }

    /// Check `[start, end)` against the queue. Overlapping keys with no
    /// IO in flight are dropped; returns true if any overlapping key's IO
    /// has already started.
    pub fn check_overlapping(&self, start: Bpos, end: Bpos) -> bool {
        let mut keys = self.keys.lock();
        let overlapping: Vec<Bpos> = keys
            .range(start.successor()..)
            .take_while(|(_, e)| e.key.k.start() < end)
            .filter(|(_, e)| e.key.k.overlaps(start, end))
            .map(|(p, _)| *p)
            .collect();

        let mut started = false;
        for p in overlapping {
            if keys.get(&p).is_some_and(|e| e.io_started) {
                started = true;
            } else {
                keys.remove(&p);
            }
        }
        started
    }

    /// Take up to `max` keys for writeback, marking their IO as started
    pub fn start_batch(&self, max: usize) -> Vec<BkeyI> {
        let mut keys = self.keys.lock();
        let mut out = Vec::new();
        for e in keys.values_mut() {
            if out.len() == max {
                break;
            }
            if !e.io_started {
                e.io_started = true;
                out.push(e.key.clone());
            }
        }
        out
    }

    /// Writeback of a key finished (or failed); remove it
    pub fn finish(&self, key: &BkeyI) {
        self.keys.lock().remove(&key.k.p);
    }

    /// Put a failed key back so a later pass retries it
    pub fn requeue(&self, key: BkeyI) {
        self.keys
            .lock()
            .insert(key.k.p, KeyBufEntry { key, io_started: false });
    }

    /// Keys currently queued
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::{Bkey, ExtentPtr, ExtentValue};

    fn dirty_key(inode: u64, end: u64, size: u64) -> BkeyI {
        BkeyI::extent(
            Bkey::extent(inode, end, size),
            ExtentValue {
                crc: None,
                ptrs: vec![ExtentPtr { dev: 0, offset: 0, gen: 0, cached: false }],
            },
        )
    }

    #[test]
    fn overlap_drops_unstarted_keys() {
        let buf = KeyBuf::default();
        buf.add(dirty_key(1, 100, 50));
        assert_eq!(buf.len(), 1);

        // Overlap with a key whose IO has not started: dropped, no force.
        assert!(!buf.check_overlapping(Bpos::new(1, 60), Bpos::new(1, 80)));
        assert!(buf.is_empty());
    }

    #[test]
    fn overlap_with_started_io_forces_writeback() {
        let buf = KeyBuf::default();
        buf.add(dirty_key(1, 100, 50));
        let batch = buf.start_batch(10);
        assert_eq!(batch.len(), 1);

        assert!(buf.check_overlapping(Bpos::new(1, 60), Bpos::new(1, 80)));
        assert_eq!(buf.len(), 1);

        buf.finish(&batch[0]);
        assert!(buf.is_empty());
    }

    #[test]
    fn non_overlapping_untouched() {
        let buf = KeyBuf::default();
        buf.add(dirty_key(1, 100, 50));
        assert!(!buf.check_overlapping(Bpos::new(1, 100), Bpos::new(1, 200)));
        assert_eq!(buf.len(), 1);
        assert!(!buf.check_overlapping(Bpos::new(2, 0), Bpos::new(2, 500)));
        assert_eq!(buf.len(), 1);
    }
}
