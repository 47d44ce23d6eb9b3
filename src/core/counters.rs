//! Sharded statistics counters.
//!
//! Hot counters (sectors written, cache hits, ...) are updated from many
//! threads at once; a single atomic would bounce its cache line between
//! cores. Each counter keeps one shard per slot and sums on read.
//! Exactness across concurrent readers is not required.

use crossbeam::utils::CachePadded;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const SHARDS: usize = 16;

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: Cell<usize> = Cell::new(usize::MAX);
}

fn thread_slot() -> usize {
    THREAD_SLOT.with(|s| {
        let v = s.get();
        if v != usize::MAX {
            return v;
        }
        let v = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed) % SHARDS;
        s.set(v);
        v
    })
}

/// A u64 counter sharded across cache lines
#[derive(Debug, Default)]
pub struct ShardedU64 {
    shards: [CachePadded<AtomicU64>; SHARDS],
}

impl ShardedU64 {
    /// New counter at zero
    pub fn new() -> ShardedU64 {
        ShardedU64::default()
    }

    /// Add `n` on the calling thread's shard
    pub fn add(&self, n: u64) {
        self.shards[thread_slot()].fetch_add(n, Ordering::Relaxed);
    }

    /// Sum all shards
    pub fn sum(&self) -> u64 {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    /// Reset all shards to zero
    pub fn reset(&self) {
        for s in &self.shards {
            s.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sums_across_threads() {
        let c = Arc::new(ShardedU64::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    c.add(3);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.sum(), 8 * 1000 * 3);
        c.reset();
        assert_eq!(c.sum(), 0);
    }
}
