//! Memory-pressure cooperation.
//!
//! The node cache must give memory back when the host is under pressure.
//! The facility is abstracted as a pair of function objects per consumer:
//! `count` reports approximately how much is reclaimable, `scan` reclaims
//! up to a requested amount. Whatever memory-pressure signal exists in
//! the embedding environment registers here and calls
//! [`ShrinkerRegistry::pressure`].

use parking_lot::Mutex;

/// One registered reclaim target
pub struct Shrinker {
    /// Name for diagnostics
    pub name: String,
    /// Approximate reclaimable object count
    pub count: Box<dyn Fn() -> u64 + Send + Sync>,
    /// Reclaim up to `nr` objects, returning how many went
    pub scan: Box<dyn Fn(u64) -> u64 + Send + Sync>,
}

/// Registry of reclaim targets
#[derive(Default)]
pub struct ShrinkerRegistry {
    shrinkers: Mutex<Vec<Shrinker>>,
}

impl ShrinkerRegistry {
    /// Register a reclaim target
    pub fn register(&self, shrinker: Shrinker) {
        log::debug!("registered shrinker {}", shrinker.name);
        self.shrinkers.lock().push(shrinker);
    }

    /// Total reclaimable objects across targets
    pub fn count(&self) -> u64 {
        self.shrinkers.lock().iter().map(|s| (s.count)()).sum()
    }

    /// Apply pressure: ask every target to reclaim up to `nr` objects.
    /// Returns the total reclaimed.
    pub fn pressure(&self, nr: u64) -> u64 {
        let mut reclaimed = 0;
        for s in self.shrinkers.lock().iter() {
            let got = (s.scan)(nr.saturating_sub(reclaimed));
            if got > 0 {
                log::debug!("shrinker {}: reclaimed {}", s.name, got);
            }
            reclaimed += got;
            if reclaimed >= nr {
                break;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn pressure_walks_targets() {
        let reg = ShrinkerRegistry::default();
        let pool = Arc::new(AtomicU64::new(10));

        let p1 = Arc::clone(&pool);
        let p2 = Arc::clone(&pool);
        reg.register(Shrinker {
            name: "test-pool".into(),
            count: Box::new(move || p1.load(Ordering::Relaxed)),
            scan: Box::new(move |nr| {
                let take = nr.min(p2.load(Ordering::Relaxed));
                p2.fetch_sub(take, Ordering::Relaxed);
                take
            }),
        });

        assert_eq!(reg.count(), 10);
        assert_eq!(reg.pressure(4), 4);
        assert_eq!(reg.count(), 6);
        assert_eq!(reg.pressure(100), 6);
        assert_eq!(reg.count(), 0);
    }
}
