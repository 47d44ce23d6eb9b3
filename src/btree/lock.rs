//! Three-mode node lock.
//!
//! Every btree node carries a lock with three modes in a strict hierarchy:
//! `read` (many), `intent` (one, shared with readers), `write` (exclusive,
//! only reachable by upgrading from intent). The sequence counter is
//! incremented by taking and releasing write locks and is even when
//! write-unlocked; readers that dropped the lock re-validate against it
//! with [`relock`](ThreeLock::relock).
//!
//! The upgrade must not deadlock against waiting readers: while an intent
//! holder is waiting to upgrade, new readers are held off, so the reader
//! count can only fall.
//!
//! The whole state lives in one atomic word:
//! readers:16 | intent:1 | write:1 | upgrade_waiting:1 | seq:32

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

const READERS_MASK: u64 = 0xffff;
const INTENT_BIT: u64 = 1 << 16;
const WRITE_BIT: u64 = 1 << 17;
const UPGRADE_WAIT_BIT: u64 = 1 << 18;
const SEQ_SHIFT: u64 = 32;
const SEQ_UNIT: u64 = 1 << SEQ_SHIFT;

/// Lock mode requested by iterators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared
    Read,
    /// Exclusive against other intents, shared with readers
    Intent,
}

/// The three-mode lock
#[derive(Debug, Default)]
pub struct ThreeLock {
    state: AtomicU64,
    wait_lock: Mutex<()>,
    wait: Condvar,
}

impl ThreeLock {
    /// New, unlocked
    pub fn new() -> ThreeLock {
        ThreeLock::default()
    }

    #[inline]
    fn state(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    /// Current sequence counter
    pub fn seq(&self) -> u32 {
        (self.state() >> SEQ_SHIFT) as u32
    }

    fn wake(&self) {
        let _guard = self.wait_lock.lock();
        self.wait.notify_all();
    }

    fn wait_while<F: Fn(u64) -> bool>(&self, blocked: F) {
        let mut guard = self.wait_lock.lock();
        while blocked(self.state()) {
            self.wait.wait(&mut guard);
        }
    }

    /// Try to take a read lock. Fails while a writer holds the lock or an
    /// intent holder is waiting to upgrade.
    pub fn try_lock_read(&self) -> bool {
        let mut cur = self.state();
        loop {
            if cur & (WRITE_BIT | UPGRADE_WAIT_BIT) != 0 {
                return false;
            }
            debug_assert!(cur & READERS_MASK != READERS_MASK);
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(c) => cur = c,
            }
        }
    }

    /// Take a read lock, waiting as needed
    pub fn lock_read(&self) {
        if self.try_lock_read() {
            return;
        }
        loop {
            self.wait_while(|s| s & (WRITE_BIT | UPGRADE_WAIT_BIT) != 0);
            if self.try_lock_read() {
                return;
            }
        }
    }

    /// Release a read lock
    pub fn unlock_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & READERS_MASK > 0);
        self.wake();
    }

    /// Try to take the intent lock
    pub fn try_lock_intent(&self) -> bool {
        let mut cur = self.state();
        loop {
            if cur & INTENT_BIT != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur | INTENT_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(c) => cur = c,
            }
        }
    }

    /// Take the intent lock, waiting as needed
    pub fn lock_intent(&self) {
        if self.try_lock_intent() {
            return;
        }
        loop {
            self.wait_while(|s| s & INTENT_BIT != 0);
            if self.try_lock_intent() {
                return;
            }
        }
    }

    /// Release the intent lock (not the write lock)
    pub fn unlock_intent(&self) {
        let prev = self.state.fetch_and(!INTENT_BIT, Ordering::AcqRel);
        debug_assert!(prev & INTENT_BIT != 0);
        debug_assert!(prev & WRITE_BIT == 0);
        self.wake();
    }

    /// Try to upgrade intent -> write without waiting. The caller must
    /// hold the intent lock.
    pub fn try_lock_write(&self) -> bool {
        let mut cur = self.state();
        loop {
            debug_assert!(cur & INTENT_BIT != 0);
            if cur & READERS_MASK != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                (cur | WRITE_BIT) + SEQ_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(c) => cur = c,
            }
        }
    }

    /// Upgrade intent -> write, blocking new readers and waiting for
    /// existing ones to drain. The caller must hold the intent lock.
    pub fn lock_write(&self) {
        if self.try_lock_write() {
            return;
        }
        self.state.fetch_or(UPGRADE_WAIT_BIT, Ordering::AcqRel);
        loop {
            self.wait_while(|s| s & READERS_MASK != 0);
            let mut cur = self.state();
            let acquired = loop {
                if cur & READERS_MASK != 0 {
                    break false;
                }
                let new = ((cur | WRITE_BIT) & !UPGRADE_WAIT_BIT) + SEQ_UNIT;
                match self.state.compare_exchange_weak(
                    cur,
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break true,
                    Err(c) => cur = c,
                }
            };
            if acquired {
                return;
            }
        }
    }

    /// Downgrade write -> intent; bumps the sequence back to even
    pub fn unlock_write(&self) {
        let mut cur = self.state();
        loop {
            debug_assert!(cur & WRITE_BIT != 0);
            let new = (cur & !WRITE_BIT) + SEQ_UNIT;
            match self.state.compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(c) => cur = c,
            }
        }
        self.wake();
    }

    /// Downgrade intent -> read
    pub fn downgrade(&self) {
        let mut cur = self.state();
        loop {
            debug_assert!(cur & INTENT_BIT != 0);
            debug_assert!(cur & WRITE_BIT == 0);
            let new = (cur & !INTENT_BIT) + 1;
            match self.state.compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(c) => cur = c,
            }
        }
        self.wake();
    }

    /// Lock in an iterator mode
    pub fn lock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.lock_read(),
            LockMode::Intent => self.lock_intent(),
        }
    }

    /// Try-lock in an iterator mode
    pub fn try_lock(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.try_lock_read(),
            LockMode::Intent => self.try_lock_intent(),
        }
    }

    /// Unlock an iterator mode
    pub fn unlock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.unlock_read(),
            LockMode::Intent => self.unlock_intent(),
        }
    }

    /// Re-take a dropped lock if nothing wrote in between: succeeds only
    /// if the lock can be acquired without waiting and the sequence still
    /// matches the snapshot.
    pub fn relock(&self, mode: LockMode, seq: u32) -> bool {
        if self.seq() != seq {
            return false;
        }
        if !self.try_lock(mode) {
            return false;
        }
        if self.seq() != seq {
            self.unlock(mode);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn read_shared_intent_exclusive() {
        let l = ThreeLock::new();
        l.lock_read();
        l.lock_read();
        assert!(l.try_lock_intent());
        assert!(!l.try_lock_intent());
        // Readers still admitted alongside intent.
        assert!(l.try_lock_read());
        l.unlock_read();
        l.unlock_read();
        l.unlock_read();
        l.unlock_intent();
    }

    #[test]
    fn write_requires_reader_drain() {
        let l = ThreeLock::new();
        l.lock_intent();
        l.lock_read();
        assert!(!l.try_lock_write());
        l.unlock_read();
        assert!(l.try_lock_write());
        assert!(!l.try_lock_read());
        l.unlock_write();
        l.unlock_intent();
        assert!(l.try_lock_read());
        l.unlock_read();
    }

    #[test]
    fn seq_tracks_write_cycles() {
        let l = ThreeLock::new();
        let s0 = l.seq();
        assert_eq!(s0 % 2, 0);
        l.lock_intent();
        l.lock_write();
        assert_eq!(l.seq(), s0 + 1);
        l.unlock_write();
        l.unlock_intent();
        assert_eq!(l.seq(), s0 + 2);
    }

    #[test]
    fn relock_fails_after_write() {
        let l = ThreeLock::new();
        let seq = l.seq();
        l.lock_read();
        l.unlock_read();
        assert!(l.relock(LockMode::Read, seq));
        l.unlock_read();

        l.lock_intent();
        l.lock_write();
        l.unlock_write();
        l.unlock_intent();
        assert!(!l.relock(LockMode::Read, seq));
    }

    #[test]
    fn upgrade_waits_out_readers_and_blocks_new_ones() {
        let l = Arc::new(ThreeLock::new());
        l.lock_intent();
        l.lock_read();

        let got_write = Arc::new(AtomicBool::new(false));
        let writer = {
            let l = Arc::clone(&l);
            let got_write = Arc::clone(&got_write);
            std::thread::spawn(move || {
                l.lock_write();
                got_write.store(true, Ordering::Release);
                l.unlock_write();
                l.unlock_intent();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!got_write.load(Ordering::Acquire));
        // With an upgrader waiting, new readers are refused.
        assert!(!l.try_lock_read());

        l.unlock_read();
        writer.join().unwrap();
        assert!(got_write.load(Ordering::Acquire));
        assert!(l.try_lock_read());
        l.unlock_read();
    }
}
