//! B-tree node cache.
//!
//! Nodes are addressed by the first pointer of their key in a hash table,
//! with an LRU beside it for shrinker walks (accessed flag, second
//! chance). Two auxiliary lists hold containers on their way out:
//! `freeable` (data present, no longer hashed) and `freed` (container
//! only, data released). The container itself is never dropped while the
//! set lives - a freed node keeps its lock and is re-initialised on reuse.
//!
//! Sizing: the cache must never shrink below its reserve, which is what
//! guarantees that inserting one key can always get a node. When
//! allocation would exceed the memory budget, a single caller at a time
//! may cannibalise: scan the LRU in reverse and reap the oldest clean,
//! unlocked node.

use crate::btree::lock::LockMode;
use crate::btree::node::{self, NodeData};
use crate::btree::{BtreeNode, NodeFlags};
use crate::core::keys::BkeyI;
use crate::core::{EngineError, Result};
use crate::set::CacheSet;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_THREAD_TOKEN: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_TOKEN: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

fn thread_token() -> usize {
    THREAD_TOKEN.with(|t| {
        let v = t.get();
        if v != 0 {
            return v;
        }
        let v = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
        t.set(v);
        v
    })
}

/// The node cache
pub struct BtreeCache {
    hash: Mutex<HashMap<u64, Arc<BtreeNode>>>,
    lru: Mutex<LruCache<u64, Arc<BtreeNode>>>,
    freeable: Mutex<Vec<Arc<BtreeNode>>>,
    freed: Mutex<Vec<Arc<BtreeNode>>>,
    /// Containers with data allocated
    used: AtomicUsize,
    reserve: AtomicUsize,
    max_nodes: AtomicUsize,
    /// Single-cannibaliser slot: the thread token holding it, 0 if free
    alloc_lock: Mutex<usize>,
    alloc_wait: Condvar,
    shrinker_disabled: AtomicBool,
}

impl BtreeCache {
    /// New cache with a memory budget of `max_nodes` node containers
    pub fn new(max_nodes: usize) -> BtreeCache {
        BtreeCache {
            hash: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruCache::unbounded()),
            freeable: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
            used: AtomicUsize::new(0),
            reserve: AtomicUsize::new(16),
            max_nodes: AtomicUsize::new(max_nodes),
            alloc_lock: Mutex::new(0),
            alloc_wait: Condvar::new(),
            shrinker_disabled: AtomicBool::new(false),
        }
    }

    /// Containers with data allocated
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Reserve floor
    pub fn reserve(&self) -> usize {
        self.reserve.load(Ordering::Acquire)
    }

    /// Memory budget in containers
    pub fn max_nodes(&self) -> usize {
        self.max_nodes.load(Ordering::Acquire)
    }

    /// Shrink or grow the memory budget
    pub fn set_max_nodes(&self, max: usize) {
        self.max_nodes.store(max, Ordering::Release);
    }

    /// Disable the shrinker (debug toggle)
    pub fn set_shrinker_disabled(&self, disabled: bool) {
        self.shrinker_disabled.store(disabled, Ordering::Release);
    }

    /// Recompute the reserve from the btree roots:
    /// `16 + sum over roots of min(1, level) * 8`, plus 8 while the first
    /// root has not come up yet.
    pub fn recalc_reserve(&self, root_levels: &[Option<u8>]) {
        let mut reserve = 16;
        if root_levels.first().map_or(true, |r| r.is_none()) {
            reserve += 8;
        }
        for lvl in root_levels.iter().flatten() {
            reserve += (*lvl).min(1) as usize * 8;
        }
        self.reserve.store(reserve, Ordering::Release);
        log::debug!("btree cache reserve now {}", reserve);
    }

    /// Hash lookup; touches the LRU and the accessed flag
    pub fn node_find(&self, key: &BkeyI) -> Option<Arc<BtreeNode>> {
        let ptr = BtreeNode::hash_of(&key.v);
        if ptr == 0 {
            return None;
        }
        let found = self.hash.lock().get(&ptr).cloned();
        if let Some(b) = &found {
            b.set_flag(NodeFlags::ACCESSED);
            self.lru.lock().get(&b.uid);
        }
        found
    }

    pub(crate) fn hash_insert(&self, b: &Arc<BtreeNode>) -> Result<()> {
        let ptr = b.first_ptr();
        let mut hash = self.hash.lock();
        if hash.contains_key(&ptr) {
            return Err(EngineError::Busy("node fill raced"));
        }
        hash.insert(ptr, Arc::clone(b));
        drop(hash);
        self.lru.lock().push(b.uid, Arc::clone(b));
        Ok(())
    }

    /// Remove from the hash and zero the identity so future lookups fail
    pub fn hash_remove(&self, b: &Arc<BtreeNode>) {
        debug_assert!(!b.has_flag(NodeFlags::DIRTY));
        let ptr = b.first_ptr();
        if ptr != 0 {
            self.hash.lock().remove(&ptr);
        }
        self.lru.lock().pop(&b.uid);
        b.clear_identity();
        if let Some(d) = b.data.write().as_mut() {
            d.reset();
        }
    }

    /// Try to take both intent and write locks and verify the node can be
    /// torn down. On success the locks are HELD and the caller owns the
    /// teardown; on failure nothing is held.
    fn reap(&self, c: Option<&CacheSet>, b: &Arc<BtreeNode>, flush: bool) -> bool {
        if !b.lock.try_lock_intent() {
            return false;
        }
        if !b.lock.try_lock_write() {
            b.lock.unlock_intent();
            return false;
        }

        let fail = b.has_flag(NodeFlags::WRITE_ERROR | NodeFlags::NOEVICT)
            || b.has_flag(NodeFlags::WRITE_IN_FLIGHT)
            || (!flush && b.has_flag(NodeFlags::DIRTY));

        if fail {
            b.lock.unlock_write();
            b.lock.unlock_intent();
            return false;
        }

        if b.has_flag(NodeFlags::DIRTY) {
            let Some(c) = c else {
                b.lock.unlock_write();
                b.lock.unlock_intent();
                return false;
            };
            if node_write(c, b).is_err() {
                b.lock.unlock_write();
                b.lock.unlock_intent();
                return false;
            }
        }
        true
    }

    /// Move a node's data to the freed list; container survives
    fn data_free(&self, b: &Arc<BtreeNode>) {
        *b.data.write() = None;
        self.used.fetch_sub(1, Ordering::AcqRel);
        self.freed.lock().push(Arc::clone(b));
    }

    /// Put a node that lost a fill race (or was freed by a split) on the
    /// freeable list. The caller holds intent + write; they are released
    /// here.
    pub fn make_freeable(&self, b: &Arc<BtreeNode>) {
        self.hash_remove(b);
        self.freeable.lock().push(Arc::clone(b));
        b.lock.unlock_write();
        b.lock.unlock_intent();
    }

    /// Take the single-cannibaliser slot. With `wait` false this is a
    /// try-acquire.
    pub fn cannibalize_lock(&self, wait: bool) -> Result<()> {
        let me = thread_token();
        let mut holder = self.alloc_lock.lock();
        if *holder == 0 || *holder == me {
            *holder = me;
            return Ok(());
        }
        if !wait {
            log::debug!("cannibalize lock held, not waiting");
            return Err(EngineError::Busy("cannibalize lock held"));
        }
        while *holder != 0 && *holder != me {
            self.alloc_wait.wait(&mut holder);
        }
        *holder = me;
        Ok(())
    }

    /// Release the cannibaliser slot if this thread holds it. Called
    /// every time a traversal unlocks the root.
    pub fn cannibalize_unlock(&self) {
        let me = thread_token();
        let mut holder = self.alloc_lock.lock();
        if *holder == me {
            *holder = 0;
            self.alloc_wait.notify_all();
        }
    }

    fn cannibalize_held(&self) -> bool {
        *self.alloc_lock.lock() == thread_token()
    }

    fn any_cannibalizer(&self) -> bool {
        *self.alloc_lock.lock() != 0
    }

    /// Scan the LRU in reverse and reap the oldest tearable node.
    /// The caller must hold the cannibaliser slot.
    fn cannibalize(&self, c: &CacheSet) -> Result<Arc<BtreeNode>> {
        debug_assert!(self.cannibalize_held());
        for flush in [false, true] {
            let victims: Vec<Arc<BtreeNode>> = {
                let lru = self.lru.lock();
                let mut v: Vec<Arc<BtreeNode>> =
                    lru.iter().map(|(_, b)| Arc::clone(b)).collect();
                v.reverse();
                v
            };
            for b in victims {
                if self.reap(Some(c), &b, flush) {
                    log::debug!("cannibalized node {}", b.uid);
                    self.hash_remove(&b);
                    return Ok(b);
                }
            }
        }
        Err(EngineError::NoMem("btree cache cannibalize failed"))
    }

    /// Get a container with data allocated, intent and write locks held.
    ///
    /// Order of preference: a reapable node off `freeable`, a container
    /// off `freed` (re-allocating its data), a brand-new container within
    /// the memory budget, and finally cannibalisation if this thread holds
    /// the cannibaliser slot.
    pub fn node_alloc(&self, c: &CacheSet) -> Result<Arc<BtreeNode>> {
        {
            let mut freeable = self.freeable.lock();
            for i in 0..freeable.len() {
                let b = Arc::clone(&freeable[i]);
                if self.reap(None, &b, false) {
                    freeable.swap_remove(i);
                    drop(freeable);
                    b.reset_flags();
                    if let Some(d) = b.data.write().as_mut() {
                        d.reset();
                    }
                    return Ok(b);
                }
            }
        }

        let freed_node = self.freed.lock().pop();
        if let Some(b) = freed_node {
            if self.used() < self.max_nodes() {
                // Nothing else can reach a freed container; the locks are
                // free by definition.
                let locked = b.lock.try_lock_intent() && b.lock.try_lock_write();
                debug_assert!(locked);
                if locked {
                    b.reset_flags();
                    *b.data.write() = Some(NodeData::empty());
                    self.used.fetch_add(1, Ordering::AcqRel);
                    return Ok(b);
                }
            }
            self.freed.lock().push(b);
        } else if self.used() < self.max_nodes() {
            let b = Arc::new(BtreeNode::new_container());
            assert!(b.lock.try_lock_intent());
            assert!(b.lock.try_lock_write());
            self.used.fetch_add(1, Ordering::AcqRel);
            return Ok(b);
        }

        if self.cannibalize_held() {
            return self.cannibalize(c);
        }
        Err(EngineError::NoMem("btree node alloc"))
    }

    /// Approximate reclaimable nodes, for the memory-pressure facility
    pub fn shrink_count(&self) -> u64 {
        if self.shrinker_disabled.load(Ordering::Acquire) || self.any_cannibalizer() {
            return 0;
        }
        self.used().saturating_sub(self.reserve()) as u64
    }

    /// Reclaim up to `nr` nodes: freeable first, then the LRU tail with
    /// second chance. Never shrinks below the reserve.
    pub fn shrink_scan(&self, c: &CacheSet, nr: u64) -> u64 {
        if self.shrinker_disabled.load(Ordering::Acquire) || self.any_cannibalizer() {
            return 0;
        }
        let can_free = self.used().saturating_sub(self.reserve()) as u64;
        let nr = nr.min(can_free);
        let mut freed = 0u64;

        {
            let mut freeable = self.freeable.lock();
            let mut i = 0;
            while i < freeable.len() && freed < nr {
                let b = Arc::clone(&freeable[i]);
                if self.reap(None, &b, false) {
                    freeable.swap_remove(i);
                    self.data_free(&b);
                    b.lock.unlock_write();
                    b.lock.unlock_intent();
                    freed += 1;
                } else {
                    i += 1;
                }
            }
        }

        // Two rounds: the first clears accessed flags (second chance),
        // the second can actually reap.
        let mut passes = self.lru.lock().len() * 2;
        while freed < nr && passes > 0 {
            passes -= 1;
            let popped = self.lru.lock().pop_lru();
            let Some((uid, b)) = popped else { break };

            if b.has_flag(NodeFlags::ACCESSED) {
                // Second chance.
                b.clear_flag(NodeFlags::ACCESSED);
                self.lru.lock().push(uid, b);
                continue;
            }
            if !self.reap(Some(c), &b, false) {
                self.lru.lock().push(uid, b);
                continue;
            }
            self.hash_remove(&b);
            self.data_free(&b);
            b.lock.unlock_write();
            b.lock.unlock_intent();
            freed += 1;
        }

        log::debug!("btree cache shrink: freed {} of {} requested", freed, nr);
        freed
    }

    /// Nodes currently hashed (for tests / stats)
    pub fn hashed_count(&self) -> usize {
        self.hash.lock().len()
    }
}

/// Read a node's content from disk into the container. The caller holds
/// the write lock.
pub fn node_read(c: &CacheSet, b: &Arc<BtreeNode>) -> Result<()> {
    let key = b.key.lock().clone();
    let node_bytes = c.node_bytes();
    let mut last_err = EngineError::Io("no device to read btree node from".into());

    for ptr in &key.v.ptrs {
        let Some(dev) = c.device(ptr.dev) else {
            continue;
        };
        let mut buf = vec![0u8; node_bytes];
        match dev.backend.read_sectors(ptr.offset, &mut buf) {
            Ok(()) => match node::deserialize(&buf) {
                Ok((data, level, btree_id)) => {
                    if level != b.level() || btree_id != b.btree_id() as u8 {
                        last_err = EngineError::Corrupted(format!(
                            "btree node at dev {} sector {}: wrong identity",
                            ptr.dev, ptr.offset
                        ));
                        continue;
                    }
                    *b.data.write() = Some(data);
                    return Ok(());
                }
                Err(e) => {
                    log::error!(
                        "btree node at dev {} sector {}: {}",
                        ptr.dev,
                        ptr.offset,
                        e
                    );
                    last_err = e;
                }
            },
            Err(e) => {
                dev.note_io_error();
                last_err = e;
            }
        }
    }

    b.set_flag(NodeFlags::READ_ERROR);
    Err(last_err)
}

/// Write a node's content to every replica. The caller holds at least a
/// read lock, so the content cannot change under us.
pub fn node_write(c: &CacheSet, b: &Arc<BtreeNode>) -> Result<()> {
    let key = b.key.lock().clone();
    let node_bytes = c.node_bytes();

    let bytes = {
        let guard = b.data.read();
        let data = guard
            .as_ref()
            .ok_or(EngineError::NotFound("node has no data"))?;
        node::serialize(data, b.level(), b.btree_id() as u8, node_bytes)?
    };

    b.set_flag(NodeFlags::WRITE_IN_FLIGHT);
    let mut wrote = 0;
    let mut last_err = None;
    for ptr in &key.v.ptrs {
        let Some(dev) = c.device(ptr.dev) else {
            continue;
        };
        match dev.backend.write_sectors(ptr.offset, &bytes) {
            Ok(()) => wrote += 1,
            Err(e) => {
                dev.note_io_error();
                last_err = Some(e);
            }
        }
    }

    if wrote == 0 {
        b.set_flag(NodeFlags::WRITE_ERROR);
        b.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
        return Err(last_err.unwrap_or(EngineError::Io("no device for btree write".into())));
    }

    #[cfg(feature = "verify")]
    verify_written_node(c, b, &bytes, &key);

    if let Some(d) = b.data.write().as_mut() {
        d.written = true;
        d.push_bset();
    }
    b.clear_flag(NodeFlags::DIRTY);
    b.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
    Ok(())
}

/// Re-read every written replica and compare against what we serialised.
#[cfg(feature = "verify")]
fn verify_written_node(c: &CacheSet, b: &Arc<BtreeNode>, bytes: &[u8], key: &BkeyI) {
    for ptr in &key.v.ptrs {
        let Some(dev) = c.device(ptr.dev) else {
            continue;
        };
        let mut back = vec![0u8; bytes.len()];
        if dev.backend.read_sectors(ptr.offset, &mut back).is_ok() && back != bytes {
            panic!(
                "btree node verify failed: dev {} sector {} (node {})",
                ptr.dev, ptr.offset, b.uid
            );
        }
    }
}

/// Find-or-fill: look a node up in the cache, locking it in `mode`,
/// reading it from disk if necessary.
///
/// The iterator supplies the deadlock-avoidance dance: before blocking on
/// the child's lock the parent's read lock is dropped, and the outcome is
/// re-validated afterwards. Returns `Retry` when a race with a split or
/// free was detected and the caller must re-traverse.
pub fn node_get(
    c: &CacheSet,
    iter: &mut crate::btree::iter::BtreeIter,
    k: &BkeyI,
    level: u8,
    mode: LockMode,
) -> Result<Arc<BtreeNode>> {
    loop {
        let found = c.btree_cache.node_find(k);
        let b = match found {
            None => {
                match node_fill(c, iter, k, level, mode)? {
                    // Raced with another fill; the node is in the hash now.
                    None => continue,
                    Some(b) => b,
                }
            }
            Some(b) => {
                // To lock the child we may block; holding the parent read
                // lock across that blocks a splitter trying to upgrade on
                // the other side. Drop it and re-validate instead.
                iter.unlock_parent_read(level);
                iter.lock_node(&b, mode);

                if b.first_ptr() != BtreeNode::hash_of(&k.v) || b.level() != level {
                    // The node was freed or reused while we waited.
                    iter.unlock_node(&b, mode);
                    if iter.relock_parent(level) {
                        continue;
                    }
                    return Err(EngineError::Retry);
                }
                b.set_flag(NodeFlags::ACCESSED);
                b
            }
        };

        if b.has_flag(NodeFlags::READ_ERROR) {
            iter.unlock_node(&b, mode);
            return Err(EngineError::Io("btree node read error".into()));
        }
        return Ok(b);
    }
}

/// Slow path of [`node_get`]: allocate a container, hash it, read from
/// disk. Returns `Ok(None)` if a concurrent fill won the race.
fn node_fill(
    c: &CacheSet,
    iter: &mut crate::btree::iter::BtreeIter,
    k: &BkeyI,
    level: u8,
    mode: LockMode,
) -> Result<Option<Arc<BtreeNode>>> {
    let b = match c.btree_cache.node_alloc(c) {
        Ok(b) => b,
        Err(EngineError::NoMem(_)) => {
            // Out of budget: take the cannibaliser slot and try again.
            // The slot is given back when the traversal unlocks.
            c.btree_cache.cannibalize_lock(true)?;
            c.btree_cache.node_alloc(c)?
        }
        Err(e) => return Err(e),
    };
    b.set_identity(k, level, iter.btree_id);

    if c.btree_cache.hash_insert(&b).is_err() {
        // Raced with another fill; mark as unhashed and recycle.
        c.btree_cache.make_freeable(&b);
        return Ok(None);
    }

    // The parent stays locked until the child is hashed - otherwise a
    // splitter could free the on-disk node we are about to read. Past
    // this point the usual rule applies.
    iter.unlock_parent_read(level);

    let read = node_read(c, &b);
    b.lock.unlock_write();

    if mode == LockMode::Read {
        b.lock.downgrade();
    }
    iter.register_lock(&b, mode);

    match read {
        Ok(()) => Ok(Some(b)),
        Err(e) => {
            iter.unlock_node(&b, mode);
            Err(e)
        }
    }
}
