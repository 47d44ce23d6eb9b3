//! Multi-level locked cursor.
//!
//! An iterator is a stack of locked nodes from the root down to some
//! target level plus an in-node position. It is the sole means of reading
//! or mutating the tree.
//!
//! Linked iterators (insert + lookup pairs) share lock ownership through a
//! [`LockRegistry`] keyed by node identity: the first member to reach a
//! node takes the real intent lock, peers that reach the same node are
//! admitted by bumping a hold count. Read locks are natively shared and
//! need no registry bookkeeping. A group member that takes a write lock
//! bumps the node's sequence; other members notice on relock and
//! re-traverse.

use crate::btree::cache::{self};
use crate::btree::lock::LockMode;
use crate::btree::{BtreeId, BtreeNode};
use crate::core::keys::{Bkey, BkeyI, Bpos};
use crate::core::{EngineError, Result, BTREE_MAX_DEPTH};
use crate::set::CacheSet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared lock-ownership table for a group of linked iterators
#[derive(Default)]
pub struct LockRegistry {
    /// node uid -> intent hold count (one real intent lock per entry)
    intents: Mutex<HashMap<u64, u32>>,
    /// iter id -> locks that member physically tracks
    members: Mutex<HashMap<u64, Vec<(Arc<BtreeNode>, LockMode)>>>,
    /// Bumped by group-wide unlock; members re-validate when it moves
    epoch: AtomicU64,
}

static NEXT_ITER_ID: AtomicU64 = AtomicU64::new(1);

impl LockRegistry {
    fn lock(&self, iter_id: u64, node: &Arc<BtreeNode>, mode: LockMode) {
        match mode {
            LockMode::Read => node.lock.lock_read(),
            LockMode::Intent => {
                let mut intents = self.intents.lock();
                match intents.get_mut(&node.uid) {
                    Some(n) => *n += 1,
                    None => {
                        drop(intents);
                        node.lock.lock_intent();
                        self.intents.lock().insert(node.uid, 1);
                    }
                }
            }
        }
        self.members
            .lock()
            .entry(iter_id)
            .or_default()
            .push((Arc::clone(node), mode));
    }

    /// Record a lock that was physically acquired elsewhere (node fill)
    fn adopt(&self, iter_id: u64, node: &Arc<BtreeNode>, mode: LockMode) {
        if mode == LockMode::Intent {
            *self.intents.lock().entry(node.uid).or_insert(0) += 1;
        }
        self.members
            .lock()
            .entry(iter_id)
            .or_default()
            .push((Arc::clone(node), mode));
    }

    fn unlock(&self, iter_id: u64, node: &Arc<BtreeNode>, mode: LockMode) {
        let mut members = self.members.lock();
        if let Some(list) = members.get_mut(&iter_id) {
            if let Some(i) = list
                .iter()
                .position(|(n, m)| n.uid == node.uid && *m == mode)
            {
                list.swap_remove(i);
            } else {
                // Already released by a group-wide unlock or a node free.
                return;
            }
        } else {
            return;
        }
        drop(members);
        self.release_physical(node, mode);
    }

    fn release_physical(&self, node: &Arc<BtreeNode>, mode: LockMode) {
        match mode {
            LockMode::Read => node.lock.unlock_read(),
            LockMode::Intent => {
                let mut intents = self.intents.lock();
                if let Some(n) = intents.get_mut(&node.uid) {
                    *n -= 1;
                    if *n == 0 {
                        intents.remove(&node.uid);
                        drop(intents);
                        node.lock.unlock_intent();
                    }
                }
            }
        }
    }

    /// Drop every lock of every member and bump the epoch
    fn unlock_group(&self) {
        let all: Vec<(Arc<BtreeNode>, LockMode)> = {
            let mut members = self.members.lock();
            members.values_mut().flat_map(std::mem::take).collect()
        };
        for (node, mode) in all {
            self.release_physical(&node, mode);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// A node is being freed: forget it entirely. The caller owns the
    /// physical intent+write locks and releases them itself; member
    /// bookkeeping for the node is dropped so later unlocks are no-ops.
    fn forget_node(&self, node: &Arc<BtreeNode>) {
        self.intents.lock().remove(&node.uid);
        let mut members = self.members.lock();
        for list in members.values_mut() {
            list.retain(|(n, _)| n.uid != node.uid);
        }
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

const LEVELS: usize = BTREE_MAX_DEPTH + 1;

/// The cursor
pub struct BtreeIter {
    /// The set this cursor walks
    pub c: Arc<CacheSet>,
    /// Which btree
    pub btree_id: BtreeId,
    /// Current position
    pub pos: Bpos,
    /// Target level; key iteration happens at 0
    pub level: u8,
    /// Depth below which intent locks are taken
    pub locks_want: u8,
    nodes: [Option<Arc<BtreeNode>>; LEVELS],
    lock_seq: [u32; LEVELS],
    locked_mask: u8,
    intent_mask: u8,
    uptodate: bool,
    /// Last key returned by peek, used by advance_pos
    last_key: Option<Bkey>,
    registry: Arc<LockRegistry>,
    iter_id: u64,
    epoch: u64,
}

impl BtreeIter {
    /// New cursor at `pos`
    pub fn new(c: Arc<CacheSet>, btree_id: BtreeId, pos: Bpos, locks_want: u8) -> BtreeIter {
        BtreeIter {
            c,
            btree_id,
            pos,
            level: 0,
            locks_want,
            nodes: Default::default(),
            lock_seq: [0; LEVELS],
            locked_mask: 0,
            intent_mask: 0,
            uptodate: false,
            last_key: None,
            registry: Arc::new(LockRegistry::default()),
            iter_id: NEXT_ITER_ID.fetch_add(1, Ordering::Relaxed),
            epoch: 0,
        }
    }

    /// A linked companion cursor sharing this one's lock ownership
    pub fn new_linked(&self, pos: Bpos, locks_want: u8) -> BtreeIter {
        BtreeIter {
            c: Arc::clone(&self.c),
            btree_id: self.btree_id,
            pos,
            level: 0,
            locks_want,
            nodes: Default::default(),
            lock_seq: [0; LEVELS],
            locked_mask: 0,
            intent_mask: 0,
            uptodate: false,
            last_key: None,
            registry: Arc::clone(&self.registry),
            iter_id: NEXT_ITER_ID.fetch_add(1, Ordering::Relaxed),
            epoch: self.registry.current_epoch(),
        }
    }

    fn lock_want(&self, level: u8) -> LockMode {
        if level < self.locks_want {
            LockMode::Intent
        } else {
            LockMode::Read
        }
    }

    fn check_epoch(&mut self) {
        let cur = self.registry.current_epoch();
        if cur != self.epoch {
            // A group-wide unlock happened; our locks are gone but the
            // node pointers and sequence snapshots stay valid as relock
            // hints.
            self.locked_mask = 0;
            self.intent_mask = 0;
            self.uptodate = false;
            self.epoch = cur;
        }
    }

    fn level_locked(&self, level: u8) -> bool {
        self.locked_mask & (1 << level) != 0
    }

    fn level_mode(&self, level: u8) -> LockMode {
        if self.intent_mask & (1 << level) != 0 {
            LockMode::Intent
        } else {
            LockMode::Read
        }
    }

    /// Node currently held at a level
    pub fn node_at(&self, level: u8) -> Option<&Arc<BtreeNode>> {
        self.nodes[level as usize].as_ref()
    }

    /// Lock a node through the registry (blocking)
    pub(crate) fn lock_node(&mut self, node: &Arc<BtreeNode>, mode: LockMode) {
        self.check_epoch();
        self.registry.lock(self.iter_id, node, mode);
    }

    /// Adopt a physically-held lock into the registry (node fill path)
    pub(crate) fn register_lock(&mut self, node: &Arc<BtreeNode>, mode: LockMode) {
        self.registry.adopt(self.iter_id, node, mode);
    }

    /// Unlock a node acquired through the registry
    pub(crate) fn unlock_node(&mut self, node: &Arc<BtreeNode>, mode: LockMode) {
        self.registry.unlock(self.iter_id, node, mode);
    }

    /// Drop the read lock on the parent of `child_level`, if held as a
    /// read lock. Intent locks on the path stay.
    pub(crate) fn unlock_parent_read(&mut self, child_level: u8) {
        let p = child_level + 1;
        if p as usize >= LEVELS || !self.level_locked(p) {
            return;
        }
        if self.level_mode(p) == LockMode::Read {
            if let Some(node) = self.nodes[p as usize].clone() {
                self.registry.unlock(self.iter_id, &node, LockMode::Read);
            }
            self.locked_mask &= !(1 << p);
        }
    }

    /// Try to re-take the parent lock after the deadlock-avoidance drop
    pub(crate) fn relock_parent(&mut self, child_level: u8) -> bool {
        let p = child_level + 1;
        if p as usize >= LEVELS {
            return false;
        }
        if self.level_locked(p) {
            return true;
        }
        self.relock_level(p)
    }

    fn relock_level(&mut self, level: u8) -> bool {
        let Some(node) = self.nodes[level as usize].clone() else {
            return false;
        };
        let mode = self.lock_want(level);
        match mode {
            LockMode::Read => {
                if !node.lock.relock(LockMode::Read, self.lock_seq[level as usize]) {
                    return false;
                }
                self.registry
                    .members
                    .lock()
                    .entry(self.iter_id)
                    .or_default()
                    .push((Arc::clone(&node), LockMode::Read));
            }
            LockMode::Intent => {
                // A live grant means a peer still holds the intent lock;
                // admission is valid only if nothing wrote meanwhile.
                let granted = self.registry.intents.lock().contains_key(&node.uid);
                if granted {
                    if node.lock.seq() != self.lock_seq[level as usize] {
                        return false;
                    }
                    self.registry.adopt(self.iter_id, &node, LockMode::Intent);
                } else {
                    if !node.lock.relock(LockMode::Intent, self.lock_seq[level as usize]) {
                        return false;
                    }
                    self.registry.adopt(self.iter_id, &node, LockMode::Intent);
                }
            }
        }
        self.locked_mask |= 1 << level;
        if mode == LockMode::Intent {
            self.intent_mask |= 1 << level;
        } else {
            self.intent_mask &= !(1 << level);
        }
        true
    }

    fn unlock_level(&mut self, level: u8) {
        if !self.level_locked(level) {
            return;
        }
        if let Some(node) = self.nodes[level as usize].clone() {
            self.registry
                .unlock(self.iter_id, &node, self.level_mode(level));
        }
        self.locked_mask &= !(1 << level);
        self.intent_mask &= !(1 << level);
    }

    /// Drop every lock this cursor holds. Releasing the root also gives
    /// up the cannibaliser slot.
    pub fn unlock_all(&mut self) {
        self.check_epoch();
        for level in 0..LEVELS as u8 {
            self.unlock_level(level);
        }
        self.uptodate = false;
        self.c.btree_cache.cannibalize_unlock();
    }

    /// Group-wide unlock: every linked cursor drops everything
    pub fn unlock_group(&mut self) {
        self.registry.unlock_group();
        self.locked_mask = 0;
        self.intent_mask = 0;
        self.uptodate = false;
        self.epoch = self.registry.current_epoch();
        self.c.btree_cache.cannibalize_unlock();
    }

    /// Drop all locks on all linked peers and yield; the iterator must be
    /// re-traversed afterwards.
    pub fn cond_resched(&mut self) {
        self.unlock_group();
        std::thread::yield_now();
    }

    /// A node this group is freeing: wipe it from every member's
    /// bookkeeping (the freeing caller owns the physical locks).
    pub(crate) fn forget_node(&mut self, node: &Arc<BtreeNode>) {
        self.registry.forget_node(node);
        for level in 0..LEVELS {
            if self.nodes[level]
                .as_ref()
                .is_some_and(|n| n.uid == node.uid)
            {
                self.nodes[level] = None;
                self.locked_mask &= !(1 << level);
                self.intent_mask &= !(1 << level);
            }
        }
    }

    /// Raise `locks_want`, unlocking everything if the held locks do not
    /// already satisfy it. Returns false when the caller must re-traverse.
    pub fn set_locks_want(&mut self, new_locks_want: u8) -> bool {
        let new_locks_want = new_locks_want.min(LEVELS as u8);
        if new_locks_want <= self.locks_want {
            self.locks_want = new_locks_want;
            return true;
        }
        self.locks_want = new_locks_want;
        let mut satisfied = true;
        for level in 0..new_locks_want {
            if self.nodes[level as usize].is_some()
                && (!self.level_locked(level) || self.level_mode(level) != LockMode::Intent)
            {
                satisfied = false;
            }
        }
        if !satisfied {
            self.unlock_all();
        }
        satisfied
    }

    fn store_level(&mut self, level: u8, node: Arc<BtreeNode>, mode: LockMode) {
        self.lock_seq[level as usize] = node.lock.seq();
        self.nodes[level as usize] = Some(node);
        self.locked_mask |= 1 << level;
        if mode == LockMode::Intent {
            self.intent_mask |= 1 << level;
        } else {
            self.intent_mask &= !(1 << level);
        }
    }

    fn lock_root(&mut self) -> Result<(Arc<BtreeNode>, u8)> {
        loop {
            let root = self
                .c
                .btree_root(self.btree_id)
                .ok_or(EngineError::NotFound("btree has no root"))?;
            let level = root.level();
            let mode = self.lock_want(level);
            self.lock_node(&root.clone(), mode);

            let still_root = self
                .c
                .btree_root(self.btree_id)
                .is_some_and(|cur| Arc::ptr_eq(&cur, &root));
            if still_root {
                self.store_level(level, Arc::clone(&root), mode);
                return Ok((root, level));
            }
            let node = root;
            self.unlock_node(&node, mode);
        }
    }

    /// Bring the cursor to its target position, locking the path in the
    /// modes dictated by `locks_want`. Loops internally on lost races at
    /// single nodes; returns `Retry` when the whole traversal must be
    /// restarted by the caller with fresh state.
    pub fn traverse(&mut self) -> Result<()> {
        self.check_epoch();

        if self.uptodate && self.level_locked(self.level) {
            return Ok(());
        }

        // Position moved but the target node is still locked: stay on it
        // if it covers the new position.
        if self.level_locked(self.level) {
            if let Some(node) = self.nodes[self.level as usize].clone() {
                let covers = node.data.read().as_ref().is_some_and(|d| {
                    d.min_key <= self.pos && self.pos <= d.max_key
                });
                if covers {
                    self.uptodate = true;
                    return Ok(());
                }
            }
        }

        // Fast path: re-take the lock on the node we already have if
        // nothing wrote to it and it still covers pos.
        if let Some(node) = self.nodes[self.level as usize].clone() {
            if !self.level_locked(self.level)
                && node.first_ptr() != 0
                && self.relock_level(self.level)
            {
                let covers = {
                    let guard = node.data.read();
                    guard.as_ref().is_some_and(|d| {
                        d.min_key <= self.pos && self.pos <= d.max_key
                    })
                };
                if covers {
                    self.uptodate = true;
                    return Ok(());
                }
                self.unlock_level(self.level);
            }
        }

        self.unlock_all();

        let (mut node, mut level) = self.lock_root()?;
        while level > self.level {
            let child_key = {
                let guard = node.data.read();
                let data = guard.as_ref().ok_or(EngineError::Retry)?;
                data.child_for(self.pos).ok_or_else(|| {
                    EngineError::Corrupted(format!(
                        "interior node has no child covering {:?}",
                        self.pos
                    ))
                })?
            };

            let child_level = level - 1;
            let mode = self.lock_want(child_level);
            let c = Arc::clone(&self.c);
            let child = cache::node_get(c.as_ref(), self, &child_key, child_level, mode)?;
            self.store_level(child_level, Arc::clone(&child), mode);
            node = child;
            level = child_level;
        }

        self.uptodate = true;
        Ok(())
    }

    /// Traverse, transparently restarting on `Retry` up to a bound
    pub fn traverse_retrying(&mut self) -> Result<()> {
        for _ in 0..64 {
            match self.traverse() {
                Err(e) if e.is_transient() => {
                    self.unlock_all();
                    continue;
                }
                other => return other,
            }
        }
        Err(EngineError::Retry)
    }

    fn leaf_bound(&self, leaf: &Arc<BtreeNode>) -> Bpos {
        leaf.data
            .read()
            .as_ref()
            .map_or(Bpos::MAX, |d| d.max_key)
    }

    /// First key at or after `pos` within the locked leaf, re-traversing
    /// to successor leaves as needed. Returns `None` at the end of the
    /// tree.
    pub fn peek(&mut self) -> Result<Option<BkeyI>> {
        loop {
            self.traverse_retrying()?;
            let leaf = self.nodes[self.level as usize]
                .clone()
                .ok_or(EngineError::Retry)?;

            let found = {
                let guard = leaf.data.read();
                let data = guard.as_ref().ok_or(EngineError::Retry)?;
                if self.btree_id.is_extents() {
                    data.next_key_after(self.pos)
                } else {
                    data.child_for(self.pos)
                }
            };

            if let Some(k) = found {
                self.last_key = Some(k.k);
                return Ok(Some(k));
            }

            let bound = self.leaf_bound(&leaf);
            if bound >= Bpos::MAX {
                return Ok(None);
            }
            self.set_pos(bound.successor());
        }
    }

    /// Like [`peek`](Self::peek), but synthesises a hole key (type
    /// `Discard`) covering any gap before the next real key.
    pub fn peek_with_holes(&mut self) -> Result<Option<BkeyI>> {
        loop {
            self.traverse_retrying()?;
            let leaf = self.nodes[self.level as usize]
                .clone()
                .ok_or(EngineError::Retry)?;

            let (found, bound) = {
                let guard = leaf.data.read();
                let data = guard.as_ref().ok_or(EngineError::Retry)?;
                (data.next_key_after(self.pos), data.max_key)
            };

            let hole_end = match found {
                Some(k) if k.k.start() <= self.pos => {
                    self.last_key = Some(k.k);
                    return Ok(Some(k));
                }
                Some(k) => {
                    if k.k.start().inode == self.pos.inode {
                        k.k.start().offset
                    } else {
                        u64::MAX
                    }
                }
                None => {
                    if bound >= Bpos::MAX {
                        u64::MAX
                    } else if bound.inode == self.pos.inode {
                        if bound.offset <= self.pos.offset {
                            self.set_pos(bound.successor());
                            continue;
                        }
                        bound.offset
                    } else {
                        u64::MAX
                    }
                }
            };

            let size = hole_end - self.pos.offset;
            let hole = BkeyI::discard(Bkey {
                p: Bpos::new(self.pos.inode, hole_end),
                size,
                version: 0,
            });
            self.last_key = Some(hole.k);
            return Ok(Some(hole));
        }
    }

    /// Advance past the key last returned by peek
    pub fn advance_pos(&mut self) {
        let next = match (self.btree_id, self.last_key) {
            (BtreeId::Extents, Some(k)) => k.p,
            (id, Some(k)) => id.successor(k.p),
            (_, None) => self.pos.successor(),
        };
        self.set_pos(next);
    }

    /// Move to a new position; the held leaf is kept as a relock hint
    pub fn set_pos(&mut self, pos: Bpos) {
        self.pos = pos;
        self.uptodate = false;
    }

    /// Move within the currently locked leaf
    pub fn set_pos_same_leaf(&mut self, pos: Bpos) {
        debug_assert!(self.level_locked(self.level));
        self.pos = pos;
    }

    /// Move backwards; forces a fresh traversal
    pub fn rewind(&mut self, pos: Bpos) {
        self.pos = pos;
        self.uptodate = false;
        self.unlock_all();
    }

    /// Take the write lock on the node held at `level` (intent must be
    /// held there). Our own sequence snapshot is refreshed on release so
    /// only peers see the change.
    pub(crate) fn node_for_write(&mut self, level: u8) -> Result<Arc<BtreeNode>> {
        if !self.level_locked(level) || self.level_mode(level) != LockMode::Intent {
            return Err(EngineError::Retry);
        }
        let node = self.nodes[level as usize]
            .clone()
            .ok_or(EngineError::Retry)?;
        node.lock.lock_write();
        Ok(node)
    }

    /// Release a node write lock and refresh our snapshot
    pub(crate) fn node_write_done(&mut self, level: u8, node: &Arc<BtreeNode>) {
        node.lock.unlock_write();
        self.lock_seq[level as usize] = node.lock.seq();
    }
}

impl Drop for BtreeIter {
    fn drop(&mut self) {
        self.unlock_all();
        // Belt and braces: release anything the level masks lost track of
        // (a traversal that errored between locking and storing a level).
        let leftovers = self.registry.members.lock().remove(&self.iter_id);
        if let Some(list) = leftovers {
            for (node, mode) in list {
                self.registry.release_physical(&node, mode);
            }
        }
    }
}
