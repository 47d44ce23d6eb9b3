//! # B+-tree
//!
//! All metadata lives in persistent copy-on-write btrees keyed by
//! `(inode, offset)`. This module owns:
//! - The in-memory node representation and on-disk format ([`node`])
//! - The three-mode node lock ([`lock`])
//! - The node cache with reserve and cannibalisation ([`cache`])
//! - The multi-level locked cursor ([`iter`])
//! - The insert path with splits and journalling ([`insert`])

use crate::core::keys::{Bkey, BkeyI, Bpos, ExtentValue};
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

pub mod cache;
pub mod insert;
pub mod iter;
pub mod lock;
pub mod node;

use lock::ThreeLock;
use node::NodeData;

/// Which btree a key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BtreeId {
    /// Extents: keys are end positions, sized, values carry pointers
    Extents = 0,
    /// Inodes: one key per logical device volume
    Inodes = 1,
}

/// Number of btrees
pub const BTREE_ID_NR: usize = 2;

impl BtreeId {
    /// All btree ids
    pub fn all() -> [BtreeId; BTREE_ID_NR] {
        [BtreeId::Extents, BtreeId::Inodes]
    }

    /// Whether keys in this btree are ranges (sized extents)
    pub fn is_extents(self) -> bool {
        self == BtreeId::Extents
    }

    /// Position iteration advances to after consuming a key at `pos`
    pub fn successor(self, pos: Bpos) -> Bpos {
        match self {
            BtreeId::Extents => pos,
            BtreeId::Inodes => Bpos::new(pos.inode + 1, 0),
        }
    }
}

bitflags! {
    /// Node state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// Has un-written keys
        const DIRTY = 1 << 0;
        /// A write of this node is in flight
        const WRITE_IN_FLIGHT = 1 << 1;
        /// The last write failed
        const WRITE_ERROR = 1 << 2;
        /// Reading the node from disk failed; sticky
        const READ_ERROR = 1 << 3;
        /// Never evict (roots)
        const NOEVICT = 1 << 4;
        /// Touched since the last shrinker scan (second chance)
        const ACCESSED = 1 << 5;
    }
}

static NODE_UID: AtomicU64 = AtomicU64::new(1);

/// One cached btree node.
///
/// A node is reachable only through the cache hash or through an iterator
/// that currently locks it. Its lifetime ends only after no lock is held,
/// no write is in flight, and it has been removed from the hash; the
/// container itself is then recycled through the freed list and keeps its
/// lock.
pub struct BtreeNode {
    /// Stable identity for lock registries and LRU bookkeeping
    pub uid: u64,
    /// The three-mode lock guarding content
    pub lock: ThreeLock,
    flags: AtomicU32,
    level: AtomicU8,
    btree_id: AtomicU8,
    /// First pointer of the node's key; the cache hash identity.
    /// Zero means unhashed - lookups for a freed node must fail.
    first_ptr: AtomicU64,
    /// The node's own key: position is the node's max key, value points
    /// at the on-disk location
    pub key: Mutex<BkeyI>,
    /// Node content; `None` once the data has been released to the
    /// freed list
    pub data: RwLock<Option<NodeData>>,
}

impl BtreeNode {
    /// A fresh, unhashed container with data allocated
    pub fn new_container() -> BtreeNode {
        BtreeNode {
            uid: NODE_UID.fetch_add(1, Ordering::Relaxed),
            lock: ThreeLock::new(),
            flags: AtomicU32::new(0),
            level: AtomicU8::new(0),
            btree_id: AtomicU8::new(0),
            first_ptr: AtomicU64::new(0),
            key: Mutex::new(BkeyI::deleted(Bkey::extent(0, 0, 0))),
            data: RwLock::new(Some(NodeData::empty())),
        }
    }

    /// Node level; 0 is a leaf
    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Acquire)
    }

    /// Which btree this node belongs to
    pub fn btree_id(&self) -> BtreeId {
        match self.btree_id.load(Ordering::Acquire) {
            0 => BtreeId::Extents,
            _ => BtreeId::Inodes,
        }
    }

    pub(crate) fn set_identity(&self, key: &BkeyI, level: u8, btree_id: BtreeId) {
        self.level.store(level, Ordering::Release);
        self.btree_id.store(btree_id as u8, Ordering::Release);
        *self.key.lock() = key.clone();
        self.first_ptr
            .store(Self::hash_of(&key.v), Ordering::Release);
    }

    /// The cache hash identity of a node key: its first pointer word
    pub fn hash_of(v: &ExtentValue) -> u64 {
        v.ptrs.first().map_or(0, |p| p.to_word())
    }

    /// Current hash identity; zero when unhashed
    pub fn first_ptr(&self) -> u64 {
        self.first_ptr.load(Ordering::Acquire)
    }

    /// Zero the hash identity so future lookups fail
    pub(crate) fn clear_identity(&self) {
        self.first_ptr.store(0, Ordering::Release);
    }

    /// Test flags
    pub fn has_flag(&self, f: NodeFlags) -> bool {
        NodeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).intersects(f)
    }

    /// Set flags
    pub fn set_flag(&self, f: NodeFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    /// Clear flags
    pub fn clear_flag(&self, f: NodeFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    /// Reset all flags (on container reuse)
    pub(crate) fn reset_flags(&self) {
        self.flags.store(0, Ordering::Release);
    }

    /// Max key bound of this node
    pub fn max_key(&self) -> Bpos {
        self.key.lock().k.p
    }
}

impl std::fmt::Debug for BtreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeNode")
            .field("uid", &self.uid)
            .field("level", &self.level())
            .field("btree_id", &self.btree_id())
            .field("first_ptr", &self.first_ptr())
            .finish()
    }
}

/// The roots of every btree plus the depth, swapped atomically on root
/// split
#[derive(Debug)]
pub struct BtreeRoot {
    /// Root node; level == depth
    pub node: RwLock<Option<std::sync::Arc<BtreeNode>>>,
}

impl Default for BtreeRoot {
    fn default() -> Self {
        BtreeRoot {
            node: RwLock::new(None),
        }
    }
}

/// Default btree node size in sectors (16 KiB)
pub const DEFAULT_NODE_SECTORS: u32 = 32;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::ExtentPtr;

    #[test]
    fn node_identity_hash() {
        let n = BtreeNode::new_container();
        assert_eq!(n.first_ptr(), 0);

        let v = ExtentValue {
            crc: None,
            ptrs: vec![ExtentPtr { dev: 1, offset: 512, gen: 2, cached: false }],
        };
        let k = BkeyI::extent(Bkey::extent(0, 100, 0), v.clone());
        n.set_identity(&k, 1, BtreeId::Extents);
        assert_eq!(n.first_ptr(), BtreeNode::hash_of(&v));
        assert_eq!(n.level(), 1);

        n.clear_identity();
        assert_eq!(n.first_ptr(), 0);
    }

    #[test]
    fn successor_by_btree() {
        assert_eq!(
            BtreeId::Inodes.successor(Bpos::new(3, 77)),
            Bpos::new(4, 0)
        );
        // Extents advance by key size, handled by the iterator.
        assert_eq!(
            BtreeId::Extents.successor(Bpos::new(3, 77)),
            Bpos::new(3, 77)
        );
    }
}
