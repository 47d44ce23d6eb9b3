//! Insert path.
//!
//! Inserts are transactional within a tree node: each acquires the intent
//! lock on the leaf through the iterator, mutates under the write lock,
//! and commits with a journal entry carrying the insert's sequence.
//! Splits are copy-on-write: the old node is replaced by two freshly
//! allocated nodes, the parent is repointed, and the old node's bucket
//! sectors are released.

use crate::btree::cache::node_write;
use crate::btree::iter::BtreeIter;
use crate::btree::node::{DroppedRange, NodeData};
use crate::btree::{BtreeId, BtreeNode, NodeFlags};
use crate::core::keys::{Bkey, BkeyI, Bpos, ExtentPtr, ExtentValue};
use crate::core::{EngineError, Result};
use crate::device::bucket::SectorKind;
use crate::device::freelist::{bucket_alloc, Reserve};
use crate::journal::JournalRecord;
use crate::set::CacheSet;
use std::sync::Arc;

/// Allocate a btree node on disk and in the cache, carrying `data`.
/// Returned with intent and write locks held and the DIRTY flag set.
pub fn btree_node_alloc(
    c: &CacheSet,
    level: u8,
    btree_id: BtreeId,
    data: NodeData,
) -> Result<Arc<BtreeNode>> {
    let dev = c
        .tier_group(0)
        .next_device()
        .ok_or(EngineError::NoSpace("no tier-0 device for btree node"))?;

    let bucket = bucket_alloc(&dev, Reserve::Btree)?;
    let node_sectors = c.config.btree_node_sectors;
    dev.buckets[bucket as usize].add_sectors(
        SectorKind::Meta,
        node_sectors as u16,
        dev.cfg.bucket_sectors,
    )?;
    dev.add_used_sectors(node_sectors as u64);

    let gen = dev.buckets[bucket as usize].gen();
    let key = BkeyI::extent(
        Bkey {
            p: data.max_key,
            size: 0,
            version: 0,
        },
        ExtentValue {
            crc: None,
            ptrs: vec![ExtentPtr {
                dev: dev.idx,
                offset: dev.bucket_to_sector(bucket),
                gen,
                cached: false,
            }],
        },
    );

    let b = c.btree_cache.node_alloc(c)?;
    b.set_identity(&key, level, btree_id);
    *b.data.write() = Some(data);
    b.set_flag(NodeFlags::DIRTY);

    if let Err(e) = c.btree_cache.hash_insert(&b) {
        c.btree_cache.make_freeable(&b);
        release_node_sectors(c, &key);
        return Err(e);
    }

    c.journal.add_entry(JournalRecord::AllocEvent {
        dev: dev.idx,
        bucket,
        gen,
    });

    log::trace!(
        "allocated btree node {} level {} at dev {} bucket {}",
        b.uid,
        level,
        dev.idx,
        bucket
    );
    Ok(b)
}

/// Release the bucket sectors referenced by a node key
fn release_node_sectors(c: &CacheSet, key: &BkeyI) {
    for ptr in &key.v.ptrs {
        if let Some(dev) = c.device(ptr.dev) {
            dev.bucket_for_sector(ptr.offset)
                .sub_sectors(SectorKind::Meta, c.config.btree_node_sectors as u16);
            dev.sub_used_sectors(c.config.btree_node_sectors as u64);
        }
    }
}

/// Release the bucket sectors of extent ranges dropped by an overwrite
fn account_dropped(c: &CacheSet, dropped: &[DroppedRange]) {
    for d in dropped {
        let kind = d.sector_kind();
        let sectors = d.key.k.size;
        for ptr in &d.key.v.ptrs {
            if let Some(dev) = c.device(ptr.dev) {
                dev.bucket_for_sector(ptr.offset)
                    .sub_sectors(kind, sectors as u16);
                dev.sub_used_sectors(sectors);
            }
        }
    }
}

/// Copy-on-write split of the node at `level`. On return the iterator is
/// stale and must re-traverse; `Retry` is returned when more intent locks
/// are needed first.
fn btree_split(c: &Arc<CacheSet>, iter: &mut BtreeIter, level: u8) -> Result<()> {
    let node = iter
        .node_at(level)
        .cloned()
        .ok_or(EngineError::Retry)?;

    let is_root = c
        .btree_root(iter.btree_id)
        .is_some_and(|r| Arc::ptr_eq(&r, &node));

    if !is_root && !iter.set_locks_want(level + 2) {
        return Err(EngineError::Retry);
    }

    let wl = iter.node_for_write(level)?;
    debug_assert!(Arc::ptr_eq(&wl, &node));

    let (lower, upper) = {
        let mut guard = node.data.write();
        let data = guard.as_mut().ok_or(EngineError::Retry)?;
        if data.key_count() < 2 {
            // A single giant key cannot be split; the node simply holds it.
            drop(guard);
            iter.node_write_done(level, &node);
            return Ok(());
        }
        let upper = data.split();
        (data.clone(), upper)
    };

    let n1 = match btree_node_alloc(c, level, iter.btree_id, lower) {
        Ok(n) => n,
        Err(e) => {
            iter.node_write_done(level, &node);
            return Err(e);
        }
    };
    let n2 = match btree_node_alloc(c, level, iter.btree_id, upper) {
        Ok(n) => n,
        Err(e) => {
            let k1 = n1.key.lock().clone();
            n1.clear_flag(NodeFlags::DIRTY);
            c.btree_cache.make_freeable(&n1);
            release_node_sectors(c, &k1);
            iter.node_write_done(level, &node);
            return Err(e);
        }
    };

    node_write(c, &n1)?;
    node_write(c, &n2)?;

    let k1 = n1.key.lock().clone();
    let k2 = n2.key.lock().clone();

    if is_root {
        let mut root_data = NodeData::with_bounds(Bpos::MIN, Bpos::MAX);
        root_data.insert_replace(k1);
        root_data.insert_replace(k2);
        let new_root = btree_node_alloc(c, level + 1, iter.btree_id, root_data)?;
        new_root.set_flag(NodeFlags::NOEVICT);
        node_write(c, &new_root)?;
        new_root.lock.unlock_write();
        new_root.lock.unlock_intent();

        node.clear_flag(NodeFlags::NOEVICT);
        c.set_btree_root(iter.btree_id, Arc::clone(&new_root));
        log::debug!(
            "btree {:?}: root split, depth now {}",
            iter.btree_id,
            level + 1
        );
    } else {
        let parent = iter.node_at(level + 1).cloned().ok_or(EngineError::Retry)?;
        let pwl = iter.node_for_write(level + 1)?;
        debug_assert!(Arc::ptr_eq(&pwl, &parent));
        {
            let mut guard = parent.data.write();
            let pdata = guard.as_mut().ok_or(EngineError::Retry)?;
            pdata.insert_replace(k2);
            pdata.insert_replace(k1);
        }
        parent.set_flag(NodeFlags::DIRTY);
        iter.node_write_done(level + 1, &parent);
    }

    n1.lock.unlock_write();
    n1.lock.unlock_intent();
    n2.lock.unlock_write();
    n2.lock.unlock_intent();

    // Retire the old node: lookups must fail from here on, and its meta
    // sectors go back to the device.
    let old_key = node.key.lock().clone();
    node.clear_flag(NodeFlags::DIRTY);
    iter.forget_node(&node);
    c.btree_cache.make_freeable(&node);
    release_node_sectors(c, &old_key);

    // Parent may be at capacity now.
    let parent_wants_split = !is_root
        && iter.node_at(level + 1).is_some_and(|p| {
            p.data
                .read()
                .as_ref()
                .is_some_and(|d| d.wants_split(c.node_bytes()))
        });
    if parent_wants_split {
        btree_split(c, iter, level + 1)?;
    }

    iter.set_pos(iter.pos);
    Err(EngineError::Retry)
}

/// Insert one key through an iterator positioned in the right btree.
/// An extent key crossing the leaf's key-space boundary is split at the
/// boundary and the remainder continues in the successor leaf. Returns
/// the journal sequence of the last committed piece. The iterator must
/// have been created with `locks_want >= 1`.
pub fn btree_insert_at(c: &Arc<CacheSet>, iter: &mut BtreeIter, key: BkeyI) -> Result<u64> {
    let mut key = key;
    loop {
        iter.traverse_retrying()?;

        let needs_split = iter.node_at(0).is_some_and(|leaf| {
            leaf.data
                .read()
                .as_ref()
                .is_some_and(|d| d.wants_split(c.node_bytes()))
        });
        if needs_split {
            match btree_split(c, iter, 0) {
                Ok(()) => {}
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            }
            continue;
        }

        let leaf = match iter.node_for_write(0) {
            Ok(l) => l,
            Err(e) if e.is_transient() => {
                iter.set_locks_want(1);
                continue;
            }
            Err(e) => return Err(e),
        };

        // The leaf covers the key's start but maybe not its end; commit
        // the part that fits and carry the rest to the next leaf.
        let mut rest: Option<BkeyI> = None;
        let mut this_piece = key.clone();
        let leaf_max = leaf
            .data
            .read()
            .as_ref()
            .map_or(crate::core::keys::Bpos::MAX, |d| d.max_key);
        if iter.btree_id.is_extents()
            && key.k.size > 0
            && key.k.p.inode == leaf_max.inode
            && key.k.p.offset > leaf_max.offset
        {
            let over = key.k.p.offset - leaf_max.offset;
            crate::btree::node::trim_key_back(&mut this_piece, over);
            let mut tail = key.clone();
            crate::btree::node::trim_key_front(&mut tail, key.k.size - over);
            rest = Some(tail);
        }

        let dropped = {
            let mut guard = leaf.data.write();
            let Some(data) = guard.as_mut() else {
                drop(guard);
                iter.node_write_done(0, &leaf);
                continue;
            };
            if iter.btree_id.is_extents() {
                data.insert_extent(this_piece.clone())
            } else {
                data.insert_replace(this_piece.clone());
                Vec::new()
            }
        };
        account_dropped(c, &dropped);
        leaf.set_flag(NodeFlags::DIRTY);

        let compact = leaf
            .data
            .read()
            .as_ref()
            .is_some_and(|d| d.bsets.len() > 4);
        if compact {
            if let Some(d) = leaf.data.write().as_mut() {
                d.compact();
            }
        }

        let seq = c.journal.add_entry(JournalRecord::KeyInsert {
            btree_id: iter.btree_id as u8,
            key: this_piece,
        });
        iter.node_write_done(0, &leaf);

        match rest {
            Some(tail) => {
                iter.set_pos(tail.k.start());
                key = tail;
            }
            None => return Ok(seq),
        }
    }
}

/// One-shot insert: builds an intent iterator at the key's start
pub fn btree_insert(c: &Arc<CacheSet>, btree_id: BtreeId, key: BkeyI) -> Result<u64> {
    let start = if btree_id.is_extents() {
        key.k.start()
    } else {
        key.k.p
    };
    let mut iter = BtreeIter::new(Arc::clone(c), btree_id, start, 1);
    btree_insert_at(c, &mut iter, key)
}

/// Reserve a range with a hole placeholder, used by the cache-miss path
/// to claim the range it is about to promote. Returns false (without
/// inserting) when any live data key already overlaps.
pub fn btree_insert_check_key(c: &Arc<CacheSet>, iter: &mut BtreeIter, key: &Bkey) -> Result<bool> {
    iter.set_locks_want(1);
    loop {
        iter.traverse_retrying()?;

        let leaf = match iter.node_for_write(0) {
            Ok(l) => l,
            Err(e) if e.is_transient() => {
                iter.set_locks_want(1);
                continue;
            }
            Err(e) => return Err(e),
        };

        let inserted = {
            let mut guard = leaf.data.write();
            let Some(data) = guard.as_mut() else {
                drop(guard);
                iter.node_write_done(0, &leaf);
                continue;
            };
            if data.has_data_in(key.start(), key.p) {
                false
            } else {
                data.insert_extent(BkeyI::discard(*key));
                true
            }
        };

        if inserted {
            leaf.set_flag(NodeFlags::DIRTY);
            c.journal.add_entry(JournalRecord::KeyInsert {
                btree_id: iter.btree_id as u8,
                key: BkeyI::discard(*key),
            });
        }
        iter.node_write_done(0, &leaf);
        return Ok(inserted);
    }
}

/// Drop every cached extent overlapping `[start, end)` on `inode`,
/// releasing their bucket sectors. Used by bypass writes and discards to
/// invalidate cached copies.
pub fn btree_delete_range(c: &Arc<CacheSet>, inode: u64, start: u64, end: u64) -> Result<u64> {
    let key = BkeyI::deleted(Bkey::extent(inode, end, end - start));
    btree_insert(c, BtreeId::Extents, key)
}

/// Create the initial (empty leaf) root for a btree
pub fn btree_root_alloc(c: &Arc<CacheSet>, btree_id: BtreeId) -> Result<()> {
    let data = NodeData::with_bounds(Bpos::MIN, Bpos::MAX);
    let root = btree_node_alloc(c, 0, btree_id, data)?;
    root.set_flag(NodeFlags::NOEVICT);
    node_write(c, &root)?;
    root.lock.unlock_write();
    root.lock.unlock_intent();
    c.set_btree_root(btree_id, root);
    Ok(())
}
