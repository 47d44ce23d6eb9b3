//! Node content and on-disk format.
//!
//! A node holds an ordered sequence of bsets, one per write since the node
//! was last compacted. Inserts resolve extent overlaps eagerly under the
//! node write lock, so the bsets stay mutually non-overlapping and
//! iteration is a plain k-way merge.
//!
//! On disk a node is a checksummed header (level, bounds, key format,
//! sector count) followed by the bset segments; each segment carries a
//! u64 key count and keys packed via the node's [`BkeyFormat`].

use crate::core::keys::{Bkey, BkeyFormat, BkeyI, Bpos, ExtentValue, KeyType};
use crate::core::{EngineError, Result, SECTOR_SIZE};
use crate::device::bucket::SectorKind;

/// One append-log segment within a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bset {
    /// Keys sorted by end position
    pub keys: Vec<BkeyI>,
}

/// A logical range dropped from the tree by an overlapping insert; the
/// caller releases the corresponding bucket sectors.
#[derive(Debug, Clone)]
pub struct DroppedRange {
    /// The dropped portion, with its (possibly trimmed) key and value
    pub key: BkeyI,
}

impl DroppedRange {
    /// Sector accounting class of the dropped data
    pub fn sector_kind(&self) -> SectorKind {
        if self.key.is_cached() {
            SectorKind::Cached
        } else {
            SectorKind::Dirty
        }
    }
}

/// In-memory node content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Smallest position this node covers
    pub min_key: Bpos,
    /// Largest position this node covers (inclusive bound)
    pub max_key: Bpos,
    /// Packed key format for serialisation
    pub format: BkeyFormat,
    /// Append-log segments
    pub bsets: Vec<Bset>,
    /// Whether the node has ever been written out
    pub written: bool,
    /// Sibling live-u64 counts, maintained for merge heuristics
    pub sib_u64s: [u32; 2],
}

impl NodeData {
    /// Empty content covering nothing
    pub fn empty() -> NodeData {
        NodeData::with_bounds(Bpos::MIN, Bpos::MAX)
    }

    /// Empty content covering `[min, max]`
    pub fn with_bounds(min: Bpos, max: Bpos) -> NodeData {
        NodeData {
            min_key: min,
            max_key: max,
            format: BkeyFormat::for_range(min, max),
            bsets: vec![Bset::default()],
            written: false,
            sib_u64s: [0; 2],
        }
    }

    /// Reset to empty content (container reuse)
    pub fn reset(&mut self) {
        *self = NodeData::empty();
    }

    /// Total live keys
    pub fn key_count(&self) -> usize {
        self.bsets.iter().map(|s| s.keys.len()).sum()
    }

    /// The smallest key with end position strictly greater than `pos`
    /// (extents semantics: such a key's range may cover `pos`).
    pub fn next_key_after(&self, pos: Bpos) -> Option<BkeyI> {
        let mut best: Option<&BkeyI> = None;
        for set in &self.bsets {
            let idx = set.keys.partition_point(|k| k.k.p <= pos);
            if let Some(k) = set.keys.get(idx) {
                if best.map_or(true, |b| k.k.p < b.k.p) {
                    best = Some(k);
                }
            }
        }
        best.cloned()
    }

    /// First key at or after `pos` by end position (interior-node search)
    pub fn child_for(&self, pos: Bpos) -> Option<BkeyI> {
        let mut best: Option<&BkeyI> = None;
        for set in &self.bsets {
            let idx = set.keys.partition_point(|k| k.k.p < pos);
            if let Some(k) = set.keys.get(idx) {
                if best.map_or(true, |b| k.k.p < b.k.p) {
                    best = Some(k);
                }
            }
        }
        best.cloned()
    }

    /// Whether any data-carrying key overlaps `[start, end)`
    pub fn has_data_in(&self, start: Bpos, end: Bpos) -> bool {
        for set in &self.bsets {
            let mut i = set.keys.partition_point(|k| k.k.p <= start);
            while i < set.keys.len() && set.keys[i].k.start() < end {
                if set.keys[i].is_data() {
                    return true;
                }
                i += 1;
            }
        }
        false
    }

    /// All keys, merged in order
    pub fn merged_keys(&self) -> Vec<BkeyI> {
        let mut all: Vec<BkeyI> = self
            .bsets
            .iter()
            .flat_map(|s| s.keys.iter().cloned())
            .collect();
        all.sort_by(|a, b| a.k.p.cmp(&b.k.p));
        all
    }

    fn trim_value_front(k: &mut BkeyI, sectors: u64) {
        trim_key_front(k, sectors)
    }

    fn trim_back(k: &mut BkeyI, sectors: u64) {
        trim_key_back(k, sectors)
    }

    /// Insert an extent-style key, trimming every overlapping key so the
    /// node stays non-overlapping. Returns the dropped portions for
    /// bucket accounting. The new key must fall within the node bounds.
    pub fn insert_extent(&mut self, new: BkeyI) -> Vec<DroppedRange> {
        let ns = new.k.start();
        let ne = new.k.p;
        let mut dropped = Vec::new();

        let mut splits: Vec<BkeyI> = Vec::new();
        for set in &mut self.bsets {
            let mut i = set.keys.partition_point(|k| k.k.p <= ns);
            while i < set.keys.len() {
                if set.keys[i].k.start() >= ne {
                    break;
                }
                let k = &mut set.keys[i];
                let ks = k.k.start();
                let ke = k.k.p;

                if ns <= ks && ke <= ne {
                    // Fully covered: drop.
                    let old = set.keys.remove(i);
                    if old.is_data() {
                        dropped.push(DroppedRange { key: old });
                    }
                    continue;
                } else if ks < ns && ke <= ne {
                    // Overlap at the back of k: trim it off.
                    let cut = ke.offset - ns.offset;
                    let mut gone = k.clone();
                    Self::trim_value_front(&mut gone, k.k.size - cut);
                    Self::trim_back(k, cut);
                    if gone.is_data() {
                        dropped.push(DroppedRange { key: gone });
                    }
                    i += 1;
                } else if ns <= ks {
                    // Overlap at the front of k: advance its start.
                    let cut = ne.offset - ks.offset;
                    let mut gone = k.clone();
                    Self::trim_back(&mut gone, k.k.size - cut);
                    Self::trim_value_front(k, cut);
                    if gone.is_data() {
                        dropped.push(DroppedRange { key: gone });
                    }
                    i += 1;
                } else {
                    // k covers the new key entirely: split into two.
                    let mut front = k.clone();
                    let mut gone = k.clone();
                    let back = k;

                    let front_size = ns.offset - ks.offset;
                    let back_size = ke.offset - ne.offset;

                    let front_trim = front.k.size - front_size;
                    Self::trim_back(&mut front, front_trim);

                    Self::trim_value_front(&mut gone, front_size);
                    Self::trim_back(&mut gone, back_size);

                    Self::trim_value_front(back, back.k.size - back_size);

                    if gone.is_data() {
                        dropped.push(DroppedRange { key: gone });
                    }
                    splits.push(front);
                    i += 1;
                }
            }
        }

        let last = self.bsets.last_mut().expect("node always has a bset");
        for s in splits {
            let at = last.keys.partition_point(|k| k.k.p < s.k.p);
            last.keys.insert(at, s);
        }
        if new.typ != KeyType::Deleted && new.k.size > 0 {
            let at = last.keys.partition_point(|k| k.k.p < new.k.p);
            last.keys.insert(at, new);
        }
        dropped
    }

    /// Insert a whole-key replacement (non-extent btrees)
    pub fn insert_replace(&mut self, new: BkeyI) {
        for set in &mut self.bsets {
            set.keys.retain(|k| k.k.p != new.k.p);
        }
        let last = self.bsets.last_mut().expect("node always has a bset");
        let at = last.keys.partition_point(|k| k.k.p < new.k.p);
        last.keys.insert(at, new);
    }

    /// Start a new bset (called when the node is written out)
    pub fn push_bset(&mut self) {
        if !self.bsets.last().map_or(true, |s| s.keys.is_empty()) {
            self.bsets.push(Bset::default());
        }
    }

    /// Merge all bsets into one, dropping tombstones, and recompute the
    /// packed format from the live keys.
    pub fn compact(&mut self) {
        let mut all = self.merged_keys();
        all.retain(|k| k.typ != KeyType::Deleted);
        self.format = BkeyFormat::for_range(self.min_key, self.max_key);
        self.bsets = vec![Bset { keys: all }];
    }

    /// Split in half by key count. `self` keeps the lower half; returns
    /// the upper half with adjusted bounds.
    pub fn split(&mut self) -> NodeData {
        self.compact();
        let keys = std::mem::take(&mut self.bsets[0].keys);
        let mid = keys.len() / 2;
        let (lo, hi) = keys.split_at(mid);

        let pivot = lo.last().map_or(self.min_key, |k| k.k.p);
        let mut upper = NodeData::with_bounds(pivot.successor(), self.max_key);
        upper.bsets[0].keys = hi.to_vec();

        self.max_key = pivot;
        self.format = BkeyFormat::for_range(self.min_key, self.max_key);
        self.bsets[0].keys = lo.to_vec();
        upper
    }

    fn encoded_key_size(&self, k: &BkeyI) -> usize {
        let key_words = if self.format.pack(k).is_some() {
            self.format.key_u64s()
        } else {
            5
        };
        2 + (key_words + k.v.to_words().len()) * 8
    }

    /// Serialised size in bytes
    pub fn encoded_size(&self) -> usize {
        HEADER_BYTES
            + self
                .bsets
                .iter()
                .map(|s| 8 + s.keys.iter().map(|k| self.encoded_key_size(k)).sum::<usize>())
                .sum::<usize>()
    }

    /// Whether an insert of `extra` more encoded bytes would overflow a
    /// node of `node_bytes`
    pub fn wants_split(&self, node_bytes: usize) -> bool {
        self.encoded_size() > node_bytes - node_bytes / 4
    }
}

/// Cut `sectors` off the front of a key, keeping the value consistent:
/// compressed payloads advance their crc offset, raw payloads advance the
/// pointers themselves.
pub(crate) fn trim_key_front(k: &mut BkeyI, sectors: u64) {
    if let Some(crc) = &mut k.v.crc {
        crc.offset_sectors += sectors as u32;
    } else {
        for p in &mut k.v.ptrs {
            p.offset += sectors;
        }
    }
    k.k.size -= sectors;
}

/// Cut `sectors` off the back of a key
pub(crate) fn trim_key_back(k: &mut BkeyI, sectors: u64) {
    k.k.p.offset -= sectors;
    k.k.size -= sectors;
}

const NODE_MAGIC: u64 = 0x6361_7363_6e6f_6465; // "cascnode"
const HEADER_BYTES: usize = 104;

/// Serialise node content. Fails if it does not fit `node_bytes`.
pub fn serialize(data: &NodeData, level: u8, btree_id: u8, node_bytes: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; HEADER_BYTES];
    buf[8..16].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    buf[16] = level;
    buf[17] = btree_id;
    buf[18..20].copy_from_slice(&(data.bsets.len() as u16).to_le_bytes());
    buf[24..32].copy_from_slice(&data.min_key.inode.to_le_bytes());
    buf[32..40].copy_from_slice(&data.min_key.offset.to_le_bytes());
    buf[40..48].copy_from_slice(&data.max_key.inode.to_le_bytes());
    buf[48..56].copy_from_slice(&data.max_key.offset.to_le_bytes());
    buf[56..101].copy_from_slice(&data.format.to_bytes());

    for set in &data.bsets {
        buf.extend_from_slice(&(set.keys.len() as u64).to_le_bytes());
        for k in &set.keys {
            let val_words = k.v.to_words();
            match data.format.pack(k) {
                Some(packed) => {
                    buf.push(1);
                    buf.push(val_words.len() as u8);
                    for w in packed {
                        buf.extend_from_slice(&w.to_le_bytes());
                    }
                }
                None => {
                    buf.push(0);
                    buf.push(val_words.len() as u8);
                    for w in [
                        k.k.p.inode,
                        k.k.p.offset,
                        k.k.size,
                        k.k.version as u64,
                        k.typ as u64,
                    ] {
                        buf.extend_from_slice(&w.to_le_bytes());
                    }
                }
            }
            for w in val_words {
                buf.extend_from_slice(&w.to_le_bytes());
            }
        }
    }

    if buf.len() > node_bytes {
        return Err(EngineError::NoSpace("node overflow"));
    }
    let used = buf.len();
    let sectors = used.div_ceil(SECTOR_SIZE) as u16;
    buf[20..22].copy_from_slice(&sectors.to_le_bytes());
    buf.resize(node_bytes, 0);

    let csum = {
        let h = blake3::hash(&buf[8..used]);
        u64::from_le_bytes(h.as_bytes()[..8].try_into().unwrap())
    };
    buf[0..8].copy_from_slice(&csum.to_le_bytes());
    Ok(buf)
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    buf.get(off..off + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| EngineError::Corrupted("truncated node".into()))
}

/// Deserialise node content, verifying the checksum. Returns the content
/// plus the recorded level and btree id.
pub fn deserialize(buf: &[u8]) -> Result<(NodeData, u8, u8)> {
    if buf.len() < HEADER_BYTES {
        return Err(EngineError::Corrupted("short node".into()));
    }
    if read_u64(buf, 8)? != NODE_MAGIC {
        return Err(EngineError::Corrupted("bad node magic".into()));
    }
    let level = buf[16];
    let btree_id = buf[17];
    let nsets = u16::from_le_bytes(buf[18..20].try_into().unwrap()) as usize;
    let sectors = u16::from_le_bytes(buf[20..22].try_into().unwrap()) as usize;
    let used_max = sectors * SECTOR_SIZE;
    if used_max > buf.len() {
        return Err(EngineError::Corrupted("node sector count past buffer".into()));
    }

    let min_key = Bpos::new(read_u64(buf, 24)?, read_u64(buf, 32)?);
    let max_key = Bpos::new(read_u64(buf, 40)?, read_u64(buf, 48)?);
    let format = BkeyFormat::from_bytes(&buf[56..101])?;

    let mut data = NodeData {
        min_key,
        max_key,
        format,
        bsets: Vec::with_capacity(nsets),
        written: true,
        sib_u64s: [0; 2],
    };

    let mut off = HEADER_BYTES;
    for _ in 0..nsets {
        let nkeys = read_u64(buf, off)? as usize;
        off += 8;
        let mut set = Bset::default();
        for _ in 0..nkeys {
            if off + 2 > buf.len() {
                return Err(EngineError::Corrupted("truncated key header".into()));
            }
            let packed = buf[off] == 1;
            let nval = buf[off + 1] as usize;
            off += 2;

            let (k, typ) = if packed {
                let n = data.format.key_u64s();
                let mut words = Vec::with_capacity(n);
                for i in 0..n {
                    words.push(read_u64(buf, off + i * 8)?);
                }
                off += n * 8;
                data.format.unpack(&words)?
            } else {
                let inode = read_u64(buf, off)?;
                let offset = read_u64(buf, off + 8)?;
                let size = read_u64(buf, off + 16)?;
                let version = read_u64(buf, off + 24)? as u32;
                let typ_raw = read_u64(buf, off + 32)?;
                off += 40;
                let typ = match typ_raw {
                    0 => KeyType::Deleted,
                    1 => KeyType::Discard,
                    2 => KeyType::Extent,
                    t => {
                        return Err(EngineError::Corrupted(format!("bad key type {}", t)));
                    }
                };
                (
                    Bkey {
                        p: Bpos::new(inode, offset),
                        size,
                        version,
                    },
                    typ,
                )
            };

            let mut words = Vec::with_capacity(nval);
            for i in 0..nval {
                words.push(read_u64(buf, off + i * 8)?);
            }
            off += nval * 8;

            set.keys.push(BkeyI {
                k,
                typ,
                v: ExtentValue::from_words(&words)?,
            });
        }
        data.bsets.push(set);
    }

    let expect = {
        let h = blake3::hash(&buf[8..off.max(HEADER_BYTES)]);
        u64::from_le_bytes(h.as_bytes()[..8].try_into().unwrap())
    };
    if expect != read_u64(buf, 0)? {
        return Err(EngineError::Corrupted("node checksum mismatch".into()));
    }
    if data.bsets.is_empty() {
        data.bsets.push(Bset::default());
    }
    Ok((data, level, btree_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::{ExtentCrc, ExtentPtr};

    fn data_key(inode: u64, end: u64, size: u64, dev: u8) -> BkeyI {
        BkeyI::extent(
            Bkey::extent(inode, end, size),
            ExtentValue {
                crc: None,
                ptrs: vec![ExtentPtr { dev, offset: end * 10, gen: 0, cached: false }],
            },
        )
    }

    #[test]
    fn insert_into_empty() {
        let mut d = NodeData::empty();
        let dropped = d.insert_extent(data_key(1, 100, 50, 0));
        assert!(dropped.is_empty());
        assert_eq!(d.key_count(), 1);
        let k = d.next_key_after(Bpos::new(1, 60)).unwrap();
        assert_eq!(k.k.p.offset, 100);
        assert!(d.next_key_after(Bpos::new(1, 100)).is_none());
    }

    #[test]
    fn overwrite_full_cover_drops_old() {
        let mut d = NodeData::empty();
        d.insert_extent(data_key(1, 100, 50, 0));
        let dropped = d.insert_extent(data_key(1, 110, 70, 1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].key.k.size, 50);
        assert_eq!(d.key_count(), 1);
    }

    #[test]
    fn overwrite_back_overlap_trims() {
        let mut d = NodeData::empty();
        // old covers [50, 100)
        d.insert_extent(data_key(1, 100, 50, 0));
        // new covers [80, 120): old loses [80, 100)
        let dropped = d.insert_extent(data_key(1, 120, 40, 1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].key.k.size, 20);
        assert_eq!(dropped[0].key.k.p.offset, 100);

        let keys = d.merged_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].k.p.offset, 80);
        assert_eq!(keys[0].k.size, 30);
        assert_eq!(keys[1].k.p.offset, 120);
    }

    #[test]
    fn overwrite_front_overlap_advances_ptr() {
        let mut d = NodeData::empty();
        // old covers [50, 100), payload at device offset 1000
        let mut old = data_key(1, 100, 50, 0);
        old.v.ptrs[0].offset = 1000;
        d.insert_extent(old);
        // new covers [30, 70): old loses [50, 70)
        let dropped = d.insert_extent(data_key(1, 70, 40, 1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].key.k.size, 20);

        let keys = d.merged_keys();
        let survivor = keys.iter().find(|k| k.v.ptrs[0].dev == 0).unwrap();
        assert_eq!(survivor.k.start().offset, 70);
        assert_eq!(survivor.k.size, 30);
        // Uncompressed data pointer advanced past the trimmed sectors.
        assert_eq!(survivor.v.ptrs[0].offset, 1020);
    }

    #[test]
    fn overwrite_middle_splits() {
        let mut d = NodeData::empty();
        d.insert_extent(data_key(1, 200, 100, 0));
        // new covers [140, 160) inside [100, 200)
        let dropped = d.insert_extent(data_key(1, 160, 20, 1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].key.k.size, 20);

        let keys = d.merged_keys();
        assert_eq!(keys.len(), 3);
        assert_eq!((keys[0].k.start().offset, keys[0].k.p.offset), (100, 140));
        assert_eq!((keys[1].k.start().offset, keys[1].k.p.offset), (140, 160));
        assert_eq!((keys[2].k.start().offset, keys[2].k.p.offset), (160, 200));
    }

    #[test]
    fn compressed_extent_trims_via_crc_offset() {
        let mut d = NodeData::empty();
        let mut old = data_key(1, 100, 50, 0);
        old.v.crc = Some(ExtentCrc {
            compressed_sectors: 20,
            uncompressed_sectors: 50,
            offset_sectors: 0,
            ..ExtentCrc::default()
        });
        d.insert_extent(old);
        // trim the front 10 sectors
        d.insert_extent(data_key(1, 60, 10, 1));
        let keys = d.merged_keys();
        let survivor = keys.iter().find(|k| k.v.crc.is_some()).unwrap();
        assert_eq!(survivor.k.start().offset, 60);
        assert_eq!(survivor.v.crc.unwrap().offset_sectors, 10);
        // Pointer itself untouched for compressed payloads.
        assert_eq!(survivor.v.ptrs[0].offset, 100 * 10);
    }

    #[test]
    fn split_produces_disjoint_halves() {
        let mut d = NodeData::empty();
        for i in 1..=10u64 {
            d.insert_extent(data_key(1, i * 10, 10, 0));
        }
        let upper = d.split();
        assert!(d.max_key < upper.min_key);
        assert_eq!(d.key_count() + upper.key_count(), 10);
        for k in d.merged_keys() {
            assert!(k.k.p <= d.max_key);
        }
        for k in upper.merged_keys() {
            assert!(k.k.p >= upper.min_key);
        }
    }

    #[test]
    fn serialize_roundtrip() {
        let mut d = NodeData::with_bounds(Bpos::MIN, Bpos::MAX);
        for i in 1..=20u64 {
            let mut k = data_key(3, i * 8, 8, 0);
            k.v.crc = (i % 2 == 0).then(|| ExtentCrc {
                compressed_sectors: 4,
                uncompressed_sectors: 8,
                offset_sectors: 0,
                csum: i,
                ..ExtentCrc::default()
            });
            d.insert_extent(k);
        }
        d.push_bset();
        d.insert_extent(data_key(3, 500, 4, 1));

        let bytes = serialize(&d, 0, 0, 16384).unwrap();
        assert_eq!(bytes.len(), 16384);
        let (back, level, id) = deserialize(&bytes).unwrap();
        assert_eq!(level, 0);
        assert_eq!(id, 0);
        assert_eq!(back.merged_keys(), d.merged_keys());
        assert_eq!(back.min_key, d.min_key);
        assert_eq!(back.max_key, d.max_key);
    }

    #[test]
    fn corruption_detected() {
        let mut d = NodeData::empty();
        d.insert_extent(data_key(1, 100, 50, 0));
        let mut bytes = serialize(&d, 0, 0, 8192).unwrap();
        bytes[HEADER_BYTES + 12] ^= 0x5a;
        assert!(matches!(
            deserialize(&bytes),
            Err(EngineError::Corrupted(_))
        ));
    }

    #[test]
    fn overflow_rejected() {
        let mut d = NodeData::empty();
        for i in 1..=2000u64 {
            d.insert_extent(data_key(1, i * 10, 8, 0));
        }
        assert!(matches!(
            serialize(&d, 0, 0, 4096),
            Err(EngineError::NoSpace(_))
        ));
        assert!(d.wants_split(4096));
    }
}
