//! B-tree key model.
//!
//! Keys are `(inode, end-offset)` positions with a size field; extent values
//! are lists of device pointer tuples plus optional checksum/compression
//! metadata. On disk, keys are packed via a per-node [`BkeyFormat`]
//! (bits-per-field for up to five fields); values are arrays of 8-byte
//! tagged words.

use crate::core::{EngineError, Result, REPLICAS_MAX};

/// A position in a btree: the key space is ordered by inode, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bpos {
    /// Logical device / file identifier
    pub inode: u64,
    /// Offset in sectors
    pub offset: u64,
}

impl Bpos {
    /// Smallest position
    pub const MIN: Bpos = Bpos { inode: 0, offset: 0 };

    /// Largest position
    pub const MAX: Bpos = Bpos {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    /// Construct a position
    pub fn new(inode: u64, offset: u64) -> Bpos {
        Bpos { inode, offset }
    }

    /// The next position in key order
    pub fn successor(self) -> Bpos {
        if self.offset < u64::MAX {
            Bpos {
                inode: self.inode,
                offset: self.offset + 1,
            }
        } else {
            Bpos {
                inode: self.inode + 1,
                offset: 0,
            }
        }
    }
}

/// Key type tag, stored alongside the packed fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// Tombstone, dropped on compaction
    Deleted = 0,
    /// Hole placeholder reserving a range (no data)
    Discard = 1,
    /// Extent carrying device pointers
    Extent = 2,
}

impl KeyType {
    fn from_u8(v: u8) -> Result<KeyType> {
        match v {
            0 => Ok(KeyType::Deleted),
            1 => Ok(KeyType::Discard),
            2 => Ok(KeyType::Extent),
            _ => Err(EngineError::Corrupted(format!("bad key type {}", v))),
        }
    }
}

/// Key header: position is the *end* of the covered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bkey {
    /// End position of the covered range
    pub p: Bpos,
    /// Length of the covered range in sectors
    pub size: u64,
    /// Insert version, bumped by overwrites
    pub version: u32,
}

impl Bkey {
    /// An extent-style key covering `[end - size, end)` on `inode`
    pub fn extent(inode: u64, end_offset: u64, size: u64) -> Bkey {
        debug_assert!(size <= end_offset);
        Bkey {
            p: Bpos::new(inode, end_offset),
            size,
            version: 0,
        }
    }

    /// Start of the covered range
    pub fn start(&self) -> Bpos {
        Bpos {
            inode: self.p.inode,
            offset: self.p.offset - self.size,
        }
    }

    /// Whether `[start, end)` intersects `[other_start, other_end)` on the
    /// same inode
    pub fn overlaps(&self, start: Bpos, end: Bpos) -> bool {
        self.p.inode == start.inode && self.start().offset < end.offset && self.p.offset > start.offset
    }
}

/// One replica pointer in an extent value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentPtr {
    /// Member device index
    pub dev: u8,
    /// Sector offset on the device
    pub offset: u64,
    /// Bucket generation this pointer was written with
    pub gen: u8,
    /// Clean cached copy (reclaimable) rather than dirty/primary data
    pub cached: bool,
}

const WORD_TAG_PTR: u64 = 0b01;
const WORD_TAG_CRC: u64 = 0b10;
const PTR_OFFSET_MAX: u64 = (1 << 44) - 1;

impl ExtentPtr {
    /// Encode as one tagged 8-byte word
    pub fn to_word(&self) -> u64 {
        debug_assert!(self.offset <= PTR_OFFSET_MAX);
        WORD_TAG_PTR
            | (self.cached as u64) << 2
            | (self.dev as u64) << 3
            | (self.gen as u64) << 11
            | self.offset << 19
    }

    /// Decode from a tagged word; the tag must already have been checked
    pub fn from_word(w: u64) -> ExtentPtr {
        ExtentPtr {
            cached: (w >> 2) & 1 != 0,
            dev: (w >> 3) as u8,
            gen: (w >> 11) as u8,
            offset: w >> 19,
        }
    }
}

/// Checksum algorithm for extent data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChecksumType {
    /// No checksum
    None = 0,
    /// blake3 truncated to 64 bits
    #[default]
    Blake3_64 = 1,
}

/// Compression applied to extent data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Stored raw
    #[default]
    None = 0,
    /// lz4 block compression
    Lz4 = 1,
}

/// Checksum / compression metadata carried by an extent.
///
/// The stored payload always spans `uncompressed_sectors` logically; when
/// the key has been trimmed at the front, `offset_sectors` records where
/// the key's range begins inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentCrc {
    /// Sectors occupied on device (after compression)
    pub compressed_sectors: u32,
    /// Sectors covered logically (before compression)
    pub uncompressed_sectors: u32,
    /// Offset of the key's start within the uncompressed payload
    pub offset_sectors: u32,
    /// Checksum algorithm
    pub csum_type: ChecksumType,
    /// Compression algorithm
    pub compression_type: CompressionType,
    /// Checksum over the stored (possibly compressed) payload
    pub csum: u64,
}

impl ExtentCrc {
    fn to_words(&self) -> [u64; 2] {
        let meta = WORD_TAG_CRC
            | (self.csum_type as u64) << 2
            | (self.compression_type as u64) << 6
            | (self.compressed_sectors as u64) << 10
            | (self.uncompressed_sectors as u64) << 28
            | (self.offset_sectors as u64) << 46;
        [meta, self.csum]
    }

    fn from_words(meta: u64, csum: u64) -> Result<ExtentCrc> {
        let csum_type = match (meta >> 2) & 0xf {
            0 => ChecksumType::None,
            1 => ChecksumType::Blake3_64,
            t => return Err(EngineError::Corrupted(format!("bad csum type {}", t))),
        };
        let compression_type = match (meta >> 6) & 0xf {
            0 => CompressionType::None,
            1 => CompressionType::Lz4,
            t => return Err(EngineError::Corrupted(format!("bad compression type {}", t))),
        };
        Ok(ExtentCrc {
            compressed_sectors: ((meta >> 10) & 0x3ffff) as u32,
            uncompressed_sectors: ((meta >> 28) & 0x3ffff) as u32,
            offset_sectors: (meta >> 46) as u32,
            csum_type,
            compression_type,
            csum,
        })
    }
}

/// Extent value: optional crc metadata plus up to [`REPLICAS_MAX`] pointers.
///
/// All pointers cover the same logical byte range; pointers in different
/// tiers are permitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtentValue {
    /// Checksum/compression metadata, if any
    pub crc: Option<ExtentCrc>,
    /// Replica pointers
    pub ptrs: Vec<ExtentPtr>,
}

impl ExtentValue {
    /// Encode as an array of tagged 8-byte words
    pub fn to_words(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(2 + self.ptrs.len());
        if let Some(crc) = &self.crc {
            out.extend_from_slice(&crc.to_words());
        }
        for p in &self.ptrs {
            out.push(p.to_word());
        }
        out
    }

    /// Decode from tagged words
    pub fn from_words(words: &[u64]) -> Result<ExtentValue> {
        let mut v = ExtentValue::default();
        let mut i = 0;
        while i < words.len() {
            match words[i] & 0b11 {
                WORD_TAG_PTR => {
                    if v.ptrs.len() == REPLICAS_MAX {
                        return Err(EngineError::Corrupted("too many extent pointers".into()));
                    }
                    v.ptrs.push(ExtentPtr::from_word(words[i]));
                    i += 1;
                }
                WORD_TAG_CRC => {
                    if i + 1 >= words.len() {
                        return Err(EngineError::Corrupted("truncated crc entry".into()));
                    }
                    v.crc = Some(ExtentCrc::from_words(words[i], words[i + 1])?);
                    i += 2;
                }
                t => return Err(EngineError::Corrupted(format!("bad value word tag {}", t))),
            }
        }
        Ok(v)
    }
}

/// A complete key: header, type, and value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BkeyI {
    /// Key header
    pub k: Bkey,
    /// Key type tag
    pub typ: KeyType,
    /// Extent value; empty for `Deleted`/`Discard`
    pub v: ExtentValue,
}

impl BkeyI {
    /// A tombstone at `k`
    pub fn deleted(k: Bkey) -> BkeyI {
        BkeyI {
            k,
            typ: KeyType::Deleted,
            v: ExtentValue::default(),
        }
    }

    /// A hole placeholder at `k`
    pub fn discard(k: Bkey) -> BkeyI {
        BkeyI {
            k,
            typ: KeyType::Discard,
            v: ExtentValue::default(),
        }
    }

    /// An extent key carrying `v`
    pub fn extent(k: Bkey, v: ExtentValue) -> BkeyI {
        BkeyI {
            k,
            typ: KeyType::Extent,
            v,
        }
    }

    /// Whether this key carries data pointers
    pub fn is_data(&self) -> bool {
        self.typ == KeyType::Extent
    }

    /// Whether every pointer is a clean cached copy
    pub fn is_cached(&self) -> bool {
        self.typ == KeyType::Extent && !self.v.ptrs.is_empty() && self.v.ptrs.iter().all(|p| p.cached)
    }
}

/* Packed key format */

/// Number of packable key fields
pub const KEY_FIELDS: usize = 5;

const FIELD_INODE: usize = 0;
const FIELD_OFFSET: usize = 1;
const FIELD_SIZE: usize = 2;
const FIELD_VERSION: usize = 3;
const FIELD_TYPE: usize = 4;

/// Per-node packed key format: a bit width and base offset per field.
///
/// Keys whose fields fit `(value - field_offset) < 2^bits` pack into a
/// dense little-endian bitstream; keys that don't fit are stored raw with
/// a header flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BkeyFormat {
    /// Bit width per field
    pub bits_per_field: [u8; KEY_FIELDS],
    /// Base value subtracted before packing
    pub field_offset: [u64; KEY_FIELDS],
}

impl Default for BkeyFormat {
    fn default() -> Self {
        BkeyFormat {
            bits_per_field: [64, 64, 32, 32, 8],
            field_offset: [0; KEY_FIELDS],
        }
    }
}

fn bits_for(v: u64) -> u8 {
    (64 - v.leading_zeros()) as u8
}

impl BkeyFormat {
    /// Compute a format covering keys within `[min, max]` positions
    pub fn for_range(min: Bpos, max: Bpos) -> BkeyFormat {
        let mut f = BkeyFormat::default();
        f.field_offset[FIELD_INODE] = min.inode;
        f.bits_per_field[FIELD_INODE] = bits_for(max.inode.saturating_sub(min.inode));
        f.field_offset[FIELD_OFFSET] = 0;
        f.bits_per_field[FIELD_OFFSET] = bits_for(max.offset);
        f.bits_per_field[FIELD_SIZE] = 32;
        f.bits_per_field[FIELD_VERSION] = 32;
        f.bits_per_field[FIELD_TYPE] = 8;
        f
    }

    /// Total packed key bits
    pub fn key_bits(&self) -> usize {
        self.bits_per_field.iter().map(|&b| b as usize).sum()
    }

    /// Packed key size in u64 words
    pub fn key_u64s(&self) -> usize {
        self.key_bits().div_ceil(64)
    }

    fn fields_of(k: &BkeyI) -> [u64; KEY_FIELDS] {
        [
            k.k.p.inode,
            k.k.p.offset,
            k.k.size,
            k.k.version as u64,
            k.typ as u64,
        ]
    }

    /// Pack the key header fields; `None` if any field does not fit
    pub fn pack(&self, k: &BkeyI) -> Option<Vec<u64>> {
        let fields = Self::fields_of(k);
        let mut words = vec![0u64; self.key_u64s()];
        let mut bit = 0usize;
        for i in 0..KEY_FIELDS {
            let bits = self.bits_per_field[i] as usize;
            let v = fields[i].checked_sub(self.field_offset[i])?;
            if bits < 64 && v >> bits != 0 {
                return None;
            }
            put_bits(&mut words, bit, bits, v);
            bit += bits;
        }
        Some(words)
    }

    /// Unpack key header fields packed by [`pack`](Self::pack)
    pub fn unpack(&self, words: &[u64]) -> Result<(Bkey, KeyType)> {
        let mut fields = [0u64; KEY_FIELDS];
        let mut bit = 0usize;
        for i in 0..KEY_FIELDS {
            let bits = self.bits_per_field[i] as usize;
            fields[i] = get_bits(words, bit, bits).wrapping_add(self.field_offset[i]);
            bit += bits;
        }
        let typ = KeyType::from_u8(fields[FIELD_TYPE] as u8)?;
        Ok((
            Bkey {
                p: Bpos::new(fields[FIELD_INODE], fields[FIELD_OFFSET]),
                size: fields[FIELD_SIZE],
                version: fields[FIELD_VERSION] as u32,
            },
            typ,
        ))
    }

    /// Encode the format itself for the on-disk node header
    pub fn to_bytes(&self) -> [u8; KEY_FIELDS * 9] {
        let mut out = [0u8; KEY_FIELDS * 9];
        for i in 0..KEY_FIELDS {
            out[i] = self.bits_per_field[i];
            out[KEY_FIELDS + i * 8..KEY_FIELDS + (i + 1) * 8]
                .copy_from_slice(&self.field_offset[i].to_le_bytes());
        }
        out
    }

    /// Decode a format from the on-disk node header
    pub fn from_bytes(b: &[u8]) -> Result<BkeyFormat> {
        if b.len() < KEY_FIELDS * 9 {
            return Err(EngineError::Corrupted("short bkey format".into()));
        }
        let mut f = BkeyFormat::default();
        for i in 0..KEY_FIELDS {
            f.bits_per_field[i] = b[i];
            if f.bits_per_field[i] > 64 {
                return Err(EngineError::Corrupted("bkey format field too wide".into()));
            }
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[KEY_FIELDS + i * 8..KEY_FIELDS + (i + 1) * 8]);
            f.field_offset[i] = u64::from_le_bytes(w);
        }
        Ok(f)
    }
}

fn put_bits(words: &mut [u64], bit: usize, nbits: usize, v: u64) {
    if nbits == 0 {
        return;
    }
    let word = bit / 64;
    let shift = bit % 64;
    words[word] |= v << shift;
    if shift + nbits > 64 {
        words[word + 1] |= v >> (64 - shift);
    }
}

fn get_bits(words: &[u64], bit: usize, nbits: usize) -> u64 {
    if nbits == 0 {
        return 0;
    }
    let word = bit / 64;
    let shift = bit % 64;
    let mut v = words[word] >> shift;
    if shift + nbits > 64 {
        v |= words[word + 1] << (64 - shift);
    }
    if nbits < 64 {
        v &= (1u64 << nbits) - 1;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn position_ordering() {
        assert!(Bpos::new(1, 100) < Bpos::new(2, 0));
        assert!(Bpos::new(1, 100) < Bpos::new(1, 101));
        assert_eq!(Bpos::new(1, u64::MAX).successor(), Bpos::new(2, 0));
    }

    #[test]
    fn extent_key_range() {
        let k = Bkey::extent(7, 128, 64);
        assert_eq!(k.start(), Bpos::new(7, 64));
        assert!(k.overlaps(Bpos::new(7, 0), Bpos::new(7, 65)));
        assert!(!k.overlaps(Bpos::new(7, 0), Bpos::new(7, 64)));
        assert!(!k.overlaps(Bpos::new(8, 0), Bpos::new(8, 200)));
    }

    #[test]
    fn ptr_word_roundtrip() {
        let p = ExtentPtr {
            dev: 3,
            offset: 0x1234_5678,
            gen: 250,
            cached: true,
        };
        let w = p.to_word();
        assert_eq!(w & 0b11, WORD_TAG_PTR);
        assert_eq!(ExtentPtr::from_word(w), p);
    }

    #[test]
    fn value_words_roundtrip() {
        let v = ExtentValue {
            crc: Some(ExtentCrc {
                compressed_sectors: 100,
                uncompressed_sectors: 128,
                offset_sectors: 16,
                csum_type: ChecksumType::Blake3_64,
                compression_type: CompressionType::Lz4,
                csum: 0xdead_beef_cafe_f00d,
            }),
            ptrs: vec![
                ExtentPtr { dev: 0, offset: 4096, gen: 1, cached: false },
                ExtentPtr { dev: 1, offset: 8192, gen: 9, cached: true },
            ],
        };
        let words = v.to_words();
        assert_eq!(words.len(), 4);
        assert_eq!(ExtentValue::from_words(&words).unwrap(), v);
    }

    #[test]
    fn format_rejects_out_of_range() {
        let f = BkeyFormat::for_range(Bpos::new(10, 0), Bpos::new(20, 1 << 20));
        let inside = BkeyI::discard(Bkey::extent(15, 4096, 8));
        assert!(f.pack(&inside).is_some());
        let below_base = BkeyI::discard(Bkey::extent(5, 4096, 8));
        assert!(f.pack(&below_base).is_none());
    }

    proptest! {
        #[test]
        fn pack_unpack_identity(
            inode in 0u64..1000,
            end in 1u64..(1 << 30),
            size_raw in 0u64..(1 << 20),
            version in 0u32..u32::MAX,
            typ in 0u8..3,
        ) {
            let size = size_raw.min(end);
            let f = BkeyFormat::for_range(Bpos::new(0, 0), Bpos::new(1000, 1 << 30));
            let mut k = BkeyI::discard(Bkey::extent(inode, end, size));
            k.k.version = version;
            k.typ = KeyType::from_u8(typ).unwrap();
            let packed = f.pack(&k).unwrap();
            prop_assert_eq!(packed.len(), f.key_u64s());
            let (uk, ut) = f.unpack(&packed).unwrap();
            prop_assert_eq!(uk, k.k);
            prop_assert_eq!(ut, k.typ);
        }

        #[test]
        fn value_encode_identity(nptrs in 1usize..4, with_crc: bool) {
            let v = ExtentValue {
                crc: with_crc.then(|| ExtentCrc {
                    compressed_sectors: 12,
                    uncompressed_sectors: 16,
                    offset_sectors: 0,
                    csum_type: ChecksumType::Blake3_64,
                    compression_type: CompressionType::None,
                    csum: 42,
                }),
                ptrs: (0..nptrs).map(|i| ExtentPtr {
                    dev: i as u8,
                    offset: (i as u64 + 1) * 1024,
                    gen: i as u8,
                    cached: i % 2 == 0,
                }).collect(),
            };
            prop_assert_eq!(ExtentValue::from_words(&v.to_words()).unwrap(), v);
        }
    }
}
