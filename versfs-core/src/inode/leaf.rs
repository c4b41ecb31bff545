//! The inode table leaf format: `inum -> InodeRecord`, an exact-match
//! index rather than the extent leaf's run-covering one.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use crate::btree::{LeafFull, LeafOps};
use crate::device::BlockT;
use crate::leaf::{self, FixedValue};

const MAGIC: u32 = 0x696e_6f30; // "ino0"

pub type InodeId = u64;

bitflags! {
    /// Bits stored alongside an inode's size/mode. `WELL_KNOWN` marks the
    /// handful of reserved inums (bitmap, version table, atom table, root
    /// directory) the mount bootstraps at format time rather than through
    /// the ordinary `create_inode` path.
    pub struct InodeFlags: u32 {
        const WELL_KNOWN = 0b0000_0001;
    }
}

/// An inode's persistent state: byte size, a permissions/type word, and
/// the root/depth of its extent tree. Timestamps, link count, and the
/// xattr cache are outside this layer's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRecord {
    pub size: u64,
    pub mode: u32,
    pub flags: InodeFlags,
    pub root: BlockT,
    pub depth: u32,
}

impl InodeRecord {
    pub fn well_known(mode: u32) -> Self {
        InodeRecord { size: 0, mode, flags: InodeFlags::WELL_KNOWN, root: crate::device::BLOCK_NONE, depth: 0 }
    }
}

impl FixedValue for InodeRecord {
    const LEN: usize = 28;

    fn encode(&self, out: &mut [u8]) {
        BigEndian::write_u64(&mut out[0..8], self.size);
        BigEndian::write_u32(&mut out[8..12], self.mode);
        BigEndian::write_u32(&mut out[12..16], self.flags.bits());
        BigEndian::write_i64(&mut out[16..24], self.root);
        BigEndian::write_u32(&mut out[24..28], self.depth);
    }

    fn decode(bytes: &[u8]) -> Self {
        InodeRecord {
            size: BigEndian::read_u64(&bytes[0..8]),
            mode: BigEndian::read_u32(&bytes[8..12]),
            flags: InodeFlags::from_bits_truncate(BigEndian::read_u32(&bytes[12..16])),
            root: BigEndian::read_i64(&bytes[16..24]),
            depth: BigEndian::read_u32(&bytes[24..28]),
        }
    }
}

pub struct InodeLeafOps;

impl LeafOps for InodeLeafOps {
    type Value = InodeRecord;

    fn sniff(leaf: &[u8]) -> bool {
        leaf::sniff(leaf, MAGIC)
    }

    fn init(leaf: &mut [u8]) {
        leaf::init(leaf, MAGIC)
    }

    fn split(src: &mut [u8], dst: &mut [u8], _fudge: Option<(u64, usize)>) -> u64 {
        let mut entries = leaf::decode_all::<InodeRecord>(src);
        let mid = entries.len() / 2;
        let upper = entries.split_off(mid);
        let pivot = upper.first().map(|(k, _)| *k).unwrap_or(0);
        leaf::encode_all(src, MAGIC, &entries).expect("shrinking always fits");
        leaf::encode_all(dst, MAGIC, &upper).expect("half of src always fits dst of equal size");
        pivot
    }

    fn expand(leaf: &mut [u8], key: u64, value: &InodeRecord) -> Result<(), LeafFull> {
        let mut entries = leaf::decode_all::<InodeRecord>(leaf);
        match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) => entries[i].1 = *value,
            Err(i) => entries.insert(i, (key, *value)),
        }
        leaf::encode_all(leaf, MAGIC, &entries)
    }

    fn lookup(leaf: &[u8], key: u64) -> Option<(InodeRecord, u32)> {
        let entries = leaf::decode_all::<InodeRecord>(leaf);
        entries
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|i| (entries[i].1, 1))
    }

    fn chop(leaf: &mut [u8], from: u64, to: u64) -> bool {
        let entries = leaf::decode_all::<InodeRecord>(leaf);
        let kept: Vec<_> = entries.into_iter().filter(|(k, _)| *k < from || *k >= to).collect();
        let empty = kept.is_empty();
        leaf::encode_all(leaf, MAGIC, &kept).expect("chop never grows a leaf");
        empty
    }

    fn first_key(leaf: &[u8]) -> Option<u64> {
        leaf::first_key(leaf)
    }

    fn used(leaf: &[u8]) -> usize {
        leaf::used_bytes::<InodeRecord>(leaf)
    }

    fn free(leaf: &[u8]) -> usize {
        leaf::free_bytes::<InodeRecord>(leaf)
    }

    fn merge(dst: &mut [u8], src: &[u8]) {
        let mut entries = leaf::decode_all::<InodeRecord>(dst);
        entries.extend(leaf::decode_all::<InodeRecord>(src));
        entries.sort_by_key(|(k, _)| *k);
        leaf::encode_all(dst, MAGIC, &entries).expect("caller checked used(src) <= free(dst)");
    }

    fn entry_size(_value: &InodeRecord) -> usize {
        8 + InodeRecord::LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(block_size: usize) -> Vec<u8> {
        let mut b = vec![0u8; block_size];
        InodeLeafOps::init(&mut b);
        b
    }

    #[test]
    fn expand_then_lookup_exact() {
        let mut l = leaf(256);
        let rec = InodeRecord { size: 42, mode: 0o644, flags: InodeFlags::empty(), root: 7, depth: 0 };
        InodeLeafOps::expand(&mut l, 3, &rec).unwrap();
        assert_eq!(InodeLeafOps::lookup(&l, 3), Some((rec, 1)));
        assert_eq!(InodeLeafOps::lookup(&l, 4), None);
    }

    #[test]
    fn chop_removes_single_inum() {
        let mut l = leaf(256);
        let rec = InodeRecord { size: 1, mode: 0o644, flags: InodeFlags::empty(), root: 0, depth: 0 };
        InodeLeafOps::expand(&mut l, 5, &rec).unwrap();
        InodeLeafOps::expand(&mut l, 6, &rec).unwrap();
        let empty = InodeLeafOps::chop(&mut l, 5, 6);
        assert!(!empty);
        assert!(InodeLeafOps::lookup(&l, 5).is_none());
        assert!(InodeLeafOps::lookup(&l, 6).is_some());
    }
}
