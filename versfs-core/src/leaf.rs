//! Shared scaffolding for the two concrete leaf formats (extent and
//! inode-table leaves). Both are sorted arrays of fixed-width
//! records; this module owns the codec and capacity arithmetic so each
//! leaf operator only has to say what a record *means*.
//!
//! Leaves are small (one block), so every operation here works by
//! decoding the whole leaf into a `Vec`, transforming it, and
//! re-encoding — simpler to get right than in-place shifting, and cheap
//! enough at this size.

use byteorder::{BigEndian, ByteOrder};

use crate::btree::LeafFull;

/// A value that packs into a fixed number of bytes, independent of any
/// other record in the leaf.
pub trait FixedValue: Clone {
    const LEN: usize;
    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

const HEADER_LEN: usize = 8; // magic(4) + count(4)
const KEY_LEN: usize = 8;

fn entry_len<V: FixedValue>() -> usize {
    KEY_LEN + V::LEN
}

pub fn capacity<V: FixedValue>(leaf_len: usize) -> usize {
    (leaf_len - HEADER_LEN) / entry_len::<V>()
}

pub fn sniff(leaf: &[u8], magic: u32) -> bool {
    leaf.len() >= HEADER_LEN && BigEndian::read_u32(&leaf[0..4]) == magic
}

pub fn init(leaf: &mut [u8], magic: u32) {
    for b in leaf.iter_mut() {
        *b = 0;
    }
    BigEndian::write_u32(&mut leaf[0..4], magic);
    BigEndian::write_u32(&mut leaf[4..8], 0);
}

pub fn count(leaf: &[u8]) -> usize {
    BigEndian::read_u32(&leaf[4..8]) as usize
}

/// The key of the first stored entry, without decoding the rest of the
/// leaf.
pub fn first_key(leaf: &[u8]) -> Option<u64> {
    if count(leaf) == 0 {
        return None;
    }
    Some(BigEndian::read_u64(&leaf[HEADER_LEN..HEADER_LEN + KEY_LEN]))
}

pub fn decode_all<V: FixedValue>(leaf: &[u8]) -> Vec<(u64, V)> {
    let n = count(leaf);
    let elen = entry_len::<V>();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let off = HEADER_LEN + i * elen;
        let key = BigEndian::read_u64(&leaf[off..off + KEY_LEN]);
        let value = V::decode(&leaf[off + KEY_LEN..off + elen]);
        out.push((key, value));
    }
    out
}

/// Replace the leaf's contents with `entries` (already in the order the
/// caller wants stored — callers are expected to keep them key-sorted).
/// `Err(LeafFull)` leaves the leaf unchanged.
pub fn encode_all<V: FixedValue>(leaf: &mut [u8], magic: u32, entries: &[(u64, V)]) -> Result<(), LeafFull> {
    if entries.len() > capacity::<V>(leaf.len()) {
        return Err(LeafFull);
    }
    let elen = entry_len::<V>();
    for b in leaf.iter_mut() {
        *b = 0;
    }
    BigEndian::write_u32(&mut leaf[0..4], magic);
    BigEndian::write_u32(&mut leaf[4..8], entries.len() as u32);
    for (i, (key, value)) in entries.iter().enumerate() {
        let off = HEADER_LEN + i * elen;
        BigEndian::write_u64(&mut leaf[off..off + KEY_LEN], *key);
        value.encode(&mut leaf[off + KEY_LEN..off + elen]);
    }
    Ok(())
}

pub fn used_bytes<V: FixedValue>(leaf: &[u8]) -> usize {
    HEADER_LEN + count(leaf) * entry_len::<V>()
}

pub fn free_bytes<V: FixedValue>(leaf: &[u8]) -> usize {
    leaf.len() - used_bytes::<V>(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct U32Val(u32);

    impl FixedValue for U32Val {
        const LEN: usize = 4;
        fn encode(&self, out: &mut [u8]) {
            BigEndian::write_u32(out, self.0);
        }
        fn decode(bytes: &[u8]) -> Self {
            U32Val(BigEndian::read_u32(bytes))
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut leaf = vec![0u8; 64];
        init(&mut leaf, 0xABCD);
        assert!(sniff(&leaf, 0xABCD));
        let entries = vec![(1u64, U32Val(10)), (2u64, U32Val(20))];
        encode_all(&mut leaf, 0xABCD, &entries).unwrap();
        assert_eq!(decode_all::<U32Val>(&leaf), entries);
    }

    #[test]
    fn encode_rejects_overflow() {
        let mut leaf = vec![0u8; HEADER_LEN + entry_len::<U32Val>()];
        let entries = vec![(1u64, U32Val(1)), (2u64, U32Val(2))];
        assert!(encode_all(&mut leaf, 1, &entries).is_err());
    }
}
