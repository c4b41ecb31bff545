//! The extent leaf format: `logical block -> (physical block, run length)`.

use byteorder::{BigEndian, ByteOrder};

use crate::btree::{LeafFull, LeafOps};
use crate::device::BlockT;
use crate::leaf::{self, FixedValue};

const MAGIC: u32 = 0x6578_7400; // "ext\0"

/// A run of `count` physically contiguous blocks starting at `physical`,
/// backing `count` logically contiguous blocks starting at the leaf key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub physical: BlockT,
    pub count: u32,
}

impl FixedValue for Extent {
    const LEN: usize = 12;

    fn encode(&self, out: &mut [u8]) {
        BigEndian::write_i64(&mut out[0..8], self.physical);
        BigEndian::write_u32(&mut out[8..12], self.count);
    }

    fn decode(bytes: &[u8]) -> Self {
        Extent {
            physical: BigEndian::read_i64(&bytes[0..8]),
            count: BigEndian::read_u32(&bytes[8..12]),
        }
    }
}

/// Fold any pair of entries that are both logically and physically
/// back-to-back into one, so a run built up by repeated single-extent
/// `expand` calls (the write planner's gap-fill loop, or a plain
/// block-at-a-time writer) ends up stored as one entry rather than many.
fn coalesce_adjacent(entries: &mut Vec<(u64, Extent)>) {
    let mut i = 0;
    while i + 1 < entries.len() {
        let (k0, e0) = entries[i];
        let (k1, e1) = entries[i + 1];
        if k0 + e0.count as u64 == k1 && e0.physical + e0.count as BlockT == e1.physical {
            entries[i].1.count = e0.count + e1.count;
            entries.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

pub struct ExtentLeafOps;

impl LeafOps for ExtentLeafOps {
    type Value = Extent;

    fn sniff(leaf: &[u8]) -> bool {
        leaf::sniff(leaf, MAGIC)
    }

    fn init(leaf: &mut [u8]) {
        leaf::init(leaf, MAGIC)
    }

    fn split(src: &mut [u8], dst: &mut [u8], _fudge: Option<(u64, usize)>) -> u64 {
        let mut entries = leaf::decode_all::<Extent>(src);
        let mid = entries.len() / 2;
        let upper = entries.split_off(mid);
        let pivot = upper.first().map(|(k, _)| *k).unwrap_or(0);
        leaf::encode_all(src, MAGIC, &entries).expect("shrinking always fits");
        leaf::encode_all(dst, MAGIC, &upper).expect("half of src always fits dst of equal size");
        pivot
    }

    fn expand(leaf: &mut [u8], key: u64, value: &Extent) -> Result<(), LeafFull> {
        let mut entries = leaf::decode_all::<Extent>(leaf);
        match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) => entries[i].1 = *value,
            Err(i) => entries.insert(i, (key, *value)),
        }
        coalesce_adjacent(&mut entries);
        leaf::encode_all(leaf, MAGIC, &entries)
    }

    /// Returns the physical block at `key` and how many further blocks
    /// the same run covers, both re-based to start at `key` rather than
    /// at the entry's own start — this is what read/write planners want.
    fn lookup(leaf: &[u8], key: u64) -> Option<(Extent, u32)> {
        let entries = leaf::decode_all::<Extent>(leaf);
        let i = match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (start, extent) = entries[i];
        let end = start + extent.count as u64;
        if key >= end {
            return None;
        }
        let offset = (key - start) as BlockT;
        let remaining = (end - key) as u32;
        Some((Extent { physical: extent.physical + offset, count: remaining }, remaining))
    }

    fn chop(leaf: &mut [u8], from: u64, to: u64) -> bool {
        let entries = leaf::decode_all::<Extent>(leaf);
        let mut kept = Vec::with_capacity(entries.len());
        for (start, extent) in entries {
            let end = start + extent.count as u64;
            if end <= from || start >= to {
                kept.push((start, extent));
                continue;
            }
            // Overlaps the chopped range: keep the surviving edges.
            if start < from {
                let count = (from - start) as u32;
                kept.push((start, Extent { physical: extent.physical, count }));
            }
            if end > to {
                let dropped = (to - start) as u32;
                let count = extent.count - dropped;
                kept.push((to, Extent { physical: extent.physical + dropped as BlockT, count }));
            }
        }
        let empty = kept.is_empty();
        leaf::encode_all(leaf, MAGIC, &kept).expect("chop never grows a leaf");
        empty
    }

    fn first_key(leaf: &[u8]) -> Option<u64> {
        leaf::first_key(leaf)
    }

    fn used(leaf: &[u8]) -> usize {
        leaf::used_bytes::<Extent>(leaf)
    }

    fn free(leaf: &[u8]) -> usize {
        leaf::free_bytes::<Extent>(leaf)
    }

    fn merge(dst: &mut [u8], src: &[u8]) {
        let mut entries = leaf::decode_all::<Extent>(dst);
        entries.extend(leaf::decode_all::<Extent>(src));
        entries.sort_by_key(|(k, _)| *k);
        coalesce_adjacent(&mut entries);
        leaf::encode_all(dst, MAGIC, &entries).expect("caller checked used(src) <= free(dst)");
    }

    fn entry_size(_value: &Extent) -> usize {
        8 + Extent::LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(block_size: usize) -> Vec<u8> {
        let mut b = vec![0u8; block_size];
        ExtentLeafOps::init(&mut b);
        b
    }

    #[test]
    fn expand_then_lookup() {
        let mut l = leaf(256);
        ExtentLeafOps::expand(&mut l, 10, &Extent { physical: 500, count: 4 }).unwrap();
        let (e, run) = ExtentLeafOps::lookup(&l, 12).unwrap();
        assert_eq!(e.physical, 502);
        assert_eq!(run, 2);
        assert!(ExtentLeafOps::lookup(&l, 14).is_none());
        assert!(ExtentLeafOps::lookup(&l, 9).is_none());
    }

    #[test]
    fn chop_trims_overlapping_edges() {
        let mut l = leaf(256);
        ExtentLeafOps::expand(&mut l, 0, &Extent { physical: 100, count: 10 }).unwrap();
        let empty = ExtentLeafOps::chop(&mut l, 3, 6);
        assert!(!empty);
        assert!(ExtentLeafOps::lookup(&l, 4).is_none());
        let (left, _) = ExtentLeafOps::lookup(&l, 2).unwrap();
        assert_eq!(left.physical, 100);
        let (right, _) = ExtentLeafOps::lookup(&l, 7).unwrap();
        assert_eq!(right.physical, 106);
    }

    #[test]
    fn chop_whole_range_reports_empty() {
        let mut l = leaf(256);
        ExtentLeafOps::expand(&mut l, 0, &Extent { physical: 0, count: 5 }).unwrap();
        assert!(ExtentLeafOps::chop(&mut l, 0, 5));
    }

    #[test]
    fn expand_coalesces_contiguous_runs() {
        let mut l = leaf(256);
        ExtentLeafOps::expand(&mut l, 0, &Extent { physical: 100, count: 1 }).unwrap();
        ExtentLeafOps::expand(&mut l, 1, &Extent { physical: 101, count: 1 }).unwrap();
        let (extent, run) = ExtentLeafOps::lookup(&l, 0).unwrap();
        assert_eq!(run, 2);
        assert_eq!(extent.physical, 100);
        assert_eq!(leaf::count(&l), 1);
    }

    #[test]
    fn expand_does_not_coalesce_non_contiguous_physical() {
        let mut l = leaf(256);
        ExtentLeafOps::expand(&mut l, 0, &Extent { physical: 100, count: 1 }).unwrap();
        ExtentLeafOps::expand(&mut l, 1, &Extent { physical: 500, count: 1 }).unwrap();
        assert_eq!(leaf::count(&l), 2);
        let (_, run) = ExtentLeafOps::lookup(&l, 0).unwrap();
        assert_eq!(run, 1);
    }
}
