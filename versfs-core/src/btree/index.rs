//! Byte layout for the engine's own index nodes. Entry 0 at any node is
//! the leftmost child pointer and its key is a don't-care (conventionally
//! zero); entries `1..count` carry real separator keys, each equal to the
//! smallest key reachable through that entry's child.

use byteorder::{BigEndian, ByteOrder};

use crate::device::BlockT;

const HEADER: usize = 8; // count(4) + reserved(4)
const ENTRY: usize = 16; // key(8) + block(8)

pub fn capacity(block_size: usize) -> usize {
    (block_size - HEADER) / ENTRY
}

fn offset(i: usize) -> usize {
    HEADER + i * ENTRY
}

pub struct IndexNode<T>(pub T);

impl<T: AsRef<[u8]>> IndexNode<T> {
    fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn count(&self) -> usize {
        BigEndian::read_u32(&self.bytes()[0..4]) as usize
    }

    pub fn key(&self, i: usize) -> u64 {
        let off = offset(i);
        BigEndian::read_u64(&self.bytes()[off..off + 8])
    }

    pub fn block(&self, i: usize) -> BlockT {
        let off = offset(i);
        BigEndian::read_i64(&self.bytes()[off + 8..off + 16])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IndexNode<T> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }

    fn set_count(&mut self, n: usize) {
        BigEndian::write_u32(&mut self.bytes_mut()[0..4], n as u32);
    }

    fn write_entry(&mut self, i: usize, key: u64, block: BlockT) {
        let off = offset(i);
        let bytes = self.bytes_mut();
        BigEndian::write_u64(&mut bytes[off..off + 8], key);
        BigEndian::write_i64(&mut bytes[off + 8..off + 16], block);
    }

    pub fn init(&mut self) {
        for b in self.bytes_mut().iter_mut() {
            *b = 0;
        }
    }

    /// Insert `(key, block)` at position `i`, shifting entries `[i, count)`
    /// right by one. `Err(())` if the node is already at capacity.
    pub fn insert(&mut self, i: usize, key: u64, block: BlockT) -> Result<(), ()> {
        let cnt = self.count();
        if cnt >= capacity(self.bytes_mut().len()) {
            return Err(());
        }
        for j in (i..cnt).rev() {
            let (k, b) = (self.key(j), self.block(j));
            self.write_entry(j + 1, k, b);
        }
        self.write_entry(i, key, block);
        self.set_count(cnt + 1);
        Ok(())
    }

    /// Remove the entry at `i`, shifting `[i+1, count)` left by one.
    pub fn remove(&mut self, i: usize) {
        let cnt = self.count();
        for j in i..cnt - 1 {
            let (k, b) = (self.key(j + 1), self.block(j + 1));
            self.write_entry(j, k, b);
        }
        self.set_count(cnt - 1);
    }

    /// Overwrite just the key at `i`, keeping its child pointer — the
    /// pivot-maintenance fix-up after a chop changes a subtree's minimum.
    pub fn set_key(&mut self, i: usize, key: u64) {
        let block = self.block(i);
        self.write_entry(i, key, block);
    }

    /// Append `src`'s entries after `self`'s own. Caller guarantees
    /// `self.count() + src.count() <= capacity` (a merge-fit check already
    /// performed by the caller, mirroring the leaf merge contract).
    pub fn append<U: AsRef<[u8]>>(&mut self, src: &IndexNode<U>) {
        let base = self.count();
        for j in 0..src.count() {
            self.write_entry(base + j, src.key(j), src.block(j));
        }
        self.set_count(base + src.count());
    }

    /// Move the upper half of `self`'s entries into empty `dst`. Returns
    /// the key that was at the first moved position — the separator the
    /// caller promotes into the parent.
    pub fn split<U: AsRef<[u8]> + AsMut<[u8]>>(&mut self, mut dst: IndexNode<U>) -> u64 {
        let cnt = self.count();
        let mid = cnt / 2;
        let promoted = self.key(mid);
        for j in mid..cnt {
            let block = self.block(j);
            let key = if j == mid { 0 } else { self.key(j) };
            dst.write_entry(j - mid, key, block);
        }
        dst.set_count(cnt - mid);
        self.set_count(mid);
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(block_size: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; block_size];
        IndexNode(bytes.as_mut_slice()).init();
        bytes
    }

    #[test]
    fn insert_keeps_order() {
        let mut n = node(64);
        let mut view = IndexNode(n.as_mut_slice());
        view.insert(0, 0, 10).unwrap();
        view.insert(1, 5, 20).unwrap();
        view.insert(2, 9, 30).unwrap();
        assert_eq!(view.count(), 3);
        assert_eq!(view.block(0), 10);
        assert_eq!(view.key(1), 5);
        assert_eq!(view.key(2), 9);
    }

    #[test]
    fn split_moves_upper_half() {
        let mut src = node(8 + 16 * 4);
        let mut dst = node(8 + 16 * 4);
        {
            let mut view = IndexNode(src.as_mut_slice());
            for (i, k) in [0u64, 5, 9, 14].into_iter().enumerate() {
                view.insert(i, k, i as BlockT * 100).unwrap();
            }
        }
        let promoted = {
            let src_view = IndexNode(src.as_mut_slice());
            let dst_view = IndexNode(dst.as_mut_slice());
            let mut src_view = src_view;
            src_view.split(dst_view)
        };
        assert_eq!(promoted, 9);
        let src_view = IndexNode(src.as_slice());
        let dst_view = IndexNode(dst.as_slice());
        assert_eq!(src_view.count(), 2);
        assert_eq!(dst_view.count(), 2);
        assert_eq!(dst_view.key(0), 0);
        assert_eq!(dst_view.block(0), 200);
        assert_eq!(dst_view.key(1), 14);
    }

    #[test]
    fn remove_shifts_left() {
        let mut n = node(64);
        let mut view = IndexNode(n.as_mut_slice());
        view.insert(0, 0, 1).unwrap();
        view.insert(1, 5, 2).unwrap();
        view.insert(2, 9, 3).unwrap();
        view.remove(1);
        assert_eq!(view.count(), 2);
        assert_eq!(view.block(1), 3);
    }
}
