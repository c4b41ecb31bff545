//! The inode table: a dedicated B+ tree keyed by inode number,
//! plus the [`Inode`] handle callers use for byte-range I/O.

mod leaf;

pub use leaf::{InodeFlags, InodeId, InodeLeafOps, InodeRecord};

use crate::btree::Tree;
use crate::error::Result;
use crate::extent::ExtentTree;
use crate::mount::Mount;

pub type InodeTable = Tree<InodeLeafOps>;

/// Reserved inums the mount bootstraps at format time, before handing
/// out [`crate::superblock::FIRST_FREE_INUM`] and onward to callers.
pub const BITMAP_INUM: InodeId = 1;
pub const VTABLE_INUM: InodeId = 2;
pub const ATABLE_INUM: InodeId = 3;
pub const ROOTDIR_INUM: InodeId = 4;

/// An open inode: its identity plus the persistent state that lives in
/// the inode table. `record` is a cached copy — callers that mutate an
/// inode must write it back with [`Mount::save_inode`].
#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub inum: InodeId,
    pub record: InodeRecord,
}

impl Inode {
    pub fn tree(&self) -> ExtentTree {
        Tree::new(self.record.root, self.record.depth)
    }

    /// Read up to `buf.len()` bytes starting at `offset`, zero-filling
    /// holes and stopping at the inode's recorded size. Returns the
    /// number of bytes actually read.
    pub fn read_at(&self, mount: &mut Mount, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.record.size || buf.is_empty() {
            return Ok(0);
        }
        let bits = mount.block_bits();
        let bs = 1usize << bits;
        let tree = self.tree();
        let end = (offset + buf.len() as u64).min(self.record.size);
        let size_blocks = (self.record.size + (1u64 << bits) - 1) >> bits;
        let start_block = offset >> bits;
        let end_block = (end + (1u64 << bits) - 1) >> bits;
        mount.read_ahead(&tree, self.inum, start_block, (end_block - start_block) as u32, size_blocks)?;
        let mut pos = offset;
        let mut done = 0usize;
        while pos < end {
            let logical = pos >> bits;
            let block_off = (pos & (bs as u64 - 1)) as usize;
            let want = ((end - pos) as usize).min(bs - block_off);
            match mount.read_file_block(&tree, self.inum, logical)? {
                Some(id) => {
                    let data = mount.block_data(id);
                    buf[done..done + want].copy_from_slice(&data[block_off..block_off + want]);
                    mount.release_block(id);
                }
                None => {
                    for b in &mut buf[done..done + want] {
                        *b = 0;
                    }
                }
            }
            pos += want as u64;
            done += want;
        }
        Ok(done)
    }

    /// Write `buf` at `offset`, allocating for holes as needed. Updates
    /// this handle's cached size/root/depth; the caller still owes a
    /// [`Mount::save_inode`] to persist them.
    pub fn write_at(&mut self, mount: &mut Mount, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bits = mount.block_bits();
        let bs = 1usize << bits;
        let mut tree = self.tree();
        let end = offset + buf.len() as u64;
        let start_block = offset >> bits;
        let end_block_exclusive = (end + (1u64 << bits) - 1) >> bits;
        let window_count = (end_block_exclusive - start_block) as u32;
        let fresh = mount.map_write_window(&mut tree, start_block, window_count)?;

        let mut pos = offset;
        let mut done = 0usize;
        while pos < end {
            let logical = pos >> bits;
            let block_off = (pos & (bs as u64 - 1)) as usize;
            let want = ((end - pos) as usize).min(bs - block_off);
            let whole_block = block_off == 0 && want == bs;
            let is_fresh = fresh.iter().any(|&(start, cnt)| logical >= start && logical < start + cnt as u64);
            let id = mount.write_file_block(&mut tree, self.inum, logical, whole_block || is_fresh)?;
            mount.block_data_mut(id)[block_off..block_off + want].copy_from_slice(&buf[done..done + want]);
            mount.release_block(id);
            pos += want as u64;
            done += want;
        }
        self.record.size = self.record.size.max(end);
        self.record.root = tree.root;
        self.record.depth = tree.depth;
        Ok(done)
    }

    /// Free every data block and drop the inode's own record.
    pub fn truncate_to(&mut self, mount: &mut Mount, new_size: u64) -> Result<()> {
        let bits = mount.block_bits();
        if new_size >= self.record.size {
            self.record.size = new_size;
            return Ok(());
        }
        let from_block = (new_size + (1 << bits) - 1) >> bits;
        let mut tree = self.tree();
        mount.chop_extents(&mut tree, self.inum, from_block, u64::MAX)?;
        self.record.size = new_size;
        self.record.root = tree.root;
        self.record.depth = tree.depth;
        Ok(())
    }
}
