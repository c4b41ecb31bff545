//! The on-disk superblock. One block at the start of the volume,
//! big-endian fields, read once at mount and rewritten whenever the
//! allocator's or inode table's root state changes.

use byteorder::{BigEndian, ByteOrder};

use crate::device::BlockT;
use crate::error::{Error, Result};

pub const SB_MAGIC: u64 = 0x7665_7273_6673_3031; // "versfs01"
pub const SB_BLOCK: BlockT = 0;

/// The bitmap occupies the block right after the superblock; the inode
/// table tree starts empty and grows from there — this is this
/// implementation's own bootstrap, not a stand-in for an external `mkfs`.
pub const BITMAP_BLOCK: BlockT = 1;

/// First inum handed out to an ordinary `create_inode` caller. Inums
/// below this are the well-known inodes the mount bootstraps itself.
pub const FIRST_FREE_INUM: u64 = 5;

const SB_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub block_bits: u32,
    pub vol_blocks: u64,
    pub free_blocks: u64,
    pub next_alloc: u64,
    pub bitmap_block: BlockT,
    pub itable_root: BlockT,
    pub itable_depth: u32,
    pub next_inum: u64,
}

impl Superblock {
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SB_LEN {
            return Err(Error::TreeCorrupt("superblock block too small"));
        }
        let magic = BigEndian::read_u64(&bytes[0..8]);
        if magic != SB_MAGIC {
            return Err(Error::TreeCorrupt("superblock magic mismatch"));
        }
        Ok(Superblock {
            magic,
            block_bits: BigEndian::read_u32(&bytes[8..12]),
            vol_blocks: BigEndian::read_u64(&bytes[16..24]),
            free_blocks: BigEndian::read_u64(&bytes[24..32]),
            next_alloc: BigEndian::read_u64(&bytes[32..40]),
            bitmap_block: BigEndian::read_i64(&bytes[40..48]),
            itable_root: BigEndian::read_i64(&bytes[48..56]),
            itable_depth: BigEndian::read_u32(&bytes[56..60]),
            next_inum: {
                // Packed into the trailing 8 bytes of a second cache line
                // worth of header; SB_LEN is sized to leave room for this
                // without touching the rest of the block.
                if bytes.len() >= SB_LEN + 8 {
                    BigEndian::read_u64(&bytes[SB_LEN..SB_LEN + 8])
                } else {
                    FIRST_FREE_INUM
                }
            },
        })
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        BigEndian::write_u64(&mut bytes[0..8], self.magic);
        BigEndian::write_u32(&mut bytes[8..12], self.block_bits);
        BigEndian::write_u64(&mut bytes[16..24], self.vol_blocks);
        BigEndian::write_u64(&mut bytes[24..32], self.free_blocks);
        BigEndian::write_u64(&mut bytes[32..40], self.next_alloc);
        BigEndian::write_i64(&mut bytes[40..48], self.bitmap_block);
        BigEndian::write_i64(&mut bytes[48..56], self.itable_root);
        BigEndian::write_u32(&mut bytes[56..60], self.itable_depth);
        if bytes.len() >= SB_LEN + 8 {
            BigEndian::write_u64(&mut bytes[SB_LEN..SB_LEN + 8], self.next_inum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let sb = Superblock {
            magic: SB_MAGIC,
            block_bits: 12,
            vol_blocks: 4096,
            free_blocks: 4000,
            next_alloc: 96,
            bitmap_block: BITMAP_BLOCK,
            itable_root: 2,
            itable_depth: 0,
            next_inum: 5,
        };
        let mut bytes = vec![0u8; 4096];
        sb.write_to(&mut bytes);
        let back = Superblock::read_from(&bytes).unwrap();
        assert_eq!(sb, back);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 4096];
        assert!(Superblock::read_from(&bytes).is_err());
    }
}
