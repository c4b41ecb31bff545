//! End-to-end scenarios driving a real `tempfile`-backed `FileDevice`,
//! the way a full mount/format/reopen cycle would be exercised.

use tempfile::NamedTempFile;

use versfs_core::device::FileDevice;
use versfs_core::inode::{ATABLE_INUM, BITMAP_INUM, ROOTDIR_INUM, VTABLE_INUM};
use versfs_core::{Error, Mount, MountConfig};

const BLOCK_BITS: u32 = 12;

/// The engine only ever logs through the `log` facade; wiring up
/// `env_logger` here is what turns cache-miss/fork/allocator-exhaustion
/// traffic into visible output under `cargo test -- --nocapture`.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scratch_path() -> std::path::PathBuf {
    NamedTempFile::new().unwrap().into_temp_path().keep().unwrap()
}

fn format(path: &std::path::Path, vol_blocks: u64) -> Mount {
    init_logging();
    let device = FileDevice::create(path, BLOCK_BITS, vol_blocks << BLOCK_BITS).unwrap();
    let config = MountConfig::new(BLOCK_BITS);
    Mount::format_volume(Box::new(device), vol_blocks, config).unwrap()
}

fn reopen(path: &std::path::Path) -> Mount {
    let device = FileDevice::open(path, BLOCK_BITS).unwrap();
    let config = MountConfig::new(BLOCK_BITS);
    Mount::open(Box::new(device), config).unwrap()
}

/// A fresh volume exposes exactly the four reserved inodes, and free
/// space accounts for the superblock/bitmap/itable-root reservation.
#[test]
fn fresh_volume_has_only_reserved_inodes() {
    let path = scratch_path();
    let vol_blocks = 16u64 << 20 >> BLOCK_BITS; // 16 MiB volume
    let mut mount = format(&path, vol_blocks);

    for inum in [BITMAP_INUM, VTABLE_INUM, ATABLE_INUM, ROOTDIR_INUM] {
        assert!(mount.load_inode(inum).unwrap().is_some(), "inum {inum} missing");
    }
    assert!(mount.load_inode(ROOTDIR_INUM + 1).unwrap().is_none());

    drop(mount);
    let mut reopened = reopen(&path);
    for inum in [BITMAP_INUM, VTABLE_INUM, ATABLE_INUM, ROOTDIR_INUM] {
        assert!(reopened.load_inode(inum).unwrap().is_some());
    }

    let _ = std::fs::remove_file(&path);
}

/// Two overlapping writes into the same logical block, then a reopen,
/// read back the combined bytes and collapse to a single extent.
#[test]
fn split_write_round_trips_and_maps_one_extent() {
    let path = scratch_path();
    let mut mount = format(&path, 64);

    let mut inode = mount.create_inode(0o100644).unwrap();
    let offset = 4092u64;
    inode.write_at(&mut mount, offset, b"hello ").unwrap();
    inode.write_at(&mut mount, offset + 6, b"world!").unwrap();
    mount.save_inode(&inode).unwrap();
    mount.commit().unwrap();
    let inum = inode.inum;
    drop(mount);

    let mut mount = reopen(&path);
    let inode = mount.load_inode(inum).unwrap().unwrap();
    let mut buf = [0u8; 12];
    let read = inode.read_at(&mut mount, offset, &mut buf).unwrap();
    assert_eq!(read, 12);
    assert_eq!(&buf, b"hello world!");

    let tree = inode.tree();
    let (extent, run) = tree.lookup(&mut mount, 0).unwrap().unwrap();
    assert_eq!(run, 2);
    assert_ne!(extent.physical, versfs_core::device::BLOCK_NONE);

    let _ = std::fs::remove_file(&path);
}

/// Writing neighboring logical blocks across two flushes must still
/// resolve lookups for every one of them to a covering extent.
#[test]
fn adjacent_block_writes_resolve_to_covering_extents() {
    let path = scratch_path();
    let mut mount = format(&path, 64);
    let mut inode = mount.create_inode(0o100644).unwrap();
    let bs = 1usize << BLOCK_BITS;

    for logical in [5u64, 6] {
        inode.write_at(&mut mount, logical * bs as u64, &vec![0xab; bs]).unwrap();
    }
    mount.save_inode(&inode).unwrap();
    mount.commit().unwrap();

    for logical in [6u64, 7] {
        inode.write_at(&mut mount, logical * bs as u64, &vec![0xcd; bs]).unwrap();
    }
    mount.save_inode(&inode).unwrap();
    mount.commit().unwrap();

    let tree = inode.tree();
    for logical in [5u64, 6, 7] {
        let (_, run) = tree.lookup(&mut mount, logical).unwrap().unwrap();
        assert!(run >= 1);
    }

    let _ = std::fs::remove_file(&path);
}

/// Filling an inode past a single leaf's capacity forces the tree to
/// split, and a full chop returns it to an empty root.
///
/// Writes land on every other logical block so adjacent-run coalescing
/// in the extent leaf can't fold them back into one entry — each write
/// has to stay its own leaf entry, overflowing a single leaf's capacity
/// and forcing a real split.
#[test]
fn fill_and_chop_collapses_to_empty_tree() {
    let path = scratch_path();
    let mut mount = format(&path, 1024);
    let mut inode = mount.create_inode(0o100644).unwrap();
    let bs = 1usize << BLOCK_BITS;

    let writes = 250u64;
    for i in 0..writes {
        let logical = i * 2;
        inode.write_at(&mut mount, logical * bs as u64, &vec![(i % 256) as u8; bs]).unwrap();
    }
    mount.save_inode(&inode).unwrap();
    mount.commit().unwrap();
    assert!(inode.record.depth > 0, "250 sparse single-block extents should have split the tree's root");

    let max_logical = (writes - 1) * 2;
    inode.truncate_to(&mut mount, 0).unwrap();
    mount.save_inode(&inode).unwrap();
    mount.commit().unwrap();
    assert_eq!(inode.record.depth, 0);

    let tree = inode.tree();
    assert!(tree.lookup(&mut mount, 0).unwrap().is_none());
    assert!(tree.lookup(&mut mount, max_logical).unwrap().is_none());

    let _ = std::fs::remove_file(&path);
}

/// A volume with no free blocks left returns `OutOfSpace` on the next
/// allocation attempt rather than corrupting the bitmap or panicking.
#[test]
fn allocator_exhaustion_surfaces_out_of_space() {
    let path = scratch_path();
    // Small enough that the well-known inodes' bootstrap plus a handful of
    // data writes exhausts every remaining block.
    let mut mount = format(&path, 8);
    let mut inode = mount.create_inode(0o100644).unwrap();
    let bs = 1usize << BLOCK_BITS;

    let mut logical = 0u64;
    let err = loop {
        match inode.write_at(&mut mount, logical * bs as u64, &vec![0xee; bs]) {
            Ok(_) => logical += 1,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::OutOfSpace), "expected OutOfSpace, got {err:?}");

    let _ = std::fs::remove_file(&path);
}

/// An inode purge drops both its data and its entry in the inode table.
#[test]
fn purge_removes_inode_and_its_data() {
    let path = scratch_path();
    let mut mount = format(&path, 64);
    let mut inode = mount.create_inode(0o100644).unwrap();
    inode.write_at(&mut mount, 0, b"gone soon").unwrap();
    mount.save_inode(&inode).unwrap();
    let inum = inode.inum;

    mount.purge_inode(inode).unwrap();
    mount.commit().unwrap();

    assert!(mount.load_inode(inum).unwrap().is_none());

    let _ = std::fs::remove_file(&path);
}
