//! The mount: composes the device, buffer pool, allocator, delta
//! coordinator and inode table into the one object everything else in
//! this crate drives I/O through. Single-threaded, cooperative
//! frontend/backend model — no locking.

use std::collections::HashMap;

use log::{debug, warn};

use crate::alloc::Allocator;
use crate::btree::{DeleteInfo, Tree, TreeIo};
use crate::buffer::{BufferId, MapId, MapKind, Pool};
use crate::delta::DeltaCoordinator;
use crate::device::{BlockT, Device};
use crate::error::{Error, Result};
use crate::extent::{self, Extent, ExtentLeafOps, ExtentTree, Segment};
use crate::inode::{
    Inode, InodeId, InodeLeafOps, InodeRecord, InodeTable, ATABLE_INUM, BITMAP_INUM, ROOTDIR_INUM, VTABLE_INUM,
};
use crate::superblock::{Superblock, BITMAP_BLOCK, SB_BLOCK, SB_MAGIC};

pub struct Mount {
    device: Box<dyn Device>,
    pool: Pool,
    volmap: MapId,
    sb: Superblock,
    allocator: Allocator,
    delta: DeltaCoordinator,
    itree: InodeTable,
    open_maps: HashMap<InodeId, MapId>,
}

/// How many buffers the pool carries by default. Generous relative to
/// the tiny test volumes this implementation targets; the
/// cache-exhaustion path exists for callers that want to exercise it
/// with a smaller pool via [`MountConfig::pool_size`].
const DEFAULT_POOL_BUFFERS: usize = 256;

/// Engine-level tunables, handed in by a caller (the CLI turns
/// `clap`-derived arguments into one of these) rather than read from an
/// on-disk config format, which is out of scope here.
#[derive(Debug, Clone, Copy)]
pub struct MountConfig {
    /// Log2 of the device's block size. Informational at the `Mount`
    /// layer — the device itself was already created with this size —
    /// but carried so callers can round-trip one struct end to end.
    pub block_bits: u32,
    pub pool_size: usize,
    /// Entries per index node and per leaf are not independently
    /// configurable in this implementation: both are derived directly
    /// from the device's block size by the fixed-width node/leaf
    /// layouts (see `btree::index` and `leaf`). Kept here so the CLI's
    /// options surface matches the tunables a real mount exposes.
    pub entries_per_node: usize,
    pub entries_per_leaf: usize,
}

impl MountConfig {
    pub fn new(block_bits: u32) -> Self {
        MountConfig {
            block_bits,
            pool_size: DEFAULT_POOL_BUFFERS,
            entries_per_node: crate::btree::index_capacity(1usize << block_bits),
            entries_per_leaf: 0,
        }
    }
}

impl Mount {
    /// Open an already-formatted volume.
    pub fn open(device: Box<dyn Device>, config: MountConfig) -> Result<Self> {
        let block_size = device.block_size();
        let mut pool = Pool::new(config.pool_size, block_size);
        let volmap = pool.new_map(MapKind::Raw);

        let mut sb_buf = vec![0u8; block_size];
        device.read_block(SB_BLOCK, &mut sb_buf)?;
        let sb = Superblock::read_from(&sb_buf)?;

        let allocator = Allocator::new(sb.vol_blocks, sb.free_blocks, sb.next_alloc);
        let itree = Tree::new(sb.itable_root, sb.itable_depth);

        Ok(Mount { device, pool, volmap, sb, allocator, delta: DeltaCoordinator::new(), itree, open_maps: HashMap::new() })
    }

    /// Format a brand new volume: zero the bitmap, an empty inode table
    /// seeded with the well-known bitmap/version-table/atom-table/root
    /// directory inodes, and a superblock tying it together. This is
    /// this implementation's own bootstrap, not a stand-in for a full
    /// external `mkfs` — no journal, no on-disk format beyond what the
    /// engine itself needs to be exercised.
    pub fn format_volume(device: Box<dyn Device>, vol_blocks: u64, config: MountConfig) -> Result<Self> {
        let block_size = device.block_size();
        let mut pool = Pool::new(config.pool_size, block_size);
        let volmap = pool.new_map(MapKind::Raw);

        let bitmap_id = pool.get(volmap, BITMAP_BLOCK).expect("fresh pool always has room");
        pool.buffer_mut(bitmap_id).data = vec![0u8; block_size];
        pool.set_dirty(bitmap_id, 0);

        let itable_root: BlockT = 2;
        let itable_id = pool.get(volmap, itable_root).expect("fresh pool always has room");
        let itable_id = pool.set_dirty(itable_id, 0);
        InodeLeafOps::init(&mut pool.buffer_mut(itable_id).data);

        // Blocks 0-2 (superblock, bitmap, inode table root) plus one
        // freshly-formatted empty data leaf per well-known inode.
        let reserved = 3u64;
        let allocator = Allocator::new(vol_blocks, vol_blocks - reserved, reserved as BlockT);

        let sb = Superblock {
            magic: SB_MAGIC,
            block_bits: block_size.trailing_zeros(),
            vol_blocks,
            free_blocks: allocator.free_blocks(),
            next_alloc: allocator.next_alloc(),
            bitmap_block: BITMAP_BLOCK,
            itable_root,
            itable_depth: 0,
            next_inum: crate::inode::ATABLE_INUM + 1,
        };

        let mut mount = Mount {
            device,
            pool,
            volmap,
            sb,
            allocator,
            delta: DeltaCoordinator::new(),
            itree: Tree::new(itable_root, 0),
            open_maps: HashMap::new(),
        };

        for (inum, mode) in [
            (BITMAP_INUM, 0o600),
            (VTABLE_INUM, 0o600),
            (ATABLE_INUM, 0o600),
            (ROOTDIR_INUM, 0o40755),
        ] {
            mount.bootstrap_well_known(inum, mode)?;
        }
        mount.sb.next_inum = crate::superblock::FIRST_FREE_INUM;

        mount.write_superblock()?;
        mount.commit()?;
        Ok(mount)
    }

    /// Create one reserved inode with a freshly formatted, empty data
    /// btree and install it directly into the inode table (bypassing
    /// [`Mount::create_inode`], which hands out ordinary inums).
    fn bootstrap_well_known(&mut self, inum: InodeId, mode: u32) -> Result<()> {
        let root = self.alloc_block()?;
        let root_id = self.read_or_init_leaf(root)?;
        self.pool.put(root_id);
        let record = InodeRecord { root, ..InodeRecord::well_known(mode) };
        self.itree.expand(self, inum, &record)?;
        self.sb.itable_root = self.itree.root;
        self.sb.itable_depth = self.itree.depth;
        Ok(())
    }

    pub fn block_bits(&self) -> u32 {
        self.sb.block_bits
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn block_data(&self, id: BufferId) -> &[u8] {
        self.pool.buffer(id).data.as_slice()
    }

    pub fn block_data_mut(&mut self, id: BufferId) -> &mut [u8] {
        self.pool.buffer_mut(id).data.as_mut_slice()
    }

    pub fn release_block(&mut self, id: BufferId) {
        self.pool.put(id);
    }

    fn file_map(&mut self, inum: InodeId) -> MapId {
        if let Some(&m) = self.open_maps.get(&inum) {
            return m;
        }
        let m = self.pool.new_map(MapKind::File(inum));
        self.open_maps.insert(inum, m);
        m
    }

    /// Allocate up to `want` contiguous blocks from the bitmap, updating
    /// the superblock's cached free-space bookkeeping. May return fewer
    /// than `want` if the free run found is shorter.
    pub fn alloc_extent(&mut self, want: u32) -> Result<crate::alloc::Extent> {
        let bitmap_id = <Self as TreeIo>::read(self, self.sb.bitmap_block)?;
        let bitmap_id = self.pool.set_dirty(bitmap_id, self.delta.active());
        let found = self.allocator.alloc(&mut self.pool.buffer_mut(bitmap_id).data, want);
        self.pool.put(bitmap_id);
        match found {
            Some(extent) => {
                self.sb.free_blocks = self.allocator.free_blocks();
                self.sb.next_alloc = self.allocator.next_alloc();
                Ok(extent)
            }
            None => {
                warn!("allocator exhausted: volume full");
                Err(Error::OutOfSpace)
            }
        }
    }

    /// Allocate a single block. A thin convenience over [`Mount::alloc_extent`].
    pub fn alloc_block(&mut self) -> Result<BlockT> {
        Ok(self.alloc_extent(1)?.physical)
    }

    fn free_block_now(&mut self, block: BlockT) {
        if let Ok(bitmap_id) = <Self as TreeIo>::read(self, self.sb.bitmap_block) {
            let bitmap_id = self.pool.set_dirty(bitmap_id, self.delta.active());
            self.allocator.free(&mut self.pool.buffer_mut(bitmap_id).data, crate::alloc::Extent { physical: block, count: 1 });
            self.pool.put(bitmap_id);
            self.sb.free_blocks = self.allocator.free_blocks();
        }
    }

    /// Read a file's block at `logical` through its own cache map,
    /// routing the miss through the extent tree. `None` means a hole.
    /// Callers reading a whole range should call [`Mount::read_ahead`]
    /// first so this only ever hits a warm cache.
    pub fn read_file_block(&mut self, tree: &ExtentTree, inum: InodeId, logical: u64) -> Result<Option<BufferId>> {
        let map = self.file_map(inum);
        let found = tree.lookup(self, logical)?;
        match found {
            None => Ok(None),
            Some((extent, _)) => {
                if let Some(id) = self.pool.peekblk(map, extent.physical) {
                    self.pool.get_bh(id);
                    return Ok(Some(id));
                }
                let id = self.pool.get(map, extent.physical).ok_or(Error::CacheExhausted)?;
                self.device.read_block(extent.physical, &mut self.pool.buffer_mut(id).data)?;
                self.pool.mark_fetched(id);
                Ok(Some(id))
            }
        }
    }

    /// Resolve `[logical, logical + count)` against the allocator, filling
    /// every hole in the range with a freshly allocated (and mapped)
    /// extent, so every block a subsequent write touches already has a
    /// mapping. Each gap is allocated in chunks of at most
    /// [`extent::MAX_EXTENT`] blocks (split-at-most-once per gap: one
    /// allocation call per chunk, not one per block). Returns the
    /// logical ranges that were freshly mapped, so the caller can skip
    /// their read-modify-write fetch.
    pub fn map_write_window(&mut self, tree: &mut ExtentTree, logical: u64, count: u32) -> Result<Vec<(u64, u32)>> {
        let plan = extent::read_plan(&*tree, self, logical, count)?;
        let mut fresh = Vec::new();
        for seg in plan {
            if let Segment::Hole { logical: hole_start, count: hole_count } = seg {
                let mut pos = hole_start;
                let mut remaining = hole_count;
                while remaining > 0 {
                    let want = remaining.min(extent::MAX_EXTENT);
                    let got = self.alloc_extent(want)?;
                    tree.expand(self, pos, &Extent { physical: got.physical, count: got.count })?;
                    fresh.push((pos, got.count));
                    pos += got.count as u64;
                    remaining -= got.count;
                }
            }
        }
        Ok(fresh)
    }

    /// Warm the cache for an upcoming read of `[logical, logical + count)`:
    /// extend the window a little past its ends (bounded by
    /// [`extent::MAX_EXTENT`] and by the file's own size) the way a
    /// readahead heuristic would, resolve the extended window through the
    /// extent tree, and fetch every not-yet-cached block of each mapped
    /// run in as few device reads as possible. Holes need no I/O.
    pub fn read_ahead(&mut self, tree: &ExtentTree, inum: InodeId, logical: u64, count: u32, size_blocks: u64) -> Result<()> {
        let mut lo = logical;
        let mut hi = logical + count as u64;
        while hi - lo < extent::MAX_EXTENT as u64 {
            let mut grew = false;
            if lo > 0 {
                lo -= 1;
                grew = true;
            }
            if hi < size_blocks && hi - lo < extent::MAX_EXTENT as u64 {
                hi += 1;
                grew = true;
            }
            if !grew {
                break;
            }
        }
        let plan = extent::read_plan(tree, self, lo, (hi - lo) as u32)?;
        let map = self.file_map(inum);
        let bs = self.pool.block_size();
        for seg in plan {
            if let Segment::Mapped { physical, count: run, .. } = seg {
                let mut start = 0u32;
                while start < run {
                    if self.pool.peekblk(map, physical + start as BlockT).is_some() {
                        start += 1;
                        continue;
                    }
                    let mut len = 0u32;
                    while start + len < run && self.pool.peekblk(map, physical + (start + len) as BlockT).is_none() {
                        len += 1;
                    }
                    let mut chunk = vec![0u8; bs * len as usize];
                    let offset = ((physical + start as BlockT) as u64) << self.sb.block_bits;
                    self.device.read(offset, &mut chunk)?;
                    for i in 0..len {
                        let id = self.pool.get(map, physical + (start + i) as BlockT).ok_or(Error::CacheExhausted)?;
                        let off = i as usize * bs;
                        self.pool.buffer_mut(id).data.copy_from_slice(&chunk[off..off + bs]);
                        self.pool.mark_fetched(id);
                        self.pool.put(id);
                    }
                    start += len;
                }
            }
        }
        Ok(())
    }

    /// Write a file's block at `logical`. The block is assumed already
    /// mapped — callers resolve holes up front via
    /// [`Mount::map_write_window`]. `whole_block` skips the
    /// read-modify-write fetch when the caller is about to overwrite the
    /// entire block anyway, or when the block was part of a fresh
    /// allocation this same write (nothing to read back).
    pub fn write_file_block(&mut self, tree: &mut ExtentTree, inum: InodeId, logical: u64, whole_block: bool) -> Result<BufferId> {
        let map = self.file_map(inum);
        let (extent, _) = tree
            .lookup(self, logical)?
            .expect("map_write_window must map every logical block before write_file_block touches it");
        let physical = extent.physical;
        if let Some(id) = self.pool.peekblk(map, physical) {
            self.pool.get_bh(id);
            return Ok(self.pool.set_dirty(id, self.delta.active()));
        }
        let id = self.pool.get(map, physical).ok_or(Error::CacheExhausted)?;
        if !whole_block {
            self.device.read_block(physical, &mut self.pool.buffer_mut(id).data)?;
            self.pool.mark_fetched(id);
        }
        Ok(self.pool.set_dirty(id, self.delta.active()))
    }

    /// Delete `[from, to)` from a file's extent tree, returning the
    /// freed physical blocks to the allocator once the chop completes.
    pub fn chop_extents(&mut self, tree: &mut ExtentTree, inum: InodeId, from: u64, to: u64) -> Result<()> {
        self.pool.invalidate_buffers(self.file_map(inum));
        let mut info = DeleteInfo::range(from, to);
        loop {
            let suspended = tree.chop_partial(self, &mut info, None)?;
            if !suspended {
                break;
            }
        }
        Ok(())
    }

    pub fn create_inode(&mut self, mode: u32) -> Result<Inode> {
        let inum = self.sb.next_inum;
        self.sb.next_inum += 1;
        let root = self.alloc_block()?;
        let root_id = self.read_or_init_leaf(root)?;
        self.pool.put(root_id);
        let record = InodeRecord { size: 0, mode, flags: crate::inode::InodeFlags::empty(), root, depth: 0 };
        self.itree.expand(self, inum, &record)?;
        self.sb.itable_root = self.itree.root;
        self.sb.itable_depth = self.itree.depth;
        Ok(Inode { inum, record })
    }

    fn read_or_init_leaf(&mut self, block: BlockT) -> Result<BufferId> {
        let id = <Self as TreeIo>::read(self, block)?;
        let id = self.pool.set_dirty(id, self.delta.active());
        crate::extent::ExtentLeafOps::init(self.pool.buffer_mut(id).data.as_mut_slice());
        Ok(id)
    }

    pub fn load_inode(&mut self, inum: InodeId) -> Result<Option<Inode>> {
        let tree = self.itree;
        let found = tree.lookup(self, inum)?;
        Ok(found.map(|(record, _)| Inode { inum, record }))
    }

    pub fn save_inode(&mut self, inode: &Inode) -> Result<()> {
        let mut tree = self.itree;
        tree.expand(self, inode.inum, &inode.record)?;
        self.itree = tree;
        self.sb.itable_root = self.itree.root;
        self.sb.itable_depth = self.itree.depth;
        Ok(())
    }

    pub fn purge_inode(&mut self, mut inode: Inode) -> Result<()> {
        inode.truncate_to(self, 0)?;
        let mut tree = self.itree;
        let mut info = DeleteInfo::range(inode.inum, inode.inum + 1);
        loop {
            let suspended = tree.chop_partial(self, &mut info, None)?;
            if !suspended {
                break;
            }
        }
        self.itree = tree;
        self.sb.itable_root = self.itree.root;
        self.sb.itable_depth = self.itree.depth;
        self.open_maps.remove(&inode.inum);
        Ok(())
    }

    fn write_superblock(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.pool.block_size()];
        self.sb.write_to(&mut buf);
        self.device.write_block(SB_BLOCK, &buf)?;
        Ok(())
    }

    /// Write back every buffer dirty for the active delta, rotate to
    /// the next delta, and return previously-queued frees to the
    /// allocator.
    pub fn commit(&mut self) -> Result<()> {
        let slot = (self.delta.active() & 1) as u8;
        let map_count = self.pool.map_count();
        debug!("delta {} flush starting", self.delta.active());
        for map in 0..map_count {
            for id in self.pool.dirty_ids(map, slot) {
                let block = self.pool.buffer(id).index();
                self.device.write_block(block, &self.pool.buffer(id).data)?;
                self.pool.set_clean(id);
            }
        }
        self.write_superblock()?;
        let freed = self.delta.advance();
        for block in freed {
            self.free_block_now(block);
        }
        debug!("delta flush complete, now at delta {}", self.delta.active());
        Ok(())
    }
}

impl TreeIo for Mount {
    fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    fn delta(&self) -> u32 {
        self.delta.active()
    }

    fn read(&mut self, block: BlockT) -> Result<BufferId> {
        let id = self.pool.get(self.volmap, block).ok_or(Error::CacheExhausted)?;
        if self.pool.buffer(id).state() == crate::buffer::BufferState::Empty {
            self.device.read_block(block, &mut self.pool.buffer_mut(id).data)?;
            self.pool.mark_fetched(id);
        }
        Ok(id)
    }

    fn new_block(&mut self) -> Result<(BlockT, BufferId)> {
        let block = self.alloc_block()?;
        let id = self.pool.get(self.volmap, block).ok_or(Error::CacheExhausted)?;
        Ok((block, id))
    }

    fn dirty(&mut self, id: BufferId) -> BufferId {
        self.pool.set_dirty(id, self.delta.active())
    }

    fn put(&mut self, id: BufferId) {
        self.pool.put(id);
    }

    fn data(&self, id: BufferId) -> &[u8] {
        self.pool.buffer(id).data.as_slice()
    }

    fn data_mut(&mut self, id: BufferId) -> &mut [u8] {
        self.pool.buffer_mut(id).data.as_mut_slice()
    }

    fn data_pair_mut(&mut self, a: BufferId, b: BufferId) -> (&mut [u8], &mut [u8]) {
        self.pool.data_pair_mut(a, b)
    }

    fn block_of(&self, id: BufferId) -> BlockT {
        self.pool.buffer(id).index()
    }

    fn free_block(&mut self, block: BlockT) {
        self.delta.queue_free(block);
    }
}
