//! A minimal in-memory harness for unit tests that need a [`TreeIo`]
//! implementation but shouldn't have to stand up a real [`Mount`] or
//! touch a file. Not part of this crate's public surface.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::btree::{Tree, TreeIo};
use crate::buffer::{BufferId, MapId, MapKind, Pool};
use crate::device::BlockT;
use crate::error::Result;
use crate::extent::{ExtentLeafOps, ExtentTree};

/// Backs a [`TestMount`] with a growable `Vec<Vec<u8>>` instead of a
/// file — block `n` just doesn't exist until something allocates it.
#[derive(Default)]
struct MemStore {
    blocks: HashMap<BlockT, Vec<u8>>,
}

pub struct TestMount {
    pool: Pool,
    map: MapId,
    store: Rc<RefCell<MemStore>>,
    block_size: usize,
    next_free: BlockT,
    delta: u32,
}

impl TestMount {
    pub fn new(block_size: usize) -> Self {
        let mut pool = Pool::new(64, block_size);
        let map = pool.new_map(MapKind::Raw);
        TestMount {
            pool,
            map,
            store: Rc::new(RefCell::new(MemStore::default())),
            block_size,
            next_free: 1,
            delta: 0,
        }
    }

    /// A fresh, empty extent tree rooted at a freshly allocated leaf.
    pub fn new_extent_tree(&mut self) -> ExtentTree {
        let block = self.next_free;
        self.next_free += 1;
        let id = self.pool.get(self.map, block).expect("fresh test pool always has room");
        let id = self.pool.set_dirty(id, self.delta);
        ExtentLeafOps::init(&mut self.pool.buffer_mut(id).data);
        self.pool.put(id);
        Tree::new(block, 0)
    }

    pub fn advance_delta(&mut self) {
        self.delta = self.delta.wrapping_add(1);
    }
}

impl TreeIo for TestMount {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn delta(&self) -> u32 {
        self.delta
    }

    fn read(&mut self, block: BlockT) -> Result<BufferId> {
        let id = self.pool.get(self.map, block).expect("test pool exhausted");
        if let Some(bytes) = self.store.borrow().blocks.get(&block) {
            self.pool.buffer_mut(id).data.copy_from_slice(bytes);
        }
        Ok(id)
    }

    fn new_block(&mut self) -> Result<(BlockT, BufferId)> {
        let block = self.next_free;
        self.next_free += 1;
        let id = self.pool.get(self.map, block).expect("test pool exhausted");
        Ok((block, id))
    }

    fn dirty(&mut self, id: BufferId) -> BufferId {
        self.pool.set_dirty(id, self.delta)
    }

    fn put(&mut self, id: BufferId) {
        let block = self.pool.buffer(id).index();
        let data = self.pool.buffer(id).data.clone();
        self.store.borrow_mut().blocks.insert(block, data);
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
        self.store.borrow_mut().blocks.remove(&block);
    }
}
