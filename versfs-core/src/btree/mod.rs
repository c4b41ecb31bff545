//! The generic B+ tree engine. Every index node is this engine's
//! own format; leaves are opaque to it except through [`LeafOps`]. Paths
//! remember the *next* child to visit at each level rather than the
//! current one, which is what lets a delete resume mid-tree without
//! re-deriving where it left off — the "next-pointer path".

mod index;
mod ops;

pub use index::capacity as index_capacity;
pub use ops::{LeafFull, LeafOps};

use std::time::Instant;

use index::IndexNode;

use crate::buffer::BufferId;
use crate::device::BlockT;
use crate::error::{Error, Result};

/// What the engine needs from its host to do I/O. Implemented by
/// [`crate::mount::Mount`] against its raw volume map; the engine itself
/// never talks to a `Device` or `Pool` directly.
pub trait TreeIo {
    fn block_size(&self) -> usize;
    /// The delta new writes should be attributed to.
    fn delta(&self) -> u32;
    /// Read (or serve from cache) the node/leaf at `block`, pinning it.
    fn read(&mut self, block: BlockT) -> Result<BufferId>;
    /// Allocate a fresh block and a pinned, zeroed buffer for it — no I/O.
    fn new_block(&mut self) -> Result<(BlockT, BufferId)>;
    /// Mark pinned buffer `id` dirty for the current delta, forking it if
    /// needed; returns the id the caller must use from here on.
    fn dirty(&mut self, id: BufferId) -> BufferId;
    fn put(&mut self, id: BufferId);
    fn data(&self, id: BufferId) -> &[u8];
    fn data_mut(&mut self, id: BufferId) -> &mut [u8];
    /// Two distinct buffers, mutable at once (needed for splits).
    fn data_pair_mut(&mut self, a: BufferId, b: BufferId) -> (&mut [u8], &mut [u8]);
    fn block_of(&self, id: BufferId) -> BlockT;
    /// Queue `block` for release (delta-scoped).
    fn free_block(&mut self, block: BlockT);
}

#[derive(Clone, Copy)]
struct PathEntry {
    buffer: BufferId,
    /// Index of the child to visit *next* at this level; for the leaf
    /// entry this is unused.
    next: usize,
}

pub struct Path {
    entries: Vec<PathEntry>,
}

impl Path {
    fn leaf_buffer(&self) -> BufferId {
        self.entries.last().expect("path always has a leaf").buffer
    }
}

/// A generic B+ tree rooted at a single block, parameterized over its
/// leaf's record format.
pub struct Tree<L: LeafOps> {
    pub root: BlockT,
    pub depth: u32,
    _leaf: std::marker::PhantomData<L>,
}

impl<L: LeafOps> Clone for Tree<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: LeafOps> Copy for Tree<L> {}

impl<L: LeafOps> Tree<L> {
    pub fn new(root: BlockT, depth: u32) -> Self {
        Tree { root, depth, _leaf: std::marker::PhantomData }
    }

    /// Format a brand new single-leaf tree at `root`.
    pub fn format(io: &mut impl TreeIo, root: BlockT, root_id: BufferId) -> Self {
        let id = io.dirty(root_id);
        L::init(io.data_mut(id));
        Tree::new(root, 0)
    }

    fn release(&self, io: &mut impl TreeIo, path: &Path) {
        for entry in &path.entries {
            io.put(entry.buffer);
        }
    }

    /// Descend to the leaf that would contain `target`, pinning every
    /// buffer along the way.
    fn probe(&self, io: &mut impl TreeIo, target: u64) -> Result<Path> {
        let mut entries = Vec::with_capacity(self.depth as usize + 1);
        let mut block = self.root;
        for _ in 0..self.depth {
            let id = io.read(block)?;
            let (next, child) = {
                let node = io.data(id);
                let view = IndexNode(node);
                let cnt = view.count();
                let mut next = 1usize;
                while next < cnt && view.key(next) <= target {
                    next += 1;
                }
                (next, view.block(next - 1))
            };
            entries.push(PathEntry { buffer: id, next });
            block = child;
        }
        let leaf_id = io.read(block)?;
        if !L::sniff(io.data(leaf_id)) {
            for e in &entries {
                io.put(e.buffer);
            }
            io.put(leaf_id);
            return Err(Error::TreeCorrupt("leaf failed sniff check"));
        }
        entries.push(PathEntry { buffer: leaf_id, next: 0 });
        Ok(Path { entries })
    }

    /// Smallest key reachable by stepping one leaf to the right of
    /// `path`, or `None` if `path` already holds the rightmost leaf.
    /// Index separators are always the minimum key of their subtree, so
    /// the first unvisited sibling at any ancestor gives the answer
    /// directly — no need to actually descend into it.
    fn successor_key(&self, io: &impl TreeIo, path: &Path) -> Option<u64> {
        for level in (0..self.depth as usize).rev() {
            let entry = &path.entries[level];
            let node = IndexNode(io.data(entry.buffer));
            if entry.next < node.count() {
                return Some(node.key(entry.next));
            }
        }
        None
    }

    pub fn lookup(&self, io: &mut impl TreeIo, key: u64) -> Result<Option<(L::Value, u32)>> {
        let path = self.probe(io, key)?;
        let result = L::lookup(io.data(path.leaf_buffer()), key);
        self.release(io, &path);
        Ok(result)
    }

    /// Insert `value` at `key`, splitting leaves and index nodes and
    /// growing the root as needed.
    pub fn expand(&mut self, io: &mut impl TreeIo, key: u64, value: &L::Value) -> Result<()> {
        let mut path = self.probe(io, key)?;
        let result = self.expand_at(io, &mut path, key, value);
        self.release(io, &path);
        result
    }

    fn expand_at(&mut self, io: &mut impl TreeIo, path: &mut Path, key: u64, value: &L::Value) -> Result<()> {
        let leaf_id = io.dirty(path.leaf_buffer());
        path.entries.last_mut().unwrap().buffer = leaf_id;
        if L::expand(io.data_mut(leaf_id), key, value).is_ok() {
            return Ok(());
        }
        self.split_leaf_and_retry(io, path, key, value)
    }

    fn split_leaf_and_retry(&mut self, io: &mut impl TreeIo, path: &mut Path, key: u64, value: &L::Value) -> Result<()> {
        let (new_block, new_id) = io.new_block()?;
        let new_id = io.dirty(new_id);
        let leaf_id = path.leaf_buffer();

        let pivot = {
            let (src, dst) = io.data_pair_mut(leaf_id, new_id);
            L::init(dst);
            L::split(src, dst, Some((key, L::entry_size(value))))
        };

        let insert_id = if key >= pivot { new_id } else { leaf_id };
        L::expand(io.data_mut(insert_id), key, value)
            .map_err(|_| Error::TreeCorrupt("leaf still full after split"))?;
        io.put(new_id);

        let parent_level = self.depth as isize - 1;
        self.insert_child(io, path, parent_level, pivot, new_block)
    }

    /// Insert a `(separator, child)` pointer into the index node at
    /// `level`, splitting it (and recursing upward) or growing a new
    /// root if `level < 0`.
    fn insert_child(&mut self, io: &mut impl TreeIo, path: &mut Path, level: isize, sep_key: u64, child_block: BlockT) -> Result<()> {
        if level < 0 {
            let (root_block, root_id) = io.new_block()?;
            let root_id = io.dirty(root_id);
            {
                let mut node = IndexNode(io.data_mut(root_id));
                node.init();
                node.insert(0, 0, self.root).expect("empty node has room");
                node.insert(1, sep_key, child_block).expect("empty node has room");
            }
            io.put(root_id);
            self.root = root_block;
            self.depth += 1;
            return Ok(());
        }

        let idx = level as usize;
        let node_id = io.dirty(path.entries[idx].buffer);
        path.entries[idx].buffer = node_id;
        let insert_pos = path.entries[idx].next;
        let cap = index::capacity(io.block_size());

        let cnt = IndexNode(io.data(node_id)).count();
        if cnt < cap {
            IndexNode(io.data_mut(node_id)).insert(insert_pos, sep_key, child_block).expect("checked capacity");
            return Ok(());
        }

        let (new_block, new_id) = io.new_block()?;
        let new_id = io.dirty(new_id);
        let promoted = {
            let (src, dst) = io.data_pair_mut(node_id, new_id);
            let mut dst_node = IndexNode(&mut *dst);
            dst_node.init();
            IndexNode(&mut *src).split(dst_node)
        };
        let src_count = IndexNode(io.data(node_id)).count();
        if insert_pos <= src_count {
            IndexNode(io.data_mut(node_id)).insert(insert_pos, sep_key, child_block).expect("room after split");
        } else {
            IndexNode(io.data_mut(new_id)).insert(insert_pos - src_count, sep_key, child_block).expect("room after split");
        }
        io.put(new_id);

        self.insert_child(io, path, level - 1, promoted, new_block)
    }

    /// Delete `[from, to)` from the tree, driven by `info` and an
    /// optional deadline. Returns `true` if interrupted (by the deadline
    /// or the block budget) and must be called again with the same
    /// `info` to finish — `info.resume_key` carries the progress marker
    /// (delete interruptibility).
    ///
    /// Tracks the most recently visited surviving leaf (`prev`) across
    /// iterations so a leaf left nearly empty by the chop can be merged
    /// into it rather than left underfull — "this.used ≤ prev.free".
    pub fn chop_partial(&mut self, io: &mut impl TreeIo, info: &mut DeleteInfo, deadline: Option<Instant>) -> Result<bool> {
        let mut freed_leaves = 0u32;
        let mut prev: Option<Path> = None;

        let result = loop {
            if info.resume_key >= info.to {
                break Ok(false);
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break Ok(true);
                }
            }
            if let Some(budget) = info.blocks_budget {
                if freed_leaves >= budget {
                    break Ok(true);
                }
            }

            let mut path = match self.probe(io, info.resume_key.max(info.from)) {
                Ok(p) => p,
                Err(e) => {
                    if let Some(p) = prev.take() {
                        self.release(io, &p);
                    }
                    return Err(e);
                }
            };
            let leaf_id = io.dirty(path.leaf_buffer());
            path.entries.last_mut().unwrap().buffer = leaf_id;

            let next_bound = self.successor_key(io, &path);
            let became_empty = L::chop(io.data_mut(leaf_id), info.from.max(info.resume_key), info.to);
            freed_leaves += 1;

            if became_empty {
                self.unlink_leaf(io, &mut path, prev.as_mut())?;
                self.release(io, &path);
                // `prev`, if any, is untouched and remains the nearest
                // surviving leaf to the left.
            } else {
                let can_merge = prev
                    .as_ref()
                    .map(|p| L::used(io.data(leaf_id)) <= L::free(io.data(p.leaf_buffer())))
                    .unwrap_or(false);
                if can_merge {
                    let prev_buf = prev.as_ref().unwrap().leaf_buffer();
                    let prev_id = io.dirty(prev_buf);
                    prev.as_mut().unwrap().entries.last_mut().unwrap().buffer = prev_id;
                    {
                        let (dst, src) = io.data_pair_mut(prev_id, leaf_id);
                        L::merge(dst, src);
                    }
                    self.unlink_leaf(io, &mut path, prev.as_mut())?;
                    self.release(io, &path);
                    // `prev` keeps pointing at the now-merged leaf.
                } else {
                    self.maintain_pivot(io, &mut path);
                    if let Some(p) = prev.take() {
                        self.release(io, &p);
                    }
                    prev = Some(path);
                }
            }

            info.resume_key = match next_bound {
                Some(k) if k > info.resume_key => k,
                _ => info.to,
            };
        };

        if let Some(p) = prev.take() {
            self.release(io, &p);
        }
        result
    }

    /// After a chop changes `path`'s leaf's minimum key, fix up whichever
    /// ancestor separator pointed at it — pivot maintenance.
    fn maintain_pivot(&self, io: &mut impl TreeIo, path: &mut Path) {
        let leaf_id = path.leaf_buffer();
        if let Some(new_min) = L::first_key(io.data(leaf_id)) {
            propagate_pivot(io, path, self.depth as usize, new_min);
        }
    }

    /// Unlink an emptied (or just-merged-away) leaf from its parent, then
    /// climb, merging or unlinking ancestors:
    /// - an ancestor left with zero children is itself unlinked and freed,
    ///   continuing the climb;
    /// - an ancestor that lost its position-0 child keeps a new minimum,
    ///   propagated up via [`propagate_pivot`];
    /// - an ancestor with room to spare is folded into the matching node
    ///   in `prev`'s path ("this.count ≤ max_per_node − that.count"),
    ///   continuing the climb as if it too had emptied;
    /// - otherwise the climb stops, and at the root a single surviving
    ///   child collapses that level away entirely.
    fn unlink_leaf(&mut self, io: &mut impl TreeIo, path: &mut Path, mut prev: Option<&mut Path>) -> Result<()> {
        let leaf_block = io.block_of(path.leaf_buffer());
        io.free_block(leaf_block);

        if self.depth == 0 {
            // The tree was a single leaf; re-format it in place rather
            // than trying to remove a root that never had children.
            let id = io.dirty(path.leaf_buffer());
            L::init(io.data_mut(id));
            return Ok(());
        }

        let mut level = self.depth as isize - 1;
        loop {
            let idx = level as usize;
            let child_pos = path.entries[idx].next.saturating_sub(1);
            let node_id = io.dirty(path.entries[idx].buffer);
            path.entries[idx].buffer = node_id;
            IndexNode(io.data_mut(node_id)).remove(child_pos);
            let remaining = IndexNode(io.data(node_id)).count();

            if child_pos == 0 && remaining > 0 {
                let new_min = IndexNode(io.data(node_id)).key(0);
                propagate_pivot(io, path, idx, new_min);
            }

            if level == 0 {
                if remaining == 0 {
                    let (new_root, new_root_id) = io.new_block()?;
                    let new_root_id = io.dirty(new_root_id);
                    L::init(io.data_mut(new_root_id));
                    io.put(new_root_id);
                    let old_root = self.root;
                    self.root = new_root;
                    self.depth = 0;
                    io.free_block(old_root);
                } else if remaining == 1 {
                    let only_child = IndexNode(io.data(node_id)).block(0);
                    let old_root = self.root;
                    self.root = only_child;
                    self.depth -= 1;
                    io.free_block(old_root);
                }
                return Ok(());
            }

            if remaining == 0 {
                let this_block = io.block_of(node_id);
                io.free_block(this_block);
                level -= 1;
                continue;
            }

            if let Some(prev_path) = prev.as_deref_mut() {
                if idx < prev_path.entries.len() {
                    let sib_id = prev_path.entries[idx].buffer;
                    if sib_id != node_id {
                        let cap = index::capacity(io.block_size());
                        let sib_count = IndexNode(io.data(sib_id)).count();
                        if remaining <= cap - sib_count {
                            let sib_id = io.dirty(sib_id);
                            prev_path.entries[idx].buffer = sib_id;
                            {
                                let (dst, src) = io.data_pair_mut(sib_id, node_id);
                                IndexNode(dst).append(&IndexNode(&*src));
                            }
                            let this_block = io.block_of(node_id);
                            io.free_block(this_block);
                            level -= 1;
                            continue;
                        }
                    }
                }
            }
            return Ok(());
        }
    }

    /// Probe to the leftmost leaf, for forward iteration.
    pub fn first(&self, io: &mut impl TreeIo) -> Result<Path> {
        self.probe(io, 0)
    }

    /// Advance `path` to the next leaf in key order, releasing the old
    /// one. `None` once `path` was already the rightmost leaf.
    pub fn next(&self, io: &mut impl TreeIo, path: Path) -> Result<Option<Path>> {
        let bound = self.successor_key(io, &path);
        self.release(io, &path);
        match bound {
            Some(k) => Ok(Some(self.probe(io, k)?)),
            None => Ok(None),
        }
    }

    pub fn release_path(&self, io: &mut impl TreeIo, path: &Path) {
        self.release(io, path)
    }

    pub fn leaf_data<'a>(&self, io: &'a impl TreeIo, path: &Path) -> &'a [u8] {
        io.data(path.leaf_buffer())
    }
}

/// Climb from just above `path.entries[start_level]` to the nearest
/// ancestor where the path isn't the leftmost (entry 0) child, and
/// overwrite that ancestor's separator with `new_key` — the fix-up for
/// whichever node's minimum key just changed underneath it.
fn propagate_pivot(io: &mut impl TreeIo, path: &mut Path, start_level: usize, new_key: u64) {
    for level in (0..start_level).rev() {
        let child_pos = path.entries[level].next.saturating_sub(1);
        if child_pos > 0 {
            let node_id = io.dirty(path.entries[level].buffer);
            path.entries[level].buffer = node_id;
            if IndexNode(io.data(node_id)).key(child_pos) != new_key {
                IndexNode(io.data_mut(node_id)).set_key(child_pos, new_key);
            }
            return;
        }
    }
}

/// Drives [`Tree::chop_partial`]. `resume_key` should be initialized to
/// `from` before the first call and left alone between resumes.
#[derive(Debug, Clone, Copy)]
pub struct DeleteInfo {
    pub from: u64,
    pub to: u64,
    pub resume_key: u64,
    pub blocks_budget: Option<u32>,
}

impl DeleteInfo {
    pub fn range(from: u64, to: u64) -> Self {
        DeleteInfo { from, to, resume_key: from, blocks_budget: None }
    }
}
