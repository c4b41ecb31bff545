use std::collections::VecDeque;

use log::{debug, trace};

use super::{Buffer, BufferId, BufferState, HASH_BUCKETS, BUFFER_DIRTY_STATES};
use crate::device::BlockT;
use crate::inode::InodeId;

/// Identifies one address space. Index into `Pool::maps`.
pub type MapId = usize;

/// What a map's `(map, index)` pair actually addresses, used by the mount
/// to decide how to service a cache miss. This dispatches on a tag
/// instead of storing a closure, which sidesteps a `Map <-> Inode`
/// reference cycle: a `Map` never borrows its owning `Inode`, it just
/// names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// The raw volume: `index` is already a physical block number.
    Raw,
    /// A per-inode address space: `index` is a logical file block, routed
    /// through that inode's extent tree by the mount.
    File(InodeId),
}

struct MapState {
    kind: MapKind,
    hash: Vec<Vec<BufferId>>,
    dirty: [Vec<BufferId>; BUFFER_DIRTY_STATES],
}

impl MapState {
    fn new(kind: MapKind) -> Self {
        MapState {
            kind,
            hash: (0..HASH_BUCKETS).map(|_| Vec::new()).collect(),
            dirty: Default::default(),
        }
    }
}

fn hash_index(index: BlockT) -> usize {
    (index as u64 % HASH_BUCKETS as u64) as usize
}

/// The buffer pool: a fixed-size slab of buffers shared across every map,
/// plus the hash/LRU/dirty-list bookkeeping that gives each `(map, index)`
/// at most one live buffer.
pub struct Pool {
    block_size: usize,
    slots: Vec<Buffer>,
    /// Slot ids with no identity (`BufferState::Freed`).
    free: VecDeque<BufferId>,
    /// Clean, unpinned buffers, oldest (eviction candidate) at the front.
    lru: VecDeque<BufferId>,
    maps: Vec<MapState>,
    /// Set by `fork` on the buffer that was unlinked from the hash: once
    /// its owning flush drains it goes straight back to the free pool
    /// instead of the LRU, since no lookup can reach it any more.
    unlinked: Vec<bool>,
}

impl Pool {
    pub fn new(pool_size: usize, block_size: usize) -> Self {
        let slots = (0..pool_size)
            .map(|_| Buffer {
                map: MapId::MAX,
                index: crate::device::BLOCK_NONE,
                state: BufferState::Freed,
                refcount: 0,
                data: Vec::new(),
            })
            .collect();
        Pool {
            block_size,
            slots,
            free: (0..pool_size).collect(),
            lru: VecDeque::new(),
            maps: Vec::new(),
            unlinked: vec![false; pool_size],
        }
    }

    pub fn new_map(&mut self, kind: MapKind) -> MapId {
        self.maps.push(MapState::new(kind));
        self.maps.len() - 1
    }

    pub fn map_kind(&self, map: MapId) -> MapKind {
        self.maps[map].kind
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.slots[id]
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.slots[id]
    }

    /// Two distinct slots, mutable at once — needed wherever a split
    /// copies from one buffer's data into another's.
    pub fn data_pair_mut(&mut self, a: BufferId, b: BufferId) -> (&mut [u8], &mut [u8]) {
        assert_ne!(a, b, "data_pair_mut requires distinct buffers");
        if a < b {
            let (left, right) = self.slots.split_at_mut(b);
            (&mut left[a].data, &mut right[0].data)
        } else {
            let (left, right) = self.slots.split_at_mut(a);
            (&mut right[0].data, &mut left[b].data)
        }
    }

    fn bucket(&self, map: MapId, index: BlockT) -> &Vec<BufferId> {
        &self.maps[map].hash[hash_index(index)]
    }

    /// Pure lookup; no I/O, no allocation (`peekblk`).
    pub fn peekblk(&self, map: MapId, index: BlockT) -> Option<BufferId> {
        self.bucket(map, index)
            .iter()
            .copied()
            .find(|&id| self.slots[id].index == index && self.slots[id].map == map)
    }

    fn insert_hash(&mut self, map: MapId, index: BlockT, id: BufferId) {
        self.maps[map].hash[hash_index(index)].push(id);
    }

    fn remove_hash(&mut self, map: MapId, index: BlockT, id: BufferId) {
        let bucket = &mut self.maps[map].hash[hash_index(index)];
        if let Some(pos) = bucket.iter().position(|&x| x == id) {
            bucket.swap_remove(pos);
        }
    }

    fn evict_lru(&mut self) -> Option<BufferId> {
        self.lru.pop_front()
    }

    /// Reclaim one slot for a new `(map, index)` identity: a free slot if
    /// one exists, otherwise the LRU tail. Returns `None` if the pool is
    /// fully pinned (cache exhaustion) — the caller (mount) may retry
    /// after a flush drains some dirty buffers.
    fn reclaim(&mut self) -> Option<BufferId> {
        if let Some(id) = self.free.pop_front() {
            return Some(id);
        }
        self.evict_lru()
    }

    /// `blockget`: returns a buffer for `(map, index)`, `Empty` on miss,
    /// without performing I/O.
    pub fn get(&mut self, map: MapId, index: BlockT) -> Option<BufferId> {
        if let Some(id) = self.peekblk(map, index) {
            self.slots[id].refcount += 1;
            return Some(id);
        }
        let id = self.reclaim()?;
        trace!("blockget miss map={map} index={index} slot={id}");
        let buf = &mut self.slots[id];
        if buf.state != BufferState::Freed {
            // Evicted from LRU: must have been clean, so no writeback needed.
            debug_assert_eq!(buf.state, BufferState::Clean);
            self.remove_hash(buf.map, buf.index, id);
        }
        buf.map = map;
        buf.index = index;
        buf.state = BufferState::Empty;
        buf.refcount = 1;
        buf.data = vec![0u8; self.block_size];
        self.unlinked[id] = false;
        self.insert_hash(map, index, id);
        Some(id)
    }

    /// Increment refcount (`get_bh`).
    pub fn get_bh(&mut self, id: BufferId) {
        self.slots[id].refcount += 1;
    }

    /// Decrement refcount; a clean buffer that reaches zero joins the LRU
    /// tail (`blockput`).
    pub fn put(&mut self, id: BufferId) {
        let buf = &mut self.slots[id];
        debug_assert!(buf.refcount > 0);
        buf.refcount -= 1;
        if buf.refcount == 0 && buf.state == BufferState::Clean {
            self.lru.push_back(id);
        }
    }

    /// Decrement refcount and return straight to the free pool, used when
    /// the caller knows no one else holds the buffer (`blockput_free`).
    pub fn put_free(&mut self, id: BufferId) {
        let buf = &mut self.slots[id];
        debug_assert!(buf.refcount > 0);
        buf.refcount -= 1;
        if buf.refcount == 0 {
            self.remove_hash(buf.map, buf.index, id);
            let buf = &mut self.slots[id];
            buf.state = BufferState::Freed;
            buf.data = Vec::new();
            self.free.push_back(id);
        }
    }

    /// `set_buffer_clean`: remove from its dirty list, join the LRU (or,
    /// for a buffer unlinked by a fork, go straight back to the free pool
    /// since no lookup can reach it any more).
    pub fn set_clean(&mut self, id: BufferId) {
        let (map, slot, index) = {
            let buf = &self.slots[id];
            let slot = match buf.state {
                BufferState::Dirty(d) => d as usize,
                _ => return,
            };
            (buf.map, slot, buf.index)
        };
        let dirty = &mut self.maps[map].dirty[slot];
        if let Some(pos) = dirty.iter().position(|&x| x == id) {
            dirty.swap_remove(pos);
        }
        if self.unlinked[id] {
            let buf = &mut self.slots[id];
            buf.state = BufferState::Freed;
            buf.data = Vec::new();
            self.free.push_back(id);
            return;
        }
        let buf = &mut self.slots[id];
        buf.state = BufferState::Clean;
        let _ = index;
        if buf.refcount == 0 {
            self.lru.push_back(id);
        }
    }

    /// Transition a freshly fetched buffer from `Empty` to `Clean`
    /// (`blockread`'s post-I/O state) and, once unpinned, onto the LRU.
    /// A no-op if the buffer isn't `Empty` — it may have been dirtied by
    /// a concurrent lookup on the same map/index before the read landed.
    pub fn mark_fetched(&mut self, id: BufferId) {
        let buf = &mut self.slots[id];
        if buf.state != BufferState::Empty {
            return;
        }
        buf.state = BufferState::Clean;
        if buf.refcount == 0 {
            self.lru.push_back(id);
        }
    }

    /// `set_buffer_dirty`: transitions `Empty`/`Clean` straight to
    /// `Dirty(slot)`; a no-op if already dirty for this delta's slot;
    /// otherwise performs a buffer fork and returns the id of the
    /// buffer the caller should use from now on (the forked copy, or the
    /// same id if no fork was needed).
    pub fn set_dirty(&mut self, id: BufferId, delta: u32) -> BufferId {
        let slot = (delta & (BUFFER_DIRTY_STATES as u32 - 1)) as u8;
        let (map, index, cur_state) = {
            let buf = &self.slots[id];
            (buf.map, buf.index, buf.state)
        };
        match cur_state {
            BufferState::Dirty(d) if d == slot => id,
            BufferState::Empty | BufferState::Clean => {
                self.slots[id].state = BufferState::Dirty(slot);
                self.maps[map].dirty[slot as usize].push(id);
                id
            }
            BufferState::Dirty(_old_slot) => self.fork(id, map, index, slot),
            BufferState::Freed => unreachable!("dirtying a free buffer"),
        }
    }

    /// Buffer fork: preserve the older delta's snapshot while
    /// handing the frontend a mutable copy.
    fn fork(&mut self, old: BufferId, map: MapId, index: BlockT, new_slot: u8) -> BufferId {
        let new_id = self
            .reclaim()
            .expect("fork requires a free/evictable slot; cache exhaustion during fork is fatal");
        debug!("buffer fork map={map} index={index} old={old} new={new_id}");
        if self.slots[new_id].state != BufferState::Freed {
            let (m, i) = (self.slots[new_id].map, self.slots[new_id].index);
            self.remove_hash(m, i, new_id);
        }
        let data = self.slots[old].data.clone();
        // Unlink the old buffer from the hash: it stays on its dirty list,
        // owned by the flush that will write it back, but no future lookup
        // will find it.
        self.remove_hash(map, index, old);
        self.unlinked[old] = true;

        // Ownership of every pin on `old` moves to the new buffer — all
        // future lookups resolve to it, so callers holding a pin on `old`
        // must not also expect to reach it via `(map, index)` again.
        let refcount = self.slots[old].refcount;
        self.slots[old].refcount = 0;
        self.slots[new_id] = Buffer {
            map,
            index,
            state: BufferState::Dirty(new_slot),
            refcount: refcount.max(1),
            data,
        };
        self.unlinked[new_id] = false;
        self.insert_hash(map, index, new_id);
        self.maps[map].dirty[new_slot as usize].push(new_id);
        new_id
    }

    /// `invalidate_buffers`: drop all buffers for `map`; dirty buffers are
    /// discarded outright (caller asserts none are needed).
    pub fn invalidate_buffers(&mut self, map: MapId) {
        let ids: Vec<BufferId> = {
            let m = &self.maps[map];
            m.hash
                .iter()
                .flatten()
                .copied()
                .collect()
        };
        for id in ids {
            self.drop_buffer(map, id);
        }
    }

    /// `truncate_buffers_range`: drop buffers in `[start_block, end_block]`.
    pub fn truncate_buffers_range(&mut self, map: MapId, start_block: BlockT, end_block: BlockT) {
        let ids: Vec<BufferId> = {
            let m = &self.maps[map];
            m.hash
                .iter()
                .flatten()
                .copied()
                .filter(|&id| {
                    let idx = self.slots[id].index;
                    idx >= start_block && idx <= end_block
                })
                .collect()
        };
        for id in ids {
            self.drop_buffer(map, id);
        }
    }

    fn drop_buffer(&mut self, map: MapId, id: BufferId) {
        let (index, state) = {
            let buf = &self.slots[id];
            (buf.index, buf.state)
        };
        self.remove_hash(map, index, id);
        if let BufferState::Dirty(slot) = state {
            let dirty = &mut self.maps[map].dirty[slot as usize];
            if let Some(pos) = dirty.iter().position(|&x| x == id) {
                dirty.swap_remove(pos);
            }
        }
        if let Some(pos) = self.lru.iter().position(|&x| x == id) {
            self.lru.remove(pos);
        }
        let buf = &mut self.slots[id];
        buf.state = BufferState::Freed;
        buf.data = Vec::new();
        buf.refcount = 0;
        self.unlinked[id] = false;
        self.free.push_back(id);
    }

    /// Snapshot of the ids currently dirty for `slot`, in insertion order —
    /// used by flush to batch contiguous buffers (`flush_state`).
    pub fn dirty_ids(&self, map: MapId, slot: u8) -> Vec<BufferId> {
        self.maps[map].dirty[slot as usize].clone()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    /// Total free + evictable-clean capacity, for diagnostics.
    pub fn available(&self) -> usize {
        self.free.len() + self.lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        let mut p = Pool::new(4, 16);
        p.new_map(MapKind::Raw);
        p
    }

    #[test]
    fn peekblk_is_pure_lookup() {
        let mut p = pool();
        assert!(p.peekblk(0, 3).is_none());
        let id = p.get(0, 3).unwrap();
        assert_eq!(p.peekblk(0, 3), Some(id));
    }

    #[test]
    fn get_is_unique_per_map_index() {
        let mut p = pool();
        let a = p.get(0, 5).unwrap();
        let b = p.get(0, 5).unwrap();
        assert_eq!(a, b);
        assert_eq!(p.buffer(a).refcount(), 2);
    }

    #[test]
    fn dirty_then_clean_round_trip() {
        let mut p = pool();
        let id = p.get(0, 1).unwrap();
        let id = p.set_dirty(id, 0);
        assert!(p.buffer(id).state().is_dirty());
        assert_eq!(p.dirty_ids(0, 0), vec![id]);
        p.set_clean(id);
        assert_eq!(p.buffer(id).state(), BufferState::Clean);
        assert!(p.dirty_ids(0, 0).is_empty());
    }

    #[test]
    fn fork_preserves_old_payload() {
        let mut p = pool();
        let id = p.get(0, 7).unwrap();
        p.buffer_mut(id).data[0] = 0xAB;
        let id = p.set_dirty(id, 0); // dirty at delta 0
        let old_data = p.buffer(id).data.clone();

        let new_id = p.set_dirty(id, 1); // delta 1 forks
        assert_ne!(new_id, id);
        assert_eq!(p.buffer(id).data, old_data);
        assert_eq!(p.buffer(new_id).data, old_data);
        assert_eq!(p.peekblk(0, 7), Some(new_id));

        p.buffer_mut(new_id).data[0] = 0xCD;
        assert_eq!(p.buffer(id).data[0], 0xAB);
        assert_eq!(p.buffer(new_id).data[0], 0xCD);
    }

    #[test]
    fn lru_eviction_reclaims_clean_buffers() {
        let mut p = Pool::new(2, 16);
        p.new_map(MapKind::Raw);
        let a = p.get(0, 0).unwrap();
        p.set_clean(p.set_dirty(a, 0));
        p.put(a);
        let b = p.get(0, 1).unwrap();
        p.set_clean(p.set_dirty(b, 0));
        p.put(b);
        // Pool is full of clean, unpinned buffers; a third index must evict `a`.
        let c = p.get(0, 2).unwrap();
        assert!(p.peekblk(0, 0).is_none());
        assert_eq!(p.peekblk(0, 2), Some(c));
    }
}
