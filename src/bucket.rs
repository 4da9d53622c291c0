use {
    auto_impl::auto_impl,
    std::collections::HashMap,
};

use crate::error::{VolumeError, VolumeResult};

/// Stable external identity of a brick, persisted in the system table.
pub type BrickId = u32;

/// One physical storage device participating in the volume.
///
/// Bricks are identified two ways: by their stable external [`BrickId`]
/// (persisted, used in the system table) and by a transient dense index
/// assigned by the [`BucketSet`] they currently belong to. The dense index
/// is only meaningful for the duration of one volume configuration.
#[auto_impl(&)]
pub trait Bucket {
    /// Stable external id.
    fn id(&self) -> BrickId;

    /// Data capacity, in blocks.
    fn capacity(&self) -> u64;

    /// Blocks currently occupied on this brick.
    fn space_occupied(&self) -> u64;
}

/// A bucket whose capacity can be changed in place (brick resize).
pub trait BucketMut: Bucket {
    fn set_capacity(&mut self, capacity: u64);
}

/// The ordered set of active bricks plus their fibers.
///
/// Bricks are stored in dense-index order; the id-to-index map is kept
/// consistent across insertions and removals so the bijection holds for the
/// duration of one rebalance. Each brick's fiber (the segment indices it
/// owns, ascending) travels with the brick when dense positions shift.
pub struct BucketSet<B> {
    bricks: Vec<B>,
    fibers: Vec<Vec<u32>>,
    by_id: HashMap<BrickId, usize>,
}

impl<B: Bucket> Default for BucketSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Bucket> BucketSet<B> {
    pub fn new() -> Self {
        Self {
            bricks: Vec::new(),
            fibers: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Builds a set from bricks in dense-index order.
    pub fn from_bricks<I: IntoIterator<Item = B>>(bricks: I) -> VolumeResult<Self> {
        let mut set = Self::new();
        for brick in bricks {
            let pos = set.len();
            set.insert_at(pos, brick)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    /// Inserts a brick at dense position `pos`, shifting later indices.
    ///
    /// The new brick starts with an empty fiber; rebalancing assigns its
    /// segments afterwards.
    pub fn insert_at(&mut self, pos: usize, brick: B) -> VolumeResult<()> {
        if pos > self.bricks.len() {
            return Err(VolumeError::InvalidConfig("bucket position out of range"));
        }
        if self.by_id.contains_key(&brick.id()) {
            return Err(VolumeError::InvalidConfig("duplicate brick id"));
        }
        self.bricks.insert(pos, brick);
        self.fibers.insert(pos, Vec::new());
        self.reindex();
        Ok(())
    }

    /// Detaches the brick at dense position `pos`, returning it together
    /// with its fiber. Later dense indices shift down by one.
    pub fn detach(&mut self, pos: usize) -> (B, Vec<u32>) {
        let brick = self.bricks.remove(pos);
        let fiber = self.fibers.remove(pos);
        self.reindex();
        (brick, fiber)
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        for (idx, brick) in self.bricks.iter().enumerate() {
            self.by_id.insert(brick.id(), idx);
        }
    }

    pub fn get(&self, idx: usize) -> Option<&B> {
        self.bricks.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut B> {
        self.bricks.get_mut(idx)
    }

    /// External id of the brick at dense index `idx`.
    pub fn id_of_index(&self, idx: usize) -> BrickId {
        self.bricks[idx].id()
    }

    /// Dense index of the brick with external id `id`, if active.
    pub fn index_of_id(&self, id: BrickId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Capacity vector in dense-index order.
    pub fn capacities(&self) -> Vec<u64> {
        self.bricks.iter().map(|b| b.capacity()).collect()
    }

    /// Total space occupied across all bricks.
    pub fn total_space_occupied(&self) -> u64 {
        self.bricks.iter().map(|b| b.space_occupied()).sum()
    }

    pub fn fiber(&self, idx: usize) -> &[u32] {
        &self.fibers[idx]
    }

    pub fn fiber_len(&self, idx: usize) -> usize {
        self.fibers[idx].len()
    }

    pub fn set_fiber(&mut self, idx: usize, fiber: Vec<u32>) {
        self.fibers[idx] = fiber;
    }

    /// Replaces all fibers at once (after a committed rebalance).
    pub fn replace_fibers(&mut self, fibers: Vec<Vec<u32>>) {
        debug_assert_eq!(fibers.len(), self.bricks.len());
        self.fibers = fibers;
    }

    pub fn iter(&self) -> impl Iterator<Item = &B> {
        self.bricks.iter()
    }
}
