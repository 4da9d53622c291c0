//! In-memory bricks, status journal and tree/storage collaborator used by
//! the integration tests.
#![allow(dead_code)]

use {
    brickspace::{
        BrickId, Bucket, BucketMut, ExtentState, ExtentUnit, FileId, ItemKey, ItemLayout,
        PAGE_BITS, StatusJournal, TreeError, TreeOps, VolumeResult, VolumeStatus,
    },
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::{Arc, Mutex},
    },
};

#[derive(Debug)]
pub struct MemBrick {
    id: BrickId,
    capacity: u64,
    occupied: u64,
}

impl MemBrick {
    pub fn new(id: BrickId, capacity: u64) -> Self {
        Self {
            id,
            capacity,
            occupied: 0,
        }
    }

    pub fn occupied(id: BrickId, capacity: u64, occupied: u64) -> Self {
        Self {
            id,
            capacity,
            occupied,
        }
    }
}

impl Bucket for MemBrick {
    fn id(&self) -> BrickId {
        self.id
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn space_occupied(&self) -> u64 {
        self.occupied
    }
}

impl BucketMut for MemBrick {
    fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
    }
}

/// Journal recording every committed status, shareable with the test body.
#[derive(Clone, Default)]
pub struct MemJournal(pub Arc<Mutex<Vec<VolumeStatus>>>);

impl StatusJournal for MemJournal {
    fn commit(&self, status: &VolumeStatus) -> VolumeResult<()> {
        self.0.lock().unwrap().push(status.clone());
        Ok(())
    }
}

/// Pinned page handle of the in-memory tree.
pub struct MemPage {
    pub file: FileId,
    pub index: u64,
    pub write_prepared: bool,
    pub brick: Option<BrickId>,
    pub block: u64,
}

#[derive(Clone, Debug)]
struct ItemRec {
    brick: BrickId,
    units: Vec<ExtentUnit>,
}

impl ItemRec {
    fn width(&self) -> u64 {
        self.units.iter().map(|u| u.width).sum()
    }

    fn size_bytes(&self) -> u64 {
        self.width() << PAGE_BITS
    }
}

/// In-memory stand-in for the tree, page cache, space accountant and
/// transaction manager.
#[derive(Default)]
pub struct MemTree {
    registered: Vec<FileId>,
    items: HashMap<FileId, BTreeMap<u64, ItemRec>>,
    immobile: HashSet<FileId>,
    free: HashMap<BrickId, u64>,
    grabbed: u64,
    grabbed_from: Option<BrickId>,
    fake_next: HashMap<BrickId, u64>,

    /// (brick, start, width) runs queued for deferred reclamation.
    pub reclaimed: Vec<(BrickId, u64, u64)>,
    /// (file, page index, brick, block) of every page handed to the txn.
    pub dirty: Vec<(FileId, u64, BrickId, u64)>,
    /// Currently pinned pages; must drain back to zero.
    pub pinned: i64,
    /// Total pages read.
    pub reads: u64,
    /// Iteration-reserve calls observed.
    pub iter_reserves: u64,

    /// Fail the read of this exact page once.
    pub fail_read_at: Option<(FileId, u64)>,
    /// After this many `lookup_item` calls, drop every item of every file
    /// (simulating a racing truncate).
    pub vanish_at_lookup: Option<u64>,
    lookup_calls: u64,
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: FileId) {
        self.registered.push(file);
        self.items.entry(file).or_default();
    }

    /// Appends an item at byte offset `offset` of `file`.
    pub fn put_item(&mut self, file: FileId, offset: u64, brick: BrickId, units: Vec<ExtentUnit>) {
        if !self.registered.contains(&file) {
            self.add_file(file);
        }
        self.items
            .get_mut(&file)
            .unwrap()
            .insert(offset, ItemRec { brick, units });
    }

    pub fn set_free(&mut self, brick: BrickId, blocks: u64) {
        self.free.insert(brick, blocks);
    }

    pub fn free_of(&self, brick: BrickId) -> u64 {
        self.free.get(&brick).copied().unwrap_or(0)
    }

    /// Snapshot of a file's items in offset order.
    pub fn layouts(&self, file: FileId) -> Vec<ItemLayout> {
        self.items
            .get(&file)
            .map(|items| {
                items
                    .iter()
                    .map(|(&offset, rec)| ItemLayout {
                        key: ItemKey::new(rec.brick, offset),
                        units: rec.units.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn rec(&mut self, file: FileId, key: &ItemKey) -> Result<&mut ItemRec, TreeError> {
        self.items
            .get_mut(&file)
            .and_then(|items| items.get_mut(&key.offset))
            .filter(|rec| rec.brick == key.brick)
            .ok_or(TreeError::Absent)
    }

    /// Splits `units` at block position `pos`, returning the tail.
    fn split_units(units: &mut Vec<ExtentUnit>, pos: u64) -> Vec<ExtentUnit> {
        let mut left = Vec::new();
        let mut tail = Vec::new();
        let mut done = 0u64;
        for unit in units.drain(..) {
            if done >= pos {
                tail.push(unit);
            } else if done + unit.width <= pos {
                done += unit.width;
                left.push(unit);
            } else {
                let left_width = pos - done;
                done += unit.width;
                match unit.state {
                    ExtentState::Allocated { start } => {
                        left.push(ExtentUnit::allocated(start, left_width));
                        tail.push(ExtentUnit::allocated(
                            start + left_width,
                            unit.width - left_width,
                        ));
                    }
                    ExtentState::Unallocated => {
                        left.push(ExtentUnit::unallocated(left_width));
                        tail.push(ExtentUnit::unallocated(unit.width - left_width));
                    }
                }
            }
        }
        *units = left;
        tail
    }

    /// Appends `tail` to `units`, coalescing across the seam.
    fn append_units(units: &mut Vec<ExtentUnit>, tail: Vec<ExtentUnit>) {
        for unit in tail {
            let coalesced = match units.last_mut() {
                Some(last) => match (last.state, unit.state) {
                    (ExtentState::Unallocated, ExtentState::Unallocated) => {
                        last.width += unit.width;
                        true
                    }
                    (ExtentState::Allocated { start }, ExtentState::Allocated { start: next })
                        if start + last.width == next =>
                    {
                        last.width += unit.width;
                        true
                    }
                    _ => false,
                },
                None => false,
            };
            if !coalesced {
                units.push(unit);
            }
        }
    }
}

impl TreeOps for MemTree {
    type Page = MemPage;

    fn file_size(&mut self, file: FileId) -> Result<u64, TreeError> {
        if !self.registered.contains(&file) {
            return Err(TreeError::Absent);
        }
        Ok(self
            .items
            .get(&file)
            .and_then(|items| items.iter().next_back())
            .map(|(&offset, rec)| offset + rec.size_bytes())
            .unwrap_or(0))
    }

    fn files(&mut self) -> Vec<FileId> {
        self.registered.clone()
    }

    fn is_immobile(&mut self, file: FileId) -> bool {
        self.immobile.contains(&file)
    }

    fn set_immobile(&mut self, file: FileId, on: bool) -> Result<(), TreeError> {
        if on {
            self.immobile.insert(file);
        } else {
            self.immobile.remove(&file);
        }
        Ok(())
    }

    fn lookup_item(&mut self, file: FileId, offset: u64) -> Result<ItemLayout, TreeError> {
        self.lookup_calls += 1;
        if let Some(n) = self.vanish_at_lookup {
            if self.lookup_calls >= n {
                self.vanish_at_lookup = None;
                for items in self.items.values_mut() {
                    items.clear();
                }
                return Err(TreeError::Absent);
            }
        }
        let items = self.items.get(&file).ok_or(TreeError::Absent)?;
        let (&base, rec) = items
            .range(..=offset)
            .next_back()
            .ok_or(TreeError::Absent)?;
        if offset >= base + rec.size_bytes() {
            return Err(TreeError::Absent);
        }
        Ok(ItemLayout {
            key: ItemKey::new(rec.brick, base),
            units: rec.units.clone(),
        })
    }

    fn split_item(&mut self, file: FileId, key: &ItemKey, at: u64) -> Result<(), TreeError> {
        let base = key.offset;
        let rec = self.rec(file, key)?;
        assert!(base < at && at < base + rec.size_bytes());
        let brick = rec.brick;
        let tail = Self::split_units(&mut rec.units, (at - base) >> PAGE_BITS);
        self.items
            .get_mut(&file)
            .unwrap()
            .insert(at, ItemRec { brick, units: tail });
        Ok(())
    }

    fn cut_tail(&mut self, file: FileId, key: &ItemKey, from: u64) -> Result<(), TreeError> {
        let base = key.offset;
        let rec = self.rec(file, key)?;
        assert!(base < from && from < base + rec.size_bytes());
        let brick = rec.brick;
        let tail = Self::split_units(&mut rec.units, (from - base) >> PAGE_BITS);
        // The removed range's blocks go to deferred reclamation.
        for unit in tail {
            if let ExtentState::Allocated { start } = unit.state {
                self.reclaimed.push((brick, start, unit.width));
            }
        }
        Ok(())
    }

    fn insert_item(&mut self, file: FileId, key: ItemKey, width: u64) -> Result<(), TreeError> {
        let items = self.items.get_mut(&file).ok_or(TreeError::Absent)?;
        let prev = items.insert(
            key.offset,
            ItemRec {
                brick: key.brick,
                units: vec![ExtentUnit::unallocated(width)],
            },
        );
        assert!(prev.is_none(), "insert over an existing item");
        Ok(())
    }

    fn rehome_item(
        &mut self,
        file: FileId,
        key: &ItemKey,
        new_brick: BrickId,
        width: u64,
    ) -> Result<(), TreeError> {
        let rec = self.rec(file, key)?;
        assert_eq!(rec.width(), width);
        rec.brick = new_brick;
        rec.units = vec![ExtentUnit::unallocated(width)];
        Ok(())
    }

    fn merge_right(&mut self, file: FileId, key: &ItemKey) -> Result<bool, TreeError> {
        let end = {
            let rec = self.rec(file, key)?;
            key.offset + rec.size_bytes()
        };
        let items = self.items.get_mut(&file).unwrap();
        let mergeable = items
            .get(&end)
            .is_some_and(|right| right.brick == key.brick);
        if !mergeable {
            return Ok(false);
        }
        let right = items.remove(&end).unwrap();
        let rec = items.get_mut(&key.offset).unwrap();
        Self::append_units(&mut rec.units, right.units);
        Ok(true)
    }

    fn merge_left(&mut self, file: FileId, key: &ItemKey) -> Result<bool, TreeError> {
        let items = self.items.get_mut(&file).ok_or(TreeError::Absent)?;
        let left = items
            .range(..key.offset)
            .next_back()
            .map(|(&base, rec)| (base, base + rec.size_bytes(), rec.brick));
        match left {
            Some((left_base, left_end, left_brick))
                if left_end == key.offset && left_brick == key.brick =>
            {
                let right = items.remove(&key.offset).unwrap();
                let rec = items.get_mut(&left_base).unwrap();
                Self::append_units(&mut rec.units, right.units);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read_page(&mut self, file: FileId, index: u64) -> Result<Self::Page, TreeError> {
        if self.fail_read_at == Some((file, index)) {
            self.fail_read_at = None;
            return Err(TreeError::Io(format!("read of page {index} failed")));
        }
        self.reads += 1;
        self.pinned += 1;
        Ok(MemPage {
            file,
            index,
            write_prepared: false,
            brick: None,
            block: 0,
        })
    }

    fn unpin(&mut self, page: Self::Page) {
        assert!(!page.write_prepared, "unpinning a write-prepared page");
        self.pinned -= 1;
    }

    fn set_write_prepared(&mut self, page: &mut Self::Page, on: bool) {
        page.write_prepared = on;
    }

    fn assign_block(&mut self, page: &mut Self::Page, brick: BrickId, block: u64) {
        page.brick = Some(brick);
        page.block = block;
    }

    fn commit_dirty(&mut self, page: &mut Self::Page) -> Result<(), TreeError> {
        // A committed block consumes one grabbed unit for good.
        assert!(self.grabbed > 0, "dirtying a block without a reservation");
        self.grabbed -= 1;
        self.dirty
            .push((page.file, page.index, page.brick.expect("block assigned"), page.block));
        Ok(())
    }

    fn grab_space(&mut self, brick: BrickId, blocks: u64) -> Result<(), TreeError> {
        let free = self.free.entry(brick).or_insert(0);
        if *free < blocks {
            return Err(TreeError::NoSpace(brick));
        }
        *free -= blocks;
        self.grabbed += blocks;
        self.grabbed_from = Some(brick);
        Ok(())
    }

    fn release_grabbed(&mut self) {
        if let Some(brick) = self.grabbed_from.take() {
            *self.free.entry(brick).or_insert(0) += self.grabbed;
        }
        self.grabbed = 0;
    }

    fn reserve_iteration(&mut self) -> Result<(), TreeError> {
        self.iter_reserves += 1;
        Ok(())
    }

    fn fake_block(&mut self, brick: BrickId, count: u64) -> u64 {
        let next = self.fake_next.entry(brick).or_insert(1_000_000);
        let first = *next;
        *next += count;
        first
    }

    fn dealloc_deferred(&mut self, brick: BrickId, start: u64, width: u64) {
        self.reclaimed.push((brick, start, width));
    }
}
