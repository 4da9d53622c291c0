use crate::bucket::BrickId;

/// Blocks and pages are the same size for the migration engine.
pub const PAGE_BITS: u32 = 12;

/// Page (and block) size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Key of an extent item: the owning brick (the key's ordering component)
/// plus the byte offset of the item's first block within the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemKey {
    pub brick: BrickId,
    pub offset: u64,
}

impl ItemKey {
    pub fn new(brick: BrickId, offset: u64) -> Self {
        Self { brick, offset }
    }
}

/// Allocation state of one extent unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentState {
    /// Backed by a run of blocks starting at `start` on the owning brick.
    Allocated { start: u64 },
    /// Blocks to be assigned at flush time.
    Unallocated,
}

/// A contiguous run of blocks inside an extent item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentUnit {
    pub state: ExtentState,
    /// Width in blocks.
    pub width: u64,
}

impl ExtentUnit {
    pub fn allocated(start: u64, width: u64) -> Self {
        Self {
            state: ExtentState::Allocated { start },
            width,
        }
    }

    pub fn unallocated(width: u64) -> Self {
        Self {
            state: ExtentState::Unallocated,
            width,
        }
    }
}

/// Snapshot of one extent item as the migration engine sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemLayout {
    pub key: ItemKey,
    pub units: Vec<ExtentUnit>,
}

impl ItemLayout {
    pub fn width_blocks(&self) -> u64 {
        self.units.iter().map(|u| u.width).sum()
    }

    pub fn size_bytes(&self) -> u64 {
        self.width_blocks() << PAGE_BITS
    }

    /// Offset of the first byte past the item.
    pub fn end_offset(&self) -> u64 {
        self.key.offset + self.size_bytes()
    }

    /// The unit containing byte offset `off`, with the unit's own byte
    /// offset. `None` when `off` falls outside the item.
    pub fn unit_at(&self, off: u64) -> Option<(usize, u64)> {
        if off < self.key.offset {
            return None;
        }
        let mut start = self.key.offset;
        for (idx, unit) in self.units.iter().enumerate() {
            let end = start + (unit.width << PAGE_BITS);
            if off < end {
                return Some((idx, start));
            }
            start = end;
        }
        None
    }
}

/// Rounds `off` down to the stripe boundary.
pub fn stripe_floor(off: u64, stripe_bits: u32) -> u64 {
    off & !((1u64 << stripe_bits) - 1)
}
