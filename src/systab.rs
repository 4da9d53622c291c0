use {
    crate::{
        bucket::{Bucket, BucketSet, BrickId},
        error::{VolumeError, VolumeResult},
    },
    std::fmt,
};

/// Smallest supported table-size exponent.
pub const MIN_SEG_BITS: u32 = 10;

/// Largest supported table-size exponent.
pub const MAX_SHIFT: u32 = 31;

/// The system table: one entry per hash-space segment, holding the external
/// id of the brick that owns the segment.
///
/// The table length is always a power of two (`1 << seg_bits`) and only ever
/// grows. This is the persisted, lookup-facing artifact of the distribution
/// engine; fibers and weights are recoverable from it by counting.
#[derive(Clone, PartialEq, Eq)]
pub struct SystemTable {
    seg_bits: u32,
    slots: Vec<BrickId>,
}

impl fmt::Debug for SystemTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemTable")
            .field("seg_bits", &self.seg_bits)
            .field("segments", &self.slots.len())
            .finish()
    }
}

impl SystemTable {
    /// Creates a table with every segment owned by `owner`.
    ///
    /// This is the first-time initialization path for a single-brick volume.
    pub fn filled(seg_bits: u32, owner: BrickId) -> VolumeResult<Self> {
        check_seg_bits(seg_bits)?;
        let nums = 1usize << seg_bits;
        let mut slots = Vec::new();
        slots.try_reserve_exact(nums)?;
        slots.resize(nums, owner);
        Ok(Self { seg_bits, slots })
    }

    /// Builds a table from a weight vector: `weights[0]` segments for the
    /// bucket at dense index 0, then `weights[1]` for index 1, and so on.
    ///
    /// Deterministic; used for from-scratch initialization. The weights must
    /// sum to `1 << seg_bits`.
    pub fn from_weights<B: Bucket>(
        seg_bits: u32,
        weights: &[u64],
        set: &BucketSet<B>,
    ) -> VolumeResult<Self> {
        check_seg_bits(seg_bits)?;
        let nums = 1u64 << seg_bits;
        if weights.len() != set.len() {
            return Err(VolumeError::InvalidConfig("weight vector length mismatch"));
        }
        if weights.iter().sum::<u64>() != nums {
            return Err(VolumeError::InvalidConfig("weights do not cover the table"));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(nums as usize)?;
        for (idx, &w) in weights.iter().enumerate() {
            let id = set.id_of_index(idx);
            for _ in 0..w {
                slots.push(id);
            }
        }
        Ok(Self { seg_bits, slots })
    }

    /// Assembles a table from raw parts. Used by the rebalancer when a grown
    /// table is built segment by segment.
    pub(crate) fn from_parts(seg_bits: u32, slots: Vec<BrickId>) -> Self {
        debug_assert_eq!(slots.len(), 1usize << seg_bits);
        Self { seg_bits, slots }
    }

    pub fn seg_bits(&self) -> u32 {
        self.seg_bits
    }

    /// Number of segments in the table.
    pub fn num_segments(&self) -> usize {
        self.slots.len()
    }

    /// Owner of segment `seg`.
    pub fn owner(&self, seg: u32) -> BrickId {
        self.slots[seg as usize]
    }

    pub(crate) fn set_owner(&mut self, seg: u32, id: BrickId) {
        self.slots[seg as usize] = id;
    }

    pub(crate) fn slots(&self) -> &[BrickId] {
        &self.slots
    }

    /// Fallible clone: the rebalancer works on a private copy and publishes
    /// it only on full success.
    pub fn try_clone(&self) -> VolumeResult<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(self.slots.len())?;
        slots.extend_from_slice(&self.slots);
        Ok(Self {
            seg_bits: self.seg_bits,
            slots,
        })
    }

    /// Inverts the table into per-bucket fibers by one linear scan.
    ///
    /// Fiber `i` collects, in ascending order, every segment owned by the
    /// bucket at dense index `i`. Returns `InvalidConfig` if the table
    /// references an id that is not in `set`.
    pub fn fibers<B: Bucket>(&self, set: &BucketSet<B>) -> VolumeResult<Vec<Vec<u32>>> {
        let mut fibers: Vec<Vec<u32>> = Vec::new();
        fibers.try_reserve_exact(set.len())?;
        fibers.resize_with(set.len(), Vec::new);
        for (seg, &id) in self.slots.iter().enumerate() {
            let idx = set
                .index_of_id(id)
                .ok_or(VolumeError::InvalidConfig("table references unknown brick"))?;
            fibers[idx].push(seg as u32);
        }
        Ok(fibers)
    }

    /// Per-bucket segment counts; the weight vector implied by the table.
    pub fn weights_of<B: Bucket>(&self, set: &BucketSet<B>) -> VolumeResult<Vec<u64>> {
        let fibers = self.fibers(set)?;
        Ok(fibers.iter().map(|f| f.len() as u64).collect())
    }

    /// Serializes `count` entries starting at segment `src_off` as
    /// fixed-width little-endian ids.
    ///
    /// Partial ranges let large tables be persisted incrementally without
    /// materializing the whole array.
    pub fn pack(&self, src_off: usize, count: usize) -> VolumeResult<Vec<u8>> {
        let end = src_off
            .checked_add(count)
            .filter(|&e| e <= self.slots.len())
            .ok_or(VolumeError::InvalidConfig("pack range out of bounds"))?;
        let mut out = Vec::new();
        out.try_reserve_exact(count * 4)?;
        for &id in &self.slots[src_off..end] {
            out.extend_from_slice(&id.to_le_bytes());
        }
        Ok(out)
    }

    /// Deserializes `count` entries from `bytes` into the table starting at
    /// segment `dst_off`. Inverse of [`pack`](Self::pack).
    pub fn unpack(&mut self, bytes: &[u8], dst_off: usize, count: usize) -> VolumeResult<()> {
        let end = dst_off
            .checked_add(count)
            .filter(|&e| e <= self.slots.len())
            .ok_or(VolumeError::InvalidConfig("unpack range out of bounds"))?;
        if bytes.len() < count * 4 {
            return Err(VolumeError::InvalidConfig("unpack source too short"));
        }
        for (slot, chunk) in self.slots[dst_off..end].iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = BrickId::from_le_bytes(chunk.try_into().expect("chunk of 4"));
        }
        Ok(())
    }

    /// Checks that every entry references an active brick.
    pub fn validate<B: Bucket>(&self, set: &BucketSet<B>) -> VolumeResult<()> {
        for &id in &self.slots {
            if set.index_of_id(id).is_none() {
                return Err(VolumeError::InvalidConfig("table references unknown brick"));
            }
        }
        Ok(())
    }
}

pub(crate) fn check_seg_bits(seg_bits: u32) -> VolumeResult<()> {
    if !(MIN_SEG_BITS..=MAX_SHIFT).contains(&seg_bits) {
        return Err(VolumeError::InvalidConfig("table-size exponent out of range"));
    }
    Ok(())
}
