use {
    log::{debug, warn},
    parking_lot::RwLock,
    std::sync::Arc,
};

use crate::{
    bucket::{Bucket, BucketSet, BrickId},
    calibrate::{calibrate, calibrate_occupancy},
    error::{VolumeError, VolumeResult},
    hash::segment_of,
    rebalance::{rebalance_grow, rebalance_insert, rebalance_remove},
    systab::{MAX_SHIFT, SystemTable, check_seg_bits},
};

struct State {
    seg_bits: u32,
    table: Arc<SystemTable>,
    weights: Arc<Vec<u64>>,
}

/// Per-volume distribution context.
///
/// Holds the published system table, weight vector and table-size exponent.
/// Lookups take the read side only and always observe either the fully-old
/// or the fully-new table: every rebalance is built into a private clone and
/// installed with a single swap on the write side. On any failure the clone
/// is dropped and the published state stays authoritative.
pub struct Distribution {
    state: RwLock<State>,
}

impl Distribution {
    /// Creates the context at volume activation.
    ///
    /// With `table` present (loaded from disk) the weight vector is
    /// recovered by counting segments per brick; a fresh table is laid out
    /// deterministically from the calibrated weights. Either way the bucket
    /// set's fibers are (re)built from the final table.
    pub fn init<B: Bucket>(
        set: &mut BucketSet<B>,
        seg_bits: u32,
        table: Option<SystemTable>,
    ) -> VolumeResult<Self> {
        check_seg_bits(seg_bits)?;
        let nums = 1u64 << seg_bits;
        if set.is_empty() {
            return Err(VolumeError::InvalidConfig("no active bricks"));
        }
        if set.len() as u64 >= nums {
            return Err(VolumeError::InvalidConfig("more bricks than segments"));
        }

        let calibrated = calibrate(&set.capacities(), nums)?;
        let (table, weights) = match table {
            Some(table) => {
                if table.seg_bits() != seg_bits {
                    return Err(VolumeError::InvalidConfig("table-size exponent mismatch"));
                }
                table.validate(set)?;
                let counted = table.weights_of(set)?;
                if counted != calibrated {
                    // Capacities may have been adjusted while the volume was
                    // offline; the persisted placement stays authoritative
                    // until the next rebalance.
                    warn!("loaded table disagrees with calibrated weights");
                }
                (table, counted)
            }
            None => {
                let table = SystemTable::from_weights(seg_bits, &calibrated, set)?;
                (table, calibrated)
            }
        };
        set.replace_fibers(table.fibers(set)?);

        Ok(Self {
            state: RwLock::new(State {
                seg_bits,
                table: Arc::new(table),
                weights: Arc::new(weights),
            }),
        })
    }

    /// Resolves a key to the brick owning its hash segment.
    ///
    /// Read-only and allocation-free; never blocked by an in-flight
    /// rebalance for longer than the publish swap itself.
    pub fn lookup(&self, key: &[u8], seed: u32) -> BrickId {
        let state = self.state.read();
        state.table.owner(segment_of(key, seed, state.seg_bits))
    }

    pub fn seg_bits(&self) -> u32 {
        self.state.read().seg_bits
    }

    pub fn num_segments(&self) -> usize {
        self.state.read().table.num_segments()
    }

    /// Snapshot of the published table, e.g. for incremental persistence.
    pub fn table(&self) -> Arc<SystemTable> {
        Arc::clone(&self.state.read().table)
    }

    /// Snapshot of the published weight vector.
    pub fn weights(&self) -> Arc<Vec<u64>> {
        Arc::clone(&self.state.read().weights)
    }

    /// Rebalances after a bucket was inserted at `target_pos` (`added`) or
    /// had its capacity raised (`!added`). The set must already reflect the
    /// new configuration; fibers still describe the old ownership.
    pub fn insert_bucket<B: Bucket>(
        &self,
        set: &mut BucketSet<B>,
        target_pos: usize,
        added: bool,
    ) -> VolumeResult<()> {
        let (old_bits, old_weights, old_table) = {
            let state = self.state.read();
            (state.seg_bits, Arc::clone(&state.weights), Arc::clone(&state.table))
        };
        let nums = 1u64 << old_bits;
        if set.len() as u64 > nums || set.len() > (1usize << MAX_SHIFT) {
            return Err(VolumeError::InvalidConfig("bucket limit reached"));
        }

        let new_weights = calibrate(&set.capacities(), nums)?;
        let mut next = old_table.try_clone()?;
        rebalance_insert(&mut next, set, &old_weights, &new_weights, target_pos, added)?;

        self.publish(set, old_bits, next, new_weights)
    }

    /// Rebalances after the bucket formerly at `target_pos` was detached
    /// (`victim` carries its fiber and id), or ahead of a capacity cut of
    /// the bucket at `target_pos` (`victim == None`).
    ///
    /// `occupied` is the total space occupied across the volume, victim
    /// included; the capacity pre-flight (rejecting the operation if any
    /// surviving brick would overflow) runs before any mutation.
    pub fn remove_bucket<B: Bucket>(
        &self,
        set: &mut BucketSet<B>,
        victim: Option<(&[u32], BrickId)>,
        target_pos: usize,
        occupied: u64,
    ) -> VolumeResult<()> {
        check_capacity(set, occupied)?;

        let (old_bits, old_weights, old_table) = {
            let state = self.state.read();
            (state.seg_bits, Arc::clone(&state.weights), Arc::clone(&state.table))
        };
        let new_weights = calibrate(&set.capacities(), 1u64 << old_bits)?;
        let mut next = old_table.try_clone()?;
        rebalance_remove(&mut next, set, victim, &old_weights, &new_weights, target_pos)?;

        self.publish(set, old_bits, next, new_weights)
    }

    /// Grows the table by a factor of `1 << fact_bits`, preserving every
    /// placement except the documented rounding drift.
    pub fn grow<B: Bucket>(
        &self,
        set: &mut BucketSet<B>,
        fact_bits: u32,
        occupied: u64,
    ) -> VolumeResult<()> {
        check_capacity(set, occupied)?;

        let (old_bits, old_weights, old_table) = {
            let state = self.state.read();
            (state.seg_bits, Arc::clone(&state.weights), Arc::clone(&state.table))
        };
        if old_bits + fact_bits > MAX_SHIFT {
            return Err(VolumeError::InvalidConfig("table-size exponent out of range"));
        }
        let new_weights = calibrate(&set.capacities(), 1u64 << (old_bits + fact_bits))?;
        let next = rebalance_grow(&old_table, set, &old_weights, &new_weights, fact_bits)?;

        let new_bits = next.seg_bits();
        self.publish(set, new_bits, next, new_weights)
    }

    /// Installs a fully built configuration: fibers first (invisible to
    /// lookups), then the table and weights in one write-side swap.
    fn publish<B: Bucket>(
        &self,
        set: &mut BucketSet<B>,
        seg_bits: u32,
        table: SystemTable,
        weights: Vec<u64>,
    ) -> VolumeResult<()> {
        let fibers = table.fibers(set)?;
        debug_assert!(
            fibers
                .iter()
                .zip(&weights)
                .all(|(fiber, &w)| fiber.len() as u64 == w)
        );
        set.replace_fibers(fibers);

        let mut state = self.state.write();
        state.seg_bits = seg_bits;
        state.table = Arc::new(table);
        state.weights = Arc::new(weights);
        Ok(())
    }
}

/// Pre-flight capacity check for remove/resize/scale operations.
///
/// Projects each brick's occupancy after the operation by apportioning the
/// volume's occupied space over the surviving capacities, and rejects the
/// operation if any brick would exceed its capacity. Performs no mutation.
pub fn check_capacity<B: Bucket>(set: &BucketSet<B>, occupied: u64) -> VolumeResult<()> {
    let caps = set.capacities();
    let projected = calibrate_occupancy(&caps, occupied)?;
    for (idx, (&capacity, &required)) in caps.iter().zip(&projected).enumerate() {
        debug!(
            "brick {}: capacity {capacity}, projected occupancy {required}",
            set.id_of_index(idx)
        );
        if capacity < required {
            return Err(VolumeError::InsufficientCapacity {
                brick: set.id_of_index(idx),
                capacity,
                required,
            });
        }
    }
    Ok(())
}
