//! Incremental rebalancing of the system table.
//!
//! All three transforms work on a private clone of the live table and the
//! current fibers, and move the minimal set of segments: a donor bucket
//! always gives up segments from the tail of its fiber, so the selection is
//! deterministic and reproducible. Publishing the result is the caller's
//! concern; nothing here touches live state.

use crate::{
    bucket::{Bucket, BucketSet, BrickId},
    error::{VolumeError, VolumeResult},
    systab::{MAX_SHIFT, SystemTable},
};

fn try_buffer(len: usize) -> VolumeResult<Vec<u64>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Re-homes segments onto the bucket at `target_pos` after it was inserted
/// (`added == true`) or had its capacity raised (`added == false`).
///
/// Every bucket left of `target_pos` donates `old - new` of its segments,
/// taken from the tail of its fiber; buckets right of it donate against
/// their pre-insertion weight. No segment is ever assigned to any bucket
/// other than its prior owner or the target.
pub(crate) fn rebalance_insert<B: Bucket>(
    tab: &mut SystemTable,
    set: &BucketSet<B>,
    old_weights: &[u64],
    new_weights: &[u64],
    target_pos: usize,
    added: bool,
) -> VolumeResult<()> {
    let numb = new_weights.len();
    debug_assert_eq!(numb, set.len());
    debug_assert_eq!(old_weights.len(), if added { numb - 1 } else { numb });

    let mut exc = try_buffer(numb)?;
    for i in 0..numb {
        if i == target_pos {
            continue;
        }
        let old = if added && i > target_pos {
            old_weights[i - 1]
        } else {
            old_weights[i]
        };
        debug_assert!(old >= new_weights[i]);
        exc[i] = old.saturating_sub(new_weights[i]);
    }

    let target_id = set.id_of_index(target_pos);
    for i in 0..numb {
        let fiber = set.fiber(i);
        for j in 0..exc[i] {
            let seg = fiber[(new_weights[i] + j) as usize];
            debug_assert_eq!(tab.owner(seg), set.id_of_index(i));
            tab.set_owner(seg, target_id);
        }
    }
    Ok(())
}

/// Distributes a departing bucket's segments over the survivors.
///
/// With `victim` present, its fiber is the sole source and receivers draw
/// from it in dense-index order; segments owned by anyone else never move.
/// With `victim` absent this handles a capacity cut of the bucket at
/// `target_pos`: the shortfall is drawn from the tail of its own fiber.
///
/// The caller must have verified capacity beforehand; this function does
/// not re-check it.
pub(crate) fn rebalance_remove<B: Bucket>(
    tab: &mut SystemTable,
    set: &BucketSet<B>,
    victim: Option<(&[u32], BrickId)>,
    old_weights: &[u64],
    new_weights: &[u64],
    target_pos: usize,
) -> VolumeResult<()> {
    let numb = new_weights.len();
    debug_assert_eq!(numb, set.len());
    debug_assert_eq!(
        old_weights.len(),
        if victim.is_some() { numb + 1 } else { numb }
    );

    let mut sho = try_buffer(numb)?;
    for i in 0..numb {
        let old = if victim.is_some() && i >= target_pos {
            old_weights[i + 1]
        } else {
            old_weights[i]
        };
        debug_assert!((victim.is_none() && i == target_pos) || new_weights[i] >= old);
        sho[i] = new_weights[i].saturating_sub(old);
    }

    let (source, source_id, mut off) = match victim {
        Some((fiber, id)) => (fiber, id, 0usize),
        // Capacity cut: the target donates its own fiber tail.
        None => (
            set.fiber(target_pos),
            set.id_of_index(target_pos),
            new_weights[target_pos] as usize,
        ),
    };

    for i in 0..numb {
        let id = set.id_of_index(i);
        for _ in 0..sho[i] {
            let seg = source[off];
            debug_assert_eq!(tab.owner(seg), source_id);
            tab.set_owner(seg, id);
            off += 1;
        }
    }
    debug_assert_eq!(off, source.len());
    Ok(())
}

/// Grows the table by a factor of `1 << fact_bits`.
///
/// Each old segment's ownership is first replicated across its `2^k`
/// children, which preserves every placement exactly. Capacity rounding
/// drifts under the larger total, so buckets whose replicated weight
/// exceeds the recalibrated one donate exactly the excess from their fiber
/// tails, and buckets in shortfall receive in dense-index order. Data
/// movement is bounded by the rounding drift, not by the table growth.
pub(crate) fn rebalance_grow<B: Bucket>(
    tab: &SystemTable,
    set: &BucketSet<B>,
    old_weights: &[u64],
    new_weights: &[u64],
    fact_bits: u32,
) -> VolumeResult<SystemTable> {
    let numb = new_weights.len();
    debug_assert_eq!(numb, old_weights.len());

    let new_bits = tab.seg_bits() + fact_bits;
    if new_bits > MAX_SHIFT {
        return Err(VolumeError::InvalidConfig("table-size exponent out of range"));
    }
    let factor = 1u64 << fact_bits;

    // Stretch: replicate each segment's owner across its children.
    let mut slots: Vec<BrickId> = Vec::new();
    slots.try_reserve_exact(tab.num_segments() << fact_bits)?;
    for &id in tab.slots() {
        for _ in 0..factor {
            slots.push(id);
        }
    }
    let mut grown = SystemTable::from_parts(new_bits, slots);

    let mut exc = try_buffer(numb)?;
    let mut sho = try_buffer(numb)?;
    let mut num_reloc = 0u64;
    for i in 0..numb {
        let scaled = old_weights[i] * factor;
        exc[i] = scaled.saturating_sub(new_weights[i]);
        sho[i] = new_weights[i].saturating_sub(scaled);
        num_reloc += exc[i];
    }
    debug_assert_eq!(num_reloc, sho.iter().sum::<u64>());

    if num_reloc == 0 {
        // Replication alone matches the recalibrated weights.
        return Ok(grown);
    }

    // Fibers of the stretched, still-disbalanced table.
    let fibers = grown.fibers(set)?;

    let mut reloc: Vec<u32> = Vec::new();
    reloc.try_reserve_exact(num_reloc as usize)?;
    for i in 0..numb {
        for j in 0..exc[i] {
            reloc.push(fibers[i][(new_weights[i] + j) as usize]);
        }
    }

    let mut k = 0usize;
    for i in 0..numb {
        let id = set.id_of_index(i);
        for _ in 0..sho[i] {
            grown.set_owner(reloc[k], id);
            k += 1;
        }
    }
    debug_assert_eq!(k, reloc.len());
    Ok(grown)
}
