//! Extent migration: walks a file's items right to left, deciding per item
//! whether to skip, split or migrate it against the current distribution,
//! and carries the physical moves out through the tree collaborator.

mod decision;
mod executor;

use log::warn;

use crate::{
    bucket::BrickId,
    distribution::Distribution,
    error::VolumeResult,
    extent::{ItemKey, ItemLayout},
    tree::{FileId, TreeError, TreeOps},
};

/// Maximum pages relocated in one migration chunk. Bounds pinned memory
/// and the size of a single space reservation.
pub const MIGRATION_GRANULARITY: u64 = 8192;

/// How items are matched against the distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigratePolicy {
    /// An item is atomically all-skip or all-migrate, judged by its base
    /// offset. Cheap coarse placement.
    WholeItem,
    /// The item's stripe-aligned offsets are scanned backward for the exact
    /// boundary where the target brick changes, so only the truly misplaced
    /// part moves.
    Striped,
}

/// Result of one `migrate_file` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// The whole file is placed correctly; `done_off` is the leftmost
    /// processed offset (zero unless the walk ended early and benignly).
    Done { done_off: u64 },
    /// The per-call block budget was exhausted; call again to continue
    /// from `done_off`. Lets the caller commit between bounded chunks.
    Repeat { done_off: u64 },
}

/// Placement oracle: file offset to target brick, at stripe granularity.
pub trait Placement {
    /// Stripe size exponent at which ownership decisions are made.
    fn stripe_bits(&self) -> u32;

    /// Target brick for the byte at `off` in `file`.
    fn target(&self, file: FileId, off: u64) -> BrickId;
}

/// The distribution-backed oracle: hashes `(file, stripe index)` through
/// the published system table.
pub struct TablePlacement<'a> {
    dist: &'a Distribution,
    seed: u32,
    stripe_bits: u32,
}

impl<'a> TablePlacement<'a> {
    pub fn new(dist: &'a Distribution, seed: u32, stripe_bits: u32) -> Self {
        Self {
            dist,
            seed,
            stripe_bits,
        }
    }
}

impl Placement for TablePlacement<'_> {
    fn stripe_bits(&self) -> u32 {
        self.stripe_bits
    }

    fn target(&self, file: FileId, off: u64) -> BrickId {
        let stripe = off >> self.stripe_bits;
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&file.to_le_bytes());
        key[8..].copy_from_slice(&stripe.to_le_bytes());
        self.dist.lookup(&key, self.seed)
    }
}

/// Migration primitive chosen for the current item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MigrateAction {
    Migrate,
    Split,
    Skip,
}

/// Why a per-item run returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunStop {
    /// Skip, whole-item migration, or benign absence.
    Finished,
    /// The block budget ran out with work remaining.
    Budget,
}

/// State for one in-flight item migration. Created per item, never
/// persisted; the cursor fields survive across chunks of the same run.
pub(crate) struct MigrateContext<'t, T: TreeOps> {
    tree: &'t mut T,
    file: FileId,
    key: ItemKey,
    layout: ItemLayout,
    explicit_dst: Option<BrickId>,
    act: Option<MigrateAction>,
    new_loc: BrickId,
    /// Leftmost byte to be touched in this iteration.
    stop_off: u64,
    /// Leftmost byte already processed.
    done_off: u64,
    blocks_migrated: u64,
    /// Split position, in blocks, within the unit containing `stop_off`.
    unit_split_pos: u64,
    migrate_whole_item: bool,
    stop: bool,
    budget: u64,
}

impl<'t, T: TreeOps> MigrateContext<'t, T> {
    fn new(
        tree: &'t mut T,
        file: FileId,
        layout: ItemLayout,
        explicit_dst: Option<BrickId>,
        budget: u64,
    ) -> Self {
        let key = layout.key;
        Self {
            tree,
            file,
            key,
            layout,
            explicit_dst,
            act: None,
            new_loc: 0,
            stop_off: key.offset,
            done_off: key.offset,
            blocks_migrated: 0,
            unit_split_pos: 0,
            migrate_whole_item: false,
            stop: false,
            budget,
        }
    }

    fn reset(&mut self) {
        self.act = None;
        self.stop = false;
        self.unit_split_pos = 0;
        self.migrate_whole_item = false;
    }

    /// Drives the skip/split/migrate loop from the current item leftward
    /// until it finishes or exhausts the budget.
    fn run<P: Placement>(&mut self, place: &P, policy: MigratePolicy) -> VolumeResult<RunStop> {
        loop {
            // Structural edits of the previous iteration may have moved or
            // merged the item; always re-validate from a fresh lookup.
            match self.tree.lookup_item(self.file, self.key.offset) {
                Ok(layout) => {
                    self.key = layout.key;
                    self.layout = layout;
                }
                Err(TreeError::Absent) => {
                    warn!("item at {} vanished before migration", self.key.offset);
                    self.done_off = self.key.offset;
                    return Ok(RunStop::Finished);
                }
                Err(err) => return Err(err.into()),
            }
            self.decide(place, policy);

            match self.act.expect("decision always picks an action") {
                MigrateAction::Skip => {
                    self.tree.merge_right(self.file, &self.key)?;
                    self.done_off = self.stop_off;
                    return Ok(RunStop::Finished);
                }
                MigrateAction::Split => {
                    self.split_chunk()?;
                }
                MigrateAction::Migrate => {
                    self.migrate_chunk()?;
                    if self.stop {
                        return Ok(RunStop::Finished);
                    }
                    if self.blocks_migrated >= self.budget {
                        return Ok(RunStop::Budget);
                    }
                }
            }
        }
    }
}

/// Migrates one file's extents to wherever the distribution (or the
/// explicit destination `dst`) places them.
///
/// Items are visited right to left. At most `budget` blocks move per call;
/// when the budget runs out the function returns [`MigrateOutcome::Repeat`]
/// so the caller can commit the transaction and re-drive. Items that vanish
/// concurrently (e.g. a racing truncate) terminate the walk successfully.
pub fn migrate_file<T: TreeOps, P: Placement>(
    tree: &mut T,
    place: &P,
    file: FileId,
    dst: Option<BrickId>,
    policy: MigratePolicy,
    budget: u64,
) -> VolumeResult<MigrateOutcome> {
    let size = match tree.file_size(file) {
        Ok(size) => size,
        Err(TreeError::Absent) => return Ok(MigrateOutcome::Done { done_off: 0 }),
        Err(err) => return Err(err.into()),
    };

    let mut pos = size;
    let mut migrated = 0u64;
    while pos > 0 {
        let layout = match tree.lookup_item(file, pos - 1) {
            Ok(layout) => layout,
            Err(TreeError::Absent) => {
                // Concurrent removal; the rest of the range is gone.
                warn!("item below {pos} vanished during migration of file {file}");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let mut ctx = MigrateContext::new(tree, file, layout, dst, budget - migrated);
        let stopped = ctx.run(place, policy)?;
        let done_off = ctx.done_off;
        migrated += ctx.blocks_migrated;

        debug_assert!(done_off < pos);
        pos = done_off;

        if pos > 0 && (stopped == RunStop::Budget || migrated >= budget) {
            return Ok(MigrateOutcome::Repeat { done_off: pos });
        }
    }
    Ok(MigrateOutcome::Done { done_off: pos })
}
