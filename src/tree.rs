//! Capability interface of the tree/storage collaborator.
//!
//! The migration engine never touches tree nodes, the page cache or the
//! transaction manager directly; it drives them through [`TreeOps`] and
//! depends only on the success/error contract below. Error classes matter:
//! [`TreeError::Absent`] is the benign "concurrently removed" outcome that
//! migration treats as successful completion, everything else aborts the
//! operation.

use crate::{
    bucket::BrickId,
    error::VolumeError,
    extent::{ItemKey, ItemLayout},
};

/// Identity of a file whose extents are being migrated.
pub type FileId = u64;

/// Error contract of the tree/storage collaborator.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// The looked-up item (or file) does not exist. Benign during
    /// migration when caused by a concurrent removal.
    #[error("item absent")]
    Absent,

    /// No free blocks left on the brick for a reservation.
    #[error("out of space on brick {0}")]
    NoSpace(BrickId),

    /// The tree is structurally damaged; fatal for the current operation.
    #[error("storage corruption: {0}")]
    Corrupted(String),

    /// A page read or other I/O failed.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<TreeError> for VolumeError {
    fn from(err: TreeError) -> Self {
        match err {
            // An absence that was not handled as benign by the caller is a
            // broken invariant.
            TreeError::Absent => VolumeError::Structural("item vanished mid-operation".into()),
            TreeError::NoSpace(brick) => VolumeError::OutOfSpace(brick),
            TreeError::Corrupted(msg) => VolumeError::Structural(msg),
            TreeError::Io(msg) => VolumeError::Io(msg),
        }
    }
}

/// Operations the migration engine requires from the tree, the page cache,
/// the space accountant and the transaction manager.
///
/// Structural edits may block and may shift items between nodes; the engine
/// therefore never holds a position across them and re-validates with a
/// fresh [`lookup_item`](Self::lookup_item) afterwards.
pub trait TreeOps {
    /// Pinned page handle. Exclusively owned by the migration step from
    /// read to unpin; nothing else may evict or reuse it in between.
    type Page;

    // --- files ---

    /// Size of the file in bytes, `Absent` if the file is gone.
    fn file_size(&mut self, file: FileId) -> Result<u64, TreeError>;

    /// Files currently known to the tree, for volume-wide balancing.
    fn files(&mut self) -> Vec<FileId>;

    /// Whether the file is exempt from migration.
    fn is_immobile(&mut self, file: FileId) -> bool;

    /// Toggles the exemption; persists it in the file's metadata (may fail
    /// with `NoSpace` when the metadata update cannot be reserved).
    fn set_immobile(&mut self, file: FileId, on: bool) -> Result<(), TreeError>;

    // --- items ---

    /// Finds the extent item whose byte range contains `offset`.
    fn lookup_item(&mut self, file: FileId, offset: u64) -> Result<ItemLayout, TreeError>;

    /// Splits the item at byte offset `at` into two items on the same
    /// brick: `[base, at)` and `[at, end)`. No data moves.
    fn split_item(&mut self, file: FileId, key: &ItemKey, at: u64) -> Result<(), TreeError>;

    /// Cuts `[from, end)` off the item, deferring reclamation of any
    /// allocated blocks the removed range referenced.
    fn cut_tail(&mut self, file: FileId, key: &ItemKey, from: u64) -> Result<(), TreeError>;

    /// Inserts a fresh item of `width` unallocated blocks at `key`.
    fn insert_item(&mut self, file: FileId, key: ItemKey, width: u64) -> Result<(), TreeError>;

    /// Rewrites the item as a single unallocated unit of `width` blocks
    /// owned by `new_brick`, updating the item key's ordering component.
    fn rehome_item(
        &mut self,
        file: FileId,
        key: &ItemKey,
        new_brick: BrickId,
        width: u64,
    ) -> Result<(), TreeError>;

    /// Coalesces the item with its right neighbor when both sit on the same
    /// brick and are byte-contiguous. Returns whether a merge happened.
    fn merge_right(&mut self, file: FileId, key: &ItemKey) -> Result<bool, TreeError>;

    /// Left-neighbor counterpart of [`merge_right`](Self::merge_right).
    fn merge_left(&mut self, file: FileId, key: &ItemKey) -> Result<bool, TreeError>;

    // --- pages ---

    /// Reads and pins the page at `index` (in page-size units from the
    /// start of the file).
    fn read_page(&mut self, file: FileId, index: u64) -> Result<Self::Page, TreeError>;

    /// Releases a pin taken by [`read_page`](Self::read_page).
    fn unpin(&mut self, page: Self::Page);

    /// Blocks or unblocks racing flushes of the page's backing block.
    fn set_write_prepared(&mut self, page: &mut Self::Page, on: bool);

    /// Points the page's block descriptor at a block on another brick.
    fn assign_block(&mut self, page: &mut Self::Page, brick: BrickId, block: u64);

    /// Marks the page dirty and hands it to the transaction manager; the
    /// block gets its real placement at flush time.
    fn commit_dirty(&mut self, page: &mut Self::Page) -> Result<(), TreeError>;

    // --- space accounting ---

    /// Reserves `blocks` on `brick` ahead of a migration chunk. Fails with
    /// `NoSpace` as a normal, recoverable outcome.
    fn grab_space(&mut self, brick: BrickId, blocks: u64) -> Result<(), TreeError>;

    /// Returns everything still reserved by the current iteration.
    fn release_grabbed(&mut self);

    /// Reserves the small fixed amount of metadata space one
    /// migrate-and-split iteration needs, drawn from the reserved area so
    /// rebalancing works on a volume with no free space.
    fn reserve_iteration(&mut self) -> Result<(), TreeError>;

    /// Next `count` logical block numbers on `brick`, from the per-brick
    /// monotone counter used until real placement at flush time. Returns
    /// the first number of the run.
    fn fake_block(&mut self, brick: BrickId, count: u64) -> u64;

    /// Queues a block run for deferred reclamation, safe to complete past
    /// the current transaction boundary.
    fn dealloc_deferred(&mut self, brick: BrickId, start: u64, width: u64);
}
