//! Data placement and rebalancing for multi-brick storage volumes.
//!
//! The crate has two tightly coupled halves:
//!
//! * the **distribution engine** — a flat table mapping hash-space segments
//!   to bricks in proportion to their capacities, updated incrementally
//!   when a brick is added, removed or resized, or when the table grows,
//!   always moving the minimal set of segments;
//! * the **extent migration engine** — walks a file's extent items against
//!   the current table, decides per item whether to skip, split or migrate
//!   it, and relocates the affected blocks through the embedding storage
//!   stack's capability interface.
//!
//! A [`Volume`] ties both together: structural operations are serialized by
//! a non-blocking busy flag, while key lookups stay wait-free against the
//! atomically published table.
//!
//! ```
//! use brickspace::{Bucket, BrickId, VolumeBuilder};
//!
//! struct Brick {
//!     id: BrickId,
//!     capacity: u64,
//! }
//!
//! impl Bucket for Brick {
//!     fn id(&self) -> BrickId {
//!         self.id
//!     }
//!
//!     fn capacity(&self) -> u64 {
//!         self.capacity
//!     }
//!
//!     fn space_occupied(&self) -> u64 {
//!         0
//!     }
//! }
//!
//! let bricks = (0..4).map(|id| Brick { id, capacity: 100 });
//! let volume = VolumeBuilder::new(bricks).with_seed(7).build().unwrap();
//! let owner = volume.lookup(b"some data key");
//! assert!(owner < 4);
//! ```

pub mod bucket;
pub mod builder;
pub mod calibrate;
pub mod distribution;
pub mod error;
pub mod extent;
pub mod hash;
pub mod migrate;
pub mod rebalance;
pub mod systab;
pub mod tree;
pub mod volume;

pub use {
    bucket::{BrickId, Bucket, BucketMut, BucketSet},
    builder::VolumeBuilder,
    distribution::{Distribution, check_capacity},
    error::{VolumeError, VolumeResult},
    extent::{ExtentState, ExtentUnit, ItemKey, ItemLayout, PAGE_BITS, PAGE_SIZE},
    migrate::{MIGRATION_GRANULARITY, MigrateOutcome, MigratePolicy, Placement, TablePlacement, migrate_file},
    systab::{MAX_SHIFT, MIN_SEG_BITS, SystemTable},
    tree::{FileId, TreeError, TreeOps},
    volume::{BrickInfo, StatusJournal, Volume, VolumeInfo, VolumeStatus},
};
