//! Physical relocation of a decided migration chunk.

use log::warn;

use super::MigrateContext;
use crate::{
    error::{VolumeError, VolumeResult},
    extent::{ExtentState, ItemKey, PAGE_BITS},
    tree::{TreeError, TreeOps},
};

impl<T: TreeOps> MigrateContext<'_, T> {
    /// Cuts the item in two at `stop_off`; the right part keeps its
    /// placement and drops out of further processing.
    pub(super) fn split_chunk(&mut self) -> VolumeResult<()> {
        self.tree.split_item(self.file, &self.key, self.stop_off)?;
        Ok(())
    }

    /// Moves the decided chunk of `[stop_off, item end)` to the new brick.
    pub(super) fn migrate_chunk(&mut self) -> VolumeResult<()> {
        let nr_pages = (self.layout.end_offset() - self.stop_off) >> PAGE_BITS;
        debug_assert!(nr_pages > 0);
        let dst = self.new_loc;
        debug_assert_ne!(dst, self.key.brick);
        // The decision recorded where inside its unit the chunk begins.
        if let Some((_, unit_start)) = self.layout.unit_at(self.stop_off) {
            debug_assert_eq!(self.unit_split_pos, (self.stop_off - unit_start) >> PAGE_BITS);
        }

        // Space on the destination first. Running out is an expected,
        // recoverable outcome surfaced to the caller.
        self.tree.grab_space(dst, nr_pages)?;

        // Read and pin the chunk's pages in index order.
        let first_page = self.stop_off >> PAGE_BITS;
        let mut pages: Vec<T::Page> = Vec::with_capacity(nr_pages as usize);
        for i in 0..nr_pages {
            match self.tree.read_page(self.file, first_page + i) {
                Ok(page) => pages.push(page),
                Err(err) => {
                    self.unwind(pages, false);
                    return Err(err.into());
                }
            }
        }
        for page in pages.iter_mut() {
            self.tree.set_write_prepared(page, true);
        }

        if let Err(err) = self.edit_items(nr_pages) {
            self.unwind(pages, true);
            return Err(err.into());
        }

        // Point every pinned page at a fresh logical block on the new brick
        // and hand it to the transaction manager. A failure in here means a
        // broken transaction invariant, not a recoverable condition.
        let block = self.tree.fake_block(dst, nr_pages);
        for (i, mut page) in pages.into_iter().enumerate() {
            self.tree.assign_block(&mut page, dst, block + i as u64);
            self.tree.set_write_prepared(&mut page, false);
            self.tree
                .commit_dirty(&mut page)
                .map_err(|err| VolumeError::Structural(format!("capture failed: {err}")))?;
            self.tree.unpin(page);
        }

        self.done_off = self.stop_off;
        self.blocks_migrated += nr_pages;

        // Return whatever the fulfilled iteration over-reserved, then grab
        // the small metadata quota for the next one.
        self.tree.release_grabbed();
        self.tree.reserve_iteration()?;

        if self.migrate_whole_item {
            self.stop = true;
            return Ok(());
        }

        // Relocate the cursor to the leftmost unprocessed item; the
        // structural edits above may have invalidated the old position.
        debug_assert!(self.done_off > 0);
        match self.tree.lookup_item(self.file, self.done_off - 1) {
            Ok(layout) => {
                self.key = layout.key;
                self.layout = layout;
            }
            Err(TreeError::Absent) => {
                // Killed by a concurrent truncate; not an error.
                warn!("item not found after migration of file {}", self.file);
                self.stop = true;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Rewrites the tree for the migrated chunk.
    fn edit_items(&mut self, nr_pages: u64) -> Result<(), TreeError> {
        let new_key = ItemKey::new(self.new_loc, self.stop_off);
        if self.migrate_whole_item {
            // The old block runs are given back to their brick; the item
            // keeps its byte range as one unallocated unit on the new one.
            for unit in &self.layout.units {
                if let ExtentState::Allocated { start } = unit.state {
                    self.tree.dealloc_deferred(self.key.brick, start, unit.width);
                }
            }
            self.tree
                .rehome_item(self.file, &self.key, self.new_loc, nr_pages)?;
            self.tree.merge_right(self.file, &new_key)?;
            self.tree.merge_left(self.file, &new_key)?;
        } else {
            // Cut the migrated tail off, then re-insert it as a fresh item
            // homed on the destination brick.
            self.tree.cut_tail(self.file, &self.key, self.stop_off)?;
            self.tree.insert_item(self.file, new_key, nr_pages)?;
            self.tree.merge_right(self.file, &new_key)?;
        }
        Ok(())
    }

    /// Releases everything a failed chunk acquired: pins in reverse
    /// acquisition order, then the space reservation. No page is left
    /// dirty or write-prepared.
    fn unwind(&mut self, mut pages: Vec<T::Page>, prepared: bool) {
        while let Some(mut page) = pages.pop() {
            if prepared {
                self.tree.set_write_prepared(&mut page, false);
            }
            self.tree.unpin(page);
        }
        self.tree.release_grabbed();
    }
}
