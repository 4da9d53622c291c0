//! Per-item migration decision: skip, split, or migrate.

use super::{MigrateAction, MigrateContext, MigratePolicy, Placement};
use crate::{
    extent::{PAGE_BITS, stripe_floor},
    tree::TreeOps,
};

impl<T: TreeOps> MigrateContext<'_, T> {
    /// Assigns the migration primitive for the item at the cursor.
    pub(super) fn decide<P: Placement>(&mut self, place: &P, policy: MigratePolicy) {
        self.reset();
        match policy {
            MigratePolicy::WholeItem => self.decide_whole(place),
            MigratePolicy::Striped => self.decide_striped(place),
        }
    }

    /// Whole-item mode: the item is either skipped or migrated entirely,
    /// judged by the target of its base offset.
    fn decide_whole<P: Placement>(&mut self, place: &P) {
        let base = self.key.offset;
        self.new_loc = self
            .explicit_dst
            .unwrap_or_else(|| place.target(self.file, base));

        if self.key.brick == self.new_loc {
            self.stop_off = base;
            self.stop = true;
            self.act = Some(MigrateAction::Skip);
        } else {
            self.plan_migrate(base);
        }
    }

    /// Striped mode: find the maximal split offset such that everything
    /// strictly right of it maps to one target brick and the byte just left
    /// of it maps elsewhere. Only the misplaced side then moves.
    fn decide_striped<P: Placement>(&mut self, place: &P) {
        let base = self.key.offset;
        let end = self.layout.end_offset();
        let stripe = 1u64 << place.stripe_bits();

        let off1 = stripe_floor(base, place.stripe_bits());
        let mut off2 = stripe_floor(end - 1, place.stripe_bits());

        self.new_loc = self
            .explicit_dst
            .unwrap_or_else(|| place.target(self.file, off2));

        let mut split_off = None;
        while off1 < off2 {
            off2 -= stripe;
            if place.target(self.file, off2) != self.new_loc {
                split_off = Some(off2 + stripe);
                break;
            }
        }

        match split_off {
            None => {
                // Uniform item: migrate it or leave it alone.
                if self.new_loc != self.key.brick {
                    self.plan_migrate(base);
                } else {
                    self.stop_off = base;
                    self.stop = true;
                    self.act = Some(MigrateAction::Skip);
                }
            }
            Some(split_off) => {
                debug_assert!(base < split_off && split_off < end);
                if self.new_loc != self.key.brick {
                    // The misplaced tail moves; migration itself performs
                    // the split, no separate cut needed.
                    self.plan_migrate(split_off);
                } else {
                    // The right part already sits on its target; cut it off
                    // and keep working on the left remainder.
                    self.stop_off = split_off;
                    self.set_unit_split(split_off);
                    self.act = Some(MigrateAction::Split);
                }
            }
        }
    }

    /// Plans a migration of `[from, end)`, trimmed to the migration
    /// granularity from the right so one chunk never pins more than the
    /// granularity's worth of pages.
    fn plan_migrate(&mut self, from: u64) {
        let end = self.layout.end_offset();
        let granularity_bytes = super::MIGRATION_GRANULARITY << PAGE_BITS;

        self.stop_off = if end - from > granularity_bytes {
            end - granularity_bytes
        } else {
            from
        };
        self.migrate_whole_item = self.stop_off == self.key.offset;
        if !self.migrate_whole_item {
            self.set_unit_split(self.stop_off);
        }
        self.act = Some(MigrateAction::Migrate);
    }

    /// Records the split position, in blocks, within the unit containing
    /// byte offset `off`.
    fn set_unit_split(&mut self, off: u64) {
        let (_, unit_start) = self
            .layout
            .unit_at(off)
            .expect("split offset falls inside the item");
        debug_assert!(unit_start <= off);
        self.unit_split_pos = (off - unit_start) >> PAGE_BITS;
    }
}
