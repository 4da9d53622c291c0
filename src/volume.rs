use {
    log::{debug, info, warn},
    parking_lot::{Mutex, RwLock},
    std::{
        fmt,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    },
};

use crate::{
    bucket::{Bucket, BucketMut, BucketSet, BrickId},
    distribution::Distribution,
    error::{VolumeError, VolumeResult},
    migrate::{self, MIGRATION_GRANULARITY, MigrateOutcome, MigratePolicy, TablePlacement},
    systab::SystemTable,
    tree::{FileId, TreeOps},
};

/// Persisted volume status.
///
/// Committed transactionally around every structural step so that a crash
/// between rebalance and data evacuation resumes deterministically through
/// [`Volume::balance`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeStatus {
    /// File data may still sit on bricks the table no longer points at.
    pub unbalanced: bool,
    /// A brick removal is waiting for its data to be evacuated.
    pub incomplete_removal: Option<BrickId>,
}

/// Transactional sink for [`VolumeStatus`].
pub trait StatusJournal {
    fn commit(&self, status: &VolumeStatus) -> VolumeResult<()>;
}

/// No-op journal for volumes that do not persist their status.
impl StatusJournal for () {
    fn commit(&self, _status: &VolumeStatus) -> VolumeResult<()> {
        Ok(())
    }
}

/// Snapshot of one brick for reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrickInfo {
    pub id: BrickId,
    pub capacity: u64,
    pub occupied: u64,
    /// Segments currently assigned to the brick.
    pub weight: u64,
    pub proxy: bool,
}

/// Snapshot of the volume for reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub seg_bits: u32,
    pub num_bricks: usize,
    pub status: VolumeStatus,
    pub bricks: Vec<BrickInfo>,
}

/// Releases the volume-busy flag when the structural operation ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A multi-brick volume: the distribution context, the active brick set and
/// the structural operations over both.
///
/// Structural operations (add/remove/resize/scale/balance/migrate) are
/// single-writer: they take the volume-busy flag with a non-blocking
/// test-and-set and fail fast with [`VolumeError::Busy`] while another is in
/// flight. Key lookups never take the flag and may run concurrently on any
/// thread.
pub struct Volume<B: Bucket, J: StatusJournal = ()> {
    set: RwLock<BucketSet<B>>,
    dist: Distribution,
    busy: AtomicBool,
    status: Mutex<VolumeStatus>,
    /// Detached brick whose data is still being evacuated.
    victim: Mutex<Option<B>>,
    /// Write-mostly proxy brick; never participates in placement.
    proxy: Mutex<Option<B>>,
    journal: J,
    seed: u32,
    stripe_bits: u32,
    policy: MigratePolicy,
}

impl<B: Bucket, J: StatusJournal> fmt::Debug for Volume<B, J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("bricks", &self.set.read().len())
            .field("seg_bits", &self.dist.seg_bits())
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl<B: Bucket, J: StatusJournal> Volume<B, J> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        set: BucketSet<B>,
        dist: Distribution,
        journal: J,
        seed: u32,
        stripe_bits: u32,
        policy: MigratePolicy,
        status: VolumeStatus,
        victim: Option<B>,
    ) -> Self {
        Self {
            set: RwLock::new(set),
            dist,
            busy: AtomicBool::new(false),
            status: Mutex::new(status),
            victim: Mutex::new(victim),
            proxy: Mutex::new(None),
            journal,
            seed,
            stripe_bits,
            policy,
        }
    }

    /// Resolves a data key to its owning brick. Never blocked by
    /// structural operations.
    pub fn lookup(&self, key: &[u8]) -> BrickId {
        self.dist.lookup(key, self.seed)
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn stripe_bits(&self) -> u32 {
        self.stripe_bits
    }

    pub fn distribution(&self) -> &Distribution {
        &self.dist
    }

    /// Snapshot of the published system table, e.g. for persistence.
    pub fn table(&self) -> Arc<SystemTable> {
        self.dist.table()
    }

    pub fn status(&self) -> VolumeStatus {
        self.status.lock().clone()
    }

    fn try_busy(&self) -> VolumeResult<BusyGuard<'_>> {
        if self.busy.swap(true, Ordering::Acquire) {
            warn!("volume operation rejected: volume is busy");
            return Err(VolumeError::Busy);
        }
        Ok(BusyGuard(&self.busy))
    }

    fn ensure_balanced(&self) -> VolumeResult<()> {
        if self.status.lock().unbalanced {
            warn!("volume operation rejected: volume is unbalanced");
            return Err(VolumeError::Busy);
        }
        Ok(())
    }

    fn set_status(&self, update: impl FnOnce(&mut VolumeStatus)) -> VolumeResult<()> {
        let mut status = self.status.lock();
        update(&mut status);
        self.journal.commit(&status)
    }

    /// Adds a brick, keeping external ids in ascending dense order.
    pub fn add_brick<T: TreeOps>(&self, brick: B, tree: &mut T) -> VolumeResult<()> {
        let pos = {
            let set = self.set.read();
            (0..set.len())
                .find(|&i| set.id_of_index(i) > brick.id())
                .unwrap_or(set.len())
        };
        self.add_brick_at(brick, pos, tree)
    }

    /// Adds a brick at an explicit dense position, rebalances the table and
    /// evacuates misplaced file data onto it.
    pub fn add_brick_at<T: TreeOps>(
        &self,
        brick: B,
        target_pos: usize,
        tree: &mut T,
    ) -> VolumeResult<()> {
        let _busy = self.try_busy()?;
        self.ensure_balanced()?;
        if brick.capacity() == 0 {
            return Err(VolumeError::InvalidConfig("zero brick capacity"));
        }
        let id = brick.id();
        {
            let mut set = self.set.write();
            set.insert_at(target_pos, brick)?;
            if let Err(err) = self.dist.insert_bucket(&mut set, target_pos, true) {
                // Roll the registration back; nothing was published.
                let _ = set.detach(target_pos);
                return Err(err);
            }
        }
        info!("brick {id} has been added");

        self.set_status(|s| s.unbalanced = true)?;
        self.rebalance_files(tree)?;
        self.set_status(|s| s.unbalanced = false)
    }

    /// Attaches a write-mostly proxy brick. Proxies take no part in
    /// placement, so no rebalancing happens.
    pub fn add_proxy(&self, brick: B) -> VolumeResult<()> {
        let _busy = self.try_busy()?;
        self.ensure_balanced()?;
        if self.set.read().index_of_id(brick.id()).is_some() {
            return Err(VolumeError::InvalidConfig("duplicate brick id"));
        }
        let mut proxy = self.proxy.lock();
        if proxy.is_some() {
            return Err(VolumeError::InvalidConfig("proxy brick already attached"));
        }
        info!("brick {} has been added as proxy", brick.id());
        *proxy = Some(brick);
        Ok(())
    }

    pub fn proxy_id(&self) -> Option<BrickId> {
        self.proxy.lock().as_ref().map(|b| b.id())
    }

    /// Removes the brick with id `id`: rebalances its segments away, then
    /// evacuates every extent still homed on it. Returns the detached
    /// brick once its data is fully moved.
    ///
    /// Fails with `InsufficientCapacity` (before any mutation) when the
    /// remaining bricks cannot absorb the victim's data.
    pub fn remove_brick<T: TreeOps>(&self, id: BrickId, tree: &mut T) -> VolumeResult<B> {
        let _busy = self.try_busy()?;
        self.ensure_balanced()?;
        {
            let mut set = self.set.write();
            if set.len() <= 1 {
                return Err(VolumeError::InvalidConfig("cannot remove the last brick"));
            }
            let pos = set
                .index_of_id(id)
                .ok_or(VolumeError::InvalidConfig("unknown brick"))?;
            // Victim data counts toward the occupancy the survivors must
            // absorb.
            let occupied = set.total_space_occupied();
            let (victim, fiber) = set.detach(pos);
            if let Err(err) =
                self.dist
                    .remove_bucket(&mut set, Some((&fiber, id)), pos, occupied)
            {
                set.insert_at(pos, victim)?;
                set.set_fiber(pos, fiber);
                return Err(err);
            }
            self.victim.lock().replace(victim);
        }
        self.set_status(|s| {
            s.unbalanced = true;
            s.incomplete_removal = Some(id);
        })?;
        self.rebalance_files(tree)?;
        let removed = self.finish_removal()?;
        info!("brick {id} has been removed");
        Ok(removed)
    }

    fn finish_removal(&self) -> VolumeResult<B> {
        self.set_status(|s| {
            s.unbalanced = false;
            s.incomplete_removal = None;
        })?;
        self.victim
            .lock()
            .take()
            .ok_or(VolumeError::InvalidConfig("no detached brick to release"))
    }

    /// Changes a brick's capacity and rebalances segments toward or away
    /// from it accordingly.
    pub fn resize_brick<T: TreeOps>(
        &self,
        id: BrickId,
        new_capacity: u64,
        tree: &mut T,
    ) -> VolumeResult<()>
    where
        B: BucketMut,
    {
        let _busy = self.try_busy()?;
        self.ensure_balanced()?;
        if new_capacity == 0 {
            return Err(VolumeError::InvalidConfig("cannot resize brick to zero"));
        }
        {
            let mut set = self.set.write();
            let pos = set
                .index_of_id(id)
                .ok_or(VolumeError::InvalidConfig("unknown brick"))?;
            let old_capacity = set.get(pos).expect("index from bijection").capacity();
            if old_capacity == new_capacity {
                return Ok(());
            }
            set.get_mut(pos)
                .expect("index from bijection")
                .set_capacity(new_capacity);

            let result = if new_capacity > old_capacity {
                self.dist.insert_bucket(&mut set, pos, false)
            } else {
                let occupied = set.total_space_occupied();
                self.dist.remove_bucket(&mut set, None, pos, occupied)
            };
            if let Err(err) = result {
                set.get_mut(pos)
                    .expect("index from bijection")
                    .set_capacity(old_capacity);
                return Err(err);
            }
        }
        info!("brick {id} has been resized to {new_capacity}");

        self.set_status(|s| s.unbalanced = true)?;
        self.rebalance_files(tree)?;
        self.set_status(|s| s.unbalanced = false)
    }

    /// Grows the system table by a factor of `1 << fact_bits` and migrates
    /// whatever the rounding drift displaced.
    pub fn scale<T: TreeOps>(&self, fact_bits: u32, tree: &mut T) -> VolumeResult<()> {
        let _busy = self.try_busy()?;
        self.ensure_balanced()?;
        if fact_bits == 0 {
            return Ok(());
        }
        {
            let mut set = self.set.write();
            let occupied = set.total_space_occupied();
            self.dist.grow(&mut set, fact_bits, occupied)?;
        }
        info!("volume has been scaled by {}", 1u64 << fact_bits);

        self.set_status(|s| s.unbalanced = true)?;
        self.rebalance_files(tree)?;
        self.set_status(|s| s.unbalanced = false)
    }

    /// Balances the volume and completes any unfinished removal. A no-op
    /// on a balanced volume.
    pub fn balance<T: TreeOps>(&self, tree: &mut T) -> VolumeResult<Option<B>> {
        let _busy = self.try_busy()?;
        let status = self.status.lock().clone();
        if !status.unbalanced && status.incomplete_removal.is_none() {
            return Ok(None);
        }
        self.rebalance_files(tree)?;
        if status.incomplete_removal.is_some() {
            // Finish the brick removal detected at activation time or
            // interrupted by an earlier failure.
            return self.finish_removal().map(Some);
        }
        self.set_status(|s| s.unbalanced = false)?;
        Ok(None)
    }

    /// Migrates one file's extents, to `dst` when given, otherwise to
    /// wherever the distribution places them.
    pub fn migrate_file<T: TreeOps>(
        &self,
        tree: &mut T,
        file: FileId,
        dst: Option<BrickId>,
    ) -> VolumeResult<()> {
        let _busy = self.try_busy()?;
        // Migration of an unbalanced volume would work, but keeping the
        // states separate keeps recovery simple.
        self.ensure_balanced()?;
        if let Some(id) = dst {
            self.set
                .read()
                .index_of_id(id)
                .ok_or(VolumeError::InvalidConfig("unknown brick"))?;
        }
        self.drive_migration(tree, file, dst)
    }

    /// Exempts a file from (or re-admits it to) migration.
    pub fn set_file_immobile<T: TreeOps>(
        &self,
        tree: &mut T,
        file: FileId,
        on: bool,
    ) -> VolumeResult<()> {
        let _busy = self.try_busy()?;
        if tree.is_immobile(file) == on {
            return Ok(());
        }
        tree.set_immobile(file, on).map_err(Into::into)
    }

    pub fn volume_info(&self) -> VolumeInfo {
        let set = self.set.read();
        let weights = self.dist.weights();
        let proxy = self.proxy.lock();
        let mut bricks: Vec<BrickInfo> = set
            .iter()
            .enumerate()
            .map(|(idx, b)| BrickInfo {
                id: b.id(),
                capacity: b.capacity(),
                occupied: b.space_occupied(),
                weight: weights.get(idx).copied().unwrap_or(0),
                proxy: false,
            })
            .collect();
        if let Some(p) = proxy.as_ref() {
            bricks.push(BrickInfo {
                id: p.id(),
                capacity: p.capacity(),
                occupied: p.space_occupied(),
                weight: 0,
                proxy: true,
            });
        }
        VolumeInfo {
            seg_bits: self.dist.seg_bits(),
            num_bricks: set.len(),
            status: self.status.lock().clone(),
            bricks,
        }
    }

    /// Report for one brick. Refused while the volume is unbalanced, when
    /// weights and data placement disagree.
    pub fn brick_info(&self, id: BrickId) -> VolumeResult<BrickInfo> {
        self.ensure_balanced()?;
        self.volume_info()
            .bricks
            .into_iter()
            .find(|b| b.id == id)
            .ok_or(VolumeError::InvalidConfig("unknown brick"))
    }

    /// Migrates every non-immobile file to its current placement.
    fn rebalance_files<T: TreeOps>(&self, tree: &mut T) -> VolumeResult<()> {
        let place = TablePlacement::new(&self.dist, self.seed, self.stripe_bits);
        for file in tree.files() {
            if tree.is_immobile(file) {
                debug!("file {file} is immobile, skipping");
                continue;
            }
            self.drive_file(tree, &place, file, None)?;
        }
        Ok(())
    }

    fn drive_migration<T: TreeOps>(
        &self,
        tree: &mut T,
        file: FileId,
        dst: Option<BrickId>,
    ) -> VolumeResult<()> {
        let place = TablePlacement::new(&self.dist, self.seed, self.stripe_bits);
        self.drive_file(tree, &place, file, dst)
    }

    fn drive_file<T: TreeOps>(
        &self,
        tree: &mut T,
        place: &TablePlacement<'_>,
        file: FileId,
        dst: Option<BrickId>,
    ) -> VolumeResult<()> {
        // An explicit destination is an all-or-nothing per-item move; the
        // striped boundary scan only makes sense against the table.
        let policy = if dst.is_some() {
            MigratePolicy::WholeItem
        } else {
            self.policy
        };
        loop {
            match migrate::migrate_file(tree, place, file, dst, policy, MIGRATION_GRANULARITY)? {
                MigrateOutcome::Done { .. } => return Ok(()),
                // Commit point for the embedding transaction layer.
                MigrateOutcome::Repeat { .. } => continue,
            }
        }
    }
}
