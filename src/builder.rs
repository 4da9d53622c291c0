use crate::{
    bucket::{Bucket, BucketSet},
    distribution::Distribution,
    error::{VolumeError, VolumeResult},
    extent::PAGE_BITS,
    migrate::MigratePolicy,
    systab::{MIN_SEG_BITS, SystemTable},
    volume::{StatusJournal, Volume, VolumeStatus},
};

/// Default stripe size: 64 KiB.
const DEFAULT_STRIPE_BITS: u32 = 16;

/// Builds a [`Volume`] at activation time.
///
/// A fresh volume needs only its bricks; a volume loaded from disk supplies
/// the persisted system table, its status flags and, when a brick removal
/// was interrupted, the detached brick still awaiting evacuation.
pub struct VolumeBuilder<B: Bucket, J: StatusJournal = ()> {
    bricks: Vec<B>,
    seg_bits: u32,
    seed: u32,
    stripe_bits: u32,
    policy: MigratePolicy,
    journal: J,
    table: Option<SystemTable>,
    status: VolumeStatus,
    victim: Option<B>,
}

impl<B: Bucket> VolumeBuilder<B, ()> {
    pub fn new<I: IntoIterator<Item = B>>(bricks: I) -> Self {
        Self {
            bricks: bricks.into_iter().collect(),
            seg_bits: MIN_SEG_BITS,
            seed: 0,
            stripe_bits: DEFAULT_STRIPE_BITS,
            policy: MigratePolicy::Striped,
            journal: (),
            table: None,
            status: VolumeStatus::default(),
            victim: None,
        }
    }
}

impl<B: Bucket, J: StatusJournal> VolumeBuilder<B, J> {
    /// Table-size exponent; the table holds `1 << seg_bits` segments.
    pub fn with_seg_bits(mut self, seg_bits: u32) -> Self {
        self.seg_bits = seg_bits;
        self
    }

    /// Placement hash seed, part of the volume identity.
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Stripe size exponent for per-file placement decisions.
    pub fn with_stripe_bits(mut self, stripe_bits: u32) -> Self {
        self.stripe_bits = stripe_bits;
        self
    }

    pub fn with_policy(mut self, policy: MigratePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// System table loaded from disk. Without one the table is laid out
    /// from scratch from the calibrated weights.
    pub fn with_table(mut self, table: SystemTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Persisted status flags recovered at activation.
    pub fn with_status(mut self, status: VolumeStatus) -> Self {
        self.status = status;
        self
    }

    /// Detached brick of an interrupted removal; [`Volume::balance`]
    /// finishes evacuating it.
    pub fn with_victim(mut self, brick: B) -> Self {
        self.victim = Some(brick);
        self
    }

    /// Transform the builder into one with a persistent status journal.
    pub fn with_journal<J2: StatusJournal>(self, journal: J2) -> VolumeBuilder<B, J2> {
        VolumeBuilder {
            bricks: self.bricks,
            seg_bits: self.seg_bits,
            seed: self.seed,
            stripe_bits: self.stripe_bits,
            policy: self.policy,
            journal,
            table: self.table,
            status: self.status,
            victim: self.victim,
        }
    }

    /// Activate the volume.
    pub fn build(self) -> VolumeResult<Volume<B, J>> {
        if self.stripe_bits < PAGE_BITS {
            return Err(VolumeError::InvalidConfig("stripe smaller than a page"));
        }
        let mut set = BucketSet::from_bricks(self.bricks)?;
        let dist = Distribution::init(&mut set, self.seg_bits, self.table)?;
        Ok(Volume::assemble(
            set,
            dist,
            self.journal,
            self.seed,
            self.stripe_bits,
            self.policy,
            self.status,
            self.victim,
        ))
    }
}
