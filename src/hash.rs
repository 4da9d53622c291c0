use rapidhash::v3::{RapidSecrets, rapidhash_v3_seeded};

/// Placement hash for the distribution engine.
///
/// This uses the rapidhash V3 algorithm folded down to 32 bits. The output
/// is portable across platforms and major releases; together with the seed
/// it is part of the volume identity and must stay consistent across a
/// single deployment, or every key would resolve to a different segment.
pub fn hash32(key: &[u8], seed: u32) -> u32 {
    (rapidhash_v3_seeded(key, &RapidSecrets::seed(u64::from(seed))) >> 32) as u32
}

/// Maps a key to a segment index: the top `seg_bits` bits of the hash.
///
/// Allocation-free and safe to call from any thread.
pub fn segment_of(key: &[u8], seed: u32, seg_bits: u32) -> u32 {
    debug_assert!(seg_bits >= 1 && seg_bits < 32);
    hash32(key, seed) >> (32 - seg_bits)
}
