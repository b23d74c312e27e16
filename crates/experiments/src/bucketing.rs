//! Deterministic visitor bucketing.
//!
//! Every traffic decision in the engine reduces to hashing a seed string
//! into one of 10,000 buckets. The hash is a plain 32-bit rolling
//! polynomial, so the same seed lands in the same bucket within a process,
//! across restarts, and across nodes — stable assignment without any
//! shared memory.

use uuid::Uuid;

/// Buckets per seed space; values land in [0, 9999].
pub const BUCKET_COUNT: u32 = 10_000;

/// Map a seed string to its bucket.
pub fn bucket(seed: &str) -> u32 {
    let hash = seed
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    hash % BUCKET_COUNT
}

/// Bucket expressed as a percentage position in [0, 100).
pub fn bucket_percent(seed: &str) -> f64 {
    bucket(seed) as f64 / 100.0
}

/// Seed for variant selection within an experiment.
pub fn variant_seed(experiment_id: Uuid, visitor_id: &str) -> String {
    format!("{experiment_id}:{visitor_id}")
}

/// Seed for the traffic-allocation gate. Distinct from the variant seed so
/// a visitor held out of one experiment's traffic slice isn't thereby held
/// out of every experiment.
pub fn traffic_seed(experiment_id: Uuid, visitor_id: &str) -> String {
    format!("traffic:{experiment_id}:{visitor_id}")
}

/// Seed for feature-flag rollout gating.
pub fn rollout_seed(flag_key: &str, visitor_id: &str) -> String {
    format!("{flag_key}:{visitor_id}")
}
