//! Weighted variant selection.

use stagepass_core::types::Variant;

/// Pick a variant for a bucket value by walking variants in stored order
/// and accumulating weights. The bucket's percentage position falls inside
/// the first variant whose cumulative share covers it; weight tables that
/// underflow 100 fall back to the last variant, deterministically.
pub fn select(variants: &[Variant], bucket_value: u32) -> Option<&Variant> {
    let position = bucket_value as f64 / 100.0;
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight;
        if position < cumulative {
            return Some(variant);
        }
    }
    variants.last()
}
