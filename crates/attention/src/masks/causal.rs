//! Builders for causal attention masks.
//!
//! When `k_len > q_len`, queries are aligned with the most recent `q_len`
//! keys, allowing access to the extended prefix. When `q_len > k_len` the
//! leading `q_len - k_len` queries see no key at all.

use super::KeepMask;
use crate::core::{MaskRule, WindowSize};

/// Construct a causal mask for the supplied sequence dimensions.
pub fn build_causal_mask(batch: usize, q_len: usize, k_len: usize) -> KeepMask {
    let rule = MaskRule::new(true, WindowSize::UNBOUNDED);
    let mut mask = KeepMask::empty(batch, q_len, k_len);
    for b in 0..batch {
        for i in 0..q_len {
            for j in rule.key_span(i, q_len, k_len) {
                mask.set(b, i, j, true);
            }
        }
    }
    mask
}
