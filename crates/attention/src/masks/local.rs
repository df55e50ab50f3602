//! Sliding-window (local) masks.

use super::KeepMask;
use crate::core::{MaskRule, WindowSize};

/// Construct a local mask: query `i` sees keys within `window.left` before
/// and `window.right` after its aligned diagonal `i + k_len - q_len`.
/// `causal` clamps the right side to the diagonal.
pub fn build_local_mask(
    batch: usize,
    q_len: usize,
    k_len: usize,
    window: WindowSize,
    causal: bool,
) -> KeepMask {
    let rule = MaskRule::new(causal, window);
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
