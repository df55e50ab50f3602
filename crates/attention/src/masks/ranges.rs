//! Masks described by flex-attention range segments.

use super::KeepMask;
use crate::core::{MaskRule, Result, WindowSize};
use crate::varlen::RangeSet;

impl KeepMask {
    /// Single-batch `[total_q, total_k]` mask admitting, for every segment,
    /// the rectangle `q_range × k_range` (bottom-right causal when the
    /// segment is flagged). Overlapping segments are unioned.
    pub fn from_ranges(ranges: &RangeSet, total_q: usize, total_k: usize) -> Result<KeepMask> {
        ranges.validate(total_q, total_k)?;
        let mut mask = KeepMask::empty(1, total_q, total_k);
        for (q_range, k_range, causal) in ranges.segments() {
            let rule = MaskRule::new(causal, WindowSize::UNBOUNDED);
            let (q_len, k_len) = (q_range.len(), k_range.len());
            for (offset, i) in q_range.enumerate() {
                for j in rule.key_span(offset, q_len, k_len) {
                    mask.set(0, i, k_range.start + j, true);
                }
            }
        }
        Ok(mask)
    }
}
