//! Range descriptors for flex attention.
//!
//! A [`RangeSet`] lists segments `(q_range, k_range, is_causal)` over packed
//! query and key buffers: every query row in `q_range` attends every key row
//! in `k_range` (bottom-right causal within the segment when flagged). Query
//! ranges may overlap, in which case the softmax spans the union of the keys
//! of all segments containing the row.

use std::ops::Range;

use rand::seq::index::sample;
use rand::Rng;

use crate::core::{AttentionError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    pub q_ranges: Vec<Range<usize>>,
    pub k_ranges: Vec<Range<usize>>,
    pub is_causal: Vec<bool>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
}

impl RangeSet {
    pub fn new(
        q_ranges: Vec<Range<usize>>,
        k_ranges: Vec<Range<usize>>,
        is_causal: Vec<bool>,
    ) -> Result<Self> {
        if q_ranges.len() != k_ranges.len() || q_ranges.len() != is_causal.len() {
            return Err(AttentionError::argument(format!(
                "range lists disagree: {} q ranges, {} k ranges, {} causal flags",
                q_ranges.len(),
                k_ranges.len(),
                is_causal.len()
            )));
        }
        if let Some(bad) = q_ranges.iter().chain(k_ranges.iter()).find(|r| r.start > r.end) {
            return Err(AttentionError::argument(format!(
                "range {}..{} is reversed",
                bad.start, bad.end
            )));
        }
        let max_seqlen_q = q_ranges.iter().map(|r| r.len()).max().unwrap_or(0);
        let max_seqlen_k = k_ranges.iter().map(|r| r.len()).max().unwrap_or(0);
        Ok(Self {
            q_ranges,
            k_ranges,
            is_causal,
            max_seqlen_q,
            max_seqlen_k,
        })
    }

    pub fn len(&self) -> usize {
        self.q_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q_ranges.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = (Range<usize>, Range<usize>, bool)> + '_ {
        self.q_ranges
            .iter()
            .zip(self.k_ranges.iter())
            .zip(self.is_causal.iter())
            .map(|((q, k), &causal)| (q.clone(), k.clone(), causal))
    }

    pub fn validate(&self, total_q: usize, total_k: usize) -> Result<()> {
        for (q, k, _) in self.segments() {
            if q.end > total_q || k.end > total_k {
                return Err(AttentionError::shape(format!(
                    "segment q={}..{} k={}..{} exceeds packed sizes ({total_q}, {total_k})",
                    q.start, q.end, k.start, k.end
                )));
            }
        }
        Ok(())
    }
}

/// Random segments for `bsz` sequences packed into `total_q` query rows and
/// `total_k` key rows.
///
/// Query ranges partition `0..total_q` at `bsz - 1` distinct random cut
/// points (a cut at 0 yields an empty first segment). Each key range is a
/// random non-empty sub-range of `0..total_k`. No segment is causal.
pub fn generate_qk_ranges<R: Rng>(
    rng: &mut R,
    total_q: usize,
    total_k: usize,
    bsz: usize,
) -> Result<RangeSet> {
    if bsz == 0 || total_k == 0 || total_q + 1 < bsz {
        return Err(AttentionError::argument(format!(
            "cannot draw {bsz} ranges over {total_q} query and {total_k} key rows"
        )));
    }

    let q_ranges = if bsz == 1 {
        vec![0..total_q]
    } else {
        let mut points = sample(rng, total_q, bsz - 1).into_vec();
        points.sort_unstable();
        let mut ranges = Vec::with_capacity(bsz);
        let mut start = 0;
        for point in points {
            ranges.push(start..point);
            start = point;
        }
        ranges.push(start..total_q);
        ranges
    };

    let k_ranges = (0..bsz)
        .map(|_| {
            let start = rng.gen_range(0..total_k);
            let end = rng.gen_range(start + 1..=total_k);
            start..end
        })
        .collect();

    RangeSet::new(q_ranges, k_ranges, vec![false; bsz])
}
