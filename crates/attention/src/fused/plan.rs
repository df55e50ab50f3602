//! Host buffers and the segment plan shared by the forward and backward
//! passes.
//!
//! Every entry point (dense, varlen, flex) is lowered to a list of
//! [`WorkSegment`]s over packed `[rows, heads, head_dim]` f32 buffers. A dense
//! batch becomes one segment per sequence, a varlen batch one per
//! `cu_seqlens` entry and a flex batch one per range pair.

use std::ops::Range;

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionConfig, AttentionError, AttentionShape, MaskRule, Result, WindowSize};
use crate::varlen::{RangeSet, VarlenBatch};

/// Row-major `[rows, heads, dim]` f32 copy of a tensor.
#[derive(Debug, Clone)]
pub(crate) struct HostTensor {
    pub data: Vec<f32>,
    pub heads: usize,
    pub dim: usize,
}

impl HostTensor {
    /// Leading dimensions are folded into rows; the last two must be
    /// `[heads, dim]`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dims = tensor.dims();
        if dims.len() < 2 {
            return Err(AttentionError::shape(format!(
                "expected at least [heads, head_dim], got {dims:?}"
            )));
        }
        let heads = dims[dims.len() - 2];
        let dim = dims[dims.len() - 1];
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { data, heads, dim })
    }

    pub fn zeros(rows: usize, heads: usize, dim: usize) -> Self {
        Self {
            data: vec![0.0; rows * heads * dim],
            heads,
            dim,
        }
    }

    pub fn offset(&self, row: usize, head: usize) -> usize {
        (row * self.heads + head) * self.dim
    }

    pub fn row(&self, row: usize, head: usize) -> &[f32] {
        let start = self.offset(row, head);
        &self.data[start..start + self.dim]
    }

    pub fn row_mut(&mut self, row: usize, head: usize) -> &mut [f32] {
        let start = self.offset(row, head);
        &mut self.data[start..start + self.dim]
    }

    pub fn into_tensor(self, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data, dims, device)?.to_dtype(dtype)?)
    }
}

/// One query range attending one key range of the packed buffers.
///
/// Local row `i < q_used` is packed row `q_start + i`; it is aligned with key
/// `i + k_used - q_used` of the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkSegment {
    pub q_start: usize,
    pub q_used: usize,
    pub k_start: usize,
    pub k_used: usize,
    pub rule: MaskRule,
}

impl WorkSegment {
    /// Segment-local keys visible to local query `i`.
    pub fn key_span(&self, i: usize) -> Range<usize> {
        self.rule.key_span(i, self.q_used, self.k_used)
    }

    /// Segment-local keys touched by any row of `rows`.
    pub fn tile_span(&self, rows: Range<usize>) -> Range<usize> {
        let mut lo = usize::MAX;
        let mut hi = 0;
        for i in rows {
            let span = self.key_span(i);
            if !span.is_empty() {
                lo = lo.min(span.start);
                hi = hi.max(span.end);
            }
        }
        if lo >= hi {
            0..0
        } else {
            lo..hi
        }
    }
}

/// Validated geometry of one kernel call.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub segments: Vec<WorkSegment>,
    pub total_q: usize,
    pub total_k: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub scale: f32,
    pub block_q: usize,
    pub block_k: usize,
    pub gqa_parallel: bool,
    pub deterministic: bool,
}

impl Plan {
    fn with_segments(
        shape: &AttentionShape,
        cfg: &AttentionConfig,
        segments: Vec<WorkSegment>,
        total_q: usize,
        total_k: usize,
    ) -> Self {
        Self {
            segments,
            total_q,
            total_k,
            num_heads: shape.num_heads,
            num_kv_heads: shape.num_kv_heads,
            head_dim: shape.head_dim,
            scale: cfg.scale_for(shape.head_dim),
            block_q: cfg.block_q,
            block_k: cfg.block_k,
            gqa_parallel: cfg.gqa_parallel,
            deterministic: cfg.deterministic,
        }
    }

    pub fn dense(shape: &AttentionShape, cfg: &AttentionConfig) -> Self {
        let rule = cfg.mask_rule();
        let segments = (0..shape.batch)
            .map(|b| WorkSegment {
                q_start: b * shape.seqlen_q,
                q_used: shape.seqlen_q,
                k_start: b * shape.seqlen_k,
                k_used: shape.seqlen_k,
                rule,
            })
            .collect();
        Self::with_segments(
            shape,
            cfg,
            segments,
            shape.batch * shape.seqlen_q,
            shape.batch * shape.seqlen_k,
        )
    }

    /// `shape` must come from [`AttentionShape::packed`].
    pub fn varlen(
        shape: &AttentionShape,
        batch: &VarlenBatch,
        cfg: &AttentionConfig,
    ) -> Result<Self> {
        batch.validate(shape.seqlen_q, shape.seqlen_k)?;
        let rule = cfg.mask_rule();
        let segments = (0..batch.batch())
            .map(|i| {
                let q = batch.query_segment(i);
                let k = batch.key_segment(i);
                WorkSegment {
                    q_start: q.start,
                    q_used: q.used,
                    k_start: k.start,
                    k_used: k.used,
                    rule,
                }
            })
            .collect();
        Ok(Self::with_segments(
            shape,
            cfg,
            segments,
            shape.seqlen_q,
            shape.seqlen_k,
        ))
    }

    /// Masking comes from the range set alone; `cfg.causal` and `cfg.window`
    /// must be unset.
    pub fn flex(shape: &AttentionShape, ranges: &RangeSet, cfg: &AttentionConfig) -> Result<Self> {
        if cfg.causal || cfg.window.is_local() {
            return Err(AttentionError::argument(
                "flex attention takes causality from the range set; unset causal and window",
            ));
        }
        ranges.validate(shape.seqlen_q, shape.seqlen_k)?;
        let segments = ranges
            .segments()
            .map(|(q, k, causal)| WorkSegment {
                q_start: q.start,
                q_used: q.len(),
                k_start: k.start,
                k_used: k.len(),
                rule: MaskRule::new(causal, WindowSize::UNBOUNDED),
            })
            .collect();
        Ok(Self::with_segments(
            shape,
            cfg,
            segments,
            shape.seqlen_q,
            shape.seqlen_k,
        ))
    }

    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Query heads served by key/value head `kv_head`.
    pub fn group(&self, kv_head: usize) -> Range<usize> {
        let group = self.group_size();
        kv_head * group..(kv_head + 1) * group
    }

    pub fn kv_head(&self, head: usize) -> usize {
        head / self.group_size()
    }
}

/// Tiles of `block` rows covering `range`, aligned to multiples of `block`.
pub(crate) fn tiles(range: Range<usize>, block: usize) -> impl Iterator<Item = Range<usize>> {
    let end = range.end;
    let first = range.start - range.start % block;
    (first..end)
        .step_by(block)
        .map(move |start| start..(start + block).min(end))
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiles_align_to_block_multiples() {
        let got: Vec<_> = tiles(5..19, 8).collect();
        assert_eq!(got, vec![0..8, 8..16, 16..19]);
        assert_eq!(tiles(0..0, 4).count(), 0);
    }

    #[test]
    fn tile_span_skips_empty_rows() {
        let segment = WorkSegment {
            q_start: 0,
            q_used: 6,
            k_start: 0,
            k_used: 3,
            rule: MaskRule::new(true, WindowSize::UNBOUNDED),
        };
        // Rows 0..3 see nothing (q_used > k_used under causality).
        assert_eq!(segment.tile_span(0..3), 0..0);
        assert_eq!(segment.tile_span(0..5), 0..2);
        assert_eq!(segment.tile_span(3..6), 0..3);
    }

    #[test]
    fn dense_plan_places_one_segment_per_sequence() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((3, 4, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((3, 5, 2, 8), DType::F32, &device)?;
        let shape = AttentionShape::dense(&q, &k, &k)?;
        let plan = Plan::dense(&shape, &AttentionConfig::default());
        assert_eq!(plan.segments.len(), 3);
        assert_eq!(plan.segments[2].q_start, 8);
        assert_eq!(plan.segments[2].k_start, 10);
        assert_eq!(plan.group(1), 2..4);
        assert_eq!(plan.kv_head(3), 1);
        Ok(())
    }

    #[test]
    fn flex_plan_rejects_global_masking() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((4, 1, 8), DType::F32, &device)?;
        let shape = AttentionShape::packed(&q, &q, &q)?;
        let ranges = RangeSet::new(vec![0..4], vec![0..4], vec![false])?;
        let cfg = AttentionConfig {
            causal: true,
            ..AttentionConfig::default()
        };
        assert!(Plan::flex(&shape, &ranges, &cfg).is_err());
        assert!(Plan::flex(&shape, &ranges, &AttentionConfig::default()).is_ok());
        Ok(())
    }
}
