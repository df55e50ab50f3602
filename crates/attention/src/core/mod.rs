//! Core traits and types shared across attention implementations.
//!
//! Dense tensors use the layout `[batch, seq_len, n_heads, head_dim]`;
//! ragged and range-based batches pack every sequence into
//! `[total_tokens, n_heads, head_dim]`. Outputs mirror the layout and dtype of
//! `q`. The log-sum-exp tensor is always `f32`, shaped
//! `[batch, n_heads, seqlen_q]` for dense calls and `[n_heads, total_q]` for
//! packed calls, and holds `+inf` for rows that see no key.

pub mod config;
pub mod errors;
pub mod shape;

use candle_core::{DType, Tensor};

use crate::quant::{Descale, Fp8Tensor};
use crate::varlen::{RangeSet, VarlenBatch};

pub use config::{AttentionConfig, EnvOverrides, MaskRule, WindowSize};
pub use errors::{AttentionError, Result};
pub use shape::AttentionShape;

/// Attention output plus the per-row log-sum-exp of the scaled scores.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub out: Tensor,
    pub lse: Tensor,
}

/// Gradients with respect to the query, key and value inputs.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

/// Unified call interface for the flash-attention kernel family.
///
/// * Backward entry points take the [`ForwardOutput`] of the matching forward
///   call and recompute the softmax from its log-sum-exp.
/// * Gradients mirror the dtype and layout of the corresponding inputs.
/// * `cfg.deterministic` guarantees bitwise reproducible gradients.
pub trait FlashKernel {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &'static str;

    /// Dense attention over `[batch, seqlen, heads, head_dim]` tensors.
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput>;

    /// Dense attention over float8 inputs. Effective values are
    /// `decode(code) * descale`; the output is produced in `out_dtype`.
    fn forward_fp8(
        &self,
        q: &Fp8Tensor,
        k: &Fp8Tensor,
        v: &Fp8Tensor,
        descale: &Descale,
        out_dtype: DType,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput>;

    fn backward(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        cfg: &AttentionConfig,
    ) -> Result<Gradients>;

    /// Ragged attention over packed tensors described by `cu_seqlens`.
    fn varlen_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        batch: &VarlenBatch,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput>;

    #[allow(clippy::too_many_arguments)]
    fn varlen_backward(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        batch: &VarlenBatch,
        cfg: &AttentionConfig,
    ) -> Result<Gradients>;

    /// Range-based attention: each segment maps a query range onto a key range.
    fn flex_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ranges: &RangeSet,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput>;

    #[allow(clippy::too_many_arguments)]
    fn flex_backward(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        ranges: &RangeSet,
        cfg: &AttentionConfig,
    ) -> Result<Gradients>;
}
