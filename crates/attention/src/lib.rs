//! Flash attention kernels for the host together with the harness that
//! validates them.
//!
//! The crate exposes a single call interface, [`FlashKernel`], covering the
//! whole kernel family: dense attention over tensors laid out as
//! `[batch, seq_len, n_heads, head_dim]`, ragged batches packed as
//! `[total_tokens, n_heads, head_dim]` with `cu_seqlens` offsets, and
//! range-based ("flex") batches where each segment maps a query range onto a
//! key range. Every forward pass returns the attention output together with
//! the per-row log-sum-exp, which the backward pass reuses to recompute the
//! softmax instead of storing it.
//!
//! [`fused::CpuFlashAttention`] implements the interface with tiled
//! online-softmax accumulation in `f32`. [`reference::ExactAttention`]
//! materialises the attention matrix and differentiates it with candle's
//! autograd; the [`harness`] module drives randomized shape, masking and
//! precision sweeps that compare the two.
//!
//! Query heads may outnumber key/value heads (GQA/MQA) as long as the ratio
//! is integral. Causal masks are aligned to the bottom-right corner of the
//! score matrix, so when `seqlen_k > seqlen_q` the last query sees every key.

pub mod core;
pub mod fused;
pub mod harness;
pub mod masks;
pub mod quant;
pub mod reference;
pub mod varlen;

pub use core::{
    AttentionConfig, AttentionError, AttentionShape, EnvOverrides, FlashKernel, ForwardOutput,
    Gradients, MaskRule, WindowSize,
};
pub use fused::CpuFlashAttention;
pub use reference::{ExactAttention, PrecisionPolicy, ReferenceOptions};
