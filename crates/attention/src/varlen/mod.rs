//! Ragged and range-based batching.
//!
//! Sequences of different lengths are packed back to back into
//! `[total_tokens, heads, head_dim]` buffers. [`VarlenBatch`] locates them
//! through `cu_seqlens` prefix offsets, [`RangeSet`] through explicit
//! query/key ranges, and [`generate_qkv`] converts padded tensors into the
//! packed form and back.

pub mod batch;
pub mod pack;
pub mod ranges;

pub use batch::{prefix_offsets, Segment, VarlenBatch};
pub use pack::{generate_qkv, UnpaddedInputs};
pub use ranges::{generate_qk_ranges, RangeSet};
