//! Portable, exact attention used as ground truth.
//!
//! These paths favour clarity over performance and serve as the baseline for
//! validating the fused kernel.

pub mod exact;

pub use exact::{ExactAttention, PrecisionPolicy, ReferenceOptions};
