//! Reduced-precision inputs for the 8-bit kernel path.

pub mod fp8;

pub use fp8::{decode_e4m3, encode_e4m3, Fp8Tensor, E4M3_MAX};

use crate::core::{AttentionError, Result};

/// Per-tensor descale factors reconstructing real values from fp8 codes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descale {
    pub q: f32,
    pub k: f32,
    pub v: f32,
}

impl Descale {
    pub fn new(q: f32, k: f32, v: f32) -> Result<Self> {
        for (name, value) in [("q", q), ("k", k), ("v", v)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(AttentionError::argument(format!(
                    "descale_{name} must be finite and positive, got {value}"
                )));
            }
        }
        Ok(Self { q, k, v })
    }

    pub fn uniform(value: f32) -> Result<Self> {
        Self::new(value, value, value)
    }
}

impl Default for Descale {
    fn default() -> Self {
        Self {
            q: 1.0,
            k: 1.0,
            v: 1.0,
        }
    }
}
