//! Mask utilities shared by the reference and the harness.
//!
//! A [`KeepMask`] is a boolean `[batch, q_len, k_len]` grid marking which
//! keys each query may attend; it is shared across heads. The fused kernel
//! never materialises one: it evaluates the same [`MaskRule`] per row, and the
//! builders here exist so the reference can apply identical semantics.
//! [`KeepMask::to_tensor`] emits dtype [`MASK_DTYPE`] shaped
//! `[batch, 1, q_len, k_len]`, ready for `where_cond`.

pub mod causal;
pub mod local;
pub mod padding;
pub mod ranges;

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionError, MaskRule, Result};

/// Dtype of mask tensors handed to `where_cond`.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::build_causal_mask;
pub use local::build_local_mask;
pub use padding::{
    generate_random_padding_mask, padding_lengths, padding_mask_from_lengths, split_unused,
    PaddingMode,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepMask {
    batch: usize,
    q_len: usize,
    k_len: usize,
    data: Vec<bool>,
}

impl KeepMask {
    /// Every query sees every key.
    pub fn full(batch: usize, q_len: usize, k_len: usize) -> Self {
        Self {
            batch,
            q_len,
            k_len,
            data: vec![true; batch * q_len * k_len],
        }
    }

    pub(crate) fn empty(batch: usize, q_len: usize, k_len: usize) -> Self {
        Self {
            batch,
            q_len,
            k_len,
            data: vec![false; batch * q_len * k_len],
        }
    }

    /// Apply `rule` to every sequence pair; positions outside the valid
    /// prefixes (`q_lengths[b]`, `k_lengths[b]`) are masked, and the diagonal
    /// is aligned using those valid lengths.
    pub fn for_lengths(
        rule: MaskRule,
        q_lengths: &[usize],
        k_lengths: &[usize],
        q_len: usize,
        k_len: usize,
    ) -> Result<Self> {
        if q_lengths.len() != k_lengths.len() {
            return Err(AttentionError::argument(format!(
                "query lengths ({}) and key lengths ({}) disagree on batch size",
                q_lengths.len(),
                k_lengths.len()
            )));
        }
        let mut mask = Self::empty(q_lengths.len(), q_len, k_len);
        for (b, (&valid_q, &valid_k)) in q_lengths.iter().zip(k_lengths).enumerate() {
            let valid_q = valid_q.min(q_len);
            let valid_k = valid_k.min(k_len);
            for i in 0..valid_q {
                for j in rule.key_span(i, valid_q, valid_k) {
                    mask.set(b, i, j, true);
                }
            }
        }
        Ok(mask)
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.batch, self.q_len, self.k_len)
    }

    fn index(&self, b: usize, i: usize, j: usize) -> usize {
        (b * self.q_len + i) * self.k_len + j
    }

    pub fn get(&self, b: usize, i: usize, j: usize) -> bool {
        self.data[self.index(b, i, j)]
    }

    pub(crate) fn set(&mut self, b: usize, i: usize, j: usize, keep: bool) {
        let idx = self.index(b, i, j);
        self.data[idx] = keep;
    }

    /// Element-wise conjunction of two masks with identical dims.
    pub fn and(&self, other: &KeepMask) -> Result<KeepMask> {
        if self.dims() != other.dims() {
            return Err(AttentionError::shape(format!(
                "mask dims {:?} and {:?} differ",
                self.dims(),
                other.dims()
            )));
        }
        Ok(KeepMask {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| a && b)
                .collect(),
            ..*self
        })
    }

    pub fn row_has_any(&self, b: usize, i: usize) -> bool {
        let start = self.index(b, i, 0);
        self.data[start..start + self.k_len].iter().any(|&keep| keep)
    }

    /// One flag per `(batch, query)` row: does the row see any key?
    pub fn row_validity(&self) -> Vec<bool> {
        (0..self.batch)
            .flat_map(|b| (0..self.q_len).map(move |i| (b, i)))
            .map(|(b, i)| self.row_has_any(b, i))
            .collect()
    }

    pub fn admitted(&self) -> usize {
        self.data.iter().filter(|&&keep| keep).count()
    }

    /// `[batch, 1, q_len, k_len]` tensor of dtype [`MASK_DTYPE`].
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<u8> = self.data.iter().map(|&keep| keep as u8).collect();
        Ok(Tensor::from_vec(
            data,
            (self.batch, 1, self.q_len, self.k_len),
            device,
        )?)
    }
}
