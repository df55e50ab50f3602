//! Shape descriptors validated from query/key/value tensors.

use candle_core::{DType, Tensor};

use super::errors::{AttentionError, Result};

/// Logical description of one attention invocation.
///
/// Dense inputs are `[batch, seqlen, heads, head_dim]`; packed inputs are
/// `[total_tokens, heads, head_dim]` and are described with `batch = 1` and
/// the token totals as sequence lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn dense(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self> {
        check_inputs(q, k, v)?;
        let (batch, seqlen_q, num_heads, head_dim) = q.dims4().map_err(|_| {
            AttentionError::shape("q must have shape [batch, seqlen_q, heads, head_dim]")
        })?;
        let (kb, seqlen_k, num_kv_heads, kd) = k.dims4().map_err(|_| {
            AttentionError::shape("k must have shape [batch, seqlen_k, kv_heads, head_dim]")
        })?;
        if kb != batch {
            return Err(AttentionError::shape(format!(
                "k batch {kb} does not match q batch {batch}"
            )));
        }
        let shape = Self {
            batch,
            seqlen_q,
            seqlen_k,
            num_heads,
            num_kv_heads,
            head_dim,
        };
        shape.check_heads(kd)?;
        if v.dims() != k.dims() {
            return Err(AttentionError::shape(format!(
                "v shape {:?} must equal k shape {:?}",
                v.dims(),
                k.dims()
            )));
        }
        Ok(shape)
    }

    pub fn packed(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self> {
        check_inputs(q, k, v)?;
        let (total_q, num_heads, head_dim) = q
            .dims3()
            .map_err(|_| AttentionError::shape("q must have shape [total_q, heads, head_dim]"))?;
        let (total_k, num_kv_heads, kd) = k.dims3().map_err(|_| {
            AttentionError::shape("k must have shape [total_k, kv_heads, head_dim]")
        })?;
        let shape = Self {
            batch: 1,
            seqlen_q: total_q,
            seqlen_k: total_k,
            num_heads,
            num_kv_heads,
            head_dim,
        };
        shape.check_heads(kd)?;
        if v.dims() != k.dims() {
            return Err(AttentionError::shape(format!(
                "v shape {:?} must equal k shape {:?}",
                v.dims(),
                k.dims()
            )));
        }
        Ok(shape)
    }

    fn check_heads(&self, k_head_dim: usize) -> Result<()> {
        if self.head_dim == 0 || k_head_dim != self.head_dim {
            return Err(AttentionError::shape(format!(
                "head_dim mismatch: q has {} and k has {}",
                self.head_dim, k_head_dim
            )));
        }
        if self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(AttentionError::shape(format!(
                "query heads ({}) must be a multiple of key/value heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        Ok(())
    }

    /// Query heads served by each key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn kv_head(&self, head: usize) -> usize {
        head / self.group_size()
    }

    /// Number of entries in a fully materialised score matrix.
    pub fn score_elements(&self) -> usize {
        self.batch * self.num_heads * self.seqlen_q * self.seqlen_k
    }
}

fn check_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }
    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn dense_shape_reports_group_size() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((2, 5, 6, 8), DType::F32, &device)?;
        let k = Tensor::zeros((2, 7, 2, 8), DType::F32, &device)?;
        let shape = AttentionShape::dense(&q, &k, &k)?;
        assert_eq!(shape.group_size(), 3);
        assert_eq!(shape.kv_head(4), 1);
        assert_eq!(shape.score_elements(), 2 * 6 * 5 * 7);
        Ok(())
    }

    #[test]
    fn non_divisible_heads_are_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 6, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 4, 4, 8), DType::F32, &device).unwrap();
        let err = AttentionShape::dense(&q, &k, &k).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mixed_dtypes_are_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((4, 2, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((4, 2, 8), DType::F16, &device).unwrap();
        assert!(AttentionShape::packed(&q, &k, &k).is_err());
    }

    #[test]
    fn integer_inputs_are_unsupported() {
        let device = Device::Cpu;
        let q = Tensor::zeros((4, 2, 8), DType::U32, &device).unwrap();
        let err = AttentionShape::packed(&q, &q, &q).unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }
}
