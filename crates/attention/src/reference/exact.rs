//! Materialised scaled dot-product attention with autograd gradients.
//!
//! The exact path prioritises numerical fidelity: it builds the full score
//! matrix, applies a [`KeepMask`] with `where_cond`, normalises with a
//! differentiable softmax and lets candle's autograd produce gradients.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::softmax;
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, AttentionShape, ForwardOutput, Gradients, Result};
use crate::masks::KeepMask;

/// Dtype in which the reference evaluates scores and softmax.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionPolicy {
    /// Upcast inputs to `f64`; the ground truth of every comparison.
    #[default]
    ForceF64,
    ForceF32,
    /// Round every intermediate to the input dtype, mimicking a
    /// low-precision framework path.
    Inherit,
}

impl PrecisionPolicy {
    /// Dtype the ops run in, and the dtype intermediates are rounded through
    /// after each op. Half-precision inputs run in f32 and round back, since
    /// the host backend has no bf16 matmul.
    pub fn resolve(self, input: DType) -> (DType, Option<DType>) {
        match (self, input) {
            (Self::ForceF64, _) => (DType::F64, None),
            (Self::ForceF32, _) => (DType::F32, None),
            (Self::Inherit, DType::F16 | DType::BF16) => (DType::F32, Some(input)),
            (Self::Inherit, _) => (input, None),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceOptions {
    pub precision: PrecisionPolicy,
    /// Scale the keys instead of the queries before the score product, which
    /// changes where rounding happens in low precision.
    pub reorder_ops: bool,
}

impl ReferenceOptions {
    pub fn high_precision() -> Self {
        Self::default()
    }

    /// Input-dtype evaluation with reordered scaling.
    pub fn low_precision() -> Self {
        Self {
            precision: PrecisionPolicy::Inherit,
            reorder_ops: true,
        }
    }
}

/// Numerically faithful, memory hungry attention.
#[derive(Debug)]
pub struct ExactAttention {
    options: ReferenceOptions,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new(options: ReferenceOptions) -> Self {
        Self {
            options,
            first_call: OnceLock::new(),
        }
    }

    pub fn options(&self) -> ReferenceOptions {
        self.options
    }

    /// Dense attention over `[batch, seqlen, heads, head_dim]` inputs with a
    /// `[batch, seqlen_q, seqlen_k]` mask.
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &KeepMask,
        softmax_scale: Option<f32>,
    ) -> Result<ForwardOutput> {
        let (fwd, _) = self.run(q, k, v, mask, softmax_scale, None)?;
        Ok(fwd)
    }

    /// Dense attention plus the gradients of `sum(out * grad_out)`.
    pub fn attend_with_grads(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &KeepMask,
        softmax_scale: Option<f32>,
        grad_out: &Tensor,
    ) -> Result<(ForwardOutput, Gradients)> {
        let (fwd, grads) = self.run(q, k, v, mask, softmax_scale, Some(grad_out))?;
        let grads = grads.ok_or_else(|| AttentionError::Backend {
            message: "autograd produced no gradients".to_string(),
        })?;
        Ok((fwd, grads))
    }

    /// Packed `[total, heads, head_dim]` inputs, treated as one sequence of
    /// `total` rows. The mask must be single-batch; LSE is `[heads, total_q]`.
    pub fn attend_packed(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &KeepMask,
        softmax_scale: Option<f32>,
    ) -> Result<ForwardOutput> {
        let (fwd, _) = self.run(
            &q.unsqueeze(0)?,
            &k.unsqueeze(0)?,
            &v.unsqueeze(0)?,
            mask,
            softmax_scale,
            None,
        )?;
        squeeze_forward(fwd)
    }

    pub fn attend_packed_with_grads(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &KeepMask,
        softmax_scale: Option<f32>,
        grad_out: &Tensor,
    ) -> Result<(ForwardOutput, Gradients)> {
        let (fwd, grads) = self.attend_with_grads(
            &q.unsqueeze(0)?,
            &k.unsqueeze(0)?,
            &v.unsqueeze(0)?,
            mask,
            softmax_scale,
            &grad_out.unsqueeze(0)?,
        )?;
        let grads = Gradients {
            dq: grads.dq.squeeze(0)?,
            dk: grads.dk.squeeze(0)?,
            dv: grads.dv.squeeze(0)?,
        };
        Ok((squeeze_forward(fwd)?, grads))
    }

    fn run(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &KeepMask,
        softmax_scale: Option<f32>,
        grad_out: Option<&Tensor>,
    ) -> Result<(ForwardOutput, Option<Gradients>)> {
        let shape = AttentionShape::dense(q, k, v)?;
        let AttentionShape {
            batch,
            seqlen_q,
            seqlen_k,
            num_heads,
            head_dim,
            ..
        } = shape;
        if mask.dims() != (batch, seqlen_q, seqlen_k) {
            return Err(AttentionError::shape(format!(
                "mask dims {:?} do not match [{batch}, {seqlen_q}, {seqlen_k}]",
                mask.dims()
            )));
        }
        if let Some(grad_out) = grad_out {
            if grad_out.dims() != q.dims() {
                return Err(AttentionError::shape(format!(
                    "grad_out shape {:?} must equal q shape {:?}",
                    grad_out.dims(),
                    q.dims()
                )));
            }
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init precision={:?} reorder_ops={}",
                self.options.precision,
                self.options.reorder_ops
            );
        }
        log::debug!(
            "reference attention b={batch} sq={seqlen_q} sk={seqlen_k} h={num_heads} hk={} d={head_dim}",
            shape.num_kv_heads
        );

        let dtype = q.dtype();
        let (work, rounding) = self.options.precision.resolve(dtype);
        let round = |x: Tensor| -> Result<Tensor> {
            match rounding {
                Some(low) => Ok(x.to_dtype(low)?.to_dtype(work)?),
                None => Ok(x),
            }
        };
        let device = q.device();
        let scale = softmax_scale.unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt()) as f64;

        let q_var = Var::from_tensor(&q.to_dtype(work)?)?;
        let k_var = Var::from_tensor(&k.to_dtype(work)?)?;
        let v_var = Var::from_tensor(&v.to_dtype(work)?)?;

        // [b, s, h, d] -> [b, h, s, d], key/value heads repeated per group.
        let q_t = q_var.as_tensor().transpose(1, 2)?;
        let k_t = repeat_kv(&k_var.as_tensor().transpose(1, 2)?, shape.group_size())?;
        let v_t = repeat_kv(&v_var.as_tensor().transpose(1, 2)?, shape.group_size())?;

        let scores = if self.options.reorder_ops {
            let k_scaled = round(k_t.affine(scale, 0.0)?)?;
            q_t.contiguous()?.matmul(&k_scaled.t()?.contiguous()?)?
        } else {
            let q_scaled = round(q_t.affine(scale, 0.0)?)?;
            q_scaled.contiguous()?.matmul(&k_t.t()?.contiguous()?)?
        };
        let scores = round(scores)?;

        let dims = (batch, num_heads, seqlen_q, seqlen_k);
        let keep = mask.to_tensor(device)?.broadcast_as(dims)?.contiguous()?;
        let fill = Tensor::new(mask_fill(work), device)?
            .to_dtype(work)?
            .broadcast_as(dims)?;
        let scores = keep.where_cond(&scores, &fill)?;

        let row_valid = mask.row_validity();
        let probs = round(softmax(&scores, D::Minus1)?)?
            .broadcast_mul(&row_weights(&row_valid, batch, seqlen_q, work, device)?)?;
        let out = round(probs.matmul(&v_t.contiguous()?)?)?
            .transpose(1, 2)?
            .contiguous()?;

        let lse = log_sum_exp(&scores.detach(), &row_valid, dims, device)?;

        let grads = match grad_out {
            None => None,
            Some(grad_out) => {
                let loss = out.mul(&grad_out.to_dtype(work)?)?.sum_all()?;
                let store = loss.backward()?;
                let fetch = |var: &Var, like: &Tensor| -> Result<Tensor> {
                    match store.get(var.as_tensor()) {
                        Some(grad) => Ok(grad.to_dtype(dtype)?),
                        None => Ok(like.zeros_like()?),
                    }
                };
                Some(Gradients {
                    dq: fetch(&q_var, q)?,
                    dk: fetch(&k_var, k)?,
                    dv: fetch(&v_var, v)?,
                })
            }
        };

        let fwd = ForwardOutput {
            out: out.detach().to_dtype(dtype)?,
            lse,
        };
        Ok((fwd, grads))
    }
}

impl Default for ExactAttention {
    fn default() -> Self {
        Self::new(ReferenceOptions::default())
    }
}

/// Large finite negative score for masked entries; finite so that fully
/// masked rows stay NaN-free through the softmax.
fn mask_fill(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -65504.0,
        _ => -1.0e30,
    }
}

fn repeat_kv(x: &Tensor, group: usize) -> Result<Tensor> {
    if group == 1 {
        return Ok(x.clone());
    }
    let (batch, kv_heads, seqlen, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .broadcast_as((batch, kv_heads, group, seqlen, head_dim))?
        .contiguous()?
        .reshape((batch, kv_heads * group, seqlen, head_dim))?)
}

/// `[batch, 1, seqlen_q, 1]` weights zeroing rows that see no key.
fn row_weights(
    row_valid: &[bool],
    batch: usize,
    seqlen_q: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let weights: Vec<f32> = row_valid.iter().map(|&valid| valid as u8 as f32).collect();
    Ok(Tensor::from_vec(weights, (batch, 1, seqlen_q, 1), device)?.to_dtype(dtype)?)
}

fn log_sum_exp(
    scores: &Tensor,
    row_valid: &[bool],
    dims: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let (batch, heads, seqlen_q, _) = dims;
    let max = scores.max_keepdim(D::Minus1)?;
    let sum = scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    let lse = max
        .add(&sum.log()?)?
        .squeeze(D::Minus1)?
        .to_dtype(DType::F32)?;

    let flags: Vec<u8> = row_valid.iter().map(|&valid| valid as u8).collect();
    let valid = Tensor::from_vec(flags, (batch, 1, seqlen_q), device)?
        .broadcast_as((batch, heads, seqlen_q))?
        .contiguous()?;
    let inf = Tensor::new(f32::INFINITY, device)?.broadcast_as((batch, heads, seqlen_q))?;
    Ok(valid.where_cond(&lse, &inf)?)
}

fn squeeze_forward(fwd: ForwardOutput) -> Result<ForwardOutput> {
    Ok(ForwardOutput {
        out: fwd.out.squeeze(0)?,
        lse: fwd.lse.squeeze(0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{build_causal_mask, build_local_mask};
    use crate::WindowSize;

    fn build_inputs(
        device: &Device,
        shape_q: (usize, usize, usize, usize),
        shape_k: (usize, usize, usize, usize),
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let fill = |shape: (usize, usize, usize, usize), salt: f32| -> Result<Tensor> {
            let total = shape.0 * shape.1 * shape.2 * shape.3;
            let data: Vec<f32> = (0..total)
                .map(|i| ((i as f32 * 0.37 + salt).sin()) * 0.8)
                .collect();
            Ok(Tensor::from_vec(data, shape, device)?)
        };
        Ok((fill(shape_q, 0.1)?, fill(shape_k, 1.3)?, fill(shape_k, 2.9)?))
    }

    fn idx(b: usize, s: usize, h: usize, d: usize, seq: usize, heads: usize, dim: usize) -> usize {
        ((b * seq + s) * heads + h) * dim + d
    }

    /// Row-by-row softmax attention on the host for `[b, s, h, d]` inputs.
    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor, mask: &KeepMask) -> Result<Vec<f32>> {
        let (batch, q_len, heads, dim) = q.dims4()?;
        let (_, k_len, kv_heads, _) = k.dims4()?;
        let group = heads / kv_heads;
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (dim as f32).sqrt();
        let mut output = vec![0f32; q_vec.len()];
        for b in 0..batch {
            for h in 0..heads {
                let hk = h / group;
                for i in 0..q_len {
                    let mut row = vec![f32::NEG_INFINITY; k_len];
                    for (j, slot) in row.iter_mut().enumerate() {
                        if mask.get(b, i, j) {
                            *slot = (0..dim)
                                .map(|d| {
                                    q_vec[idx(b, i, h, d, q_len, heads, dim)]
                                        * k_vec[idx(b, j, hk, d, k_len, kv_heads, dim)]
                                })
                                .sum::<f32>()
                                * scale;
                        }
                    }
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    if max == f32::NEG_INFINITY {
                        continue;
                    }
                    let weights: Vec<f32> = row.iter().map(|s| (s - max).exp()).collect();
                    let denom: f32 = weights.iter().sum();
                    for d in 0..dim {
                        output[idx(b, i, h, d, q_len, heads, dim)] = (0..k_len)
                            .map(|j| weights[j] / denom * v_vec[idx(b, j, hk, d, k_len, kv_heads, dim)])
                            .sum();
                    }
                }
            }
        }
        Ok(output)
    }

    fn max_diff(a: &Tensor, b: &[f32]) -> Result<f32> {
        let a = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max))
    }

    #[test]
    fn exact_attention_matches_naive() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (2, 4, 2, 8), (2, 6, 2, 8))?;
        let mask = build_causal_mask(2, 4, 6);
        let out = ExactAttention::default().attend(&q, &k, &v, &mask, None)?;
        assert_eq!(out.out.dims(), q.dims());
        assert_eq!(out.out.dtype(), DType::F32);
        assert!(max_diff(&out.out, &naive_attention(&q, &k, &v, &mask)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn grouped_heads_read_their_shared_kv_head() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (1, 5, 6, 4), (1, 5, 2, 4))?;
        let mask = build_local_mask(1, 5, 5, WindowSize::new(1, 2), false);
        let out = ExactAttention::default().attend(&q, &k, &v, &mask, None)?;
        assert!(max_diff(&out.out, &naive_attention(&q, &k, &v, &mask)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn empty_rows_yield_zero_output_and_infinite_lse() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (1, 4, 1, 4), (1, 2, 1, 4))?;
        // q_len > k_len under causality: the first two rows see nothing.
        let mask = build_causal_mask(1, 4, 2);
        let out = ExactAttention::default().attend(&q, &k, &v, &mask, None)?;
        let values = out.out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values[..8].iter().all(|&x| x == 0.0));
        assert!(values.iter().all(|x| x.is_finite()));
        let lse = out.lse.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out.lse.dims(), &[1, 1, 4]);
        assert!(lse[0].is_infinite() && lse[1].is_infinite());
        assert!(lse[2].is_finite() && lse[3].is_finite());
        Ok(())
    }

    #[test]
    fn lse_matches_single_key_score() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::from_vec(vec![1.0f32, 2.0], (1, 1, 1, 2), &device)?;
        let k = Tensor::from_vec(vec![0.5f32, 0.25], (1, 1, 1, 2), &device)?;
        let out = ExactAttention::default().attend(&q, &k, &k, &KeepMask::full(1, 1, 1), Some(2.0))?;
        let lse = out.lse.flatten_all()?.to_vec1::<f32>()?;
        assert!((lse[0] - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn precision_policies_agree() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (1, 6, 2, 8), (1, 6, 2, 8))?;
        let mask = build_causal_mask(1, 6, 6);
        let reference = ExactAttention::default().attend(&q, &k, &v, &mask, None)?;
        let expected = reference.out.flatten_all()?.to_vec1::<f32>()?;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let low = ExactAttention::new(ReferenceOptions::low_precision()).attend(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                &mask,
                None,
            )?;
            assert_eq!(low.out.dtype(), dtype);
            let diff = max_diff(&low.out, &expected)?;
            assert!(diff < 5e-2, "dtype {dtype:?} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn half_inputs_run_in_f32_and_round_back() {
        let policy = PrecisionPolicy::Inherit;
        assert_eq!(policy.resolve(DType::BF16), (DType::F32, Some(DType::BF16)));
        assert_eq!(policy.resolve(DType::F16), (DType::F32, Some(DType::F16)));
        assert_eq!(policy.resolve(DType::F32), (DType::F32, None));
        assert_eq!(PrecisionPolicy::ForceF64.resolve(DType::BF16), (DType::F64, None));
    }

    #[test]
    fn bf16_gradients_track_the_f64_reference() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (2, 5, 4, 8), (2, 7, 2, 8))?;
        let grad_out = (q.ones_like()? * 0.5)?;
        let mask = build_causal_mask(2, 5, 7);
        let (_, exact) =
            ExactAttention::default().attend_with_grads(&q, &k, &v, &mask, None, &grad_out)?;
        let bf16 = |t: &Tensor| t.to_dtype(DType::BF16);
        let (fwd, low) = ExactAttention::new(ReferenceOptions::low_precision()).attend_with_grads(
            &bf16(&q)?,
            &bf16(&k)?,
            &bf16(&v)?,
            &mask,
            None,
            &bf16(&grad_out)?,
        )?;
        assert_eq!(fwd.out.dtype(), DType::BF16);
        for (name, low, exact) in [
            ("dq", &low.dq, &exact.dq),
            ("dk", &low.dk, &exact.dk),
            ("dv", &low.dv, &exact.dv),
        ] {
            assert_eq!(low.dtype(), DType::BF16, "{name}");
            let expected = exact.flatten_all()?.to_vec1::<f32>()?;
            let diff = max_diff(low, &expected)?;
            assert!(diff < 5e-2, "{name} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn value_gradients_sum_to_upstream_gradient() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (1, 3, 1, 4), (1, 5, 1, 4))?;
        let grad_out = Tensor::ones((1, 3, 1, 4), DType::F32, &device)?;
        let (_, grads) = ExactAttention::default().attend_with_grads(
            &q,
            &k,
            &v,
            &KeepMask::full(1, 3, 5),
            None,
            &grad_out,
        )?;
        assert_eq!(grads.dk.dims(), k.dims());
        // Softmax rows sum to one, so dv summed over keys equals the number
        // of query rows for an all-ones upstream gradient.
        let total = grads.dv.sum_all()?.to_vec0::<f32>()?;
        assert!((total - 3.0 * 4.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn single_key_has_no_query_gradient() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (1, 2, 1, 4), (1, 1, 1, 4))?;
        let grad_out = Tensor::ones((1, 2, 1, 4), DType::F32, &device)?;
        let (fwd, grads) = ExactAttention::default().attend_with_grads(
            &q,
            &k,
            &v,
            &KeepMask::full(1, 2, 1),
            None,
            &grad_out,
        )?;
        let dq = grads.dq.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(dq < 1e-6);
        // Every query copies the single value row.
        let out = fwd.out.flatten_all()?.to_vec1::<f32>()?;
        let v_row = v.flatten_all()?.to_vec1::<f32>()?;
        assert!(out[..4].iter().zip(&v_row).all(|(a, b)| (a - b).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn packed_layout_matches_dense_batch_of_one() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, (1, 5, 2, 4), (1, 7, 1, 4))?;
        let mask = build_causal_mask(1, 5, 7);
        let attention = ExactAttention::default();
        let dense = attention.attend(&q, &k, &v, &mask, None)?;
        let packed = attention.attend_packed(&q.squeeze(0)?, &k.squeeze(0)?, &v.squeeze(0)?, &mask, None)?;
        assert_eq!(packed.out.dims(), &[5, 2, 4]);
        assert_eq!(packed.lse.dims(), &[2, 5]);
        let dense_out = dense.out.flatten_all()?.to_vec1::<f32>()?;
        assert!(max_diff(&packed.out, &dense_out)? == 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_mask_errors() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 2, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &q, &q, &KeepMask::full(1, 4, 5), None)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }
}
