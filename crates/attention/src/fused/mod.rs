//! Tiled flash attention on the host.
//!
//! [`CpuFlashAttention`] never materialises the score matrix. Inputs are
//! copied into packed f32 buffers, the forward pass streams key tiles through
//! an online softmax per query row, and the backward pass recomputes the
//! probabilities from the stored log-sum-exp. Outputs and gradients are
//! rounded back to the dtype of the inputs.

mod backward;
mod forward;
mod plan;

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};

use crate::core::{
    AttentionConfig, AttentionError, AttentionShape, FlashKernel, ForwardOutput, Gradients, Result,
};
use crate::quant::{Descale, Fp8Tensor};
use crate::varlen::{RangeSet, VarlenBatch};

use backward::{BackwardInputs, HostGradients};
use plan::{HostTensor, Plan};

#[derive(Debug, Default)]
pub struct CpuFlashAttention {
    first_call: OnceLock<()>,
}

/// How the log-sum-exp tensor is laid out for the caller.
#[derive(Debug, Clone, Copy)]
enum LseLayout {
    /// `[batch, heads, seqlen_q]`.
    Dense { batch: usize, seqlen_q: usize },
    /// `[heads, total_q]`.
    Packed,
}

impl CpuFlashAttention {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve<'a>(&self, cfg: &'a AttentionConfig) -> Result<&'a AttentionConfig> {
        cfg.validate()?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::fused init block_q={} block_k={} deterministic={} threads={}",
                cfg.block_q,
                cfg.block_k,
                cfg.deterministic,
                rayon::current_num_threads()
            );
        }
        Ok(cfg)
    }

    fn run_forward(
        &self,
        plan: &Plan,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out_dtype: DType,
        layout: LseLayout,
    ) -> Result<ForwardOutput> {
        log::debug!(
            "fused forward segments={} rows_q={} rows_k={} heads={}/{} d={} gqa_parallel={}",
            plan.segments.len(),
            plan.total_q,
            plan.total_k,
            plan.num_heads,
            plan.num_kv_heads,
            plan.head_dim,
            plan.gqa_parallel
        );
        let host = forward::forward(
            plan,
            &HostTensor::from_tensor(q)?,
            &HostTensor::from_tensor(k)?,
            &HostTensor::from_tensor(v)?,
        );
        let device = q.device();
        Ok(ForwardOutput {
            out: host.out.into_tensor(q.dims(), out_dtype, device)?,
            lse: lse_to_tensor(host.lse, plan, layout, device)?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_backward(
        &self,
        plan: &Plan,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        layout: LseLayout,
    ) -> Result<Gradients> {
        for (name, tensor) in [("dout", dout), ("out", &fwd.out)] {
            if tensor.dims() != q.dims() {
                return Err(AttentionError::shape(format!(
                    "{name} shape {:?} must equal q shape {:?}",
                    tensor.dims(),
                    q.dims()
                )));
            }
        }
        log::debug!(
            "fused backward segments={} deterministic={}",
            plan.segments.len(),
            plan.deterministic
        );
        let lse = lse_from_tensor(&fwd.lse, plan, layout)?;
        let (q_host, k_host, v_host) = (
            HostTensor::from_tensor(q)?,
            HostTensor::from_tensor(k)?,
            HostTensor::from_tensor(v)?,
        );
        let (out_host, dout_host) = (
            HostTensor::from_tensor(&fwd.out)?,
            HostTensor::from_tensor(dout)?,
        );
        let HostGradients { dq, dk, dv } = backward::backward(
            plan,
            &BackwardInputs {
                q: &q_host,
                k: &k_host,
                v: &v_host,
                out: &out_host,
                dout: &dout_host,
                lse: &lse,
            },
        )?;
        let device = q.device();
        Ok(Gradients {
            dq: dq.into_tensor(q.dims(), q.dtype(), device)?,
            dk: dk.into_tensor(k.dims(), k.dtype(), device)?,
            dv: dv.into_tensor(v.dims(), v.dtype(), device)?,
        })
    }
}

fn lse_to_tensor(lse: Vec<f32>, plan: &Plan, layout: LseLayout, device: &Device) -> Result<Tensor> {
    let packed = Tensor::from_vec(lse, (plan.num_heads, plan.total_q), device)?;
    match layout {
        LseLayout::Packed => Ok(packed),
        LseLayout::Dense { batch, seqlen_q } => Ok(packed
            .reshape((plan.num_heads, batch, seqlen_q))?
            .transpose(0, 1)?
            .contiguous()?),
    }
}

fn lse_from_tensor(lse: &Tensor, plan: &Plan, layout: LseLayout) -> Result<Vec<f32>> {
    let packed = match layout {
        LseLayout::Packed => {
            if lse.dims() != [plan.num_heads, plan.total_q] {
                return Err(AttentionError::shape(format!(
                    "lse shape {:?} must be [{}, {}]",
                    lse.dims(),
                    plan.num_heads,
                    plan.total_q
                )));
            }
            lse.clone()
        }
        LseLayout::Dense { batch, seqlen_q } => {
            if lse.dims() != [batch, plan.num_heads, seqlen_q] {
                return Err(AttentionError::shape(format!(
                    "lse shape {:?} must be [{batch}, {}, {seqlen_q}]",
                    lse.dims(),
                    plan.num_heads
                )));
            }
            lse.transpose(0, 1)?.contiguous()?
        }
    };
    Ok(packed.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

impl FlashKernel for CpuFlashAttention {
    fn name(&self) -> &'static str {
        "cpu-flash"
    }

    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput> {
        let cfg = self.resolve(cfg)?;
        let shape = AttentionShape::dense(q, k, v)?;
        let plan = Plan::dense(&shape, cfg);
        let layout = LseLayout::Dense {
            batch: shape.batch,
            seqlen_q: shape.seqlen_q,
        };
        self.run_forward(&plan, q, k, v, q.dtype(), layout)
    }

    fn forward_fp8(
        &self,
        q: &Fp8Tensor,
        k: &Fp8Tensor,
        v: &Fp8Tensor,
        descale: &Descale,
        out_dtype: DType,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput> {
        if !matches!(out_dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("fp8 output {out_dtype:?}"),
            });
        }
        let cfg = self.resolve(cfg)?;
        let q = q.dequantize(descale.q, DType::F32)?;
        let k = k.dequantize(descale.k, DType::F32)?;
        let v = v.dequantize(descale.v, DType::F32)?;
        let shape = AttentionShape::dense(&q, &k, &v)?;
        let plan = Plan::dense(&shape, cfg);
        let layout = LseLayout::Dense {
            batch: shape.batch,
            seqlen_q: shape.seqlen_q,
        };
        self.run_forward(&plan, &q, &k, &v, out_dtype, layout)
    }

    fn backward(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        cfg: &AttentionConfig,
    ) -> Result<Gradients> {
        let cfg = self.resolve(cfg)?;
        let shape = AttentionShape::dense(q, k, v)?;
        let plan = Plan::dense(&shape, cfg);
        let layout = LseLayout::Dense {
            batch: shape.batch,
            seqlen_q: shape.seqlen_q,
        };
        self.run_backward(&plan, dout, q, k, v, fwd, layout)
    }

    fn varlen_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        batch: &VarlenBatch,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput> {
        let cfg = self.resolve(cfg)?;
        let shape = AttentionShape::packed(q, k, v)?;
        let plan = Plan::varlen(&shape, batch, cfg)?;
        self.run_forward(&plan, q, k, v, q.dtype(), LseLayout::Packed)
    }

    fn varlen_backward(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        batch: &VarlenBatch,
        cfg: &AttentionConfig,
    ) -> Result<Gradients> {
        let cfg = self.resolve(cfg)?;
        let shape = AttentionShape::packed(q, k, v)?;
        let plan = Plan::varlen(&shape, batch, cfg)?;
        self.run_backward(&plan, dout, q, k, v, fwd, LseLayout::Packed)
    }

    fn flex_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ranges: &RangeSet,
        cfg: &AttentionConfig,
    ) -> Result<ForwardOutput> {
        let cfg = self.resolve(cfg)?;
        let shape = AttentionShape::packed(q, k, v)?;
        let plan = Plan::flex(&shape, ranges, cfg)?;
        self.run_forward(&plan, q, k, v, q.dtype(), LseLayout::Packed)
    }

    fn flex_backward(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        fwd: &ForwardOutput,
        ranges: &RangeSet,
        cfg: &AttentionConfig,
    ) -> Result<Gradients> {
        let cfg = self.resolve(cfg)?;
        let shape = AttentionShape::packed(q, k, v)?;
        let plan = Plan::flex(&shape, ranges, cfg)?;
        self.run_backward(&plan, dout, q, k, v, fwd, LseLayout::Packed)
    }
}
