//! Suite runners comparing a [`FlashKernel`] against the exact reference.
//!
//! Every case draws its inputs from a freshly seeded generator, runs the
//! kernel, then evaluates the same inputs twice with [`ExactAttention`]: once
//! upcast to f64 (the ground truth) and once in the input dtype (the
//! baseline). The kernel passes when its error stays within an
//! [`ErrorBudget`] of the baseline's error.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::cases::{
    dense_cases, flex_cases, fp8_cases, varlen_cases, DenseCase, FlexCase, Fp8Case, Suite,
    VarlenCase, NUM_HEADS,
};
use super::config::HarnessConfig;
use super::inputs::{randn, sample_window};
use super::report::{update_results, CaseOutcome, CaseReport, SuiteReport};
use super::tolerance::{assert_close, outliers, DiffStats, ErrorBudget, Metric};
use crate::core::{AttentionConfig, AttentionError, FlashKernel, Gradients, Result, WindowSize};
use crate::masks::{generate_random_padding_mask, split_unused, KeepMask, PaddingMode};
use crate::quant::{Descale, Fp8Tensor};
use crate::reference::{ExactAttention, PrecisionPolicy, ReferenceOptions};
use crate::varlen::{generate_qk_ranges, generate_qkv};

/// Relative and absolute slack of the fp8 output comparison.
const FP8_RTOL: f32 = 1e-2;
const FP8_ATOL: f32 = 1e-2;
const FP8_BASELINE_FACTOR: f32 = 4.0;
/// Outliers listed in the debug log of a failed case.
const OUTLIER_LIMIT: usize = 8;

pub struct Harness<K> {
    kernel: K,
    config: HarnessConfig,
    reference: ExactAttention,
    baseline: ExactAttention,
    /// Input-dtype evaluation without reordered scaling.
    flex_baseline: ExactAttention,
    device: Device,
}

impl<K: FlashKernel> Harness<K> {
    pub fn new(kernel: K, config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            kernel,
            config,
            reference: ExactAttention::new(ReferenceOptions::high_precision()),
            baseline: ExactAttention::new(ReferenceOptions::low_precision()),
            flex_baseline: ExactAttention::new(ReferenceOptions {
                precision: PrecisionPolicy::Inherit,
                reorder_ops: false,
            }),
            device: Device::Cpu,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn attention_config(
        &self,
        causal: bool,
        window: WindowSize,
        deterministic: bool,
        gqa_parallel: bool,
    ) -> AttentionConfig {
        AttentionConfig {
            causal,
            window,
            softmax_scale: None,
            deterministic,
            gqa_parallel,
            block_q: self.config.block_q,
            block_k: self.config.block_k,
        }
    }

    fn oversized(&self, label: &str, bytes: u64) -> Option<CaseReport> {
        let limit = self.config.reference_memory_limit;
        (bytes > limit).then(|| {
            CaseReport::skipped(
                label.to_string(),
                format!(
                    "reference needs {} MiB, limit is {} MiB",
                    bytes >> 20,
                    limit >> 20
                ),
            )
        })
    }

    fn randn(&self, rng: &mut StdRng, dims: &[usize], dtype: DType) -> Result<Tensor> {
        randn(rng, dims, dtype, &self.device)
    }

    pub fn run_dense(&self, case: &DenseCase) -> Result<CaseReport> {
        let label = case.label();
        if let Some(skipped) = self.oversized(&label, case.reference_bytes()) {
            return Ok(skipped);
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed_for(Suite::Dense));
        let window = if case.local {
            sample_window(&mut rng, case.seqlen_k)
        } else {
            WindowSize::UNBOUNDED
        };
        let dtype = case.dtype.dtype();
        let kv_heads = case.mha.kv_heads();
        let q = self.randn(
            &mut rng,
            &[case.batch, case.seqlen_q, NUM_HEADS, case.head_dim],
            dtype,
        )?;
        let k = self.randn(
            &mut rng,
            &[case.batch, case.seqlen_k, kv_heads, case.head_dim],
            dtype,
        )?;
        let v = self.randn(
            &mut rng,
            &[case.batch, case.seqlen_k, kv_heads, case.head_dim],
            dtype,
        )?;
        let cfg = self.attention_config(case.causal, window, case.deterministic, case.gqa_parallel);
        let mask = KeepMask::for_lengths(
            cfg.mask_rule(),
            &vec![case.seqlen_q; case.batch],
            &vec![case.seqlen_k; case.batch],
            case.seqlen_q,
            case.seqlen_k,
        )?;

        let fwd = match self.kernel.forward(&q, &k, &v, &cfg) {
            Ok(fwd) => fwd,
            Err(err) => return Ok(kernel_failure(label, "forward", err)),
        };

        if !case.checks_gradients() {
            let reference = self.reference.attend(&q, &k, &v, &mask, None)?;
            let baseline = self.baseline.attend(&q, &k, &v, &mask, None)?;
            let metrics = vec![judge(
                "out",
                &fwd.out,
                &reference.out,
                &baseline.out,
                ErrorBudget::DENSE,
            )?];
            let report = CaseReport::judged(label, metrics, Vec::new());
            return self.conclude(report, &fwd.out, &reference.out);
        }

        let dout = self.randn(&mut rng, q.dims(), dtype)?;
        let (reference, ref_grads) =
            self.reference
                .attend_with_grads(&q, &k, &v, &mask, None, &dout)?;
        let (baseline, base_grads) =
            self.baseline
                .attend_with_grads(&q, &k, &v, &mask, None, &dout)?;
        let grads = match self.kernel.backward(&dout, &q, &k, &v, &fwd, &cfg) {
            Ok(grads) => grads,
            Err(err) => return Ok(kernel_failure(label, "backward", err)),
        };

        let mut metrics = vec![judge(
            "out",
            &fwd.out,
            &reference.out,
            &baseline.out,
            ErrorBudget::DENSE,
        )?];
        metrics.extend(judge_gradients(
            &grads,
            &ref_grads,
            &base_grads,
            [ErrorBudget::DENSE; 3],
        )?);
        let report = CaseReport::judged(label, metrics, Vec::new());
        self.conclude(report, &fwd.out, &reference.out)
    }

    pub fn run_fp8(&self, case: &Fp8Case) -> Result<CaseReport> {
        let label = case.label();
        if let Some(skipped) = self.oversized(&label, case.reference_bytes()) {
            return Ok(skipped);
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed_for(Suite::Fp8));
        let window = if case.local {
            sample_window(&mut rng, case.seqlen_k)
        } else {
            WindowSize::UNBOUNDED
        };
        let kv_heads = case.mha.kv_heads();
        let source = DType::BF16;
        let q = self.randn(
            &mut rng,
            &[case.batch, case.seqlen_q, NUM_HEADS, case.head_dim],
            source,
        )?;
        let k = self.randn(
            &mut rng,
            &[case.batch, case.seqlen_k, kv_heads, case.head_dim],
            source,
        )?;
        let v = self.randn(
            &mut rng,
            &[case.batch, case.seqlen_k, kv_heads, case.head_dim],
            source,
        )?;
        let (q8, k8, v8) = (
            Fp8Tensor::quantize(&q)?,
            Fp8Tensor::quantize(&k)?,
            Fp8Tensor::quantize(&v)?,
        );
        let descale = Descale::uniform(case.descale)?;
        let cfg = self.attention_config(case.causal, window, true, case.gqa_parallel);

        let fwd = match self
            .kernel
            .forward_fp8(&q8, &k8, &v8, &descale, source, &cfg)
        {
            Ok(fwd) => fwd,
            Err(err) => return Ok(kernel_failure(label, "fp8 forward", err)),
        };

        // The reference sees exactly the values the kernel reconstructs.
        let q = q8.dequantize(descale.q, source)?;
        let k = k8.dequantize(descale.k, source)?;
        let v = v8.dequantize(descale.v, source)?;
        let mask = KeepMask::for_lengths(
            cfg.mask_rule(),
            &vec![case.seqlen_q; case.batch],
            &vec![case.seqlen_k; case.batch],
            case.seqlen_q,
            case.seqlen_k,
        )?;
        let reference = self.reference.attend(&q, &k, &v, &mask, None)?;
        let baseline = self.baseline.attend(&q, &k, &v, &mask, None)?;

        let kernel_err = DiffStats::between(&fwd.out, &reference.out)?;
        let baseline_err = DiffStats::between(&baseline.out, &reference.out)?;
        let atol = FP8_BASELINE_FACTOR * baseline_err.max_abs + FP8_ATOL;
        let close = assert_close("out", &fwd.out, &reference.out, FP8_RTOL, atol)?;
        let metric = Metric {
            name: "out".to_string(),
            kernel: kernel_err,
            baseline: baseline_err,
            allowance: atol,
            passed: close.is_none(),
        };
        let report =
            CaseReport::judged(label, vec![metric], Vec::new()).with_notes(close.into_iter().collect());
        self.conclude(report, &fwd.out, &reference.out)
    }

    pub fn run_varlen(&self, case: &VarlenCase) -> Result<CaseReport> {
        let label = case.label();
        if let Some(skipped) = self.oversized(&label, case.reference_bytes()) {
            return Ok(skipped);
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed_for(Suite::Varlen));
        let window = if case.local {
            sample_window(&mut rng, case.seqlen_k)
        } else {
            WindowSize::UNBOUNDED
        };
        let dtype = case.dtype.dtype();
        let kv_heads = case.mha.kv_heads();
        let (batch, seqlen_q, seqlen_k) = (case.batch, case.seqlen_q, case.seqlen_k);
        let q = self.randn(&mut rng, &[batch, seqlen_q, NUM_HEADS, case.head_dim], dtype)?;
        let k = self.randn(&mut rng, &[batch, seqlen_k, kv_heads, case.head_dim], dtype)?;
        let v = self.randn(&mut rng, &[batch, seqlen_k, kv_heads, case.head_dim], dtype)?;

        let query_padding =
            generate_random_padding_mask(&mut rng, seqlen_q, batch, PaddingMode::Random, false);
        let key_padding =
            generate_random_padding_mask(&mut rng, seqlen_k, batch, PaddingMode::Random, true);
        let (query_padding, query_unused) = if case.add_unused {
            let other =
                generate_random_padding_mask(&mut rng, seqlen_q, batch, PaddingMode::Random, false);
            let (attend, unused) = split_unused(&query_padding, &other)?;
            (attend, Some(unused))
        } else {
            (query_padding, None)
        };
        let (key_padding, key_unused) = if case.add_unused {
            let other =
                generate_random_padding_mask(&mut rng, seqlen_k, batch, PaddingMode::Random, false);
            let (attend, unused) = split_unused(&key_padding, &other)?;
            (attend, Some(unused))
        } else {
            (key_padding, None)
        };

        let unpadded = generate_qkv(
            &q,
            &k,
            &v,
            &query_padding,
            &key_padding,
            query_unused.as_deref(),
            key_unused.as_deref(),
        )?;
        log::debug!(
            "varlen {label}: cu_seqlens_q={:?} cu_seqlens_k={:?}",
            unpadded.batch.cu_seqlens_q,
            unpadded.batch.cu_seqlens_k
        );
        let cfg = self.attention_config(case.causal, window, case.deterministic, false);

        let fwd = match self.kernel.varlen_forward(
            &unpadded.q,
            &unpadded.k,
            &unpadded.v,
            &unpadded.batch,
            &cfg,
        ) {
            Ok(fwd) => fwd,
            Err(err) => return Ok(kernel_failure(label, "varlen forward", err)),
        };
        let out = zero_rows(&unpadded.pad_queries(&fwd.out)?, query_unused.as_deref())?;

        let mask = KeepMask::from_padding(cfg.mask_rule(), &query_padding, &key_padding)?;
        let dout = self.randn(&mut rng, out.dims(), dtype)?;

        if !case.checks_gradients() {
            let reference = self.reference.attend(&q, &k, &v, &mask, None)?;
            let baseline = self.baseline.attend(&q, &k, &v, &mask, None)?;
            let metrics = vec![judge(
                "out",
                &out,
                &reference.out,
                &baseline.out,
                ErrorBudget::PACKED_OUT,
            )?];
            let report = CaseReport::judged(label, metrics, Vec::new());
            return self.conclude(report, &out, &reference.out);
        }

        let (reference, ref_grads) =
            self.reference
                .attend_with_grads(&q, &k, &v, &mask, None, &dout)?;
        let (baseline, base_grads) =
            self.baseline
                .attend_with_grads(&q, &k, &v, &mask, None, &dout)?;
        let grads = match self.kernel.varlen_backward(
            &unpadded.pack_queries(&dout)?,
            &unpadded.q,
            &unpadded.k,
            &unpadded.v,
            &fwd,
            &unpadded.batch,
            &cfg,
        ) {
            Ok(grads) => grads,
            Err(err) => return Ok(kernel_failure(label, "varlen backward", err)),
        };
        let grads = Gradients {
            dq: zero_rows(&unpadded.pad_queries(&grads.dq)?, query_unused.as_deref())?,
            dk: zero_rows(&unpadded.pad_keys(&grads.dk)?, key_unused.as_deref())?,
            dv: zero_rows(&unpadded.pad_keys(&grads.dv)?, key_unused.as_deref())?,
        };

        let mut metrics = vec![judge(
            "out",
            &out,
            &reference.out,
            &baseline.out,
            ErrorBudget::PACKED_OUT,
        )?];
        metrics.extend(judge_gradients(
            &grads,
            &ref_grads,
            &base_grads,
            [ErrorBudget::PACKED_GRAD; 3],
        )?);
        let report = CaseReport::judged(label, metrics, Vec::new());
        self.conclude(report, &out, &reference.out)
    }

    pub fn run_flex(&self, case: &FlexCase) -> Result<CaseReport> {
        let label = case.label();
        if let Some(skipped) = self.oversized(&label, case.reference_bytes()) {
            return Ok(skipped);
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed_for(Suite::Flex));
        let (total_q, total_k) = (case.total_q(), case.total_k());
        let ranges = generate_qk_ranges(&mut rng, total_q, total_k, case.bsz)?;
        let dtype = case.dtype.dtype();
        let kv_heads = case.mha.kv_heads();
        let q = self.randn(&mut rng, &[total_q, NUM_HEADS, case.head_dim], dtype)?;
        let k = self.randn(&mut rng, &[total_k, kv_heads, case.head_dim], dtype)?;
        let v = self.randn(&mut rng, &[total_k, kv_heads, case.head_dim], dtype)?;
        let dout = self.randn(&mut rng, &[total_q, NUM_HEADS, case.head_dim], dtype)?;
        let cfg = self.attention_config(false, WindowSize::UNBOUNDED, false, false);

        let fwd = match self.kernel.flex_forward(&q, &k, &v, &ranges, &cfg) {
            Ok(fwd) => fwd,
            Err(err) => return Ok(kernel_failure(label, "flex forward", err)),
        };
        let grads = match self
            .kernel
            .flex_backward(&dout, &q, &k, &v, &fwd, &ranges, &cfg)
        {
            Ok(grads) => grads,
            Err(err) => return Ok(kernel_failure(label, "flex backward", err)),
        };

        let mask = KeepMask::from_ranges(&ranges, total_q, total_k)?;
        let (reference, ref_grads) =
            self.reference
                .attend_packed_with_grads(&q, &k, &v, &mask, None, &dout)?;
        let (low, low_grads) =
            self.flex_baseline
                .attend_packed_with_grads(&q, &k, &v, &mask, None, &dout)?;

        let mut metrics = vec![
            judge_versus_low("out", &fwd.out, &low.out, &reference.out, ErrorBudget::PACKED_OUT)?,
            judge_versus_low(
                "dq",
                &grads.dq,
                &low_grads.dq,
                &ref_grads.dq,
                ErrorBudget::PACKED_OUT,
            )?,
        ];
        if case.checks_kv_gradients() {
            metrics.push(judge_versus_low(
                "dk",
                &grads.dk,
                &low_grads.dk,
                &ref_grads.dk,
                ErrorBudget::PACKED_GRAD,
            )?);
            metrics.push(judge_versus_low(
                "dv",
                &grads.dv,
                &low_grads.dv,
                &ref_grads.dv,
                ErrorBudget::PACKED_GRAD,
            )?);
        }

        let eps = case.dtype.epsilon();
        let mut notes = Vec::new();
        for (name, actual, expected) in [
            ("out", &fwd.out, &reference.out),
            ("dq", &grads.dq, &ref_grads.dq),
            ("dk", &grads.dk, &ref_grads.dk),
            ("dv", &grads.dv, &ref_grads.dv),
        ] {
            notes.extend(assert_close(name, actual, expected, eps, eps)?);
        }
        for note in &notes {
            log::debug!("flex {label}: tight check {note}");
        }

        let report = CaseReport::judged(label, metrics, Vec::new()).with_notes(notes);
        self.conclude(report, &fwd.out, &reference.out)
    }

    /// Log the outcome; failed cases also list their worst output elements.
    fn conclude(&self, report: CaseReport, out: &Tensor, reference: &Tensor) -> Result<CaseReport> {
        for metric in &report.metrics {
            log::debug!(
                "{}: {} kernel {} baseline {}",
                report.label,
                metric.name,
                metric.kernel,
                metric.baseline
            );
        }
        if report.is_failure() {
            for outlier in outliers(out, reference, OUTLIER_LIMIT)? {
                log::debug!("{}: out {outlier}", report.label);
            }
        }
        Ok(report)
    }

    pub fn run_suite(&self, suite: Suite) -> Result<SuiteReport> {
        let start = Instant::now();
        let cases = match suite {
            Suite::Dense => self.sweep(suite, dense_cases(&self.config), DenseCase::label, |c| {
                self.run_dense(c)
            }),
            Suite::Fp8 => self.sweep(suite, fp8_cases(&self.config), Fp8Case::label, |c| {
                self.run_fp8(c)
            }),
            Suite::Varlen => {
                self.sweep(suite, varlen_cases(&self.config), VarlenCase::label, |c| {
                    self.run_varlen(c)
                })
            }
            Suite::Flex => self.sweep(suite, flex_cases(&self.config), FlexCase::label, |c| {
                self.run_flex(c)
            }),
        };
        let report = SuiteReport {
            suite,
            kernel: self.kernel.name().to_string(),
            cases,
            elapsed: start.elapsed(),
        };
        log::info!("{}", report.summary());

        if let Some(path) = &self.config.results_path {
            update_results(path, suite, &report.to_markdown())?;
            log::info!("wrote {} results to {}", suite, path.display());
        }
        Ok(report)
    }

    /// Run every configured suite in order.
    pub fn run_all(&self) -> Result<Vec<SuiteReport>> {
        let mut reports = Vec::with_capacity(self.config.suites.len());
        for &suite in &self.config.suites {
            let report = self.run_suite(suite)?;
            let stop = self.config.fail_fast && !report.is_success();
            reports.push(report);
            if stop {
                break;
            }
        }
        Ok(reports)
    }

    /// Run the grid in order. A case whose inputs or reference cannot be
    /// evaluated is recorded as failed; the sweep carries on.
    fn sweep<C>(
        &self,
        suite: Suite,
        grid: Vec<C>,
        label: impl Fn(&C) -> String,
        run: impl Fn(&C) -> Result<CaseReport>,
    ) -> Vec<CaseReport> {
        let total = self
            .config
            .max_cases
            .map_or(grid.len(), |max| max.min(grid.len()));
        log::info!("{} suite: {} cases on {}", suite, total, self.kernel.name());
        let mut reports = Vec::with_capacity(total);
        for (index, case) in grid.iter().take(total).enumerate() {
            let report = run(case).unwrap_or_else(|err| {
                CaseReport::judged(label(case), Vec::new(), vec![format!("case errored: {err}")])
            });
            match &report.outcome {
                CaseOutcome::Failed { reasons } => {
                    log::warn!("[{}/{}] {} FAIL: {}", index + 1, total, report.label, reasons.join("; "))
                }
                outcome => log::info!("[{}/{}] {} {}", index + 1, total, report.label, outcome.label()),
            }
            let failed = report.is_failure();
            reports.push(report);
            if failed && self.config.fail_fast {
                log::warn!("{suite} suite: stopping after first failure");
                break;
            }
        }
        reports
    }
}

fn kernel_failure(label: String, phase: &str, err: AttentionError) -> CaseReport {
    CaseReport::judged(label, Vec::new(), vec![format!("{phase} failed: {err}")])
}

fn judge(
    name: &str,
    kernel: &Tensor,
    reference: &Tensor,
    baseline: &Tensor,
    budget: ErrorBudget,
) -> Result<Metric> {
    Ok(Metric::judge(
        name,
        DiffStats::between(kernel, reference)?,
        DiffStats::between(baseline, reference)?,
        budget,
    ))
}

/// Kernel error against the low-precision result, budgeted by that
/// result's own distance from the f64 reference.
fn judge_versus_low(
    name: &str,
    kernel: &Tensor,
    low: &Tensor,
    reference: &Tensor,
    budget: ErrorBudget,
) -> Result<Metric> {
    Ok(Metric::judge(
        name,
        DiffStats::between(kernel, low)?,
        DiffStats::between(low, reference)?,
        budget,
    ))
}

fn judge_gradients(
    kernel: &Gradients,
    reference: &Gradients,
    baseline: &Gradients,
    budgets: [ErrorBudget; 3],
) -> Result<Vec<Metric>> {
    let [dq, dk, dv] = budgets;
    Ok(vec![
        judge("dq", &kernel.dq, &reference.dq, &baseline.dq, dq)?,
        judge("dk", &kernel.dk, &reference.dk, &baseline.dk, dk)?,
        judge("dv", &kernel.dv, &reference.dv, &baseline.dv, dv)?,
    ])
}

/// Zero the `[batch, seqlen]` positions flagged in `rows`.
fn zero_rows(tensor: &Tensor, rows: Option<&[Vec<bool>]>) -> Result<Tensor> {
    let Some(rows) = rows else {
        return Ok(tensor.clone());
    };
    let (batch, seqlen, _, _) = tensor.dims4()?;
    let keep: Vec<f32> = rows
        .iter()
        .flat_map(|row| row.iter().map(|&zero| if zero { 0.0 } else { 1.0 }))
        .collect();
    if keep.len() != batch * seqlen {
        return Err(AttentionError::shape(format!(
            "row mask of {} entries cannot cover [{batch}, {seqlen}]",
            keep.len()
        )));
    }
    let keep = Tensor::from_vec(keep, (batch, seqlen, 1, 1), tensor.device())?
        .to_dtype(tensor.dtype())?;
    Ok(tensor.broadcast_mul(&keep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fused::CpuFlashAttention;
    use crate::harness::cases::{ElementType, MhaType, DENSE_BATCH, VARLEN_BATCH};

    fn harness() -> Harness<CpuFlashAttention> {
        let config = HarnessConfig {
            block_q: 16,
            block_k: 16,
            ..HarnessConfig::default()
        };
        Harness::new(CpuFlashAttention::new(), config).unwrap()
    }

    #[test]
    fn dense_case_passes() -> Result<()> {
        let case = DenseCase {
            dtype: ElementType::F16,
            mha: MhaType::Gqa,
            causal: true,
            local: false,
            deterministic: true,
            gqa_parallel: false,
            head_dim: 64,
            seqlen_q: 33,
            seqlen_k: 47,
            batch: DENSE_BATCH,
        };
        let report = harness().run_dense(&case)?;
        assert_eq!(report.outcome, CaseOutcome::Passed, "{:?}", report.outcome);
        assert_eq!(report.metrics.len(), 4);
        Ok(())
    }

    #[test]
    fn varlen_case_with_unused_rows_passes() -> Result<()> {
        let case = VarlenCase {
            dtype: ElementType::Bf16,
            mha: MhaType::Mqa,
            causal: false,
            local: true,
            deterministic: false,
            add_unused: true,
            head_dim: 64,
            seqlen_q: 30,
            seqlen_k: 41,
            batch: VARLEN_BATCH,
        };
        let report = harness().run_varlen(&case)?;
        assert_eq!(report.outcome, CaseOutcome::Passed, "{:?}", report.outcome);
        Ok(())
    }

    #[test]
    fn oversized_cases_are_skipped() -> Result<()> {
        let harness = Harness::new(
            CpuFlashAttention::new(),
            HarnessConfig {
                reference_memory_limit: 1024,
                ..HarnessConfig::default()
            },
        )?;
        let case = FlexCase {
            dtype: ElementType::F16,
            mha: MhaType::Mha,
            head_dim: 64,
            seqlen_q: 256,
            seqlen_k: 256,
            bsz: 2,
        };
        let report = harness.run_flex(&case)?;
        assert!(matches!(report.outcome, CaseOutcome::Skipped { .. }));
        Ok(())
    }

    #[test]
    fn bf16_dense_case_checks_gradients() -> Result<()> {
        let case = DenseCase {
            dtype: ElementType::Bf16,
            mha: MhaType::Mha,
            causal: false,
            local: true,
            deterministic: false,
            gqa_parallel: true,
            head_dim: 64,
            seqlen_q: 64,
            seqlen_k: 128,
            batch: DENSE_BATCH,
        };
        let report = harness().run_dense(&case)?;
        assert_eq!(report.outcome, CaseOutcome::Passed, "{:?}", report.outcome);
        assert_eq!(report.metrics.len(), 4);
        Ok(())
    }

    #[test]
    fn fp8_metric_agrees_with_outcome() -> Result<()> {
        let case = Fp8Case {
            mha: MhaType::Gqa,
            causal: true,
            local: false,
            gqa_parallel: false,
            head_dim: 64,
            seqlen_q: 64,
            seqlen_k: 128,
            descale: 2.0,
            batch: DENSE_BATCH,
        };
        let report = harness().run_fp8(&case)?;
        assert_eq!(report.outcome, CaseOutcome::Passed, "{:?}", report.outcome);
        assert!(report.metrics.iter().all(|m| m.passed));
        Ok(())
    }

    /// Delegates to the host kernel but drops the last output feature of
    /// dense forward calls.
    struct NarrowOutput(CpuFlashAttention);

    impl FlashKernel for NarrowOutput {
        fn name(&self) -> &'static str {
            "narrow-output"
        }

        fn forward(
            &self,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            cfg: &AttentionConfig,
        ) -> Result<crate::core::ForwardOutput> {
            let fwd = self.0.forward(q, k, v, cfg)?;
            let dim = fwd.out.dim(3)?;
            Ok(crate::core::ForwardOutput {
                out: fwd.out.narrow(3, 0, dim - 1)?,
                lse: fwd.lse,
            })
        }

        fn forward_fp8(
            &self,
            q: &Fp8Tensor,
            k: &Fp8Tensor,
            v: &Fp8Tensor,
            descale: &Descale,
            out_dtype: DType,
            cfg: &AttentionConfig,
        ) -> Result<crate::core::ForwardOutput> {
            self.0.forward_fp8(q, k, v, descale, out_dtype, cfg)
        }

        fn backward(
            &self,
            dout: &Tensor,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            fwd: &crate::core::ForwardOutput,
            cfg: &AttentionConfig,
        ) -> Result<Gradients> {
            self.0.backward(dout, q, k, v, fwd, cfg)
        }

        fn varlen_forward(
            &self,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            batch: &crate::varlen::VarlenBatch,
            cfg: &AttentionConfig,
        ) -> Result<crate::core::ForwardOutput> {
            self.0.varlen_forward(q, k, v, batch, cfg)
        }

        fn varlen_backward(
            &self,
            dout: &Tensor,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            fwd: &crate::core::ForwardOutput,
            batch: &crate::varlen::VarlenBatch,
            cfg: &AttentionConfig,
        ) -> Result<Gradients> {
            self.0.varlen_backward(dout, q, k, v, fwd, batch, cfg)
        }

        fn flex_forward(
            &self,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            ranges: &crate::varlen::RangeSet,
            cfg: &AttentionConfig,
        ) -> Result<crate::core::ForwardOutput> {
            self.0.flex_forward(q, k, v, ranges, cfg)
        }

        fn flex_backward(
            &self,
            dout: &Tensor,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            fwd: &crate::core::ForwardOutput,
            ranges: &crate::varlen::RangeSet,
            cfg: &AttentionConfig,
        ) -> Result<Gradients> {
            self.0.flex_backward(dout, q, k, v, fwd, ranges, cfg)
        }
    }

    #[test]
    fn case_errors_become_failed_cases() -> Result<()> {
        let config = HarnessConfig {
            suites: vec![Suite::Dense],
            max_seqlen: Some(1),
            head_dims: Some(vec![256]),
            max_cases: Some(2),
            ..HarnessConfig::default()
        };
        let harness = Harness::new(NarrowOutput(CpuFlashAttention::new()), config)?;
        let report = harness.run_suite(Suite::Dense)?;
        assert_eq!(report.cases.len(), 2);
        for case in &report.cases {
            let CaseOutcome::Failed { reasons } = &case.outcome else {
                panic!("{} should fail, got {:?}", case.label, case.outcome);
            };
            assert!(reasons[0].starts_with("case errored"), "{reasons:?}");
        }
        Ok(())
    }

    #[test]
    fn unused_rows_are_zeroed() -> Result<()> {
        let tensor = Tensor::ones((1, 3, 1, 2), DType::F32, &Device::Cpu)?;
        let zeroed = zero_rows(&tensor, Some(&[vec![false, true, false]]))?;
        assert_eq!(
            zeroed.flatten_all()?.to_vec1::<f32>()?,
            vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0]
        );
        Ok(())
    }
}
