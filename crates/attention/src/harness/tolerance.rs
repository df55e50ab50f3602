//! Error statistics and the relative budgets cases are judged by.
//!
//! A kernel is not held to an absolute tolerance. Its error against the f64
//! reference is compared with the error a plain low-precision implementation
//! makes on the same inputs, scaled by an [`ErrorBudget`].

use std::fmt;

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Result};

/// Element-wise absolute tolerance used when listing outliers.
pub const OUTLIER_ABS_TOL: f32 = 5e-3;
/// Element-wise relative tolerance used when listing outliers.
pub const OUTLIER_REL_TOL: f32 = 1e-1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffStats {
    pub max_abs: f32,
    pub mean_abs: f32,
}

impl DiffStats {
    pub const ZERO: Self = Self {
        max_abs: 0.0,
        mean_abs: 0.0,
    };

    /// Max and mean of `|actual - expected|`, computed in f32.
    pub fn between(actual: &Tensor, expected: &Tensor) -> Result<Self> {
        check_dims(actual, expected)?;
        if actual.elem_count() == 0 {
            return Ok(Self::ZERO);
        }
        let diff = actual
            .to_dtype(DType::F32)?
            .sub(&expected.to_dtype(DType::F32)?)?
            .abs()?;
        Ok(Self {
            max_abs: diff.max_all()?.to_vec0::<f32>()?,
            mean_abs: diff.mean_all()?.to_vec0::<f32>()?,
        })
    }
}

impl fmt::Display for DiffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "max {:.3e} mean {:.3e}", self.max_abs, self.mean_abs)
    }
}

/// Allowed error: `factor * baseline + slack`, or anything below `floor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorBudget {
    pub factor: f32,
    pub slack: f32,
    pub floor: Option<f32>,
}

impl ErrorBudget {
    /// Dense outputs and gradients.
    pub const DENSE: Self = Self {
        factor: 2.0,
        slack: 3e-5,
        floor: None,
    };
    /// Ragged and range-based outputs.
    pub const PACKED_OUT: Self = Self {
        factor: 2.0,
        slack: 0.0,
        floor: None,
    };
    /// Ragged and range-based key/value gradients.
    pub const PACKED_GRAD: Self = Self {
        factor: 3.0,
        slack: 0.0,
        floor: Some(1e-4),
    };

    pub fn allowance(&self, baseline: &DiffStats) -> f32 {
        self.factor * baseline.max_abs + self.slack
    }

    pub fn admits(&self, kernel: &DiffStats, baseline: &DiffStats) -> bool {
        if self.floor.map_or(false, |floor| kernel.max_abs < floor) {
            return true;
        }
        // NaN compares false and therefore fails.
        kernel.max_abs <= self.allowance(baseline)
    }
}

/// Kernel error next to the low-precision baseline for one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub kernel: DiffStats,
    pub baseline: DiffStats,
    pub allowance: f32,
    pub passed: bool,
}

impl Metric {
    pub fn judge(name: &str, kernel: DiffStats, baseline: DiffStats, budget: ErrorBudget) -> Self {
        Self {
            name: name.to_string(),
            kernel,
            baseline,
            allowance: budget.allowance(&baseline),
            passed: budget.admits(&kernel, &baseline),
        }
    }

    pub fn failure(&self) -> Option<String> {
        (!self.passed).then(|| {
            format!(
                "{} error {:.3e} exceeds {:.3e} (baseline {:.3e})",
                self.name, self.kernel.max_abs, self.allowance, self.baseline.max_abs
            )
        })
    }
}

/// One element outside the outlier tolerances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outlier {
    pub index: usize,
    pub actual: f32,
    pub expected: f32,
}

impl fmt::Display for Outlier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] got {:.5} want {:.5}",
            self.index, self.actual, self.expected
        )
    }
}

/// Elements whose absolute difference exceeds [`OUTLIER_ABS_TOL`] or whose
/// relative difference exceeds [`OUTLIER_REL_TOL`], capped at `limit`.
pub fn outliers(actual: &Tensor, expected: &Tensor, limit: usize) -> Result<Vec<Outlier>> {
    check_dims(actual, expected)?;
    let (actual, expected) = (host_values(actual)?, host_values(expected)?);
    Ok(actual
        .iter()
        .zip(&expected)
        .enumerate()
        .filter(|(_, (&a, &e))| {
            let diff = (a - e).abs();
            diff > OUTLIER_ABS_TOL || diff / (e + 1e-5).abs() > OUTLIER_REL_TOL
        })
        .take(limit)
        .map(|(index, (&actual, &expected))| Outlier {
            index,
            actual,
            expected,
        })
        .collect())
}

/// Element-wise `|actual - expected| <= atol + rtol * |expected|`; on failure
/// returns a message naming the worst element.
pub fn assert_close(
    name: &str,
    actual: &Tensor,
    expected: &Tensor,
    rtol: f32,
    atol: f32,
) -> Result<Option<String>> {
    check_dims(actual, expected)?;
    let (actual, expected) = (host_values(actual)?, host_values(expected)?);
    let mut mismatched = 0usize;
    let mut worst: Option<(usize, f32)> = None;
    for (index, (&a, &e)) in actual.iter().zip(&expected).enumerate() {
        let diff = (a - e).abs();
        if diff <= atol + rtol * e.abs() {
            continue;
        }
        mismatched += 1;
        if worst.map_or(true, |(_, w)| !(diff <= w)) {
            worst = Some((index, diff));
        }
    }
    Ok(worst.map(|(index, diff)| {
        format!(
            "{name}: {mismatched}/{} elements outside rtol={rtol:.1e} atol={atol:.1e}, worst [{index}] diff {diff:.3e} (got {:.5}, want {:.5})",
            actual.len(),
            actual[index],
            expected[index]
        )
    }))
}

fn host_values(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

fn check_dims(actual: &Tensor, expected: &Tensor) -> Result<()> {
    if actual.dims() != expected.dims() {
        return Err(AttentionError::shape(format!(
            "compared tensors differ: {:?} vs {:?}",
            actual.dims(),
            expected.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn stats_measure_absolute_differences() -> Result<()> {
        let stats = DiffStats::between(&tensor(&[1.0, 2.0, 3.0]), &tensor(&[1.0, 2.5, 2.0]))?;
        assert!((stats.max_abs - 1.0).abs() < 1e-6);
        assert!((stats.mean_abs - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn budgets_scale_the_baseline() {
        let baseline = DiffStats {
            max_abs: 1e-3,
            mean_abs: 1e-4,
        };
        let ok = DiffStats {
            max_abs: 2e-3,
            mean_abs: 0.0,
        };
        let bad = DiffStats {
            max_abs: 2.1e-3,
            mean_abs: 0.0,
        };
        assert!(ErrorBudget::DENSE.admits(&ok, &baseline));
        assert!(!ErrorBudget::PACKED_OUT.admits(&bad, &baseline));
        let tiny = DiffStats {
            max_abs: 5e-5,
            mean_abs: 0.0,
        };
        assert!(ErrorBudget::PACKED_GRAD.admits(&tiny, &DiffStats::ZERO));
        assert!(!ErrorBudget::PACKED_OUT.admits(&tiny, &DiffStats::ZERO));
        let nan = DiffStats {
            max_abs: f32::NAN,
            mean_abs: f32::NAN,
        };
        assert!(!ErrorBudget::DENSE.admits(&nan, &baseline));
    }

    #[test]
    fn metric_failures_explain_themselves() {
        let metric = Metric::judge(
            "dq",
            DiffStats {
                max_abs: 1.0,
                mean_abs: 0.1,
            },
            DiffStats::ZERO,
            ErrorBudget::DENSE,
        );
        assert!(!metric.passed);
        assert!(metric.failure().unwrap().starts_with("dq error"));
    }

    #[test]
    fn outliers_use_absolute_or_relative_tolerance() -> Result<()> {
        let found = outliers(
            &tensor(&[1.0, 0.011, 1.004, 5.0]),
            &tensor(&[1.0, 0.001, 1.0, 4.0]),
            8,
        )?;
        let indices: Vec<usize> = found.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(outliers(&tensor(&[9.0; 4]), &tensor(&[0.0; 4]), 2)?.len(), 2);
        Ok(())
    }

    #[test]
    fn assert_close_reports_worst_element() -> Result<()> {
        assert!(assert_close("out", &tensor(&[1.0, 2.0]), &tensor(&[1.005, 2.0]), 1e-2, 0.0)?.is_none());
        let message = assert_close("out", &tensor(&[1.0, 3.0]), &tensor(&[1.1, 2.0]), 1e-2, 1e-2)?
            .unwrap();
        assert!(message.contains("2/2"));
        assert!(message.contains("[1]"));
        Ok(())
    }

    #[test]
    fn mismatched_dims_are_errors() {
        assert!(DiffStats::between(&tensor(&[1.0]), &tensor(&[1.0, 2.0])).is_err());
    }
}
