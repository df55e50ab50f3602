//! Seeded random inputs for the suites.

use std::f32::consts::PI;

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::core::{Result, WindowSize};

/// Standard normal samples via the Box-Muller transform.
pub fn normal_samples<R: Rng>(rng: &mut R, count: usize) -> Vec<f32> {
    (0..count)
        .map(|_| {
            // gen::<f32>() is in [0, 1); shift to (0, 1] so ln stays finite.
            let u1 = 1.0 - rng.gen::<f32>();
            let u2 = rng.gen::<f32>();
            (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
        })
        .collect()
}

/// Tensor of standard normal samples, drawn in f32 and cast to `dtype`.
pub fn randn<R: Rng>(rng: &mut R, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    let count = dims.iter().product();
    let data = normal_samples(rng, count);
    Ok(Tensor::from_vec(data, dims, device)?.to_dtype(dtype)?)
}

/// Random sliding window: both sides drawn uniformly from `[0, seqlen_k)`.
pub fn sample_window<R: Rng>(rng: &mut R, seqlen_k: usize) -> WindowSize {
    let upper = seqlen_k.max(1);
    WindowSize::new(rng.gen_range(0..upper), rng.gen_range(0..upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn normal_samples_have_unit_moments() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples = normal_samples(&mut rng, 20_000);
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        assert!(samples.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn same_seed_same_tensor() -> Result<()> {
        let device = Device::Cpu;
        let a = randn(&mut StdRng::seed_from_u64(7), &[2, 3, 4], DType::BF16, &device)?;
        let b = randn(&mut StdRng::seed_from_u64(7), &[2, 3, 4], DType::BF16, &device)?;
        assert_eq!(a.dtype(), DType::BF16);
        assert_eq!(
            a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
            b.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn windows_stay_below_key_length() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let window = sample_window(&mut rng, 5);
            assert!(window.left.unwrap() < 5 && window.right.unwrap() < 5);
        }
    }
}
