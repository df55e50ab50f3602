//! Float8 e4m3 ("fn" variant) codec.
//!
//! Layout: 1 sign bit, 4 exponent bits with bias 7, 3 mantissa bits. There
//! are no infinities; `S.1111.111` encodes NaN, so the largest finite
//! magnitude is `1.75 * 2^8 = 448`. Exponent zero encodes subnormals
//! `m/8 * 2^-6`.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};

use crate::core::Result;

pub const E4M3_MAX: f32 = 448.0;
const NAN_CODE: u8 = 0x7f;
const MAX_CODE: u8 = 0x7e;

pub fn decode_e4m3(code: u8) -> f32 {
    let sign = if code & 0x80 != 0 { -1.0 } else { 1.0 };
    let exponent = (code >> 3) & 0x0f;
    let mantissa = (code & 0x07) as f32;
    if exponent == 0x0f && code & 0x07 == 0x07 {
        return f32::NAN;
    }
    let magnitude = if exponent == 0 {
        mantissa / 8.0 * 2f32.powi(-6)
    } else {
        (1.0 + mantissa / 8.0) * 2f32.powi(exponent as i32 - 7)
    };
    sign * magnitude
}

/// Non-negative finite magnitudes indexed by code, ascending.
fn magnitudes() -> &'static [f32; 127] {
    static TABLE: OnceLock<[f32; 127]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0f32; 127];
        for (code, slot) in table.iter_mut().enumerate() {
            *slot = decode_e4m3(code as u8);
        }
        table
    })
}

/// Round to the nearest e4m3 value (ties to even), saturating at ±448.
pub fn encode_e4m3(value: f32) -> u8 {
    if value.is_nan() {
        return NAN_CODE;
    }
    let sign = if value.is_sign_negative() { 0x80 } else { 0x00 };
    let magnitude = value.abs();
    if magnitude >= E4M3_MAX {
        return sign | MAX_CODE;
    }
    let table = magnitudes();
    let lo = table.partition_point(|&m| m <= magnitude) - 1;
    let hi = lo + 1;
    let below = magnitude - table[lo];
    let above = table[hi] - magnitude;
    let code = if below < above || (below == above && lo % 2 == 0) {
        lo
    } else {
        hi
    };
    sign | code as u8
}

/// Host-resident float8 tensor: one e4m3 code per element plus its shape.
#[derive(Debug, Clone)]
pub struct Fp8Tensor {
    codes: Vec<u8>,
    dims: Vec<usize>,
    device: Device,
}

impl Fp8Tensor {
    pub fn quantize(tensor: &Tensor) -> Result<Self> {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            codes: values.into_iter().map(encode_e4m3).collect(),
            dims: tensor.dims().to_vec(),
            device: tensor.device().clone(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Decode every element and multiply by `descale`.
    pub fn decode_scaled(&self, descale: f32) -> Vec<f32> {
        self.codes
            .iter()
            .map(|&code| decode_e4m3(code) * descale)
            .collect()
    }

    /// Materialise `decode(code) * descale` as a tensor of `dtype`.
    pub fn dequantize(&self, descale: f32, dtype: DType) -> Result<Tensor> {
        let values = self.decode_scaled(descale);
        Ok(Tensor::from_vec(values, self.dims.as_slice(), &self.device)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_decode() {
        assert_eq!(decode_e4m3(0x00), 0.0);
        assert_eq!(decode_e4m3(0x38), 1.0);
        assert_eq!(decode_e4m3(0xb8), -1.0);
        assert_eq!(decode_e4m3(0x7e), 448.0);
        assert_eq!(decode_e4m3(0x01), 2f32.powi(-9));
        assert!(decode_e4m3(0x7f).is_nan());
        assert!(decode_e4m3(0xff).is_nan());
    }

    #[test]
    fn representable_values_round_trip() {
        for code in 0u8..=0xfe {
            if code == 0x7f || code == 0x80 {
                continue;
            }
            let value = decode_e4m3(code);
            assert_eq!(encode_e4m3(value), code, "code {code:#04x} value {value}");
        }
    }

    #[test]
    fn encoding_saturates_and_rounds_to_even() {
        assert_eq!(encode_e4m3(1000.0), 0x7e);
        assert_eq!(encode_e4m3(-f32::INFINITY), 0xfe);
        assert_eq!(encode_e4m3(f32::NAN), 0x7f);
        // 1.0625 sits halfway between 1.0 (mantissa 0) and 1.125 (mantissa 1).
        assert_eq!(encode_e4m3(1.0625), 0x38);
        // 1.1875 sits halfway between 1.125 and 1.25; mantissa 2 is even.
        assert_eq!(encode_e4m3(1.1875), 0x3a);
        assert_eq!(encode_e4m3(1.1), 0x39);
    }

    #[test]
    fn tensor_quantize_then_dequantize_with_descale() -> Result<()> {
        let device = Device::Cpu;
        let tensor = Tensor::from_vec(vec![0.5f32, -2.0, 3.0, 0.3], (2, 2), &device)?;
        let fp8 = Fp8Tensor::quantize(&tensor)?;
        assert_eq!(fp8.dims(), &[2, 2]);
        let restored = fp8.dequantize(2.0, DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(restored[..3].to_vec(), vec![1.0f32, -4.0, 6.0]);
        // 0.3 rounds to 0.3125 (1.25 * 2^-2) before descaling.
        assert_eq!(restored[3], 0.625);
        Ok(())
    }
}
