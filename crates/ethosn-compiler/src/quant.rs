//! Requantisation arithmetic and relu bound quantisation.

use crate::tensor::{DataType, QuantizationInfo};

/// Quantised relu clamp for the MCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReluInfo {
    /// Lower clamp, quantised.
    pub min: i32,
    /// Upper clamp, quantised.
    pub max: i32,
}

impl ReluInfo {
    /// Create a clamp.
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }
}

/// Quantise the bounds of a bounded relu.
///
/// `lower`/`upper` are real values; the result clamps each to the
/// representable range of `data_type`. Note the bounded-relu convention puts
/// the *upper* bound first in activation descriptors; callers pass real
/// bounds here.
pub fn quantise_bounded_relu(
    lower: f32,
    upper: f32,
    data_type: DataType,
    quant: QuantizationInfo,
) -> ReluInfo {
    let quantise = |v: f32| -> i32 {
        let q = (v / quant.scale).round() as i32 + quant.zero_point;
        q.clamp(data_type.min_value(), data_type.max_value())
    };
    ReluInfo::new(quantise(lower), quantise(upper))
}

/// Quantise an unbounded relu: lower bound is the zero point, upper bound is
/// the top of the representable range.
pub fn quantise_relu(data_type: DataType, quant: QuantizationInfo) -> ReluInfo {
    ReluInfo::new(
        quant.zero_point.clamp(data_type.min_value(), data_type.max_value()),
        data_type.max_value(),
    )
}

/// Express `ratio` as `multiplier * 2^-shift` with a `u16` multiplier.
///
/// Rounding is half-to-even, matching the PLE's requantise unit. Returns
/// `(multiplier, shift)`.
pub fn calculate_rescale_multiplier_and_shift(ratio: f64) -> (u16, u8) {
    // Largest shift that keeps the multiplier in u16 range, so precision is
    // maximised. Walking down from the top accepts the first representation
    // whose multiplier lands in the upper half of the range.
    for shift in (0u8..=48).rev() {
        let scaled = ratio * (2f64).powi(i32::from(shift));
        let mult = round_half_to_even(scaled);
        if (1..=i64::from(u16::MAX)).contains(&mult)
            && (mult >= i64::from(u16::MAX / 2) || shift == 0)
        {
            return (u16::try_from(mult).unwrap_or(u16::MAX), shift);
        }
    }
    (0, 0)
}

fn round_half_to_even(v: f64) -> i64 {
    let floor = v.floor();
    let diff = v - floor;
    let f = floor as i64;
    if diff > 0.5 {
        f + 1
    } else if diff < 0.5 {
        f
    } else if f % 2 == 0 {
        f
    } else {
        f + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_relu_u8() {
        // BoundedReLu(upper=1.0, lower=-1.0) with scale 0.1, zp 20:
        // min = 20 + (-1.0/0.1) clamped up to zp -> 10, max = 20 + 10 = 30.
        let info = quantise_bounded_relu(
            -1.0,
            1.0,
            DataType::QAsymmU8,
            QuantizationInfo::new(20, 0.1),
        );
        assert_eq!(info, ReluInfo::new(10, 30));
    }

    #[test]
    fn test_bounded_relu_s8() {
        let info = quantise_bounded_relu(
            -1.0,
            1.0,
            DataType::QAsymmS8,
            QuantizationInfo::new(-20, 0.1),
        );
        assert_eq!(info, ReluInfo::new(-30, -10));
    }

    #[test]
    fn test_unbounded_relu() {
        assert_eq!(
            quantise_relu(DataType::QAsymmU8, QuantizationInfo::new(20, 0.1)),
            ReluInfo::new(20, 255)
        );
        assert_eq!(
            quantise_relu(DataType::QAsymmS8, QuantizationInfo::new(-20, 0.1)),
            ReluInfo::new(-20, 127)
        );
    }

    #[test]
    fn test_rescale_identity() {
        let (mult, shift) = calculate_rescale_multiplier_and_shift(1.0);
        let recovered = f64::from(mult) / (2f64).powi(i32::from(shift));
        assert!((recovered - 1.0).abs() < 1e-4, "{mult} / 2^{shift}");
    }

    #[test]
    fn test_rescale_half() {
        let (mult, shift) = calculate_rescale_multiplier_and_shift(0.5);
        let recovered = f64::from(mult) / (2f64).powi(i32::from(shift));
        assert!((recovered - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_round_half_to_even() {
        assert_eq!(round_half_to_even(2.5), 2);
        assert_eq!(round_half_to_even(3.5), 4);
        assert_eq!(round_half_to_even(2.4), 2);
        assert_eq!(round_half_to_even(2.6), 3);
    }
}
