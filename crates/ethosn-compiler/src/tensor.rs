//! Tensor shapes, data types and quantisation.
//!
//! Shapes are `(N, H, W, C)` throughout. Stripe arithmetic and per-format
//! byte counts live here; they are pure functions with no state.

use ethosn_chip::geometry::{BRICK_GROUP_SHAPE, FCAF_DEEP_CELL, FCAF_WIDE_CELL};

/// A 4-dimensional `(N, H, W, C)` shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorShape(pub [u32; 4]);

impl TensorShape {
    /// Create a shape from `(N, H, W, C)`.
    pub const fn new(n: u32, h: u32, w: u32, c: u32) -> Self {
        Self([n, h, w, c])
    }

    /// Batch count.
    pub const fn batch(&self) -> u32 {
        self.0[0]
    }

    /// Height.
    pub const fn height(&self) -> u32 {
        self.0[1]
    }

    /// Width.
    pub const fn width(&self) -> u32 {
        self.0[2]
    }

    /// Channels.
    pub const fn channels(&self) -> u32 {
        self.0[3]
    }

    /// Total element count.
    pub fn num_elements(&self) -> u64 {
        self.0.iter().map(|&d| u64::from(d)).product()
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Normalise a 1-4 dimensional user shape to `(N, H, W, C)`.
///
/// 1-D becomes `(1, x, 1, 1)`, 2-D `(1, x, y, 1)`, 3-D `(1, x, y, z)`, 4-D is
/// passed through. A redundant leading batch of 1 on a sub-4-D shape is
/// dropped before normalising, so `[1, 23]` and `[23]` agree.
pub fn build_tensor_shape(dims: &[u32]) -> Option<TensorShape> {
    let dims = match dims {
        [1, rest @ ..] if dims.len() < 4 && !rest.is_empty() => rest,
        other => other,
    };
    Some(match *dims {
        [x] => TensorShape::new(1, x, 1, 1),
        [x, y] => TensorShape::new(1, x, y, 1),
        [x, y, z] => TensorShape::new(1, x, y, z),
        [n, h, w, c] => TensorShape::new(n, h, w, c),
        _ => return None,
    })
}

/// Quantised element types accepted by the NPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unsigned asymmetric 8-bit.
    QAsymmU8,
    /// Signed asymmetric 8-bit.
    QAsymmS8,
    /// Signed symmetric 8-bit.
    QSymmS8,
    /// Signed 32-bit (bias data).
    S32,
}

impl DataType {
    /// Smallest representable quantised value.
    pub const fn min_value(self) -> i32 {
        match self {
            Self::QAsymmU8 => 0,
            Self::QAsymmS8 | Self::QSymmS8 => -128,
            Self::S32 => i32::MIN,
        }
    }

    /// Largest representable quantised value.
    pub const fn max_value(self) -> i32 {
        match self {
            Self::QAsymmU8 => 255,
            Self::QAsymmS8 | Self::QSymmS8 => 127,
            Self::S32 => i32::MAX,
        }
    }

    /// Element size in bytes.
    pub const fn size_bytes(self) -> u32 {
        match self {
            Self::QAsymmU8 | Self::QAsymmS8 | Self::QSymmS8 => 1,
            Self::S32 => 4,
        }
    }
}

/// Linear quantisation descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationInfo {
    /// Zero point.
    pub zero_point: i32,
    /// Scale.
    pub scale: f32,
}

impl QuantizationInfo {
    /// Create a descriptor.
    pub const fn new(zero_point: i32, scale: f32) -> Self {
        Self { zero_point, scale }
    }
}

// Scales are never NaN; treat bit-equal floats as equal for cache keys.
impl Eq for QuantizationInfo {}

impl std::hash::Hash for QuantizationInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.zero_point.hash(state);
        self.scale.to_bits().hash(state);
    }
}

/// Shape, type and quantisation of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorInfo {
    /// Operand shape.
    pub shape: TensorShape,
    /// Element type.
    pub data_type: DataType,
    /// Quantisation.
    pub quant: QuantizationInfo,
}

impl TensorInfo {
    /// Create a descriptor.
    pub const fn new(shape: TensorShape, data_type: DataType, quant: QuantizationInfo) -> Self {
        Self {
            shape,
            data_type,
            quant,
        }
    }
}

/// DRAM/SRAM layouts a buffer can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferFormat {
    /// Linear NHWC.
    Nhwc,
    /// Linear NCHW.
    Nchw,
    /// Brick-packed, SRAM native.
    Nhwcb,
    /// Compressed, wide cells.
    FcafWide,
    /// Compressed, deep cells.
    FcafDeep,
    /// Encoded weight stream.
    Weight,
}

/// Round `x` up to the nearest multiple of `m`.
pub const fn round_up(x: u32, m: u32) -> u32 {
    ((x + m - 1) / m) * m
}

/// `ceil(x / y)`.
pub const fn div_round_up(x: u32, y: u32) -> u32 {
    (x + y - 1) / y
}

/// Round H and W up to the brick group.
pub fn round_up_hw_to_brick_group(shape: TensorShape) -> TensorShape {
    TensorShape::new(
        shape.batch(),
        round_up(shape.height(), BRICK_GROUP_SHAPE[1]),
        round_up(shape.width(), BRICK_GROUP_SHAPE[2]),
        shape.channels(),
    )
}

/// Bytes of a tensor laid out linearly (NHWC or NCHW).
pub fn total_size_bytes(shape: TensorShape) -> u32 {
    u32::try_from(shape.num_elements()).unwrap_or(u32::MAX)
}

/// Bytes of a tensor in the brick-packed NHWCB layout.
pub fn total_size_bytes_nhwcb(shape: TensorShape) -> u32 {
    let rounded = TensorShape::new(
        shape.batch(),
        round_up(shape.height(), BRICK_GROUP_SHAPE[1]),
        round_up(shape.width(), BRICK_GROUP_SHAPE[2]),
        round_up(shape.channels(), BRICK_GROUP_SHAPE[3]),
    );
    total_size_bytes(rounded)
}

/// Bytes of a tensor in FCAF_DEEP cells.
pub fn total_size_bytes_fcaf_deep(shape: TensorShape) -> u32 {
    let rounded = TensorShape::new(
        shape.batch(),
        round_up(shape.height(), FCAF_DEEP_CELL[1]),
        round_up(shape.width(), FCAF_DEEP_CELL[2]),
        round_up(shape.channels(), FCAF_DEEP_CELL[3]),
    );
    total_size_bytes(rounded)
}

/// Bytes of a tensor in FCAF_WIDE cells.
pub fn total_size_bytes_fcaf_wide(shape: TensorShape) -> u32 {
    let rounded = TensorShape::new(
        shape.batch(),
        round_up(shape.height(), FCAF_WIDE_CELL[1]),
        round_up(shape.width(), FCAF_WIDE_CELL[2]),
        round_up(shape.channels(), FCAF_WIDE_CELL[3]),
    );
    total_size_bytes(rounded)
}

/// Bytes of a tensor in `format`.
pub fn size_bytes_in_format(shape: TensorShape, format: BufferFormat) -> u32 {
    match format {
        BufferFormat::Nhwc | BufferFormat::Nchw => total_size_bytes(shape),
        BufferFormat::Nhwcb => total_size_bytes_nhwcb(shape),
        BufferFormat::FcafDeep => total_size_bytes_fcaf_deep(shape),
        BufferFormat::FcafWide => total_size_bytes_fcaf_wide(shape),
        // Weight buffer sizes come from the encoder, not the shape.
        BufferFormat::Weight => total_size_bytes(shape),
    }
}

/// Generate a stripe shape from an encoding.
///
/// `encoding[i] == 0` means full length in dimension `i`; otherwise the
/// encoding is clamped to the tensor, then H and W are rounded up to the
/// brick group and C up to `channel_rounding`.
pub fn create_stripe(
    input: TensorShape,
    encoding: TensorShape,
    channel_rounding: u32,
) -> TensorShape {
    let mut stripe = [0u32; 4];
    for i in 0..4 {
        let wanted = if encoding.0[i] != 0 {
            encoding.0[i]
        } else {
            input.0[i]
        };
        stripe[i] = wanted.min(input.0[i]);
    }
    let mut stripe = round_up_hw_to_brick_group(TensorShape(stripe));
    stripe.0[3] = round_up(stripe.0[3], channel_rounding);
    stripe
}

/// Stripes along the height dimension.
pub fn num_stripes_h(tensor: TensorShape, stripe: TensorShape) -> u32 {
    div_round_up(tensor.height(), stripe.height())
}

/// Stripes along the width dimension.
pub fn num_stripes_w(tensor: TensorShape, stripe: TensorShape) -> u32 {
    div_round_up(tensor.width(), stripe.width())
}

/// Stripes along the channel dimension.
pub fn num_stripes_c(tensor: TensorShape, stripe: TensorShape) -> u32 {
    div_round_up(tensor.channels(), stripe.channels())
}

/// Total unique stripes in the tensor.
pub fn num_stripes_total(tensor: TensorShape, stripe: TensorShape) -> u32 {
    num_stripes_h(tensor, stripe) * num_stripes_w(tensor, stripe) * num_stripes_c(tensor, stripe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tensor_shape_normalisation() {
        assert_eq!(build_tensor_shape(&[23]), Some(TensorShape::new(1, 23, 1, 1)));
        assert_eq!(
            build_tensor_shape(&[23, 45]),
            Some(TensorShape::new(1, 23, 45, 1))
        );
        assert_eq!(
            build_tensor_shape(&[23, 45, 4]),
            Some(TensorShape::new(1, 23, 45, 4))
        );
        assert_eq!(
            build_tensor_shape(&[23, 45, 4, 235]),
            Some(TensorShape::new(23, 45, 4, 235))
        );
        // A redundant leading batch of 1 is dropped before normalising.
        assert_eq!(
            build_tensor_shape(&[1, 23]),
            Some(TensorShape::new(1, 23, 1, 1))
        );
        assert_eq!(
            build_tensor_shape(&[1, 23, 45]),
            Some(TensorShape::new(1, 23, 45, 1))
        );
        assert_eq!(
            build_tensor_shape(&[1, 23, 45, 4]),
            Some(TensorShape::new(1, 23, 45, 4))
        );
        assert_eq!(build_tensor_shape(&[]), None);
        assert_eq!(build_tensor_shape(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(div_round_up(17, 16), 2);
    }

    #[test]
    fn test_nhwcb_size_rounds_to_brick_group() {
        // 1x1x1x1 occupies a full brick group.
        assert_eq!(
            total_size_bytes_nhwcb(TensorShape::new(1, 1, 1, 1)),
            8 * 8 * 16
        );
        assert_eq!(
            total_size_bytes_nhwcb(TensorShape::new(1, 16, 16, 16)),
            16 * 16 * 16
        );
    }

    #[test]
    fn test_create_stripe_full_length_encoding() {
        let tensor = TensorShape::new(1, 100, 50, 20);
        let stripe = create_stripe(tensor, TensorShape::new(0, 0, 0, 0), 16);
        assert_eq!(stripe, TensorShape::new(1, 104, 56, 32));
    }

    #[test]
    fn test_create_stripe_clamps_to_tensor() {
        let tensor = TensorShape::new(1, 16, 16, 16);
        let stripe = create_stripe(tensor, TensorShape::new(0, 64, 0, 0), 16);
        assert_eq!(stripe, TensorShape::new(1, 16, 16, 16));
    }

    #[test]
    fn test_num_stripes() {
        let tensor = TensorShape::new(1, 65, 64, 16);
        let stripe = TensorShape::new(1, 16, 64, 16);
        assert_eq!(num_stripes_h(tensor, stripe), 5);
        assert_eq!(num_stripes_w(tensor, stripe), 1);
        assert_eq!(num_stripes_total(tensor, stripe), 5);
    }

    #[test]
    fn test_data_type_ranges() {
        assert_eq!(DataType::QAsymmU8.min_value(), 0);
        assert_eq!(DataType::QAsymmU8.max_value(), 255);
        assert_eq!(DataType::QAsymmS8.min_value(), -128);
        assert_eq!(DataType::QAsymmS8.max_value(), 127);
    }
}
