//! Tile sizing and boundary arithmetic.
//!
//! A tile is the SRAM region backing one buffer: `num_slots` slots, each
//! holding one stripe (plus any packed boundary data). Slot sizes must cover
//! FCAF cell rounding when the DRAM source may be compressed, because the
//! hardware decompresses whole cells into SRAM.

use ethosn_chip::geometry::{BRICK_GROUP_SHAPE, FCAF_DEEP_CELL, FCAF_WIDE_CELL};
use ethosn_chip::HardwareCapabilities;

use crate::tensor::{
    round_up, total_size_bytes_nhwcb, BufferFormat, TensorShape,
};

/// Halo thickness packed into each stripe slot, pixels per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackedBoundaryThickness {
    /// Left side.
    pub left: u32,
    /// Top side.
    pub top: u32,
    /// Right side.
    pub right: u32,
    /// Bottom side.
    pub bottom: u32,
}

impl PackedBoundaryThickness {
    /// True if any side carries boundary data.
    pub const fn any(&self) -> bool {
        self.left > 0 || self.top > 0 || self.right > 0 || self.bottom > 0
    }
}

/// Result of [`calculate_tile_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSizeCalculation {
    /// Bytes per slot.
    pub slot_size_bytes: u32,
    /// Bytes for the whole tile.
    pub size_bytes: u32,
    /// Set when the slot layout is incompatible with FCAF_WIDE sources.
    pub forbid_fcaf_wide: bool,
}

/// Whether a compressed format can source a buffer with this stripe shape.
///
/// Each partial dimension of the stripe must be cell-aligned; a dimension
/// covering the whole tensor is always fine.
pub fn is_compression_format_compatible_with_stripe_shape(
    format: BufferFormat,
    stripe: TensorShape,
    tensor: TensorShape,
) -> bool {
    let cell = match format {
        BufferFormat::FcafDeep => FCAF_DEEP_CELL,
        BufferFormat::FcafWide => FCAF_WIDE_CELL,
        _ => return false,
    };
    let dim_ok = |i: usize| stripe.0[i] >= tensor.0[i] || stripe.0[i] % cell[i] == 0;
    dim_ok(1) && dim_ok(2) && dim_ok(3)
}

/// Upper bound for a tile: the full tensor, brick aligned, with the partial
/// last row of stripes rounded to `width_multiple`/`height_multiple`. Never
/// more than the SRAM itself.
fn max_tile_size(
    tensor: TensorShape,
    caps: &HardwareCapabilities,
    width_multiple: u32,
    height_multiple: u32,
) -> u32 {
    let rounded = TensorShape::new(
        tensor.batch(),
        round_up(tensor.height(), height_multiple),
        round_up(tensor.width(), width_multiple),
        round_up(tensor.channels(), BRICK_GROUP_SHAPE[3]),
    );
    total_size_bytes_nhwcb(rounded).min(caps.total_sram_bytes)
}

/// Compute slot and tile sizes for an SRAM feature-map buffer.
///
/// Follows the hardware rules: packed boundary data extends the slot in H
/// and W; a possibly-FCAF source rounds the slot up to whole cells; without
/// packed boundary the tile is clamped to the full-tensor footprint so tiles
/// never allocate more than the tensor needs.
pub fn calculate_tile_size(
    caps: &HardwareCapabilities,
    tensor_shape: TensorShape,
    stripe_shape: TensorShape,
    packed_boundary: PackedBoundaryThickness,
    num_stripes: u32,
    could_source_be_fcaf: bool,
) -> TileSizeCalculation {
    let stripe_incl_boundary = TensorShape::new(
        1,
        stripe_shape.height() + packed_boundary.top + packed_boundary.bottom,
        stripe_shape.width() + packed_boundary.left + packed_boundary.right,
        stripe_shape.channels(),
    );

    let could_be_deep = could_source_be_fcaf
        && !packed_boundary.any()
        && is_compression_format_compatible_with_stripe_shape(
            BufferFormat::FcafDeep,
            stripe_shape,
            tensor_shape,
        );
    let could_be_wide = could_source_be_fcaf
        && !packed_boundary.any()
        && is_compression_format_compatible_with_stripe_shape(
            BufferFormat::FcafWide,
            stripe_shape,
            tensor_shape,
        );

    let mut rounded = stripe_incl_boundary;
    if could_be_deep {
        rounded.0[1] = round_up(rounded.height(), FCAF_DEEP_CELL[1]);
        rounded.0[2] = round_up(rounded.width(), FCAF_DEEP_CELL[2]);
    }
    if could_be_wide {
        rounded.0[1] = round_up(rounded.height(), FCAF_WIDE_CELL[1]);
        rounded.0[2] = round_up(rounded.width(), FCAF_WIDE_CELL[2]);
    }

    let slot_size = total_size_bytes_nhwcb(rounded);
    let full_stripes_size = slot_size.saturating_mul(num_stripes);

    // Slots that were not rounded for wide cells must never be fed from a
    // FCAF_WIDE source; the hardware would write past the slot.
    let forbid_fcaf_wide = !could_be_wide;

    // Boundary data is laid out after the stripe and assumes the full slot
    // shape, so the tile cannot be clamped.
    if packed_boundary.any() {
        return TileSizeCalculation {
            slot_size_bytes: slot_size,
            size_bytes: full_stripes_size,
            forbid_fcaf_wide,
        };
    }

    let mut width_multiple = BRICK_GROUP_SHAPE[2];
    let mut height_multiple = BRICK_GROUP_SHAPE[1];
    if could_be_deep {
        width_multiple = width_multiple.max(FCAF_DEEP_CELL[2]);
        height_multiple = height_multiple.max(FCAF_DEEP_CELL[1]);
    }
    if could_be_wide {
        width_multiple = width_multiple.max(FCAF_WIDE_CELL[2]);
        height_multiple = height_multiple.max(FCAF_WIDE_CELL[1]);
    }

    let max_tile = max_tile_size(tensor_shape, caps, width_multiple, height_multiple);
    TileSizeCalculation {
        slot_size_bytes: slot_size,
        size_bytes: max_tile.min(full_stripes_size),
        forbid_fcaf_wide,
    }
}

/// Whether a consumer needs boundary data before/after the current stripe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeedBoundary {
    /// Data from the preceding stripe is needed.
    pub before: bool,
    /// Data from the following stripe is needed.
    pub after: bool,
}

/// Boundary requirements along one dimension.
///
/// `before` is needed exactly when there is leading padding; `after` when the
/// input window of a default output stripe reaches past the input stripe.
pub fn boundary_requirements(
    pad_before: u32,
    tensor_size: u32,
    stripe_size_in: u32,
    stripe_size_out: u32,
    kernel_size: u32,
) -> NeedBoundary {
    let splits = stripe_size_in < tensor_size;
    NeedBoundary {
        before: splits && pad_before > 0,
        after: splits && stripe_size_out + kernel_size - 1 > stripe_size_in + pad_before,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosn_chip::EthosN78Variant;

    fn caps() -> HardwareCapabilities {
        HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio)
    }

    #[test]
    fn test_tile_without_boundary_is_clamped_to_tensor() {
        // Tensor 65 high, stripes 64 high: two slots would waste space.
        let tensor = TensorShape::new(1, 65, 16, 16);
        let stripe = TensorShape::new(1, 64, 16, 16);
        let tile = calculate_tile_size(
            &caps(),
            tensor,
            stripe,
            PackedBoundaryThickness::default(),
            2,
            false,
        );
        assert_eq!(tile.slot_size_bytes, total_size_bytes_nhwcb(stripe));
        assert!(tile.size_bytes < 2 * tile.slot_size_bytes);
        assert_eq!(
            tile.size_bytes,
            total_size_bytes_nhwcb(TensorShape::new(1, 72, 16, 16))
        );
    }

    #[test]
    fn test_packed_boundary_prevents_clamping() {
        let tensor = TensorShape::new(1, 65, 16, 16);
        let stripe = TensorShape::new(1, 64, 16, 16);
        let boundary = PackedBoundaryThickness {
            top: 8,
            bottom: 8,
            ..PackedBoundaryThickness::default()
        };
        let tile = calculate_tile_size(&caps(), tensor, stripe, boundary, 2, false);
        assert_eq!(
            tile.slot_size_bytes,
            total_size_bytes_nhwcb(TensorShape::new(1, 80, 16, 16))
        );
        assert_eq!(tile.size_bytes, 2 * tile.slot_size_bytes);
    }

    #[test]
    fn test_fcaf_source_rounds_slot_to_cells() {
        let tensor = TensorShape::new(1, 128, 128, 32);
        let stripe = TensorShape::new(1, 8, 128, 32);
        let tile = calculate_tile_size(
            &caps(),
            tensor,
            stripe,
            PackedBoundaryThickness::default(),
            2,
            true,
        );
        // Deep cells keep H=8; wide cells keep W at a multiple of 16.
        assert_eq!(tile.slot_size_bytes, total_size_bytes_nhwcb(stripe));
    }

    #[test]
    fn test_fcaf_compatibility() {
        let tensor = TensorShape::new(1, 64, 64, 64);
        // Full-depth stripes, 8-high: deep-compatible (H % 8 == 0).
        assert!(is_compression_format_compatible_with_stripe_shape(
            BufferFormat::FcafDeep,
            TensorShape::new(1, 8, 64, 64),
            tensor
        ));
        // 8-wide stripes are not wide-cell aligned (cell W = 16).
        assert!(!is_compression_format_compatible_with_stripe_shape(
            BufferFormat::FcafWide,
            TensorShape::new(1, 64, 8, 64),
            tensor
        ));
    }

    #[test]
    fn test_boundary_requirements() {
        // 3x3 kernel, split input: needs both sides when padded.
        let b = boundary_requirements(1, 64, 16, 16, 3);
        assert!(b.before);
        assert!(b.after);
        // No padding: only after.
        let b = boundary_requirements(0, 64, 16, 16, 3);
        assert!(!b.before);
        assert!(b.after);
        // 1x1 kernel never needs boundary data.
        let b = boundary_requirements(0, 64, 16, 16, 1);
        assert!(!b.before);
        assert!(!b.after);
        // Unsplit dimension never needs boundary data.
        let b = boundary_requirements(1, 16, 16, 16, 3);
        assert!(!b.before);
        assert!(!b.after);
    }
}
