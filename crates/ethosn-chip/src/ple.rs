//! PLE kernel table.
//!
//! The PLE runs small fixed kernels shipped with the firmware. The compiler
//! never synthesises PLE code — it selects a kernel id from the table below
//! and emits a loader agent for it. A kernel id implies the operation, the
//! MCE block size it was compiled for, and the data type.
//!
//! Tags follow the firmware naming scheme, e.g.
//! `V2442_SIGMOID_bw16_bh16_bm1_s8` and `V2442_DOWNSAMPLE_2X2_bw16_bh16_bm1`.

use crate::geometry::BlockConfig;

/// Operations implemented by PLE kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(non_camel_case_types)]
pub enum PleOperation {
    /// Elementwise addition of two SRAM inputs.
    Addition,
    /// Elementwise addition with requantisation.
    AdditionRescale,
    /// 3x3 average pool, stride 1, UDMA-fed.
    AvgPool_3x3_1_1,
    /// 2x downsample (used by resize lowering).
    Downsample_2x2,
    /// Interleave for stride-2 convolution lowering.
    Interleave_2x2_2_2,
    /// Leaky ReLU activation.
    LeakyRelu,
    /// 2x2 max pool, stride 2.
    MaxPool_2x2_2_2,
    /// 3x3 max pool, stride 2, even-sized input.
    MaxPool_3x3_2_2_Even,
    /// 3x3 max pool, stride 2, odd-sized input.
    MaxPool_3x3_2_2_Odd,
    /// Mean over a 7x7 spatial extent.
    MeanXy_7x7,
    /// Mean over an 8x8 spatial extent.
    MeanXy_8x8,
    /// Identity copy from MCE accumulators to SRAM.
    Passthrough,
    /// Sigmoid activation.
    Sigmoid,
    /// Tanh activation.
    Tanh,
}

impl PleOperation {
    /// Firmware name fragment used in kernel tags.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Addition => "ADDITION",
            Self::AdditionRescale => "ADDITION_RESCALE",
            Self::AvgPool_3x3_1_1 => "AVGPOOL_3X3_1_1_UDMA",
            Self::Downsample_2x2 => "DOWNSAMPLE_2X2",
            Self::Interleave_2x2_2_2 => "INTERLEAVE_2X2_2_2",
            Self::LeakyRelu => "LEAKY_RELU",
            Self::MaxPool_2x2_2_2 => "MAXPOOL_2X2_2_2",
            Self::MaxPool_3x3_2_2_Even => "MAXPOOL_3X3_2_2_EVEN",
            Self::MaxPool_3x3_2_2_Odd => "MAXPOOL_3X3_2_2_ODD",
            Self::MeanXy_7x7 => "MEANXY_7X7",
            Self::MeanXy_8x8 => "MEANXY_8X8",
            Self::Passthrough => "PASSTHROUGH",
            Self::Sigmoid => "SIGMOID",
            Self::Tanh => "TANH",
        }
    }

    /// Stable numeric tag used on the wire.
    pub const fn code(self) -> u8 {
        match self {
            Self::Addition => 0,
            Self::AdditionRescale => 1,
            Self::AvgPool_3x3_1_1 => 2,
            Self::Downsample_2x2 => 3,
            Self::Interleave_2x2_2_2 => 4,
            Self::LeakyRelu => 5,
            Self::MaxPool_2x2_2_2 => 6,
            Self::MaxPool_3x3_2_2_Even => 7,
            Self::MaxPool_3x3_2_2_Odd => 8,
            Self::MeanXy_7x7 => 9,
            Self::MeanXy_8x8 => 10,
            Self::Passthrough => 11,
            Self::Sigmoid => 12,
            Self::Tanh => 13,
        }
    }

    /// Inverse of [`Self::code`].
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Addition,
            1 => Self::AdditionRescale,
            2 => Self::AvgPool_3x3_1_1,
            3 => Self::Downsample_2x2,
            4 => Self::Interleave_2x2_2_2,
            5 => Self::LeakyRelu,
            6 => Self::MaxPool_2x2_2_2,
            7 => Self::MaxPool_3x3_2_2_Even,
            8 => Self::MaxPool_3x3_2_2_Odd,
            9 => Self::MeanXy_7x7,
            10 => Self::MeanXy_8x8,
            11 => Self::Passthrough,
            12 => Self::Sigmoid,
            13 => Self::Tanh,
            _ => return None,
        })
    }

    /// Block configs this operation's kernels were built for.
    pub fn supported_blocks(self) -> &'static [BlockConfig] {
        const ALL: [BlockConfig; 6] = [
            BlockConfig::new(8, 8),
            BlockConfig::new(8, 16),
            BlockConfig::new(16, 8),
            BlockConfig::new(16, 16),
            BlockConfig::new(32, 8),
            BlockConfig::new(8, 32),
        ];
        const SQUARE: [BlockConfig; 4] = [
            BlockConfig::new(8, 8),
            BlockConfig::new(8, 16),
            BlockConfig::new(16, 8),
            BlockConfig::new(16, 16),
        ];
        const WIDE_ONLY: [BlockConfig; 1] = [BlockConfig::new(16, 16)];

        match self {
            Self::LeakyRelu | Self::Sigmoid | Self::Tanh | Self::Passthrough => &ALL,
            Self::Downsample_2x2
            | Self::Interleave_2x2_2_2
            | Self::MaxPool_2x2_2_2
            | Self::MaxPool_3x3_2_2_Even
            | Self::MaxPool_3x3_2_2_Odd => &SQUARE,
            Self::Addition
            | Self::AdditionRescale
            | Self::AvgPool_3x3_1_1
            | Self::MeanXy_7x7
            | Self::MeanXy_8x8 => &WIDE_ONLY,
        }
    }

    /// True if the kernel is built per data type (signed vs unsigned).
    pub const fn is_sign_specific(self) -> bool {
        matches!(
            self,
            Self::Addition | Self::AdditionRescale | Self::LeakyRelu | Self::Sigmoid | Self::Tanh
        )
    }

    /// Code footprint of one kernel in PLE SRAM, bytes.
    pub const fn code_size(self) -> u32 {
        match self {
            Self::Passthrough => 0x400,
            Self::LeakyRelu | Self::Sigmoid | Self::Tanh => 0x800,
            Self::Addition | Self::AdditionRescale => 0x800,
            Self::Downsample_2x2 | Self::Interleave_2x2_2_2 => 0xC00,
            Self::MaxPool_2x2_2_2 | Self::MaxPool_3x3_2_2_Even | Self::MaxPool_3x3_2_2_Odd => {
                0xC00
            }
            Self::AvgPool_3x3_1_1 | Self::MeanXy_7x7 | Self::MeanXy_8x8 => 0x1000,
        }
    }
}

/// One selectable kernel: operation, block size, and signedness.
///
/// Only combinations present in the firmware table can be constructed;
/// [`PleKernelId::select`] is the sole way to obtain one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PleKernelId {
    op: PleOperation,
    block: BlockConfig,
    signed: bool,
}

impl PleKernelId {
    /// Select a kernel for `op` at `block`, for signed or unsigned data.
    ///
    /// Returns `None` if the firmware ships no such kernel.
    pub fn select(op: PleOperation, block: BlockConfig, signed: bool) -> Option<Self> {
        if !op.supported_blocks().contains(&block) {
            return None;
        }
        Some(Self {
            op,
            block,
            signed: signed && op.is_sign_specific(),
        })
    }

    /// The kernel's operation.
    pub const fn operation(self) -> PleOperation {
        self.op
    }

    /// Block config the kernel was built for.
    pub const fn block(self) -> BlockConfig {
        self.block
    }

    /// True for `_s8` kernels.
    pub const fn signed(self) -> bool {
        self.signed
    }

    /// Code footprint in PLE SRAM, bytes.
    pub const fn code_size(self) -> u32 {
        self.op.code_size()
    }

    /// Firmware tag, e.g. `V2442_SIGMOID_bw16_bh16_bm1_s8`.
    pub fn tag(self) -> String {
        let suffix = if self.signed { "_s8" } else { "" };
        format!(
            "V2442_{}_bw{}_bh{}_bm1{}",
            self.op.name(),
            self.block.width,
            self.block.height,
            suffix
        )
    }

    /// Parse a firmware tag back into a kernel id.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix("V2442_")?;
        let (rest, signed) = match rest.strip_suffix("_s8") {
            Some(r) => (r, true),
            None => (rest, false),
        };
        // <NAME>_bw<W>_bh<H>_bm1
        let rest = rest.strip_suffix("_bm1")?;
        let bh_pos = rest.rfind("_bh")?;
        let bw_pos = rest.rfind("_bw")?;
        if bw_pos >= bh_pos {
            return None;
        }
        let name = &rest[..bw_pos];
        let width: u32 = rest[bw_pos + 3..bh_pos].parse().ok()?;
        let height: u32 = rest[bh_pos + 3..].parse().ok()?;

        let op = [
            PleOperation::Addition,
            PleOperation::AdditionRescale,
            PleOperation::AvgPool_3x3_1_1,
            PleOperation::Downsample_2x2,
            PleOperation::Interleave_2x2_2_2,
            PleOperation::LeakyRelu,
            PleOperation::MaxPool_2x2_2_2,
            PleOperation::MaxPool_3x3_2_2_Even,
            PleOperation::MaxPool_3x3_2_2_Odd,
            PleOperation::MeanXy_7x7,
            PleOperation::MeanXy_8x8,
            PleOperation::Passthrough,
            PleOperation::Sigmoid,
            PleOperation::Tanh,
        ]
        .into_iter()
        .find(|op| op.name() == name)?;

        Self::select(op, BlockConfig::new(height, width), signed)
    }

    /// Wire encoding: `(op, bw/8, bh/8, flags)` packed into a word.
    pub fn to_word(self) -> u32 {
        u32::from(self.op.code())
            | (self.block.width / 8) << 8
            | (self.block.height / 8) << 16
            | u32::from(self.signed) << 24
    }

    /// Inverse of [`Self::to_word`].
    pub fn from_word(word: u32) -> Option<Self> {
        let op = PleOperation::from_code((word & 0xFF) as u8)?;
        let width = ((word >> 8) & 0xFF) * 8;
        let height = ((word >> 16) & 0xFF) * 8;
        let signed = (word >> 24) & 1 == 1;
        Self::select(op, BlockConfig::new(height, width), signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_respects_block_table() {
        assert!(PleKernelId::select(
            PleOperation::Sigmoid,
            BlockConfig::new(16, 16),
            true
        )
        .is_some());
        // Addition kernels are 16x16 only.
        assert!(
            PleKernelId::select(PleOperation::Addition, BlockConfig::new(8, 8), true).is_none()
        );
    }

    #[test]
    fn test_tag_format() {
        let id =
            PleKernelId::select(PleOperation::Sigmoid, BlockConfig::new(16, 16), true).unwrap();
        assert_eq!(id.tag(), "V2442_SIGMOID_bw16_bh16_bm1_s8");

        let id =
            PleKernelId::select(PleOperation::Downsample_2x2, BlockConfig::new(16, 16), false)
                .unwrap();
        assert_eq!(id.tag(), "V2442_DOWNSAMPLE_2X2_bw16_bh16_bm1");
    }

    #[test]
    fn test_tag_round_trip() {
        for op in [
            PleOperation::Sigmoid,
            PleOperation::MaxPool_2x2_2_2,
            PleOperation::MeanXy_7x7,
            PleOperation::Passthrough,
        ] {
            for &block in op.supported_blocks() {
                let id = PleKernelId::select(op, block, true).unwrap();
                assert_eq!(PleKernelId::from_tag(&id.tag()), Some(id), "{}", id.tag());
            }
        }
    }

    #[test]
    fn test_word_round_trip() {
        let id = PleKernelId::select(PleOperation::Tanh, BlockConfig::new(8, 32), true).unwrap();
        assert_eq!(PleKernelId::from_word(id.to_word()), Some(id));
    }

    #[test]
    fn test_unsigned_only_ops_ignore_sign() {
        let id = PleKernelId::select(PleOperation::MaxPool_2x2_2_2, BlockConfig::new(8, 8), true)
            .unwrap();
        assert!(!id.signed());
    }
}
