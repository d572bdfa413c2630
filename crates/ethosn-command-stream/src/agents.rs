//! Agent payloads: the per-hardware-unit work descriptions of a cascade.
//!
//! An agent is one schedulable unit — a feature-map streamer, weight
//! streamer, MCE scheduler, PLE loader or PLE scheduler — plus the dependency
//! ratios that couple it to its producers and consumers. Field widths match
//! the firmware ABI; everything is plain data.

use ethosn_chip::PleKernelId;

/// Slot info for data in SRAM. `slot_size` is in bytes **per SRAM bank**.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tile {
    /// Base address of the tile inside each SRAM bank.
    pub base_addr: u16,
    /// Number of stripe slots in the tile.
    pub num_slots: u16,
    /// Size of one slot, bytes per bank.
    pub slot_size: u16,
}

/// Per-dimension `(height, width, channels)` counts for feature-map agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TensorSize {
    /// Height component.
    pub height: u16,
    /// Width component.
    pub width: u16,
    /// Channels component.
    pub channels: u16,
}

/// Supertensor extent in cells, `(width, channels)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupertensorSize {
    /// Width in cells.
    pub width: u16,
    /// Channels in cells.
    pub channels: u16,
}

/// DRAM layout of a streamed feature map.
///
/// Cells are 1x1x1 (NHWC/NCHW), 8x8x16 (NHWCB), 8x16x16 (`FCAF_WIDE`) or
/// 8x8x32 (`FCAF_DEEP`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FmsDataType {
    /// Linear NHWC.
    #[default]
    Nhwc,
    /// Linear NCHW.
    Nchw,
    /// Brick-packed SRAM-native layout.
    Nhwcb,
    /// Compressed, deep cells.
    FcafDeep,
    /// Compressed, wide cells.
    FcafWide,
}

impl FmsDataType {
    /// Wire tag.
    pub const fn code(self) -> u8 {
        match self {
            Self::Nhwc => 0,
            Self::Nchw => 1,
            Self::Nhwcb => 2,
            Self::FcafDeep => 3,
            Self::FcafWide => 4,
        }
    }

    /// Inverse of [`Self::code`].
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Nhwc,
            1 => Self::Nchw,
            2 => Self::Nhwcb,
            3 => Self::FcafDeep,
            4 => Self::FcafWide,
            _ => return None,
        })
    }

    /// XML tag.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nhwc => "NHWC",
            Self::Nchw => "NCHW",
            Self::Nhwcb => "NHWCB",
            Self::FcafDeep => "FCAF_DEEP",
            Self::FcafWide => "FCAF_WIDE",
        }
    }
}

/// IFM/OFM streamer common data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FmSData {
    /// Starting offset of the tensor inside the supertensor.
    pub dram_offset: u32,
    /// Buffer id of the supertensor.
    pub buffer_id: u16,
    /// DRAM layout of the data.
    pub data_type: FmsDataType,
    /// SRAM tile.
    pub tile: Tile,
    /// Default stripe size. Edge stripes can be smaller.
    pub dflt_stripe_size: TensorSize,
    /// Stripe size at the edge of each dimension.
    pub edge_stripe_size: TensorSize,
    /// Supertensor extent in cells.
    pub supertensor_size_in_cells: SupertensorSize,
    /// Unique stripes per tensor dimension (excluding reloads).
    pub num_stripes: TensorSize,
    /// Strides for stripe-id to stripe-coordinate conversion.
    pub stripe_id_strides: TensorSize,
}

/// IFM streamer agent data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfmS {
    /// Common feature-map data.
    pub fm_data: FmSData,
}

/// OFM streamer agent data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfmS {
    /// Common feature-map data.
    pub fm_data: FmSData,
}

/// Weight streamer `(ofm_channels, ifm_channels)` work grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WgtWorkSize {
    /// OFM channel dimension.
    pub ofm_channels: u16,
    /// IFM channel dimension.
    pub ifm_channels: u16,
}

/// Weight streamer agent data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WgtS {
    /// Buffer id of the encoded weights.
    pub buffer_id: u16,
    /// Buffer id of the weights metadata array of `(offset, size)` pairs.
    pub metadata_buffer_id: u16,
    /// Weight SRAM tile.
    pub tile: Tile,
    /// OFM channels in stripes at the edge of the `ofm_channels` dimension.
    pub edge_stripe_ofm_channels: u16,
    /// Stripes per work dimension.
    pub num_stripes: WgtWorkSize,
    /// Strides for stripe-id to stripe-coordinate conversion.
    pub stripe_id_strides: WgtWorkSize,
}

/// MCE compute block size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSize {
    /// Block width.
    pub width: u8,
    /// Block height.
    pub height: u8,
}

/// Quantised relu clamp applied by the MCE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReluActivation {
    /// Lower clamp, quantised.
    pub min: i16,
    /// Upper clamp, quantised.
    pub max: i16,
}

/// Convolution stride.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrideXy {
    /// Stride in x (width).
    pub x: u8,
    /// Stride in y (height).
    pub y: u8,
}

/// MCE operation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MceOperation {
    /// Dense convolution.
    #[default]
    Convolution,
    /// Depthwise convolution.
    DepthwiseConvolution,
    /// Fully connected.
    FullyConnected,
}

impl MceOperation {
    /// Wire tag.
    pub const fn code(self) -> u8 {
        match self {
            Self::Convolution => 0,
            Self::DepthwiseConvolution => 1,
            Self::FullyConnected => 2,
        }
    }

    /// Inverse of [`Self::code`].
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Convolution,
            1 => Self::DepthwiseConvolution,
            2 => Self::FullyConnected,
            _ => return None,
        })
    }

    /// XML tag.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Convolution => "CONVOLUTION",
            Self::DepthwiseConvolution => "DEPTHWISE_CONVOLUTION",
            Self::FullyConnected => "FULLY_CONNECTED",
        }
    }
}

/// MCE scheduler `(ofm_h, ofm_w, ofm_c, ifm_c)` work grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MceWorkSize {
    /// OFM height dimension.
    pub ofm_height: u16,
    /// OFM width dimension.
    pub ofm_width: u16,
    /// OFM channel dimension.
    pub ofm_channels: u16,
    /// IFM channel dimension.
    pub ifm_channels: u16,
}

/// Convolution filter extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterShape {
    /// Filter width.
    pub width: u8,
    /// Filter height.
    pub height: u8,
}

/// Padding applied on the leading edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Padding {
    /// Left padding.
    pub left: u8,
    /// Top padding.
    pub top: u8,
}

/// IFM minus OFM extent, per spatial dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfmDelta {
    /// Width delta.
    pub width: i8,
    /// Height delta.
    pub height: i8,
}

/// MCE scheduler agent data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MceS {
    /// IFM SRAM tile.
    pub ifm_tile: Tile,
    /// Weight SRAM tile.
    pub wgt_tile: Tile,
    /// Compute block size.
    pub block_size: BlockSize,
    /// Default stripe size, element granularity.
    pub dflt_stripe_size: MceWorkSize,
    /// Stripe size at the edge of each dimension.
    pub edge_stripe_size: MceWorkSize,
    /// Stripes per work dimension.
    pub num_stripes: MceWorkSize,
    /// Strides for stripe-id to stripe-coordinate conversion.
    pub stripe_id_strides: MceWorkSize,
    /// Convolution stride.
    pub conv_stride_xy: StrideXy,
    /// IFM zero point.
    pub ifm_zero_point: i16,
    /// Operation mode.
    pub mce_op_mode: MceOperation,
    /// Filter extent.
    pub filter_shape: FilterShape,
    /// Leading-edge padding.
    pub padding: Padding,
    /// IFM minus OFM extent for default stripes.
    pub ifm_delta_default: IfmDelta,
    /// IFM minus OFM extent for edge stripes.
    pub ifm_delta_edge: IfmDelta,
    /// Relu clamp.
    pub relu_activ: ReluActivation,
    /// Kernel the fused PLE runs on this agent's output.
    pub ple_kernel_id: PleKernelId,
}

/// PLE loader agent data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PleL {
    /// Kernel to load.
    pub ple_kernel_id: PleKernelId,
    /// Destination address in PLE SRAM.
    pub sram_addr: u16,
}

/// Zero point, multiplier and shift for one SRAM-fed PLE input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PleIfmInfo {
    /// Input zero point.
    pub zero_point: i16,
    /// Rescale multiplier.
    pub multiplier: u16,
    /// Rescale shift.
    pub shift: u16,
}

/// Where the PLE reads its input from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PleInputMode {
    /// From the MCE with all OGs active (convolution, fully connected).
    #[default]
    MceAllOgs,
    /// From the MCE with one OG active (depthwise).
    MceOneOg,
    /// MCE inactive; read from SRAM.
    Sram,
}

impl PleInputMode {
    /// Wire tag.
    pub const fn code(self) -> u8 {
        match self {
            Self::MceAllOgs => 0,
            Self::MceOneOg => 1,
            Self::Sram => 2,
        }
    }

    /// Inverse of [`Self::code`].
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::MceAllOgs,
            1 => Self::MceOneOg,
            2 => Self::Sram,
            _ => return None,
        })
    }

    /// XML tag.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MceAllOgs => "MCE_ALL_OGS",
            Self::MceOneOg => "MCE_ONE_OG",
            Self::Sram => "SRAM",
        }
    }
}

/// PLE scheduler agent data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PleS {
    /// Output tile.
    pub ofm_tile: Tile,
    /// Output zero point.
    pub ofm_zero_point: i16,
    /// Default OFM stripe size.
    pub dflt_stripe_size: TensorSize,
    /// Edge OFM stripe size.
    pub edge_stripe_size: TensorSize,
    /// Unique stripes per OFM dimension.
    pub num_stripes: TensorSize,
    /// Strides for stripe-id to stripe-coordinate conversion.
    pub stripe_id_strides: TensorSize,
    /// Input source.
    pub input_mode: PleInputMode,
    /// Kernel to run.
    pub ple_kernel_id: PleKernelId,
    /// Kernel location in PLE SRAM.
    pub ple_kernel_sram_addr: u16,
    /// First input tile. Only used when `input_mode` is [`PleInputMode::Sram`].
    pub ifm_tile0: Tile,
    /// First input rescale info, `Sram` mode only.
    pub ifm_info0: PleIfmInfo,
    /// Second input tile, `Sram` mode only.
    pub ifm_tile1: Tile,
    /// Second input rescale info, `Sram` mode only.
    pub ifm_info1: PleIfmInfo,
}

/// Tagged agent payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentData {
    /// DRAM to SRAM feature-map streamer.
    IfmStreamer(IfmS),
    /// DRAM to SRAM weight streamer.
    WgtStreamer(WgtS),
    /// MCE work scheduler.
    MceScheduler(MceS),
    /// PLE code loader.
    PleLoader(PleL),
    /// PLE work scheduler.
    PleScheduler(PleS),
    /// SRAM to DRAM feature-map streamer.
    OfmStreamer(OfmS),
}

impl AgentData {
    /// Wire tag of the variant.
    pub const fn kind_code(&self) -> u32 {
        match self {
            Self::IfmStreamer(_) => 0,
            Self::WgtStreamer(_) => 1,
            Self::MceScheduler(_) => 2,
            Self::PleLoader(_) => 3,
            Self::PleScheduler(_) => 4,
            Self::OfmStreamer(_) => 5,
        }
    }

    /// XML element name of the variant.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::IfmStreamer(_) => "IFM_STREAMER",
            Self::WgtStreamer(_) => "WGT_STREAMER",
            Self::MceScheduler(_) => "MCE_SCHEDULER",
            Self::PleLoader(_) => "PLE_LOADER",
            Self::PleScheduler(_) => "PLE_SCHEDULER",
            Self::OfmStreamer(_) => "OFM_STREAMER",
        }
    }
}

/// A ratio in the number of stripes of this/other agent that couple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ratio {
    /// Stripe count on the other agent's side.
    pub other: u8,
    /// Stripe count on this agent's side.
    pub this: u8,
}

/// A dependency between this agent and another agent.
///
/// `relative_agent_id` is unsigned: read dependencies always point up the
/// sequence, write and schedule dependencies down, so the sign is implicit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dependency {
    /// Distance to the other agent in agent ids. Zero means "unused slot".
    pub relative_agent_id: u8,
    /// Stripe coupling across one reload pass.
    pub outer_ratio: Ratio,
    /// Stripe coupling inside one outer iteration.
    pub inner_ratio: Ratio,
    /// Extra stripes needed when a kernel reaches into neighbour stripes.
    pub boundary: i8,
}

impl Dependency {
    /// True if this slot carries no dependency.
    pub const fn is_unused(&self) -> bool {
        self.relative_agent_id == 0
    }
}

/// Dependency info attached to every agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentDependencyInfo {
    /// Total stripes for this agent including reloads.
    pub num_stripes_total: u16,
    /// Producer notified when its first consumer starts.
    pub schedule_dependencies: [Dependency; 1],
    /// Wait for a producer's stripe before reading. Slot 1 is reserved for
    /// the weight streamer on MCE agents.
    pub read_dependencies: [Dependency; 2],
    /// Producer pauses before overwriting a slot a reader still needs.
    pub write_dependencies: [Dependency; 1],
}

/// Tagged agent data plus dependency info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Agent {
    /// Agent-type-specific data.
    pub data: AgentData,
    /// Dependency info.
    pub info: AgentDependencyInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fms_data_type_codes_round_trip() {
        for ty in [
            FmsDataType::Nhwc,
            FmsDataType::Nchw,
            FmsDataType::Nhwcb,
            FmsDataType::FcafDeep,
            FmsDataType::FcafWide,
        ] {
            assert_eq!(FmsDataType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(FmsDataType::from_code(99), None);
    }

    #[test]
    fn test_mce_operation_codes_round_trip() {
        for op in [
            MceOperation::Convolution,
            MceOperation::DepthwiseConvolution,
            MceOperation::FullyConnected,
        ] {
            assert_eq!(MceOperation::from_code(op.code()), Some(op));
        }
    }

    #[test]
    fn test_unused_dependency() {
        assert!(Dependency::default().is_unused());
        let dep = Dependency {
            relative_agent_id: 2,
            ..Dependency::default()
        };
        assert!(!dep.is_unused());
    }
}
