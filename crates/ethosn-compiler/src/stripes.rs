//! Stripe search space: configuration, debug overrides, and the generator.
//!
//! The generator enumerates candidate stripe sets for MCE-based parts. Each
//! enabled split family produces one or more `(mce, ple, memory)` stripe
//! descriptions; the firmware limits and the tensor extent filter the rest.

use std::collections::BTreeSet;

use ethosn_chip::geometry::{ALL_BLOCK_CONFIGS, BRICK_GROUP_SHAPE};
use ethosn_chip::{BlockConfig, HardwareCapabilities};
use ethosn_command_stream::MceOperation;
use regex::Regex;

use crate::error::{CompileError, Result};
use crate::geometry::{boundary_requirements, PackedBoundaryThickness};
use crate::tensor::{create_stripe, div_round_up, num_stripes_total, TensorShape};
use crate::CompilationOptions;

/// Environment variable naming the debug stripe-config file.
pub const DEBUG_STRIPE_CONFIG_ENV: &str = "ETHOSN_SUPPORT_LIBRARY_DEBUG_STRIPE_CONFIG";

/// Enabled split families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Splits {
    pub none: bool,
    pub width_only: bool,
    pub mce_and_ple_output_height: bool,
    pub mce_output_height_only: bool,
    pub width_height: bool,
    pub width_height_output_depth: bool,
    pub width_height_output_depth_input_depth: bool,
    pub output_depth_input_depth: bool,
    pub mce_output_depth_only: bool,
    pub mce_and_ple_output_depth: bool,
    pub input_depth_only: bool,
}

impl Splits {
    const fn all(value: bool) -> Self {
        Self {
            none: value,
            width_only: value,
            mce_and_ple_output_height: value,
            mce_output_height_only: value,
            width_height: value,
            width_height_output_depth: value,
            width_height_output_depth_input_depth: value,
            output_depth_input_depth: value,
            mce_output_depth_only: value,
            mce_and_ple_output_depth: value,
            input_depth_only: value,
        }
    }
}

/// Inclusive multiplier range for the block/depth loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplierRange {
    /// Smallest multiplier.
    pub min: u32,
    /// Largest multiplier.
    pub max: u32,
}

impl Default for MultiplierRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: u32::MAX,
        }
    }
}

/// Cascade positions a part may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PlanTypes {
    pub beginning: bool,
    pub middle: bool,
    pub end: bool,
    pub lonely: bool,
}

impl Default for PlanTypes {
    fn default() -> Self {
        Self {
            beginning: true,
            middle: true,
            end: true,
            lonely: true,
        }
    }
}

/// Everything that constrains the stripe search for one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeConfig {
    /// Enabled split families.
    pub splits: Splits,
    /// Enabled block configs, in search order.
    pub block_configs: Vec<BlockConfig>,
    /// Stripe-width multiplier bounds.
    pub block_width_multiplier: MultiplierRange,
    /// Stripe-height multiplier bounds.
    pub block_height_multiplier: MultiplierRange,
    /// IFM depth multiplier bounds.
    pub ifm_depth_multiplier: MultiplierRange,
    /// OFM depth multiplier bounds.
    pub ofm_depth_multiplier: MultiplierRange,
    /// Allowed cascade positions.
    pub plan_types: PlanTypes,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            splits: Splits::all(true),
            block_configs: ALL_BLOCK_CONFIGS.to_vec(),
            block_width_multiplier: MultiplierRange::default(),
            block_height_multiplier: MultiplierRange::default(),
            ifm_depth_multiplier: MultiplierRange::default(),
            ofm_depth_multiplier: MultiplierRange::default(),
            plan_types: PlanTypes::default(),
        }
    }
}

impl StripeConfig {
    /// Disable every split and block config.
    pub fn disable_all(&mut self) {
        self.splits = Splits::all(false);
        self.block_configs.clear();
    }

    /// Disable every split family.
    pub fn disable_all_splits(&mut self) {
        self.splits = Splits::all(false);
    }

    /// Disable families that split the width dimension.
    pub fn disable_split_width(&mut self) {
        self.splits.width_only = false;
        self.splits.width_height = false;
        self.splits.width_height_output_depth = false;
        self.splits.width_height_output_depth_input_depth = false;
    }

    /// Disable families that split the height dimension.
    pub fn disable_split_height(&mut self) {
        self.splits.mce_and_ple_output_height = false;
        self.splits.mce_output_height_only = false;
        self.splits.width_height = false;
        self.splits.width_height_output_depth = false;
        self.splits.width_height_output_depth_input_depth = false;
    }

    /// Disable families that split the input depth.
    pub fn disable_split_input_depth(&mut self) {
        self.splits.width_height_output_depth_input_depth = false;
        self.splits.output_depth_input_depth = false;
        self.splits.input_depth_only = false;
    }

    /// Disable families that split the output depth.
    pub fn disable_split_output_depth(&mut self) {
        self.splits.width_height_output_depth = false;
        self.splits.width_height_output_depth_input_depth = false;
        self.splits.output_depth_input_depth = false;
        self.splits.mce_output_depth_only = false;
        self.splits.mce_and_ple_output_depth = false;
    }
}

/// Build the stripe config for one part, applying the compilation options and
/// any debug override file named by [`DEBUG_STRIPE_CONFIG_ENV`].
///
/// # Errors
///
/// A named but unreadable or malformed debug file is a fatal
/// [`CompileError::ConfigParseError`].
pub fn get_stripe_config(options: &CompilationOptions, identifier: &str) -> Result<StripeConfig> {
    let mut result = StripeConfig::default();

    // Legacy strategy filtering: any disabled strategy switches to an
    // explicit allow-list of the roughly matching split families.
    let s = &options.strategies;
    if !(s.strategy0 && s.strategy1 && s.strategy3 && s.strategy4 && s.strategy6 && s.strategy7) {
        result.disable_all_splits();
        if s.strategy0 {
            result.splits.mce_and_ple_output_height = true;
        }
        if s.strategy1 {
            result.splits.mce_and_ple_output_depth = true;
            result.splits.output_depth_input_depth = true;
        }
        if s.strategy3 {
            result.splits.none = true;
        }
        if s.strategy4 {
            result.splits.width_only = true;
        }
        if s.strategy6 {
            result.splits.width_height = true;
            result.splits.width_height_output_depth = true;
        }
        if s.strategy7 {
            result.splits.width_height_output_depth_input_depth = true;
        }
    }

    let b = &options.block_configs;
    let keep = [
        (b.b8x8, BlockConfig::new(8, 8)),
        (b.b8x16, BlockConfig::new(8, 16)),
        (b.b16x8, BlockConfig::new(16, 8)),
        (b.b16x16, BlockConfig::new(16, 16)),
        (b.b32x8, BlockConfig::new(32, 8)),
        (b.b8x32, BlockConfig::new(8, 32)),
    ];
    for (enabled, config) in keep {
        if !enabled {
            result.block_configs.retain(|c| *c != config);
        }
    }

    if let Ok(path) = std::env::var(DEBUG_STRIPE_CONFIG_ENV) {
        if !path.is_empty() {
            apply_debug_file(&mut result, &path, identifier)?;
        }
    }

    Ok(result)
}

/// Apply the debug override file. Sections start with `<regex>:` and apply to
/// parts whose debug tag matches; bodies are `Name=Value` assignments or one
/// of the `DisableAll*` commands.
fn apply_debug_file(config: &mut StripeConfig, path: &str, identifier: &str) -> Result<()> {
    let text = std::fs::read_to_string(path).map_err(|e| CompileError::ConfigParseError {
        file: path.to_string(),
        line: 0,
        message: format!("cannot read file: {e}"),
    })?;

    let err = |line: usize, message: String| CompileError::ConfigParseError {
        file: path.to_string(),
        line,
        message,
    };

    let block_config_re =
        Regex::new(r"^BlockConfig\((\d+),(\d+)\)$").map_err(|_| CompileError::Internal("regex"))?;

    let mut active = false;
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(section) = line.strip_suffix(':') {
            let re = Regex::new(section)
                .map_err(|e| err(line_no, format!("bad section regex: {e}")))?;
            active = re.is_match(identifier);
            continue;
        }
        if !active {
            continue;
        }

        match line {
            "DisableAll" => {
                config.disable_all();
                continue;
            }
            "DisableAllSplits" => {
                config.disable_all_splits();
                continue;
            }
            "DisableAllBlockConfigs" => {
                config.block_configs.clear();
                continue;
            }
            _ => {}
        }

        let (name, value) = line
            .split_once('=')
            .ok_or_else(|| err(line_no, format!("unexpected command syntax: {line}")))?;
        let (name, value) = (name.trim(), value.trim());

        let parse_bool = || -> Result<bool> {
            match value {
                "True" => Ok(true),
                "False" => Ok(false),
                other => Err(err(
                    line_no,
                    format!("invalid value '{other}', must be True or False"),
                )),
            }
        };
        let parse_uint = || -> Result<u32> {
            value.parse().map_err(|_| {
                err(
                    line_no,
                    format!("invalid value '{value}', must be an unsigned number"),
                )
            })
        };

        if let Some(caps) = block_config_re.captures(name) {
            let w: u32 = caps[1].parse().unwrap_or(0);
            let h: u32 = caps[2].parse().unwrap_or(0);
            let block = BlockConfig::new(h, w);
            if parse_bool()? {
                if !config.block_configs.contains(&block) {
                    config.block_configs.push(block);
                }
            } else {
                config.block_configs.retain(|c| *c != block);
            }
            continue;
        }

        match name {
            "Splits.None" => config.splits.none = parse_bool()?,
            "Splits.WidthOnly" => config.splits.width_only = parse_bool()?,
            "Splits.MceAndPleOutputHeight" => {
                config.splits.mce_and_ple_output_height = parse_bool()?;
            }
            "Splits.MceOutputHeightOnly" => config.splits.mce_output_height_only = parse_bool()?,
            "Splits.WidthHeight" => config.splits.width_height = parse_bool()?,
            "Splits.WidthHeightOutputDepth" => {
                config.splits.width_height_output_depth = parse_bool()?;
            }
            "Splits.WidthHeightOutputDepthInputDepth" => {
                config.splits.width_height_output_depth_input_depth = parse_bool()?;
            }
            "Splits.OutputDepthInputDepth" => {
                config.splits.output_depth_input_depth = parse_bool()?;
            }
            "Splits.MceOutputDepthOnly" => config.splits.mce_output_depth_only = parse_bool()?,
            "Splits.MceAndPleOutputDepth" => {
                config.splits.mce_and_ple_output_depth = parse_bool()?;
            }
            "Splits.InputDepthOnly" => config.splits.input_depth_only = parse_bool()?,
            "BlockWidthMultiplier.Min" => config.block_width_multiplier.min = parse_uint()?,
            "BlockWidthMultiplier.Max" => config.block_width_multiplier.max = parse_uint()?,
            "BlockHeightMultiplier.Min" => config.block_height_multiplier.min = parse_uint()?,
            "BlockHeightMultiplier.Max" => config.block_height_multiplier.max = parse_uint()?,
            "IfmDepthMultiplier.Min" => config.ifm_depth_multiplier.min = parse_uint()?,
            "IfmDepthMultiplier.Max" => config.ifm_depth_multiplier.max = parse_uint()?,
            "OfmDepthMultiplier.Min" => config.ofm_depth_multiplier.min = parse_uint()?,
            "OfmDepthMultiplier.Max" => config.ofm_depth_multiplier.max = parse_uint()?,
            "PlanTypes.Beginning" => config.plan_types.beginning = parse_bool()?,
            "PlanTypes.Middle" => config.plan_types.middle = parse_bool()?,
            "PlanTypes.End" => config.plan_types.end = parse_bool()?,
            "PlanTypes.Lonely" => config.plan_types.lonely = parse_bool()?,
            other => return Err(err(line_no, format!("unknown name in assignment: {other}"))),
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Stripe generation
// ---------------------------------------------------------------------------

/// An exact rational dimension multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frac {
    /// Numerator.
    pub num: u32,
    /// Denominator.
    pub den: u32,
}

impl Frac {
    /// The identity multiplier.
    pub const ONE: Self = Self { num: 1, den: 1 };

    /// Apply to a dimension, keeping 0 (full-dim encodings) at 0.
    pub const fn apply(self, x: u32) -> u32 {
        if x == 0 {
            0
        } else {
            x * self.num / self.den
        }
    }
}

/// Per-dimension shape multiplier of a compute stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeMultiplier {
    /// Height factor.
    pub h: Frac,
    /// Width factor.
    pub w: Frac,
    /// Channel factor.
    pub c: Frac,
}

impl ShapeMultiplier {
    /// No change in any dimension.
    pub const IDENTITY: Self = Self {
        h: Frac::ONE,
        w: Frac::ONE,
        c: Frac::ONE,
    };

    /// Apply to an encoding.
    pub const fn apply(self, shape: TensorShape) -> TensorShape {
        TensorShape([
            shape.0[0],
            self.h.apply(shape.0[1]),
            self.w.apply(shape.0[2]),
            self.c.apply(shape.0[3]),
        ])
    }
}

/// Allowed slot-count range for one memory stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NumStripes {
    /// Fewest slots worth considering.
    pub min: u32,
    /// Most slots worth considering.
    pub max: u32,
}

/// MCE compute stripes of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MceStripesInfo {
    /// Input stripe.
    pub input: TensorShape,
    /// Output stripe.
    pub output: TensorShape,
    /// Weight stripe.
    pub weight: TensorShape,
    /// Block config.
    pub block_config: BlockConfig,
}

/// PLE compute stripes of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PleStripesInfo {
    /// Input stripe.
    pub input: TensorShape,
    /// Output stripe.
    pub output: TensorShape,
    /// Block config.
    pub block_config: BlockConfig,
}

/// Range and shape of one memory stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryStripeInfo {
    /// Slot-count range.
    pub range: NumStripes,
    /// Stripe shape.
    pub shape: TensorShape,
}

/// Memory stripes of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryStripesInfo {
    /// IFM tile.
    pub input: MemoryStripeInfo,
    /// Packed boundary in the IFM tile.
    pub input_boundary: PackedBoundaryThickness,
    /// Times the IFM is re-fetched.
    pub input_loads: u32,
    /// OFM tile.
    pub output: MemoryStripeInfo,
    /// Weight tile.
    pub weight: MemoryStripeInfo,
    /// Times the weights are re-fetched.
    pub weight_loads: u32,
    /// PLE-input staging tile.
    pub ple_input: MemoryStripeInfo,
}

/// One candidate stripe set with both MCE and PLE stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MceAndPleInfo {
    /// MCE stage stripes.
    pub mce: MceStripesInfo,
    /// PLE stage stripes.
    pub ple: PleStripesInfo,
    /// Memory stripes.
    pub memory: MemoryStripesInfo,
}

/// Enumerates candidate stripe sets for one MCE-based part.
#[derive(Debug, Clone)]
pub struct StripeGenerator {
    /// MCE input tensor.
    pub mce_input_shape: TensorShape,
    /// MCE output tensor.
    pub mce_output_shape: TensorShape,
    /// PLE output tensor.
    pub ple_output_shape: TensorShape,
    /// Kernel height.
    pub kernel_height: u32,
    /// Kernel width.
    pub kernel_width: u32,
    /// Top padding.
    pub pad_top: u32,
    /// Left padding.
    pub pad_left: u32,
    /// Stride `(x, y)`.
    pub stride: (u32, u32),
    /// Upscale factor.
    pub upscale_factor: u32,
    /// MCE operation.
    pub operation: MceOperation,
    /// PLE kernel run on the MCE output, when fused.
    pub ple_operation: Option<ethosn_chip::PleOperation>,
    /// MCE output shape relative to its input.
    pub mce_shape_multiplier: ShapeMultiplier,
    /// PLE output shape relative to its input.
    pub ple_shape_multiplier: ShapeMultiplier,
    /// Split search space.
    pub stripe_config: StripeConfig,
}

impl StripeGenerator {
    fn requires_boundary_data(&self) -> bool {
        self.kernel_height > 1 || self.kernel_width > 1 || self.upscale_factor > 1
    }

    fn create_num_stripes(
        &self,
        cascade: crate::parts::CascadeType,
    ) -> (NumStripes, NumStripes, NumStripes, NumStripes) {
        use crate::parts::CascadeType;
        // At least 3 input slots are needed when neighbour data is read, for
        // the stripes above and below. Weights double-buffer with 2.
        let input = if self.requires_boundary_data() {
            NumStripes { min: 3, max: 4 }
        } else {
            NumStripes { min: 1, max: 2 }
        };
        let output = match cascade {
            // Following parts may need several buffered stripes; they filter.
            CascadeType::Beginning => NumStripes { min: 1, max: 3 },
            _ => NumStripes { min: 1, max: 2 },
        };
        let weights = NumStripes { min: 1, max: 2 };
        let ple_input = NumStripes { min: 0, max: 0 };
        (input, output, weights, ple_input)
    }

    /// Split restrictions imposed by the PLE kernel.
    fn apply_ple_kernel_split_restrictions(
        &self,
        cascade: crate::parts::CascadeType,
    ) -> StripeConfig {
        use crate::parts::CascadeType;
        use ethosn_chip::PleOperation;

        let mut config = self.stripe_config.clone();
        if matches!(
            self.ple_operation,
            Some(PleOperation::MaxPool_3x3_2_2_Even | PleOperation::MaxPool_3x3_2_2_Odd)
        ) {
            // IFM streaming must not corrupt PLE SRAM mid-pool.
            if cascade == CascadeType::Beginning {
                self_disable_spatial_and_depth(&mut config);
            } else {
                config.disable_split_width();
            }
        }
        config
    }

    /// Enumerate candidates for every enabled block config.
    pub fn generate(
        &self,
        cascade: crate::parts::CascadeType,
        caps: &HardwareCapabilities,
    ) -> BTreeSet<MceAndPleInfo> {
        let mut out = BTreeSet::new();
        for &block_config in &self.stripe_config.block_configs {
            self.generate_for_block(block_config, cascade, caps, &mut out);
        }
        out
    }

    #[allow(clippy::too_many_lines)]
    fn generate_for_block(
        &self,
        block_config: BlockConfig,
        cascade: crate::parts::CascadeType,
        caps: &HardwareCapabilities,
        out: &mut BTreeSet<MceAndPleInfo>,
    ) {
        use crate::parts::CascadeType;

        let num_ogs = caps.num_ogs();
        let brick_depth = BRICK_GROUP_SHAPE[3];
        let config = self.apply_ple_kernel_split_restrictions(cascade);

        let stride_multiplier = self.stride.0 * self.stride.1;
        let is_depthwise = self.operation == MceOperation::DepthwiseConvolution;

        let (num_input, num_output, num_weights, num_ple_input) = self.create_num_stripes(cascade);

        let clamp1 = |r: NumStripes| NumStripes {
            min: r.min.min(1),
            max: r.max.min(1),
        };

        // Bounds for the width/height/depth multiplier loops. The PLE must
        // produce at least one brick group per stripe.
        let min_block_w = (BRICK_GROUP_SHAPE[2]
            / (block_config.width * self.ple_shape_multiplier.w.num / self.ple_shape_multiplier.w.den).max(1))
        .max(config.block_width_multiplier.min)
        .max(1);
        let max_block_w = (self.mce_input_shape.width() / block_config.width)
            .min(config.block_width_multiplier.max)
            .max(1);
        let min_block_h = (BRICK_GROUP_SHAPE[1]
            / (block_config.height * self.ple_shape_multiplier.h.num / self.ple_shape_multiplier.h.den).max(1))
        .max(config.block_height_multiplier.min)
        .max(1);
        let max_block_h = (self.mce_input_shape.height() / block_config.height)
            .min(config.block_height_multiplier.max)
            .max(1);
        let min_ifm_mult = config.ifm_depth_multiplier.min.max(1);
        let max_ifm_mult = (self.mce_input_shape.channels() / (num_ogs * stride_multiplier).max(1))
            .min(config.ifm_depth_multiplier.max)
            .max(1);
        let min_ofm_mult = config.ofm_depth_multiplier.min.max(1);
        let max_ofm_mult = (self.mce_output_shape.channels() / num_ogs.max(1))
            .min(config.ofm_depth_multiplier.max)
            .max(1);

        let mut add = |mce_input_encoding: TensorShape,
                       mce_output_encoding_override: Option<TensorShape>,
                       output_channel_rounding: u32,
                       memory_output_full: bool,
                       ple_full_tensor: bool,
                       input_range: NumStripes,
                       output_range: NumStripes,
                       weight_range: NumStripes| {
            let mce_input_stripe =
                create_stripe(self.mce_input_shape, mce_input_encoding, brick_depth);
            let mce_output_encoding = mce_output_encoding_override
                .unwrap_or_else(|| self.mce_shape_multiplier.apply(mce_input_encoding));
            let mce_output_stripe = create_stripe(
                self.mce_output_shape,
                mce_output_encoding,
                output_channel_rounding,
            );

            let (ple_input_stripe, ple_output_stripe) = if ple_full_tensor {
                (
                    create_stripe(self.mce_output_shape, TensorShape::default(), brick_depth),
                    create_stripe(self.ple_output_shape, TensorShape::default(), brick_depth),
                )
            } else {
                (
                    mce_output_stripe,
                    create_stripe(
                        self.ple_output_shape,
                        self.ple_shape_multiplier.apply(mce_output_encoding),
                        output_channel_rounding,
                    ),
                )
            };

            let memory_output_stripe = if memory_output_full {
                create_stripe(self.ple_output_shape, TensorShape::default(), brick_depth)
            } else {
                create_stripe(
                    self.ple_output_shape,
                    self.ple_shape_multiplier.apply(mce_output_encoding),
                    brick_depth,
                )
            };
            let output_range = if memory_output_full {
                clamp1(output_range)
            } else {
                output_range
            };

            self.add_stripe_info(
                caps,
                block_config,
                mce_input_stripe,
                mce_output_stripe,
                ple_input_stripe,
                ple_output_stripe,
                mce_input_stripe,
                memory_output_stripe,
                input_range,
                output_range,
                weight_range,
                num_ple_input,
                is_depthwise,
                out,
            );
        };

        // Split height first: the smallest stripes start computing soonest.
        if config.splits.mce_and_ple_output_height {
            add(
                TensorShape::new(0, min_block_h * block_config.height, 0, 0),
                None,
                brick_depth,
                false,
                false,
                num_input,
                num_output,
                clamp1(num_weights),
            );
        }

        // Split only the input in height, keep the output whole.
        if config.splits.mce_output_height_only {
            add(
                TensorShape::new(0, min_block_h * block_config.height, 0, 0),
                None,
                brick_depth,
                true,
                false,
                num_input,
                num_output,
                clamp1(num_weights),
            );
        }

        if config.splits.width_only {
            let input_range = if self.kernel_width == 1 {
                NumStripes { min: 1, max: 2 }
            } else {
                num_input
            };
            add(
                TensorShape::new(0, 0, min_block_w * block_config.width, 0),
                None,
                brick_depth,
                false,
                false,
                input_range,
                num_output,
                clamp1(num_weights),
            );
        }

        if cascade == CascadeType::Lonely {
            if config.splits.width_height {
                let mut h_mult = min_block_h;
                while h_mult <= max_block_h {
                    let mut w_mult = min_block_w;
                    while w_mult <= max_block_w {
                        let input_range = if self.kernel_width == 1 {
                            NumStripes { min: 1, max: 2 }
                        } else {
                            num_input
                        };
                        add(
                            TensorShape::new(
                                0,
                                h_mult * block_config.height,
                                w_mult * block_config.width,
                                0,
                            ),
                            None,
                            brick_depth,
                            false,
                            false,
                            input_range,
                            num_output,
                            clamp1(num_weights),
                        );
                        w_mult *= 2;
                    }
                    h_mult *= 2;
                }
            }

            if is_depthwise {
                if config.splits.output_depth_input_depth {
                    let mut ifm_mult = min_ifm_mult;
                    while ifm_mult <= max_ifm_mult {
                        // Depthwise: each OFM needs only its own IFM.
                        add(
                            TensorShape::new(0, 0, 0, ifm_mult * num_ogs),
                            Some(self.mce_shape_multiplier.apply(TensorShape::new(
                                0,
                                0,
                                0,
                                ifm_mult * num_ogs,
                            ))),
                            num_ogs,
                            false,
                            false,
                            num_input,
                            num_output,
                            num_weights,
                        );
                        ifm_mult *= 2;
                    }
                }

                if config.splits.width_height_output_depth_input_depth {
                    let mut h_mult = min_block_h;
                    while h_mult <= max_block_h {
                        let mut w_mult = min_block_w;
                        while w_mult <= max_block_w {
                            let mut ifm_mult = min_ifm_mult;
                            while ifm_mult <= max_ifm_mult {
                                let height = h_mult * block_config.height;
                                let width = w_mult * block_config.width;
                                add(
                                    TensorShape::new(
                                        0,
                                        height,
                                        width,
                                        ifm_mult * num_ogs * stride_multiplier,
                                    ),
                                    Some(self.mce_shape_multiplier.apply(TensorShape::new(
                                        0,
                                        height,
                                        width,
                                        ifm_mult * num_ogs,
                                    ))),
                                    num_ogs,
                                    false,
                                    false,
                                    num_input,
                                    num_output,
                                    num_weights,
                                );
                                ifm_mult *= 2;
                            }
                            w_mult *= 2;
                        }
                        h_mult *= 2;
                    }
                }
            } else {
                if config.splits.mce_and_ple_output_depth {
                    let mut ofm_mult = min_ofm_mult;
                    while ofm_mult <= max_ofm_mult {
                        add(
                            TensorShape::default(),
                            Some(self.mce_shape_multiplier.apply(TensorShape::new(
                                0,
                                0,
                                0,
                                num_ogs * ofm_mult,
                            ))),
                            num_ogs,
                            false,
                            false,
                            clamp1(num_input),
                            num_output,
                            num_weights,
                        );
                        ofm_mult *= 2;
                    }
                }

                if config.splits.width_height_output_depth {
                    let mut h_mult = min_block_h;
                    while h_mult <= max_block_h {
                        let mut w_mult = min_block_w;
                        while w_mult <= max_block_w {
                            let height = h_mult * block_config.height;
                            let width = w_mult * block_config.width;
                            add(
                                TensorShape::new(0, height, width, 0),
                                Some(self.mce_shape_multiplier.apply(TensorShape::new(
                                    0, height, width, num_ogs,
                                ))),
                                num_ogs,
                                false,
                                false,
                                num_input,
                                num_output,
                                num_weights,
                            );
                            w_mult *= 2;
                        }
                        h_mult *= 2;
                    }
                }

                // Split input depth: height and width stay at one block.
                if config.splits.width_height_output_depth_input_depth {
                    let mut ifm_mult = min_ifm_mult;
                    while ifm_mult <= max_ifm_mult {
                        let encoding = TensorShape::new(
                            0,
                            min_block_h * block_config.height,
                            min_block_w * block_config.width,
                            ifm_mult * num_ogs * stride_multiplier,
                        );
                        // Accumulating across IFM iterations limits the MCE
                        // output depth to the OG count.
                        let mut output_encoding = self.mce_shape_multiplier.apply(encoding);
                        output_encoding.0[3] = num_ogs;
                        add(
                            encoding,
                            Some(output_encoding),
                            num_ogs,
                            false,
                            false,
                            num_input,
                            num_output,
                            num_weights,
                        );
                        ifm_mult *= 2;
                    }
                }
            }
        }

        // Depth-split compute over a full-tensor memory buffer.
        if is_depthwise {
            if config.splits.output_depth_input_depth {
                add(
                    TensorShape::new(0, 0, 0, num_ogs),
                    Some(self.mce_shape_multiplier.apply(TensorShape::new(0, 0, 0, num_ogs))),
                    num_ogs,
                    true,
                    true,
                    num_input,
                    num_output,
                    num_weights,
                );
            }
        } else if config.splits.mce_output_depth_only {
            add(
                TensorShape::default(),
                Some(self.mce_shape_multiplier.apply(TensorShape::new(0, 0, 0, num_ogs))),
                num_ogs,
                true,
                true,
                clamp1(num_input),
                num_output,
                num_weights,
            );
        }

        // No split at all. Needed when everything above exceeds the tensor.
        if config.splits.none {
            add(
                TensorShape::default(),
                None,
                brick_depth,
                false,
                false,
                clamp1(num_input),
                clamp1(num_output),
                clamp1(num_weights),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_stripe_info(
        &self,
        caps: &HardwareCapabilities,
        block_config: BlockConfig,
        mce_input_stripe: TensorShape,
        mce_output_stripe: TensorShape,
        ple_input_stripe: TensorShape,
        ple_output_stripe: TensorShape,
        memory_input_stripe: TensorShape,
        memory_output_stripe: TensorShape,
        input_range: NumStripes,
        output_range: NumStripes,
        weight_range: NumStripes,
        ple_input_range: NumStripes,
        is_depthwise: bool,
        out: &mut BTreeSet<MceAndPleInfo>,
    ) {
        let input_shape = self.mce_input_shape;
        let output_shape = self.ple_output_shape;

        // No point keeping more stripes in the tile than exist in the tensor.
        let clamp_range = |range: NumStripes, tensor: TensorShape, stripe: TensorShape| {
            let in_tensor = num_stripes_total(tensor, stripe);
            let max = range.max.min(in_tensor);
            NumStripes {
                min: range.min.min(max),
                max,
            }
        };
        let input_range = clamp_range(input_range, input_shape, memory_input_stripe);
        let output_range = clamp_range(output_range, output_shape, memory_output_stripe);

        // Discard stripes that exceed the whole tensor while still claiming
        // to split it.
        let multiple_stripes = input_range.max > 1 && output_range.max > 1;
        let larger_than_tensor = memory_input_stripe.num_elements() > input_shape.num_elements()
            && memory_output_stripe.num_elements() > output_shape.num_elements();
        if multiple_stripes && larger_than_tensor {
            return;
        }

        // Firmware bound on MCE stripes per PLE stripe.
        let num_mce_stripes_per_ple = div_round_up(
            ple_input_stripe.channels(),
            mce_output_stripe.channels(),
        ) * div_round_up(input_shape.channels(), mce_input_stripe.channels());
        if num_mce_stripes_per_ple > caps.max_mce_stripes_per_ple_stripe {
            return;
        }

        // Firmware bound on IFM plus weight stripes per PLE stripe.
        let num_ifm_stripes_per_mce = div_round_up(
            mce_input_stripe.width(),
            memory_input_stripe.width(),
        ) * div_round_up(mce_input_stripe.height(), memory_input_stripe.height())
            * div_round_up(mce_input_stripe.channels(), memory_input_stripe.channels());
        let num_ifm_and_wgt_per_ple = (num_ifm_stripes_per_mce + 1) * num_mce_stripes_per_ple;
        if num_ifm_and_wgt_per_ple > caps.max_ifm_and_wgt_stripes_per_ple_stripe {
            return;
        }

        let weight_stripe = TensorShape::new(
            self.kernel_height,
            self.kernel_width,
            mce_input_stripe.channels(),
            if is_depthwise {
                1
            } else {
                mce_output_stripe.channels()
            },
        );

        // One weight stripe suffices when it already covers every channel.
        let mut weight_range = weight_range;
        let covers_all = if is_depthwise {
            weight_stripe.0[2] >= self.mce_input_shape.channels()
        } else {
            weight_stripe.0[3] >= self.mce_output_shape.channels()
        };
        if covers_all {
            weight_range.max = weight_range.max.min(1);
            weight_range.min = weight_range.min.min(weight_range.max);
        }

        let need_y = boundary_requirements(
            self.pad_top,
            input_shape.height(),
            mce_input_stripe.height(),
            mce_output_stripe.height(),
            self.kernel_height,
        );
        let need_x = boundary_requirements(
            self.pad_left,
            input_shape.width(),
            mce_input_stripe.width(),
            mce_output_stripe.width(),
            self.kernel_width,
        );
        let pack_vertical = mce_input_stripe.width() < input_shape.width();
        let pack_horizontal = mce_input_stripe.channels() < input_shape.channels();

        let boundary = PackedBoundaryThickness {
            left: if pack_horizontal && need_x.before { 8 } else { 0 },
            top: if pack_vertical && need_y.before { 8 } else { 0 },
            right: if pack_horizontal && need_x.after { 8 } else { 0 },
            bottom: if pack_vertical && need_y.after { 8 } else { 0 },
        };

        // The OFM walks XYZ while the IFM walks ZXY, so splitting the output
        // depth of a non-depthwise operation re-reads the IFM per OFM split.
        let input_split = mce_input_stripe.width() < input_shape.width()
            || mce_input_stripe.height() < input_shape.height()
            || mce_input_stripe.channels() < input_shape.channels();
        let input_loads = if !is_depthwise && input_split {
            div_round_up(
                self.mce_output_shape.channels(),
                mce_output_stripe.channels(),
            )
        } else {
            1
        };
        let weight_loads = if !is_depthwise
            && mce_input_stripe.channels() < input_shape.channels()
        {
            div_round_up(self.mce_output_shape.width(), mce_output_stripe.width())
                * div_round_up(self.mce_output_shape.height(), mce_output_stripe.height())
        } else {
            1
        };

        out.insert(MceAndPleInfo {
            mce: MceStripesInfo {
                input: mce_input_stripe,
                output: mce_output_stripe,
                weight: weight_stripe,
                block_config,
            },
            ple: PleStripesInfo {
                input: ple_input_stripe,
                output: ple_output_stripe,
                block_config,
            },
            memory: MemoryStripesInfo {
                input: MemoryStripeInfo {
                    range: input_range,
                    shape: memory_input_stripe,
                },
                input_boundary: boundary,
                input_loads,
                output: MemoryStripeInfo {
                    range: output_range,
                    shape: memory_output_stripe,
                },
                weight: MemoryStripeInfo {
                    range: weight_range,
                    shape: weight_stripe,
                },
                weight_loads,
                ple_input: MemoryStripeInfo {
                    range: ple_input_range,
                    shape: ple_input_stripe,
                },
            },
        });
    }
}

fn self_disable_spatial_and_depth(config: &mut StripeConfig) {
    config.disable_split_height();
    config.disable_split_width();
    config.disable_split_input_depth();
    config.disable_split_output_depth();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::CascadeType;
    use ethosn_chip::EthosN78Variant;

    fn caps() -> HardwareCapabilities {
        HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio)
    }

    fn generator() -> StripeGenerator {
        StripeGenerator {
            mce_input_shape: TensorShape::new(1, 64, 64, 32),
            mce_output_shape: TensorShape::new(1, 64, 64, 32),
            ple_output_shape: TensorShape::new(1, 64, 64, 32),
            kernel_height: 3,
            kernel_width: 3,
            pad_top: 1,
            pad_left: 1,
            stride: (1, 1),
            upscale_factor: 1,
            operation: MceOperation::Convolution,
            ple_operation: None,
            mce_shape_multiplier: ShapeMultiplier::IDENTITY,
            ple_shape_multiplier: ShapeMultiplier::IDENTITY,
            stripe_config: StripeConfig::default(),
        }
    }

    #[test]
    fn test_generator_produces_candidates() {
        let infos = generator().generate(CascadeType::Lonely, &caps());
        assert!(!infos.is_empty());
        // Every candidate respects the firmware stripe limits.
        for info in &infos {
            let per_ple = div_round_up(info.ple.input.channels(), info.mce.output.channels())
                * div_round_up(
                    generator().mce_input_shape.channels(),
                    info.mce.input.channels(),
                );
            assert!(per_ple <= caps().max_mce_stripes_per_ple_stripe);
        }
    }

    #[test]
    fn test_height_split_needs_three_input_slots() {
        // 3x3 kernel reads into the neighbour stripes.
        let infos = generator().generate(CascadeType::Beginning, &caps());
        let height_split = infos
            .iter()
            .find(|i| i.memory.input.shape.height() < 64 && i.memory.input.shape.width() >= 64)
            .expect("height-split candidate");
        assert!(height_split.memory.input.range.min >= 3);
    }

    #[test]
    fn test_weight_stripe_collapse() {
        // Full-depth weight stripes never need double buffering.
        let infos = generator().generate(CascadeType::Lonely, &caps());
        for info in &infos {
            if info.mce.weight.0[3] >= 32 {
                assert_eq!(info.memory.weight.range.max, 1);
            }
        }
    }

    #[test]
    fn test_none_split_is_single_stripe() {
        let mut generator = generator();
        generator.stripe_config.disable_all_splits();
        generator.stripe_config.splits.none = true;
        let infos = generator.generate(CascadeType::Lonely, &caps());
        assert_eq!(infos.len(), generator.stripe_config.block_configs.len());
        for info in &infos {
            assert_eq!(info.memory.input.range.max, 1);
            assert!(info.memory.input.shape.height() >= 64);
        }
    }

    #[test]
    fn test_debug_config_overrides() {
        let dir = std::env::temp_dir().join("ethosn-stripe-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.txt");
        std::fs::write(
            &path,
            "McePart 3:\nDisableAll\nSplits.WidthHeight=True\nBlockConfig(8,8)=True\n",
        )
        .unwrap();

        let mut config = StripeConfig::default();
        apply_debug_file(&mut config, path.to_str().unwrap(), "McePart 3").unwrap();
        assert!(config.splits.width_height);
        assert!(!config.splits.none);
        assert_eq!(config.block_configs, vec![BlockConfig::new(8, 8)]);

        // A non-matching identifier is untouched.
        let mut config = StripeConfig::default();
        apply_debug_file(&mut config, path.to_str().unwrap(), "McePart 4").unwrap();
        assert_eq!(config, StripeConfig::default());
    }

    #[test]
    fn test_debug_config_rejects_unknown_name() {
        let dir = std::env::temp_dir().join("ethosn-stripe-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.txt");
        std::fs::write(&path, ".*:\nSplits.Bogus=True\n").unwrap();

        let mut config = StripeConfig::default();
        let err = apply_debug_file(&mut config, path.to_str().unwrap(), "McePart 0");
        assert!(matches!(
            err,
            Err(CompileError::ConfigParseError { line: 2, .. })
        ));
    }
}
