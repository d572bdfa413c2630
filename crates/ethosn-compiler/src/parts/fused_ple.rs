//! Plan generation for fused PLE parts: an identity MCE pass feeding a
//! non-trivial PLE kernel (activations, pooling, interleave, mean).

use bytes::Bytes;
use ethosn_chip::{BlockConfig, PleOperation};
use ethosn_command_stream::MceOperation;

use crate::error::{CompileError, Result};
use crate::parts::plan_builder::{build_mce_ple_plan, McePlanSpec};
use crate::parts::{CascadeType, PartCommon, PlanContext};
use crate::plan::{Buffer, Location, Plan};
use crate::stripes::{ShapeMultiplier, StripeConfig, StripeGenerator};
use crate::tensor::{QuantizationInfo, TensorInfo, TensorShape};
use crate::weights::WeightEncodeParams;

/// A part whose real work happens in the PLE, behind an identity MCE pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedPlePart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// Input operand.
    pub input_info: TensorInfo,
    /// Output operand.
    pub output_info: TensorInfo,
    /// The kernel to run.
    pub ple_op: PleOperation,
    /// Output shape relative to the kernel input.
    pub shape_multiplier: ShapeMultiplier,
    /// Requantisation applied by the kernel `(multiplier, shift)`.
    pub input0_rescale: (u16, u8),
    /// Stripe search space for this part.
    pub stripe_config: StripeConfig,
}

impl FusedPlePart {
    /// Identity depthwise weights for the leading MCE pass: one weight per
    /// channel, unit scale.
    fn identity_weights(&self) -> (Bytes, TensorShape, QuantizationInfo, Vec<i32>) {
        let channels = self.input_info.shape.channels();
        let shape = TensorShape::new(1, 1, channels, 1);
        let weights = Bytes::from(vec![2u8; channels as usize]);
        let quant = QuantizationInfo::new(0, 0.5);
        let bias = vec![0i32; channels as usize];
        (weights, shape, quant, bias)
    }

    /// Enumerate plans.
    pub fn get_plans(
        &self,
        cascade: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
        num_weight_stripes: u32,
        ctx: &mut PlanContext<'_>,
    ) -> Result<Vec<Plan>> {
        let allowed = match cascade {
            CascadeType::Beginning => self.stripe_config.plan_types.beginning,
            CascadeType::Middle => self.stripe_config.plan_types.middle,
            CascadeType::End => self.stripe_config.plan_types.end,
            CascadeType::Lonely => self.stripe_config.plan_types.lonely,
        };
        if !allowed {
            return Ok(Vec::new());
        }

        if matches!(cascade, CascadeType::Middle | CascadeType::End) {
            match prev_buffer {
                Some(prev) if prev.location == Location::Sram => {}
                _ => return Ok(Vec::new()),
            }
        }

        let (weights, weights_shape, weights_quant, bias) = self.identity_weights();

        let generator = StripeGenerator {
            mce_input_shape: self.input_info.shape,
            mce_output_shape: self.input_info.shape,
            ple_output_shape: self.output_info.shape,
            kernel_height: 1,
            kernel_width: 1,
            pad_top: 0,
            pad_left: 0,
            stride: (1, 1),
            upscale_factor: 1,
            operation: MceOperation::DepthwiseConvolution,
            ple_operation: Some(self.ple_op),
            mce_shape_multiplier: ShapeMultiplier::IDENTITY,
            ple_shape_multiplier: self.shape_multiplier,
            stripe_config: self.stripe_config.clone(),
        };

        let mut plans = Vec::new();
        let mut encode_failed = false;

        for info in generator.generate(cascade, ctx.caps) {
            if let Some(required) = block_config {
                if info.mce.block_config != required {
                    continue;
                }
            }

            let input_stripes: Vec<u32> = match cascade {
                CascadeType::Middle | CascadeType::End => {
                    let prev = prev_buffer.ok_or(CompileError::Internal(
                        "mid-section plan generation without a previous buffer",
                    ))?;
                    if prev.stripe_shape != info.memory.input.shape
                        || prev.num_stripes < info.memory.input.range.min
                        || prev.num_stripes > info.memory.input.range.max
                    {
                        continue;
                    }
                    vec![prev.num_stripes]
                }
                _ => (info.memory.input.range.min..=info.memory.input.range.max).collect(),
            };

            let encode_params = WeightEncodeParams {
                weights: weights.clone(),
                weights_shape,
                weights_quant,
                bias: bias.clone(),
                bias_quant: QuantizationInfo::new(0, 1.0),
                input_quant: self.input_info.quant,
                output_quant: self.input_info.quant,
                stripe_depth: info.memory.weight.shape.0[2].max(1),
                stride: (1, 1),
                padding: (0, 0),
                iteration_size: info.mce.input.channels(),
                operation: MceOperation::DepthwiseConvolution,
            };
            let Some(encoded) = ctx.weight_cache.encode(&encode_params) else {
                encode_failed = true;
                continue;
            };

            let spec = McePlanSpec {
                part_id: self.common.id,
                input_info: self.input_info,
                output_info: self.output_info,
                operation: MceOperation::DepthwiseConvolution,
                stride: (1, 1),
                pad: (0, 0),
                upscale_factor: 1,
                relu_bounds: (
                    i16::try_from(self.input_info.data_type.min_value()).unwrap_or(i16::MIN),
                    i16::try_from(self.input_info.data_type.max_value()).unwrap_or(i16::MAX),
                ),
                ple_op: self.ple_op,
                input0_rescale: self.input0_rescale,
                weights_shape,
                encoded_weights: &encoded,
            };

            for &num_input in &input_stripes {
                for num_output in info.memory.output.range.min..=info.memory.output.range.max {
                    if let Some(plan) = build_mce_ple_plan(
                        ctx.caps,
                        &info,
                        num_input,
                        num_output.max(1),
                        num_weight_stripes.clamp(1, info.memory.weight.range.max.max(1)),
                        &spec,
                    ) {
                        plans.push(plan);
                    }
                }
            }
        }

        if plans.is_empty() && encode_failed {
            return Err(CompileError::EncodeFailure {
                part: self.common.id,
            });
        }
        Ok(plans)
    }
}
