//! Plan generation for MCE work: convolution, depthwise, fully connected,
//! and the upscaling variants used by resize and transpose convolution.

use bytes::Bytes;
use ethosn_chip::BlockConfig;
use ethosn_command_stream::MceOperation;

use crate::error::{CompileError, Result};
use crate::parts::plan_builder::{build_mce_ple_plan, McePlanSpec};
use crate::parts::{CascadeType, PartCommon, PlanContext};
use crate::plan::{Buffer, Location, Plan};
use crate::stripes::{Frac, ShapeMultiplier, StripeConfig, StripeGenerator};
use crate::tensor::{QuantizationInfo, TensorInfo, TensorShape};
use crate::weights::WeightEncodeParams;

/// Everything that defines one MCE part's operation.
#[derive(Debug, Clone, PartialEq)]
pub struct McePartParams {
    /// Input operand.
    pub input_info: TensorInfo,
    /// Output operand.
    pub output_info: TensorInfo,
    /// Operation mode.
    pub operation: MceOperation,
    /// Weight tensor shape: HWIO, or HWIM for depthwise.
    pub weights_shape: TensorShape,
    /// Weight bytes in HWIO/HWIM order.
    pub weights: Bytes,
    /// Weight quantisation.
    pub weights_quant: QuantizationInfo,
    /// Bias, one value per output channel.
    pub bias: Vec<i32>,
    /// Bias quantisation.
    pub bias_quant: QuantizationInfo,
    /// Stride `(x, y)`.
    pub stride: (u32, u32),
    /// Padding `(left, top)`.
    pub pad: (u32, u32),
    /// Upscale factor applied by the MCE (resize, transpose conv).
    pub upscale_factor: u32,
    /// Quantised relu clamp `(lower, upper)`.
    pub relu_bounds: (i16, i16),
    /// Stripe search space for this part.
    pub stripe_config: StripeConfig,
}

/// A part computed by the MCE with a passthrough PLE stage.
#[derive(Debug, Clone, PartialEq)]
pub struct McePart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// Operation parameters.
    pub params: McePartParams,
}

impl McePart {
    fn kernel_height(&self) -> u32 {
        self.params.weights_shape.0[0]
    }

    fn kernel_width(&self) -> u32 {
        self.params.weights_shape.0[1]
    }

    /// Output channels covered by one weight stripe.
    fn weight_stripe_depth(&self, weight_stripe: TensorShape) -> u32 {
        match self.params.operation {
            MceOperation::DepthwiseConvolution => {
                (weight_stripe.0[2] * weight_stripe.0[3])
                    / (self.params.stride.0 * self.params.stride.1).max(1)
            }
            _ => weight_stripe.0[3],
        }
    }

    /// Enumerate plans. See the combiner for how the arguments are chosen.
    pub fn get_plans(
        &self,
        cascade: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
        num_weight_stripes: u32,
        ctx: &mut PlanContext<'_>,
    ) -> Result<Vec<Plan>> {
        let allowed = match cascade {
            CascadeType::Beginning => self.params.stripe_config.plan_types.beginning,
            CascadeType::Middle => self.params.stripe_config.plan_types.middle,
            CascadeType::End => self.params.stripe_config.plan_types.end,
            CascadeType::Lonely => self.params.stripe_config.plan_types.lonely,
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

        let generator = StripeGenerator {
            mce_input_shape: self.params.input_info.shape,
            mce_output_shape: self.params.output_info.shape,
            ple_output_shape: self.params.output_info.shape,
            kernel_height: self.kernel_height(),
            kernel_width: self.kernel_width(),
            pad_top: self.params.pad.1,
            pad_left: self.params.pad.0,
            stride: self.params.stride,
            upscale_factor: self.params.upscale_factor,
            operation: self.params.operation,
            ple_operation: None,
            mce_shape_multiplier: ShapeMultiplier {
                h: Frac {
                    num: self.params.upscale_factor,
                    den: 1,
                },
                w: Frac {
                    num: self.params.upscale_factor,
                    den: 1,
                },
                c: Frac::ONE,
            },
            ple_shape_multiplier: ShapeMultiplier::IDENTITY,
            stripe_config: self.params.stripe_config.clone(),
        };

        let mut plans = Vec::new();
        let mut encode_failed = false;

        for info in generator.generate(cascade, ctx.caps) {
            if let Some(required) = block_config {
                if info.mce.block_config != required {
                    continue;
                }
            }

            // Continuing a section pins the input tile to what the previous
            // part's plan already placed in SRAM.
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

            let stripe_depth = self.weight_stripe_depth(info.memory.weight.shape);
            let encode_params = WeightEncodeParams {
                weights: self.params.weights.clone(),
                weights_shape: self.params.weights_shape,
                weights_quant: self.params.weights_quant,
                bias: self.params.bias.clone(),
                bias_quant: self.params.bias_quant,
                input_quant: self.params.input_info.quant,
                output_quant: self.params.output_info.quant,
                stripe_depth,
                stride: self.params.stride,
                padding: self.params.pad,
                iteration_size: info.mce.input.channels(),
                operation: self.params.operation,
            };
            let Some(encoded) = ctx.weight_cache.encode(&encode_params) else {
                encode_failed = true;
                continue;
            };

            let weight_stripes = num_weight_stripes
                .clamp(info.memory.weight.range.min.max(1), info.memory.weight.range.max.max(1));

            let spec = McePlanSpec {
                part_id: self.common.id,
                input_info: self.params.input_info,
                output_info: self.params.output_info,
                operation: self.params.operation,
                stride: self.params.stride,
                pad: self.params.pad,
                upscale_factor: self.params.upscale_factor,
                relu_bounds: self.params.relu_bounds,
                ple_op: ethosn_chip::PleOperation::Passthrough,
                input0_rescale: (0, 0),
                weights_shape: self.params.weights_shape,
                encoded_weights: &encoded,
            };

            for &num_input in &input_stripes {
                for num_output in info.memory.output.range.min..=info.memory.output.range.max {
                    if let Some(plan) = build_mce_ple_plan(
                        ctx.caps,
                        &info,
                        num_input,
                        num_output.max(1),
                        weight_stripes,
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
        tracing::trace!(
            "{} generated {} plan(s) as {cascade:?}",
            self.common.id,
            plans.len()
        );
        Ok(plans)
    }
}
