//! Plan generation for standalone PLE parts: kernels fed straight from SRAM
//! with no MCE pass (addition, rescaled addition, 3x3/1 average pool).

use ethosn_chip::geometry::BRICK_GROUP_SHAPE;
use ethosn_chip::{BlockConfig, PleKernelId, PleOperation};

use crate::error::Result;
use crate::geometry::{calculate_tile_size, PackedBoundaryThickness};
use crate::parts::{CascadeType, PartCommon, PartInputSlot, PartOutputSlot, PlanContext};
use crate::plan::{Buffer, Location, Op, OpGraph, Plan, PleOp};
use crate::stripes::StripeConfig;
use crate::tensor::{create_stripe, DataType, TensorInfo, TensorShape};

/// A part that runs wholly on the PLE, reading its inputs from SRAM.
#[derive(Debug, Clone, PartialEq)]
pub struct StandalonePlePart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// Input operands; two for the addition kernels.
    pub input_infos: Vec<TensorInfo>,
    /// Output operand.
    pub output_info: TensorInfo,
    /// The kernel to run.
    pub ple_op: PleOperation,
    /// Requantisation per input `(multiplier, shift)`.
    pub input_rescales: Vec<(u16, u8)>,
    /// Stripe search space for this part.
    pub stripe_config: StripeConfig,
}

impl StandalonePlePart {
    /// Enumerate plans.
    pub fn get_plans(
        &self,
        cascade: CascadeType,
        prev_buffer: Option<&Buffer>,
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
                // Cannot continue a section from e.g. the PLE staging SRAM.
                _ => return Ok(Vec::new()),
            }
        }

        let mut config = self.stripe_config.clone();
        match self.ple_op {
            PleOperation::Addition | PleOperation::AdditionRescale => {
                // Two inputs make these uncascadable: only single-input parts
                // may sit inside a section.
                if cascade != CascadeType::Lonely {
                    return Ok(Vec::new());
                }
            }
            PleOperation::AvgPool_3x3_1_1 => {
                // Only a depth split keeps the UDMA window coherent.
                config.disable_split_width();
                config.disable_split_height();
                if cascade != CascadeType::Lonely {
                    config.disable_split_input_depth();
                    config.disable_split_output_depth();
                }
                if let (CascadeType::Middle | CascadeType::End, Some(prev)) =
                    (cascade, prev_buffer)
                {
                    // Mid-section the whole tensor must already be resident.
                    let input = self.input_infos[0].shape;
                    if prev.stripe_shape.height() < input.height()
                        || prev.stripe_shape.width() < input.width()
                        || prev.stripe_shape.channels() < input.channels()
                    {
                        return Ok(Vec::new());
                    }
                }
            }
            _ => {
                return Err(crate::error::CompileError::Internal(
                    "not a standalone PLE operation",
                ))
            }
        }

        let brick_height = BRICK_GROUP_SHAPE[1];
        let brick_width = BRICK_GROUP_SHAPE[2];
        let brick_depth = BRICK_GROUP_SHAPE[3];

        let mut plans = Vec::new();
        let mut add_plan = |output_stripe: TensorShape, ctx: &mut PlanContext<'_>| {
            if let Some(plan) = self.build_plan(output_stripe, ctx) {
                plans.push(plan);
            }
        };

        if config.splits.none {
            add_plan(
                create_stripe(self.output_info.shape, TensorShape::default(), brick_depth),
                ctx,
            );
        }
        if config.splits.width_only {
            add_plan(
                create_stripe(
                    self.output_info.shape,
                    TensorShape::new(0, 0, brick_width, 0),
                    brick_depth,
                ),
                ctx,
            );
        }
        if config.splits.mce_and_ple_output_height {
            add_plan(
                create_stripe(
                    self.output_info.shape,
                    TensorShape::new(0, brick_height, 0, 0),
                    brick_depth,
                ),
                ctx,
            );
        }

        if cascade == CascadeType::Lonely {
            if config.splits.output_depth_input_depth {
                add_plan(
                    create_stripe(
                        self.output_info.shape,
                        TensorShape::new(0, 0, 0, brick_depth),
                        brick_depth,
                    ),
                    ctx,
                );
            }

            if config.splits.width_height_output_depth_input_depth {
                // Larger stripes than the non-lonely plans above, covering
                // one, two or all three split dimensions.
                let mut height = brick_height;
                while height < self.output_info.shape.height() * 2 {
                    let mut width = brick_width;
                    while width < self.output_info.shape.width() * 2 {
                        let mut depth = brick_depth;
                        while depth < self.output_info.shape.channels() * 2 {
                            add_plan(
                                create_stripe(
                                    self.output_info.shape,
                                    TensorShape::new(0, height, width, depth),
                                    brick_depth,
                                ),
                                ctx,
                            );
                            depth *= 2;
                        }
                        width *= 2;
                    }
                    height *= 2;
                }
            }
        }

        Ok(plans)
    }

    /// Build one plan with every input tile shaped like the output stripe.
    fn build_plan(&self, output_stripe: TensorShape, ctx: &mut PlanContext<'_>) -> Option<Plan> {
        // Standalone kernels ignore the block config; 16x16 by convention.
        let block_config = BlockConfig::new(16, 16);
        let signed = matches!(
            self.output_info.data_type,
            DataType::QAsymmS8 | DataType::QSymmS8
        );
        let kernel = PleKernelId::select(self.ple_op, block_config, signed)?;

        let mut graph = OpGraph::new();
        let mut input_ids = Vec::with_capacity(self.input_infos.len());

        for info in &self.input_infos {
            let tile = calculate_tile_size(
                ctx.caps,
                info.shape,
                output_stripe,
                PackedBoundaryThickness::default(),
                2,
                true,
            );
            let mut buffer = Buffer::new_sram(info.shape, output_stripe);
            buffer.num_stripes = 2;
            buffer.slot_size_bytes = tile.slot_size_bytes;
            buffer.size_bytes = tile.size_bytes;
            buffer.data_type = info.data_type;
            buffer.quant = info.quant;
            buffer.forbid_fcaf_wide = tile.forbid_fcaf_wide;
            input_ids.push(graph.add_buffer(buffer));
        }

        let output_tile = calculate_tile_size(
            ctx.caps,
            self.output_info.shape,
            output_stripe,
            PackedBoundaryThickness::default(),
            2,
            false,
        );
        let mut output_buffer = Buffer::new_sram(self.output_info.shape, output_stripe);
        output_buffer.num_stripes = 2;
        output_buffer.slot_size_bytes = output_tile.slot_size_bytes;
        output_buffer.size_bytes = output_tile.size_bytes;
        output_buffer.data_type = self.output_info.data_type;
        output_buffer.quant = self.output_info.quant;
        let output_id = graph.add_buffer(output_buffer);

        let rescale = |i: usize| self.input_rescales.get(i).copied().unwrap_or((0, 0));
        let ple = graph.add_op(Op::Ple(PleOp {
            op: self.ple_op,
            kernel,
            block_config,
            input_stripe_shapes: vec![output_stripe; self.input_infos.len()],
            output_stripe_shape: output_stripe,
            load_kernel: true,
            kernel_offset: None,
            input0_rescale: rescale(0),
            input1_rescale: rescale(1),
        }));
        for (port, id) in input_ids.iter().enumerate() {
            graph.add_consumer(*id, ple, u32::try_from(port).unwrap_or(0));
        }
        graph.set_producer(output_id, ple);

        if graph.sram_bytes().saturating_add(kernel.code_size()) > ctx.caps.total_sram_bytes {
            return None;
        }

        let mut plan = Plan {
            graph,
            input_mappings: Default::default(),
            output_mappings: Default::default(),
        };
        for (index, id) in input_ids.iter().enumerate() {
            plan.input_mappings.insert(
                *id,
                PartInputSlot {
                    part: self.common.id,
                    index: u32::try_from(index).unwrap_or(0),
                },
            );
        }
        plan.output_mappings.insert(
            output_id,
            PartOutputSlot {
                part: self.common.id,
                index: 0,
            },
        );
        Some(plan)
    }
}
