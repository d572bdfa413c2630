//! Plans for concatenation: DMAs from each input tile into disjoint regions
//! of one DRAM supertensor.

use crate::error::Result;
use crate::geometry::PackedBoundaryThickness;
use crate::parts::{CascadeType, PartCommon, PartInputSlot, PartOutputSlot, PlanContext};
use crate::plan::{Buffer, BufferFormat, BufferType, DmaOp, Op, OpGraph, Plan};
use crate::tensor::{
    create_stripe, round_up, total_size_bytes_nhwcb, TensorInfo, TensorShape,
};

/// Concatenation along width or channels. Each input slot gets its own DMA
/// into the shared output supertensor; the offsets are brick aligned, which
/// the converter guarantees before creating this part.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatPart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// Input operands, in slot order.
    pub input_infos: Vec<TensorInfo>,
    /// Output operand.
    pub output_info: TensorInfo,
    /// Concatenation axis: 2 (width) or 3 (channels).
    pub axis: u32,
}

impl ConcatPart {
    /// Byte offset of input `index` inside the NHWCB output supertensor.
    pub fn dram_offset(&self, index: usize) -> u32 {
        let preceding: u32 = self.input_infos[..index]
            .iter()
            .map(|info| info.shape.0[self.axis as usize])
            .sum();
        let out = self.output_info.shape;
        match self.axis {
            // Width offset: whole brick columns.
            2 => (preceding / 8) * 8 * 8 * round_up(out.channels(), 16),
            // Channel offset: whole brick planes.
            3 => (preceding / 16) * round_up(out.height(), 8) * round_up(out.width(), 8) * 16,
            _ => 0,
        }
    }

    /// The single plan shape: per-input SRAM tiles DMA'd into DRAM.
    pub fn get_plans(&self, cascade: CascadeType, ctx: &mut PlanContext<'_>) -> Result<Vec<Plan>> {
        if cascade != CascadeType::Lonely {
            return Ok(Vec::new());
        }

        let mut graph = OpGraph::new();
        let mut output = Buffer::new_dram(BufferFormat::Nhwcb, self.output_info.shape);
        output.size_bytes = total_size_bytes_nhwcb(self.output_info.shape);
        output.buffer_type = Some(BufferType::Intermediate);
        output.data_type = self.output_info.data_type;
        output.quant = self.output_info.quant;
        let output_id = graph.add_buffer(output);

        let mut plan = Plan {
            graph,
            input_mappings: Default::default(),
            output_mappings: Default::default(),
        };

        for (index, info) in self.input_infos.iter().enumerate() {
            let stripe = create_stripe(info.shape, TensorShape::new(0, 8, 0, 0), 16);
            let tile = crate::geometry::calculate_tile_size(
                ctx.caps,
                info.shape,
                stripe,
                PackedBoundaryThickness::default(),
                2,
                false,
            );
            let mut buffer = Buffer::new_sram(info.shape, stripe);
            buffer.num_stripes = 2;
            buffer.slot_size_bytes = tile.slot_size_bytes;
            buffer.size_bytes = tile.size_bytes;
            buffer.data_type = info.data_type;
            buffer.quant = info.quant;
            let input_id = plan.graph.add_buffer(buffer);

            let dma = plan.graph.add_op(Op::Dma(DmaOp {
                format: BufferFormat::Nhwcb,
                dram_offset: self.dram_offset(index),
            }));
            plan.graph.add_consumer(input_id, dma, 0);
            plan.graph.set_producer(output_id, dma);

            plan.input_mappings.insert(
                input_id,
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
        Ok(vec![plan])
    }
}
