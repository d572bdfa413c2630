//! Plans for reshape parts: a DRAM reinterpretation, no data movement.

use crate::error::Result;
use crate::parts::{CascadeType, PartCommon, PartInputSlot, PartOutputSlot};
use crate::plan::{Buffer, BufferFormat, BufferType, OpGraph, Plan};
use crate::tensor::TensorInfo;

/// A shape reinterpretation. NHWC is linear, so the same DRAM bytes serve
/// both shapes; producers store into the buffer and consumers load from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReshapePart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// Input operand.
    pub input_info: TensorInfo,
    /// Output operand (same element count).
    pub output_info: TensorInfo,
}

impl ReshapePart {
    /// The single plan: one NHWC DRAM buffer serving both slots.
    pub fn get_plans(&self, cascade: CascadeType) -> Result<Vec<Plan>> {
        if cascade != CascadeType::Lonely {
            return Ok(Vec::new());
        }
        let mut graph = OpGraph::new();
        let mut buffer = Buffer::new_dram(BufferFormat::Nhwc, self.output_info.shape);
        buffer.buffer_type = Some(BufferType::Intermediate);
        buffer.data_type = self.output_info.data_type;
        buffer.quant = self.output_info.quant;
        let id = graph.add_buffer(buffer);

        let mut plan = Plan {
            graph,
            input_mappings: Default::default(),
            output_mappings: Default::default(),
        };
        plan.input_mappings.insert(
            id,
            PartInputSlot {
                part: self.common.id,
                index: 0,
            },
        );
        plan.output_mappings.insert(
            id,
            PartOutputSlot {
                part: self.common.id,
                index: 0,
            },
        );
        Ok(vec![plan])
    }
}
