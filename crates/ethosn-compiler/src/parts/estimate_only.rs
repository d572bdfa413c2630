//! Placeholder parts for operations outside the supported set.
//!
//! These only exist in estimation mode; real compilation rejects the network
//! before the section search starts.

use crate::error::Result;
use crate::parts::{CascadeType, PartCommon, PartInputSlot, PartOutputSlot};
use crate::plan::{Buffer, BufferFormat, BufferType, Op, OpGraph, Plan};
use crate::tensor::TensorInfo;

/// A part standing in for an unsupported operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateOnlyPart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// Why the operation is unsupported.
    pub reason: String,
    /// Input operands.
    pub input_infos: Vec<TensorInfo>,
    /// Declared output operand.
    pub output_info: TensorInfo,
}

impl EstimateOnlyPart {
    /// The single placeholder plan: DRAM in, DRAM out, one opaque op.
    pub fn get_plans(&self, cascade: CascadeType) -> Result<Vec<Plan>> {
        if cascade != CascadeType::Lonely {
            return Ok(Vec::new());
        }

        let mut graph = OpGraph::new();
        let op = graph.add_op(Op::EstimateOnly {
            reason: self.reason.clone(),
        });

        let mut plan = Plan {
            graph,
            input_mappings: Default::default(),
            output_mappings: Default::default(),
        };

        for (index, info) in self.input_infos.iter().enumerate() {
            let mut buffer = Buffer::new_dram(BufferFormat::Nhwc, info.shape);
            buffer.buffer_type = Some(BufferType::Intermediate);
            buffer.data_type = info.data_type;
            buffer.quant = info.quant;
            let id = plan.graph.add_buffer(buffer);
            plan.graph.add_consumer(id, op, u32::try_from(index).unwrap_or(0));
            plan.input_mappings.insert(
                id,
                PartInputSlot {
                    part: self.common.id,
                    index: u32::try_from(index).unwrap_or(0),
                },
            );
        }

        let mut buffer = Buffer::new_dram(BufferFormat::Nhwc, self.output_info.shape);
        buffer.buffer_type = Some(BufferType::Intermediate);
        buffer.data_type = self.output_info.data_type;
        buffer.quant = self.output_info.quant;
        let id = plan.graph.add_buffer(buffer);
        plan.graph.set_producer(id, op);
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
