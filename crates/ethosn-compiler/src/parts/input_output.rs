//! Plans for network boundary parts: a single DRAM buffer each.

use crate::error::Result;
use crate::parts::{CascadeType, PartCommon, PartInputSlot, PartOutputSlot};
use crate::plan::{Buffer, BufferFormat, BufferType, OpGraph, Plan};
use crate::tensor::TensorInfo;

/// A network input: a DRAM buffer filled by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct InputPart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// The operand.
    pub tensor_info: TensorInfo,
}

impl InputPart {
    /// The single plan: one NHWC DRAM buffer.
    pub fn get_plans(&self, cascade: CascadeType) -> Result<Vec<Plan>> {
        if cascade != CascadeType::Lonely {
            return Ok(Vec::new());
        }
        let mut graph = OpGraph::new();
        let mut buffer = Buffer::new_dram(BufferFormat::Nhwc, self.tensor_info.shape);
        buffer.buffer_type = Some(BufferType::Input);
        buffer.data_type = self.tensor_info.data_type;
        buffer.quant = self.tensor_info.quant;
        let id = graph.add_buffer(buffer);

        let mut plan = Plan {
            graph,
            input_mappings: Default::default(),
            output_mappings: Default::default(),
        };
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

/// A network output: a DRAM buffer read back by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPart {
    /// Identity and provenance.
    pub common: PartCommon,
    /// The operand.
    pub tensor_info: TensorInfo,
}

impl OutputPart {
    /// The single plan: one NHWC DRAM buffer.
    pub fn get_plans(&self, cascade: CascadeType) -> Result<Vec<Plan>> {
        if cascade != CascadeType::Lonely {
            return Ok(Vec::new());
        }
        let mut graph = OpGraph::new();
        let mut buffer = Buffer::new_dram(BufferFormat::Nhwc, self.tensor_info.shape);
        buffer.buffer_type = Some(BufferType::Output);
        buffer.data_type = self.tensor_info.data_type;
        buffer.quant = self.tensor_info.quant;
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
        Ok(vec![plan])
    }
}
