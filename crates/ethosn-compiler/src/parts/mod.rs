//! Parts: the compilation-level IR.
//!
//! A part wraps one logical operation together with everything its plan
//! generator needs. The deep inheritance of other compilers is a sum type
//! here; the two behaviours that matter are `get_plans` and `dot_label`.

mod concat;
mod estimate_only;
mod fused_ple;
pub mod graph;
mod input_output;
mod mce;
mod plan_builder;
mod reshape;
mod standalone_ple;

pub use graph::GraphOfParts;
pub use mce::{McePart, McePartParams};
pub use fused_ple::FusedPlePart;
pub use standalone_ple::StandalonePlePart;
pub use concat::ConcatPart;
pub use estimate_only::EstimateOnlyPart;
pub use input_output::{InputPart, OutputPart};
pub use reshape::ReshapePart;

use std::collections::BTreeSet;

use ethosn_chip::{BlockConfig, HardwareCapabilities};

use crate::error::Result;
use crate::plan::{Buffer, Plan};
use crate::weights::WeightEncoderCache;
use crate::tensor::TensorInfo;

/// Dense part identifier. Ids are assigned in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartId(pub u32);

impl std::fmt::Display for PartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One input slot of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartInputSlot {
    /// Owning part.
    pub part: PartId,
    /// Slot index.
    pub index: u32,
}

/// One output slot of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartOutputSlot {
    /// Owning part.
    pub part: PartId,
    /// Slot index.
    pub index: u32,
}

/// Position of a part within a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CascadeType {
    /// First part of a multi-part section.
    Beginning,
    /// Interior part of a section.
    Middle,
    /// Last part of a section.
    End,
    /// A one-part section.
    Lonely,
}

/// Shared identity and provenance of every part variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartCommon {
    /// The part's id.
    pub id: PartId,
    /// Front-end operation ids this part implements.
    pub operation_ids: BTreeSet<u32>,
}

impl PartCommon {
    /// Create the common block.
    pub fn new(id: PartId, operation_ids: BTreeSet<u32>) -> Self {
        Self { id, operation_ids }
    }
}

/// Shared context handed to every plan generator.
pub struct PlanContext<'a> {
    /// Hardware description.
    pub caps: &'a HardwareCapabilities,
    /// Weight encoder cache for the whole compilation.
    pub weight_cache: &'a mut WeightEncoderCache,
    /// Estimation mode: unsupported configurations become placeholder parts
    /// instead of hard errors.
    pub estimation: bool,
}

/// A unit of compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    /// Network input.
    Input(InputPart),
    /// Network output.
    Output(OutputPart),
    /// MCE work: convolution, depthwise, fully connected, resize, upscale.
    Mce(McePart),
    /// Identity MCE feeding a PLE kernel.
    FusedPle(FusedPlePart),
    /// PLE kernel fed from SRAM.
    StandalonePle(StandalonePlePart),
    /// Concatenation in DRAM.
    Concat(ConcatPart),
    /// Shape reinterpretation in DRAM.
    Reshape(ReshapePart),
    /// Placeholder for an unsupported operation.
    EstimateOnly(EstimateOnlyPart),
}

impl Part {
    /// The part's id.
    pub fn id(&self) -> PartId {
        self.common().id
    }

    /// Shared identity block.
    pub fn common(&self) -> &PartCommon {
        match self {
            Self::Input(p) => &p.common,
            Self::Output(p) => &p.common,
            Self::Mce(p) => &p.common,
            Self::FusedPle(p) => &p.common,
            Self::StandalonePle(p) => &p.common,
            Self::Concat(p) => &p.common,
            Self::Reshape(p) => &p.common,
            Self::EstimateOnly(p) => &p.common,
        }
    }

    /// Variant name, used in debug output and config-file matching.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Input(_) => "InputPart",
            Self::Output(_) => "OutputPart",
            Self::Mce(_) => "McePart",
            Self::FusedPle(_) => "FusedPlePart",
            Self::StandalonePle(_) => "StandalonePlePart",
            Self::Concat(_) => "ConcatPart",
            Self::Reshape(_) => "ReshapePart",
            Self::EstimateOnly(_) => "EstimateOnlyPart",
        }
    }

    /// Identifier used by the debug stripe-config file, e.g. `"McePart 3"`.
    pub fn debug_tag(&self) -> String {
        format!("{} {}", self.kind_name(), self.id())
    }

    /// Number of input slots.
    pub fn num_input_slots(&self) -> u32 {
        match self {
            Self::Input(_) => 0,
            Self::Output(_) | Self::Mce(_) | Self::FusedPle(_) | Self::Reshape(_) => 1,
            Self::StandalonePle(p) => p.input_infos.len() as u32,
            Self::Concat(p) => p.input_infos.len() as u32,
            Self::EstimateOnly(p) => p.input_infos.len() as u32,
        }
    }

    /// Number of output slots.
    pub fn num_output_slots(&self) -> u32 {
        match self {
            Self::Output(_) => 0,
            _ => 1,
        }
    }

    /// Operand description of one input slot.
    pub fn input_info(&self, index: u32) -> Option<TensorInfo> {
        match self {
            Self::Input(_) => None,
            Self::Output(p) => (index == 0).then_some(p.tensor_info),
            Self::Mce(p) => (index == 0).then_some(p.params.input_info),
            Self::FusedPle(p) => (index == 0).then_some(p.input_info),
            Self::Reshape(p) => (index == 0).then_some(p.input_info),
            Self::StandalonePle(p) => p.input_infos.get(index as usize).copied(),
            Self::Concat(p) => p.input_infos.get(index as usize).copied(),
            Self::EstimateOnly(p) => p.input_infos.get(index as usize).copied(),
        }
    }

    /// Operand description of the output slot.
    pub fn output_info(&self) -> Option<TensorInfo> {
        match self {
            Self::Output(_) => None,
            Self::Input(p) => Some(p.tensor_info),
            Self::Mce(p) => Some(p.params.output_info),
            Self::FusedPle(p) => Some(p.output_info),
            Self::Reshape(p) => Some(p.output_info),
            Self::StandalonePle(p) => Some(p.output_info),
            Self::Concat(p) => Some(p.output_info),
            Self::EstimateOnly(p) => Some(p.output_info),
        }
    }

    /// Enumerate candidate plans.
    ///
    /// `block_config` and `prev_buffer` constrain Middle/End positions to
    /// what the section so far has fixed; both are ignored by parts that do
    /// not compute on the MCE.
    ///
    /// # Errors
    ///
    /// Propagates encoder failures; an empty vector (not an error) means the
    /// part cannot take this position.
    pub fn get_plans(
        &self,
        cascade: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
        num_weight_stripes: u32,
        ctx: &mut PlanContext<'_>,
    ) -> Result<Vec<Plan>> {
        match self {
            Self::Input(p) => p.get_plans(cascade),
            Self::Output(p) => p.get_plans(cascade),
            Self::Mce(p) => p.get_plans(cascade, block_config, prev_buffer, num_weight_stripes, ctx),
            Self::FusedPle(p) => {
                p.get_plans(cascade, block_config, prev_buffer, num_weight_stripes, ctx)
            }
            Self::StandalonePle(p) => p.get_plans(cascade, prev_buffer, ctx),
            Self::Concat(p) => p.get_plans(cascade, ctx),
            Self::Reshape(p) => p.get_plans(cascade),
            Self::EstimateOnly(p) => p.get_plans(cascade),
        }
    }

    /// Debug label for graph dumps.
    pub fn dot_label(&self) -> String {
        let mut label = self.debug_tag();
        if let Some(info) = self.output_info() {
            label.push_str(&format!("\nOutputTensorShape = {}", info.shape));
        }
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, QuantizationInfo, TensorShape};

    #[test]
    fn test_slot_counts() {
        let info = TensorInfo::new(
            TensorShape::new(1, 16, 16, 16),
            DataType::QAsymmU8,
            QuantizationInfo::new(0, 1.0),
        );
        let part = Part::Input(InputPart {
            common: PartCommon::new(PartId(0), BTreeSet::from([1])),
            tensor_info: info,
        });
        assert_eq!(part.num_input_slots(), 0);
        assert_eq!(part.num_output_slots(), 1);
        assert_eq!(part.output_info(), Some(info));
        assert_eq!(part.debug_tag(), "InputPart 0");
    }
}
