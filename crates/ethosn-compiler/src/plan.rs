//! Plans and their op-graphs.
//!
//! An op-graph is an arena: buffers and ops are stored by index and edges are
//! id pairs, so nodes carry no back-references and graphs can be merged by
//! id remapping. A plan is one candidate implementation of a part, with its
//! boundary buffers mapped to the part's slots.

use std::collections::BTreeMap;

use bytes::Bytes;
use ethosn_chip::{BlockConfig, PleKernelId, PleOperation};
use ethosn_command_stream::MceOperation;

use crate::parts::{PartInputSlot, PartOutputSlot};
use crate::tensor::{DataType, QuantizationInfo, TensorShape};

pub use crate::tensor::BufferFormat;

/// Index of a buffer in its op-graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub usize);

/// Index of an op in its op-graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub usize);

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// External memory.
    Dram,
    /// On-chip SRAM.
    Sram,
    /// The MCE-to-PLE staging SRAM.
    PleInputSram,
    /// DRAM that is treated as SRAM-resident by reinterpretation.
    VirtualSram,
}

/// Role of a DRAM buffer, for the buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Network input.
    Input,
    /// Network output.
    Output,
    /// Scratch between sections.
    Intermediate,
    /// Constant streamed by DMA (weights).
    ConstantDma,
    /// Constant read by the control unit (weight metadata).
    ConstantControl,
}

/// Stripe traversal order. `Xyz` (W fastest, then H, then C) is the only
/// order the hardware uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    /// W fastest, then H, then C.
    Xyz,
}

/// A region of memory used by one plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    /// Where the buffer lives.
    pub location: Location,
    /// Data layout.
    pub format: BufferFormat,
    /// Stripe traversal order.
    pub order: TraversalOrder,
    /// Full tensor extent.
    pub tensor_shape: TensorShape,
    /// Stripe extent.
    pub stripe_shape: TensorShape,
    /// Stripe slots in the tile (SRAM) or stripes in flight (DRAM).
    pub num_stripes: u32,
    /// Bytes per slot.
    pub slot_size_bytes: u32,
    /// Bytes for the whole buffer.
    pub size_bytes: u32,
    /// Element type.
    pub data_type: DataType,
    /// Quantisation.
    pub quant: QuantizationInfo,
    /// SRAM byte offset, assigned late.
    pub offset: Option<u32>,
    /// DRAM buffer id from the buffer manager, assigned late.
    pub dram_buffer_id: Option<u32>,
    /// DRAM role.
    pub buffer_type: Option<BufferType>,
    /// Set when the slot layout rules out FCAF_WIDE sources.
    pub forbid_fcaf_wide: bool,
    /// Constant payload (encoded weights, metadata).
    pub constant_data: Option<Bytes>,
}

impl Buffer {
    /// A blank SRAM buffer in NHWCB layout.
    pub fn new_sram(tensor_shape: TensorShape, stripe_shape: TensorShape) -> Self {
        Self {
            location: Location::Sram,
            format: BufferFormat::Nhwcb,
            order: TraversalOrder::Xyz,
            tensor_shape,
            stripe_shape,
            num_stripes: 1,
            slot_size_bytes: 0,
            size_bytes: 0,
            data_type: DataType::QAsymmU8,
            quant: QuantizationInfo::new(0, 1.0),
            offset: None,
            dram_buffer_id: None,
            buffer_type: None,
            forbid_fcaf_wide: false,
            constant_data: None,
        }
    }

    /// A blank DRAM buffer in the given format.
    pub fn new_dram(format: BufferFormat, tensor_shape: TensorShape) -> Self {
        Self {
            location: Location::Dram,
            format,
            order: TraversalOrder::Xyz,
            tensor_shape,
            stripe_shape: tensor_shape,
            num_stripes: 1,
            slot_size_bytes: 0,
            size_bytes: crate::tensor::size_bytes_in_format(tensor_shape, format),
            data_type: DataType::QAsymmU8,
            quant: QuantizationInfo::new(0, 1.0),
            offset: None,
            dram_buffer_id: None,
            buffer_type: None,
            forbid_fcaf_wide: false,
            constant_data: None,
        }
    }

    /// SRAM bytes this buffer occupies (zero for DRAM buffers).
    pub fn sram_bytes(&self) -> u32 {
        match self.location {
            Location::Sram | Location::PleInputSram => self.size_bytes,
            Location::Dram | Location::VirtualSram => 0,
        }
    }
}

/// MCE work inside a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct MceOp {
    /// Operation mode.
    pub op: MceOperation,
    /// Compute block.
    pub block_config: BlockConfig,
    /// Input stripe shape.
    pub input_stripe_shape: TensorShape,
    /// Output stripe shape.
    pub output_stripe_shape: TensorShape,
    /// Weight stripe shape.
    pub weight_stripe_shape: TensorShape,
    /// Leading padding `(left, top)`.
    pub pad: (u32, u32),
    /// Stride `(x, y)`.
    pub stride: (u32, u32),
    /// Upscale factor (transpose conv, resize).
    pub upscale_factor: u32,
    /// Quantised relu clamp `(lower, upper)`.
    pub relu_bounds: (i16, i16),
}

/// PLE work inside a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PleOp {
    /// Kernel operation.
    pub op: PleOperation,
    /// Selected kernel.
    pub kernel: PleKernelId,
    /// Compute block.
    pub block_config: BlockConfig,
    /// Input stripe shapes, one per input.
    pub input_stripe_shapes: Vec<TensorShape>,
    /// Output stripe shape.
    pub output_stripe_shape: TensorShape,
    /// Whether this op is responsible for loading its kernel code.
    pub load_kernel: bool,
    /// PLE SRAM address of the kernel, assigned late.
    pub kernel_offset: Option<u32>,
    /// Rescale for input 0 `(multiplier, shift)`.
    pub input0_rescale: (u16, u8),
    /// Rescale for input 1 `(multiplier, shift)`.
    pub input1_rescale: (u16, u8),
}

/// DMA transfer inside a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct DmaOp {
    /// Transfer format on the DRAM side.
    pub format: BufferFormat,
    /// Byte offset of the transferred tensor inside the DRAM supertensor.
    /// Non-zero for concatenation, where several DMAs share one supertensor.
    pub dram_offset: u32,
}

/// One node of an op-graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// MCE compute.
    Mce(MceOp),
    /// PLE compute.
    Ple(PleOp),
    /// DMA transfer.
    Dma(DmaOp),
    /// Placeholder for an unsupported operation (estimation mode only).
    EstimateOnly {
        /// Human-readable reason.
        reason: String,
    },
}

/// Arena of buffers and ops with explicit edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpGraph {
    buffers: Vec<Buffer>,
    ops: Vec<Op>,
    /// Producer ops of each buffer, aligned with `buffers`. More than one
    /// only for concatenation supertensors.
    producers: Vec<Vec<OpId>>,
    /// Consumers of each buffer: `(op, input port)`.
    consumers: Vec<Vec<(OpId, u32)>>,
    /// Input buffers of each op, aligned with `ops`.
    op_inputs: Vec<Vec<BufferId>>,
    /// Output buffer of each op.
    op_outputs: Vec<Option<BufferId>>,
}

impl OpGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer, returning its id.
    pub fn add_buffer(&mut self, buffer: Buffer) -> BufferId {
        self.buffers.push(buffer);
        self.producers.push(Vec::new());
        self.consumers.push(Vec::new());
        BufferId(self.buffers.len() - 1)
    }

    /// Add an op, returning its id.
    pub fn add_op(&mut self, op: Op) -> OpId {
        self.ops.push(op);
        self.op_inputs.push(Vec::new());
        self.op_outputs.push(None);
        OpId(self.ops.len() - 1)
    }

    /// Record `op` as a producer of `buffer`.
    pub fn set_producer(&mut self, buffer: BufferId, op: OpId) {
        self.producers[buffer.0].push(op);
        self.op_outputs[op.0] = Some(buffer);
    }

    /// Record `op` reading `buffer` on `port`.
    pub fn add_consumer(&mut self, buffer: BufferId, op: OpId, port: u32) {
        self.consumers[buffer.0].push((op, port));
        let inputs = &mut self.op_inputs[op.0];
        let port = port as usize;
        if inputs.len() <= port {
            inputs.resize(port + 1, buffer);
        }
        inputs[port] = buffer;
    }

    /// The buffer arena.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// A buffer by id.
    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0]
    }

    /// A buffer by id, mutably.
    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.0]
    }

    /// The op arena, in execution order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// An op by id.
    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.0]
    }

    /// An op by id, mutably.
    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.ops[id.0]
    }

    /// All op ids in execution order.
    pub fn op_ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.ops.len()).map(OpId)
    }

    /// All buffer ids.
    pub fn buffer_ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.buffers.len()).map(BufferId)
    }

    /// Last producer of a buffer, if any. For concatenation supertensors
    /// this is the op completing the buffer.
    pub fn producer(&self, buffer: BufferId) -> Option<OpId> {
        self.producers[buffer.0].last().copied()
    }

    /// All producers of a buffer.
    pub fn producers(&self, buffer: BufferId) -> &[OpId] {
        &self.producers[buffer.0]
    }

    /// Consumers of a buffer.
    pub fn consumers(&self, buffer: BufferId) -> &[(OpId, u32)] {
        &self.consumers[buffer.0]
    }

    /// Input buffers of an op, by port.
    pub fn op_inputs(&self, op: OpId) -> &[BufferId] {
        &self.op_inputs[op.0]
    }

    /// Output buffer of an op.
    pub fn op_output(&self, op: OpId) -> Option<BufferId> {
        self.op_outputs[op.0]
    }

    /// Total SRAM footprint of the graph's buffers.
    pub fn sram_bytes(&self) -> u32 {
        self.buffers.iter().map(Buffer::sram_bytes).sum()
    }

    /// Append `other`, returning the id offsets `(buffer_base, op_base)` to
    /// translate the other graph's ids into this one.
    pub fn merge(&mut self, other: &OpGraph) -> (usize, usize) {
        let buffer_base = self.buffers.len();
        let op_base = self.ops.len();

        self.buffers.extend(other.buffers.iter().cloned());
        self.ops.extend(other.ops.iter().cloned());
        self.producers.extend(
            other
                .producers
                .iter()
                .map(|list| list.iter().map(|op| OpId(op.0 + op_base)).collect()),
        );
        self.consumers.extend(other.consumers.iter().map(|list| {
            list.iter()
                .map(|&(op, port)| (OpId(op.0 + op_base), port))
                .collect()
        }));
        self.op_inputs.extend(
            other
                .op_inputs
                .iter()
                .map(|list| list.iter().map(|b| BufferId(b.0 + buffer_base)).collect()),
        );
        self.op_outputs.extend(
            other
                .op_outputs
                .iter()
                .map(|o| o.map(|b| BufferId(b.0 + buffer_base))),
        );

        (buffer_base, op_base)
    }

    /// Redirect every edge of `from` onto `to` and orphan `from`.
    ///
    /// Used when a consumer plan's boundary buffer is unified with the
    /// producer plan's output buffer inside one section.
    pub fn replace_buffer(&mut self, from: BufferId, to: BufferId) {
        let consumers = std::mem::take(&mut self.consumers[from.0]);
        for &(op, port) in &consumers {
            self.op_inputs[op.0][port as usize] = to;
        }
        self.consumers[to.0].extend(consumers);

        let producers = std::mem::take(&mut self.producers[from.0]);
        for &producer in &producers {
            self.op_outputs[producer.0] = Some(to);
        }
        self.producers[to.0].extend(producers);
    }
}

/// One candidate implementation of a part.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// The plan's op-graph.
    pub graph: OpGraph,
    /// Boundary buffers that are the part's input slots.
    pub input_mappings: BTreeMap<BufferId, PartInputSlot>,
    /// Boundary buffers that are the part's output slots.
    pub output_mappings: BTreeMap<BufferId, PartOutputSlot>,
}

impl Plan {
    /// The buffer mapped to `slot`, if this plan has it.
    pub fn input_buffer(&self, slot: PartInputSlot) -> Option<BufferId> {
        self.input_mappings
            .iter()
            .find(|(_, s)| **s == slot)
            .map(|(b, _)| *b)
    }

    /// The buffer mapped to `slot`, if this plan has it.
    pub fn output_buffer(&self, slot: PartOutputSlot) -> Option<BufferId> {
        self.output_mappings
            .iter()
            .find(|(_, s)| **s == slot)
            .map(|(b, _)| *b)
    }

    /// Total SRAM the plan needs.
    pub fn sram_bytes(&self) -> u32 {
        self.graph.sram_bytes()
    }
}

/// DRAM format of a glue buffer and the DMAs around it.
#[derive(Debug, Clone, PartialEq)]
pub struct Glue {
    /// Intermediate DRAM buffer between producer and consumer tiles, absent
    /// when one side is already in DRAM.
    pub dram_buffer: Option<Buffer>,
    /// A DMA writes the producer's SRAM tile out.
    pub store: bool,
    /// A DMA fills the consumer's SRAM tile.
    pub load: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_edges() {
        let mut graph = OpGraph::new();
        let input = graph.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 16, 16, 16),
            TensorShape::new(1, 16, 16, 16),
        ));
        let output = graph.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 16, 16, 16),
            TensorShape::new(1, 16, 16, 16),
        ));
        let dma = graph.add_op(Op::Dma(DmaOp {
            format: BufferFormat::Nhwcb,
            dram_offset: 0,
        }));
        graph.add_consumer(input, dma, 0);
        graph.set_producer(output, dma);

        assert_eq!(graph.producer(output), Some(dma));
        assert_eq!(graph.producer(input), None);
        assert_eq!(graph.consumers(input), &[(dma, 0)]);
        assert_eq!(graph.op_inputs(dma), &[input]);
        assert_eq!(graph.op_output(dma), Some(output));
    }

    #[test]
    fn test_merge_offsets_ids() {
        let mut a = OpGraph::new();
        a.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 8, 8, 16),
            TensorShape::new(1, 8, 8, 16),
        ));

        let mut b = OpGraph::new();
        let b_in = b.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 8, 8, 16),
            TensorShape::new(1, 8, 8, 16),
        ));
        let b_out = b.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 8, 8, 16),
            TensorShape::new(1, 8, 8, 16),
        ));
        let dma = b.add_op(Op::Dma(DmaOp {
            format: BufferFormat::Nhwcb,
            dram_offset: 0,
        }));
        b.add_consumer(b_in, dma, 0);
        b.set_producer(b_out, dma);

        let (buffer_base, op_base) = a.merge(&b);
        assert_eq!(buffer_base, 1);
        assert_eq!(op_base, 0);
        let merged_out = BufferId(b_out.0 + buffer_base);
        assert_eq!(a.producer(merged_out), Some(OpId(op_base)));
    }

    #[test]
    fn test_replace_buffer_rewires_consumers() {
        let mut graph = OpGraph::new();
        let producer_out = graph.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 8, 8, 16),
            TensorShape::new(1, 8, 8, 16),
        ));
        let consumer_in = graph.add_buffer(Buffer::new_sram(
            TensorShape::new(1, 8, 8, 16),
            TensorShape::new(1, 8, 8, 16),
        ));
        let dma = graph.add_op(Op::Dma(DmaOp {
            format: BufferFormat::Nhwcb,
            dram_offset: 0,
        }));
        graph.add_consumer(consumer_in, dma, 0);

        graph.replace_buffer(consumer_in, producer_out);
        assert_eq!(graph.op_inputs(dma), &[producer_out]);
        assert_eq!(graph.consumers(producer_out), &[(dma, 0)]);
        assert!(graph.consumers(consumer_in).is_empty());
    }
}
