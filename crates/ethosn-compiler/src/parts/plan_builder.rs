//! Shared plan construction for MCE-based parts.
//!
//! Both the convolution parts and the fused-PLE parts build the same plan
//! shape: an SRAM input tile, a streamed weight tile, MCE work into the PLE
//! staging SRAM, and PLE work into an SRAM output tile.

use ethosn_chip::{HardwareCapabilities, PleKernelId, PleOperation};
use ethosn_command_stream::MceOperation;

use crate::geometry::{calculate_tile_size, PackedBoundaryThickness};
use crate::parts::{PartId, PartInputSlot, PartOutputSlot};
use crate::plan::{
    Buffer, BufferFormat, BufferType, DmaOp, Location, MceOp, Op, OpGraph, Plan, PleOp,
};
use crate::stripes::MceAndPleInfo;
use crate::tensor::{total_size_bytes_nhwcb, DataType, TensorInfo, TensorShape};
use crate::weights::EncodedWeights;

/// Everything a single MCE+PLE plan needs besides the stripe candidate.
pub(crate) struct McePlanSpec<'a> {
    pub part_id: PartId,
    pub input_info: TensorInfo,
    pub output_info: TensorInfo,
    pub operation: MceOperation,
    pub stride: (u32, u32),
    pub pad: (u32, u32),
    pub upscale_factor: u32,
    pub relu_bounds: (i16, i16),
    pub ple_op: PleOperation,
    pub input0_rescale: (u16, u8),
    pub weights_shape: TensorShape,
    pub encoded_weights: &'a EncodedWeights,
}

/// Build one plan for a stripe candidate, or `None` when the kernel table or
/// the SRAM budget rules it out. The caller keeps searching.
pub(crate) fn build_mce_ple_plan(
    caps: &HardwareCapabilities,
    info: &MceAndPleInfo,
    num_input_stripes: u32,
    num_output_stripes: u32,
    num_weight_stripes: u32,
    spec: &McePlanSpec<'_>,
) -> Option<Plan> {
    let signed = matches!(
        spec.output_info.data_type,
        DataType::QAsymmS8 | DataType::QSymmS8
    );
    let kernel = PleKernelId::select(spec.ple_op, info.ple.block_config, signed)?;

    let mut graph = OpGraph::new();

    // IFM tile.
    let input_tile = calculate_tile_size(
        caps,
        spec.input_info.shape,
        info.memory.input.shape,
        info.memory.input_boundary,
        num_input_stripes,
        true,
    );
    let mut input_buffer = Buffer::new_sram(spec.input_info.shape, info.memory.input.shape);
    input_buffer.num_stripes = num_input_stripes;
    input_buffer.slot_size_bytes = input_tile.slot_size_bytes;
    input_buffer.size_bytes = input_tile.size_bytes;
    input_buffer.data_type = spec.input_info.data_type;
    input_buffer.quant = spec.input_info.quant;
    input_buffer.forbid_fcaf_wide = input_tile.forbid_fcaf_wide;
    let input_id = graph.add_buffer(input_buffer);

    // Weight stream: DRAM constants plus an SRAM tile.
    let mut weight_dram = Buffer::new_dram(BufferFormat::Weight, spec.weights_shape);
    weight_dram.size_bytes = spec.encoded_weights.data.len() as u32;
    weight_dram.stripe_shape = info.memory.weight.shape;
    weight_dram.buffer_type = Some(BufferType::ConstantDma);
    weight_dram.constant_data = Some(spec.encoded_weights.data.clone());
    weight_dram.data_type = spec.input_info.data_type;
    let weight_dram_id = graph.add_buffer(weight_dram);

    let mut weight_sram = Buffer::new_sram(spec.weights_shape, info.memory.weight.shape);
    weight_sram.format = BufferFormat::Weight;
    weight_sram.num_stripes = num_weight_stripes;
    weight_sram.slot_size_bytes = spec.encoded_weights.max_slot_size;
    weight_sram.size_bytes = spec.encoded_weights.max_slot_size * num_weight_stripes;
    weight_sram.data_type = spec.input_info.data_type;
    let weight_sram_id = graph.add_buffer(weight_sram);

    // The control unit reads per-stripe (offset, size) records from a
    // second constant buffer, attached as port 1 of the weight DMA.
    let mut metadata_bytes = bytes::BytesMut::with_capacity(spec.encoded_weights.metadata.len() * 8);
    for record in &spec.encoded_weights.metadata {
        metadata_bytes.extend_from_slice(&record.offset.to_le_bytes());
        metadata_bytes.extend_from_slice(&record.size.to_le_bytes());
    }
    let mut metadata_dram = Buffer::new_dram(BufferFormat::Weight, spec.weights_shape);
    metadata_dram.size_bytes = metadata_bytes.len() as u32;
    metadata_dram.buffer_type = Some(BufferType::ConstantControl);
    metadata_dram.constant_data = Some(metadata_bytes.freeze());
    let metadata_dram_id = graph.add_buffer(metadata_dram);

    let weight_dma = graph.add_op(Op::Dma(DmaOp {
        format: BufferFormat::Weight,
        dram_offset: 0,
    }));
    graph.add_consumer(weight_dram_id, weight_dma, 0);
    graph.add_consumer(metadata_dram_id, weight_dma, 1);
    graph.set_producer(weight_sram_id, weight_dma);

    // MCE into the PLE staging SRAM.
    let mut ple_input = Buffer::new_sram(spec.output_info.shape, info.memory.ple_input.shape);
    ple_input.location = Location::PleInputSram;
    ple_input.num_stripes = info.memory.ple_input.range.max.max(1);
    ple_input.slot_size_bytes = total_size_bytes_nhwcb(info.memory.ple_input.shape);
    ple_input.size_bytes = ple_input.slot_size_bytes * ple_input.num_stripes;
    ple_input.data_type = spec.output_info.data_type;
    ple_input.quant = spec.output_info.quant;
    let ple_input_id = graph.add_buffer(ple_input);

    let mce = graph.add_op(Op::Mce(MceOp {
        op: spec.operation,
        block_config: info.mce.block_config,
        input_stripe_shape: info.mce.input,
        output_stripe_shape: info.mce.output,
        weight_stripe_shape: info.mce.weight,
        pad: spec.pad,
        stride: spec.stride,
        upscale_factor: spec.upscale_factor,
        relu_bounds: spec.relu_bounds,
    }));
    graph.add_consumer(input_id, mce, 0);
    graph.add_consumer(weight_sram_id, mce, 1);
    graph.set_producer(ple_input_id, mce);

    // PLE into the OFM tile.
    let output_tile = calculate_tile_size(
        caps,
        spec.output_info.shape,
        info.memory.output.shape,
        PackedBoundaryThickness::default(),
        num_output_stripes,
        false,
    );
    let mut output_buffer = Buffer::new_sram(spec.output_info.shape, info.memory.output.shape);
    output_buffer.num_stripes = num_output_stripes;
    output_buffer.slot_size_bytes = output_tile.slot_size_bytes;
    output_buffer.size_bytes = output_tile.size_bytes;
    output_buffer.data_type = spec.output_info.data_type;
    output_buffer.quant = spec.output_info.quant;
    let output_id = graph.add_buffer(output_buffer);

    let ple = graph.add_op(Op::Ple(PleOp {
        op: spec.ple_op,
        kernel,
        block_config: info.ple.block_config,
        input_stripe_shapes: vec![info.ple.input],
        output_stripe_shape: info.ple.output,
        load_kernel: true,
        kernel_offset: None,
        input0_rescale: spec.input0_rescale,
        input1_rescale: (0, 0),
    }));
    graph.add_consumer(ple_input_id, ple, 0);
    graph.set_producer(output_id, ple);

    // The kernel code shares SRAM with the tiles.
    if graph.sram_bytes().saturating_add(kernel.code_size()) > caps.total_sram_bytes {
        return None;
    }

    let mut plan = Plan {
        graph,
        input_mappings: Default::default(),
        output_mappings: Default::default(),
    };
    plan.input_mappings.insert(
        input_id,
        PartInputSlot {
            part: spec.part_id,
            index: 0,
        },
    );
    plan.output_mappings.insert(
        output_id,
        PartOutputSlot {
            part: spec.part_id,
            index: 0,
        },
    );
    Some(plan)
}
