//! Lowering a combination to agents and commands.
//!
//! The chosen plans and glues are stitched into one merged op-graph, SRAM
//! and DRAM are assigned, and every op becomes exactly one agent. Commands
//! are then emitted per stripe into the four firmware queues, with
//! `WaitForCounter` entries realising the dependency ratios.

use std::collections::{BTreeMap, HashMap};

use ethosn_chip::version::COMMAND_STREAM_VERSION;
use ethosn_chip::{HardwareCapabilities, PleKernelId};
use ethosn_command_stream::{
    Agent, AgentData, AgentDependencyInfo, BlockSize, Command, CommandStream, CounterName,
    Dependency, FilterShape, FmSData, FmsDataType, IfmDelta, IfmS, MceS, MceWorkSize, OfmS,
    Padding, PleIfmInfo, PleInputMode, PleL, PleS, Ratio, ReluActivation, StrideXy,
    SupertensorSize, TensorSize, Tile, WgtS, WgtWorkSize,
};

use crate::buffer_manager::BufferManager;
use crate::combiner::Combination;
use crate::error::{CompileError, Result};
use crate::parts::{GraphOfParts, PartId};
use crate::plan::{
    Buffer, BufferFormat, BufferType, DmaOp, Location, MceOp, Op, OpGraph, OpId, PleOp,
    BufferId,
};
use crate::tensor::div_round_up;

/// Everything the buffer manager and the driver need from one compilation.
pub struct EmitResult {
    /// The assembled stream.
    pub stream: CommandStream,
    /// DRAM buffers with roles, payloads and lifetimes.
    pub buffers: BufferManager,
}

/// Lower a combination to a command stream.
///
/// # Errors
///
/// Internal errors indicate invariant violations; plan graphs that reached
/// this point are expected to be well formed.
pub fn emit(
    graph: &GraphOfParts,
    combination: &Combination,
    caps: &HardwareCapabilities,
) -> Result<EmitResult> {
    let mut emitter = Emitter::new(graph, combination, caps);
    emitter.build_merged_graph()?;
    emitter.assign_sram()?;
    emitter.assign_dram();
    emitter.build_agents()?;
    emitter.wire_dependencies();
    emitter.publish_lifetimes();
    emitter.emit_commands()?;
    Ok(EmitResult {
        stream: emitter.stream,
        buffers: emitter.buffer_manager,
    })
}

/// Per-agent bookkeeping used by dependency wiring and command emission.
#[derive(Debug, Clone, Copy)]
struct AgentMeta {
    op: OpId,
    /// Value of this agent's counter before its first stripe completes.
    counter_base: u32,
    num_stripes_total: u32,
}

struct Emitter<'a> {
    graph: &'a GraphOfParts,
    combination: &'a Combination,
    caps: &'a HardwareCapabilities,

    merged: OpGraph,
    /// Section index of every op.
    op_sections: Vec<usize>,
    /// Alias resolution after buffer unification.
    resolved: HashMap<BufferId, BufferId>,
    /// Merged buffer id -> DRAM buffer id.
    dram_ids: HashMap<BufferId, u32>,

    stream: CommandStream,
    buffer_manager: BufferManager,
    op_to_agent: HashMap<OpId, u32>,
    ple_kernel_to_loader: HashMap<PleKernelId, u32>,
    agent_meta: Vec<AgentMeta>,
}

impl<'a> Emitter<'a> {
    fn new(
        graph: &'a GraphOfParts,
        combination: &'a Combination,
        caps: &'a HardwareCapabilities,
    ) -> Self {
        Self {
            graph,
            combination,
            caps,
            merged: OpGraph::new(),
            op_sections: Vec::new(),
            resolved: HashMap::new(),
            dram_ids: HashMap::new(),
            stream: CommandStream::new(COMMAND_STREAM_VERSION),
            buffer_manager: BufferManager::new(),
            op_to_agent: HashMap::new(),
            ple_kernel_to_loader: HashMap::new(),
            agent_meta: Vec::new(),
        }
    }

    fn resolve(&self, mut id: BufferId) -> BufferId {
        while let Some(&next) = self.resolved.get(&id) {
            id = next;
        }
        id
    }

    /// Merge every plan, then connect part boundaries: section-internal
    /// edges unify buffers, everything else gets its glue DMAs.
    fn build_merged_graph(&mut self) -> Result<()> {
        let mut bases: BTreeMap<PartId, (usize, usize)> = BTreeMap::new();
        let mut sections: BTreeMap<PartId, usize> = BTreeMap::new();
        let mut section = 0usize;

        for (&part_id, elem) in &self.combination.elems {
            if !elem.continues_section && !bases.is_empty() {
                section += 1;
            } else if bases.is_empty() {
                section = 0;
            }
            let (buffer_base, op_base) = self.merged.merge(&elem.plan.graph);
            bases.insert(part_id, (buffer_base, op_base));
            sections.insert(part_id, section);
            for _ in 0..elem.plan.graph.ops().len() {
                self.op_sections.push(section);
            }
        }

        // Wire boundaries in consumer id order so aliases resolve forward.
        for (input_slot, output_slot) in self.graph.connections() {
            let consumer_elem = self
                .combination
                .elems
                .get(&input_slot.part)
                .ok_or(CompileError::Internal("emit: consumer missing from combination"))?;
            let producer_elem = self
                .combination
                .elems
                .get(&output_slot.part)
                .ok_or(CompileError::Internal("emit: producer missing from combination"))?;

            let consumer_local = consumer_elem
                .plan
                .input_buffer(input_slot)
                .ok_or(CompileError::Internal("emit: consumer plan misses its input"))?;
            let producer_local = producer_elem
                .plan
                .output_buffer(output_slot)
                .ok_or(CompileError::Internal("emit: producer plan misses its output"))?;

            let consumer_buffer = BufferId(
                consumer_local.0 + bases[&input_slot.part].0,
            );
            let producer_buffer = BufferId(
                producer_local.0 + bases[&output_slot.part].0,
            );
            let consumer_buffer = self.resolve(consumer_buffer);
            let producer_buffer = self.resolve(producer_buffer);

            if consumer_elem.continues_section {
                self.merged.replace_buffer(consumer_buffer, producer_buffer);
                self.resolved.insert(consumer_buffer, producer_buffer);
                continue;
            }

            let glue = consumer_elem
                .glues
                .get(&input_slot)
                .ok_or(CompileError::Internal("emit: boundary without a glue"))?;
            let consumer_section = sections[&input_slot.part];
            let producer_section = sections[&output_slot.part];

            match (glue.store, glue.load) {
                (false, false) => {
                    // DRAM alias: one buffer serves both parts. The stronger
                    // role (network input/output) wins.
                    let consumer_type = self.merged.buffer(consumer_buffer).buffer_type;
                    self.merged.replace_buffer(consumer_buffer, producer_buffer);
                    self.resolved.insert(consumer_buffer, producer_buffer);
                    let producer = self.merged.buffer_mut(producer_buffer);
                    if matches!(consumer_type, Some(BufferType::Output)) {
                        producer.buffer_type = Some(BufferType::Output);
                    }
                }
                (true, true) => {
                    let dram = glue
                        .dram_buffer
                        .clone()
                        .ok_or(CompileError::Internal("emit: glue without its buffer"))?;
                    let format = dram.format;
                    let dram_id = self.merged.add_buffer(dram);
                    let store = self.merged.add_op(Op::Dma(DmaOp {
                        format,
                        dram_offset: 0,
                    }));
                    self.op_sections.push(producer_section);
                    self.merged.add_consumer(producer_buffer, store, 0);
                    self.merged.set_producer(dram_id, store);

                    let load = self.merged.add_op(Op::Dma(DmaOp {
                        format,
                        dram_offset: 0,
                    }));
                    self.op_sections.push(consumer_section);
                    self.merged.add_consumer(dram_id, load, 0);
                    self.merged.set_producer(consumer_buffer, load);
                }
                (true, false) => {
                    let format = self.merged.buffer(consumer_buffer).format;
                    let store = self.merged.add_op(Op::Dma(DmaOp {
                        format,
                        dram_offset: 0,
                    }));
                    self.op_sections.push(producer_section);
                    self.merged.add_consumer(producer_buffer, store, 0);
                    self.merged.set_producer(consumer_buffer, store);
                }
                (false, true) => {
                    let format = self.merged.buffer(producer_buffer).format;
                    let load = self.merged.add_op(Op::Dma(DmaOp {
                        format,
                        dram_offset: 0,
                    }));
                    self.op_sections.push(consumer_section);
                    self.merged.add_consumer(producer_buffer, load, 0);
                    self.merged.set_producer(consumer_buffer, load);
                }
            }
        }

        Ok(())
    }

    /// Execution order: producers before consumers, stable by op id.
    fn topological_ops(&self) -> Result<Vec<OpId>> {
        let num_ops = self.merged.ops().len();
        let mut in_degree = vec![0usize; num_ops];
        for op in self.merged.op_ids() {
            for &input in self.merged.op_inputs(op) {
                in_degree[op.0] += self.merged.producers(input).len();
            }
        }

        let mut ready: std::collections::BTreeSet<usize> = (0..num_ops)
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(num_ops);

        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(OpId(next));
            if let Some(output) = self.merged.op_output(OpId(next)) {
                for &(consumer, _) in self.merged.consumers(output) {
                    in_degree[consumer.0] -= 1;
                    if in_degree[consumer.0] == 0 {
                        ready.insert(consumer.0);
                    }
                }
            }
        }

        if order.len() != num_ops {
            return Err(CompileError::Internal("merged op-graph has a cycle"));
        }
        Ok(order)
    }

    /// Assign SRAM tile addresses, per bank, restarting at section borders.
    /// Sections wipe SRAM through DRAM, so overlapping addresses between
    /// sections are legal.
    fn assign_sram(&mut self) -> Result<()> {
        let num_srams = self.caps.num_srams().max(1);
        let per_bank_budget = self.caps.total_sram_bytes / num_srams;

        // Group buffers by section: a buffer belongs to the first op that
        // touches it.
        let mut buffer_sections: HashMap<BufferId, usize> = HashMap::new();
        for op in self.merged.op_ids() {
            let section = self.op_sections[op.0];
            for &input in self.merged.op_inputs(op) {
                buffer_sections.entry(input).or_insert(section);
            }
            if let Some(output) = self.merged.op_output(op) {
                buffer_sections.entry(output).or_insert(section);
            }
        }

        let mut cursors: HashMap<usize, u32> = HashMap::new();
        for buffer_id in self.merged.buffer_ids().collect::<Vec<_>>() {
            let Some(&section) = buffer_sections.get(&buffer_id) else {
                continue;
            };
            let buffer = self.merged.buffer(buffer_id);
            if !matches!(buffer.location, Location::Sram | Location::PleInputSram) {
                continue;
            }
            let per_bank = div_round_up(buffer.size_bytes.max(1), num_srams);
            let cursor = cursors.entry(section).or_insert(0);
            let offset = *cursor;
            if offset + per_bank > per_bank_budget {
                return Err(CompileError::Internal("section exceeds its SRAM budget"));
            }
            self.merged.buffer_mut(buffer_id).offset = Some(offset);
            *cursor = offset + per_bank;
        }

        // PLE kernel code lives after the tiles of its section.
        for op_id in self.merged.op_ids().collect::<Vec<_>>() {
            let section = self.op_sections[op_id.0];
            let code_size = match self.merged.op(op_id) {
                Op::Ple(ple) if ple.load_kernel => ple.kernel.code_size(),
                _ => continue,
            };
            let per_bank = div_round_up(code_size, num_srams);
            let cursor = cursors.entry(section).or_insert(0);
            let offset = *cursor;
            *cursor = offset + per_bank;
            if let Op::Ple(ple) = self.merged.op_mut(op_id) {
                ple.kernel_offset = Some(offset);
            }
        }

        Ok(())
    }

    /// Reserve DRAM ids for every live DRAM buffer.
    fn assign_dram(&mut self) {
        for buffer_id in self.merged.buffer_ids().collect::<Vec<_>>() {
            // Unification leaves the replaced buffers behind as orphans.
            if self.resolved.contains_key(&buffer_id) {
                continue;
            }
            let buffer = self.merged.buffer(buffer_id);
            // Edge-less untyped buffers cannot be reached by any agent.
            if self.merged.producers(buffer_id).is_empty()
                && self.merged.consumers(buffer_id).is_empty()
                && buffer.buffer_type.is_none()
            {
                continue;
            }
            if buffer.location != Location::Dram {
                continue;
            }
            let buffer_type = buffer.buffer_type.unwrap_or(BufferType::Intermediate);
            let id = match (&buffer.constant_data, buffer_type) {
                (Some(data), ty) => self.buffer_manager.add_constant(data.clone(), ty),
                (None, ty) => self.buffer_manager.reserve(buffer.size_bytes, ty),
            };
            self.dram_ids.insert(buffer_id, id);
            self.merged.buffer_mut(buffer_id).dram_buffer_id = Some(id);
        }
    }

    fn tile_for(&self, buffer: &Buffer) -> Tile {
        let num_srams = self.caps.num_srams().max(1);
        Tile {
            base_addr: u16::try_from(buffer.offset.unwrap_or(0)).unwrap_or(u16::MAX),
            num_slots: u16::try_from(buffer.num_stripes).unwrap_or(1),
            slot_size: u16::try_from(div_round_up(buffer.slot_size_bytes.max(1), num_srams))
                .unwrap_or(u16::MAX),
        }
    }

    fn fm_data_for(&self, dram: &Buffer, sram: &Buffer, dram_offset: u32) -> FmSData {
        let stripe = sram.stripe_shape;
        let tensor = sram.tensor_shape;

        let dims = |full: u32, stripe_dim: u32| {
            let stripe_dim = stripe_dim.max(1);
            let count = div_round_up(full, stripe_dim);
            let edge = if full % stripe_dim != 0 {
                full % stripe_dim
            } else {
                stripe_dim
            };
            (stripe_dim, edge, count)
        };
        let (dflt_h, edge_h, num_h) = dims(tensor.height(), stripe.height());
        let (dflt_w, edge_w, num_w) = dims(tensor.width(), stripe.width());
        let (dflt_c, edge_c, num_c) = dims(tensor.channels(), stripe.channels());

        let (data_type, cell_w, cell_c) = match dram.format {
            BufferFormat::Nhwc => (FmsDataType::Nhwc, 1, 1),
            BufferFormat::Nchw => (FmsDataType::Nchw, 1, 1),
            BufferFormat::Nhwcb => (FmsDataType::Nhwcb, 8, 16),
            BufferFormat::FcafDeep => (FmsDataType::FcafDeep, 8, 32),
            BufferFormat::FcafWide => (FmsDataType::FcafWide, 16, 16),
            BufferFormat::Weight => (FmsDataType::Nhwc, 1, 1),
        };

        let to_u16 = |x: u32| u16::try_from(x).unwrap_or(u16::MAX);
        FmSData {
            dram_offset,
            buffer_id: to_u16(dram.dram_buffer_id.unwrap_or(0)),
            data_type,
            tile: self.tile_for(sram),
            dflt_stripe_size: TensorSize {
                height: to_u16(dflt_h),
                width: to_u16(dflt_w),
                channels: to_u16(dflt_c),
            },
            edge_stripe_size: TensorSize {
                height: to_u16(edge_h),
                width: to_u16(edge_w),
                channels: to_u16(edge_c),
            },
            supertensor_size_in_cells: SupertensorSize {
                width: to_u16(div_round_up(dram.tensor_shape.width(), cell_w)),
                channels: to_u16(div_round_up(dram.tensor_shape.channels(), cell_c)),
            },
            num_stripes: TensorSize {
                height: to_u16(num_h),
                width: to_u16(num_w),
                channels: to_u16(num_c),
            },
            stripe_id_strides: TensorSize {
                height: to_u16(num_w * num_c),
                width: to_u16(num_c),
                channels: 1,
            },
        }
    }

    /// IFM reload factor: splitting the output depth of a non-depthwise MCE
    /// rereads the IFM once per output-depth stripe.
    fn ifm_loads(&self, sram_id: BufferId) -> u32 {
        let sram = self.merged.buffer(sram_id);
        for &(consumer, port) in self.merged.consumers(sram_id) {
            if port != 0 {
                continue;
            }
            if let Op::Mce(mce) = self.merged.op(consumer) {
                let split = sram.stripe_shape.height() < sram.tensor_shape.height()
                    || sram.stripe_shape.width() < sram.tensor_shape.width()
                    || sram.stripe_shape.channels() < sram.tensor_shape.channels();
                if split
                    && mce.op != ethosn_command_stream::MceOperation::DepthwiseConvolution
                {
                    if let Some(out) = self.merged.op_output(consumer) {
                        let out_buffer = self.merged.buffer(out);
                        return div_round_up(
                            out_buffer.tensor_shape.channels(),
                            mce.output_stripe_shape.channels().max(1),
                        );
                    }
                }
            }
        }
        1
    }

    #[allow(clippy::too_many_lines)]
    fn build_agents(&mut self) -> Result<()> {
        let order = self.topological_ops()?;

        for op_id in order {
            match self.merged.op(op_id).clone() {
                Op::Dma(dma) => self.build_dma_agent(op_id, &dma)?,
                Op::Mce(mce) => self.build_mce_agent(op_id, &mce)?,
                Op::Ple(ple) => self.build_ple_agent(op_id, &ple)?,
                Op::EstimateOnly { .. } => {
                    return Err(CompileError::Internal(
                        "placeholder op reached the emitter",
                    ))
                }
            }
        }
        Ok(())
    }

    fn push_agent(&mut self, op_id: OpId, data: AgentData, num_stripes_total: u32) -> u32 {
        let agent_id = self.stream.agents.len() as u32;
        self.stream.agents.push(Agent {
            data,
            info: AgentDependencyInfo {
                num_stripes_total: u16::try_from(num_stripes_total).unwrap_or(u16::MAX),
                ..AgentDependencyInfo::default()
            },
        });
        self.agent_meta.push(AgentMeta {
            op: op_id,
            counter_base: 0,
            num_stripes_total,
        });
        self.op_to_agent.insert(op_id, agent_id);
        agent_id
    }

    fn build_dma_agent(&mut self, op_id: OpId, dma: &DmaOp) -> Result<()> {
        let inputs = self.merged.op_inputs(op_id).to_vec();
        let output = self
            .merged
            .op_output(op_id)
            .ok_or(CompileError::Internal("DMA without an output"))?;
        let input = *inputs
            .first()
            .ok_or(CompileError::Internal("DMA without an input"))?;
        let in_buffer = self.merged.buffer(input).clone();
        let out_buffer = self.merged.buffer(output).clone();

        match (in_buffer.location, out_buffer.location) {
            (Location::Dram, Location::Sram) if in_buffer.format == BufferFormat::Weight => {
                // Weight streamer: inputs are (weights, metadata).
                let metadata = inputs.get(1).copied();
                let metadata_id = metadata
                    .and_then(|id| self.merged.buffer(id).dram_buffer_id)
                    .unwrap_or(0);

                // Weight tensors are HWIO (HWIM for depthwise): the work
                // grid is (output channels, input channels).
                let ofm_per_stripe = out_buffer.stripe_shape.0[3].max(1);
                let total_ofm = out_buffer.tensor_shape.0[3].max(1);
                let num_ofm = div_round_up(total_ofm, ofm_per_stripe);
                let edge = if total_ofm % ofm_per_stripe != 0 {
                    total_ofm % ofm_per_stripe
                } else {
                    ofm_per_stripe
                };
                let num_ifm = div_round_up(
                    out_buffer.tensor_shape.0[2].max(1),
                    out_buffer.stripe_shape.0[2].max(1),
                );

                let to_u16 = |x: u32| u16::try_from(x).unwrap_or(u16::MAX);
                let data = AgentData::WgtStreamer(WgtS {
                    buffer_id: to_u16(in_buffer.dram_buffer_id.unwrap_or(0)),
                    metadata_buffer_id: to_u16(metadata_id),
                    tile: self.tile_for(&out_buffer),
                    edge_stripe_ofm_channels: to_u16(edge),
                    num_stripes: WgtWorkSize {
                        ofm_channels: to_u16(num_ofm),
                        ifm_channels: to_u16(num_ifm),
                    },
                    stripe_id_strides: WgtWorkSize {
                        ofm_channels: to_u16(num_ifm),
                        ifm_channels: 1,
                    },
                });
                self.push_agent(op_id, data, num_ofm * num_ifm);
            }
            (Location::Dram, Location::Sram) => {
                let loads = self.ifm_loads(output);
                let fm = self.fm_data_for(&in_buffer, &out_buffer, dma.dram_offset);
                let unique = u32::from(fm.num_stripes.height)
                    * u32::from(fm.num_stripes.width)
                    * u32::from(fm.num_stripes.channels);
                let data = AgentData::IfmStreamer(IfmS { fm_data: fm });
                self.push_agent(op_id, data, unique * loads);
            }
            (Location::Sram, Location::Dram) => {
                let fm = self.fm_data_for(&out_buffer, &in_buffer, dma.dram_offset);
                let unique = u32::from(fm.num_stripes.height)
                    * u32::from(fm.num_stripes.width)
                    * u32::from(fm.num_stripes.channels);
                let data = AgentData::OfmStreamer(OfmS { fm_data: fm });
                self.push_agent(op_id, data, unique);
            }
            _ => return Err(CompileError::Internal("unexpected DMA endpoints")),
        }
        Ok(())
    }

    fn build_mce_agent(&mut self, op_id: OpId, mce: &MceOp) -> Result<()> {
        let inputs = self.merged.op_inputs(op_id).to_vec();
        let output = self
            .merged
            .op_output(op_id)
            .ok_or(CompileError::Internal("MCE without an output"))?;
        let ifm = self.merged.buffer(inputs[0]).clone();
        let wgt = self.merged.buffer(inputs[1]).clone();
        let out = self.merged.buffer(output).clone();

        // The fused PLE runs this kernel; its loader is emitted first so the
        // code is resident before the MCE interface is configured.
        let consumer_ple = self
            .merged
            .consumers(output)
            .first()
            .map(|&(op, _)| op)
            .ok_or(CompileError::Internal("MCE output has no consumer"))?;
        let (kernel, kernel_offset) = match self.merged.op(consumer_ple) {
            Op::Ple(ple) => (ple.kernel, ple.kernel_offset.unwrap_or(0)),
            _ => return Err(CompileError::Internal("MCE output consumer is not a PLE")),
        };

        if !self.ple_kernel_to_loader.contains_key(&kernel) {
            let id = self.push_agent(
                op_id,
                AgentData::PleLoader(PleL {
                    ple_kernel_id: kernel,
                    sram_addr: u16::try_from(kernel_offset).unwrap_or(u16::MAX),
                }),
                1,
            );
            self.ple_kernel_to_loader.insert(kernel, id);
            // The loader borrows the MCE's op id; the map must point at the
            // compute agent pushed below.
            self.op_to_agent.remove(&op_id);
        }

        let to_u16 = |x: u32| u16::try_from(x).unwrap_or(u16::MAX);
        let dims = |full: u32, stripe_dim: u32| {
            let stripe_dim = stripe_dim.max(1);
            let count = div_round_up(full, stripe_dim);
            let edge = if full % stripe_dim != 0 {
                full % stripe_dim
            } else {
                stripe_dim
            };
            (stripe_dim, edge, count)
        };

        let (dflt_oh, edge_oh, num_oh) =
            dims(out.tensor_shape.height(), mce.output_stripe_shape.height());
        let (dflt_ow, edge_ow, num_ow) =
            dims(out.tensor_shape.width(), mce.output_stripe_shape.width());
        let (dflt_oc, edge_oc, num_oc) = dims(
            out.tensor_shape.channels(),
            mce.output_stripe_shape.channels(),
        );
        let (dflt_ic, edge_ic, num_ic) =
            dims(ifm.tensor_shape.channels(), mce.input_stripe_shape.channels());

        let delta_w =
            i8::try_from(i64::from(ifm.tensor_shape.width()) - i64::from(out.tensor_shape.width()))
                .unwrap_or(0);
        let delta_h = i8::try_from(
            i64::from(ifm.tensor_shape.height()) - i64::from(out.tensor_shape.height()),
        )
        .unwrap_or(0);

        let data = AgentData::MceScheduler(MceS {
            ifm_tile: self.tile_for(&ifm),
            wgt_tile: self.tile_for(&wgt),
            block_size: BlockSize {
                width: u8::try_from(mce.block_config.width).unwrap_or(16),
                height: u8::try_from(mce.block_config.height).unwrap_or(16),
            },
            dflt_stripe_size: MceWorkSize {
                ofm_height: to_u16(dflt_oh),
                ofm_width: to_u16(dflt_ow),
                ofm_channels: to_u16(dflt_oc),
                ifm_channels: to_u16(dflt_ic),
            },
            edge_stripe_size: MceWorkSize {
                ofm_height: to_u16(edge_oh),
                ofm_width: to_u16(edge_ow),
                ofm_channels: to_u16(edge_oc),
                ifm_channels: to_u16(edge_ic),
            },
            num_stripes: MceWorkSize {
                ofm_height: to_u16(num_oh),
                ofm_width: to_u16(num_ow),
                ofm_channels: to_u16(num_oc),
                ifm_channels: to_u16(num_ic),
            },
            stripe_id_strides: MceWorkSize {
                ofm_height: to_u16(num_ic * num_ow),
                ofm_width: to_u16(num_ic),
                ofm_channels: to_u16(num_ic * num_ow * num_oh),
                ifm_channels: 1,
            },
            conv_stride_xy: StrideXy {
                x: u8::try_from(mce.stride.0).unwrap_or(1),
                y: u8::try_from(mce.stride.1).unwrap_or(1),
            },
            ifm_zero_point: i16::try_from(ifm.quant.zero_point).unwrap_or(0),
            mce_op_mode: mce.op,
            filter_shape: FilterShape {
                width: u8::try_from(mce.weight_stripe_shape.0[1]).unwrap_or(1),
                height: u8::try_from(mce.weight_stripe_shape.0[0]).unwrap_or(1),
            },
            padding: Padding {
                left: u8::try_from(mce.pad.0).unwrap_or(0),
                top: u8::try_from(mce.pad.1).unwrap_or(0),
            },
            ifm_delta_default: IfmDelta {
                width: delta_w,
                height: delta_h,
            },
            ifm_delta_edge: IfmDelta {
                width: delta_w,
                height: delta_h,
            },
            relu_activ: ReluActivation {
                min: mce.relu_bounds.0,
                max: mce.relu_bounds.1,
            },
            ple_kernel_id: kernel,
        });
        self.push_agent(op_id, data, num_oh * num_ow * num_oc * num_ic);
        Ok(())
    }

    fn build_ple_agent(&mut self, op_id: OpId, ple: &PleOp) -> Result<()> {
        let inputs = self.merged.op_inputs(op_id).to_vec();
        let output = self
            .merged
            .op_output(op_id)
            .ok_or(CompileError::Internal("PLE without an output"))?;
        let out = self.merged.buffer(output).clone();
        let first_input = self.merged.buffer(inputs[0]).clone();

        // Standalone kernels read from SRAM and load their own code.
        let sram_fed = first_input.location == Location::Sram;
        if sram_fed && ple.load_kernel && !self.ple_kernel_to_loader.contains_key(&ple.kernel) {
            let id = self.push_agent(
                op_id,
                AgentData::PleLoader(PleL {
                    ple_kernel_id: ple.kernel,
                    sram_addr: u16::try_from(ple.kernel_offset.unwrap_or(0)).unwrap_or(u16::MAX),
                }),
                1,
            );
            self.op_to_agent.remove(&op_id);
            self.ple_kernel_to_loader.insert(ple.kernel, id);
        }

        let input_mode = if sram_fed {
            PleInputMode::Sram
        } else {
            // Producer MCE mode decides the interface.
            match self
                .merged
                .producer(inputs[0])
                .map(|producer| self.merged.op(producer))
            {
                Some(Op::Mce(mce)) => match mce.op {
                    ethosn_command_stream::MceOperation::DepthwiseConvolution => {
                        PleInputMode::MceOneOg
                    }
                    _ => PleInputMode::MceAllOgs,
                },
                _ => PleInputMode::MceAllOgs,
            }
        };

        let to_u16 = |x: u32| u16::try_from(x).unwrap_or(u16::MAX);
        let dims = |full: u32, stripe_dim: u32| {
            let stripe_dim = stripe_dim.max(1);
            let count = div_round_up(full, stripe_dim);
            let edge = if full % stripe_dim != 0 {
                full % stripe_dim
            } else {
                stripe_dim
            };
            (stripe_dim, edge, count)
        };
        let stripe = out.stripe_shape;
        let (dflt_h, edge_h, num_h) = dims(out.tensor_shape.height(), stripe.height());
        let (dflt_w, edge_w, num_w) = dims(out.tensor_shape.width(), stripe.width());
        let (dflt_c, edge_c, num_c) = dims(out.tensor_shape.channels(), stripe.channels());

        let ifm_info = |index: usize, rescale: (u16, u8)| {
            let zero_point = inputs
                .get(index)
                .map(|&id| self.merged.buffer(id).quant.zero_point)
                .unwrap_or(0);
            PleIfmInfo {
                zero_point: i16::try_from(zero_point).unwrap_or(0),
                multiplier: rescale.0,
                shift: u16::from(rescale.1),
            }
        };
        let tile_or_default = |index: usize| {
            inputs
                .get(index)
                .map(|&id| self.tile_for(self.merged.buffer(id)))
                .unwrap_or_default()
        };

        let data = AgentData::PleScheduler(PleS {
            ofm_tile: self.tile_for(&out),
            ofm_zero_point: i16::try_from(out.quant.zero_point).unwrap_or(0),
            dflt_stripe_size: TensorSize {
                height: to_u16(dflt_h),
                width: to_u16(dflt_w),
                channels: to_u16(dflt_c),
            },
            edge_stripe_size: TensorSize {
                height: to_u16(edge_h),
                width: to_u16(edge_w),
                channels: to_u16(edge_c),
            },
            num_stripes: TensorSize {
                height: to_u16(num_h),
                width: to_u16(num_w),
                channels: to_u16(num_c),
            },
            stripe_id_strides: TensorSize {
                height: to_u16(num_w),
                width: 1,
                channels: to_u16(num_w * num_h),
            },
            input_mode,
            ple_kernel_id: ple.kernel,
            ple_kernel_sram_addr: u16::try_from(ple.kernel_offset.unwrap_or(0))
                .unwrap_or(u16::MAX),
            ifm_tile0: if sram_fed {
                tile_or_default(0)
            } else {
                Tile::default()
            },
            ifm_info0: ifm_info(0, ple.input0_rescale),
            ifm_tile1: if sram_fed {
                tile_or_default(1)
            } else {
                Tile::default()
            },
            ifm_info1: ifm_info(1, ple.input1_rescale),
        });
        self.push_agent(op_id, data, num_h * num_w * num_c);
        Ok(())
    }

    /// Dependency ratios between every producer/consumer agent pair.
    fn wire_dependencies(&mut self) {
        let agent_count = self.stream.agents.len();
        for consumer_index in 0..agent_count {
            let consumer_op = self.agent_meta[consumer_index].op;
            if self.op_to_agent.get(&consumer_op) != Some(&(consumer_index as u32)) {
                // Loader agents share their op with the compute agent.
                continue;
            }

            let input_buffers = self.merged.op_inputs(consumer_op).to_vec();
            for &input in &input_buffers {
                let producers = self.merged.producers(input).to_vec();
                for producer_op in producers {
                    let Some(&producer_index) = self.op_to_agent.get(&producer_op) else {
                        continue;
                    };
                    self.add_dependency_pair(producer_index as usize, consumer_index);
                }
            }

            // An MCE schedules against the loader of its fused kernel.
            if let AgentData::MceScheduler(mce) = self.stream.agents[consumer_index].data {
                if let Some(&loader) = self.ple_kernel_to_loader.get(&mce.ple_kernel_id) {
                    let loader = loader as usize;
                    if loader < consumer_index {
                        let rel = (consumer_index - loader) as u8;
                        let work = u32::from(mce.num_stripes.ofm_height)
                            * u32::from(mce.num_stripes.ofm_width);
                        let dep = Dependency {
                            relative_agent_id: rel,
                            outer_ratio: Ratio {
                                other: u8::try_from(work).unwrap_or(u8::MAX),
                                this: 1,
                            },
                            inner_ratio: Ratio {
                                other: u8::try_from(work).unwrap_or(u8::MAX),
                                this: 1,
                            },
                            boundary: 0,
                        };
                        let loader_info = &mut self.stream.agents[loader].info;
                        if loader_info.schedule_dependencies[0].is_unused() {
                            loader_info.schedule_dependencies[0] = dep;
                        }
                    }
                }
            }
        }
    }

    /// Number of stripes and default spatial stripe extents of an agent, for
    /// ratio computation.
    fn stripe_grid(data: &AgentData) -> (u32, u32, u32) {
        match data {
            AgentData::IfmStreamer(ifm) => (
                u32::from(ifm.fm_data.num_stripes.height)
                    * u32::from(ifm.fm_data.num_stripes.width)
                    * u32::from(ifm.fm_data.num_stripes.channels),
                u32::from(ifm.fm_data.dflt_stripe_size.height),
                u32::from(ifm.fm_data.dflt_stripe_size.width),
            ),
            AgentData::OfmStreamer(ofm) => (
                u32::from(ofm.fm_data.num_stripes.height)
                    * u32::from(ofm.fm_data.num_stripes.width)
                    * u32::from(ofm.fm_data.num_stripes.channels),
                u32::from(ofm.fm_data.dflt_stripe_size.height),
                u32::from(ofm.fm_data.dflt_stripe_size.width),
            ),
            AgentData::WgtStreamer(wgt) => (
                u32::from(wgt.num_stripes.ofm_channels) * u32::from(wgt.num_stripes.ifm_channels),
                1,
                1,
            ),
            AgentData::MceScheduler(mce) => (
                u32::from(mce.num_stripes.ofm_height)
                    * u32::from(mce.num_stripes.ofm_width)
                    * u32::from(mce.num_stripes.ifm_channels),
                u32::from(mce.dflt_stripe_size.ofm_height),
                u32::from(mce.dflt_stripe_size.ofm_width),
            ),
            AgentData::PleLoader(_) => (1, 1, 1),
            AgentData::PleScheduler(ple) => (
                u32::from(ple.num_stripes.height)
                    * u32::from(ple.num_stripes.width)
                    * u32::from(ple.num_stripes.channels),
                u32::from(ple.dflt_stripe_size.height),
                u32::from(ple.dflt_stripe_size.width),
            ),
        }
    }

    fn add_dependency_pair(&mut self, producer: usize, consumer: usize) {
        let rel = u8::try_from(consumer - producer).unwrap_or(u8::MAX);
        let producer_data = self.stream.agents[producer].data;
        let consumer_data = self.stream.agents[consumer].data;

        let to_u8 = |x: u32| u8::try_from(x.max(1)).unwrap_or(u8::MAX);

        // Specialised coupling for the MCE reading its IFM: the spatial
        // stripe ratio and the halo both matter.
        let (outer_other, outer_self, inner_other, inner_self, boundary) =
            match (&consumer_data, &producer_data) {
                (AgentData::MceScheduler(mce), AgentData::IfmStreamer(ifm)) => {
                    let w_ratio = (u32::from(mce.dflt_stripe_size.ofm_width)
                        / u32::from(ifm.fm_data.dflt_stripe_size.width).max(1))
                    .max(1);
                    let h_ratio = (u32::from(mce.dflt_stripe_size.ofm_height)
                        / u32::from(ifm.fm_data.dflt_stripe_size.height).max(1))
                    .max(1);
                    let (ifm_total, _, _) = Self::stripe_grid(&producer_data);
                    let (mce_total, _, _) = Self::stripe_grid(&consumer_data);
                    let boundary = i8::from(
                        (ifm.fm_data.num_stripes.height > 1 && mce.filter_shape.height > 1)
                            || (ifm.fm_data.num_stripes.width > 1 && mce.filter_shape.width > 1),
                    );
                    (ifm_total, mce_total, w_ratio * h_ratio, 1, boundary)
                }
                (AgentData::MceScheduler(mce), AgentData::WgtStreamer(_)) => {
                    if mce.num_stripes.ifm_channels > 1 {
                        (1, 1, 1, 1, 0)
                    } else {
                        let work = u32::from(mce.num_stripes.ofm_height)
                            * u32::from(mce.num_stripes.ofm_width);
                        (1, work, 1, work, 0)
                    }
                }
                _ => {
                    let (producer_total, _, _) = Self::stripe_grid(&producer_data);
                    let (consumer_total, _, _) = Self::stripe_grid(&consumer_data);
                    let inner_other = (producer_total / consumer_total.max(1)).max(1);
                    let inner_self = (consumer_total / producer_total.max(1)).max(1);
                    (producer_total, consumer_total, inner_other, inner_self, 0)
                }
            };

        let read_dep = Dependency {
            relative_agent_id: rel,
            outer_ratio: Ratio {
                other: to_u8(outer_other),
                this: to_u8(outer_self),
            },
            inner_ratio: Ratio {
                other: to_u8(inner_other),
                this: to_u8(inner_self),
            },
            boundary,
        };

        // Slot 1 is reserved for the weight streamer on MCE agents; a
        // two-input PLE scheduler uses it for its second operand.
        let slot = if matches!(producer_data, AgentData::WgtStreamer(_)) {
            1
        } else if matches!(consumer_data, AgentData::PleScheduler(_))
            && !self.stream.agents[consumer].info.read_dependencies[0].is_unused()
        {
            1
        } else {
            0
        };
        self.stream.agents[consumer].info.read_dependencies[slot] = read_dep;

        // Producer-side forms are the mirror image.
        let write_dep = Dependency {
            relative_agent_id: rel,
            outer_ratio: Ratio {
                other: to_u8(outer_self),
                this: to_u8(outer_other),
            },
            inner_ratio: Ratio {
                other: to_u8(inner_self),
                this: to_u8(inner_other),
            },
            boundary,
        };
        self.stream.agents[producer].info.write_dependencies[0] = write_dep;

        // Only the first consumer sets the schedule dependency.
        let schedule = &mut self.stream.agents[producer].info.schedule_dependencies[0];
        if schedule.is_unused() {
            *schedule = write_dep;
        }
    }

    /// Publish `[producer, max(consumer) + 1)` for every intermediate DRAM
    /// buffer so the allocator can overlap disjoint lifetimes.
    fn publish_lifetimes(&mut self) {
        for (buffer_id, &dram_id) in &self.dram_ids {
            let buffer = self.merged.buffer(*buffer_id);
            if buffer.buffer_type != Some(BufferType::Intermediate) {
                continue;
            }
            let producers = self.merged.producers(*buffer_id);
            let start = producers
                .iter()
                .filter_map(|op| self.op_to_agent.get(op))
                .min()
                .copied();
            let end = self
                .merged
                .consumers(*buffer_id)
                .iter()
                .filter_map(|(op, _)| self.op_to_agent.get(op))
                .max()
                .copied();
            if let (Some(start), Some(end)) = (start, end) {
                self.buffer_manager.mark_buffer_used(dram_id, start, end + 1);
            }
        }
    }

    /// Counter a completed stripe of this agent increments.
    fn counter_of(data: &AgentData) -> Option<CounterName> {
        match data {
            AgentData::IfmStreamer(_) | AgentData::WgtStreamer(_) => Some(CounterName::DmaRd),
            AgentData::OfmStreamer(_) => Some(CounterName::DmaWr),
            AgentData::MceScheduler(_) => Some(CounterName::MceStripe),
            AgentData::PleScheduler(_) => Some(CounterName::PleStripe),
            AgentData::PleLoader(_) => None,
        }
    }

    /// Producer progress needed before consumer stripe `stripe_id` can run.
    fn stripes_needed(dep: &Dependency, stripe_id: u32, producer_total: u32) -> u32 {
        let inner_other = u32::from(dep.inner_ratio.other).max(1);
        let inner_self = u32::from(dep.inner_ratio.this).max(1);
        let needed = div_round_up((stripe_id + 1) * inner_other, inner_self);
        let needed = needed + u32::from(dep.boundary.max(0) as u8);
        needed.min(producer_total)
    }

    #[allow(clippy::too_many_lines)]
    fn emit_commands(&mut self) -> Result<()> {
        use ethosn_command_stream::QueueKind;

        let mut counters: HashMap<CounterName, u32> = HashMap::new();
        let agent_count = self.stream.agents.len();

        // First pass records every agent's counter base.
        for index in 0..agent_count {
            let data = self.stream.agents[index].data;
            if let Some(counter) = Self::counter_of(&data) {
                let entry = counters.entry(counter).or_insert(0);
                self.agent_meta[index].counter_base = *entry;
                *entry += self.agent_meta[index].num_stripes_total;
            }
        }

        let wait_target = |base: u32, needed: u32| -> u16 {
            // Counters wrap at u16; the firmware compares modularly.
            ((base + needed) & 0xFFFF) as u16
        };

        for index in 0..agent_count {
            let agent = self.stream.agents[index];
            let agent_id = index as u32;
            let meta = self.agent_meta[index];

            // Resolve read-dependency producers for wait emission.
            let read_waits: Vec<(CounterName, u32, Dependency)> = agent
                .info
                .read_dependencies
                .iter()
                .filter(|dep| !dep.is_unused())
                .filter_map(|dep| {
                    let producer = index.checked_sub(usize::from(dep.relative_agent_id))?;
                    let producer_data = self.stream.agents[producer].data;
                    let counter = Self::counter_of(&producer_data)?;
                    let producer_meta = self.agent_meta[producer];
                    Some((counter, producer_meta.counter_base, *dep))
                })
                .map(|(counter, base, dep)| (counter, base, dep))
                .collect();
            let read_totals: Vec<u32> = agent
                .info
                .read_dependencies
                .iter()
                .filter(|dep| !dep.is_unused())
                .filter_map(|dep| {
                    let producer = index.checked_sub(usize::from(dep.relative_agent_id))?;
                    Some(self.agent_meta[producer].num_stripes_total)
                })
                .collect();

            // Write dependency: pause before overwriting a slot a reader has
            // not consumed yet.
            let write_wait: Option<(CounterName, u32, Dependency, u32)> = {
                let dep = agent.info.write_dependencies[0];
                if dep.is_unused() {
                    None
                } else {
                    let consumer = index + usize::from(dep.relative_agent_id);
                    if consumer < agent_count {
                        let consumer_data = self.stream.agents[consumer].data;
                        Self::counter_of(&consumer_data).map(|counter| {
                            (
                                counter,
                                self.agent_meta[consumer].counter_base,
                                dep,
                                self.agent_meta[consumer].num_stripes_total,
                            )
                        })
                    } else {
                        None
                    }
                }
            };

            let num_slots = match agent.data {
                AgentData::IfmStreamer(ifm) => u32::from(ifm.fm_data.tile.num_slots),
                AgentData::WgtStreamer(wgt) => u32::from(wgt.tile.num_slots),
                _ => 0,
            };

            match agent.data {
                AgentData::IfmStreamer(_) | AgentData::WgtStreamer(_) => {
                    let queue = QueueKind::DmaRd;
                    for stripe in 0..meta.num_stripes_total {
                        for (i, (counter, base, dep)) in read_waits.iter().enumerate() {
                            let needed = Self::stripes_needed(dep, stripe, read_totals[i]);
                            self.stream.queue_mut(queue).push(Command::WaitForCounter {
                                counter: *counter,
                                target: wait_target(*base, needed),
                            });
                        }
                        if let Some((counter, base, dep, total)) = write_wait {
                            if num_slots > 0 && stripe >= num_slots {
                                let needed =
                                    Self::stripes_needed(&dep, stripe - num_slots, total);
                                self.stream.queue_mut(queue).push(Command::WaitForCounter {
                                    counter,
                                    target: wait_target(base, needed),
                                });
                            }
                        }
                        let command = if matches!(agent.data, AgentData::IfmStreamer(_)) {
                            Command::LoadIfmStripe {
                                agent_id,
                                stripe_id: stripe,
                            }
                        } else {
                            Command::LoadWgtStripe {
                                agent_id,
                                stripe_id: stripe,
                            }
                        };
                        self.stream.queue_mut(queue).push(command);
                    }
                }
                AgentData::OfmStreamer(_) => {
                    let queue = QueueKind::DmaWr;
                    for stripe in 0..meta.num_stripes_total {
                        for (i, (counter, base, dep)) in read_waits.iter().enumerate() {
                            let needed = Self::stripes_needed(dep, stripe, read_totals[i]);
                            self.stream.queue_mut(queue).push(Command::WaitForCounter {
                                counter: *counter,
                                target: wait_target(*base, needed),
                            });
                        }
                        self.stream.queue_mut(queue).push(Command::StoreOfmStripe {
                            agent_id,
                            stripe_id: stripe,
                        });
                    }
                }
                AgentData::MceScheduler(_) => {
                    let queue = QueueKind::Mce;
                    for stripe in 0..meta.num_stripes_total {
                        for (i, (counter, base, dep)) in read_waits.iter().enumerate() {
                            let needed = Self::stripes_needed(dep, stripe, read_totals[i]);
                            self.stream.queue_mut(queue).push(Command::WaitForCounter {
                                counter: *counter,
                                target: wait_target(*base, needed),
                            });
                        }
                        self.stream.queue_mut(queue).push(Command::ProgramMceStripe {
                            agent_id,
                            stripe_id: stripe,
                        });
                        if stripe == 0 {
                            // New section or new PLE kernel: reconfigure the
                            // MCE-PLE interface before the first stripe.
                            self.stream
                                .queue_mut(queue)
                                .push(Command::ConfigMceif { agent_id });
                        }
                        self.stream.queue_mut(queue).push(Command::StartMceStripe {
                            agent_id,
                            stripe_id: stripe,
                        });
                    }
                }
                AgentData::PleLoader(_) => {
                    self.stream
                        .queue_mut(QueueKind::Ple)
                        .push(Command::LoadPleCodeIntoPleSram { agent_id });
                }
                AgentData::PleScheduler(_) => {
                    let queue = QueueKind::Ple;
                    for stripe in 0..meta.num_stripes_total {
                        for (i, (counter, base, dep)) in read_waits.iter().enumerate() {
                            let needed = Self::stripes_needed(dep, stripe, read_totals[i]);
                            self.stream.queue_mut(queue).push(Command::WaitForCounter {
                                counter: *counter,
                                target: wait_target(*base, needed),
                            });
                        }
                        self.stream.queue_mut(queue).push(Command::StartPleStripe {
                            agent_id,
                            stripe_id: stripe,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripes_needed_respects_boundary() {
        let dep = Dependency {
            relative_agent_id: 1,
            outer_ratio: Ratio { other: 4, this: 4 },
            inner_ratio: Ratio { other: 1, this: 1 },
            boundary: 1,
        };
        // With a halo, stripe 0 needs its own stripe plus one neighbour.
        assert_eq!(Emitter::stripes_needed(&dep, 0, 4), 2);
        // Clamped at the producer's total.
        assert_eq!(Emitter::stripes_needed(&dep, 3, 4), 4);
    }

    #[test]
    fn test_stripes_needed_ratio() {
        let dep = Dependency {
            relative_agent_id: 1,
            outer_ratio: Ratio { other: 8, this: 4 },
            inner_ratio: Ratio { other: 2, this: 1 },
            boundary: 0,
        };
        // Two producer stripes per consumer stripe.
        assert_eq!(Emitter::stripes_needed(&dep, 0, 8), 2);
        assert_eq!(Emitter::stripes_needed(&dep, 3, 8), 8);
    }
}
