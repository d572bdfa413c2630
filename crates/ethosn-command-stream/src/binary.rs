//! Binary serialisation of command streams.
//!
//! Little-endian throughout. Agents and commands are fixed-size records so
//! the firmware can index them randomly; offsets in the cascade section
//! header are byte-relative to the start of the section payload.

use bytes::{BufMut, BytesMut};
use ethosn_chip::version::COMMAND_STREAM_VERSION;
use ethosn_chip::{PleKernelId, Version, VersionRange};

use crate::agents::{
    Agent, AgentData, AgentDependencyInfo, BlockSize, Dependency, FilterShape, FmSData,
    FmsDataType, IfmDelta, IfmS, MceOperation, MceS, MceWorkSize, OfmS, Padding, PleIfmInfo,
    PleInputMode, PleL, PleS, Ratio, ReluActivation, StrideXy, SupertensorSize, TensorSize, Tile,
    WgtS, WgtWorkSize,
};
use crate::commands::{Command, CommandStream, CounterName};
use crate::error::{CommandStreamError, Result};

/// Stream magic.
pub const MAGIC: [u8; 4] = *b"ENCS";

/// Section kind of the cascade payload.
pub const SECTION_CASCADE: u32 = 1;

/// Fixed size of one serialised agent record.
pub const AGENT_RECORD_BYTES: usize = 104;

/// Fixed size of one serialised command record.
pub const COMMAND_RECORD_BYTES: usize = 16;

const AGENT_PAYLOAD_BYTES: usize = 72;
const CASCADE_HEADER_WORDS: usize = 11;

/// Serialise a stream to its binary form.
pub fn write_stream(stream: &CommandStream) -> Vec<u8> {
    let mut out = BytesMut::new();

    out.put_slice(&MAGIC);
    out.put_u32_le(stream.version.major);
    out.put_u32_le(stream.version.minor);
    out.put_u32_le(stream.version.patch);

    let payload = write_cascade_payload(stream);
    out.put_u32_le(SECTION_CASCADE);
    out.put_u32_le(u32::try_from(payload.len()).unwrap_or(u32::MAX));
    out.put_slice(&payload);

    out.to_vec()
}

fn write_cascade_payload(stream: &CommandStream) -> Vec<u8> {
    let agents_offset = CASCADE_HEADER_WORDS * 4;
    let dma_rd_offset = agents_offset + stream.agents.len() * AGENT_RECORD_BYTES;
    let dma_wr_offset = dma_rd_offset + stream.dma_rd_commands.len() * COMMAND_RECORD_BYTES;
    let mce_offset = dma_wr_offset + stream.dma_wr_commands.len() * COMMAND_RECORD_BYTES;
    let ple_offset = mce_offset + stream.mce_commands.len() * COMMAND_RECORD_BYTES;
    let total_size = ple_offset + stream.ple_commands.len() * COMMAND_RECORD_BYTES;

    let mut out = BytesMut::with_capacity(total_size);
    let as_u32 = |x: usize| u32::try_from(x).unwrap_or(u32::MAX);

    out.put_u32_le(as_u32(total_size));
    out.put_u32_le(as_u32(agents_offset));
    out.put_u32_le(as_u32(stream.agents.len()));
    out.put_u32_le(as_u32(dma_rd_offset));
    out.put_u32_le(as_u32(stream.dma_rd_commands.len()));
    out.put_u32_le(as_u32(dma_wr_offset));
    out.put_u32_le(as_u32(stream.dma_wr_commands.len()));
    out.put_u32_le(as_u32(mce_offset));
    out.put_u32_le(as_u32(stream.mce_commands.len()));
    out.put_u32_le(as_u32(ple_offset));
    out.put_u32_le(as_u32(stream.ple_commands.len()));

    for agent in &stream.agents {
        write_agent(&mut out, agent);
    }
    for queue in [
        &stream.dma_rd_commands,
        &stream.dma_wr_commands,
        &stream.mce_commands,
        &stream.ple_commands,
    ] {
        for cmd in queue {
            write_command(&mut out, cmd);
        }
    }

    out.to_vec()
}

fn write_agent(out: &mut BytesMut, agent: &Agent) {
    out.put_u32_le(agent.data.kind_code());

    let mut payload = BytesMut::with_capacity(AGENT_PAYLOAD_BYTES);
    match &agent.data {
        AgentData::IfmStreamer(ifm) => put_fm_data(&mut payload, &ifm.fm_data),
        AgentData::OfmStreamer(ofm) => put_fm_data(&mut payload, &ofm.fm_data),
        AgentData::WgtStreamer(wgt) => {
            payload.put_u16_le(wgt.buffer_id);
            payload.put_u16_le(wgt.metadata_buffer_id);
            put_tile(&mut payload, &wgt.tile);
            payload.put_u16_le(wgt.edge_stripe_ofm_channels);
            put_wgt_work(&mut payload, &wgt.num_stripes);
            put_wgt_work(&mut payload, &wgt.stripe_id_strides);
        }
        AgentData::MceScheduler(mce) => {
            put_tile(&mut payload, &mce.ifm_tile);
            put_tile(&mut payload, &mce.wgt_tile);
            payload.put_u8(mce.block_size.width);
            payload.put_u8(mce.block_size.height);
            put_mce_work(&mut payload, &mce.dflt_stripe_size);
            put_mce_work(&mut payload, &mce.edge_stripe_size);
            put_mce_work(&mut payload, &mce.num_stripes);
            put_mce_work(&mut payload, &mce.stripe_id_strides);
            payload.put_u8(mce.conv_stride_xy.x);
            payload.put_u8(mce.conv_stride_xy.y);
            payload.put_i16_le(mce.ifm_zero_point);
            payload.put_u8(mce.mce_op_mode.code());
            payload.put_u8(mce.filter_shape.width);
            payload.put_u8(mce.filter_shape.height);
            payload.put_u8(mce.padding.left);
            payload.put_u8(mce.padding.top);
            payload.put_i8(mce.ifm_delta_default.width);
            payload.put_i8(mce.ifm_delta_default.height);
            payload.put_i8(mce.ifm_delta_edge.width);
            payload.put_i8(mce.ifm_delta_edge.height);
            payload.put_i16_le(mce.relu_activ.min);
            payload.put_i16_le(mce.relu_activ.max);
            payload.put_u32_le(mce.ple_kernel_id.to_word());
        }
        AgentData::PleLoader(ple) => {
            payload.put_u32_le(ple.ple_kernel_id.to_word());
            payload.put_u16_le(ple.sram_addr);
        }
        AgentData::PleScheduler(ple) => {
            put_tile(&mut payload, &ple.ofm_tile);
            payload.put_i16_le(ple.ofm_zero_point);
            put_tensor_size(&mut payload, &ple.dflt_stripe_size);
            put_tensor_size(&mut payload, &ple.edge_stripe_size);
            put_tensor_size(&mut payload, &ple.num_stripes);
            put_tensor_size(&mut payload, &ple.stripe_id_strides);
            payload.put_u8(ple.input_mode.code());
            payload.put_u32_le(ple.ple_kernel_id.to_word());
            payload.put_u16_le(ple.ple_kernel_sram_addr);
            put_tile(&mut payload, &ple.ifm_tile0);
            put_ple_ifm_info(&mut payload, &ple.ifm_info0);
            put_tile(&mut payload, &ple.ifm_tile1);
            put_ple_ifm_info(&mut payload, &ple.ifm_info1);
        }
    }
    debug_assert!(payload.len() <= AGENT_PAYLOAD_BYTES);
    payload.resize(AGENT_PAYLOAD_BYTES, 0);
    out.put_slice(&payload);

    out.put_u16_le(agent.info.num_stripes_total);
    out.put_u16_le(0);
    put_dependency(out, &agent.info.schedule_dependencies[0]);
    put_dependency(out, &agent.info.read_dependencies[0]);
    put_dependency(out, &agent.info.read_dependencies[1]);
    put_dependency(out, &agent.info.write_dependencies[0]);
}

fn write_command(out: &mut BytesMut, cmd: &Command) {
    out.put_u32_le(cmd.kind_code());
    let (p0, p1, p2) = match *cmd {
        Command::WaitForCounter { counter, target } => (counter.code(), u32::from(target), 0),
        Command::ConfigMceif { agent_id } | Command::LoadPleCodeIntoPleSram { agent_id } => {
            (agent_id, 0, 0)
        }
        Command::LoadIfmStripe {
            agent_id,
            stripe_id,
        }
        | Command::LoadWgtStripe {
            agent_id,
            stripe_id,
        }
        | Command::StoreOfmStripe {
            agent_id,
            stripe_id,
        }
        | Command::ProgramMceStripe {
            agent_id,
            stripe_id,
        }
        | Command::StartMceStripe {
            agent_id,
            stripe_id,
        }
        | Command::StartPleStripe {
            agent_id,
            stripe_id,
        } => (agent_id, stripe_id, 0),
    };
    out.put_u32_le(p0);
    out.put_u32_le(p1);
    out.put_u32_le(p2);
}

fn put_tile(out: &mut BytesMut, tile: &Tile) {
    out.put_u16_le(tile.base_addr);
    out.put_u16_le(tile.num_slots);
    out.put_u16_le(tile.slot_size);
}

fn put_tensor_size(out: &mut BytesMut, ts: &TensorSize) {
    out.put_u16_le(ts.height);
    out.put_u16_le(ts.width);
    out.put_u16_le(ts.channels);
}

fn put_wgt_work(out: &mut BytesMut, ws: &WgtWorkSize) {
    out.put_u16_le(ws.ofm_channels);
    out.put_u16_le(ws.ifm_channels);
}

fn put_mce_work(out: &mut BytesMut, ws: &MceWorkSize) {
    out.put_u16_le(ws.ofm_height);
    out.put_u16_le(ws.ofm_width);
    out.put_u16_le(ws.ofm_channels);
    out.put_u16_le(ws.ifm_channels);
}

fn put_ple_ifm_info(out: &mut BytesMut, info: &PleIfmInfo) {
    out.put_i16_le(info.zero_point);
    out.put_u16_le(info.multiplier);
    out.put_u16_le(info.shift);
}

fn put_fm_data(out: &mut BytesMut, fm: &FmSData) {
    out.put_u32_le(fm.dram_offset);
    out.put_u16_le(fm.buffer_id);
    out.put_u8(fm.data_type.code());
    out.put_u8(0);
    put_tile(out, &fm.tile);
    put_tensor_size(out, &fm.dflt_stripe_size);
    put_tensor_size(out, &fm.edge_stripe_size);
    out.put_u16_le(fm.supertensor_size_in_cells.width);
    out.put_u16_le(fm.supertensor_size_in_cells.channels);
    put_tensor_size(out, &fm.num_stripes);
    put_tensor_size(out, &fm.stripe_id_strides);
}

fn put_dependency(out: &mut BytesMut, dep: &Dependency) {
    out.put_u8(dep.relative_agent_id);
    out.put_u8(dep.outer_ratio.other);
    out.put_u8(dep.outer_ratio.this);
    out.put_u8(dep.inner_ratio.other);
    out.put_u8(dep.inner_ratio.this);
    out.put_i8(dep.boundary);
}

/// Byte cursor with bounds-checked little-endian reads.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(CommandStreamError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn tile(&mut self) -> Result<Tile> {
        Ok(Tile {
            base_addr: self.u16()?,
            num_slots: self.u16()?,
            slot_size: self.u16()?,
        })
    }

    fn tensor_size(&mut self) -> Result<TensorSize> {
        Ok(TensorSize {
            height: self.u16()?,
            width: self.u16()?,
            channels: self.u16()?,
        })
    }

    fn wgt_work(&mut self) -> Result<WgtWorkSize> {
        Ok(WgtWorkSize {
            ofm_channels: self.u16()?,
            ifm_channels: self.u16()?,
        })
    }

    fn mce_work(&mut self) -> Result<MceWorkSize> {
        Ok(MceWorkSize {
            ofm_height: self.u16()?,
            ofm_width: self.u16()?,
            ofm_channels: self.u16()?,
            ifm_channels: self.u16()?,
        })
    }

    fn ple_ifm_info(&mut self) -> Result<PleIfmInfo> {
        Ok(PleIfmInfo {
            zero_point: self.i16()?,
            multiplier: self.u16()?,
            shift: self.u16()?,
        })
    }

    fn ple_kernel(&mut self) -> Result<PleKernelId> {
        let word = self.u32()?;
        PleKernelId::from_word(word)
            .ok_or_else(|| CommandStreamError::malformed(format!("bad PLE kernel word {word:#x}")))
    }

    fn fm_data(&mut self) -> Result<FmSData> {
        let dram_offset = self.u32()?;
        let buffer_id = self.u16()?;
        let ty = self.u8()?;
        let _pad = self.u8()?;
        Ok(FmSData {
            dram_offset,
            buffer_id,
            data_type: FmsDataType::from_code(ty).ok_or_else(|| {
                CommandStreamError::malformed(format!("bad feature-map data type {ty}"))
            })?,
            tile: self.tile()?,
            dflt_stripe_size: self.tensor_size()?,
            edge_stripe_size: self.tensor_size()?,
            supertensor_size_in_cells: SupertensorSize {
                width: self.u16()?,
                channels: self.u16()?,
            },
            num_stripes: self.tensor_size()?,
            stripe_id_strides: self.tensor_size()?,
        })
    }

    fn dependency(&mut self) -> Result<Dependency> {
        Ok(Dependency {
            relative_agent_id: self.u8()?,
            outer_ratio: Ratio {
                other: self.u8()?,
                this: self.u8()?,
            },
            inner_ratio: Ratio {
                other: self.u8()?,
                this: self.u8()?,
            },
            boundary: self.i8()?,
        })
    }
}

/// Parse a binary stream.
///
/// # Errors
///
/// Returns an error on bad magic, truncation, or malformed enum tags.
/// Streams stamped with a different major version are rejected; minor and
/// patch mismatches are tolerated.
pub fn read_stream(data: &[u8]) -> Result<CommandStream> {
    let mut r = Reader::new(data);

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(CommandStreamError::InvalidMagic {
            found: [magic[0], magic[1], magic[2], magic[3]],
        });
    }
    let version = Version::new(r.u32()?, r.u32()?, r.u32()?);

    let accepted = VersionRange::new(
        Version::new(COMMAND_STREAM_VERSION.major, 0, 0),
        COMMAND_STREAM_VERSION,
    );
    if !accepted.accepts_stream(version) {
        return Err(CommandStreamError::VersionMismatch {
            found: version,
            min: accepted.min,
            max: accepted.max,
        });
    }

    // Walk the sections; only Cascade is understood, the rest are skipped.
    let mut stream = CommandStream::new(version);
    while r.pos < data.len() {
        let kind = r.u32()?;
        let payload_bytes = r.u32()? as usize;
        let payload = r.take(payload_bytes)?;
        if kind == SECTION_CASCADE {
            read_cascade_payload(payload, &mut stream)?;
        } else {
            tracing::debug!("Skipping unknown section kind {kind} ({payload_bytes} bytes)");
        }
    }

    Ok(stream)
}

fn read_cascade_payload(payload: &[u8], stream: &mut CommandStream) -> Result<()> {
    let mut header = Reader::new(payload);
    let total_size = header.u32()? as usize;
    if total_size != payload.len() {
        return Err(CommandStreamError::malformed(format!(
            "cascade total_size {total_size} != payload length {}",
            payload.len()
        )));
    }
    let agents_offset = header.u32()? as usize;
    let num_agents = header.u32()? as usize;
    let dma_rd = (header.u32()? as usize, header.u32()? as usize);
    let dma_wr = (header.u32()? as usize, header.u32()? as usize);
    let mce = (header.u32()? as usize, header.u32()? as usize);
    let ple = (header.u32()? as usize, header.u32()? as usize);

    let mut r = Reader::at(payload, agents_offset);
    for _ in 0..num_agents {
        stream.agents.push(read_agent(&mut r)?);
    }

    for ((offset, count), queue) in [
        (dma_rd, &mut stream.dma_rd_commands),
        (dma_wr, &mut stream.dma_wr_commands),
        (mce, &mut stream.mce_commands),
        (ple, &mut stream.ple_commands),
    ] {
        let mut r = Reader::at(payload, offset);
        for _ in 0..count {
            queue.push(read_command(&mut r)?);
        }
    }

    Ok(())
}

fn read_agent(r: &mut Reader<'_>) -> Result<Agent> {
    let record_start = r.pos;
    let kind = r.u32()?;

    let payload = r.take(AGENT_PAYLOAD_BYTES)?;
    let mut p = Reader::new(payload);
    let data = match kind {
        0 => AgentData::IfmStreamer(IfmS {
            fm_data: p.fm_data()?,
        }),
        5 => AgentData::OfmStreamer(OfmS {
            fm_data: p.fm_data()?,
        }),
        1 => AgentData::WgtStreamer(WgtS {
            buffer_id: p.u16()?,
            metadata_buffer_id: p.u16()?,
            tile: p.tile()?,
            edge_stripe_ofm_channels: p.u16()?,
            num_stripes: p.wgt_work()?,
            stripe_id_strides: p.wgt_work()?,
        }),
        2 => AgentData::MceScheduler(MceS {
            ifm_tile: p.tile()?,
            wgt_tile: p.tile()?,
            block_size: BlockSize {
                width: p.u8()?,
                height: p.u8()?,
            },
            dflt_stripe_size: p.mce_work()?,
            edge_stripe_size: p.mce_work()?,
            num_stripes: p.mce_work()?,
            stripe_id_strides: p.mce_work()?,
            conv_stride_xy: StrideXy {
                x: p.u8()?,
                y: p.u8()?,
            },
            ifm_zero_point: p.i16()?,
            mce_op_mode: {
                let code = p.u8()?;
                MceOperation::from_code(code).ok_or_else(|| {
                    CommandStreamError::malformed(format!("bad MCE op mode {code}"))
                })?
            },
            filter_shape: FilterShape {
                width: p.u8()?,
                height: p.u8()?,
            },
            padding: Padding {
                left: p.u8()?,
                top: p.u8()?,
            },
            ifm_delta_default: IfmDelta {
                width: p.i8()?,
                height: p.i8()?,
            },
            ifm_delta_edge: IfmDelta {
                width: p.i8()?,
                height: p.i8()?,
            },
            relu_activ: ReluActivation {
                min: p.i16()?,
                max: p.i16()?,
            },
            ple_kernel_id: p.ple_kernel()?,
        }),
        3 => AgentData::PleLoader(PleL {
            ple_kernel_id: p.ple_kernel()?,
            sram_addr: p.u16()?,
        }),
        4 => AgentData::PleScheduler(PleS {
            ofm_tile: p.tile()?,
            ofm_zero_point: p.i16()?,
            dflt_stripe_size: p.tensor_size()?,
            edge_stripe_size: p.tensor_size()?,
            num_stripes: p.tensor_size()?,
            stripe_id_strides: p.tensor_size()?,
            input_mode: {
                let code = p.u8()?;
                PleInputMode::from_code(code).ok_or_else(|| {
                    CommandStreamError::malformed(format!("bad PLE input mode {code}"))
                })?
            },
            ple_kernel_id: p.ple_kernel()?,
            ple_kernel_sram_addr: p.u16()?,
            ifm_tile0: p.tile()?,
            ifm_info0: p.ple_ifm_info()?,
            ifm_tile1: p.tile()?,
            ifm_info1: p.ple_ifm_info()?,
        }),
        other => {
            return Err(CommandStreamError::malformed(format!(
                "bad agent kind {other}"
            )))
        }
    };

    let num_stripes_total = r.u16()?;
    let _pad = r.u16()?;
    let info = AgentDependencyInfo {
        num_stripes_total,
        schedule_dependencies: [r.dependency()?],
        read_dependencies: [r.dependency()?, r.dependency()?],
        write_dependencies: [r.dependency()?],
    };

    debug_assert_eq!(r.pos - record_start, AGENT_RECORD_BYTES);
    Ok(Agent { data, info })
}

fn read_command(r: &mut Reader<'_>) -> Result<Command> {
    let kind = r.u32()?;
    let p0 = r.u32()?;
    let p1 = r.u32()?;
    let _p2 = r.u32()?;

    Ok(match kind {
        0 => Command::WaitForCounter {
            counter: CounterName::from_code(p0)
                .ok_or_else(|| CommandStreamError::malformed(format!("bad counter {p0}")))?,
            target: u16::try_from(p1 & 0xFFFF).unwrap_or(0),
        },
        1 => Command::LoadIfmStripe {
            agent_id: p0,
            stripe_id: p1,
        },
        2 => Command::LoadWgtStripe {
            agent_id: p0,
            stripe_id: p1,
        },
        3 => Command::StoreOfmStripe {
            agent_id: p0,
            stripe_id: p1,
        },
        4 => Command::ProgramMceStripe {
            agent_id: p0,
            stripe_id: p1,
        },
        5 => Command::ConfigMceif { agent_id: p0 },
        6 => Command::StartMceStripe {
            agent_id: p0,
            stripe_id: p1,
        },
        7 => Command::LoadPleCodeIntoPleSram { agent_id: p0 },
        8 => Command::StartPleStripe {
            agent_id: p0,
            stripe_id: p1,
        },
        other => {
            return Err(CommandStreamError::malformed(format!(
                "bad command kind {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosn_chip::version::COMMAND_STREAM_VERSION;

    #[test]
    fn test_empty_stream_round_trip() {
        let stream = CommandStream::new(COMMAND_STREAM_VERSION);
        let bytes = write_stream(&stream);
        let parsed = read_stream(&bytes).unwrap();
        assert_eq!(parsed, stream);
    }

    #[test]
    fn test_mismatched_major_rejected() {
        let mut stream = CommandStream::new(COMMAND_STREAM_VERSION);
        stream.version = Version::new(COMMAND_STREAM_VERSION.major + 1, 0, 0);
        let bytes = write_stream(&stream);
        assert!(matches!(
            read_stream(&bytes),
            Err(CommandStreamError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_minor_and_patch_mismatch_tolerated() {
        let mut stream = CommandStream::new(COMMAND_STREAM_VERSION);
        stream.version = Version::new(COMMAND_STREAM_VERSION.major, 99, 7);
        let bytes = write_stream(&stream);
        let parsed = read_stream(&bytes).unwrap();
        assert_eq!(parsed.version, stream.version);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let stream = CommandStream::new(COMMAND_STREAM_VERSION);
        let mut bytes = write_stream(&stream);
        bytes[0] = b'X';
        assert!(matches!(
            read_stream(&bytes),
            Err(CommandStreamError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let mut stream = CommandStream::new(COMMAND_STREAM_VERSION);
        stream.mce_commands.push(Command::ConfigMceif { agent_id: 3 });
        let bytes = write_stream(&stream);
        assert!(matches!(
            read_stream(&bytes[..bytes.len() - 4]),
            Err(CommandStreamError::Truncated { .. })
        ));
    }

    #[test]
    fn test_agent_record_size_is_fixed() {
        let agent = Agent {
            data: AgentData::IfmStreamer(IfmS::default()),
            info: AgentDependencyInfo::default(),
        };
        let mut out = BytesMut::new();
        write_agent(&mut out, &agent);
        assert_eq!(out.len(), AGENT_RECORD_BYTES);
    }
}
