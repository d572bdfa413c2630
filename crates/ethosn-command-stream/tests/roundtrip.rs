//! Round-trip laws for the binary and XML codecs.
//!
//! For the same version: binary -> parsed -> XML -> parsed -> binary must be
//! byte-identical, and parse(serialise(parse(bytes))) == parse(bytes).

use ethosn_chip::version::COMMAND_STREAM_VERSION;
use ethosn_chip::{BlockConfig, PleKernelId, PleOperation};
use ethosn_command_stream::{
    read_stream, write_stream, xml, Agent, AgentData, AgentDependencyInfo, BlockSize, Command,
    CommandStream, CounterName, Dependency, FilterShape, FmSData, FmsDataType, IfmDelta, IfmS,
    MceOperation, MceS, MceWorkSize, OfmS, Padding, PleIfmInfo, PleInputMode, PleL, PleS, Ratio,
    ReluActivation, StrideXy, SupertensorSize, TensorSize, Tile, WgtS, WgtWorkSize,
};

fn sample_dependency(relative: u8) -> Dependency {
    Dependency {
        relative_agent_id: relative,
        outer_ratio: Ratio { other: 4, this: 2 },
        inner_ratio: Ratio { other: 2, this: 1 },
        boundary: 1,
    }
}

fn sample_fm_data() -> FmSData {
    FmSData {
        dram_offset: 0x1234,
        buffer_id: 3,
        data_type: FmsDataType::Nhwcb,
        tile: Tile {
            base_addr: 0x100,
            num_slots: 2,
            slot_size: 0x400,
        },
        dflt_stripe_size: TensorSize {
            height: 8,
            width: 16,
            channels: 16,
        },
        edge_stripe_size: TensorSize {
            height: 4,
            width: 16,
            channels: 16,
        },
        supertensor_size_in_cells: SupertensorSize {
            width: 2,
            channels: 1,
        },
        num_stripes: TensorSize {
            height: 3,
            width: 1,
            channels: 1,
        },
        stripe_id_strides: TensorSize {
            height: 1,
            width: 1,
            channels: 1,
        },
    }
}

fn sample_kernel() -> PleKernelId {
    PleKernelId::select(PleOperation::Sigmoid, BlockConfig::new(16, 16), true).unwrap()
}

/// A stream exercising every agent kind and every command kind.
fn sample_stream() -> CommandStream {
    let mut stream = CommandStream::new(COMMAND_STREAM_VERSION);

    let info = AgentDependencyInfo {
        num_stripes_total: 3,
        schedule_dependencies: [sample_dependency(1)],
        read_dependencies: [sample_dependency(2), Dependency::default()],
        write_dependencies: [Dependency::default()],
    };

    stream.agents.push(Agent {
        data: AgentData::IfmStreamer(IfmS {
            fm_data: sample_fm_data(),
        }),
        info,
    });
    stream.agents.push(Agent {
        data: AgentData::WgtStreamer(WgtS {
            buffer_id: 4,
            metadata_buffer_id: 5,
            tile: Tile {
                base_addr: 0x800,
                num_slots: 2,
                slot_size: 0x200,
            },
            edge_stripe_ofm_channels: 8,
            num_stripes: WgtWorkSize {
                ofm_channels: 2,
                ifm_channels: 1,
            },
            stripe_id_strides: WgtWorkSize {
                ofm_channels: 1,
                ifm_channels: 1,
            },
        }),
        info,
    });
    stream.agents.push(Agent {
        data: AgentData::MceScheduler(MceS {
            ifm_tile: Tile {
                base_addr: 0x100,
                num_slots: 2,
                slot_size: 0x400,
            },
            wgt_tile: Tile {
                base_addr: 0x800,
                num_slots: 2,
                slot_size: 0x200,
            },
            block_size: BlockSize {
                width: 16,
                height: 16,
            },
            dflt_stripe_size: MceWorkSize {
                ofm_height: 8,
                ofm_width: 16,
                ofm_channels: 16,
                ifm_channels: 16,
            },
            edge_stripe_size: MceWorkSize {
                ofm_height: 4,
                ofm_width: 16,
                ofm_channels: 16,
                ifm_channels: 16,
            },
            num_stripes: MceWorkSize {
                ofm_height: 3,
                ofm_width: 1,
                ofm_channels: 1,
                ifm_channels: 1,
            },
            stripe_id_strides: MceWorkSize {
                ofm_height: 1,
                ofm_width: 1,
                ofm_channels: 3,
                ifm_channels: 1,
            },
            conv_stride_xy: StrideXy { x: 1, y: 1 },
            ifm_zero_point: -2,
            mce_op_mode: MceOperation::Convolution,
            filter_shape: FilterShape {
                width: 3,
                height: 3,
            },
            padding: Padding { left: 1, top: 1 },
            ifm_delta_default: IfmDelta {
                width: 2,
                height: 2,
            },
            ifm_delta_edge: IfmDelta {
                width: 2,
                height: 2,
            },
            relu_activ: ReluActivation { min: 10, max: 250 },
            ple_kernel_id: sample_kernel(),
        }),
        info,
    });
    stream.agents.push(Agent {
        data: AgentData::PleLoader(PleL {
            ple_kernel_id: sample_kernel(),
            sram_addr: 0x1000,
        }),
        info,
    });
    stream.agents.push(Agent {
        data: AgentData::PleScheduler(PleS {
            ofm_tile: Tile {
                base_addr: 0xA00,
                num_slots: 2,
                slot_size: 0x400,
            },
            ofm_zero_point: 3,
            dflt_stripe_size: TensorSize {
                height: 8,
                width: 16,
                channels: 16,
            },
            edge_stripe_size: TensorSize {
                height: 4,
                width: 16,
                channels: 16,
            },
            num_stripes: TensorSize {
                height: 3,
                width: 1,
                channels: 1,
            },
            stripe_id_strides: TensorSize {
                height: 1,
                width: 1,
                channels: 3,
            },
            input_mode: PleInputMode::Sram,
            ple_kernel_id: sample_kernel(),
            ple_kernel_sram_addr: 0x1000,
            ifm_tile0: Tile {
                base_addr: 0x100,
                num_slots: 2,
                slot_size: 0x400,
            },
            ifm_info0: PleIfmInfo {
                zero_point: -1,
                multiplier: 32768,
                shift: 15,
            },
            ifm_tile1: Tile {
                base_addr: 0x500,
                num_slots: 2,
                slot_size: 0x400,
            },
            ifm_info1: PleIfmInfo {
                zero_point: 4,
                multiplier: 16384,
                shift: 14,
            },
        }),
        info,
    });
    stream.agents.push(Agent {
        data: AgentData::OfmStreamer(OfmS {
            fm_data: sample_fm_data(),
        }),
        info,
    });

    stream.dma_rd_commands.push(Command::LoadIfmStripe {
        agent_id: 0,
        stripe_id: 0,
    });
    stream.dma_rd_commands.push(Command::LoadWgtStripe {
        agent_id: 1,
        stripe_id: 0,
    });
    stream.dma_wr_commands.push(Command::WaitForCounter {
        counter: CounterName::PleStripe,
        target: 1,
    });
    stream.dma_wr_commands.push(Command::StoreOfmStripe {
        agent_id: 5,
        stripe_id: 0,
    });
    stream.mce_commands.push(Command::WaitForCounter {
        counter: CounterName::DmaRd,
        target: 2,
    });
    stream.mce_commands.push(Command::ProgramMceStripe {
        agent_id: 2,
        stripe_id: 0,
    });
    stream.mce_commands.push(Command::ConfigMceif { agent_id: 2 });
    stream.mce_commands.push(Command::StartMceStripe {
        agent_id: 2,
        stripe_id: 0,
    });
    stream
        .ple_commands
        .push(Command::LoadPleCodeIntoPleSram { agent_id: 3 });
    stream.ple_commands.push(Command::WaitForCounter {
        counter: CounterName::MceStripe,
        target: 1,
    });
    stream.ple_commands.push(Command::StartPleStripe {
        agent_id: 4,
        stripe_id: 0,
    });

    stream
}

#[test]
fn binary_round_trip_is_identity() {
    let stream = sample_stream();
    let bytes = write_stream(&stream);
    let parsed = read_stream(&bytes).unwrap();
    assert_eq!(parsed, stream);

    // parse(serialise(parse(bytes))) == parse(bytes)
    let bytes2 = write_stream(&parsed);
    assert_eq!(bytes2, bytes);
    assert_eq!(read_stream(&bytes2).unwrap(), parsed);
}

#[test]
fn xml_round_trip_is_identity() {
    let stream = sample_stream();
    let xml_text = xml::write_xml(&stream);
    let parsed = xml::read_xml(&xml_text).unwrap();
    assert_eq!(parsed, stream);

    // xml_of(binary_of(xml_of(x))) == xml_of(x)
    let bytes = write_stream(&parsed);
    let reparsed = read_stream(&bytes).unwrap();
    assert_eq!(xml::write_xml(&reparsed), xml_text);
}

#[test]
fn binary_through_xml_is_byte_identical() {
    let stream = sample_stream();
    let bytes = write_stream(&stream);

    let via_xml = xml::read_xml(&xml::write_xml(&read_stream(&bytes).unwrap())).unwrap();
    assert_eq!(write_stream(&via_xml), bytes);
}

#[test]
fn version_is_stamped_in_header() {
    let stream = sample_stream();
    let bytes = write_stream(&stream);
    assert_eq!(&bytes[0..4], b"ENCS");
    let major = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    assert_eq!(major, COMMAND_STREAM_VERSION.major);
}
