//! End-to-end compilation: stream well-formedness and the quantified
//! invariants on agents, dependencies and combinations.

use bytes::Bytes;
use ethosn_chip::version::COMMAND_STREAM_VERSION;
use ethosn_chip::{EthosN78Variant, HardwareCapabilities, Version, VersionRange};
use ethosn_command_stream::{read_stream, AgentData, Command};

use ethosn_compiler::network::{ConvInfo, Network, NetworkToGraphOfParts, OperationKind, WeightLayout};
use ethosn_compiler::tensor::{DataType, QuantizationInfo, TensorInfo, TensorShape};
use ethosn_compiler::weights::WeightEncoderCache;
use ethosn_compiler::{compile, CompilationOptions, CompileError};

fn info(shape: TensorShape) -> TensorInfo {
    TensorInfo::new(shape, DataType::QAsymmU8, QuantizationInfo::new(0, 1.0))
}

fn conv_info(kh: u32, kw: u32, i: u32, o: u32, stride: u32, pad: u32) -> ConvInfo {
    ConvInfo {
        weights_shape: TensorShape::new(kh, kw, i, o),
        layout: WeightLayout::Hwio,
        weights: Bytes::from(vec![1u8; (kh * kw * i * o) as usize]),
        weights_quant: QuantizationInfo::new(0, 0.1),
        bias: vec![0; o as usize],
        bias_quant: QuantizationInfo::new(0, 0.1),
        stride: (stride, stride),
        pad: (pad, pad),
    }
}

fn caps() -> HardwareCapabilities {
    HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio)
}

/// Input -> 1x1 conv -> Output.
fn single_conv_network(shape: TensorShape) -> Network {
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::Convolution(conv_info(1, 1, shape.channels(), 16, 1, 0)),
        vec![input],
        info(TensorShape::new(1, shape.height(), shape.width(), 16)),
    );
    network.add(
        OperationKind::Output,
        vec![conv],
        info(TensorShape::new(1, shape.height(), shape.width(), 16)),
    );
    network
}

#[test]
fn single_convolution_compiles() {
    let network = single_conv_network(TensorShape::new(1, 16, 16, 16));
    let compiled = compile(&network, &caps(), &CompilationOptions::default()).expect("compile");

    let stream = read_stream(&compiled.command_stream).expect("parse emitted stream");
    assert_eq!(stream.version, COMMAND_STREAM_VERSION);

    // One agent per hardware unit the plan touches.
    let kinds: Vec<u32> = stream.agents.iter().map(|a| a.data.kind_code()).collect();
    assert!(!kinds.is_empty());
    let has = |code: u32| kinds.contains(&code);
    assert!(has(0), "expected an IFM streamer: {kinds:?}");
    assert!(has(1), "expected a weight streamer: {kinds:?}");
    assert!(has(2), "expected an MCE scheduler: {kinds:?}");
    assert!(has(3), "expected a PLE loader: {kinds:?}");
    assert!(has(4), "expected a PLE scheduler: {kinds:?}");
    assert!(has(5), "expected an OFM streamer: {kinds:?}");

    // Queues are populated and the stream round-trips.
    assert!(!stream.dma_rd_commands.is_empty());
    assert!(!stream.dma_wr_commands.is_empty());
    assert!(!stream.mce_commands.is_empty());
    assert!(!stream.ple_commands.is_empty());
    assert_eq!(
        ethosn_command_stream::write_stream(&stream),
        compiled.command_stream
    );
}

#[test]
fn compiled_buffers_cover_all_roles() {
    let network = single_conv_network(TensorShape::new(1, 16, 16, 16));
    let compiled = compile(&network, &caps(), &CompilationOptions::default()).expect("compile");

    use ethosn_compiler::plan::BufferType;
    let types: Vec<BufferType> = compiled.buffers.iter().map(|b| b.buffer_type).collect();
    assert!(types.contains(&BufferType::Input));
    assert!(types.contains(&BufferType::Output));
    assert!(types.contains(&BufferType::ConstantDma));
    assert!(types.contains(&BufferType::ConstantControl));

    assert!(!compiled.constant_dma_data.is_empty());
    assert!(!compiled.constant_control_data.is_empty());
    assert_eq!(compiled.operation_ids, vec![0, 1, 2]);
}

/// For every feature-map agent, stripe id -> coordinate must be a bijection
/// over `[0, product(num_stripes))`.
#[test]
fn stripe_id_strides_are_bijective() {
    let network = single_conv_network(TensorShape::new(1, 64, 64, 16));
    let compiled = compile(&network, &caps(), &CompilationOptions::default()).expect("compile");
    let stream = read_stream(&compiled.command_stream).expect("parse");

    for agent in &stream.agents {
        let (num, strides) = match &agent.data {
            AgentData::IfmStreamer(a) => (a.fm_data.num_stripes, a.fm_data.stripe_id_strides),
            AgentData::OfmStreamer(a) => (a.fm_data.num_stripes, a.fm_data.stripe_id_strides),
            AgentData::PleScheduler(a) => (a.num_stripes, a.stripe_id_strides),
            _ => continue,
        };
        let total = u32::from(num.height) * u32::from(num.width) * u32::from(num.channels);
        let mut seen = std::collections::HashSet::new();
        for stripe_id in 0..total {
            let coord = (
                (stripe_id / u32::from(strides.height.max(1))) % u32::from(num.height.max(1)),
                (stripe_id / u32::from(strides.width.max(1))) % u32::from(num.width.max(1)),
                (stripe_id / u32::from(strides.channels.max(1))) % u32::from(num.channels.max(1)),
            );
            assert!(seen.insert(coord), "stripe {stripe_id} repeats {coord:?}");
        }
        assert_eq!(seen.len() as u32, total);
    }
}

/// Read dependencies always point up the agent sequence, and the halo rule
/// holds: a split height with a tall kernel needs one neighbour stripe.
#[test]
fn dependencies_point_backwards_and_carry_boundaries() {
    // Large tensor with a 3x3 kernel: the tensor cannot fit SRAM whole, so
    // the chosen plan splits and the halo applies.
    let mut network = Network::new();
    let shape = TensorShape::new(1, 256, 256, 64);
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::Convolution(conv_info(3, 3, 64, 64, 1, 1)),
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv], info(shape));

    let compiled = compile(&network, &caps(), &CompilationOptions::default()).expect("compile");
    let stream = read_stream(&compiled.command_stream).expect("parse");

    for (index, agent) in stream.agents.iter().enumerate() {
        for dep in &agent.info.read_dependencies {
            if dep.is_unused() {
                continue;
            }
            assert!(
                usize::from(dep.relative_agent_id) <= index,
                "read dependency of agent {index} reaches before the stream"
            );
        }
    }

    // The invariant: boundary == 1 exactly when the producer splits a
    // dimension the kernel is wider than one in.
    for (index, agent) in stream.agents.iter().enumerate() {
        let AgentData::MceScheduler(mce) = &agent.data else {
            continue;
        };
        let dep = &agent.info.read_dependencies[0];
        if dep.is_unused() {
            continue;
        }
        let producer = &stream.agents[index - usize::from(dep.relative_agent_id)];
        if let AgentData::IfmStreamer(ifm) = &producer.data {
            let expected = (ifm.fm_data.num_stripes.height > 1 && mce.filter_shape.height > 1)
                || (ifm.fm_data.num_stripes.width > 1 && mce.filter_shape.width > 1);
            assert_eq!(dep.boundary, i8::from(expected));
        }
    }
}

/// MCE queues must configure the PLE interface before the first stripe
/// starts.
#[test]
fn config_mceif_precedes_first_mce_stripe() {
    let network = single_conv_network(TensorShape::new(1, 32, 32, 16));
    let compiled = compile(&network, &caps(), &CompilationOptions::default()).expect("compile");
    let stream = read_stream(&compiled.command_stream).expect("parse");

    let mut configured = std::collections::HashSet::new();
    for command in &stream.mce_commands {
        match command {
            Command::ConfigMceif { agent_id } => {
                configured.insert(*agent_id);
            }
            Command::StartMceStripe { agent_id, .. } => {
                assert!(
                    configured.contains(agent_id),
                    "agent {agent_id} started before ConfigMceif"
                );
            }
            _ => {}
        }
    }
}

#[test]
fn plans_never_exceed_sram() {
    let mut network = Network::new();
    let shape = TensorShape::new(1, 64, 64, 32);
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::Convolution(conv_info(3, 3, 32, 32, 1, 1)),
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv], info(shape));

    let options = CompilationOptions::default();
    let graph = NetworkToGraphOfParts::new(&network, &options, false)
        .convert()
        .expect("convert");

    let hw = caps();
    let mut cache = WeightEncoderCache::new();
    use ethosn_compiler::parts::{CascadeType, PlanContext};
    for part in graph.parts() {
        let mut ctx = PlanContext {
            caps: &hw,
            weight_cache: &mut cache,
            estimation: false,
        };
        let plans = part
            .get_plans(CascadeType::Lonely, None, None, 1, &mut ctx)
            .expect("plans");
        for plan in &plans {
            assert!(
                plan.sram_bytes() <= hw.total_sram_bytes,
                "{} produced a plan of {} bytes",
                part.debug_tag(),
                plan.sram_bytes()
            );
        }
    }
}

#[test]
fn tiny_sram_reports_overflow() {
    let mut hw = caps();
    hw.total_sram_bytes = 1024;

    let network = single_conv_network(TensorShape::new(1, 64, 64, 16));
    let result = compile(&network, &hw, &CompilationOptions::default());
    assert!(matches!(result, Err(CompileError::SramOverflow { .. })));
}

#[test]
fn version_outside_range_is_rejected() {
    let mut hw = caps();
    hw.supported_versions = VersionRange::new(Version::new(1, 0, 0), Version::new(1, 9, 9));

    let network = single_conv_network(TensorShape::new(1, 16, 16, 16));
    let result = compile(&network, &hw, &CompilationOptions::default());
    assert!(matches!(result, Err(CompileError::VersionMismatch { .. })));
}

#[test]
fn unsupported_operator_never_compiles() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let est = network.add(
        OperationKind::EstimateOnly {
            reason: "declared unsupported".to_string(),
        },
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![est], info(shape));

    let result = compile(&network, &caps(), &CompilationOptions::default());
    assert!(matches!(result, Err(CompileError::NotSupported(_))));
}

/// Intermediate DRAM buffers publish `[producer, last_consumer + 1)`.
#[test]
fn intermediate_lifetimes_are_published() {
    // A reshape between two convolutions forces a DRAM round-trip, so at
    // least one intermediate buffer must exist.
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv1 = network.add(
        OperationKind::Convolution(conv_info(1, 1, 16, 16, 1, 0)),
        vec![input],
        info(shape),
    );
    let reshape = network.add(OperationKind::Reshape, vec![conv1], info(shape));
    let conv2 = network.add(
        OperationKind::Convolution(conv_info(1, 1, 16, 16, 1, 0)),
        vec![reshape],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv2], info(shape));

    let compiled = compile(&network, &caps(), &CompilationOptions::default()).expect("compile");

    use ethosn_compiler::plan::BufferType;
    let intermediates: Vec<_> = compiled
        .buffers
        .iter()
        .filter(|b| b.buffer_type == BufferType::Intermediate)
        .collect();
    assert!(!intermediates.is_empty());
    for buffer in &intermediates {
        let (start, end) = buffer.lifetime.expect("intermediate without a lifetime");
        assert!(start < end, "empty lifetime {start}..{end}");
    }
}
