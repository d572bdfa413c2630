//! Network-to-parts conversion: expected part sequences and lowering rules.

use bytes::Bytes;
use ethosn_chip::PleOperation;
use ethosn_command_stream::MceOperation;

use ethosn_compiler::network::{
    ConvInfo, Network, NetworkToGraphOfParts, OperandId, OperationKind, PoolingType, ResizeMode,
    WeightLayout,
};
use ethosn_compiler::parts::{GraphOfParts, Part, PartId, PartInputSlot, PartOutputSlot};
use ethosn_compiler::tensor::{DataType, QuantizationInfo, TensorInfo, TensorShape};
use ethosn_compiler::{CompilationOptions, CompileError};

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

fn depthwise_info(kh: u32, kw: u32, c: u32, m: u32, stride: u32, pad: u32) -> ConvInfo {
    ConvInfo {
        weights_shape: TensorShape::new(kh, kw, c, m),
        layout: WeightLayout::Hwim,
        weights: Bytes::from(vec![1u8; (kh * kw * c * m) as usize]),
        weights_quant: QuantizationInfo::new(0, 0.1),
        bias: vec![0; (c * m) as usize],
        bias_quant: QuantizationInfo::new(0, 0.1),
        stride: (stride, stride),
        pad: (pad, pad),
    }
}

fn convert(network: &Network) -> GraphOfParts {
    let options = CompilationOptions::default();
    NetworkToGraphOfParts::new(network, &options, false)
        .convert()
        .expect("conversion")
}

fn assert_chain_connected(graph: &GraphOfParts) {
    for k in 0..graph.num_parts() as u32 - 1 {
        let output = PartOutputSlot {
            part: PartId(k),
            index: 0,
        };
        let input = PartInputSlot {
            part: PartId(k + 1),
            index: 0,
        };
        assert_eq!(
            graph.get_connected_output_slot(input),
            Some(output),
            "slot {k} -> {}",
            k + 1
        );
    }
}

/// The reference five-operation network produces exactly seven parts in
/// order, connected k -> k+1.
#[test]
fn conv_reshape_pool_strided_conv_ir_shape() {
    let mut network = Network::new();
    let input = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 128, 128, 16)),
    );
    let conv1 = network.add(
        OperationKind::Convolution(conv_info(3, 3, 16, 16, 1, 0)),
        vec![input],
        info(TensorShape::new(1, 126, 126, 16)),
    );
    let reshape = network.add(
        OperationKind::Reshape,
        vec![conv1],
        info(TensorShape::new(1, 126, 126, 16)),
    );
    let pool = network.add(
        OperationKind::Pooling {
            pooling: PoolingType::Max,
            size: (2, 2),
            stride: (2, 2),
        },
        vec![reshape],
        info(TensorShape::new(1, 63, 63, 16)),
    );
    let conv2 = network.add(
        OperationKind::Convolution(conv_info(3, 3, 16, 16, 2, 0)),
        vec![pool],
        info(TensorShape::new(1, 31, 31, 16)),
    );
    network.add(OperationKind::Output, vec![conv2], info(TensorShape::new(1, 31, 31, 16)));

    let graph = convert(&network);
    assert_eq!(graph.num_parts(), 7);

    assert!(matches!(graph.part(PartId(0)), Some(Part::Input(_))));
    assert!(matches!(graph.part(PartId(1)), Some(Part::Mce(_))));
    assert!(matches!(graph.part(PartId(2)), Some(Part::Reshape(_))));
    match graph.part(PartId(3)) {
        Some(Part::FusedPle(p)) => assert_eq!(p.ple_op, PleOperation::MaxPool_2x2_2_2),
        other => panic!("part 3 should be the max-pool, got {other:?}"),
    }
    match graph.part(PartId(4)) {
        Some(Part::FusedPle(p)) => assert_eq!(p.ple_op, PleOperation::Interleave_2x2_2_2),
        other => panic!("part 4 should be the interleave, got {other:?}"),
    }
    assert!(matches!(graph.part(PartId(5)), Some(Part::Mce(_))));
    assert!(matches!(graph.part(PartId(6)), Some(Part::Output(_))));

    assert_chain_connected(&graph);
}

#[test]
fn relu_fuses_into_preceding_convolution() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::Convolution(conv_info(1, 1, 16, 16, 1, 0)),
        vec![input],
        info(shape),
    );
    let relu = network.add(
        OperationKind::Relu {
            lower: 0.0,
            upper: 0.0,
            bounded: false,
        },
        vec![conv],
        info(shape),
    );
    network.add(OperationKind::Output, vec![relu], info(shape));

    let graph = convert(&network);
    // Input, McePart (with the clamp folded in), Output.
    assert_eq!(graph.num_parts(), 3);
    match graph.part(PartId(1)) {
        Some(Part::Mce(mce)) => {
            assert_eq!(mce.params.relu_bounds.1, 255);
            assert_eq!(mce.params.relu_bounds.0, 0);
        }
        other => panic!("expected an MCE part, got {other:?}"),
    }
}

#[test]
fn relu_without_mce_producer_becomes_identity_part() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let relu = network.add(
        OperationKind::Relu {
            lower: 0.0,
            upper: 0.0,
            bounded: false,
        },
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![relu], info(shape));

    let graph = convert(&network);
    // Input, identity McePart carrying the clamp, Output.
    assert_eq!(graph.num_parts(), 3);
    assert!(matches!(graph.part(PartId(1)), Some(Part::Mce(_))));
}

#[test]
fn depthwise_stride_one_is_a_single_mce_part() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::DepthwiseConvolution(depthwise_info(3, 3, 16, 1, 1, 1)),
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv], info(shape));

    let graph = convert(&network);
    assert_eq!(graph.num_parts(), 3);
    match graph.part(PartId(1)) {
        Some(Part::Mce(mce)) => {
            assert_eq!(mce.params.operation, MceOperation::DepthwiseConvolution);
        }
        other => panic!("expected an MCE part, got {other:?}"),
    }
}

#[test]
fn strided_depthwise_gets_an_interleave() {
    let mut network = Network::new();
    let input = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 16, 16, 16)),
    );
    let conv = network.add(
        OperationKind::DepthwiseConvolution(depthwise_info(3, 3, 16, 1, 2, 1)),
        vec![input],
        info(TensorShape::new(1, 8, 8, 16)),
    );
    network.add(
        OperationKind::Output,
        vec![conv],
        info(TensorShape::new(1, 8, 8, 16)),
    );

    let graph = convert(&network);
    // Input, FusedPlePart (interleave), McePart, Output.
    assert_eq!(graph.num_parts(), 4);
    assert!(matches!(graph.part(PartId(1)), Some(Part::FusedPle(_))));
    assert!(matches!(graph.part(PartId(2)), Some(Part::Mce(_))));
}

#[test]
fn multichannel_depthwise_is_rejected() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::DepthwiseConvolution(depthwise_info(3, 3, 16, 4, 1, 1)),
        vec![input],
        info(TensorShape::new(1, 16, 16, 64)),
    );
    network.add(
        OperationKind::Output,
        vec![conv],
        info(TensorShape::new(1, 16, 16, 64)),
    );

    let options = CompilationOptions::default();
    let result = NetworkToGraphOfParts::new(&network, &options, false).convert();
    assert!(matches!(result, Err(CompileError::NotSupported(_))));

    // Estimation mode keeps going with a placeholder part instead.
    let graph = NetworkToGraphOfParts::new(&network, &options, true)
        .convert()
        .expect("estimation conversion");
    assert!(matches!(graph.part(PartId(1)), Some(Part::EstimateOnly(_))));
}

#[test]
fn fully_connected_is_interleave_plus_mce() {
    let mut network = Network::new();
    let input = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 7, 7, 16)),
    );
    let fc = network.add(
        OperationKind::FullyConnected(conv_info(1, 1, 7 * 7 * 16, 32, 1, 0)),
        vec![input],
        info(TensorShape::new(1, 1, 1, 32)),
    );
    network.add(
        OperationKind::Output,
        vec![fc],
        info(TensorShape::new(1, 1, 1, 32)),
    );

    let graph = convert(&network);
    // Input, FusedPlePart, McePart, Output.
    assert_eq!(graph.num_parts(), 4);
    assert!(matches!(graph.part(PartId(1)), Some(Part::FusedPle(_))));
    match graph.part(PartId(2)) {
        Some(Part::Mce(mce)) => {
            assert_eq!(mce.params.operation, MceOperation::FullyConnected);
        }
        other => panic!("expected an MCE part, got {other:?}"),
    }
}

#[test]
fn addition_with_matching_quantisation() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let a = network.add(OperationKind::Input, vec![], info(shape));
    let b = network.add(OperationKind::Input, vec![], info(shape));
    let sum = network.add(OperationKind::Addition, vec![a, b], info(shape));
    network.add(OperationKind::Output, vec![sum], info(shape));

    let graph = convert(&network);
    assert_eq!(graph.num_parts(), 4);
    match graph.part(PartId(2)) {
        Some(Part::StandalonePle(p)) => assert_eq!(p.ple_op, PleOperation::Addition),
        other => panic!("expected a standalone PLE part, got {other:?}"),
    }
}

#[test]
fn addition_with_differing_quantisation_rescales() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let a = network.add(OperationKind::Input, vec![], info(shape));
    let b = network.add(
        OperationKind::Input,
        vec![],
        TensorInfo::new(shape, DataType::QAsymmU8, QuantizationInfo::new(3, 0.5)),
    );
    let sum = network.add(OperationKind::Addition, vec![a, b], info(shape));
    network.add(OperationKind::Output, vec![sum], info(shape));

    let graph = convert(&network);
    match graph.part(PartId(2)) {
        Some(Part::StandalonePle(p)) => {
            assert_eq!(p.ple_op, PleOperation::AdditionRescale);
            assert_ne!(p.input_rescales[1], (0, 0));
        }
        other => panic!("expected a standalone PLE part, got {other:?}"),
    }
}

#[test]
fn avgpool_3x3_is_standalone() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let pool = network.add(
        OperationKind::Pooling {
            pooling: PoolingType::Avg,
            size: (3, 3),
            stride: (1, 1),
        },
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![pool], info(shape));

    let graph = convert(&network);
    match graph.part(PartId(1)) {
        Some(Part::StandalonePle(p)) => {
            assert_eq!(p.ple_op, PleOperation::AvgPool_3x3_1_1);
        }
        other => panic!("expected a standalone PLE part, got {other:?}"),
    }
}

#[test]
fn resize_lowers_to_an_upscaling_mce() {
    let mut network = Network::new();
    let input = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 16, 16, 16)),
    );
    let resize = network.add(
        OperationKind::Resize {
            mode: ResizeMode::Bilinear,
            factor: 2,
        },
        vec![input],
        info(TensorShape::new(1, 32, 32, 16)),
    );
    network.add(
        OperationKind::Output,
        vec![resize],
        info(TensorShape::new(1, 32, 32, 16)),
    );

    let graph = convert(&network);
    assert_eq!(graph.num_parts(), 3);
    match graph.part(PartId(1)) {
        Some(Part::Mce(mce)) => assert_eq!(mce.params.upscale_factor, 2),
        other => panic!("expected an MCE part, got {other:?}"),
    }
}

#[test]
fn small_kernel_transpose_conv_is_one_part() {
    let mut network = Network::new();
    let input = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 16, 16, 16)),
    );
    let deconv = network.add(
        OperationKind::TransposeConvolution(conv_info(3, 3, 16, 16, 2, 1)),
        vec![input],
        info(TensorShape::new(1, 32, 32, 16)),
    );
    network.add(
        OperationKind::Output,
        vec![deconv],
        info(TensorShape::new(1, 32, 32, 16)),
    );

    let graph = convert(&network);
    // kernel 3 <= 2*2-1: a single upscaling MCE part.
    assert_eq!(graph.num_parts(), 3);
    match graph.part(PartId(1)) {
        Some(Part::Mce(mce)) => assert_eq!(mce.params.upscale_factor, 2),
        other => panic!("expected an MCE part, got {other:?}"),
    }
}

#[test]
fn large_kernel_transpose_conv_is_two_parts() {
    let mut network = Network::new();
    let input = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 16, 16, 16)),
    );
    let deconv = network.add(
        OperationKind::TransposeConvolution(conv_info(5, 5, 16, 16, 2, 2)),
        vec![input],
        info(TensorShape::new(1, 32, 32, 16)),
    );
    network.add(
        OperationKind::Output,
        vec![deconv],
        info(TensorShape::new(1, 32, 32, 16)),
    );

    let graph = convert(&network);
    // kernel 5 > 3: an upsampling identity followed by a stride-1 conv.
    assert_eq!(graph.num_parts(), 4);
    match (graph.part(PartId(1)), graph.part(PartId(2))) {
        (Some(Part::Mce(up)), Some(Part::Mce(conv))) => {
            assert_eq!(up.params.upscale_factor, 2);
            assert_eq!(conv.params.stride, (1, 1));
            // Padding flips to kernel - 1 - original.
            assert_eq!(conv.params.pad, (2, 2));
        }
        other => panic!("expected two MCE parts, got {other:?}"),
    }
}

#[test]
fn softmax_is_not_supported() {
    let shape = TensorShape::new(1, 1, 1, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let softmax = network.add(OperationKind::Softmax, vec![input], info(shape));
    network.add(OperationKind::Output, vec![softmax], info(shape));

    let options = CompilationOptions::default();
    let result = NetworkToGraphOfParts::new(&network, &options, false).convert();
    assert!(matches!(result, Err(CompileError::NotSupported(_))));
}

#[test]
fn operation_ids_are_recorded_on_parts() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::Convolution(conv_info(1, 1, 16, 16, 1, 0)),
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv], info(shape));

    let graph = convert(&network);
    let mce = graph.part(PartId(1)).unwrap();
    assert!(mce.common().operation_ids.contains(&1));
}

#[test]
fn operand_ids_are_dense() {
    let mut network = Network::new();
    let a = network.add(
        OperationKind::Input,
        vec![],
        info(TensorShape::new(1, 8, 8, 16)),
    );
    assert_eq!(a, OperandId(0));
    let b = network.add(OperationKind::Output, vec![a], info(TensorShape::new(1, 8, 8, 16)));
    assert_eq!(b, OperandId(1));
}
