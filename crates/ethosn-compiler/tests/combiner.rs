//! Section-search invariants: every part covered exactly once, every input
//! slot either section-internal or glued exactly once.

use bytes::Bytes;

use ethosn_chip::{EthosN78Variant, HardwareCapabilities};
use ethosn_compiler::combiner::{Combination, Combiner};
use ethosn_compiler::network::{
    ConvInfo, Network, NetworkToGraphOfParts, OperationKind, WeightLayout,
};
use ethosn_compiler::parts::{GraphOfParts, PartId, PartInputSlot};
use ethosn_compiler::tensor::{DataType, QuantizationInfo, TensorInfo, TensorShape};
use ethosn_compiler::weights::WeightEncoderCache;
use ethosn_compiler::CompilationOptions;

fn info(shape: TensorShape) -> TensorInfo {
    TensorInfo::new(shape, DataType::QAsymmU8, QuantizationInfo::new(0, 1.0))
}

fn conv_info(i: u32, o: u32) -> ConvInfo {
    ConvInfo {
        weights_shape: TensorShape::new(1, 1, i, o),
        layout: WeightLayout::Hwio,
        weights: Bytes::from(vec![1u8; (i * o) as usize]),
        weights_quant: QuantizationInfo::new(0, 0.1),
        bias: vec![0; o as usize],
        bias_quant: QuantizationInfo::new(0, 0.1),
        stride: (1, 1),
        pad: (0, 0),
    }
}

fn caps() -> HardwareCapabilities {
    HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio)
}

fn convert(network: &Network) -> GraphOfParts {
    let options = CompilationOptions::default();
    NetworkToGraphOfParts::new(network, &options, false)
        .convert()
        .expect("convert")
}

fn combine(graph: &GraphOfParts) -> Combination {
    let hw = caps();
    let mut cache = WeightEncoderCache::new();
    Combiner::new(graph, &hw, false, &mut cache)
        .run()
        .expect("combine")
}

/// Every part input slot is mapped to exactly one producer output slot,
/// directly (section-internal) or through exactly one glue.
fn assert_every_slot_covered(graph: &GraphOfParts, combination: &Combination) {
    assert_eq!(combination.elems.len(), graph.num_parts());
    for (part_id, elem) in &combination.elems {
        let part = graph.part(*part_id).unwrap();
        for index in 0..part.num_input_slots() {
            let slot = PartInputSlot {
                part: *part_id,
                index,
            };
            assert!(
                graph.get_connected_output_slot(slot).is_some(),
                "input slot {slot:?} has no producer"
            );
            let covered = elem.continues_section || elem.glues.contains_key(&slot);
            assert!(covered, "input slot {slot:?} is neither in-section nor glued");
        }
        if elem.continues_section {
            assert!(
                elem.glues.is_empty(),
                "section-internal part {part_id} must not carry glues"
            );
            assert_eq!(part.num_input_slots(), 1);
        }
    }
}

#[test]
fn chained_convolutions_cover_every_slot() {
    let mut network = Network::new();
    let shape = TensorShape::new(1, 32, 32, 16);
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv1 = network.add(
        OperationKind::Convolution(conv_info(16, 16)),
        vec![input],
        info(shape),
    );
    let conv2 = network.add(
        OperationKind::Convolution(conv_info(16, 16)),
        vec![conv1],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv2], info(shape));

    let graph = convert(&network);
    let combination = combine(&graph);
    assert_every_slot_covered(&graph, &combination);
}

#[test]
fn multi_input_parts_get_one_glue_per_slot() {
    let shape = TensorShape::new(1, 16, 16, 16);
    let mut network = Network::new();
    let a = network.add(OperationKind::Input, vec![], info(shape));
    let b = network.add(OperationKind::Input, vec![], info(shape));
    let sum = network.add(OperationKind::Addition, vec![a, b], info(shape));
    network.add(OperationKind::Output, vec![sum], info(shape));

    let graph = convert(&network);
    let combination = combine(&graph);
    assert_every_slot_covered(&graph, &combination);

    // The addition part is lonely, with each input slot glued on its own.
    let elem = &combination.elems[&PartId(2)];
    assert!(!elem.continues_section);
    assert_eq!(elem.glues.len(), 2);
    for index in 0..2 {
        let slot = PartInputSlot {
            part: PartId(2),
            index,
        };
        // Both producers are DRAM input buffers, so each glue is one load.
        let glue = &elem.glues[&slot];
        assert!(glue.load && !glue.store && glue.dram_buffer.is_none());
    }
}

#[test]
fn first_part_starts_a_section_and_passes_count_sections() {
    let mut network = Network::new();
    let shape = TensorShape::new(1, 32, 32, 16);
    let input = network.add(OperationKind::Input, vec![], info(shape));
    let conv = network.add(
        OperationKind::Convolution(conv_info(16, 16)),
        vec![input],
        info(shape),
    );
    network.add(OperationKind::Output, vec![conv], info(shape));

    let graph = convert(&network);
    let combination = combine(&graph);

    assert!(!combination.elems[&PartId(0)].continues_section);
    let section_starts = combination
        .elems
        .values()
        .filter(|e| !e.continues_section)
        .count() as u64;
    assert!(section_starts >= 1);
    assert_eq!(combination.metric.passes, section_starts);
}
