//! Front-end operator graph and its conversion to the graph of parts.
//!
//! The network is a frozen sequence of operations, one output operand each,
//! built by the public API before compilation starts. The converter walks it
//! in order and emits parts, fusing activations into their producers and
//! lowering strided and transposed convolutions into part pairs.

use std::collections::BTreeSet;

use bytes::Bytes;
use ethosn_chip::PleOperation;
use ethosn_command_stream::MceOperation;

use crate::error::{CompileError, Result};
use crate::parts::{
    ConcatPart, EstimateOnlyPart, FusedPlePart, GraphOfParts, InputPart, McePart, McePartParams,
    OutputPart, Part, PartCommon, PartId, PartInputSlot, PartOutputSlot, ReshapePart,
    StandalonePlePart,
};
use crate::quant::{calculate_rescale_multiplier_and_shift, quantise_bounded_relu, quantise_relu};
use crate::stripes::{Frac, ShapeMultiplier, StripeConfig};
use crate::tensor::{div_round_up, QuantizationInfo, TensorInfo, TensorShape};
use crate::weights::{swizzle_ohwi_to_hwio, swizzle_oihw_to_hwio};
use crate::CompilationOptions;

/// Index of an operation's output operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperandId(pub usize);

/// Layout of user-supplied convolution weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// Height, width, input channels, output channels. Native.
    Hwio,
    /// Height, width, channels, multiplier. Native depthwise.
    Hwim,
    /// Output channels first; swizzled on conversion.
    Ohwi,
    /// Output channels then input channels; swizzled on conversion.
    Oihw,
}

/// Convolution-family parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvInfo {
    /// Weight tensor shape in `layout` order.
    pub weights_shape: TensorShape,
    /// Weight layout.
    pub layout: WeightLayout,
    /// Weight bytes in `layout` order.
    pub weights: Bytes,
    /// Weight quantisation.
    pub weights_quant: QuantizationInfo,
    /// Bias, one per output channel.
    pub bias: Vec<i32>,
    /// Bias quantisation.
    pub bias_quant: QuantizationInfo,
    /// Stride `(x, y)`.
    pub stride: (u32, u32),
    /// Padding `(left, top)`.
    pub pad: (u32, u32),
}

/// Pooling function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingType {
    /// Maximum.
    Max,
    /// Average.
    Avg,
}

/// Resize interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Nearest neighbour.
    Nearest,
    /// Bilinear.
    Bilinear,
}

/// One operation of the frozen front-end graph.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    /// Network input.
    Input,
    /// Network output.
    Output,
    /// Dense convolution.
    Convolution(ConvInfo),
    /// Depthwise convolution.
    DepthwiseConvolution(ConvInfo),
    /// Fully connected.
    FullyConnected(ConvInfo),
    /// Pooling.
    Pooling {
        /// Function.
        pooling: PoolingType,
        /// Window `(height, width)`.
        size: (u32, u32),
        /// Stride `(x, y)`.
        stride: (u32, u32),
    },
    /// Shape reinterpretation.
    Reshape,
    /// Concatenation along one axis.
    Concatenation {
        /// Axis: 2 (width) or 3 (channels).
        axis: u32,
    },
    /// Leaky ReLU.
    LeakyRelu {
        /// Negative-slope coefficient.
        alpha: f32,
    },
    /// Sigmoid.
    Sigmoid,
    /// Tanh.
    Tanh,
    /// Mean over the spatial dimensions.
    MeanXy,
    /// Declared-unsupported operation.
    EstimateOnly {
        /// Why it is unsupported.
        reason: String,
    },
    /// Elementwise addition.
    Addition,
    /// Spatial upscale.
    Resize {
        /// Interpolation.
        mode: ResizeMode,
        /// Upscale factor.
        factor: u32,
    },
    /// Clamp activation.
    Relu {
        /// Lower bound, real. Ignored unless `bounded`.
        lower: f32,
        /// Upper bound, real. Ignored unless `bounded`.
        upper: f32,
        /// Bounded or plain ReLU.
        bounded: bool,
    },
    /// Transposed convolution.
    TransposeConvolution(ConvInfo),
    /// Quantisation relabel, no data change.
    ReinterpretQuantization,
    /// Softmax (unsupported).
    Softmax,
    /// Depth-to-space (unsupported).
    DepthToSpace,
    /// Split (unsupported).
    Split,
    /// Transpose (unsupported).
    Transpose,
    /// Space-to-depth (unsupported).
    SpaceToDepth,
    /// Requantisation as an explicit operation.
    Requantize,
}

/// One node of the network: kind, inputs, and the produced operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Stable front-end id.
    pub id: u32,
    /// Input operands.
    pub inputs: Vec<OperandId>,
    /// What the operation does.
    pub kind: OperationKind,
    /// The produced operand.
    pub output_info: TensorInfo,
}

/// The frozen operator graph handed to the compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Network {
    operations: Vec<Operation>,
}

impl Network {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation. The operation id is its position.
    pub fn add(
        &mut self,
        kind: OperationKind,
        inputs: Vec<OperandId>,
        output_info: TensorInfo,
    ) -> OperandId {
        let id = u32::try_from(self.operations.len()).unwrap_or(u32::MAX);
        self.operations.push(Operation {
            id,
            inputs,
            kind,
            output_info,
        });
        OperandId(self.operations.len() - 1)
    }

    /// The operations in construction order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Info of an operand.
    pub fn operand_info(&self, operand: OperandId) -> TensorInfo {
        self.operations[operand.0].output_info
    }

    /// How many operations read `operand`.
    fn fan_out(&self, operand: OperandId) -> usize {
        self.operations
            .iter()
            .filter(|op| op.inputs.contains(&operand))
            .count()
    }
}

/// Converts a [`Network`] into a [`GraphOfParts`].
pub struct NetworkToGraphOfParts<'a> {
    network: &'a Network,
    options: &'a CompilationOptions,
    estimation: bool,
    graph: GraphOfParts,
    /// Producing output slot of every converted operand.
    operand_slots: Vec<Option<PartOutputSlot>>,
}

impl<'a> NetworkToGraphOfParts<'a> {
    /// Create a converter for one network.
    pub fn new(network: &'a Network, options: &'a CompilationOptions, estimation: bool) -> Self {
        Self {
            network,
            options,
            estimation,
            graph: GraphOfParts::new(),
            operand_slots: vec![None; network.operations().len()],
        }
    }

    /// Run the conversion and release the graph of parts.
    pub fn convert(mut self) -> Result<GraphOfParts> {
        for (index, operation) in self.network.operations().iter().enumerate() {
            self.visit(OperandId(index), operation.clone())?;
        }
        if !self.graph.is_complete() {
            return Err(CompileError::Internal("conversion left unsourced slots"));
        }
        tracing::debug!("Converted network into {} part(s)", self.graph.num_parts());
        Ok(self.graph)
    }

    fn stripe_config(&self, kind_name: &str, id: PartId) -> Result<StripeConfig> {
        crate::stripes::get_stripe_config(self.options, &format!("{kind_name} {id}"))
    }

    fn source_slot(&self, operand: OperandId) -> Result<PartOutputSlot> {
        self.operand_slots[operand.0]
            .ok_or(CompileError::Internal("operand converted out of order"))
    }

    /// Add a part and connect its inputs to the given source operands.
    fn add_and_connect(
        &mut self,
        part: Part,
        sources: &[PartOutputSlot],
    ) -> Result<PartOutputSlot> {
        let id = self.graph.add_part(part)?;
        for (index, source) in sources.iter().enumerate() {
            self.graph.connect(
                *source,
                PartInputSlot {
                    part: id,
                    index: u32::try_from(index).unwrap_or(0),
                },
            )?;
        }
        Ok(PartOutputSlot { part: id, index: 0 })
    }

    /// Unsupported configurations become placeholder parts in estimation
    /// mode and hard errors otherwise.
    fn unsupported(
        &mut self,
        reason: String,
        operation: &Operation,
    ) -> Result<PartOutputSlot> {
        if !self.estimation {
            return Err(CompileError::NotSupported(reason));
        }
        let sources: Result<Vec<_>> = operation
            .inputs
            .iter()
            .map(|&operand| self.source_slot(operand))
            .collect();
        let input_infos = operation
            .inputs
            .iter()
            .map(|&operand| self.network.operand_info(operand))
            .collect();
        let part = Part::EstimateOnly(EstimateOnlyPart {
            common: PartCommon::new(self.graph.next_part_id(), BTreeSet::from([operation.id])),
            reason,
            input_infos,
            output_info: operation.output_info,
        });
        self.add_and_connect(part, &sources?)
    }

    /// Build an MCE part in one call.
    #[allow(clippy::too_many_arguments)]
    fn make_mce_part(
        &mut self,
        operation_ids: BTreeSet<u32>,
        input_info: TensorInfo,
        output_info: TensorInfo,
        operation: MceOperation,
        weights_shape: TensorShape,
        weights: Bytes,
        weights_quant: QuantizationInfo,
        bias: Vec<i32>,
        bias_quant: QuantizationInfo,
        stride: (u32, u32),
        pad: (u32, u32),
        upscale_factor: u32,
    ) -> Result<McePart> {
        let id = self.graph.next_part_id();
        let relu = quantise_relu(output_info.data_type, output_info.quant);
        Ok(McePart {
            common: PartCommon::new(id, operation_ids),
            params: McePartParams {
                input_info,
                output_info,
                operation,
                weights_shape,
                weights,
                weights_quant,
                bias,
                bias_quant,
                stride,
                pad,
                upscale_factor,
                relu_bounds: (
                    i16::try_from(output_info.data_type.min_value()).unwrap_or(i16::MIN),
                    i16::try_from(relu.max).unwrap_or(i16::MAX),
                ),
                stripe_config: self.stripe_config("McePart", id)?,
            },
        })
    }

    /// Identity MCE part used for requantisation and standalone activations.
    fn make_identity_mce_part(
        &mut self,
        operation_ids: BTreeSet<u32>,
        input_info: TensorInfo,
        output_info: TensorInfo,
    ) -> Result<McePart> {
        let channels = input_info.shape.channels();
        self.make_mce_part(
            operation_ids,
            input_info,
            output_info,
            MceOperation::DepthwiseConvolution,
            TensorShape::new(1, 1, channels, 1),
            Bytes::from(vec![2u8; channels as usize]),
            QuantizationInfo::new(0, 0.5),
            vec![0; channels as usize],
            QuantizationInfo::new(0, input_info.quant.scale),
            (1, 1),
            (0, 0),
            1,
        )
    }

    /// Interleave part inserted ahead of strided convolutions.
    fn make_interleave_part(
        &mut self,
        operation_ids: BTreeSet<u32>,
        input_info: TensorInfo,
    ) -> Result<(FusedPlePart, TensorInfo)> {
        let input = input_info.shape;
        let interleaved = TensorShape::new(
            1,
            div_round_up(input.height(), 2),
            div_round_up(input.width(), 2),
            input.channels() * 4,
        );
        let output_info = TensorInfo::new(interleaved, input_info.data_type, input_info.quant);
        let id = self.graph.next_part_id();
        Ok((
            FusedPlePart {
                common: PartCommon::new(id, operation_ids),
                input_info,
                output_info,
                ple_op: PleOperation::Interleave_2x2_2_2,
                shape_multiplier: ShapeMultiplier {
                    h: Frac { num: 1, den: 2 },
                    w: Frac { num: 1, den: 2 },
                    c: Frac { num: 4, den: 1 },
                },
                input0_rescale: (0, 0),
                stripe_config: self.stripe_config("FusedPlePart", id)?,
            },
            output_info,
        ))
    }

    /// Weights in HWIO (or HWIM) order, swizzling when the user supplied an
    /// output-channels-first layout. Exactly one swizzle runs per tensor.
    fn weights_to_native(conv: &ConvInfo) -> (Bytes, TensorShape) {
        match conv.layout {
            WeightLayout::Hwio | WeightLayout::Hwim => {
                (conv.weights.clone(), conv.weights_shape)
            }
            WeightLayout::Ohwi => {
                let data = swizzle_ohwi_to_hwio(&conv.weights, conv.weights_shape);
                let [o, h, w, i] = conv.weights_shape.0;
                (Bytes::from(data), TensorShape::new(h, w, i, o))
            }
            WeightLayout::Oihw => {
                let data = swizzle_oihw_to_hwio(&conv.weights, conv.weights_shape);
                let [o, i, h, w] = conv.weights_shape.0;
                (Bytes::from(data), TensorShape::new(h, w, i, o))
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn visit(&mut self, operand: OperandId, operation: Operation) -> Result<()> {
        let ids = BTreeSet::from([operation.id]);
        let output_info = operation.output_info;

        let slot = match &operation.kind {
            OperationKind::Input => {
                let part = Part::Input(InputPart {
                    common: PartCommon::new(self.graph.next_part_id(), ids),
                    tensor_info: output_info,
                });
                self.add_and_connect(part, &[])?
            }

            OperationKind::Output => {
                let source = self.source_slot(operation.inputs[0])?;
                let part = Part::Output(OutputPart {
                    common: PartCommon::new(self.graph.next_part_id(), ids),
                    tensor_info: self.network.operand_info(operation.inputs[0]),
                });
                self.add_and_connect(part, &[source])?
            }

            OperationKind::Convolution(conv) => {
                self.visit_convolution(&operation, conv, MceOperation::Convolution)?
            }

            OperationKind::DepthwiseConvolution(conv) => {
                let input_info = self.network.operand_info(operation.inputs[0]);
                // HWIM with a channel multiplier: only the single-input-
                // channel case lowers (as a dense convolution).
                let multiplier = conv.weights_shape.0[3];
                if multiplier > 1 && conv.weights_shape.0[2] > 1 {
                    let slot = self.unsupported(
                        format!(
                            "depthwise convolution with channel multiplier {multiplier} \
                             and {} input channels",
                            conv.weights_shape.0[2]
                        ),
                        &operation,
                    )?;
                    self.operand_slots[operand.0] = Some(slot);
                    return Ok(());
                }
                let as_dense = multiplier > 1 && input_info.shape.channels() == 1;
                let mode = if as_dense {
                    MceOperation::Convolution
                } else {
                    MceOperation::DepthwiseConvolution
                };
                self.visit_convolution(&operation, conv, mode)?
            }

            OperationKind::FullyConnected(conv) => {
                let source = self.source_slot(operation.inputs[0])?;
                let input_info = self.network.operand_info(operation.inputs[0]);
                let flat = input_info.shape.num_elements() as u32;

                // The MCE wants its input interleaved for fully connected.
                let id = self.graph.next_part_id();
                let interleave = FusedPlePart {
                    common: PartCommon::new(id, ids.clone()),
                    input_info,
                    output_info: TensorInfo::new(
                        TensorShape::new(1, 1, 1, flat),
                        input_info.data_type,
                        input_info.quant,
                    ),
                    ple_op: PleOperation::Interleave_2x2_2_2,
                    shape_multiplier: ShapeMultiplier {
                        h: Frac {
                            num: 1,
                            den: input_info.shape.height().max(1),
                        },
                        w: Frac {
                            num: 1,
                            den: input_info.shape.width().max(1),
                        },
                        c: Frac {
                            num: flat / input_info.shape.channels().max(1),
                            den: 1,
                        },
                    },
                    input0_rescale: (0, 0),
                    stripe_config: self.stripe_config("FusedPlePart", id)?,
                };
                let interleave_info = interleave.output_info;
                let mid = self.add_and_connect(Part::FusedPle(interleave), &[source])?;

                let (weights, weights_shape) = Self::weights_to_native(conv);
                let part = self.make_mce_part(
                    ids,
                    interleave_info,
                    output_info,
                    MceOperation::FullyConnected,
                    weights_shape,
                    weights,
                    conv.weights_quant,
                    conv.bias.clone(),
                    conv.bias_quant,
                    (1, 1),
                    (0, 0),
                    1,
                )?;
                self.add_and_connect(Part::Mce(part), &[mid])?
            }

            OperationKind::Pooling {
                pooling,
                size,
                stride,
            } => self.visit_pooling(&operation, *pooling, *size, *stride)?,

            OperationKind::Reshape => {
                let source = self.source_slot(operation.inputs[0])?;
                let part = Part::Reshape(ReshapePart {
                    common: PartCommon::new(self.graph.next_part_id(), ids),
                    input_info: self.network.operand_info(operation.inputs[0]),
                    output_info,
                });
                self.add_and_connect(part, &[source])?
            }

            OperationKind::Concatenation { axis } => {
                self.visit_concatenation(&operation, *axis)?
            }

            OperationKind::LeakyRelu { .. }
            | OperationKind::Sigmoid
            | OperationKind::Tanh => {
                let source = self.source_slot(operation.inputs[0])?;
                let input_info = self.network.operand_info(operation.inputs[0]);
                let ple_op = match &operation.kind {
                    OperationKind::LeakyRelu { .. } => PleOperation::LeakyRelu,
                    OperationKind::Sigmoid => PleOperation::Sigmoid,
                    _ => PleOperation::Tanh,
                };
                let rescale = calculate_rescale_multiplier_and_shift(
                    f64::from(input_info.quant.scale) / f64::from(output_info.quant.scale),
                );
                let id = self.graph.next_part_id();
                let part = Part::FusedPle(FusedPlePart {
                    common: PartCommon::new(id, ids),
                    input_info,
                    output_info,
                    ple_op,
                    shape_multiplier: ShapeMultiplier::IDENTITY,
                    input0_rescale: rescale,
                    stripe_config: self.stripe_config("FusedPlePart", id)?,
                });
                self.add_and_connect(part, &[source])?
            }

            OperationKind::MeanXy => {
                let source = self.source_slot(operation.inputs[0])?;
                let input_info = self.network.operand_info(operation.inputs[0]);
                let (h, w) = (input_info.shape.height(), input_info.shape.width());
                let ple_op = match (h, w) {
                    (7, 7) => PleOperation::MeanXy_7x7,
                    (8, 8) => PleOperation::MeanXy_8x8,
                    _ => {
                        let slot = self.unsupported(
                            format!("MeanXy over a {h}x{w} input"),
                            &operation,
                        )?;
                        self.operand_slots[operand.0] = Some(slot);
                        return Ok(());
                    }
                };
                let mut config = self.stripe_config("FusedPlePart", self.graph.next_part_id())?;
                config.disable_split_height();
                config.disable_split_width();
                let part = Part::FusedPle(FusedPlePart {
                    common: PartCommon::new(self.graph.next_part_id(), ids),
                    input_info,
                    output_info,
                    ple_op,
                    shape_multiplier: ShapeMultiplier {
                        h: Frac { num: 1, den: h },
                        w: Frac { num: 1, den: w },
                        c: Frac::ONE,
                    },
                    input0_rescale: (0, 0),
                    stripe_config: config,
                });
                self.add_and_connect(part, &[source])?
            }

            OperationKind::EstimateOnly { reason } => {
                self.unsupported(reason.clone(), &operation)?
            }

            OperationKind::Addition => {
                let a = self.source_slot(operation.inputs[0])?;
                let b = self.source_slot(operation.inputs[1])?;
                let info0 = self.network.operand_info(operation.inputs[0]);
                let info1 = self.network.operand_info(operation.inputs[1]);
                if info0.shape != info1.shape {
                    let slot = self.unsupported(
                        "addition of differently shaped operands".to_string(),
                        &operation,
                    )?;
                    self.operand_slots[operand.0] = Some(slot);
                    return Ok(());
                }

                let needs_rescale = info0.quant != output_info.quant
                    || info1.quant != output_info.quant;
                let ple_op = if needs_rescale {
                    PleOperation::AdditionRescale
                } else {
                    PleOperation::Addition
                };
                let rescale = |input: &TensorInfo| {
                    calculate_rescale_multiplier_and_shift(
                        f64::from(input.quant.scale) / f64::from(output_info.quant.scale),
                    )
                };
                let id = self.graph.next_part_id();
                let part = Part::StandalonePle(StandalonePlePart {
                    common: PartCommon::new(id, ids),
                    input_infos: vec![info0, info1],
                    output_info,
                    ple_op,
                    input_rescales: vec![rescale(&info0), rescale(&info1)],
                    stripe_config: self.stripe_config("StandalonePlePart", id)?,
                });
                self.add_and_connect(part, &[a, b])?
            }

            OperationKind::Resize { mode, factor } => {
                let source = self.source_slot(operation.inputs[0])?;
                let input_info = self.network.operand_info(operation.inputs[0]);
                if *factor != 2 {
                    let slot = self.unsupported(
                        format!("resize by factor {factor}"),
                        &operation,
                    )?;
                    self.operand_slots[operand.0] = Some(slot);
                    return Ok(());
                }
                let _ = mode;
                let channels = input_info.shape.channels();
                let part = self.make_mce_part(
                    ids,
                    input_info,
                    output_info,
                    MceOperation::DepthwiseConvolution,
                    TensorShape::new(1, 1, channels, 1),
                    Bytes::from(vec![2u8; channels as usize]),
                    QuantizationInfo::new(0, 0.5),
                    vec![0; channels as usize],
                    QuantizationInfo::new(0, input_info.quant.scale),
                    (1, 1),
                    (0, 0),
                    2,
                )?;
                self.add_and_connect(Part::Mce(part), &[source])?
            }

            OperationKind::Relu {
                lower,
                upper,
                bounded,
            } => {
                let source = self.source_slot(operation.inputs[0])?;
                let input_info = self.network.operand_info(operation.inputs[0]);
                let relu = if *bounded {
                    quantise_bounded_relu(*lower, *upper, output_info.data_type, output_info.quant)
                } else {
                    quantise_relu(output_info.data_type, output_info.quant)
                };
                let bounds = (
                    i16::try_from(relu.min).unwrap_or(i16::MIN),
                    i16::try_from(relu.max).unwrap_or(i16::MAX),
                );

                // Fuse into a preceding MCE part when it has no other reader.
                let fused = self.network.fan_out(operation.inputs[0]) == 1
                    && self.try_fuse_relu(source, bounds, output_info, operation.id);
                if fused {
                    source
                } else {
                    let mut part =
                        self.make_identity_mce_part(ids, input_info, output_info)?;
                    part.params.relu_bounds = bounds;
                    self.add_and_connect(Part::Mce(part), &[source])?
                }
            }

            OperationKind::TransposeConvolution(conv) => {
                self.visit_transpose_convolution(&operation, conv)?
            }

            OperationKind::ReinterpretQuantization => {
                // Pure relabel: consumers read the new quantisation from this
                // operand; no part is created.
                self.source_slot(operation.inputs[0])?
            }

            OperationKind::Requantize => {
                let source = self.source_slot(operation.inputs[0])?;
                let input_info = self.network.operand_info(operation.inputs[0]);
                let part = self.make_identity_mce_part(ids, input_info, output_info)?;
                self.add_and_connect(Part::Mce(part), &[source])?
            }

            OperationKind::Softmax
            | OperationKind::DepthToSpace
            | OperationKind::Split
            | OperationKind::Transpose
            | OperationKind::SpaceToDepth => {
                let name = match &operation.kind {
                    OperationKind::Softmax => "softmax",
                    OperationKind::DepthToSpace => "depth-to-space",
                    OperationKind::Split => "split",
                    OperationKind::Transpose => "transpose",
                    _ => "space-to-depth",
                };
                self.unsupported(format!("{name} is not supported"), &operation)?
            }
        };

        self.operand_slots[operand.0] = Some(slot);
        Ok(())
    }

    /// Fuse a relu clamp into the producing MCE part. Returns false when the
    /// producer is not an MCE part.
    fn try_fuse_relu(
        &mut self,
        source: PartOutputSlot,
        bounds: (i16, i16),
        output_info: TensorInfo,
        operation_id: u32,
    ) -> bool {
        self.graph
            .with_part_mut(source.part, |part| {
                if let Part::Mce(mce) = part {
                    mce.params.relu_bounds = bounds;
                    mce.params.output_info = output_info;
                    mce.common.operation_ids.insert(operation_id);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false)
    }

    fn visit_convolution(
        &mut self,
        operation: &Operation,
        conv: &ConvInfo,
        mode: MceOperation,
    ) -> Result<PartOutputSlot> {
        let ids = BTreeSet::from([operation.id]);
        let source = self.source_slot(operation.inputs[0])?;
        let input_info = self.network.operand_info(operation.inputs[0]);
        let output_info = operation.output_info;

        if conv.stride.0 != conv.stride.1 || conv.stride.0 == 0 || conv.stride.0 > 2 {
            return self.unsupported(
                format!("convolution stride {}x{}", conv.stride.0, conv.stride.1),
                operation,
            );
        }

        let (weights, weights_shape) = Self::weights_to_native(conv);

        let (mce_source, mce_input_info) = if conv.stride.0 == 2 {
            let (interleave, interleaved_info) =
                self.make_interleave_part(ids.clone(), input_info)?;
            let mid = self.add_and_connect(Part::FusedPle(interleave), &[source])?;
            (mid, interleaved_info)
        } else {
            (source, input_info)
        };

        let part = self.make_mce_part(
            ids,
            mce_input_info,
            output_info,
            mode,
            weights_shape,
            weights,
            conv.weights_quant,
            conv.bias.clone(),
            conv.bias_quant,
            conv.stride,
            conv.pad,
            1,
        )?;
        self.add_and_connect(Part::Mce(part), &[mce_source])
    }

    fn visit_pooling(
        &mut self,
        operation: &Operation,
        pooling: PoolingType,
        size: (u32, u32),
        stride: (u32, u32),
    ) -> Result<PartOutputSlot> {
        let ids = BTreeSet::from([operation.id]);
        let source = self.source_slot(operation.inputs[0])?;
        let input_info = self.network.operand_info(operation.inputs[0]);
        let output_info = operation.output_info;

        match (pooling, size, stride) {
            (PoolingType::Max, (2, 2), (2, 2)) => {
                let id = self.graph.next_part_id();
                let part = Part::FusedPle(FusedPlePart {
                    common: PartCommon::new(id, ids),
                    input_info,
                    output_info,
                    ple_op: PleOperation::MaxPool_2x2_2_2,
                    shape_multiplier: ShapeMultiplier {
                        h: Frac { num: 1, den: 2 },
                        w: Frac { num: 1, den: 2 },
                        c: Frac::ONE,
                    },
                    input0_rescale: (0, 0),
                    stripe_config: self.stripe_config("FusedPlePart", id)?,
                });
                self.add_and_connect(part, &[source])
            }
            (PoolingType::Max, (3, 3), (2, 2)) => {
                let ple_op = if input_info.shape.width() % 2 == 0 {
                    PleOperation::MaxPool_3x3_2_2_Even
                } else {
                    PleOperation::MaxPool_3x3_2_2_Odd
                };
                let id = self.graph.next_part_id();
                let part = Part::FusedPle(FusedPlePart {
                    common: PartCommon::new(id, ids),
                    input_info,
                    output_info,
                    ple_op,
                    shape_multiplier: ShapeMultiplier {
                        h: Frac { num: 1, den: 2 },
                        w: Frac { num: 1, den: 2 },
                        c: Frac::ONE,
                    },
                    input0_rescale: (0, 0),
                    stripe_config: self.stripe_config("FusedPlePart", id)?,
                });
                self.add_and_connect(part, &[source])
            }
            (PoolingType::Avg, (3, 3), (1, 1)) => {
                let id = self.graph.next_part_id();
                let part = Part::StandalonePle(StandalonePlePart {
                    common: PartCommon::new(id, ids),
                    input_infos: vec![input_info],
                    output_info,
                    ple_op: PleOperation::AvgPool_3x3_1_1,
                    input_rescales: vec![(0, 0)],
                    stripe_config: self.stripe_config("StandalonePlePart", id)?,
                });
                self.add_and_connect(part, &[source])
            }
            _ => self.unsupported(
                format!(
                    "{:?} pooling {}x{} stride {}x{}",
                    pooling, size.0, size.1, stride.0, stride.1
                ),
                operation,
            ),
        }
    }

    fn visit_concatenation(
        &mut self,
        operation: &Operation,
        axis: u32,
    ) -> Result<PartOutputSlot> {
        let ids = BTreeSet::from([operation.id]);
        let output_info = operation.output_info;

        if axis != 2 && axis != 3 {
            return self.unsupported(format!("concatenation along axis {axis}"), operation);
        }

        // Offsets must land on brick boundaries in the output supertensor.
        let alignment = if axis == 2 { 8 } else { 16 };
        let mut offset = 0u32;
        for &input in &operation.inputs {
            if offset % alignment != 0 {
                return self.unsupported(
                    format!("concatenation offset {offset} not {alignment}-aligned"),
                    operation,
                );
            }
            offset += self.network.operand_info(input).shape.0[axis as usize];
        }

        // Inputs whose quantisation differs from the output are requantised
        // by an identity MCE part in front of their slot.
        let mut sources = Vec::with_capacity(operation.inputs.len());
        let mut input_infos = Vec::with_capacity(operation.inputs.len());
        for &input in &operation.inputs {
            let source = self.source_slot(input)?;
            let info = self.network.operand_info(input);
            if info.quant == output_info.quant {
                sources.push(source);
                input_infos.push(info);
            } else {
                let requantised = TensorInfo::new(info.shape, info.data_type, output_info.quant);
                let part = self.make_identity_mce_part(ids.clone(), info, requantised)?;
                sources.push(self.add_and_connect(Part::Mce(part), &[source])?);
                input_infos.push(requantised);
            }
        }

        let part = Part::Concat(ConcatPart {
            common: PartCommon::new(self.graph.next_part_id(), ids),
            input_infos,
            output_info,
            axis,
        });
        self.add_and_connect(part, &sources)
    }

    fn visit_transpose_convolution(
        &mut self,
        operation: &Operation,
        conv: &ConvInfo,
    ) -> Result<PartOutputSlot> {
        let ids = BTreeSet::from([operation.id]);
        let source = self.source_slot(operation.inputs[0])?;
        let input_info = self.network.operand_info(operation.inputs[0]);
        let output_info = operation.output_info;

        let stride = conv.stride.0;
        if conv.stride.0 != conv.stride.1 || !(1..=2).contains(&stride) {
            return self.unsupported(
                format!(
                    "transpose convolution stride {}x{}",
                    conv.stride.0, conv.stride.1
                ),
                operation,
            );
        }

        let (weights, weights_shape) = Self::weights_to_native(conv);
        let kernel = weights_shape.0[0].max(weights_shape.0[1]);

        if kernel <= 2 * stride - 1 {
            // Single MCE with transpose upsampling.
            let part = self.make_mce_part(
                ids,
                input_info,
                output_info,
                MceOperation::Convolution,
                weights_shape,
                weights,
                conv.weights_quant,
                conv.bias.clone(),
                conv.bias_quant,
                (1, 1),
                conv.pad,
                stride,
            )?;
            return self.add_and_connect(Part::Mce(part), &[source]);
        }

        // Large kernels lower to an upsampling identity pass followed by a
        // stride-1 convolution with flipped padding.
        let upsampled = TensorInfo::new(
            TensorShape::new(
                1,
                input_info.shape.height() * stride,
                input_info.shape.width() * stride,
                input_info.shape.channels(),
            ),
            input_info.data_type,
            input_info.quant,
        );
        let channels = input_info.shape.channels();
        let upsample = self.make_mce_part(
            ids.clone(),
            input_info,
            upsampled,
            MceOperation::DepthwiseConvolution,
            TensorShape::new(1, 1, channels, 1),
            Bytes::from(vec![2u8; channels as usize]),
            QuantizationInfo::new(0, 0.5),
            vec![0; channels as usize],
            QuantizationInfo::new(0, input_info.quant.scale),
            (1, 1),
            (0, 0),
            stride,
        )?;
        let mid = self.add_and_connect(Part::Mce(upsample), &[source])?;

        let flipped_pad = (
            kernel - 1 - conv.pad.0.min(kernel - 1),
            kernel - 1 - conv.pad.1.min(kernel - 1),
        );
        let part = self.make_mce_part(
            ids,
            upsampled,
            output_info,
            MceOperation::Convolution,
            weights_shape,
            weights,
            conv.weights_quant,
            conv.bias.clone(),
            conv.bias_quant,
            (1, 1),
            flipped_pad,
            1,
        )?;
        self.add_and_connect(Part::Mce(part), &[mid])
    }
}
