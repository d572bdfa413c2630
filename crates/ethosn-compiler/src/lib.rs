//! Cascading compiler for the Ethos-N78.
//!
//! Takes a quantised operator graph and produces a self-contained command
//! stream driving the NPU's four hardware units. The pipeline:
//!
//! 1. [`network`] converts the operator graph into a graph of parts.
//! 2. Each part enumerates candidate plans (stripe shapes, tiles, blocks).
//! 3. The [`combiner`] groups parts into SRAM-resident sections and picks
//!    the cheapest plan combination.
//! 4. The [`emitter`] lowers the combination to agents and commands.
//!
//! Compilation either returns a complete [`CompiledNetwork`] or an error;
//! partial output is never exposed.
//!
//! # Example
//!
//! ```no_run
//! use ethosn_chip::{EthosN78Variant, HardwareCapabilities};
//! use ethosn_compiler::{compile, CompilationOptions, Network, OperationKind};
//! use ethosn_compiler::tensor::{DataType, QuantizationInfo, TensorInfo, TensorShape};
//!
//! # fn main() -> Result<(), ethosn_compiler::CompileError> {
//! let mut network = Network::new();
//! let info = TensorInfo::new(
//!     TensorShape::new(1, 16, 16, 16),
//!     DataType::QAsymmU8,
//!     QuantizationInfo::new(0, 1.0),
//! );
//! let input = network.add(OperationKind::Input, vec![], info);
//! network.add(OperationKind::Output, vec![input], info);
//!
//! let caps = HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio);
//! let compiled = compile(&network, &caps, &CompilationOptions::default())?;
//! println!("{} bytes of command stream", compiled.command_stream.len());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

pub mod buffer_manager;
pub mod combiner;
pub mod emitter;
mod error;
pub mod geometry;
pub mod network;
pub mod parts;
pub mod plan;
pub mod quant;
pub mod stripes;
pub mod tensor;
pub mod weights;

pub use error::{CompileError, Result};
pub use network::{Network, OperationKind};

use bytes::Bytes;
use ethosn_chip::version::COMMAND_STREAM_VERSION;
use ethosn_chip::HardwareCapabilities;

use buffer_manager::BufferInfo;
use combiner::Combiner;
use network::NetworkToGraphOfParts;
use weights::WeightEncoderCache;

/// Legacy strategy toggles. Disabling any of them restricts the cascading
/// split families to a rough equivalent of what was left enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StrategySelection {
    pub strategy0: bool,
    pub strategy1: bool,
    pub strategy3: bool,
    pub strategy4: bool,
    pub strategy6: bool,
    pub strategy7: bool,
}

impl Default for StrategySelection {
    fn default() -> Self {
        Self {
            strategy0: true,
            strategy1: true,
            strategy3: true,
            strategy4: true,
            strategy6: true,
            strategy7: true,
        }
    }
}

/// MCE block configs the search may use.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct BlockConfigSelection {
    pub b8x8: bool,
    pub b8x16: bool,
    pub b16x8: bool,
    pub b16x16: bool,
    pub b32x8: bool,
    pub b8x32: bool,
}

impl Default for BlockConfigSelection {
    fn default() -> Self {
        Self {
            b8x8: true,
            b8x16: true,
            b16x8: true,
            b16x16: true,
            b32x8: true,
            b8x32: true,
        }
    }
}

/// How much detail debug dumps carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetailLevel {
    /// Structure only.
    #[default]
    Low,
    /// Structure plus per-plan data.
    High,
}

/// Where and how verbosely to dump debug artefacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Directory for dumps; empty disables dumping.
    pub dump_dir: String,
    /// Verbosity.
    pub detail_level: DetailLevel,
}

/// Everything the caller can configure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationOptions {
    /// Strategy toggles.
    pub strategies: StrategySelection,
    /// Block config toggles.
    pub block_configs: BlockConfigSelection,
    /// Disable the winograd MCE algorithm.
    pub disable_winograd: bool,
    /// Debug dump configuration.
    pub debug_info: DebugInfo,
}

/// The complete artefact of a successful compilation.
#[derive(Debug)]
pub struct CompiledNetwork {
    /// Serialised command stream.
    pub command_stream: Vec<u8>,
    /// DRAM buffer table with roles, payloads and lifetimes.
    pub buffers: Vec<BufferInfo>,
    /// Constant data streamed by DMA (encoded weights), concatenated.
    pub constant_dma_data: Bytes,
    /// Constant data read by the control unit (weight metadata).
    pub constant_control_data: Bytes,
    /// Front-end operation ids covered by this network.
    pub operation_ids: Vec<u32>,
}

/// Compile a network for the given hardware.
///
/// # Errors
///
/// One of the [`CompileError`] kinds; never a partial stream.
pub fn compile(
    network: &Network,
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
) -> Result<CompiledNetwork> {
    if !caps.supported_versions.contains(COMMAND_STREAM_VERSION) {
        return Err(CompileError::VersionMismatch {
            found: COMMAND_STREAM_VERSION,
            min: caps.supported_versions.min,
            max: caps.supported_versions.max,
        });
    }

    tracing::info!(
        "Compiling network with {} operation(s)",
        network.operations().len()
    );

    let graph = NetworkToGraphOfParts::new(network, options, false).convert()?;

    let mut weight_cache = WeightEncoderCache::new();
    let combination = Combiner::new(&graph, caps, false, &mut weight_cache).run()?;

    let result = emitter::emit(&graph, &combination, caps)?;
    let command_stream = ethosn_command_stream::write_stream(&result.stream);

    let mut constant_dma = bytes::BytesMut::new();
    let mut constant_control = bytes::BytesMut::new();
    for buffer in result.buffers.buffers() {
        if let Some(data) = &buffer.constant_data {
            match buffer.buffer_type {
                plan::BufferType::ConstantDma => constant_dma.extend_from_slice(data),
                plan::BufferType::ConstantControl => constant_control.extend_from_slice(data),
                _ => {}
            }
        }
    }

    let mut operation_ids: Vec<u32> = graph
        .parts()
        .flat_map(|part| part.common().operation_ids.iter().copied())
        .collect();
    operation_ids.sort_unstable();
    operation_ids.dedup();

    tracing::info!(
        "Compiled: {} agent(s), {} command(s), {} DRAM buffer(s)",
        result.stream.agents.len(),
        result.stream.num_commands(),
        result.buffers.buffers().len()
    );

    Ok(CompiledNetwork {
        command_stream,
        buffers: result.buffers.buffers().to_vec(),
        constant_dma_data: constant_dma.freeze(),
        constant_control_data: constant_control.freeze(),
        operation_ids,
    })
}
