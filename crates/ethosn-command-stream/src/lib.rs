//! Command-stream wire format for the Ethos-N78.
//!
//! A command stream is a self-contained binary program for the NPU firmware:
//! a header, then sections, of which the `CASCADE` section carries an array
//! of [`Agent`]s (one per hardware work unit) and four command queues (DMA
//! read, DMA write, MCE, PLE).
//!
//! # Format
//!
//! - **Header** (16 bytes): magic `"ENCS"` and the `(major, minor, patch)`
//!   version triple.
//! - **Sections**: `kind: u32`, `payload_bytes: u32`, payload. All offsets
//!   inside a payload are byte-relative to the payload start.
//!
//! The binary form is authoritative. An XML form exists solely for tests and
//! offline debugging ([`xml`]), and a CMM hex-dump extractor recovers streams
//! and binding tables from memory dumps ([`cmm`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod agents;
mod binary;
pub mod cmm;
mod commands;
mod error;
pub mod xml;

pub use agents::{
    Agent, AgentData, AgentDependencyInfo, BlockSize, Dependency, FilterShape, FmSData,
    FmsDataType, IfmDelta, IfmS, MceOperation, MceS, MceWorkSize, OfmS, Padding, PleIfmInfo,
    PleInputMode, PleL, PleS, Ratio, ReluActivation, StrideXy, SupertensorSize, TensorSize, Tile,
    WgtS, WgtWorkSize,
};
pub use binary::{read_stream, write_stream, AGENT_RECORD_BYTES, COMMAND_RECORD_BYTES, MAGIC};
pub use commands::{Command, CommandStream, CounterName, QueueKind};
pub use error::{CommandStreamError, Result};
