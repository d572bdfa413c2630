//! Error taxonomy of the cascading compiler.

use thiserror::Error;

use crate::parts::PartId;

/// Result type alias for compiler operations.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors surfaced by [`crate::compile`]. Partial output is never exposed:
/// either a complete command stream is returned or one of these.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Operator or parameter combination outside the supported set.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Library/firmware version check failed.
    #[error("version {found} outside supported range {min}..={max}")]
    VersionMismatch {
        /// Version in use.
        found: ethosn_chip::Version,
        /// Oldest supported.
        min: ethosn_chip::Version,
        /// Newest supported.
        max: ethosn_chip::Version,
    },

    /// No plan of a required part fits in SRAM.
    #[error("part {part} does not fit in SRAM: needs {need} bytes, {have} available")]
    SramOverflow {
        /// Offending part.
        part: PartId,
        /// Smallest plan footprint found.
        need: u32,
        /// SRAM available.
        have: u32,
    },

    /// The weight encoder rejected a request.
    #[error("weight encoding failed for part {part}")]
    EncodeFailure {
        /// Offending part.
        part: PartId,
    },

    /// The debug stripe-config file is malformed.
    #[error("config error in {file} at line {line}: {message}")]
    ConfigParseError {
        /// File named by the environment variable.
        file: String,
        /// 1-based line number.
        line: usize,
        /// Reason for failure.
        message: String,
    },

    /// Invariant violation. Indicates a compiler bug, not bad input.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl CompileError {
    /// Create a [`CompileError::NotSupported`].
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported(reason.into())
    }
}
