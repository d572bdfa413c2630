//! Error types for command-stream encoding, decoding and extraction.

use thiserror::Error;

/// Result type alias for command-stream operations.
pub type Result<T> = std::result::Result<T, CommandStreamError>;

/// Errors that can occur while reading or writing command streams.
#[derive(Debug, Error)]
pub enum CommandStreamError {
    /// Stream does not start with the `"ENCS"` magic.
    #[error("invalid command stream magic: {found:02x?}")]
    InvalidMagic {
        /// First four bytes found.
        found: [u8; 4],
    },

    /// Major version of the stream is outside the accepted range.
    #[error("command stream version {found} not accepted (supported {min}..={max})")]
    VersionMismatch {
        /// Version stamped on the stream.
        found: ethosn_chip::Version,
        /// Oldest accepted version.
        min: ethosn_chip::Version,
        /// Newest accepted version.
        max: ethosn_chip::Version,
    },

    /// Stream ends before a declared structure.
    #[error("truncated command stream: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Byte offset of the read.
        offset: usize,
        /// Bytes required.
        needed: usize,
    },

    /// A tag, enum value, or offset in the stream is not valid.
    #[error("malformed command stream: {reason}")]
    Malformed {
        /// Reason for failure.
        reason: String,
    },

    /// XML text did not match the expected schema.
    #[error("malformed command stream XML at line {line}: {reason}")]
    MalformedXml {
        /// 1-based line number.
        line: usize,
        /// Reason for failure.
        reason: String,
    },

    /// CMM hex dump did not contain the expected tables.
    #[error("malformed CMM dump: {reason}")]
    MalformedCmm {
        /// Reason for failure.
        reason: String,
    },
}

impl CommandStreamError {
    /// Create a malformed-stream error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Create a malformed-CMM error.
    pub fn malformed_cmm(reason: impl Into<String>) -> Self {
        Self::MalformedCmm {
            reason: reason.into(),
        }
    }
}
