//! Hardware capability descriptor.
//!
//! A frozen record describing one Ethos-N78 configuration. Read once at
//! start-up — either from a named variant or from a capabilities blob handed
//! over by the runtime — and passed by shared reference everywhere else.

use crate::version::{Version, VersionRange, COMMAND_STREAM_VERSION};

/// Named Ethos-N78 configurations.
///
/// The TOPS figure fixes the engine count; the PLE ratio is the number of
/// MCE output groups sharing one PLE lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum EthosN78Variant {
    /// 1 TOPS, 2:1 PLE ratio.
    Ethos78_1Tops_2PleRatio,
    /// 2 TOPS, 2:1 PLE ratio.
    Ethos78_2Tops_2PleRatio,
    /// 4 TOPS, 2:1 PLE ratio.
    Ethos78_4Tops_2PleRatio,
    /// 4 TOPS, 4:1 PLE ratio.
    Ethos78_4Tops_4PleRatio,
    /// 8 TOPS, 2:1 PLE ratio.
    Ethos78_8Tops_2PleRatio,
}

/// Immutable description of one NPU configuration.
///
/// Every size is in bytes, every count in units of one engine unless the
/// field name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareCapabilities {
    /// Total on-chip SRAM shared by all tiles of a section.
    pub total_sram_bytes: u32,
    /// Compute engines.
    pub num_engines: u32,
    /// SRAM banks per engine.
    pub srams_per_engine: u32,
    /// Output groups per engine.
    pub ogs_per_engine: u32,
    /// Input groups per engine.
    pub igs_per_engine: u32,
    /// PLE lanes per engine.
    pub ple_lanes: u32,
    /// Firmware bound on MCE stripes feeding one PLE stripe.
    pub max_mce_stripes_per_ple_stripe: u32,
    /// Firmware bound on IFM plus weight stripes feeding one PLE stripe.
    pub max_ifm_and_wgt_stripes_per_ple_stripe: u32,
    /// Command-stream versions this configuration's firmware accepts.
    pub supported_versions: VersionRange,
}

impl HardwareCapabilities {
    /// Capability table for a named variant.
    pub fn from_variant(variant: EthosN78Variant) -> Self {
        let (num_engines, ple_ratio) = match variant {
            EthosN78Variant::Ethos78_1Tops_2PleRatio => (4, 2),
            EthosN78Variant::Ethos78_2Tops_2PleRatio => (8, 2),
            EthosN78Variant::Ethos78_4Tops_2PleRatio => (16, 2),
            EthosN78Variant::Ethos78_4Tops_4PleRatio => (16, 4),
            EthosN78Variant::Ethos78_8Tops_2PleRatio => (32, 2),
        };

        Self {
            total_sram_bytes: num_engines * 64 * 1024,
            num_engines,
            srams_per_engine: 1,
            ogs_per_engine: 8,
            igs_per_engine: 8,
            ple_lanes: 8 / ple_ratio,
            max_mce_stripes_per_ple_stripe: 32,
            max_ifm_and_wgt_stripes_per_ple_stripe: 64,
            supported_versions: VersionRange::new(
                Version::new(COMMAND_STREAM_VERSION.major, 0, 0),
                COMMAND_STREAM_VERSION,
            ),
        }
    }

    /// Parse a capabilities blob supplied by the runtime.
    ///
    /// Layout: magic `"N78C"`, format version `u32` (currently 1), then the
    /// eight `u32` capability words in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error on a short blob, bad magic, or unknown format
    /// version.
    pub fn from_blob(blob: &[u8]) -> Result<Self, CapabilitiesBlobError> {
        const WORDS: usize = 8;
        if blob.len() < 8 + WORDS * 4 {
            return Err(CapabilitiesBlobError::Truncated { len: blob.len() });
        }
        if &blob[0..4] != b"N78C" {
            return Err(CapabilitiesBlobError::BadMagic);
        }
        let word = |i: usize| {
            let o = 8 + i * 4;
            u32::from_le_bytes([blob[o], blob[o + 1], blob[o + 2], blob[o + 3]])
        };
        let format = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        if format != 1 {
            return Err(CapabilitiesBlobError::UnknownFormat { format });
        }

        Ok(Self {
            total_sram_bytes: word(0),
            num_engines: word(1),
            srams_per_engine: word(2),
            ogs_per_engine: word(3),
            igs_per_engine: word(4),
            ple_lanes: word(5),
            max_mce_stripes_per_ple_stripe: word(6),
            max_ifm_and_wgt_stripes_per_ple_stripe: word(7),
            supported_versions: VersionRange::new(
                Version::new(COMMAND_STREAM_VERSION.major, 0, 0),
                COMMAND_STREAM_VERSION,
            ),
        })
    }

    /// Serialise to the blob layout accepted by [`Self::from_blob`].
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 * 4);
        out.extend_from_slice(b"N78C");
        out.extend_from_slice(&1u32.to_le_bytes());
        for w in [
            self.total_sram_bytes,
            self.num_engines,
            self.srams_per_engine,
            self.ogs_per_engine,
            self.igs_per_engine,
            self.ple_lanes,
            self.max_mce_stripes_per_ple_stripe,
            self.max_ifm_and_wgt_stripes_per_ple_stripe,
        ] {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Total SRAM banks across all engines.
    pub const fn num_srams(&self) -> u32 {
        self.num_engines * self.srams_per_engine
    }

    /// Total output groups across all engines.
    pub const fn num_ogs(&self) -> u32 {
        self.num_engines * self.ogs_per_engine
    }

    /// Total input groups across all engines.
    pub const fn num_igs(&self) -> u32 {
        self.num_engines * self.igs_per_engine
    }
}

/// Failures while decoding a capabilities blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilitiesBlobError {
    /// Blob shorter than the fixed layout.
    Truncated {
        /// Bytes actually supplied.
        len: usize,
    },
    /// First four bytes were not `"N78C"`.
    BadMagic,
    /// Format version word not understood.
    UnknownFormat {
        /// The version word found.
        format: u32,
    },
}

impl std::fmt::Display for CapabilitiesBlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "capabilities blob too short: {len} bytes"),
            Self::BadMagic => write!(f, "capabilities blob magic is not \"N78C\""),
            Self::UnknownFormat { format } => {
                write!(f, "unknown capabilities blob format: {format}")
            }
        }
    }
}

impl std::error::Error for CapabilitiesBlobError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_table() {
        let caps = HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio);
        assert_eq!(caps.num_engines, 16);
        assert_eq!(caps.num_srams(), 16);
        assert_eq!(caps.num_ogs(), 128);
        assert_eq!(caps.total_sram_bytes, 1024 * 1024);
        assert_eq!(caps.ple_lanes, 2);
    }

    #[test]
    fn test_blob_round_trip() {
        let caps = HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_2Tops_2PleRatio);
        let parsed = HardwareCapabilities::from_blob(&caps.to_blob()).unwrap();
        assert_eq!(parsed, caps);
    }

    #[test]
    fn test_blob_rejects_bad_magic() {
        let mut blob = HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_1Tops_2PleRatio)
            .to_blob();
        blob[0] = b'X';
        assert_eq!(
            HardwareCapabilities::from_blob(&blob),
            Err(CapabilitiesBlobError::BadMagic)
        );
    }

    #[test]
    fn test_blob_rejects_short_input() {
        assert!(matches!(
            HardwareCapabilities::from_blob(&[0u8; 4]),
            Err(CapabilitiesBlobError::Truncated { len: 4 })
        ));
    }
}
