//! Binding-table and command-stream extraction from CMM hex dumps.
//!
//! A combined-memory-map dump is a text file of 16-byte lines:
//!
//! ```text
//! 60000000: 60000010 00000001 00000000 00000000
//! ```
//!
//! The word at [`INFERENCE_POINTER_ADDR`] addresses the inference entry,
//! whose first word addresses the buffer table: a count followed by
//! `(address_lo, address_hi, size, type)` records. The table may start at any
//! word column within a line.

use std::collections::BTreeMap;

use crate::error::{CommandStreamError, Result};

/// Address of the word holding the inference-entry pointer.
pub const INFERENCE_POINTER_ADDR: u64 = 0x6000_0000;

/// Role of a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    /// Network input, written by the host.
    Input,
    /// Scratch buffer between agents.
    Intermediate,
    /// Network output, read back by the host.
    Output,
    /// Constant data (weights, control words).
    Constant,
}

impl BindingType {
    /// Decode the table's type word.
    pub const fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            0 => Self::Input,
            1 => Self::Intermediate,
            2 => Self::Output,
            3 => Self::Constant,
            _ => return None,
        })
    }

    /// Display name, as used by the dump tooling.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Intermediate => "INTERMEDIATE",
            Self::Output => "OUTPUT",
            Self::Constant => "CONSTANT",
        }
    }
}

/// One row of the binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingTableEntry {
    /// Buffer id (index in the table).
    pub id: u32,
    /// DRAM address.
    pub address: u64,
    /// Size in bytes.
    pub size: u32,
    /// Buffer role.
    pub kind: BindingType,
}

/// A parsed CMM dump: a sparse word-addressed memory image.
#[derive(Debug, Clone)]
pub struct CmmDump {
    words: BTreeMap<u64, u32>,
}

impl CmmDump {
    /// Parse dump text. Lines that do not match `<addr>: w0 w1 w2 w3` are
    /// rejected; blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on an unparseable line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut words = BTreeMap::new();

        for (line_no, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let (addr_text, rest) = line.split_once(':').ok_or_else(|| {
                CommandStreamError::malformed_cmm(format!("line {}: missing ':'", line_no + 1))
            })?;
            let base = u64::from_str_radix(addr_text.trim(), 16).map_err(|_| {
                CommandStreamError::malformed_cmm(format!(
                    "line {}: bad address '{addr_text}'",
                    line_no + 1
                ))
            })?;

            for (i, word_text) in rest.split_whitespace().enumerate() {
                let word = u32::from_str_radix(word_text, 16).map_err(|_| {
                    CommandStreamError::malformed_cmm(format!(
                        "line {}: bad word '{word_text}'",
                        line_no + 1
                    ))
                })?;
                words.insert(base + (i as u64) * 4, word);
            }
        }

        tracing::debug!("Parsed CMM dump: {} words", words.len());
        Ok(Self { words })
    }

    /// Read one 32-bit word. Addresses must be word-aligned.
    fn word(&self, addr: u64) -> Result<u32> {
        self.words.get(&addr).copied().ok_or_else(|| {
            CommandStreamError::malformed_cmm(format!("no word at address {addr:#010x}"))
        })
    }

    /// Extract the binding table.
    ///
    /// # Errors
    ///
    /// Returns an error when the inference pointer, the table count, or any
    /// entry is missing or malformed.
    pub fn extract_binding_table(&self) -> Result<Vec<BindingTableEntry>> {
        let inference_addr = u64::from(self.word(INFERENCE_POINTER_ADDR)?);
        let count = self.word(inference_addr)?;
        tracing::debug!("Inference entry at {inference_addr:#010x}, {count} buffer(s)");

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..u64::from(count) {
            let entry_addr = inference_addr + 4 + i * 16;
            let lo = self.word(entry_addr)?;
            let hi = self.word(entry_addr + 4)?;
            let size = self.word(entry_addr + 8)?;
            let type_word = self.word(entry_addr + 12).unwrap_or(0);

            let kind = BindingType::from_word(type_word).ok_or_else(|| {
                CommandStreamError::malformed_cmm(format!(
                    "buffer {i}: bad type word {type_word}"
                ))
            })?;

            entries.push(BindingTableEntry {
                id: u32::try_from(i).unwrap_or(u32::MAX),
                address: u64::from(lo) | (u64::from(hi) << 32),
                size,
                kind,
            });
        }

        Ok(entries)
    }

    /// Extract the command-stream bytes: the contents of buffer table
    /// entry 0, read word by word, little-endian.
    ///
    /// # Errors
    ///
    /// Returns an error when the table or the addressed words are missing.
    pub fn extract_command_stream(&self) -> Result<Vec<u8>> {
        let inference_addr = u64::from(self.word(INFERENCE_POINTER_ADDR)?);
        let count = self.word(inference_addr)?;
        if count == 0 {
            return Err(CommandStreamError::malformed_cmm(
                "buffer table is empty, no command stream",
            ));
        }

        let lo = self.word(inference_addr + 4)?;
        let hi = self.word(inference_addr + 8)?;
        let size = self.word(inference_addr + 12)? as usize;
        let base = u64::from(lo) | (u64::from(hi) << 32);
        tracing::debug!("Command stream at {base:#010x}, {size} bytes");

        let mut bytes = Vec::with_capacity(size);
        let mut addr = base;
        while bytes.len() < size {
            let word = self.word(addr)?;
            bytes.extend_from_slice(&word.to_le_bytes());
            addr += 4;
        }
        bytes.truncate(size);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CmmDump::parse("not a dump line").is_err());
    }

    #[test]
    fn test_word_lookup() {
        let dump = CmmDump::parse("00000010: 11111111 22222222 33333333 44444444\n").unwrap();
        assert_eq!(dump.word(0x10).unwrap(), 0x1111_1111);
        assert_eq!(dump.word(0x1C).unwrap(), 0x4444_4444);
        assert!(dump.word(0x20).is_err());
    }

    #[test]
    fn test_binding_type_words() {
        assert_eq!(BindingType::from_word(0), Some(BindingType::Input));
        assert_eq!(BindingType::from_word(3), Some(BindingType::Constant));
        assert_eq!(BindingType::from_word(4), None);
    }
}
