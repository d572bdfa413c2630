//! Binding-table extraction from CMM dumps.
//!
//! The inference table may start at any word column within a 16-byte line;
//! the extractor must yield the same four buffers in every alignment.

use ethosn_command_stream::cmm::{BindingTableEntry, BindingType, CmmDump};

fn check_expected_table(entries: &[BindingTableEntry]) {
    assert_eq!(
        entries,
        &[
            BindingTableEntry {
                id: 0,
                address: 0x6010_0000,
                size: 2560,
                kind: BindingType::Input,
            },
            BindingTableEntry {
                id: 1,
                address: 0x6010_0a00,
                size: 1488,
                kind: BindingType::Intermediate,
            },
            BindingTableEntry {
                id: 2,
                address: 0x6010_1000,
                size: 4096,
                kind: BindingType::Output,
            },
            BindingTableEntry {
                id: 3,
                address: 0x6010_2000,
                size: 4096,
                kind: BindingType::Constant,
            },
        ]
    );
}

#[test]
fn binding_table_word_column_1() {
    let snippet = "00003540: 00003554 00003554 00000000 00000000\n\
                   00003550: 00000000 00000000 00000000 00000000\n\
                   00003560: 00000000 00000000 00000000 00000000\n\
                   60000000: 60000010 00000001 00000000 00000000\n\
                   60000010: 00000004 60100000 00000000 00000a00\n\
                   60000020: 00000000 60100a00 00000000 000005d0\n\
                   60000030: 00000001 60101000 00000000 00001000\n\
                   60000040: 00000002 60102000 00000000 00001000\n\
                   60000050: 00000003 00000000 00000000 00000000\n";
    let dump = CmmDump::parse(snippet).unwrap();
    check_expected_table(&dump.extract_binding_table().unwrap());
}

#[test]
fn binding_table_word_column_2() {
    let snippet = "00003540: 00003554 00003554 00000000 00000000\n\
                   60000000: 60000014 00000001 00000000 00000000\n\
                   60000010: 00000000 00000004 60100000 00000000\n\
                   60000020: 00000a00 00000000 60100a00 00000000\n\
                   60000030: 000005d0 00000001 60101000 00000000\n\
                   60000040: 00001000 00000002 60102000 00000000\n\
                   60000050: 00001000 00000003 00000000 00000000\n";
    let dump = CmmDump::parse(snippet).unwrap();
    check_expected_table(&dump.extract_binding_table().unwrap());
}

#[test]
fn binding_table_word_column_3() {
    let snippet = "60000000: 60000018 00000001 00000000 00000000\n\
                   60000010: 00000000 00000000 00000004 60100000\n\
                   60000020: 00000000 00000a00 00000000 60100a00\n\
                   60000030: 00000000 000005d0 00000001 60101000\n\
                   60000040: 00000000 00001000 00000002 60102000\n\
                   60000050: 00000000 00001000 00000003 00000000\n";
    let dump = CmmDump::parse(snippet).unwrap();
    check_expected_table(&dump.extract_binding_table().unwrap());
}

#[test]
fn binding_table_word_column_4() {
    let snippet = "60000000: 6000001C 00000001 00000000 00000000\n\
                   60000010: 00000000 00000000 00000000 00000004\n\
                   60000020: 60100000 00000000 00000a00 00000000\n\
                   60000030: 60100a00 00000000 000005d0 00000001\n\
                   60000040: 60101000 00000000 00001000 00000002\n\
                   60000050: 60102000 00000000 00001000 00000003\n";
    let dump = CmmDump::parse(snippet).unwrap();
    check_expected_table(&dump.extract_binding_table().unwrap());
}

#[test]
fn command_stream_extraction_follows_first_buffer() {
    // One buffer whose contents are a recognisable byte pattern.
    let snippet = "60000000: 60000010 00000001 00000000 00000000\n\
                   60000010: 00000001 60001000 00000000 0000000c\n\
                   60001000: 03020100 07060504 0b0a0908 00000000\n";
    let dump = CmmDump::parse(snippet).unwrap();
    let bytes = dump.extract_command_stream().unwrap();
    assert_eq!(bytes, (0u8..12).collect::<Vec<_>>());
}

#[test]
fn missing_inference_pointer_is_an_error() {
    let dump = CmmDump::parse("00000000: 00000000 00000000 00000000 00000000\n").unwrap();
    assert!(dump.extract_binding_table().is_err());
}
