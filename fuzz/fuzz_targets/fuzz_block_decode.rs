//! Fuzz target for block envelope decoding and Header-A parsing
//!
//! Arbitrary bytes must never panic and never authenticate under the fixed
//! key; a valid envelope with one flipped bit must be rejected.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use oxcrypt_blockfile::crypto::{ContainerKey, decode_block, encode_block};
use oxcrypt_blockfile::fs::{HEADER_A_SIZE, decode_header_a, decode_header_b};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    mode: FuzzMode,
    data: Vec<u8>,
}

#[derive(Arbitrary, Debug)]
enum FuzzMode {
    /// Decode raw bytes as an envelope
    BlockRaw,
    /// Parse raw bytes as a header
    Header,
    /// Encode aligned input, flip one bit, decode
    RoundtripCorrupt { bit: u16 },
}

fuzz_target!(|input: FuzzInput| {
    if input.data.len() > 1024 * 1024 {
        return;
    }

    let key = ContainerKey::new([0x42; 32]);

    match input.mode {
        FuzzMode::BlockRaw => {
            let _ = decode_block(&input.data, &key);
        }

        FuzzMode::Header => {
            if input.data.len() >= HEADER_A_SIZE {
                let mut header_a = [0u8; HEADER_A_SIZE];
                header_a.copy_from_slice(&input.data[..HEADER_A_SIZE]);
                let _ = decode_header_a(&header_a);
                let _ = decode_header_b(&input.data[HEADER_A_SIZE..], &key);
            }
        }

        FuzzMode::RoundtripCorrupt { bit } => {
            let aligned = input.data.len() / 16 * 16;
            let plain = &input.data[..aligned];
            let Ok(mut encoded) = encode_block(plain, &key) else {
                return;
            };

            let decoded = decode_block(&encoded, &key).expect("valid envelope must decode");
            assert_eq!(&decoded[..], plain, "roundtrip must preserve content");

            let bit = usize::from(bit) % (encoded.len() * 8);
            encoded[bit / 8] ^= 1 << (bit % 8);
            assert!(
                decode_block(&encoded, &key).is_err(),
                "corrupted envelope must not authenticate"
            );
        }
    }
});
