//! Cryptographic primitives for container files

pub mod envelope;
pub mod keys;

// Re-export commonly used types
pub use envelope::{
    BLOCK_ALIGNMENT, ENVELOPE_OVERHEAD, EnvelopeError, IV_SIZE, MAC_SIZE, decode_block,
    encode_block,
};
pub use keys::{ContainerKey, KEY_SIZE, KeyError, KeySource, StaticKeySource};
