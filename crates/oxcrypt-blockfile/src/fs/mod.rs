//! Container files on disk

pub mod block_size;
pub mod container;
pub mod layout;
pub mod options;

// Re-export commonly used types
pub use block_size::{MAX_CHOSEN_BLOCK_SIZE, MIN_BLOCK_SIZE, choose_block_size};
pub use container::{BlockRef, ContainerContext, CryptFile, CryptFileError};
pub use layout::{
    BlockGeometry, GeometryError, HEADER_A_SIZE, HeaderError, MAGIC, MAX_BLOCK_SIZE,
    decode_header_a, decode_header_b, encode_header, encode_header_a,
};
pub use options::CryptFileOptions;
