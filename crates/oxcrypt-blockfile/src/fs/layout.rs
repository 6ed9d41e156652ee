//! On-disk layout of a container file.
//!
//! # Layout
//!
//! | Offset                 | Size             | Description |
//! |------------------------|------------------|-------------|
//! | 0                      | 32               | Header-A: magic + block size (plaintext) |
//! | 32                     | block_size − 32  | Header-B: logical size + random padding (envelope) |
//! | block_size × (i + 1)   | block_size       | Data block `i` (envelope) |
//!
//! Header-A bytes 0..11 hold the ASCII magic `"CRYPTFILE0 "` and bytes 16..20
//! the big-endian block size; the rest is reserved and written as zeros.
//! Header-B's plaintext starts with the big-endian `u64` logical size. The two
//! header halves together occupy exactly one block.

use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::crypto::envelope::{
    BLOCK_ALIGNMENT, ENVELOPE_OVERHEAD, EnvelopeError, decode_block, encode_block,
};
use crate::crypto::keys::ContainerKey;

use super::block_size::MIN_BLOCK_SIZE;

/// Magic marker at the start of every container file
pub const MAGIC: &[u8; 11] = b"CRYPTFILE0 ";

/// Size of the plaintext Header-A (two AES blocks)
pub const HEADER_A_SIZE: usize = 32;

/// Largest block size accepted from a file header
pub const MAX_BLOCK_SIZE: u32 = 1 << 24;

/// Position of the big-endian block size inside Header-A
const BLOCK_SIZE_FIELD: std::ops::Range<usize> = 16..20;

/// Size of the big-endian logical size at the start of Header-B's plaintext
const LOGICAL_SIZE_FIELD: usize = 8;

// ============================================================================
// Error Types
// ============================================================================

/// Invalid block size for a container.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    #[error("block size {0} is smaller than the minimum {MIN_BLOCK_SIZE}")]
    TooSmall(u32),

    #[error("block size {0} is not a multiple of the AES block size {BLOCK_ALIGNMENT}")]
    Misaligned(u32),

    #[error("block size {0} exceeds the maximum {MAX_BLOCK_SIZE}")]
    TooLarge(u32),
}

/// Structural problem with Header-A.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("bad magic marker {found}")]
    BadMagic { found: String },

    #[error("invalid block size: {0}")]
    Geometry(#[from] GeometryError),
}

// ============================================================================
// Block Geometry
// ============================================================================

/// Block size of a container and the offsets derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    block_size: u32,
}

impl BlockGeometry {
    /// The smallest valid geometry.
    pub const MIN: Self = Self {
        block_size: MIN_BLOCK_SIZE,
    };

    /// Validate a block size: at least [`MIN_BLOCK_SIZE`], AES aligned, and at
    /// most [`MAX_BLOCK_SIZE`].
    pub fn new(block_size: u32) -> Result<Self, GeometryError> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(GeometryError::TooSmall(block_size));
        }
        if block_size as usize % BLOCK_ALIGNMENT != 0 {
            return Err(GeometryError::Misaligned(block_size));
        }
        if block_size > MAX_BLOCK_SIZE {
            return Err(GeometryError::TooLarge(block_size));
        }
        Ok(Self { block_size })
    }

    #[inline]
    pub fn block_size(self) -> u32 {
        self.block_size
    }

    /// Encoded block length in bytes.
    #[inline]
    pub fn block_len(self) -> usize {
        self.block_size as usize
    }

    /// Plaintext capacity of one data block.
    #[inline]
    pub fn plain_block_size(self) -> usize {
        self.block_len() - ENVELOPE_OVERHEAD
    }

    /// Encoded length of Header-B.
    #[inline]
    pub fn header_b_len(self) -> usize {
        self.block_len() - HEADER_A_SIZE
    }

    /// Plaintext length of Header-B (logical size field + padding).
    #[inline]
    pub fn header_b_plain_len(self) -> usize {
        self.plain_block_size() - HEADER_A_SIZE
    }

    /// Data block holding the plaintext byte at `position`.
    #[inline]
    pub fn block_index(self, position: u64) -> u64 {
        position / self.plain_block_size() as u64
    }

    /// Offset of `position` inside its data block.
    #[inline]
    pub fn offset_in_block(self, position: u64) -> usize {
        // Always < plain_block_size, which fits in usize
        #[allow(clippy::cast_possible_truncation)]
        let offset = (position % self.plain_block_size() as u64) as usize;
        offset
    }

    /// File offset of data block `index`, or `None` if it cannot be addressed.
    #[inline]
    pub fn block_offset(self, index: u64) -> Option<u64> {
        index
            .checked_add(1)?
            .checked_mul(u64::from(self.block_size))
    }
}

// ============================================================================
// Header encode / decode
// ============================================================================

/// Build the plaintext Header-A for `geometry`.
pub fn encode_header_a(geometry: BlockGeometry) -> [u8; HEADER_A_SIZE] {
    let mut header = [0u8; HEADER_A_SIZE];
    header[..MAGIC.len()].copy_from_slice(MAGIC);
    header[BLOCK_SIZE_FIELD].copy_from_slice(&geometry.block_size.to_be_bytes());
    header
}

/// Validate Header-A and extract the block geometry.
pub fn decode_header_a(header: &[u8; HEADER_A_SIZE]) -> Result<BlockGeometry, HeaderError> {
    if &header[..MAGIC.len()] != MAGIC {
        return Err(HeaderError::BadMagic {
            found: hex::encode(&header[..MAGIC.len()]),
        });
    }
    let mut field = [0u8; 4];
    field.copy_from_slice(&header[BLOCK_SIZE_FIELD]);
    Ok(BlockGeometry::new(u32::from_be_bytes(field))?)
}

/// Build the complete first block: Header-A followed by a freshly encoded
/// Header-B carrying `logical_size` and new random padding.
pub fn encode_header(
    geometry: BlockGeometry,
    logical_size: u64,
    key: &ContainerKey,
) -> Result<Vec<u8>, EnvelopeError> {
    let mut plain = zeroize::Zeroizing::new(vec![0u8; geometry.header_b_plain_len()]);
    plain[..LOGICAL_SIZE_FIELD].copy_from_slice(&logical_size.to_be_bytes());
    OsRng
        .try_fill_bytes(&mut plain[LOGICAL_SIZE_FIELD..])
        .map_err(|e| EnvelopeError::Entropy(e.to_string()))?;

    let header_b = encode_block(&plain, key)?;

    let mut header = Vec::with_capacity(geometry.block_len());
    header.extend_from_slice(&encode_header_a(geometry));
    header.extend_from_slice(&header_b);
    Ok(header)
}

/// Authenticate Header-B and return the logical size it records.
pub fn decode_header_b(header_b: &[u8], key: &ContainerKey) -> Result<u64, EnvelopeError> {
    let plain = decode_block(header_b, key)?;
    if plain.len() < LOGICAL_SIZE_FIELD {
        return Err(EnvelopeError::Authentication);
    }
    let mut field = [0u8; LOGICAL_SIZE_FIELD];
    field.copy_from_slice(&plain[..LOGICAL_SIZE_FIELD]);
    Ok(u64::from_be_bytes(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_validation() {
        assert_eq!(BlockGeometry::new(64), Err(GeometryError::TooSmall(64)));
        assert_eq!(BlockGeometry::new(136 + 1), Err(GeometryError::Misaligned(137)));
        assert_eq!(
            BlockGeometry::new(MAX_BLOCK_SIZE + 16),
            Err(GeometryError::TooLarge(MAX_BLOCK_SIZE + 16))
        );
        assert!(BlockGeometry::new(144).is_ok());
    }

    #[test]
    fn test_geometry_offsets() {
        let geometry = BlockGeometry::new(128).unwrap();
        assert_eq!(geometry.plain_block_size(), 80);
        assert_eq!(geometry.header_b_len(), 96);
        assert_eq!(geometry.header_b_plain_len(), 48);
        assert_eq!(geometry.block_index(79), 0);
        assert_eq!(geometry.block_index(80), 1);
        assert_eq!(geometry.offset_in_block(85), 5);
        assert_eq!(geometry.block_offset(0), Some(128));
        assert_eq!(geometry.block_offset(2), Some(384));
        assert_eq!(geometry.block_offset(u64::MAX), None);
    }

    #[test]
    fn test_header_a_bit_layout() {
        let geometry = BlockGeometry::new(4096).unwrap();
        let header = encode_header_a(geometry);
        assert_eq!(&header[..11], b"CRYPTFILE0 ");
        assert_eq!(&header[11..16], &[0u8; 5]);
        assert_eq!(&header[16..20], &[0x00, 0x00, 0x10, 0x00]);
        assert_eq!(&header[20..], &[0u8; 12]);
        assert_eq!(decode_header_a(&header), Ok(geometry));
    }

    #[test]
    fn test_header_a_bad_magic() {
        let mut header = encode_header_a(BlockGeometry::new(128).unwrap());
        header[0] = b'X';
        assert!(matches!(
            decode_header_a(&header),
            Err(HeaderError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_header_a_bad_block_size() {
        let mut header = encode_header_a(BlockGeometry::new(128).unwrap());
        header[16..20].copy_from_slice(&100u32.to_be_bytes());
        assert_eq!(
            decode_header_a(&header),
            Err(HeaderError::Geometry(GeometryError::TooSmall(100)))
        );
    }

    #[test]
    fn test_header_fills_one_block() {
        let key = ContainerKey::new([9u8; 32]);
        let geometry = BlockGeometry::new(256).unwrap();
        let header = encode_header(geometry, 12345, &key).unwrap();
        assert_eq!(header.len(), 256);
        assert_eq!(decode_header_b(&header[HEADER_A_SIZE..], &key).unwrap(), 12345);
    }

    #[test]
    fn test_header_padding_is_fresh() {
        let key = ContainerKey::new([9u8; 32]);
        let geometry = BlockGeometry::new(128).unwrap();
        let a = encode_header(geometry, 7, &key).unwrap();
        let b = encode_header(geometry, 7, &key).unwrap();
        assert_eq!(a[..HEADER_A_SIZE], b[..HEADER_A_SIZE]);
        assert_ne!(a[HEADER_A_SIZE..], b[HEADER_A_SIZE..]);
    }
}
