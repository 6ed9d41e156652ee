//! Block size selection for new container files.

use crate::crypto::envelope::ENVELOPE_OVERHEAD;

/// Smallest block size a container may use.
///
/// Header-A (32) + MAC (32) + IV (16) + the 8-byte logical size field, aligned
/// to the AES block size and rounded up to a power of two.
pub const MIN_BLOCK_SIZE: u32 = 128;

/// Largest block size the optimizer will choose.
pub const MAX_CHOSEN_BLOCK_SIZE: u32 = 65536;

/// A smaller block size must beat the current best by more than this much
/// waste (as a fraction of the payload) to replace it.
const WASTE_MARGIN: f64 = 0.01;

/// Pick the block size that wastes the least storage for a payload of
/// `estimated_size` bytes.
///
/// Candidates are powers of two from [`MAX_CHOSEN_BLOCK_SIZE`] down to
/// [`MIN_BLOCK_SIZE`]. Larger blocks win ties (within [`WASTE_MARGIN`]). An
/// estimate of zero means "unknown" and yields the minimum.
pub fn choose_block_size(estimated_size: u64) -> u32 {
    if estimated_size <= u64::from(MIN_BLOCK_SIZE) {
        return MIN_BLOCK_SIZE;
    }

    let mut candidate = MAX_CHOSEN_BLOCK_SIZE;
    let mut best = candidate;
    let mut best_waste: Option<f64> = None;

    while candidate >= MIN_BLOCK_SIZE {
        let waste = waste_ratio(estimated_size, candidate);
        if best_waste.is_none_or(|current| current - waste > WASTE_MARGIN) {
            best = candidate;
            best_waste = Some(waste);
        }
        candidate >>= 1;
    }

    best
}

/// Fraction of storage beyond the payload when storing `size` bytes in blocks
/// of `block_size`, counting the header block.
fn waste_ratio(size: u64, block_size: u32) -> f64 {
    let usable = u64::from(block_size) - ENVELOPE_OVERHEAD as u64;
    let blocks = u128::from(size.div_ceil(usable)) + 1;
    let stored = blocks * u128::from(block_size);
    (stored - u128::from(size)) as f64 / size as f64
}
