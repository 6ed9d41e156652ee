//! Configuration for opening or creating container files.

use super::block_size::choose_block_size;
use super::layout::{BlockGeometry, GeometryError};

/// Options controlling how a [`CryptFile`](super::CryptFile) creates its
/// backing file.
///
/// None of these affect an existing file: its block size always comes from
/// its header.
///
/// # Example
///
/// ```
/// use oxcrypt_blockfile::fs::CryptFileOptions;
///
/// let options = CryptFileOptions::new()
///     .estimated_size(24567)
///     .create_parent_dirs(false);
/// assert_eq!(options.fallback_block_size(), 1024);
/// ```
#[derive(Debug, Clone)]
pub struct CryptFileOptions {
    estimated_size: u64,
    block_size: Option<BlockGeometry>,
    create_parent_dirs: bool,
    dir_mode: u32,
    file_mode: u32,
}

impl Default for CryptFileOptions {
    fn default() -> Self {
        Self {
            estimated_size: 0,
            block_size: None,
            create_parent_dirs: true,
            dir_mode: 0o700,
            file_mode: 0o600,
        }
    }
}

impl CryptFileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expected plaintext size, used to pick the block size of a new file.
    /// Zero means unknown.
    #[must_use]
    pub fn estimated_size(mut self, estimated_size: u64) -> Self {
        self.estimated_size = estimated_size;
        self
    }

    /// Use an explicit block size for a new file instead of the estimate.
    pub fn block_size(mut self, block_size: u32) -> Result<Self, GeometryError> {
        self.block_size = Some(BlockGeometry::new(block_size)?);
        Ok(self)
    }

    /// Create missing parent directories when creating the file (default: true).
    #[must_use]
    pub fn create_parent_dirs(mut self, create: bool) -> Self {
        self.create_parent_dirs = create;
        self
    }

    /// Permission bits for created parent directories on Unix (default: `0o700`).
    #[must_use]
    pub fn dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    /// Permission bits for a created container file on Unix (default: `0o600`).
    #[must_use]
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Block size a newly created file will use.
    pub fn fallback_block_size(&self) -> u32 {
        self.fallback_geometry().block_size()
    }

    pub(crate) fn fallback_geometry(&self) -> BlockGeometry {
        match self.block_size {
            Some(geometry) => geometry,
            None => BlockGeometry::new(choose_block_size(self.estimated_size))
                .unwrap_or(BlockGeometry::MIN),
        }
    }

    pub(crate) fn creates_parent_dirs(&self) -> bool {
        self.create_parent_dirs
    }

    #[cfg_attr(not(unix), allow(dead_code))]
    pub(crate) fn modes(&self) -> (u32, u32) {
        (self.dir_mode, self.file_mode)
    }
}
