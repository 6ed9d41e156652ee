//! Encrypted random-access container files.
//!
//! A [`CryptFile`] behaves like a plaintext, seekable byte stream while the
//! file on disk only ever holds authenticated-encrypted blocks (see
//! [`layout`](super::layout) for the format). At most one decrypted block is
//! cached at a time; it is written back when the cursor leaves it, on
//! [`flush`](CryptFile::flush) and on [`close`](CryptFile::close).
//!
//! # Failure model
//!
//! Wrong keys, tampered blocks and malformed headers are reported without
//! touching the file, so the handle stays usable (for example to retry with
//! another key). I/O failures that may have left the file or the cache in an
//! unknown state *poison* the handle: the file is released and every later
//! operation fails with [`CryptFileError::UnusableHandle`].
//!
//! # Example
//!
//! ```no_run
//! use std::io::{Read, SeekFrom};
//! use oxcrypt_blockfile::crypto::ContainerKey;
//! use oxcrypt_blockfile::fs::CryptFile;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = ContainerKey::random()?;
//! let mut file = CryptFile::new("/tmp/secret.bin", key, 0);
//!
//! file.write(b"Hello, container!")?;
//! file.seek(SeekFrom::Start(7))?;
//!
//! let mut rest = String::new();
//! file.read_to_string(&mut rest)?;
//! assert_eq!(rest, "container!");
//!
//! file.close()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::crypto::envelope::{EnvelopeError, decode_block, encode_block};
use crate::crypto::keys::{ContainerKey, KeyError, KeySource};

use super::layout::{
    BlockGeometry, HEADER_A_SIZE, decode_header_a, decode_header_b, encode_header,
};
use super::options::CryptFileOptions;

// ============================================================================
// Error Types
// ============================================================================

/// Which encrypted unit of a container an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    /// The two-part header occupying the first block.
    Header,
    /// Data block with the given index.
    Data(u64),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Header => write!(f, "header block"),
            BlockRef::Data(index) => write!(f, "block {index}"),
        }
    }
}

/// Context for container operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct ContainerContext {
    /// Path to the container file
    pub path: Option<PathBuf>,
    /// Block being processed
    pub block: Option<BlockRef>,
    /// Operation being performed
    pub operation: Option<&'static str>,
}

impl ContainerContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: BlockRef) -> Self {
        self.block = Some(block);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl fmt::Display for ContainerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(op) = self.operation {
            parts.push(op.to_string());
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at {:?}", path.display()));
        }
        if let Some(block) = self.block {
            parts.push(block.to_string());
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Errors that can occur while operating on a container file.
#[derive(Error, Debug)]
pub enum CryptFileError {
    /// Block data was not a multiple of the AES block size
    #[error("Misaligned block data for {context}: {len} bytes is not a multiple of the AES block size")]
    MisalignedInput {
        len: usize,
        context: ContainerContext,
    },

    /// A block or the header failed HMAC verification.
    ///
    /// **[INTEGRITY VIOLATION]** Wrong key, tampering and truncation are
    /// indistinguishable. No plaintext is returned.
    #[error("Authentication failed for {context}: wrong key or corrupted data")]
    Authentication { context: ContainerContext },

    /// Header-A has a bad magic marker or block size, or the file is too short
    /// to hold both header halves.
    ///
    /// Truncation inside the header block is structural and reported here;
    /// a truncated or missing data block is [`Authentication`](Self::Authentication).
    #[error("Corrupt header for {context}: {reason}")]
    CorruptHeader {
        reason: String,
        context: ContainerContext,
    },

    /// A seek resolved to a negative or unaddressable position
    #[error("Invalid seek for {context}: {reason}")]
    InvalidSeek {
        reason: String,
        context: ContainerContext,
    },

    /// The handle was poisoned by an earlier I/O failure
    #[error("Container is in an unusable state: {context}")]
    UnusableHandle { context: ContainerContext },

    /// The container file does not exist
    #[error("Container does not exist: {context}")]
    NotFound { context: ContainerContext },

    /// The OS random source failed while producing an IV or filler
    #[error("Random source unavailable for {context}: {reason}")]
    Entropy {
        reason: String,
        context: ContainerContext,
    },

    /// IO error on the underlying file
    #[error("IO error during {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: ContainerContext,
    },
}

impl CryptFileError {
    /// Create an IO error with context
    #[must_use]
    pub fn io_with_context(source: io::Error, context: ContainerContext) -> Self {
        CryptFileError::Io { source, context }
    }

    fn from_envelope(err: EnvelopeError, context: ContainerContext) -> Self {
        match err {
            EnvelopeError::MisalignedInput { len } => {
                CryptFileError::MisalignedInput { len, context }
            }
            EnvelopeError::Authentication => {
                warn!(%context, "Authentication failed");
                CryptFileError::Authentication { context }
            }
            EnvelopeError::Entropy(reason) => CryptFileError::Entropy { reason, context },
        }
    }

    /// The context attached to this error.
    pub fn context(&self) -> &ContainerContext {
        match self {
            CryptFileError::MisalignedInput { context, .. }
            | CryptFileError::Authentication { context }
            | CryptFileError::CorruptHeader { context, .. }
            | CryptFileError::InvalidSeek { context, .. }
            | CryptFileError::UnusableHandle { context }
            | CryptFileError::NotFound { context }
            | CryptFileError::Entropy { context, .. }
            | CryptFileError::Io { context, .. } => context,
        }
    }
}

impl From<CryptFileError> for io::Error {
    fn from(err: CryptFileError) -> Self {
        let kind = match &err {
            CryptFileError::NotFound { .. } => io::ErrorKind::NotFound,
            CryptFileError::Authentication { .. }
            | CryptFileError::CorruptHeader { .. }
            | CryptFileError::MisalignedInput { .. } => io::ErrorKind::InvalidData,
            CryptFileError::InvalidSeek { .. } => io::ErrorKind::InvalidInput,
            CryptFileError::Io { source, .. } => source.kind(),
            CryptFileError::UnusableHandle { .. } | CryptFileError::Entropy { .. } => {
                io::ErrorKind::Other
            }
        };
        io::Error::new(kind, err)
    }
}

/// A failed step, and whether it left the handle in an unknown state.
#[derive(Debug)]
struct Fault {
    error: CryptFileError,
    poisons: bool,
}

impl Fault {
    fn poisoning(error: CryptFileError) -> Self {
        Self {
            error,
            poisons: true,
        }
    }
}

impl From<CryptFileError> for Fault {
    fn from(error: CryptFileError) -> Self {
        Self {
            error,
            poisons: false,
        }
    }
}

type StepResult<T> = Result<T, Fault>;

fn context(path: &Path, operation: &'static str) -> ContainerContext {
    ContainerContext::new()
        .with_path(path)
        .with_operation(operation)
}

// ============================================================================
// Raw positioned I/O
// ============================================================================

/// Fill as much of `buf` as the file holds at `offset`. Returns the byte count;
/// anything short of `buf.len()` means end of file.
fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_at(file: &mut File, offset: u64, buf: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

// ============================================================================
// Open container state
// ============================================================================

/// The single cached plaintext block.
struct CachedBlock {
    index: u64,
    plain: Zeroizing<Vec<u8>>,
    dirty: bool,
}

impl fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedBlock")
            .field("index", &self.index)
            .field("plain", &"[REDACTED]")
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Everything that exists only while the backing file is open.
#[derive(Debug)]
struct OpenContainer {
    file: File,
    path: PathBuf,
    geometry: BlockGeometry,
    logical_size: u64,
    position: u64,
    cache: Option<CachedBlock>,
    header_dirty: bool,
}

impl OpenContainer {
    /// Open an existing container and validate its header.
    ///
    /// Returns `Ok(None)` if the file does not exist. Nothing here poisons: the
    /// file has not been modified.
    #[instrument(level = "debug", skip(key), fields(path = %path.display()))]
    fn open(path: &Path, key: &ContainerKey) -> StepResult<Option<Self>> {
        let ctx = context(path, "open");

        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CryptFileError::io_with_context(e, ctx).into()),
        };

        let ctx = ctx.with_block(BlockRef::Header);

        let mut header_a = [0u8; HEADER_A_SIZE];
        let read = read_at(&mut file, 0, &mut header_a)
            .map_err(|e| CryptFileError::io_with_context(e, ctx.clone()))?;
        if read < HEADER_A_SIZE {
            warn!(actual_size = read, "File too small for a container header");
            return Err(CryptFileError::CorruptHeader {
                reason: format!("expected at least {HEADER_A_SIZE} bytes, got {read}"),
                context: ctx,
            }
            .into());
        }

        let geometry = decode_header_a(&header_a).map_err(|e| {
            warn!(error = %e, "Invalid plaintext header");
            CryptFileError::CorruptHeader {
                reason: e.to_string(),
                context: ctx.clone(),
            }
        })?;

        let mut header_b = vec![0u8; geometry.header_b_len()];
        let read = read_at(&mut file, HEADER_A_SIZE as u64, &mut header_b)
            .map_err(|e| CryptFileError::io_with_context(e, ctx.clone()))?;
        if read < header_b.len() {
            warn!(actual_size = read, expected_size = header_b.len(), "Truncated encrypted header");
            return Err(CryptFileError::CorruptHeader {
                reason: format!(
                    "encrypted header truncated: expected {} bytes, got {read}",
                    header_b.len()
                ),
                context: ctx,
            }
            .into());
        }

        let logical_size = decode_header_b(&header_b, key)
            .map_err(|e| CryptFileError::from_envelope(e, ctx))?;

        debug!(
            block_size = geometry.block_size(),
            logical_size, "Container opened"
        );

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            logical_size,
            position: 0,
            cache: None,
            header_dirty: false,
        }))
    }

    /// Create a new, empty container file. Every failure poisons: a parent
    /// directory may already have been created.
    #[instrument(level = "debug", skip(options), fields(path = %path.display(), block_size = geometry.block_size()))]
    fn create(
        path: &Path,
        geometry: BlockGeometry,
        options: &CryptFileOptions,
    ) -> StepResult<Self> {
        let ctx = context(path, "create");

        if options.creates_parent_dirs()
            && let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
            && !parent.exists()
        {
            debug!(dir = %parent.display(), "Creating parent directories");
            create_dirs(parent, options)
                .map_err(|e| Fault::poisoning(CryptFileError::io_with_context(e, ctx.clone())))?;
        }

        let file = create_file(path, options)
            .map_err(|e| Fault::poisoning(CryptFileError::io_with_context(e, ctx)))?;

        debug!("Container created");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            logical_size: 0,
            position: 0,
            cache: None,
            header_dirty: true,
        })
    }

    fn is_dirty(&self) -> bool {
        self.header_dirty || self.cache.as_ref().is_some_and(|cached| cached.dirty)
    }

    // ------------------------------------------------------------------------
    // Block cache
    // ------------------------------------------------------------------------

    /// Read and authenticate data block `index`. `Ok(None)` means the block
    /// does not exist on disk yet.
    fn read_block(
        &mut self,
        index: u64,
        key: &ContainerKey,
    ) -> StepResult<Option<Zeroizing<Vec<u8>>>> {
        let ctx = context(&self.path, "read_block").with_block(BlockRef::Data(index));
        let offset = self.block_offset(index, &ctx)?;

        let mut encoded = vec![0u8; self.geometry.block_len()];
        let read = read_at(&mut self.file, offset, &mut encoded)
            .map_err(|e| Fault::poisoning(CryptFileError::io_with_context(e, ctx.clone())))?;

        if read == 0 {
            trace!(block = index, "Block not present on disk");
            return Ok(None);
        }
        if read < encoded.len() {
            warn!(block = index, actual_size = read, "Truncated block");
            return Err(CryptFileError::Authentication { context: ctx }.into());
        }

        let plain =
            decode_block(&encoded, key).map_err(|e| CryptFileError::from_envelope(e, ctx))?;
        trace!(block = index, "Block loaded");
        Ok(Some(plain))
    }

    /// Encrypt and write `block` back if it is dirty.
    fn write_block(&mut self, block: &mut CachedBlock, key: &ContainerKey) -> StepResult<()> {
        if !block.dirty {
            return Ok(());
        }

        let ctx = context(&self.path, "write_block").with_block(BlockRef::Data(block.index));
        let offset = self.block_offset(block.index, &ctx)?;

        let encoded = encode_block(&block.plain, key)
            .map_err(|e| Fault::poisoning(CryptFileError::from_envelope(e, ctx.clone())))?;
        write_at(&mut self.file, offset, &encoded)
            .map_err(|e| Fault::poisoning(CryptFileError::io_with_context(e, ctx)))?;

        block.dirty = false;
        trace!(block = block.index, "Block flushed");
        Ok(())
    }

    /// A fresh block for a position past the end of the file, filled with
    /// random bytes so unwritten regions look like any other ciphertext.
    fn random_block(&self, index: u64) -> StepResult<Zeroizing<Vec<u8>>> {
        let mut plain = Zeroizing::new(vec![0u8; self.geometry.plain_block_size()]);
        OsRng.try_fill_bytes(&mut plain[..]).map_err(|e| {
            Fault::poisoning(CryptFileError::Entropy {
                reason: e.to_string(),
                context: context(&self.path, "random_block").with_block(BlockRef::Data(index)),
            })
        })?;
        trace!(block = index, "Synthesized new block");
        Ok(plain)
    }

    /// Make the cache hold the block containing `position`, flushing whatever
    /// it held before.
    ///
    /// With `synthesize_missing`, a block that does not exist on disk yet is
    /// created in memory; otherwise its absence means the file is truncated.
    fn load_current_block(
        &mut self,
        key: &ContainerKey,
        synthesize_missing: bool,
    ) -> StepResult<&mut CachedBlock> {
        let index = self.geometry.block_index(self.position);

        let block = match self.cache.take() {
            Some(cached) if cached.index == index => cached,
            stale => {
                if let Some(mut stale) = stale {
                    self.write_block(&mut stale, key)?;
                }
                let plain = match self.read_block(index, key)? {
                    Some(plain) => plain,
                    None if synthesize_missing => self.random_block(index)?,
                    None => {
                        warn!(block = index, "Block inside logical size is missing");
                        return Err(CryptFileError::Authentication {
                            context: context(&self.path, "read_block")
                                .with_block(BlockRef::Data(index)),
                        }
                        .into());
                    }
                };
                CachedBlock {
                    index,
                    plain,
                    dirty: false,
                }
            }
        };

        Ok(self.cache.insert(block))
    }

    /// Flush and drop the cached block.
    fn evict(&mut self, key: &ContainerKey) -> StepResult<()> {
        if let Some(mut cached) = self.cache.take() {
            self.write_block(&mut cached, key)?;
        }
        Ok(())
    }

    fn block_offset(&self, index: u64, ctx: &ContainerContext) -> StepResult<u64> {
        self.geometry.block_offset(index).ok_or_else(|| {
            CryptFileError::InvalidSeek {
                reason: format!("block {index} is beyond the addressable file size"),
                context: ctx.clone(),
            }
            .into()
        })
    }

    // ------------------------------------------------------------------------
    // Stream operations
    // ------------------------------------------------------------------------

    fn read(&mut self, buf: &mut [u8], key: &ContainerKey) -> StepResult<usize> {
        if buf.is_empty() || self.position >= self.logical_size {
            return Ok(0);
        }

        let plain_block_size = self.geometry.plain_block_size();
        let offset = self.geometry.offset_in_block(self.position);
        let remaining = usize::try_from(self.logical_size - self.position).unwrap_or(usize::MAX);
        let count = buf.len().min(plain_block_size - offset).min(remaining);

        let cached = self.load_current_block(key, false)?;
        buf[..count].copy_from_slice(&cached.plain[offset..offset + count]);

        self.position += count as u64;
        if offset + count == plain_block_size {
            self.evict(key)?;
        }

        trace!(count, position = self.position, "Read");
        Ok(count)
    }

    fn write(&mut self, data: &[u8], key: &ContainerKey) -> StepResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.check_addressable(data.len())?;
        if self.position > self.logical_size {
            self.fill_gap(key)?;
        }
        self.write_bytes(data, key)
    }

    /// Reject a write of `len` bytes at `position` whose last block could not
    /// be stored, before any gap is filled.
    fn check_addressable(&self, len: usize) -> StepResult<()> {
        let last_block = self
            .position
            .checked_add(len as u64 - 1)
            .map(|last| self.geometry.block_index(last));
        if last_block.and_then(|index| self.geometry.block_offset(index)).is_none() {
            return Err(CryptFileError::InvalidSeek {
                reason: format!(
                    "writing {len} bytes at position {} exceeds the addressable file size",
                    self.position
                ),
                context: context(&self.path, "write"),
            }
            .into());
        }
        Ok(())
    }

    /// Zero-fill `[logical_size, position)` so a write after seeking past the
    /// end leaves no hole of filler bytes inside the logical size.
    fn fill_gap(&mut self, key: &ContainerKey) -> StepResult<()> {
        let target = self.position;
        debug!(from = self.logical_size, to = target, "Zero-filling gap");

        self.reposition(self.logical_size, key)?;
        let zeros = vec![0u8; self.geometry.plain_block_size()];
        while self.position < target {
            let gap = usize::try_from(target - self.position).unwrap_or(usize::MAX);
            self.write_bytes(&zeros[..gap.min(zeros.len())], key)?;
        }
        Ok(())
    }

    /// Copy `data` into the stream at `position`, block by block.
    ///
    /// A non-poisoning failure after some bytes were accepted returns the
    /// accepted count; the same failure recurs on the next call.
    fn write_bytes(&mut self, data: &[u8], key: &ContainerKey) -> StepResult<usize> {
        let plain_block_size = self.geometry.plain_block_size();
        let mut written = 0;

        while written < data.len() {
            let offset = self.geometry.offset_in_block(self.position);
            let count = (plain_block_size - offset).min(data.len() - written);

            let cached = match self.load_current_block(key, true) {
                Ok(cached) => cached,
                Err(fault) if written > 0 && !fault.poisons => {
                    debug!(written, error = %fault.error, "Short write");
                    return Ok(written);
                }
                Err(fault) => return Err(fault),
            };
            cached.plain[offset..offset + count].copy_from_slice(&data[written..written + count]);
            cached.dirty = true;

            self.position += count as u64;
            written += count;
            if self.position > self.logical_size {
                self.logical_size = self.position;
                self.header_dirty = true;
            }

            if offset + count == plain_block_size {
                self.evict(key)?;
            }
        }

        trace!(written, position = self.position, "Wrote");
        Ok(written)
    }

    fn write_as_opaque_empty(&mut self, key: &ContainerKey) -> StepResult<()> {
        self.reposition(0, key)?;
        self.write_bytes(&[0], key)?;
        // Block 0 stays cached, so resetting the cursor keeps the cache valid
        self.position = 0;
        self.logical_size = 0;
        self.header_dirty = true;
        Ok(())
    }

    /// Move the cursor, evicting the cached block if the target lies in
    /// another block. Never loads the target block.
    fn reposition(&mut self, position: u64, key: &ContainerKey) -> StepResult<()> {
        let target_block = self.geometry.block_index(position);
        if self
            .cache
            .as_ref()
            .is_some_and(|cached| cached.index != target_block)
        {
            self.evict(key)?;
        }
        self.position = position;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom, key: &ContainerKey) -> StepResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.logical_size.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(CryptFileError::InvalidSeek {
                reason: format!(
                    "{pos:?} from position {} with size {} leaves the valid range",
                    self.position, self.logical_size
                ),
                context: context(&self.path, "seek"),
            }
            .into());
        };

        self.reposition(target, key)?;
        trace!(position = target, "Seek");
        Ok(target)
    }

    /// Persist the dirty block and a dirty header without releasing the file.
    fn persist(&mut self, key: &ContainerKey) -> StepResult<()> {
        if let Some(mut cached) = self.cache.take() {
            let flushed = self.write_block(&mut cached, key);
            self.cache = Some(cached);
            flushed?;
        }
        if self.header_dirty {
            self.write_header(key)?;
        }
        Ok(())
    }

    fn write_header(&mut self, key: &ContainerKey) -> StepResult<()> {
        let ctx = context(&self.path, "write_header").with_block(BlockRef::Header);

        let header = encode_header(self.geometry, self.logical_size, key)
            .map_err(|e| Fault::poisoning(CryptFileError::from_envelope(e, ctx.clone())))?;
        write_at(&mut self.file, 0, &header)
            .map_err(|e| Fault::poisoning(CryptFileError::io_with_context(e, ctx)))?;

        self.header_dirty = false;
        debug!(logical_size = self.logical_size, "Header persisted");
        Ok(())
    }
}

fn create_dirs(dir: &Path, options: &CryptFileOptions) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(options.modes().0);
    }
    #[cfg(not(unix))]
    let _ = options;
    builder.create(dir)
}

fn create_file(path: &Path, options: &CryptFileOptions) -> io::Result<File> {
    let mut open = OpenOptions::new();
    open.read(true).write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open.mode(options.modes().1);
    }
    #[cfg(not(unix))]
    let _ = options;
    open.open(path)
}

// ============================================================================
// CryptFile
// ============================================================================

#[derive(Debug)]
enum HandleState {
    /// No file held; the next operation opens (or creates) it.
    Unopened,
    Open(OpenContainer),
    /// Terminal: an I/O failure left the file in an unknown state.
    Poisoned,
}

/// Whether an operation may create a missing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Existing,
    CreateIfMissing,
}

/// An encrypted, authenticated, random-access container file.
///
/// Construction does no I/O. The first [`read`](Self::read),
/// [`seek`](Self::seek) or [`size`](Self::size) opens the file; the first
/// [`write`](Self::write) opens or creates it. The handle also implements
/// [`std::io::Read`], [`Write`](std::io::Write) and [`Seek`](std::io::Seek).
pub struct CryptFile {
    path: PathBuf,
    key: ContainerKey,
    options: CryptFileOptions,
    fallback: BlockGeometry,
    state: HandleState,
}

impl fmt::Debug for CryptFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptFile")
            .field("path", &self.path)
            .field("key", &"[REDACTED]")
            .field("fallback_block_size", &self.fallback.block_size())
            .field("state", &self.state)
            .finish()
    }
}

impl CryptFile {
    /// Handle for the container at `path`. `estimated_size` is a hint for the
    /// block size of a newly created file; 0 means unknown.
    pub fn new(path: impl Into<PathBuf>, key: ContainerKey, estimated_size: u64) -> Self {
        Self::with_options(
            path,
            key,
            CryptFileOptions::new().estimated_size(estimated_size),
        )
    }

    pub fn with_options(
        path: impl Into<PathBuf>,
        key: ContainerKey,
        options: CryptFileOptions,
    ) -> Self {
        let fallback = options.fallback_geometry();
        Self {
            path: path.into(),
            key,
            options,
            fallback,
            state: HandleState::Unopened,
        }
    }

    /// Handle whose key comes from a [`KeySource`].
    pub fn from_key_source(
        path: impl Into<PathBuf>,
        source: &dyn KeySource,
        options: CryptFileOptions,
    ) -> Result<Self, KeyError> {
        Ok(Self::with_options(path, source.fetch_key()?, options))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block size used if the file has to be created.
    pub fn fallback_block_size(&self) -> u32 {
        self.fallback.block_size()
    }

    /// Block size of the open file, if any.
    pub fn block_size(&self) -> Option<u32> {
        match &self.state {
            HandleState::Open(container) => Some(container.geometry.block_size()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(self.state, HandleState::Poisoned)
    }

    /// Logical (plaintext) size of the container.
    ///
    /// Fails with [`CryptFileError::NotFound`] if the file does not exist.
    pub fn size(&mut self) -> Result<u64, CryptFileError> {
        self.run(Access::Existing, "size", |container, _| {
            Ok(container.logical_size)
        })
    }

    /// Read from the current position. Returns 0 at the end of the stream.
    ///
    /// A single call returns at most the rest of the current block.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, CryptFileError> {
        self.run(Access::Existing, "read", |container, key| {
            container.read(buf, key)
        })
    }

    /// Write at the current position, creating the file if needed.
    ///
    /// Writing past the logical size extends it; a gap left by seeking past the
    /// end reads back as zeros.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, CryptFileError> {
        self.run(Access::CreateIfMissing, "write", |container, key| {
            container.write(buf, key)
        })
    }

    /// Make the container logically empty while keeping one data block on
    /// disk, so an observer without the key cannot tell it apart from a small
    /// non-empty container.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn write_as_opaque_empty(&mut self) -> Result<(), CryptFileError> {
        self.run(Access::CreateIfMissing, "write_as_opaque_empty", |container, key| {
            container.write_as_opaque_empty(key)
        })
    }

    /// Move the cursor. Seeking past the end is allowed; seeking before the
    /// start fails with [`CryptFileError::InvalidSeek`].
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, CryptFileError> {
        self.run(Access::Existing, "seek", |container, key| {
            container.seek(pos, key)
        })
    }

    /// Write back the cached block and header without closing. Does nothing if
    /// the file is not open.
    pub fn flush(&mut self) -> Result<(), CryptFileError> {
        if matches!(self.state, HandleState::Unopened) {
            return Ok(());
        }
        self.run(Access::Existing, "flush", |container, key| {
            container.persist(key)
        })
    }

    /// Persist pending changes, release the file, and reset the handle so it
    /// can be used again.
    ///
    /// The file is released even if persisting fails; the first failure is
    /// returned. Closing an unopened handle is a no-op.
    ///
    /// Closing a poisoned handle fails with [`CryptFileError::UnusableHandle`]
    /// and leaves it poisoned; build a new `CryptFile` to access the path again.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn close(&mut self) -> Result<(), CryptFileError> {
        match std::mem::replace(&mut self.state, HandleState::Unopened) {
            HandleState::Unopened => Ok(()),
            HandleState::Poisoned => {
                self.state = HandleState::Poisoned;
                Err(self.unusable("close"))
            }
            HandleState::Open(mut container) => {
                let result = container.persist(&self.key).and_then(|()| {
                    container.file.sync_all().map_err(|e| {
                        Fault::poisoning(CryptFileError::io_with_context(
                            e,
                            context(&self.path, "close"),
                        ))
                    })
                });
                drop(container);
                match result {
                    Ok(()) => {
                        debug!("Container closed");
                        Ok(())
                    }
                    Err(fault) => {
                        warn!(error = %fault.error, "Container released after failed close");
                        Err(fault.error)
                    }
                }
            }
        }
    }

    fn unusable(&self, operation: &'static str) -> CryptFileError {
        CryptFileError::UnusableHandle {
            context: context(&self.path, operation),
        }
    }

    /// Run `step` against the open container, opening or creating it first,
    /// and poison the handle if the step says so.
    fn run<T>(
        &mut self,
        access: Access,
        operation: &'static str,
        step: impl FnOnce(&mut OpenContainer, &ContainerKey) -> StepResult<T>,
    ) -> Result<T, CryptFileError> {
        let outcome = Self::ensure_open(
            &mut self.state,
            &self.path,
            &self.key,
            self.fallback,
            &self.options,
            access,
            operation,
        )
        .and_then(|container| step(container, &self.key));

        outcome.map_err(|fault| {
            if fault.poisons {
                warn!(
                    path = %self.path.display(),
                    operation,
                    error = %fault.error,
                    "Container poisoned"
                );
                self.state = HandleState::Poisoned;
            }
            fault.error
        })
    }

    /// The lazy open/create transition.
    fn ensure_open<'a>(
        state: &'a mut HandleState,
        path: &Path,
        key: &ContainerKey,
        fallback: BlockGeometry,
        options: &CryptFileOptions,
        access: Access,
        operation: &'static str,
    ) -> StepResult<&'a mut OpenContainer> {
        if let HandleState::Unopened = state {
            let container = match OpenContainer::open(path, key)? {
                Some(container) => container,
                None if access == Access::CreateIfMissing => {
                    OpenContainer::create(path, fallback, options)?
                }
                None => {
                    return Err(CryptFileError::NotFound {
                        context: context(path, operation),
                    }
                    .into());
                }
            };
            *state = HandleState::Open(container);
        }

        match state {
            HandleState::Open(container) => Ok(container),
            _ => Err(CryptFileError::UnusableHandle {
                context: context(path, operation),
            }
            .into()),
        }
    }
}

impl Drop for CryptFile {
    fn drop(&mut self) {
        let dirty = matches!(&self.state, HandleState::Open(container) if container.is_dirty());
        if dirty && let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist container on drop");
        }
    }
}

impl Read for CryptFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        CryptFile::read(self, buf).map_err(io::Error::from)
    }
}

impl Write for CryptFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        CryptFile::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        CryptFile::flush(self).map_err(io::Error::from)
    }
}

impl Seek for CryptFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        CryptFile::seek(self, pos).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_key() -> ContainerKey {
        ContainerKey::from_slice(b"0123456789abcdef0123456789abcdef").unwrap()
    }

    fn assert_unusable<T: fmt::Debug>(result: Result<T, CryptFileError>) {
        assert!(
            matches!(result, Err(CryptFileError::UnusableHandle { .. })),
            "expected UnusableHandle, got {result:?}"
        );
    }

    #[test]
    fn test_context_display() {
        assert_eq!(ContainerContext::new().to_string(), "(no context)");

        let ctx = ContainerContext::new()
            .with_operation("read_block")
            .with_path("/vault/a.bin")
            .with_block(BlockRef::Data(3));
        let display = ctx.to_string();
        assert!(display.contains("read_block"), "{display}");
        assert!(display.contains("/vault/a.bin"), "{display}");
        assert!(display.contains("block 3"), "{display}");

        let header = ContainerContext::new().with_block(BlockRef::Header);
        assert_eq!(header.to_string(), "header block");
    }

    #[test]
    fn test_construction_does_no_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("container");
        let file = CryptFile::new(&path, test_key(), 0);
        assert!(!file.is_open());
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_poisoned_handle_rejects_everything_without_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("container");
        let mut file = CryptFile::new(&path, test_key(), 0);
        file.state = HandleState::Poisoned;

        let mut buf = [0u8; 16];
        assert_unusable(file.read(&mut buf));
        assert_unusable(file.write(b"data"));
        assert_unusable(file.seek(SeekFrom::Start(0)));
        assert_unusable(file.size());
        assert_unusable(file.flush());
        assert_unusable(file.write_as_opaque_empty());
        assert_unusable(file.close());

        assert!(file.is_poisoned());
        assert!(!path.exists(), "poisoned handle must not create the file");
    }

    #[test]
    fn test_poisoning_releases_open_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("container");
        let mut file = CryptFile::new(&path, test_key(), 0);
        file.write(b"some bytes").unwrap();
        assert!(file.is_open());

        file.state = HandleState::Poisoned;
        assert!(!file.is_open());
        assert_unusable(file.size());
        assert_unusable(file.close());
        assert!(file.is_poisoned());
    }

    fn open_container(file: &mut CryptFile) -> &mut OpenContainer {
        match &mut file.state {
            HandleState::Open(container) => container,
            other => panic!("expected open state, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_block_write_poisons() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("container");
        let mut file = CryptFile::new(&path, test_key(), 0);
        file.write(&[5u8; 100]).unwrap();

        // Block 1 is dirty in the cache; a read-only descriptor makes its flush fail
        open_container(&mut file).file = File::open(&path).unwrap();

        let err = file.flush().unwrap_err();
        assert!(matches!(err, CryptFileError::Io { .. }), "{err:?}");
        assert_eq!(err.context().block, Some(BlockRef::Data(1)));
        assert!(file.is_poisoned());
        assert!(!file.is_open());

        let mut buf = [0u8; 8];
        assert_unusable(file.read(&mut buf));
        assert_unusable(file.seek(SeekFrom::Start(0)));
        assert_unusable(file.size());
        assert_unusable(file.write(b"more"));
        assert_unusable(file.close());
        assert!(file.is_poisoned());
    }

    #[test]
    fn test_failed_block_read_poisons() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("container");
        let mut file = CryptFile::new(&path, test_key(), 0);
        file.write(&[5u8; 200]).unwrap();
        file.close().unwrap();

        file.seek(SeekFrom::Start(0)).unwrap();
        open_container(&mut file).file = OpenOptions::new().write(true).open(&path).unwrap();

        let mut buf = [0u8; 8];
        let err = file.read(&mut buf).unwrap_err();
        assert!(matches!(err, CryptFileError::Io { .. }), "{err:?}");
        assert!(file.is_poisoned());
        assert_unusable(file.size());
        assert_unusable(file.close());
    }

    #[test]
    fn test_failed_close_releases_without_poisoning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("container");
        let mut file = CryptFile::new(&path, test_key(), 0);
        file.write(&[5u8; 80]).unwrap();

        // Block 0 already flushed; only the header is pending
        let container = open_container(&mut file);
        assert!(container.cache.is_none());
        assert!(container.header_dirty);
        container.file = File::open(&path).unwrap();

        let err = file.close().unwrap_err();
        assert!(matches!(err, CryptFileError::Io { .. }), "{err:?}");
        assert_eq!(err.context().block, Some(BlockRef::Header));
        assert!(!file.is_open());
        assert!(!file.is_poisoned());
    }

    #[test]
    fn test_cache_tracks_cursor_block() {
        let dir = TempDir::new().unwrap();
        let mut file = CryptFile::new(dir.path().join("container"), test_key(), 0);
        file.write(&[1u8; 100]).unwrap();

        let HandleState::Open(container) = &file.state else {
            panic!("expected open state");
        };
        // 80-byte blocks: block 0 was flushed and evicted, block 1 holds 20 bytes
        let cached = container.cache.as_ref().unwrap();
        assert_eq!(cached.index, 1);
        assert!(cached.dirty);
        assert_eq!(container.logical_size, 100);
        assert!(container.header_dirty);

        file.seek(SeekFrom::Start(10)).unwrap();
        let HandleState::Open(container) = &file.state else {
            panic!("expected open state");
        };
        assert!(container.cache.is_none(), "seek to another block evicts");
    }

    #[test]
    fn test_error_converts_to_io_kind() {
        let not_found: io::Error = CryptFileError::NotFound {
            context: ContainerContext::new(),
        }
        .into();
        assert_eq!(not_found.kind(), io::ErrorKind::NotFound);

        let auth: io::Error = CryptFileError::Authentication {
            context: ContainerContext::new(),
        }
        .into();
        assert_eq!(auth.kind(), io::ErrorKind::InvalidData);
        assert!(
            auth.get_ref()
                .and_then(|e| e.downcast_ref::<CryptFileError>())
                .is_some()
        );

        let seek: io::Error = CryptFileError::InvalidSeek {
            reason: "negative".into(),
            context: ContainerContext::new(),
        }
        .into();
        assert_eq!(seek.kind(), io::ErrorKind::InvalidInput);
    }
}
