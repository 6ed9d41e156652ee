#![forbid(unsafe_code)]

use std::fmt;

use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of a container key in bytes (AES-256 key, also used as the HMAC key).
pub const KEY_SIZE: usize = 32;

/// Error type for obtaining key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key material had the wrong length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The OS random source could not produce key material.
    #[error("Random source unavailable: {0}")]
    Entropy(String),

    /// A key source could not supply a key (no cached key, supplier refused, ...).
    #[error("Key unavailable: {0}")]
    Unavailable(String),
}

/// The 256-bit key protecting a container file.
///
/// The same key drives both AES-256-CBC encryption and HMAC-SHA256
/// authentication of every block. Key bytes are zeroed when the value is
/// dropped, and the `Debug` implementation never prints them.
#[derive(Clone)]
pub struct ContainerKey(Zeroizing<[u8; KEY_SIZE]>);

impl ContainerKey {
    /// Wrap raw key material.
    ///
    /// The caller is responsible for zeroing its own copy of `bytes` if it
    /// holds sensitive data.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a key from a slice, which must be exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self::new(array))
    }

    /// Generate a fresh key from the OS random source.
    pub fn random() -> Result<Self, KeyError> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| KeyError::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Borrow the raw key bytes for cipher and MAC setup.
    pub(crate) fn expose(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContainerKey").field(&"[REDACTED]").finish()
    }
}

/// A supplier of container keys.
///
/// Passphrase derivation, prompting and on-disk key caching live outside this
/// crate; they plug in by implementing this trait. A source that caches keys
/// should drop its cached copy when asked to [`invalidate`](KeySource::invalidate).
pub trait KeySource {
    /// Produce the key for a container.
    fn fetch_key(&self) -> Result<ContainerKey, KeyError>;

    /// Forget any cached key material. The default does nothing.
    fn invalidate(&self) {}
}

/// A key source holding one key in memory.
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    key: ContainerKey,
}

impl StaticKeySource {
    pub fn new(key: ContainerKey) -> Self {
        Self { key }
    }
}

impl KeySource for StaticKeySource {
    fn fetch_key(&self) -> Result<ContainerKey, KeyError> {
        Ok(self.key.clone())
    }
}
