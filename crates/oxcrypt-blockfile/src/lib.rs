//! Encrypted random-access container files.
//!
//! A container stores an arbitrary byte stream as a sequence of fixed-size
//! AES-256-CBC blocks, each authenticated with HMAC-SHA256. The plaintext can
//! be read, written and seeked like a regular file through [`fs::CryptFile`].

pub mod crypto;
pub mod error;
pub mod fs;

pub use crypto::{ContainerKey, KeySource, StaticKeySource};
pub use fs::{CryptFile, CryptFileOptions};
