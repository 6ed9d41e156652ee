//! Error types for the blockfile crate
//!
//! This module re-exports all error types and their context structures so
//! callers can match on them from one place.

pub use crate::crypto::envelope::EnvelopeError;
pub use crate::crypto::keys::KeyError;
pub use crate::fs::container::{BlockRef, ContainerContext, CryptFileError};
pub use crate::fs::layout::{GeometryError, HeaderError};
