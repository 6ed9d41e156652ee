//! Shared helpers for container integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use oxcrypt_blockfile::crypto::ContainerKey;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Fixed key used across tests so failures are reproducible.
pub const TEST_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

/// Install a test-writer subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_key() -> ContainerKey {
    ContainerKey::new(*TEST_KEY)
}

pub fn other_key() -> ContainerKey {
    ContainerKey::new([0x5a; 32])
}

/// A fresh temporary directory and a container path inside it.
pub fn temp_container() -> (TempDir, PathBuf) {
    init_tracing();
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("test");
    (dir, path)
}
