//! Fuzz target for opening and reading arbitrary container files
//!
//! The whole file content is attacker controlled. Opening, seeking and
//! reading must fail cleanly and never panic.

#![no_main]

use std::io::{Read, SeekFrom};

use libfuzzer_sys::fuzz_target;
use oxcrypt_blockfile::crypto::ContainerKey;
use oxcrypt_blockfile::fs::CryptFile;

fuzz_target!(|data: &[u8]| {
    if data.len() > 256 * 1024 {
        return;
    }

    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let path = dir.path().join("fuzz");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let mut file = CryptFile::new(&path, ContainerKey::new([0x42; 32]), 0);
    let _ = file.size();
    let _ = file.seek(SeekFrom::Start(0));
    let mut out = Vec::new();
    let _ = file.read_to_end(&mut out);
    let _ = file.close();
});
