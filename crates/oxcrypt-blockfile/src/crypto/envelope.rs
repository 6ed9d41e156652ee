//! Authenticated block envelope: AES-256-CBC + HMAC-SHA256.
//!
//! Every encrypted unit of a container file (the encrypted header half and
//! each data block) uses the same self-verifying layout:
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 32   | HMAC-SHA256 over IV + ciphertext |
//! | 32     | 16   | Random IV for AES-CBC |
//! | 48     | n    | AES-256-CBC ciphertext (no padding, n % 16 == 0) |
//!
//! The MAC is always verified before anything is decrypted, so a wrong key and
//! a corrupted block fail the same way: an error and no plaintext.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::TryRngCore;
use rand::rngs::OsRng;
use ring::hmac;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{trace, warn};
use zeroize::Zeroizing;

use super::keys::ContainerKey;

// ============================================================================
// Constants
// ============================================================================

/// HMAC-SHA256 output size (32 bytes)
pub const MAC_SIZE: usize = 32;

/// AES block size; plaintext and encoded blocks must be multiples of it
pub const BLOCK_ALIGNMENT: usize = 16;

/// IV size for AES-CBC (one AES block)
pub const IV_SIZE: usize = BLOCK_ALIGNMENT;

/// Bytes added to every plaintext block by the envelope: MAC + IV
pub const ENVELOPE_OVERHEAD: usize = MAC_SIZE + IV_SIZE;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Input length is not a multiple of the AES block size
    #[error("Input of {len} bytes is not a multiple of the AES block size {BLOCK_ALIGNMENT}")]
    MisalignedInput { len: usize },

    /// HMAC verification failed - wrong key, tampering, or a truncated block.
    ///
    /// **[INTEGRITY VIOLATION]** The causes are deliberately indistinguishable.
    #[error("Block authentication failed: wrong key or corrupted data")]
    Authentication,

    /// The OS random source could not produce an IV
    #[error("Random source unavailable: {0}")]
    Entropy(String),
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Encrypt and authenticate one plaintext block.
///
/// Returns `MAC ‖ IV ‖ ciphertext`, which is [`ENVELOPE_OVERHEAD`] bytes longer
/// than `plain`.
pub fn encode_block(plain: &[u8], key: &ContainerKey) -> Result<Vec<u8>, EnvelopeError> {
    if plain.len() % BLOCK_ALIGNMENT != 0 {
        return Err(EnvelopeError::MisalignedInput { len: plain.len() });
    }

    let mut iv = [0u8; IV_SIZE];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| EnvelopeError::Entropy(e.to_string()))?;

    let mut block = vec![0u8; ENVELOPE_OVERHEAD + plain.len()];
    let (mac_slot, authenticated) = block.split_at_mut(MAC_SIZE);
    let (iv_slot, ciphertext) = authenticated.split_at_mut(IV_SIZE);
    iv_slot.copy_from_slice(&iv);
    ciphertext.copy_from_slice(plain);
    cbc_encrypt(key.expose(), &iv, ciphertext)?;

    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, key.expose());
    let mac = hmac::sign(&mac_key, authenticated);
    mac_slot.copy_from_slice(mac.as_ref());

    trace!(plain_size = plain.len(), "Block encoded");
    Ok(block)
}

/// Verify and decrypt one encoded block.
///
/// Authentication happens before decryption; on failure no plaintext is
/// produced. The returned buffer is zeroed when dropped.
pub fn decode_block(block: &[u8], key: &ContainerKey) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
    if block.len() % BLOCK_ALIGNMENT != 0 {
        return Err(EnvelopeError::MisalignedInput { len: block.len() });
    }
    if block.len() < ENVELOPE_OVERHEAD {
        warn!(actual_size = block.len(), "Encoded block too short to authenticate");
        return Err(EnvelopeError::Authentication);
    }

    let (expected_mac, authenticated) = block.split_at(MAC_SIZE);

    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, key.expose());
    let computed_mac = hmac::sign(&mac_key, authenticated);

    // Constant-time comparison
    if !bool::from(computed_mac.as_ref().ct_eq(expected_mac)) {
        warn!("Block HMAC verification failed");
        return Err(EnvelopeError::Authentication);
    }

    let Some((iv, ciphertext)) = authenticated.split_first_chunk::<IV_SIZE>() else {
        return Err(EnvelopeError::Authentication);
    };
    let mut plain = Zeroizing::new(ciphertext.to_vec());
    cbc_decrypt(key.expose(), iv, &mut plain)?;

    trace!(plain_size = plain.len(), "Block decoded");
    Ok(plain)
}

// ============================================================================
// AES-256-CBC without padding
// ============================================================================

/// Encrypt `buf` in place. `buf.len()` must be block aligned.
fn cbc_encrypt(key: &[u8; 32], iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<(), EnvelopeError> {
    let len = buf.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| EnvelopeError::MisalignedInput { len })?;
    Ok(())
}

/// Decrypt `buf` in place. `buf.len()` must be block aligned.
fn cbc_decrypt(key: &[u8; 32], iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<(), EnvelopeError> {
    let len = buf.len();
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| EnvelopeError::MisalignedInput { len })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn test_key(seed: u8) -> ContainerKey {
        ContainerKey::new([seed; 32])
    }

    #[test]
    fn test_cbc_known_answer() {
        // NIST SP 800-38A, F.2.5 CBC-AES256.Encrypt (first two blocks)
        let key = hex!("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let iv = hex!("000102030405060708090a0b0c0d0e0f");
        let plaintext = hex!(
            "6bc1bee22e409f96e93d7e117393172a"
            "ae2d8a571e03ac9c9eb76fac45af8e51"
        );
        let expected = hex!(
            "f58c4c04d6e5f1ba779eabfb5f7bfbd6"
            "9cfc4e967edb808d679f777bc6702c7d"
        );

        let mut buf = plaintext;
        cbc_encrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, expected);

        cbc_decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_roundtrip() {
        let key = test_key(1);
        let plain = b"Test Message 123";

        let encoded = encode_block(plain, &key).unwrap();
        assert_eq!(encoded.len(), ENVELOPE_OVERHEAD + plain.len());

        let decoded = decode_block(&encoded, &key).unwrap();
        assert_eq!(decoded.as_slice(), plain);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let key = test_key(1);
        let encoded = encode_block(&[], &key).unwrap();
        assert_eq!(encoded.len(), ENVELOPE_OVERHEAD);
        assert!(decode_block(&encoded, &key).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key() {
        let encoded = encode_block(b"Test Message 123", &test_key(1)).unwrap();
        let result = decode_block(&encoded, &test_key(2));
        assert!(matches!(result, Err(EnvelopeError::Authentication)));
    }

    #[test]
    fn test_misaligned_plaintext() {
        let result = encode_block(b"Test Message Not Aligned", &test_key(1));
        assert!(matches!(
            result,
            Err(EnvelopeError::MisalignedInput { len: 24 })
        ));
    }

    #[test]
    fn test_misaligned_block() {
        let result = decode_block(b"Test Message Not Aligned", &test_key(1));
        assert!(matches!(
            result,
            Err(EnvelopeError::MisalignedInput { len: 24 })
        ));
    }

    #[test]
    fn test_short_block_fails_authentication() {
        let result = decode_block(&[0u8; 32], &test_key(1));
        assert!(matches!(result, Err(EnvelopeError::Authentication)));
    }

    #[test]
    fn test_fresh_iv_per_encoding() {
        let key = test_key(3);
        let plain = [0u8; 64];
        let a = encode_block(&plain, &key).unwrap();
        let b = encode_block(&plain, &key).unwrap();
        assert_ne!(a[MAC_SIZE..MAC_SIZE + IV_SIZE], b[MAC_SIZE..MAC_SIZE + IV_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_mac() {
        let key = test_key(1);
        let mut encoded = encode_block(&[0x55; 32], &key).unwrap();
        encoded[0] ^= 0x01;
        assert!(matches!(
            decode_block(&encoded, &key),
            Err(EnvelopeError::Authentication)
        ));
    }

    #[test]
    fn test_tampered_iv() {
        let key = test_key(1);
        let mut encoded = encode_block(&[0x55; 32], &key).unwrap();
        encoded[MAC_SIZE] ^= 0x80;
        assert!(matches!(
            decode_block(&encoded, &key),
            Err(EnvelopeError::Authentication)
        ));
    }
}
