//! Store encoding: `base64(ciphertext)--base64(nonce)--base64(tag)`.
//!
//! AES-GCM with a 96-bit nonce. A 16 byte key selects AES-128, a 32 byte key
//! AES-256. Keys are exchanged as hex strings.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Segment separator.
const SEPARATOR: &str = "--";

/// GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// GCM tag length in bytes.
const TAG_LEN: usize = 16;

/// Generates a random 128-bit key, hex encoded.
#[must_use]
pub fn generate_key() -> String {
    hex::encode(Aes128Gcm::generate_key(OsRng))
}

/// Encrypts `plaintext` with a hex encoded key.
///
/// # Errors
///
/// Returns a message if the key is malformed.
pub fn seal(plaintext: &str, hex_key: &str) -> Result<String, String> {
    let key = decode_key(hex_key)?;
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);

    let mut sealed = match key.len() {
        16 => Aes128Gcm::new_from_slice(&key)
            .map_err(|e| e.to_string())?
            .encrypt(&nonce, plaintext.as_bytes()),
        _ => Aes256Gcm::new_from_slice(&key)
            .map_err(|e| e.to_string())?
            .encrypt(&nonce, plaintext.as_bytes()),
    }
    .map_err(|_| String::from("encryption failed"))?;

    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok([
        STANDARD.encode(&sealed),
        STANDARD.encode(nonce),
        STANDARD.encode(tag),
    ]
    .join(SEPARATOR))
}

/// Decrypts a sealed document with a hex encoded key.
///
/// # Errors
///
/// Returns a message if the document is malformed, the key is wrong, or the
/// plaintext is not UTF-8.
pub fn open(sealed: &str, hex_key: &str) -> Result<String, String> {
    let key = decode_key(hex_key)?;

    let parts: Vec<&str> = sealed.trim().split(SEPARATOR).collect();
    let [ciphertext, nonce, tag] = parts.as_slice() else {
        return Err(format!(
            "expected 3 '{SEPARATOR}' separated segments, found {}",
            parts.len()
        ));
    };

    let mut combined = STANDARD
        .decode(ciphertext)
        .map_err(|e| format!("ciphertext is not base64: {e}"))?;
    let nonce = STANDARD
        .decode(nonce)
        .map_err(|e| format!("nonce is not base64: {e}"))?;
    let tag = STANDARD
        .decode(tag)
        .map_err(|e| format!("tag is not base64: {e}"))?;

    if nonce.len() != NONCE_LEN {
        return Err(format!("nonce must be {NONCE_LEN} bytes, found {}", nonce.len()));
    }
    if tag.len() != TAG_LEN {
        return Err(format!("tag must be {TAG_LEN} bytes, found {}", tag.len()));
    }
    combined.extend_from_slice(&tag);

    let nonce = GenericArray::from_slice(&nonce);
    let plaintext = match key.len() {
        16 => Aes128Gcm::new_from_slice(&key)
            .map_err(|e| e.to_string())?
            .decrypt(nonce, combined.as_ref()),
        _ => Aes256Gcm::new_from_slice(&key)
            .map_err(|e| e.to_string())?
            .decrypt(nonce, combined.as_ref()),
    }
    .map_err(|_| String::from("decryption failed (wrong key or tampered store)"))?;

    String::from_utf8(plaintext).map_err(|e| format!("plaintext is not UTF-8: {e}"))
}

/// Decodes and length-checks a hex key.
fn decode_key(hex_key: &str) -> Result<Vec<u8>, String> {
    let key = hex::decode(hex_key.trim()).map_err(|e| format!("key is not hex: {e}"))?;
    match key.len() {
        16 | 32 => Ok(key),
        n => Err(format!("key must be 16 or 32 bytes, found {n}")),
    }
}
