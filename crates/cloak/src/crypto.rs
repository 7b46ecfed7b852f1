//! Crypto - AES-256-GCM envelope and master key handling
//!
//! An envelope is `nonce (12) || ciphertext || tag (16)`. Every call to
//! [`encrypt`] draws a fresh random nonce from the OS CSPRNG; nonces are
//! never derived from a counter.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Raw master key length in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes (96-bit)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_SIZE: usize = 16;

/// A 256-bit master key, held as its 64-character lowercase hex form.
///
/// The hex string is wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey(Zeroizing<String>);

impl MasterKey {
    /// Parse a master key from hex, ignoring surrounding whitespace
    pub fn from_hex(value: &str) -> Result<Self> {
        let value = value.trim();
        let well_formed = value.len() == KEY_SIZE * 2
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if !well_formed {
            return Err(Error::InvalidKeyFormat);
        }

        Ok(Self(Zeroizing::new(value.to_string())))
    }

    /// The external hex representation
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Decode to raw key bytes
    pub fn to_bytes(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        hex::decode_to_slice(self.as_hex(), bytes.as_mut_slice())
            .map_err(|_| Error::InvalidKeyFormat)?;
        Ok(bytes)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Generate a new random master key
pub fn generate_key() -> Result<MasterKey> {
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng
        .try_fill_bytes(bytes.as_mut_slice())
        .map_err(|e| Error::RandomSourceFailure(e.to_string()))?;

    Ok(MasterKey(Zeroizing::new(hex::encode(bytes.as_slice()))))
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    let invalid = || Error::InvalidKey {
        expected: KEY_SIZE,
        actual: key.len(),
    };

    if key.len() != KEY_SIZE {
        return Err(invalid());
    }

    Aes256Gcm::new_from_slice(key).map_err(|_| invalid())
}

/// Encrypt and authenticate `plaintext`, returning a fresh envelope
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::RandomSourceFailure(e.to_string()))?;

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut envelope = Vec::with_capacity(NONCE_SIZE + sealed.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&sealed);
    Ok(envelope)
}

/// Verify and decrypt an envelope produced by [`encrypt`]
pub fn decrypt(envelope: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    if envelope.len() < NONCE_SIZE {
        return Err(Error::MalformedEnvelope {
            len: envelope.len(),
            min: NONCE_SIZE,
        });
    }

    let (nonce, sealed) = envelope.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::AuthenticationFailed)
}
