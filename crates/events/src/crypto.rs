//! Payload encryption with per-stream data-encryption keys (DEKs).
//!
//! Layout of an encrypted blob:
//!
//! ```text
//! IV (16 bytes) || AES-256-CTR( marker (1 byte) || body )
//! ```
//!
//! `marker` is `0x00` when `body` is the plaintext and `0x01` when `body` is
//! the raw-deflate of the plaintext. Deflate is only used when it saves at
//! least 10 %.

use std::io::{Read, Write};

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Size of a DEK (AES-256).
pub const DEK_LEN: usize = 32;

/// Size of the random IV prepended to every ciphertext.
pub const IV_LEN: usize = 16;

const MARKER_PLAIN: u8 = 0x00;
const MARKER_DEFLATE: u8 = 0x01;

/// Per-stream data-encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct Dek([u8; DEK_LEN]);

impl Dek {
    /// Fresh random key from the system CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; DEK_LEN];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; DEK_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {DEK_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(key))
    }

    /// Standard base64 of exactly [`DEK_LEN`] bytes, as keys are configured.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.0
    }
}

impl core::fmt::Debug for Dek {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Dek(..)")
    }
}

/// A DEK wrapped by the key-management layer. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DekEnvelope(Vec<u8>);

impl DekEnvelope {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for DekEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for DekEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// AES-256-CTR under a random IV; returns `IV || ciphertext`.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let mut cipher = Aes256Ctr::new_from_slices(key, &iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut out = Vec::with_capacity(IV_LEN + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);
    cipher.apply_keystream(&mut out[IV_LEN..]);
    Ok(out)
}

/// Inverse of [`encrypt`].
pub fn decrypt(raw: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if raw.len() < IV_LEN {
        return Err(CryptoError::DataTooShort {
            expected: IV_LEN,
            actual: raw.len(),
        });
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);

    let mut cipher = Aes256Ctr::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut plaintext = ciphertext.to_vec();
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Frame (compressing when worthwhile) and encrypt under `dek`.
pub fn seal(plaintext: &[u8], dek: &Dek) -> Result<Vec<u8>, CryptoError> {
    let compressed = deflate(plaintext)?;

    let mut framed = Vec::with_capacity(1 + plaintext.len());
    if compressed.len() * 10 <= plaintext.len() * 9 {
        framed.push(MARKER_DEFLATE);
        framed.extend_from_slice(&compressed);
    } else {
        framed.push(MARKER_PLAIN);
        framed.extend_from_slice(plaintext);
    }

    encrypt(&framed, dek.as_bytes())
}

/// Inverse of [`seal`].
pub fn open(raw: &[u8], dek: &Dek) -> Result<Vec<u8>, CryptoError> {
    let framed = decrypt(raw, dek.as_bytes())?;
    let (marker, body) = framed.split_first().ok_or(CryptoError::DataTooShort {
        expected: IV_LEN + 1,
        actual: raw.len(),
    })?;

    match *marker {
        MARKER_PLAIN => Ok(body.to_vec()),
        MARKER_DEFLATE => inflate(body),
        other => Err(CryptoError::UnknownMarker(other)),
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(CryptoError::Compression)?;
    encoder.finish().map_err(CryptoError::Compression)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(CryptoError::Compression)?;
    Ok(out)
}
