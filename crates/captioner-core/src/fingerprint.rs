//! Content fingerprinting for images.
//!
//! A fingerprint is the SHA-256 digest of the raw image bytes. It keys the
//! result cache and both output tables, so two images share a fingerprint
//! only when their bytes are identical.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Digest width in bytes.
pub const FINGERPRINT_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidImageError {
    #[error("image payload is empty")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFingerprintError {
    #[error("expected {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex character at position {0}")]
    InvalidHex(usize),
}

/// Fixed-width content identifier of an image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Hash arbitrary bytes. Prefer [`fingerprint`] for image payloads, which
    /// rejects empty input.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(12);
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != FINGERPRINT_LEN * 2 {
            return Err(ParseFingerprintError::Length {
                expected: FINGERPRINT_LEN * 2,
                actual: s.len(),
            });
        }
        if let Some(pos) = s.bytes().position(|c| !c.is_ascii_hexdigit()) {
            return Err(ParseFingerprintError::InvalidHex(pos));
        }

        let mut out = [0u8; FINGERPRINT_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| ParseFingerprintError::InvalidHex(i * 2))?;
        }
        Ok(Self(out))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fingerprint an image payload.
pub fn fingerprint(image_bytes: &[u8]) -> Result<Fingerprint, InvalidImageError> {
    if image_bytes.is_empty() {
        return Err(InvalidImageError::Empty);
    }
    Ok(Fingerprint::of(image_bytes))
}

/// An immutable image payload with its fingerprint computed once on ingestion.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Clone)]
pub struct Image {
    bytes: Arc<[u8]>,
    fingerprint: Fingerprint,
}

impl Image {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, InvalidImageError> {
        let bytes: Vec<u8> = bytes.into();
        let fingerprint = fingerprint(&bytes)?;
        Ok(Self {
            bytes: bytes.into(),
            fingerprint,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("fingerprint", &self.fingerprint)
            .field("len", &self.bytes.len())
            .finish()
    }
}
