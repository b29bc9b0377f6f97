//! X25519 tunnel key pairs.
//!
//! Keys move around as base64 strings (the wire format every tunnel
//! implementation speaks) and only become curve points at the edges.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 key material")]
    InvalidEncoding,
    #[error("key must be exactly 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// An X25519 private key. `Debug` never prints the key material.
#[derive(Clone)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        Ok(Self(x25519_dalek::StaticSecret::from(decode_key(encoded)?)))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// An X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        Ok(Self(x25519_dalek::PublicKey::from(decode_key(encoded)?)))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| KeyError::InvalidEncoding)?;
    let len = bytes.len();
    <[u8; 32]>::try_from(bytes).map_err(|_| KeyError::InvalidLength(len))
}
