//! Identity wrapping Ed25519 key material with optional expiry.
//!
//! A [`Key`] is the stable identity used throughout the crate: validators,
//! transaction senders, and signers are all keyed by [`Key::id`], the
//! lowercase hex of `SHA-256(public key bytes)`.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::crypto::{self, CryptoError};
use crate::error::{code, ErrorCode};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(&'static str),
}

impl ErrorCode for KeyError {
    fn code(&self) -> u32 {
        match self {
            KeyError::Crypto(inner) => inner.code(),
            KeyError::DeserializationFailed(_) => code::DESERIALIZATION_FAILED,
        }
    }
}

/// An Ed25519 identity: a 32-byte public key, optional 64-byte private
/// material (32-byte seed + 32-byte public key, as produced by
/// [`ed25519_dalek::SigningKey::to_keypair_bytes`]), and an optional expiry
/// in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    public: [u8; 32],
    private: Option<[u8; 64]>,
    expiry_ms: Option<u64>,
}

impl Key {
    /// Generate a fresh keypair with no expiry.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Key {
            public: signing_key.verifying_key().to_bytes(),
            private: Some(signing_key.to_keypair_bytes()),
            expiry_ms: None,
        }
    }

    /// Generate a fresh keypair with the given expiry (ms since epoch).
    pub fn generate_with_expiry(expiry_ms: u64) -> Self {
        let mut key = Self::generate();
        key.expiry_ms = Some(expiry_ms);
        key
    }

    /// Build a key from existing public and private material.
    pub fn from_keypair(public: [u8; 32], private: [u8; 64]) -> Self {
        Key {
            public,
            private: Some(private),
            expiry_ms: None,
        }
    }

    /// Build a public-only key (cannot sign, can still verify).
    pub fn from_public(public: [u8; 32]) -> Self {
        Key {
            public,
            private: None,
            expiry_ms: None,
        }
    }

    /// Stable identifier: lowercase hex of `SHA-256(public key)`.
    pub fn id(&self) -> String {
        crypto::to_hex(&crypto::sha256(&self.public))
    }

    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let private = self.private.as_ref().ok_or(CryptoError::SigningFailed)?;
        Ok(crypto::sign(private, data)?)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        Ok(crypto::verify(&self.public, data, signature)?)
    }

    pub fn set_expiry(&mut self, expiry_ms: u64) {
        self.expiry_ms = Some(expiry_ms);
    }

    pub fn clear_expiry(&mut self) {
        self.expiry_ms = None;
    }

    /// `now_ms` is injected rather than read from the clock so callers in
    /// tests and across threads see a consistent notion of "now".
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expiry_ms {
            Some(expiry) => now_ms >= expiry,
            None => false,
        }
    }

    /// A key is valid iff the public key parses (always true once
    /// constructed) and it is not expired.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        !self.is_expired(now_ms)
    }

    /// `pub(32) | priv_len(4) | priv(priv_len) | has_expiry(1) | expiry_ms(8)?`,
    /// all scalar lengths little-endian.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 4 + 64 + 1 + 8);
        out.extend_from_slice(&self.public);

        let priv_bytes: &[u8] = self.private.as_ref().map(|p| p.as_slice()).unwrap_or(&[]);
        out.extend_from_slice(&(priv_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(priv_bytes);

        match self.expiry_ms {
            Some(expiry) => {
                out.push(1);
                out.extend_from_slice(&expiry.to_le_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, KeyError> {
        let mut offset = 0usize;
        let take = |offset: &mut usize, len: usize, bytes: &[u8]| -> Result<Vec<u8>, KeyError> {
            if *offset + len > bytes.len() {
                return Err(KeyError::DeserializationFailed("short read"));
            }
            let slice = bytes[*offset..*offset + len].to_vec();
            *offset += len;
            Ok(slice)
        };

        let public_vec = take(&mut offset, 32, bytes)?;
        let public: [u8; 32] = public_vec
            .try_into()
            .map_err(|_| KeyError::DeserializationFailed("public key length"))?;

        let priv_len_vec = take(&mut offset, 4, bytes)?;
        let priv_len = u32::from_le_bytes(
            priv_len_vec
                .try_into()
                .map_err(|_| KeyError::DeserializationFailed("priv_len"))?,
        ) as usize;
        if priv_len != 0 && priv_len != 64 {
            return Err(KeyError::DeserializationFailed("invalid private length"));
        }
        let private = if priv_len == 64 {
            let priv_vec = take(&mut offset, 64, bytes)?;
            Some(
                priv_vec
                    .try_into()
                    .map_err(|_| KeyError::DeserializationFailed("private key length"))?,
            )
        } else {
            None
        };

        let has_expiry_vec = take(&mut offset, 1, bytes)?;
        let expiry_ms = if has_expiry_vec[0] == 1 {
            let expiry_vec = take(&mut offset, 8, bytes)?;
            Some(u64::from_le_bytes(
                expiry_vec
                    .try_into()
                    .map_err(|_| KeyError::DeserializationFailed("expiry"))?,
            ))
        } else {
            None
        };

        Ok(Key {
            public,
            private,
            expiry_ms,
        })
    }
}
