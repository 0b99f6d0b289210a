//! Cryptographic primitives: Ed25519 signing/verification, SHA-256 hashing,
//! and lowercase hex codec.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{code, ErrorCode};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signing failed: no private key material available")]
    SigningFailed,
    #[error("verification failed: malformed signature or public key")]
    VerificationFailed,
}

impl ErrorCode for CryptoError {
    fn code(&self) -> u32 {
        match self {
            CryptoError::SigningFailed => code::SIGNING_FAILED,
            CryptoError::VerificationFailed => code::VERIFICATION_FAILED,
        }
    }
}

/// SHA-256 over arbitrary bytes, returned as a fixed 32-byte digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex encoding of a byte slice.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a lowercase (or mixed-case) hex string back to bytes.
pub fn from_hex(s: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(s).map_err(|_| CryptoError::VerificationFailed)
}

/// Sign `data` with 64 bytes of private key material (32-byte seed + 32-byte
/// public key, matching [`ed25519_dalek::SigningKey::to_keypair_bytes`]).
/// Fails with [`CryptoError::SigningFailed`] if `private` is empty.
pub fn sign(private: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if private.is_empty() {
        return Err(CryptoError::SigningFailed);
    }
    let bytes: [u8; 64] = private.try_into().map_err(|_| CryptoError::SigningFailed)?;
    let signing_key =
        SigningKey::from_keypair_bytes(&bytes).map_err(|_| CryptoError::SigningFailed)?;
    Ok(signing_key.sign(data).to_bytes().to_vec())
}

/// Verify a detached signature. Returns `Ok(false)` for a well-formed but
/// incorrect signature, and `Err(CryptoError::VerificationFailed)` only when
/// the public key or signature bytes are malformed.
pub fn verify(public: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let public_bytes: [u8; 32] = public
        .try_into()
        .map_err(|_| CryptoError::VerificationFailed)?;
    let verifying_key =
        VerifyingKey::from_bytes(&public_bytes).map_err(|_| CryptoError::VerificationFailed)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::VerificationFailed)?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(data, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn random_signing_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn hashes_are_32_bytes_and_deterministic() {
        let h1 = sha256(b"hello");
        let h2 = sha256(b"hello");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
        assert_ne!(h1, sha256(b"world"));
    }

    #[test]
    fn hex_roundtrips() {
        let bytes = sha256(b"roundtrip");
        let hexed = to_hex(&bytes);
        assert_eq!(hexed, hexed.to_lowercase());
        assert_eq!(from_hex(&hexed).unwrap(), bytes.to_vec());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signing_key = random_signing_key();
        let private = signing_key.to_keypair_bytes();
        let public = signing_key.verifying_key().to_bytes();

        let sig = sign(&private, b"message").expect("sign");
        assert!(verify(&public, b"message", &sig).unwrap());
        assert!(!verify(&public, b"tampered", &sig).unwrap());
    }

    #[test]
    fn signing_with_no_private_material_fails() {
        let err = sign(&[], b"message").unwrap_err();
        assert!(matches!(err, CryptoError::SigningFailed));
    }

    #[test]
    fn verification_with_malformed_inputs_errors() {
        let err = verify(&[0u8; 3], b"message", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed));

        let signing_key = random_signing_key();
        let public = signing_key.verifying_key().to_bytes();
        let err = verify(&public, b"message", &[0u8; 10]).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed));
    }
}
