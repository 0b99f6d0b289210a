//! Application-payload envelope: uuid, priority, timestamp, and a detached
//! signature over the payload's canonical string form.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::Key;

/// Anything usable as a transaction payload must produce a deterministic
/// textual form: identical values must serialize to identical bytes across
/// processes and platforms, because this string is both the signing input
/// and the Merkle leaf.
pub trait Payload {
    fn canonical_string(&self) -> String;
}

impl Payload for String {
    fn canonical_string(&self) -> String {
        self.clone()
    }
}

impl Payload for Vec<u8> {
    fn canonical_string(&self) -> String {
        hex::encode(self)
    }
}

/// A single (sec, nanosecond) wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }
}

/// An application transaction: payload envelope plus signing metadata.
/// Immutable after `sign_with` is called; `sign_with` may be called again
/// to replace a signature prior to submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction<T> {
    pub uuid: String,
    pub payload: T,
    pub priority: u16,
    pub timestamp: Timestamp,
    pub signature: Vec<u8>,
}

impl<T: Payload> Transaction<T> {
    /// Construct an unsigned transaction with a freshly generated uuid and
    /// the current wall-clock timestamp.
    pub fn new(payload: T, priority: u16) -> Self {
        Self::with_uuid(Uuid::new_v4().to_string(), payload, priority)
    }

    /// Construct an unsigned transaction with an explicit uuid, e.g. a
    /// chain's genesis transaction, where the uuid is caller-provided
    /// rather than freshly generated.
    pub fn with_uuid(uuid: impl Into<String>, payload: T, priority: u16) -> Self {
        Transaction {
            uuid: uuid.into(),
            payload,
            priority,
            timestamp: Timestamp::now(),
            signature: Vec::new(),
        }
    }

    /// The deterministic textual form used as both the signing input and
    /// the Merkle leaf: `"{uuid}|{priority}|{payload.canonical_string()}"`.
    pub fn to_canonical_string(&self) -> String {
        format!(
            "{}|{}|{}",
            self.uuid,
            self.priority,
            self.payload.canonical_string()
        )
    }

    /// Sign (or replace the signature on) this transaction with `key`.
    pub fn sign_with(&mut self, key: &Key) -> Result<(), crate::key::KeyError> {
        let signature = key.sign(self.to_canonical_string().as_bytes())?;
        self.signature = signature;
        Ok(())
    }

    /// A transaction is valid iff its priority is in range and it carries a
    /// non-empty signature that verifies against `key` for its canonical
    /// string.
    pub fn is_valid(&self) -> bool {
        self.priority <= 255 && !self.signature.is_empty()
    }

    /// Verify the signature against a specific signing key's public half.
    pub fn verify_with(&self, key: &Key) -> Result<bool, crate::key::KeyError> {
        if self.signature.is_empty() {
            return Ok(false);
        }
        key.verify(self.to_canonical_string().as_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transaction_has_stable_canonical_string_until_mutated() {
        let tx = Transaction::new("payload-a".to_string(), 5);
        let first = tx.to_canonical_string();
        let second = tx.to_canonical_string();
        assert_eq!(first, second);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = Key::generate();
        let mut tx = Transaction::new("move-arm".to_string(), 10);
        assert!(!tx.is_valid());

        tx.sign_with(&key).unwrap();
        assert!(tx.is_valid());
        assert!(tx.verify_with(&key).unwrap());
    }

    #[test]
    fn tampering_with_payload_after_signing_breaks_verification() {
        let key = Key::generate();
        let mut tx = Transaction::new("move-arm".to_string(), 10);
        tx.sign_with(&key).unwrap();

        tx.payload = "move-arm-tampered".to_string();
        assert!(!tx.verify_with(&key).unwrap());
    }

    #[test]
    fn priority_out_of_range_is_invalid_even_when_signed() {
        let key = Key::generate();
        let mut tx = Transaction::new("x".to_string(), 300);
        tx.sign_with(&key).unwrap();
        assert!(!tx.is_valid());
    }

    #[test]
    fn distinct_transactions_get_distinct_uuids() {
        let a = Transaction::new("x".to_string(), 0);
        let b = Transaction::new("x".to_string(), 0);
        assert_ne!(a.uuid, b.uuid);
    }
}
