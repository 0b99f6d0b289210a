//! A PoA participant: a [`Key`] identity, a voting weight, and a lifecycle
//! status independent of liveness.

use thiserror::Error;

use crate::error::{code, ErrorCode};
use crate::key::{Key, KeyError};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validator cannot sign: status is not active, or identity is invalid")]
    CannotSign,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(&'static str),
}

impl ErrorCode for ValidatorError {
    fn code(&self) -> u32 {
        match self {
            ValidatorError::CannotSign => code::UNAUTHORIZED,
            ValidatorError::Key(inner) => inner.code(),
            ValidatorError::DeserializationFailed(_) => code::DESERIALIZATION_FAILED,
        }
    }
}

/// Lifecycle status for PoA consensus. `Offline` is a temporary condition
/// the network may clear by observing activity again; `Revoked` is
/// permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorStatus {
    Active,
    Offline,
    Revoked,
}

impl ValidatorStatus {
    fn to_byte(self) -> u8 {
        match self {
            ValidatorStatus::Active => 0,
            ValidatorStatus::Offline => 1,
            ValidatorStatus::Revoked => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ValidatorError> {
        match byte {
            0 => Ok(ValidatorStatus::Active),
            1 => Ok(ValidatorStatus::Offline),
            2 => Ok(ValidatorStatus::Revoked),
            _ => Err(ValidatorError::DeserializationFailed("unknown status byte")),
        }
    }
}

/// A PoA validator: identity, voting weight, and liveness/lifecycle state.
///
/// `is_online` is deliberately independent of `status`: a validator can be
/// `Active` but not currently online (no recent activity), and the
/// consensus layer decides separately whether liveness should affect quorum
/// eligibility.
#[derive(Debug, Clone)]
pub struct Validator {
    participant_id: String,
    identity: Key,
    weight: u32,
    status: ValidatorStatus,
    last_seen_ms: i64,
}

impl Validator {
    pub fn new(participant_id: impl Into<String>, identity: Key, weight: u32, now_ms: i64) -> Self {
        Validator {
            participant_id: participant_id.into(),
            identity,
            weight,
            status: ValidatorStatus::Active,
            last_seen_ms: now_ms,
        }
    }

    /// Stable id: the identity key's id (hash of its public key).
    pub fn id(&self) -> String {
        self.identity.id()
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn identity(&self) -> &Key {
        &self.identity
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }

    pub fn status(&self) -> ValidatorStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ValidatorStatus) {
        self.status = status;
    }

    /// Active status and a key that is not expired (`now_ms`).
    pub fn can_sign(&self, now_ms: u64) -> bool {
        self.status == ValidatorStatus::Active && self.identity.is_valid(now_ms)
    }

    pub fn sign(&self, data: &[u8], now_ms: u64) -> Result<Vec<u8>, ValidatorError> {
        if !self.can_sign(now_ms) {
            return Err(ValidatorError::CannotSign);
        }
        Ok(self.identity.sign(data)?)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, ValidatorError> {
        Ok(self.identity.verify(data, signature)?)
    }

    pub fn update_activity(&mut self, now_ms: i64) {
        self.last_seen_ms = now_ms;
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms
    }

    /// Online iff activity was observed within `timeout_ms` of `now_ms`,
    /// regardless of `status`.
    pub fn is_online(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms - self.last_seen_ms < timeout_ms
    }

    /// Clears an `Offline` status back to `Active` and records activity.
    /// A no-op on status for validators already `Active` or `Revoked`.
    pub fn mark_online(&mut self, now_ms: i64) {
        if self.status == ValidatorStatus::Offline {
            self.status = ValidatorStatus::Active;
        }
        self.update_activity(now_ms);
    }

    pub fn mark_offline(&mut self) {
        self.status = ValidatorStatus::Offline;
    }

    /// Permanently revoke. There is no un-revoke operation.
    pub fn revoke(&mut self) {
        self.status = ValidatorStatus::Revoked;
    }

    /// `status(1) | pid_len(4) | pid | identity_len(4) | identity | weight(4) | last_seen(8)`,
    /// all scalar lengths little-endian.
    pub fn serialize(&self) -> Vec<u8> {
        let identity_data = self.identity.serialize();
        let pid_bytes = self.participant_id.as_bytes();

        let mut out = Vec::with_capacity(1 + 4 + pid_bytes.len() + 4 + identity_data.len() + 4 + 8);
        out.push(self.status.to_byte());
        out.extend_from_slice(&(pid_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(pid_bytes);
        out.extend_from_slice(&(identity_data.len() as u32).to_le_bytes());
        out.extend_from_slice(&identity_data);
        out.extend_from_slice(&self.weight.to_le_bytes());
        out.extend_from_slice(&self.last_seen_ms.to_le_bytes());
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ValidatorError> {
        if data.len() < 9 {
            return Err(ValidatorError::DeserializationFailed("too short"));
        }
        let mut offset = 0usize;

        let status = ValidatorStatus::from_byte(data[offset])?;
        offset += 1;

        let pid_len = read_u32(data, &mut offset)?;
        let participant_id = read_string(data, &mut offset, pid_len)?;

        let identity_len = read_u32(data, &mut offset)?;
        let identity_bytes = read_slice(data, &mut offset, identity_len)?;
        let identity = Key::deserialize(identity_bytes)?;

        let weight_bytes = read_slice(data, &mut offset, 4)?;
        let weight = u32::from_le_bytes(weight_bytes.try_into().unwrap());

        let last_seen_bytes = read_slice(data, &mut offset, 8)?;
        let last_seen_ms = i64::from_le_bytes(last_seen_bytes.try_into().unwrap());

        Ok(Validator {
            participant_id,
            identity,
            weight,
            status,
            last_seen_ms,
        })
    }
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<usize, ValidatorError> {
    let bytes = read_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()) as usize)
}

fn read_slice<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], ValidatorError> {
    if *offset + len > data.len() {
        return Err(ValidatorError::DeserializationFailed("truncated data"));
    }
    let slice = &data[*offset..*offset + len];
    *offset += len;
    Ok(slice)
}

fn read_string(data: &[u8], offset: &mut usize, len: usize) -> Result<String, ValidatorError> {
    let slice = read_slice(data, offset, len)?;
    String::from_utf8(slice.to_vec()).map_err(|_| ValidatorError::DeserializationFailed("invalid utf8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validator_is_active_and_can_sign() {
        let v = Validator::new("alice", Key::generate(), 1, 1_000);
        assert_eq!(v.status(), ValidatorStatus::Active);
        assert!(v.can_sign(0));
    }

    #[test]
    fn revoke_is_permanent_and_blocks_signing() {
        let mut v = Validator::new("alice", Key::generate(), 1, 1_000);
        v.revoke();
        assert!(!v.can_sign(0));
        v.mark_online(2_000);
        assert_eq!(v.status(), ValidatorStatus::Revoked);
    }

    #[test]
    fn mark_offline_then_online_restores_active_status() {
        let mut v = Validator::new("alice", Key::generate(), 1, 1_000);
        v.mark_offline();
        assert_eq!(v.status(), ValidatorStatus::Offline);
        assert!(!v.can_sign(0));

        v.mark_online(5_000);
        assert_eq!(v.status(), ValidatorStatus::Active);
        assert_eq!(v.last_seen_ms(), 5_000);
    }

    #[test]
    fn is_online_reflects_timeout_independent_of_status() {
        let mut v = Validator::new("alice", Key::generate(), 1, 1_000);
        v.revoke();
        assert!(v.is_online(1_500, 60_000));
        assert!(!v.is_online(100_000, 60_000));
    }

    #[test]
    fn serialize_deserialize_roundtrips_all_fields() {
        let mut v = Validator::new("alice", Key::generate(), 7, 42);
        v.mark_offline();
        let bytes = v.serialize();
        let restored = Validator::deserialize(&bytes).unwrap();

        assert_eq!(restored.participant_id(), v.participant_id());
        assert_eq!(restored.weight(), v.weight());
        assert_eq!(restored.status(), v.status());
        assert_eq!(restored.last_seen_ms(), v.last_seen_ms());
        assert_eq!(restored.id(), v.id());
    }

    #[test]
    fn deserialize_rejects_short_input() {
        let err = Validator::deserialize(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, ValidatorError::DeserializationFailed(_)));
    }
}
