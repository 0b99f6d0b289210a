//! Participant authorization: per-participant state/metadata/capabilities and
//! the used-transaction-uuid set used to authorize one-shot actions.
//!
//! This set is distinct from [`crate::chain::Chain`]'s own duplicate-uuid
//! guard: the chain protects the ledger against double-committed
//! transactions, while this one protects an authorization-scoped action
//! (e.g. "this command may only be actioned once") that need not ever reach
//! the chain. Both are kept, on purpose.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use crate::error::{code, ErrorCode};

#[derive(Debug, Error)]
pub enum AuthenticatorError {
    #[error("participant {0} is unknown")]
    UnauthorizedParticipant(String),
    #[error("participant {0} is missing capability {1}")]
    CapabilityMissing(String, String),
    #[error("transaction {0} was already used")]
    DuplicateTransaction(String),
}

impl ErrorCode for AuthenticatorError {
    fn code(&self) -> u32 {
        match self {
            AuthenticatorError::UnauthorizedParticipant(_) => code::UNAUTHORIZED,
            AuthenticatorError::CapabilityMissing(_, _) => code::CAPABILITY_MISSING,
            AuthenticatorError::DuplicateTransaction(_) => code::DUPLICATE_TX,
        }
    }
}

#[derive(Debug, Clone)]
struct ParticipantRecord {
    state: String,
    metadata: HashMap<String, String>,
    capabilities: HashSet<String>,
}

struct AuthenticatorState {
    participants: HashMap<String, ParticipantRecord>,
    used_uuids: HashSet<String>,
}

/// Tracks who may act on the fleet and what they've already done.
pub struct Authenticator {
    state: RwLock<AuthenticatorState>,
}

impl Authenticator {
    pub fn new() -> Self {
        Authenticator {
            state: RwLock::new(AuthenticatorState {
                participants: HashMap::new(),
                used_uuids: HashSet::new(),
            }),
        }
    }

    /// Register a participant, or overwrite an existing one with fresh
    /// state and metadata (capabilities are cleared on overwrite).
    pub fn register_participant(
        &self,
        participant_id: impl Into<String>,
        state: impl Into<String>,
        metadata: Option<HashMap<String, String>>,
    ) {
        let mut guard = self.state.write().unwrap();
        guard.participants.insert(
            participant_id.into(),
            ParticipantRecord {
                state: state.into(),
                metadata: metadata.unwrap_or_default(),
                capabilities: HashSet::new(),
            },
        );
    }

    pub fn update_state(&self, participant_id: &str, state: impl Into<String>) -> Result<(), AuthenticatorError> {
        let mut guard = self.state.write().unwrap();
        let record = guard
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| AuthenticatorError::UnauthorizedParticipant(participant_id.to_string()))?;
        record.state = state.into();
        Ok(())
    }

    pub fn set_metadata(
        &self,
        participant_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), AuthenticatorError> {
        let mut guard = self.state.write().unwrap();
        let record = guard
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| AuthenticatorError::UnauthorizedParticipant(participant_id.to_string()))?;
        record.metadata.insert(key.into(), value.into());
        Ok(())
    }

    pub fn get_metadata(&self, participant_id: &str, key: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .participants
            .get(participant_id)
            .and_then(|r| r.metadata.get(key).cloned())
    }

    pub fn get_state(&self, participant_id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .participants
            .get(participant_id)
            .map(|r| r.state.clone())
    }

    pub fn grant_capability(&self, participant_id: &str, capability: impl Into<String>) -> Result<(), AuthenticatorError> {
        let mut guard = self.state.write().unwrap();
        let record = guard
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| AuthenticatorError::UnauthorizedParticipant(participant_id.to_string()))?;
        record.capabilities.insert(capability.into());
        Ok(())
    }

    pub fn has_capability(&self, participant_id: &str, capability: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .participants
            .get(participant_id)
            .map(|r| r.capabilities.contains(capability))
            .unwrap_or(false)
    }

    pub fn is_transaction_used(&self, uuid: &str) -> bool {
        self.state.read().unwrap().used_uuids.contains(uuid)
    }

    pub fn mark_transaction_used(&self, uuid: impl Into<String>) {
        self.state.write().unwrap().used_uuids.insert(uuid.into());
    }

    /// Authorize and, on success, record a one-shot action: fails if the
    /// participant is unknown, lacks `required_capability` (when given), or
    /// `uuid` was already used; otherwise marks `uuid` used.
    pub fn validate_and_record_action(
        &self,
        participant_id: &str,
        _description: &str,
        uuid: &str,
        required_capability: Option<&str>,
    ) -> Result<(), AuthenticatorError> {
        let mut guard = self.state.write().unwrap();
        let record = guard
            .participants
            .get(participant_id)
            .ok_or_else(|| AuthenticatorError::UnauthorizedParticipant(participant_id.to_string()))?;

        if let Some(capability) = required_capability {
            if !record.capabilities.contains(capability) {
                return Err(AuthenticatorError::CapabilityMissing(
                    participant_id.to_string(),
                    capability.to_string(),
                ));
            }
        }

        if guard.used_uuids.contains(uuid) {
            return Err(AuthenticatorError::DuplicateTransaction(uuid.to_string()));
        }
        guard.used_uuids.insert(uuid.to_string());
        Ok(())
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_participant_cannot_act() {
        let auth = Authenticator::new();
        let err = auth
            .validate_and_record_action("ghost", "move-arm", "uuid-1", None)
            .unwrap_err();
        assert!(matches!(err, AuthenticatorError::UnauthorizedParticipant(_)));
    }

    #[test]
    fn missing_capability_is_rejected() {
        let auth = Authenticator::new();
        auth.register_participant("alice", "active", None);
        let err = auth
            .validate_and_record_action("alice", "move-arm", "uuid-1", Some("can-move"))
            .unwrap_err();
        assert!(matches!(err, AuthenticatorError::CapabilityMissing(_, _)));
    }

    #[test]
    fn granted_capability_allows_action_once() {
        let auth = Authenticator::new();
        auth.register_participant("alice", "active", None);
        auth.grant_capability("alice", "can-move").unwrap();

        auth.validate_and_record_action("alice", "move-arm", "uuid-1", Some("can-move"))
            .unwrap();
        assert!(auth.is_transaction_used("uuid-1"));

        let err = auth
            .validate_and_record_action("alice", "move-arm", "uuid-1", Some("can-move"))
            .unwrap_err();
        assert!(matches!(err, AuthenticatorError::DuplicateTransaction(_)));
    }

    #[test]
    fn metadata_round_trips_per_participant() {
        let auth = Authenticator::new();
        auth.register_participant("alice", "active", None);
        auth.set_metadata("alice", "region", "us-west").unwrap();
        assert_eq!(auth.get_metadata("alice", "region"), Some("us-west".to_string()));
        assert_eq!(auth.get_metadata("bob", "region"), None);
    }

    #[test]
    fn update_state_changes_only_the_named_participant() {
        let auth = Authenticator::new();
        auth.register_participant("alice", "pending", None);
        auth.register_participant("bob", "pending", None);
        auth.update_state("alice", "active").unwrap();
        assert_eq!(auth.get_state("alice"), Some("active".to_string()));
        assert_eq!(auth.get_state("bob"), Some("pending".to_string()));
    }

    #[test]
    fn update_state_on_unknown_participant_fails() {
        let auth = Authenticator::new();
        let err = auth.update_state("ghost", "active").unwrap_err();
        assert!(matches!(err, AuthenticatorError::UnauthorizedParticipant(_)));
    }
}
