//! Proof-of-Authority consensus: the validator set, dynamic quorum, block
//! proposals, and per-validator proposal rate limiting.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{code, ErrorCode};
use crate::key::Key;
use crate::validator::{Validator, ValidatorStatus};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("validator {0} is unknown")]
    UnknownValidator(String),
    #[error("validator {0} cannot propose: not active")]
    ValidatorInactive(String),
    #[error("validator {0} exceeded its proposal rate limit")]
    RateLimited(String),
    #[error("proposal {0} is unknown")]
    UnknownProposal(String),
    #[error("proposal {0} has expired")]
    ProposalExpired(String),
    #[error("validator {0} already signed proposal {1}")]
    DuplicateSignature(String, String),
    #[error("proposal {0} has not reached quorum")]
    QuorumNotReached(String),
    #[error("validator {0} already exists")]
    DuplicateValidator(String),
}

impl ErrorCode for ConsensusError {
    fn code(&self) -> u32 {
        match self {
            ConsensusError::UnknownValidator(_)
            | ConsensusError::ValidatorInactive(_)
            | ConsensusError::RateLimited(_) => code::UNAUTHORIZED,
            ConsensusError::UnknownProposal(_) | ConsensusError::ProposalExpired(_) => {
                code::INVALID_BLOCK
            }
            ConsensusError::DuplicateSignature(_, _) => code::DUPLICATE_TX,
            ConsensusError::QuorumNotReached(_) => code::INVALID_BLOCK,
            ConsensusError::DuplicateValidator(_) => code::DUPLICATE_TX,
        }
    }
}

/// Tunable PoA parameters. Plain data; construct with [`Default`] and
/// override fields directly.
#[derive(Debug, Clone, Copy)]
pub struct PoAConfig {
    /// Signatures wanted when every validator is active.
    pub initial_required_signatures: u32,
    /// Signatures wanted when the active set has shrunk below
    /// `initial_required_signatures`.
    pub minimum_required_signatures: u32,
    /// How long a proposal remains open for signing.
    pub signature_timeout_ms: i64,
    /// How long a validator may go without a heartbeat (`mark_online`)
    /// before it is considered offline for quorum purposes.
    pub offline_threshold_ms: i64,
    /// Per-validator proposal ceiling within any trailing hour.
    pub max_proposals_per_hour: u32,
    /// Minimum spacing between one validator's successive proposals.
    pub min_seconds_between_proposals: i64,
}

impl Default for PoAConfig {
    fn default() -> Self {
        PoAConfig {
            initial_required_signatures: 1,
            minimum_required_signatures: 1,
            signature_timeout_ms: 5 * 60 * 1000,
            offline_threshold_ms: 120_000,
            max_proposals_per_hour: 60,
            min_seconds_between_proposals: 0,
        }
    }
}

/// A detached validator signature collected against a proposal.
#[derive(Debug, Clone)]
pub struct BlockSignature {
    pub validator_id: String,
    pub participant_id: String,
    pub signature: Vec<u8>,
    pub signed_at_ms: i64,
}

struct Proposal {
    block_hash: String,
    proposer_id: String,
    created_at_ms: i64,
    signatures: HashMap<String, BlockSignature>,
}

struct RateLimitState {
    timestamps_ms: Vec<i64>,
    last_proposal_ms: Option<i64>,
}

struct ConsensusState {
    validators: HashMap<String, Validator>,
    proposals: HashMap<String, Proposal>,
    rate_limits: HashMap<String, RateLimitState>,
}

/// Proof-of-Authority consensus engine: owns the validator set and the
/// in-flight proposals competing for quorum signatures.
pub struct PoAConsensus {
    config: RwLock<PoAConfig>,
    state: RwLock<ConsensusState>,
}

impl PoAConsensus {
    pub fn new(config: PoAConfig) -> Self {
        PoAConsensus {
            config: RwLock::new(config),
            state: RwLock::new(ConsensusState {
                validators: HashMap::new(),
                proposals: HashMap::new(),
                rate_limits: HashMap::new(),
            }),
        }
    }

    pub fn get_config(&self) -> PoAConfig {
        *self.config.read().unwrap()
    }

    pub fn set_config(&self, config: PoAConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Register a new `Active` validator from `identity`. `now_ms` seeds
    /// `last_seen`. Fails if a validator with the same `identity.id()`
    /// already exists. Returns the new validator's id.
    pub fn add_validator(
        &self,
        participant_id: impl Into<String>,
        identity: Key,
        weight: u32,
        now_ms: i64,
    ) -> Result<String, ConsensusError> {
        let validator = Validator::new(participant_id, identity, weight, now_ms);
        let id = validator.id();
        let mut state = self.state.write().unwrap();
        if state.validators.contains_key(&id) {
            return Err(ConsensusError::DuplicateValidator(id));
        }
        state.validators.insert(id.clone(), validator);
        Ok(id)
    }

    pub fn remove_validator(&self, validator_id: &str) -> Option<Validator> {
        self.state.write().unwrap().validators.remove(validator_id)
    }

    pub fn get_validator(&self, validator_id: &str) -> Option<Validator> {
        self.state.read().unwrap().validators.get(validator_id).cloned()
    }

    pub fn get_all_validators(&self) -> Vec<Validator> {
        self.state.read().unwrap().validators.values().cloned().collect()
    }

    pub fn get_active_validators(&self) -> Vec<Validator> {
        self.state
            .read()
            .unwrap()
            .validators
            .values()
            .filter(|v| v.status() == ValidatorStatus::Active)
            .cloned()
            .collect()
    }

    pub fn get_active_validator_count(&self) -> usize {
        self.get_active_validators().len()
    }

    pub fn get_total_active_weight(&self) -> u64 {
        self.get_active_validators().iter().map(|v| v.weight() as u64).sum()
    }

    pub fn mark_offline(&self, validator_id: &str) {
        if let Some(v) = self.state.write().unwrap().validators.get_mut(validator_id) {
            v.mark_offline();
        }
    }

    pub fn mark_online(&self, validator_id: &str, now_ms: i64) {
        if let Some(v) = self.state.write().unwrap().validators.get_mut(validator_id) {
            v.mark_online(now_ms);
        }
    }

    pub fn revoke_validator(&self, validator_id: &str) {
        if let Some(v) = self.state.write().unwrap().validators.get_mut(validator_id) {
            v.revoke();
        }
    }

    /// `clamp(min(initial_required, active_count), minimum_required, initial_required)`.
    pub fn get_required_signatures(&self) -> u32 {
        let config = self.get_config();
        let active = self.get_active_validator_count() as u32;
        let wanted = config.initial_required_signatures.min(active);
        wanted
            .max(config.minimum_required_signatures)
            .min(config.initial_required_signatures)
    }

    /// Whether `signatures` (deduplicated by `validator_id`) meets the
    /// current required-signature threshold.
    pub fn has_quorum(&self, signatures: &[BlockSignature]) -> bool {
        let unique: std::collections::HashSet<&str> =
            signatures.iter().map(|s| s.validator_id.as_str()).collect();
        unique.len() as u32 >= self.get_required_signatures()
    }

    /// Whether `validator_id` may submit another proposal right now: must
    /// be a known, active validator; must respect the per-hour ceiling and
    /// the minimum spacing between proposals.
    pub fn can_propose(&self, validator_id: &str, now_ms: i64) -> Result<(), ConsensusError> {
        let state = self.state.read().unwrap();
        let validator = state
            .validators
            .get(validator_id)
            .ok_or_else(|| ConsensusError::UnknownValidator(validator_id.to_string()))?;
        if validator.status() != ValidatorStatus::Active {
            return Err(ConsensusError::ValidatorInactive(validator_id.to_string()));
        }

        let config = self.get_config();
        if let Some(rate) = state.rate_limits.get(validator_id) {
            if let Some(last) = rate.last_proposal_ms {
                let elapsed_s = (now_ms - last) / 1000;
                if elapsed_s < config.min_seconds_between_proposals {
                    return Err(ConsensusError::RateLimited(validator_id.to_string()));
                }
            }
            let window_start = now_ms - 3_600_000;
            let recent = rate.timestamps_ms.iter().filter(|&&t| t >= window_start).count() as u32;
            if recent >= config.max_proposals_per_hour {
                return Err(ConsensusError::RateLimited(validator_id.to_string()));
            }
        }
        Ok(())
    }

    /// Record a proposal attempt for rate-limiting purposes, regardless of
    /// whether the validator is known (a fleet may want to track attempts
    /// from identities it hasn't registered yet).
    pub fn record_proposal(&self, validator_id: &str, now_ms: i64) {
        let mut state = self.state.write().unwrap();
        let rate = state
            .rate_limits
            .entry(validator_id.to_string())
            .or_insert_with(|| RateLimitState {
                timestamps_ms: Vec::new(),
                last_proposal_ms: None,
            });
        rate.timestamps_ms.push(now_ms);
        rate.last_proposal_ms = Some(now_ms);
    }

    pub fn get_proposal_count(&self, validator_id: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .rate_limits
            .get(validator_id)
            .map(|r| r.timestamps_ms.len())
            .unwrap_or(0)
    }

    /// Create (or return, idempotently) the proposal for `block_hash`. The
    /// id is always `"proposal_" + block_hash`.
    pub fn create_proposal(&self, block_hash: &str, proposer_id: &str, now_ms: i64) -> String {
        let proposal_id = format!("proposal_{block_hash}");
        let mut state = self.state.write().unwrap();
        if let std::collections::hash_map::Entry::Vacant(entry) = state.proposals.entry(proposal_id.clone()) {
            debug!(proposal_id = %proposal_id, proposer_id = %proposer_id, "opened proposal");
            entry.insert(Proposal {
                block_hash: block_hash.to_string(),
                proposer_id: proposer_id.to_string(),
                created_at_ms: now_ms,
                signatures: HashMap::new(),
            });
        }
        proposal_id
    }

    /// Add a validator's signature to a proposal. Returns `Ok(true)` iff
    /// this call is what pushes the proposal over quorum.
    pub fn add_signature(
        &self,
        proposal_id: &str,
        validator_id: &str,
        signature: Vec<u8>,
        now_ms: i64,
    ) -> Result<bool, ConsensusError> {
        let config = self.get_config();
        let required = self.get_required_signatures();
        let mut state = self.state.write().unwrap();

        {
            let proposal = state
                .proposals
                .get(proposal_id)
                .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.to_string()))?;
            if now_ms - proposal.created_at_ms > config.signature_timeout_ms {
                warn!(proposal_id = %proposal_id, "signature rejected: proposal expired");
                return Err(ConsensusError::ProposalExpired(proposal_id.to_string()));
            }
        }

        let participant_id = state
            .validators
            .get(validator_id)
            .map(|v| v.participant_id().to_string())
            .unwrap_or_default();

        let proposal = state.proposals.get_mut(proposal_id).unwrap();
        if proposal.signatures.contains_key(validator_id) {
            return Err(ConsensusError::DuplicateSignature(
                validator_id.to_string(),
                proposal_id.to_string(),
            ));
        }
        let already_had_quorum = proposal.signatures.len() as u32 >= required;
        proposal.signatures.insert(
            validator_id.to_string(),
            BlockSignature {
                validator_id: validator_id.to_string(),
                participant_id,
                signature,
                signed_at_ms: now_ms,
            },
        );
        let now_has_quorum = proposal.signatures.len() as u32 >= required;
        let just_reached_quorum = !already_had_quorum && now_has_quorum;
        debug!(proposal_id = %proposal_id, validator_id = %validator_id, signatures = proposal.signatures.len(), "added proposal signature");
        if just_reached_quorum {
            info!(proposal_id = %proposal_id, required, "proposal reached quorum");
        }
        Ok(just_reached_quorum)
    }

    pub fn is_proposal_ready(&self, proposal_id: &str) -> bool {
        let state = self.state.read().unwrap();
        match state.proposals.get(proposal_id) {
            Some(proposal) => proposal.signatures.len() as u32 >= self.get_required_signatures(),
            None => false,
        }
    }

    pub fn get_finalized_signatures(&self, proposal_id: &str) -> Result<Vec<BlockSignature>, ConsensusError> {
        let required = self.get_required_signatures();
        let state = self.state.read().unwrap();
        let proposal = state
            .proposals
            .get(proposal_id)
            .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.to_string()))?;
        if (proposal.signatures.len() as u32) < required {
            return Err(ConsensusError::QuorumNotReached(proposal_id.to_string()));
        }
        Ok(proposal.signatures.values().cloned().collect())
    }

    pub fn remove_proposal(&self, proposal_id: &str) {
        self.state.write().unwrap().proposals.remove(proposal_id);
    }

    pub fn cleanup_expired(&self, now_ms: i64) {
        let config = self.get_config();
        let mut state = self.state.write().unwrap();
        let before = state.proposals.len();
        state
            .proposals
            .retain(|_, proposal| now_ms - proposal.created_at_ms <= config.signature_timeout_ms);
        let removed = before - state.proposals.len();
        if removed > 0 {
            debug!(removed, "swept expired proposals");
        }
    }

    pub fn proposal_proposer(&self, proposal_id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .proposals
            .get(proposal_id)
            .map(|p| p.proposer_id.clone())
    }

    pub fn proposal_block_hash(&self, proposal_id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .proposals
            .get(proposal_id)
            .map(|p| p.block_hash.clone())
    }
}
