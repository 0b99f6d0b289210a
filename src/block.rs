//! A batch of transactions anchored by a Merkle root and linked to its
//! predecessor by hash.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto;
use crate::error::{code, ErrorCode};
use crate::merkle::MerkleTree;
use crate::transaction::{Payload, Timestamp, Transaction};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("validator {0} already signed this block")]
    DuplicateSignature(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
}

impl ErrorCode for BlockError {
    fn code(&self) -> u32 {
        match self {
            BlockError::DuplicateSignature(_) => code::DUPLICATE_TX,
            BlockError::DeserializationFailed(_) => code::DESERIALIZATION_FAILED,
            BlockError::SerializationFailed(_) => code::SERIALIZATION_FAILED,
        }
    }
}

/// A validator's detached signature over a block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub validator_id: String,
    pub participant_id: String,
    pub signature: Vec<u8>,
    pub signed_at: u64,
}

/// A transaction batch: Merkle root over the batch, previous-hash link, and
/// the validator signature set collected for it.
///
/// The signature set and proposer are each guarded by their own [`Mutex`],
/// mutable only via `add_validator_signature` and `set_proposer`, so a
/// `Block` can be shared and signed from multiple threads without a chain-
/// or consensus-wide lock.
#[derive(Debug)]
pub struct Block<T> {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: Timestamp,
    pub transactions: Vec<Transaction<T>>,
    pub merkle_root: String,
    pub nonce: u64,
    pub hash: String,
    proposer_id: Mutex<Option<String>>,
    signatures: Mutex<BTreeMap<String, BlockSignature>>,
}

impl<T: Clone> Clone for Block<T> {
    fn clone(&self) -> Self {
        Block {
            index: self.index,
            previous_hash: self.previous_hash.clone(),
            timestamp: self.timestamp,
            transactions: self.transactions.clone(),
            merkle_root: self.merkle_root.clone(),
            nonce: self.nonce,
            hash: self.hash.clone(),
            proposer_id: Mutex::new(self.proposer_id.lock().unwrap().clone()),
            signatures: Mutex::new(self.signatures.lock().unwrap().clone()),
        }
    }
}

impl<T: Payload> Block<T> {
    /// Build a new block from a (possibly empty) transaction batch. The
    /// Merkle root is computed immediately; the hash is computed and
    /// stored as well, over `nonce = 0`.
    pub fn new(index: u64, previous_hash: String, transactions: Vec<Transaction<T>>, nonce: u64) -> Self {
        let merkle_root = if transactions.is_empty() {
            String::new()
        } else {
            let leaves: Vec<String> = transactions.iter().map(|tx| tx.to_canonical_string()).collect();
            MerkleTree::build(leaves).root().to_string()
        };

        let timestamp = Timestamp::now();
        let mut block = Block {
            index,
            previous_hash,
            timestamp,
            transactions,
            merkle_root,
            nonce,
            hash: String::new(),
            proposer_id: Mutex::new(None),
            signatures: Mutex::new(BTreeMap::new()),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Deterministic hash over `(index, previous_hash, timestamp, merkle_root, nonce)`.
    pub fn calculate_hash(&self) -> String {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(self.previous_hash.as_bytes());
        buf.extend_from_slice(&self.timestamp.secs.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.nanos.to_le_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        crypto::to_hex(&crypto::sha256(&buf))
    }

    /// Whether the `i`-th transaction's canonical string still reconstructs
    /// the stored Merkle root via that index's proof.
    pub fn verify_transaction(&self, i: usize) -> bool {
        if i >= self.transactions.len() {
            return false;
        }
        let leaves: Vec<String> = self
            .transactions
            .iter()
            .map(|tx| tx.to_canonical_string())
            .collect();
        let tree = MerkleTree::build(leaves.clone());
        let proof = tree.proof_for_index(i);
        tree.verify_proof_at_index(&leaves[i], i, &proof) && tree.root() == self.merkle_root
    }

    /// Insert a validator signature. Fails with
    /// [`BlockError::DuplicateSignature`] if `validator_id` already signed.
    pub fn add_validator_signature(
        &self,
        validator_id: String,
        participant_id: String,
        signature: Vec<u8>,
        signed_at: u64,
    ) -> Result<(), BlockError> {
        let mut signatures = self.signatures.lock().unwrap();
        if signatures.contains_key(&validator_id) {
            return Err(BlockError::DuplicateSignature(validator_id));
        }
        debug!(block.index = self.index, block.hash = %self.hash, validator_id = %validator_id, "added validator signature to block");
        signatures.insert(
            validator_id.clone(),
            BlockSignature {
                validator_id,
                participant_id,
                signature,
                signed_at,
            },
        );
        Ok(())
    }

    pub fn count_valid_signatures(&self) -> usize {
        self.signatures.lock().unwrap().len()
    }

    pub fn signatures(&self) -> Vec<BlockSignature> {
        self.signatures.lock().unwrap().values().cloned().collect()
    }

    pub fn set_proposer(&self, proposer_id: String) {
        *self.proposer_id.lock().unwrap() = Some(proposer_id);
    }

    pub fn get_proposer(&self) -> Option<String> {
        self.proposer_id.lock().unwrap().clone()
    }
}

impl<T: Serialize> Block<T> {
    pub fn serialize(&self) -> Result<Vec<u8>, BlockError> {
        #[derive(Serialize)]
        struct Wire<'a, T> {
            index: u64,
            previous_hash: &'a str,
            timestamp: Timestamp,
            transactions: &'a [Transaction<T>],
            merkle_root: &'a str,
            nonce: u64,
            hash: &'a str,
            proposer_id: Option<String>,
            signatures: Vec<BlockSignature>,
        }

        let wire = Wire {
            index: self.index,
            previous_hash: &self.previous_hash,
            timestamp: self.timestamp,
            transactions: &self.transactions,
            merkle_root: &self.merkle_root,
            nonce: self.nonce,
            hash: &self.hash,
            proposer_id: self.proposer_id.lock().unwrap().clone(),
            signatures: self.signatures(),
        };
        bincode::serialize(&wire).map_err(|e| BlockError::SerializationFailed(e.to_string()))
    }
}

impl<T: for<'de> Deserialize<'de>> Block<T> {
    pub fn deserialize(bytes: &[u8]) -> Result<Self, BlockError> {
        #[derive(Deserialize)]
        struct Wire<T> {
            index: u64,
            previous_hash: String,
            timestamp: Timestamp,
            transactions: Vec<Transaction<T>>,
            merkle_root: String,
            nonce: u64,
            hash: String,
            proposer_id: Option<String>,
            signatures: Vec<BlockSignature>,
        }

        let wire: Wire<T> = bincode::deserialize(bytes)
            .map_err(|e| BlockError::DeserializationFailed(e.to_string()))?;

        let signatures = wire
            .signatures
            .into_iter()
            .map(|sig| (sig.validator_id.clone(), sig))
            .collect();

        Ok(Block {
            index: wire.index,
            previous_hash: wire.previous_hash,
            timestamp: wire.timestamp,
            transactions: wire.transactions,
            merkle_root: wire.merkle_root,
            nonce: wire.nonce,
            hash: wire.hash,
            proposer_id: Mutex::new(wire.proposer_id),
            signatures: Mutex::new(signatures),
        })
    }
}
