//! The append-only sequence of blocks: genesis creation, link validation,
//! and the whole-chain duplicate-transaction guard.

use std::collections::HashSet;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{info, warn};

use crate::block::Block;
use crate::error::{code, ErrorCode};
use crate::key::Key;
use crate::transaction::{Payload, Transaction};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain is empty")]
    Empty,
    #[error("block index {expected} expected, got {actual}")]
    InvalidIndex { expected: u64, actual: u64 },
    #[error("block does not link to the current head")]
    BrokenLink,
    #[error("block hash does not match its own contents")]
    InvalidHash,
    #[error("merkle root does not match the block's transactions")]
    InvalidMerkleRoot,
    #[error("transaction {0} already appears earlier in the chain")]
    DuplicateTransaction(String),
}

impl ErrorCode for ChainError {
    fn code(&self) -> u32 {
        match self {
            ChainError::Empty => code::CHAIN_EMPTY,
            ChainError::InvalidIndex { .. }
            | ChainError::BrokenLink
            | ChainError::InvalidHash
            | ChainError::InvalidMerkleRoot => code::INVALID_BLOCK,
            ChainError::DuplicateTransaction(_) => code::DUPLICATE_TX,
        }
    }
}

const GENESIS_PREVIOUS_HASH: &str = "GENESIS";

/// An append-only, validated sequence of [`Block`]s, starting from a
/// genesis block at index 0.
pub struct Chain<T> {
    id: String,
    blocks: RwLock<Vec<Block<T>>>,
    seen_uuids: RwLock<HashSet<String>>,
}

impl<T: Payload> Chain<T> {
    /// Create a new chain whose genesis block carries a single
    /// system-provided transaction: `genesis_uuid`/`genesis_payload`,
    /// signed with `signing_key`.
    pub fn new(
        id: impl Into<String>,
        genesis_uuid: impl Into<String>,
        genesis_payload: T,
        signing_key: &Key,
    ) -> Result<Self, crate::key::KeyError> {
        let mut genesis_tx = Transaction::with_uuid(genesis_uuid, genesis_payload, 0);
        genesis_tx.sign_with(signing_key)?;
        let genesis_uuid = genesis_tx.uuid.clone();
        let genesis = Block::new(0, GENESIS_PREVIOUS_HASH.to_string(), vec![genesis_tx], 0);

        let mut seen_uuids = HashSet::new();
        seen_uuids.insert(genesis_uuid);

        Ok(Chain {
            id: id.into(),
            blocks: RwLock::new(vec![genesis]),
            seen_uuids: RwLock::new(seen_uuids),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn height(&self) -> u64 {
        self.blocks.read().unwrap().len() as u64
    }

    pub fn head_hash(&self) -> String {
        self.blocks
            .read()
            .unwrap()
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_default()
    }

    /// Validate `block` against the current head and append it:
    /// 1. `block.index` must be exactly `height()`.
    /// 2. `block.previous_hash` must equal the current head's hash.
    /// 3. `block.hash` must equal `block.calculate_hash()`.
    /// 4. `block.merkle_root` must match the root over its own transactions.
    /// 5. None of `block`'s transaction uuids may appear anywhere earlier in
    ///    the chain (the double-spend guard).
    pub fn add_block(&self, block: Block<T>) -> Result<(), ChainError>
    where
        T: Clone,
    {
        let expected_index = self.height();
        if block.index != expected_index {
            warn!(chain.id = %self.id, expected = expected_index, actual = block.index, "rejecting block with wrong index");
            return Err(ChainError::InvalidIndex {
                expected: expected_index,
                actual: block.index,
            });
        }
        if block.previous_hash != self.head_hash() {
            warn!(chain.id = %self.id, block.index = block.index, "rejecting block with broken previous-hash link");
            return Err(ChainError::BrokenLink);
        }
        if block.hash != block.calculate_hash() {
            warn!(chain.id = %self.id, block.index = block.index, "rejecting block with self-inconsistent hash");
            return Err(ChainError::InvalidHash);
        }
        let expected_root = if block.transactions.is_empty() {
            String::new()
        } else {
            let leaves: Vec<String> = block
                .transactions
                .iter()
                .map(|tx| tx.to_canonical_string())
                .collect();
            crate::merkle::merkle_root(&leaves)
        };
        if block.merkle_root != expected_root {
            warn!(chain.id = %self.id, block.index = block.index, "rejecting block with mismatched merkle root");
            return Err(ChainError::InvalidMerkleRoot);
        }

        let mut seen = self.seen_uuids.write().unwrap();
        for tx in &block.transactions {
            if seen.contains(&tx.uuid) {
                warn!(chain.id = %self.id, tx.uuid = %tx.uuid, "rejecting block with already-seen transaction");
                return Err(ChainError::DuplicateTransaction(tx.uuid.clone()));
            }
        }
        for tx in &block.transactions {
            seen.insert(tx.uuid.clone());
        }
        drop(seen);

        info!(chain.id = %self.id, block.index = block.index, block.hash = %block.hash, "appended block");
        self.blocks.write().unwrap().push(block);
        Ok(())
    }

    /// Re-validate every block's link, hash, merkle root, and duplicate-uuid
    /// freedom from genesis forward (spec invariants 1-5, re-derived rather
    /// than trusted from `add_block` time, so tampering with a block's
    /// stored fields in place is still caught).
    pub fn is_valid(&self) -> bool {
        let blocks = self.blocks.read().unwrap();
        if blocks.is_empty() {
            return false;
        }
        if blocks[0].previous_hash != GENESIS_PREVIOUS_HASH || blocks[0].index != 0 {
            return false;
        }
        let mut seen = HashSet::new();
        for i in 0..blocks.len() {
            let block = &blocks[i];
            if block.index != i as u64 {
                return false;
            }
            if block.hash != block.calculate_hash() {
                return false;
            }
            if i > 0 && block.previous_hash != blocks[i - 1].hash {
                return false;
            }

            let expected_root = if block.transactions.is_empty() {
                String::new()
            } else {
                let leaves: Vec<String> = block
                    .transactions
                    .iter()
                    .map(|tx| tx.to_canonical_string())
                    .collect();
                crate::merkle::merkle_root(&leaves)
            };
            if block.merkle_root != expected_root {
                return false;
            }

            for tx in &block.transactions {
                if !seen.insert(tx.uuid.clone()) {
                    return false;
                }
            }
        }
        true
    }

    pub fn get_block(&self, index: u64) -> Option<Block<T>>
    where
        T: Clone,
    {
        self.blocks.read().unwrap().get(index as usize).cloned()
    }

    pub fn latest_block(&self) -> Option<Block<T>>
    where
        T: Clone,
    {
        self.blocks.read().unwrap().last().cloned()
    }

    pub fn is_transaction_known(&self, uuid: &str) -> bool {
        self.seen_uuids.read().unwrap().contains(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::transaction::Transaction;

    fn signed_block(index: u64, previous_hash: &str, key: &Key, payloads: &[&str]) -> Block<String> {
        let txs: Vec<Transaction<String>> = payloads
            .iter()
            .map(|p| {
                let mut tx = Transaction::new(p.to_string(), 0);
                tx.sign_with(key).unwrap();
                tx
            })
            .collect();
        Block::new(index, previous_hash.to_string(), txs, 0)
    }

    fn genesis_chain(id: &str, key: &Key) -> Chain<String> {
        Chain::new(id, "genesis-tx", "ChainTestData{init,system}".to_string(), key).unwrap()
    }

    #[test]
    fn new_chain_starts_with_valid_genesis_carrying_one_transaction() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);
        assert_eq!(chain.height(), 1);
        assert!(chain.is_valid());
        assert_eq!(chain.id(), "fleet-1");

        let genesis = chain.get_block(0).unwrap();
        assert_eq!(genesis.transactions.len(), 1);
        assert_eq!(genesis.transactions[0].uuid, "genesis-tx");
        assert!(chain.is_transaction_known("genesis-tx"));
    }

    #[test]
    fn genesis_transaction_uuid_cannot_be_replayed_in_a_later_block() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);

        let mut replay_tx = Transaction::new("move-arm".to_string(), 0);
        replay_tx.uuid = "genesis-tx".to_string();
        replay_tx.sign_with(&key).unwrap();
        let block = Block::new(1, chain.head_hash(), vec![replay_tx], 0);

        let err = chain.add_block(block).unwrap_err();
        assert!(matches!(err, ChainError::DuplicateTransaction(_)));
    }

    #[test]
    fn scenario_s2_append_and_reject_double_spend() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);

        let block1 = signed_block(1, &chain.head_hash(), &key, &["move-arm"]);
        let reused_uuid = block1.transactions[0].uuid.clone();
        chain.add_block(block1).unwrap();
        assert_eq!(chain.height(), 2);
        assert!(chain.is_valid());

        // A later block that reuses the same transaction uuid must be rejected.
        let mut replay_tx = Transaction::new("move-arm".to_string(), 0);
        replay_tx.uuid = reused_uuid;
        replay_tx.sign_with(&key).unwrap();
        let block2 = Block::new(2, chain.head_hash(), vec![replay_tx], 0);

        let err = chain.add_block(block2).unwrap_err();
        assert!(matches!(err, ChainError::DuplicateTransaction(_)));
        assert_eq!(chain.height(), 2);
    }

    #[test]
    fn add_block_rejects_wrong_index() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);
        let bad = signed_block(5, &chain.head_hash(), &key, &["x"]);
        assert!(matches!(
            chain.add_block(bad).unwrap_err(),
            ChainError::InvalidIndex { .. }
        ));
    }

    #[test]
    fn add_block_rejects_broken_link() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);
        let bad = signed_block(1, "not-the-real-head", &key, &["x"]);
        assert!(matches!(chain.add_block(bad).unwrap_err(), ChainError::BrokenLink));
    }

    #[test]
    fn add_block_rejects_tampered_hash() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);
        let mut bad = signed_block(1, &chain.head_hash(), &key, &["x"]);
        bad.hash = "tampered".to_string();
        assert!(matches!(chain.add_block(bad).unwrap_err(), ChainError::InvalidHash));
    }

    #[test]
    fn is_valid_catches_merkle_root_tampered_after_append() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);
        let block = signed_block(1, &chain.head_hash(), &key, &["move-arm"]);
        chain.add_block(block).unwrap();
        assert!(chain.is_valid());

        chain.blocks.write().unwrap()[1].merkle_root = "not-the-real-root".to_string();
        assert!(!chain.is_valid());
    }

    #[test]
    fn is_valid_catches_duplicate_uuid_injected_after_append() {
        let key = Key::generate();
        let chain = genesis_chain("fleet-1", &key);
        let block = signed_block(1, &chain.head_hash(), &key, &["move-arm"]);
        chain.add_block(block).unwrap();
        assert!(chain.is_valid());

        let genesis_tx_uuid = chain.blocks.read().unwrap()[0].transactions[0].uuid.clone();
        chain.blocks.write().unwrap()[1].transactions[0].uuid = genesis_tx_uuid;
        assert!(!chain.is_valid());
    }
}
