//! Durable key-value store backing validator and block persistence.
//!
//! Writes land in an in-memory pending partition first and only become
//! durable (and fsynced) when a [`Transaction`] guard is committed; a
//! dropped or rolled-back transaction discards them. Reopening the store
//! after a crash sees only what was actually committed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{code, ErrorCode};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] bincode::Error),
    #[error("store has not been initialized: call initialize_core_schema first")]
    NotInitialized,
}

impl ErrorCode for StoreError {
    fn code(&self) -> u32 {
        match self {
            StoreError::Database(_) => code::NOT_INITIALIZED,
            StoreError::SerializationFailed(_) => code::SERIALIZATION_FAILED,
            StoreError::NotInitialized => code::NOT_INITIALIZED,
        }
    }
}

const SCHEMA_KEY: &[u8] = b"schema_version";
const SCHEMA_VERSION: u32 = 1;

/// A validator's durable representation: identity bytes rather than a live
/// [`crate::key::Key`], so the store has no dependency on signing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub validator_id: String,
    pub participant_id: String,
    pub identity_data: Vec<u8>,
    pub weight: u32,
    pub status: u8,
    pub last_seen_ms: i64,
}

#[derive(Default)]
struct PendingState {
    validators: HashMap<String, ValidatorRecord>,
    blocks_by_height: HashMap<u64, Vec<u8>>,
    blocks_by_hash: HashMap<String, u64>,
}

fn height_key(height: u64) -> String {
    format!("height:{height:0>20}")
}

/// A staged set of pending writes. Dropping without calling `commit` or
/// `rollback` leaves the pending writes in place — call `rollback`
/// explicitly to discard them.
pub struct Transaction<'a> {
    store: &'a Store,
}

impl<'a> Transaction<'a> {
    /// Move every pending write into the durable trees and fsync.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut pending = self.store.pending.write().unwrap();

        for record in pending.validators.values() {
            let bytes = bincode::serialize(record)?;
            self.store.validators_tree.insert(record.validator_id.as_bytes(), bytes)?;
        }
        for (height, bytes) in pending.blocks_by_height.iter() {
            self.store.blocks_tree.insert(height_key(*height).as_bytes(), bytes.clone())?;
        }
        for (hash, height) in pending.blocks_by_hash.iter() {
            self.store.blocks_tree.insert(hash.as_bytes(), &height.to_le_bytes())?;
        }

        let validators = pending.validators.len();
        let blocks = pending.blocks_by_height.len();
        *pending = PendingState::default();
        self.store.db.flush()?;
        info!(validators, blocks, "committed pending writes to durable storage");
        Ok(())
    }

    /// Discard every pending write without touching the durable trees.
    pub fn rollback(self) {
        let mut pending = self.store.pending.write().unwrap();
        let validators = pending.validators.len();
        let blocks = pending.blocks_by_height.len();
        *pending = PendingState::default();
        debug!(validators, blocks, "rolled back pending writes");
    }
}

/// A sled-backed store split into a durable, fsynced partition and an
/// in-memory pending overlay.
pub struct Store {
    db: Db,
    validators_tree: Tree,
    blocks_tree: Tree,
    pending: RwLock<PendingState>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let validators_tree = db.open_tree("validators")?;
        let blocks_tree = db.open_tree("blocks")?;
        Ok(Store {
            db,
            validators_tree,
            blocks_tree,
            pending: RwLock::new(PendingState::default()),
        })
    }

    /// Idempotent: writes a schema marker if absent, leaves it untouched
    /// otherwise.
    pub fn initialize_core_schema(&self) -> Result<(), StoreError> {
        if self.db.get(SCHEMA_KEY)?.is_none() {
            self.db.insert(SCHEMA_KEY, &SCHEMA_VERSION.to_le_bytes())?;
            self.db.flush()?;
        }
        Ok(())
    }

    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction { store: self }
    }

    pub fn store_validator(&self, record: ValidatorRecord) {
        self.pending
            .write()
            .unwrap()
            .validators
            .insert(record.validator_id.clone(), record);
    }

    /// Pending overrides durable on a key collision.
    pub fn load_validator(&self, validator_id: &str) -> Result<Option<ValidatorRecord>, StoreError> {
        if let Some(record) = self.pending.read().unwrap().validators.get(validator_id) {
            return Ok(Some(record.clone()));
        }
        match self.validators_tree.get(validator_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_all_validators(&self) -> Result<Vec<ValidatorRecord>, StoreError> {
        let pending = self.pending.read().unwrap();
        let mut merged: HashMap<String, ValidatorRecord> = HashMap::new();

        for entry in self.validators_tree.iter() {
            let (key, bytes) = entry?;
            if key.as_ref() == SCHEMA_KEY {
                continue;
            }
            let record: ValidatorRecord = bincode::deserialize(&bytes)?;
            merged.insert(record.validator_id.clone(), record);
        }
        for (id, record) in pending.validators.iter() {
            merged.insert(id.clone(), record.clone());
        }

        Ok(merged.into_values().collect())
    }

    pub fn update_validator_status(&self, validator_id: &str, status: u8) -> Result<(), StoreError> {
        if let Some(mut record) = self.load_validator(validator_id)? {
            record.status = status;
            self.store_validator(record);
        }
        Ok(())
    }

    pub fn get_validator_count(&self) -> Result<usize, StoreError> {
        Ok(self.load_all_validators()?.len())
    }

    pub fn store_block(&self, height: u64, hash: String, bytes: Vec<u8>) {
        let mut pending = self.pending.write().unwrap();
        pending.blocks_by_height.insert(height, bytes);
        pending.blocks_by_hash.insert(hash, height);
    }

    pub fn load_block_by_height(&self, height: u64) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.pending.read().unwrap().blocks_by_height.get(&height) {
            return Ok(Some(bytes.clone()));
        }
        Ok(self.blocks_tree.get(height_key(height).as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn load_block_by_hash(&self, hash: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let height = {
            let pending = self.pending.read().unwrap();
            if let Some(&height) = pending.blocks_by_hash.get(hash) {
                Some(height)
            } else if let Some(bytes) = self.blocks_tree.get(hash.as_bytes())? {
                Some(u64::from_le_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            } else {
                None
            }
        };
        match height {
            Some(height) => self.load_block_by_height(height),
            None => Ok(None),
        }
    }
}
