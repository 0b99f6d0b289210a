//! End-to-end exercise of the control flow described in spec.md §2: a
//! signed transaction batch becomes a block, the block is appended to the
//! chain, PoA consensus collects signatures to quorum, and the validator
//! set is persisted durably across a reopen.

use fleetledger::block::Block;
use fleetledger::chain::Chain;
use fleetledger::consensus::{PoAConfig, PoAConsensus};
use fleetledger::key::Key;
use fleetledger::store::{Store, ValidatorRecord};
use fleetledger::transaction::Transaction;
use fleetledger::validator::ValidatorStatus;

#[test]
fn full_ledger_flow_from_transaction_to_finalized_block() {
    let system_key = Key::generate();
    let chain: Chain<String> = Chain::new(
        "fleet-rover-1",
        "genesis-tx",
        "ChainTestData{init,system}".to_string(),
        &system_key,
    )
    .unwrap();

    let consensus = PoAConsensus::new(PoAConfig {
        initial_required_signatures: 2,
        minimum_required_signatures: 1,
        ..PoAConfig::default()
    });

    let alice_key = Key::generate();
    let bob_key = Key::generate();
    let alice_id = consensus.add_validator("alice", alice_key.clone(), 1, 0).unwrap();
    let bob_id = consensus.add_validator("bob", bob_key.clone(), 1, 0).unwrap();

    let mut tx = Transaction::new("move-arm:45deg".to_string(), 5);
    tx.sign_with(&alice_key).unwrap();
    assert!(tx.is_valid());

    let block = Block::new(1, chain.head_hash(), vec![tx], 0);
    block.set_proposer(alice_id.clone());

    let proposal_id = consensus.create_proposal(&block.hash, &alice_id, 0);
    assert_eq!(proposal_id, format!("proposal_{}", block.hash));

    let sig_a = alice_key.sign(block.hash.as_bytes()).unwrap();
    let reached = consensus
        .add_signature(&proposal_id, &alice_id, sig_a.clone(), 10)
        .unwrap();
    assert!(!reached, "one signature should not reach a quorum of 2");
    block
        .add_validator_signature(alice_id.clone(), "alice".to_string(), sig_a, 10)
        .unwrap();

    let sig_b = bob_key.sign(block.hash.as_bytes()).unwrap();
    let reached = consensus
        .add_signature(&proposal_id, &bob_id, sig_b.clone(), 20)
        .unwrap();
    assert!(reached, "second signature should push the proposal over quorum");
    block
        .add_validator_signature(bob_id.clone(), "bob".to_string(), sig_b, 20)
        .unwrap();

    assert!(consensus.is_proposal_ready(&proposal_id));
    assert_eq!(consensus.get_finalized_signatures(&proposal_id).unwrap().len(), 2);
    assert_eq!(block.count_valid_signatures(), 2);

    chain.add_block(block).unwrap();
    assert_eq!(chain.height(), 2);
    assert!(chain.is_valid());

    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::open(dir.path()).unwrap();
        store.initialize_core_schema().unwrap();
        for validator in consensus.get_all_validators() {
            store.store_validator(ValidatorRecord {
                validator_id: validator.id(),
                participant_id: validator.participant_id().to_string(),
                identity_data: validator.identity().serialize(),
                weight: validator.weight(),
                status: match validator.status() {
                    ValidatorStatus::Active => 0,
                    ValidatorStatus::Offline => 1,
                    ValidatorStatus::Revoked => 2,
                },
                last_seen_ms: validator.last_seen_ms(),
            });
        }
        store.begin_transaction().commit().unwrap();
    }

    let store = Store::open(dir.path()).unwrap();
    let restored = store.load_all_validators().unwrap();
    assert_eq!(restored.len(), 2);
    let restored_alice = restored.iter().find(|r| r.validator_id == alice_id).unwrap();
    let restored_key = Key::deserialize(&restored_alice.identity_data).unwrap();
    assert_eq!(restored_key.id(), alice_key.id());
}

#[test]
fn rejected_block_never_reaches_the_chain() {
    let system_key = Key::generate();
    let chain: Chain<String> = Chain::new(
        "fleet-rover-2",
        "genesis-tx",
        "ChainTestData{init,system}".to_string(),
        &system_key,
    )
    .unwrap();
    let key = Key::generate();
    let mut tx = Transaction::new("dead-reckon".to_string(), 0);
    tx.sign_with(&key).unwrap();

    let mut bad_block = Block::new(1, chain.head_hash(), vec![tx], 0);
    bad_block.hash = "tampered-hash".to_string();

    assert!(chain.add_block(bad_block).is_err());
    assert_eq!(chain.height(), 1, "a rejected block must not be appended");
}
