//! Hostile inputs against the chain engine.
//!
//! Attack vectors covered:
//! - orphan header floods
//! - invalid blocks hidden behind a heavier branch
//! - scripts that fail verification
//! - bodies whose parent was never announced

use wots_consensus::testing::{MockScriptEngine, spend_tx};
use wots_core::block_tree::NodeStatus;
use wots_core::constants::{MAX_ORPHAN_HEADERS, opcodes::OP_1};
use wots_core::error::{BlockError, ChainError, HeaderError, WotsError};
use wots_core::pow::check_proof_of_work;
use wots_core::types::{BlockHeader, Hash256, OutPoint};
use wots_node::chain::HeaderStatus;
use wots_tests::helpers::{TestChain, coinbase_outpoint};

fn orphan_header(seed: u32) -> BlockHeader {
    let mut prev = [0u8; 32];
    prev[..4].copy_from_slice(&seed.to_le_bytes());
    prev[31] = 0xee;
    let mut header = BlockHeader {
        version: 1,
        prev_hash: Hash256(prev),
        merkle_root: Hash256::ZERO,
        time: 1_296_688_700,
        bits: 0x207fffff,
        nonce: 0,
    };
    while check_proof_of_work(&header.hash(), header.bits, header.bits).is_err() {
        header.nonce += 1;
    }
    header
}

#[test]
fn orphan_header_flood_is_bounded() {
    let chain = TestChain::new();
    for seed in 0..MAX_ORPHAN_HEADERS as u32 {
        let outcome = chain.engine.accept_header(&orphan_header(seed).encode());
        assert!(matches!(outcome.status, HeaderStatus::RecoverableError(HeaderError::UnknownParent(_))));
    }
    let overflow = chain.engine.accept_header(&orphan_header(u32::MAX).encode());
    assert_eq!(overflow.status, HeaderStatus::RecoverableError(HeaderError::OrphanCacheFull));
    assert_eq!(chain.engine.stats().orphan_headers, MAX_ORPHAN_HEADERS);
}

#[test]
fn header_above_target_is_fatal() {
    let chain = TestChain::new();
    let mut header = orphan_header(1);
    header.prev_hash = chain.head().hash;
    // Find a nonce that misses the target.
    while check_proof_of_work(&header.hash(), header.bits, header.bits).is_ok() {
        header.nonce += 1;
    }
    let outcome = chain.engine.accept_header(&header.encode());
    assert!(matches!(outcome.status, HeaderStatus::FatalError(HeaderError::HighHash(_))));
    assert!(outcome.node.is_none());
}

#[test]
fn failed_reorg_redo_halts_the_engine() {
    let chain = TestChain::new();
    let genesis = chain.head().hash;
    chain.extend(1, vec![]).unwrap();

    let b1 = chain.block_on(&genesis, 11, vec![]);
    chain.engine.accept_block(&b1).unwrap();
    let phantom = OutPoint { txid: Hash256([0x99; 32]), vout: 0 };
    let b2 = chain.block_on(&b1.hash(), 12, vec![spend_tx(&[phantom], &[(1, vec![0x51])])]);

    let err = chain.engine.accept_block(&b2).unwrap_err();
    assert!(matches!(err, WotsError::Chain(ChainError::ReorgRedoFailed { height: 2, hash, .. }) if hash == b2.hash()));
    assert!(chain.engine.is_halted());
    assert!(err.is_fatal());
    // The engine stops where the redo failed.
    assert_eq!(chain.head().hash, b1.hash());
    let id = chain.engine.lookup(&b2.hash()).unwrap();
    assert_eq!(chain.engine.node(id).status, NodeStatus::Discarded);

    let next = chain.block_on(&b1.hash(), 13, vec![]);
    assert_eq!(chain.engine.accept_block(&next).unwrap_err(), WotsError::Chain(ChainError::Halted));
    assert_eq!(chain.engine.undo_last_block().unwrap_err(), WotsError::Chain(ChainError::Halted));
    assert_eq!(chain.head().hash, b1.hash());
}

#[test]
fn rejected_script_fails_block() {
    let chain = TestChain::build(|_| {}, MockScriptEngine::rejecting(vec![OP_1]));
    let b1 = chain.extend(1, vec![]).unwrap();
    let spend = spend_tx(&[coinbase_outpoint(&b1)], &[(1_000, vec![0x51])]);
    let err = chain.extend(2, vec![spend.clone()]).unwrap_err();
    assert_eq!(err, WotsError::Block(BlockError::ScriptVerification { txid: spend.txid(), failures: 1 }));
    assert_eq!(chain.engine.unspent().height(), 1);
}

#[test]
fn trusted_checkpoint_skips_script_checks() {
    // Mine the blocks once on a scratch chain.
    let scratch = TestChain::new();
    let b1 = scratch.extend(1, vec![]).unwrap();
    let b2 = scratch.extend(2, vec![spend_tx(&[coinbase_outpoint(&b1)], &[(1_000, vec![0x51])])]).unwrap();
    let b3 = scratch.extend(3, vec![spend_tx(&[coinbase_outpoint(&b2)], &[(1_000, vec![0x52])])]).unwrap();

    let chain = TestChain::with_config(|c| c.last_trusted_block = Some(b2.hash().to_string()));
    for block in [&b1, &b2, &b3] {
        assert_eq!(chain.engine.accept_header(&block.header.encode()).status, HeaderStatus::New);
    }
    chain.engine.accept_block(&b1).unwrap();
    chain.engine.accept_block(&b2).unwrap();
    assert_eq!(chain.scripts.verify_calls(), 0);

    chain.engine.accept_block(&b3).unwrap();
    assert_eq!(chain.scripts.verify_calls(), 1);
    assert_eq!(chain.head().hash, b3.hash());
}

#[test]
fn body_without_known_parent_is_recoverable() {
    let scratch = TestChain::new();
    scratch.extend(1, vec![]).unwrap();
    let b2 = scratch.extend(2, vec![]).unwrap();

    let chain = TestChain::new();
    let err = chain.engine.accept_block(&b2).unwrap_err();
    assert_eq!(err, WotsError::Header(HeaderError::UnknownParent(b2.header.prev_hash)));
    assert!(!err.is_fatal());
    assert_eq!(chain.engine.stats().orphan_headers, 1);
}
