//! State-machine properties of commit, undo, reorganisation and snapshots.
//!
//! - N blocks applied then undone restore the indexes exactly
//! - rejected blocks leave both indexes untouched
//! - in-block double spends and duplicate key hashes are rejected
//! - the heavier branch wins and the abandoned branch's effects disappear
//! - a snapshot reloads to the same bytes
//! - a commit during a background save neither blocks nor over-claims

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use wots_consensus::testing::{spend_tx, xnyss_lock_script};
use wots_core::block_tree::NodeStatus;
use wots_core::crypto::sha256;
use wots_core::error::{BlockError, WotsError};
use wots_core::types::OutPoint;
use wots_node::snapshot::{SNAPSHOT_FILE, load_latest};
use wots_tests::helpers::{TestChain, coinbase_outpoint, outpoint, xnyss_spend};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn apply_then_undo_restores_indexes(picks in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..6)) {
        let chain = TestChain::new();
        let start = chain.engine.unspent().content();

        // Live outputs with their values, spendable by the next block.
        let mut pool: Vec<(OutPoint, u64)> = Vec::new();
        for (n, block_picks) in picks.iter().enumerate() {
            let tag = n as u8 + 1;
            let mut spends = Vec::new();
            for pick in block_picks {
                if pool.is_empty() {
                    break;
                }
                let (prev, value) = pool.swap_remove(pick.index(pool.len()));
                if value < 4 {
                    continue;
                }
                let half = value / 2;
                spends.push(spend_tx(&[prev], &[(half, vec![0x51, tag]), (half - 1, vec![0x52, tag])]));
            }
            let block = chain.extend(tag, spends).unwrap();
            for tx in &block.transactions {
                for (vout, out) in tx.outputs.iter().enumerate() {
                    pool.push((outpoint(tx, vout as u32), out.value));
                }
            }
        }
        prop_assert_eq!(chain.engine.unspent().height(), picks.len() as u32);

        for _ in 0..picks.len() {
            chain.engine.undo_last_block().unwrap();
        }
        prop_assert_eq!(chain.engine.unspent().content(), start);
    }
}

#[test]
fn overspend_rejected_without_touching_indexes() {
    let chain = TestChain::new();
    let b1 = chain.extend(1, vec![]).unwrap();
    let before = chain.engine.unspent().content();
    let value = b1.transactions[0].outputs[0].value;

    let greedy = spend_tx(&[coinbase_outpoint(&b1)], &[(value + 1, vec![0x51])]);
    let block = chain.block_on(&b1.hash(), 2, vec![greedy.clone()]);
    let err = chain.engine.accept_block(&block).unwrap_err();
    assert!(matches!(err, WotsError::Block(BlockError::Overspend { txid, .. }) if txid == greedy.txid()));

    assert_eq!(chain.engine.unspent().content(), before);
    assert_eq!(chain.head().hash, b1.hash());
    let node = chain.engine.lookup(&block.hash()).unwrap();
    assert_eq!(chain.engine.node(node).status, NodeStatus::Discarded);
}

#[test]
fn double_spend_inside_block_rejected() {
    let chain = TestChain::new();
    let b1 = chain.extend(1, vec![]).unwrap();
    let prev = coinbase_outpoint(&b1);
    let a = spend_tx(&[prev], &[(1_000, vec![0x51])]);
    let b = spend_tx(&[prev], &[(2_000, vec![0x51])]);
    let before = chain.engine.unspent().content();

    let err = chain.extend(2, vec![a, b]).unwrap_err();
    assert_eq!(err, WotsError::Block(BlockError::DoubleSpendInBlock { txid: prev.txid, vout: 0 }));
    assert_eq!(chain.engine.unspent().content(), before);
}

#[test]
fn duplicate_key_hash_rejected() {
    let chain = TestChain::new();
    let funding = chain.extend_fan_out(1, 2, xnyss_lock_script()).unwrap();
    let cb = &funding.transactions[0];
    let a = xnyss_spend(outpoint(cb, 0), 1_000, b"shared-key", &[sha256(b"child-a")]);
    let b = xnyss_spend(outpoint(cb, 1), 1_000, b"shared-key", &[sha256(b"child-b")]);
    let before = chain.engine.unspent().content();

    let err = chain.extend(2, vec![a, b]).unwrap_err();
    assert_eq!(err, WotsError::Block(BlockError::DuplicateUpkh(sha256(b"shared-key"))));
    assert_eq!(chain.engine.unspent().content(), before);
}

#[test]
fn heavier_branch_reorganises_and_drops_abandoned_effects() {
    let chain = TestChain::new();
    let genesis = chain.head().hash;

    // Branch A reaches height 2 and spends its own coinbase.
    let a1 = chain.extend(1, vec![]).unwrap();
    let a_spend = spend_tx(&[coinbase_outpoint(&a1)], &[(5_000, vec![0x51, 0xaa])]);
    let a2 = chain.extend(2, vec![a_spend.clone()]).unwrap();
    assert!(chain.engine.unspent().get_record(&a_spend.txid()).is_some());

    // Branch B reaches height 3 from genesis.
    let b1 = chain.block_on(&genesis, 11, vec![]);
    chain.engine.accept_block(&b1).unwrap();
    let b_spend = spend_tx(&[coinbase_outpoint(&b1)], &[(7_000, vec![0x51, 0xbb])]);
    let b2 = chain.block_on(&b1.hash(), 12, vec![b_spend.clone()]);
    chain.engine.accept_block(&b2).unwrap();
    assert_eq!(chain.head().hash, a2.hash());

    let b3 = chain.block_on(&b2.hash(), 13, vec![]);
    chain.engine.accept_block(&b3).unwrap();

    assert_eq!(chain.head().hash, b3.hash());
    assert_eq!(chain.engine.unspent().height(), 3);
    assert_eq!(chain.engine.unspent().last_block_hash(), b3.hash());
    let unspent = chain.engine.unspent();
    assert!(unspent.get_record(&a1.transactions[0].txid()).is_none());
    assert!(unspent.get_record(&a2.transactions[0].txid()).is_none());
    assert!(unspent.get_record(&a_spend.txid()).is_none());
    assert!(unspent.get_record(&b_spend.txid()).is_some());
    assert!(unspent.get_output(&coinbase_outpoint(&b1)).is_none());
    for block in [&a1, &a2] {
        let id = chain.engine.lookup(&block.hash()).unwrap();
        assert_eq!(chain.engine.node(id).status, NodeStatus::Orphaned);
    }
}

#[test]
fn snapshot_reload_reproduces_bytes() {
    let chain = TestChain::new();
    let funding = chain.extend_fan_out(1, 3, xnyss_lock_script()).unwrap();
    let cb = &funding.transactions[0];
    let spend = xnyss_spend(outpoint(cb, 0), 1_000, b"root-key", &[sha256(b"next-key")]);
    chain.extend(2, vec![spend]).unwrap();
    chain.extend(3, vec![]).unwrap();
    chain.engine.close().unwrap();

    let content = chain.engine.unspent().content();
    assert!(!content.upkh.is_empty());
    let loaded = load_latest(&chain.config.utxo_dir()).unwrap();
    assert_eq!(loaded.height, 3);
    assert_eq!(loaded.hash, content.hash);
    assert_eq!(loaded.utxo.into_iter().collect::<BTreeMap<_, _>>(), content.utxo);
    assert_eq!(loaded.upkh.into_iter().collect::<BTreeMap<_, _>>(), content.upkh);

    let reopened = chain.reopen();
    assert_eq!(reopened.engine.unspent().content(), content);
}

#[test]
fn commit_during_background_save_does_not_block() {
    // An hour-long write budget keeps the save paced well past the commit.
    let chain = TestChain::with_config(|c| c.utxo_save_secs = 3_600);
    let funding = chain.extend_fan_out(1, 200, vec![0x51]).unwrap();
    let cb = funding.transactions[0].clone();
    let spends = (0..200u32).map(|vout| spend_tx(&[outpoint(&cb, vout)], &[(10_000, vec![0x51])])).collect();
    chain.extend(2, spends).unwrap();

    assert!(chain.engine.idle().unwrap());
    assert!(chain.engine.unspent().is_writing());

    let next = chain.block_on(&chain.head().hash, 3, vec![]);
    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|s| {
        s.spawn(|| {
            let result = chain.engine.accept_block(&next);
            let _ = done_tx.send(result);
        });
        let result = done_rx.recv_timeout(Duration::from_secs(30)).expect("commit blocked behind the save");
        result.unwrap();
    });

    assert_eq!(chain.engine.unspent().height(), 3);
    // The cancelled save must not have published a snapshot.
    assert!(!chain.config.utxo_dir().join(SNAPSHOT_FILE).exists());
    assert!(load_latest(&chain.config.utxo_dir()).is_none());

    chain.engine.close().unwrap();
    let loaded = load_latest(&chain.config.utxo_dir()).unwrap();
    assert_eq!(loaded.height, 3);
    assert_eq!(loaded.hash, next.hash());
}
