//! Criterion benchmarks for wots-node storage operations.
//!
//! Covers: block commit through the chain engine, snapshot encode/decode
//! and unspent lookups.

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::TempDir;

use wots_consensus::ChainParams;
use wots_consensus::testing::{MockScriptEngine, MockSignatureService, build_block, coinbase_tx, spend_tx};
use wots_core::constants::NetworkType;
use wots_core::records::{UtxoOut, UtxoRecord};
use wots_core::types::{Block, Hash256, OutPoint};
use wots_node::chain::{ChainEngine, Services};
use wots_node::snapshot::{SnapshotView, decode_snapshot, encode_snapshot};
use wots_node::{IndexCallbacks, MemoryBlockStore, NodeConfig};

fn open_engine(dir: &TempDir) -> ChainEngine {
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        network: NetworkType::Regtest,
        volatile_utxo: true,
        ..NodeConfig::default()
    };
    let params = ChainParams { coinbase_maturity: 1, ..ChainParams::regtest() };
    let services = Services {
        blocks: Arc::new(MemoryBlockStore::new()),
        scripts: Arc::new(MockScriptEngine::new()),
        signatures: Arc::new(MockSignatureService),
    };
    ChainEngine::open_with(&config, params, services, IndexCallbacks::default()).unwrap().0
}

/// Block 1 pays a 500-output coinbase; block 2 spends every output.
fn fan_out_blocks(engine: &ChainEngine) -> (Block, Block) {
    let genesis = engine.head_node();
    let mut cb = coinbase_tx(1, 0, 1);
    cb.outputs = (0..500).map(|_| cb.outputs[0].clone()).collect();
    for out in &mut cb.outputs {
        out.value = engine.params().subsidy(1) / 500;
    }
    let b1 = build_block(genesis.hash, genesis.header.time + 1, 0x207fffff, vec![cb.clone()]);
    let spends = (0..500)
        .map(|vout| spend_tx(&[OutPoint { txid: cb.txid(), vout }], &[(1_000, vec![0x51])]))
        .collect::<Vec<_>>();
    let mut txs = vec![coinbase_tx(2, engine.params().subsidy(2), 2)];
    txs.extend(spends);
    let b2 = build_block(b1.hash(), b1.header.time + 1, 0x207fffff, txs);
    (b1, b2)
}

fn bench_commit_block(c: &mut Criterion) {
    c.bench_function("commit_block_500_spends", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let engine = open_engine(&dir);
                let (b1, b2) = fan_out_blocks(&engine);
                engine.accept_block(&b1).unwrap();
                (dir, engine, b2)
            },
            |(_dir, engine, b2)| {
                engine.accept_block(black_box(&b2)).unwrap();
            },
        )
    });
}

fn synthetic_view(records: u32) -> SnapshotView {
    let mut utxo = HashMap::new();
    for i in 0..records {
        let mut txid = [0u8; 32];
        txid[..4].copy_from_slice(&i.to_le_bytes());
        let mut rec = UtxoRecord::with_holes(Hash256(txid), false, i, 2);
        rec.outs[1] = Some(UtxoOut { value: u64::from(i) + 1, pk_script: vec![0x51; 25] });
        if let Some(bytes) = rec.serialize(false) {
            utxo.insert(rec.key(), bytes);
        }
    }
    SnapshotView { height: records, hash: Hash256([7; 32]), utxo: Arc::new(utxo), upkh: Arc::new(HashMap::new()) }
}

fn bench_snapshot(c: &mut Criterion) {
    let view = synthetic_view(50_000);
    c.bench_function("snapshot_encode_50k", |b| b.iter(|| encode_snapshot(black_box(&view))));
    let bytes = encode_snapshot(&view);
    c.bench_function("snapshot_decode_50k", |b| b.iter(|| decode_snapshot(black_box(&bytes)).unwrap()));
}

fn bench_unspent_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let (b1, _) = fan_out_blocks(&engine);
    engine.accept_block(&b1).unwrap();
    let txid = b1.transactions[0].txid();
    let hit = OutPoint { txid, vout: 250 };
    let miss = OutPoint { txid: Hash256([0xff; 32]), vout: 0 };

    c.bench_function("unspent_lookup", |b| b.iter(|| engine.unspent().get_output(black_box(&hit))));
    c.bench_function("unspent_lookup_miss", |b| b.iter(|| engine.unspent().get_output(black_box(&miss))));
}

criterion_group!(benches, bench_commit_block, bench_snapshot, bench_unspent_lookup);
criterion_main!(benches);
