//! Shared harness for the integration tests.

use std::sync::Arc;

use tempfile::TempDir;

use wots_consensus::ChainParams;
use wots_consensus::testing::{
    MockScriptEngine, MockSignatureService, build_block, coinbase_tx, spend_tx, xnyss_script_sig,
};
use wots_core::block_tree::BlockTreeNode;
use wots_core::constants::NetworkType;
use wots_core::error::WotsError;
use wots_core::sighash::SIGHASH_ALL;
use wots_core::types::{Block, Hash256, OutPoint, Transaction, TxOut};
use wots_node::chain::{ChainEngine, Services};
use wots_node::{IndexCallbacks, MemoryBlockStore, NodeConfig};

/// Regtest rules with coinbase outputs spendable one block later.
pub fn params() -> ChainParams {
    ChainParams { coinbase_maturity: 1, ..ChainParams::regtest() }
}

/// A chain engine over its own temporary data directory.
pub struct TestChain {
    pub engine: ChainEngine,
    pub store: Arc<MemoryBlockStore>,
    pub scripts: Arc<MockScriptEngine>,
    pub config: NodeConfig,
    dir: TempDir,
}

impl TestChain {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        Self::build(tweak, MockScriptEngine::new())
    }

    pub fn build(tweak: impl FnOnce(&mut NodeConfig), scripts: MockScriptEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            network: NetworkType::Regtest,
            unwind_buffer_len: 32,
            utxo_save_secs: 0,
            ..NodeConfig::default()
        };
        tweak(&mut config);
        Self::open(dir, config, Arc::new(MemoryBlockStore::new()), Arc::new(scripts))
    }

    fn open(dir: TempDir, config: NodeConfig, store: Arc<MemoryBlockStore>, scripts: Arc<MockScriptEngine>) -> Self {
        let services = Services {
            blocks: store.clone(),
            scripts: scripts.clone(),
            signatures: Arc::new(MockSignatureService),
        };
        let (engine, _) = ChainEngine::open_with(&config, params(), services, IndexCallbacks::default()).unwrap();
        Self { engine, store, scripts, config, dir }
    }

    /// Drop the engine without flushing and open a new one on the same
    /// directory and block store.
    pub fn reopen(self) -> Self {
        let Self { engine, store, scripts, config, dir } = self;
        drop(engine);
        Self::open(dir, config, store, scripts)
    }

    pub fn head(&self) -> BlockTreeNode {
        self.engine.head_node()
    }

    fn node_of(&self, hash: &Hash256) -> BlockTreeNode {
        let id = self.engine.lookup(hash).unwrap();
        self.engine.node(id)
    }

    /// Mined block on top of `parent` whose coinbase claims the subsidy,
    /// followed by `extra`.
    pub fn block_on(&self, parent: &Hash256, tag: u8, extra: Vec<Transaction>) -> Block {
        let parent = self.node_of(parent);
        let height = parent.height + 1;
        let mut txs = vec![coinbase_tx(height, params().subsidy(height), tag)];
        txs.extend(extra);
        build_block(parent.hash, parent.header.time + 1, parent.header.bits, txs)
    }

    /// Mine `block_on(head)` and commit it.
    pub fn extend(&self, tag: u8, extra: Vec<Transaction>) -> Result<Block, WotsError> {
        let block = self.block_on(&self.head().hash, tag, extra);
        self.engine.accept_block(&block)?;
        Ok(block)
    }

    /// Commit a block whose coinbase pays `outputs` equal shares of the
    /// subsidy to `pk_script`.
    pub fn extend_fan_out(&self, tag: u8, outputs: usize, pk_script: Vec<u8>) -> Result<Block, WotsError> {
        let head = self.head();
        let height = head.height + 1;
        let mut cb = coinbase_tx(height, 0, tag);
        let share = params().subsidy(height) / outputs as u64;
        cb.outputs = (0..outputs).map(|_| TxOut { value: share, pk_script: pk_script.clone() }).collect();
        let block = build_block(head.hash, head.header.time + 1, head.header.bits, vec![cb]);
        self.engine.accept_block(&block)?;
        Ok(block)
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

pub fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint { txid: tx.txid(), vout }
}

/// Coinbase output 0 of `block`.
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    outpoint(&block.transactions[0], 0)
}

/// Spend of an XNYSS-locked output signed by `pubkey`, advertising
/// `children` as its next key commitments.
pub fn xnyss_spend(prev: OutPoint, value: u64, pubkey: &[u8], children: &[Hash256]) -> Transaction {
    let mut tx = spend_tx(&[prev], &[(value, vec![0x51])]);
    let mut sig = MockSignatureService::signature(pubkey, children);
    sig.push(SIGHASH_ALL as u8);
    tx.inputs[0].script_sig = xnyss_script_sig(&[sig]);
    tx
}
