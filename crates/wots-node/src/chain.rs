//! The chain engine: header acceptance, block commit and fork choice.
//!
//! [`ChainEngine`] is the one context object a node builds at startup. It
//! owns the header tree, the current head and the [`UnspentDb`], and talks
//! to the external collaborators through [`Services`].
//!
//! Lock order is `commit` → `tree` → `head` → `orphans`. Commit, undo and
//! reorganisation hold `commit` for their whole duration; header
//! acceptance only takes `tree` and `orphans`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use wots_consensus::{BlockContext, BlockProcessor, ChainParams, TrustedTxChecker};
use wots_core::block_tree::{BlockTree, BlockTreeNode, NodeId, NodeStatus};
use wots_core::constants::{MAX_HEADERS_RESULTS, MAX_ORPHAN_HEADERS};
use wots_core::error::{ChainError, HeaderError, StorageError, WotsError};
use wots_core::pow::check_proof_of_work;
use wots_core::traits::{BlockRef, BlockStore, ScriptEngine, SignatureService};
use wots_core::types::{Block, BlockHeader, Hash256};
use wots_core::validation::{check_block_structure, check_transactions};

use crate::config::NodeConfig;
use crate::unspent::{IndexCallbacks, LoadOutcome, UnspentDb, UnspentOptions, UnspentStats};

/// External collaborators of the engine.
#[derive(Clone)]
pub struct Services {
    pub blocks: Arc<dyn BlockStore>,
    pub scripts: Arc<dyn ScriptEngine>,
    pub signatures: Arc<dyn SignatureService>,
}

/// Result class of [`ChainEngine::accept_header`], as reported to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderStatus {
    /// Linked into the tree for the first time.
    New,
    /// Known, body still wanted.
    AlreadyFresh,
    /// Known, body already seen.
    AlreadyOld,
    /// Not usable now; may become usable later (e.g. parent not yet known).
    RecoverableError(HeaderError),
    /// Invalid; the sender misbehaved.
    FatalError(HeaderError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOutcome {
    pub status: HeaderStatus,
    pub node: Option<NodeId>,
}

impl HeaderOutcome {
    fn new(status: HeaderStatus, node: Option<NodeId>) -> Self {
        Self { status, node }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub height: u32,
    pub head: String,
    pub headers: usize,
    pub best_header_height: u32,
    pub orphan_headers: usize,
    pub halted: bool,
    pub unspent: UnspentStats,
}

impl fmt::Display for ChainStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CHAIN: head {} @ {}, {} headers (best {}), {} orphans{}",
            self.head,
            self.height,
            self.headers,
            self.best_header_height,
            self.orphan_headers,
            if self.halted { ", HALTED" } else { "" }
        )?;
        write!(f, "{}", self.unspent)
    }
}

/// Headers waiting for their parent, keyed by parent hash.
#[derive(Default)]
struct OrphanHeaders {
    by_parent: HashMap<Hash256, Vec<BlockHeader>>,
    count: usize,
}

pub struct ChainEngine {
    params: ChainParams,
    services: Services,
    unspent: UnspentDb,
    commit: Mutex<()>,
    tree: Mutex<BlockTree>,
    head: Mutex<NodeId>,
    orphans: Mutex<OrphanHeaders>,
    trusted_tx: Option<TrustedTxChecker>,
    last_trusted: Option<Hash256>,
    halted: AtomicBool,
}

impl ChainEngine {
    /// Open the engine described by `config`: load the unspent index,
    /// rebuild the committed chain from the block store and apply the
    /// configured startup undo.
    pub fn open(config: &NodeConfig, services: Services) -> Result<(Self, LoadOutcome), WotsError> {
        Self::open_with(config, config.chain_params(), services, IndexCallbacks::default())
    }

    pub fn open_with(
        config: &NodeConfig,
        params: ChainParams,
        services: Services,
        callbacks: IndexCallbacks,
    ) -> Result<(Self, LoadOutcome), WotsError> {
        let options = UnspentOptions {
            dir: config.utxo_dir(),
            genesis_hash: params.genesis_hash(),
            unwind_len: config.unwind_buffer_len,
            volatile: config.volatile_utxo,
            write_undo_files: config.write_undo_files,
            save_time_target: config.save_time_target(),
        };
        let (unspent, outcome) = UnspentDb::open_with_callbacks(options, callbacks)?;
        let last_trusted = config.last_trusted_hash()?;

        let tree = BlockTree::new(params.genesis);
        let root = tree.root();
        let engine = Self {
            params,
            services,
            unspent,
            commit: Mutex::new(()),
            tree: Mutex::new(tree),
            head: Mutex::new(root),
            orphans: Mutex::new(OrphanHeaders::default()),
            trusted_tx: None,
            last_trusted,
            halted: AtomicBool::new(false),
        };
        engine.restore_chain()?;
        if outcome.needs_rescan {
            engine.rescan()?;
        }
        for _ in 0..config.undo_blocks {
            engine.undo_last_block()?;
        }
        info!(
            network = ?engine.params.network,
            height = engine.unspent.height(),
            hash = %engine.unspent.last_block_hash(),
            "chain engine ready"
        );
        Ok((engine, outcome))
    }

    /// Let transactions verified elsewhere skip script checks.
    pub fn set_trusted_tx_checker(&mut self, checker: Option<TrustedTxChecker>) {
        self.trusted_tx = checker;
    }

    /// Rebuild the tree from genesis up to the unspent index's tip by
    /// walking stored blocks backwards.
    fn restore_chain(&self) -> Result<(), WotsError> {
        let height = self.unspent.height();
        let mut cur = self.unspent.last_block_hash();
        let mut headers = Vec::with_capacity(height as usize);
        for h in (1..=height).rev() {
            let raw = self
                .services
                .blocks
                .get_raw(BlockRef::Hash(cur))
                .map_err(|e| ChainError::Restore(format!("block {cur} at height {h}: {e}")))?;
            let header = Block::decode(&raw)
                .map(|b| b.header)
                .map_err(|e| ChainError::Restore(format!("block {cur} at height {h}: {e}")))?;
            if header.hash() != cur {
                return Err(ChainError::Restore(format!("stored block at height {h} does not hash to {cur}")).into());
            }
            cur = header.prev_hash;
            headers.push(header);
        }
        if cur != self.params.genesis_hash() {
            return Err(ChainError::Restore(format!("chain ends at {cur}, not at genesis")).into());
        }

        let mut tree = self.tree.lock();
        let mut head = tree.root();
        for header in headers.into_iter().rev() {
            let id = tree.insert(header).map_err(|e| ChainError::Restore(e.to_string()))?;
            let node = tree.get_mut(id);
            node.status = NodeStatus::Committed;
            node.trusted = true;
            head = id;
        }
        *self.head.lock() = head;
        if height > 0 {
            info!(height, "committed chain restored from block store");
        }
        Ok(())
    }

    /// Re-apply every block the store holds on the committed chain after
    /// the index was lost.
    fn rescan(&self) -> Result<(), WotsError> {
        let mut applied = 0u32;
        loop {
            let height = self.unspent.height() + 1;
            let raw = match self.services.blocks.get_raw(BlockRef::Height(height)) {
                Ok(raw) => raw,
                Err(StorageError::BlockNotFound(_)) => break,
                Err(e) => return Err(e.into()),
            };
            let block = Block::decode(&raw)?;
            let node = self.accept_block_header_for(&block)?;
            self.tree.lock().get_mut(node).trusted = true;
            self.commit_block(&block, node)?;
            applied += 1;
        }
        if applied > 0 {
            info!(blocks = applied, height = self.unspent.height(), "rescan finished");
        }
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn unspent(&self) -> &UnspentDb {
        &self.unspent
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn head(&self) -> NodeId {
        *self.head.lock()
    }

    pub fn head_node(&self) -> BlockTreeNode {
        let tree = self.tree.lock();
        let head = *self.head.lock();
        tree.get(head).clone()
    }

    pub fn node(&self, id: NodeId) -> BlockTreeNode {
        self.tree.lock().get(id).clone()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.tree.lock().lookup(hash)
    }

    /// True when `a` has strictly more cumulative work than `b`.
    pub fn more_pow(&self, a: NodeId, b: NodeId) -> bool {
        self.tree.lock().more_pow(a, b)
    }

    /// Next node from `ancestor` towards `descendant`.
    pub fn find_path_to(&self, ancestor: NodeId, descendant: NodeId) -> Option<NodeId> {
        self.tree.lock().find_path_to(ancestor, descendant)
    }

    /// Decode and link a raw 80-byte header.
    pub fn accept_header(&self, raw: &[u8]) -> HeaderOutcome {
        match BlockHeader::decode(raw) {
            Ok(header) => self.accept_decoded_header(header),
            Err(e) => HeaderOutcome::new(HeaderStatus::FatalError(e.into()), None),
        }
    }

    pub fn accept_decoded_header(&self, header: BlockHeader) -> HeaderOutcome {
        let hash = header.hash();
        let mut tree = self.tree.lock();

        if let Some(id) = tree.lookup(&hash) {
            let node = tree.get(id);
            let status = match node.status {
                NodeStatus::Discarded => HeaderStatus::FatalError(HeaderError::Discarded(hash)),
                _ if node.has_body() => HeaderStatus::AlreadyOld,
                _ => HeaderStatus::AlreadyFresh,
            };
            return HeaderOutcome::new(status, Some(id));
        }

        if self.params.check_pow {
            if let Err(e) = check_proof_of_work(&hash, header.bits, self.params.pow_limit_bits) {
                warn!(%hash, error = %e, "header rejected");
                return HeaderOutcome::new(HeaderStatus::FatalError(e), None);
            }
        }

        let Some(parent) = tree.lookup(&header.prev_hash) else {
            drop(tree);
            return HeaderOutcome::new(HeaderStatus::RecoverableError(self.cache_orphan(header)), None);
        };
        let parent_discarded = tree.get(parent).status == NodeStatus::Discarded;

        let id = match tree.insert(header) {
            Ok(id) => id,
            Err(e) => return HeaderOutcome::new(HeaderStatus::FatalError(e), None),
        };
        if Some(hash) == self.last_trusted {
            let marked = tree.mark_trusted_chain(id);
            info!(%hash, marked, "trusted checkpoint reached");
        }
        debug!(%hash, height = tree.get(id).height, "header accepted");
        self.link_orphans(&mut tree, hash);

        if parent_discarded {
            warn!(%hash, parent = %header.prev_hash, "header extends a discarded block");
            return HeaderOutcome::new(HeaderStatus::RecoverableError(HeaderError::ParentDiscarded(header.prev_hash)), Some(id));
        }
        HeaderOutcome::new(HeaderStatus::New, Some(id))
    }

    fn cache_orphan(&self, header: BlockHeader) -> HeaderError {
        let mut guard = self.orphans.lock();
        let orphans = &mut *guard;
        if orphans.count >= MAX_ORPHAN_HEADERS {
            return HeaderError::OrphanCacheFull;
        }
        let waiting = orphans.by_parent.entry(header.prev_hash).or_default();
        if !waiting.contains(&header) {
            waiting.push(header);
            orphans.count += 1;
            debug!(hash = %header.hash(), parent = %header.prev_hash, "header cached until its parent arrives");
        }
        HeaderError::UnknownParent(header.prev_hash)
    }

    /// Insert every cached header that descends from `parent`.
    fn link_orphans(&self, tree: &mut BlockTree, parent: Hash256) {
        let mut pending = vec![parent];
        while let Some(hash) = pending.pop() {
            let children = {
                let mut orphans = self.orphans.lock();
                let children = orphans.by_parent.remove(&hash).unwrap_or_default();
                orphans.count -= children.len();
                children
            };
            for header in children {
                match tree.insert(header) {
                    Ok(id) => {
                        let child = header.hash();
                        if Some(child) == self.last_trusted {
                            tree.mark_trusted_chain(id);
                        }
                        debug!(hash = %child, height = tree.get(id).height, "cached header linked");
                        pending.push(child);
                    }
                    Err(e) => debug!(hash = %header.hash(), error = %e, "cached header dropped"),
                }
            }
        }
    }

    fn accept_block_header_for(&self, block: &Block) -> Result<NodeId, WotsError> {
        let outcome = self.accept_decoded_header(block.header);
        match (outcome.status, outcome.node) {
            (HeaderStatus::New | HeaderStatus::AlreadyFresh | HeaderStatus::AlreadyOld, Some(id)) => Ok(id),
            (HeaderStatus::RecoverableError(e) | HeaderStatus::FatalError(e), _) => Err(e.into()),
            (_, None) => Err(ChainError::UnknownNode.into()),
        }
    }

    /// Accept a full block: link its header, then commit it.
    pub fn accept_block(&self, block: &Block) -> Result<NodeId, WotsError> {
        let node = self.accept_block_header_for(block)?;
        self.commit_block(block, node)?;
        Ok(node)
    }

    fn discard(&self, node: NodeId, reason: &dyn fmt::Display) {
        let mut tree = self.tree.lock();
        let hash = tree.get(node).hash;
        let marked = tree.mark_discarded(node);
        warn!(%hash, descendants = marked.len().saturating_sub(1), reason = %reason, "block discarded");
    }

    /// Validate `block` as the body of `node` and commit it: extend the head
    /// directly, store it as a side branch, or reorganise onto it.
    pub fn commit_block(&self, block: &Block, node: NodeId) -> Result<(), WotsError> {
        let _commit = self.commit.lock();
        if self.is_halted() {
            return Err(ChainError::Halted.into());
        }

        let (hash, height, status, parent) = {
            let tree = self.tree.lock();
            let n = tree.get(node);
            (n.hash, n.height, n.status, n.parent)
        };
        if block.hash() != hash {
            return Err(ChainError::UnknownNode.into());
        }
        match status {
            NodeStatus::Discarded => return Err(HeaderError::Discarded(hash).into()),
            NodeStatus::Committed => return Ok(()),
            NodeStatus::HeaderOnly | NodeStatus::PendingValidation | NodeStatus::Orphaned => {}
        }

        if let Err(e) = check_block_structure(block) {
            if e.is_body_mismatch() {
                // Another body may still match this header.
                warn!(%hash, error = %e, "body does not match its header");
                return Err(e.into());
            }
            self.discard(node, &e);
            return Err(e.into());
        }
        if let Err(e) = check_transactions(&block.transactions, height, block.header.time) {
            self.discard(node, &e);
            return Err(e.into());
        }
        {
            let mut tree = self.tree.lock();
            let n = tree.get_mut(node);
            n.block_size = u32::try_from(block.serialized_size()).unwrap_or(u32::MAX);
            n.tx_count = block.transactions.len() as u32;
        }

        if parent == Some(self.head()) {
            self.connect(node, block)?;
        } else {
            self.services.blocks.add(height, &hash, &block.encode(), false)?;
            self.tree.lock().get_mut(node).status = NodeStatus::PendingValidation;
        }
        self.advance_to_best(node)
    }

    /// Move the head onto the heaviest stored chain through `node` when it
    /// has more work than the head. Bodies can arrive out of order, so that
    /// chain may end past `node`.
    fn advance_to_best(&self, node: NodeId) -> Result<(), WotsError> {
        let (best, head, better, extends_head) = {
            let tree = self.tree.lock();
            let head = *self.head.lock();
            let best = tree.best_stored_descendant(node);
            (best, head, tree.more_pow(best, head), tree.find_path_to(head, best).is_some())
        };
        if !better {
            if node != head {
                let n = self.node(node);
                info!(hash = %n.hash, height = n.height, "side-branch block stored");
            }
            return Ok(());
        }
        if extends_head {
            self.extend_head(head, best)
        } else {
            self.reorganize(best)
        }
    }

    /// Connect the stored bodies between the head and its descendant `tip`.
    /// Stops at the first missing or invalid body; what was connected stays.
    fn extend_head(&self, head: NodeId, tip: NodeId) -> Result<(), WotsError> {
        let path = {
            let tree = self.tree.lock();
            tree.path_between(head, tip).ok_or(ChainError::UnknownNode)?
        };
        for id in path {
            let hash = self.node(id).hash;
            let block = match self.load_block(&hash) {
                Ok(block) => block,
                Err(WotsError::Storage(StorageError::BlockNotFound(_))) => {
                    debug!(%hash, "stored chain interrupted by a missing body");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match self.connect(id, &block) {
                Ok(()) => {}
                Err(WotsError::Block(e)) => {
                    warn!(%hash, error = %e, "stored descendant rejected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Validate `block` against the unspent index and make `node` the head.
    /// The caller holds the commit lock and `node`'s parent is the head.
    fn connect(&self, node: NodeId, block: &Block) -> Result<(), WotsError> {
        let (hash, ctx) = {
            let tree = self.tree.lock();
            let n = tree.get(node);
            let ctx = BlockContext {
                height: n.height,
                last_known_height: tree.best_height(),
                unwind_len: self.unspent.unwind_len(),
                trusted: n.trusted,
            };
            (n.hash, ctx)
        };

        let processor = BlockProcessor::new(&self.params, &*self.services.scripts, &*self.services.signatures)
            .with_trusted_tx(self.trusted_tx.as_ref());
        let processed = match processor.process_block_transactions(block, &self.unspent, &ctx) {
            Ok(p) => p,
            Err(e) => {
                self.discard(node, &e);
                return Err(e.into());
            }
        };

        self.services.blocks.add(ctx.height, &hash, &block.encode(), true)?;
        if let Err(e) = self.unspent.apply_block(&processed.changes, &hash, &block.header.prev_hash) {
            self.halted.store(true, Ordering::Release);
            warn!(%hash, height = ctx.height, error = %e, "applying block to the unspent index failed, halting");
            return Err(e.into());
        }

        {
            let mut tree = self.tree.lock();
            let n = tree.get_mut(node);
            n.status = NodeStatus::Committed;
            n.trusted = true;
            n.sigops_cost = processed.sigops_cost;
            *self.head.lock() = node;
        }
        info!(
            %hash,
            height = ctx.height,
            txs = block.transactions.len(),
            fees = processed.fees,
            sigops = processed.sigops_cost,
            trusted = ctx.trusted,
            "block committed"
        );
        Ok(())
    }

    fn load_block(&self, hash: &Hash256) -> Result<Block, WotsError> {
        let raw = self.services.blocks.get_raw(BlockRef::Hash(*hash))?;
        Ok(Block::decode(&raw)?)
    }

    /// Switch the head to `new_tip`: undo back to the common ancestor, then
    /// commit the new branch oldest first.
    fn reorganize(&self, new_tip: NodeId) -> Result<(), WotsError> {
        let (undo_path, redo_path, ancestor_height) = {
            let tree = self.tree.lock();
            let head = *self.head.lock();
            let ancestor = tree.common_ancestor(head, new_tip);
            let mut undo = tree.path_between(ancestor, head).ok_or(ChainError::UnknownNode)?;
            undo.reverse();
            let redo = tree.path_between(ancestor, new_tip).ok_or(ChainError::UnknownNode)?;
            let undo: Vec<(NodeId, Hash256, Hash256)> = undo
                .into_iter()
                .map(|id| (id, tree.get(id).hash, tree.get(id).header.prev_hash))
                .collect();
            let redo: Vec<(NodeId, Hash256)> = redo.into_iter().map(|id| (id, tree.get(id).hash)).collect();
            (undo, redo, tree.get(ancestor).height)
        };

        // Fetch every body up front so a missing one leaves the head untouched.
        let mut undo_blocks = Vec::with_capacity(undo_path.len());
        for (id, hash, prev) in &undo_path {
            undo_blocks.push((*id, *prev, self.load_block(hash)?));
        }
        let mut redo_blocks = Vec::with_capacity(redo_path.len());
        for (id, hash) in &redo_path {
            match self.load_block(hash) {
                Ok(block) => redo_blocks.push((*id, block)),
                Err(WotsError::Storage(StorageError::BlockNotFound(_))) => {
                    info!(%hash, "branch body missing, keeping it as a side branch");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            ancestor_height,
            undo = undo_blocks.len(),
            redo = redo_blocks.len(),
            "reorganisation started"
        );
        for (id, prev, block) in &undo_blocks {
            if let Err(e) = self.unspent.undo_block(block, prev) {
                self.halted.store(true, Ordering::Release);
                warn!(hash = %block.hash(), error = %e, "undo during reorganisation failed, halting");
                return Err(e.into());
            }
            let mut tree = self.tree.lock();
            tree.get_mut(*id).status = NodeStatus::Orphaned;
            if let Some(parent) = tree.get(*id).parent {
                *self.head.lock() = parent;
            }
        }
        for (id, block) in &redo_blocks {
            if let Err(e) = self.connect(*id, block) {
                self.halted.store(true, Ordering::Release);
                let node = self.node(*id);
                warn!(hash = %node.hash, height = node.height, error = %e, "redo during reorganisation failed, halting");
                return Err(ChainError::ReorgRedoFailed { height: node.height, hash: node.hash, reason: e.to_string() }.into());
            }
        }
        let head = self.head_node();
        info!(height = head.height, hash = %head.hash, "reorganisation finished");
        Ok(())
    }

    /// Revert the head block.
    pub fn undo_last_block(&self) -> Result<(), WotsError> {
        let _commit = self.commit.lock();
        if self.is_halted() {
            return Err(ChainError::Halted.into());
        }
        let head = self.head_node();
        let Some(parent) = head.parent else {
            return Err(ChainError::NothingToUndo(head.height).into());
        };
        let block = self.load_block(&head.hash)?;
        self.unspent.undo_block(&block, &head.header.prev_hash)?;
        let mut tree = self.tree.lock();
        let id = tree.lookup(&head.hash).ok_or(ChainError::UnknownNode)?;
        tree.get_mut(id).status = NodeStatus::Orphaned;
        *self.head.lock() = parent;
        info!(height = head.height, hash = %head.hash, "head block undone");
        Ok(())
    }

    /// Locator for the current head.
    pub fn block_locator(&self) -> Vec<Hash256> {
        let tree = self.tree.lock();
        let head = *self.head.lock();
        tree.locator(head)
    }

    /// Headers on the committed chain after the best match in `locator`.
    pub fn headers_after(&self, locator: &[Hash256], max: usize) -> Vec<BlockHeader> {
        let tree = self.tree.lock();
        let head = *self.head.lock();
        tree.headers_after(locator, head, max.min(MAX_HEADERS_RESULTS))
    }

    /// Start a background snapshot save if the index is dirty.
    pub fn idle(&self) -> Result<bool, WotsError> {
        Ok(self.unspent.idle()?)
    }

    pub fn hurry_up(&self) {
        self.unspent.hurry_up();
    }

    pub fn stats(&self) -> ChainStats {
        let (headers, best_header_height) = {
            let tree = self.tree.lock();
            (tree.len(), tree.best_height())
        };
        ChainStats {
            height: self.unspent.height(),
            head: self.unspent.last_block_hash().to_string(),
            headers,
            best_header_height,
            orphan_headers: self.orphans.lock().count,
            halted: self.is_halted(),
            unspent: self.unspent.stats(),
        }
    }

    /// Final save; waits until the snapshot is on disk.
    pub fn close(&self) -> Result<(), WotsError> {
        let _commit = self.commit.lock();
        self.unspent.close()?;
        info!("chain engine closed");
        Ok(())
    }
}
