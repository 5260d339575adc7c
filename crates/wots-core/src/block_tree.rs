//! Header tree: an arena of [`BlockTreeNode`]s addressed by [`NodeId`].
//!
//! Every known header gets exactly one node, linked to its parent by id and
//! listed in the parent's children. Cumulative proof-of-work is cached per
//! node at insertion so fork choice is a single comparison.
//!
//! Nodes are never removed; a header that failed validation stays in the
//! tree with [`NodeStatus::Discarded`] so that it and its descendants are
//! recognised and refused.

use std::collections::HashMap;

use primitive_types::U256;

use crate::error::HeaderError;
use crate::pow::block_proof;
use crate::types::{BlockHeader, Hash256};

/// Stable handle into a [`BlockTree`]. Only valid for the tree that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Lifecycle of a block as seen by the chain engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Header known, body not yet seen.
    HeaderOnly,
    /// Body received and structurally checked, not yet connected.
    PendingValidation,
    /// Connected to the current best chain.
    Committed,
    /// Body stored on a side branch, or disconnected by a reorganisation.
    Orphaned,
    /// Failed validation, or descends from a block that did.
    Discarded,
}

#[derive(Clone, Debug)]
pub struct BlockTreeNode {
    pub hash: Hash256,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub height: u32,
    pub header: BlockHeader,
    pub block_size: u32,
    pub tx_count: u32,
    pub sigops_cost: u64,
    /// Skip script verification for this block.
    pub trusted: bool,
    /// Sum of block proofs from the root up to and including this node.
    pub chain_work: U256,
    pub status: NodeStatus,
}

impl BlockTreeNode {
    pub fn has_body(&self) -> bool {
        !matches!(self.status, NodeStatus::HeaderOnly)
    }
}

pub struct BlockTree {
    nodes: Vec<BlockTreeNode>,
    by_hash: HashMap<Hash256, NodeId>,
    best_height: u32,
}

impl BlockTree {
    /// Create a tree rooted at `genesis`, which counts as committed and trusted.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let root = BlockTreeNode {
            hash,
            parent: None,
            children: Vec::new(),
            height: 0,
            header: genesis,
            block_size: 0,
            tx_count: 0,
            sigops_cost: 0,
            trusted: true,
            chain_work: block_proof(genesis.bits),
            status: NodeStatus::Committed,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, NodeId(0));
        Self { nodes: vec![root], by_hash, best_height: 0 }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Greatest height of any non-discarded header.
    pub fn best_height(&self) -> u32 {
        self.best_height
    }

    pub fn get(&self, id: NodeId) -> &BlockTreeNode {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut BlockTreeNode {
        &mut self.nodes[id.0]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    /// Link a new header under its parent. A header whose parent is
    /// discarded is inserted already discarded.
    pub fn insert(&mut self, header: BlockHeader) -> Result<NodeId, HeaderError> {
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(HeaderError::Duplicate(hash));
        }
        let parent_id = self
            .lookup(&header.prev_hash)
            .ok_or(HeaderError::UnknownParent(header.prev_hash))?;
        let parent = &self.nodes[parent_id.0];
        let status = if parent.status == NodeStatus::Discarded {
            NodeStatus::Discarded
        } else {
            NodeStatus::HeaderOnly
        };
        let node = BlockTreeNode {
            hash,
            parent: Some(parent_id),
            children: Vec::new(),
            height: parent.height + 1,
            header,
            block_size: 0,
            tx_count: 0,
            sigops_cost: 0,
            trusted: false,
            chain_work: parent.chain_work.saturating_add(block_proof(header.bits)),
            status,
        };
        let id = NodeId(self.nodes.len());
        if status != NodeStatus::Discarded {
            self.best_height = self.best_height.max(node.height);
        }
        self.nodes.push(node);
        self.nodes[parent_id.0].children.push(id);
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// True when `a` carries strictly more cumulative work than `b`.
    pub fn more_pow(&self, a: NodeId, b: NodeId) -> bool {
        self.get(a).chain_work > self.get(b).chain_work
    }

    /// Ancestor of `id` at `height` (or `id` itself at its own height).
    pub fn ancestor_at(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut cur = id;
        if self.get(cur).height < height {
            return None;
        }
        while self.get(cur).height > height {
            cur = self.get(cur).parent?;
        }
        Some(cur)
    }

    /// The node one step from `ancestor` towards `descendant`, or `None` if
    /// `descendant` does not descend from `ancestor`.
    pub fn find_path_to(&self, ancestor: NodeId, descendant: NodeId) -> Option<NodeId> {
        let target = self.get(ancestor).height.checked_add(1)?;
        let step = self.ancestor_at(descendant, target)?;
        (self.get(step).parent == Some(ancestor)).then_some(step)
    }

    /// Nodes strictly after `ancestor` up to and including `descendant`,
    /// oldest first.
    pub fn path_between(&self, ancestor: NodeId, descendant: NodeId) -> Option<Vec<NodeId>> {
        let stop = self.get(ancestor).height;
        let mut path = Vec::new();
        let mut cur = descendant;
        while self.get(cur).height > stop {
            path.push(cur);
            cur = self.get(cur).parent?;
        }
        if cur != ancestor {
            return None;
        }
        path.reverse();
        Some(path)
    }

    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let (mut a, mut b) = (a, b);
        while self.get(a).height > self.get(b).height {
            a = self.get(a).parent.unwrap_or(a);
        }
        while self.get(b).height > self.get(a).height {
            b = self.get(b).parent.unwrap_or(b);
        }
        while a != b {
            match (self.get(a).parent, self.get(b).parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                // Both nodes descend from the root, so this is unreachable
                // for ids issued by this tree.
                _ => return self.root(),
            }
        }
        a
    }

    /// Mark `id` and all its descendants discarded. Returns the newly marked ids.
    pub fn mark_discarded(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut marked = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let node = &mut self.nodes[cur.0];
            if node.status != NodeStatus::Discarded {
                node.status = NodeStatus::Discarded;
                marked.push(cur);
            }
            stack.extend(node.children.iter().copied());
        }
        marked
    }

    /// Mark `id` and every ancestor trusted. Returns how many changed.
    pub fn mark_trusted_chain(&mut self, id: NodeId) -> usize {
        let mut changed = 0;
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = &mut self.nodes[c.0];
            if node.trusted {
                break;
            }
            node.trusted = true;
            changed += 1;
            cur = node.parent;
        }
        changed
    }

    /// Block locator for `tip`: the last ten hashes, then exponentially
    /// sparser ancestors, always ending at the root.
    pub fn locator(&self, tip: NodeId) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut step = 1u32;
        let mut cur = tip;
        loop {
            out.push(self.get(cur).hash);
            let height = self.get(cur).height;
            if height == 0 {
                break;
            }
            if out.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let next = height.saturating_sub(step);
            cur = match self.ancestor_at(cur, next) {
                Some(n) => n,
                None => break,
            };
        }
        out
    }

    /// Headers following the first locator entry found on `tip`'s chain, up
    /// to `max` of them.
    pub fn headers_after(&self, locator: &[Hash256], tip: NodeId, max: usize) -> Vec<BlockHeader> {
        let start = locator
            .iter()
            .filter_map(|hash| self.lookup(hash))
            .find(|id| self.ancestor_at(tip, self.get(*id).height) == Some(*id))
            .unwrap_or_else(|| self.root());
        self.path_between(start, tip)
            .unwrap_or_default()
            .into_iter()
            .take(max)
            .map(|id| self.get(id).header)
            .collect()
    }

    /// Heaviest node reachable from `id` through children that hold a body
    /// and were not discarded; `id` itself when there is none.
    pub fn best_stored_descendant(&self, id: NodeId) -> NodeId {
        let mut best = id;
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            for &child in &self.get(cur).children {
                let node = self.get(child);
                if !node.has_body() || node.status == NodeStatus::Discarded {
                    continue;
                }
                if self.more_pow(child, best) {
                    best = child;
                }
                stack.push(child);
            }
        }
        best
    }
}
