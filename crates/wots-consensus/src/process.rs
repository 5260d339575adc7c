//! Validation of a block body against the committed indexes.
//!
//! [`BlockProcessor::process_block_transactions`] walks the block once,
//! resolving every input either from the committed [`UtxoView`] or from the
//! outputs of earlier transactions in the same block, and produces the
//! [`BlockChanges`] the storage engine applies. Nothing is mutated here, so a
//! rejected block leaves both indexes untouched.
//!
//! Script verification for untrusted blocks fans out one rayon task per
//! input and joins before the transaction's fee is checked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, trace};

use wots_core::changes::{BlockChanges, UpkhUndoRecord};
use wots_core::constants::{MAX_COINBASE_SCRIPT_LEN, MIN_COINBASE_SCRIPT_LEN, WITNESS_SCALE_FACTOR};
use wots_core::crypto::ripemd160;
use wots_core::error::BlockError;
use wots_core::records::{UpkhRecord, UtxoOut, UtxoRecord};
use wots_core::script::{is_p2sh, last_push};
use wots_core::traits::{ScriptEngine, SignatureService, UtxoView};
use wots_core::types::{Block, Hash256, OutPoint, Transaction};

use crate::params::ChainParams;
use crate::xnyss;

/// Lets transactions already verified elsewhere (e.g. on mempool entry)
/// skip script verification. Called with the txid.
pub type TrustedTxChecker = Arc<dyn Fn(&Hash256) -> bool + Send + Sync>;

/// Where the block sits relative to the chain.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u32,
    /// Best header height known to the node; drives the undo window.
    pub last_known_height: u32,
    pub unwind_len: u32,
    /// Skip script verification for the whole block.
    pub trusted: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessedBlock {
    pub changes: BlockChanges,
    pub sigops_cost: u64,
    pub fees: u64,
}

/// Outputs created earlier in the block being processed.
struct PendingOutputs {
    coinbase: bool,
    outs: Vec<Option<UtxoOut>>,
}

/// Scratch state for one block.
struct BlockState {
    changes: BlockChanges,
    pending: HashMap<Hash256, PendingOutputs>,
    /// Key hashes consumed by XNYSS signers in this block.
    used_pkh: HashSet<Hash256>,
    /// Child commitments added in this block and not yet consumed.
    advertised: HashSet<Hash256>,
}

pub struct BlockProcessor<'a> {
    params: &'a ChainParams,
    scripts: &'a dyn ScriptEngine,
    signatures: &'a dyn SignatureService,
    trusted_tx: Option<&'a TrustedTxChecker>,
}

impl<'a> BlockProcessor<'a> {
    pub fn new(params: &'a ChainParams, scripts: &'a dyn ScriptEngine, signatures: &'a dyn SignatureService) -> Self {
        Self { params, scripts, signatures, trusted_tx: None }
    }

    pub fn with_trusted_tx(mut self, checker: Option<&'a TrustedTxChecker>) -> Self {
        self.trusted_tx = checker;
        self
    }

    /// Validate every transaction of `block` and collect its index changes.
    pub fn process_block_transactions<V: UtxoView + ?Sized>(
        &self,
        block: &Block,
        view: &V,
        ctx: &BlockContext,
    ) -> Result<ProcessedBlock, BlockError> {
        let height = ctx.height;
        let weight = block.weight();
        let max_weight = self.params.max_block_weight(height);
        if weight > max_weight {
            return Err(BlockError::Overweight { weight, max: max_weight });
        }

        let coinbase = block.coinbase().ok_or(BlockError::FirstTxNotCoinbase)?;
        let cb_len = coinbase.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&cb_len) {
            return Err(BlockError::BadCoinbaseLength(cb_len));
        }

        let txids: Vec<Hash256> = block.transactions.par_iter().map(Transaction::txid).collect();
        let max_sigops = self.params.max_block_sigops_cost(height);
        let flags = self.params.script_flags(height);

        let mut state = BlockState {
            changes: BlockChanges::new(height, ctx.last_known_height, ctx.unwind_len),
            pending: HashMap::with_capacity(block.transactions.len()),
            used_pkh: HashSet::new(),
            advertised: HashSet::new(),
        };
        let mut sigops: u64 = 0;
        let mut block_in = self.params.subsidy(height);
        let mut block_out: u64 = 0;
        let mut fees: u64 = 0;

        for (index, (tx, txid)) in block.transactions.iter().zip(&txids).enumerate() {
            sigops += WITNESS_SCALE_FACTOR * self.legacy_sigops(tx);

            let tx_out = tx
                .outputs
                .iter()
                .try_fold(0u64, |acc, o| acc.checked_add(o.value))
                .ok_or(BlockError::ValueOverflow)?;

            if index > 0 {
                let tx_in = self.process_inputs(tx, txid, view, ctx, flags, &mut state, &mut sigops)?;
                if tx_out > tx_in {
                    return Err(BlockError::Overspend { txid: *txid, inputs: tx_in, outputs: tx_out });
                }
                fees += tx_in - tx_out;
                block_in = block_in.checked_add(tx_in).ok_or(BlockError::ValueOverflow)?;
            }
            if sigops > max_sigops {
                return Err(BlockError::TooManySigops { cost: sigops, max: max_sigops });
            }
            block_out = block_out.checked_add(tx_out).ok_or(BlockError::ValueOverflow)?;

            let outs = tx
                .outputs
                .iter()
                .map(|o| Some(UtxoOut { value: o.value, pk_script: o.pk_script.clone() }))
                .collect();
            state.pending.insert(*txid, PendingOutputs { coinbase: index == 0, outs });
        }

        if block_in < block_out {
            return Err(BlockError::BlockOverspend { inputs: block_in, outputs: block_out });
        }

        let mut changes = state.changes;
        for txid in &txids {
            if let Some(p) = state.pending.remove(txid) {
                if p.outs.iter().any(Option::is_some) {
                    changes.add_list.push(UtxoRecord { txid: *txid, coinbase: p.coinbase, height, outs: p.outs });
                }
            }
        }
        debug!(
            height,
            added = changes.add_list.len(),
            spent = changes.spent_outputs(),
            upkh_added = changes.add_upkh.len(),
            upkh_deleted = changes.delete_upkh.len(),
            sigops,
            "block transactions processed"
        );
        Ok(ProcessedBlock { changes, sigops_cost: sigops, fees })
    }

    fn legacy_sigops(&self, tx: &Transaction) -> u64 {
        let inputs: u64 = tx.inputs.iter().map(|i| u64::from(self.scripts.count_sigops(&i.script_sig, false))).sum();
        let outputs: u64 = tx.outputs.iter().map(|o| u64::from(self.scripts.count_sigops(&o.pk_script, false))).sum();
        inputs + outputs
    }

    #[allow(clippy::too_many_arguments)]
    fn process_inputs<V: UtxoView + ?Sized>(
        &self,
        tx: &Transaction,
        txid: &Hash256,
        view: &V,
        ctx: &BlockContext,
        flags: u32,
        state: &mut BlockState,
        sigops: &mut u64,
    ) -> Result<u64, BlockError> {
        let verify = !ctx.trusted && !self.trusted_tx.is_some_and(|f| f(txid));
        let upkh_tx_start = state.changes.add_upkh.len();
        let mut checks: Vec<(usize, u64, Vec<u8>)> = Vec::new();
        let mut tx_in: u64 = 0;

        for (j, input) in tx.inputs.iter().enumerate() {
            let (value, prev_script) = self.spend_input(&input.prev_out, view, ctx.height, state)?;
            tx_in = tx_in.checked_add(value).ok_or(BlockError::ValueOverflow)?;

            if is_p2sh(&prev_script) {
                if let Some(redeem) = last_push(&input.script_sig) {
                    *sigops += WITNESS_SCALE_FACTOR * u64::from(self.scripts.count_sigops(redeem, true));
                }
                if xnyss::is_xnyss_spend(&prev_script, &input.script_sig) {
                    self.apply_xnyss(tx, txid, j, view, ctx.height, upkh_tx_start, state)?;
                }
            }
            if verify {
                checks.push((j, value, prev_script));
            }
        }

        if !checks.is_empty() {
            let failures = checks
                .par_iter()
                .filter(|(j, amount, script)| !self.scripts.verify_input_script(script, *amount, *j, tx, flags))
                .count();
            if failures > 0 {
                return Err(BlockError::ScriptVerification { txid: *txid, failures });
            }
        }
        Ok(tx_in)
    }

    /// Resolve and mark spent one input. Returns the spent value and script.
    fn spend_input<V: UtxoView + ?Sized>(
        &self,
        prev: &OutPoint,
        view: &V,
        height: u32,
        state: &mut BlockState,
    ) -> Result<(u64, Vec<u8>), BlockError> {
        let vout = prev.vout as usize;
        if let Some(mask) = state.changes.deleted.get(&prev.txid) {
            match mask.get(vout) {
                None => return Err(BlockError::VoutOutOfRange { txid: prev.txid, vout: prev.vout }),
                Some(true) => return Err(BlockError::DoubleSpendInBlock { txid: prev.txid, vout: prev.vout }),
                Some(false) => {}
            }
        }

        if let Some(out) = view.output(prev) {
            if out.coinbase && height.saturating_sub(out.height) < self.params.coinbase_maturity {
                return Err(BlockError::ImmatureCoinbase { txid: prev.txid, height: out.height, spend_height: height });
            }
            let mask = state
                .changes
                .deleted
                .entry(prev.txid)
                .or_insert_with(|| vec![false; out.vout_count as usize]);
            let slot = mask
                .get_mut(vout)
                .ok_or(BlockError::VoutOutOfRange { txid: prev.txid, vout: prev.vout })?;
            *slot = true;
            if let Some(undo) = state.changes.undo.as_mut() {
                let rec = undo.entry(prev.txid).or_insert_with(|| {
                    UtxoRecord::with_holes(prev.txid, out.coinbase, out.height, out.vout_count as usize)
                });
                if let Some(slot) = rec.outs.get_mut(vout) {
                    *slot = Some(UtxoOut { value: out.value, pk_script: out.pk_script.clone() });
                }
            }
            return Ok((out.value, out.pk_script));
        }

        let pending = state.pending.get_mut(&prev.txid).ok_or(BlockError::UnknownInput(prev.txid))?;
        if pending.coinbase {
            return Err(BlockError::SpendsOwnCoinbase(prev.txid));
        }
        let slot = pending
            .outs
            .get_mut(vout)
            .ok_or(BlockError::VoutOutOfRange { txid: prev.txid, vout: prev.vout })?;
        let out = slot
            .take()
            .ok_or(BlockError::DoubleSpendInBlock { txid: prev.txid, vout: prev.vout })?;
        Ok((out.value, out.pk_script))
    }

    /// Consume the signers' advertised keys and record their new commitments.
    #[allow(clippy::too_many_arguments)]
    fn apply_xnyss<V: UtxoView + ?Sized>(
        &self,
        tx: &Transaction,
        txid: &Hash256,
        input: usize,
        view: &V,
        height: u32,
        upkh_tx_start: usize,
        state: &mut BlockState,
    ) -> Result<(), BlockError> {
        let script_sig = &tx.inputs[input].script_sig;
        let spend = xnyss::parse_script_sig(script_sig)
            .map_err(|reason| BlockError::MalformedXnyss { txid: *txid, input, reason })?;
        let signers = xnyss::derive_signers(tx, input, &spend, self.signatures)
            .map_err(|source| BlockError::Crypto { txid: *txid, input, source })?;

        for signer in signers {
            if !state.used_pkh.insert(signer.pkh) {
                return Err(BlockError::DuplicateUpkh(signer.pkh));
            }
            let mut undo = UpkhUndoRecord::default();
            let changes = &mut state.changes;

            let root = if let Some(rec) = view.upkh(&signer.pkh) {
                trace!(pkh = %signer.pkh, "consuming committed UPKH");
                changes.delete_upkh.push(signer.pkh);
                undo.deleted = Some(rec);
                rec.long_term_hash
            } else if let Some(pos) = changes.add_upkh[upkh_tx_start..].iter().position(|r| r.pkh == signer.pkh) {
                trace!(pkh = %signer.pkh, "consuming UPKH advertised earlier in this transaction");
                state.advertised.remove(&signer.pkh);
                changes.add_upkh.remove(upkh_tx_start + pos).long_term_hash
            } else {
                trace!(pkh = %signer.pkh, "new long-term root");
                ripemd160(signer.pkh.as_bytes())
            };

            for child in signer.children {
                if view.upkh(&child).is_some() || !state.advertised.insert(child) {
                    return Err(BlockError::DuplicateAdvertisement(child));
                }
                changes.add_upkh.push(UpkhRecord { pkh: child, long_term_hash: root, height });
                undo.added.push(child);
            }
            if let Some(log) = changes.undo_upkh.as_mut() {
                log.push(undo);
            }
        }
        Ok(())
    }
}
