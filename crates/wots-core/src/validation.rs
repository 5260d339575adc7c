//! Context-free validation of transactions and block bodies.
//!
//! - **Transaction structure** ([`check_transaction`]): format and value
//!   range checks that need no chain state.
//! - **Transaction set** ([`check_transactions`]): structure plus lock-time
//!   finality for a whole block, fanned out across the rayon pool.
//! - **Block structure** ([`check_block_structure`]): coinbase placement and
//!   merkle commitment.
//!
//! Checks against the unspent-output set live in wots-consensus.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::constants::{MAX_BLOCK_BASE_SIZE, MAX_MONEY};
use crate::error::{BlockError, TransactionError};
use crate::merkle::merkle_root_checked;
use crate::types::{Block, Hash256, Transaction};

/// Structural checks on a single transaction.
///
/// - non-empty inputs and outputs
/// - serialized size within [`MAX_BLOCK_BASE_SIZE`]
/// - each output and the output total within [`MAX_MONEY`]
/// - no duplicate inputs
/// - only coinbase transactions may reference the null outpoint
pub fn check_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() {
        return Err(TransactionError::NoInputs);
    }
    if tx.outputs.is_empty() {
        return Err(TransactionError::NoOutputs);
    }
    let size = tx.serialized_size();
    if size > MAX_BLOCK_BASE_SIZE {
        return Err(TransactionError::Oversized { size, max: MAX_BLOCK_BASE_SIZE });
    }

    let mut total = 0u64;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.value > MAX_MONEY {
            return Err(TransactionError::OutputValueOutOfRange { index });
        }
        total = total.checked_add(output.value).ok_or(TransactionError::ValueOverflow)?;
        if total > MAX_MONEY {
            return Err(TransactionError::ValueOverflow);
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prev_out) {
            return Err(TransactionError::DuplicateInput(input.prev_out.to_string()));
        }
    }

    if !tx.is_coinbase() {
        if let Some(index) = tx.inputs.iter().position(|i| i.prev_out.is_null()) {
            return Err(TransactionError::NullPrevout(index));
        }
    }
    Ok(())
}

/// Check structure and finality of every transaction in parallel.
///
/// Workers stop picking up new transactions once any of them fails; the
/// first error observed is returned.
pub fn check_transactions(txs: &[Transaction], height: u32, block_time: u32) -> Result<(), BlockError> {
    txs.par_iter().enumerate().try_for_each(|(index, tx)| {
        check_transaction(tx)
            .and_then(|()| {
                if tx.is_final(height, block_time) { Ok(()) } else { Err(TransactionError::NotFinal) }
            })
            .map_err(|source| BlockError::Transaction { index, source })
    })
}

/// Merkle commitment, then coinbase placement. Returns the txids so callers
/// need not hash the transactions again.
///
/// The commitment is checked first: until it holds, a failure says nothing
/// about the block the header names.
pub fn check_block_structure(block: &Block) -> Result<Vec<Hash256>, BlockError> {
    let txids: Vec<Hash256> = block.transactions.par_iter().map(Transaction::txid).collect();
    let (root, mutated) = merkle_root_checked(&txids);
    if root != block.header.merkle_root {
        return Err(BlockError::InvalidMerkleRoot);
    }
    if mutated {
        return Err(BlockError::MutatedMerkle);
    }
    let first = block.transactions.first().ok_or(BlockError::NoTransactions)?;
    if !first.is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    if block.transactions.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(BlockError::MultipleCoinbase);
    }
    Ok(txids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEQUENCE_FINAL;
    use crate::merkle::merkle_root;
    use crate::types::{BlockHeader, OutPoint, TxIn, TxOut};

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn { prev_out: OutPoint::null(), script_sig: vec![tag, tag], sequence: SEQUENCE_FINAL }],
            outputs: vec![TxOut { value: 50, pk_script: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn spend(seed: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_out: OutPoint { txid: Hash256([seed; 32]), vout: 0 },
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut { value: 1, pk_script: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn block(txs: Vec<Transaction>) -> Block {
        let ids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: merkle_root(&ids),
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: txs,
        }
    }

    // --- check_transaction ---

    #[test]
    fn valid_tx_passes() {
        assert!(check_transaction(&spend(1)).is_ok());
        assert!(check_transaction(&coinbase(1)).is_ok());
    }

    #[test]
    fn empty_sides_rejected() {
        let mut tx = spend(1);
        tx.outputs.clear();
        assert_eq!(check_transaction(&tx), Err(TransactionError::NoOutputs));
        tx.inputs.clear();
        assert_eq!(check_transaction(&tx), Err(TransactionError::NoInputs));
    }

    #[test]
    fn output_range_enforced() {
        let mut tx = spend(1);
        tx.outputs[0].value = MAX_MONEY + 1;
        assert_eq!(check_transaction(&tx), Err(TransactionError::OutputValueOutOfRange { index: 0 }));
        tx.outputs[0].value = MAX_MONEY;
        tx.outputs.push(TxOut { value: 1, pk_script: vec![] });
        assert_eq!(check_transaction(&tx), Err(TransactionError::ValueOverflow));
    }

    #[test]
    fn duplicate_inputs_rejected() {
        let mut tx = spend(1);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(matches!(check_transaction(&tx), Err(TransactionError::DuplicateInput(_))));
    }

    #[test]
    fn null_prevout_outside_coinbase_rejected() {
        let mut tx = spend(1);
        tx.inputs.push(TxIn { prev_out: OutPoint::null(), script_sig: vec![], sequence: 0 });
        assert_eq!(check_transaction(&tx), Err(TransactionError::NullPrevout(1)));
    }

    // --- check_transactions ---

    #[test]
    fn non_final_tx_fails_set() {
        let mut late = spend(2);
        late.lock_time = 500;
        late.inputs[0].sequence = 0;
        let txs = vec![coinbase(1), spend(1), late];
        assert_eq!(
            check_transactions(&txs, 100, 0),
            Err(BlockError::Transaction { index: 2, source: TransactionError::NotFinal })
        );
        assert!(check_transactions(&txs, 501, 0).is_ok());
    }

    #[test]
    fn set_reports_a_failing_index() {
        let mut txs: Vec<Transaction> = (0..64).map(spend).collect();
        txs[40].outputs.clear();
        txs[50].outputs.clear();
        match check_transactions(&txs, 1, 0) {
            Err(BlockError::Transaction { index, source: TransactionError::NoOutputs }) => {
                assert!(index == 40 || index == 50);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // --- check_block_structure ---

    #[test]
    fn block_structure() {
        assert!(check_block_structure(&block(vec![coinbase(1), spend(1)])).is_ok());
        assert_eq!(check_block_structure(&block(vec![])), Err(BlockError::NoTransactions));
        assert_eq!(check_block_structure(&block(vec![spend(1)])), Err(BlockError::FirstTxNotCoinbase));
        assert_eq!(
            check_block_structure(&block(vec![coinbase(1), coinbase(2)])),
            Err(BlockError::MultipleCoinbase)
        );
        let mut bad = block(vec![coinbase(1)]);
        bad.header.merkle_root = Hash256([1; 32]);
        assert_eq!(check_block_structure(&bad), Err(BlockError::InvalidMerkleRoot));
    }

    #[test]
    fn mismatched_body_reported_before_coinbase_rules() {
        let good = block(vec![coinbase(1), spend(1)]);
        let swapped = Block { header: good.header, transactions: vec![spend(1)] };
        assert_eq!(check_block_structure(&swapped), Err(BlockError::InvalidMerkleRoot));
        assert!(BlockError::InvalidMerkleRoot.is_body_mismatch());
        assert!(!BlockError::FirstTxNotCoinbase.is_body_mismatch());
    }

    #[test]
    fn repeated_last_transaction_rejected() {
        let good = block(vec![coinbase(1), spend(1), spend(2)]);
        let mut txs = good.transactions.clone();
        txs.push(spend(2));
        let padded = Block { header: good.header, transactions: txs };
        assert_eq!(check_block_structure(&padded), Err(BlockError::MutatedMerkle));
        assert!(check_block_structure(&good).is_ok());
    }
}
