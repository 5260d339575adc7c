//! Error types for the wots chain-state engine.
use thiserror::Error;

use crate::types::Hash256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")] UnexpectedEof,
    #[error("non-canonical CompactSize")] NonCanonicalVarInt,
    #[error("compact size exceeds maximum")] SizeTooLarge,
    #[error("trailing bytes after decode")] TrailingBytes,
    #[error("invalid data: {0}")] InvalidData(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no inputs")] NoInputs,
    #[error("no outputs")] NoOutputs,
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("output {index} value out of range")] OutputValueOutOfRange { index: usize },
    #[error("value overflow")] ValueOverflow,
    #[error("duplicate input {0}")] DuplicateInput(String),
    #[error("null outpoint in non-coinbase input {0}")] NullPrevout(usize),
    #[error("not-final transaction - bad-txns-nonfinal")] NotFinal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed signature: {0}")] MalformedSignature(String),
    #[error("public key recovery failed")] KeyRecoveryFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block has no transactions")] NoTransactions,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("merkle tree repeats a subtree")] MutatedMerkle,
    #[error("coinbase script length {0} outside 2..=100")] BadCoinbaseLength(usize),
    #[error("unknown input txid {0}")] UnknownInput(Hash256),
    #[error("vout {vout} too big for {txid}")] VoutOutOfRange { txid: Hash256, vout: u32 },
    #[error("double spend inside the block: {txid}:{vout}")] DoubleSpendInBlock { txid: Hash256, vout: u32 },
    #[error("cannot spend block's own coinbase {0}")] SpendsOwnCoinbase(Hash256),
    #[error("trying to spend prematured coinbase {txid} from height {height} at {spend_height}")]
    ImmatureCoinbase { txid: Hash256, height: u32, spend_height: u32 },
    #[error("more spent than at the input in {txid}: {outputs} > {inputs}")]
    Overspend { txid: Hash256, inputs: u64, outputs: u64 },
    #[error("block outputs {outputs} exceed inputs plus subsidy {inputs}")]
    BlockOverspend { inputs: u64, outputs: u64 },
    #[error("value overflow")] ValueOverflow,
    #[error("too many sigops: {cost} > {max}")] TooManySigops { cost: u64, max: u64 },
    #[error("block too heavy: {weight} > {max}")] Overweight { weight: u64, max: u64 },
    #[error("found a duplicate XNYSS public key hash {0}")] DuplicateUpkh(Hash256),
    #[error("key commitment {0} advertised twice")] DuplicateAdvertisement(Hash256),
    #[error("malformed XNYSS spend in tx {txid} input {input}: {reason}")]
    MalformedXnyss { txid: Hash256, input: usize, reason: &'static str },
    #[error("signature service failed on tx {txid} input {input}: {source}")]
    Crypto { txid: Hash256, input: usize, source: CryptoError },
    #[error("VerifyScripts failed {failures} time(s) in {txid}")] ScriptVerification { txid: Hash256, failures: usize },
    #[error("tx error in {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("malformed header: {0}")] Decode(#[from] DecodeError),
    #[error("unknown parent {0}")] UnknownParent(Hash256),
    #[error("parent {0} was discarded")] ParentDiscarded(Hash256),
    #[error("block {0} was discarded")] Discarded(Hash256),
    #[error("duplicate header {0}")] Duplicate(Hash256),
    #[error("bad difficulty bits {0:#010x}")] BadBits(u32),
    #[error("hash {0} above target")] HighHash(Hash256),
    #[error("orphan header cache full")] OrphanCacheFull,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("io: {0}")] Io(String),
    #[error("corrupt {file}: {reason}")] Corrupt { file: String, reason: String },
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("undo log missing for height {0}")] UndoMissing(u32),
    #[error("undo log at {height} expects parent {expected}, got {found}")]
    UndoMismatch { height: u32, expected: Hash256, found: Hash256 },
    #[error("tip mismatch: index at {expected}, block is {found}")] TipMismatch { expected: Hash256, found: Hash256 },
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u32, got: u32 },
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block acceptance halted after an inconsistency")] Halted,
    #[error("unknown node")] UnknownNode,
    #[error("nothing to undo at height {0}")] NothingToUndo(u32),
    #[error("reorganisation redo failed at height {height} ({hash}): {reason}")]
    ReorgRedoFailed { height: u32, hash: Hash256, reason: String },
    #[error("chain restore failed: {0}")] Restore(String),
}

/// Coarse classification used by callers to decide between rejecting a
/// block, penalising a peer and halting the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Structural,
    Consensus,
    Script,
    Storage,
    Invariant,
    Config,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WotsError {
    #[error(transparent)] Decode(#[from] DecodeError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Header(#[from] HeaderError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error("config: {0}")] Config(String),
}

impl BlockError {
    /// The body does not belong to its header. Says nothing about whether
    /// the header's real block is valid.
    pub fn is_body_mismatch(&self) -> bool {
        matches!(self, BlockError::InvalidMerkleRoot | BlockError::MutatedMerkle)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            BlockError::NoTransactions
            | BlockError::FirstTxNotCoinbase
            | BlockError::MultipleCoinbase
            | BlockError::InvalidMerkleRoot
            | BlockError::MutatedMerkle
            | BlockError::MalformedXnyss { .. }
            | BlockError::Transaction { .. } => ErrorClass::Structural,
            BlockError::ScriptVerification { .. } | BlockError::Crypto { .. } => ErrorClass::Script,
            _ => ErrorClass::Consensus,
        }
    }
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::UndoMissing(_)
            | StorageError::UndoMismatch { .. }
            | StorageError::TipMismatch { .. }
            | StorageError::HeightMismatch { .. } => ErrorClass::Invariant,
            _ => ErrorClass::Storage,
        }
    }
}

impl WotsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WotsError::Decode(_) | WotsError::Transaction(_) => ErrorClass::Structural,
            WotsError::Block(e) => e.class(),
            WotsError::Header(HeaderError::Decode(_)) => ErrorClass::Structural,
            WotsError::Header(_) => ErrorClass::Consensus,
            WotsError::Crypto(_) => ErrorClass::Script,
            WotsError::Storage(e) => e.class(),
            WotsError::Chain(_) => ErrorClass::Invariant,
            WotsError::Config(_) => ErrorClass::Config,
        }
    }

    /// Fatal errors leave the engine unable to continue safely.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Storage | ErrorClass::Invariant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_errors_classify() {
        assert_eq!(BlockError::InvalidMerkleRoot.class(), ErrorClass::Structural);
        assert_eq!(
            BlockError::ScriptVerification { txid: Hash256::ZERO, failures: 2 }.class(),
            ErrorClass::Script
        );
        assert_eq!(
            BlockError::DoubleSpendInBlock { txid: Hash256::ZERO, vout: 0 }.class(),
            ErrorClass::Consensus
        );
    }

    #[test]
    fn undo_missing_is_fatal() {
        let e: WotsError = StorageError::UndoMissing(7).into();
        assert_eq!(e.class(), ErrorClass::Invariant);
        assert!(e.is_fatal());
    }

    #[test]
    fn consensus_errors_are_recoverable() {
        let e: WotsError = BlockError::DuplicateUpkh(Hash256::ZERO).into();
        assert!(!e.is_fatal());
        let e: WotsError = HeaderError::UnknownParent(Hash256::ZERO).into();
        assert!(!e.is_fatal());
    }

    #[test]
    fn messages_carry_context() {
        let e = BlockError::ScriptVerification { txid: Hash256::ZERO, failures: 3 };
        assert!(e.to_string().contains("failed 3 time(s)"));
        assert_eq!(
            TransactionError::NotFinal.to_string(),
            "not-final transaction - bad-txns-nonfinal"
        );
    }
}
