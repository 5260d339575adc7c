//! Trait interfaces between the chain-state engine and its collaborators.
//!
//! - [`UtxoView`]: read access to the committed indexes (wots-node implements)
//! - [`SignatureService`]: hash-based signature primitives (external)
//! - [`ScriptEngine`]: script interpreter (external)
//! - [`BlockStore`]: raw block persistence (external; wots-node ships an
//!   in-memory implementation)

use std::fmt;

use crate::error::{CryptoError, StorageError};
use crate::records::{UpkhRecord, UtxoOutput};
use crate::types::{Hash256, OutPoint, Transaction};

/// Read-only view of the committed unspent-output and UPKH indexes.
pub trait UtxoView {
    /// Resolve an unspent output. `None` if spent or unknown.
    fn output(&self, outpoint: &OutPoint) -> Option<UtxoOutput>;

    /// Look up an advertised public-key hash.
    fn upkh(&self, pkh: &Hash256) -> Option<UpkhRecord>;
}

/// Primitives of the hash-based long-term signature scheme.
///
/// The engine never verifies XNYSS signatures itself; that happens inside the
/// [`ScriptEngine`]. It only needs to learn which key signed and which child
/// keys the signature commits to.
pub trait SignatureService: Send + Sync {
    /// Check `signature` by `public_key` over `msg_hash`. Part of the
    /// contract a [`ScriptEngine`] relies on when it evaluates XNYSS
    /// scripts; block processing itself never calls it.
    fn verify(&self, public_key: &[u8], signature: &[u8], msg_hash: &Hash256) -> bool;

    /// Recover the public key that produced `signature` over `msg_hash`.
    fn public_key(&self, signature: &[u8], msg_hash: &Hash256) -> Result<Vec<u8>, CryptoError>;

    /// Child public-key hashes committed to by `signature`.
    fn child_hashes(&self, signature: &[u8]) -> Result<Vec<Hash256>, CryptoError>;
}

/// Script interpreter used for input verification and sigop counting.
pub trait ScriptEngine: Send + Sync {
    fn verify_input_script(
        &self,
        prev_script: &[u8],
        amount: u64,
        input_index: usize,
        tx: &Transaction,
        flags: u32,
    ) -> bool;

    /// Count signature operations in `script`. With `accurate` set,
    /// `CHECKMULTISIG` preceded by a small integer counts as that integer.
    fn count_sigops(&self, script: &[u8], accurate: bool) -> u32;
}

/// Address of a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Height(u32),
    Hash(Hash256),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Height(h) => write!(f, "height {h}"),
            BlockRef::Hash(hash) => write!(f, "{hash}"),
        }
    }
}

/// Raw block persistence. Looking up by height returns the block most
/// recently committed at that height.
pub trait BlockStore: Send + Sync {
    fn add(&self, height: u32, hash: &Hash256, raw: &[u8], trusted: bool) -> Result<(), StorageError>;

    /// Fetch raw block bytes. Missing blocks yield [`StorageError::BlockNotFound`].
    fn get_raw(&self, at: BlockRef) -> Result<Vec<u8>, StorageError>;
}
