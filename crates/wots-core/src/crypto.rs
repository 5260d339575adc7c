//! Hash primitives used by the consensus codec and the UPKH index.
//!
//! Signature schemes themselves are external; see
//! [`SignatureService`](crate::traits::SignatureService).

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::types::Hash256;

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256(Sha256::digest(data).into())
}

/// Double SHA-256, used for txids, header hashes and merkle nodes.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// RIPEMD-160 of `data`.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// RIPEMD-160 of SHA-256, the classic script hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(sha256(data).as_bytes())
}
