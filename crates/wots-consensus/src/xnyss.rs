//! Recognising and decoding XNYSS (hash-based long-term multisig) spends.
//!
//! An XNYSS spend is a P2SH input whose redeem script ends in
//! `OP_CHECKXNYSSMULTISIG`. Its scriptSig has the shape
//!
//! ```text
//! OP_0 <sig_1 || hashtype> ... <sig_n || hashtype> <redeem_script>
//! ```
//!
//! Each signature reveals the public key that made it (recovered through the
//! [`SignatureService`]) and commits to the hashes of the next keys in the
//! signer's tree. Those commitments feed the UPKH index.

use wots_core::constants::opcodes::{OP_0, OP_CHECKXNYSSMULTISIG};
use wots_core::crypto::sha256;
use wots_core::error::CryptoError;
use wots_core::script::{instructions, is_p2sh};
use wots_core::traits::SignatureService;
use wots_core::types::{Hash256, Transaction};

/// Borrowed view of a parsed XNYSS scriptSig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XnyssSpend<'a> {
    /// Signatures with their trailing hash-type byte.
    pub signatures: Vec<&'a [u8]>,
    pub redeem_script: &'a [u8],
}

/// One signer of an XNYSS spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XnyssSigner {
    /// SHA-256 of the recovered public key.
    pub pkh: Hash256,
    /// Key hashes this signature advertises for future use.
    pub children: Vec<Hash256>,
}

/// Cheap pre-check on the spent script and the spending scriptSig.
pub fn is_xnyss_spend(prev_script: &[u8], script_sig: &[u8]) -> bool {
    is_p2sh(prev_script) && script_sig.last() == Some(&OP_CHECKXNYSSMULTISIG)
}

pub fn parse_script_sig(script_sig: &[u8]) -> Result<XnyssSpend<'_>, &'static str> {
    let mut it = instructions(script_sig);
    match it.next() {
        Some(Ok(ins)) if ins.opcode == OP_0 => {}
        _ => return Err("missing leading OP_0"),
    }
    let mut pushes = Vec::new();
    for ins in it {
        let ins = ins.map_err(|_| "truncated push")?;
        match ins.data {
            Some(data) => pushes.push(data),
            None => return Err("non-push opcode"),
        }
    }
    let redeem_script = pushes.pop().ok_or("missing redeem script")?;
    if redeem_script.last() != Some(&OP_CHECKXNYSSMULTISIG) {
        return Err("redeem script is not XNYSS");
    }
    if pushes.is_empty() {
        return Err("no signatures");
    }
    if pushes.iter().any(|sig| sig.len() < 2) {
        return Err("empty signature");
    }
    Ok(XnyssSpend { signatures: pushes, redeem_script })
}

/// Recover every signer of input `input_index` of `tx`.
pub fn derive_signers(
    tx: &Transaction,
    input_index: usize,
    spend: &XnyssSpend<'_>,
    service: &dyn SignatureService,
) -> Result<Vec<XnyssSigner>, CryptoError> {
    spend
        .signatures
        .iter()
        .map(|with_type| {
            let (hash_type, sig) = with_type
                .split_last()
                .ok_or_else(|| CryptoError::MalformedSignature("empty".into()))?;
            let msg = tx.signature_hash(spend.redeem_script, input_index, u32::from(*hash_type));
            let public_key = service.public_key(sig, &msg)?;
            let children = service.child_hashes(sig)?;
            Ok(XnyssSigner { pkh: sha256(&public_key), children })
        })
        .collect()
}
