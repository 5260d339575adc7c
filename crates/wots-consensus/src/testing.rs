//! Test doubles for the external collaborators and helpers for building
//! small chains. Compiled for unit tests and behind the `testing` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use wots_core::constants::SEQUENCE_FINAL;
use wots_core::constants::opcodes::{
    OP_0, OP_1, OP_16, OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CHECKSIGVERIFY,
    OP_CHECKXNYSSMULTISIG,
};
use wots_core::crypto::hash160;
use wots_core::error::CryptoError;
use wots_core::merkle::transactions_root;
use wots_core::pow::check_proof_of_work;
use wots_core::records::{UpkhRecord, UtxoOutput};
use wots_core::script::{instructions, p2sh_script, push_data};
use wots_core::traits::{ScriptEngine, SignatureService, UtxoView};
use wots_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut};

/// Script engine that accepts every input unless its scriptSig equals the
/// configured rejection pattern.
#[derive(Debug, Default)]
pub struct MockScriptEngine {
    reject: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl MockScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(script_sig: Vec<u8>) -> Self {
        Self { reject: Some(script_sig), calls: AtomicUsize::new(0) }
    }

    pub fn verify_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ScriptEngine for MockScriptEngine {
    fn verify_input_script(&self, _prev: &[u8], _amount: u64, input_index: usize, tx: &Transaction, _flags: u32) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match (&self.reject, tx.inputs.get(input_index)) {
            (Some(bad), Some(input)) => input.script_sig != *bad,
            (_, input) => input.is_some(),
        }
    }

    fn count_sigops(&self, script: &[u8], accurate: bool) -> u32 {
        let mut count = 0;
        let mut last = 0xff;
        for ins in instructions(script) {
            let Ok(ins) = ins else { break };
            count += match ins.opcode {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY if accurate && (OP_1..=OP_16).contains(&last) => {
                    u32::from(last - OP_1 + 1)
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => 20,
                _ => 0,
            };
            last = ins.opcode;
        }
        count
    }
}

/// Signature service over a transparent encoding:
/// `[pk_len][pk][n][n * 32-byte child hash]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockSignatureService;

impl MockSignatureService {
    pub fn signature(public_key: &[u8], children: &[Hash256]) -> Vec<u8> {
        let mut sig = Vec::with_capacity(2 + public_key.len() + children.len() * 32);
        sig.push(public_key.len() as u8);
        sig.extend_from_slice(public_key);
        sig.push(children.len() as u8);
        for child in children {
            sig.extend_from_slice(child.as_bytes());
        }
        sig
    }

    fn parse(signature: &[u8]) -> Result<(&[u8], Vec<Hash256>), CryptoError> {
        let malformed = || CryptoError::MalformedSignature(format!("{} bytes", signature.len()));
        let (&pk_len, rest) = signature.split_first().ok_or_else(malformed)?;
        let pk = rest.get(..pk_len as usize).ok_or_else(malformed)?;
        let rest = &rest[pk_len as usize..];
        let (&n, rest) = rest.split_first().ok_or_else(malformed)?;
        if rest.len() != n as usize * 32 {
            return Err(malformed());
        }
        let children = rest
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                Hash256(h)
            })
            .collect();
        Ok((pk, children))
    }
}

impl SignatureService for MockSignatureService {
    fn verify(&self, public_key: &[u8], signature: &[u8], _msg: &Hash256) -> bool {
        Self::parse(signature).is_ok_and(|(pk, _)| pk == public_key)
    }

    fn public_key(&self, signature: &[u8], _msg: &Hash256) -> Result<Vec<u8>, CryptoError> {
        let (pk, _) = Self::parse(signature)?;
        if pk.is_empty() {
            return Err(CryptoError::KeyRecoveryFailed);
        }
        Ok(pk.to_vec())
    }

    fn child_hashes(&self, signature: &[u8]) -> Result<Vec<Hash256>, CryptoError> {
        Ok(Self::parse(signature)?.1)
    }
}

/// In-memory [`UtxoView`].
#[derive(Debug, Default, Clone)]
pub struct MemoryView {
    outputs: HashMap<OutPoint, UtxoOutput>,
    upkh: HashMap<Hash256, UpkhRecord>,
}

impl MemoryView {
    pub fn add_output(&mut self, outpoint: OutPoint, output: UtxoOutput) {
        self.outputs.insert(outpoint, output);
    }

    pub fn add_upkh(&mut self, rec: UpkhRecord) {
        self.upkh.insert(rec.pkh, rec);
    }
}

impl UtxoView for MemoryView {
    fn output(&self, outpoint: &OutPoint) -> Option<UtxoOutput> {
        self.outputs.get(outpoint).cloned()
    }

    fn upkh(&self, pkh: &Hash256) -> Option<UpkhRecord> {
        self.upkh.get(pkh).copied()
    }
}

/// Smallest XNYSS redeem script: `OP_1 OP_CHECKXNYSSMULTISIG`.
pub fn xnyss_redeem_script() -> Vec<u8> {
    vec![OP_1, OP_CHECKXNYSSMULTISIG]
}

pub fn xnyss_lock_script() -> Vec<u8> {
    p2sh_script(&hash160(&xnyss_redeem_script()))
}

/// `OP_0 <sig>... <redeem>`. Signatures must already carry their hash type.
pub fn xnyss_script_sig(signatures: &[Vec<u8>]) -> Vec<u8> {
    let mut script = vec![OP_0];
    for sig in signatures {
        push_data(&mut script, sig);
    }
    push_data(&mut script, &xnyss_redeem_script());
    script
}

/// Coinbase paying `value` to `OP_1`. `tag` makes otherwise equal coinbases
/// distinct.
pub fn coinbase_tx(height: u32, value: u64, tag: u8) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TxIn { prev_out: OutPoint::null(), script_sig, sequence: SEQUENCE_FINAL }],
        outputs: vec![TxOut { value, pk_script: vec![OP_1] }],
        lock_time: 0,
    }
}

pub fn spend_tx(inputs: &[OutPoint], outputs: &[(u64, Vec<u8>)]) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|prev_out| TxIn { prev_out: *prev_out, script_sig: vec![OP_1], sequence: SEQUENCE_FINAL })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(value, pk_script)| TxOut { value: *value, pk_script: pk_script.clone() })
            .collect(),
        lock_time: 0,
    }
}

/// Block with a correct merkle root and an arbitrary nonce.
pub fn unmined_block(prev_hash: Hash256, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: transactions_root(&transactions),
            time: 1_296_688_602,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions,
    }
}

/// Block whose header satisfies `bits`. Only practical for easy targets.
pub fn build_block(prev_hash: Hash256, time: u32, bits: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = unmined_block(prev_hash, transactions);
    block.header.time = time;
    block.header.bits = bits;
    while check_proof_of_work(&block.header.hash(), bits, bits).is_err() {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
    block
}
