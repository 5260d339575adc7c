//! Legacy (pre-segwit) signature hash.
//!
//! XNYSS spends sign the same digest a legacy P2SH multisig would, so the
//! engine needs it to recover the signer's public key.

use crate::crypto::sha256d;
use crate::encoding::Encoder;
use crate::types::{Hash256, Transaction, TxOut};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// The digest returned for out-of-range inputs, a historical quirk that
/// must be reproduced.
fn one() -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 1;
    Hash256(bytes)
}

impl Transaction {
    /// Digest signed by input `input_index` with the given `script_code`.
    pub fn signature_hash(&self, script_code: &[u8], input_index: usize, hash_type: u32) -> Hash256 {
        if input_index >= self.inputs.len() {
            return one();
        }
        let base = hash_type & 0x1f;
        if base == SIGHASH_SINGLE && input_index >= self.outputs.len() {
            return one();
        }

        let mut tx = self.clone();
        for input in &mut tx.inputs {
            input.script_sig.clear();
        }
        tx.inputs[input_index].script_sig = script_code.to_vec();

        match base {
            SIGHASH_NONE => {
                tx.outputs.clear();
                zero_other_sequences(&mut tx, input_index);
            }
            SIGHASH_SINGLE => {
                tx.outputs.truncate(input_index + 1);
                for output in tx.outputs.iter_mut().take(input_index) {
                    *output = TxOut { value: u64::MAX, pk_script: Vec::new() };
                }
                zero_other_sequences(&mut tx, input_index);
            }
            _ => {}
        }

        if hash_type & SIGHASH_ANYONECANPAY != 0 {
            let input = tx.inputs.swap_remove(input_index);
            tx.inputs = vec![input];
        }

        let mut enc = Encoder::new();
        tx.encode_into(&mut enc);
        enc.write_u32_le(hash_type);
        sha256d(&enc.into_inner())
    }
}

fn zero_other_sequences(tx: &mut Transaction, input_index: usize) {
    for (i, input) in tx.inputs.iter_mut().enumerate() {
        if i != input_index {
            input.sequence = 0;
        }
    }
}
