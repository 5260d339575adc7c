//! Protocol constants. All monetary values in base units (1 COIN = 10^8).

use serde::{Deserialize, Serialize};

pub const COIN: u64 = 100_000_000;

/// Upper bound on any single amount or sum of amounts.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Initial block subsidy, halved every halving interval.
pub const INITIAL_SUBSIDY: u64 = 50 * COIN;

/// Blocks a coinbase output must wait before it can be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Serialized block header size in bytes.
pub const HEADER_SIZE: usize = 80;

/// Base block size limit. Transactions larger than this are malformed.
pub const MAX_BLOCK_BASE_SIZE: usize = 1_000_000;

/// Weight multiplier for non-witness bytes.
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Block weight limit before the capacity doubling height.
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

/// Block sigops cost limit before the capacity doubling height.
pub const MAX_BLOCK_SIGOPS_COST: u64 = 80_000;

/// Coinbase scriptSig length bounds (inclusive).
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Lock times below this are block heights, above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Number of leading txid / key-hash bytes used as the in-memory index key.
pub const UTXO_IDX_LEN: usize = 8;

/// Default number of recent blocks that keep undo logs on disk.
pub const DEFAULT_UNWIND_BUFFER_LEN: u32 = 256;

/// Headers kept while waiting for their parent to arrive.
pub const MAX_ORPHAN_HEADERS: usize = 2_000;

/// Upper bound on headers returned by a single headers-after request.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Script opcodes the engine needs to recognise.
pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    /// Hash-based long-term multisig check. Its presence as the final byte of
    /// a P2SH scriptSig marks an XNYSS spend.
    pub const OP_CHECKXNYSSMULTISIG: u8 = 0xbb;
}

/// Network selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network with minimal difficulty.
    Regtest,
}

impl NetworkType {
    /// Data directory suffix for this network.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_default_is_mainnet() {
        assert_eq!(NetworkType::default(), NetworkType::Mainnet);
        assert_eq!(NetworkType::Regtest.data_dir_suffix(), "regtest");
    }

    #[test]
    fn money_bounds() {
        assert!(INITIAL_SUBSIDY < MAX_MONEY);
        assert_eq!(MAX_BLOCK_WEIGHT, MAX_BLOCK_BASE_SIZE as u64 * WITNESS_SCALE_FACTOR);
    }
}
