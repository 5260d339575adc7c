//! Per-network consensus parameters.

use wots_core::constants::{
    COINBASE_MATURITY, INITIAL_SUBSIDY, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT, NetworkType,
};
use wots_core::types::{BlockHeader, Hash256};

/// Script verification flag: evaluate pay-to-script-hash redeem scripts.
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;

/// Merkle root of the shared genesis coinbase, in display byte order.
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: NetworkType,
    pub genesis: BlockHeader,
    /// Easiest allowed difficulty, in compact form.
    pub pow_limit_bits: u32,
    /// Verify header proof-of-work on acceptance.
    pub check_pow: bool,
    pub coinbase_maturity: u32,
    pub halving_interval: u32,
    /// Height from which block weight and sigops limits double.
    pub capacity_doubling_height: Option<u32>,
    pub max_block_weight: u64,
    pub max_block_sigops_cost: u64,
    pub p2sh_height: u32,
}

impl ChainParams {
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Self {
        Self {
            network: NetworkType::Mainnet,
            genesis: genesis_header(1_231_006_505, 0x1d00ffff, 2_083_236_893),
            pow_limit_bits: 0x1d00ffff,
            check_pow: true,
            coinbase_maturity: COINBASE_MATURITY,
            halving_interval: 210_000,
            capacity_doubling_height: Some(494_784),
            max_block_weight: MAX_BLOCK_WEIGHT,
            max_block_sigops_cost: MAX_BLOCK_SIGOPS_COST,
            p2sh_height: 173_805,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: NetworkType::Testnet,
            genesis: genesis_header(1_296_688_602, 0x1d00ffff, 414_098_458),
            capacity_doubling_height: Some(1_235_000),
            p2sh_height: 514,
            ..Self::mainnet()
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: NetworkType::Regtest,
            genesis: genesis_header(1_296_688_602, 0x207fffff, 2),
            pow_limit_bits: 0x207fffff,
            halving_interval: 150,
            capacity_doubling_height: None,
            p2sh_height: 0,
            ..Self::mainnet()
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }

    fn doubled(&self, height: u32) -> bool {
        self.capacity_doubling_height.is_some_and(|h| height >= h)
    }

    pub fn max_block_weight(&self, height: u32) -> u64 {
        if self.doubled(height) { self.max_block_weight * 2 } else { self.max_block_weight }
    }

    pub fn max_block_sigops_cost(&self, height: u32) -> u64 {
        if self.doubled(height) { self.max_block_sigops_cost * 2 } else { self.max_block_sigops_cost }
    }

    /// Block subsidy: [`INITIAL_SUBSIDY`] halved every `halving_interval` blocks.
    pub fn subsidy(&self, height: u32) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= 64 { 0 } else { INITIAL_SUBSIDY >> halvings }
    }

    pub fn script_flags(&self, height: u32) -> u32 {
        if height >= self.p2sh_height { SCRIPT_VERIFY_P2SH } else { 0 }
    }
}

fn genesis_header(time: u32, bits: u32, nonce: u32) -> BlockHeader {
    let mut merkle = GENESIS_MERKLE_ROOT;
    merkle.reverse();
    BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root: Hash256(merkle),
        time,
        bits,
        nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wots_core::constants::COIN;

    #[test]
    fn mainnet_genesis_hash() {
        assert_eq!(
            ChainParams::mainnet().genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn regtest_genesis_hash() {
        assert_eq!(
            ChainParams::regtest().genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn subsidy_halves() {
        let p = ChainParams::mainnet();
        assert_eq!(p.subsidy(0), 50 * COIN);
        assert_eq!(p.subsidy(209_999), 50 * COIN);
        assert_eq!(p.subsidy(210_000), 25 * COIN);
        assert_eq!(p.subsidy(210_000 * 64), 0);
    }

    #[test]
    fn capacity_doubles_at_height() {
        let p = ChainParams::mainnet();
        assert_eq!(p.max_block_weight(494_783), MAX_BLOCK_WEIGHT);
        assert_eq!(p.max_block_weight(494_784), 2 * MAX_BLOCK_WEIGHT);
        assert_eq!(p.max_block_sigops_cost(494_784), 2 * MAX_BLOCK_SIGOPS_COST);
        assert_eq!(ChainParams::regtest().max_block_weight(u32::MAX), MAX_BLOCK_WEIGHT);
    }

    #[test]
    fn for_network_selects() {
        assert_eq!(ChainParams::for_network(NetworkType::Regtest).pow_limit_bits, 0x207fffff);
        assert_eq!(ChainParams::for_network(NetworkType::Testnet).network, NetworkType::Testnet);
    }
}
