//! Node configuration.
//!
//! [`NodeConfig`] is deserialized with serde defaults, so a config file only
//! needs to name the settings it changes. [`NodeConfig::load`] layers an
//! optional TOML file under `WOTS_`-prefixed environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use wots_consensus::ChainParams;
use wots_core::constants::{DEFAULT_UNWIND_BUFFER_LEN, NetworkType};
use wots_core::error::WotsError;
use wots_core::types::Hash256;

/// Configuration for a chain-state engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub network: NetworkType,
    /// Log level filter string (e.g. "info", "debug", "wots_node=trace").
    pub log_level: String,
    /// `"json"` for structured output, anything else for text.
    pub log_format: String,
    /// Recent blocks that keep undo logs.
    pub unwind_buffer_len: u32,
    /// Time budget for one background snapshot write, in seconds.
    pub utxo_save_secs: u64,
    /// Never write snapshots.
    pub volatile_utxo: bool,
    pub write_undo_files: bool,
    /// Display-order hash of the last block whose scripts need no checking.
    pub last_trusted_block: Option<String>,
    /// Blocks to undo right after startup.
    pub undo_blocks: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("wots");
        Self {
            data_dir,
            network: NetworkType::default(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            unwind_buffer_len: DEFAULT_UNWIND_BUFFER_LEN,
            utxo_save_secs: 240,
            volatile_utxo: false,
            write_undo_files: true,
            last_trusted_block: None,
            undo_blocks: 0,
        }
    }
}

impl NodeConfig {
    /// Load from an optional file, then apply `WOTS_*` environment overrides
    /// (e.g. `WOTS_NETWORK=regtest`).
    pub fn load(path: Option<&Path>) -> Result<Self, WotsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(config::Environment::with_prefix("WOTS").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WotsError::Config(e.to_string()))
    }

    /// Per-network data directory.
    pub fn network_dir(&self) -> PathBuf {
        match self.network.data_dir_suffix() {
            "" => self.data_dir.clone(),
            suffix => self.data_dir.join(suffix),
        }
    }

    /// Directory holding `UTXO.db` and its previous generation.
    pub fn utxo_dir(&self) -> PathBuf {
        self.network_dir().join("utxo")
    }

    pub fn undo_dir(&self) -> PathBuf {
        self.utxo_dir().join("undo")
    }

    pub fn save_time_target(&self) -> Duration {
        Duration::from_secs(self.utxo_save_secs)
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams::for_network(self.network)
    }

    pub fn last_trusted_hash(&self) -> Result<Option<Hash256>, WotsError> {
        self.last_trusted_block
            .as_deref()
            .map(|s| Hash256::from_display_hex(s).map_err(|e| WotsError::Config(format!("last_trusted_block: {e}"))))
            .transpose()
    }
}
