//! # wots-node: UTXO storage engine and chain engine.
//!
//! - [`unspent::UnspentDb`]: in-memory unspent and key-hash indexes with
//!   undo logs and background snapshots
//! - [`chain::ChainEngine`]: header tree, block commit and reorganisation
//! - [`block_store::MemoryBlockStore`]: in-memory block store
//! - [`config::NodeConfig`]: node configuration

pub mod block_store;
pub mod chain;
pub mod config;
pub mod logging;
pub mod snapshot;
pub mod undo;
pub mod unspent;

pub use block_store::MemoryBlockStore;
pub use chain::{ChainEngine, ChainStats, HeaderOutcome, HeaderStatus, Services};
pub use crate::config::NodeConfig;
pub use logging::init_logging;
pub use unspent::{IndexCallbacks, LoadOutcome, UnspentDb, UnspentOptions, UnspentStats};
