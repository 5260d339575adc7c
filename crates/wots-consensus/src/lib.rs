//! # wots-consensus
//!
//! Chain parameters and block body validation for the wots chain-state
//! engine. Given a block and a read-only view of the committed indexes,
//! [`BlockProcessor`] checks every input, fee, sigop and XNYSS rule and
//! returns the [`BlockChanges`](wots_core::changes::BlockChanges) to apply.

pub mod params;
pub mod process;
pub mod xnyss;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use params::ChainParams;
pub use process::{BlockContext, BlockProcessor, ProcessedBlock, TrustedTxChecker};
