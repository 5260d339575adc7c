//! # wots-core
//! Protocol types, consensus codec, record formats and the header tree for
//! the wots chain-state engine.

pub mod block_tree;
pub mod changes;
pub mod constants;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod merkle;
pub mod pow;
pub mod records;
pub mod script;
pub mod sighash;
pub mod traits;
pub mod types;
pub mod validation;
