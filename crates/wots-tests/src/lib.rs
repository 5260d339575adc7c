//! Cross-crate test suite for the wots chain-state engine.
//!
//! Integration tests under `tests/` drive a full [`wots_node::ChainEngine`]
//! over a temporary data directory and check the state-machine properties
//! that must hold across commit, undo, reorganisation and snapshotting.

pub mod helpers;
