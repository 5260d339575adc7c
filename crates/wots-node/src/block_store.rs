//! In-memory [`BlockStore`] for tests and embedded use.
//!
//! Blocks are kept by hash. The height index only follows trusted adds,
//! which the chain engine issues for blocks on the committed chain, so a
//! later side-branch block at the same height does not shadow it.

use std::collections::HashMap;

use parking_lot::RwLock;

use wots_core::error::StorageError;
use wots_core::traits::{BlockRef, BlockStore};
use wots_core::types::Hash256;

#[derive(Default)]
struct Inner {
    by_hash: HashMap<Hash256, Vec<u8>>,
    by_height: HashMap<u32, Hash256>,
}

#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }
}

impl BlockStore for MemoryBlockStore {
    fn add(&self, height: u32, hash: &Hash256, raw: &[u8], trusted: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.by_hash.insert(*hash, raw.to_vec());
        if trusted {
            inner.by_height.insert(height, *hash);
        }
        Ok(())
    }

    fn get_raw(&self, at: BlockRef) -> Result<Vec<u8>, StorageError> {
        let inner = self.inner.read();
        let hash = match at {
            BlockRef::Hash(h) => h,
            BlockRef::Height(h) => *inner.by_height.get(&h).ok_or_else(|| StorageError::BlockNotFound(at.to_string()))?,
        };
        inner
            .by_hash
            .get(&hash)
            .cloned()
            .ok_or_else(|| StorageError::BlockNotFound(at.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_fetch() {
        let store = MemoryBlockStore::new();
        let h = Hash256([1; 32]);
        store.add(5, &h, b"raw", true).unwrap();
        assert_eq!(store.get_raw(BlockRef::Hash(h)).unwrap(), b"raw");
        assert_eq!(store.get_raw(BlockRef::Height(5)).unwrap(), b"raw");
        assert!(store.contains(&h));
    }

    #[test]
    fn untrusted_add_not_indexed_by_height() {
        let store = MemoryBlockStore::new();
        let main = Hash256([1; 32]);
        let side = Hash256([2; 32]);
        store.add(5, &main, b"main", true).unwrap();
        store.add(5, &side, b"side", false).unwrap();
        assert_eq!(store.get_raw(BlockRef::Height(5)).unwrap(), b"main");
        assert_eq!(store.get_raw(BlockRef::Hash(side)).unwrap(), b"side");
    }

    #[test]
    fn missing_block() {
        let store = MemoryBlockStore::new();
        assert!(matches!(store.get_raw(BlockRef::Height(1)), Err(StorageError::BlockNotFound(_))));
        assert!(store.is_empty());
    }
}
