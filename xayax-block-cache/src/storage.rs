//! Storage backends for cached blocks.

use std::{collections::BTreeMap, sync::Mutex};

use xayax_chain::{base_chain::Result, BlockData};

/// Storage interface for cached blocks.
///
/// Every block handed to [`Storage::store`] is assumed to be finalised
/// already, so storing is an idempotent replace by height.
pub trait Storage: Send + Sync {
    /// Stores all of the given blocks into the cache.
    fn store(&self, blocks: &[BlockData]) -> Result<()>;

    /// Tries to retrieve the given range from storage.  The full contiguous
    /// range is returned if and only if every height in
    /// `[start, start + count)` is present; otherwise the result is empty
    /// or a strict prefix, which callers treat as a miss.
    fn get_range(&self, start: u64, count: u64) -> Result<Vec<BlockData>>;
}

/// A [`Storage`] keeping blocks in memory.  Not useful at scale, but
/// convenient for testing.
#[derive(Default)]
pub struct InMemoryStorage {
    /// Stored blocks, keyed by height.
    blocks: Mutex<BTreeMap<u64, BlockData>>,
}

impl Storage for InMemoryStorage {
    fn store(&self, blocks: &[BlockData]) -> Result<()> {
        let mut stored = self.blocks.lock().expect("block storage lock poisoned");
        for blk in blocks {
            stored.insert(blk.height, blk.clone());
        }
        Ok(())
    }

    fn get_range(&self, start: u64, count: u64) -> Result<Vec<BlockData>> {
        let stored = self.blocks.lock().expect("block storage lock poisoned");

        let mut res = Vec::new();
        for height in start..start + count {
            match stored.get(&height) {
                Some(blk) => res.push(blk.clone()),
                None => break,
            }
        }

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blk(height: u64) -> BlockData {
        BlockData {
            hash: format!("b{height}"),
            height,
            ..Default::default()
        }
    }

    #[test]
    fn returns_prefix_on_gap() {
        let store = InMemoryStorage::default();
        store.store(&[blk(1), blk(2), blk(4)]).unwrap();

        assert_eq!(store.get_range(1, 2).unwrap().len(), 2);
        assert_eq!(store.get_range(1, 4).unwrap().len(), 2);
        assert_eq!(store.get_range(3, 2).unwrap().len(), 0);
        assert_eq!(store.get_range(4, 1).unwrap().len(), 1);
    }

    #[test]
    fn store_replaces_by_height() {
        let store = InMemoryStorage::default();
        store.store(&[blk(1)]).unwrap();

        let mut replacement = blk(1);
        replacement.hash = "other".to_string();
        store.store(&[replacement.clone()]).unwrap();

        assert_eq!(store.get_range(1, 1).unwrap(), vec![replacement]);
    }
}
