//! Read-through caching layer for base-chain connectors.
//!
//! [`BlockCacheChain`] implements the [`BaseChain`] contract on top of
//! another connector, storing block ranges that are deep enough behind the
//! tip to be considered final.  When a `get_block_range` call can be served
//! entirely from storage, the upstream is not contacted at all; every other
//! call is forwarded as-is.
//!
//! The wrapper is written so that it never makes *extra* calls to the
//! underlying connector compared to using it directly; it only avoids
//! repeated expensive range reads (e.g. while several GSPs catch up over
//! the same history).

#![warn(missing_docs)]

mod mysql;
mod storage;

pub use mysql::MysqlStorage;
pub use storage::{InMemoryStorage, Storage};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing::trace;

use xayax_chain::{
    base_chain::{BaseChain, Callbacks, Result},
    BlockData, MoveData,
};

/// A [`BaseChain`] that uses another connector as ground truth and caches
/// finalised block ranges in a [`Storage`] backend.
pub struct BlockCacheChain {
    /// The underlying "ground truth" chain.
    base: Arc<dyn BaseChain>,

    /// Storage backend for cached blocks.
    store: Arc<dyn Storage>,

    /// Depth behind the tip a block must be before it is cached.  A block
    /// is only considered final if at least this many blocks follow it.
    min_depth: u64,

    /// The last tip height seen on the base chain.  Updated whenever
    /// `get_tip_height` is called (which happens on every sync step
    /// anyway), so judging finality produces no extra upstream traffic.
    last_tip_height: AtomicU64,
}

impl BlockCacheChain {
    /// Creates a new caching wrapper around `base` with the given storage
    /// backend and finality depth.
    pub fn new(base: Arc<dyn BaseChain>, store: Arc<dyn Storage>, min_depth: u64) -> Self {
        Self {
            base,
            store,
            min_depth,
            last_tip_height: AtomicU64::new(0),
        }
    }
}

impl BaseChain for BlockCacheChain {
    fn set_callbacks(&self, cb: Option<Arc<dyn Callbacks>>) {
        // Notifications keep flowing from the underlying connector; the
        // cache has nothing to add to them.
        self.base.set_callbacks(cb)
    }

    fn start(&self) -> Result<()> {
        self.base.start()
    }

    fn enable_pending(&self) -> Result<bool> {
        self.base.enable_pending()
    }

    fn get_tip_height(&self) -> Result<u64> {
        let height = self.base.get_tip_height()?;
        self.last_tip_height.store(height, Ordering::SeqCst);
        Ok(height)
    }

    fn get_block_range(&self, start: u64, count: u64) -> Result<Vec<BlockData>> {
        // Ranges close to the tip are not final yet; neither query nor fill
        // the cache for them.
        let last_tip = self.last_tip_height.load(Ordering::SeqCst);
        if start + count + self.min_depth > last_tip + 1 {
            trace!(start, count, last_tip, "range too close to the tip, bypassing cache");
            return self.base.get_block_range(start, count);
        }

        let cached = self.store.get_range(start, count)?;
        if cached.len() as u64 == count {
            trace!(start, count, "serving block range from the cache");
            return Ok(cached);
        }

        let blocks = self.base.get_block_range(start, count)?;
        self.store.store(&blocks)?;
        trace!(start, count, "stored block range in the cache");

        Ok(blocks)
    }

    fn get_mainchain_height(&self, hash: &str) -> Result<Option<u64>> {
        self.base.get_mainchain_height(hash)
    }

    fn get_mempool(&self) -> Result<Vec<String>> {
        self.base.get_mempool()
    }

    fn verify_message(&self, msg: &str, signature: &[u8]) -> Result<Option<String>> {
        self.base.verify_message(msg, signature)
    }

    fn get_chain(&self) -> Result<String> {
        self.base.get_chain()
    }

    fn get_version(&self) -> Result<u64> {
        self.base.get_version()
    }
}
