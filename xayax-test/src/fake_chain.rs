//! An in-memory base-chain connector for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use xayax_chain::{
    base_chain::{BaseChain, BoxError, CallbackSlot, Callbacks},
    BlockData, MoveData,
};
use xayax_state::Chainstate;

/// A [`BaseChain`] implementation driven from the test itself.
///
/// The underlying block tree is kept in an in-memory [`Chainstate`], so the
/// fake handles arbitrary reorgs and re-attaches of tips just like a real
/// chain would.  Tip updates and pending moves are pushed synchronously to
/// the installed callbacks, which exercises the same cross-thread paths as
/// a real connector because tests drive the fake from their own thread.
pub struct FakeChain {
    inner: Mutex<Inner>,
    callbacks: CallbackSlot,
}

struct Inner {
    /// Tree structure of the chain, with an in-memory database.
    chain: Chainstate,

    /// All block data ever produced, including blocks that are currently
    /// on the fake's main chain.
    blocks: HashMap<String, BlockData>,

    /// Counter used to "generate" block hashes.
    hash_counter: u64,

    mempool: Vec<String>,
    pending_supported: bool,
    fail_requests: bool,
    chain_id: String,
    version: u64,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    /// Creates a fake chain with no blocks yet.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                chain: Chainstate::in_memory().expect("in-memory chain state opens"),
                blocks: HashMap::new(),
                hash_counter: 0,
                mempool: Vec::new(),
                pending_supported: false,
                fail_requests: false,
                chain_id: "fake".to_string(),
                version: 1_00_00,
            }),
            callbacks: CallbackSlot::default(),
        }
    }

    /// Makes `enable_pending` succeed (or fail) for this fake.
    pub fn set_pending_supported(&self, supported: bool) {
        self.lock().pending_supported = supported;
    }

    /// Overrides the chain id reported by the fake.
    pub fn set_chain_id(&self, chain_id: &str) {
        self.lock().chain_id = chain_id.to_string();
    }

    /// Makes all pull requests fail (or succeed again), to exercise
    /// transient-error handling.
    pub fn set_fail_requests(&self, fail: bool) {
        self.lock().fail_requests = fail;
    }

    /// Constructs a new genesis block at the given height.
    pub fn new_genesis(&self, height: u64) -> BlockData {
        BlockData {
            hash: self.new_block_hash(),
            parent: "pregenesis".to_string(),
            height,
            ..Default::default()
        }
    }

    /// Constructs a new block on top of the given parent, which must have
    /// been set as a tip before.
    pub fn new_block_from(&self, parent: &str) -> BlockData {
        let hash = self.new_block_hash();
        let inner = self.lock();
        BlockData {
            hash,
            parent: parent.to_string(),
            height: inner.blocks[parent].height + 1,
            ..Default::default()
        }
    }

    /// Constructs a new block following the current tip.
    pub fn new_block(&self) -> BlockData {
        let parent = self.tip_hash();
        self.new_block_from(&parent)
    }

    /// Installs the given block as genesis and notifies about the new tip.
    pub fn set_genesis(&self, blk: BlockData) -> BlockData {
        {
            let mut inner = self.lock();
            inner.blocks.insert(blk.hash.clone(), blk.clone());
            inner.chain.import_tip(&blk).expect("importing genesis");
        }
        self.callbacks.tip_changed(&blk.hash);
        blk
    }

    /// Installs the given block as the new tip (performing any reorg) and
    /// notifies about it.
    pub fn set_tip(&self, blk: BlockData) -> BlockData {
        {
            let mut inner = self.lock();
            inner.blocks.insert(blk.hash.clone(), blk.clone());
            inner
                .chain
                .set_tip(&blk)
                .expect("setting fake tip")
                .expect("parent of the new fake tip is known");
        }
        self.callbacks.tip_changed(&blk.hash);
        blk
    }

    /// Attaches `n` fresh blocks on top of the given parent, notifying for
    /// each, and returns them.
    pub fn attach_branch(&self, parent: &str, n: usize) -> Vec<BlockData> {
        let mut res = Vec::with_capacity(n);
        for i in 0..n {
            let blk = if i == 0 {
                self.new_block_from(parent)
            } else {
                self.new_block()
            };
            res.push(self.set_tip(blk));
        }
        res
    }

    /// Pushes a batch of pending moves to the installed callbacks.
    pub fn push_pending(&self, moves: Vec<MoveData>) {
        self.callbacks.pending_moves(&moves);
    }

    /// Sets the mempool content returned by `get_mempool`.
    pub fn set_mempool(&self, txids: Vec<String>) {
        self.lock().mempool = txids;
    }

    /// Returns the hash of the current tip.  Panics if there is none.
    pub fn tip_hash(&self) -> String {
        let inner = self.lock();
        let height = inner
            .chain
            .get_tip_height()
            .expect("tip height query")
            .expect("fake chain has no tip yet");
        inner
            .chain
            .get_hash_for_height(height)
            .expect("tip hash query")
            .expect("tip block is known")
    }

    fn new_block_hash(&self) -> String {
        let mut inner = self.lock();
        inner.hash_counter += 1;
        format!("block {}", inner.hash_counter)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake chain lock poisoned")
    }
}

impl Inner {
    fn check_failure(&self) -> Result<(), BoxError> {
        if self.fail_requests {
            return Err("injected fake chain failure".into());
        }
        Ok(())
    }
}

impl BaseChain for FakeChain {
    fn set_callbacks(&self, cb: Option<Arc<dyn Callbacks>>) {
        self.callbacks.set(cb);
    }

    fn enable_pending(&self) -> Result<bool, BoxError> {
        Ok(self.lock().pending_supported)
    }

    fn get_tip_height(&self) -> Result<u64, BoxError> {
        let inner = self.lock();
        inner.check_failure()?;
        Ok(inner.chain.get_tip_height()?.unwrap_or(0))
    }

    fn get_block_range(&self, start: u64, count: u64) -> Result<Vec<BlockData>, BoxError> {
        let inner = self.lock();
        inner.check_failure()?;
        let mut res = Vec::new();
        for height in start..start + count {
            match inner.chain.get_hash_for_height(height)? {
                Some(hash) => res.push(inner.blocks[&hash].clone()),
                None => break,
            }
        }
        Ok(res)
    }

    fn get_mainchain_height(&self, hash: &str) -> Result<Option<u64>, BoxError> {
        let inner = self.lock();
        match inner.chain.get_height_for_hash(hash)? {
            Some(height) => {
                let main = inner.chain.get_hash_for_height(height)?;
                Ok(main.filter(|h| h.as_str() == hash).map(|_| height))
            }
            None => Ok(None),
        }
    }

    fn get_mempool(&self) -> Result<Vec<String>, BoxError> {
        Ok(self.lock().mempool.clone())
    }

    /// Signatures in the fake scheme are simply `<address>|<message>` as
    /// raw bytes; recovery strips the message suffix.
    fn verify_message(&self, msg: &str, signature: &[u8]) -> Result<Option<String>, BoxError> {
        let sig = String::from_utf8(signature.to_vec()).ok();
        Ok(sig
            .and_then(|s| s.strip_suffix(&format!("|{msg}")).map(str::to_string))
            .filter(|addr| !addr.is_empty()))
    }

    fn get_chain(&self) -> Result<String, BoxError> {
        Ok(self.lock().chain_id.clone())
    }

    fn get_version(&self) -> Result<u64, BoxError> {
        Ok(self.lock().version)
    }
}
