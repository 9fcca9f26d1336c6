//! The background worker keeping the chain state in sync with the base
//! chain.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use xayax_chain::{
    base_chain::{BaseChain, BoxError},
    BlockData,
};
use xayax_state::{Chainstate, StateError};

/// Maximum number of blocks requested from the base chain in one step.
const MAX_BLOCK_RANGE: u64 = 128;

/// Time between forced update steps while no tip notifications arrive.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time to sleep between update steps even if we are not fully caught up,
/// so the chain lock is not held continuously for a long time.
const WAIT_BETWEEN_STEPS: Duration = Duration::from_millis(1);

/// Errors from the sync worker.  Everything except `Base` is fatal for the
/// process.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The base chain reorged further back than the locally kept history.
    /// The store cannot follow; an operator has to intervene (e.g. by
    /// resetting the data directory).
    #[error("reorg beyond the pruning depth")]
    ReorgBeyondPruningDepth,

    /// The chain state failed or is corrupt.
    #[error(transparent)]
    State(#[from] StateError),

    /// A transient base-chain error; the step is retried on the next
    /// wakeup.
    #[error("base chain error: {0}")]
    Base(#[source] BoxError),
}

/// Callbacks for updates triggered by the sync worker.
pub trait Callbacks: Send + Sync {
    /// Invoked when the tip of the chain state was updated, with the
    /// previous tip (empty when a tip was freshly imported) and the
    /// sequence of blocks just attached.  The attach sequence may reach
    /// back before the fork point, but its last element is the new tip.
    ///
    /// The locked chain state is passed in, so that the callback's
    /// processing is atomic with the update itself and no tip can change
    /// in between.
    fn tip_updated_from(&self, chain: &mut Chainstate, old_tip: &str, attaches: &[BlockData]);
}

/// Handler invoked (once) when the worker hits a fatal error and stops.
pub type FatalHandler = Box<dyn FnOnce(SyncError) + Send>;

/// The background task syncing a [`Chainstate`] to a base chain.
///
/// The worker runs on its own thread, driven by new-tip notifications and
/// a periodic timeout, and is stopped when the instance is dropped.  The
/// chain state and its mutex are shared with the rest of the system (RPC
/// handlers read it, catch-up requests walk it); all writes happen here.
pub struct ChainSync {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    base: Arc<dyn BaseChain>,
    chain: Arc<Mutex<Chainstate>>,

    /// The pruning depth the sync ensures.  The initial block, as well as
    /// fast catch-up reimports, anchor this far behind the base-chain tip.
    pruning_depth: u64,

    state: Mutex<State>,

    /// Notified when the worker should wake up: a new tip was pushed or
    /// the instance is shutting down.
    cv: Condvar,
}

struct State {
    should_stop: bool,
    callbacks: Option<Arc<dyn Callbacks>>,
    on_fatal: Option<FatalHandler>,

    /// Number of blocks to request per step.  One during normal operation;
    /// grown exponentially (up to [`MAX_BLOCK_RANGE`]) while catching up
    /// or searching for a fork point, and reset once caught up.
    num_blocks: u64,

    /// Start height for the next block request while searching backwards
    /// for a reorg fork point.  `None` means to continue from the current
    /// tip.
    next_start_height: Option<u64>,
}

impl ChainSync {
    /// Creates a sync worker for the given base chain and chain state.  It
    /// does nothing until [`ChainSync::start`] is called.
    pub fn new(base: Arc<dyn BaseChain>, chain: Arc<Mutex<Chainstate>>, pruning_depth: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                base,
                chain,
                pruning_depth,
                state: Mutex::new(State {
                    should_stop: false,
                    callbacks: None,
                    on_fatal: None,
                    num_blocks: 1,
                    next_start_height: None,
                }),
                cv: Condvar::new(),
            }),
            worker: None,
        }
    }

    /// Sets the callbacks invoked on tip updates.
    pub fn set_callbacks(&self, cb: Option<Arc<dyn Callbacks>>) {
        self.inner.lock_state().callbacks = cb;
    }

    /// Sets the handler invoked when the worker dies on a fatal error.
    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        self.inner.lock_state().on_fatal = Some(handler);
    }

    /// Records the chain id and starts the background thread.  Fails if
    /// the connector cannot be queried or reports a different chain than
    /// the stored state.
    pub fn start(&mut self) -> Result<(), SyncError> {
        assert!(self.worker.is_none(), "sync worker started twice");

        // Unlike base-chain errors during later steps, a failure here
        // cannot reasonably be skipped; it fails startup, where it will be
        // noticed, instead of crashing mid-run.
        let chain_id = self.inner.base.get_chain().map_err(SyncError::Base)?;
        self.inner.lock_chain().set_chain(&chain_id)?;

        {
            let mut state = self.inner.lock_state();
            state.should_stop = false;
            state.num_blocks = 1;
            state.next_start_height = None;
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("chain-sync".to_string())
            .spawn(move || inner.run_worker())
            .expect("failed to spawn the sync worker thread");
        self.worker = Some(handle);

        Ok(())
    }

    /// Notifies the worker about a potential new tip on the base chain.
    pub fn new_base_chain_tip(&self) {
        let _guard = self.inner.lock_state();
        self.inner.cv.notify_all();
    }

    /// Returns a handle that can wake the worker from connector callbacks,
    /// independently of the instance's ownership.
    pub fn notifier(&self) -> SyncNotifier {
        SyncNotifier {
            inner: self.inner.clone(),
        }
    }
}

/// A cloneable handle waking the sync worker about new base-chain tips.
#[derive(Clone)]
pub struct SyncNotifier {
    inner: Arc<Inner>,
}

impl SyncNotifier {
    /// Notifies the worker about a potential new tip on the base chain.
    pub fn new_base_chain_tip(&self) {
        let _guard = self.inner.lock_state();
        self.inner.cv.notify_all();
    }
}

impl Drop for ChainSync {
    fn drop(&mut self) {
        self.inner.lock_state().should_stop = true;
        self.inner.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("sync worker thread panicked");
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("sync state lock poisoned")
    }

    fn lock_chain(&self) -> MutexGuard<'_, Chainstate> {
        self.chain.lock().expect("chain mutex poisoned")
    }

    fn run_worker(self: Arc<Self>) {
        let mut state = self.lock_state();
        while !state.should_stop {
            let more_steps = match self.update_step(&mut state) {
                Ok(more) => more,
                Err(SyncError::Base(err)) => {
                    warn!(%err, "error in sync update step");
                    false
                }
                Err(fatal) => {
                    error!(%fatal, "fatal error in sync update step");
                    let handler = state.on_fatal.take();
                    drop(state);
                    if let Some(handler) = handler {
                        handler(fatal);
                    }
                    return;
                }
            };

            if state.should_stop {
                break;
            }

            if more_steps {
                drop(state);
                thread::sleep(WAIT_BETWEEN_STEPS);
                state = self.lock_state();
            } else {
                state = self
                    .cv
                    .wait_timeout(state, UPDATE_TIMEOUT)
                    .expect("sync state lock poisoned")
                    .0;
            }
        }
    }

    /// Runs a single update step towards the base chain's current state.
    /// Returns whether another step should be done right away.
    ///
    /// All base-chain queries happen before the chain mutex is taken, so
    /// the (potentially slow) network pulls never block RPC readers.  The
    /// worker is the only writer, so nothing can invalidate the queried
    /// data in between.
    fn update_step(&self, state: &mut State) -> Result<bool, SyncError> {
        let base_tip = self.base.get_tip_height().map_err(SyncError::Base)?;
        let anchor_height = base_tip.saturating_sub(self.pruning_depth);

        let start_height = match state.next_start_height {
            Some(height) => height,
            None => {
                // Bind the lookup result so the chain lock is released
                // before a potential reimport takes it again.
                let local_tip = self.lock_chain().get_tip_height()?;
                match local_tip {
                    Some(tip) => tip,
                    None => return self.import_new_tip(state, anchor_height),
                }
            }
        };

        // At least three blocks are requested, starting at the current
        // tip.  Normally the tip comes back as the first block, so a reorg
        // is detected even if the new tip has a lower height; and with one
        // new block attached, the short response shows immediately that we
        // are caught up again.
        let num = state.num_blocks.max(3);
        debug!(start_height, num, "requesting blocks from the base chain");
        let blocks = self
            .base
            .get_block_range(start_height, num)
            .map_err(SyncError::Base)?;

        let mut chain = self.lock_chain();

        // If this update reactivates a branch we already store, the blocks
        // preceding the queried ones on that branch are needed to complete
        // the attach sequence for the callback.
        let mut attach_sequence = match blocks.first() {
            Some(first) => chain.get_fork_branch(&first.parent)?.unwrap_or_default(),
            None => Vec::new(),
        };

        let old_tip = match blocks.first() {
            Some(first) => chain.set_tip(first)?,
            None => None,
        };
        let old_tip = match old_tip {
            Some(old_tip) => old_tip,
            None => {
                // The first block does not fit our chain: the base chain
                // reorged below the start height.  Go back (at an
                // exponentially growing pace) looking for the fork point,
                // but never below the lowest unpruned block.  Requesting
                // from that block itself (rather than the one above) is
                // fine and also covers plain detaches down to it.
                state.grow_num_blocks();
                let lowest = chain.get_lowest_unpruned_height()?.unwrap_or(0);
                let next = lowest.max(start_height.saturating_sub(num));
                if next >= start_height {
                    // Already at the lowest unpruned height, and still no
                    // fork point.
                    return Err(SyncError::ReorgBeyondPruningDepth);
                }
                state.next_start_height = Some(next);
                return Ok(true);
            }
        };
        state.next_start_height = None;

        // Attach the remaining blocks, batched so that catching up in
        // large chunks does not cost one disk commit per block.
        chain.with_batch(|chain| {
            for pair in blocks.windows(2) {
                let prev = chain.set_tip(&pair[1])?.ok_or_else(|| {
                    StateError::Corruption(format!(
                        "block {} from a contiguous range failed to attach",
                        pair[1].hash
                    ))
                })?;
                if prev != pair[0].hash || prev != pair[1].parent {
                    return Err(StateError::Corruption(format!(
                        "base chain returned a non-contiguous range at {}",
                        pair[1].hash
                    )));
                }
            }
            Ok(())
        })?;

        let new_tip = &blocks.last().expect("blocks are non-empty").hash;
        if *new_tip != old_tip {
            counter!("sync_blocks_attached").increment(blocks.len() as u64);
            if let Some(cb) = &state.callbacks {
                attach_sequence.reverse();
                attach_sequence.extend(blocks.iter().cloned());
                cb.tip_updated_from(&mut chain, &old_tip, &attach_sequence);
            }
        }
        if let Some(tip) = chain.get_tip_height()? {
            gauge!("sync_tip_height").set(tip as f64);
        }

        // Fewer blocks than requested means we are caught up.
        if (blocks.len() as u64) < num {
            state.num_blocks = 1;
            return Ok(false);
        }

        // The query guarantees we are on the base chain's main chain now.
        // If we are still more than the pruning depth behind its tip,
        // quick-sync forward by reimporting at the anchor: assuming reorgs
        // never exceed the pruning depth, the skipped history cannot be
        // needed again, and all branches a GSP might sit on are kept.
        let highest = blocks.last().expect("blocks are non-empty").height;
        if highest < anchor_height {
            drop(chain);
            if self.import_new_tip(state, anchor_height)? {
                return Ok(true);
            }
            // The anchor fetch came back empty; keep retrieving blocks at
            // the normal pace and try again on a later step.
        }

        state.grow_num_blocks();
        Ok(true)
    }

    /// Fetches the block at the given height from the base chain and
    /// imports it as the new tip, pruning all local history below it.
    fn import_new_tip(&self, state: &mut State, height: u64) -> Result<bool, SyncError> {
        let blocks = self
            .base
            .get_block_range(height, 1)
            .map_err(SyncError::Base)?;
        let Some(blk) = blocks.first() else {
            warn!(height, "failed to get the anchor block from the base chain");
            return Ok(false);
        };

        // This trusts the base chain's reported tip height; everything
        // below the anchor is dropped locally and cannot be recovered.
        info!(
            hash = %blk.hash,
            height = blk.height,
            "fast catch-up: importing a new anchor tip and dropping older local history"
        );
        let mut chain = self.lock_chain();
        chain.import_tip(blk)?;

        if let Some(cb) = &state.callbacks {
            cb.tip_updated_from(&mut chain, "", &blocks);
        }

        Ok(true)
    }
}

impl State {
    fn grow_num_blocks(&mut self) {
        self.num_blocks = (self.num_blocks << 1).min(MAX_BLOCK_RANGE);
    }
}

#[cfg(test)]
mod tests;
