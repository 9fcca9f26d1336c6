//! The contract between the adapter core and a base-chain connector.
//!
//! A connector translates one particular blockchain's native RPC/push
//! protocol into the pull operations and push callbacks defined here.  The
//! core never sees anything chain-specific beyond this trait.

use std::sync::{Arc, Mutex};

use crate::{BlockData, MoveData};

/// A boxed [`std::error::Error`], used to type-erase connector errors at
/// the base-chain boundary.  The core treats them as transient.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for base-chain operations.
pub type Result<T> = std::result::Result<T, BoxError>;

/// Push notifications delivered by a [`BaseChain`] connector.
///
/// Connectors are free to invoke these from internal threads (typically a
/// subscriber loop and a periodic poller), so implementations must be
/// thread-safe.
pub trait Callbacks: Send + Sync {
    /// Invoked when the best tip of the base chain changes, with the hash
    /// of the new tip.
    fn tip_changed(&self, tip: &str);

    /// Invoked when a new pending transaction is detected.  All moves in
    /// the batch share the same txid.
    fn pending_moves(&self, moves: &[MoveData]);
}

/// Interface a base-chain connector implements to provide the adapter with
/// raw data about the connected blockchain.
///
/// All pull operations may be called concurrently with each other and with
/// callback deliveries, and may fail transiently (e.g. on network errors).
/// Callers handle errors gracefully and retry; only `get_chain` and
/// `get_version` are assumed stable over the process lifetime and are
/// cached.
pub trait BaseChain: Send + Sync {
    /// Installs (or clears, with `None`) the sink that receives push
    /// notifications about new tips and pending transactions.
    fn set_callbacks(&self, cb: Option<Arc<dyn Callbacks>>);

    /// Called once after construction and before any other pull operation.
    /// Connectors can override this to e.g. start a listening thread.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Opts in to pending-move push notifications.  Returns `false` if the
    /// connector does not support tracking the mempool.
    fn enable_pending(&self) -> Result<bool> {
        Ok(false)
    }

    /// Returns the block height of the current best tip.
    fn get_tip_height(&self) -> Result<u64>;

    /// Retrieves up to `count` blocks (with all contained moves) on the
    /// current main chain starting from height `start` inclusive.  Fewer or
    /// no blocks are returned if the main chain ends earlier.  The returned
    /// blocks chain together consistently by hash and parent.
    fn get_block_range(&self, start: u64, count: u64) -> Result<Vec<BlockData>>;

    /// Looks up a block by hash and returns its height if it is known and
    /// on the current main chain.
    fn get_mainchain_height(&self, hash: &str) -> Result<Option<u64>>;

    /// Returns the txids currently in the mempool.  The order may be
    /// significant for pending-move tracking.
    fn get_mempool(&self) -> Result<Vec<String>>;

    /// Tries to recover the address that signed `msg` with the given raw
    /// signature bytes, based on how message signing works on the connected
    /// chain.  Returns `None` when recovery fails.
    ///
    /// Addresses are assumed to have a single canonical representation
    /// (e.g. checksummed form on chains with case-insensitive addresses).
    fn verify_message(&self, msg: &str, signature: &[u8]) -> Result<Option<String>>;

    /// Returns the string identifying the connected chain / network.
    /// Stable over the process lifetime.
    fn get_chain(&self) -> Result<String>;

    /// Returns the version of the connected daemon, so GSPs can check they
    /// talk to something recent enough.  Stable over the process lifetime.
    fn get_version(&self) -> Result<u64>;
}

/// Holder for the currently installed [`Callbacks`] sink.
///
/// Connectors embed one of these and deliver their push notifications
/// through it, so that `set_callbacks` behaves uniformly across
/// implementations.
#[derive(Default)]
pub struct CallbackSlot {
    inner: Mutex<Option<Arc<dyn Callbacks>>>,
}

impl CallbackSlot {
    /// Replaces the installed sink.
    pub fn set(&self, cb: Option<Arc<dyn Callbacks>>) {
        *self.inner.lock().expect("callback slot lock poisoned") = cb;
    }

    /// Delivers a tip-changed notification to the installed sink, if any.
    pub fn tip_changed(&self, tip: &str) {
        let cb = self.inner.lock().expect("callback slot lock poisoned").clone();
        if let Some(cb) = cb {
            cb.tip_changed(tip);
        }
    }

    /// Delivers a pending-moves notification to the installed sink, if any.
    pub fn pending_moves(&self, moves: &[MoveData]) {
        let cb = self.inner.lock().expect("callback slot lock poisoned").clone();
        if let Some(cb) = cb {
            cb.pending_moves(moves);
        }
    }
}
