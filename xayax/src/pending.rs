//! Gating of pending-move notifications against block updates.
//!
//! The connector delivers pending-move and tip-changed notifications
//! asynchronously with respect to the sync worker committing new tips.  A
//! naive forwarder could publish a pending move whose transaction is in
//! fact already confirmed in the block the GSP is about to receive next.
//! The gate holds pendings announced before the matching block back until
//! that block is committed.
//!
//! The underlying assumption is that while the chain state can update
//! out of order (e.g. through explicitly requested block ranges), the push
//! notifications about tips and pendings arrive in order.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use xayax_chain::MoveData;
use xayax_zmq::ZmqPub;

/// Orders pending-move pushes against block-tip pushes.  Pendings are
/// best-effort by design, so dropping them in unclear situations (initial
/// sync, reorgs) is fine.
pub struct PendingManager {
    zmq: Arc<ZmqPub>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Last tip committed to the chain state.
    chainstate_tip: String,

    /// Last tip announced by the connector.
    notification_tip: String,

    /// Pending batches received since the last tip announcement, waiting
    /// for the chain state to catch up to it.
    queue: Vec<Vec<MoveData>>,
}

impl PendingManager {
    /// Creates a gate pushing through the given publisher.
    pub fn new(zmq: Arc<ZmqPub>) -> Self {
        Self {
            zmq,
            state: Mutex::new(State::default()),
        }
    }

    /// Handles a tip announcement from the connector.
    pub fn tip_changed(&self, tip: &str) {
        let mut state = self.lock();

        if !state.queue.is_empty() {
            warn!(
                dropped = state.queue.len(),
                "dropping queued pending moves for new tip announcement"
            );
        }

        state.queue.clear();
        state.notification_tip = tip.to_string();
    }

    /// Handles a batch of pending moves from the connector.
    pub fn pending_moves(&self, moves: &[MoveData]) {
        let mut state = self.lock();

        // Until the first commit we know nothing about our position
        // relative to blocks; better not to forward anything.
        if state.chainstate_tip.is_empty() {
            warn!("ignoring pending moves before the first tip update");
            return;
        }

        if state.chainstate_tip == state.notification_tip {
            self.forward(moves);
            return;
        }

        state.queue.push(moves.to_vec());
    }

    /// Handles a new tip committed to the chain state.
    pub fn chainstate_tip_changed(&self, new_tip: &str) {
        let mut state = self.lock();
        state.chainstate_tip = new_tip.to_string();

        if state.chainstate_tip == state.notification_tip {
            if !state.queue.is_empty() {
                info!(
                    batches = state.queue.len(),
                    "sending previously queued pending moves"
                );
            }
            let queued = std::mem::take(&mut state.queue);
            for moves in &queued {
                self.forward(moves);
            }
        }
    }

    fn forward(&self, moves: &[MoveData]) {
        if let Err(err) = self.zmq.send_pending_moves(moves) {
            warn!(%err, "failed to publish pending moves");
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("pending gate lock poisoned")
    }
}
