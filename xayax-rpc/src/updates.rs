//! The shared detach/attach notification stream.
//!
//! Both the controller (after every sync tip update) and the
//! `game_sendupdates` RPC walk a GSP from some block onto the current main
//! chain by sending a sequence of detach notifications followed by attach
//! notifications.  This module implements that walk once for both callers.

use thiserror::Error;

use tracing::warn;
use xayax_chain::{
    base_chain::{BaseChain, BoxError},
    BlockData,
};
use xayax_state::{Chainstate, StateError};
use xayax_zmq::{PublishError, ZmqPub};

/// Errors while pushing a block update stream.
#[derive(Debug, Error)]
pub enum PushError {
    /// Reading the local chain state failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Publishing a notification failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Querying the base chain failed.
    #[error("base chain error: {0}")]
    Base(#[source] BoxError),

    /// The blocks provided by the sync update do not line up with the
    /// locally determined fork point.  This means the chain state and the
    /// update stream disagree, which should be impossible.
    #[error("sync update does not line up with the local chain state: {0}")]
    Inconsistent(String),
}

/// The notifications that one [`push_zmq_blocks`] call sent out.
#[derive(Debug, Default)]
pub struct PushedBlocks {
    /// Blocks for which detach notifications were sent, tip first.
    pub detached: Vec<BlockData>,

    /// Blocks for which attach notifications were sent, ascending height.
    pub attached: Vec<BlockData>,
}

/// Sends ZMQ notifications for the block detaches and attaches that walk a
/// GSP from the block `from` onto the current main chain.
///
/// For updates triggered by the sync worker, `attaches` holds the blocks
/// the sync just processed (going back at least to the fork point) and no
/// base-chain queries are made.  For explicit catch-up requests, `attaches`
/// is `None` and up to `max_attaches` blocks are queried from the base
/// chain instead; `stop_at` optionally truncates that stream after a given
/// block hash.
///
/// Returns `None` when `from` is not known locally *and* the base chain
/// does not know it as a main-chain block either; no messages are sent in
/// that case.  Races with concurrent reorgs are resolved by sending a
/// detach-only (possibly empty) stream; the caller reports the partial
/// result and the GSP's recovery logic re-requests.
pub fn push_zmq_blocks(
    chain: &Chainstate,
    base: &dyn BaseChain,
    zmq: &ZmqPub,
    from: &str,
    attaches: Option<&[BlockData]>,
    stop_at: Option<&str>,
    max_attaches: u64,
    reqtoken: Option<&str>,
) -> Result<Option<PushedBlocks>, PushError> {
    let mut detached = Vec::new();

    // Height of the first block to attach and the parent hash it must
    // chain to.
    let start_height;
    let fork_point;

    if from.is_empty() {
        // The very first attach after an import; everything provided by
        // the sync update is new.
        let provided = attaches.unwrap_or_default();
        match provided.first() {
            Some(first) => {
                start_height = first.height;
                fork_point = None;
            }
            None => return Ok(Some(PushedBlocks::default())),
        }
    } else {
        match chain.get_fork_branch(from)? {
            Some(branch) => {
                detached = branch;
                match detached.last() {
                    Some(last) => {
                        // Attaches replace the detached blocks starting at
                        // the height of the deepest one.
                        start_height = last.height;
                        fork_point = Some(last.parent.clone());
                    }
                    None => {
                        // `from` is on the main chain; attach right after it.
                        let height = chain.get_height_for_hash(from)?.ok_or_else(|| {
                            StateError::Corruption(format!(
                                "block {from} has a fork branch but no height"
                            ))
                        })?;
                        start_height = height + 1;
                        fork_point = Some(from.to_string());
                    }
                }
            }
            None => {
                // Unknown locally.  It may still be a pruned main-chain
                // block that the base chain can place for us.
                match base.get_mainchain_height(from).map_err(PushError::Base)? {
                    Some(height) => {
                        start_height = height + 1;
                        fork_point = Some(from.to_string());
                    }
                    None => {
                        warn!(from, "block to update from is not known at all");
                        return Ok(None);
                    }
                }
            }
        }
    }

    for blk in &detached {
        zmq.send_block_detach(blk, reqtoken)?;
    }

    if let Some(provided) = attaches {
        return push_provided_attaches(zmq, provided, detached, start_height, fork_point, reqtoken);
    }

    // This is an explicit catch-up request; query the base chain for the
    // attach blocks, up to the given limit or our own chain tip.
    let tip_height = match chain.get_tip_height()? {
        Some(height) if height + 1 > start_height => height,
        _ => {
            return Ok(Some(PushedBlocks {
                detached,
                attached: Vec::new(),
            }))
        }
    };
    let num = max_attaches.min(tip_height + 1 - start_height);
    let mut queried = base
        .get_block_range(start_height, num)
        .map_err(PushError::Base)?;

    if let Some(stop) = stop_at {
        if let Some(pos) = queried.iter().position(|blk| blk.hash == stop) {
            queried.truncate(pos + 1);
        }
    }

    if queried.is_empty() {
        return Ok(Some(PushedBlocks {
            detached,
            attached: Vec::new(),
        }));
    }

    // The queried chain may not line up with the detaches if a reorg raced
    // us.  In that case no attaches are sent at all; the GSP's logic for
    // missed notifications recovers from the partial update.
    if let Some(fork_point) = &fork_point {
        if &queried[0].parent != fork_point {
            warn!("mismatch between detached and attached blocks, racing reorg?");
            return Ok(Some(PushedBlocks {
                detached,
                attached: Vec::new(),
            }));
        }
    }

    // Never send attaches for blocks the local chain state does not know,
    // so GSPs cannot get stuck on them.  Blocks below the pruning horizon
    // cannot be cross-checked and are taken on the base chain's word.
    let last = queried.last().expect("queried attaches are non-empty");
    let lowest = chain.get_lowest_unpruned_height()?.unwrap_or(0);
    if last.height >= lowest {
        match chain.get_height_for_hash(&last.hash)? {
            Some(height) if height == last.height => (),
            _ => {
                warn!("attach blocks are not known to the local chain state yet");
                return Ok(Some(PushedBlocks {
                    detached,
                    attached: Vec::new(),
                }));
            }
        }
    }

    for blk in &queried {
        zmq.send_block_attach(blk, reqtoken)?;
    }

    Ok(Some(PushedBlocks {
        detached,
        attached: queried,
    }))
}

/// Sends the attach notifications for a sync-provided block sequence.
fn push_provided_attaches(
    zmq: &ZmqPub,
    provided: &[BlockData],
    detached: Vec<BlockData>,
    start_height: u64,
    fork_point: Option<String>,
    reqtoken: Option<&str>,
) -> Result<Option<PushedBlocks>, PushError> {
    // If the update consists of detaches only, the sync hands us a single
    // "attach" that is the parent the detaches collapse back onto; nothing
    // is actually attached then.
    if provided.len() == 1 {
        if let (Some(last), first) = (detached.last(), &provided[0]) {
            if first.hash == last.parent {
                return Ok(Some(PushedBlocks {
                    detached,
                    attached: Vec::new(),
                }));
            }
        }
    }

    let mut attached = Vec::new();
    let mut found_fork_point = false;
    for blk in provided {
        if blk.height == start_height {
            found_fork_point = true;
            if let Some(fork_point) = &fork_point {
                if &blk.parent != fork_point {
                    return Err(PushError::Inconsistent(format!(
                        "attach block {} at the fork height does not chain to {}",
                        blk.hash, fork_point
                    )));
                }
            }
        }
        if blk.height >= start_height {
            zmq.send_block_attach(blk, reqtoken)?;
            attached.push(blk.clone());
        }
    }

    if !found_fork_point {
        return Err(PushError::Inconsistent(
            "sync update does not reach back to the fork point".to_string(),
        ));
    }

    Ok(Some(PushedBlocks { detached, attached }))
}

#[cfg(test)]
mod tests;
