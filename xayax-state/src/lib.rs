//! Persistent chain-state storage for Xaya X.
//!
//! The store keeps the blocks we are aware of as a tree, so that reorgs can
//! be handled properly and the blocks a GSP has to detach for an arbitrary
//! catch-up request can be determined.  It is backed by a single SQLite
//! file per connected chain.
//!
//! # Correctness
//!
//! The store is a single-writer structure: it is not internally
//! synchronised, and callers serialise all access through one outer mutex
//! (the "chain mutex").  Every multi-step update runs inside a savepoint
//! batch, so a failed update never leaves a partial write behind.

#![warn(missing_docs)]

mod chainstate;
mod error;

pub use chainstate::Chainstate;
pub use error::{Result, StateError};
