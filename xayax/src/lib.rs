//! Xaya X: an adapter serving the game RPC and ZMQ interface on top of an
//! arbitrary base chain.
//!
//! The crate ties the chain-agnostic pieces together: the [`sync::ChainSync`]
//! worker keeps the local [`xayax_state::Chainstate`] converging to the
//! base chain's tip, the [`pending::PendingManager`] orders pending-move
//! pushes against block updates, and the [`Controller`] owns the whole
//! lifecycle including the RPC and ZMQ servers.
//!
//! Base-chain connectors (one per supported chain family) are separate
//! binaries; they parse the common [`Args`] surface, construct their
//! [`xayax_chain::base_chain::BaseChain`] implementation and hand both to
//! a [`Controller`].

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod pending;
pub mod sync;

pub use config::{Args, ArgsError, BlockCacheSetup, Config};
pub use controller::{Controller, ControllerError};
