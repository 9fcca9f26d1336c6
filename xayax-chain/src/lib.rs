//! Core blockchain data model for Xaya X.
//!
//! This crate defines the chain-agnostic entities that flow between a
//! base-chain connector, the local chain state, and the notification
//! interfaces: [`BlockData`] and [`MoveData`], together with the
//! [`base_chain::BaseChain`] contract that every connector implements.
//!
//! The data model deliberately treats hashes, move payloads and metadata as
//! opaque: the adapter routes them but never interprets chain-specific
//! details beyond the minimal JSON shape needed for per-game filtering.

#![warn(missing_docs)]

pub mod base_chain;
pub mod serialization;

mod block;
mod moves;

pub use block::BlockData;
pub use moves::MoveData;
