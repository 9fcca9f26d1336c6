//! ZMQ publisher pushing block and move notifications to GSPs.
//!
//! Notifications follow the established game interface: a single bound PUB
//! socket, three-frame messages `(topic, payload, seq)`, and topic strings
//! of the form `<command> json <game-id>` for the commands
//! `game-block-attach`, `game-block-detach` and `game-pending-move`.
//!
//! Move payloads are user-controlled input.  The strict JSON parsing in
//! this crate is the first line of defence: moves that are not valid JSON
//! objects (including objects with duplicate keys) are skipped with a
//! warning rather than failing the block they are contained in.

#![warn(missing_docs)]

mod json;
mod per_tx;
mod publisher;

pub use publisher::{PublishError, ZmqPub};
