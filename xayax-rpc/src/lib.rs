//! JSON-RPC interface of Xaya X.
//!
//! The endpoint mimics the method surface GSPs already use against the
//! upstream game daemon: chain info, block lookups, ZMQ endpoint discovery,
//! message verification, mempool access and the `game_sendupdates` catch-up
//! stream.  Error codes follow the legacy daemon conventions so existing
//! GSP logic keeps working unchanged.

#![warn(missing_docs)]

pub mod errors;
pub mod updates;

mod methods;
mod server;

pub use methods::{
    GameSendUpdates, GetBlockChainInfo, GetBlockHeader, GetNetworkInfo, Rpc, RpcImpl, StopSignal,
    UpdateSteps, VerifyMessageResponse, ZmqNotification, DEFAULT_MAX_UPDATE_ATTACHES,
};
pub use server::{Config, RpcServer};
