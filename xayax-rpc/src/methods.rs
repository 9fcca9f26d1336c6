//! The RPC methods exposed to GSPs.

use std::sync::{Arc, Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jsonrpc_core::Result;
use jsonrpc_derive::rpc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use xayax_chain::base_chain::BaseChain;
use xayax_state::Chainstate;
use xayax_zmq::ZmqPub;

use crate::{
    errors::{LegacyCode, MapError, OkOrError},
    updates::push_zmq_blocks,
};

/// Maximum number of attach notifications sent for one catch-up request.
pub const DEFAULT_MAX_UPDATE_ATTACHES: u64 = 1_024;

/// Callback invoked when the `stop` method asks the process to shut down.
pub type StopSignal = Arc<dyn Fn() + Send + Sync>;

/// RPC method signatures.
#[rpc(server)]
pub trait Rpc {
    /// getzmqnotifications
    ///
    /// Returns the ZMQ endpoints GSPs can subscribe to.  The block
    /// notification endpoint is always advertised; the pending-move
    /// endpoint only when pending tracking is enabled.
    #[rpc(name = "getzmqnotifications")]
    fn get_zmq_notifications(&self) -> Result<Vec<ZmqNotification>>;

    /// trackedgames
    ///
    /// Adds (`"add"`) or removes (`"remove"`) one tracking of the given
    /// game id.  Notifications for a game are published while its tracking
    /// depth is positive.
    #[rpc(name = "trackedgames")]
    fn tracked_games(&self, command: String, game_id: String) -> Result<()>;

    /// getnetworkinfo
    ///
    /// Returns the version of the connected base-chain daemon.
    #[rpc(name = "getnetworkinfo")]
    fn get_network_info(&self) -> Result<GetNetworkInfo>;

    /// getblockchaininfo
    ///
    /// Returns the connected chain id and the local tip (height -1 and an
    /// empty hash while nothing is synced yet).
    #[rpc(name = "getblockchaininfo")]
    fn get_blockchain_info(&self) -> Result<GetBlockChainInfo>;

    /// getblockhash
    ///
    /// Returns the main-chain block hash at the given height.  Heights
    /// below the pruning horizon are resolved through the base chain.
    #[rpc(name = "getblockhash")]
    fn get_block_hash(&self, height: i64) -> Result<String>;

    /// getblockheader
    ///
    /// Returns hash and height for a block known locally or (for pruned
    /// blocks) on the base chain's main chain.
    #[rpc(name = "getblockheader")]
    fn get_block_header(&self, hash: String) -> Result<GetBlockHeader>;

    /// game_sendupdates
    ///
    /// Triggers the stream of detach/attach ZMQ notifications that walks a
    /// GSP from `fromblock` onto the current main chain, and returns a
    /// summary of the walk.  All triggered notifications carry the
    /// returned request token.
    #[rpc(name = "game_sendupdates")]
    fn game_send_updates(
        &self,
        from_block: String,
        game_id: String,
        to_block: Option<String>,
    ) -> Result<GameSendUpdates>;

    /// verifymessage
    ///
    /// Verifies a message signature (base64) per the base chain's signing
    /// scheme.  With an empty address, recovery data is returned instead
    /// of a plain validity bool.
    #[rpc(name = "verifymessage")]
    fn verify_message(
        &self,
        address: String,
        message: String,
        signature: String,
    ) -> Result<VerifyMessageResponse>;

    /// getrawmempool
    ///
    /// Returns the txids in the base chain's mempool.
    #[rpc(name = "getrawmempool")]
    fn get_raw_mempool(&self) -> Result<Vec<String>>;

    /// stop
    ///
    /// Initiates shutdown of the process.
    #[rpc(name = "stop")]
    fn stop(&self) -> Result<String>;
}

/// A ZMQ endpoint advertisement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZmqNotification {
    /// Notification type, e.g. `pubgameblocks`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Address of the publisher socket.
    pub address: String,
}

/// Response to `getnetworkinfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNetworkInfo {
    /// Version of the connected base-chain daemon.
    pub version: u64,
}

/// Response to `getblockchaininfo`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockChainInfo {
    /// Chain id of the connected network.
    pub chain: String,

    /// Local tip height, or -1 if nothing is synced yet.
    pub blocks: i64,

    /// Local tip hash, or empty if nothing is synced yet.
    pub bestblockhash: String,
}

/// Response to `getblockheader`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockHeader {
    /// The queried block hash.
    pub hash: String,

    /// The block's height.
    pub height: u64,
}

/// Detach/attach counts of one catch-up walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSteps {
    /// Number of detach notifications sent.
    pub detach: u64,

    /// Number of attach notifications sent.
    pub attach: u64,
}

/// Response to `game_sendupdates`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSendUpdates {
    /// Token stamped into all notifications of this walk.
    pub reqtoken: String,

    /// The block the walk ends on.
    pub toblock: String,

    /// Set when the starting block is not known at all and no walk could
    /// be produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,

    /// The walk's step counts.
    pub steps: UpdateSteps,
}

/// Response to `verifymessage`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerifyMessageResponse {
    /// Plain validity check against a caller-provided address.
    Valid(bool),

    /// Recovery result for calls with an empty address.
    Recovery {
        /// Whether a signing address could be recovered at all.
        valid: bool,

        /// The recovered address, when valid.
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
}

/// RPC method implementations.
pub struct RpcImpl {
    chain: Arc<Mutex<Chainstate>>,
    base: Arc<dyn BaseChain>,
    zmq: Arc<ZmqPub>,

    /// Address advertised for the ZMQ endpoints.
    zmq_address: String,

    /// Whether pending-move tracking is active.
    pending_enabled: bool,

    /// Limit for attach notifications per catch-up request.
    max_update_attaches: u64,

    stop: StopSignal,

    /// Counter used to mint request tokens.
    requests: Mutex<u64>,

    /// The chain id and daemon version are stable over the upstream's
    /// lifetime and cached after the first successful query.
    cached_chain: Mutex<Option<String>>,
    cached_version: Mutex<Option<u64>>,
}

impl RpcImpl {
    /// Creates the method implementations for the given components.
    pub fn new(
        chain: Arc<Mutex<Chainstate>>,
        base: Arc<dyn BaseChain>,
        zmq: Arc<ZmqPub>,
        zmq_address: String,
        pending_enabled: bool,
        max_update_attaches: u64,
        stop: StopSignal,
    ) -> Self {
        Self {
            chain,
            base,
            zmq,
            zmq_address,
            pending_enabled,
            max_update_attaches,
            stop,
            requests: Mutex::new(0),
            cached_chain: Mutex::new(None),
            cached_version: Mutex::new(None),
        }
    }

    fn lock_chain(&self) -> MutexGuard<'_, Chainstate> {
        self.chain.lock().expect("chain mutex poisoned")
    }

    fn new_request_token(&self) -> String {
        let mut requests = self.requests.lock().expect("request counter lock poisoned");
        *requests += 1;
        format!("request_{requests}")
    }
}

impl Rpc for RpcImpl {
    fn get_zmq_notifications(&self) -> Result<Vec<ZmqNotification>> {
        let mut res = vec![ZmqNotification {
            kind: "pubgameblocks".to_string(),
            address: self.zmq_address.clone(),
        }];
        if self.pending_enabled {
            res.push(ZmqNotification {
                kind: "pubgamepending".to_string(),
                address: self.zmq_address.clone(),
            });
        }
        Ok(res)
    }

    fn tracked_games(&self, command: String, game_id: String) -> Result<()> {
        match command.as_str() {
            "add" => self.zmq.track_game(&game_id),
            "remove" => self.zmq.untrack_game(&game_id),
            _ => {
                return Err(jsonrpc_core::Error::invalid_params(format!(
                    "invalid tracked games command: {command}"
                )))
            }
        }
        Ok(())
    }

    fn get_network_info(&self) -> Result<GetNetworkInfo> {
        let mut cached = self
            .cached_version
            .lock()
            .expect("version cache lock poisoned");
        let version = match *cached {
            Some(version) => version,
            None => {
                let version = self.base.get_version().map_internal_error()?;
                *cached = Some(version);
                version
            }
        };
        Ok(GetNetworkInfo { version })
    }

    fn get_blockchain_info(&self) -> Result<GetBlockChainInfo> {
        let chain = {
            let mut cached = self.cached_chain.lock().expect("chain cache lock poisoned");
            match &*cached {
                Some(chain) => chain.clone(),
                None => {
                    let chain = self.base.get_chain().map_internal_error()?;
                    *cached = Some(chain.clone());
                    chain
                }
            }
        };

        let state = self.lock_chain();
        let (blocks, bestblockhash) = match state.get_tip_height().map_internal_error()? {
            None => (-1, String::new()),
            Some(height) => {
                let hash = state
                    .get_hash_for_height(height)
                    .map_internal_error()?
                    .ok_or_error(LegacyCode::Misc, "tip block has no hash")?;
                (height as i64, hash)
            }
        };

        Ok(GetBlockChainInfo {
            chain,
            blocks,
            bestblockhash,
        })
    }

    fn get_block_hash(&self, height: i64) -> Result<String> {
        let state = self.lock_chain();

        if height >= 0 {
            let height = height as u64;
            if let Some(hash) = state.get_hash_for_height(height).map_internal_error()? {
                return Ok(hash);
            }

            // Below the pruning horizon the base chain still knows the
            // block even though we dropped it locally.
            let pruned_below = state
                .get_lowest_unpruned_height()
                .map_internal_error()?
                .is_some_and(|lowest| height < lowest);
            if pruned_below {
                let blocks = self
                    .base
                    .get_block_range(height, 1)
                    .map_internal_error()?;
                if let Some(blk) = blocks.first() {
                    return Ok(blk.hash.clone());
                }
            }
        }

        Err(jsonrpc_core::Error {
            code: LegacyCode::InvalidParameter.into(),
            message: "block height out of range".to_string(),
            data: None,
        })
    }

    fn get_block_header(&self, hash: String) -> Result<GetBlockHeader> {
        let height = {
            let state = self.lock_chain();
            state.get_height_for_hash(&hash).map_internal_error()?
        };

        let height = match height {
            Some(height) => height,
            None => self
                .base
                .get_mainchain_height(&hash)
                .map_internal_error()?
                .ok_or_error(LegacyCode::InvalidAddressOrKey, "block not found")?,
        };

        Ok(GetBlockHeader { hash, height })
    }

    fn game_send_updates(
        &self,
        from_block: String,
        game_id: String,
        to_block: Option<String>,
    ) -> Result<GameSendUpdates> {
        let reqtoken = self.new_request_token();
        debug!(from_block, game_id, reqtoken, "sending game updates");

        let state = self.lock_chain();
        let pushed = push_zmq_blocks(
            &state,
            &*self.base,
            &self.zmq,
            &from_block,
            None,
            to_block.as_deref().filter(|to| !to.is_empty()),
            self.max_update_attaches,
            Some(&reqtoken),
        )
        .map_internal_error()?;

        let pushed = match pushed {
            Some(pushed) => pushed,
            None => {
                return Ok(GameSendUpdates {
                    reqtoken,
                    toblock: from_block,
                    error: Some(true),
                    steps: UpdateSteps {
                        detach: 0,
                        attach: 0,
                    },
                })
            }
        };

        let toblock = pushed
            .attached
            .last()
            .map(|blk| blk.hash.clone())
            .or_else(|| pushed.detached.last().map(|blk| blk.parent.clone()))
            .unwrap_or(from_block);

        Ok(GameSendUpdates {
            reqtoken,
            toblock,
            error: None,
            steps: UpdateSteps {
                detach: pushed.detached.len() as u64,
                attach: pushed.attached.len() as u64,
            },
        })
    }

    fn verify_message(
        &self,
        address: String,
        message: String,
        signature: String,
    ) -> Result<VerifyMessageResponse> {
        let signature = BASE64
            .decode(&signature)
            .map_err(|err| jsonrpc_core::Error::invalid_params(format!("invalid base64: {err}")))?;

        let recovered = self
            .base
            .verify_message(&message, &signature)
            .map_internal_error()?;

        if address.is_empty() {
            return Ok(match recovered {
                Some(addr) => VerifyMessageResponse::Recovery {
                    valid: true,
                    address: Some(addr),
                },
                None => VerifyMessageResponse::Recovery {
                    valid: false,
                    address: None,
                },
            });
        }

        Ok(VerifyMessageResponse::Valid(
            recovered.as_deref() == Some(address.as_str()),
        ))
    }

    fn get_raw_mempool(&self) -> Result<Vec<String>> {
        self.base.get_mempool().map_internal_error()
    }

    fn stop(&self) -> Result<String> {
        info!("shutdown requested via RPC");
        (self.stop)();
        Ok("Xaya X stopping".to_string())
    }
}

#[cfg(test)]
mod tests;
