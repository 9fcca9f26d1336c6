//! The bound PUB socket and its message building.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use metrics::counter;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use xayax_chain::{BlockData, MoveData};

use crate::per_tx::{object_metadata, PerTxData};

/// High-water mark used for sending.
const SEND_HWM: i32 = 1_000;

/// Topic prefix for block-attach messages.
const PREFIX_ATTACH: &str = "game-block-attach";
/// Topic prefix for block-detach messages.
const PREFIX_DETACH: &str = "game-block-detach";
/// Topic prefix for pending-move messages.
const PREFIX_PENDING: &str = "game-pending-move";

/// Errors while publishing notifications.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The ZMQ send itself failed.
    #[error("ZMQ send failed")]
    Zmq(#[from] zmq::Error),

    /// A block or move carries metadata that is neither an object nor null.
    #[error("invalid metadata from the base chain: {0}")]
    BadMetadata(Value),
}

/// ZMQ publisher pushing block and move data for all tracked games.
///
/// The instance owns the process-wide sequence counters and the
/// tracked-games multiset; both live and die with the publisher.  All
/// sends are serialised through an internal mutex so that the three-frame
/// message is atomic and counters stay correct under concurrency.
pub struct ZmqPub {
    inner: Mutex<Inner>,
}

struct Inner {
    sock: zmq::Socket,

    /// Next sequence number per topic string.
    next_seq: HashMap<String, u32>,

    /// Currently tracked games, each with its tracking depth.  Tracking
    /// increments the depth and untracking decrements it; the game stops
    /// being tracked only at depth zero.  This keeps multiple GSPs for the
    /// same game sharing one instance working.
    games: BTreeMap<String, u64>,
}

impl ZmqPub {
    /// Creates the publisher, binding to the given address.
    pub fn bind(addr: &str) -> Result<Self, PublishError> {
        info!(addr, "binding ZMQ publisher");

        let ctx = zmq::Context::new();
        let sock = ctx.socket(zmq::PUB)?;
        sock.set_sndhwm(SEND_HWM)?;
        sock.set_tcp_keepalive(1)?;
        // Do not wait for queued messages when shutting down.
        sock.set_linger(0)?;
        sock.bind(addr)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                sock,
                next_seq: HashMap::new(),
                games: BTreeMap::new(),
            }),
        })
    }

    /// Returns the endpoint the socket is actually bound to.  This differs
    /// from the configured address when binding to a wildcard port.
    pub fn endpoint(&self) -> Result<String, PublishError> {
        let inner = self.lock();
        let endpoint = inner
            .sock
            .get_last_endpoint()?
            .unwrap_or_else(|_| String::new());
        Ok(endpoint)
    }

    /// Adds a game to the set of tracked games (incrementing its depth).
    pub fn track_game(&self, game: &str) {
        info!(game, "tracking game");
        *self.lock().games.entry(game.to_string()).or_insert(0) += 1;
    }

    /// Removes one tracking of the given game (decrementing its depth).
    pub fn untrack_game(&self, game: &str) {
        info!(game, "untracking game");
        let mut inner = self.lock();
        match inner.games.get_mut(game) {
            Some(depth) if *depth > 1 => *depth -= 1,
            Some(_) => {
                inner.games.remove(game);
            }
            None => warn!(game, "untracking a game that is not tracked"),
        }
    }

    /// Pushes notifications for all tracked games about the given block
    /// being attached.  If a request token is given, it is stamped into
    /// every notification.
    pub fn send_block_attach(
        &self,
        blk: &BlockData,
        reqtoken: Option<&str>,
    ) -> Result<(), PublishError> {
        debug!(hash = %blk.hash, "block attach");
        self.send_block(PREFIX_ATTACH, blk, reqtoken)
    }

    /// Pushes notifications for all tracked games about the given block
    /// being detached.
    pub fn send_block_detach(
        &self,
        blk: &BlockData,
        reqtoken: Option<&str>,
    ) -> Result<(), PublishError> {
        debug!(hash = %blk.hash, "block detach");
        self.send_block(PREFIX_DETACH, blk, reqtoken)
    }

    /// Pushes notifications for all tracked games about the moves created
    /// by one pending transaction.  All moves must share the same txid.
    /// One message is sent per game that has at least one entry.
    pub fn send_pending_moves(&self, moves: &[MoveData]) -> Result<(), PublishError> {
        let mut per_game: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        {
            let inner = self.lock();
            for mv in moves {
                let data = PerTxData::new(mv)?;
                for (game, entry) in data.moves_per_game() {
                    if inner.games.contains_key(game) {
                        per_game.entry(game.clone()).or_default().push(entry.clone());
                    }
                }
            }
        }

        let mut inner = self.lock();
        for (game, entries) in per_game {
            let topic = format!("{PREFIX_PENDING} json {game}");
            inner.send_message(&topic, &Value::Array(entries))?;
        }

        Ok(())
    }

    /// Builds and sends the notifications of one block attach or detach
    /// for every tracked game.
    fn send_block(
        &self,
        prefix: &str,
        blk: &BlockData,
        reqtoken: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut inner = self.lock();

        let mut block_json = object_metadata(&blk.metadata)?;
        block_json.insert("hash".to_string(), Value::String(blk.hash.clone()));
        block_json.insert("parent".to_string(), Value::String(blk.parent.clone()));
        block_json.insert("height".to_string(), blk.height.into());
        block_json.insert("rngseed".to_string(), Value::String(blk.rngseed.clone()));

        let mut template = Map::new();
        template.insert("block".to_string(), Value::Object(block_json));
        if let Some(token) = reqtoken {
            template.insert("reqtoken".to_string(), Value::String(token.to_string()));
        }

        // Every tracked game gets a notification, with empty arrays if the
        // block contains nothing for it.
        let mut per_game_moves: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut per_game_admin: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for game in inner.games.keys() {
            per_game_moves.insert(game.clone(), Vec::new());
            per_game_admin.insert(game.clone(), Vec::new());
        }

        for mv in &blk.moves {
            let data = PerTxData::new(mv)?;

            for (game, entry) in data.moves_per_game() {
                if let Some(moves) = per_game_moves.get_mut(game) {
                    moves.push(entry.clone());
                }
            }

            if let Some((game, cmd)) = data.admin_command() {
                if let Some(admin) = per_game_admin.get_mut(game) {
                    admin.push(cmd.clone());
                }
            }
        }

        for (game, moves) in per_game_moves {
            let admin = per_game_admin
                .remove(&game)
                .expect("both per-game maps hold the same games");

            let mut payload = template.clone();
            payload.insert("moves".to_string(), Value::Array(moves));
            payload.insert("admin".to_string(), Value::Array(admin));

            let topic = format!("{prefix} json {game}");
            inner.send_message(&topic, &Value::Object(payload))?;
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("ZMQ publisher lock poisoned")
    }
}

impl Inner {
    /// Sends one three-frame message: topic, compact JSON payload, and the
    /// topic's sequence number as four little-endian bytes.  The counter
    /// is only advanced after the full message went out.
    fn send_message(&mut self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        let seq = self.next_seq.get(topic).copied().unwrap_or(0);
        let data = payload.to_string();

        self.sock.send(topic.as_bytes(), zmq::SNDMORE)?;
        // Once the first frame went out, ZMQ guarantees delivery of the
        // remaining frames of the multipart message.
        self.sock.send(data.as_bytes(), zmq::SNDMORE)?;
        self.sock.send(&seq.to_le_bytes()[..], 0)?;

        self.next_seq.insert(topic.to_string(), seq.wrapping_add(1));
        counter!("zmq_messages_sent").increment(1);

        Ok(())
    }
}
