use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single name update (UTXO chains) or contract log event (EVM chains)
/// that game-state processors may care about.
///
/// Moves are constructed by a base-chain connector from raw upstream data,
/// stored as part of their containing [`BlockData`](crate::BlockData), and
/// read-only afterwards.  The `mv` payload is carried as an unparsed JSON
/// string: it is user-controlled input and only parsed (strictly) when
/// per-game notifications are built.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveData {
    /// The move's transaction id, unique per the connected chain's
    /// convention.  Every move must have one, as it is what downstream
    /// pending-move tracking keys on.
    pub txid: String,

    /// Namespace of the name being updated, e.g. `p` for player moves
    /// and `g` for admin commands.
    pub ns: String,

    /// The name (without namespace) being updated.
    pub name: String,

    /// The raw move payload as an unparsed JSON string.
    pub mv: String,

    /// Coins burnt in this move, keyed by the game id the burn commits to.
    /// Values are numeric JSON; the publisher picks the right entry for the
    /// game it is notifying about.
    #[serde(default)]
    pub burns: BTreeMap<String, serde_json::Value>,

    /// Chain-specific extra data (input refs, output breakdown, EVM move
    /// id, ...) that is stored and forwarded to GSPs without being
    /// interpreted here.  Must be a JSON object or null.
    #[serde(default)]
    pub metadata: serde_json::Value,
}
