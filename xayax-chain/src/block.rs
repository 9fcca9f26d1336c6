use serde::{Deserialize, Serialize};

use crate::{serialization::SerializationError, MoveData};

/// Data about one block of the connected base chain.
///
/// This is a plain container, used to pass blocks from the connector to the
/// chain state and from the chain state to the notification interfaces when
/// reorgs happen.  Hashes are opaque strings in whatever encoding the
/// connected chain uses; `parent` is empty only for the very first block
/// ever imported.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    /// The block's hash.
    pub hash: String,

    /// The hash of the block's parent.
    pub parent: String,

    /// The block's height relative to the chain's genesis.
    pub height: u64,

    /// RNG seed for this block as a hex string.  Connectors for chains
    /// without a native seed may set this to the block hash.
    #[serde(default)]
    pub rngseed: String,

    /// Extra per-block data (timestamp, mediantime, ...) that is stored and
    /// forwarded to GSPs unparsed.  Must be a JSON object or null.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// All moves inside this block, in the order the base chain defines.
    #[serde(default)]
    pub moves: Vec<MoveData>,
}

impl BlockData {
    /// Encodes the block into the self-describing envelope used for
    /// persistent storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("block envelope serialisation is infallible")
    }

    /// Decodes a block from its stored envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
