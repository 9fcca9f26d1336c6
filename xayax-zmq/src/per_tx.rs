//! Extraction of per-game notification data from a single move.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use xayax_chain::MoveData;

use crate::{json::parse_move_json, PublishError};

/// The notification-relevant data of one transaction's move, already split
/// up by game.
///
/// An invalid move (bad JSON, wrong shape) simply yields no entries; the
/// containing block is not affected.
pub struct PerTxData {
    /// Full move JSON (txid, name, move, burnt, metadata flattened) per
    /// game id touched by this transaction.
    moves: BTreeMap<String, Value>,

    /// If this is an admin command: the targeted game id and the full
    /// command JSON.
    admin: Option<(String, Value)>,
}

impl PerTxData {
    /// Analyses a single move.
    pub fn new(mv: &MoveData) -> Result<Self, PublishError> {
        let mut res = Self {
            moves: BTreeMap::new(),
            admin: None,
        };

        let Some(value) = parse_move_json(&mv.mv) else {
            return Ok(res);
        };

        // The template every emitted entry starts from: the move metadata
        // flattened in, plus the txid.
        let mut template = object_metadata(&mv.metadata)?;
        template.insert("txid".to_string(), Value::String(mv.txid.clone()));

        if mv.ns == "g" {
            if let Some(cmd) = value.get("cmd") {
                let mut admin = template;
                admin.insert("cmd".to_string(), cmd.clone());
                add_burn_data(mv, &mv.name, &mut admin);
                res.admin = Some((mv.name.clone(), Value::Object(admin)));
            }
            return Ok(res);
        }

        if mv.ns != "p" {
            return Ok(res);
        }
        let Some(games) = value.get("g").and_then(Value::as_object) else {
            return Ok(res);
        };

        template.insert("name".to_string(), Value::String(mv.name.clone()));
        for (game_id, game_move) in games {
            let mut entry = template.clone();
            entry.insert("move".to_string(), game_move.clone());
            add_burn_data(mv, game_id, &mut entry);
            res.moves.insert(game_id.clone(), Value::Object(entry));
        }

        Ok(res)
    }

    /// The per-game move entries of this transaction.
    pub fn moves_per_game(&self) -> &BTreeMap<String, Value> {
        &self.moves
    }

    /// The admin command of this transaction, if any.
    pub fn admin_command(&self) -> Option<(&str, &Value)> {
        self.admin.as_ref().map(|(game, cmd)| (game.as_str(), cmd))
    }
}

/// Interprets the metadata of a block or move as a JSON object template.
/// Null becomes an empty object; anything else than an object means the
/// connector handed us garbage.
pub fn object_metadata(metadata: &Value) -> Result<Map<String, Value>, PublishError> {
    match metadata {
        Value::Null => Ok(Map::new()),
        Value::Object(obj) => Ok(obj.clone()),
        _ => Err(PublishError::BadMetadata(metadata.clone())),
    }
}

/// Sets the `burnt` field for the given game, defaulting to zero if the
/// move burns nothing for it.
fn add_burn_data(mv: &MoveData, game_id: &str, entry: &mut Map<String, Value>) {
    let burnt = mv.burns.get(game_id).cloned().unwrap_or_else(|| 0.into());
    entry.insert("burnt".to_string(), burnt);
}
