//! The block-tree store itself.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use xayax_chain::BlockData;

use crate::{Result, StateError};

/// Schema for the chain-state database.
///
/// Each block row carries a branch label: zero for the current main chain,
/// a larger integer for side branches.  With the unique index on
/// `(branch, height)` the common reorg operations (mark the old chain
/// beyond a fork point as a branch, find the fork point for a given block)
/// are simple queries.  The block itself, including all contained moves, is
/// stored as a self-describing envelope in the `data` blob.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS `blocks` (
        `hash` TEXT NOT NULL PRIMARY KEY,
        `parent` TEXT NOT NULL,
        `height` INTEGER NOT NULL,
        `branch` INTEGER NOT NULL,
        `data` BLOB NOT NULL,
        UNIQUE (`branch`, `height`)
    );

    CREATE TABLE IF NOT EXISTS `variables` (
        `name` TEXT NOT NULL PRIMARY KEY,
        `value` TEXT NOT NULL
    );
";

/// Storage for the known state of the underlying blockchain, as a tree of
/// blocks with a distinguished main chain.
///
/// Blocks on the main chain that are far enough behind the tip can be
/// pruned, which removes all record of them; the base chain is queried for
/// them again if ever needed.  Blocks on side branches are kept until their
/// branch is reorged back onto the main chain and pruned in turn, as GSPs
/// need their move data for detaching.
///
/// Not internally synchronised; callers hold the outer chain mutex.
pub struct Chainstate {
    db: Connection,

    /// Nesting depth of active savepoint batches, used to name savepoints.
    batch_depth: usize,
}

impl Chainstate {
    /// Opens the chain state in the given SQLite file, creating the file
    /// and the schema as needed.
    pub fn open(file: &Path) -> Result<Self> {
        let db = Connection::open(file)?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db, batch_depth: 0 })
    }

    /// Opens a fresh in-memory chain state, mainly for testing.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db, batch_depth: 0 })
    }

    /// Records the chain id this state belongs to.  The first call stores
    /// the value; later calls verify it, and a mismatch is returned as
    /// [`StateError::ChainMismatch`] since it means the store would mix
    /// data from two different networks.
    pub fn set_chain(&mut self, chain: &str) -> Result<()> {
        let stored: Option<String> = self
            .db
            .prepare_cached("SELECT `value` FROM `variables` WHERE `name` = 'chain'")?
            .query_row([], |row| row.get(0))
            .optional()?;

        match stored {
            None => {
                info!(chain, "initialising chain state");
                self.db
                    .prepare_cached("INSERT INTO `variables` (`name`, `value`) VALUES ('chain', ?1)")?
                    .execute(params![chain])?;
                Ok(())
            }
            Some(stored) if stored == chain => Ok(()),
            Some(stored) => Err(StateError::ChainMismatch {
                stored,
                actual: chain.to_string(),
            }),
        }
    }

    /// Returns the height of the current main-chain tip, or `None` if no
    /// block has been imported yet.
    pub fn get_tip_height(&self) -> Result<Option<u64>> {
        Ok(self
            .db
            .prepare_cached(
                "SELECT `height` FROM `blocks` WHERE `branch` = 0 ORDER BY `height` DESC LIMIT 1",
            )?
            .query_row([], |row| row.get(0))
            .optional()?)
    }

    /// Returns the lowest main-chain height we still have block data for,
    /// i.e. the lowest block not yet pruned.  This bounds how far back any
    /// reorg can go.
    pub fn get_lowest_unpruned_height(&self) -> Result<Option<u64>> {
        Ok(self
            .db
            .prepare_cached("SELECT MIN(`height`) FROM `blocks` WHERE `branch` = 0")?
            .query_row([], |row| row.get(0))
            .optional()?
            .flatten())
    }

    /// Returns the main-chain block hash at the given height, if known.
    pub fn get_hash_for_height(&self, height: u64) -> Result<Option<String>> {
        Ok(self
            .db
            .prepare_cached("SELECT `hash` FROM `blocks` WHERE `branch` = 0 AND `height` = ?1")?
            .query_row(params![height], |row| row.get(0))
            .optional()?)
    }

    /// Returns the height of the block with the given hash, if known
    /// (on any branch).
    pub fn get_height_for_hash(&self, hash: &str) -> Result<Option<u64>> {
        Ok(self
            .db
            .prepare_cached("SELECT `height` FROM `blocks` WHERE `hash` = ?1")?
            .query_row(params![hash], |row| row.get(0))
            .optional()?)
    }

    /// Imports the given block as the new main-chain tip without requiring
    /// its parent to be present.
    ///
    /// This is used for the very first initialisation and for fast
    /// catch-up resyncs; the current tip (if any) must be an ancestor of
    /// the imported block, although that cannot be verified locally.  All
    /// main-chain blocks strictly below the imported one are pruned, so
    /// that afterwards both the tip height and the lowest unpruned height
    /// equal the imported block's height.
    pub fn import_tip(&mut self, blk: &BlockData) -> Result<()> {
        info!(hash = %blk.hash, height = blk.height, "importing new tip into the chain state");

        self.with_batch(|state| {
            match state.block_row(&blk.hash)? {
                Some(row) => {
                    row.check_matches(blk)?;
                    state.mark_as_tip(blk)?;
                }
                None => {
                    // If main-chain blocks at or above the imported height
                    // exist, they conflict with the new tip and are moved
                    // onto a branch before the insert.
                    let conflicting: u64 = state
                        .db
                        .prepare_cached(
                            "SELECT COUNT(*) FROM `blocks` WHERE `branch` = 0 AND `height` >= ?1",
                        )?
                        .query_row(params![blk.height], |row| row.get(0))?;
                    if conflicting > 0 {
                        let fresh = state.free_branch_number()?;
                        state
                            .db
                            .prepare_cached(
                                "UPDATE `blocks` SET `branch` = ?1
                                    WHERE `branch` = 0 AND `height` >= ?2",
                            )?
                            .execute(params![fresh, blk.height])?;
                    }
                    state.insert_block(blk, 0)?;
                }
            }

            let pruned = state
                .db
                .prepare_cached("DELETE FROM `blocks` WHERE `branch` = 0 AND `height` < ?1")?
                .execute(params![blk.height])?;
            if pruned > 0 {
                info!(pruned, "removed main-chain blocks below the imported tip");
            }

            Ok(())
        })
    }

    /// Attaches a block as the new best tip and returns the previous tip's
    /// hash.
    ///
    /// Returns `Ok(None)` without side effects when the block cannot be
    /// attached, i.e. the store is empty or the parent block is unknown.
    /// If the block is already present (on any branch), it is relabelled
    /// onto the main chain instead of reinserted; the hash is the primary
    /// identity of a block.
    pub fn set_tip(&mut self, blk: &BlockData) -> Result<Option<String>> {
        let old_tip = match self.main_tip_hash()? {
            Some(hash) => hash,
            None => {
                warn!(hash = %blk.hash, "no blocks in the store, cannot attach new tip");
                return Ok(None);
            }
        };

        if let Some(row) = self.block_row(&blk.hash)? {
            debug!(hash = %blk.hash, "already have the new tip, relabelling");
            row.check_matches(blk)?;
            self.with_batch(|state| state.mark_as_tip(blk))?;
            return Ok(Some(old_tip));
        }

        let parent_height = match self.get_height_for_hash(&blk.parent)? {
            Some(height) => height,
            None => {
                warn!(hash = %blk.hash, parent = %blk.parent,
                      "cannot attach tip, parent block is unknown");
                return Ok(None);
            }
        };
        if blk.height != parent_height + 1 {
            return Err(StateError::Corruption(format!(
                "height mismatch for new block {} at {} with parent {} at {}",
                blk.hash, blk.height, blk.parent, parent_height
            )));
        }

        debug!(hash = %blk.hash, parent = %blk.parent, "attaching block as the new tip");
        self.with_batch(|state| {
            let branch = state.free_branch_number()?;
            state.insert_block(blk, branch)?;
            state.mark_as_tip(blk)
        })?;

        Ok(Some(old_tip))
    }

    /// Determines the branch that connects a given block (by hash) to the
    /// current main chain.
    ///
    /// On success, the returned list holds the blocks that need to be
    /// detached to get from the requested block back to a block whose
    /// parent is on the main chain, the requested block itself first.  If
    /// the requested block is on the main chain, the list is empty.  The
    /// walk also ends cleanly when it falls below the pruning horizon.
    ///
    /// Returns `None` when the block hash is not known at all.
    pub fn get_fork_branch(&self, hash: &str) -> Result<Option<Vec<BlockData>>> {
        let mut branch = Vec::new();
        let mut cur_hash = hash.to_string();

        loop {
            let row = match self.block_row(&cur_hash)? {
                Some(row) => row,
                None if branch.is_empty() => return Ok(None),
                None => {
                    // We fell off the end of a branch.  That is fine if the
                    // missing parent is at or below the pruning horizon;
                    // anything else means the tree is broken.
                    let last: &BlockData = branch.last().expect("branch is non-empty");
                    let lowest = self.get_lowest_unpruned_height()?.unwrap_or(u64::MAX);
                    if last.height <= lowest + 1 {
                        return Ok(Some(branch));
                    }
                    return Err(StateError::Corruption(format!(
                        "parent block {cur_hash} of branch is missing above the pruning horizon"
                    )));
                }
            };

            if row.branch == 0 {
                return Ok(Some(branch));
            }

            // Collect the whole segment of this branch at or below the
            // current block, in decreasing height, then continue the walk
            // from that segment's parent.
            let mut stmt = self.db.prepare_cached(
                "SELECT `data` FROM `blocks`
                    WHERE `branch` = ?1 AND `height` <= ?2
                    ORDER BY `height` DESC",
            )?;
            let segment = stmt
                .query_map(params![row.branch, row.height], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for data in segment {
                branch.push(BlockData::from_bytes(&data)?);
            }

            cur_hash = branch
                .last()
                .expect("branch segment query returned at least the looked-up block")
                .parent
                .clone();
        }
    }

    /// Prunes all main-chain blocks at or below the given height, asserting
    /// that they will never end up on a reorg in the future.  Side-branch
    /// blocks are not touched.  Returns the number of blocks removed.
    pub fn prune(&mut self, until_height: u64) -> Result<usize> {
        let pruned = self.with_batch(|state| {
            Ok(state
                .db
                .prepare_cached("DELETE FROM `blocks` WHERE `branch` = 0 AND `height` <= ?1")?
                .execute(params![until_height])?)
        })?;
        if pruned > 0 {
            info!(pruned, until_height, "pruned main-chain blocks");
        }
        Ok(pruned)
    }

    /// Runs a scoped update batch.
    ///
    /// A savepoint is placed before the closure runs; if the closure
    /// returns an error, everything it wrote is rolled back before the
    /// error propagates.  Batches nest as savepoints, so a failing inner
    /// batch only rolls back its own writes.
    pub fn with_batch<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let name = format!("update_batch_{}", self.batch_depth);
        self.db.execute_batch(&format!("SAVEPOINT `{name}`"))?;
        self.batch_depth += 1;

        let res = f(self);
        self.batch_depth -= 1;

        match res {
            Ok(value) => {
                self.db.execute_batch(&format!("RELEASE `{name}`"))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self
                    .db
                    .execute_batch(&format!("ROLLBACK TO `{name}`; RELEASE `{name}`"))
                {
                    warn!(%rollback, "failed to roll back update batch");
                }
                Err(err)
            }
        }
    }

    /// Verifies the structural invariants of the stored tree: contiguous
    /// branches chaining by hash and parent, branch ends anchored per the
    /// branch rules, and a main branch being present.  Meant for test runs
    /// and explicitly enabled sanity checking; can take a long time.
    pub fn sanity_check(&self) -> Result<()> {
        let num_blocks: u64 = self
            .db
            .prepare_cached("SELECT COUNT(*) FROM `blocks`")?
            .query_row([], |row| row.get(0))?;
        if num_blocks == 0 {
            return Ok(());
        }
        info!(num_blocks, "running chain state sanity check");

        let lowest = self.get_lowest_unpruned_height()?.unwrap_or(u64::MAX);

        let branches: Vec<u64> = self
            .db
            .prepare_cached("SELECT DISTINCT `branch` FROM `blocks`")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut found_main = false;
        for branch in branches {
            if branch == 0 {
                found_main = true;
            }

            let rows: Vec<(String, String, u64)> = self
                .db
                .prepare_cached(
                    "SELECT `hash`, `parent`, `height` FROM `blocks`
                        WHERE `branch` = ?1 ORDER BY `height` DESC",
                )?
                .query_map(params![branch], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<_, _>>()?;

            let mut expected_parent: Option<&str> = None;
            let mut last_height: Option<u64> = None;
            for (hash, parent, height) in &rows {
                if let (Some(exp), Some(last)) = (expected_parent, last_height) {
                    if *height + 1 != last {
                        return Err(StateError::Corruption(format!(
                            "block {hash} on branch {branch} has non-contiguous height {height}"
                        )));
                    }
                    if hash.as_str() != exp {
                        return Err(StateError::Corruption(format!(
                            "block {hash} does not match its successor's parent {exp}"
                        )));
                    }
                }
                expected_parent = Some(parent.as_str());
                last_height = Some(*height);
            }

            let bottom_parent = expected_parent.expect("every branch has at least one block");
            let bottom_height = last_height.expect("every branch has at least one block");
            let anchor = self.block_row(bottom_parent)?;

            if branch == 0 {
                if anchor.is_some() {
                    return Err(StateError::Corruption(format!(
                        "main branch chains to existing block {bottom_parent}"
                    )));
                }
            } else {
                match anchor {
                    Some(row) => {
                        if row.branch == branch {
                            return Err(StateError::Corruption(format!(
                                "end block {bottom_parent} of branch {branch} \
                                 chains back to the same branch"
                            )));
                        }
                        if row.height + 1 != bottom_height {
                            return Err(StateError::Corruption(format!(
                                "height mismatch at end block {bottom_parent} of branch {branch}"
                            )));
                        }
                    }
                    None => {
                        if bottom_height > lowest + 1 {
                            return Err(StateError::Corruption(format!(
                                "branch {branch} chains to missing block {bottom_parent} \
                                 above the pruning horizon"
                            )));
                        }
                    }
                }
            }
        }

        if !found_main {
            return Err(StateError::Corruption("no main branch found".to_string()));
        }

        Ok(())
    }

    /// Returns the hash of the current main-chain tip.
    fn main_tip_hash(&self) -> Result<Option<String>> {
        Ok(self
            .db
            .prepare_cached(
                "SELECT `hash` FROM `blocks` WHERE `branch` = 0 ORDER BY `height` DESC LIMIT 1",
            )?
            .query_row([], |row| row.get(0))
            .optional()?)
    }

    /// Looks up the stored row for a block hash.
    fn block_row(&self, hash: &str) -> Result<Option<BlockRow>> {
        Ok(self
            .db
            .prepare_cached("SELECT `parent`, `height`, `branch` FROM `blocks` WHERE `hash` = ?1")?
            .query_row(params![hash], |row| {
                Ok(BlockRow {
                    hash: hash.to_string(),
                    parent: row.get(0)?,
                    height: row.get(1)?,
                    branch: row.get(2)?,
                })
            })
            .optional()?)
    }

    /// Picks a branch number for a new branch.  Numbers are never reused;
    /// the count of numbers ever handed out is bounded by the number of
    /// reorgs observed, not by the current width of the tree.
    fn free_branch_number(&self) -> Result<u64> {
        let highest: u64 = self
            .db
            .prepare_cached("SELECT COALESCE(MAX(`branch`), 0) FROM `blocks`")?
            .query_row([], |row| row.get(0))?;
        Ok(highest + 1)
    }

    /// Inserts a block with the given branch label.
    fn insert_block(&mut self, blk: &BlockData, branch: u64) -> Result<()> {
        self.db
            .prepare_cached(
                "INSERT INTO `blocks` (`hash`, `parent`, `height`, `branch`, `data`)
                    VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![blk.hash, blk.parent, blk.height, branch, blk.to_bytes()])?;
        Ok(())
    }

    /// Relabels branches so that the given, already stored block becomes
    /// the main-chain tip.
    fn mark_as_tip(&mut self, blk: &BlockData) -> Result<()> {
        let row = self.block_row(&blk.hash)?.ok_or_else(|| {
            StateError::Corruption(format!("block {} does not exist yet", blk.hash))
        })?;

        if row.branch == 0 {
            // The new tip is already on the main chain.  Everything above
            // it moves onto a branch, at least until more blocks get set as
            // tip again.
            let fresh = self.free_branch_number()?;
            self.db
                .prepare_cached(
                    "UPDATE `blocks` SET `branch` = ?1 WHERE `branch` = 0 AND `height` > ?2",
                )?
                .execute(params![fresh, blk.height])?;
            return Ok(());
        }

        // The new tip is on a branch.  Walk it back to the fork point, move
        // the segment of the old main chain beyond the fork point onto a
        // new branch, and promote the walked branch to the main chain.
        let fork_branch = self
            .get_fork_branch(&blk.hash)?
            .ok_or_else(|| {
                StateError::Corruption(format!("failed to get fork branch for new tip {}", blk.hash))
            })?;
        let fork_height = fork_branch
            .last()
            .expect("fork branch of a side-branch block is non-empty")
            .height;

        let fresh = self.free_branch_number()?;
        self.db
            .prepare_cached(
                "UPDATE `blocks` SET `branch` = ?1 WHERE `branch` = 0 AND `height` >= ?2",
            )?
            .execute(params![fresh, fork_height])?;

        for detached in &fork_branch {
            self.db
                .prepare_cached("UPDATE `blocks` SET `branch` = 0 WHERE `hash` = ?1")?
                .execute(params![detached.hash])?;
        }

        Ok(())
    }
}

/// The indexed columns of one stored block.
struct BlockRow {
    hash: String,
    parent: String,
    height: u64,
    branch: u64,
}

impl BlockRow {
    /// Checks that a block passed in by the caller matches this stored row.
    fn check_matches(&self, blk: &BlockData) -> Result<()> {
        if self.parent != blk.parent || self.height != blk.height {
            return Err(StateError::Corruption(format!(
                "block {} does not match its stored parent/height",
                self.hash
            )));
        }
        Ok(())
    }
}
