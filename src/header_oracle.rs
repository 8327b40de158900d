/// Header oracle
///
/// Maintains the canonical best chain by cumulative work in the presence
/// of out-of-order arrivals, competing branches, reorgs, and
/// administrator-supplied checkpoints.
///
/// Acceptance builds candidate chain segments for each incoming header,
/// reconnects any disconnected descendants (the tree of disconnected
/// blocks becomes a table of candidates), then picks the winner by
/// cumulative work. On equal work the current tip wins. All changes for
/// one call land in a single atomic update.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::chainwork::check_proof_of_work;
use crate::constants::genesis_hash;
use crate::header_db::{HeaderDb, OracleError};
use crate::header_update::UpdateTransaction;
use crate::telemetry::ProgressSampler;
use crate::types::{
    now_seconds, BlockHash, BlockHeader, ChainKind, Height, HeaderStatus, Position,
};

/// Headers may not claim a timestamp this far past the node clock
const MAX_FUTURE_DRIFT_SECONDS: i64 = 2 * 3600;

/// Cap on best-chain hashes returned for locator construction
const RECENT_HASH_LIMIT: usize = 100;

/// One progress line per this many accepted headers
const ACCEPT_LOG_INTERVAL: u64 = 10_000;

/// Result of a batch acceptance: consensus-invalid headers are skipped,
/// the rest of the batch still commits
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AddOutcome {
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Clone, Debug)]
struct Candidate {
    blacklisted: bool,
    /// Positions from the divergence point up to the tip, ascending
    chain: Vec<Position>,
}

pub struct HeaderOracle {
    db: Arc<HeaderDb>,
    lock: Mutex<()>,
    progress: ProgressSampler,
}

impl HeaderOracle {
    pub fn new(db: Arc<HeaderDb>) -> HeaderOracle {
        HeaderOracle {
            db,
            lock: Mutex::new(()),
            progress: ProgressSampler::new(ACCEPT_LOG_INTERVAL),
        }
    }

    pub fn chain(&self) -> ChainKind {
        self.db.chain()
    }

    pub fn genesis_block_hash(&self) -> BlockHash {
        genesis_hash(self.db.chain())
    }

    pub fn best_chain(&self) -> Position {
        self.db.best()
    }

    pub fn best_hash(&self, height: Height) -> Result<Option<BlockHash>, OracleError> {
        self.db.best_block(height)
    }

    pub fn load_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>, OracleError> {
        self.db.try_load_header(hash)
    }

    pub fn siblings(&self) -> Result<HashSet<BlockHash>, OracleError> {
        self.db.siblings()
    }

    pub fn get_checkpoint(&self) -> Result<Position, OracleError> {
        self.db.checkpoint()
    }

    /// Best-chain hashes, newest first, for locator construction
    pub fn recent_hashes(&self) -> Result<Vec<BlockHash>, OracleError> {
        self.db.recent_hashes(RECENT_HASH_LIMIT)
    }

    pub fn is_in_best_chain(&self, hash: &BlockHash) -> Result<bool, OracleError> {
        let header = match self.db.try_load_header(hash)? {
            Some(header) => header,
            None => return Ok(false),
        };
        Ok(self.db.best_block(header.height)? == Some(*hash))
    }

    /// Deepest position shared between the given position's chain and the
    /// best chain, along with the current best tip
    pub fn common_parent(
        &self,
        position: &Position,
    ) -> Result<(Position, Position), OracleError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut output = (
            Position::new(0, genesis_hash(self.db.chain())),
            self.db.best(),
        );

        let mut test = *position;
        let mut header = match self.db.try_load_header(&test.hash)? {
            Some(header) => header,
            None => return Ok(output),
        };

        while test.height > 0 {
            if self.db.best_block(header.height)? == Some(test.hash) {
                output.0 = test;
                return Ok(output);
            }
            match self.db.try_load_header(&header.prev)? {
                Some(parent) => {
                    test = parent.position();
                    header = parent;
                }
                None => return Ok(output),
            }
        }

        Ok(output)
    }

    /// Accept one header; consensus-invalid input is an error here
    pub fn add_header(&self, header: BlockHeader) -> Result<(), OracleError> {
        self.validate(&header)?;
        let outcome = self.add_headers(vec![header])?;
        debug_assert_eq!(outcome.rejected, 0);
        Ok(())
    }

    /// Parse and accept wire-format headers; unparseable entries count as
    /// rejected
    pub fn add_wire_headers(&self, raw: &[Vec<u8>]) -> Result<AddOutcome, OracleError> {
        let mut parsed = Vec::with_capacity(raw.len());
        let mut malformed = 0usize;
        for bytes in raw {
            match BlockHeader::from_wire(bytes) {
                Some(header) => parsed.push(header),
                None => malformed += 1,
            }
        }
        let mut outcome = self.add_headers(parsed)?;
        outcome.rejected += malformed;
        Ok(outcome)
    }

    /// Accept a batch. Invalid headers are rejected and skipped; the
    /// remaining headers commit atomically. An empty batch succeeds and
    /// changes nothing.
    pub fn add_headers(&self, batch: Vec<BlockHeader>) -> Result<AddOutcome, OracleError> {
        let mut outcome = AddOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut update = UpdateTransaction::new(&self.db);

        for header in batch {
            if let Err(e) = self.validate(&header) {
                warn!(chain = %self.db.chain(), header = %header.hash.short(), error = %e, "rejecting header");
                outcome.rejected += 1;
                continue;
            }
            self.accept(&mut update, header)?;
            outcome.accepted += 1;
            if self.progress.tick() {
                debug!(
                    chain = %self.db.chain(),
                    total = self.progress.seen(),
                    "header acceptance progress"
                );
            }
        }

        self.db.apply_update(update)?;
        Ok(outcome)
    }

    /// Pin the chain to a required hash at a height. Refuses when a
    /// checkpoint already exists or the position is too low.
    pub fn add_checkpoint(
        &self,
        height: Height,
        required_hash: BlockHash,
    ) -> Result<bool, OracleError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut update = UpdateTransaction::new(&self.db);

        if update.effective_checkpoint_exists()? {
            warn!(chain = %self.db.chain(), "checkpoint already exists");
            return Ok(false);
        }
        if height < 2 {
            warn!(chain = %self.db.chain(), height, "invalid checkpoint position");
            return Ok(false);
        }

        update.set_checkpoint(Position::new(height, required_hash));
        self.apply_checkpoint(&mut update, height)?;
        self.db.apply_update(update)?;
        Ok(true)
    }

    /// Clear the checkpoint and re-examine previously banned chains
    pub fn delete_checkpoint(&self) -> Result<bool, OracleError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut update = UpdateTransaction::new(&self.db);

        if !update.effective_checkpoint_exists()? {
            warn!(chain = %self.db.chain(), "no checkpoint to delete");
            return Ok(false);
        }

        let height = update.checkpoint()?.height;
        update.clear_checkpoint();
        self.apply_checkpoint(&mut update, height)?;
        self.db.apply_update(update)?;
        Ok(true)
    }

    fn validate(&self, header: &BlockHeader) -> Result<(), OracleError> {
        if header.prev == header.hash {
            return Err(OracleError::InvalidHeader(
                "header is its own parent".to_string(),
            ));
        }
        if !check_proof_of_work(header.hash.as_bytes(), header.n_bits) {
            return Err(OracleError::InvalidHeader(
                "hash does not satisfy target".to_string(),
            ));
        }
        if i64::from(header.timestamp) > now_seconds() + MAX_FUTURE_DRIFT_SECONDS {
            return Err(OracleError::InvalidHeader(
                "timestamp too far in the future".to_string(),
            ));
        }
        Ok(())
    }

    fn accept(
        &self,
        update: &mut UpdateTransaction<'_>,
        header: BlockHeader,
    ) -> Result<(), OracleError> {
        let hash = header.hash;
        if update.effective_header_exists(&hash)? {
            debug!(header = %hash.short(), "header already processed");
            return Ok(());
        }

        let current_pos = update.effective_best_position();
        let current = update.stage(&current_pos.hash)?;
        let parent_hash = header.prev;
        update.stage_new(header);

        let parent = match update.try_stage(&parent_hash)? {
            Some(parent) if !parent.is_disconnected() => parent,
            _ => {
                debug!(header = %hash.short(), "adding disconnected header");
                update.modify_header(&hash, |h| h.status = HeaderStatus::Disconnected)?;
                let staged = update.staged_header(&hash)?.clone();
                update.disconnect_block(&staged)?;
                return Ok(());
            }
        };

        if update.effective_is_sibling(&parent_hash)? {
            update.remove_sibling(&parent_hash);
        }

        let mut candidates = Vec::new();
        let idx = self.initialize_candidate(update, &mut candidates, &parent.hash, &hash, None)?;
        self.connect_children(update, hash, &mut candidates, idx)?;
        self.choose_candidate(update, &current, &current, &candidates)?;
        Ok(())
    }

    /// Inherit position/work/state from the parent and classify against
    /// the active checkpoint. Returns whether the child is banned.
    fn connect_to_parent(
        &self,
        update: &mut UpdateTransaction<'_>,
        parent_hash: &BlockHash,
        child_hash: &BlockHash,
    ) -> Result<bool, OracleError> {
        let parent = update.stage(parent_hash)?;
        let checkpoint = update.checkpoint()?;
        update.modify_header(child_hash, |child| {
            child.clear_checkpoint_state();
            child.inherit(&parent);
            child.compare_to_checkpoint(&checkpoint);
        })?;
        Ok(update.staged_header(child_hash)?.is_banned())
    }

    /// Build the candidate segment ending at `child_hash` by walking
    /// ancestors until the best chain (or `stop_hash`) is reached.
    fn initialize_candidate(
        &self,
        update: &mut UpdateTransaction<'_>,
        candidates: &mut Vec<Candidate>,
        parent_hash: &BlockHash,
        child_hash: &BlockHash,
        stop_hash: Option<&BlockHash>,
    ) -> Result<usize, OracleError> {
        let blacklisted = self.connect_to_parent(update, parent_hash, child_hash)?;

        let mut chain: Vec<Position> = Vec::new();
        let mut ancestor_hash = *parent_hash;
        let mut position = update.stage(&ancestor_hash)?.position();

        loop {
            let keep_walking = match stop_hash {
                Some(stop) => *stop != position.hash,
                None => match update.effective_best_block(position.height) {
                    Ok(best) => best != position.hash,
                    Err(OracleError::Missing(_)) => true,
                    Err(e) => return Err(e),
                },
            };
            if !keep_walking {
                break;
            }
            if position.height <= 0 {
                return Err(OracleError::Missing(
                    "candidate walk passed genesis".to_string(),
                ));
            }

            chain.insert(0, position);
            ancestor_hash = update.stage(&ancestor_hash)?.prev;
            position = update.stage(&ancestor_hash)?.position();
        }

        if chain.is_empty() {
            chain.push(position);
        }

        candidates.push(Candidate { blacklisted, chain });
        Ok(candidates.len() - 1)
    }

    /// Append the new header to its candidate and reconnect any
    /// disconnected descendants. Each distinct path through the
    /// disconnected tree becomes its own candidate.
    fn connect_children(
        &self,
        update: &mut UpdateTransaction<'_>,
        root_hash: BlockHash,
        candidates: &mut Vec<Candidate>,
        root_idx: usize,
    ) -> Result<(), OracleError> {
        let mut stack: Vec<(BlockHash, usize)> = vec![(root_hash, root_idx)];

        while let Some((parent_hash, idx)) = stack.pop() {
            let parent_pos = update.staged_header(&parent_hash)?.position();
            {
                let candidate = &mut candidates[idx];
                if let Some(end) = candidate.chain.last() {
                    debug_assert_eq!(end.height + 1, parent_pos.height);
                }
                candidate.chain.push(parent_pos);
            }

            let children = update.effective_disconnected_children(&parent_hash)?;
            if children.is_empty() {
                continue;
            }

            let original = candidates[idx].clone();
            let mut first_child = true;
            for child_hash in children {
                update.connect_block(parent_hash, child_hash)?;
                update.stage(&child_hash)?;
                let banned = self.connect_to_parent(update, &parent_hash, &child_hash)?;

                // The first child extends the current candidate;
                // subsequent children fork a new one from the snapshot
                let target = if first_child {
                    first_child = false;
                    idx
                } else {
                    candidates.push(original.clone());
                    candidates.len() - 1
                };
                candidates[target].blacklisted = candidates[target].blacklisted || banned;
                stack.push((child_hash, target));
            }
        }

        Ok(())
    }

    /// Pick the winner among the current tip and every candidate tip.
    /// `baseline` sets the work floor a candidate must beat strictly;
    /// `current_tip` is the chain the reorg (if any) retires.
    fn choose_candidate(
        &self,
        update: &mut UpdateTransaction<'_>,
        baseline: &BlockHeader,
        current_tip: &BlockHeader,
        candidates: &[Candidate],
    ) -> Result<bool, OracleError> {
        let mut best_hash = baseline.hash;
        let mut best_work = baseline.work;

        for candidate in candidates.iter().filter(|c| !c.blacklisted) {
            let tip_pos = candidate
                .chain
                .last()
                .ok_or_else(|| OracleError::Missing("empty candidate".to_string()))?;
            let tip = update.staged_header(&tip_pos.hash)?;
            if tip.work > best_work {
                best_work = tip.work;
                best_hash = tip_pos.hash;
            }
        }

        let mut found = false;
        for candidate in candidates {
            let tip_pos = *candidate
                .chain
                .last()
                .ok_or_else(|| OracleError::Missing("empty candidate".to_string()))?;

            if tip_pos.hash == best_hash {
                found = true;
                // A checkpoint change can promote a former sibling tip
                update.remove_sibling(&tip_pos.hash);
                let mut reorg = false;
                for segment in &candidate.chain {
                    if segment.height <= current_tip.height && !reorg {
                        let on_best = update
                            .effective_best_block(segment.height)
                            .map(|hash| hash == segment.hash)
                            .unwrap_or(false);
                        if on_best {
                            continue;
                        }
                        reorg = true;
                        let ancestor = Position::new(
                            segment.height - 1,
                            update.effective_best_block(segment.height - 1)?,
                        );
                        update.set_reorg_parent(ancestor);
                        update.add_to_best_chain(*segment);
                        update.add_sibling(current_tip.position());
                    } else {
                        update.add_to_best_chain(*segment);
                    }
                }
            } else if tip_pos.hash != current_tip.hash {
                update.add_sibling(tip_pos);
            }
        }

        Ok(found)
    }

    /// Re-evaluate the chain under a changed checkpoint: re-walk the
    /// current best chain and every sibling chain from the block below
    /// the checkpoint, then choose a winner that the checkpoint permits.
    fn apply_checkpoint(
        &self,
        update: &mut UpdateTransaction<'_>,
        height: Height,
    ) -> Result<(), OracleError> {
        let best = update.stage_best()?;
        if height > best.height {
            return Ok(());
        }

        let ancestor = update.stage_height(height - 1)?;
        let mut candidates = Vec::new();

        self.stage_candidate(update, &ancestor, &mut candidates, best.clone())?;
        for hash in update.effective_sibling_hashes()? {
            let child = update.stage(&hash)?;
            self.stage_candidate(update, &ancestor, &mut candidates, child)?;
        }

        for idx in 0..candidates.len() {
            let chain = candidates[idx].chain.clone();
            let mut parent_hash = ancestor.hash;
            let mut banned = false;
            for position in &chain {
                update.stage(&position.hash)?;
                banned = self.connect_to_parent(update, &parent_hash, &position.hash)?;
                parent_hash = position.hash;
            }
            candidates[idx].blacklisted = banned;
        }

        let found = self.choose_candidate(update, &ancestor, &best, &candidates)?;
        if !found {
            // No surviving branch: the chain truncates to the block
            // below the checkpoint
            let fallback = ancestor.position();
            update.set_reorg_parent(fallback);
            update.add_to_best_chain(fallback);
        }
        Ok(())
    }

    /// Stage a candidate whose tip is `child`, rooted just above
    /// `ancestor`. Chains that fork below the ancestor are skipped: they
    /// cannot satisfy the checkpoint and would be re-examined through
    /// the normal accept path if extended.
    fn stage_candidate(
        &self,
        update: &mut UpdateTransaction<'_>,
        ancestor: &BlockHeader,
        candidates: &mut Vec<Candidate>,
        child: BlockHeader,
    ) -> Result<(), OracleError> {
        let first_height = ancestor.height + 1;

        if child.height < first_height {
            return Ok(());
        }

        let mut cursor = child.clone();
        while cursor.height > first_height {
            match update.try_stage(&cursor.prev)? {
                Some(parent) if parent.height < cursor.height => cursor = parent,
                _ => return Ok(()),
            }
        }
        if cursor.prev != ancestor.hash {
            return Ok(());
        }

        if child.height == first_height {
            candidates.push(Candidate {
                blacklisted: false,
                chain: vec![child.position()],
            });
            return Ok(());
        }

        let parent_hash = child.prev;
        update.stage(&parent_hash)?;
        let idx = self.initialize_candidate(
            update,
            candidates,
            &parent_hash,
            &child.hash,
            Some(&ancestor.hash),
        )?;
        candidates[idx].chain.push(child.position());
        debug_assert_eq!(
            candidates[idx].chain.first().map(|p| p.height),
            Some(first_height)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_db::tests::open_header_db;
    use crate::types::sha256d;
    use tempfile::TempDir;

    #[test]
    fn test_self_parent_rejected() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);
        let oracle = HeaderOracle::new(Arc::new(db));

        let mut raw = [0u8; 80];
        raw[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        let mut header = BlockHeader::from_wire(&raw).unwrap();
        header.prev = header.hash;

        assert!(matches!(
            oracle.add_header(header),
            Err(OracleError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);
        let oracle = HeaderOracle::new(Arc::new(db));

        let mut raw = [0u8; 80];
        raw[68..72].copy_from_slice(&((now_seconds() + 3 * 3600) as u32).to_le_bytes());
        raw[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        let header = BlockHeader::from_wire(&raw).unwrap();

        assert!(matches!(
            oracle.add_header(header),
            Err(OracleError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_failed_pow_rejected() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);
        let oracle = HeaderOracle::new(Arc::new(db));

        // Difficulty-1 target with a random hash will not satisfy PoW
        let mut raw = [0u8; 80];
        raw[72..76].copy_from_slice(&0x1d00ffffu32.to_le_bytes());
        let header = BlockHeader::from_wire(&raw).unwrap();
        assert!(sha256d(&raw).as_bytes()[31] != 0);

        let outcome = oracle.add_headers(vec![header]).unwrap();
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_empty_batch_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);
        let oracle = HeaderOracle::new(Arc::new(db));

        let before = oracle.best_chain();
        let outcome = oracle.add_headers(Vec::new()).unwrap();
        assert_eq!(outcome, AddOutcome::default());
        assert_eq!(oracle.best_chain(), before);
    }
}
