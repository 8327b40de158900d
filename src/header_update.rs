/// Staged header-chain update
///
/// Collects every change an accept or checkpoint operation wants to make
/// (staged headers, best-chain segments, sibling and disconnected edits,
/// checkpoint moves, the reorg parent) so the header store can apply them
/// in one atomic transaction. "Effective" accessors merge staged state
/// with what is already persisted, letting the oracle reason about the
/// world as it will be after commit.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::header_db::{HeaderDb, OracleError};
use crate::types::{BlockHash, BlockHeader, Height, Position};

pub struct UpdateTransaction<'a> {
    db: &'a HeaderDb,
    have_reorg: bool,
    have_checkpoint: bool,
    checkpoint_cleared: bool,
    reorg_from: Position,
    staged_checkpoint: Position,
    /// hash -> (header, newly created)
    headers: HashMap<BlockHash, (BlockHeader, bool)>,
    /// Ordered additions to the best chain
    best: BTreeMap<Height, BlockHash>,
    add_siblings: HashSet<BlockHash>,
    delete_siblings: HashSet<BlockHash>,
    /// (parent, child) edges leaving the disconnected pool
    connected: Vec<(BlockHash, BlockHash)>,
    /// (parent, child) edges entering the disconnected pool
    disconnected: Vec<(BlockHash, BlockHash)>,
    cached_disconnected: Option<BTreeMap<BlockHash, Vec<BlockHash>>>,
    cached_siblings: Option<HashSet<BlockHash>>,
}

impl<'a> UpdateTransaction<'a> {
    pub fn new(db: &'a HeaderDb) -> UpdateTransaction<'a> {
        UpdateTransaction {
            db,
            have_reorg: false,
            have_checkpoint: false,
            checkpoint_cleared: false,
            reorg_from: Position::blank(),
            staged_checkpoint: Position::blank(),
            headers: HashMap::new(),
            best: BTreeMap::new(),
            add_siblings: HashSet::new(),
            delete_siblings: HashSet::new(),
            connected: Vec::new(),
            disconnected: Vec::new(),
            cached_disconnected: None,
            cached_siblings: None,
        }
    }

    // --- staging ---

    /// Stage a brand new header
    pub fn stage_new(&mut self, header: BlockHeader) -> BlockHash {
        let hash = header.hash;
        self.headers.insert(hash, (header, true));
        hash
    }

    /// Stage an existing header (from a previous staging or the store) for
    /// metadata updates; errors if the header is unknown
    pub fn stage(&mut self, hash: &BlockHash) -> Result<BlockHeader, OracleError> {
        self.try_stage(hash)?
            .ok_or_else(|| OracleError::Missing(format!("header {}", hash.short())))
    }

    /// Stage an existing header, or None when it is not known anywhere
    pub fn try_stage(&mut self, hash: &BlockHash) -> Result<Option<BlockHeader>, OracleError> {
        if let Some((header, _)) = self.headers.get(hash) {
            return Ok(Some(header.clone()));
        }
        match self.db.try_load_header(hash)? {
            Some(header) => {
                self.headers.insert(*hash, (header.clone(), false));
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Stage the current best header
    pub fn stage_best(&mut self) -> Result<BlockHeader, OracleError> {
        let best = self.db.best();
        self.stage(&best.hash)
    }

    /// Stage the best-chain header at a height
    pub fn stage_height(&mut self, height: Height) -> Result<BlockHeader, OracleError> {
        let hash = self.effective_best_block(height)?;
        self.stage(&hash)
    }

    /// Apply a mutation to an already-staged header
    pub fn modify_header<F>(&mut self, hash: &BlockHash, mutate: F) -> Result<(), OracleError>
    where
        F: FnOnce(&mut BlockHeader),
    {
        match self.headers.get_mut(hash) {
            Some((header, _)) => {
                mutate(header);
                Ok(())
            }
            None => Err(OracleError::Missing(format!(
                "header {} not staged",
                hash.short()
            ))),
        }
    }

    /// Read an already-staged header
    pub fn staged_header(&self, hash: &BlockHash) -> Result<&BlockHeader, OracleError> {
        self.headers
            .get(hash)
            .map(|(header, _)| header)
            .ok_or_else(|| OracleError::Missing(format!("header {} not staged", hash.short())))
    }

    // --- effective views ---

    pub fn effective_header_exists(&self, hash: &BlockHash) -> Result<bool, OracleError> {
        if self.headers.contains_key(hash) {
            return Ok(true);
        }
        self.db.header_exists(hash)
    }

    /// Best-chain hash at a height, staged additions first
    pub fn effective_best_block(&self, height: Height) -> Result<BlockHash, OracleError> {
        if height < 0 {
            return Err(OracleError::Missing(format!(
                "no best block at height {}",
                height
            )));
        }
        if let Some(hash) = self.best.get(&height) {
            return Ok(*hash);
        }
        self.db
            .best_block(height)?
            .ok_or_else(|| OracleError::Missing(format!("no best block at height {}", height)))
    }

    /// The best tip as it will exist after this update commits: staged
    /// additions win once they reach (or, via a staged reorg, replace)
    /// the persisted tip
    pub fn effective_best_position(&self) -> Position {
        let persisted = self.db.best();
        match self.best_chain_tip() {
            Some(staged) if self.have_reorg || staged.height >= persisted.height => staged,
            _ => persisted,
        }
    }

    pub fn effective_checkpoint_exists(&self) -> Result<bool, OracleError> {
        Ok(!self.checkpoint()?.is_blank())
    }

    /// The checkpoint as it will exist after this update
    pub fn checkpoint(&self) -> Result<Position, OracleError> {
        if self.have_checkpoint {
            Ok(self.staged_checkpoint)
        } else if self.checkpoint_cleared {
            Ok(Position::blank())
        } else {
            self.db.checkpoint()
        }
    }

    fn disconnected_cache(&mut self) -> Result<&mut BTreeMap<BlockHash, Vec<BlockHash>>, OracleError> {
        if self.cached_disconnected.is_none() {
            let mut map: BTreeMap<BlockHash, Vec<BlockHash>> = BTreeMap::new();
            for (parent, child) in self.db.disconnected_edges()? {
                map.entry(parent).or_default().push(child);
            }
            self.cached_disconnected = Some(map);
        }
        Ok(self.cached_disconnected.as_mut().expect("just populated"))
    }

    pub fn effective_disconnected_children(
        &mut self,
        parent: &BlockHash,
    ) -> Result<Vec<BlockHash>, OracleError> {
        let cache = self.disconnected_cache()?;
        Ok(cache.get(parent).cloned().unwrap_or_default())
    }

    pub fn effective_has_disconnected_children(
        &mut self,
        parent: &BlockHash,
    ) -> Result<bool, OracleError> {
        Ok(!self.effective_disconnected_children(parent)?.is_empty())
    }

    fn siblings_cache(&mut self) -> Result<&mut HashSet<BlockHash>, OracleError> {
        if self.cached_siblings.is_none() {
            self.cached_siblings = Some(self.db.siblings()?);
        }
        Ok(self.cached_siblings.as_mut().expect("just populated"))
    }

    pub fn effective_is_sibling(&mut self, hash: &BlockHash) -> Result<bool, OracleError> {
        Ok(self.siblings_cache()?.contains(hash))
    }

    pub fn effective_sibling_hashes(&mut self) -> Result<Vec<BlockHash>, OracleError> {
        let mut hashes: Vec<BlockHash> = self.siblings_cache()?.iter().copied().collect();
        hashes.sort();
        Ok(hashes)
    }

    // --- mutations ---

    pub fn add_to_best_chain(&mut self, position: Position) {
        self.best.insert(position.height, position.hash);
    }

    pub fn add_sibling(&mut self, position: Position) {
        self.delete_siblings.remove(&position.hash);
        self.add_siblings.insert(position.hash);
        if let Ok(cache) = self.siblings_cache() {
            cache.insert(position.hash);
        }
    }

    pub fn remove_sibling(&mut self, hash: &BlockHash) {
        self.add_siblings.remove(hash);
        self.delete_siblings.insert(*hash);
        if let Ok(cache) = self.siblings_cache() {
            cache.remove(hash);
        }
    }

    /// Record that a formerly-disconnected edge has reconnected
    pub fn connect_block(&mut self, parent: BlockHash, child: BlockHash) -> Result<(), OracleError> {
        self.connected.push((parent, child));
        let cache = self.disconnected_cache()?;
        if let Some(children) = cache.get_mut(&parent) {
            children.retain(|c| *c != child);
            if children.is_empty() {
                cache.remove(&parent);
            }
        }
        Ok(())
    }

    /// Record a header whose parent is unknown
    pub fn disconnect_block(&mut self, header: &BlockHeader) -> Result<(), OracleError> {
        self.disconnected.push((header.prev, header.hash));
        let cache = self.disconnected_cache()?;
        let children = cache.entry(header.prev).or_default();
        if !children.contains(&header.hash) {
            children.push(header.hash);
        }
        Ok(())
    }

    pub fn set_checkpoint(&mut self, checkpoint: Position) {
        self.have_checkpoint = true;
        self.checkpoint_cleared = false;
        self.staged_checkpoint = checkpoint;
    }

    pub fn clear_checkpoint(&mut self) {
        self.have_checkpoint = false;
        self.checkpoint_cleared = true;
        self.staged_checkpoint = Position::blank();
    }

    /// Record the common ancestor a reorg retires to. Repeated reorgs in
    /// one update keep the deepest ancestor, so subscribers roll back far
    /// enough.
    pub fn set_reorg_parent(&mut self, position: Position) {
        if !self.have_reorg || position.height < self.reorg_from.height {
            self.reorg_from = position;
        }
        self.have_reorg = true;
    }

    // --- accessors for apply ---

    pub fn have_reorg(&self) -> bool {
        self.have_reorg
    }

    pub fn reorg_parent(&self) -> Position {
        self.reorg_from
    }

    pub fn have_checkpoint_set(&self) -> bool {
        self.have_checkpoint
    }

    pub fn have_checkpoint_cleared(&self) -> bool {
        self.checkpoint_cleared
    }

    pub fn staged_checkpoint(&self) -> Position {
        self.staged_checkpoint
    }

    pub fn updated_headers(&self) -> impl Iterator<Item = (&BlockHash, &BlockHeader, bool)> {
        self.headers
            .iter()
            .map(|(hash, (header, new))| (hash, header, *new))
    }

    pub fn best_chain_additions(&self) -> impl Iterator<Item = Position> + '_ {
        self.best
            .iter()
            .map(|(height, hash)| Position::new(*height, *hash))
    }

    pub fn best_chain_tip(&self) -> Option<Position> {
        self.best
            .iter()
            .next_back()
            .map(|(height, hash)| Position::new(*height, *hash))
    }

    pub fn siblings_to_add(&self) -> impl Iterator<Item = &BlockHash> {
        self.add_siblings.iter()
    }

    pub fn siblings_to_delete(&self) -> impl Iterator<Item = &BlockHash> {
        self.delete_siblings.iter()
    }

    pub fn connected_edges(&self) -> &[(BlockHash, BlockHash)] {
        &self.connected
    }

    pub fn disconnected_edges(&self) -> &[(BlockHash, BlockHash)] {
        &self.disconnected
    }
}
