/// Header chain storage
///
/// Owns the header tables: serialized header metadata, the best chain by
/// height, scalar chain data (tip height, checkpoint), sibling tips, and
/// the disconnected-header pool. An UpdateTransaction is applied in one
/// atomic write; the reorg event, when present, is published only after
/// the commit succeeds.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::constants::{genesis_hash, genesis_header};
use crate::header_update::UpdateTransaction;
use crate::reorg::ReorgEvent;
use crate::store::{Direction, PutFlags, Store, StoreError};
use crate::types::{BlockHash, BlockHeader, ChainKind, Height, Position};

pub const TABLE_HEADER_METADATA: &str = "block_header_metadata";
pub const TABLE_BEST_CHAIN: &str = "best_header_chain";
pub const TABLE_CHAIN_DATA: &str = "block_header_data";
pub const TABLE_SIBLINGS: &str = "block_siblings";
pub const TABLE_DISCONNECTED: &str = "disconnected_block_headers";

const KEY_TIP_HEIGHT: u64 = 0;
const KEY_CHECKPOINT_HEIGHT: u64 = 1;
const KEY_CHECKPOINT_HASH: u64 = 2;

#[derive(Debug)]
pub enum OracleError {
    /// Consensus-invalid header: failed PoW, absurd timestamp, malformed
    InvalidHeader(String),
    Storage(StoreError),
    /// Referenced data that should exist does not
    Missing(String),
    Encoding(String),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
            OracleError::Storage(e) => write!(f, "header storage error: {}", e),
            OracleError::Missing(msg) => write!(f, "missing data: {}", msg),
            OracleError::Encoding(msg) => write!(f, "header encoding error: {}", msg),
        }
    }
}

impl std::error::Error for OracleError {}

impl From<StoreError> for OracleError {
    fn from(e: StoreError) -> Self {
        OracleError::Storage(e)
    }
}

pub struct HeaderDb {
    store: Arc<Store>,
    chain: ChainKind,
    reorg_tx: broadcast::Sender<ReorgEvent>,
    tip_cache: Mutex<Position>,
}

impl HeaderDb {
    /// Open the header store, seeding genesis on a fresh database
    pub fn open(
        store: Arc<Store>,
        chain: ChainKind,
        reorg_tx: broadcast::Sender<ReorgEvent>,
    ) -> Result<HeaderDb, OracleError> {
        let db = HeaderDb {
            store,
            chain,
            reorg_tx,
            tip_cache: Mutex::new(Position::blank()),
        };
        db.import_genesis()?;

        let tip = db.read_best()?;
        debug_assert!(db.header_exists(&tip.hash)?);
        *db.tip_cache.lock().unwrap_or_else(|p| p.into_inner()) = tip;
        Ok(db)
    }

    pub fn chain(&self) -> ChainKind {
        self.chain
    }

    fn import_genesis(&self) -> Result<(), OracleError> {
        let hash = genesis_hash(self.chain);

        let read = self.store.begin_read();
        let have_metadata = read.exists(TABLE_HEADER_METADATA, hash.as_bytes())?;
        let have_tip = read.get_int(TABLE_CHAIN_DATA, KEY_TIP_HEIGHT)?.is_some();
        drop(read);

        if have_metadata && have_tip {
            return Ok(());
        }

        let mut txn = self.store.begin_write();
        if !have_metadata {
            let header = genesis_header(self.chain);
            txn.put(
                TABLE_HEADER_METADATA,
                hash.as_bytes(),
                &encode_header(&header)?,
                PutFlags::default(),
            )?;
        }
        if !have_tip {
            txn.put_int(TABLE_BEST_CHAIN, 0, hash.as_bytes(), PutFlags::default())?;
            txn.put_int(
                TABLE_CHAIN_DATA,
                KEY_TIP_HEIGHT,
                &0i64.to_be_bytes(),
                PutFlags::default(),
            )?;
        }
        txn.commit()?;
        info!(chain = %self.chain, genesis = %hash.short(), "seeded genesis header");
        Ok(())
    }

    /// Current best position (cached; refreshed on every applied update)
    pub fn best(&self) -> Position {
        *self.tip_cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_best(&self) -> Result<Position, OracleError> {
        let read = self.store.begin_read();
        let height = match read.get_int(TABLE_CHAIN_DATA, KEY_TIP_HEIGHT)? {
            Some(raw) if raw.len() == 8 => i64::from_be_bytes(raw.try_into().unwrap()),
            _ => return Ok(Position::blank()),
        };
        let hash = match read.get_int(TABLE_BEST_CHAIN, height.max(0) as u64)? {
            Some(raw) => BlockHash::from_slice(&raw)
                .ok_or_else(|| OracleError::Encoding("best chain entry width".to_string()))?,
            None => return Ok(Position::blank()),
        };
        Ok(Position::new(height, hash))
    }

    /// Best-chain hash at a height, None when past the tip
    pub fn best_block(&self, height: Height) -> Result<Option<BlockHash>, OracleError> {
        if height < 0 {
            return Ok(None);
        }
        let read = self.store.begin_read();
        match read.get_int(TABLE_BEST_CHAIN, height as u64)? {
            Some(raw) => Ok(Some(BlockHash::from_slice(&raw).ok_or_else(|| {
                OracleError::Encoding("best chain entry width".to_string())
            })?)),
            None => Ok(None),
        }
    }

    pub fn header_exists(&self, hash: &BlockHash) -> Result<bool, OracleError> {
        let read = self.store.begin_read();
        Ok(read.exists(TABLE_HEADER_METADATA, hash.as_bytes())?)
    }

    pub fn try_load_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>, OracleError> {
        let read = self.store.begin_read();
        match read.get(TABLE_HEADER_METADATA, hash.as_bytes())? {
            Some(raw) => Ok(Some(decode_header(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn is_sibling(&self, hash: &BlockHash) -> Result<bool, OracleError> {
        let read = self.store.begin_read();
        Ok(read.exists(TABLE_SIBLINGS, hash.as_bytes())?)
    }

    pub fn siblings(&self) -> Result<HashSet<BlockHash>, OracleError> {
        let read = self.store.begin_read();
        let mut out = HashSet::new();
        read.iterate(TABLE_SIBLINGS, Direction::Forward, |_, value| {
            if let Some(hash) = BlockHash::from_slice(value) {
                out.insert(hash);
            }
            true
        })?;
        Ok(out)
    }

    /// Every (parent, child) edge in the disconnected pool
    pub fn disconnected_edges(&self) -> Result<Vec<(BlockHash, BlockHash)>, OracleError> {
        let read = self.store.begin_read();
        let mut out = Vec::new();
        read.iterate(TABLE_DISCONNECTED, Direction::Forward, |key, value| {
            if let (Some(parent), Some(child)) =
                (BlockHash::from_slice(key), BlockHash::from_slice(value))
            {
                out.push((parent, child));
            }
            true
        })?;
        Ok(out)
    }

    pub fn has_disconnected_children(&self, hash: &BlockHash) -> Result<bool, OracleError> {
        let read = self.store.begin_read();
        Ok(read.exists(TABLE_DISCONNECTED, hash.as_bytes())?)
    }

    /// The active checkpoint, blank when none is set
    pub fn checkpoint(&self) -> Result<Position, OracleError> {
        let read = self.store.begin_read();
        let height = match read.get_int(TABLE_CHAIN_DATA, KEY_CHECKPOINT_HEIGHT)? {
            Some(raw) if raw.len() == 8 => i64::from_be_bytes(raw.try_into().unwrap()),
            _ => return Ok(Position::blank()),
        };
        let hash = match read.get_int(TABLE_CHAIN_DATA, KEY_CHECKPOINT_HASH)? {
            Some(raw) => BlockHash::from_slice(&raw)
                .ok_or_else(|| OracleError::Encoding("checkpoint hash width".to_string()))?,
            None => return Ok(Position::blank()),
        };
        Ok(Position::new(height, hash))
    }

    /// Up to `limit` best-chain hashes, newest first
    pub fn recent_hashes(&self, limit: usize) -> Result<Vec<BlockHash>, OracleError> {
        let read = self.store.begin_read();
        let mut out = Vec::new();
        read.iterate(TABLE_BEST_CHAIN, Direction::Backward, |_, value| {
            if let Some(hash) = BlockHash::from_slice(value) {
                out.push(hash);
            }
            out.len() < limit
        })?;
        Ok(out)
    }

    /// Apply a staged update atomically, then publish its reorg event (if
    /// any) and refresh the tip cache.
    pub fn apply_update(&self, update: UpdateTransaction<'_>) -> Result<(), OracleError> {
        let initial_height = self.best().height;
        let mut txn = self.store.begin_write();

        if update.have_checkpoint_set() {
            let checkpoint = update.staged_checkpoint();
            txn.put_int(
                TABLE_CHAIN_DATA,
                KEY_CHECKPOINT_HEIGHT,
                &checkpoint.height.to_be_bytes(),
                PutFlags::default(),
            )?;
            txn.put_int(
                TABLE_CHAIN_DATA,
                KEY_CHECKPOINT_HASH,
                checkpoint.hash.as_bytes(),
                PutFlags::default(),
            )?;
        } else if update.have_checkpoint_cleared() {
            txn.delete_int(TABLE_CHAIN_DATA, KEY_CHECKPOINT_HEIGHT)?;
            txn.delete_int(TABLE_CHAIN_DATA, KEY_CHECKPOINT_HASH)?;
        }

        for (parent, child) in update.disconnected_edges() {
            txn.put(
                TABLE_DISCONNECTED,
                parent.as_bytes(),
                child.as_bytes(),
                PutFlags::default(),
            )?;
        }
        for (parent, child) in update.connected_edges() {
            txn.delete_pair(TABLE_DISCONNECTED, parent.as_bytes(), child.as_bytes())?;
        }

        for hash in update.siblings_to_add() {
            txn.put(
                TABLE_SIBLINGS,
                hash.as_bytes(),
                hash.as_bytes(),
                PutFlags::default(),
            )?;
        }
        for hash in update.siblings_to_delete() {
            txn.delete(TABLE_SIBLINGS, hash.as_bytes())?;
        }

        for (hash, header, _new) in update.updated_headers() {
            txn.put(
                TABLE_HEADER_METADATA,
                hash.as_bytes(),
                &encode_header(header)?,
                PutFlags::default(),
            )?;
        }

        if update.have_reorg() {
            let parent_height = update.reorg_parent().height;
            let mut height = initial_height;
            while height > parent_height {
                txn.delete_int(TABLE_BEST_CHAIN, height.max(0) as u64)?;
                height -= 1;
            }
        }

        for position in update.best_chain_additions() {
            txn.put_int(
                TABLE_BEST_CHAIN,
                position.height.max(0) as u64,
                position.hash.as_bytes(),
                PutFlags::default(),
            )?;
        }

        let new_tip = update.best_chain_tip();
        if let Some(tip) = new_tip {
            txn.put_int(
                TABLE_CHAIN_DATA,
                KEY_TIP_HEIGHT,
                &tip.height.to_be_bytes(),
                PutFlags::default(),
            )?;
        }

        let have_reorg = update.have_reorg();
        let reorg_parent = update.reorg_parent();

        txn.commit()?;

        if let Some(tip) = new_tip {
            *self.tip_cache.lock().unwrap_or_else(|p| p.into_inner()) = tip;
            debug!(chain = %self.chain, height = tip.height, tip = %tip.hash.short(), "best chain updated");
        }

        if have_reorg {
            info!(
                chain = %self.chain,
                ancestor = %format!("{:x}", reorg_parent.hash),
                height = reorg_parent.height,
                "blockchain reorg detected, last common ancestor recorded"
            );
            let _ = self.reorg_tx.send(ReorgEvent {
                chain: self.chain,
                ancestor: reorg_parent,
            });
        }

        Ok(())
    }
}

fn encode_header(header: &BlockHeader) -> Result<Vec<u8>, OracleError> {
    bincode::serialize(header).map_err(|e| OracleError::Encoding(e.to_string()))
}

fn decode_header(raw: &[u8]) -> Result<BlockHeader, OracleError> {
    bincode::deserialize(raw).map_err(|e| OracleError::Encoding(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reorg::reorg_channel;
    use crate::store::{TableKind, TableSpec};
    use tempfile::TempDir;

    pub const TABLES: &[TableSpec] = &[
        TableSpec::new(TABLE_HEADER_METADATA, TableKind::Plain),
        TableSpec::new(TABLE_BEST_CHAIN, TableKind::IntegerKey),
        TableSpec::new(TABLE_CHAIN_DATA, TableKind::IntegerKey),
        TableSpec::new(TABLE_SIBLINGS, TableKind::Plain),
        TableSpec::new(TABLE_DISCONNECTED, TableKind::DupSort),
    ];

    pub fn open_header_db(dir: &TempDir) -> (Arc<Store>, HeaderDb) {
        let store = Arc::new(Store::open(dir.path(), TABLES).unwrap());
        let (tx, _rx) = reorg_channel(16);
        let db = HeaderDb::open(store.clone(), ChainKind::UnitTest, tx).unwrap();
        (store, db)
    }

    #[test]
    fn test_genesis_seeded_on_open() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);

        let best = db.best();
        assert_eq!(best.height, 0);
        assert_eq!(best.hash, genesis_hash(ChainKind::UnitTest));
        assert!(db.header_exists(&best.hash).unwrap());

        let header = db.try_load_header(&best.hash).unwrap().unwrap();
        assert_eq!(header.height, 0);
        assert_eq!(header.hash, best.hash);
    }

    #[test]
    fn test_genesis_import_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = {
            let (store, db) = open_header_db(&dir);
            drop(db);
            store
        };

        // Reopen over the same store
        let (tx, _rx) = reorg_channel(16);
        let db = HeaderDb::open(store, ChainKind::UnitTest, tx).unwrap();
        assert_eq!(db.best().height, 0);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);
        assert!(db.checkpoint().unwrap().is_blank());

        let mut update = UpdateTransaction::new(&db);
        update.set_checkpoint(Position::new(100, BlockHash([8u8; 32])));
        db.apply_update(update).unwrap();

        let checkpoint = db.checkpoint().unwrap();
        assert_eq!(checkpoint.height, 100);
        assert_eq!(checkpoint.hash, BlockHash([8u8; 32]));

        let mut update = UpdateTransaction::new(&db);
        update.clear_checkpoint();
        db.apply_update(update).unwrap();
        assert!(db.checkpoint().unwrap().is_blank());
    }

    #[test]
    fn test_disconnected_edges_round_trip() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);

        let parent = BlockHash([1u8; 32]);
        let child = BlockHash([2u8; 32]);

        let mut raw = [0u8; 80];
        raw[4..36].copy_from_slice(parent.as_bytes());
        raw[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        let mut header = BlockHeader::from_wire(&raw).unwrap();
        header.hash = child;

        let mut update = UpdateTransaction::new(&db);
        update.disconnect_block(&header).unwrap();
        db.apply_update(update).unwrap();

        assert!(db.has_disconnected_children(&parent).unwrap());
        assert_eq!(db.disconnected_edges().unwrap(), vec![(parent, child)]);

        let mut update = UpdateTransaction::new(&db);
        update.connect_block(parent, child).unwrap();
        db.apply_update(update).unwrap();
        assert!(!db.has_disconnected_children(&parent).unwrap());
    }

    #[test]
    fn test_recent_hashes_newest_first() {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);

        let mut update = UpdateTransaction::new(&db);
        for height in 1..=5i64 {
            update.add_to_best_chain(Position::new(height, BlockHash([height as u8; 32])));
        }
        db.apply_update(update).unwrap();

        let recent = db.recent_hashes(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0], BlockHash([5u8; 32]));
        assert_eq!(recent[1], BlockHash([4u8; 32]));
        assert_eq!(recent[2], BlockHash([3u8; 32]));
    }
}
