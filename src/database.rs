/// Chain database assembly
///
/// Owns the on-disk layout for one chain:
///
///   <datadir>/<chain-id>/db            KV environment (all tables)
///   <datadir>/<chain-id>/blocks/       block body files (blk%05d.dat)
///   <datadir>/<chain-id>/LOCK          advisory lock
///
/// Opening seeds schema version, the siphash key, and the block storage
/// policy in the `config` table, then brings up the header store, filter
/// store, block store, and peer address book over the shared environment.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::broadcast;
use tracing::info;

use crate::address_book::{AddressBook, AddressBookError};
use crate::blockstore::{BlockStore, BlockStoreError, DEFAULT_FILE_CAPACITY, TABLE_BLOCK_INDEX};
use crate::constants::chain_params;
use crate::filter_db::{self, FilterOracle, FilterOracleError};
use crate::header_db::{self, HeaderDb, OracleError};
use crate::reorg::ReorgEvent;
use crate::store::{PutFlags, Store, StoreError, TableKind, TableSpec};
use crate::types::{BlockStoragePolicy, ChainKind, FilterFlavor};

pub const TABLE_CONFIG: &str = "config";

pub const CONFIG_KEY_VERSION: u64 = 0;
pub const CONFIG_KEY_NEXT_BLOCK_ADDRESS: u64 = 1;
pub const CONFIG_KEY_SIPHASH_KEY: u64 = 2;
pub const CONFIG_KEY_BLOCK_STORAGE_POLICY: u64 = 3;

pub const DB_VERSION: u32 = 1;

#[derive(Debug)]
pub enum DatabaseError {
    Storage(StoreError),
    Headers(OracleError),
    Filters(FilterOracleError),
    Blocks(BlockStoreError),
    Peers(AddressBookError),
    Io(std::io::Error),
    /// Another process holds the datadir
    Locked(PathBuf),
    /// Schema version newer than this build understands
    UnsupportedVersion(u32),
    Corrupt(String),
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::Storage(e) => write!(f, "database storage error: {}", e),
            DatabaseError::Headers(e) => write!(f, "header database error: {}", e),
            DatabaseError::Filters(e) => write!(f, "filter database error: {}", e),
            DatabaseError::Blocks(e) => write!(f, "block database error: {}", e),
            DatabaseError::Peers(e) => write!(f, "peer database error: {}", e),
            DatabaseError::Io(e) => write!(f, "database i/o error: {}", e),
            DatabaseError::Locked(path) => {
                write!(f, "datadir already in use: {}", path.display())
            }
            DatabaseError::UnsupportedVersion(v) => {
                write!(f, "unsupported database version: {}", v)
            }
            DatabaseError::Corrupt(msg) => write!(f, "database corrupt: {}", msg),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<StoreError> for DatabaseError {
    fn from(e: StoreError) -> Self {
        DatabaseError::Storage(e)
    }
}

impl From<OracleError> for DatabaseError {
    fn from(e: OracleError) -> Self {
        DatabaseError::Headers(e)
    }
}

impl From<FilterOracleError> for DatabaseError {
    fn from(e: FilterOracleError) -> Self {
        DatabaseError::Filters(e)
    }
}

impl From<BlockStoreError> for DatabaseError {
    fn from(e: BlockStoreError) -> Self {
        DatabaseError::Blocks(e)
    }
}

impl From<AddressBookError> for DatabaseError {
    fn from(e: AddressBookError) -> Self {
        DatabaseError::Peers(e)
    }
}

impl From<std::io::Error> for DatabaseError {
    fn from(e: std::io::Error) -> Self {
        DatabaseError::Io(e)
    }
}

/// Every table the environment carries
pub fn table_specs() -> Vec<TableSpec> {
    vec![
        TableSpec::new(TABLE_CONFIG, TableKind::IntegerKey),
        TableSpec::new(TABLE_BLOCK_INDEX, TableKind::Plain),
        // header chain
        TableSpec::new(header_db::TABLE_HEADER_METADATA, TableKind::Plain),
        TableSpec::new(header_db::TABLE_BEST_CHAIN, TableKind::IntegerKey),
        TableSpec::new(header_db::TABLE_CHAIN_DATA, TableKind::IntegerKey),
        TableSpec::new(header_db::TABLE_SIBLINGS, TableKind::Plain),
        TableSpec::new(header_db::TABLE_DISCONNECTED, TableKind::DupSort),
        // filters, one pair of tables per flavor
        TableSpec::new(filter_db::TABLE_FILTER_TIPS, TableKind::IntegerKey),
        TableSpec::new(filter_db::TABLE_FILTER_HEADER_TIPS, TableKind::IntegerKey),
        TableSpec::new(
            filter_db::filter_table(FilterFlavor::BasicBip158),
            TableKind::Plain,
        ),
        TableSpec::new(
            filter_db::filter_header_table(FilterFlavor::BasicBip158),
            TableKind::Plain,
        ),
        TableSpec::new(
            filter_db::filter_table(FilterFlavor::BasicBch),
            TableKind::Plain,
        ),
        TableSpec::new(
            filter_db::filter_header_table(FilterFlavor::BasicBch),
            TableKind::Plain,
        ),
        TableSpec::new(
            filter_db::filter_table(FilterFlavor::Extended),
            TableKind::Plain,
        ),
        TableSpec::new(
            filter_db::filter_header_table(FilterFlavor::Extended),
            TableKind::Plain,
        ),
        // peer address book
        TableSpec::new(crate::address_book::TABLE_PEERS, TableKind::Plain),
        TableSpec::new(
            crate::address_book::TABLE_PEER_BY_CHAIN,
            TableKind::IntegerKeyDupSort,
        ),
        TableSpec::new(
            crate::address_book::TABLE_PEER_BY_PROTOCOL,
            TableKind::IntegerKeyDupSort,
        ),
        TableSpec::new(
            crate::address_book::TABLE_PEER_BY_SERVICE,
            TableKind::IntegerKeyDupSort,
        ),
        TableSpec::new(
            crate::address_book::TABLE_PEER_BY_NETWORK,
            TableKind::IntegerKeyDupSort,
        ),
        TableSpec::new(
            crate::address_book::TABLE_PEER_BY_LAST_CONNECTED,
            TableKind::IntegerKeyDupSort,
        ),
    ]
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub datadir: PathBuf,
    pub chain: ChainKind,
    pub block_policy: BlockStoragePolicy,
    pub block_file_capacity: u64,
}

impl DatabaseConfig {
    pub fn new(datadir: PathBuf, chain: ChainKind) -> DatabaseConfig {
        DatabaseConfig {
            datadir,
            chain,
            block_policy: BlockStoragePolicy::Cache,
            block_file_capacity: DEFAULT_FILE_CAPACITY,
        }
    }
}

pub struct Database {
    pub store: Arc<Store>,
    pub headers: Arc<HeaderDb>,
    pub filters: Arc<FilterOracle>,
    pub blocks: Arc<BlockStore>,
    pub peers: Arc<AddressBook>,
    chain: ChainKind,
    siphash_key: [u8; 16],
    /// Held for the lifetime of the database
    _lock_file: File,
}

impl Database {
    pub fn open(
        config: &DatabaseConfig,
        reorg_tx: broadcast::Sender<ReorgEvent>,
    ) -> Result<Database, DatabaseError> {
        let chain_dir = config.datadir.join(config.chain.id().to_string());
        std::fs::create_dir_all(&chain_dir)?;

        let lock_path = chain_dir.join("LOCK");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(DatabaseError::Locked(chain_dir));
        }

        let store = Arc::new(Store::open(&chain_dir.join("db"), &table_specs())?);

        let version = Self::init_version(&store)?;
        if version > DB_VERSION {
            return Err(DatabaseError::UnsupportedVersion(version));
        }
        let siphash_key = Self::init_siphash_key(&store)?;
        let policy = Self::init_block_policy(&store, config.block_policy)?;

        let headers = Arc::new(HeaderDb::open(store.clone(), config.chain, reorg_tx)?);

        let mut flavors = vec![chain_params(config.chain).default_filter_flavor];
        if policy == BlockStoragePolicy::All {
            flavors.push(FilterFlavor::Extended);
        }
        let filters = Arc::new(FilterOracle::open(store.clone(), config.chain, flavors)?);

        let blocks = Arc::new(BlockStore::open(
            store.clone(),
            &chain_dir.join("blocks"),
            config.block_file_capacity,
            policy,
        )?);

        let peers = Arc::new(AddressBook::open(store.clone())?);

        info!(
            chain = %config.chain,
            datadir = %chain_dir.display(),
            version,
            policy = ?policy,
            "opened chain database"
        );

        Ok(Database {
            store,
            headers,
            filters,
            blocks,
            peers,
            chain: config.chain,
            siphash_key,
            _lock_file: lock_file,
        })
    }

    pub fn chain(&self) -> ChainKind {
        self.chain
    }

    /// Process-wide siphash key derived on first start
    pub fn siphash_key(&self) -> [u8; 16] {
        self.siphash_key
    }

    fn init_version(store: &Store) -> Result<u32, DatabaseError> {
        match store.get_latest(TABLE_CONFIG, &CONFIG_KEY_VERSION.to_be_bytes())? {
            Some(raw) if raw.len() == 4 => Ok(u32::from_le_bytes(raw.try_into().unwrap())),
            Some(_) => Err(DatabaseError::Corrupt("version field width".to_string())),
            None => {
                let mut txn = store.begin_write();
                txn.put(
                    TABLE_CONFIG,
                    &CONFIG_KEY_VERSION.to_be_bytes(),
                    &DB_VERSION.to_le_bytes(),
                    PutFlags::default(),
                )?;
                txn.commit()?;
                Ok(DB_VERSION)
            }
        }
    }

    fn init_siphash_key(store: &Store) -> Result<[u8; 16], DatabaseError> {
        match store.get_latest(TABLE_CONFIG, &CONFIG_KEY_SIPHASH_KEY.to_be_bytes())? {
            Some(raw) if raw.len() == 16 => Ok(raw.try_into().unwrap()),
            Some(_) => Err(DatabaseError::Corrupt("siphash key width".to_string())),
            None => {
                let key: [u8; 16] = rand::random();
                let mut txn = store.begin_write();
                txn.put(
                    TABLE_CONFIG,
                    &CONFIG_KEY_SIPHASH_KEY.to_be_bytes(),
                    &key,
                    PutFlags::default(),
                )?;
                txn.commit()?;
                Ok(key)
            }
        }
    }

    /// The policy recorded at first start wins over later configuration;
    /// switching it would orphan stored blocks
    fn init_block_policy(
        store: &Store,
        configured: BlockStoragePolicy,
    ) -> Result<BlockStoragePolicy, DatabaseError> {
        match store.get_latest(TABLE_CONFIG, &CONFIG_KEY_BLOCK_STORAGE_POLICY.to_be_bytes())? {
            Some(raw) if raw.len() == 4 => {
                let id = u32::from_le_bytes(raw.try_into().unwrap());
                BlockStoragePolicy::from_id(id)
                    .ok_or_else(|| DatabaseError::Corrupt("block storage policy".to_string()))
            }
            Some(_) => Err(DatabaseError::Corrupt("block policy width".to_string())),
            None => {
                let mut txn = store.begin_write();
                txn.put(
                    TABLE_CONFIG,
                    &CONFIG_KEY_BLOCK_STORAGE_POLICY.to_be_bytes(),
                    &configured.id().to_le_bytes(),
                    PutFlags::default(),
                )?;
                txn.commit()?;
                Ok(configured)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::genesis_hash;
    use crate::reorg::reorg_channel;
    use crate::types::Position;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig {
            datadir: dir.path().to_path_buf(),
            chain: ChainKind::UnitTest,
            block_policy: BlockStoragePolicy::Cache,
            block_file_capacity: 4096,
        }
    }

    #[test]
    fn test_fresh_datadir_fully_seeded() {
        let dir = TempDir::new().unwrap();
        let (reorg_tx, _rx) = reorg_channel(16);
        let db = Database::open(&test_config(&dir), reorg_tx).unwrap();

        let genesis = genesis_hash(ChainKind::UnitTest);
        assert_eq!(db.headers.best(), Position::new(0, genesis));

        let flavor = chain_params(ChainKind::UnitTest).default_filter_flavor;
        assert_eq!(
            db.filters.current_tip(flavor).unwrap(),
            Position::new(0, genesis)
        );
        assert_eq!(
            db.filters.current_header_tip(flavor).unwrap(),
            Position::new(0, genesis)
        );
    }

    #[test]
    fn test_siphash_key_persists() {
        let dir = TempDir::new().unwrap();
        let first_key = {
            let (reorg_tx, _rx) = reorg_channel(16);
            let db = Database::open(&test_config(&dir), reorg_tx).unwrap();
            db.siphash_key()
        };

        let (reorg_tx, _rx) = reorg_channel(16);
        let db = Database::open(&test_config(&dir), reorg_tx).unwrap();
        assert_eq!(db.siphash_key(), first_key);
    }

    #[test]
    fn test_double_open_is_refused() {
        let dir = TempDir::new().unwrap();
        let (reorg_tx, _rx) = reorg_channel(16);
        let _db = Database::open(&test_config(&dir), reorg_tx).unwrap();

        let (reorg_tx, _rx) = reorg_channel(16);
        assert!(matches!(
            Database::open(&test_config(&dir), reorg_tx),
            Err(DatabaseError::Locked(_))
        ));
    }

    #[test]
    fn test_block_policy_pinned_at_first_start() {
        let dir = TempDir::new().unwrap();
        {
            let (reorg_tx, _rx) = reorg_channel(16);
            let mut config = test_config(&dir);
            config.block_policy = BlockStoragePolicy::All;
            let db = Database::open(&config, reorg_tx).unwrap();
            assert_eq!(db.blocks.policy(), BlockStoragePolicy::All);
        }

        // Reopen with a different configured policy; the stored one wins
        let (reorg_tx, _rx) = reorg_channel(16);
        let mut config = test_config(&dir);
        config.block_policy = BlockStoragePolicy::None;
        let db = Database::open(&config, reorg_tx).unwrap();
        assert_eq!(db.blocks.policy(), BlockStoragePolicy::All);
    }

    #[test]
    fn test_version_recorded() {
        let dir = TempDir::new().unwrap();
        let (reorg_tx, _rx) = reorg_channel(16);
        let db = Database::open(&test_config(&dir), reorg_tx).unwrap();

        let raw = db
            .store
            .get_latest(TABLE_CONFIG, &CONFIG_KEY_VERSION.to_be_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(u32::from_le_bytes(raw.try_into().unwrap()), DB_VERSION);
    }
}
