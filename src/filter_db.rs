/// Filter storage
///
/// Stores compact filters and their chained headers per filter flavor,
/// plus a tip position per flavor for each of the two tables. Rows for
/// orphaned blocks are left in place on reorg (only the tips move) and
/// are overwritten when the replacement chain supplies new data.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::constants::{genesis_filter, genesis_filter_elements, genesis_hash, genesis_header};
use crate::gcs::{filter_header_from_hash, Gcs};
use crate::store::{PutFlags, Store, StoreError};
use crate::types::{BlockHash, ChainKind, FilterFlavor, FilterHash, FilterHeader, Hash, Position};

pub const TABLE_FILTER_TIPS: &str = "filter_tips";
pub const TABLE_FILTER_HEADER_TIPS: &str = "filter_header_tips";

/// Per-flavor filter tables
pub fn filter_table(flavor: FilterFlavor) -> &'static str {
    match flavor {
        FilterFlavor::BasicBip158 => "filters_basic",
        FilterFlavor::BasicBch => "filters_basic_bch",
        FilterFlavor::Extended => "filters_extended",
    }
}

/// Per-flavor filter header tables
pub fn filter_header_table(flavor: FilterFlavor) -> &'static str {
    match flavor {
        FilterFlavor::BasicBip158 => "filter_headers_basic",
        FilterFlavor::BasicBch => "filter_headers_basic_bch",
        FilterFlavor::Extended => "filter_headers_extended",
    }
}

#[derive(Debug)]
pub enum FilterOracleError {
    Storage(StoreError),
    Encoding(String),
}

impl fmt::Display for FilterOracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterOracleError::Storage(e) => write!(f, "filter storage error: {}", e),
            FilterOracleError::Encoding(msg) => write!(f, "filter encoding error: {}", msg),
        }
    }
}

impl std::error::Error for FilterOracleError {}

impl From<StoreError> for FilterOracleError {
    fn from(e: StoreError) -> Self {
        FilterOracleError::Storage(e)
    }
}

/// Recompute the chained header for a filter hash; callers verify
/// received cfheaders against this before storing
pub fn chain_filter_header(filter_hash: &FilterHash, previous: &FilterHeader) -> FilterHeader {
    filter_header_from_hash(filter_hash, previous)
}

/// Header-table row: filter hash then chained header
fn encode_header_row(filter_hash: &FilterHash, header: &FilterHeader) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(filter_hash.as_bytes());
    out[32..].copy_from_slice(header.as_bytes());
    out
}

fn decode_header_row(raw: &[u8]) -> Option<(FilterHash, FilterHeader)> {
    if raw.len() != 64 {
        return None;
    }
    Some((Hash::from_slice(&raw[..32])?, Hash::from_slice(&raw[32..])?))
}

pub struct FilterOracle {
    store: Arc<Store>,
    chain: ChainKind,
    flavors: Vec<FilterFlavor>,
    /// Serializes tip movements
    lock: Mutex<()>,
}

impl FilterOracle {
    /// Open the filter store, seeding each configured flavor's genesis
    /// filter and header when its tip is not yet recorded
    pub fn open(
        store: Arc<Store>,
        chain: ChainKind,
        flavors: Vec<FilterFlavor>,
    ) -> Result<FilterOracle, FilterOracleError> {
        let oracle = FilterOracle {
            store,
            chain,
            flavors,
            lock: Mutex::new(()),
        };
        for flavor in oracle.flavors.clone() {
            oracle.import_genesis(flavor)?;
        }
        Ok(oracle)
    }

    pub fn chain(&self) -> ChainKind {
        self.chain
    }

    pub fn flavors(&self) -> &[FilterFlavor] {
        &self.flavors
    }

    fn import_genesis(&self, flavor: FilterFlavor) -> Result<(), FilterOracleError> {
        let need_filter = self.current_tip(flavor)?.is_blank();
        let need_header = self.current_header_tip(flavor)?.is_blank();
        if !(need_filter || need_header) {
            return Ok(());
        }

        let block_hash = genesis_hash(self.chain);
        let genesis_position = Position::new(0, block_hash);
        let (p, m) = flavor.params();
        let key = crate::gcs::block_hash_to_filter_key(&block_hash);

        // Pinned constants when available, re-encoded otherwise. Either
        // way the bytes are identical; a codec test enforces it.
        let (filter_bytes, header) = match genesis_filter(self.chain, flavor) {
            Some((header_hex, filter_hex)) => {
                let bytes = hex::decode(filter_hex)
                    .map_err(|e| FilterOracleError::Encoding(e.to_string()))?;
                let header = Hash::from_internal_hex(header_hex)
                    .ok_or_else(|| FilterOracleError::Encoding("genesis header hex".to_string()))?;
                (bytes, header)
            }
            None => {
                let elements = genesis_filter_elements(self.chain, flavor);
                let gcs = Gcs::from_elements(p, m, key, &elements);
                let header = gcs.header(&Hash::ZERO);
                (gcs.encode(), header)
            }
        };
        let filter_hash = crate::gcs::filter_hash(&filter_bytes);

        let mut txn = self.store.begin_write();
        if need_header {
            txn.put(
                filter_header_table(flavor),
                block_hash.as_bytes(),
                &encode_header_row(&filter_hash, &header),
                PutFlags::default(),
            )?;
            txn.put_int(
                TABLE_FILTER_HEADER_TIPS,
                u64::from(flavor.id()),
                &genesis_position.serialize(),
                PutFlags::default(),
            )?;
        }
        if need_filter {
            txn.put(
                filter_table(flavor),
                block_hash.as_bytes(),
                &filter_bytes,
                PutFlags::default(),
            )?;
            txn.put_int(
                TABLE_FILTER_TIPS,
                u64::from(flavor.id()),
                &genesis_position.serialize(),
                PutFlags::default(),
            )?;
        }
        txn.commit()?;

        info!(chain = %self.chain, flavor = %flavor, "seeded genesis filter");
        debug_assert_eq!(genesis_header(self.chain).hash, block_hash);
        Ok(())
    }

    pub fn current_tip(&self, flavor: FilterFlavor) -> Result<Position, FilterOracleError> {
        self.read_tip(TABLE_FILTER_TIPS, flavor)
    }

    pub fn current_header_tip(&self, flavor: FilterFlavor) -> Result<Position, FilterOracleError> {
        self.read_tip(TABLE_FILTER_HEADER_TIPS, flavor)
    }

    fn read_tip(&self, table: &str, flavor: FilterFlavor) -> Result<Position, FilterOracleError> {
        let read = self.store.begin_read();
        match read.get_int(table, u64::from(flavor.id()))? {
            Some(raw) => Position::deserialize(&raw)
                .ok_or_else(|| FilterOracleError::Encoding("tip position width".to_string())),
            None => Ok(Position::blank()),
        }
    }

    pub fn have_filter(&self, flavor: FilterFlavor, block: &BlockHash) -> Result<bool, FilterOracleError> {
        let read = self.store.begin_read();
        Ok(read.exists(filter_table(flavor), block.as_bytes())?)
    }

    pub fn have_filter_header(
        &self,
        flavor: FilterFlavor,
        block: &BlockHash,
    ) -> Result<bool, FilterOracleError> {
        let read = self.store.begin_read();
        Ok(read.exists(filter_header_table(flavor), block.as_bytes())?)
    }

    /// Raw serialized filter bytes for a block
    pub fn load_filter(
        &self,
        flavor: FilterFlavor,
        block: &BlockHash,
    ) -> Result<Option<Vec<u8>>, FilterOracleError> {
        let read = self.store.begin_read();
        Ok(read.get(filter_table(flavor), block.as_bytes())?)
    }

    /// Decoded filter, keyed for match queries against this block
    pub fn load_filter_gcs(
        &self,
        flavor: FilterFlavor,
        block: &BlockHash,
    ) -> Result<Option<Gcs>, FilterOracleError> {
        let bytes = match self.load_filter(flavor, block)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let (p, m) = flavor.params();
        let key = crate::gcs::block_hash_to_filter_key(block);
        Gcs::from_serialized(p, m, key, &bytes)
            .map(Some)
            .map_err(|e| FilterOracleError::Encoding(e.to_string()))
    }

    pub fn load_filter_hash(
        &self,
        flavor: FilterFlavor,
        block: &BlockHash,
    ) -> Result<Option<FilterHash>, FilterOracleError> {
        let read = self.store.begin_read();
        match read.get(filter_header_table(flavor), block.as_bytes())? {
            Some(raw) => {
                let (hash, _) = decode_header_row(&raw)
                    .ok_or_else(|| FilterOracleError::Encoding("header row width".to_string()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn load_filter_header(
        &self,
        flavor: FilterFlavor,
        block: &BlockHash,
    ) -> Result<Option<FilterHeader>, FilterOracleError> {
        let read = self.store.begin_read();
        match read.get(filter_header_table(flavor), block.as_bytes())? {
            Some(raw) => {
                let (_, header) = decode_header_row(&raw)
                    .ok_or_else(|| FilterOracleError::Encoding("header row width".to_string()))?;
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Append filters and advance the tip to the highest supplied
    /// position
    pub fn store_filters(
        &self,
        flavor: FilterFlavor,
        filters: &[(Position, Vec<u8>)],
    ) -> Result<(), FilterOracleError> {
        if filters.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut tip = self.current_tip(flavor)?;
        let mut txn = self.store.begin_write();
        for (position, bytes) in filters {
            txn.put(
                filter_table(flavor),
                position.hash.as_bytes(),
                bytes,
                PutFlags::default(),
            )?;
            if position.height > tip.height {
                tip = *position;
            }
        }
        txn.put_int(
            TABLE_FILTER_TIPS,
            u64::from(flavor.id()),
            &tip.serialize(),
            PutFlags::default(),
        )?;
        txn.commit()?;

        debug!(chain = %self.chain, flavor = %flavor, height = tip.height, "stored filters");
        Ok(())
    }

    /// Append filter headers and advance the header tip
    pub fn store_filter_headers(
        &self,
        flavor: FilterFlavor,
        headers: &[(Position, FilterHash, FilterHeader)],
    ) -> Result<(), FilterOracleError> {
        if headers.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut tip = self.current_header_tip(flavor)?;
        let mut txn = self.store.begin_write();
        for (position, filter_hash, header) in headers {
            txn.put(
                filter_header_table(flavor),
                position.hash.as_bytes(),
                &encode_header_row(filter_hash, header),
                PutFlags::default(),
            )?;
            if position.height > tip.height {
                tip = *position;
            }
        }
        txn.put_int(
            TABLE_FILTER_HEADER_TIPS,
            u64::from(flavor.id()),
            &tip.serialize(),
            PutFlags::default(),
        )?;
        txn.commit()?;

        debug!(chain = %self.chain, flavor = %flavor, height = tip.height, "stored filter headers");
        Ok(())
    }

    /// Lower both tips to the common ancestor after a reorg. Orphaned
    /// rows stay in place and are overwritten on re-application.
    pub fn reset_tips(
        &self,
        flavor: FilterFlavor,
        ancestor: &Position,
    ) -> Result<(), FilterOracleError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let tip = self.current_tip(flavor)?;
        let header_tip = self.current_header_tip(flavor)?;

        let mut txn = self.store.begin_write();
        let mut moved = false;
        if ancestor.height < tip.height {
            txn.put_int(
                TABLE_FILTER_TIPS,
                u64::from(flavor.id()),
                &ancestor.serialize(),
                PutFlags::default(),
            )?;
            moved = true;
        }
        if ancestor.height < header_tip.height {
            txn.put_int(
                TABLE_FILTER_HEADER_TIPS,
                u64::from(flavor.id()),
                &ancestor.serialize(),
                PutFlags::default(),
            )?;
            moved = true;
        }
        if moved {
            txn.commit()?;
        }
        Ok(())
    }

    /// Reorg entry point: retract every flavor's tips
    pub fn reset_all_tips(&self, ancestor: &Position) -> Result<(), FilterOracleError> {
        for flavor in &self.flavors {
            self.reset_tips(*flavor, ancestor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{TableKind, TableSpec};
    use tempfile::TempDir;

    pub const TABLES: &[TableSpec] = &[
        TableSpec::new(TABLE_FILTER_TIPS, TableKind::IntegerKey),
        TableSpec::new(TABLE_FILTER_HEADER_TIPS, TableKind::IntegerKey),
        TableSpec::new("filters_basic", TableKind::Plain),
        TableSpec::new("filter_headers_basic", TableKind::Plain),
        TableSpec::new("filters_basic_bch", TableKind::Plain),
        TableSpec::new("filter_headers_basic_bch", TableKind::Plain),
        TableSpec::new("filters_extended", TableKind::Plain),
        TableSpec::new("filter_headers_extended", TableKind::Plain),
    ];

    pub fn open_filters(dir: &TempDir, chain: ChainKind) -> (Arc<Store>, FilterOracle) {
        let store = Arc::new(Store::open(dir.path(), TABLES).unwrap());
        let oracle = FilterOracle::open(
            store.clone(),
            chain,
            vec![FilterFlavor::BasicBip158, FilterFlavor::Extended],
        )
        .unwrap();
        (store, oracle)
    }

    #[test]
    fn test_genesis_seeded_for_each_flavor() {
        let dir = TempDir::new().unwrap();
        let (_store, oracle) = open_filters(&dir, ChainKind::Bitcoin);
        let genesis = genesis_hash(ChainKind::Bitcoin);

        for flavor in [FilterFlavor::BasicBip158, FilterFlavor::Extended] {
            let tip = oracle.current_tip(flavor).unwrap();
            assert_eq!(tip, Position::new(0, genesis));
            assert_eq!(oracle.current_header_tip(flavor).unwrap(), tip);
            assert!(oracle.have_filter(flavor, &genesis).unwrap());
            assert!(oracle.have_filter_header(flavor, &genesis).unwrap());
        }
    }

    #[test]
    fn test_genesis_filter_matches_constants() {
        let dir = TempDir::new().unwrap();
        let (_store, oracle) = open_filters(&dir, ChainKind::Bitcoin);
        let genesis = genesis_hash(ChainKind::Bitcoin);

        let (header_hex, filter_hex) =
            genesis_filter(ChainKind::Bitcoin, FilterFlavor::BasicBip158).unwrap();
        let bytes = oracle
            .load_filter(FilterFlavor::BasicBip158, &genesis)
            .unwrap()
            .unwrap();
        assert_eq!(hex::encode(&bytes), filter_hex);

        let header = oracle
            .load_filter_header(FilterFlavor::BasicBip158, &genesis)
            .unwrap()
            .unwrap();
        assert_eq!(hex::encode(header.as_bytes()), header_hex);

        // The stored hash chains into the stored header
        let hash = oracle
            .load_filter_hash(FilterFlavor::BasicBip158, &genesis)
            .unwrap()
            .unwrap();
        assert_eq!(chain_filter_header(&hash, &Hash::ZERO), header);
    }

    #[test]
    fn test_store_filters_advances_tip() {
        let dir = TempDir::new().unwrap();
        let (_store, oracle) = open_filters(&dir, ChainKind::UnitTest);
        let flavor = FilterFlavor::BasicBip158;

        let block1 = Position::new(1, Hash([1u8; 32]));
        let block2 = Position::new(2, Hash([2u8; 32]));
        oracle
            .store_filters(flavor, &[(block1, vec![0x01, 0xaa]), (block2, vec![0x01, 0xbb])])
            .unwrap();

        assert_eq!(oracle.current_tip(flavor).unwrap(), block2);
        assert_eq!(
            oracle.load_filter(flavor, &block1.hash).unwrap().unwrap(),
            vec![0x01, 0xaa]
        );
    }

    #[test]
    fn test_store_filter_headers_advances_tip() {
        let dir = TempDir::new().unwrap();
        let (_store, oracle) = open_filters(&dir, ChainKind::UnitTest);
        let flavor = FilterFlavor::BasicBip158;

        let genesis_header_tip = oracle.current_header_tip(flavor).unwrap();
        let prev = oracle
            .load_filter_header(flavor, &genesis_header_tip.hash)
            .unwrap()
            .unwrap();

        let position = Position::new(1, Hash([1u8; 32]));
        let filter_hash = Hash([0xabu8; 32]);
        let header = chain_filter_header(&filter_hash, &prev);
        oracle
            .store_filter_headers(flavor, &[(position, filter_hash, header)])
            .unwrap();

        assert_eq!(oracle.current_header_tip(flavor).unwrap(), position);
        assert_eq!(
            oracle.load_filter_header(flavor, &position.hash).unwrap().unwrap(),
            header
        );
        assert_eq!(
            oracle.load_filter_hash(flavor, &position.hash).unwrap().unwrap(),
            filter_hash
        );
    }

    #[test]
    fn test_reset_tips_lowers_but_never_raises() {
        let dir = TempDir::new().unwrap();
        let (_store, oracle) = open_filters(&dir, ChainKind::UnitTest);
        let flavor = FilterFlavor::BasicBip158;

        let positions: Vec<Position> = (1..=5)
            .map(|h| Position::new(h, Hash([h as u8; 32])))
            .collect();
        let rows: Vec<(Position, Vec<u8>)> = positions
            .iter()
            .map(|p| (*p, vec![0x01, p.height as u8]))
            .collect();
        oracle.store_filters(flavor, &rows).unwrap();
        assert_eq!(oracle.current_tip(flavor).unwrap().height, 5);

        let ancestor = positions[1]; // height 2
        oracle.reset_tips(flavor, &ancestor).unwrap();
        assert_eq!(oracle.current_tip(flavor).unwrap(), ancestor);

        // Orphaned rows are retained
        assert!(oracle.have_filter(flavor, &positions[4].hash).unwrap());

        // A later ancestor above the tip does not raise it
        oracle.reset_tips(flavor, &positions[4]).unwrap();
        assert_eq!(oracle.current_tip(flavor).unwrap(), ancestor);
    }

    #[test]
    fn test_reset_all_tips_covers_every_flavor() {
        let dir = TempDir::new().unwrap();
        let (_store, oracle) = open_filters(&dir, ChainKind::UnitTest);

        for flavor in [FilterFlavor::BasicBip158, FilterFlavor::Extended] {
            oracle
                .store_filters(flavor, &[(Position::new(3, Hash([3u8; 32])), vec![0x00])])
                .unwrap();
        }

        let ancestor = Position::new(1, Hash([1u8; 32]));
        oracle.reset_all_tips(&ancestor).unwrap();
        for flavor in [FilterFlavor::BasicBip158, FilterFlavor::Extended] {
            assert_eq!(oracle.current_tip(flavor).unwrap(), ancestor);
        }
    }
}
