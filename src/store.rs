/// Transactional key-value store
///
/// Named tables over a single RocksDB environment. Writers stage their
/// operations in memory and commit them through one WriteBatch, so either
/// ALL writes succeed together, or NONE do. Readers operate against a
/// snapshot.
///
/// Duplicate-sorted tables (multiple values per key, stored sorted and
/// deduplicated) are realized as composite keys `[key_len][key][value]`
/// with empty cell values, which preserves sorted iteration and gives
/// dedup-on-insert for free.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rocksdb::{Direction as RocksDirection, IteratorMode, Options, WriteBatch, DB};

/// How keys and values of a table are organized
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TableKind {
    Plain,
    /// Fixed-size u64 keys stored big-endian so lexicographic order is
    /// numeric order
    IntegerKey,
    /// Multiple values per key, sorted and deduplicated
    DupSort,
    IntegerKeyDupSort,
}

impl TableKind {
    fn is_dup(&self) -> bool {
        matches!(self, TableKind::DupSort | TableKind::IntegerKeyDupSort)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TableSpec {
    pub name: &'static str,
    pub kind: TableKind,
}

impl TableSpec {
    pub const fn new(name: &'static str, kind: TableKind) -> Self {
        Self { name, kind }
    }
}

#[derive(Debug)]
pub enum StoreError {
    /// Backend reports exhausted space
    StorageFull,
    /// Write-write collision (not produced here; writers serialize)
    TxnConflict,
    MissingTable(String),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::StorageFull => write!(f, "storage full"),
            StoreError::TxnConflict => write!(f, "write transaction conflict"),
            StoreError::MissingTable(name) => write!(f, "table not found: {}", name),
            StoreError::Backend(msg) => write!(f, "storage backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

fn map_backend_error(err: rocksdb::Error) -> StoreError {
    let msg = err.to_string();
    if msg.contains("No space left") || (msg.contains("space") && msg.contains("full")) {
        StoreError::StorageFull
    } else {
        StoreError::Backend(msg)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PutOutcome {
    Written,
    /// The key already existed and NO_OVERWRITE was requested
    Exists,
}

#[derive(Clone, Copy, Default)]
pub struct PutFlags {
    pub no_overwrite: bool,
    /// Advisory: caller promises keys arrive in sorted order
    pub append: bool,
}

impl PutFlags {
    pub const NO_OVERWRITE: PutFlags = PutFlags {
        no_overwrite: true,
        append: false,
    };
}

/// Big-endian u64 table key
pub fn int_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

fn compose_dup(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

fn dup_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn decompose_dup(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    if raw.len() < 4 {
        return None;
    }
    let key_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + key_len {
        return None;
    }
    Some((&raw[4..4 + key_len], &raw[4 + key_len..]))
}

/// A single on-disk environment holding every named table
pub struct Store {
    db: Arc<DB>,
    tables: HashMap<&'static str, TableKind>,
    write_gate: Mutex<()>,
}

impl Store {
    /// Open (creating as needed) the environment at `path` with the given
    /// table set. Tables not yet present are created.
    pub fn open(path: &Path, specs: &[TableSpec]) -> Result<Store, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let names: Vec<&str> = specs.iter().map(|s| s.name).collect();
        let db = DB::open_cf(&opts, path, &names).map_err(map_backend_error)?;

        let tables = specs.iter().map(|s| (s.name, s.kind)).collect();

        Ok(Store {
            db: Arc::new(db),
            tables,
            write_gate: Mutex::new(()),
        })
    }

    fn kind(&self, table: &str) -> Result<TableKind, StoreError> {
        self.tables
            .get(table)
            .copied()
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn cf(&self, table: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    /// Begin a read transaction (consistent snapshot)
    pub fn begin_read(&self) -> ReadTxn<'_> {
        ReadTxn {
            store: self,
            snapshot: self.db.snapshot(),
        }
    }

    /// Begin a write transaction. Writers serialize: a second writer blocks
    /// here until the first commits or rolls back.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        let guard = self
            .write_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        WriteTxn {
            store: self,
            _guard: Some(guard),
            overlay: HashMap::new(),
            committed: false,
        }
    }

    /// Read the latest committed value outside any transaction
    pub fn get_latest(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let kind = self.kind(table)?;
        let cf = self.cf(table)?;
        let raw_key = match kind {
            TableKind::Plain | TableKind::IntegerKey => key.to_vec(),
            TableKind::DupSort | TableKind::IntegerKeyDupSort => {
                // For dup tables, "get" means "first value for key"
                return Ok(self.get_dup_latest(table, key)?.into_iter().next());
            }
        };
        self.db
            .get_cf(cf, &raw_key)
            .map_err(map_backend_error)
    }

    fn get_dup_latest(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(table)?;
        let prefix = dup_prefix(key);
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, RocksDirection::Forward));
        for item in iter {
            let (raw, _) = item.map_err(map_backend_error)?;
            if !raw.starts_with(&prefix) {
                break;
            }
            if let Some((_, value)) = decompose_dup(&raw) {
                out.push(value.to_vec());
            }
        }
        Ok(out)
    }
}

/// Snapshot-backed read transaction
pub struct ReadTxn<'a> {
    store: &'a Store,
    snapshot: rocksdb::Snapshot<'a>,
}

impl<'a> ReadTxn<'a> {
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let kind = self.store.kind(table)?;
        let cf = self.store.cf(table)?;
        match kind {
            TableKind::Plain | TableKind::IntegerKey => self
                .snapshot
                .get_cf(cf, key)
                .map_err(map_backend_error),
            TableKind::DupSort | TableKind::IntegerKeyDupSort => {
                Ok(self.get_dup(table, key)?.into_iter().next())
            }
        }
    }

    pub fn get_int(&self, table: &str, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(table, &int_key(key))
    }

    pub fn exists(&self, table: &str, key: &[u8]) -> Result<bool, StoreError> {
        match self.store.kind(table)? {
            TableKind::Plain | TableKind::IntegerKey => Ok(self.get(table, key)?.is_some()),
            TableKind::DupSort | TableKind::IntegerKeyDupSort => {
                Ok(!self.get_dup(table, key)?.is_empty())
            }
        }
    }

    /// All values stored under `key` in a duplicate-sorted table, in
    /// sorted order
    pub fn get_dup(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.store.cf(table)?;
        let prefix = dup_prefix(key);
        let mut out = Vec::new();
        let iter = self
            .snapshot
            .iterator_cf(cf, IteratorMode::From(&prefix, RocksDirection::Forward));
        for item in iter {
            let (raw, _) = item.map_err(map_backend_error)?;
            if !raw.starts_with(&prefix) {
                break;
            }
            if let Some((_, value)) = decompose_dup(&raw) {
                out.push(value.to_vec());
            }
        }
        Ok(out)
    }

    /// Walk every entry of a table. For duplicate-sorted tables the
    /// callback receives each (key, value) pairing. Return false from the
    /// callback to stop early.
    pub fn iterate<F>(&self, table: &str, direction: Direction, mut callback: F) -> Result<(), StoreError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let kind = self.store.kind(table)?;
        let cf = self.store.cf(table)?;
        let mode = match direction {
            Direction::Forward => IteratorMode::Start,
            Direction::Backward => IteratorMode::End,
        };
        let iter = self.snapshot.iterator_cf(cf, mode);
        for item in iter {
            let (raw_key, raw_value) = item.map_err(map_backend_error)?;
            let keep_going = if kind.is_dup() {
                match decompose_dup(&raw_key) {
                    Some((key, value)) => callback(key, value),
                    None => true,
                }
            } else {
                callback(&raw_key, &raw_value)
            };
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}

/// Staged write transaction. Nothing reaches disk until `commit`;
/// dropping the transaction rolls everything back.
pub struct WriteTxn<'a> {
    store: &'a Store,
    _guard: Option<MutexGuard<'a, ()>>,
    /// raw storage key -> Some(value) for puts, None for deletes
    overlay: HashMap<&'static str, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    committed: bool,
}

impl<'a> WriteTxn<'a> {
    fn table_name(&self, table: &str) -> Result<&'static str, StoreError> {
        self.store
            .tables
            .get_key_value(table)
            .map(|(name, _)| *name)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    pub fn put(
        &mut self,
        table: &str,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<PutOutcome, StoreError> {
        let kind = self.store.kind(table)?;
        let name = self.table_name(table)?;
        let raw_key = if kind.is_dup() {
            compose_dup(key, value)
        } else {
            key.to_vec()
        };

        if flags.no_overwrite && self.raw_exists(table, &raw_key)? {
            return Ok(PutOutcome::Exists);
        }

        let cell = if kind.is_dup() { Vec::new() } else { value.to_vec() };
        self.overlay
            .entry(name)
            .or_default()
            .insert(raw_key, Some(cell));
        Ok(PutOutcome::Written)
    }

    pub fn put_int(
        &mut self,
        table: &str,
        key: u64,
        value: &[u8],
        flags: PutFlags,
    ) -> Result<PutOutcome, StoreError> {
        self.put(table, &int_key(key), value, flags)
    }

    /// Delete a key. For duplicate-sorted tables this removes every value
    /// stored under the key.
    pub fn delete(&mut self, table: &str, key: &[u8]) -> Result<(), StoreError> {
        let kind = self.store.kind(table)?;
        let name = self.table_name(table)?;
        if kind.is_dup() {
            let prefix = dup_prefix(key);
            // committed pairings
            for value in self.store.get_dup_latest(table, key)? {
                let raw = compose_dup(key, &value);
                self.overlay.entry(name).or_default().insert(raw, None);
            }
            // staged pairings
            let staged: Vec<Vec<u8>> = self
                .overlay
                .get(name)
                .map(|map| {
                    map.range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .filter(|(_, v)| v.is_some())
                        .map(|(k, _)| k.clone())
                        .collect()
                })
                .unwrap_or_default();
            for raw in staged {
                self.overlay.entry(name).or_default().insert(raw, None);
            }
        } else {
            self.overlay
                .entry(name)
                .or_default()
                .insert(key.to_vec(), None);
        }
        Ok(())
    }

    pub fn delete_int(&mut self, table: &str, key: u64) -> Result<(), StoreError> {
        self.delete(table, &int_key(key))
    }

    /// Delete one specific (key, value) pairing from a duplicate-sorted
    /// table
    pub fn delete_pair(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let kind = self.store.kind(table)?;
        if !kind.is_dup() {
            return self.delete(table, key);
        }
        let name = self.table_name(table)?;
        let raw = compose_dup(key, value);
        self.overlay.entry(name).or_default().insert(raw, None);
        Ok(())
    }

    fn raw_exists(&self, table: &str, raw_key: &[u8]) -> Result<bool, StoreError> {
        if let Some(map) = self.overlay.get(table) {
            if let Some(entry) = map.get(raw_key) {
                return Ok(entry.is_some());
            }
        }
        let cf = self.store.cf(table)?;
        Ok(self
            .store
            .db
            .get_cf(cf, raw_key)
            .map_err(map_backend_error)?
            .is_some())
    }

    /// Read through the staged state: staged values win over committed
    /// ones
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let kind = self.store.kind(table)?;
        if kind.is_dup() {
            return Ok(self.get_dup(table, key)?.into_iter().next());
        }
        if let Some(map) = self.overlay.get(table) {
            if let Some(entry) = map.get(key) {
                return Ok(entry.clone());
            }
        }
        let cf = self.store.cf(table)?;
        self.store.db.get_cf(cf, key).map_err(map_backend_error)
    }

    pub fn get_int(&self, table: &str, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(table, &int_key(key))
    }

    pub fn exists(&self, table: &str, key: &[u8]) -> Result<bool, StoreError> {
        let kind = self.store.kind(table)?;
        if kind.is_dup() {
            Ok(!self.get_dup(table, key)?.is_empty())
        } else {
            Ok(self.get(table, key)?.is_some())
        }
    }

    /// All values under `key` in a dup table, merging staged and committed
    /// state, sorted and deduplicated
    pub fn get_dup(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let name = self.table_name(table)?;
        let prefix = dup_prefix(key);
        let mut merged: BTreeMap<Vec<u8>, bool> = BTreeMap::new();

        for value in self.store.get_dup_latest(table, key)? {
            merged.insert(value, true);
        }
        if let Some(map) = self.overlay.get(name) {
            for (raw, entry) in map.range(prefix.clone()..) {
                if !raw.starts_with(&prefix) {
                    break;
                }
                if let Some((_, value)) = decompose_dup(raw) {
                    merged.insert(value.to_vec(), entry.is_some());
                }
            }
        }

        Ok(merged
            .into_iter()
            .filter(|(_, present)| *present)
            .map(|(value, _)| value)
            .collect())
    }

    /// Begin a nested transaction inheriting this transaction's staged
    /// state. The parent must not be mutated while the child is alive;
    /// `commit_into` folds the child back, `drop` discards it.
    pub fn nested(&self) -> WriteTxn<'a> {
        WriteTxn {
            store: self.store,
            _guard: None,
            overlay: self.overlay.clone(),
            committed: false,
        }
    }

    /// Fold a nested transaction's staged state into the parent; the
    /// child's writes become part of the parent's atomic commit.
    pub fn commit_into(mut self, parent: &mut WriteTxn<'a>) {
        parent.overlay = std::mem::take(&mut self.overlay);
        self.committed = true;
    }

    /// Atomically apply every staged operation
    pub fn commit(mut self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for (table, map) in &self.overlay {
            let cf = self.store.cf(table)?;
            for (raw_key, entry) in map {
                match entry {
                    Some(value) => batch.put_cf(cf, raw_key, value),
                    None => batch.delete_cf(cf, raw_key),
                }
            }
        }
        self.store.db.write(batch).map_err(map_backend_error)?;
        self.committed = true;
        Ok(())
    }

    /// Discard every staged operation
    pub fn abort(self) {
        // Drop impl handles the rest
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.values().all(|map| map.is_empty())
    }
}

impl<'a> Drop for WriteTxn<'a> {
    fn drop(&mut self) {
        if !self.committed {
            self.overlay.clear();
        }
    }
}
