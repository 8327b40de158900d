/// Content-addressed block body storage
///
/// Full block payloads live in a sequence of fixed-capacity files
/// (`blk00000.dat`, `blk00001.dat`, ...) that are memory-mapped. The
/// global write position and the (block hash -> offset, size) index are
/// persisted through the KV store and committed together, so a crash
/// never leaves an indexed block without bytes.
///
/// Files are sized as a power of two and a block never straddles two
/// files: an allocation that would cross a boundary is rounded up to the
/// start of the next file.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{trace, warn};

use crate::database::{CONFIG_KEY_NEXT_BLOCK_ADDRESS, TABLE_CONFIG};
use crate::store::{PutFlags, Store, StoreError};
use crate::types::{BlockHash, BlockStoragePolicy};

pub const TABLE_BLOCK_INDEX: &str = "block_index";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Default capacity of one blk file
pub const DEFAULT_FILE_CAPACITY: u64 = 8 * TIB;

#[derive(Debug)]
pub enum BlockStoreError {
    /// Empty payload or one that cannot fit in a single file
    InvalidInput,
    /// Mapping or filesystem failure; the backing file may be inconsistent
    Io(std::io::Error),
    Storage(StoreError),
    Corrupt(String),
}

impl fmt::Display for BlockStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStoreError::InvalidInput => write!(f, "invalid block payload"),
            BlockStoreError::Io(e) => write!(f, "block file i/o error: {}", e),
            BlockStoreError::Storage(e) => write!(f, "block index storage error: {}", e),
            BlockStoreError::Corrupt(msg) => write!(f, "block store corrupt: {}", msg),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl From<std::io::Error> for BlockStoreError {
    fn from(e: std::io::Error) -> Self {
        BlockStoreError::Io(e)
    }
}

impl From<StoreError> for BlockStoreError {
    fn from(e: StoreError) -> Self {
        BlockStoreError::Storage(e)
    }
}

/// (file number, offset within file) for a global position
fn get_offset(position: u64, capacity: u64) -> (u64, u64) {
    (position / capacity, position % capacity)
}

fn get_start_position(file: u64, capacity: u64) -> u64 {
    file * capacity
}

/// Number of files needed so the file containing `position` exists
fn get_file_count(position: u64, capacity: u64) -> u64 {
    position / capacity + 1
}

fn file_name(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("blk{:05}.dat", index))
}

/// Index record: offset then size, both little-endian u64
fn encode_index(offset: u64, size: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&offset.to_le_bytes());
    out[8..].copy_from_slice(&size.to_le_bytes());
    out
}

fn decode_index(raw: &[u8]) -> Option<(u64, u64)> {
    if raw.len() != 16 {
        return None;
    }
    let offset = u64::from_le_bytes(raw[..8].try_into().ok()?);
    let size = u64::from_le_bytes(raw[8..].try_into().ok()?);
    Some((offset, size))
}

struct Files {
    maps: Vec<Arc<MmapRaw>>,
    next_position: u64,
}

/// Zero-copy view of a stored block. Holds the mapping alive; the bytes
/// are valid for the lifetime of the view.
pub struct BlockView {
    map: Arc<MmapRaw>,
    offset: usize,
    len: usize,
}

impl BlockView {
    pub fn as_bytes(&self) -> &[u8] {
        // Indexed ranges are written before the index commit and never
        // rewritten with different content, so this aliasing is sound.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(self.offset), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for BlockView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

pub struct BlockStore {
    store: Arc<Store>,
    dir: PathBuf,
    capacity: u64,
    policy: BlockStoragePolicy,
    files: Mutex<Files>,
}

impl BlockStore {
    /// Open the block store rooted at `dir`, restoring the persisted write
    /// position and mapping every file it covers.
    pub fn open(
        store: Arc<Store>,
        dir: &Path,
        capacity: u64,
        policy: BlockStoragePolicy,
    ) -> Result<BlockStore, BlockStoreError> {
        assert!(capacity.is_power_of_two(), "file capacity must be a power of two");
        std::fs::create_dir_all(dir)?;

        let next_position = Self::load_position(&store)?;

        let mut maps = Vec::new();
        let target = get_file_count(next_position, capacity);
        for index in 0..target {
            maps.push(Self::create_or_load(dir, index, capacity)?);
        }

        Ok(BlockStore {
            store,
            dir: dir.to_path_buf(),
            capacity,
            policy,
            files: Mutex::new(Files {
                maps,
                next_position,
            }),
        })
    }

    fn load_position(store: &Store) -> Result<u64, BlockStoreError> {
        match store.get_latest(TABLE_CONFIG, &CONFIG_KEY_NEXT_BLOCK_ADDRESS.to_be_bytes())? {
            Some(raw) if raw.len() == 8 => Ok(u64::from_le_bytes(raw.try_into().unwrap())),
            Some(_) => Err(BlockStoreError::Corrupt(
                "next_block_address has wrong width".to_string(),
            )),
            None => {
                let mut txn = store.begin_write();
                txn.put(
                    TABLE_CONFIG,
                    &CONFIG_KEY_NEXT_BLOCK_ADDRESS.to_be_bytes(),
                    &0u64.to_le_bytes(),
                    PutFlags::default(),
                )?;
                txn.commit()?;
                Ok(0)
            }
        }
    }

    fn create_or_load(dir: &Path, index: u64, capacity: u64) -> Result<Arc<MmapRaw>, BlockStoreError> {
        let path = file_name(dir, index);
        trace!(file = %path.display(), "mapping block file");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        if len != capacity {
            if len != 0 {
                warn!(file = %path.display(), size = len, "block file has incorrect size, re-extending");
            }
            file.set_len(capacity)?;
        }

        let map = MmapOptions::new().map_raw(&file)?;
        Ok(Arc::new(map))
    }

    fn check_file(&self, files: &mut Files, file_index: u64) -> Result<(), BlockStoreError> {
        while (files.maps.len() as u64) < file_index + 1 {
            let next = files.maps.len() as u64;
            files
                .maps
                .push(Self::create_or_load(&self.dir, next, self.capacity)?);
        }
        Ok(())
    }

    pub fn policy(&self) -> BlockStoragePolicy {
        self.policy
    }

    pub fn exists(&self, block: &BlockHash) -> bool {
        matches!(
            self.store.get_latest(TABLE_BLOCK_INDEX, block.as_bytes()),
            Ok(Some(_))
        )
    }

    /// Store a block payload. Re-storing an already-indexed block of the
    /// same size overwrites the same bytes in place and does not advance
    /// the write position.
    pub fn store_block(&self, block: &BlockHash, bytes: &[u8]) -> Result<(), BlockStoreError> {
        if bytes.is_empty() {
            return Err(BlockStoreError::InvalidInput);
        }
        if bytes.len() as u64 > self.capacity {
            return Err(BlockStoreError::InvalidInput);
        }
        if self.policy == BlockStoragePolicy::None {
            return Ok(());
        }

        let size = bytes.len() as u64;
        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let existing = self
            .store
            .get_latest(TABLE_BLOCK_INDEX, block.as_bytes())?
            .and_then(|raw| decode_index(&raw));

        if let Some((offset, stored_size)) = existing {
            if stored_size == size {
                // Idempotent re-store: same bytes, same address
                trace!(block = %block.short(), offset, "replacing existing block");
                self.write_at(&mut files, offset, bytes)?;
                return Ok(());
            }
        }

        let mut position = files.next_position;
        let (start_file, start_offset) = get_offset(position, self.capacity);
        if start_offset + size > self.capacity {
            // Never straddle a file boundary
            position = get_start_position(start_file + 1, self.capacity);
        }

        self.write_at(&mut files, position, bytes)?;

        let next = position + size;
        let mut txn = self.store.begin_write();
        txn.put(
            TABLE_BLOCK_INDEX,
            block.as_bytes(),
            &encode_index(position, size),
            PutFlags::default(),
        )?;
        txn.put(
            TABLE_CONFIG,
            &CONFIG_KEY_NEXT_BLOCK_ADDRESS.to_be_bytes(),
            &next.to_le_bytes(),
            PutFlags::default(),
        )?;
        txn.commit()?;

        files.next_position = next;
        trace!(block = %block.short(), position, size, "stored block");
        Ok(())
    }

    fn write_at(&self, files: &mut Files, position: u64, bytes: &[u8]) -> Result<(), BlockStoreError> {
        let (file_index, offset) = get_offset(position, self.capacity);
        self.check_file(files, file_index)?;
        let map = &files.maps[file_index as usize];

        debug_assert!(offset + bytes.len() as u64 <= self.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                map.as_mut_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Zero-copy read of a stored block
    pub fn load_block(&self, block: &BlockHash) -> Result<Option<BlockView>, BlockStoreError> {
        let index = match self
            .store
            .get_latest(TABLE_BLOCK_INDEX, block.as_bytes())?
        {
            Some(raw) => decode_index(&raw).ok_or_else(|| {
                BlockStoreError::Corrupt(format!("bad index record for {}", block.short()))
            })?,
            None => return Ok(None),
        };

        let (position, size) = index;
        let (file_index, offset) = get_offset(position, self.capacity);

        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.check_file(&mut files, file_index)?;
        let map = files.maps[file_index as usize].clone();

        Ok(Some(BlockView {
            map,
            offset: offset as usize,
            len: size as usize,
        }))
    }
}
