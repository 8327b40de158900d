/// Block oracle
///
/// Front-end for block bodies: a bounded in-memory cache over the file
/// store, plus pending-request futures for blocks that have not arrived
/// yet. Readers that miss both layers receive a promise that resolves
/// when a peer delivers the block.
///
/// The cache evicts in arrival order once it reaches its limit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use crate::blockstore::{BlockStore, BlockStoreError};
use crate::types::{BlockHash, BlockStoragePolicy};

/// Default number of blocks held in memory
pub const DEFAULT_CACHE_LIMIT: usize = 16;

struct MemCache {
    limit: usize,
    queue: VecDeque<BlockHash>,
    index: HashMap<BlockHash, Arc<Vec<u8>>>,
}

impl MemCache {
    fn new(limit: usize) -> MemCache {
        MemCache {
            limit,
            queue: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    fn find(&self, id: &BlockHash) -> Option<Arc<Vec<u8>>> {
        self.index.get(id).cloned()
    }

    fn push(&mut self, id: BlockHash, bytes: Arc<Vec<u8>>) {
        if self.index.insert(id, bytes).is_none() {
            self.queue.push_back(id);
        }
        while self.queue.len() > self.limit {
            if let Some(evicted) = self.queue.pop_front() {
                self.index.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
    }
}

/// Resolution of a block lookup
pub enum BlockRequest {
    /// The block is available now
    Ready(Arc<Vec<u8>>),
    /// The block is not known yet; the receiver resolves when it arrives
    Pending(oneshot::Receiver<Arc<Vec<u8>>>),
}

pub struct BlockOracle {
    store: Arc<BlockStore>,
    cache: Mutex<MemCache>,
    pending: Mutex<HashMap<BlockHash, Vec<oneshot::Sender<Arc<Vec<u8>>>>>>,
}

impl BlockOracle {
    pub fn new(store: Arc<BlockStore>, cache_limit: usize) -> BlockOracle {
        BlockOracle {
            store,
            cache: Mutex::new(MemCache::new(cache_limit)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> BlockStoragePolicy {
        self.store.policy()
    }

    pub fn file_store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// True when the block is resolvable without a network round trip
    pub fn have(&self, id: &BlockHash) -> bool {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .find(id)
            .is_some();
        cached || self.store.exists(id)
    }

    /// Look a block up: memory first, then the file store, otherwise a
    /// pending promise the next `submit` for this hash resolves.
    pub fn load(&self, id: &BlockHash) -> Result<BlockRequest, BlockStoreError> {
        if let Some(bytes) = self
            .cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .find(id)
        {
            return Ok(BlockRequest::Ready(bytes));
        }

        if let Some(view) = self.store.load_block(id)? {
            let bytes = Arc::new(view.as_bytes().to_vec());
            self.cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(*id, bytes.clone());
            return Ok(BlockRequest::Ready(bytes));
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(*id)
            .or_default()
            .push(tx);
        trace!(block = %id.short(), "block pending delivery");
        Ok(BlockRequest::Pending(rx))
    }

    /// Accept a block body from the network: persist it per policy,
    /// cache it, and resolve every waiter.
    pub fn submit(&self, id: &BlockHash, bytes: &[u8]) -> Result<(), BlockStoreError> {
        self.store.store_block(id, bytes)?;

        let shared = Arc::new(bytes.to_vec());
        if self.policy() != BlockStoragePolicy::None {
            self.cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(*id, shared.clone());
        }

        let waiters = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(shared.clone());
            }
        }
        Ok(())
    }

    /// Drop every cached block (pending promises are unaffected)
    pub fn flush_cache(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
