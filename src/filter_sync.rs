/// Filter fetch pipeline
///
/// Compares the best-chain tip with each flavor's filter and
/// filter-header tips and produces the next batch of requests. Filter
/// headers lead; filters are only requested up to the verified header
/// tip, so data arrives in ascending-height order and can be checked as
/// it lands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

use crate::filter_db::{FilterOracle, FilterOracleError};
use crate::header_db::OracleError;
use crate::header_oracle::HeaderOracle;
use crate::peer::PeerCommand;
use crate::types::Height;

/// Largest span of one cfheaders/cfilters request
pub const FILTER_BATCH: Height = 1999;

const SYNC_TICK: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum FilterSyncError {
    Headers(OracleError),
    Filters(FilterOracleError),
}

impl std::fmt::Display for FilterSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterSyncError::Headers(e) => write!(f, "filter sync header error: {}", e),
            FilterSyncError::Filters(e) => write!(f, "filter sync filter error: {}", e),
        }
    }
}

impl std::error::Error for FilterSyncError {}

impl From<OracleError> for FilterSyncError {
    fn from(e: OracleError) -> Self {
        FilterSyncError::Headers(e)
    }
}

impl From<FilterOracleError> for FilterSyncError {
    fn from(e: FilterOracleError) -> Self {
        FilterSyncError::Filters(e)
    }
}

pub struct FilterSync {
    headers: Arc<HeaderOracle>,
    filters: Arc<FilterOracle>,
}

impl FilterSync {
    pub fn new(headers: Arc<HeaderOracle>, filters: Arc<FilterOracle>) -> FilterSync {
        FilterSync { headers, filters }
    }

    /// One batched request covering (start, stop], or None when the span
    /// is empty
    fn batch(
        &self,
        from: Height,
        chain_tip: Height,
    ) -> Result<Option<(u32, crate::types::BlockHash)>, FilterSyncError> {
        if from >= chain_tip {
            return Ok(None);
        }
        let start = from + 1;
        let stop_height = chain_tip.min(from + FILTER_BATCH);
        let stop = match self.headers.best_hash(stop_height)? {
            Some(hash) => hash,
            None => return Ok(None),
        };
        Ok(Some((start as u32, stop)))
    }

    /// The requests that would advance each flavor's tips right now
    pub fn next_requests(&self) -> Result<Vec<PeerCommand>, FilterSyncError> {
        let chain_tip = self.headers.best_chain().height;
        let mut out = Vec::new();

        for flavor in self.filters.flavors().iter().copied() {
            let header_tip = self.filters.current_header_tip(flavor)?;
            if let Some((start_height, stop)) = self.batch(header_tip.height, chain_tip)? {
                out.push(PeerCommand::GetCfHeaders {
                    flavor,
                    start_height,
                    stop,
                });
            }

            // Filters trail the verified header tip
            let filter_tip = self.filters.current_tip(flavor)?;
            let ceiling = header_tip.height.min(chain_tip);
            if let Some((start_height, stop)) = self.batch(filter_tip.height, ceiling)? {
                out.push(PeerCommand::GetCfilters {
                    flavor,
                    start_height,
                    stop,
                });
            }
        }

        Ok(out)
    }

    /// Periodically emit whatever requests would make progress, until
    /// the stop signal fires. Requests fan out through the peer
    /// manager's distribution channel.
    pub async fn run(self, requests: mpsc::Sender<PeerCommand>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SYNC_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.next_requests() {
                        Ok(batch) => {
                            for command in batch {
                                trace!(?command, "requesting filter data");
                                if requests.send(command).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "filter sync pass failed"),
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::genesis_hash;
    use crate::filter_db::tests::open_filters;
    use crate::header_db::tests::open_header_db;
    use crate::types::{ChainKind, FilterFlavor, Hash, Position};
    use tempfile::TempDir;

    fn sync_fixture(header_count: usize) -> (FilterSync, Vec<Hash>) {
        let dir = TempDir::new().unwrap();
        let (_store, db) = open_header_db(&dir);
        let oracle = Arc::new(crate::header_oracle::HeaderOracle::new(Arc::new(db)));

        let genesis = genesis_hash(ChainKind::UnitTest);
        let mut hashes = vec![genesis];
        if header_count > 0 {
            let mut prev = genesis;
            let mut headers = Vec::new();
            for height in 1..=header_count as i64 {
                let mut raw = [0u8; 80];
                raw[4..36].copy_from_slice(prev.as_bytes());
                raw[40..48].copy_from_slice(&height.to_le_bytes());
                raw[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
                let header = loop {
                    let header = crate::types::BlockHeader::from_wire(&raw).unwrap();
                    if crate::chainwork::check_proof_of_work(header.hash.as_bytes(), 0x207fffff) {
                        break header;
                    }
                    let nonce = u32::from_le_bytes(raw[76..80].try_into().unwrap()) + 1;
                    raw[76..80].copy_from_slice(&nonce.to_le_bytes());
                };
                prev = header.hash;
                hashes.push(header.hash);
                headers.push(header);
            }
            oracle.add_headers(headers).unwrap();
        }

        let filter_dir = TempDir::new().unwrap();
        let (_fstore, filters) = open_filters(&filter_dir, ChainKind::UnitTest);
        (FilterSync::new(oracle, Arc::new(filters)), hashes)
    }

    #[test]
    fn test_synced_chain_requests_nothing() {
        let (sync, _hashes) = sync_fixture(0);
        assert!(sync.next_requests().unwrap().is_empty());
    }

    #[test]
    fn test_headers_requested_before_filters() {
        let (sync, hashes) = sync_fixture(10);
        let requests = sync.next_requests().unwrap();

        // Both flavors ask for cfheaders 1..=10; no cfilters yet because
        // the header tip is still at genesis
        assert_eq!(requests.len(), 2);
        for request in requests {
            match request {
                PeerCommand::GetCfHeaders {
                    start_height, stop, ..
                } => {
                    assert_eq!(start_height, 1);
                    assert_eq!(stop, hashes[10]);
                }
                other => panic!("unexpected request: {:?}", other),
            }
        }
    }

    #[test]
    fn test_filters_trail_the_header_tip() {
        let (sync, hashes) = sync_fixture(10);

        // Pretend cfheaders arrived through height 6 for one flavor
        let flavor = FilterFlavor::BasicBip158;
        let rows: Vec<(Position, Hash, Hash)> = (1..=6)
            .map(|h| {
                (
                    Position::new(h, hashes[h as usize]),
                    Hash([h as u8; 32]),
                    Hash([h as u8 + 0x80; 32]),
                )
            })
            .collect();
        sync.filters.store_filter_headers(flavor, &rows).unwrap();

        let requests = sync.next_requests().unwrap();
        let mut saw_cfilters = false;
        for request in &requests {
            if let PeerCommand::GetCfilters {
                flavor: f,
                start_height,
                stop,
            } = request
            {
                assert_eq!(*f, flavor);
                assert_eq!(*start_height, 1);
                // Capped at the verified header tip, not the chain tip
                assert_eq!(*stop, hashes[6]);
                saw_cfilters = true;
            }
        }
        assert!(saw_cfilters, "filters must be requested up to the header tip");

        // And cfheaders continue from 7
        assert!(requests.iter().any(|r| matches!(
            r,
            PeerCommand::GetCfHeaders { flavor: f, start_height: 7, .. } if *f == flavor
        )));
    }

    #[test]
    fn test_batch_span_is_capped() {
        let (sync, _hashes) = sync_fixture(0);
        // Span arithmetic only; no requests when nothing is missing
        assert!(sync.batch(5, 5).unwrap().is_none());
        assert!(sync.batch(9, 3).unwrap().is_none());
    }
}
