/// Node assembly
///
/// Wires the chain database, the header oracle, the reorg coordinator's
/// filter-rollback subscriber, and the peer manager into one running
/// unit. The node never terminates the process; permanent failures
/// surface as a single fatal log line and an error from `start`.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::block_oracle::{BlockOracle, DEFAULT_CACHE_LIMIT};
use crate::config::CoreConfig;
use crate::constants::builtin_checkpoint;
use crate::database::{Database, DatabaseConfig, DatabaseError};
use crate::filter_sync::FilterSync;
use crate::header_oracle::HeaderOracle;
use crate::peer::{PeerCommand, PeerContext};
use crate::peer_manager::{PeerManager, PeerManagerConfig};
use crate::reorg::{reorg_channel, spawn_filter_rollback};
use crate::telemetry::{init_tracing, TelemetryConfig};

pub struct Node {
    database: Arc<Database>,
    headers: Arc<HeaderOracle>,
    blocks: Arc<BlockOracle>,
    requests: mpsc::Sender<PeerCommand>,
    stop_tx: watch::Sender<bool>,
    manager_task: tokio::task::JoinHandle<()>,
    filter_task: tokio::task::JoinHandle<()>,
    sync_task: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Open the database and launch the peer machinery. Must run inside
    /// a tokio runtime.
    pub fn start(config: &CoreConfig) -> Result<Node, DatabaseError> {
        // A subscriber installed by the embedding application wins
        if let Err(e) = init_tracing(TelemetryConfig::default()) {
            eprintln!("logging setup failed: {}", e);
        }

        let (reorg_tx, reorg_rx) = reorg_channel(64);

        let db_config = DatabaseConfig {
            block_policy: config.block_policy,
            ..DatabaseConfig::new(config.datadir.clone(), config.chain)
        };
        let database = match Database::open(&db_config, reorg_tx) {
            Ok(database) => Arc::new(database),
            Err(e) => {
                error!(error = %e, "fatal: cannot open chain database");
                return Err(e);
            }
        };

        let headers = Arc::new(HeaderOracle::new(database.headers.clone()));

        if let Some((height, hash)) = builtin_checkpoint(config.chain) {
            // Refused (false) when a previous run already recorded one
            if headers.add_checkpoint(height, hash)? {
                info!(
                    chain = %config.chain,
                    height,
                    hash = %hash.short(),
                    "applied built-in checkpoint"
                );
            }
        }

        let filter_task = spawn_filter_rollback(database.filters.clone(), reorg_rx);
        let blocks = Arc::new(BlockOracle::new(database.blocks.clone(), DEFAULT_CACHE_LIMIT));

        let context = PeerContext {
            headers: headers.clone(),
            filters: database.filters.clone(),
            blocks: blocks.clone(),
            address_book: database.peers.clone(),
        };
        let manager = PeerManager::new(
            context,
            PeerManagerConfig {
                chain: config.chain,
                target_peer_count: config.target_peer_count,
                seed_node: config.seed_node.clone(),
            },
        );
        let requests = manager.request_sender();

        let (stop_tx, stop_rx) = watch::channel(false);
        let manager_task = tokio::spawn(manager.run(stop_rx));

        let filter_sync = FilterSync::new(headers.clone(), database.filters.clone());
        let sync_task = tokio::spawn(filter_sync.run(requests.clone(), stop_tx.subscribe()));

        info!(chain = %config.chain, "node started");
        Ok(Node {
            database,
            headers,
            blocks,
            requests,
            stop_tx,
            manager_task,
            filter_task,
            sync_task,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn header_oracle(&self) -> &Arc<HeaderOracle> {
        &self.headers
    }

    pub fn block_oracle(&self) -> &Arc<BlockOracle> {
        &self.blocks
    }

    /// Enqueue a request for distribution to every connected peer
    pub async fn request(&self, command: PeerCommand) -> bool {
        self.requests.send(command).await.is_ok()
    }

    /// Cooperative shutdown: stops the peer manager (which winds down
    /// every peer), then the filter-rollback subscriber.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.sync_task.await;
        let _ = self.manager_task.await;

        // The reorg sender lives in the database; dropping our handles
        // closes the subscriber's channel unless a caller still holds a
        // database clone, so give the task a deadline
        drop(self.headers);
        drop(self.database);
        let mut filter_task = self.filter_task;
        if tokio::time::timeout(std::time::Duration::from_secs(1), &mut filter_task)
            .await
            .is_err()
        {
            filter_task.abort();
        }
        info!("node stopped");
    }
}
