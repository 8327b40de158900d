/// Reorganization coordinator
///
/// The header store publishes one event per committed reorg, carrying the
/// last common ancestor of the old and new best chains. Dependent
/// subsystems subscribe; the filter oracle retracts its tips before the
/// next event is processed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::filter_db::FilterOracle;
use crate::types::{ChainKind, Position};

/// Published after a reorg commits, before the next header batch is
/// accepted
#[derive(Clone, Copy, Debug)]
pub struct ReorgEvent {
    pub chain: ChainKind,
    /// Deepest position shared by the old and new best chains
    pub ancestor: Position,
}

/// Buffered broadcast channel for reorg events
pub fn reorg_channel(capacity: usize) -> (broadcast::Sender<ReorgEvent>, broadcast::Receiver<ReorgEvent>) {
    broadcast::channel(capacity)
}

/// Subscribe the filter oracle to reorg events. Tips are retracted one
/// event at a time; the task ends when the channel closes.
pub fn spawn_filter_rollback(
    filters: Arc<FilterOracle>,
    mut events: broadcast::Receiver<ReorgEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    info!(
                        chain = %event.chain,
                        ancestor = %event.ancestor.hash.short(),
                        height = event.ancestor.height,
                        "rolling filter tips back to common ancestor"
                    );
                    // Store writes stay off this task; the await keeps
                    // events processed one at a time
                    let filters = filters.clone();
                    let rolled =
                        tokio::task::spawn_blocking(move || filters.reset_all_tips(&event.ancestor))
                            .await;
                    match rolled {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "failed to reset filter tips after reorg"),
                        Err(e) => warn!(error = %e, "filter rollback task failed"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "reorg subscriber lagged; continuing with latest events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
