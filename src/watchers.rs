//! Source chain watchers
//!
//! One long-lived task per enabled source chain. Each pass reads the chain's
//! cursor, scans finalized blocks for burn events and hands them to the
//! attestation service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapters::ChainAdapter;
use crate::error::BridgeResult;
use crate::metrics;
use crate::service::AttestationService;
use crate::types::ChainId;

/// Largest block range requested from an adapter in one call
const MAX_BLOCK_RANGE: u64 = 2_000;

pub struct ChainWatcher {
    adapter: Arc<dyn ChainAdapter>,
    service: Arc<AttestationService>,
    finality_blocks: u64,
    poll_interval: Duration,
}

impl ChainWatcher {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        service: Arc<AttestationService>,
        finality_blocks: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            adapter,
            service,
            finality_blocks,
            poll_interval,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.adapter.chain_id()
    }

    /// Run the watcher loop
    pub async fn run(&self) -> Result<()> {
        info!(
            chain = self.chain_id().name(),
            chain_id = %self.chain_id(),
            finality_blocks = self.finality_blocks,
            "Starting chain watcher"
        );

        loop {
            if let Err(e) = self.poll_once().await {
                warn!(chain_id = %self.chain_id(), error = %e, "Watcher pass failed");
                metrics::record_error("watcher", e.kind());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Scan the next finalized block range. Returns the number of burns observed.
    pub async fn poll_once(&self) -> BridgeResult<usize> {
        let chain_id = self.chain_id();
        let store = self.service.store();

        let last_block = store.last_processed_block(chain_id).await?.unwrap_or(0);
        let head = self.adapter.get_block_number().await?;
        let finalized = head.saturating_sub(self.finality_blocks);

        if finalized <= last_block {
            return Ok(0);
        }

        let from_block = last_block + 1;
        let to_block = finalized.min(last_block + MAX_BLOCK_RANGE);
        debug!(chain_id = %chain_id, from_block, to_block, "Processing blocks");

        let events = self.adapter.get_burn_events(from_block, to_block).await?;
        let mut observed = 0;
        for event in &events {
            match self.service.observe_burn(event).await {
                Ok(_) => observed += 1,
                // Permanent for this event; the stored attestation stays as is
                Err(e) if e.is_integrity_violation() => {
                    error!(
                        chain_id = %chain_id,
                        nonce = event.nonce,
                        tx_hash = %event.tx_hash,
                        block = event.block_number,
                        error = %e,
                        "Skipping burn event that conflicts with stored attestation"
                    );
                    metrics::record_error("watcher", e.kind());
                }
                Err(e) => return Err(e),
            }
        }

        store.set_last_processed_block(chain_id, to_block).await?;
        metrics::record_block_processed(chain_id, to_block);

        if !events.is_empty() {
            info!(chain_id = %chain_id, from_block, to_block, burns = observed, "Processed burn events");
        }
        Ok(observed)
    }
}

/// Manages the watchers for all source chains
pub struct WatcherManager {
    watchers: Vec<ChainWatcher>,
}

impl WatcherManager {
    pub fn new(watchers: Vec<ChainWatcher>) -> Self {
        let mut seen = HashMap::new();
        for watcher in &watchers {
            *seen.entry(watcher.chain_id()).or_insert(0u32) += 1;
        }
        for (chain_id, count) in &seen {
            if *count > 1 {
                warn!(chain_id = %chain_id, count, "Duplicate watcher configured for chain");
            }
        }
        info!(watchers = watchers.len(), "Watcher manager created");
        Self { watchers }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Run all watchers concurrently
    /// Returns when any watcher fails or shutdown signal received
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        if self.watchers.is_empty() {
            warn!("No source chains enabled; watchers idle until shutdown");
            shutdown.recv().await;
            return Ok(());
        }

        let mut join_set = tokio::task::JoinSet::new();
        for watcher in self.watchers {
            join_set.spawn(async move { watcher.run().await });
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A watcher exited unexpectedly without error");
                        Err(eyre::eyre!("watcher exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A watcher stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A watcher task panicked: {:?}", e);
                        Err(eyre::eyre!("watcher task panicked: {}", e))
                    }
                    None => {
                        error!("All watcher tasks exited unexpectedly");
                        Err(eyre::eyre!("all watcher tasks exited unexpectedly"))
                    }
                }
            }
        }
    }
}
