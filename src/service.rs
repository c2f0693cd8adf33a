//! Attestation service
//!
//! Turns observed burns into attestations, collects watchtower signatures
//! until the threshold is met, and answers the queries relayers and test
//! harnesses make.
//!
//! State machine per attestation:
//! `pending --(M signatures)--> ready --(destination confirms)--> relayed`,
//! with `pending|ready --(timeout/abort)--> failed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapters::AdapterRegistry;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::retry::wait_for;
use crate::store::{AttestationStore, StoreStats};
use crate::types::{Attestation, AttestationKey, AttestationStatus, BurnEvent, ChainId};
use crate::watchtower::Watchtower;

/// Blocks scanned per `get_burn_events` call during backfill
const BACKFILL_WINDOW: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Poll interval for `wait_for_attestation_ready`
    pub poll_interval: Duration,
    /// Pending attestations older than this count as stuck in stats
    pub stuck_threshold: Duration,
    /// Pending attestations older than this move to failed; `None` disables
    pub pending_timeout: Option<Duration>,
    /// Confirmations required per source chain before a burn is attested
    pub finality_blocks: HashMap<ChainId, u64>,
    /// How far below the finalized head a backfill searches
    pub backfill_lookback_blocks: u64,
}

impl ServiceConfig {
    pub fn finality_for(&self, chain_id: ChainId) -> u64 {
        self.finality_blocks.get(&chain_id).copied().unwrap_or(0)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            stuck_threshold: Duration::from_secs(600),
            pending_timeout: None,
            finality_blocks: HashMap::new(),
            backfill_lookback_blocks: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Health {
    pub status: &'static str,
    /// Milliseconds since the service started
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub attestations: StoreStats,
}

pub struct AttestationService {
    store: Arc<dyn AttestationStore>,
    adapters: AdapterRegistry,
    watchtowers: Vec<Arc<dyn Watchtower>>,
    config: ServiceConfig,
    started_at: Instant,
}

impl AttestationService {
    pub fn new(
        store: Arc<dyn AttestationStore>,
        adapters: AdapterRegistry,
        watchtowers: Vec<Arc<dyn Watchtower>>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            watchtowers,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<dyn AttestationStore> {
        &self.store
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Record a burn and ask every watchtower to sign it
    pub async fn observe_burn(&self, event: &BurnEvent) -> BridgeResult<Attestation> {
        let attestation = self.store.get_or_create(&event.to_payload()).await?;
        metrics::record_burn_observed(event.source_chain_id);
        info!(
            source_chain_id = %event.source_chain_id,
            dest_chain_id = %event.dest_chain_id,
            nonce = event.nonce,
            amount = %event.amount,
            message_hash = %attestation.message_hash,
            "Burn observed"
        );

        if attestation.status != AttestationStatus::Pending {
            return Ok(attestation);
        }
        self.request_signatures(&attestation).await
    }

    /// Ask watchtowers that have not yet signed; each signature is applied
    /// as it arrives. Unreachable watchtowers are logged and skipped.
    pub async fn request_signatures(&self, attestation: &Attestation) -> BridgeResult<Attestation> {
        let key = attestation.key();
        let requests = self
            .watchtowers
            .iter()
            .filter(|wt| !attestation.has_signature_from(wt.id()))
            .map(|wt| async move {
                let signature = wt.sign(attestation).await.map_err(|e| {
                    warn!(key = %key, watchtower = %wt.id(), error = %e, "Watchtower did not sign");
                    metrics::record_error("watchtower", e.kind());
                    e
                })?;
                self.store.add_signature(key, wt.id(), signature).await
            });

        for result in join_all(requests).await {
            if let Err(e) = result {
                debug!(key = %key, error = %e, "Signature request failed");
            }
        }

        self.store.find_by_nonce(key).await
    }

    /// Push-style signature arrival
    pub async fn submit_signature(
        &self,
        key: AttestationKey,
        watchtower_id: &str,
        signature: Bytes,
    ) -> BridgeResult<Attestation> {
        self.store.add_signature(key, watchtower_id, signature).await
    }

    pub async fn get_health(&self) -> Health {
        let status = match self.store.ping().await {
            Ok(()) => "healthy",
            Err(e) => {
                warn!(error = %e, "Store health check failed");
                "unhealthy"
            }
        };
        Health {
            status,
            uptime: self.started_at.elapsed().as_millis() as u64,
        }
    }

    pub async fn get_stats(&self) -> BridgeResult<Stats> {
        let stuck = chrono::Duration::from_std(self.config.stuck_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let stats = self.store.stats(Utc::now() - stuck).await?;
        metrics::set_backlog(&stats);
        Ok(Stats { attestations: stats })
    }

    pub async fn get_attestation_by_nonce(&self, key: AttestationKey) -> BridgeResult<Attestation> {
        self.store.find_by_nonce(key).await
    }

    /// Look up an attestation, scanning the source chain for the burn if unseen
    pub async fn get_or_backfill(&self, key: AttestationKey) -> BridgeResult<Attestation> {
        match self.store.find_by_nonce(key).await {
            Err(BridgeError::NotFound) => self.backfill(key).await,
            other => other,
        }
    }

    /// Find the burn for `key` on its source chain and observe it.
    ///
    /// Scans backwards from the finalized head in fixed windows, at most
    /// `backfill_lookback_blocks` deep. Burns the watcher would still treat
    /// as unfinalized are reported as not found.
    pub async fn backfill(&self, key: AttestationKey) -> BridgeResult<Attestation> {
        let adapter = self.adapters.get(key.source_chain_id)?;
        let head = adapter.get_block_number().await?;
        let finalized = head.saturating_sub(self.config.finality_for(key.source_chain_id));
        if finalized == 0 {
            return Err(BridgeError::NotFound);
        }
        let floor = finalized
            .saturating_sub(self.config.backfill_lookback_blocks.saturating_sub(1))
            .max(1);
        debug!(key = %key, head, finalized, floor, "Backfilling attestation");

        let mut to_block = finalized;
        loop {
            let from_block = to_block.saturating_sub(BACKFILL_WINDOW - 1).max(floor);
            let events = adapter.get_burn_events(from_block, to_block).await?;
            if let Some(event) = events.iter().find(|e| e.nonce == key.nonce) {
                info!(key = %key, block = event.block_number, "Backfilled burn");
                return self.observe_burn(event).await;
            }
            // Nonces rise with block height, so an older nonce means the
            // target is not in the finalized range at all
            if events.iter().any(|e| e.nonce < key.nonce) || from_block <= floor {
                return Err(BridgeError::NotFound);
            }
            to_block = from_block - 1;
        }
    }

    /// Poll until the attestation is ready (or already relayed).
    ///
    /// A missing attestation keeps the wait going; a failed one ends it.
    pub async fn wait_for_attestation_ready(
        &self,
        key: AttestationKey,
        timeout: Duration,
    ) -> BridgeResult<Attestation> {
        wait_for(self.config.poll_interval, timeout, || async move {
            match self.store.find_by_nonce(key).await {
                Ok(a) => match a.status {
                    AttestationStatus::Ready | AttestationStatus::Relayed => Ok(Some(a)),
                    AttestationStatus::Failed => Err(BridgeError::InvalidAttestation(format!(
                        "attestation {} failed: {}",
                        key,
                        a.failure_reason.as_deref().unwrap_or("unknown")
                    ))),
                    AttestationStatus::Pending => Ok(None),
                },
                Err(BridgeError::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Move pending attestations older than the pending timeout to failed.
    /// Returns the number expired; a no-op when no timeout is configured.
    pub async fn expire_stale(&self) -> BridgeResult<usize> {
        let Some(timeout) = self
            .config
            .pending_timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
        else {
            return Ok(0);
        };
        let cutoff = Utc::now() - timeout;

        let mut expired = 0;
        for attestation in self.store.list_pending().await? {
            if attestation.created_at >= cutoff {
                continue;
            }
            let key = attestation.key();
            if self.store.expire_pending(key, "pending timeout").await?.is_none() {
                debug!(key = %key, "Attestation left pending before expiry");
                continue;
            }
            expired += 1;
            metrics::record_attestation_failed("pending_timeout");
            warn!(key = %key, created_at = %attestation.created_at, "Pending attestation expired");
        }
        Ok(expired)
    }

    /// Expire stale attestations, then re-request signatures for the rest
    /// of the pending backlog. Returns the number expired.
    pub async fn sweep_pending(&self) -> BridgeResult<usize> {
        let expired = self.expire_stale().await?;
        for attestation in self.store.list_pending().await? {
            if attestation.signature_count() < self.watchtowers.len() {
                self.request_signatures(&attestation).await?;
            }
        }
        Ok(expired)
    }

    /// Run [`Self::sweep_pending`] every `interval` until shutdown
    pub async fn run_sweeper(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::mpsc::Receiver<()>,
    ) -> eyre::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping sweeper");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_pending().await {
                        warn!(error = %e, "Pending sweep failed");
                        metrics::record_error("sweeper", e.kind());
                    }
                    if let Err(e) = self.get_stats().await {
                        warn!(error = %e, "Failed to refresh backlog metrics");
                    }
                }
            }
        }
    }
}
