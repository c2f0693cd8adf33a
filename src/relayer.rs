//! Relayer
//!
//! Drains the ready queue and submits each mint to the destination chain.
//! Exactly-once minting is enforced by the destination's mintId gate; the
//! in-flight set only keeps this process from submitting the same nonce
//! twice at the same time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::B256;
use chrono::Utc;
use eyre::Result;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapters::AdapterRegistry;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};
use crate::store::AttestationStore;
use crate::types::{Attestation, AttestationKey, AttestationStatus, ChainId};

/// What happened to one ready attestation during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Mint confirmed, attestation marked relayed
    Relayed,
    /// Destination had already minted; marked relayed without a new transaction
    AlreadyProcessed,
    /// Left ready for a later pass
    Deferred,
    /// Moved to failed
    Failed,
    /// Another task holds the nonce, or the attestation is no longer ready
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub relayed: usize,
    pub deferred: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RelayReport {
    fn record(&mut self, outcome: RelayOutcome) {
        match outcome {
            RelayOutcome::Relayed | RelayOutcome::AlreadyProcessed => self.relayed += 1,
            RelayOutcome::Deferred => self.deferred += 1,
            RelayOutcome::Failed => self.failed += 1,
            RelayOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Removes the key from the in-flight set when the relay attempt ends
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<AttestationKey>>,
    key: AttestationKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

pub struct Relayer {
    store: Arc<dyn AttestationStore>,
    adapters: AdapterRegistry,
    retry: RetryConfig,
    poll_interval: Duration,
    in_flight: Mutex<HashSet<AttestationKey>>,
}

impl Relayer {
    pub fn new(
        store: Arc<dyn AttestationStore>,
        adapters: AdapterRegistry,
        retry: RetryConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            adapters,
            retry,
            poll_interval,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, key: AttestationKey) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(key) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            key,
        })
    }

    /// One pass over the ready queue. Each destination chain is drained
    /// oldest first; destinations proceed concurrently.
    pub async fn relay_once(&self) -> BridgeResult<RelayReport> {
        let ready = self.store.list_ready().await?;
        let mut report = RelayReport::default();
        if ready.is_empty() {
            return Ok(report);
        }

        let mut lanes: Vec<(ChainId, Vec<AttestationKey>)> = Vec::new();
        for attestation in &ready {
            match lanes.iter_mut().find(|(dest, _)| *dest == attestation.dest_chain_id) {
                Some((_, keys)) => keys.push(attestation.key()),
                None => lanes.push((attestation.dest_chain_id, vec![attestation.key()])),
            }
        }

        debug!(count = ready.len(), destinations = lanes.len(), "Relaying ready attestations");
        let outcomes = join_all(lanes.iter().map(|(_, keys)| self.relay_lane(keys))).await;
        for outcome in outcomes.into_iter().flatten() {
            report.record(outcome);
        }

        if report.relayed > 0 || report.failed > 0 {
            info!(
                relayed = report.relayed,
                deferred = report.deferred,
                failed = report.failed,
                skipped = report.skipped,
                "Relay pass complete"
            );
        }
        Ok(report)
    }

    async fn relay_lane(&self, keys: &[AttestationKey]) -> Vec<RelayOutcome> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for &key in keys {
            let outcome = match self.relay(key).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(key = %key, error = %e, "Relay failed");
                    metrics::record_error("relayer", e.kind());
                    RelayOutcome::Deferred
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Relay a single attestation if it is ready and not already in flight here
    pub async fn relay(&self, key: AttestationKey) -> BridgeResult<RelayOutcome> {
        let Some(_guard) = self.claim(key) else {
            debug!(key = %key, "Relay already in flight");
            return Ok(RelayOutcome::Skipped);
        };

        // Re-read under the claim; an earlier task may have finished it
        let attestation = self.store.find_by_nonce(key).await?;
        if attestation.status != AttestationStatus::Ready {
            return Ok(RelayOutcome::Skipped);
        }

        let dest = attestation.dest_chain_id;
        let adapter = match self.adapters.get(dest) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(key = %key, dest_chain_id = %dest, "No adapter for destination chain");
                self.store.mark_failed(key, &e.to_string()).await?;
                metrics::record_attestation_failed("unknown_destination");
                return Ok(RelayOutcome::Failed);
            }
        };

        let result = with_retry(&self.retry, |attempt| {
            let adapter = adapter.clone();
            let attestation = &attestation;
            async move {
                debug!(key = %key, attempt, "Submitting mint");
                let result = adapter
                    .mint_from_attestation(attestation, &attestation.signatures)
                    .await;
                self.record_attempt(attestation, &result).await;
                result
            }
        })
        .await;

        match result {
            Ok(receipt) => {
                self.complete(&attestation, receipt.dest_tx_hash).await?;
                info!(
                    key = %key,
                    dest_chain_id = %dest,
                    dest_tx_hash = %receipt.dest_tx_hash,
                    amount = %attestation.amount,
                    "Attestation relayed"
                );
                Ok(RelayOutcome::Relayed)
            }
            Err(BridgeError::AlreadyProcessed) => {
                // Another relayer won the race; the mint exists on chain
                if self.store.find_by_nonce(key).await?.status == AttestationStatus::Relayed {
                    debug!(key = %key, "Already marked relayed by another relayer");
                    return Ok(RelayOutcome::AlreadyProcessed);
                }
                self.complete(&attestation, B256::ZERO).await?;
                info!(key = %key, mint_id = %attestation.mint_id, "Mint already processed, marking relayed");
                Ok(RelayOutcome::AlreadyProcessed)
            }
            Err(BridgeError::InsufficientSignatures { have, need }) => {
                warn!(key = %key, have, need, "Destination rejected mint for insufficient signatures");
                Ok(RelayOutcome::Deferred)
            }
            Err(e) if e.is_retryable() => {
                error!(
                    key = %key,
                    dest_chain_id = %dest,
                    attempts = self.retry.max_attempts,
                    error = %e,
                    "ALERT: relay retries exhausted, marking attestation failed"
                );
                metrics::record_relay_alert(dest);
                self.store
                    .mark_failed(key, &format!("relay retries exhausted: {}", e))
                    .await?;
                metrics::record_attestation_failed("relay_exhausted");
                Ok(RelayOutcome::Failed)
            }
            Err(e) => {
                error!(key = %key, dest_chain_id = %dest, error = %e, "Mint rejected, marking attestation failed");
                self.store.mark_failed(key, &e.to_string()).await?;
                metrics::record_attestation_failed(e.kind());
                Ok(RelayOutcome::Failed)
            }
        }
    }

    async fn record_attempt<T>(&self, attestation: &Attestation, result: &BridgeResult<T>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_relay_attempt(attestation.dest_chain_id, outcome);

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .store
            .record_relay_attempt(attestation.key(), error.as_deref())
            .await
        {
            warn!(key = %attestation.key(), error = %e, "Failed to record relay attempt");
        }
    }

    async fn complete(&self, attestation: &Attestation, dest_tx_hash: B256) -> BridgeResult<()> {
        match self.store.mark_relayed(attestation.key(), dest_tx_hash).await {
            Ok(_) => {}
            // Lost the race to another relayer instance sharing the store
            Err(BridgeError::InvalidTransition {
                from: AttestationStatus::Relayed,
                ..
            }) => return Ok(()),
            Err(e) => return Err(e),
        }
        let latency = attestation
            .ready_at
            .map(|ready_at| (Utc::now() - ready_at).num_milliseconds() as f64 / 1000.0);
        metrics::record_attestation_relayed(attestation.dest_chain_id, latency);
        Ok(())
    }

    /// Poll the ready queue until shutdown
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_attempts = self.retry.max_attempts,
            destinations = ?self.adapters.chain_ids(),
            "Relayer starting poll loop"
        );

        loop {
            tokio::select! {
                result = self.relay_once() => {
                    if let Err(e) = result {
                        error!(error = %e, "Relay pass failed");
                        metrics::record_error("relayer", e.kind());
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping relayer");
                    return Ok(());
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChainAdapter, InMemoryChain};
    use crate::signing::{LocalSigner, SignatureScheme, WatchtowerSet};
    use crate::store::MemoryStore;
    use crate::types::{Amount, ChainAddress, ChainId, NewAttestation};

    const ALICE: ChainAddress = ChainAddress::Evm([0xa1; 20]);
    const BOB: ChainAddress = ChainAddress::Substrate([0xb0; 32]);

    struct Harness {
        relayer: Relayer,
        store: Arc<MemoryStore>,
        etrid: Arc<InMemoryChain>,
        signers: Vec<LocalSigner>,
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    fn harness(max_attempts: u32) -> Harness {
        let signers: Vec<_> = (1..=3u8)
            .map(|n| LocalSigner::from_hex(SignatureScheme::Ed25519, &hex::encode([n; 32])).unwrap())
            .collect();
        let keys = signers
            .iter()
            .enumerate()
            .map(|(i, s)| s.watchtower_key(format!("wt-{}", i)))
            .collect();
        let set = Arc::new(WatchtowerSet::new(2, keys).unwrap());
        let store = Arc::new(MemoryStore::new(set.clone()));
        let etrid = InMemoryChain::new(ChainId::ETRID, ChainAddress::Substrate([0xee; 32]), set);
        let adapters = AdapterRegistry::new().with(Arc::new(etrid.adapter(BOB)));
        let relayer = Relayer::new(
            store.clone(),
            adapters,
            fast_retry(max_attempts),
            Duration::from_millis(5),
        );
        Harness {
            relayer,
            store,
            etrid,
            signers,
        }
    }

    fn payload(nonce: u64, dest: ChainId) -> NewAttestation {
        NewAttestation {
            source_chain_id: ChainId::ETHEREUM,
            dest_chain_id: dest,
            nonce,
            token: ChainAddress::Evm([0x70; 20]),
            recipient: BOB,
            amount: Amount::from(400u128),
            source_tx_hash: B256::repeat_byte(nonce as u8),
        }
    }

    async fn make_ready(h: &Harness, nonce: u64, dest: ChainId) -> Attestation {
        make_ready_from(h, payload(nonce, dest)).await
    }

    async fn make_ready_from(h: &Harness, payload: NewAttestation) -> Attestation {
        let att = h.store.get_or_create(&payload).await.unwrap();
        for (i, signer) in h.signers.iter().enumerate().take(2) {
            let sig = signer.sign(&att.message_hash).unwrap();
            h.store
                .add_signature(att.key(), &format!("wt-{}", i), sig)
                .await
                .unwrap();
        }
        h.store.find_by_nonce(att.key()).await.unwrap()
    }

    #[tokio::test]
    async fn test_relay_once_mints_and_marks_relayed() {
        let h = harness(3);
        let att = make_ready(&h, 0, ChainId::ETRID).await;
        assert_eq!(att.status, AttestationStatus::Ready);

        let report = h.relayer.relay_once().await.unwrap();
        assert_eq!(report.relayed, 1);

        let att = h.store.find_by_nonce(att.key()).await.unwrap();
        assert_eq!(att.status, AttestationStatus::Relayed);
        assert!(att.dest_tx_hash.is_some());
        assert_eq!(att.relay_attempts, 1);

        let adapter = h.etrid.adapter(BOB);
        assert_eq!(adapter.get_balance(&BOB).await.unwrap(), Amount::from(400u128));
        assert!(adapter.is_message_received(&att.message_hash).await.unwrap());

        // nothing left
        assert_eq!(h.relayer.relay_once().await.unwrap(), RelayReport::default());
    }

    #[tokio::test]
    async fn test_already_processed_counts_as_relayed() {
        let h = harness(3);
        let att = make_ready(&h, 0, ChainId::ETRID).await;

        // another relayer instance minted first
        h.etrid
            .adapter(BOB)
            .mint_from_attestation(&att, &att.signatures)
            .await
            .unwrap();

        assert_eq!(h.relayer.relay(att.key()).await.unwrap(), RelayOutcome::AlreadyProcessed);
        let att = h.store.find_by_nonce(att.key()).await.unwrap();
        assert_eq!(att.status, AttestationStatus::Relayed);
        assert_eq!(h.etrid.adapter(BOB).get_balance(&BOB).await.unwrap(), Amount::from(400u128));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness(3);
        let att = make_ready(&h, 0, ChainId::ETRID).await;
        h.etrid.fail_next_submissions(2).await;

        assert_eq!(h.relayer.relay(att.key()).await.unwrap(), RelayOutcome::Relayed);
        let att = h.store.find_by_nonce(att.key()).await.unwrap();
        assert_eq!(att.status, AttestationStatus::Relayed);
        assert_eq!(att.relay_attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed() {
        let h = harness(2);
        let att = make_ready(&h, 0, ChainId::ETRID).await;
        h.etrid.fail_next_submissions(5).await;

        assert_eq!(h.relayer.relay(att.key()).await.unwrap(), RelayOutcome::Failed);
        let att = h.store.find_by_nonce(att.key()).await.unwrap();
        assert_eq!(att.status, AttestationStatus::Failed);
        assert_eq!(att.relay_attempts, 2);
        assert!(att
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("relay retries exhausted"));
        assert_eq!(h.etrid.processed_mint_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_destination_marks_failed() {
        let h = harness(3);
        let att = make_ready(&h, 0, ChainId::POLYGON).await;

        assert_eq!(h.relayer.relay(att.key()).await.unwrap(), RelayOutcome::Failed);
        let att = h.store.find_by_nonce(att.key()).await.unwrap();
        assert_eq!(att.status, AttestationStatus::Failed);
    }

    #[tokio::test]
    async fn test_pending_attestation_is_skipped() {
        let h = harness(3);
        let att = h.store.get_or_create(&payload(0, ChainId::ETRID)).await.unwrap();
        assert_eq!(h.relayer.relay(att.key()).await.unwrap(), RelayOutcome::Skipped);
        assert_eq!(h.etrid.processed_mint_count().await, 0);
    }

    #[tokio::test]
    async fn test_in_flight_claim_is_exclusive() {
        let h = harness(3);
        let key = AttestationKey::new(ChainId::ETHEREUM, 0);
        let guard = h.relayer.claim(key).unwrap();
        assert!(h.relayer.claim(key).is_none());
        assert_eq!(h.relayer.relay(key).await.unwrap(), RelayOutcome::Skipped);
        drop(guard);
        assert!(h.relayer.claim(key).is_some());
    }

    #[tokio::test]
    async fn test_backoff_on_one_destination_does_not_hold_others() {
        let h = harness(3);
        let keys = h
            .signers
            .iter()
            .enumerate()
            .map(|(i, s)| s.watchtower_key(format!("wt-{}", i)))
            .collect();
        let set = Arc::new(WatchtowerSet::new(2, keys).unwrap());
        let eth = InMemoryChain::new(ChainId::ETHEREUM, ChainAddress::Evm([0xee; 20]), set);
        let relayer = Relayer::new(
            h.store.clone(),
            AdapterRegistry::new()
                .with(Arc::new(h.etrid.adapter(BOB)))
                .with(Arc::new(eth.adapter(ALICE))),
            RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_millis(200),
                backoff_multiplier: 1.0,
            },
            Duration::from_millis(5),
        );

        // oldest ready item goes to a destination that fails twice
        let slow = make_ready(&h, 0, ChainId::ETRID).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let mut to_eth = payload(1, ChainId::ETHEREUM);
        to_eth.recipient = ALICE;
        let fast = make_ready_from(&h, to_eth).await;
        h.etrid.fail_next_submissions(2).await;

        let pass = tokio::spawn(async move { relayer.relay_once().await.unwrap() });

        let store = h.store.clone();
        let fast_key = fast.key();
        let relayed_early = tokio::time::timeout(Duration::from_millis(150), async move {
            loop {
                if store.find_by_nonce(fast_key).await.unwrap().status == AttestationStatus::Relayed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(relayed_early.is_ok());
        assert_eq!(
            h.store.find_by_nonce(slow.key()).await.unwrap().status,
            AttestationStatus::Ready
        );

        let report = pass.await.unwrap();
        assert_eq!(report.relayed, 2);
        let slow = h.store.find_by_nonce(slow.key()).await.unwrap();
        assert_eq!(slow.status, AttestationStatus::Relayed);
        assert_eq!(slow.relay_attempts, 3);
        assert_eq!(eth.adapter(ALICE).get_balance(&ALICE).await.unwrap(), Amount::from(400u128));
    }

    #[tokio::test]
    async fn test_concurrent_passes_mint_once() {
        let h = Arc::new(harness(3));
        for nonce in 0..4 {
            make_ready(&h, nonce, ChainId::ETRID).await;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let h = h.clone();
            handles.push(tokio::spawn(async move { h.relayer.relay_once().await.unwrap() }));
        }
        let mut relayed = 0;
        for handle in handles {
            relayed += handle.await.unwrap().relayed;
        }

        assert_eq!(relayed, 4);
        assert_eq!(h.etrid.processed_mint_count().await, 4);
        assert_eq!(
            h.etrid.adapter(BOB).get_balance(&BOB).await.unwrap(),
            Amount::from(1600u128)
        );
    }
}
