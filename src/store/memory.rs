//! In-memory attestation store
//!
//! Each attestation lives behind its own mutex so concurrent signature
//! arrivals for one key are serialized without blocking other keys.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{apply_failed, apply_relayed, apply_signature, check_payload, AttestationStore, StoreStats};
use crate::error::{BridgeError, BridgeResult};
use crate::signing::WatchtowerSet;
use crate::types::{Attestation, AttestationKey, AttestationStatus, ChainId, NewAttestation};

pub struct MemoryStore {
    watchtowers: Arc<WatchtowerSet>,
    attestations: RwLock<HashMap<AttestationKey, Arc<Mutex<Attestation>>>>,
    cursors: RwLock<HashMap<ChainId, u64>>,
}

impl MemoryStore {
    pub fn new(watchtowers: Arc<WatchtowerSet>) -> Self {
        Self {
            watchtowers,
            attestations: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, key: AttestationKey) -> BridgeResult<Arc<Mutex<Attestation>>> {
        self.attestations
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(BridgeError::NotFound)
    }

    async fn snapshot(&self) -> Vec<Attestation> {
        let entries: Vec<_> = self.attestations.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out
    }
}

#[async_trait]
impl AttestationStore for MemoryStore {
    async fn get_or_create(&self, payload: &NewAttestation) -> BridgeResult<Attestation> {
        let key = payload.key();
        if let Ok(entry) = self.entry(key).await {
            let existing = entry.lock().await.clone();
            check_payload(&existing, payload)?;
            return Ok(existing);
        }

        let mut map = self.attestations.write().await;
        // Lost the race to another creator
        if let Some(entry) = map.get(&key) {
            let existing = entry.lock().await.clone();
            check_payload(&existing, payload)?;
            return Ok(existing);
        }

        let attestation = Attestation::new(payload.clone(), Utc::now());
        debug!(key = %key, message_hash = %attestation.message_hash, "Created attestation");
        map.insert(key, Arc::new(Mutex::new(attestation.clone())));
        Ok(attestation)
    }

    async fn add_signature(
        &self,
        key: AttestationKey,
        watchtower_id: &str,
        signature: Bytes,
    ) -> BridgeResult<Attestation> {
        let entry = self.entry(key).await?;
        let mut attestation = entry.lock().await;
        apply_signature(&mut attestation, &self.watchtowers, watchtower_id, signature, Utc::now())?;
        Ok(attestation.clone())
    }

    async fn mark_relayed(&self, key: AttestationKey, dest_tx_hash: B256) -> BridgeResult<Attestation> {
        let entry = self.entry(key).await?;
        let mut attestation = entry.lock().await;
        apply_relayed(&mut attestation, dest_tx_hash, Utc::now())?;
        Ok(attestation.clone())
    }

    async fn mark_failed(&self, key: AttestationKey, reason: &str) -> BridgeResult<Attestation> {
        let entry = self.entry(key).await?;
        let mut attestation = entry.lock().await;
        apply_failed(&mut attestation, reason)?;
        Ok(attestation.clone())
    }

    async fn expire_pending(&self, key: AttestationKey, reason: &str) -> BridgeResult<Option<Attestation>> {
        let entry = self.entry(key).await?;
        let mut attestation = entry.lock().await;
        if attestation.status != AttestationStatus::Pending {
            return Ok(None);
        }
        apply_failed(&mut attestation, reason)?;
        Ok(Some(attestation.clone()))
    }

    async fn record_relay_attempt(
        &self,
        key: AttestationKey,
        error: Option<&str>,
    ) -> BridgeResult<Attestation> {
        let entry = self.entry(key).await?;
        let mut attestation = entry.lock().await;
        attestation.relay_attempts += 1;
        if let Some(error) = error {
            attestation.failure_reason = Some(error.to_string());
        }
        Ok(attestation.clone())
    }

    async fn find_by_nonce(&self, key: AttestationKey) -> BridgeResult<Attestation> {
        let entry = self.entry(key).await?;
        let attestation = entry.lock().await;
        Ok(attestation.clone())
    }

    async fn list_ready(&self) -> BridgeResult<Vec<Attestation>> {
        let mut ready: Vec<_> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|a| a.status == AttestationStatus::Ready)
            .collect();
        ready.sort_by_key(|a| (a.ready_at, a.key()));
        Ok(ready)
    }

    async fn list_pending(&self) -> BridgeResult<Vec<Attestation>> {
        let mut pending: Vec<_> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|a| a.status == AttestationStatus::Pending)
            .collect();
        pending.sort_by_key(|a| (a.created_at, a.key()));
        Ok(pending)
    }

    async fn stats(&self, stuck_before: DateTime<Utc>) -> BridgeResult<StoreStats> {
        let mut stats = StoreStats::default();
        for a in self.snapshot().await {
            stats.total += 1;
            match a.status {
                AttestationStatus::Pending => {
                    stats.pending += 1;
                    if a.created_at < stuck_before {
                        stats.stuck += 1;
                    }
                }
                AttestationStatus::Ready => stats.ready += 1,
                AttestationStatus::Relayed => stats.relayed += 1,
                AttestationStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn last_processed_block(&self, chain_id: ChainId) -> BridgeResult<Option<u64>> {
        Ok(self.cursors.read().await.get(&chain_id).copied())
    }

    async fn set_last_processed_block(&self, chain_id: ChainId, block: u64) -> BridgeResult<()> {
        self.cursors.write().await.insert(chain_id, block);
        Ok(())
    }

    async fn ping(&self) -> BridgeResult<()> {
        Ok(())
    }
}
