//! Attestation store
//!
//! Durable record of every attestation keyed by `(source_chain_id, nonce)`.
//! Signature additions for one key are serialized by the backend (per-key
//! lock in memory, row lock in Postgres); different keys proceed in parallel.

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::signing::WatchtowerSet;
use crate::types::{
    Attestation, AttestationKey, AttestationStatus, ChainId, NewAttestation, SignatureEntry,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Attestation counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: u64,
    pub pending: u64,
    pub ready: u64,
    pub relayed: u64,
    pub failed: u64,
    /// Pending attestations created before the stuck cutoff
    pub stuck: u64,
}

#[async_trait]
pub trait AttestationStore: Send + Sync {
    /// Return the attestation for `payload.key()`, creating it as `pending` if absent.
    ///
    /// A stored attestation whose payload differs is a data-integrity violation
    /// and fails with [`BridgeError::PayloadMismatch`].
    async fn get_or_create(&self, payload: &NewAttestation) -> BridgeResult<Attestation>;

    /// Verify and record a watchtower signature, flipping to `ready` at threshold
    async fn add_signature(
        &self,
        key: AttestationKey,
        watchtower_id: &str,
        signature: Bytes,
    ) -> BridgeResult<Attestation>;

    async fn mark_relayed(&self, key: AttestationKey, dest_tx_hash: B256) -> BridgeResult<Attestation>;

    async fn mark_failed(&self, key: AttestationKey, reason: &str) -> BridgeResult<Attestation>;

    /// Fail the attestation only while it is still `pending`, under the same
    /// lock that serializes signatures. `None` means it had already moved on.
    async fn expire_pending(&self, key: AttestationKey, reason: &str) -> BridgeResult<Option<Attestation>>;

    /// Count a mint submission; `error` becomes the latest failure reason
    async fn record_relay_attempt(
        &self,
        key: AttestationKey,
        error: Option<&str>,
    ) -> BridgeResult<Attestation>;

    async fn find_by_nonce(&self, key: AttestationKey) -> BridgeResult<Attestation>;

    /// Ready attestations ordered by `ready_at` ascending
    async fn list_ready(&self) -> BridgeResult<Vec<Attestation>>;

    /// Pending attestations ordered by `created_at` ascending
    async fn list_pending(&self) -> BridgeResult<Vec<Attestation>>;

    async fn stats(&self, stuck_before: DateTime<Utc>) -> BridgeResult<StoreStats>;

    async fn last_processed_block(&self, chain_id: ChainId) -> BridgeResult<Option<u64>>;

    async fn set_last_processed_block(&self, chain_id: ChainId, block: u64) -> BridgeResult<()>;

    /// Cheap liveness check used by `/health`
    async fn ping(&self) -> BridgeResult<()>;
}

/// Reject a re-submitted payload that differs from the stored attestation
pub(crate) fn check_payload(existing: &Attestation, payload: &NewAttestation) -> BridgeResult<()> {
    if existing.payload() != *payload {
        error!(
            key = %existing.key(),
            stored_hash = %existing.message_hash,
            submitted_hash = %payload.message_hash(),
            "Payload mismatch for existing attestation"
        );
        metrics::record_integrity_violation("payload_mismatch");
        return Err(BridgeError::PayloadMismatch(existing.key().to_string()));
    }
    Ok(())
}

/// Compare-and-append one signature. Returns whether the attestation changed.
///
/// Callers must hold the per-key lock (or row lock) around this call.
pub(crate) fn apply_signature(
    attestation: &mut Attestation,
    watchtowers: &WatchtowerSet,
    watchtower_id: &str,
    signature: Bytes,
    now: DateTime<Utc>,
) -> BridgeResult<bool> {
    if let Err(e) = watchtowers.verify(&attestation.message_hash, watchtower_id, &signature) {
        warn!(
            key = %attestation.key(),
            watchtower = %watchtower_id,
            error = %e,
            "Rejected watchtower signature"
        );
        metrics::record_signature_rejected(watchtower_id, e.kind());
        return Err(e);
    }

    if attestation.has_signature_from(watchtower_id) {
        return Ok(false);
    }

    attestation.signatures.push(SignatureEntry {
        watchtower_id: watchtower_id.to_string(),
        signature,
        signed_at: now,
    });
    metrics::record_signature_accepted(watchtower_id);

    if attestation.status == AttestationStatus::Pending
        && watchtowers.has_threshold(&attestation.message_hash, &attestation.signatures)
    {
        attestation.transition(AttestationStatus::Ready)?;
        attestation.ready_at = Some(now);
        metrics::record_attestation_ready(attestation.source_chain_id);
        info!(
            key = %attestation.key(),
            message_hash = %attestation.message_hash,
            signatures = attestation.signatures.len(),
            threshold = watchtowers.threshold(),
            "Attestation ready"
        );
    }

    Ok(true)
}

pub(crate) fn apply_relayed(
    attestation: &mut Attestation,
    dest_tx_hash: B256,
    now: DateTime<Utc>,
) -> BridgeResult<()> {
    transition_or_report(attestation, AttestationStatus::Relayed)?;
    attestation.relayed_at = Some(now);
    attestation.dest_tx_hash = Some(dest_tx_hash);
    Ok(())
}

pub(crate) fn apply_failed(attestation: &mut Attestation, reason: &str) -> BridgeResult<()> {
    transition_or_report(attestation, AttestationStatus::Failed)?;
    attestation.failure_reason = Some(reason.to_string());
    Ok(())
}

fn transition_or_report(attestation: &mut Attestation, next: AttestationStatus) -> BridgeResult<()> {
    attestation.transition(next).inspect_err(|e| {
        error!(key = %attestation.key(), error = %e, "Rejected status transition");
        metrics::record_integrity_violation("invalid_transition");
    })
}
