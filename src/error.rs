//! Typed bridge errors
//!
//! Chain adapters, the attestation store and the service all return
//! [`BridgeError`]. Binaries wrap these in `eyre` reports at the edges.

use alloy::primitives::B256;
use thiserror::Error;

use crate::types::{AttestationStatus, ChainId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The burning account does not hold enough tokens
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: String, need: String },

    /// Network, gas or nonce-race failure before the transaction was included
    #[error("chain submission error: {0}")]
    ChainSubmission(String),

    /// The transaction was broadcast but its receipt could not be read.
    /// It may be included; resubmitting could execute it twice.
    #[error("transaction {tx_hash} submitted, outcome unknown: {reason}")]
    SubmittedUnconfirmed { tx_hash: B256, reason: String },

    /// Fewer than M valid watchtower signatures accompanied a mint
    #[error("insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    /// The destination chain already processed this mintId
    #[error("mint already processed")]
    AlreadyProcessed,

    /// A watchtower signature failed verification
    #[error("invalid signature from watchtower {watchtower}")]
    InvalidSignature { watchtower: String },

    /// Signature submitted by an id that is not in the configured set
    #[error("unknown watchtower {0}")]
    UnknownWatchtower(String),

    #[error("not found")]
    NotFound,

    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Status change that violates pending -> ready -> relayed (failed from pending|ready)
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: AttestationStatus,
        to: AttestationStatus,
    },

    /// getOrCreate received a payload that differs from the stored one
    #[error("payload mismatch for attestation {0}")]
    PayloadMismatch(String),

    /// Payload does not describe a mint this chain can accept
    #[error("invalid attestation: {0}")]
    InvalidAttestation(String),

    #[error("no adapter configured for chain {0}")]
    UnknownChain(ChainId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Only pre-inclusion submission failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::ChainSubmission(_))
    }

    /// Stored state disagrees with what a chain or caller reports. Retrying
    /// the same input cannot succeed.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::PayloadMismatch(_)
                | BridgeError::InvalidTransition { .. }
                | BridgeError::InvalidAttestation(_)
        )
    }

    /// Short label used for the `type` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InsufficientBalance { .. } => "insufficient_balance",
            BridgeError::ChainSubmission(_) => "chain_submission",
            BridgeError::SubmittedUnconfirmed { .. } => "submitted_unconfirmed",
            BridgeError::InsufficientSignatures { .. } => "insufficient_signatures",
            BridgeError::AlreadyProcessed => "already_processed",
            BridgeError::InvalidSignature { .. } => "invalid_signature",
            BridgeError::UnknownWatchtower(_) => "unknown_watchtower",
            BridgeError::NotFound => "not_found",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::InvalidTransition { .. } => "invalid_transition",
            BridgeError::PayloadMismatch(_) => "payload_mismatch",
            BridgeError::InvalidAttestation(_) => "invalid_attestation",
            BridgeError::UnknownChain(_) => "unknown_chain",
            BridgeError::Storage(_) => "storage",
            BridgeError::Config(_) => "config",
        }
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BridgeError::NotFound,
            other => BridgeError::Storage(other.to_string()),
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_submission_errors_retry() {
        assert!(BridgeError::ChainSubmission("timeout".into()).is_retryable());
        assert!(!BridgeError::AlreadyProcessed.is_retryable());
        assert!(!BridgeError::InsufficientSignatures { have: 1, need: 2 }.is_retryable());
        assert!(!BridgeError::Timeout(100).is_retryable());
        assert!(!BridgeError::SubmittedUnconfirmed {
            tx_hash: B256::repeat_byte(1),
            reason: "connection reset".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_integrity_violations() {
        assert!(BridgeError::PayloadMismatch("0:1".into()).is_integrity_violation());
        assert!(!BridgeError::Storage("connection reset".into()).is_integrity_violation());
        assert!(!BridgeError::ChainSubmission("timeout".into()).is_integrity_violation());
    }

    #[test]
    fn test_transition_message() {
        let err = BridgeError::InvalidTransition {
            from: AttestationStatus::Pending,
            to: AttestationStatus::Relayed,
        };
        assert_eq!(err.to_string(), "invalid status transition pending -> relayed");
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        assert_eq!(BridgeError::from(sqlx::Error::RowNotFound), BridgeError::NotFound);
    }
}
