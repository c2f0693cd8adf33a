//! Common types for cross-chain attestations
//!
//! Chain ids follow the bridge domain registry. Addresses are a tagged union
//! per chain family so the canonical message encoding never has to guess the
//! width of an address from a string.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BridgeError;
use crate::hash::{compute_message_hash, compute_mint_id};

// ============================================================================
// Chains
// ============================================================================

/// Bridge domain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u32);

impl ChainId {
    pub const ETHEREUM: ChainId = ChainId(0);
    pub const SOLANA: ChainId = ChainId(1);
    pub const ETRID: ChainId = ChainId(2);
    pub const POLYGON: ChainId = ChainId(3);
    pub const BNB_CHAIN: ChainId = ChainId(4);
    pub const AVALANCHE: ChainId = ChainId(5);
    pub const ARBITRUM: ChainId = ChainId(6);
    pub const OPTIMISM: ChainId = ChainId(7);

    pub fn to_u32(self) -> u32 {
        self.0
    }

    /// Registry name, `"unknown"` for unregistered ids
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "ethereum",
            1 => "solana",
            2 => "etrid",
            3 => "polygon",
            4 => "bnb",
            5 => "avalanche",
            6 => "arbitrum",
            7 => "optimism",
            _ => "unknown",
        }
    }

    /// Chain family of a registered domain. Solana has no adapter family.
    pub fn family(self) -> Option<ChainFamily> {
        match self.0 {
            0 | 3..=7 => Some(ChainFamily::Evm),
            2 => Some(ChainFamily::Substrate),
            _ => None,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ChainId {
    fn from(id: u32) -> Self {
        ChainId(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Substrate,
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainFamily::Evm => write!(f, "evm"),
            ChainFamily::Substrate => write!(f, "substrate"),
        }
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// Account or asset address on one chain family
///
/// JSON form is `0x` hex: 40 digits for EVM, 64 digits for Substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainAddress {
    Evm([u8; 20]),
    Substrate([u8; 32]),
}

impl ChainAddress {
    pub fn family(&self) -> ChainFamily {
        match self {
            ChainAddress::Evm(_) => ChainFamily::Evm,
            ChainAddress::Substrate(_) => ChainFamily::Substrate,
        }
    }

    /// Canonical 32-byte form: EVM left-padded with 12 zero bytes, Substrate raw
    pub fn to_bytes32(&self) -> [u8; 32] {
        match self {
            ChainAddress::Evm(raw) => {
                let mut out = [0u8; 32];
                out[12..].copy_from_slice(raw);
                out
            }
            ChainAddress::Substrate(raw) => *raw,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ChainAddress::Evm(raw) => raw,
            ChainAddress::Substrate(raw) => raw,
        }
    }

    /// Parse from hex (with or without 0x prefix); width selects the family
    pub fn from_hex(s: &str) -> Result<Self, BridgeError> {
        let hex_str = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let bytes = hex::decode(hex_str)
            .map_err(|e| BridgeError::InvalidAttestation(format!("invalid address {}: {}", s, e)))?;
        match bytes.len() {
            20 => {
                let mut raw = [0u8; 20];
                raw.copy_from_slice(&bytes);
                Ok(ChainAddress::Evm(raw))
            }
            32 => {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&bytes);
                Ok(ChainAddress::Substrate(raw))
            }
            len => Err(BridgeError::InvalidAttestation(format!(
                "address must be 20 (EVM) or 32 (Substrate) bytes, got {}",
                len
            ))),
        }
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.as_slice()))
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ChainAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainAddress::from_hex(s)
    }
}

impl From<alloy::primitives::Address> for ChainAddress {
    fn from(addr: alloy::primitives::Address) -> Self {
        ChainAddress::Evm(addr.into_array())
    }
}

impl Serialize for ChainAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainAddress::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Amounts
// ============================================================================

/// Unsigned token amount in base units, serialized as a decimal string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }
}

impl From<u128> for Amount {
    fn from(v: u128) -> Self {
        Amount(U256::from(v))
    }
}

impl From<U256> for Amount {
    fn from(v: U256) -> Self {
        Amount(v)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BridgeError::InvalidAttestation(format!(
                "amount must be a decimal integer, got {:?}",
                s
            )));
        }
        U256::from_str_radix(s, 10)
            .map(Amount)
            .map_err(|e| BridgeError::InvalidAttestation(format!("invalid amount {}: {}", s, e)))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Attestations
// ============================================================================

/// Lifecycle of an attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationStatus {
    Pending,
    Ready,
    Relayed,
    Failed,
}

impl AttestationStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            AttestationStatus::Pending => "pending",
            AttestationStatus::Ready => "ready",
            AttestationStatus::Relayed => "relayed",
            AttestationStatus::Failed => "failed",
        }
    }

    /// pending -> ready -> relayed, failed only from pending or ready
    pub fn can_transition_to(&self, next: AttestationStatus) -> bool {
        use AttestationStatus::*;
        matches!(
            (self, next),
            (Pending, Ready) | (Pending, Failed) | (Ready, Relayed) | (Ready, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttestationStatus::Relayed | AttestationStatus::Failed)
    }
}

impl fmt::Display for AttestationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AttestationStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttestationStatus::Pending),
            "ready" => Ok(AttestationStatus::Ready),
            "relayed" => Ok(AttestationStatus::Relayed),
            "failed" => Ok(AttestationStatus::Failed),
            other => Err(BridgeError::Storage(format!("unknown status {:?}", other))),
        }
    }
}

/// Primary key of an attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttestationKey {
    pub source_chain_id: ChainId,
    pub nonce: u64,
}

impl AttestationKey {
    pub fn new(source_chain_id: ChainId, nonce: u64) -> Self {
        Self {
            source_chain_id,
            nonce,
        }
    }
}

impl fmt::Display for AttestationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_chain_id, self.nonce)
    }
}

/// One watchtower's signature over an attestation's message hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEntry {
    pub watchtower_id: String,
    pub signature: Bytes,
    pub signed_at: DateTime<Utc>,
}

/// Payload observed on the source chain; everything needed to build an attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAttestation {
    pub source_chain_id: ChainId,
    pub dest_chain_id: ChainId,
    pub nonce: u64,
    pub token: ChainAddress,
    pub recipient: ChainAddress,
    pub amount: Amount,
    pub source_tx_hash: B256,
}

impl NewAttestation {
    pub fn key(&self) -> AttestationKey {
        AttestationKey::new(self.source_chain_id, self.nonce)
    }

    pub fn message_hash(&self) -> B256 {
        compute_message_hash(
            self.source_chain_id,
            self.nonce,
            &self.token,
            &self.recipient,
            &self.amount,
        )
    }
}

/// A signed claim that a burn occurred, authorizing the matching mint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub source_chain_id: ChainId,
    pub dest_chain_id: ChainId,
    pub nonce: u64,
    pub token: ChainAddress,
    pub recipient: ChainAddress,
    pub amount: Amount,
    pub source_tx_hash: B256,
    pub message_hash: B256,
    pub mint_id: B256,
    pub signatures: Vec<SignatureEntry>,
    pub status: AttestationStatus,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub relayed_at: Option<DateTime<Utc>>,
    pub dest_tx_hash: Option<B256>,
    pub failure_reason: Option<String>,
    pub relay_attempts: u32,
}

impl Attestation {
    /// Build a fresh `pending` attestation from an observed payload
    pub fn new(payload: NewAttestation, now: DateTime<Utc>) -> Self {
        let message_hash = payload.message_hash();
        Self {
            source_chain_id: payload.source_chain_id,
            dest_chain_id: payload.dest_chain_id,
            nonce: payload.nonce,
            token: payload.token,
            recipient: payload.recipient,
            amount: payload.amount,
            source_tx_hash: payload.source_tx_hash,
            message_hash,
            mint_id: compute_mint_id(&message_hash),
            signatures: Vec::new(),
            status: AttestationStatus::Pending,
            created_at: now,
            ready_at: None,
            relayed_at: None,
            dest_tx_hash: None,
            failure_reason: None,
            relay_attempts: 0,
        }
    }

    pub fn key(&self) -> AttestationKey {
        AttestationKey::new(self.source_chain_id, self.nonce)
    }

    pub fn payload(&self) -> NewAttestation {
        NewAttestation {
            source_chain_id: self.source_chain_id,
            dest_chain_id: self.dest_chain_id,
            nonce: self.nonce,
            token: self.token,
            recipient: self.recipient,
            amount: self.amount,
            source_tx_hash: self.source_tx_hash,
        }
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn has_signature_from(&self, watchtower_id: &str) -> bool {
        self.signatures
            .iter()
            .any(|s| s.watchtower_id == watchtower_id)
    }

    /// Apply a status change, refusing anything outside the state machine
    pub fn transition(&mut self, next: AttestationStatus) -> Result<(), BridgeError> {
        if !self.status.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// ============================================================================
// Chain events and receipts
// ============================================================================

/// Burn observed in a source chain's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnEvent {
    pub source_chain_id: ChainId,
    pub dest_chain_id: ChainId,
    pub nonce: u64,
    pub token: ChainAddress,
    pub sender: ChainAddress,
    pub recipient: ChainAddress,
    pub amount: Amount,
    pub tx_hash: B256,
    pub block_number: u64,
}

impl BurnEvent {
    pub fn to_payload(&self) -> NewAttestation {
        NewAttestation {
            source_chain_id: self.source_chain_id,
            dest_chain_id: self.dest_chain_id,
            nonce: self.nonce,
            token: self.token,
            recipient: self.recipient,
            amount: self.amount,
            source_tx_hash: self.tx_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnReceipt {
    pub nonce: u64,
    pub source_tx_hash: B256,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintReceipt {
    pub dest_tx_hash: B256,
    pub block_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> NewAttestation {
        NewAttestation {
            source_chain_id: ChainId::ETHEREUM,
            dest_chain_id: ChainId::ETRID,
            nonce: 42,
            token: ChainAddress::Evm([0x11; 20]),
            recipient: ChainAddress::Substrate([0x22; 32]),
            amount: Amount::from(400_000_000_000_000_000_000u128),
            source_tx_hash: B256::repeat_byte(0xaa),
        }
    }

    #[test]
    fn test_chain_registry() {
        assert_eq!(ChainId::ETHEREUM.family(), Some(ChainFamily::Evm));
        assert_eq!(ChainId::ETRID.family(), Some(ChainFamily::Substrate));
        assert_eq!(ChainId::SOLANA.family(), None);
        assert_eq!(ChainId(99).name(), "unknown");
        assert_eq!(format!("{}", ChainId::ETRID), "2");
    }

    #[test]
    fn test_address_width_selects_family() {
        let evm = ChainAddress::from_hex("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        assert_eq!(evm.family(), ChainFamily::Evm);
        assert_eq!(evm.to_hex(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let sub = ChainAddress::from_hex(&format!("0x{}", "ab".repeat(32))).unwrap();
        assert_eq!(sub.family(), ChainFamily::Substrate);

        assert!(ChainAddress::from_hex("0x1234").is_err());
        assert!(ChainAddress::from_hex("0xzz").is_err());
    }

    #[test]
    fn test_evm_address_left_padded() {
        let evm = ChainAddress::Evm([0xff; 20]);
        let word = evm.to_bytes32();
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(&word[12..], &[0xff; 20]);
    }

    #[test]
    fn test_amount_decimal_json() {
        let amount = Amount::from(1_000_000_000_000_000_000u128);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"1000000000000000000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
        assert!("12a".parse::<Amount>().is_err());
        assert!("".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_checked_math() {
        let a = Amount::from(10u128);
        let b = Amount::from(4u128);
        assert_eq!(a.checked_sub(b), Some(Amount::from(6u128)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(a.checked_add(b), Some(Amount::from(14u128)));
    }

    #[test]
    fn test_status_transitions() {
        use AttestationStatus::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Relayed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Relayed));
        assert!(!Relayed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Pending));
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(AttestationStatus::Pending.as_str(), "pending");
        assert_eq!(AttestationStatus::Ready.as_str(), "ready");
        assert_eq!(AttestationStatus::Relayed.as_str(), "relayed");
        assert_eq!(AttestationStatus::Failed.as_str(), "failed");
        assert_eq!("ready".parse::<AttestationStatus>().unwrap(), AttestationStatus::Ready);
    }

    #[test]
    fn test_new_attestation_derives_hashes() {
        let att = Attestation::new(payload(), Utc::now());
        assert_eq!(att.status, AttestationStatus::Pending);
        assert_eq!(att.message_hash, payload().message_hash());
        assert_eq!(att.mint_id, compute_mint_id(&att.message_hash));
        assert_eq!(att.payload(), payload());
        assert_eq!(att.key(), AttestationKey::new(ChainId::ETHEREUM, 42));
    }

    #[test]
    fn test_transition_rejects_skip() {
        let mut att = Attestation::new(payload(), Utc::now());
        let err = att.transition(AttestationStatus::Relayed).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTransition { .. }));
        assert_eq!(att.status, AttestationStatus::Pending);
        att.transition(AttestationStatus::Ready).unwrap();
        att.transition(AttestationStatus::Relayed).unwrap();
        assert!(att.transition(AttestationStatus::Failed).is_err());
    }

    #[test]
    fn test_attestation_json_shape() {
        let att = Attestation::new(payload(), Utc::now());
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["sourceChainId"], 0);
        assert_eq!(json["destChainId"], 2);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["amount"], "400000000000000000000");
        assert_eq!(
            json["token"],
            "0x1111111111111111111111111111111111111111"
        );
        assert!(json["messageHash"].as_str().unwrap().starts_with("0x"));
    }
}
