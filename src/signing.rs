//! Watchtower signing protocol
//!
//! Verifies watchtower signatures over an attestation's message hash and
//! decides whether a signature set meets the configured M-of-N threshold.
//!
//! Two schemes are supported per watchtower:
//! - `secp256k1`: 65-byte `r||s||v` over the EIP-191 digest of the message
//!   hash; the watchtower is identified by its 20-byte EVM address.
//! - `ed25519`: 64-byte signature over the raw message hash; the watchtower
//!   is identified by its 32-byte public key.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Bytes, B256};
use ed25519_dalek::{Signer as _, Verifier as _};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::hash::{eip191_digest, keccak256};
use crate::types::SignatureEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    Secp256k1,
    Ed25519,
}

impl SignatureScheme {
    /// Length in bytes of the public identity for this scheme
    pub fn identity_len(&self) -> usize {
        match self {
            SignatureScheme::Secp256k1 => 20,
            SignatureScheme::Ed25519 => 32,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self {
            SignatureScheme::Secp256k1 => 65,
            SignatureScheme::Ed25519 => 64,
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureScheme::Secp256k1 => write!(f, "secp256k1"),
            SignatureScheme::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl FromStr for SignatureScheme {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "secp256k1" | "ecdsa" => Ok(SignatureScheme::Secp256k1),
            "ed25519" => Ok(SignatureScheme::Ed25519),
            other => Err(BridgeError::Config(format!(
                "unknown signature scheme {:?} (expected secp256k1 or ed25519)",
                other
            ))),
        }
    }
}

/// Public identity of one configured watchtower
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchtowerKey {
    pub id: String,
    pub scheme: SignatureScheme,
    /// EVM address (secp256k1) or raw public key (ed25519)
    pub public_key: Vec<u8>,
}

impl WatchtowerKey {
    pub fn new(id: impl Into<String>, scheme: SignatureScheme, public_key: Vec<u8>) -> BridgeResult<Self> {
        let id = id.into();
        if public_key.len() != scheme.identity_len() {
            return Err(BridgeError::Config(format!(
                "watchtower {} {} key must be {} bytes, got {}",
                id,
                scheme,
                scheme.identity_len(),
                public_key.len()
            )));
        }
        Ok(Self {
            id,
            scheme,
            public_key,
        })
    }

    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.public_key))
    }
}

/// Verify one signature against a watchtower's public identity
pub fn verify_signature(message_hash: &B256, key: &WatchtowerKey, signature: &[u8]) -> bool {
    match key.scheme {
        SignatureScheme::Secp256k1 => recover_evm_address(message_hash, signature)
            .map(|addr| addr.as_slice() == key.public_key.as_slice())
            .unwrap_or(false),
        SignatureScheme::Ed25519 => verify_ed25519(message_hash, &key.public_key, signature),
    }
}

/// Recover the EVM address that produced an EIP-191 signature over `message_hash`
pub fn recover_evm_address(message_hash: &B256, signature: &[u8]) -> Option<[u8; 20]> {
    if signature.len() != 65 {
        return None;
    }
    let v = match signature[64] {
        0 | 27 => 0u8,
        1 | 28 => 1u8,
        _ => return None,
    };
    let sig = Signature::from_slice(&signature[..64]).ok()?;
    let recid = RecoveryId::from_byte(v)?;

    // Accept high-s encodings by normalizing and flipping parity
    let (sig, recid) = match sig.normalize_s() {
        Some(normalized) => (
            normalized,
            RecoveryId::new(!recid.is_y_odd(), recid.is_x_reduced()),
        ),
        None => (sig, recid),
    };

    let digest = eip191_digest(message_hash);
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recid).ok()?;
    Some(evm_address_of(&key))
}

fn evm_address_of(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

fn verify_ed25519(message_hash: &B256, public_key: &[u8], signature: &[u8]) -> bool {
    let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    vk.verify(message_hash.as_slice(), &sig).is_ok()
}

/// Configured watchtower set and threshold M
#[derive(Debug, Clone)]
pub struct WatchtowerSet {
    threshold: usize,
    keys: Vec<WatchtowerKey>,
}

impl WatchtowerSet {
    /// Build a set, enforcing `1 <= M <= N` and unique ids and keys
    pub fn new(threshold: usize, keys: Vec<WatchtowerKey>) -> BridgeResult<Self> {
        if keys.is_empty() {
            return Err(BridgeError::Config("at least one watchtower is required".into()));
        }
        if threshold == 0 || threshold > keys.len() {
            return Err(BridgeError::Config(format!(
                "threshold must be between 1 and {}, got {}",
                keys.len(),
                threshold
            )));
        }
        let mut ids = HashSet::new();
        let mut identities = HashSet::new();
        for key in &keys {
            if !ids.insert(key.id.as_str()) {
                return Err(BridgeError::Config(format!("duplicate watchtower id {}", key.id)));
            }
            if !identities.insert(key.public_key.as_slice()) {
                return Err(BridgeError::Config(format!(
                    "duplicate watchtower key {}",
                    key.public_key_hex()
                )));
            }
        }
        Ok(Self { threshold, keys })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[WatchtowerKey] {
        &self.keys
    }

    pub fn get(&self, watchtower_id: &str) -> Option<&WatchtowerKey> {
        self.keys.iter().find(|k| k.id == watchtower_id)
    }

    /// Verify a submitted signature, returning the typed rejection on failure
    pub fn verify(&self, message_hash: &B256, watchtower_id: &str, signature: &[u8]) -> BridgeResult<()> {
        let key = self
            .get(watchtower_id)
            .ok_or_else(|| BridgeError::UnknownWatchtower(watchtower_id.to_string()))?;
        if verify_signature(message_hash, key, signature) {
            Ok(())
        } else {
            Err(BridgeError::InvalidSignature {
                watchtower: watchtower_id.to_string(),
            })
        }
    }

    /// Number of distinct watchtower keys with a valid signature in `signatures`
    pub fn count_valid(&self, message_hash: &B256, signatures: &[SignatureEntry]) -> usize {
        let mut signers: HashSet<&[u8]> = HashSet::new();
        for entry in signatures {
            if let Some(key) = self.get(&entry.watchtower_id) {
                if verify_signature(message_hash, key, &entry.signature) {
                    signers.insert(key.public_key.as_slice());
                }
            }
        }
        signers.len()
    }

    pub fn has_threshold(&self, message_hash: &B256, signatures: &[SignatureEntry]) -> bool {
        self.count_valid(message_hash, signatures) >= self.threshold
    }
}

/// Private key held by a locally-run watchtower
#[derive(Clone)]
pub enum LocalSigner {
    Secp256k1(SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("scheme", &self.scheme())
            .field("identity", &format!("0x{}", hex::encode(self.identity())))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl LocalSigner {
    /// Parse a 32-byte hex private key for the given scheme
    pub fn from_hex(scheme: SignatureScheme, private_key: &str) -> BridgeResult<Self> {
        let hex_str = private_key.trim().strip_prefix("0x").unwrap_or(private_key.trim());
        let bytes = hex::decode(hex_str)
            .map_err(|e| BridgeError::Config(format!("invalid private key hex: {}", e)))?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| BridgeError::Config(format!("private key must be 32 bytes, got {}", bytes.len())))?;
        match scheme {
            SignatureScheme::Secp256k1 => SigningKey::from_slice(&raw)
                .map(LocalSigner::Secp256k1)
                .map_err(|e| BridgeError::Config(format!("invalid secp256k1 key: {}", e))),
            SignatureScheme::Ed25519 => Ok(LocalSigner::Ed25519(ed25519_dalek::SigningKey::from_bytes(&raw))),
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        match self {
            LocalSigner::Secp256k1(_) => SignatureScheme::Secp256k1,
            LocalSigner::Ed25519(_) => SignatureScheme::Ed25519,
        }
    }

    /// Public identity matching [`WatchtowerKey::public_key`]
    pub fn identity(&self) -> Vec<u8> {
        match self {
            LocalSigner::Secp256k1(key) => evm_address_of(key.verifying_key()).to_vec(),
            LocalSigner::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
        }
    }

    pub fn watchtower_key(&self, id: impl Into<String>) -> WatchtowerKey {
        WatchtowerKey {
            id: id.into(),
            scheme: self.scheme(),
            public_key: self.identity(),
        }
    }

    pub fn sign(&self, message_hash: &B256) -> BridgeResult<Bytes> {
        match self {
            LocalSigner::Secp256k1(key) => {
                let digest = eip191_digest(message_hash);
                let (sig, recid) = key
                    .sign_prehash_recoverable(&digest)
                    .map_err(|e| BridgeError::InvalidAttestation(format!("signing failed: {}", e)))?;
                let mut out = Vec::with_capacity(65);
                out.extend_from_slice(&sig.to_bytes());
                out.push(27 + recid.to_byte());
                Ok(Bytes::from(out))
            }
            LocalSigner::Ed25519(key) => {
                let sig = key.sign(message_hash.as_slice());
                Ok(Bytes::copy_from_slice(&sig.to_bytes()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    // Hardhat account #0
    const HARDHAT_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const HARDHAT_ADDRESS: &str = "f39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn secp(n: u8) -> LocalSigner {
        LocalSigner::from_hex(SignatureScheme::Secp256k1, &hex::encode([n; 32])).unwrap()
    }

    fn ed(n: u8) -> LocalSigner {
        LocalSigner::from_hex(SignatureScheme::Ed25519, &hex::encode([n; 32])).unwrap()
    }

    fn entry(id: &str, signature: Bytes) -> SignatureEntry {
        SignatureEntry {
            watchtower_id: id.to_string(),
            signature,
            signed_at: Utc::now(),
        }
    }

    #[test]
    fn test_secp256k1_identity_is_evm_address() {
        let signer = LocalSigner::from_hex(SignatureScheme::Secp256k1, HARDHAT_KEY).unwrap();
        assert_eq!(hex::encode(signer.identity()), HARDHAT_ADDRESS);
    }

    #[test]
    fn test_secp256k1_sign_and_verify() {
        let signer = secp(1);
        let key = signer.watchtower_key("wt-1");
        let hash = B256::repeat_byte(0x42);
        let sig = signer.sign(&hash).unwrap();
        assert_eq!(sig.len(), 65);
        assert!(sig[64] == 27 || sig[64] == 28);
        assert!(verify_signature(&hash, &key, &sig));
        assert!(!verify_signature(&B256::repeat_byte(0x43), &key, &sig));
    }

    #[test]
    fn test_secp256k1_accepts_zero_one_v() {
        let signer = secp(2);
        let key = signer.watchtower_key("wt");
        let hash = B256::repeat_byte(0x01);
        let mut sig = signer.sign(&hash).unwrap().to_vec();
        sig[64] -= 27;
        assert!(verify_signature(&hash, &key, &sig));
        sig[64] = 5;
        assert!(!verify_signature(&hash, &key, &sig));
    }

    #[test]
    fn test_secp256k1_matches_alloy_sign_message() {
        use alloy::signers::local::PrivateKeySigner;
        use alloy::signers::SignerSync;

        let wallet: PrivateKeySigner = HARDHAT_KEY.parse().unwrap();
        let hash = B256::repeat_byte(0x77);
        let sig = wallet.sign_message_sync(hash.as_slice()).unwrap();

        let key = LocalSigner::from_hex(SignatureScheme::Secp256k1, HARDHAT_KEY)
            .unwrap()
            .watchtower_key("hardhat");
        assert!(verify_signature(&hash, &key, &sig.as_bytes()));
    }

    #[test]
    fn test_ed25519_sign_and_verify() {
        let signer = ed(3);
        let key = signer.watchtower_key("wt-ed");
        assert_eq!(key.public_key.len(), 32);
        let hash = B256::repeat_byte(0x10);
        let sig = signer.sign(&hash).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(&hash, &key, &sig));

        let other = ed(4).watchtower_key("other");
        assert!(!verify_signature(&hash, &other, &sig));
    }

    #[test]
    fn test_wrong_length_signatures_rejected() {
        let hash = B256::ZERO;
        assert!(!verify_signature(&hash, &secp(1).watchtower_key("a"), &[0u8; 64]));
        assert!(!verify_signature(&hash, &ed(1).watchtower_key("b"), &[0u8; 65]));
    }

    #[test]
    fn test_set_validation() {
        let a = secp(1).watchtower_key("a");
        let b = secp(2).watchtower_key("b");
        assert!(WatchtowerSet::new(0, vec![a.clone()]).is_err());
        assert!(WatchtowerSet::new(3, vec![a.clone(), b.clone()]).is_err());
        assert!(WatchtowerSet::new(1, vec![]).is_err());

        let mut dup_id = b.clone();
        dup_id.id = "a".into();
        assert!(WatchtowerSet::new(1, vec![a.clone(), dup_id]).is_err());

        let mut dup_key = a.clone();
        dup_key.id = "c".into();
        assert!(WatchtowerSet::new(1, vec![a.clone(), dup_key]).is_err());

        assert!(WatchtowerSet::new(2, vec![a, b]).is_ok());
    }

    #[test]
    fn test_key_length_checked() {
        assert!(WatchtowerKey::new("x", SignatureScheme::Secp256k1, vec![0u8; 32]).is_err());
        assert!(WatchtowerKey::new("x", SignatureScheme::Ed25519, vec![0u8; 32]).is_ok());
    }

    #[test]
    fn test_threshold_counts_distinct_valid_signers() {
        let signers = [secp(1), secp(2), ed(3)];
        let keys = vec![
            signers[0].watchtower_key("wt-0"),
            signers[1].watchtower_key("wt-1"),
            signers[2].watchtower_key("wt-2"),
        ];
        let set = WatchtowerSet::new(2, keys).unwrap();
        let hash = B256::repeat_byte(0x99);

        let s0 = signers[0].sign(&hash).unwrap();
        let mut sigs = vec![entry("wt-0", s0.clone())];
        assert_eq!(set.count_valid(&hash, &sigs), 1);
        assert!(!set.has_threshold(&hash, &sigs));

        // duplicate from the same watchtower does not count twice
        sigs.push(entry("wt-0", s0));
        assert_eq!(set.count_valid(&hash, &sigs), 1);

        // invalid and unknown signers are ignored
        sigs.push(entry("wt-1", Bytes::from(vec![0u8; 65])));
        sigs.push(entry("ghost", signers[1].sign(&hash).unwrap()));
        assert!(!set.has_threshold(&hash, &sigs));

        sigs.push(entry("wt-2", signers[2].sign(&hash).unwrap()));
        assert_eq!(set.count_valid(&hash, &sigs), 2);
        assert!(set.has_threshold(&hash, &sigs));
    }

    #[test]
    fn test_verify_reports_typed_errors() {
        let signer = secp(1);
        let set = WatchtowerSet::new(1, vec![signer.watchtower_key("wt")]).unwrap();
        let hash = B256::repeat_byte(0x01);

        assert!(set.verify(&hash, "wt", &signer.sign(&hash).unwrap()).is_ok());
        assert_eq!(
            set.verify(&hash, "wt", &[0u8; 65]),
            Err(BridgeError::InvalidSignature {
                watchtower: "wt".into()
            })
        );
        assert_eq!(
            set.verify(&hash, "nobody", &[0u8; 65]),
            Err(BridgeError::UnknownWatchtower("nobody".into()))
        );
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let debug = format!("{:?}", LocalSigner::from_hex(SignatureScheme::Secp256k1, HARDHAT_KEY).unwrap());
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("ac0974bec39a17e3"));
    }
}
