//! Hash computation for attestation identities
//!
//! Every chain in the bridge must agree on these byte layouts. The message
//! hash is what watchtowers sign and the mint id is what destination chains
//! record to reject replays.
//!
//! ## Message hash
//!
//! Five 32-byte big-endian words, 160 bytes total:
//! ```text
//! keccak256(uint32 srcChain || uint64 nonce || bytes32 token || bytes32 recipient || uint256 amount)
//! ```
//! EVM addresses are left-padded with 12 zero bytes; Substrate accounts are used as-is.

use alloy::primitives::B256;
use tiny_keccak::{Hasher, Keccak};

use crate::types::{Amount, ChainAddress, ChainId};

/// Domain separator prepended to the message hash when deriving a mint id
pub const MINT_ID_PREFIX: &[u8] = b"ETRID_BRIDGE_MINT_ID";

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Canonical hash of a burn payload
pub fn compute_message_hash(
    source_chain_id: ChainId,
    nonce: u64,
    token: &ChainAddress,
    recipient: &ChainAddress,
    amount: &Amount,
) -> B256 {
    let mut data = [0u8; 160];

    // srcChain (uint32, right-aligned in word 0)
    data[28..32].copy_from_slice(&source_chain_id.to_u32().to_be_bytes());

    // nonce (uint64, right-aligned in word 1)
    data[56..64].copy_from_slice(&nonce.to_be_bytes());

    data[64..96].copy_from_slice(&token.to_bytes32());
    data[96..128].copy_from_slice(&recipient.to_bytes32());
    data[128..160].copy_from_slice(&amount.to_be_bytes());

    B256::from(keccak256(&data))
}

/// Replay-protection id recorded by the destination chain
pub fn compute_mint_id(message_hash: &B256) -> B256 {
    let mut data = Vec::with_capacity(MINT_ID_PREFIX.len() + 32);
    data.extend_from_slice(MINT_ID_PREFIX);
    data.extend_from_slice(message_hash.as_slice());
    B256::from(keccak256(&data))
}

/// EIP-191 personal-message digest of a 32-byte hash
///
/// secp256k1 watchtowers sign this digest, matching `signMessage(bytes32)` in
/// ethers/alloy wallets.
pub fn eip191_digest(hash: &B256) -> [u8; 32] {
    let mut data = Vec::with_capacity(28 + 32);
    data.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    data.extend_from_slice(hash.as_slice());
    keccak256(&data)
}

/// Format bytes32 as hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}
