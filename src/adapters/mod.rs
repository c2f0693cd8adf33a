//! Chain adapters
//!
//! One adapter wraps one chain's transaction and query model. Adapters are
//! constructed explicitly and handed to the service and relayer; nothing
//! holds an ambient client.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;

use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    Amount, Attestation, BurnEvent, BurnReceipt, ChainAddress, ChainFamily, ChainId, MintReceipt,
    SignatureEntry,
};

pub mod evm;
pub mod memory;

pub use evm::{EvmAdapter, EvmAdapterConfig};
pub use memory::{InMemoryAdapter, InMemoryChain};

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> ChainId;

    fn family(&self) -> ChainFamily;

    /// Burn `amount` from the adapter's account towards `dest_chain_id`.
    ///
    /// Returns once the burn is included, with the chain-assigned nonce.
    async fn burn_and_send(
        &self,
        dest_chain_id: ChainId,
        recipient: &ChainAddress,
        amount: Amount,
    ) -> BridgeResult<BurnReceipt>;

    /// Submit the mint for a ready attestation. The chain enforces mintId
    /// uniqueness and the signature threshold.
    async fn mint_from_attestation(
        &self,
        attestation: &Attestation,
        signatures: &[SignatureEntry],
    ) -> BridgeResult<MintReceipt>;

    async fn is_message_received(&self, message_hash: &B256) -> BridgeResult<bool>;

    async fn get_balance(&self, address: &ChainAddress) -> BridgeResult<Amount>;

    async fn get_block_number(&self) -> BridgeResult<u64>;

    /// Burn events in `[from_block, to_block]`
    async fn get_burn_events(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<BurnEvent>>;
}

/// Adapters by chain id
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain_id(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, chain_id: ChainId) -> BridgeResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain_id)
            .cloned()
            .ok_or(BridgeError::UnknownChain(chain_id))
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<_> = self.adapters.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Reject a mint payload addressed elsewhere or with a recipient of the wrong family
pub(crate) fn check_mint_target(
    chain_id: ChainId,
    family: ChainFamily,
    attestation: &Attestation,
) -> BridgeResult<()> {
    if attestation.dest_chain_id != chain_id {
        return Err(BridgeError::InvalidAttestation(format!(
            "attestation {} targets chain {}, not {}",
            attestation.key(),
            attestation.dest_chain_id,
            chain_id
        )));
    }
    if attestation.recipient.family() != family {
        return Err(BridgeError::InvalidAttestation(format!(
            "recipient {} is not a {} address",
            attestation.recipient, family
        )));
    }
    if attestation.payload().message_hash() != attestation.message_hash {
        return Err(BridgeError::InvalidAttestation(format!(
            "message hash does not match payload for {}",
            attestation.key()
        )));
    }
    Ok(())
}
