//! In-memory chain model
//!
//! A deterministic ledger with the same contract as a deployed token
//! messenger: balances, a per-chain burn nonce, a burn event log, and a
//! destination-side mintId gate with its own M-of-N signature check.
//! Used for local development and the end-to-end tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{check_mint_target, ChainAdapter};
use crate::error::{BridgeError, BridgeResult};
use crate::hash::{compute_mint_id, keccak256};
use crate::signing::WatchtowerSet;
use crate::types::{
    Amount, Attestation, BurnEvent, BurnReceipt, ChainAddress, ChainFamily, ChainId, MintReceipt,
    SignatureEntry,
};

#[derive(Default)]
struct LedgerState {
    balances: HashMap<ChainAddress, Amount>,
    total_supply: Amount,
    next_nonce: u64,
    block_number: u64,
    burns: Vec<BurnEvent>,
    received: HashSet<B256>,
    processed_mints: HashSet<B256>,
    /// Submissions to fail before inclusion
    injected_failures: u32,
}

impl LedgerState {
    fn take_injected_failure(&mut self) -> bool {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            true
        } else {
            false
        }
    }

    fn next_block(&mut self) -> u64 {
        self.block_number += 1;
        self.block_number
    }
}

/// One simulated chain shared by every account handle on it
pub struct InMemoryChain {
    chain_id: ChainId,
    family: ChainFamily,
    token: ChainAddress,
    watchtowers: Arc<WatchtowerSet>,
    state: Mutex<LedgerState>,
}

impl InMemoryChain {
    /// `token` also fixes the chain family (EVM or Substrate address width)
    pub fn new(chain_id: ChainId, token: ChainAddress, watchtowers: Arc<WatchtowerSet>) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            family: token.family(),
            token,
            watchtowers,
            state: Mutex::new(LedgerState::default()),
        })
    }

    /// Adapter acting as `account` (the burner for `burn_and_send`)
    pub fn adapter(self: &Arc<Self>, account: ChainAddress) -> InMemoryAdapter {
        InMemoryAdapter {
            chain: self.clone(),
            account,
        }
    }

    pub fn token(&self) -> ChainAddress {
        self.token
    }

    /// Genesis funding for `account`
    pub async fn credit(&self, account: ChainAddress, amount: Amount) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let balance = state.balances.get(&account).copied().unwrap_or_default();
        let new_balance = balance
            .checked_add(amount)
            .ok_or_else(|| BridgeError::InvalidAttestation("balance overflow".into()))?;
        let supply = state
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| BridgeError::InvalidAttestation("supply overflow".into()))?;
        state.balances.insert(account, new_balance);
        state.total_supply = supply;
        Ok(())
    }

    /// Make the next `count` burn or mint submissions fail before inclusion
    pub async fn fail_next_submissions(&self, count: u32) {
        self.state.lock().await.injected_failures = count;
    }

    pub async fn total_supply(&self) -> Amount {
        self.state.lock().await.total_supply
    }

    pub async fn processed_mint_count(&self) -> usize {
        self.state.lock().await.processed_mints.len()
    }

    pub async fn is_mint_processed(&self, mint_id: &B256) -> bool {
        self.state.lock().await.processed_mints.contains(mint_id)
    }

    fn tx_hash(&self, kind: &[u8], block: u64, id: &[u8]) -> B256 {
        let mut data = Vec::with_capacity(4 + kind.len() + 8 + id.len());
        data.extend_from_slice(&self.chain_id.to_u32().to_be_bytes());
        data.extend_from_slice(kind);
        data.extend_from_slice(&block.to_be_bytes());
        data.extend_from_slice(id);
        B256::from(keccak256(&data))
    }
}

/// Account handle on an [`InMemoryChain`]
#[derive(Clone)]
pub struct InMemoryAdapter {
    chain: Arc<InMemoryChain>,
    account: ChainAddress,
}

impl InMemoryAdapter {
    pub fn account(&self) -> ChainAddress {
        self.account
    }

    pub fn chain(&self) -> &Arc<InMemoryChain> {
        &self.chain
    }
}

#[async_trait]
impl ChainAdapter for InMemoryAdapter {
    fn chain_id(&self) -> ChainId {
        self.chain.chain_id
    }

    fn family(&self) -> ChainFamily {
        self.chain.family
    }

    async fn burn_and_send(
        &self,
        dest_chain_id: ChainId,
        recipient: &ChainAddress,
        amount: Amount,
    ) -> BridgeResult<BurnReceipt> {
        if amount.is_zero() {
            return Err(BridgeError::InvalidAttestation("burn amount must be positive".into()));
        }
        if dest_chain_id == self.chain.chain_id {
            return Err(BridgeError::InvalidAttestation("destination equals source chain".into()));
        }
        match dest_chain_id.family() {
            Some(family) if family == recipient.family() => {}
            Some(family) => {
                return Err(BridgeError::InvalidAttestation(format!(
                    "recipient {} is not a {} address",
                    recipient, family
                )))
            }
            None => {
                return Err(BridgeError::InvalidAttestation(format!(
                    "destination chain {} is not supported",
                    dest_chain_id
                )))
            }
        }

        let mut state = self.chain.state.lock().await;
        if state.take_injected_failure() {
            return Err(BridgeError::ChainSubmission("transaction dropped before inclusion".into()));
        }

        let balance = state.balances.get(&self.account).copied().unwrap_or_default();
        let remaining = balance
            .checked_sub(amount)
            .ok_or_else(|| BridgeError::InsufficientBalance {
                have: balance.to_string(),
                need: amount.to_string(),
            })?;
        state.balances.insert(self.account, remaining);
        state.total_supply = state.total_supply.checked_sub(amount).unwrap_or_default();

        let nonce = state.next_nonce;
        state.next_nonce += 1;
        let block_number = state.next_block();
        let tx_hash = self.chain.tx_hash(b"burn", block_number, &nonce.to_be_bytes());

        state.burns.push(BurnEvent {
            source_chain_id: self.chain.chain_id,
            dest_chain_id,
            nonce,
            token: self.chain.token,
            sender: self.account,
            recipient: *recipient,
            amount,
            tx_hash,
            block_number,
        });

        info!(
            chain = %self.chain.chain_id,
            nonce,
            amount = %amount,
            dest_chain_id = %dest_chain_id,
            "Burn included"
        );

        Ok(BurnReceipt {
            nonce,
            source_tx_hash: tx_hash,
            block_number,
        })
    }

    async fn mint_from_attestation(
        &self,
        attestation: &Attestation,
        signatures: &[SignatureEntry],
    ) -> BridgeResult<MintReceipt> {
        check_mint_target(self.chain.chain_id, self.chain.family, attestation)?;
        let mint_id = compute_mint_id(&attestation.message_hash);

        let mut state = self.chain.state.lock().await;
        if state.take_injected_failure() {
            return Err(BridgeError::ChainSubmission("transaction dropped before inclusion".into()));
        }

        if state.processed_mints.contains(&mint_id) {
            debug!(mint_id = %mint_id, "Mint already processed");
            return Err(BridgeError::AlreadyProcessed);
        }

        let have = self
            .chain
            .watchtowers
            .count_valid(&attestation.message_hash, signatures);
        let need = self.chain.watchtowers.threshold();
        if have < need {
            warn!(key = %attestation.key(), have, need, "Mint rejected: insufficient signatures");
            return Err(BridgeError::InsufficientSignatures { have, need });
        }

        let balance = state
            .balances
            .get(&attestation.recipient)
            .copied()
            .unwrap_or_default();
        let credited = balance
            .checked_add(attestation.amount)
            .ok_or_else(|| BridgeError::InvalidAttestation("balance overflow".into()))?;
        let supply = state
            .total_supply
            .checked_add(attestation.amount)
            .ok_or_else(|| BridgeError::InvalidAttestation("supply overflow".into()))?;
        state.balances.insert(attestation.recipient, credited);
        state.total_supply = supply;
        state.processed_mints.insert(mint_id);
        state.received.insert(attestation.message_hash);

        let block_number = state.next_block();
        let dest_tx_hash = self.chain.tx_hash(b"mint", block_number, mint_id.as_slice());

        info!(
            chain = %self.chain.chain_id,
            key = %attestation.key(),
            mint_id = %mint_id,
            amount = %attestation.amount,
            "Mint included"
        );

        Ok(MintReceipt {
            dest_tx_hash,
            block_number,
        })
    }

    async fn is_message_received(&self, message_hash: &B256) -> BridgeResult<bool> {
        Ok(self.chain.state.lock().await.received.contains(message_hash))
    }

    async fn get_balance(&self, address: &ChainAddress) -> BridgeResult<Amount> {
        Ok(self
            .chain
            .state
            .lock()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    async fn get_block_number(&self) -> BridgeResult<u64> {
        Ok(self.chain.state.lock().await.block_number)
    }

    async fn get_burn_events(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<BurnEvent>> {
        Ok(self
            .chain
            .state
            .lock()
            .await
            .burns
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{LocalSigner, SignatureScheme};
    use crate::types::AttestationStatus;
    use chrono::Utc;

    const ALICE: ChainAddress = ChainAddress::Evm([0xa1; 20]);
    const BOB: ChainAddress = ChainAddress::Substrate([0xb0; 32]);

    fn signers() -> Vec<LocalSigner> {
        (1..=3u8)
            .map(|n| LocalSigner::from_hex(SignatureScheme::Ed25519, &hex::encode([n; 32])).unwrap())
            .collect()
    }

    fn watchtowers(signers: &[LocalSigner]) -> Arc<WatchtowerSet> {
        let keys = signers
            .iter()
            .enumerate()
            .map(|(i, s)| s.watchtower_key(format!("wt-{}", i)))
            .collect();
        Arc::new(WatchtowerSet::new(2, keys).unwrap())
    }

    fn sign_all(att: &Attestation, signers: &[LocalSigner], count: usize) -> Vec<SignatureEntry> {
        signers
            .iter()
            .enumerate()
            .take(count)
            .map(|(i, s)| SignatureEntry {
                watchtower_id: format!("wt-{}", i),
                signature: s.sign(&att.message_hash).unwrap(),
                signed_at: Utc::now(),
            })
            .collect()
    }

    async fn setup() -> (Arc<InMemoryChain>, Arc<InMemoryChain>, Vec<LocalSigner>) {
        let signers = signers();
        let wt = watchtowers(&signers);
        let eth = InMemoryChain::new(ChainId::ETHEREUM, ChainAddress::Evm([0xee; 20]), wt.clone());
        let etrid = InMemoryChain::new(ChainId::ETRID, ChainAddress::Substrate([0xed; 32]), wt);
        eth.credit(ALICE, Amount::from(1000u128)).await.unwrap();
        (eth, etrid, signers)
    }

    async fn burn(eth: &Arc<InMemoryChain>, amount: u128) -> Attestation {
        let adapter = eth.adapter(ALICE);
        let receipt = adapter
            .burn_and_send(ChainId::ETRID, &BOB, Amount::from(amount))
            .await
            .unwrap();
        let events = adapter.get_burn_events(receipt.block_number, receipt.block_number).await.unwrap();
        Attestation::new(events[0].to_payload(), Utc::now())
    }

    #[tokio::test]
    async fn test_burn_debits_and_assigns_sequential_nonces() {
        let (eth, _, _) = setup().await;
        let adapter = eth.adapter(ALICE);

        let r0 = adapter.burn_and_send(ChainId::ETRID, &BOB, Amount::from(100u128)).await.unwrap();
        let r1 = adapter.burn_and_send(ChainId::ETRID, &BOB, Amount::from(50u128)).await.unwrap();
        assert_eq!(r0.nonce, 0);
        assert_eq!(r1.nonce, 1);
        assert_eq!(adapter.get_balance(&ALICE).await.unwrap(), Amount::from(850u128));
        assert_eq!(eth.total_supply().await, Amount::from(850u128));
        assert_eq!(adapter.get_block_number().await.unwrap(), 2);

        let events = adapter.get_burn_events(0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].nonce, 1);
        assert_eq!(events[1].recipient, BOB);
        assert!(adapter.get_burn_events(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_burn_insufficient_balance() {
        let (eth, _, _) = setup().await;
        let err = eth
            .adapter(ALICE)
            .burn_and_send(ChainId::ETRID, &BOB, Amount::from(1001u128))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::InsufficientBalance {
                have: "1000".into(),
                need: "1001".into()
            }
        );
    }

    #[tokio::test]
    async fn test_burn_rejects_wrong_recipient_family() {
        let (eth, _, _) = setup().await;
        let err = eth
            .adapter(ALICE)
            .burn_and_send(ChainId::ETRID, &ChainAddress::Evm([1; 20]), Amount::from(1u128))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAttestation(_)));
    }

    #[tokio::test]
    async fn test_mint_requires_threshold() {
        let (eth, etrid, signers) = setup().await;
        let att = burn(&eth, 400).await;
        let dest = etrid.adapter(BOB);

        let err = dest
            .mint_from_attestation(&att, &sign_all(&att, &signers, 1))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::InsufficientSignatures { have: 1, need: 2 });
        assert_eq!(dest.get_balance(&BOB).await.unwrap(), Amount::ZERO);
        assert!(!dest.is_message_received(&att.message_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_mint_once_then_already_processed() {
        let (eth, etrid, signers) = setup().await;
        let att = burn(&eth, 400).await;
        let dest = etrid.adapter(BOB);
        let sigs = sign_all(&att, &signers, 2);

        dest.mint_from_attestation(&att, &sigs).await.unwrap();
        assert_eq!(dest.get_balance(&BOB).await.unwrap(), Amount::from(400u128));
        assert!(dest.is_message_received(&att.message_hash).await.unwrap());

        let err = dest.mint_from_attestation(&att, &sigs).await.unwrap_err();
        assert_eq!(err, BridgeError::AlreadyProcessed);
        assert_eq!(dest.get_balance(&BOB).await.unwrap(), Amount::from(400u128));
        assert_eq!(etrid.processed_mint_count().await, 1);
        assert!(etrid.is_mint_processed(&att.mint_id).await);
    }

    #[tokio::test]
    async fn test_mint_rejects_tampered_payload() {
        let (eth, etrid, signers) = setup().await;
        let mut att = burn(&eth, 400).await;
        let sigs = sign_all(&att, &signers, 2);
        att.amount = Amount::from(4000u128);
        assert!(matches!(
            etrid.adapter(BOB).mint_from_attestation(&att, &sigs).await,
            Err(BridgeError::InvalidAttestation(_))
        ));
    }

    #[tokio::test]
    async fn test_mint_rejects_wrong_destination() {
        let (eth, _, signers) = setup().await;
        let att = burn(&eth, 10).await;
        let sigs = sign_all(&att, &signers, 2);
        assert!(matches!(
            eth.adapter(ALICE).mint_from_attestation(&att, &sigs).await,
            Err(BridgeError::InvalidAttestation(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_is_pre_inclusion() {
        let (eth, etrid, signers) = setup().await;
        let att = burn(&eth, 400).await;
        let sigs = sign_all(&att, &signers, 2);
        let dest = etrid.adapter(BOB);

        etrid.fail_next_submissions(1).await;
        let err = dest.mint_from_attestation(&att, &sigs).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(dest.get_balance(&BOB).await.unwrap(), Amount::ZERO);

        dest.mint_from_attestation(&att, &sigs).await.unwrap();
        assert_eq!(dest.get_balance(&BOB).await.unwrap(), Amount::from(400u128));
        assert_eq!(att.status, AttestationStatus::Pending);
    }
}
