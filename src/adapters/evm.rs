//! EVM chain adapter
//!
//! Wraps the EDSC token messenger contract. Burns go through
//! `burnAndSend` after an ERC-20 approval; mints go through
//! `receiveMessage`, which checks the watchtower signatures on-chain and
//! records the mintId.
//!
//! # Transaction Building
//!
//! Uses Alloy's `ProviderBuilder::with_recommended_fillers()` to populate
//! nonce, gas limit and fees.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use super::{check_mint_target, ChainAdapter};
use crate::error::{BridgeError, BridgeResult};
use crate::hash::{bytes32_to_hex, compute_mint_id};
use crate::types::{
    Amount, Attestation, BurnEvent, BurnReceipt, ChainAddress, ChainFamily, ChainId, MintReceipt,
    SignatureEntry,
};

sol! {
    /// EDSC token messenger (burn-and-mint endpoint)
    #[sol(rpc)]
    contract EdscTokenMessenger {
        event BurnMessageSent(
            uint64 indexed nonce,
            uint32 indexed destinationDomain,
            address indexed sender,
            address token,
            bytes32 recipient,
            uint256 amount
        );

        function burnAndSend(uint32 destinationDomain, bytes32 recipient, uint256 amount)
            external returns (uint64 nonce);

        function receiveMessage(
            uint32 sourceDomain,
            uint64 nonce,
            bytes32 token,
            bytes32 recipient,
            uint256 amount,
            bytes[] signatures
        ) external;

        function isMessageReceived(bytes32 messageHash) external view returns (bool);

        function processedMints(bytes32 mintId) external view returns (bool);
    }

    #[sol(rpc)]
    contract Erc20 {
        function balanceOf(address account) external view returns (uint256);

        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// keccak256("BurnMessageSent(uint64,uint32,address,address,bytes32,uint256)")
pub fn burn_message_sent_signature() -> B256 {
    alloy::primitives::keccak256(b"BurnMessageSent(uint64,uint32,address,address,bytes32,uint256)")
}

#[derive(Clone)]
pub struct EvmAdapterConfig {
    pub chain_id: ChainId,
    pub rpc_url: String,
    pub messenger_address: String,
    pub token_address: String,
    pub private_key: String,
}

impl std::fmt::Debug for EvmAdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmAdapterConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("messenger_address", &self.messenger_address)
            .field("token_address", &self.token_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Adapter for one EVM chain's token messenger
pub struct EvmAdapter {
    chain_id: ChainId,
    rpc_url: String,
    messenger: Address,
    token: Address,
    signer: PrivateKeySigner,
    /// mintIds with a submission outstanding from this process
    in_flight: Arc<Mutex<HashSet<B256>>>,
}

/// Removes a mintId from the in-flight set when the submission ends
#[derive(Debug)]
struct InFlightGuard {
    set: Arc<Mutex<HashSet<B256>>>,
    mint_id: B256,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.mint_id);
        }
    }
}

impl EvmAdapter {
    pub fn new(config: &EvmAdapterConfig) -> Result<Self> {
        let messenger =
            Address::from_str(&config.messenger_address).wrap_err("Invalid messenger address")?;
        let token = Address::from_str(&config.token_address).wrap_err("Invalid token address")?;
        let signer: PrivateKeySigner = config.private_key.parse().wrap_err("Invalid private key")?;

        info!(
            chain_id = %config.chain_id,
            account = %signer.address(),
            messenger = %messenger,
            token = %token,
            "EVM adapter initialized"
        );

        Ok(Self {
            chain_id: config.chain_id,
            rpc_url: config.rpc_url.clone(),
            messenger,
            token,
            signer,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    fn rpc_url(&self) -> BridgeResult<reqwest::Url> {
        self.rpc_url
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid RPC URL {}: {}", self.rpc_url, e)))
    }

    fn claim(&self, mint_id: B256) -> BridgeResult<InFlightGuard> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| BridgeError::ChainSubmission("in-flight set poisoned".into()))?;
        if !set.insert(mint_id) {
            return Err(BridgeError::ChainSubmission(format!(
                "mint {} already in flight",
                bytes32_to_hex(&mint_id.0)
            )));
        }
        Ok(InFlightGuard {
            set: self.in_flight.clone(),
            mint_id,
        })
    }

    async fn is_mint_processed(&self, mint_id: B256) -> BridgeResult<bool> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        let messenger = EdscTokenMessenger::new(self.messenger, provider);
        let processed = messenger
            .processedMints(mint_id)
            .call()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("processedMints query failed: {}", e)))?;
        Ok(processed._0)
    }
}

/// Map a revert or transport error onto the bridge error taxonomy
pub fn classify_submission_error(error: &str, need: usize) -> BridgeError {
    let lower = error.to_lowercase();
    if lower.contains("already processed") || lower.contains("mint already") {
        BridgeError::AlreadyProcessed
    } else if lower.contains("insufficient signatures") {
        BridgeError::InsufficientSignatures { have: 0, need }
    } else if lower.contains("exceeds balance") || lower.contains("insufficient balance") {
        BridgeError::InsufficientBalance {
            have: "unknown".into(),
            need: "unknown".into(),
        }
    } else {
        BridgeError::ChainSubmission(error.to_string())
    }
}

/// A burn whose receipt could not be read may still be mined
fn unconfirmed_burn(tx_hash: B256, reason: &str) -> BridgeError {
    warn!(tx_hash = %tx_hash, error = %reason, "Burn receipt unavailable; not resubmitting");
    BridgeError::SubmittedUnconfirmed {
        tx_hash,
        reason: reason.to_string(),
    }
}

/// Decode a `BurnMessageSent` log emitted on `source_chain_id`
pub fn parse_burn_log(source_chain_id: ChainId, log: &Log) -> BridgeResult<BurnEvent> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| BridgeError::InvalidAttestation("missing transaction hash".into()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| BridgeError::InvalidAttestation("missing block number".into()))?;
    decode_burn(source_chain_id, log.topics(), log.data().data.as_ref(), tx_hash, block_number)
}

fn decode_burn(
    source_chain_id: ChainId,
    topics: &[B256],
    data: &[u8],
    tx_hash: B256,
    block_number: u64,
) -> BridgeResult<BurnEvent> {
    // Indexed topics:
    // topics[0] = event signature
    // topics[1] = nonce (uint64)
    // topics[2] = destinationDomain (uint32)
    // topics[3] = sender (address)
    //
    // Non-indexed data: token (address), recipient (bytes32), amount (uint256)
    if topics.len() != 4 || topics[0] != burn_message_sent_signature() {
        return Err(BridgeError::InvalidAttestation("not a BurnMessageSent log".into()));
    }
    if data.len() < 96 {
        return Err(BridgeError::InvalidAttestation(format!(
            "BurnMessageSent data too short: {} bytes",
            data.len()
        )));
    }

    let nonce: u64 = U256::from_be_slice(topics[1].as_slice())
        .try_into()
        .map_err(|_| BridgeError::InvalidAttestation("nonce exceeds u64".into()))?;
    let dest: u32 = U256::from_be_slice(topics[2].as_slice())
        .try_into()
        .map_err(|_| BridgeError::InvalidAttestation("destination domain exceeds u32".into()))?;
    let dest_chain_id = ChainId(dest);
    let sender = ChainAddress::from(Address::from_slice(&topics[3][12..]));
    let token = ChainAddress::from(Address::from_slice(&data[12..32]));

    let recipient_word = &data[32..64];
    let recipient = match dest_chain_id.family() {
        Some(ChainFamily::Evm) => ChainAddress::Evm(
            recipient_word[12..]
                .try_into()
                .map_err(|_| BridgeError::InvalidAttestation("bad recipient".into()))?,
        ),
        Some(ChainFamily::Substrate) => ChainAddress::Substrate(
            recipient_word
                .try_into()
                .map_err(|_| BridgeError::InvalidAttestation("bad recipient".into()))?,
        ),
        None => {
            return Err(BridgeError::InvalidAttestation(format!(
                "unsupported destination domain {}",
                dest_chain_id
            )))
        }
    };
    let amount = Amount(U256::from_be_slice(&data[64..96]));

    Ok(BurnEvent {
        source_chain_id,
        dest_chain_id,
        nonce,
        token,
        sender,
        recipient,
        amount,
        tx_hash,
        block_number,
    })
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    async fn burn_and_send(
        &self,
        dest_chain_id: ChainId,
        recipient: &ChainAddress,
        amount: Amount,
    ) -> BridgeResult<BurnReceipt> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);

        let balance = self.get_balance(&ChainAddress::from(self.signer.address())).await?;
        if balance < amount {
            return Err(BridgeError::InsufficientBalance {
                have: balance.to_string(),
                need: amount.to_string(),
            });
        }

        let token = Erc20::new(self.token, &provider);
        let approve = token
            .approve(self.messenger, amount.0)
            .send()
            .await
            .map_err(|e| classify_submission_error(&e.to_string(), 0))?
            .get_receipt()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("approve receipt: {}", e)))?;
        if !approve.status() {
            return Err(BridgeError::ChainSubmission("token approval reverted".into()));
        }

        let messenger = EdscTokenMessenger::new(self.messenger, &provider);
        let pending = messenger
            .burnAndSend(dest_chain_id.to_u32(), B256::from(recipient.to_bytes32()), amount.0)
            .send()
            .await
            .map_err(|e| classify_submission_error(&e.to_string(), 0))?;
        let tx_hash = *pending.tx_hash();
        info!(chain = %self.chain_id, tx_hash = %tx_hash, amount = %amount, "Burn transaction sent");

        // Broadcast from here on; never resubmit
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| unconfirmed_burn(tx_hash, &e.to_string()))?;
        if !receipt.status() {
            return Err(BridgeError::InvalidAttestation(format!("burn {} reverted", tx_hash)));
        }

        let signature = burn_message_sent_signature();
        let event = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.topics().first() == Some(&signature))
            .find_map(|log| parse_burn_log(self.chain_id, log).ok())
            .ok_or_else(|| BridgeError::InvalidAttestation(format!("no BurnMessageSent in {}", tx_hash)))?;

        Ok(BurnReceipt {
            nonce: event.nonce,
            source_tx_hash: tx_hash,
            block_number: receipt.block_number.unwrap_or(event.block_number),
        })
    }

    async fn mint_from_attestation(
        &self,
        attestation: &Attestation,
        signatures: &[SignatureEntry],
    ) -> BridgeResult<MintReceipt> {
        check_mint_target(self.chain_id, ChainFamily::Evm, attestation)?;
        let mint_id = compute_mint_id(&attestation.message_hash);
        let _guard = self.claim(mint_id)?;

        if self.is_mint_processed(mint_id).await? {
            return Err(BridgeError::AlreadyProcessed);
        }

        // Only recoverable ECDSA signatures are meaningful to the contract
        let sigs: Vec<Bytes> = signatures
            .iter()
            .filter(|s| s.signature.len() == 65)
            .map(|s| s.signature.clone())
            .collect();

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);
        let messenger = EdscTokenMessenger::new(self.messenger, &provider);

        debug!(
            key = %attestation.key(),
            mint_id = %bytes32_to_hex(&mint_id.0),
            signatures = sigs.len(),
            "Submitting receiveMessage"
        );

        let pending = messenger
            .receiveMessage(
                attestation.source_chain_id.to_u32(),
                attestation.nonce,
                B256::from(attestation.token.to_bytes32()),
                B256::from(attestation.recipient.to_bytes32()),
                attestation.amount.0,
                sigs.clone(),
            )
            .send()
            .await
            .map_err(|e| classify_submission_error(&e.to_string(), sigs.len()))?;
        let tx_hash = *pending.tx_hash();

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("mint receipt: {}", e)))?;

        if !receipt.status() {
            if self.is_mint_processed(mint_id).await? {
                return Err(BridgeError::AlreadyProcessed);
            }
            warn!(tx_hash = %tx_hash, key = %attestation.key(), "Mint transaction reverted");
            return Err(BridgeError::InvalidAttestation(format!("mint {} reverted", tx_hash)));
        }

        info!(
            chain = %self.chain_id,
            tx_hash = %tx_hash,
            key = %attestation.key(),
            "Mint confirmed"
        );

        Ok(MintReceipt {
            dest_tx_hash: tx_hash,
            block_number: receipt.block_number.unwrap_or_default(),
        })
    }

    async fn is_message_received(&self, message_hash: &B256) -> BridgeResult<bool> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        let messenger = EdscTokenMessenger::new(self.messenger, provider);
        let received = messenger
            .isMessageReceived(*message_hash)
            .call()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("isMessageReceived failed: {}", e)))?;
        Ok(received._0)
    }

    async fn get_balance(&self, address: &ChainAddress) -> BridgeResult<Amount> {
        let ChainAddress::Evm(raw) = address else {
            return Err(BridgeError::InvalidAttestation(format!(
                "{} is not an EVM address",
                address
            )));
        };
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        let token = Erc20::new(self.token, provider);
        let balance = token
            .balanceOf(Address::from(*raw))
            .call()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("balanceOf failed: {}", e)))?;
        Ok(Amount(balance._0))
    }

    async fn get_block_number(&self) -> BridgeResult<u64> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        provider
            .get_block_number()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("get_block_number failed: {}", e)))
    }

    async fn get_burn_events(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<BurnEvent>> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        let filter = Filter::new()
            .address(self.messenger)
            .event_signature(burn_message_sent_signature())
            .from_block(from_block)
            .to_block(to_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("get_logs failed: {}", e)))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match parse_burn_log(self.chain_id, log) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::error!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Failed to parse burn log"
                    );
                }
            }
        }
        Ok(events)
    }
}
